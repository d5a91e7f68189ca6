use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use bytes::{Buf, BufMut};

/// Identity of one logical send: every retransmitted copy of a notice carries the same uid, and
///  acks are matched to their pending delivery purely by equality. There is no semantic ordering.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Uid {
    pub secs: u32,
    pub micros: u32,
    pub origin: IpAddr,
}

impl Debug for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}.{:06}]", self.origin, self.secs, self.micros)
    }
}

impl Uid {
    pub fn new(secs: u32, micros: u32, origin: IpAddr) -> Uid {
        Uid { secs, micros, origin }
    }

    /// the uid `n` microseconds after this one - this is how fragments of a notice get their own
    ///  ackable identity
    pub fn successor(&self, n: u32) -> Uid {
        let micros = self.micros as u64 + n as u64;
        Uid {
            secs: self.secs.wrapping_add((micros / 1_000_000) as u32),
            micros: (micros % 1_000_000) as u32,
            origin: self.origin,
        }
    }

    fn as_micros(&self) -> u64 {
        self.secs as u64 * 1_000_000 + self.micros as u64
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.secs);
        buf.put_u32(self.micros);
        put_ip(buf, &self.origin);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Uid> {
        let secs = buf.try_get_u32()?;
        let micros = buf.try_get_u32()?;
        if micros >= 1_000_000 {
            return Err(anyhow!("uid microseconds out of range: {}", micros));
        }
        let origin = try_get_ip(buf)?;
        Ok(Uid { secs, micros, origin })
    }
}

pub fn put_ip(buf: &mut impl BufMut, ip: &IpAddr) {
    match ip {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_u32(ip.to_bits());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_u128(ip.to_bits());
        }
    }
}

pub fn try_get_ip(buf: &mut impl Buf) -> anyhow::Result<IpAddr> {
    match buf.try_get_u8()? {
        4 => Ok(IpAddr::V4(Ipv4Addr::from_bits(buf.try_get_u32()?))),
        6 => Ok(IpAddr::V6(Ipv6Addr::from_bits(buf.try_get_u128()?))),
        n => Err(anyhow!("invalid ip address discriminator: {}", n)),
    }
}

/// Mints uids for notices originating here. Uids are strictly increasing per minter even if the
///  clock stands still (or jumps back), so two sends never share a uid.
#[derive(Debug)]
pub struct UidMinter {
    origin: IpAddr,
    last: Option<Uid>,
}
impl UidMinter {
    pub fn new(origin: IpAddr) -> UidMinter {
        UidMinter {
            origin,
            last: None,
        }
    }

    pub fn next_uid(&mut self) -> Uid {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.next_uid_at(now.as_secs() as u32, now.subsec_micros())
    }

    fn next_uid_at(&mut self, secs: u32, micros: u32) -> Uid {
        let candidate = Uid::new(secs, micros, self.origin);
        let uid = match self.last {
            Some(last) if last.as_micros() >= candidate.as_micros() => last.successor(1),
            _ => candidate,
        };
        self.last = Some(uid);
        uid
    }

    /// reserve `n` consecutive uids starting with the one returned - used when a notice is split
    ///  into fragments that derive their uids via [Uid::successor]
    pub fn reserve(&mut self, first: Uid, n: u32) {
        if n > 0 {
            let last = first.successor(n - 1);
            if self.last.map(|l| l.as_micros() < last.as_micros()).unwrap_or(true) {
                self.last = Some(last);
            }
        }
    }
}
