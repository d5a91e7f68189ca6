use std::fmt::{Debug, Formatter};
use std::net::IpAddr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::notice::fragment::FragmentRange;
use crate::notice::uid::{put_ip, try_get_ip, Uid};
use crate::util::buf::{put_blob, put_string, take_exact, try_get_blob, try_get_flag, try_get_string};


pub const PROTOCOL_VERSION: u8 = 1;

/// scheme marker + checksum value
pub const CHECKSUM_FIELD_LEN: usize = 1 + 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum NoticeKind {
    /// fire and forget - the sender explicitly does not want any feedback
    Unsafe = 0,
    Unacked = 1,
    Acked = 2,
    /// ack generated by the host relay rather than by a server
    HmAck = 3,
    /// host relay control
    HmCtl = 4,
    ServAck = 5,
    ServNak = 6,
    ClientAck = 7,
    Stat = 8,
}
impl NoticeKind {
    pub fn is_server_ack(&self) -> bool {
        matches!(self, NoticeKind::ServAck | NoticeKind::ServNak)
    }
}

/// The local verdict on a received notice's authentication. This is never sent over the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum AuthStatus {
    Yes,
    /// the sender did not ask for authentication
    #[default]
    No,
    /// the sender asked for authentication, but the proof did not check out
    Failed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ChecksumScheme {
    /// keyed digest over the header region, the other-fields region and the body, combined
    #[default]
    ThreeRegion = 0x5a,
    /// single region (header only), still accepted from older senders
    Legacy = 0x4c,
}

#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct Checksum {
    pub scheme: ChecksumScheme,
    pub value: u64,
}
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}:{:016x}", self.scheme, self.value)
    }
}

/// The three disjoint byte ranges of an encoded notice that checksums are computed over
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChecksumRegions {
    pub header: Bytes,
    pub other_fields: Bytes,
    pub body: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub uid: Uid,
    /// the port the originating client listens on
    pub port: u16,
    pub auth_requested: bool,
    /// opaque ticket presented by the sender if it asks for authentication
    pub authenticator: Bytes,
    pub class: String,
    pub instance: String,
    pub opcode: String,
    pub sender: String,
    /// empty recipient means broadcast
    pub recipient: String,
    pub default_format: String,
    pub checksum: Checksum,
    pub fragment: Option<FragmentRange>,
    /// for fragments: the uid of the notice the fragment was split from
    pub multi_uid: Option<Uid>,
    pub sender_addr: Option<IpAddr>,
    pub other_fields: Vec<String>,
    /// ordered sequence of NUL delimited fields
    pub body: Bytes,
    pub authenticated: AuthStatus,
}

impl Notice {
    pub fn new(kind: NoticeKind, uid: Uid, class: &str, instance: &str, opcode: &str) -> Notice {
        Notice {
            kind,
            uid,
            port: 0,
            auth_requested: false,
            authenticator: Bytes::new(),
            class: class.to_string(),
            instance: instance.to_string(),
            opcode: opcode.to_string(),
            sender: String::new(),
            recipient: String::new(),
            default_format: String::new(),
            checksum: Checksum::default(),
            fragment: None,
            multi_uid: None,
            sender_addr: None,
            other_fields: Vec::new(),
            body: Bytes::new(),
            authenticated: AuthStatus::No,
        }
    }

    /// A reply carrying the same uid and address triple, e.g. an ack. Authentication data is not
    ///  carried over.
    pub fn reply(&self, kind: NoticeKind, body: Bytes) -> Notice {
        Notice {
            kind,
            auth_requested: false,
            authenticator: Bytes::new(),
            checksum: Checksum::default(),
            other_fields: Vec::new(),
            body,
            authenticated: AuthStatus::No,
            ..self.clone()
        }
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Notice {
        self.body = body_from_fields(fields);
        self
    }

    /// The body split at NUL delimiters. A terminating NUL does not start another field.
    pub fn fields(&self) -> Vec<&[u8]> {
        if self.body.is_empty() {
            return Vec::new();
        }
        let body: &[u8] = match self.body.last() {
            Some(0) => &self.body[..self.body.len() - 1],
            _ => &self.body,
        };
        body.split(|b| *b == 0).collect()
    }

    pub fn field_str(&self, idx: usize) -> Option<String> {
        self.fields().get(idx)
            .map(|f| String::from_utf8_lossy(f).to_string())
    }

    /// the uid identifying the logical send this notice belongs to - for fragments that is the
    ///  uid of the unfragmented notice
    pub fn origin_uid(&self) -> Uid {
        self.multi_uid.unwrap_or(self.uid)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.ser_header(buf);
        buf.put_u8(self.checksum.scheme.into());
        buf.put_u64(self.checksum.value);
        self.ser_other_fields(buf);
        self.ser_body(buf);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// encoded length of everything but the body's payload
    pub fn header_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.ser_header(&mut buf);
        self.ser_other_fields(&mut buf);
        buf.len() + CHECKSUM_FIELD_LEN + 4
    }

    pub fn checksum_regions(&self) -> ChecksumRegions {
        let mut header = BytesMut::new();
        self.ser_header(&mut header);
        let mut other_fields = BytesMut::new();
        self.ser_other_fields(&mut other_fields);
        let mut body = BytesMut::new();
        self.ser_body(&mut body);

        ChecksumRegions {
            header: header.freeze(),
            other_fields: other_fields.freeze(),
            body: body.freeze(),
        }
    }

    fn ser_header(&self, buf: &mut BytesMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind.into());
        self.uid.ser(buf);
        buf.put_u16(self.port);
        buf.put_u8(self.auth_requested as u8);
        put_blob(buf, &self.authenticator);
        put_string(buf, &self.class);
        put_string(buf, &self.instance);
        put_string(buf, &self.opcode);
        put_string(buf, &self.sender);
        put_string(buf, &self.recipient);
        put_string(buf, &self.default_format);
    }

    fn ser_other_fields(&self, buf: &mut BytesMut) {
        match &self.fragment {
            None => buf.put_u8(0),
            Some(f) => {
                buf.put_u8(1);
                buf.put_u32(f.offset);
                buf.put_u32(f.total);
            }
        }
        match &self.multi_uid {
            None => buf.put_u8(0),
            Some(uid) => {
                buf.put_u8(1);
                uid.ser(buf);
            }
        }
        match &self.sender_addr {
            None => buf.put_u8(0),
            Some(addr) => {
                buf.put_u8(1);
                put_ip(buf, addr);
            }
        }
        let num_other = self.other_fields.len().min(u16::MAX as usize);
        buf.put_u16(num_other as u16);
        for f in &self.other_fields[..num_other] {
            put_string(buf, f);
        }
    }

    fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<Notice> {
        let buf = &mut buf;

        let version = buf.try_get_u8()?;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }
        let kind = NoticeKind::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid notice kind: {}", e))?;
        let uid = Uid::try_deser(buf)?;
        let port = buf.try_get_u16()?;
        let auth_requested = try_get_flag(buf)?;
        let authenticator = try_get_blob(buf)?;
        let class = try_get_string(buf)?;
        let instance = try_get_string(buf)?;
        let opcode = try_get_string(buf)?;
        let sender = try_get_string(buf)?;
        let recipient = try_get_string(buf)?;
        let default_format = try_get_string(buf)?;

        let scheme = ChecksumScheme::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid checksum scheme: {}", e))?;
        let checksum = Checksum {
            scheme,
            value: buf.try_get_u64()?,
        };

        let fragment = if try_get_flag(buf)? {
            Some(FragmentRange::new(buf.try_get_u32()?, buf.try_get_u32()?)?)
        }
        else {
            None
        };
        let multi_uid = if try_get_flag(buf)? {
            Some(Uid::try_deser(buf)?)
        }
        else {
            None
        };
        let sender_addr = if try_get_flag(buf)? {
            Some(try_get_ip(buf)?)
        }
        else {
            None
        };
        let num_other = buf.try_get_u16()?;
        let mut other_fields = Vec::new();
        for _ in 0..num_other {
            other_fields.push(try_get_string(buf)?);
        }

        let body_len = buf.try_get_u32()? as usize;
        let body = take_exact(buf, body_len)?;

        if buf.has_remaining() {
            bail!("{} trailing bytes after notice body", buf.remaining());
        }

        Ok(Notice {
            kind,
            uid,
            port,
            auth_requested,
            authenticator,
            class,
            instance,
            opcode,
            sender,
            recipient,
            default_format,
            checksum,
            fragment,
            multi_uid,
            sender_addr,
            other_fields,
            body,
            authenticated: AuthStatus::No,
        })
    }
}

pub fn body_from_fields(fields: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    for f in fields {
        buf.put_slice(f.as_bytes());
        buf.put_u8(0);
    }
    buf.freeze()
}
