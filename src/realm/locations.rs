use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use anyhow::bail;
use tracing::debug;

use crate::notice::control::*;
use crate::notice::notice::Notice;

/// Who may see a user's location, and whether logins and logouts are announced to subscribers
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exposure {
    /// registered, but visible to nobody
    OpStaff,
    RealmVisible,
    RealmAnnounced,
    NetVisible,
    NetAnnounced,
}

/// How far a login or logout is announced
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Announcement {
    Silent,
    /// to subscribers in the local realm
    Local,
    /// to local subscribers and to subscribed foreign realms
    External,
}

impl Exposure {
    /// the exposure a login notice's opcode asks for; `NONE` is a logout and has no exposure
    pub fn from_opcode(opcode: &str) -> Option<Exposure> {
        [
            (EXPOSE_OPSTAFF, Exposure::OpStaff),
            (EXPOSE_REALMVIS, Exposure::RealmVisible),
            (EXPOSE_REALMANN, Exposure::RealmAnnounced),
            (EXPOSE_NETVIS, Exposure::NetVisible),
            (EXPOSE_NETANN, Exposure::NetAnnounced),
        ].into_iter()
            .find(|(o, _)| o.eq_ignore_ascii_case(opcode))
            .map(|(_, e)| e)
    }

    /// `local_requester` means the request was authenticated as a principal of the local realm
    pub fn is_visible_to(self, local_requester: bool) -> bool {
        match self {
            Exposure::OpStaff => false,
            Exposure::RealmVisible | Exposure::RealmAnnounced => local_requester,
            Exposure::NetVisible | Exposure::NetAnnounced => true,
        }
    }

    pub fn announcement(self) -> Announcement {
        match self {
            Exposure::OpStaff | Exposure::RealmVisible => Announcement::Silent,
            Exposure::RealmAnnounced | Exposure::NetVisible => Announcement::Local,
            Exposure::NetAnnounced => Announcement::External,
        }
    }
}

/// One place a user is logged in at. A user can be logged in at several clients at once, each
///  identified by its address.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Location {
    pub user: String,
    pub machine: String,
    pub time: String,
    pub tty: String,
    pub addr: SocketAddr,
    pub exposure: Exposure,
}

impl Location {
    /// A login notice names the user as its instance, and has machine, login time and tty as
    ///  its first three body fields.
    pub fn from_login(notice: &Notice, addr: SocketAddr, exposure: Exposure) -> anyhow::Result<Location> {
        let fields = notice.fields();
        if fields.len() < 3 {
            bail!("login of {} has {} body fields, expected 3", notice.instance, fields.len());
        }
        let field = |idx: usize| String::from_utf8_lossy(fields[idx]).to_string();
        Ok(Location {
            user: notice.instance.clone(),
            machine: field(0),
            time: field(1),
            tty: field(2),
            addr,
            exposure,
        })
    }

    pub fn fields(&self) -> [&str; 3] {
        [self.machine.as_str(), self.time.as_str(), self.tty.as_str()]
    }
}

/// Where users are logged in, ordered by user
#[derive(Debug, Default)]
pub struct LocationTable {
    by_user: BTreeMap<String, Vec<Location>>,
}

impl LocationTable {
    pub fn new() -> LocationTable {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.by_user.values().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }

    /// Adds a location, or updates exposure, time and tty of the user's location at the same
    ///  address
    pub fn login(&mut self, location: Location) {
        debug!(user=%location.user, addr=?location.addr, exposure=?location.exposure, "login");
        let locations = self.by_user.entry(location.user.clone()).or_default();
        match locations.iter_mut().find(|l| l.addr == location.addr) {
            Some(existing) => *existing = location,
            None => locations.push(location),
        }
    }

    /// removes the user's location at `addr`, returning its exposure if there was one
    pub fn logout(&mut self, user: &str, addr: SocketAddr) -> Option<Exposure> {
        let locations = self.by_user.get_mut(user)?;
        let idx = locations.iter().position(|l| l.addr == addr)?;
        let removed = locations.remove(idx);
        if locations.is_empty() {
            self.by_user.remove(user);
        }
        debug!(user, ?addr, "logout");
        Some(removed.exposure)
    }

    /// removes all of a user's locations
    pub fn flush_user(&mut self, user: &str) -> usize {
        self.by_user.remove(user)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// removes all locations on a host, e.g. when its host manager boots
    pub fn flush_host(&mut self, host: IpAddr) -> usize {
        let mut num_removed = 0;
        self.by_user.retain(|_, locations| {
            let before = locations.len();
            locations.retain(|l| l.addr.ip() != host);
            num_removed += before - locations.len();
            !locations.is_empty()
        });
        num_removed
    }

    /// the user's locations a requester may see
    pub fn locate(&self, user: &str, local_requester: bool) -> Vec<&Location> {
        self.by_user.get(user)
            .into_iter()
            .flatten()
            .filter(|l| l.exposure.is_visible_to(local_requester))
            .collect()
    }
}
