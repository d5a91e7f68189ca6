use std::net::{IpAddr, SocketAddr};

use crate::notice::notice::{Notice, NoticeKind};
use crate::notice::uid::Uid;

pub const TEST_UID_SECS: u32 = 1_700_000_000;

pub fn test_uid(n: u32) -> Uid {
    Uid::new(TEST_UID_SECS, n, IpAddr::from([127, 0, 0, 1]))
}

pub fn test_addr(n: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], port))
}

pub fn test_notice(kind: NoticeKind, class: &str, instance: &str, recipient: &str) -> Notice {
    let mut notice = Notice::new(kind, test_uid(1), class, instance, "");
    notice.sender = "alice".to_string();
    notice.recipient = recipient.to_string();
    notice
}
