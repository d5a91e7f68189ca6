//! Well-known classes, instances and opcodes, and the classification of notices by class.

use crate::notice::notice::Notice;

pub const ZEPHYR_CTL_CLASS: &str = "ZEPHYR_CTL";
pub const CTL_CLIENT: &str = "CLIENT";
pub const CTL_HM: &str = "HM";
pub const CTL_REALM: &str = "REALM";

pub const ADMIN_CLASS: &str = "ZEPHYR_ADMIN";
pub const HM_CTL_CLASS: &str = "HM_CTL";
pub const HM_STAT_CLASS: &str = "HM_STAT";
pub const HM_STAT_CLIENT: &str = "HMST_CLIENT";
pub const GIMMESTATS: &str = "GIMMESTATS";

pub const LOCATE_CLASS: &str = "USER_LOCATE";
pub const LOGIN_CLASS: &str = "USER_LOGIN";

// host relay <-> server
pub const HM_BOOT: &str = "BOOT";
pub const HM_ATTACH: &str = "ATTACH";
pub const HM_DETACH: &str = "DETACH";
pub const HM_FLUSH: &str = "FLUSH";
pub const HM_NEWSERV: &str = "NEWSERV";
pub const SERVER_SHUTDOWN: &str = "SHUTDOWN";
pub const SERVER_PING: &str = "PING";

// client subscriptions
pub const CLIENT_SUBSCRIBE: &str = "SUBSCRIBE";
pub const CLIENT_UNSUBSCRIBE: &str = "UNSUBSCRIBE";
pub const CLIENT_CANCELSUB: &str = "CLEARSUB";

// realm <-> realm
pub const REALM_REQ_SUBSCRIBE: &str = "REQ_SUBSCRIBE";
pub const REALM_ADD_SUBSCRIBE: &str = "ADD_SUBSCRIBE";
pub const REALM_UNSUBSCRIBE: &str = "RLM_UNSUBSCRIBE";
pub const REALM_BOOT: &str = "SENDSUBS";
pub const REALM_REQ_LOCATE: &str = "REQ_LOCATE";
pub const REALM_ANS_LOCATE: &str = "ANS_LOCATE";

// user location
pub const LOCATE_LOCATE: &str = "LOCATE";
pub const LOGIN_USER_LOGIN: &str = "USER_LOGIN";
pub const LOGIN_USER_LOGOUT: &str = "USER_LOGOUT";
pub const LOGIN_USER_FLUSH: &str = "USER_FLUSH";
pub const EXPOSE_NONE: &str = "NONE";
pub const EXPOSE_OPSTAFF: &str = "OPSTAFF";
pub const EXPOSE_REALMVIS: &str = "REALM-VISIBLE";
pub const EXPOSE_REALMANN: &str = "REALM-ANNOUNCED";
pub const EXPOSE_NETVIS: &str = "NET-VISIBLE";
pub const EXPOSE_NETANN: &str = "NET-ANNOUNCED";

// ack bodies
pub const ACK_SENT: &str = "SENT";
pub const ACK_LOST: &str = "LOST";
pub const ACK_AUTH_FAILED: &str = "AUTH_FAILED";
pub const ACK_NOT_FOUND: &str = "NOT_FOUND";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NoticeCategory {
    /// subscription management and boot / shutdown announcements - handled by the server itself
    Control,
    /// administrative traffic between servers of one realm
    Admin,
    HostManager,
    /// directed to exactly one realm, never broadcast to subscribers
    UserLocation,
    Ordinary,
}

pub fn classify(notice: &Notice) -> NoticeCategory {
    let class = notice.class.as_str();
    if class.eq_ignore_ascii_case(ZEPHYR_CTL_CLASS) {
        NoticeCategory::Control
    }
    else if class.eq_ignore_ascii_case(ADMIN_CLASS) {
        NoticeCategory::Admin
    }
    else if class.eq_ignore_ascii_case(HM_CTL_CLASS) {
        NoticeCategory::HostManager
    }
    else if class.eq_ignore_ascii_case(LOCATE_CLASS) || class.eq_ignore_ascii_case(LOGIN_CLASS) {
        NoticeCategory::UserLocation
    }
    else {
        NoticeCategory::Ordinary
    }
}

pub fn opcode_is(notice: &Notice, opcode: &str) -> bool {
    notice.opcode.eq_ignore_ascii_case(opcode)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::notice::notice::NoticeKind;
    use crate::test_util::notice::test_notice;
    use rstest::rstest;

    #[rstest]
    #[case::control("ZEPHYR_CTL", NoticeCategory::Control)]
    #[case::control_lowercase("zephyr_ctl", NoticeCategory::Control)]
    #[case::admin("ZEPHYR_ADMIN", NoticeCategory::Admin)]
    #[case::hm("HM_CTL", NoticeCategory::HostManager)]
    #[case::locate("USER_LOCATE", NoticeCategory::UserLocation)]
    #[case::login("USER_LOGIN", NoticeCategory::UserLocation)]
    #[case::message("MESSAGE", NoticeCategory::Ordinary)]
    #[case::empty("", NoticeCategory::Ordinary)]
    fn test_classify(#[case] class: &str, #[case] expected: NoticeCategory) {
        let notice = test_notice(NoticeKind::Acked, class, "i", "");
        assert_eq!(classify(&notice), expected);
    }
}
