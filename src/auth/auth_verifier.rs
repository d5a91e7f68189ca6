use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use tracing::{debug, trace, warn};

use crate::auth::checksum::checksum_matches;
use crate::auth::session_key_cache::{CacheEntry, SessionKeyCache};
use crate::auth::ticket::TicketVerifier;
use crate::notice::notice::{AuthStatus, Notice};

#[derive(Debug)]
pub struct AuthConfig {
    /// interval at which expired entries are swept from the session key cache
    pub sweep_interval: Duration,
    pub max_cached_tickets: usize,
    /// accept the single-region checksum scheme of older senders as a fallback
    pub accept_legacy_checksums: bool,
}

impl AuthConfig {
    pub fn new() -> AuthConfig {
        AuthConfig {
            sweep_interval: Duration::from_secs(3600),
            max_cached_tickets: 8192,
            accept_legacy_checksums: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must be positive");
        }
        if self.max_cached_tickets == 0 {
            bail!("session key cache needs room for at least one ticket");
        }
        Ok(())
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::new()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct AuthVerifier {
    config: Arc<AuthConfig>,
    tickets: Arc<dyn TicketVerifier>,
    cache: SessionKeyCache,
}

impl AuthVerifier {
    pub fn new(config: Arc<AuthConfig>, tickets: Arc<dyn TicketVerifier>) -> AuthVerifier {
        let cache = SessionKeyCache::new(config.max_cached_tickets);
        AuthVerifier {
            config,
            tickets,
            cache,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn cache(&self) -> &SessionKeyCache {
        &self.cache
    }

    /// Verifies that the notice was sent by the principal it names as its sender. `now` is in
    ///  seconds since the epoch.
    pub fn verify(&mut self, notice: &Notice, now: u64) -> AuthStatus {
        self.verify_as(notice, &notice.sender, now)
    }

    /// Verifies that the notice was authenticated by `principal`, e.g. a foreign realm's server
    ///  forwarding notices on behalf of its users
    pub fn verify_as(&mut self, notice: &Notice, principal: &str, now: u64) -> AuthStatus {
        if !notice.auth_requested {
            return AuthStatus::No;
        }
        if notice.authenticator.is_empty() {
            debug!(uid=?notice.uid, "authentication requested without a ticket");
            return AuthStatus::Failed;
        }

        if let Some(entry) = self.cache.get(&notice.authenticator) {
            if entry.expires > now && self.proof_matches(entry, notice, principal) {
                trace!(uid=?notice.uid, "authenticated from cached session key");
                return AuthStatus::Yes;
            }
            // the cached key may be outdated - fall through to full verification
        }

        self.verify_full(notice, principal, now)
    }

    fn proof_matches(&self, entry: &CacheEntry, notice: &Notice, principal: &str) -> bool {
        if entry.principal != principal {
            debug!(uid=?notice.uid, ticket_principal=%entry.principal, principal, "ticket principal does not match");
            return false;
        }
        match checksum_matches(&entry.session_key, notice, self.config.accept_legacy_checksums) {
            Ok(matches) => matches,
            Err(e) => {
                warn!("error computing checksum: {}", e);
                false
            }
        }
    }

    fn verify_full(&mut self, notice: &Notice, principal: &str, now: u64) -> AuthStatus {
        let contents = match self.tickets.verify_ticket(&notice.authenticator) {
            Ok(contents) => contents,
            Err(e) => {
                debug!(uid=?notice.uid, "ticket verification failed: {}", e);
                return AuthStatus::Failed;
            }
        };
        if contents.expires <= now {
            debug!(uid=?notice.uid, expires=contents.expires, "ticket expired");
            return AuthStatus::Failed;
        }

        let entry = CacheEntry {
            session_key: contents.session_key,
            principal: contents.principal,
            expires: contents.expires,
        };
        let matches = self.proof_matches(&entry, notice, principal);

        if let Err(e) = self.cache.insert(notice.authenticator.clone(), entry) {
            warn!("not caching session key: {}", e);
        }

        if matches {
            AuthStatus::Yes
        }
        else {
            AuthStatus::Failed
        }
    }

    /// evicts expired session keys - this is meant to be called periodically, see
    ///  [AuthConfig::sweep_interval]
    pub fn sweep(&mut self, now: u64) -> usize {
        self.cache.sweep(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::checksum::{authenticate, compute_checksum, SessionKey, SESSION_KEY_LEN};
    use crate::auth::ticket::{MockTicketVerifier, TicketContents};
    use crate::notice::notice::{ChecksumScheme, NoticeKind};
    use crate::test_util::notice::test_notice;
    use anyhow::anyhow;
    use bytes::Bytes;
    use rstest::rstest;

    const NOW: u64 = 1_700_000_000;
    const KEY: SessionKey = SessionKey([5; SESSION_KEY_LEN]);

    fn contents(principal: &str, expires: u64) -> TicketContents {
        TicketContents {
            session_key: KEY,
            principal: principal.to_string(),
            expires,
        }
    }

    fn signed_notice(key: &SessionKey) -> Notice {
        let mut notice = test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob")
            .with_fields(&["hi"]);
        authenticate(&mut notice, Bytes::from_static(b"ticket-1"), key).unwrap();
        notice
    }

    fn verifier(tickets: MockTicketVerifier) -> AuthVerifier {
        AuthVerifier::new(Arc::new(AuthConfig::new()), Arc::new(tickets))
    }

    #[test]
    fn test_not_requested() {
        let mut tickets = MockTicketVerifier::new();
        tickets.expect_verify_ticket().never();
        let mut verifier = verifier(tickets);

        let notice = test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob");
        assert_eq!(verifier.verify(&notice, NOW), AuthStatus::No);
    }

    #[test]
    fn test_requested_without_ticket() {
        let mut tickets = MockTicketVerifier::new();
        tickets.expect_verify_ticket().never();
        let mut verifier = verifier(tickets);

        let mut notice = signed_notice(&KEY);
        notice.authenticator = Bytes::new();
        assert_eq!(verifier.verify(&notice, NOW), AuthStatus::Failed);
    }

    #[test]
    fn test_cache_hit_skips_ticket_verification() {
        let mut tickets = MockTicketVerifier::new();
        tickets.expect_verify_ticket()
            .once()
            .returning(|_| Ok(contents("alice", NOW + 100)));
        let mut verifier = verifier(tickets);

        let notice = signed_notice(&KEY);
        assert_eq!(verifier.verify(&notice, NOW), AuthStatus::Yes);
        assert_eq!(verifier.cache().len(), 1);
        assert_eq!(verifier.verify(&notice, NOW + 1), AuthStatus::Yes);
    }

    #[rstest]
    #[case::ticket_invalid(Err(anyhow!("bad ticket")), AuthStatus::Failed)]
    #[case::expired(Ok(contents("alice", NOW)), AuthStatus::Failed)]
    #[case::wrong_principal(Ok(contents("mallory", NOW + 100)), AuthStatus::Failed)]
    #[case::valid(Ok(contents("alice", NOW + 100)), AuthStatus::Yes)]
    fn test_full_verification(#[case] result: anyhow::Result<TicketContents>, #[case] expected: AuthStatus) {
        let mut tickets = MockTicketVerifier::new();
        tickets.expect_verify_ticket()
            .once()
            .return_once(move |_| result);
        let mut verifier = verifier(tickets);

        assert_eq!(verifier.verify(&signed_notice(&KEY), NOW), expected);
    }

    #[rstest]
    #[case::realm_server("zephyr.zephyr@ATHENA.MIT.EDU", AuthStatus::Yes)]
    #[case::other_principal("alice", AuthStatus::Failed)]
    fn test_verify_as(#[case] expected_principal: &str, #[case] expected: AuthStatus) {
        let mut tickets = MockTicketVerifier::new();
        tickets.expect_verify_ticket()
            .returning(|_| Ok(contents("zephyr.zephyr@ATHENA.MIT.EDU", NOW + 100)));
        let mut verifier = verifier(tickets);

        // the notice names alice as its sender, but was authenticated by the realm's server
        let notice = signed_notice(&KEY);
        assert_eq!(verifier.verify_as(&notice, expected_principal, NOW), expected);
    }

    #[test]
    fn test_tampered_notice_fails() {
        let mut tickets = MockTicketVerifier::new();
        tickets.expect_verify_ticket()
            .returning(|_| Ok(contents("alice", NOW + 100)));
        let mut verifier = verifier(tickets);

        let mut notice = signed_notice(&KEY);
        assert_eq!(verifier.verify(&notice, NOW), AuthStatus::Yes);

        notice.recipient = "mallory".to_string();
        assert_eq!(verifier.verify(&notice, NOW), AuthStatus::Failed);
    }

    #[test]
    fn test_tampered_legacy_notice_fails() {
        let mut tickets = MockTicketVerifier::new();
        tickets.expect_verify_ticket()
            .returning(|_| Ok(contents("alice", NOW + 100)));
        let mut verifier = verifier(tickets);

        let mut notice = signed_notice(&KEY);
        notice.checksum = compute_checksum(&KEY, &notice, ChecksumScheme::Legacy).unwrap();
        assert_eq!(verifier.verify(&notice, NOW), AuthStatus::Yes);

        notice.body = Bytes::from_static(b"pay mallory 10000\0");
        assert_eq!(verifier.verify(&notice, NOW), AuthStatus::Failed);
    }

    #[test]
    fn test_outdated_cache_entry_falls_back_to_full_verification() {
        let new_key = SessionKey([6; SESSION_KEY_LEN]);

        let mut tickets = MockTicketVerifier::new();
        let mut seq = mockall::Sequence::new();
        tickets.expect_verify_ticket()
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(contents("alice", NOW + 100)));
        tickets.expect_verify_ticket()
            .once()
            .in_sequence(&mut seq)
            .returning(move |_| Ok(TicketContents { session_key: new_key, principal: "alice".to_string(), expires: NOW + 200 }));
        let mut verifier = verifier(tickets);

        assert_eq!(verifier.verify(&signed_notice(&KEY), NOW), AuthStatus::Yes);
        assert_eq!(verifier.verify(&signed_notice(&new_key), NOW), AuthStatus::Yes);
        assert_eq!(verifier.cache().get(b"ticket-1").unwrap().session_key, new_key);
    }

    #[test]
    fn test_sweep() {
        let mut tickets = MockTicketVerifier::new();
        tickets.expect_verify_ticket()
            .times(2)
            .returning(|_| Ok(contents("alice", NOW + 100)));
        let mut verifier = verifier(tickets);

        let notice = signed_notice(&KEY);
        assert_eq!(verifier.verify(&notice, NOW), AuthStatus::Yes);
        assert_eq!(verifier.sweep(NOW + 50), 0);
        assert_eq!(verifier.sweep(NOW + 100), 1);

        // not cached any more: full verification again
        assert_eq!(verifier.verify(&notice, NOW + 60), AuthStatus::Yes);
    }

    #[test]
    fn test_config_validate() {
        assert!(AuthConfig::new().validate().is_ok());
        let mut config = AuthConfig::new();
        config.max_cached_tickets = 0;
        assert!(config.validate().is_err());
    }
}
