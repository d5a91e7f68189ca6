use std::marker::PhantomData;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::auth::auth_verifier::unix_now;
use crate::auth::checksum::SessionKey;
use crate::auth::ticket::{SealedTickets, TicketContents};
use crate::util::random::{Random, RngRandom};

/// What a server needs to authenticate notices it hands to a foreign realm
#[derive(Debug, Clone)]
pub struct RealmCredential {
    pub ticket: Bytes,
    pub session_key: SessionKey,
    /// seconds since the epoch
    pub expires: u64,
}
impl RealmCredential {
    pub fn is_valid_at(&self, now: u64) -> bool {
        self.expires > now
    }
}

/// The result of a background credential fetch, posted back into the server loop
#[derive(Debug)]
pub struct CredentialResult {
    pub realm: String,
    pub credential: anyhow::Result<RealmCredential>,
}

/// Acquiring a ticket for a foreign realm can take arbitrarily long (e.g. a round trip to a
///  ticket granting service), so it is async and runs outside the server's event loop.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialFetcher: Send + Sync + 'static {
    async fn fetch(&self, realm: &str) -> anyhow::Result<RealmCredential>;
}

/// Issues tickets directly, for deployments where realms share service keys out of band (and for
///  testing). Each foreign realm's tickets are sealed with that realm's service key.
pub struct LocalTicketIssuer<R: Random = RngRandom> {
    principal: String,
    lifetime: Duration,
    realms: FxHashMap<String, SealedTickets>,
    _random: PhantomData<fn() -> R>,
}

impl LocalTicketIssuer<RngRandom> {
    pub fn new(principal: &str, lifetime: Duration) -> LocalTicketIssuer<RngRandom> {
        LocalTicketIssuer::new_with_random(principal, lifetime)
    }
}

impl<R: Random> LocalTicketIssuer<R> {
    pub fn new_with_random(principal: &str, lifetime: Duration) -> LocalTicketIssuer<R> {
        LocalTicketIssuer {
            principal: principal.to_string(),
            lifetime,
            realms: Default::default(),
            _random: Default::default(),
        }
    }

    pub fn add_realm(&mut self, realm: &str, service_key: &[u8]) -> anyhow::Result<()> {
        self.realms.insert(realm.to_ascii_uppercase(), SealedTickets::new(service_key)?);
        Ok(())
    }

    pub fn issue(&self, realm: &str, now: u64) -> anyhow::Result<RealmCredential> {
        let tickets = self.realms.get(&realm.to_ascii_uppercase())
            .ok_or_else(|| anyhow!("no service key for realm {}", realm))?;

        let contents = TicketContents {
            session_key: SessionKey::random::<R>(),
            principal: self.principal.clone(),
            expires: now + self.lifetime.as_secs(),
        };
        let ticket = tickets.issue::<R>(&contents)?;
        debug!(realm, principal=%self.principal, expires=contents.expires, "issued ticket");

        Ok(RealmCredential {
            ticket,
            session_key: contents.session_key,
            expires: contents.expires,
        })
    }
}

#[async_trait]
impl<R: Random + 'static> CredentialFetcher for LocalTicketIssuer<R> {
    async fn fetch(&self, realm: &str) -> anyhow::Result<RealmCredential> {
        self.issue(realm, unix_now())
    }
}
