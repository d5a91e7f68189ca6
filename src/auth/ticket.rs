use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::auth::checksum::{SessionKey, SESSION_KEY_LEN};
use crate::util::buf::{put_string, try_get_string};
use crate::util::random::Random;

const NONCE_LEN: usize = 12;

/// What a valid ticket vouches for
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TicketContents {
    pub session_key: SessionKey,
    pub principal: String,
    /// end of validity, seconds since the epoch
    pub expires: u64,
}

/// The expensive part of authentication: opening a ticket
#[cfg_attr(test, mockall::automock)]
pub trait TicketVerifier: Send + Sync {
    fn verify_ticket(&self, ticket: &[u8]) -> anyhow::Result<TicketContents>;
}

/// Tickets sealed with AES-256-GCM under a service key shared between the ticket issuer and the
///  servers verifying it: `nonce || ciphertext`.
pub struct SealedTickets {
    cipher: Aes256Gcm,
}

impl SealedTickets {
    pub fn new(service_key: &[u8]) -> anyhow::Result<SealedTickets> {
        let cipher = Aes256Gcm::new_from_slice(service_key)
            .map_err(|_| anyhow!("service key must be 32 bytes, was {}", service_key.len()))?;
        Ok(SealedTickets { cipher })
    }

    pub fn issue<R: Random>(&self, contents: &TicketContents) -> anyhow::Result<Bytes> {
        let mut plaintext = BytesMut::new();
        plaintext.put_u64(contents.expires);
        plaintext.put_slice(&contents.session_key.0);
        put_string(&mut plaintext, &contents.principal);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        R::fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        let ciphertext = self.cipher.encrypt(nonce, plaintext.as_ref())
            .map_err(|_| anyhow!("error sealing ticket"))?;

        let mut ticket = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
        ticket.put_slice(&nonce_bytes);
        ticket.put_slice(&ciphertext);
        Ok(ticket.freeze())
    }
}

impl TicketVerifier for SealedTickets {
    fn verify_ticket(&self, ticket: &[u8]) -> anyhow::Result<TicketContents> {
        if ticket.len() < NONCE_LEN {
            bail!("ticket too short");
        }
        let (nonce_bytes, ciphertext) = ticket.split_at(NONCE_LEN);
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce_bytes);

        let plaintext = self.cipher.decrypt(nonce, ciphertext)
            .map_err(|_| anyhow!("ticket does not decrypt"))?;

        let mut buf: &[u8] = &plaintext;
        let expires = buf.try_get_u64()?;
        if buf.remaining() < SESSION_KEY_LEN {
            bail!("ticket without session key");
        }
        let mut session_key = [0u8; SESSION_KEY_LEN];
        buf.copy_to_slice(&mut session_key);
        let principal = try_get_string(&mut buf)?;

        Ok(TicketContents {
            session_key: SessionKey(session_key),
            principal,
            expires,
        })
    }
}
