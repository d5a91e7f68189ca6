use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::notice::notice::{Checksum, ChecksumRegions, ChecksumScheme, Notice};
use crate::util::random::Random;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_KEY_LEN: usize = 32;

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct SessionKey(pub [u8; SESSION_KEY_LEN]);
impl Debug for SessionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(***)")
    }
}
impl SessionKey {
    pub fn random<R: Random>() -> SessionKey {
        let mut key = [0u8; SESSION_KEY_LEN];
        R::fill_bytes(&mut key);
        SessionKey(key)
    }
}

/// keyed digest over a sequence of byte ranges, truncated to 64 bits. The tag is part of the
///  input so that identical content hashed in different roles does not cancel out when combined.
fn keyed_digest(key: &SessionKey, tag: u8, parts: &[&[u8]]) -> anyhow::Result<u64> {
    let mut mac = HmacSha256::new_from_slice(&key.0)
        .map_err(|_| anyhow!("invalid session key length"))?;
    mac.update(&[tag]);
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();

    let mut truncated = [0u8; 8];
    truncated.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(truncated))
}

const TAG_HEADER: u8 = 0;
const TAG_OTHER_FIELDS: u8 = 1;
const TAG_BODY: u8 = 2;
const TAG_SINGLE_REGION: u8 = 3;

pub fn three_region_checksum(key: &SessionKey, regions: &ChecksumRegions) -> anyhow::Result<u64> {
    Ok(keyed_digest(key, TAG_HEADER, &[&regions.header])?
        ^ keyed_digest(key, TAG_OTHER_FIELDS, &[&regions.other_fields])?
        ^ keyed_digest(key, TAG_BODY, &[&regions.body])?)
}

/// The scheme older senders use: a single digest over header, other fields and body as one
///  contiguous region
pub fn legacy_checksum(key: &SessionKey, regions: &ChecksumRegions) -> anyhow::Result<u64> {
    keyed_digest(key, TAG_SINGLE_REGION, &[&regions.header, &regions.other_fields, &regions.body])
}

pub fn compute_checksum(key: &SessionKey, notice: &Notice, scheme: ChecksumScheme) -> anyhow::Result<Checksum> {
    let regions = notice.checksum_regions();
    let value = match scheme {
        ChecksumScheme::ThreeRegion => three_region_checksum(key, &regions)?,
        ChecksumScheme::Legacy => legacy_checksum(key, &regions)?,
    };
    Ok(Checksum { scheme, value })
}

/// Attaches authentication to an outgoing notice. The ticket must be set before the checksum is
///  computed since it is part of the header region.
pub fn authenticate(notice: &mut Notice, ticket: bytes::Bytes, key: &SessionKey) -> anyhow::Result<()> {
    notice.auth_requested = true;
    notice.authenticator = ticket;
    notice.checksum = compute_checksum(key, notice, ChecksumScheme::ThreeRegion)?;
    Ok(())
}

/// Checks the notice's checksum against the scheme it claims first, then against the other
///  scheme. The legacy scheme is only considered if `accept_legacy` is set.
pub fn checksum_matches(key: &SessionKey, notice: &Notice, accept_legacy: bool) -> anyhow::Result<bool> {
    let regions = notice.checksum_regions();

    let legacy_matches = || -> anyhow::Result<bool> {
        Ok(accept_legacy && legacy_checksum(key, &regions)? == notice.checksum.value)
    };

    match notice.checksum.scheme {
        ChecksumScheme::ThreeRegion => {
            Ok(three_region_checksum(key, &regions)? == notice.checksum.value || legacy_matches()?)
        }
        ChecksumScheme::Legacy => {
            Ok(legacy_matches()? || three_region_checksum(key, &regions)? == notice.checksum.value)
        }
    }
}
