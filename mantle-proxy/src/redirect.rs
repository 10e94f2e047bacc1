//! Tamper-evident redirect parameters.
//!
//! Wire form: `v1:` followed by base64 of `<data>|<HMAC-SHA-256(data, key)>`.
//! The split on decode is at the first `|`, so the MAC bytes may themselves
//! contain the separator.
use crate::Error;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

const PREFIX: &str = "v1:";

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies redirect URLs with a server-held key.
#[derive(Clone)]
pub struct RedirectSigner {
    key: Vec<u8>,
}

impl RedirectSigner {
    #[must_use]
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// A signer with a fresh 64-byte CSPRNG key, used when none is
    /// configured.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = vec![0u8; 64];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    #[must_use]
    pub fn encode(&self, data: &str) -> String {
        let mut payload = data.as_bytes().to_vec();
        payload.push(b'|');
        payload.extend_from_slice(&self.mac(data.as_bytes()));
        format!("{PREFIX}{}", BASE64.encode(payload))
    }

    /// Verifies and unwraps a signed value; rejects missing prefixes, bad
    /// base64 and MAC mismatches.
    pub fn decode(&self, signed: &str) -> Result<String, Error> {
        let encoded = signed.strip_prefix(PREFIX).ok_or(Error::RedirectSignature)?;
        let payload = BASE64.decode(encoded).map_err(|_| Error::RedirectSignature)?;
        let split = payload
            .iter()
            .position(|b| *b == b'|')
            .ok_or(Error::RedirectSignature)?;
        let (data, mac) = (&payload[..split], &payload[split + 1..]);
        let mut verifier =
            HmacSha256::new_from_slice(&self.key).map_err(|_| Error::RedirectSignature)?;
        verifier.update(data);
        verifier
            .verify_slice(mac)
            .map_err(|_| Error::RedirectSignature)?;
        String::from_utf8(data.to_vec()).map_err(|_| Error::RedirectSignature)
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}
