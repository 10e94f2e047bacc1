//! Access validation for workload requests.
//!
//! A request authenticates with two cookies: a public-key id and a detached
//! Ed25519 signature over those id bytes. The key is looked up, checked for
//! expiry, the signature verified, and finally the access policy is asked
//! for the caller's role in the target cluster; `Reader` is the floor.
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Cookie carrying the registered public-key id.
pub const PUBLIC_KEY_ID_COOKIE: &str = "publicKeyId";
/// Cookie carrying the base64 detached signature over the key id.
pub const PUBLIC_KEY_SIGNATURE_COOKIE: &str = "publicKeyIdSignatureBase64";

/// Caller role within a cluster, ordered by privilege.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub enum Role {
    #[default]
    None,
    Reader,
    Operator,
    Admin,
}

impl Role {
    /// Parses the optional role claim attached to a registered key.
    #[must_use]
    pub fn parse(claim: &str) -> Option<Role> {
        match claim {
            "None" => Some(Role::None),
            "Reader" => Some(Role::Reader),
            "Operator" => Some(Role::Operator),
            "Admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// A registered public key with its identity binding and optional role
/// claim.
#[derive(Clone, Debug)]
pub struct RegisteredKey {
    pub id: String,
    pub verifying_key: VerifyingKey,
    pub expiration: Option<DateTime<Utc>>,
    /// Role claim attached at registration, if any; the access policy may
    /// cap it further per cluster.
    pub role_claim: Option<Role>,
    /// The user identity the key was registered for.
    pub identity: String,
}

/// Source of registered public keys.
#[async_trait]
pub trait KeyProvider: Send + Sync + 'static {
    async fn public_key(&self, id: &str) -> Option<RegisteredKey>;
}

/// Decides the caller's effective role within a cluster.
#[async_trait]
pub trait AccessPolicy: Send + Sync + 'static {
    async fn role_in_cluster(
        &self,
        identity: &str,
        role_claim: Option<Role>,
        cluster: &str,
    ) -> Role;
}

/// Outcome of validating a workload request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Access {
    /// The caller may reach the cluster's workloads.
    Granted { identity: String, role: Role },
    /// Credentials were present but rejected.
    Denied { reason: String },
    /// No credentials at all; the caller should authenticate first.
    Unauthenticated,
}

/// Runs the full cookie validation chain against `cluster`.
pub async fn validate<K, P>(
    keys: &K,
    policy: &P,
    key_id: Option<&str>,
    signature_b64: Option<&str>,
    cluster: &str,
) -> Access
where
    K: KeyProvider + ?Sized,
    P: AccessPolicy + ?Sized,
{
    let (Some(key_id), Some(signature_b64)) = (key_id, signature_b64) else {
        return Access::Unauthenticated;
    };
    let Some(key) = keys.public_key(key_id).await else {
        return Access::Denied {
            reason: format!("public key {key_id} is not registered"),
        };
    };
    if let Some(expiration) = key.expiration {
        if expiration <= Utc::now() {
            return Access::Denied {
                reason: format!("public key {key_id} is expired"),
            };
        }
    }
    let Ok(raw) = BASE64.decode(signature_b64) else {
        return Access::Denied {
            reason: "signature is not valid base64".into(),
        };
    };
    let Ok(signature) = Signature::from_slice(&raw) else {
        return Access::Denied {
            reason: "signature has the wrong shape".into(),
        };
    };
    if key
        .verifying_key
        .verify(key_id.as_bytes(), &signature)
        .is_err()
    {
        return Access::Denied {
            reason: format!("signature does not verify for key {key_id}"),
        };
    }
    let role = policy
        .role_in_cluster(&key.identity, key.role_claim, cluster)
        .await;
    if role >= Role::Reader {
        Access::Granted {
            identity: key.identity,
            role,
        }
    } else {
        Access::Denied {
            reason: format!("role {role:?} is below Reader in cluster {cluster}"),
        }
    }
}
