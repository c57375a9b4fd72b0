//! Client-server capability negotiation and the session state it
//! produces.

use crate::account::CsNegPolicy;
use crate::config::{EncryptionAlgorithm, PipelineConfiguration};
use crate::error::{IrodsError, Result};
use crate::packinstr::validate;
use crate::tag::Tag;

/// Negotiation outcome tokens sent back to the server
pub const CS_NEG_USE_SSL: &str = "CS_NEG_USE_SSL";
pub const CS_NEG_USE_TCP: &str = "CS_NEG_USE_TCP";
pub const CS_NEG_FAILURE: &str = "CS_NEG_FAILURE";

/// Resolve the client/server stance matrix. `Ok(true)` upgrades the
/// connection to TLS; incompatible stances fail.
pub fn decide(client: CsNegPolicy, server: CsNegPolicy) -> Result<bool> {
    use CsNegPolicy::*;
    match (client, server) {
        (Require, Require) | (Require, DontCare) | (DontCare, Require) => Ok(true),
        (DontCare, DontCare) | (DontCare, Refuse) | (Refuse, DontCare) | (Refuse, Refuse) => {
            Ok(false)
        }
        (Require, Refuse) | (Refuse, Require) => Err(IrodsError::Negotiation(format!(
            "client policy {} is incompatible with server policy {}",
            client.token(),
            server.token()
        ))),
    }
}

/// Result of negotiation, consumed by the transport security layer.
/// Immutable once the connection reaches Ready.
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    pub use_ssl: bool,
    /// Random key material minted by the client and shipped to the
    /// server over TLS; empty on plaintext sessions
    pub shared_secret: Vec<u8>,
    /// Per-session salt for the PBKDF2 derivation
    pub salt: Vec<u8>,
    pub algorithm: EncryptionAlgorithm,
}

impl NegotiatedSession {
    pub fn plaintext(config: &PipelineConfiguration) -> NegotiatedSession {
        NegotiatedSession {
            use_ssl: false,
            shared_secret: Vec::new(),
            salt: Vec::new(),
            algorithm: config.encryption_algorithm,
        }
    }

    /// Mint fresh key material for an SSL session
    pub fn for_ssl(config: &PipelineConfiguration) -> NegotiatedSession {
        use rand::RngCore;
        let mut secret = vec![0u8; config.encryption_key_size];
        let mut salt = vec![0u8; config.encryption_salt_size];
        rand::thread_rng().fill_bytes(&mut secret);
        rand::thread_rng().fill_bytes(&mut salt);
        NegotiatedSession {
            use_ssl: true,
            shared_secret: secret,
            salt,
            algorithm: config.encryption_algorithm,
        }
    }
}

/// Cipher parameters announced to the server right after the TLS
/// upgrade; the accompanying binary blob carries salt then secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptEnvelope {
    pub algorithm: String,
    pub key_size: i32,
    pub salt_size: i32,
    pub hash_rounds: i32,
}

impl EncryptEnvelope {
    pub fn from_config(config: &PipelineConfiguration) -> EncryptEnvelope {
        EncryptEnvelope {
            algorithm: config.encryption_algorithm.token().to_string(),
            key_size: config.encryption_key_size as i32,
            salt_size: config.encryption_salt_size as i32,
            hash_rounds: config.encryption_hash_rounds as i32,
        }
    }

    pub fn to_tag(&self) -> Tag {
        Tag::node(
            "EncryptEnvelope_PI",
            vec![
                Tag::leaf("algorithm", self.algorithm.clone()),
                Tag::int("keySize", i64::from(self.key_size)),
                Tag::int("saltSize", i64::from(self.salt_size)),
                Tag::int("hashRounds", i64::from(self.hash_rounds)),
            ],
        )
    }

    pub fn from_tag(tag: &Tag) -> Result<EncryptEnvelope> {
        validate(tag)?;
        Ok(EncryptEnvelope {
            algorithm: tag.str_child("algorithm")?.to_string(),
            key_size: tag.int_child("keySize")? as i32,
            salt_size: tag.int_child("saltSize")? as i32,
            hash_rounds: tag.int_child("hashRounds")? as i32,
        })
    }
}
