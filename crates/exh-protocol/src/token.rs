use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{TOKEN_ENTROPY_BYTES, TOKEN_PREFIX};

/// A freshly issued bearer token. Only ever handed out once.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamToken(String);

impl StreamToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Digest stored by the registry in place of the token.
    pub fn digest(&self) -> String {
        token_digest(&self.0)
    }
}

impl std::fmt::Debug for StreamToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamToken({TOKEN_PREFIX}…)")
    }
}

/// Generate a new high-entropy token: `exh_live_<48 hex chars>`.
pub fn generate_token() -> StreamToken {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    StreamToken(format!("{TOKEN_PREFIX}{}", hex::encode(bytes)))
}

/// SHA-256 hex digest of a presented token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Cheap shape check before touching any lock.
pub fn looks_like_token(token: &str) -> bool {
    token
        .strip_prefix(TOKEN_PREFIX)
        .map(|rest| rest.len() == TOKEN_ENTROPY_BYTES * 2 && rest.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}
