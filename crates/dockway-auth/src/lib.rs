//! Shared-key credential verification for dockway agents
//!
//! An agent authenticates with HTTP Basic credentials (RFC 7617) where the
//! username is its agent id and the password is the lowercase-hex
//! HMAC-SHA256 of that id under the broker's signing key. Verification is
//! stateless and deterministic; a failed proof is an expected outcome, not
//! an error.
//!
//! # Security Note
//!
//! Basic credentials should only be presented over HTTPS as they are
//! transmitted in an easily reversible encoding (not encryption).

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Shared key used to derive and verify agent proofs.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

impl From<&str> for SigningKey {
    fn from(key: &str) -> Self {
        Self(key.as_bytes().to_vec())
    }
}

/// Credential presented by an agent at tunnel-connect time.
///
/// Consumed once per authentication attempt; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Agent id, supplied as the Basic auth username.
    pub id: String,
    /// Lowercase-hex keyed hash of the id, supplied as the password.
    pub proof: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, proof: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            proof: proof.into(),
        }
    }

    /// Derive the valid credential for `id` under `key`.
    pub fn for_agent(id: &str, key: &SigningKey) -> Self {
        Self {
            id: id.to_string(),
            proof: sign(id, key),
        }
    }

    /// Parse an `Authorization` header value.
    ///
    /// Returns `None` for anything other than a well-formed Basic header;
    /// a malformed header counts as "no credential presented".
    pub fn from_basic(header: &str) -> Option<Self> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (id, proof) = decoded.split_once(':')?;
        Some(Self {
            id: id.to_string(),
            proof: proof.to_string(),
        })
    }

    /// Render the credential as an `Authorization` header value.
    pub fn to_basic(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.id, self.proof));
        format!("Basic {encoded}")
    }
}

/// Compute the lowercase-hex HMAC-SHA256 proof for `id`.
pub fn sign(id: &str, key: &SigningKey) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check `proof` against the expected proof for `id`.
///
/// Proofs must be rendered as lowercase hex; any other rendering fails.
/// The digest comparison itself is constant-time.
pub fn verify(id: &str, proof: &str, key: &SigningKey) -> bool {
    let Ok(claimed) = hex::decode(proof) else {
        return false;
    };
    // hex::decode also accepts uppercase; re-encoding catches that.
    if hex::encode(&claimed) != proof {
        return false;
    }

    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(id.as_bytes());
    mac.verify_slice(&claimed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::from("c8706bab7db59103a6bfd36e0c6b42e35d3f55d5")
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let proof = sign("agent1", &key());
        assert_eq!(proof.len(), 64);
        assert!(proof.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(verify("agent1", &proof, &key()));
    }

    #[test]
    fn test_verify_rejects_wrong_proof() {
        let proof = sign("agent1", &key());
        assert!(!verify("agent2", &proof, &key()));
        assert!(!verify("agent1", &proof, &SigningKey::from("other-key")));
        assert!(!verify("agent1", &sign("agent2", &key()), &key()));
    }

    #[test]
    fn test_verify_rejects_non_hex_proof() {
        assert!(!verify("agent1", "not hex at all", &key()));
        assert!(!verify("agent1", "", &key()));
        assert!(!verify("agent1", "abc", &key()));
    }

    #[test]
    fn test_verify_rejects_uppercase_rendering() {
        let proof = sign("agent1", &key()).to_uppercase();
        assert!(!verify("agent1", &proof, &key()));
    }

    #[test]
    fn test_for_agent_matches_sign() {
        let credential = Credential::for_agent("agent1", &key());
        assert_eq!(credential.id, "agent1");
        assert!(verify(&credential.id, &credential.proof, &key()));
    }

    #[test]
    fn test_basic_header_round_trip() {
        let credential = Credential::for_agent("agent1", &key());
        let parsed = Credential::from_basic(&credential.to_basic()).unwrap();
        assert_eq!(parsed, credential);
    }

    #[test]
    fn test_from_basic_rejects_malformed() {
        assert!(Credential::from_basic("Bearer abc123").is_none());
        assert!(Credential::from_basic("Basic !!!not-base64!!!").is_none());
        // Valid base64 but no colon separator.
        let encoded = base64::engine::general_purpose::STANDARD.encode("no-separator");
        assert!(Credential::from_basic(&format!("Basic {encoded}")).is_none());
    }

    #[test]
    fn test_from_basic_empty_username() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(":proof");
        let parsed = Credential::from_basic(&format!("Basic {encoded}")).unwrap();
        assert_eq!(parsed.id, "");
        assert_eq!(parsed.proof, "proof");
    }

    #[test]
    fn test_signing_key_debug_is_redacted() {
        let rendered = format!("{:?}", key());
        assert!(!rendered.contains("c8706bab"));
    }
}
