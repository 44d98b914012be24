//! Action signing and operation verification.
//!
//! A signature is a five-field tuple: `(timestamp, signer, action_hash,
//! prev_state_hash, signature_hex)`. The signed message is the first four
//! fields concatenated, prefixed with `"\x19Signed Operation:\n"` and the
//! length of the concatenation.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use reactor_types::{Action, Operation, Signature};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const SIGNER_PREFIX: &str = "ed25519:";

/// Errors from key handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignerError {
    /// The OS random number generator failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Key material could not be parsed
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Signs actions before they are persisted.
pub trait Signer: Send + Sync {
    /// Sign `action`, applied on top of state with hash `prev_state_hash`.
    fn sign(&self, action: &Action, prev_state_hash: &str) -> Result<Signature, SignerError>;
}

/// Signer used when signing is not configured. Returns the empty signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSigner;

impl Signer for PassthroughSigner {
    fn sign(&self, _action: &Action, _prev_state_hash: &str) -> Result<Signature, SignerError> {
        Ok(Signature::empty())
    }
}

/// Outcome of verifying one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Signature checks out
    Valid,
    /// Signature is missing, malformed, untrusted or wrong
    Invalid(String),
    /// Nothing to verify and the verifier allows that
    Skipped,
}

impl Verdict {
    /// True unless the verdict is `Invalid`.
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, Verdict::Invalid(_))
    }
}

/// Verifies signatures on operations received from remotes.
pub trait Verifier: Send + Sync {
    /// Check `signature` against `operation`.
    fn verify(&self, operation: &Operation, signature: &Signature) -> Verdict;
}

/// Base64 SHA-256 of `scope + type + json(input)`.
pub fn action_hash(action: &Action) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.scope.as_bytes());
    hasher.update(action.action_type.as_bytes());
    hasher.update(action.input.to_string().as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The bytes covered by the signature.
pub fn signature_message(timestamp: &str, signer: &str, action_hash: &str, prev_state_hash: &str) -> Vec<u8> {
    let joined = [timestamp, signer, action_hash, prev_state_hash].concat();
    format!("\x19Signed Operation:\n{}{}", joined.len(), joined).into_bytes()
}

/// Ed25519 signer.
pub struct Ed25519Signer {
    key: SigningKey,
    identity: String,
}

impl Ed25519Signer {
    /// Create a signer from a 32-byte secret key.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        let key = SigningKey::from_bytes(secret);
        let identity = signer_identity(&key.verifying_key());
        Self { key, identity }
    }

    /// Create a signer with a fresh random key.
    pub fn generate() -> Result<Self, SignerError> {
        let mut secret = [0u8; 32];
        getrandom::getrandom(&mut secret).map_err(|e| SignerError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_bytes(&secret))
    }

    /// Create a signer from a hex-encoded secret key.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::InvalidKey("secret key must be 32 bytes".into()))?;
        Ok(Self::from_bytes(&secret))
    }

    /// Hex-encoded secret key, for persisting.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Identity placed in the signer field: `ed25519:<hex public key>`.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, action: &Action, prev_state_hash: &str) -> Result<Signature, SignerError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string();
        let hash = action_hash(action);
        let message = signature_message(&timestamp, &self.identity, &hash, prev_state_hash);
        let signature = self.key.sign(&message);

        Ok(Signature::new(
            timestamp,
            self.identity.clone(),
            hash,
            prev_state_hash,
            format!("0x{}", hex::encode(signature.to_bytes())),
        ))
    }
}

fn signer_identity(key: &VerifyingKey) -> String {
    format!("{}{}", SIGNER_PREFIX, hex::encode(key.as_bytes()))
}

/// Ed25519 verifier.
///
/// The public key is taken from the signer field. With a non-empty trust
/// list, only those keys are accepted.
#[derive(Debug, Clone, Default)]
pub struct Ed25519Verifier {
    trusted: HashSet<String>,
    allow_unsigned: bool,
}

impl Ed25519Verifier {
    /// Verifier accepting any well-formed ed25519 signer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept these signer identities (`ed25519:<hex>` or bare hex).
    pub fn with_trusted<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.trusted = identities
            .into_iter()
            .map(|id| {
                let id = id.as_ref();
                if id.starts_with(SIGNER_PREFIX) {
                    id.to_string()
                } else {
                    format!("{}{}", SIGNER_PREFIX, id)
                }
            })
            .collect();
        self
    }

    /// Report unsigned operations as `Skipped` instead of `Invalid`.
    pub fn allow_unsigned(mut self, allow: bool) -> Self {
        self.allow_unsigned = allow;
        self
    }

    fn parse_key(signer: &str) -> Result<VerifyingKey, String> {
        let key_hex = signer
            .strip_prefix(SIGNER_PREFIX)
            .ok_or_else(|| format!("unsupported signer scheme: {}", signer))?;
        let bytes = hex::decode(key_hex).map_err(|e| format!("bad signer key: {}", e))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "signer key must be 32 bytes".to_string())?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| format!("bad signer key: {}", e))
    }
}

impl Verifier for Ed25519Verifier {
    fn verify(&self, operation: &Operation, signature: &Signature) -> Verdict {
        if signature.is_empty() {
            return if self.allow_unsigned {
                Verdict::Skipped
            } else {
                Verdict::Invalid("operation is not signed".into())
            };
        }
        if !self.trusted.is_empty() && !self.trusted.contains(signature.signer()) {
            return Verdict::Invalid(format!("untrusted signer {}", signature.signer()));
        }
        if signature.action_hash() != action_hash(&operation.to_action()) {
            return Verdict::Invalid("signature does not cover this operation".into());
        }

        let key = match Self::parse_key(signature.signer()) {
            Ok(key) => key,
            Err(reason) => return Verdict::Invalid(reason),
        };
        let sig_hex = signature.signature_hex();
        let sig_bytes = match hex::decode(sig_hex.strip_prefix("0x").unwrap_or(sig_hex)) {
            Ok(bytes) => bytes,
            Err(e) => return Verdict::Invalid(format!("bad signature encoding: {}", e)),
        };
        let sig = match ed25519_dalek::Signature::from_slice(&sig_bytes) {
            Ok(sig) => sig,
            Err(e) => return Verdict::Invalid(format!("bad signature: {}", e)),
        };

        let message = signature_message(
            signature.timestamp(),
            signature.signer(),
            signature.action_hash(),
            signature.prev_state_hash(),
        );
        match key.verify(&message, &sig) {
            Ok(()) => Verdict::Valid,
            Err(_) => Verdict::Invalid("signature mismatch".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactor_types::DEFAULT_BRANCH;
    use serde_json::json;

    fn signed_operation(signer: &Ed25519Signer) -> Operation {
        let action = Action::new("SET_NAME", "global", json!({"name": "alpha"}));
        let signature = signer.sign(&action, "prev").unwrap();
        Operation::from_action(&action.with_signature(signature), 0, DEFAULT_BRANCH)
    }

    #[test]
    fn passthrough_signs_empty() {
        let action = Action::new("X", "global", json!(null));
        assert!(PassthroughSigner.sign(&action, "").unwrap().is_empty());
    }

    #[test]
    fn message_is_length_prefixed() {
        let message = signature_message("1", "me", "h", "");
        assert_eq!(message, b"\x19Signed Operation:\n41meh".to_vec());
    }

    #[test]
    fn signature_fields() {
        let signer = Ed25519Signer::generate().unwrap();
        let action = Action::new("SET_NAME", "global", json!({"name": "alpha"}));
        let sig = signer.sign(&action, "prev").unwrap();

        assert_eq!(sig.signer(), signer.identity());
        assert_eq!(sig.action_hash(), action_hash(&action));
        assert_eq!(sig.prev_state_hash(), "prev");
        assert!(sig.signature_hex().starts_with("0x"));
    }

    #[test]
    fn valid_signature_verifies() {
        let signer = Ed25519Signer::generate().unwrap();
        let op = signed_operation(&signer);
        let sig = op.signature.clone().unwrap();

        assert_eq!(Ed25519Verifier::new().verify(&op, &sig), Verdict::Valid);
    }

    #[test]
    fn tampered_input_is_invalid() {
        let signer = Ed25519Signer::generate().unwrap();
        let mut op = signed_operation(&signer);
        op.input = json!({"name": "mallory"});
        let sig = op.signature.clone().unwrap();

        assert!(!Ed25519Verifier::new().verify(&op, &sig).is_acceptable());
    }

    #[test]
    fn forged_signature_is_invalid() {
        let signer = Ed25519Signer::generate().unwrap();
        let op = signed_operation(&signer);
        let mut sig = op.signature.clone().unwrap();
        sig.3 = "other-prev".into();

        assert_eq!(
            Ed25519Verifier::new().verify(&op, &sig),
            Verdict::Invalid("signature mismatch".into())
        );
    }

    #[test]
    fn untrusted_signer_is_invalid() {
        let signer = Ed25519Signer::generate().unwrap();
        let other = Ed25519Signer::generate().unwrap();
        let op = signed_operation(&signer);
        let sig = op.signature.clone().unwrap();

        let verifier = Ed25519Verifier::new().with_trusted([other.identity()]);
        assert!(!verifier.verify(&op, &sig).is_acceptable());

        let bare_hex = signer.identity().trim_start_matches(SIGNER_PREFIX).to_string();
        let verifier = Ed25519Verifier::new().with_trusted([bare_hex]);
        assert_eq!(verifier.verify(&op, &sig), Verdict::Valid);
    }

    #[test]
    fn unsigned_operation_policy() {
        let action = Action::new("X", "global", json!(null));
        let op = Operation::from_action(&action, 0, DEFAULT_BRANCH);

        assert!(!Ed25519Verifier::new().verify(&op, &Signature::empty()).is_acceptable());
        assert_eq!(
            Ed25519Verifier::new().allow_unsigned(true).verify(&op, &Signature::empty()),
            Verdict::Skipped
        );
    }

    #[test]
    fn secret_hex_roundtrip() {
        let signer = Ed25519Signer::generate().unwrap();
        let restored = Ed25519Signer::from_secret_hex(&signer.secret_hex()).unwrap();
        assert_eq!(signer.identity(), restored.identity());
        assert!(Ed25519Signer::from_secret_hex("abcd").is_err());
    }
}
