//! Encrypts directive secrets at rest and migrates plaintext secrets in place.
//!
//! Ciphertext is a Fernet token whose key is the URL-safe base64 encoding of the SHA-256 digest
//! of the configured key. The token is base64 encoded once more before it is stored, so a stored
//! value is always plain URL-safe base64 and never contains quotes or semicolons.

use crate::core::directive::{
    is_blank, Annotation, DirectiveValue, RawDirectiveRecord, ENCRYPTED_PASSWORD, PASSWORD,
};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use fernet::Fernet;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Range;
use thiserror::Error;
use tracing::{debug, info};

/// The shortest key the codec accepts.
pub const MIN_KEY_LEN: usize = 16;

const SELF_TEST_PLAINTEXT: &str = "verification-test";

/// Failures from the secret codec.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SecretError {
    /// A ciphertext needed decrypting, or a plaintext needed encrypting, but no key is configured.
    #[error("no encryption key is configured")]
    KeyMissing,

    /// The configured key failed validation. Fatal at startup.
    #[error("encryption key is invalid: {0}")]
    InvalidKey(String),

    /// A stored ciphertext could not be decrypted with the configured key.
    #[error("could not decrypt secret: {0}")]
    DecryptFailed(String),

    #[error("could not encrypt secret")]
    EncryptFailed,
}

/// A secret as it appears in a directive.
#[derive(Clone, Eq, PartialEq, Serialize)]
pub enum SecretField {
    Plaintext(String),
    Ciphertext(String),
}

// Keep secrets out of debug output and logs.
impl fmt::Debug for SecretField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretField::Plaintext(_) => f.write_str("Plaintext(..)"),
            SecretField::Ciphertext(_) => f.write_str("Ciphertext(..)"),
        }
    }
}

/// Encrypts, decrypts, and digests directive secrets.
///
/// A codec without a key can still digest plaintext secrets; any operation that needs the key
/// returns [SecretError::KeyMissing].
pub struct SecretCodec {
    fernet: Option<Fernet>,
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCodec")
            .field("keyed", &self.fernet.is_some())
            .finish()
    }
}

impl SecretCodec {
    /// Validates `key` and builds a codec from it.
    ///
    /// Validation checks the key's shape (non-empty, at least [MIN_KEY_LEN] characters, no white
    /// space or control characters) and then round-trips a known plaintext through the cipher.
    ///
    /// # Errors
    ///
    /// Returns [SecretError::InvalidKey] if either check fails.
    pub fn new(key: Option<&str>) -> Result<Self, SecretError> {
        let Some(key) = key else {
            return Ok(Self { fernet: None });
        };

        if key.is_empty() {
            return Err(SecretError::InvalidKey("key is empty".to_string()));
        }
        if key.chars().count() < MIN_KEY_LEN {
            return Err(SecretError::InvalidKey(format!(
                "key must be at least {MIN_KEY_LEN} characters",
            )));
        }
        if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(SecretError::InvalidKey(
                "key must not contain white space or control characters".to_string(),
            ));
        }

        let fernet = Fernet::new(&derive_key(key))
            .ok_or_else(|| SecretError::InvalidKey("derived key was rejected".to_string()))?;
        let codec = Self {
            fernet: Some(fernet),
        };

        let ciphertext = codec.encrypt(SELF_TEST_PLAINTEXT)?;
        match codec.decrypt(&ciphertext) {
            Ok(plaintext) if plaintext == SELF_TEST_PLAINTEXT => {
                debug!("encryption key passed its self-test");
                Ok(codec)
            }
            _ => Err(SecretError::InvalidKey(
                "round trip through the cipher failed".to_string(),
            )),
        }
    }

    /// Returns `true` if the codec holds a validated key.
    pub fn has_key(&self) -> bool {
        self.fernet.is_some()
    }

    fn fernet(&self) -> Result<&Fernet, SecretError> {
        self.fernet.as_ref().ok_or(SecretError::KeyMissing)
    }

    /// Encrypts a plaintext into its stored form.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let token = self.fernet()?.encrypt(plaintext.as_bytes());
        Ok(URL_SAFE.encode(token.as_bytes()))
    }

    /// Decrypts a stored ciphertext.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        let fernet = self.fernet()?;
        let token = URL_SAFE
            .decode(ciphertext.trim())
            .map_err(|e| SecretError::DecryptFailed(format!("not base64: {e}")))?;
        let token = String::from_utf8(token)
            .map_err(|_| SecretError::DecryptFailed("token is not UTF-8".to_string()))?;
        let plaintext = fernet
            .decrypt(&token)
            .map_err(|_| SecretError::DecryptFailed("wrong key or corrupted token".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| SecretError::DecryptFailed("plaintext is not UTF-8".to_string()))
    }

    /// Reads the secret out of a record. A plaintext takes precedence over a ciphertext, matching
    /// what [SecretCodec::migrate] keeps. A blank plaintext counts as absent.
    pub fn inspect(record: &RawDirectiveRecord) -> Option<SecretField> {
        if let Some(plaintext) = plaintext(record) {
            return Some(SecretField::Plaintext(plaintext.value.clone()));
        }
        record
            .get(ENCRYPTED_PASSWORD)
            .map(|c| SecretField::Ciphertext(c.to_string()))
    }

    /// Returns the plaintext of a secret, decrypting it if needed.
    pub fn reveal(&self, secret: &SecretField) -> Result<String, SecretError> {
        match secret {
            SecretField::Plaintext(p) => Ok(p.clone()),
            SecretField::Ciphertext(c) => self.decrypt(c),
        }
    }

    /// Returns a stable digest of a secret's plaintext, suitable for comparing against the
    /// digest a broker reports for an existing connection.
    pub fn digest(&self, secret: &SecretField) -> Result<String, SecretError> {
        Ok(digest(&self.reveal(secret)?))
    }

    /// Replaces a record's plaintext secret with a ciphertext.
    ///
    /// The output depends only on the input record: a record that already holds only a
    /// ciphertext, or any record when no key is configured, is returned unchanged. When a record
    /// holds both a plaintext and a ciphertext, the plaintext wins and the stale ciphertext is
    /// replaced. All text other than the secret tokens, and the blanks that separated a dropped
    /// token from its neighbor, is preserved.
    pub fn migrate(&self, record: &RawDirectiveRecord) -> Result<RawDirectiveRecord, SecretError> {
        let Some(plain) = plaintext(record) else {
            return Ok(record.clone());
        };
        if self.fernet.is_none() {
            return Ok(record.clone());
        }

        let replacement = format!(
            "{ENCRYPTED_PASSWORD}:\"{}\"",
            self.encrypt(&plain.value)?,
        );
        let source = record.source();

        let new_source = match record.entry(ENCRYPTED_PASSWORD) {
            None => splice(source, &plain.token, &replacement),
            // The ciphertext takes the plaintext's place and the stale ciphertext is dropped.
            // Splice the later token first so the earlier range stays valid.
            Some(stale) if stale.token.start > plain.token.start => {
                let partial = splice(source, &widen(source, &stale.token), "");
                splice(&partial, &plain.token, &replacement)
            }
            Some(stale) => {
                let partial = splice(source, &plain.token, &replacement);
                splice(&partial, &widen(&partial, &stale.token), "")
            }
        };

        record
            .with_source(new_source)
            .ok_or(SecretError::EncryptFailed)
    }

    /// Migrates every record in an annotation and renders the result.
    ///
    /// Returns `Ok(None)` if nothing needed migrating, so callers can skip a write-back.
    pub fn migrate_annotation(&self, annotation: &Annotation) -> Result<Option<String>, SecretError> {
        let mut migrated = Vec::with_capacity(annotation.records.len());
        let mut changed = 0;
        for record in annotation.records.iter() {
            let new = self.migrate(record)?;
            if new.source() != record.source() {
                changed += 1;
            }
            migrated.push(new);
        }

        if changed == 0 {
            return Ok(None);
        }
        info!(records = changed, "encrypted plaintext secrets");
        Ok(Some(annotation.render(&migrated)))
    }
}

/// Derives the Fernet key from a configured key.
fn derive_key(key: &str) -> String {
    URL_SAFE.encode(Sha256::digest(key.as_bytes()))
}

/// Returns the hex-encoded SHA-256 digest of a plaintext secret.
pub fn digest(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

fn splice(source: &str, range: &Range<usize>, with: &str) -> String {
    let mut out = String::with_capacity(source.len() + with.len());
    out.push_str(&source[..range.start]);
    out.push_str(with);
    out.push_str(&source[range.end..]);
    out
}

fn plaintext(record: &RawDirectiveRecord) -> Option<&DirectiveValue> {
    record.entry(PASSWORD).filter(|v| !is_blank(&v.value))
}

// Grows a token's range to take one side's blanks with it, so removing the token leaves the
// spacing around its neighbors as it was. Blanks before the token are taken when they follow
// text on the same line, otherwise blanks after it.
fn widen(source: &str, token: &Range<usize>) -> Range<usize> {
    let blank = |c: char| c == ' ' || c == '\t';
    let before = source[..token.start].trim_end_matches(blank).len();
    if before < token.start && before > 0 && !source[..before].ends_with('\n') {
        return before..token.end;
    }
    let after = source.len() - source[token.end..].trim_start_matches(blank).len();
    token.start..after
}
