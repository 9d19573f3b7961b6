use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("no sealing recipient configured for environment '{0}'")]
    UnknownRecipient(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// The value claims to be sealed but does not open under the held key.
    /// Distinct from [`SecretError::MalformedCiphertext`]: the envelope was
    /// intact, the key was wrong.
    #[error("sealed value was not produced for the held private key")]
    KeyMismatch,

    #[error("sealing failed: {0}")]
    SealFailed(String),

    #[error("hash generation failed: {0}")]
    HashFailed(String),

    #[error("invalid generation annotation: {0}")]
    InvalidAnnotation(String),
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

const ARMOR_BEGIN: &str = "-----BEGIN SEALED SECRET-----";
const ARMOR_END: &str = "-----END SEALED SECRET-----";

const PREFIX_SEALED: &str = "sealed:";
const PREFIX_BASE64_SEALED: &str = "base64+sealed:";
const PREFIX_PLAIN: &str = "plain:";

/// Payload layout inside the armor: `ephemeral pub (32) || nonce (12) || ct+tag`.
const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// How a stored value is encoded, signalled by its prefix token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Sealed,
    Base64Sealed,
}

/// Check for the armor markers of a sealed value.
pub fn is_armored(content: &str) -> bool {
    let content = content.trim();
    content.starts_with(ARMOR_BEGIN) && content.ends_with(ARMOR_END)
}

/// Split a value into its encoding and payload. Unprefixed values are
/// plaintext unless they carry the armor markers.
pub fn parse_prefixed(value: &str) -> (Encoding, &str) {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix(PREFIX_BASE64_SEALED) {
        (Encoding::Base64Sealed, rest)
    } else if let Some(rest) = value.strip_prefix(PREFIX_SEALED) {
        (Encoding::Sealed, rest)
    } else if let Some(rest) = value.strip_prefix(PREFIX_PLAIN) {
        (Encoding::Plain, rest)
    } else if is_armored(value) {
        (Encoding::Sealed, value)
    } else {
        (Encoding::Plain, value)
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Public key of one target environment. Values sealed to a recipient can
/// only be opened by the matching [`SealingKey`].
#[derive(Clone)]
pub struct Recipient(PublicKey);

/// Private identity; loaded once at process start from mounted material.
pub struct SealingKey(StaticSecret);

impl std::fmt::Debug for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Recipient").field(&self.encoded()).finish()
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

fn decode_key_bytes(encoded: &str) -> Result<[u8; 32], SecretError> {
    let bytes = Zeroizing::new(
        BASE64
            .decode(encoded.trim())
            .map_err(|e| SecretError::InvalidKey(format!("invalid base64: {e}")))?,
    );
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SecretError::InvalidKey(format!("key must be 32 bytes, got {}", bytes.len())))?;
    Ok(array)
}

impl SealingKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::fill(&mut bytes);
        Self(StaticSecret::from(bytes))
    }

    pub fn from_encoded(encoded: &str) -> Result<Self, SecretError> {
        Ok(Self(StaticSecret::from(decode_key_bytes(encoded)?)))
    }

    pub fn encoded(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }

    pub fn recipient(&self) -> Recipient {
        Recipient(PublicKey::from(&self.0))
    }

    /// Open an armored sealed value. Authentication failure under the held
    /// key is a [`SecretError::KeyMismatch`]; anything undecodable is
    /// [`SecretError::MalformedCiphertext`].
    pub fn open_armored(&self, armored: &str) -> Result<String, SecretError> {
        let armored = armored.trim();
        let body = armored
            .strip_prefix(ARMOR_BEGIN)
            .and_then(|rest| rest.strip_suffix(ARMOR_END))
            .ok_or_else(|| SecretError::MalformedCiphertext("missing armor markers".into()))?
            .trim();

        let payload = BASE64
            .decode(body.replace(['\n', '\r'], ""))
            .map_err(|e| SecretError::MalformedCiphertext(format!("invalid base64: {e}")))?;

        if payload.len() < EPHEMERAL_LEN + NONCE_LEN + TAG_LEN {
            return Err(SecretError::MalformedCiphertext(format!(
                "payload too short ({} bytes)",
                payload.len()
            )));
        }

        let ephemeral: [u8; 32] = payload[..EPHEMERAL_LEN]
            .try_into()
            .map_err(|_| SecretError::MalformedCiphertext("bad ephemeral key".into()))?;
        let ephemeral = PublicKey::from(ephemeral);
        let nonce = Nonce::from_slice(&payload[EPHEMERAL_LEN..EPHEMERAL_LEN + NONCE_LEN]);
        let ciphertext = &payload[EPHEMERAL_LEN + NONCE_LEN..];

        let key = derive_key(
            self.0.diffie_hellman(&ephemeral).as_bytes(),
            ephemeral.as_bytes(),
            PublicKey::from(&self.0).as_bytes(),
        );
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SecretError::MalformedCiphertext(e.to_string()))?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SecretError::KeyMismatch)?;

        String::from_utf8(plaintext)
            .map_err(|e| SecretError::MalformedCiphertext(format!("not valid UTF-8: {e}")))
    }

    /// Open a value according to its encoding prefix; unprefixed plaintext
    /// passes through unchanged.
    pub fn open_value(&self, value: &str) -> Result<String, SecretError> {
        match parse_prefixed(value) {
            (Encoding::Plain, content) => Ok(content.to_owned()),
            (Encoding::Sealed, content) => self.open_armored(content),
            (Encoding::Base64Sealed, content) => {
                let decoded = BASE64
                    .decode(content)
                    .map_err(|e| SecretError::MalformedCiphertext(format!("invalid base64: {e}")))?;
                let armored = String::from_utf8(decoded).map_err(|e| {
                    SecretError::MalformedCiphertext(format!("not valid UTF-8: {e}"))
                })?;
                self.open_armored(&armored)
            }
        }
    }
}

impl Recipient {
    pub fn from_encoded(encoded: &str) -> Result<Self, SecretError> {
        Ok(Self(PublicKey::from(decode_key_bytes(encoded)?)))
    }

    pub fn encoded(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }

    /// Seal a plaintext to this recipient. A fresh ephemeral key is used per
    /// call, so two seals of the same plaintext differ.
    pub fn seal_armored(&self, plaintext: &str) -> Result<String, SecretError> {
        let mut ephemeral_bytes = [0u8; 32];
        rand::fill(&mut ephemeral_bytes);
        let ephemeral = StaticSecret::from(ephemeral_bytes);
        let ephemeral_pub = PublicKey::from(&ephemeral);

        let key = derive_key(
            ephemeral.diffie_hellman(&self.0).as_bytes(),
            ephemeral_pub.as_bytes(),
            self.0.as_bytes(),
        );
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| SecretError::SealFailed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| SecretError::SealFailed(e.to_string()))?;

        let mut payload = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(ephemeral_pub.as_bytes());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);

        Ok(format!("{ARMOR_BEGIN}\n{}\n{ARMOR_END}", BASE64.encode(payload)))
    }

    /// Seal to the single-line `base64+sealed:` form used in committed files.
    pub fn seal_value(&self, plaintext: &str) -> Result<String, SecretError> {
        let armored = self.seal_armored(plaintext)?;
        Ok(format!("{PREFIX_BASE64_SEALED}{}", BASE64.encode(armored)))
    }
}

fn derive_key(shared: &[u8; 32], ephemeral_pub: &[u8; 32], recipient_pub: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral_pub);
    hasher.update(recipient_pub);
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Holds the process-wide private identity and one sealing recipient per
/// target environment. Built once at startup, read-only thereafter.
#[derive(Debug)]
pub struct SecretEngine {
    identity: SealingKey,
    recipients: HashMap<String, Recipient>,
}

impl SecretEngine {
    pub fn new(identity: SealingKey, recipients: HashMap<String, Recipient>) -> Self {
        Self { identity, recipients }
    }

    pub fn recipient_for(&self, environment: &str) -> Result<&Recipient, SecretError> {
        self.recipients
            .get(environment)
            .ok_or_else(|| SecretError::UnknownRecipient(environment.to_owned()))
    }

    pub fn open_value(&self, value: &str) -> Result<String, SecretError> {
        self.identity.open_value(value)
    }

    /// Open every field of a document. A field that fails to open (key
    /// mismatch, malformed ciphertext) is reported individually; the rest of
    /// the batch still comes back.
    pub fn open_document(
        &self,
        doc: &std::collections::BTreeMap<String, String>,
    ) -> (
        std::collections::BTreeMap<String, String>,
        std::collections::BTreeMap<String, SecretError>,
    ) {
        let mut opened = std::collections::BTreeMap::new();
        let mut failed = std::collections::BTreeMap::new();
        for (field, value) in doc {
            match self.open_value(value) {
                Ok(plain) => {
                    opened.insert(field.clone(), plain);
                }
                Err(e) => {
                    failed.insert(field.clone(), e);
                }
            }
        }
        (opened, failed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
