use std::collections::BTreeMap;

use rand::Rng;
use rand::RngExt;
use rand::seq::SliceRandom;
use zeroize::Zeroizing;

use super::engine::{Recipient, SecretError};

// ---------------------------------------------------------------------------
// Random generation
// ---------------------------------------------------------------------------

const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";

/// bcrypt truncates input beyond 72 bytes; cap generated material below it.
const MAX_BCRYPT_LEN: usize = 72;
const MAX_RANDOM_LEN: usize = 1024;

fn pick(rng: &mut impl Rng, set: &[u8]) -> char {
    char::from(set[rng.random_range(0..set.len())])
}

/// Generate an alphanumeric random value of exactly `len` characters.
///
/// Values of 3 or more characters contain at least one character from each
/// class (upper, lower, digit), positions shuffled.
pub fn random_string(len: usize) -> String {
    random_string_with(len, "")
}

/// Like [`random_string`], with extra characters admitted into the class
/// (e.g. punctuation for systems that require it).
pub fn random_string_with(len: usize, additional_chars: &str) -> String {
    let mut rng = rand::rng();
    let mut chars: Vec<char> = Vec::with_capacity(len);

    if len >= 3 {
        let min_each = (len / 6).max(1);
        for _ in 0..min_each {
            chars.push(pick(&mut rng, UPPERCASE));
            chars.push(pick(&mut rng, LOWERCASE));
            chars.push(pick(&mut rng, DIGITS));
        }
    }

    let mut full: Vec<u8> = [UPPERCASE, LOWERCASE, DIGITS].concat();
    full.extend_from_slice(additional_chars.as_bytes());
    while chars.len() < len {
        chars.push(pick(&mut rng, &full));
    }
    chars.truncate(len);
    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}

/// Generate a random value of `len` characters and its salted bcrypt hash.
/// The plaintext is for one-time display; only the hash is meant to persist.
pub fn generate_bcrypt(len: usize) -> Result<(Zeroizing<String>, String), SecretError> {
    let plaintext = Zeroizing::new(random_string(len));
    let hash = bcrypt::hash(plaintext.as_str(), bcrypt::DEFAULT_COST)
        .map_err(|e| SecretError::HashFailed(e.to_string()))?;
    Ok((plaintext, hash))
}

// ---------------------------------------------------------------------------
// Generation annotations
// ---------------------------------------------------------------------------

/// Inline generation policy attached to a template field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationRule {
    /// `random:<N>` — random alphanumeric value of length N.
    Random(usize),
    /// `bcrypt:<N>` — salted hash of a fresh random N-character value.
    BcryptOfRandom(usize),
    /// `skip:<literal>` — keep the literal verbatim, never sealed.
    Skip(String),
    /// No annotation; the value passes through as-is.
    Literal(String),
}

impl GenerationRule {
    pub fn parse(value: &str) -> Result<Self, SecretError> {
        if let Some(n) = value.strip_prefix("random:") {
            let n = parse_length(value, n, MAX_RANDOM_LEN)?;
            return Ok(Self::Random(n));
        }
        if let Some(n) = value.strip_prefix("bcrypt:") {
            let n = parse_length(value, n, MAX_BCRYPT_LEN)?;
            return Ok(Self::BcryptOfRandom(n));
        }
        if let Some(literal) = value.strip_prefix("skip:") {
            return Ok(Self::Skip(literal.to_owned()));
        }
        if value == "skip" {
            return Ok(Self::Skip(String::new()));
        }
        Ok(Self::Literal(value.to_owned()))
    }
}

fn parse_length(annotation: &str, raw: &str, max: usize) -> Result<usize, SecretError> {
    let n: usize = raw
        .parse()
        .map_err(|_| SecretError::InvalidAnnotation(annotation.to_owned()))?;
    if n == 0 || n > max {
        return Err(SecretError::InvalidAnnotation(format!(
            "{annotation}: length must be between 1 and {max}"
        )));
    }
    Ok(n)
}

// ---------------------------------------------------------------------------
// Batch rendering
// ---------------------------------------------------------------------------

/// The two renderings of an annotated document.
///
/// `plaintext` is for one-time display only and must not be persisted; for
/// `bcrypt:` fields it carries the generated password, not the hash.
/// `sealed` is the only form written downstream; `skip` fields stay literal
/// in both.
#[derive(Debug)]
pub struct RenderedMaterial {
    pub plaintext: BTreeMap<String, String>,
    pub sealed: BTreeMap<String, String>,
}

/// Render an annotated document into its plaintext and sealed forms.
pub fn render_material(
    doc: &BTreeMap<String, String>,
    recipient: &Recipient,
) -> Result<RenderedMaterial, SecretError> {
    let mut plaintext = BTreeMap::new();
    let mut sealed = BTreeMap::new();

    for (field, value) in doc {
        match GenerationRule::parse(value)? {
            GenerationRule::Random(n) => {
                let generated = random_string(n);
                sealed.insert(field.clone(), recipient.seal_value(&generated)?);
                plaintext.insert(field.clone(), generated);
            }
            GenerationRule::BcryptOfRandom(n) => {
                let (password, hash) = generate_bcrypt(n)?;
                sealed.insert(field.clone(), recipient.seal_value(&hash)?);
                plaintext.insert(field.clone(), password.as_str().to_owned());
            }
            GenerationRule::Skip(literal) => {
                plaintext.insert(field.clone(), literal.clone());
                sealed.insert(field.clone(), literal);
            }
            GenerationRule::Literal(value) => {
                sealed.insert(field.clone(), recipient.seal_value(&value)?);
                plaintext.insert(field.clone(), value);
            }
        }
    }

    Ok(RenderedMaterial { plaintext, sealed })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
