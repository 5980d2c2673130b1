//! Backup code generation and verification.
//!
//! Codes are 12 characters from an alphabet without look-alike glyphs, shown in
//! groups of four. Only Argon2id hashes peppered with a server secret are stored.

use anyhow::{Context, Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretSlice};

use super::BackupCode;

const CODE_LEN: usize = 12;
const CODE_GROUP_SIZE: usize = 4;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Plaintext codes for the client and the records to persist. The plaintext is
/// handed out once and never stored.
#[derive(Debug)]
pub struct IssuedCodes {
    pub plaintext: Vec<String>,
    pub records: Vec<BackupCode>,
}

pub struct BackupCodeHasher {
    pepper: SecretSlice<u8>,
    params: argon2::Params,
}

impl BackupCodeHasher {
    #[must_use]
    pub fn new(pepper: SecretSlice<u8>) -> Self {
        Self {
            pepper,
            params: argon2::Params::default(),
        }
    }

    /// Override the Argon2 cost parameters.
    #[must_use]
    pub fn with_params(mut self, params: argon2::Params) -> Self {
        self.params = params;
        self
    }

    fn argon2(&self) -> Result<Argon2<'_>> {
        Argon2::new_with_secret(
            self.pepper.expose_secret(),
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            self.params.clone(),
        )
        .map_err(|_| anyhow!("failed to initialize Argon2id"))
    }

    /// Generate `count` fresh codes.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub fn issue(&self, count: usize, issued_at: DateTime<Utc>) -> Result<IssuedCodes> {
        let mut rng = OsRng;
        let mut plaintext = Vec::with_capacity(count);
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let code = generate_code(&mut rng)?;
            records.push(BackupCode {
                code_hash: self.hash(&code)?,
                used: false,
                issued_at,
            });
            plaintext.push(code);
        }
        Ok(IssuedCodes { plaintext, records })
    }

    /// Hash a code for storage.
    ///
    /// # Errors
    /// Returns an error if the code is malformed or hashing fails.
    pub fn hash(&self, code: &str) -> Result<String> {
        let normalized = normalize_code(code)?;
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()?
            .hash_password(normalized.as_bytes(), &salt)
            .map_err(|_| anyhow!("failed to hash backup code"))?
            .to_string();
        Ok(hash)
    }

    /// Find the stored record matching `code`, used or not.
    ///
    /// Malformed input matches nothing.
    #[must_use]
    pub fn find_match<'a>(&self, code: &str, stored: &'a [BackupCode]) -> Option<&'a BackupCode> {
        let normalized = normalize_code(code).ok()?;
        let argon2 = self.argon2().ok()?;
        stored.iter().find(|record| {
            PasswordHash::new(&record.code_hash).is_ok_and(|parsed| {
                argon2
                    .verify_password(normalized.as_bytes(), &parsed)
                    .is_ok()
            })
        })
    }
}

/// Strip separators and case, then check length and alphabet.
///
/// # Errors
/// Returns an error if the code does not have the expected shape.
pub fn normalize_code(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != CODE_LEN {
        return Err(anyhow!("invalid backup code length"));
    }
    if !normalized
        .bytes()
        .all(|byte| CODE_ALPHABET.contains(&byte))
    {
        return Err(anyhow!("invalid backup code characters"));
    }
    Ok(normalized)
}

/// Render a normalized code as `XXXX-XXXX-XXXX`.
///
/// # Errors
/// Returns an error if the input is not a normalized code.
pub fn format_code(normalized: &str) -> Result<String> {
    if normalized.len() != CODE_LEN {
        return Err(anyhow!("invalid backup code length"));
    }
    let groups = normalized
        .as_bytes()
        .chunks(CODE_GROUP_SIZE)
        .map(std::str::from_utf8)
        .collect::<Result<Vec<_>, _>>()
        .context("invalid backup code chunk")?;
    Ok(groups.join("-"))
}

fn generate_code<R: RngCore + ?Sized>(rng: &mut R) -> Result<String> {
    let mut raw = [0u8; CODE_LEN];
    rng.try_fill_bytes(&mut raw)
        .context("failed to generate backup code")?;
    let normalized: String = raw
        .iter()
        .filter_map(|byte| CODE_ALPHABET.get(usize::from(*byte) % CODE_ALPHABET.len()))
        .map(|byte| char::from(*byte))
        .collect();
    format_code(&normalized)
}
