use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

use crate::config::MAX_WINDOW_SECONDS;

pub const ARG_TOTP_ISSUER: &str = "totp-issuer";
pub const ARG_TOTP_PERIOD_SECONDS: &str = "totp-period-seconds";
pub const ARG_TOTP_DIGITS: &str = "totp-digits";
pub const ARG_BACKUP_CODE_COUNT: &str = "backup-code-count";
pub const ARG_BACKUP_CODE_PEPPER: &str = "backup-code-pepper";
pub const ARG_ENROLLMENT_TTL_SECONDS: &str = "enrollment-ttl-seconds";
pub const ARG_MFA_MAX_ATTEMPTS: &str = "mfa-max-attempts";
pub const ARG_MFA_ATTEMPT_WINDOW_SECONDS: &str = "mfa-attempt-window-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_totp_args(command);
    let command = with_backup_code_args(command);
    with_enrollment_args(command)
}

fn with_totp_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOTP_ISSUER)
                .long(ARG_TOTP_ISSUER)
                .help("Issuer label shown in authenticator apps")
                .env("FLEETGATE_TOTP_ISSUER")
                .default_value("fleetgate"),
        )
        .arg(
            Arg::new(ARG_TOTP_PERIOD_SECONDS)
                .long(ARG_TOTP_PERIOD_SECONDS)
                .help("TOTP time step in seconds")
                .env("FLEETGATE_TOTP_PERIOD_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_TOTP_DIGITS)
                .long(ARG_TOTP_DIGITS)
                .help("Digits per TOTP code")
                .env("FLEETGATE_TOTP_DIGITS")
                .default_value("6")
                .value_parser(clap::value_parser!(u8).range(6..=8)),
        )
}

fn with_backup_code_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BACKUP_CODE_COUNT)
                .long(ARG_BACKUP_CODE_COUNT)
                .help("Backup codes issued per TOTP enrollment")
                .env("FLEETGATE_BACKUP_CODE_COUNT")
                .default_value("10")
                .value_parser(clap::value_parser!(u8).range(1..)),
        )
        .arg(
            Arg::new(ARG_BACKUP_CODE_PEPPER)
                .long(ARG_BACKUP_CODE_PEPPER)
                .help("Server-side pepper mixed into backup code hashes")
                .env("FLEETGATE_BACKUP_CODE_PEPPER")
                .hide_env_values(true),
        )
}

fn with_enrollment_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ENROLLMENT_TTL_SECONDS)
                .long(ARG_ENROLLMENT_TTL_SECONDS)
                .help("Seconds an unfinished enrollment stays alive")
                .env("FLEETGATE_ENROLLMENT_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64).range(1..=MAX_WINDOW_SECONDS)),
        )
        .arg(
            Arg::new(ARG_MFA_MAX_ATTEMPTS)
                .long(ARG_MFA_MAX_ATTEMPTS)
                .help("Failed code attempts allowed per window")
                .env("FLEETGATE_MFA_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_MFA_ATTEMPT_WINDOW_SECONDS)
                .long(ARG_MFA_ATTEMPT_WINDOW_SECONDS)
                .help("Sliding window for failed code attempts, in seconds")
                .env("FLEETGATE_MFA_ATTEMPT_WINDOW_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64).range(1..=MAX_WINDOW_SECONDS)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub totp_issuer: String,
    pub totp_period_seconds: u64,
    pub totp_digits: u8,
    pub backup_code_count: u8,
    pub backup_code_pepper: SecretString,
    pub enrollment_ttl_seconds: u64,
    pub max_attempts: u32,
    pub attempt_window_seconds: u64,
}

impl Options {
    /// Parse MFA arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the pepper is missing or blank.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let backup_code_pepper = matches
            .get_one::<String>(ARG_BACKUP_CODE_PEPPER)
            .filter(|pepper| !pepper.trim().is_empty())
            .cloned()
            .map(SecretString::from)
            .with_context(|| format!("missing required argument: --{ARG_BACKUP_CODE_PEPPER}"))?;

        Ok(Self {
            totp_issuer: matches
                .get_one::<String>(ARG_TOTP_ISSUER)
                .cloned()
                .unwrap_or_else(|| "fleetgate".to_string()),
            totp_period_seconds: matches
                .get_one::<u64>(ARG_TOTP_PERIOD_SECONDS)
                .copied()
                .unwrap_or(30),
            totp_digits: matches.get_one::<u8>(ARG_TOTP_DIGITS).copied().unwrap_or(6),
            backup_code_count: matches
                .get_one::<u8>(ARG_BACKUP_CODE_COUNT)
                .copied()
                .unwrap_or(10),
            backup_code_pepper,
            enrollment_ttl_seconds: matches
                .get_one::<u64>(ARG_ENROLLMENT_TTL_SECONDS)
                .copied()
                .unwrap_or(600),
            max_attempts: matches
                .get_one::<u32>(ARG_MFA_MAX_ATTEMPTS)
                .copied()
                .unwrap_or(5),
            attempt_window_seconds: matches
                .get_one::<u64>(ARG_MFA_ATTEMPT_WINDOW_SECONDS)
                .copied()
                .unwrap_or(300),
        })
    }
}
