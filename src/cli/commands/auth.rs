use clap::{Arg, ArgMatches, Command};

pub const ARG_STORE_TIMEOUT_MS: &str = "store-timeout-ms";
pub const ARG_WEBAUTHN_RP_ID: &str = "webauthn-rp-id";
pub const ARG_WEBAUTHN_RP_ORIGIN: &str = "webauthn-rp-origin";
pub const ARG_ROLE_POLICY: &str = "role-policy";
pub const ARG_SEED_FILE: &str = "seed-file";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_STORE_TIMEOUT_MS)
                .long(ARG_STORE_TIMEOUT_MS)
                .help("Deadline for a single credential store call, in milliseconds")
                .env("FLEETGATE_STORE_TIMEOUT_MS")
                .default_value("2000")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_WEBAUTHN_RP_ID)
                .long(ARG_WEBAUTHN_RP_ID)
                .help("WebAuthn relying party id (defaults to the origin host)")
                .env("FLEETGATE_WEBAUTHN_RP_ID"),
        )
        .arg(
            Arg::new(ARG_WEBAUTHN_RP_ORIGIN)
                .long(ARG_WEBAUTHN_RP_ORIGIN)
                .help("Public origin the browser sees, used for WebAuthn")
                .env("FLEETGATE_WEBAUTHN_RP_ORIGIN")
                .default_value("https://fleetgate.localhost"),
        )
        .arg(
            Arg::new(ARG_ROLE_POLICY)
                .long(ARG_ROLE_POLICY)
                .help("JSON role policy file (defaults to the built-in policy)")
                .env("FLEETGATE_ROLE_POLICY"),
        )
        .arg(
            Arg::new(ARG_SEED_FILE)
                .long(ARG_SEED_FILE)
                .help("JSON file of users and session tokens loaded at start")
                .env("FLEETGATE_SEED_FILE"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub store_timeout_ms: u64,
    pub webauthn_rp_id: Option<String>,
    pub webauthn_rp_origin: String,
    pub role_policy: Option<String>,
    pub seed_file: Option<String>,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let optional = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            store_timeout_ms: matches
                .get_one::<u64>(ARG_STORE_TIMEOUT_MS)
                .copied()
                .unwrap_or(2000),
            webauthn_rp_id: optional(ARG_WEBAUTHN_RP_ID),
            webauthn_rp_origin: optional(ARG_WEBAUTHN_RP_ORIGIN)
                .unwrap_or_else(|| "https://fleetgate.localhost".to_string()),
            role_policy: optional(ARG_ROLE_POLICY),
            seed_file: optional(ARG_SEED_FILE),
        }
    }
}
