//! Environment-backed configuration for `roomsync-smoke`.

use std::{env, error::Error, fmt};

use roomsync_core::{RuntimeConfig, Session};

const DEFAULT_SYNC_ROUNDS: u32 = 3;

/// How the smoke run authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    AccessToken(String),
    Password { user: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessToken(_) => f.write_str("AccessToken(<redacted>)"),
            Self::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    pub homeserver: String,
    pub credentials: Credentials,
    /// Sync rounds to fold before stopping.
    pub sync_rounds: u32,
    /// Bounded retry budget; `None` keeps the runtime default.
    pub retry_limit: Option<u32>,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let homeserver = optional_trimmed_env("ROOMSYNC_HOMESERVER", &mut lookup)
            .ok_or(ConfigError::Missing {
                key: "ROOMSYNC_HOMESERVER",
            })?;

        let credentials = match optional_trimmed_env("ROOMSYNC_ACCESS_TOKEN", &mut lookup) {
            Some(token) => Credentials::AccessToken(token),
            None => {
                let user = optional_trimmed_env("ROOMSYNC_USER", &mut lookup)
                    .ok_or(ConfigError::Missing { key: "ROOMSYNC_USER" })?;
                let password = lookup("ROOMSYNC_PASSWORD")
                    .filter(|value| !value.is_empty())
                    .ok_or(ConfigError::Missing {
                        key: "ROOMSYNC_PASSWORD",
                    })?;
                Credentials::Password { user, password }
            }
        };

        let sync_rounds =
            parse_optional_u32("ROOMSYNC_SYNC_ROUNDS", &mut lookup)?.unwrap_or(DEFAULT_SYNC_ROUNDS);
        if sync_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROOMSYNC_SYNC_ROUNDS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let retry_limit = parse_optional_u32("ROOMSYNC_RETRY_LIMIT", &mut lookup)?;

        Ok(Self {
            homeserver,
            credentials,
            sync_rounds,
            retry_limit,
        })
    }

    /// Fresh session for the configured homeserver and credentials.
    pub fn session(&self) -> Session {
        match &self.credentials {
            Credentials::AccessToken(token) => {
                Session::with_access_token(self.homeserver.clone(), token.clone())
            }
            Credentials::Password { user, password } => {
                Session::with_password(self.homeserver.clone(), user.clone(), password.clone())
            }
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let defaults = RuntimeConfig::default();
        RuntimeConfig {
            retry_limit: self.retry_limit.unwrap_or(defaults.retry_limit),
            ..defaults
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    /// A required environment variable is unset or empty.
    Missing { key: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
            Self::Missing { key } => write!(f, "{key} must be set"),
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u32<F>(key: &'static str, lookup: &mut F) -> Result<Option<u32>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn access_token_wins_over_password() {
        let cfg = config_from_pairs(&[
            ("ROOMSYNC_HOMESERVER", " https://matrix.example.org "),
            ("ROOMSYNC_ACCESS_TOKEN", "tok"),
            ("ROOMSYNC_USER", "alice"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.homeserver, "https://matrix.example.org");
        assert_eq!(cfg.credentials, Credentials::AccessToken("tok".into()));
        assert_eq!(cfg.sync_rounds, DEFAULT_SYNC_ROUNDS);
        assert_eq!(cfg.runtime_config(), RuntimeConfig::default());
    }

    #[test]
    fn password_login_needs_both_fields() {
        let err = config_from_pairs(&[
            ("ROOMSYNC_HOMESERVER", "https://matrix.example.org"),
            ("ROOMSYNC_USER", "alice"),
        ])
        .expect_err("password missing");

        assert_eq!(
            err,
            ConfigError::Missing {
                key: "ROOMSYNC_PASSWORD"
            }
        );
    }

    #[test]
    fn homeserver_is_required() {
        let err = config_from_pairs(&[("ROOMSYNC_ACCESS_TOKEN", "tok")]).expect_err("no homeserver");
        assert_eq!(err.to_string(), "ROOMSYNC_HOMESERVER must be set");
    }

    #[test]
    fn parses_tuning_values() {
        let cfg = config_from_pairs(&[
            ("ROOMSYNC_HOMESERVER", "https://matrix.example.org"),
            ("ROOMSYNC_USER", "alice"),
            ("ROOMSYNC_PASSWORD", "secret"),
            ("ROOMSYNC_SYNC_ROUNDS", "5"),
            ("ROOMSYNC_RETRY_LIMIT", "0"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.sync_rounds, 5);
        assert_eq!(cfg.runtime_config().retry_limit, 0);
        assert!(cfg.session().context().access_token().is_err());
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let base = [
            ("ROOMSYNC_HOMESERVER", "https://matrix.example.org"),
            ("ROOMSYNC_ACCESS_TOKEN", "tok"),
        ];
        let err = config_from_pairs(&[base[0], base[1], ("ROOMSYNC_SYNC_ROUNDS", "abc")])
            .expect_err("invalid rounds value should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "ROOMSYNC_SYNC_ROUNDS",
                ..
            }
        ));

        let err = config_from_pairs(&[base[0], base[1], ("ROOMSYNC_SYNC_ROUNDS", "0")])
            .expect_err("zero rounds should fail");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let cfg = config_from_pairs(&[
            ("ROOMSYNC_HOMESERVER", "https://matrix.example.org"),
            ("ROOMSYNC_USER", "alice"),
            ("ROOMSYNC_PASSWORD", "hunter2"),
        ])
        .expect("config should parse");

        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
