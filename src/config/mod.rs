use std::env;

use thiserror::Error;

/// Minimum length for either signing secret.
const MIN_SECRET_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Process configuration, loaded once at startup.
///
/// Every value is validated here so a misconfigured node fails before it
/// binds a port or touches the database.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// Optional read replica. When absent, reads fall back to the primary.
    pub database_replica_url: Option<String>,
    pub redis_url: String,
    pub storage_endpoint: String,
    pub storage_access_key: String,
    pub storage_secret_key: String,
    pub access_token_secret: String,
    pub refresh_token_secret: String,
    pub frontend_origin: String,
    pub port: u16,
    pub log_level: String,
    /// Seconds to wait after a user's last socket drops before publishing
    /// `offline`, absorbing quick reconnects.
    pub offline_grace_secs: u64,
    /// Delivery worker count. Defaults to the CPU count.
    pub delivery_workers: usize,
    pub is_dev: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let access_token_secret = require("ACCESS_TOKEN_SECRET")?;
        let refresh_token_secret = require("REFRESH_TOKEN_SECRET")?;

        if access_token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                name: "ACCESS_TOKEN_SECRET",
                reason: format!("must be at least {MIN_SECRET_LEN} characters"),
            });
        }
        if refresh_token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid {
                name: "REFRESH_TOKEN_SECRET",
                reason: format!("must be at least {MIN_SECRET_LEN} characters"),
            });
        }
        // Reusing one secret for both token kinds would let a refresh token
        // pass access-token verification.
        if access_token_secret == refresh_token_secret {
            return Err(ConfigError::Invalid {
                name: "REFRESH_TOKEN_SECRET",
                reason: "must differ from ACCESS_TOKEN_SECRET".into(),
            });
        }

        let port: u16 = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                reason: format!("{raw:?} is not a valid port number"),
            })?,
            Err(_) => 8080,
        };

        let offline_grace_secs: u64 = match env::var("OFFLINE_GRACE_SECS") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "OFFLINE_GRACE_SECS",
                reason: format!("{raw:?} is not a valid number of seconds"),
            })?,
            Err(_) => 30,
        };

        let delivery_workers: usize = match env::var("DELIVERY_WORKERS") {
            Ok(raw) => match raw.parse() {
                Ok(n) if n >= 1 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "DELIVERY_WORKERS",
                        reason: format!("{raw:?} is not a positive integer"),
                    })
                }
            },
            Err(_) => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        };

        Ok(Config {
            database_url: require("DATABASE_URL")?,
            database_replica_url: env::var("DATABASE_REPLICA_URL").ok(),
            redis_url: require("REDIS_URL")?,
            storage_endpoint: require("STORAGE_ENDPOINT")?,
            storage_access_key: require("STORAGE_ACCESS_KEY")?,
            storage_secret_key: require("STORAGE_SECRET_KEY")?,
            access_token_secret,
            refresh_token_secret,
            frontend_origin: require("FRONTEND_ORIGIN")?,
            port,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            offline_grace_secs,
            delivery_workers,
            is_dev: env::var("APP_ENV").as_deref() != Ok("production"),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "DATABASE_REPLICA_URL",
        "REDIS_URL",
        "STORAGE_ENDPOINT",
        "STORAGE_ACCESS_KEY",
        "STORAGE_SECRET_KEY",
        "ACCESS_TOKEN_SECRET",
        "REFRESH_TOKEN_SECRET",
        "FRONTEND_ORIGIN",
        "PORT",
        "LOG_LEVEL",
        "OFFLINE_GRACE_SECS",
        "DELIVERY_WORKERS",
        "APP_ENV",
    ];

    fn set_valid_env() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/messenger");
        std::env::set_var("REDIS_URL", "redis://localhost:6379");
        std::env::set_var("STORAGE_ENDPOINT", "http://localhost:9000");
        std::env::set_var("STORAGE_ACCESS_KEY", "minio");
        std::env::set_var("STORAGE_SECRET_KEY", "minio-secret");
        std::env::set_var(
            "ACCESS_TOKEN_SECRET",
            "access-secret-at-least-32-chars-long!!",
        );
        std::env::set_var(
            "REFRESH_TOKEN_SECRET",
            "refresh-secret-at-least-32-chars-long!",
        );
        std::env::set_var("FRONTEND_ORIGIN", "http://localhost:5173");
    }

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn from_env_happy_path() {
        clear_env();
        set_valid_env();

        let config = Config::from_env().expect("valid environment should load");
        assert_eq!(config.port, 8080, "port defaults to 8080");
        assert_eq!(config.offline_grace_secs, 30, "grace window defaults to 30s");
        assert!(config.database_replica_url.is_none());
        assert!(config.is_dev);

        clear_env();
    }

    #[test]
    #[serial]
    fn missing_database_url_fails() {
        clear_env();
        set_valid_env();
        std::env::remove_var("DATABASE_URL");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn short_secret_fails() {
        clear_env();
        set_valid_env();
        std::env::set_var("ACCESS_TOKEN_SECRET", "too-short");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "ACCESS_TOKEN_SECRET",
                ..
            })
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn identical_secrets_fail() {
        clear_env();
        set_valid_env();
        let secret = "shared-secret-at-least-32-chars-long!!";
        std::env::set_var("ACCESS_TOKEN_SECRET", secret);
        std::env::set_var("REFRESH_TOKEN_SECRET", secret);

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "REFRESH_TOKEN_SECRET",
                ..
            })
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        set_valid_env();
        std::env::set_var("PORT", "not-a-port");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "PORT", .. })
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn replica_url_is_picked_up() {
        clear_env();
        set_valid_env();
        std::env::set_var(
            "DATABASE_REPLICA_URL",
            "postgresql://replica.local/messenger",
        );

        let config = Config::from_env().expect("valid environment should load");
        assert_eq!(
            config.database_replica_url.as_deref(),
            Some("postgresql://replica.local/messenger")
        );

        clear_env();
    }
}
