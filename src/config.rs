//! Server configuration, read from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `HOST` | `127.0.0.1` |
//! | `PORT` | `3000` |
//! | `DEV_MODE` | `false` |
//! | `NEXUS_DATABASE_PATH` | `./nexus.db` |
//! | `JWT_SECRET` | required unless `DEV_MODE` |
//! | `JWT_TTL_DAYS` | `30` (at most 3650) |
//! | `NEXUS_ADMIN_EMAIL` / `NEXUS_ADMIN_PASSWORD` | unset |
//! | `NEXUS_AUDIT_PERMISSION_CHECKS` | `false` |

use std::path::PathBuf;

use anyhow::{bail, Context};

/// Upper bound on `JWT_TTL_DAYS`, ten years.
pub const MAX_JWT_TTL_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub jwt_ttl_days: i64,
}

impl AuthConfig {
    pub fn auth_required(&self, dev_mode: bool) -> bool {
        !dev_mode || self.jwt_secret.is_some()
    }
}

/// Credentials for the super admin created on first start.
#[derive(Clone)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for BootstrapAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapAdmin")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    pub database_path: PathBuf,
    pub auth: AuthConfig,
    pub bootstrap_admin: Option<BootstrapAdmin>,
    /// Record every resource permission decision in the activity log.
    pub audit_permission_checks: bool,
}

fn parse_bool(key: &str, value: Option<String>) -> anyhow::Result<bool> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "" | "0" | "false" | "no" | "off" => Ok(false),
            "1" | "true" | "yes" | "on" => Ok(true),
            other => bail!("{} must be a boolean, got '{}'", key, other),
        },
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let dev_mode = parse_bool("DEV_MODE", var("DEV_MODE"))?;
        let host = non_empty("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = match non_empty("PORT") {
            Some(p) => p.parse::<u16>().with_context(|| format!("invalid PORT '{}'", p))?,
            None => 3000,
        };
        let database_path = non_empty("NEXUS_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./nexus.db"));

        let jwt_secret = non_empty("JWT_SECRET");
        if jwt_secret.is_none() && !dev_mode {
            bail!("JWT_SECRET must be set when DEV_MODE is off");
        }
        let jwt_ttl_days = match non_empty("JWT_TTL_DAYS") {
            Some(d) => d
                .parse::<i64>()
                .with_context(|| format!("invalid JWT_TTL_DAYS '{}'", d))?,
            None => 30,
        };
        if !(1..=MAX_JWT_TTL_DAYS).contains(&jwt_ttl_days) {
            bail!("JWT_TTL_DAYS must be between 1 and {}", MAX_JWT_TTL_DAYS);
        }

        let bootstrap_admin = match (non_empty("NEXUS_ADMIN_EMAIL"), var("NEXUS_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) if !password.is_empty() => Some(BootstrapAdmin { email, password }),
            (Some(_), _) => bail!("NEXUS_ADMIN_PASSWORD must be set together with NEXUS_ADMIN_EMAIL"),
            (None, _) => None,
        };

        let audit_permission_checks = parse_bool(
            "NEXUS_AUDIT_PERMISSION_CHECKS",
            var("NEXUS_AUDIT_PERMISSION_CHECKS"),
        )?;

        Ok(Self {
            host,
            port,
            dev_mode,
            database_path,
            auth: AuthConfig {
                jwt_secret,
                jwt_ttl_days,
            },
            bootstrap_admin,
            audit_permission_checks,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        dev_mode: false,
        database_path: PathBuf::from(":memory:"),
        auth: AuthConfig {
            jwt_secret: Some("test-secret".to_string()),
            jwt_ttl_days: 1,
        },
        bootstrap_admin: None,
        audit_permission_checks: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert!(!config.dev_mode);
        assert_eq!(config.database_path, PathBuf::from("./nexus.db"));
        assert_eq!(config.auth.jwt_ttl_days, 30);
        assert!(config.bootstrap_admin.is_none());
        assert!(!config.audit_permission_checks);
    }

    #[test]
    fn test_secret_required_outside_dev_mode() {
        assert!(config_from(&[]).is_err());
        let dev = config_from(&[("DEV_MODE", "true")]).unwrap();
        assert!(dev.dev_mode);
        assert!(!dev.auth.auth_required(dev.dev_mode));
    }

    #[test]
    fn test_invalid_values_fail() {
        assert!(config_from(&[("JWT_SECRET", "s"), ("PORT", "http")]).is_err());
        assert!(config_from(&[("JWT_SECRET", "s"), ("JWT_TTL_DAYS", "0")]).is_err());
        assert!(config_from(&[("JWT_SECRET", "s"), ("DEV_MODE", "maybe")]).is_err());
        assert!(config_from(&[("JWT_SECRET", "s"), ("JWT_TTL_DAYS", "1000000000000000")]).is_err());
        assert!(config_from(&[("JWT_SECRET", "s"), ("NEXUS_ADMIN_EMAIL", "root@nexus.local")]).is_err());
    }

    #[test]
    fn test_ttl_upper_bound() {
        let config = config_from(&[("JWT_SECRET", "s"), ("JWT_TTL_DAYS", "3650")]).unwrap();
        assert_eq!(config.auth.jwt_ttl_days, MAX_JWT_TTL_DAYS);
        let err = config_from(&[("JWT_SECRET", "s"), ("JWT_TTL_DAYS", "3651")]).unwrap_err();
        assert_eq!(err.to_string(), "JWT_TTL_DAYS must be between 1 and 3650");
    }

    #[test]
    fn test_bootstrap_admin_and_audit() {
        let config = config_from(&[
            ("JWT_SECRET", "s"),
            ("NEXUS_ADMIN_EMAIL", "root@nexus.local"),
            ("NEXUS_ADMIN_PASSWORD", "correct horse"),
            ("NEXUS_AUDIT_PERMISSION_CHECKS", "1"),
        ])
        .unwrap();
        let admin = config.bootstrap_admin.unwrap();
        assert_eq!(admin.email, "root@nexus.local");
        assert!(!format!("{:?}", admin).contains("correct horse"));
        assert!(config.audit_permission_checks);
    }
}
