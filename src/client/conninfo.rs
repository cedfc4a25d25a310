//! libpq-style connection descriptor parsing.
//!
//! A descriptor is a whitespace-separated list of `key=value` pairs; values
//! may be single-quoted with `\` escapes (`host=/tmp password='p w'`). Keys
//! absent from the descriptor fall back to the usual `PG*` environment
//! variables, then to built-in defaults, so an empty descriptor is a valid
//! "connect to the local server as myself" request.

use snafu::prelude::*;
use tracing::warn;

use crate::error::{ClientError, DescriptorSnafu};

/// Resolved connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl ConnParams {
    /// Parse a descriptor, resolving unset keys from the environment.
    pub fn parse(descriptor: &str) -> Result<Self, ClientError> {
        Self::parse_with_env(descriptor, |key| std::env::var(key).ok())
    }

    /// Parse with an injectable environment lookup.
    fn parse_with_env(
        descriptor: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ClientError> {
        let mut host = None;
        let mut port = None;
        let mut user = None;
        let mut password = None;
        let mut database = None;

        for (key, value) in scan_pairs(descriptor)? {
            match key.as_str() {
                "host" | "hostaddr" => host = Some(value),
                "port" => port = Some(value),
                "user" => user = Some(value),
                "password" => password = Some(value),
                "dbname" => database = Some(value),
                _ => warn!(key = %key, "Ignoring unsupported connection option"),
            }
        }

        let port = port
            .or_else(|| env("PGPORT"))
            .map(|p| {
                p.parse::<u16>().ok().context(DescriptorSnafu {
                    message: format!("invalid port {p:?}"),
                })
            })
            .transpose()?
            .unwrap_or(5432);

        let user = user
            .or_else(|| env("PGUSER"))
            .or_else(|| env("USER"))
            .unwrap_or_else(|| "postgres".to_string());

        Ok(Self {
            host: host
                .or_else(|| env("PGHOST"))
                .unwrap_or_else(|| "localhost".to_string()),
            port,
            password: password.or_else(|| env("PGPASSWORD")),
            database: database
                .or_else(|| env("PGDATABASE"))
                .unwrap_or_else(|| user.clone()),
            user,
        })
    }
}

/// Split a descriptor into `(key, value)` pairs.
fn scan_pairs(descriptor: &str) -> Result<Vec<(String, String)>, ClientError> {
    let mut pairs = Vec::new();
    let mut chars = descriptor.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Ok(pairs);
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) if c.is_whitespace() => {
                    return DescriptorSnafu {
                        message: format!("missing \"=\" after {key:?}"),
                    }
                    .fail()
                }
                Some(c) => key.push(c),
                None => {
                    return DescriptorSnafu {
                        message: format!("missing \"=\" after {key:?}"),
                    }
                    .fail()
                }
            }
        }

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => {
                            return DescriptorSnafu {
                                message: "unterminated escape in quoted value".to_string(),
                            }
                            .fail()
                        }
                    },
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => {
                        return DescriptorSnafu {
                            message: "unterminated quoted value".to_string(),
                        }
                        .fail()
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }

        pairs.push((key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_full_descriptor() {
        let params = ConnParams::parse_with_env(
            "host=db.internal port=5433 user=feeder password=sekret dbname=metrics",
            no_env,
        )
        .unwrap();

        assert_eq!(
            params,
            ConnParams {
                host: "db.internal".into(),
                port: 5433,
                user: "feeder".into(),
                password: Some("sekret".into()),
                database: "metrics".into(),
            }
        );
    }

    #[test]
    fn test_empty_descriptor_uses_defaults() {
        let params = ConnParams::parse_with_env("", no_env).unwrap();

        assert_eq!(params.host, "localhost");
        assert_eq!(params.port, 5432);
        assert_eq!(params.user, "postgres");
        assert_eq!(params.database, "postgres");
        assert!(params.password.is_none());
    }

    #[test]
    fn test_environment_fallbacks() {
        let env = |key: &str| match key {
            "PGHOST" => Some("env-host".to_string()),
            "PGPORT" => Some("5444".to_string()),
            "PGUSER" => Some("env-user".to_string()),
            "PGPASSWORD" => Some("env-pass".to_string()),
            _ => None,
        };
        let params = ConnParams::parse_with_env("", env).unwrap();

        assert_eq!(params.host, "env-host");
        assert_eq!(params.port, 5444);
        assert_eq!(params.user, "env-user");
        assert_eq!(params.password.as_deref(), Some("env-pass"));
        // dbname defaults to the user when PGDATABASE is unset.
        assert_eq!(params.database, "env-user");
    }

    #[test]
    fn test_descriptor_overrides_environment() {
        let env = |key: &str| (key == "PGHOST").then(|| "env-host".to_string());
        let params = ConnParams::parse_with_env("host=cli-host", env).unwrap();
        assert_eq!(params.host, "cli-host");
    }

    #[test]
    fn test_quoted_values() {
        let params =
            ConnParams::parse_with_env(r"host=/var/run/postgresql password='p \'w\' d'", no_env)
                .unwrap();
        assert_eq!(params.host, "/var/run/postgresql");
        assert_eq!(params.password.as_deref(), Some("p 'w' d"));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let params =
            ConnParams::parse_with_env("host=h application_name=feeder sslmode=disable", no_env)
                .unwrap();
        assert_eq!(params.host, "h");
    }

    #[test]
    fn test_malformed_descriptors() {
        assert!(ConnParams::parse_with_env("host", no_env).is_err());
        assert!(ConnParams::parse_with_env("password='unterminated", no_env).is_err());
        assert!(ConnParams::parse_with_env("port=not-a-number", no_env).is_err());
    }
}
