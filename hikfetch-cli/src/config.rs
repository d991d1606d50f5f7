use std::path::{Path, PathBuf};
use std::time::Duration;

use hikfetch_engine::{Credentials, EngineConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cli::Args;
use crate::error::{AppError, Result};

/// Settings read from `config.toml`. Command-line flags take precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Archive root; every device gets its own directory inside it
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated while a recording streams
    pub read_timeout_secs: u64,
    pub retries: u32,
    pub page_size: u32,
    pub delay_between_files_secs: u64,
    pub accept_invalid_certs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            output_dir: PathBuf::from("./media"),
            log_dir: PathBuf::from("./logs"),
            request_timeout_secs: engine.request_timeout.as_secs(),
            connect_timeout_secs: engine.connect_timeout.as_secs(),
            read_timeout_secs: engine.read_timeout.as_secs(),
            retries: engine.retry.max_retries,
            page_size: engine.page_size,
            delay_between_files_secs: engine.delay_between_files.as_secs(),
            accept_invalid_certs: engine.danger_accept_invalid_certs,
        }
    }
}

impl AppConfig {
    /// `<config dir>/hikfetch/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hikfetch").join("config.toml"))
    }

    /// Load from `path`, or from [`Self::default_path`] when none is given.
    ///
    /// A missing default file yields the defaults. An explicitly named file
    /// must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                debug!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(AppError::Config {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        Self::parse(&text).map_err(|reason| AppError::Config {
            path: path.display().to_string(),
            reason,
        })
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Let command-line flags override file values.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(dir) = &args.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(dir) = &args.log_dir {
            self.log_dir = dir.clone();
        }
        if let Some(timeout) = args.timeout {
            self.request_timeout_secs = timeout;
        }
        if let Some(retries) = args.retries {
            self.retries = retries;
        }
    }

    /// Engine settings for these values. Zero request or read timeouts are
    /// rejected, they would fail every request at once.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        for (key, secs) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("read_timeout_secs", self.read_timeout_secs),
        ] {
            if secs == 0 {
                return Err(AppError::InvalidInput(format!(
                    "{key} must be at least 1 second"
                )));
            }
        }

        let defaults = EngineConfig::default();
        Ok(EngineConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            page_size: self.page_size.max(1),
            retry: RetryPolicy::default().with_max_retries(self.retries),
            delay_between_files: Duration::from_secs(self.delay_between_files_secs),
            danger_accept_invalid_certs: self.accept_invalid_certs,
            ..defaults
        })
    }
}

/// Credentials from `HIK_USERNAME` and `HIK_PASSWORD`, after any `.env`
/// file has been loaded into the environment.
pub fn credentials() -> Result<Credentials> {
    credentials_from(|key| std::env::var(key).ok())
}

fn credentials_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Credentials> {
    let username = lookup("HIK_USERNAME")
        .filter(|u| !u.is_empty())
        .ok_or(AppError::MissingCredentials("HIK_USERNAME"))?;
    let password = lookup("HIK_PASSWORD").ok_or(AppError::MissingCredentials("HIK_PASSWORD"))?;
    Ok(Credentials::new(username, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["hikfetch", "nvr", "2024-11-25", "08:00", "2024-11-25", "18:00"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = AppConfig::parse(
            r#"
output_dir = "/srv/cctv"
retries = 5
"#,
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/srv/cctv"));
        assert_eq!(config.retries, 5);
        assert_eq!(config.log_dir, PathBuf::from("./logs"));
        assert_eq!(config.page_size, 50);
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(AppConfig::parse("retries = \"many\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "read_timeout_secs = 90\naccept_invalid_certs = true\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.read_timeout_secs, 90);
        assert!(config.accept_invalid_certs);
    }

    #[test]
    fn flags_override_file_values() {
        let mut config = AppConfig::default();
        config.apply_args(&args(&["-o", "/tmp/out", "--timeout", "5", "--retries", "0"]));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.request_timeout, Duration::from_secs(5));
        assert_eq!(engine.retry.attempts(), 1);
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut config = AppConfig::default();
        config.apply_args(&args(&["--timeout", "0"]));
        assert!(matches!(
            config.engine_config(),
            Err(AppError::InvalidInput(msg)) if msg.contains("request_timeout_secs")
        ));

        let config = AppConfig::parse("read_timeout_secs = 0").unwrap();
        assert!(matches!(
            config.engine_config(),
            Err(AppError::InvalidInput(msg)) if msg.contains("read_timeout_secs")
        ));

        assert!(AppConfig::default().engine_config().is_ok());
    }

    #[test]
    fn credentials_come_from_the_environment() {
        let env = |user: Option<&'static str>| {
            move |key: &str| match key {
                "HIK_USERNAME" => user.map(str::to_string),
                "HIK_PASSWORD" => Some("secret".to_string()),
                _ => None,
            }
        };
        assert_eq!(
            credentials_from(env(Some("admin"))).unwrap().username(),
            "admin"
        );
        assert!(matches!(
            credentials_from(env(None)),
            Err(AppError::MissingCredentials("HIK_USERNAME"))
        ));
        assert!(matches!(
            credentials_from(env(Some(""))),
            Err(AppError::MissingCredentials("HIK_USERNAME"))
        ));
        assert!(matches!(
            credentials_from(|_| None),
            Err(AppError::MissingCredentials("HIK_USERNAME"))
        ));
    }

    #[test]
    fn credentials_are_not_command_line_flags() {
        let argv = ["hikfetch", "nvr", "2024-11-25", "08:00", "2024-11-25", "18:00"];
        for flag in ["--username", "--password"] {
            let mut argv = argv.to_vec();
            argv.extend([flag, "admin"]);
            assert!(Args::try_parse_from(argv).is_err());
        }
    }
}
