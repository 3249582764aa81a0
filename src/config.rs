//! Configuration: the exact positional CLI contract from the spec, plus
//! the rate-reload file read on SIGHUP.
//!
//! The positional contract (`server <root> <port> <rate>`) is part of the
//! external interface (ss6) and is not this crate's to redesign, so unlike
//! the teacher's flag-based `CliArgs`, these three fields are positional
//! `clap` arguments. Validation mirrors `analyse_arguments` in the
//! original `server.c`: reject on argument-count mismatch, on overflow,
//! on non-numeric trailing characters, and on a non-existent root.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

/// Cap on the root path length (matches the original's `ROOT_LEN`).
const ROOT_MAX: usize = 4096;
/// Cap on the port field's textual width (matches `PORT_LEN`); allows up
/// to 5 digits, enough for any `u16`.
const PORT_MAX: usize = 6;
/// Cap on the rate field's textual width.
const RATE_MAX: usize = 20;

/// Name of the TOML file consulted on SIGHUP, relative to the server root.
pub const RELOAD_FILE_NAME: &str = ".server.toml";

/// Fixed, well-known path for the worker-pool control channel.
pub const DEFAULT_CONTROL_SOCKET_PATH: &str = "/tmp/filecast-control.sock";

#[derive(Parser, Debug)]
#[command(name = "filecast")]
#[command(about = "Concurrent HTTP/1.0 and HTTP/1.1 file server", long_about = None)]
struct CliArgs {
    /// Directory to serve files from.
    root: String,
    /// TCP port to listen on.
    port: String,
    /// Per-connection byte allowance per one-second burst.
    rate: String,
    /// Override for the worker-pool control socket path, mainly so tests
    /// can run more than one server without colliding on the default.
    control_socket: Option<String>,
}

/// Resolved, validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub port: u16,
    pub rate: u64,
    pub control_socket_path: PathBuf,
}

impl Config {
    /// Parses and validates `server <root> <port> <rate>` from the
    /// process's actual argv.
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    /// Parses and validates from an explicit argv-like slice (`argv[0]` is
    /// the program name, matching the C convention `analyse_arguments`
    /// assumes).
    pub fn from_args(argv: &[String]) -> Result<Self, ConfigError> {
        if argv.len() != 4 {
            return Err(ConfigError::Usage);
        }

        // clap still does the tokenizing/help-text work the teacher's CLI
        // layer leans on; we just feed it the already-arity-checked argv.
        let cli = CliArgs::try_parse_from(argv).map_err(|_| ConfigError::Usage)?;

        let root = Self::validate_root(&cli.root)?;
        let port = Self::validate_port(&cli.port)?;
        let rate = Self::validate_rate(&cli.rate)?;

        Ok(Config {
            root,
            port,
            rate,
            control_socket_path: PathBuf::from(DEFAULT_CONTROL_SOCKET_PATH),
        })
    }

    fn validate_root(raw: &str) -> Result<PathBuf, ConfigError> {
        if raw.len() >= ROOT_MAX {
            return Err(ConfigError::Usage);
        }
        let path = PathBuf::from(raw);
        if !path.exists() {
            return Err(ConfigError::Usage);
        }
        Ok(path)
    }

    fn validate_port(raw: &str) -> Result<u16, ConfigError> {
        if raw.len() >= PORT_MAX || raw.is_empty() {
            return Err(ConfigError::Usage);
        }
        raw.parse::<u16>().map_err(|_| ConfigError::Usage)
    }

    fn validate_rate(raw: &str) -> Result<u64, ConfigError> {
        if raw.len() >= RATE_MAX || raw.is_empty() {
            return Err(ConfigError::Usage);
        }
        raw.parse::<u64>().map_err(|_| ConfigError::Usage)
    }

    /// Path of the reload file consulted on SIGHUP.
    pub fn reload_path(&self) -> PathBuf {
        self.root.join(RELOAD_FILE_NAME)
    }
}

/// Errors from CLI parsing/validation.
#[derive(Debug)]
pub enum ConfigError {
    /// Argument count, numeric overflow, or non-existent root: any of
    /// these produce the same non-zero-exit usage message per ss6.
    Usage,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Usage => write!(f, "usage: filecast <root> <port> <rate>"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The single field a config-file reload is allowed to change.
#[derive(Debug, Deserialize)]
struct ReloadFile {
    rate: u64,
}

/// Reads the reload file and returns the new rate, invoked on SIGHUP.
pub fn read_reload_rate(path: &Path) -> Result<u64, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|_| ConfigError::Usage)?;
    let parsed: ReloadFile = toml::from_str(&contents).map_err(|_| ConfigError::Usage)?;
    Ok(parsed.rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(root: &str, port: &str, rate: &str) -> Vec<String> {
        vec![
            "filecast".to_string(),
            root.to_string(),
            port.to_string(),
            rate.to_string(),
        ]
    }

    #[test]
    fn rejects_wrong_argument_count() {
        let err = Config::from_args(&["filecast".to_string()]);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_nonexistent_root() {
        let err = Config::from_args(&argv("/no/such/path/at/all", "8080", "1024"));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_args(&argv(dir.path().to_str().unwrap(), "80a0", "1024"));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_overlong_rate_field() {
        let dir = tempfile::tempdir().unwrap();
        let huge = "9".repeat(RATE_MAX);
        let err = Config::from_args(&argv(dir.path().to_str().unwrap(), "8080", &huge));
        assert!(err.is_err());
    }

    #[test]
    fn accepts_valid_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            Config::from_args(&argv(dir.path().to_str().unwrap(), "8080", "1024")).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate, 1024);
    }

    #[test]
    fn reload_file_supplies_new_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RELOAD_FILE_NAME);
        std::fs::write(&path, "rate = 4096\n").unwrap();
        assert_eq!(read_reload_rate(&path).unwrap(), 4096);
    }
}
