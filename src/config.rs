//! Configuration for the echo daemon.
//!
//! Two layers:
//! - `CliArgs`: command-line options, read once at startup.
//! - `ServiceConfig`: the `Key=Value` configuration file, re-read on SIGHUP.

use clap::Parser;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/systemd-echo.conf";

/// Well-known echo port (RFC 862).
pub const ECHO_PORT: u16 = 7;

/// Listen backlog used when the file does not set one.
pub const DEFAULT_BACKLOG: i32 = 10;

/// Command-line arguments for the echo daemon
#[derive(Parser, Debug)]
#[command(name = "systemd-echo")]
#[command(author = "systemd-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "An echo server for systemd", long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Address to bind when no socket is inherited, and to validate
    /// inherited sockets against (port 0 accepts any port)
    #[arg(short = 'l', long, default_value_t = default_listen())]
    pub listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv6Addr::UNSPECIFIED, ECHO_PORT))
}

/// Settings loaded from the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Backlog passed to `listen(2)` for the stream socket.
    pub backlog: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl ServiceConfig {
    /// Read and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        Self::parse(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Parse `Key=Value` lines. Blank lines are skipped; `Backlog` is the
    /// only key and must be a positive integer.
    pub fn parse(contents: &str) -> Result<Self, ParseError> {
        let mut config = Self::default();

        for (idx, raw) in contents.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or(ParseError::MissingSeparator { line: line_no })?;

            match key.trim_end() {
                "Backlog" => {
                    let value = value.trim_start();
                    config.backlog = match value.parse::<i32>() {
                        Ok(n) if n > 0 => n,
                        _ => {
                            return Err(ParseError::InvalidBacklog {
                                line: line_no,
                                value: value.to_string(),
                            })
                        }
                    };
                }
                other => {
                    return Err(ParseError::UnknownKey {
                        line: line_no,
                        key: other.to_string(),
                    })
                }
            }
        }

        Ok(config)
    }
}

/// Problems with the contents of a configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    MissingSeparator { line: usize },
    UnknownKey { line: usize, key: String },
    InvalidBacklog { line: usize, value: String },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::MissingSeparator { line } => {
                write!(f, "line {line}: expected Key=Value")
            }
            ParseError::UnknownKey { line, key } => {
                write!(f, "line {line}: unknown key '{key}'")
            }
            ParseError::InvalidBacklog { line, value } => {
                write!(f, "line {line}: Backlog must be a positive integer, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    Parse(PathBuf, ParseError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::Parse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead(_, e) => Some(e),
            ConfigError::Parse(_, e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        assert_eq!(ServiceConfig::default().backlog, 10);
        assert_eq!(ServiceConfig::parse("").unwrap(), ServiceConfig::default());
    }

    #[test]
    fn test_parse_backlog() {
        let config = ServiceConfig::parse("\n  Backlog = 128  \n\n").unwrap();
        assert_eq!(config.backlog, 128);
    }

    #[test]
    fn test_last_backlog_wins() {
        let config = ServiceConfig::parse("Backlog=1\nBacklog=2\n").unwrap();
        assert_eq!(config.backlog, 2);
    }

    #[test]
    fn test_rejects_non_positive_backlog() {
        assert_eq!(
            ServiceConfig::parse("Backlog=0"),
            Err(ParseError::InvalidBacklog {
                line: 1,
                value: "0".to_string()
            })
        );
        assert!(ServiceConfig::parse("Backlog=-4").is_err());
        assert!(ServiceConfig::parse("Backlog=ten").is_err());
        assert!(ServiceConfig::parse("Backlog=").is_err());
    }

    #[test]
    fn test_rejects_unknown_content() {
        assert_eq!(
            ServiceConfig::parse("Backlog=5\nPort=7"),
            Err(ParseError::UnknownKey {
                line: 2,
                key: "Port".to_string()
            })
        );
        assert_eq!(
            ServiceConfig::parse("Backlog"),
            Err(ParseError::MissingSeparator { line: 1 })
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServiceConfig::load(Path::new("/nonexistent/systemd-echo.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }

    #[test]
    fn test_cli_defaults() {
        let cli = CliArgs::parse_from(["systemd-echo"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.listen, "[::]:7".parse::<SocketAddr>().unwrap());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_cli_rejects_positional_arguments() {
        assert!(CliArgs::try_parse_from(["systemd-echo", "extra"]).is_err());
    }
}
