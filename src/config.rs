//! Configuration module for the line search server.
//!
//! Supports command-line arguments and a configuration file, shared by the
//! server and the `query` subcommand. The file is
//! either `key=value` lines (the default) or TOML when its name ends in
//! `.toml`. CLI arguments take precedence over config file values.
//!
//! The result is a single validated, immutable [`Config`]. Validation runs
//! eagerly so that a bad dataset path or missing certificate is fatal before
//! the listener binds.

use crate::error::ConfigError;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Command-line arguments for the line search server
#[derive(Parser, Debug, Default)]
#[command(name = "linesearch")]
#[command(version)]
#[command(about = "Reports whether a query occurs verbatim as a line in a dataset file", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to configuration file (key=value, or TOML if it ends in .toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Host or IP address to bind to (or, for `query`, to connect to)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (0 picks an ephemeral port)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Path to the dataset file
    #[arg(long)]
    pub linuxpath: Option<PathBuf>,

    /// Reread the dataset from disk on every query
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub reread_on_query: Option<bool>,

    /// Maximum query payload size in bytes
    #[arg(short = 'm', long)]
    pub max_payload: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Subcommands; without one the server runs
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Send one query to a running server and print its reply
    Query {
        /// Text to look up
        text: String,
    },
}

/// Configuration file structure.
///
/// TOML files map onto the sections directly. `key=value` files use the flat
/// key names and are folded into the same sections.
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub dataset: DatasetSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub max_connections: Option<usize>,
}

/// Dataset-related configuration
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct DatasetSection {
    pub linuxpath: Option<PathBuf>,
    pub reread_on_query: Option<bool>,
    pub max_payload: Option<usize>,
}

/// Secure transport configuration
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct TlsSection {
    pub use_ssl: Option<bool>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct LoggingSection {
    pub level: Option<String>,
}

impl FileConfig {
    /// Read a config file, choosing the format from its extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: path.to_path_buf(),
                source,
            })
        } else {
            Self::from_key_value(&contents)
        }
    }

    /// Parse `key=value` lines.
    ///
    /// Blank lines, `#` comments and lines without `=` are skipped. Unknown
    /// keys are ignored.
    pub fn from_key_value(contents: &str) -> Result<Self, ConfigError> {
        let mut config = FileConfig::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "host" => config.server.host = Some(value.to_string()),
                "port" => config.server.port = Some(parse_number(key, value)?),
                "workers" => config.server.workers = Some(parse_number(key, value)?),
                "max_connections" => {
                    config.server.max_connections = Some(parse_number(key, value)?)
                }
                "linuxpath" => config.dataset.linuxpath = Some(PathBuf::from(value)),
                "reread_on_query" => config.dataset.reread_on_query = Some(parse_bool(key, value)?),
                "max_payload" => config.dataset.max_payload = Some(parse_number(key, value)?),
                "use_ssl" => config.tls.use_ssl = Some(parse_bool(key, value)?),
                "certfile" => config.tls.certfile = Some(PathBuf::from(value)),
                "keyfile" => config.tls.keyfile = Some(PathBuf::from(value)),
                "log_level" => config.logging.level = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub(crate) fn default_port() -> u16 {
    44445
}

fn default_max_payload() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

pub(crate) fn default_certfile() -> PathBuf {
    PathBuf::from("ssl/cert.pem")
}

fn default_keyfile() -> PathBuf {
    PathBuf::from("ssl/key.pem")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Certificate and key used to wrap accepted connections
#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dataset_path: PathBuf,
    pub reread_on_query: bool,
    pub max_payload: usize,
    /// `Some` when secure transport is enabled
    pub tls: Option<TlsConfig>,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Resolve and validate configuration from already-parsed CLI args.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config {
            Some(ref path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let config = Self::merge(cli, file)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over file values, filling in defaults.
    pub fn merge(cli: CliArgs, file: FileConfig) -> Result<Self, ConfigError> {
        let dataset_path = cli
            .linuxpath
            .or(file.dataset.linuxpath)
            .ok_or(ConfigError::MissingRequired("linuxpath"))?;

        let tls = if file.tls.use_ssl.unwrap_or(false) {
            Some(TlsConfig {
                cert_path: file.tls.certfile.unwrap_or_else(default_certfile),
                key_path: file.tls.keyfile.unwrap_or_else(default_keyfile),
            })
        } else {
            None
        };

        Ok(Config {
            host: cli
                .host
                .or(file.server.host)
                .unwrap_or_else(default_host),
            port: cli.port.or(file.server.port).unwrap_or_else(default_port),
            dataset_path,
            reread_on_query: cli
                .reread_on_query
                .or(file.dataset.reread_on_query)
                .unwrap_or(false),
            max_payload: cli
                .max_payload
                .or(file.dataset.max_payload)
                .unwrap_or_else(default_max_payload),
            tls,
            workers: cli.workers.or(file.server.workers),
            max_connections: file
                .server
                .max_connections
                .unwrap_or_else(default_max_connections),
            log_level: cli
                .log_level
                .or(file.logging.level)
                .unwrap_or_else(default_log_level),
        })
    }

    /// Check everything that must hold before the listener binds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dataset_path.is_file() {
            return Err(ConfigError::DatasetNotFound(self.dataset_path.clone()));
        }

        if self.max_payload == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_payload".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_connections".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.workers == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "workers".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if let Some(tls) = &self.tls {
            if !tls.cert_path.is_file() {
                return Err(ConfigError::TlsFileNotFound {
                    kind: "certificate",
                    path: tls.cert_path.clone(),
                });
            }
            if !tls.key_path.is_file() {
                return Err(ConfigError::TlsFileNotFound {
                    kind: "key",
                    path: tls.key_path.clone(),
                });
            }
        }

        Ok(())
    }

    /// The `host:port` string used for address resolution and logging.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn dataset_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"apple\nbanana\n").unwrap();
        file
    }

    #[test]
    fn test_key_value_parsing() {
        let contents = "\
            # server settings\n\
            host = 127.0.0.1\n\
            port=44445\n\
            \n\
            linuxpath=/srv/data/200k.txt\n\
            reread_on_query=True\n\
            max_payload = 2048\n\
            use_ssl=false\n\
            this line is ignored\n\
            unknown_key=whatever\n";

        let config = FileConfig::from_key_value(contents).unwrap();
        assert_eq!(config.server.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.server.port, Some(44445));
        assert_eq!(
            config.dataset.linuxpath,
            Some(PathBuf::from("/srv/data/200k.txt"))
        );
        assert_eq!(config.dataset.reread_on_query, Some(true));
        assert_eq!(config.dataset.max_payload, Some(2048));
        assert_eq!(config.tls.use_ssl, Some(false));
    }

    #[test]
    fn test_key_value_value_may_contain_equals() {
        let config = FileConfig::from_key_value("linuxpath=/data/a=b.txt").unwrap();
        assert_eq!(config.dataset.linuxpath, Some(PathBuf::from("/data/a=b.txt")));
    }

    #[test]
    fn test_key_value_invalid_values() {
        let err = FileConfig::from_key_value("use_ssl=maybe").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "use_ssl"));

        let err = FileConfig::from_key_value("port=99999").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "port"));

        let err = FileConfig::from_key_value("max_payload=lots").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "max_payload"));
    }

    #[test]
    fn test_parse_bool_variants() {
        for value in ["true", "TRUE", "yes", "On", "1"] {
            assert!(parse_bool("k", value).unwrap(), "{value}");
        }
        for value in ["false", "False", "no", "off", "0"] {
            assert!(!parse_bool("k", value).unwrap(), "{value}");
        }
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 5000
            workers = 4

            [dataset]
            linuxpath = "/srv/data.txt"
            reread_on_query = true
            max_payload = 512

            [tls]
            use_ssl = true
            certfile = "certs/server.pem"

            [logging]
            level = "debug"
        "#;

        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, Some(5000));
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.dataset.reread_on_query, Some(true));
        assert_eq!(config.dataset.max_payload, Some(512));
        assert_eq!(config.tls.use_ssl, Some(true));
        assert_eq!(config.tls.keyfile, None);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_merge_defaults() {
        let file = FileConfig::from_key_value("linuxpath=data.txt").unwrap();
        let config = Config::merge(CliArgs::default(), file).unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 44445);
        assert_eq!(config.max_payload, 1024);
        assert!(!config.reread_on_query);
        assert!(config.tls.is_none());
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_merge_tls_default_paths() {
        let file = FileConfig::from_key_value("linuxpath=data.txt\nuse_ssl=true").unwrap();
        let config = Config::merge(CliArgs::default(), file).unwrap();
        assert_eq!(
            config.tls,
            Some(TlsConfig {
                cert_path: PathBuf::from("ssl/cert.pem"),
                key_path: PathBuf::from("ssl/key.pem"),
            })
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::try_parse_from([
            "linesearch",
            "--port",
            "6000",
            "--reread-on-query",
            "--max-payload",
            "64",
        ])
        .unwrap();
        let file = FileConfig::from_key_value(
            "linuxpath=data.txt\nport=44445\nreread_on_query=false\nmax_payload=1024",
        )
        .unwrap();

        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.port, 6000);
        assert!(config.reread_on_query);
        assert_eq!(config.max_payload, 64);
    }

    #[test]
    fn test_query_subcommand() {
        let cli = CliArgs::try_parse_from(["linesearch", "query", "apple", "--port", "6000"])
            .unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Query {
                text: "apple".to_string()
            })
        );
        assert_eq!(cli.port, Some(6000));

        let cli = CliArgs::try_parse_from(["linesearch", "--linuxpath", "data.txt"]).unwrap();
        assert_eq!(cli.command, None);
    }

    #[test]
    fn test_missing_linuxpath() {
        let file = FileConfig::from_key_value("max_payload=1024").unwrap();
        let err = Config::merge(CliArgs::default(), file).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("linuxpath")));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/config.txt")),
            ..CliArgs::default()
        };
        let err = Config::from_cli(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dataset = dataset_file();
        let mut config_file = NamedTempFile::new().unwrap();
        writeln!(config_file, "linuxpath={}", dataset.path().display()).unwrap();
        writeln!(config_file, "port=0").unwrap();

        let cli = CliArgs {
            config: Some(config_file.path().to_path_buf()),
            ..CliArgs::default()
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.dataset_path, dataset.path());
        assert_eq!(config.port, 0);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dataset = dataset_file();
        let mut config_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(config_file, "[dataset]").unwrap();
        writeln!(config_file, "linuxpath = {:?}", dataset.path().display().to_string()).unwrap();
        writeln!(config_file, "max_payload = 10").unwrap();

        let cli = CliArgs {
            config: Some(config_file.path().to_path_buf()),
            ..CliArgs::default()
        };
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.max_payload, 10);
    }

    #[test]
    fn test_malformed_toml_file() {
        let mut config_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(config_file, "[dataset").unwrap();

        let err = FileConfig::load(config_file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse { .. }));
    }

    #[test]
    fn test_validate_missing_dataset() {
        let file = FileConfig::from_key_value("linuxpath=/nonexistent/data.txt").unwrap();
        let config = Config::merge(CliArgs::default(), file).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DatasetNotFound(_))
        ));
    }

    #[test]
    fn test_validate_missing_tls_files() {
        let dataset = dataset_file();
        let contents = format!(
            "linuxpath={}\nuse_ssl=true\ncertfile=/nonexistent/cert.pem\nkeyfile=/nonexistent/key.pem",
            dataset.path().display()
        );
        let file = FileConfig::from_key_value(&contents).unwrap();
        let config = Config::merge(CliArgs::default(), file).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TlsFileNotFound { kind: "certificate", .. })
        ));
    }

    #[test]
    fn test_validate_zero_max_payload() {
        let dataset = dataset_file();
        let contents = format!("linuxpath={}\nmax_payload=0", dataset.path().display());
        let file = FileConfig::from_key_value(&contents).unwrap();
        let config = Config::merge(CliArgs::default(), file).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "max_payload"
        ));
    }

    #[test]
    fn test_listen_address() {
        let file = FileConfig::from_key_value("linuxpath=data.txt\nhost=127.0.0.1\nport=9000")
            .unwrap();
        let config = Config::merge(CliArgs::default(), file).unwrap();
        assert_eq!(config.listen_address(), "127.0.0.1:9000");
    }
}
