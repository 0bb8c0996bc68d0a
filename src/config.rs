use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Api {
    ///
    /// rpc server listen
    ///
    /// This option specifies the binding address of the gRPC server peering
    /// clients connect to.
    ///
    #[serde(default = "Api::bind")]
    pub listen: SocketAddr,
}

impl Api {
    fn bind() -> SocketAddr {
        "127.0.0.1:9901".parse().unwrap()
    }
}

impl Default for Api {
    fn default() -> Self {
        Self {
            listen: Self::bind(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Database {
    ///
    /// database file
    ///
    /// Path of the SQLite database holding the coordinator state. The file
    /// is created on first start.
    ///
    #[serde(default = "Database::path")]
    pub path: String,
}

impl Database {
    fn path() -> String {
        "peering-coordinator.db".to_string()
    }
}

impl Default for Database {
    fn default() -> Self {
        Self { path: Self::path() }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: peering-coordinator --config /etc/peering-coordinator/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If a configuration file path is given on the command line the
    /// configuration is read from that file, otherwise the defaults are
    /// used.
    ///
    pub fn load() -> Result<Self> {
        match Cli::parse().config {
            Some(path) => Ok(toml::from_str(&read_to_string(&path)?)?),
            None => Ok(Self::default()),
        }
    }
}
