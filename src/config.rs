use std::env;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_HISTORY_PATH: &str = "data/history.csv";
pub const DEFAULT_MLLP_ADDRESS: &str = "0.0.0.0:8440";
pub const DEFAULT_PAGER_ADDRESS: &str = "0.0.0.0:8441";
pub const DEFAULT_DB_PATH: &str = "/state/database.db";
pub const DEFAULT_PAGER_QUEUE_PATH: &str = "/state/pager.pkl";
pub const DEFAULT_MODEL_PATH: &str = "dt_model.json";
pub const DEFAULT_METRICS_PORT: u16 = 8000;

/// A `host:port` pair. Accepts a bare pair or a URL-ish address; a scheme
/// and any path are stripped (`http://pager:8441/page` → `pager`, 8441).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self> {
        let without_scheme = address.rsplit("://").next().unwrap_or(address);
        let host_port = without_scheme.split('/').next().unwrap_or("").trim();
        let (host, port) = host_port
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("address {} has no port", address)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in address {}", address)))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Runtime configuration, from the environment with CLI overrides.
#[derive(Debug, Clone)]
pub struct Config {
    pub history_path: PathBuf,
    pub mllp: Endpoint,
    pub pager: Endpoint,
    pub db_path: PathBuf,
    pub pager_queue_path: PathBuf,
    pub model_path: PathBuf,
    pub metrics_port: u16,
    pub debug: bool,
}

impl Config {
    pub fn from_env(history_override: Option<PathBuf>, debug: bool) -> Result<Self> {
        let history_path = history_override
            .unwrap_or_else(|| PathBuf::from(env_or("HISTORY_PATH", DEFAULT_HISTORY_PATH)));
        let mllp = Endpoint::parse(&env_or("MLLP_ADDRESS", DEFAULT_MLLP_ADDRESS))?;
        let pager = Endpoint::parse(&env_or("PAGER_ADDRESS", DEFAULT_PAGER_ADDRESS))?;
        let metrics_port = match env::var("METRICS_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|_| Error::Config(format!("invalid METRICS_PORT: {}", value)))?,
            Err(_) => DEFAULT_METRICS_PORT,
        };
        Ok(Self {
            history_path,
            mllp,
            pager,
            db_path: PathBuf::from(env_or("DB_PATH", DEFAULT_DB_PATH)),
            pager_queue_path: PathBuf::from(env_or("PAGER_QUEUE_PATH", DEFAULT_PAGER_QUEUE_PATH)),
            model_path: PathBuf::from(env_or("MODEL_PATH", DEFAULT_MODEL_PATH)),
            metrics_port,
            debug,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
