use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::LimiterError;

/// Environment variable pointing at the dashboard configuration file.
pub const CONFIG_PATH_ENV: &str = "WG_DASHBOARD_CONFIG";
/// Conventional location of the dashboard configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wgdashboard/config.toml";
/// Fallback data directory when no configuration file is present.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/wgdashboard";

/// The slice of the dashboard configuration the limiter shares: named
/// database connection strings. The rest of the file belongs to the web
/// frontend and is ignored here.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    #[serde(default)]
    pub databases: HashMap<String, PathBuf>,
}

impl ConfigFile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LimiterError> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Resolve the connection string for a shared database by name.
///
/// Uses the dashboard's own configuration file when one exists, and falls
/// back to the conventional `<data dir>/<name>.db` path so the limiter runs
/// unchanged on hosts where the dashboard was installed with defaults.
pub fn database_path(name: &str) -> Result<PathBuf, LimiterError> {
    let config_path = env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    database_path_in(&config_path, name)
}

fn database_path_in(config_path: &Path, name: &str) -> Result<PathBuf, LimiterError> {
    if config_path.exists() {
        let config = ConfigFile::from_file(config_path)?;
        if let Some(path) = config.databases.get(name) {
            return Ok(path.clone());
        }
    }
    Ok(Path::new(DEFAULT_DATA_DIR).join(name).with_extension("db"))
}
