use crate::db;
use anyhow::{bail, Context};
use std::path::PathBuf;

const ENV_WORKSPACE: &str = "BULLETIND_WORKSPACE";
const ENV_LOG: &str = "BULLETIND_LOG";
const ENV_DB_FILE: &str = "BULLETIND_DB_FILE";

/// Startup settings read from the environment.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Workspace opened before the first request, if any.
    pub workspace: Option<PathBuf>,
    /// `EnvFilter` directives for stderr logging.
    pub log_filter: String,
    pub db_file: String,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let workspace = read_var(ENV_WORKSPACE)?.map(PathBuf::from);
        let log_filter = read_var(ENV_LOG)?.unwrap_or_else(|| "info".to_string());
        let db_file = match read_var(ENV_DB_FILE)? {
            Some(name) => {
                if name.contains('/') || name.contains('\\') {
                    bail!("{} must be a file name, got {:?}", ENV_DB_FILE, name);
                }
                name
            }
            None => db::DEFAULT_DB_FILE.to_string(),
        };
        Ok(DaemonConfig {
            workspace,
            log_filter,
            db_file,
        })
    }
}

/// Unset and blank both read as `None`.
fn read_var(key: &str) -> anyhow::Result<Option<String>> {
    match std::env::var(key) {
        Ok(v) => {
            let v = v.trim();
            Ok(if v.is_empty() { None } else { Some(v.to_string()) })
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", key)),
    }
}
