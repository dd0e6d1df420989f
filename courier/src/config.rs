use std::path::{Path, PathBuf};

use courier_broker::BrokerConfig;
use courier_dispatch::DispatchConfig;
use courier_smtp::SmtpConfig;
use serde::Deserialize;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

/// The whole configuration file.
///
/// ```ron
/// #![enable(unwrap_variant_newtypes)]
/// Courier (
///     broker: File(path: "/var/spool/courier"),
///     smtp: (host: "smtp.example.com"),
///     dispatch: (sender: "noreply@example.com"),
/// )
/// ```
#[derive(Debug, Deserialize)]
pub struct Courier {
    #[serde(default)]
    pub broker: BrokerConfig,
    pub smtp: SmtpConfig,
    pub dispatch: DispatchConfig,
}

impl Courier {
    /// Read and parse the configuration at `path`.
    ///
    /// # Errors
    /// If the file cannot be read or is not a valid configuration
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {e}", path.display())
        })?;

        ron::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))
    }
}

/// Find the configuration file using the following precedence:
/// 1. `explicit`, when given on the command line
/// 2. `COURIER_CONFIG` environment variable
/// 3. ./courier.config.ron (current working directory)
/// 4. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
/// If a named file does not exist or none of the defaults do
pub fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = DEFAULT_PATHS.iter().map(PathBuf::from).find(|p| p.exists()) {
        return Ok(path);
    }

    let paths_tried = DEFAULT_PATHS
        .iter()
        .map(|p| format!("  - {p}"))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}
