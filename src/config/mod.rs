use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/deploy.toml";
/// Overrides [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "MAI_DEPLOY_CONFIG";

/// Daemon settings read from `deploy.toml`. Every key is optional.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    pub state_file: PathBuf,
    pub port_range_start: u16,
    /// Exclusive.
    pub port_range_end: u16,
    pub probe_timeout_ms: u64,
    pub env_file_name: String,
    pub monitor_interval_secs: u64,
    pub restart_delay_ms: u64,
    /// Used when a group config omits `launch_interval`.
    pub default_launch_interval_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("config/multi_bot_config.json"),
            port_range_start: 8000,
            port_range_end: 9000,
            probe_timeout_ms: 200,
            env_file_name: ".env".to_string(),
            monitor_interval_secs: 5,
            restart_delay_ms: 1000,
            default_launch_interval_secs: 1,
        }
    }
}

impl DeployConfig {
    /// Loads from `$MAI_DEPLOY_CONFIG`, falling back to `config/deploy.toml`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&s).with_context(|| format!("failed to parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range_start >= self.port_range_end {
            anyhow::bail!(
                "empty port range {}-{}",
                self.port_range_start,
                self.port_range_end
            );
        }
        if self.env_file_name.trim().is_empty() {
            anyhow::bail!("env_file_name must not be empty");
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn default_launch_interval(&self) -> Duration {
        Duration::from_secs(self.default_launch_interval_secs)
    }
}
