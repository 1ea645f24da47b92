use config::{Config, File};
use serde::Deserialize;
use std::env;

/// Host-application configuration for a binsync repository client.
///
/// Loaded with 12-factor precedence: environment variables override
/// `config/{RUN_MODE}.toml`, which overrides `config/default.toml`, which
/// overrides the hardcoded defaults below.
#[derive(Debug, Deserialize, Clone)]
pub struct BinsyncConfig {
    pub repo: RepoConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    /// Name of the configured Git remote (usually "origin").
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Seconds the host should wait between `update()` calls.
    #[serde(default = "default_commit_interval")]
    pub commit_interval_secs: u64,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_commit_interval() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

impl Default for BinsyncConfig {
    fn default() -> Self {
        Self {
            repo: RepoConfig {
                remote: default_remote(),
                commit_interval_secs: default_commit_interval(),
            },
            logging: LoggingConfig { json: false },
        }
    }
}

impl BinsyncConfig {
    /// Load configuration with 12-factor app compliant env var support.
    ///
    /// Priority order (highest to lowest):
    /// 1. `BINSYNC_REMOTE` / `BINSYNC_COMMIT_INTERVAL_SECS` env vars
    /// 2. Config files (`config/default.toml`, `config/{run_mode}.toml`)
    /// 3. Hardcoded defaults (remote "origin", 10s commit interval)
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let mut builder = Config::builder()
            .set_default("repo.remote", default_remote())?
            .set_default("repo.commit_interval_secs", default_commit_interval())?
            .set_default("logging.json", false)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false));

        if let Ok(remote) = env::var("BINSYNC_REMOTE") {
            builder = builder.set_override("repo.remote", remote)?;
        }
        if let Ok(interval) = env::var("BINSYNC_COMMIT_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<i64>() {
                builder = builder.set_override("repo.commit_interval_secs", secs)?;
            }
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = BinsyncConfig::default();
        assert_eq!(cfg.repo.remote, "origin");
        assert_eq!(cfg.repo.commit_interval_secs, 10);
        assert!(!cfg.logging.json);
    }
}
