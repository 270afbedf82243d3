//! Configuration model. A layered loader: embedded defaults, then an
//! optional user file, then `CRONLOOP__`-prefixed environment variables.

use chrono::{Duration, Utc};
use config::builder::DefaultState;
use config::{
    Config as ConfigRaw,
    ConfigBuilder,
    ConfigError,
    Environment,
    File,
    FileFormat,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Logical name surfaced in metadata and thread names.
    pub instance_name: String,
    /// Unique id; `AUTO` derives one from the hostname and current millis.
    pub instance_id: String,
    /// Longest the scheduler thread sleeps between empty acquisition polls.
    pub idle_wait_time_ms: u64,
    /// Most triggers acquired in one pass.
    pub batch_max_count: usize,
    /// How far past the first trigger's fire time a batch may reach.
    pub batch_time_window_ms: u64,
    /// Detach the scheduler thread on shutdown instead of joining it.
    pub make_thread_daemon: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadPoolConfig {
    pub thread_count: usize,
    /// Advisory; thread priorities are not portable and are only recorded.
    pub thread_priority: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStoreConfig {
    pub misfire_threshold_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub thread_pool: ThreadPoolConfig,
    pub job_store: JobStoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        ConfigLoader::from_path(&None)
            .load()
            .expect("embedded defaults always deserialize")
    }
}

impl Config {
    pub fn idle_wait_time(&self) -> Duration {
        Duration::milliseconds(self.scheduler.idle_wait_time_ms as i64)
    }

    pub fn batch_time_window(&self) -> Duration {
        Duration::milliseconds(self.scheduler.batch_time_window_ms as i64)
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::milliseconds(self.job_store.misfire_threshold_ms as i64)
    }

    /// The effective instance id, expanding `AUTO`.
    pub fn resolve_instance_id(&self) -> String {
        if self.scheduler.instance_id != "AUTO" {
            return self.scheduler.instance_id.clone();
        }
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_owned());
        format!("{host}{}", Utc::now().timestamp_millis())
    }
}

#[derive(Debug)]
pub struct ConfigLoader {
    builder: ConfigBuilder<DefaultState>,
}

impl ConfigLoader {
    /// Loads a fresh copy of the configuration from source.
    pub fn load(&self) -> Result<Config, ConfigError> {
        self.builder.build_cloned()?.try_deserialize()
    }

    /// Creates a loader over the embedded defaults, overlaying the supplied
    /// file (if any) and the process environment.
    pub fn from_path(path: &Option<String>) -> ConfigLoader {
        let raw = include_str!("default.toml");
        let mut builder = ConfigRaw::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .add_source(
                Environment::with_prefix("CRONLOOP")
                    .try_parsing(true)
                    .separator("__"),
            );
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        ConfigLoader { builder }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load() {
        let config = Config::default();
        assert_eq!("CronloopScheduler", config.scheduler.instance_name);
        assert_eq!("AUTO", config.scheduler.instance_id);
        assert_eq!(30_000, config.scheduler.idle_wait_time_ms);
        assert_eq!(1, config.scheduler.batch_max_count);
        assert_eq!(0, config.scheduler.batch_time_window_ms);
        assert_eq!(10, config.thread_pool.thread_count);
        assert_eq!(
            Duration::milliseconds(5000),
            config.misfire_threshold()
        );
    }

    #[test]
    fn auto_instance_id_expands() {
        let config = Config::default();
        let id = config.resolve_instance_id();
        assert_ne!("AUTO", id);
        assert!(!id.is_empty());
    }

    #[test]
    fn explicit_instance_id_passes_through() {
        let mut config = Config::default();
        config.scheduler.instance_id = "node-7".to_owned();
        assert_eq!("node-7", config.resolve_instance_id());
    }
}
