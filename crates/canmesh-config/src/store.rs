//! Locked persistence of `config.ini`.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::parser;
use crate::record::{MonitorConfig, OtaConfig, RoutingConfig};

/// Owner of the `config.ini` file lock.
///
/// All readers and writers of the file go through one shared `ConfigStore`;
/// the internal mutex serializes them so a partial rewrite can never be
/// observed. The store itself keeps no in-memory copy: components own
/// their config records and write them back through [`ConfigStore::update`].
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    file_lock: Mutex<()>,
}

impl ConfigStore {
    /// Create a store over the given `config.ini` path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, falling back to defaults if the file is absent.
    pub async fn load(&self) -> ConfigResult<MonitorConfig> {
        let _guard = self.file_lock.lock().await;
        self.load_locked().await
    }

    /// Persist the full configuration.
    pub async fn save(&self, config: &MonitorConfig) -> ConfigResult<()> {
        let _guard = self.file_lock.lock().await;
        self.save_locked(config).await
    }

    /// Read-modify-write the configuration under the file lock.
    ///
    /// Returns the configuration as persisted.
    pub async fn update<F>(&self, mutate: F) -> ConfigResult<MonitorConfig>
    where
        F: FnOnce(&mut MonitorConfig),
    {
        let _guard = self.file_lock.lock().await;
        let mut config = self.load_locked().await?;
        mutate(&mut config);
        self.save_locked(&config).await?;
        Ok(config)
    }

    /// Rewrite only the routing key group.
    pub async fn update_routing(&self, routing: RoutingConfig) -> ConfigResult<()> {
        self.update(|config| config.routing = routing).await?;
        Ok(())
    }

    /// Rewrite only the OTA key group.
    pub async fn update_ota(&self, ota: OtaConfig) -> ConfigResult<()> {
        self.update(move |config| config.ota = ota).await?;
        Ok(())
    }

    async fn load_locked(&self) -> ConfigResult<MonitorConfig> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => {
                debug!(path = %self.path.display(), "loaded config file");
                Ok(parser::parse(&text))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %self.path.display(),
                    "config file not found, using defaults"
                );
                Ok(MonitorConfig::default())
            }
            Err(err) => Err(ConfigError::read(&self.path, err)),
        }
    }

    async fn save_locked(&self, config: &MonitorConfig) -> ConfigResult<()> {
        let text = parser::to_ini(config);
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|err| ConfigError::write(&self.path, err))?;
        debug!(path = %self.path.display(), "config file written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::new(dir.path().join("config.ini"))
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = store_in(&dir).load().await.unwrap();
        assert_eq!(config, MonitorConfig::default());
    }

    #[tokio::test]
    async fn save_then_load_reproduces_every_knob() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut config = MonitorConfig::default();
        config.routing.retry_delay_ms = 125;
        config.ota.firmware_version_monitor = 3;
        config.ota.topic_brake = "fleet/brake".to_string();
        config.monitor.diag_persist_interval_ms = 45_000;
        config.logger.rtc_sda = 4;

        store.save(&config).await.unwrap();
        assert_eq!(store.load().await.unwrap(), config);
    }

    #[tokio::test]
    async fn update_routing_keeps_other_groups() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut config = MonitorConfig::default();
        config.ota.firmware_version_steering = 8;
        store.save(&config).await.unwrap();

        store
            .update_routing(RoutingConfig {
                default_cost: 5,
                retry_count: 2,
                retry_delay_ms: 50,
            })
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.routing.default_cost, 5);
        assert_eq!(loaded.ota.firmware_version_steering, 8);
    }

    #[tokio::test]
    async fn write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("no-such-dir").join("config.ini"));
        let result = store.save(&MonitorConfig::default()).await;
        assert!(matches!(result, Err(ConfigError::Write { .. })));
    }
}
