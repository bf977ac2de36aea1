use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "WatchConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "WatchConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "WatchConfig::default_debounce_ms")]
    pub debounce_ms: u64,
}

impl WatchConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_poll_interval_ms() -> u64 {
        300
    }

    const fn default_debounce_ms() -> u64 {
        250
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            debounce_ms: Self::default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "RuntimeConfig::default_artifact_path")]
    pub artifact_path: PathBuf,
    #[serde(default = "RuntimeConfig::default_shadow_dir")]
    pub shadow_dir: PathBuf,
    /// Tags loaded right after the first generation comes up.
    #[serde(default)]
    pub autoload_tags: Vec<String>,
    #[serde(default)]
    pub slow_call_warn_ms: Option<u64>,
    #[serde(default = "RuntimeConfig::default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigOverrides {
    pub artifact_path: Option<PathBuf>,
    pub log_filter: Option<String>,
    pub watch: Option<bool>,
}

impl RuntimeConfig {
    fn default_artifact_path() -> PathBuf {
        PathBuf::from(libloading::library_filename("game_scripts"))
    }

    fn default_shadow_dir() -> PathBuf {
        env::temp_dir().join("kestrel_scripts")
    }

    fn default_log_filter() -> String {
        "info".to_string()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read script config {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse script config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Script config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn slow_call_threshold(&self) -> Option<Duration> {
        self.slow_call_warn_ms.map(Duration::from_millis)
    }

    pub fn apply_overrides(&mut self, overrides: &RuntimeConfigOverrides) {
        if let Some(path) = &overrides.artifact_path {
            self.artifact_path = path.clone();
        }
        if let Some(filter) = &overrides.log_filter {
            self.log_filter = filter.clone();
        }
        if let Some(watch) = overrides.watch {
            self.watch.enabled = watch;
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            artifact_path: Self::default_artifact_path(),
            shadow_dir: Self::default_shadow_dir(),
            autoload_tags: Vec::new(),
            slow_call_warn_ms: None,
            log_filter: Self::default_log_filter(),
            watch: WatchConfig::default(),
        }
    }
}

impl RuntimeConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.artifact_path.is_none() && self.log_filter.is_none() && self.watch.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("scripts.json");
        fs::write(
            &path,
            r#"{
  "artifact_path": "target/debug/libgame_scripts.so",
  "autoload_tags": ["player", "enemy"],
  "slow_call_warn_ms": 8,
  "watch": { "enabled": false }
}"#,
        )
        .expect("config written");
        let cfg = RuntimeConfig::load(&path).expect("config parses");
        assert_eq!(cfg.artifact_path, PathBuf::from("target/debug/libgame_scripts.so"));
        assert_eq!(cfg.autoload_tags, vec!["player".to_string(), "enemy".to_string()]);
        assert_eq!(cfg.slow_call_threshold(), Some(Duration::from_millis(8)));
        assert!(!cfg.watch.enabled);
        assert_eq!(cfg.watch.poll_interval_ms, 300, "missing watch fields use defaults");
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn missing_or_invalid_config_falls_back_to_defaults() {
        let dir = tempdir().expect("temp dir");
        assert_eq!(RuntimeConfig::load_or_default(dir.path().join("absent.json")), RuntimeConfig::default());
        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").expect("write broken config");
        let err = RuntimeConfig::load(&broken).expect_err("invalid json rejected");
        assert!(format!("{err:?}").contains("Failed to parse script config"));
    }

    #[test]
    fn overrides_replace_selected_fields() {
        let mut cfg = RuntimeConfig::default();
        let overrides = RuntimeConfigOverrides {
            artifact_path: Some(PathBuf::from("libnext.so")),
            log_filter: None,
            watch: Some(false),
        };
        assert!(!overrides.is_empty());
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.artifact_path, PathBuf::from("libnext.so"));
        assert_eq!(cfg.log_filter, "info");
        assert!(!cfg.watch.enabled);
    }
}
