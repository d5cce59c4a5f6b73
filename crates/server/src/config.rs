use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub recursive: bool,
    pub prune_deleted: bool,
    pub progress_every_full: usize,
    pub progress_every_incremental: usize,
    pub lease_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            recursive: true,
            prune_deleted: true,
            progress_every_full: 10,
            progress_every_incremental: 5,
            lease_secs: 600,
            keepalive_secs: 25,
        }
    }
}

impl ScanSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    pub enabled: bool,
    pub debounce_secs: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_secs: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub music_root: String,
    pub index_path: String,
    pub covers_path: String,
    pub port: u16,
    pub scan: ScanSettings,
    pub queue: QueueSettings,
    pub watch: WatchSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            music_root: "".to_string(),
            index_path: "library.redb".to_string(),
            covers_path: "covers".to_string(),
            port: 3000,
            scan: ScanSettings::default(),
            queue: QueueSettings::default(),
            watch: WatchSettings::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("SCANNER_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

/// Loads the config, writing defaults first when the file does not exist.
/// The flag is true when the file was created.
pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.index_path.trim().is_empty() {
            config.index_path = "library.redb".to_string();
        }
        if config.covers_path.trim().is_empty() {
            config.covers_path = "covers".to_string();
        }
        if config.port == 0 {
            config.port = 3000;
        }
        if config.scan.progress_every_full == 0 {
            config.scan.progress_every_full = 10;
        }
        if config.scan.progress_every_incremental == 0 {
            config.scan.progress_every_incremental = 5;
        }
        if config.queue.workers == 0 {
            config.queue.workers = 1;
        }
        if config.queue.max_attempts == 0 {
            config.queue.max_attempts = 1;
        }
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_music_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config.scan.progress_every_full, 10);
        assert_eq!(config.scan.progress_every_incremental, 5);
        assert_eq!(config.queue.max_attempts, 3);

        let (_, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "music_root: /srv/music\nport: 0\nscan:\n  prune_deleted: false\n  progress_every_full: 0\n",
        )
        .unwrap();
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.music_root, "/srv/music");
        assert_eq!(config.port, 3000);
        assert!(!config.scan.prune_deleted);
        assert!(config.scan.recursive);
        assert_eq!(config.scan.progress_every_full, 10);
        assert_eq!(config.watch.debounce_secs, 2);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let config_path = Path::new("/etc/scanner/config.yaml");
        assert_eq!(
            resolve_path(config_path, "library.redb"),
            PathBuf::from("/etc/scanner/library.redb")
        );
        assert_eq!(
            resolve_path(config_path, "/var/lib/index.redb"),
            PathBuf::from("/var/lib/index.redb")
        );
        assert_eq!(resolve_music_root(config_path, "  "), None);
        assert_eq!(
            resolve_path(Path::new("config.yaml"), "covers"),
            PathBuf::from("./covers")
        );
    }
}
