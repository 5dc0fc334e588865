use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::DEFAULT_BASE_URL;
use crate::holo::DEFAULT_PAGE_SIZE;

const DEFAULT_ENV_PREFIX: &str = "HOLO";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub videos: VideosConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Ask the backend's `/config` for the API base URL on start.
    #[serde(default = "default_fetch_remote_config")]
    pub fetch_remote_config: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
            fetch_remote_config: default_fetch_remote_config(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("holo/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_fetch_remote_config() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideosConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for VideosConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = merge_config(cfg, load_env(prefix)?);

    Url::parse(&cfg.backend.base_url)
        .with_context(|| format!("config: invalid backend.base_url {:?}", cfg.backend.base_url))?;

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    let defaults = Config::default();

    if !other.backend.base_url.is_empty() && other.backend.base_url != defaults.backend.base_url {
        base.backend.base_url = other.backend.base_url;
    }
    if !other.backend.user_agent.is_empty()
        && other.backend.user_agent != defaults.backend.user_agent
    {
        base.backend.user_agent = other.backend.user_agent;
    }
    if !other.backend.timeout.is_zero() && other.backend.timeout != defaults.backend.timeout {
        base.backend.timeout = other.backend.timeout;
    }
    if other.backend.fetch_remote_config != defaults.backend.fetch_remote_config {
        base.backend.fetch_remote_config = other.backend.fetch_remote_config;
    }

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    if other.videos.page_size != 0 && other.videos.page_size != defaults.videos.page_size {
        base.videos.page_size = other.videos.page_size;
    }

    base
}

fn load_env(prefix: &str) -> Result<Config> {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    let mut cfg = Config::default();
    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "backend.base_url" => cfg.backend.base_url = value,
        "backend.user_agent" => cfg.backend.user_agent = value,
        "backend.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.backend.timeout = duration;
            }
        }
        "backend.fetch_remote_config" => {
            cfg.backend.fetch_remote_config =
                matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        "videos.page_size" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.videos.page_size = parsed;
            }
        }
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("holo").join("config.yaml"))
}

/// Writes a config file pointing at `base_url`, keeping any other settings
/// already present in the file.
pub fn save_backend(path: Option<PathBuf>, base_url: &str) -> Result<PathBuf> {
    let base_url = base_url.trim();
    anyhow::ensure!(!base_url.is_empty(), "config: backend.base_url is required");
    Url::parse(base_url)
        .with_context(|| format!("config: invalid backend.base_url {base_url:?}"))?;

    let path = if let Some(path) = path {
        path
    } else {
        default_config_path().context("config: unable to determine default config path")?
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };
    cfg.backend.base_url = base_url.to_string();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some("HOLO_TEST_DEFAULTS".into()),
        })
        .unwrap();
        assert_eq!(cfg.backend.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.backend.timeout, Duration::from_secs(20));
        assert_eq!(cfg.videos.page_size, DEFAULT_PAGE_SIZE);
        assert!(cfg.backend.fetch_remote_config);
    }

    #[test]
    fn file_values_are_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "backend:\n  base_url: http://holo.test:8110/\n  timeout: 5s\nvideos:\n  page_size: 7\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("HOLO_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.backend.base_url, "http://holo.test:8110/");
        assert_eq!(cfg.backend.timeout, Duration::from_secs(5));
        assert_eq!(cfg.videos.page_size, 7);
    }

    #[test]
    fn save_backend_creates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        save_backend(Some(path.clone()), "http://holo.test/").unwrap();
        let saved = read_config_file(&path).unwrap();
        assert_eq!(saved.backend.base_url, "http://holo.test/");
        assert!(save_backend(Some(path), "not a url").is_err());
    }

    #[test]
    fn env_overrides() {
        env::set_var("HOLO_TEST_ENV_BACKEND__TIMEOUT", "3s");
        env::set_var("HOLO_TEST_ENV_BACKEND__FETCH_REMOTE_CONFIG", "false");
        env::set_var("HOLO_TEST_ENV_STORAGE__PATH", "/tmp/holo-state.db");
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some("HOLO_TEST_ENV".into()),
        })
        .unwrap();
        assert_eq!(cfg.backend.timeout, Duration::from_secs(3));
        assert!(!cfg.backend.fetch_remote_config);
        assert_eq!(
            cfg.storage.path.as_deref(),
            Some(Path::new("/tmp/holo-state.db"))
        );
        env::remove_var("HOLO_TEST_ENV_BACKEND__TIMEOUT");
        env::remove_var("HOLO_TEST_ENV_BACKEND__FETCH_REMOTE_CONFIG");
        env::remove_var("HOLO_TEST_ENV_STORAGE__PATH");
    }
}
