use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub stations: StationsConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub now_playing: NowPlayingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// JSON key-value file holding favorites, last-played station and volume.
    #[serde(default = "default_prefs_file")]
    pub prefs_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Volume used when no persisted volume exists (0.0 to 1.0).
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

/// Station list source: a local TOML catalog, falling back to an m3u URL or file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Defaults to `$XDG_CONFIG_HOME/commons-radio/stations.toml`.
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// URL or file path for an m3u station list.  Empty disables the fallback.
    #[serde(default)]
    pub m3u_url: String,
}

/// Station-switch and failure-recovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Total crossfade duration when switching away from an audible station.
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u64,
    /// Number of discrete gain steps in a crossfade.
    #[serde(default = "default_crossfade_steps")]
    pub crossfade_steps: u32,
    /// Automatic re-attempts of a failed stream before it is declared unavailable.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base: attempt k waits `retry_base_secs * 2^k`.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowPlayingConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound for one whole metadata probe (connect + read).
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Bytes read past `icy-metaint` before the probe hangs up.
    #[serde(default = "default_read_ahead_bytes")]
    pub read_ahead_bytes: usize,
}

impl NowPlayingConfig {
    /// Poll period, never shorter than one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            prefs_file: default_prefs_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            default_volume: default_volume(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            m3u_url: String::new(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            crossfade_ms: default_crossfade_ms(),
            crossfade_steps: default_crossfade_steps(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base_secs(),
        }
    }
}

impl Default for NowPlayingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            read_ahead_bytes: default_read_ahead_bytes(),
        }
    }
}

fn default_prefs_file() -> PathBuf {
    platform::data_dir().join("prefs.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_volume() -> f32 {
    0.8
}

fn default_crossfade_ms() -> u64 {
    1000
}

fn default_crossfade_steps() -> u32 {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_secs() -> u64 {
    1
}

fn default_poll_interval_secs() -> u64 {
    20
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_read_ahead_bytes() -> usize {
    4096
}

fn default_stations_toml() -> PathBuf {
    // On Windows, check for portable stations.toml in executable directory
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_stations = exe_dir.join("stations.toml");
                if portable_stations.exists() {
                    return portable_stations;
                }
            }
        }
    }

    platform::config_dir().join("stations.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8989);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert!(config.stations.m3u_url.is_empty());
        assert!(config
            .stations
            .stations_toml
            .ends_with("commons-radio/stations.toml"));
        assert_eq!(config.playback.crossfade_ms, 1000);
        assert_eq!(config.playback.crossfade_steps, 20);
        assert_eq!(config.playback.max_retries, 3);
        assert_eq!(config.now_playing.poll_interval_secs, 20);
        assert_eq!(config.now_playing.probe_timeout_secs, 5);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [playback]
            crossfade_ms = 500

            [http]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.playback.crossfade_ms, 500);
        assert_eq!(config.playback.crossfade_steps, 20);
        assert_eq!(config.http.port, 9000);
        assert!(config.http.enabled);
        assert_eq!(config.now_playing.read_ahead_bytes, 4096);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config: Config = toml::from_str(
            r#"
            [now_playing]
            poll_interval_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.now_playing.poll_interval(), Duration::from_secs(1));
        assert_eq!(
            Config::default().now_playing.poll_interval(),
            Duration::from_secs(20)
        );
    }
}
