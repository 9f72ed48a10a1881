use crate::config::Config;
use crate::protocol::{Channel, DaemonState, Station};
use crate::session::PlaybackSession;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Read model of the daemon.  The controller is the only writer; HTTP and
/// socket handlers read snapshots.
pub struct StateManager {
    state: Arc<RwLock<DaemonState>>,
}

impl StateManager {
    pub fn new(stations: Vec<Station>, volume: f32) -> Self {
        let state = DaemonState {
            rev: 1,
            stations,
            volume,
            ..DaemonState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn get_state(&self) -> DaemonState {
        self.state.read().await.clone()
    }

    /// Copy the controller-owned session into the published snapshot.
    pub async fn publish_session(&self, session: &PlaybackSession, crossfading: bool) {
        let mut state = self.state.write().await;
        state.current_station = session.station;
        state.current_channel = session.channel.clone();
        state.stream_url = session.stream_url.clone();
        state.playback_status = session.status;
        state.volume = session.volume;
        state.last_error = session.last_error.clone();
        state.retry_attempt = session.retry_attempt;
        state.now_playing = session.now_playing.clone();
        state.media_session = session.media_session.clone();
        state.crossfading = crossfading;
        state.rev += 1;
    }

    pub async fn set_history_len(&self, len: usize) {
        let mut state = self.state.write().await;
        if state.history_len != len {
            state.history_len = len;
            state.rev += 1;
        }
    }

    pub async fn set_favorites(&self, favorites: Vec<String>) {
        let mut state = self.state.write().await;
        state.favorites = favorites;
        state.rev += 1;
    }
}

// ── m3u station loader ────────────────────────────────────────────────────────

pub fn parse_m3u_from_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let mut stations = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_name = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let name = pending_name.take().unwrap_or_else(|| url.clone());
        let slug = slugify(&name);

        stations.push(Station {
            id: slug.clone(),
            slug,
            name,
            url,
            ..Station::default()
        });
    }

    Ok(stations)
}

pub fn load_stations_from_m3u(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_m3u_from_str(&content)
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[station]]` table.
/// Kept separate from `Station` so the file schema can diverge from the wire
/// protocol struct without breaking either.
#[derive(Debug, serde::Deserialize)]
struct TomlStationFile {
    station: Vec<TomlStation>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlStation {
    #[serde(default)]
    id: String,
    #[serde(default)]
    slug: String,
    name: String,
    url: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    network: String,
    #[serde(default)]
    frequency: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    website: String,
    #[serde(default)]
    artwork: Option<String>,
    #[serde(default)]
    channel: Vec<TomlChannel>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlChannel {
    id: String,
    name: String,
    url: String,
    #[serde(default)]
    description: String,
}

pub fn load_stations_from_toml(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    let stations = file
        .station
        .into_iter()
        .map(|s| {
            let slug = if s.slug.is_empty() {
                slugify(&s.name)
            } else {
                s.slug
            };
            let id = if s.id.is_empty() { slug.clone() } else { s.id };
            Station {
                id,
                slug,
                name: s.name,
                url: s.url,
                description: s.description,
                network: s.network,
                frequency: s.frequency,
                location: s.location,
                website: s.website,
                artwork: s.artwork,
                channels: s
                    .channel
                    .into_iter()
                    .map(|c| Channel {
                        id: c.id,
                        name: c.name,
                        url: c.url,
                        description: c.description,
                    })
                    .collect(),
            }
        })
        .collect();
    Ok(stations)
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

// ── catalog resolution ────────────────────────────────────────────────────────

pub async fn load_stations(config: &Config) -> anyhow::Result<Vec<Station>> {
    // 1. Configured catalog file
    let toml_path = &config.stations.stations_toml;
    if toml_path.exists() {
        match load_stations_from_toml(toml_path) {
            Ok(s) => {
                info!(
                    "Loaded {} stations from TOML: {}",
                    s.len(),
                    toml_path.display()
                );
                return Ok(s);
            }
            Err(e) => warn!("Failed to parse TOML stations: {}", e),
        }
    }

    // 2. stations.toml beside executable (bundled distribution)
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let beside = dir.join("stations.toml");
            if beside.exists() {
                match load_stations_from_toml(&beside) {
                    Ok(s) => {
                        info!(
                            "Loaded {} stations from beside-exe: {}",
                            s.len(),
                            beside.display()
                        );
                        return Ok(s);
                    }
                    Err(e) => warn!("Failed to parse beside-exe stations.toml: {}", e),
                }
            }
        }
    }

    // 3. stations.toml in working directory
    let local_toml = PathBuf::from("stations.toml");
    if local_toml.exists() {
        match load_stations_from_toml(&local_toml) {
            Ok(s) => {
                info!("Loaded {} stations from local stations.toml", s.len());
                return Ok(s);
            }
            Err(e) => warn!("Failed to parse local stations.toml: {}", e),
        }
    }

    // 4. m3u URL or file
    let source = &config.stations.m3u_url;
    if source.starts_with("http://") || source.starts_with("https://") {
        info!("Loading stations from m3u: {}", source);
        match fetch_m3u_url(source).await {
            Ok(s) => {
                info!("Loaded {} stations from URL", s.len());
                return Ok(s);
            }
            Err(e) => warn!("Failed to fetch stations from URL: {}", e),
        }
    } else if !source.is_empty() {
        let path = PathBuf::from(source);
        match load_stations_from_m3u(&path) {
            Ok(s) => {
                info!("Loaded {} stations from m3u file", s.len());
                return Ok(s);
            }
            Err(e) => warn!("Failed to read m3u file {}: {}", path.display(), e),
        }
    }

    info!("No station source available, starting with empty list");
    Ok(Vec::new())
}

async fn fetch_m3u_url(url: &str) -> anyhow::Result<Vec<Station>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    parse_m3u_from_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PlaybackStatus;

    #[test]
    fn toml_catalog_with_channels() {
        let stations = parse_stations_from_toml_str(
            r#"
            [[station]]
            id = "kpfa"
            name = "KPFA"
            url = "https://streams.example.org/kpfa"
            frequency = "94.1 FM"

            [[station.channel]]
            id = "kpfb"
            name = "KPFB"
            url = "https://streams.example.org/kpfb"

            [[station]]
            name = "Radio Free Example"
            url = "https://streams.example.org/rfe"
            "#,
        )
        .unwrap();

        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].id, "kpfa");
        assert_eq!(stations[0].slug, "kpfa");
        assert_eq!(stations[0].channels.len(), 1);
        assert_eq!(
            stations[0].stream_url(Some("kpfb")),
            "https://streams.example.org/kpfb"
        );
        assert_eq!(stations[1].id, "radio-free-example");
        assert!(stations[1].channels.is_empty());
    }

    #[test]
    fn m3u_names_and_urls() {
        let stations = parse_m3u_from_str(
            "#EXTM3U\n#EXTINF:-1,Station One\nhttp://one.example/stream\nhttp://two.example/stream\n",
        )
        .unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].name, "Station One");
        assert_eq!(stations[0].id, "station-one");
        assert_eq!(stations[1].name, "http://two.example/stream");
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("  WFMU 91.1 -- Jersey City! "), "wfmu-91-1-jersey-city");
    }

    #[tokio::test]
    async fn publish_bumps_revision() {
        let manager = StateManager::new(Vec::new(), 0.5);
        let before = manager.get_state().await.rev;

        let mut session = PlaybackSession::new(0.5);
        session.begin_load("http://stream".into());
        manager.publish_session(&session, false).await;

        let state = manager.get_state().await;
        assert!(state.rev > before);
        assert_eq!(state.playback_status, PlaybackStatus::Loading);
        assert_eq!(state.stream_url.as_deref(), Some("http://stream"));
    }
}
