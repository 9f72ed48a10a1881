/// DaemonCore: single-owner event loop for all mutable playback state.
///
/// Every input (client commands, audio source events, retry timers, crossfade
/// completion, now-playing results) arrives as a `DaemonEvent` on one mpsc
/// channel.  DaemonCore owns the `PlaybackSession`, the audio sources, the
/// navigator and the preferences store exclusively; no other task touches
/// them.  After each event it publishes a snapshot into `StateManager` and
/// broadcasts `BroadcastMessage::StateUpdated`.
///
/// Asynchronous continuations are validated against the session's desired
/// stream URL (and, for source events, the id of the primary source) before
/// they are allowed to change anything.
use std::sync::Arc;

use commons_proto::config::Config;
use commons_proto::error::{FailureKind, STREAM_UNAVAILABLE};
use commons_proto::navigator::Navigator;
use commons_proto::protocol::{Command, MediaSession, NowPlaying, PlaybackStatus, Station};
use commons_proto::session::PlaybackSession;
use commons_proto::state::StateManager;
use commons_proto::store::{self, KeyValueStore, LAST_PLAYED_KEY, VOLUME_KEY};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioBackend, AudioSource, SourceEvent, SourceEventKind, SourceId};
use crate::crossfade::{self, FadeOutcome, FadePlan};
use crate::poller::{MetadataProbe, Poller};
use crate::retry::{RetryDecision, RetryManager, RetryPolicy};
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a TCP client or the HTTP API.
    ClientCommand(Command),
    /// Start/failure report from the audio backend.
    Source(SourceEvent),
    /// A backoff timer for `url` elapsed.
    RetryDue { url: String },
    /// The crossfade into source `incoming` ran to completion.
    CrossfadeFinished { incoming: SourceId },
    /// One now-playing probe result for `url`.
    NowPlaying { url: String, snapshot: NowPlaying },
    /// Shutdown requested.
    Shutdown,
}

struct ActiveFade {
    incoming: SourceId,
    token: CancellationToken,
    handle: JoinHandle<FadeOutcome>,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore<B: AudioBackend, P: MetadataProbe> {
    backend: B,
    stations: Vec<Station>,
    state_manager: Arc<StateManager>,
    store: Box<dyn KeyValueStore>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    event_tx: mpsc::Sender<DaemonEvent>,
    session: PlaybackSession,
    navigator: Navigator,
    /// The source for the desired URL.  `None` while idle, retrying or failed.
    primary: Option<B::Source>,
    fade: Option<ActiveFade>,
    fade_plan: FadePlan,
    retry: RetryManager,
    poller: Poller<P>,
}

impl<B: AudioBackend, P: MetadataProbe> DaemonCore<B, P> {
    pub async fn new(
        config: &Config,
        backend: B,
        probe: Arc<P>,
        stations: Vec<Station>,
        store: Box<dyn KeyValueStore>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let volume = store
            .get(VOLUME_KEY)
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(config.audio.default_volume);

        let mut session = PlaybackSession::new(volume);
        if let Some(last) = store.get(LAST_PLAYED_KEY) {
            session.station = stations.iter().position(|s| s.id == last);
            if let Some(idx) = session.station {
                info!("Restored last-played station: {}", stations[idx].name);
            }
        }

        let state_manager = Arc::new(StateManager::new(stations.clone(), session.volume));
        state_manager
            .set_favorites(store::load_favorites(store.as_ref()))
            .await;

        let core = Self {
            backend,
            navigator: Navigator::new(stations.len()),
            stations,
            state_manager,
            store,
            broadcast_tx,
            retry: RetryManager::new(RetryPolicy::from_config(&config.playback), event_tx.clone()),
            poller: Poller::new(probe, config.now_playing.poll_interval(), event_tx.clone()),
            event_tx,
            session,
            primary: None,
            fade: None,
            fade_plan: FadePlan::from_config(&config.playback),
        };
        core.publish().await;
        core
    }

    /// Borrow the state manager (for the HTTP and socket servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run the core event loop until `Shutdown` or the channel closes.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt).await {
                info!("DaemonCore: shutdown requested");
                break;
            }
        }
        self.close().await;
        Ok(())
    }

    /// Apply one event.  Returns `false` when the loop should stop.
    pub async fn handle_event(&mut self, evt: DaemonEvent) -> bool {
        match evt {
            DaemonEvent::Shutdown => return false,
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                if let Err(e) = self.handle_command(cmd).await {
                    error!("DaemonCore: command error: {}", e);
                }
            }
            DaemonEvent::Source(evt) => self.handle_source_event(evt).await,
            DaemonEvent::RetryDue { url } => self.handle_retry_due(url).await,
            DaemonEvent::CrossfadeFinished { incoming } => {
                if self.fade.as_ref().map(|f| f.incoming) == Some(incoming) {
                    self.fade = None;
                    info!("DaemonCore: crossfade complete");
                }
            }
            DaemonEvent::NowPlaying { url, snapshot } => {
                if !self.session.is_desired(&url) || self.session.status != PlaybackStatus::Playing
                {
                    debug!("DaemonCore: dropping now-playing result for {}", url);
                    return true;
                }
                if self.session.now_playing.as_ref() != Some(&snapshot) {
                    self.session.now_playing = Some(snapshot.clone());
                    let _ = self
                        .broadcast_tx
                        .send(BroadcastMessage::NowPlayingUpdated(Some(snapshot)));
                }
            }
        }
        self.publish().await;
        true
    }

    // ── command handlers ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Play {
                station_idx,
                channel,
            } => self.play_station(station_idx, channel).await,
            Command::PlayUrl { url } => {
                self.session.station = None;
                self.session.channel = None;
                self.session.media_session = Some(MediaSession {
                    title: url.clone(),
                    ..MediaSession::default()
                });
                self.play_url(url).await;
            }
            Command::Pause => self.pause().await,
            Command::Resume => self.resume().await,
            Command::TogglePause => self.toggle_pause().await,
            Command::Close => self.close().await,
            Command::Next => {
                if let Some(idx) = self.navigator.next(self.session.station) {
                    self.play_station(idx, None).await;
                }
            }
            Command::Prev => {
                if let Some(idx) = self.navigator.previous(self.session.station) {
                    self.play_station(idx, None).await;
                }
            }
            Command::Random => match self.navigator.random(self.session.station) {
                Some(idx) => self.play_station(idx, None).await,
                None => debug!("DaemonCore: random has no alternative station"),
            },
            Command::Volume { value } => self.set_volume(value).await,
            Command::ToggleFavorite { station_id } => {
                let favorites = store::toggle_favorite(self.store.as_mut(), &station_id)?;
                self.state_manager.set_favorites(favorites).await;
            }
            Command::GetState => {
                // State will be broadcast automatically
            }
        }
        Ok(())
    }

    async fn play_station(&mut self, idx: usize, channel: Option<String>) {
        let Some(station) = self.stations.get(idx).cloned() else {
            warn!("DaemonCore: no station at index {}", idx);
            return;
        };
        let channel = channel.filter(|id| station.channel(id).is_some());
        let url = station.stream_url(channel.as_deref()).to_string();
        info!("Playing station: {} ({})", station.name, url);

        self.session.station = Some(idx);
        self.session.channel = channel;
        self.session.media_session = Some(station.media_session());
        if let Err(e) = self.store.set(LAST_PLAYED_KEY, &station.id) {
            warn!("Failed to persist last-played station: {}", e);
        }
        self.play_url(url).await;
    }

    /// Make `url` the desired stream.
    async fn play_url(&mut self, url: String) {
        if self.session.is_desired(&url) {
            match self.session.status {
                PlaybackStatus::Loading | PlaybackStatus::Retrying | PlaybackStatus::Playing => {
                    debug!("DaemonCore: {} already {:?}", url, self.session.status);
                    return;
                }
                PlaybackStatus::Paused => {
                    self.resume().await;
                    return;
                }
                PlaybackStatus::Idle | PlaybackStatus::Failed => {}
            }
        }

        let audible = self.session.status == PlaybackStatus::Playing && self.primary.is_some();
        self.retry.cancel();
        self.poller.stop();
        self.cancel_fade().await;
        self.session.begin_load(url.clone());

        match self.primary.take() {
            Some(outgoing) if audible => match self.backend.open(&url, 0.0).await {
                Ok(incoming) => {
                    info!("DaemonCore: crossfading into {}", url);
                    self.start_fade(outgoing, incoming.clone());
                    self.primary = Some(incoming);
                }
                Err(e) => {
                    warn!("Failed to open stream {}: {}", url, e);
                    outgoing.release().await;
                    self.handle_failure(FailureKind::Network).await;
                }
            },
            previous => {
                if let Some(source) = previous {
                    source.release().await;
                }
                self.open_primary(&url).await;
            }
        }
    }

    async fn open_primary(&mut self, url: &str) {
        match self.backend.open(url, self.session.volume).await {
            Ok(source) => self.primary = Some(source),
            Err(e) => {
                warn!("Failed to open stream {}: {}", url, e);
                self.handle_failure(FailureKind::Network).await;
            }
        }
    }

    async fn pause(&mut self) {
        if self.session.status != PlaybackStatus::Playing {
            debug!("DaemonCore: pause ignored in {:?}", self.session.status);
            return;
        }
        self.finish_fade_early().await;
        if let Some(source) = &self.primary {
            source.set_paused(true).await;
        }
        self.poller.stop();
        self.session.status = PlaybackStatus::Paused;
        info!("DaemonCore: status Playing → Paused");
    }

    async fn resume(&mut self) {
        if self.session.status != PlaybackStatus::Paused {
            debug!("DaemonCore: resume ignored in {:?}", self.session.status);
            return;
        }
        if let Some(source) = &self.primary {
            source.set_paused(false).await;
        }
        self.session.status = PlaybackStatus::Playing;
        if let Some(url) = self.session.stream_url.clone() {
            self.poller.start(&url);
        }
        info!("DaemonCore: status Paused → Playing");
    }

    async fn toggle_pause(&mut self) {
        match self.session.status {
            PlaybackStatus::Playing => self.pause().await,
            PlaybackStatus::Paused => self.resume().await,
            PlaybackStatus::Idle | PlaybackStatus::Failed => {
                if let Some(idx) = self.session.station {
                    let channel = self.session.channel.clone();
                    self.play_station(idx, channel).await;
                }
            }
            PlaybackStatus::Loading | PlaybackStatus::Retrying => {}
        }
    }

    /// Release everything and return to an empty session.
    async fn close(&mut self) {
        info!("Closing player");
        if self.retry.is_pending() {
            debug!("DaemonCore: dropping pending retry");
        }
        self.retry.cancel();
        self.cancel_fade().await;
        if let Some(url) = self.poller.polling() {
            debug!("DaemonCore: stopping now-playing poll for {}", url);
        }
        self.poller.stop();
        if let Some(source) = self.primary.take() {
            source.release().await;
        }
        self.session.reset();
        self.navigator.clear_history();
    }

    async fn set_volume(&mut self, value: f32) {
        let volume = self.session.set_volume(value);
        if !self.finish_fade_early().await {
            if let Some(source) = &self.primary {
                source.set_gain(volume).await;
            }
        }
        if let Err(e) = self.store.set(VOLUME_KEY, &volume.to_string()) {
            warn!("Failed to persist volume: {}", e);
        }
    }

    // ── source events and failure recovery ────────────────────────────────────

    async fn handle_source_event(&mut self, evt: SourceEvent) {
        let from_primary = self
            .primary
            .as_ref()
            .is_some_and(|s| s.id() == evt.source && s.url() == evt.url);
        if !from_primary || !self.session.is_desired(&evt.url) {
            debug!(
                "DaemonCore: ignoring {:?} from superseded source {} ({})",
                evt.kind, evt.source, evt.url
            );
            return;
        }

        match evt.kind {
            SourceEventKind::Playing => {
                if self.session.status != PlaybackStatus::Loading {
                    return;
                }
                info!("DaemonCore: status Loading → Playing ({})", evt.url);
                self.session.mark_playing();
                self.poller.start(&evt.url);
            }
            SourceEventKind::Failed(kind) => {
                warn!("Stream {} failed: {}", evt.url, kind);
                self.handle_failure(kind).await;
            }
        }
    }

    async fn handle_failure(&mut self, kind: FailureKind) {
        self.cancel_fade().await;
        self.poller.stop();
        if let Some(source) = self.primary.take() {
            source.release().await;
        }
        self.session.now_playing = None;

        let Some(url) = self.session.stream_url.clone() else {
            return;
        };

        if self.session.status == PlaybackStatus::Paused {
            self.session.status = PlaybackStatus::Failed;
            self.session.last_error = Some(STREAM_UNAVAILABLE.to_string());
            return;
        }

        match self.retry.schedule(&url, self.session.retry_attempt) {
            RetryDecision::Scheduled { attempt, delay } => {
                info!(
                    "DaemonCore: retry {} for {} in {:?}",
                    attempt, url, delay
                );
                self.session.status = PlaybackStatus::Retrying;
                self.session.retry_attempt = attempt;
                self.session.last_error = Some(kind.to_string());
            }
            RetryDecision::Exhausted => {
                warn!("DaemonCore: {} unavailable after retries", url);
                self.session.status = PlaybackStatus::Failed;
                self.session.last_error = Some(STREAM_UNAVAILABLE.to_string());
            }
        }
    }

    async fn handle_retry_due(&mut self, url: String) {
        let wanted = self.retry.take_due(&url)
            && self.session.is_desired(&url)
            && self.session.status == PlaybackStatus::Retrying;
        if !wanted {
            debug!("DaemonCore: dropping stale retry for {}", url);
            return;
        }
        info!(
            "DaemonCore: retrying {} (attempt {})",
            url, self.session.retry_attempt
        );
        self.session.status = PlaybackStatus::Loading;
        self.open_primary(&url).await;
    }

    // ── crossfade ─────────────────────────────────────────────────────────────

    fn start_fade(&mut self, outgoing: B::Source, incoming: B::Source) {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let events = self.event_tx.clone();
        let incoming_id = incoming.id();
        let volume = self.session.volume;
        let plan = self.fade_plan;

        let handle = tokio::spawn(async move {
            let outcome =
                crossfade::run(outgoing, incoming, volume, plan, cancelled.clone()).await;
            if outcome == FadeOutcome::Completed {
                // cancel_fade cancels the token before awaiting this task, so a
                // full queue cannot hold it up.
                tokio::select! {
                    _ = cancelled.cancelled() => {}
                    _ = events.send(DaemonEvent::CrossfadeFinished {
                        incoming: incoming_id,
                    }) => {}
                }
            }
            outcome
        });

        self.fade = Some(ActiveFade {
            incoming: incoming_id,
            token,
            handle,
        });
    }

    /// Stop a running fade; the mixer releases the outgoing source.  Returns
    /// whether a fade was running.
    async fn cancel_fade(&mut self) -> bool {
        let Some(fade) = self.fade.take() else {
            return false;
        };
        fade.token.cancel();
        match fade.handle.await {
            Ok(outcome) => debug!("DaemonCore: crossfade ended {:?}", outcome),
            Err(e) => warn!("DaemonCore: crossfade task failed: {}", e),
        }
        true
    }

    /// Jump a running fade to its end state: outgoing gone, primary at volume.
    async fn finish_fade_early(&mut self) -> bool {
        if !self.cancel_fade().await {
            return false;
        }
        if let Some(source) = &self.primary {
            source.set_gain(self.session.volume).await;
        }
        true
    }

    async fn publish(&self) {
        self.state_manager
            .publish_session(&self.session, self.fade.is_some())
            .await;
        self.state_manager
            .set_history_len(self.navigator.history_len())
            .await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}
