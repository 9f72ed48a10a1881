/// Periodic now-playing refresh for the stream that is currently audible.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use commons_proto::icy::IcyProbe;
use commons_proto::protocol::NowPlaying;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::DaemonEvent;

/// Anything that can answer "what is this stream playing right now".
pub trait MetadataProbe: Send + Sync + 'static {
    fn probe(&self, url: &str) -> impl Future<Output = NowPlaying> + Send;
}

impl MetadataProbe for IcyProbe {
    fn probe(&self, url: &str) -> impl Future<Output = NowPlaying> + Send {
        IcyProbe::probe(self, url)
    }
}

struct ActivePoll {
    url: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// At most one polling task.  Probes are serialized inside the task, so a
/// slow probe delays the next tick instead of overlapping it.
pub struct Poller<P> {
    probe: Arc<P>,
    interval: Duration,
    events: mpsc::Sender<DaemonEvent>,
    active: Option<ActivePoll>,
}

impl<P: MetadataProbe> Poller<P> {
    pub fn new(probe: Arc<P>, interval: Duration, events: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            probe,
            interval,
            events,
            active: None,
        }
    }

    /// Start polling `url`, probing immediately.  Replaces any running poll.
    pub fn start(&mut self, url: &str) {
        self.stop();

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let probe = Arc::clone(&self.probe);
        let events = self.events.clone();
        let poll_url = url.to_string();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let snapshot = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    snapshot = probe.probe(&poll_url) => snapshot,
                };
                let event = DaemonEvent::NowPlaying {
                    url: poll_url.clone(),
                    snapshot,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            debug!("now-playing poll for {} stopped", poll_url);
        });

        self.active = Some(ActivePoll {
            url: url.to_string(),
            token,
            handle,
        });
    }

    /// Stop polling and abandon any probe in flight.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.token.cancel();
            active.handle.abort();
        }
    }

    pub fn polling(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.url.as_str())
    }
}

impl<P> Drop for Poller<P> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.token.cancel();
            active.handle.abort();
        }
    }
}
