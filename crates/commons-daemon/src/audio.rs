/// Audio backend seam.
///
/// The controller never talks to mpv directly.  It opens `AudioSource`s
/// through an `AudioBackend`, drives their gain and pause state, and learns
/// about start/failure through `SourceEvent`s the backend pushes into the
/// channel it was constructed with.
use std::future::Future;

use commons_proto::error::FailureKind;

pub type SourceId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEventKind {
    /// Audio is flowing.
    Playing,
    Failed(FailureKind),
}

/// Unsolicited notification about one source.  Carries the URL the source was
/// opened with so the controller can discard events from superseded streams.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub source: SourceId,
    pub url: String,
    pub kind: SourceEventKind,
}

/// One decoding/playing stream.  Clones refer to the same underlying source.
pub trait AudioSource: Clone + Send + Sync + 'static {
    fn id(&self) -> SourceId;
    fn url(&self) -> &str;
    /// Linear gain, 0.0 to 1.0.
    fn set_gain(&self, gain: f32) -> impl Future<Output = ()> + Send;
    fn set_paused(&self, paused: bool) -> impl Future<Output = ()> + Send;
    /// Stop and free the source.  Safe to call more than once.
    fn release(&self) -> impl Future<Output = ()> + Send;
}

pub trait AudioBackend: Send + Sync + 'static {
    type Source: AudioSource;

    fn open(
        &self,
        url: &str,
        gain: f32,
    ) -> impl Future<Output = anyhow::Result<Self::Source>> + Send;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording backend for controller and mixer tests.

    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Open { id: SourceId, url: String, gain: f32 },
        Gain { id: SourceId, gain: f32 },
        Paused { id: SourceId, paused: bool },
        Release { id: SourceId },
    }

    #[derive(Default)]
    struct Inner {
        next_id: SourceId,
        calls: Vec<Call>,
        /// Unreleased sources: id -> (url, gain, paused).
        live: BTreeMap<SourceId, (String, f32, bool)>,
        failing: HashSet<String>,
    }

    #[derive(Clone, Default)]
    pub struct FakeBackend {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `open` fail for `url`.
        pub fn fail_opens_for(&self, url: &str) {
            self.inner.lock().unwrap().failing.insert(url.to_string());
        }

        pub fn calls(&self) -> Vec<Call> {
            self.inner.lock().unwrap().calls.clone()
        }

        pub fn opens(&self) -> Vec<(SourceId, String)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Open { id, url, .. } => Some((id, url)),
                    _ => None,
                })
                .collect()
        }

        /// (id, url) of every source not yet released.
        pub fn live(&self) -> Vec<(SourceId, String)> {
            self.inner
                .lock()
                .unwrap()
                .live
                .iter()
                .map(|(id, (url, _, _))| (*id, url.clone()))
                .collect()
        }

        pub fn gain(&self, id: SourceId) -> Option<f32> {
            self.inner.lock().unwrap().live.get(&id).map(|s| s.1)
        }

        pub fn is_paused(&self, id: SourceId) -> Option<bool> {
            self.inner.lock().unwrap().live.get(&id).map(|s| s.2)
        }

        pub fn is_released(&self, id: SourceId) -> bool {
            self.calls().contains(&Call::Release { id })
        }
    }

    #[derive(Clone)]
    pub struct FakeSource {
        id: SourceId,
        url: String,
        inner: Arc<Mutex<Inner>>,
    }

    impl AudioSource for FakeSource {
        fn id(&self) -> SourceId {
            self.id
        }

        fn url(&self) -> &str {
            &self.url
        }

        async fn set_gain(&self, gain: f32) {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::Gain { id: self.id, gain });
            if let Some(s) = inner.live.get_mut(&self.id) {
                s.1 = gain;
            }
        }

        async fn set_paused(&self, paused: bool) {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::Paused {
                id: self.id,
                paused,
            });
            if let Some(s) = inner.live.get_mut(&self.id) {
                s.2 = paused;
            }
        }

        async fn release(&self) {
            let mut inner = self.inner.lock().unwrap();
            if inner.live.remove(&self.id).is_some() {
                inner.calls.push(Call::Release { id: self.id });
            }
        }
    }

    impl AudioBackend for FakeBackend {
        type Source = FakeSource;

        async fn open(&self, url: &str, gain: f32) -> anyhow::Result<FakeSource> {
            let mut inner = self.inner.lock().unwrap();
            if inner.failing.contains(url) {
                anyhow::bail!("connection refused");
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.calls.push(Call::Open {
                id,
                url: url.to_string(),
                gain,
            });
            inner.live.insert(id, (url.to_string(), gain, false));
            Ok(FakeSource {
                id,
                url: url.to_string(),
                inner: Arc::clone(&self.inner),
            })
        }
    }
}
