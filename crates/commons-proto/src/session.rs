//! The single mutable playback root.
//!
//! A `PlaybackSession` is owned by exactly one controller.  Other components
//! receive the values they need from it (the desired URL, the volume) rather
//! than a handle to shared mutable state, so there is one writer and one
//! authoritative "desired stream URL".

use crate::protocol::{MediaSession, NowPlaying, PlaybackStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSession {
    /// Index into the catalog; `None` for ad-hoc URLs or an empty session.
    pub station: Option<usize>,
    pub channel: Option<String>,
    /// The stream the user currently wants.  Every asynchronous continuation
    /// compares against this before acting.
    pub stream_url: Option<String>,
    pub status: PlaybackStatus,
    pub volume: f32,
    pub last_error: Option<String>,
    /// Failed attempts since the last successful start (0..=max_retries).
    pub retry_attempt: u32,
    pub now_playing: Option<NowPlaying>,
    pub media_session: Option<MediaSession>,
}

impl PlaybackSession {
    pub fn new(volume: f32) -> Self {
        Self {
            station: None,
            channel: None,
            stream_url: None,
            status: PlaybackStatus::Idle,
            volume: volume.clamp(0.0, 1.0),
            last_error: None,
            retry_attempt: 0,
            now_playing: None,
            media_session: None,
        }
    }

    /// True when `url` is the stream the session currently wants.
    pub fn is_desired(&self, url: &str) -> bool {
        self.stream_url.as_deref() == Some(url)
    }

    pub fn set_volume(&mut self, volume: f32) -> f32 {
        self.volume = volume.clamp(0.0, 1.0);
        self.volume
    }

    /// Point the session at a new stream; clears everything tied to the old one.
    pub fn begin_load(&mut self, url: String) {
        self.stream_url = Some(url);
        self.status = PlaybackStatus::Loading;
        self.retry_attempt = 0;
        self.last_error = None;
        self.now_playing = None;
    }

    pub fn mark_playing(&mut self) {
        self.status = PlaybackStatus::Playing;
        self.retry_attempt = 0;
        self.last_error = None;
    }

    /// Back to empty.  Volume is a listener preference and survives.
    pub fn reset(&mut self) {
        *self = Self::new(self.volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playing_resets_attempts() {
        let mut session = PlaybackSession::new(0.8);
        session.begin_load("http://a".into());
        session.retry_attempt = 2;
        session.last_error = Some("network failure".into());
        session.mark_playing();
        assert_eq!(session.retry_attempt, 0);
        assert_eq!(session.status, PlaybackStatus::Playing);
        assert!(session.last_error.is_none());
    }

    #[test]
    fn reset_keeps_volume_only() {
        let mut session = PlaybackSession::new(0.3);
        session.station = Some(4);
        session.begin_load("http://a".into());
        session.reset();
        assert_eq!(session, PlaybackSession::new(0.3));
    }

    #[test]
    fn volume_is_clamped() {
        let mut session = PlaybackSession::new(1.7);
        assert_eq!(session.volume, 1.0);
        assert_eq!(session.set_volume(-0.2), 0.0);
    }
}
