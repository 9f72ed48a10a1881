/// Gain ramp between two sources during a station switch.
use std::time::Duration;

use commons_proto::config::PlaybackConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audio::AudioSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadePlan {
    pub duration: Duration,
    pub steps: u32,
}

impl FadePlan {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            duration: Duration::from_millis(config.crossfade_ms),
            steps: config.crossfade_steps.max(1),
        }
    }

    pub fn step_interval(&self) -> Duration {
        self.duration / self.steps.max(1)
    }

    /// (outgoing, incoming) gains after `step` of `steps`.  The pair always
    /// sums to `volume`.
    pub fn gains(&self, volume: f32, step: u32) -> (f32, f32) {
        let progress = step.min(self.steps) as f32 / self.steps.max(1) as f32;
        let incoming = volume * progress;
        (volume - incoming, incoming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeOutcome {
    Completed,
    Cancelled,
}

/// Ramp `outgoing` down and `incoming` up to `volume`.  The outgoing source is
/// released on every exit path; the incoming source is left alone on cancel
/// so the caller decides its fate.
pub async fn run<S: AudioSource>(
    outgoing: S,
    incoming: S,
    volume: f32,
    plan: FadePlan,
    token: CancellationToken,
) -> FadeOutcome {
    let interval = plan.step_interval();
    debug!(
        "crossfade {} -> {} in {} steps",
        outgoing.url(),
        incoming.url(),
        plan.steps
    );
    for step in 1..=plan.steps.max(1) {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("crossfade cancelled at step {}", step);
                outgoing.release().await;
                return FadeOutcome::Cancelled;
            }
            _ = tokio::time::sleep(interval) => {}
        }
        let (out_gain, in_gain) = plan.gains(volume, step);
        // Lower first so the sum never overshoots between the two writes.
        outgoing.set_gain(out_gain).await;
        incoming.set_gain(in_gain).await;
    }
    outgoing.release().await;
    FadeOutcome::Completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::{Call, FakeBackend};
    use crate::audio::AudioBackend;
    use tokio::time::Instant;

    const EPS: f32 = 1e-4;

    fn plan() -> FadePlan {
        FadePlan {
            duration: Duration::from_millis(1000),
            steps: 20,
        }
    }

    #[test]
    fn gains_are_complementary() {
        let p = plan();
        for step in 0..=20 {
            let (out, inc) = p.gains(0.8, step);
            assert!((out + inc - 0.8).abs() < EPS);
            assert!(out >= -EPS && inc >= -EPS);
        }
        assert_eq!(p.gains(0.8, 0), (0.8, 0.0));
        let (out, inc) = p.gains(0.8, 20);
        assert!(out.abs() < EPS);
        assert!((inc - 0.8).abs() < EPS);
        assert_eq!(p.step_interval(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn full_ramp_releases_outgoing() {
        let backend = FakeBackend::new();
        let outgoing = backend.open("http://old", 0.8).await.unwrap();
        let incoming = backend.open("http://new", 0.0).await.unwrap();

        let started = Instant::now();
        let outcome = run(
            outgoing.clone(),
            incoming.clone(),
            0.8,
            plan(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome, FadeOutcome::Completed);
        assert!(started.elapsed() <= Duration::from_millis(1000));

        assert!(backend.is_released(outgoing.id()));
        assert!((backend.gain(incoming.id()).unwrap() - 0.8).abs() < EPS);
        assert_eq!(backend.live().len(), 1);

        // Replay the gain writes and check the audible sum at every step.
        let (mut out_gain, mut in_gain) = (0.8f32, 0.0f32);
        let mut steps = 0;
        for call in backend.calls() {
            if let Call::Gain { id, gain } = call {
                if id == outgoing.id() {
                    out_gain = gain;
                } else {
                    in_gain = gain;
                    steps += 1;
                }
                assert!(out_gain + in_gain <= 0.8 + EPS);
            }
        }
        assert_eq!(steps, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_ramp_and_releases_outgoing() {
        let backend = FakeBackend::new();
        let outgoing = backend.open("http://old", 0.5).await.unwrap();
        let incoming = backend.open("http://new", 0.0).await.unwrap();
        let token = CancellationToken::new();

        let task = tokio::spawn(run(
            outgoing.clone(),
            incoming.clone(),
            0.5,
            plan(),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(275)).await;
        token.cancel();

        assert_eq!(task.await.unwrap(), FadeOutcome::Cancelled);
        assert!(backend.is_released(outgoing.id()));
        assert!(!backend.is_released(incoming.id()));
        let partial = backend.gain(incoming.id()).unwrap();
        assert!(partial > 0.0 && partial < 0.5);
    }
}
