// =============================================================================
// Reconnect Backoff — exponential delay with jitter for stream supervisors
// =============================================================================

use std::time::Duration;

use rand::Rng;

use crate::runtime_config::ReconnectSettings;

#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(settings: &ReconnectSettings) -> Self {
        let initial = Duration::from_millis(settings.initial_delay_ms.max(1));
        Self {
            initial,
            max: Duration::from_millis(settings.max_delay_ms.max(settings.initial_delay_ms)),
            multiplier: settings.multiplier.max(1.0),
            jitter_factor: settings.jitter_factor.clamp(0.0, 1.0),
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Grows geometrically up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let delay = self.jittered(self.current);

        let scaled = self.current.as_millis() as f64 * self.multiplier;
        let next_ms = if scaled.is_finite() { scaled as u64 } else { u64::MAX };
        self.current = Duration::from_millis(next_ms).min(self.max);

        delay
    }

    /// Call after a connection has been established and authenticated.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return base;
        }
        let ms = base.as_millis() as f64;
        let spread = ms * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((ms + jitter).max(0.0) as u64)
    }
}
