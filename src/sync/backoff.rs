//! Retry policy for sync queue items.

use chrono::Duration;
use rand::Rng;

/// Exponential backoff with a cap, jitter and an attempt limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  /// Delay after the first failed attempt
  pub base: Duration,
  /// Upper bound for any single delay
  pub cap: Duration,
  /// Fraction of the delay that is randomized away (0.0 disables jitter)
  pub jitter_ratio: f64,
  /// Attempts after which an item fails terminally
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base: Duration::seconds(1),
      cap: Duration::seconds(60),
      jitter_ratio: 0.2,
      max_attempts: 10,
    }
  }
}

impl RetryPolicy {
  /// Deterministic delay after `attempts` failures: `base * 2^(attempts-1)`,
  /// capped.
  pub fn raw_delay(&self, attempts: u32) -> Duration {
    let exponent = attempts.max(1).saturating_sub(1).min(30);
    let base_ms = self.base.num_milliseconds().max(0);
    let delay_ms = base_ms.saturating_mul(1_i64 << exponent);
    Duration::milliseconds(delay_ms.min(self.cap.num_milliseconds()))
  }

  /// Delay with jitter applied, in `[(1 - jitter) * raw, raw]`.
  pub fn delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
    let raw = self.raw_delay(attempts).num_milliseconds();
    let ratio = self.jitter_ratio.clamp(0.0, 1.0);
    if ratio == 0.0 || raw == 0 {
      return Duration::milliseconds(raw);
    }
    let spread = (raw as f64 * ratio) as i64;
    let cut = rng.gen_range(0..=spread);
    Duration::milliseconds(raw - cut)
  }

  pub fn delay(&self, attempts: u32) -> Duration {
    self.delay_with(attempts, &mut rand::thread_rng())
  }

  /// Whether an item that has failed `attempts` times should stop retrying.
  pub fn exhausted(&self, attempts: u32) -> bool {
    attempts >= self.max_attempts
  }
}
