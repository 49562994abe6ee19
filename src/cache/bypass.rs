//! Recent-mutation markers that stop slow reads from clobbering fast writes.
//!
//! A marker never blocks anything. It only decides whether a fetch that has
//! already completed may be applied: a fetch that started before the marker
//! was set, and completes while the marker's window is still open, reflects
//! pre-mutation state and must be discarded.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::clock::Clock;

/// A "this resource was just mutated" note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassMarker {
  pub resource_key: String,
  pub marked_at: DateTime<Utc>,
  pub window: Duration,
}

impl BypassMarker {
  pub fn is_active(&self, now: DateTime<Utc>) -> bool {
    now - self.marked_at < self.window
  }
}

/// Tracks bypass markers per resource key.
pub struct BypassTracker {
  clock: Arc<dyn Clock>,
  markers: Mutex<HashMap<String, BypassMarker>>,
}

impl BypassTracker {
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self {
      clock,
      markers: Mutex::new(HashMap::new()),
    }
  }

  /// Record a mutation of `resource_key` now. Re-marking replaces the older
  /// marker.
  pub fn mark(&self, resource_key: &str, window: Duration) {
    let now = self.clock.now();
    let mut markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
    prune(&mut markers, now);
    markers.insert(
      resource_key.to_string(),
      BypassMarker {
        resource_key: resource_key.to_string(),
        marked_at: now,
        window,
      },
    );
  }

  /// Whether a fetch of `resource_key` that started at `fetch_started_at`
  /// must be discarded.
  pub fn is_bypassed(&self, resource_key: &str, fetch_started_at: DateTime<Utc>) -> bool {
    let now = self.clock.now();
    let mut markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
    prune(&mut markers, now);

    let bypassed = markers
      .get(resource_key)
      .is_some_and(|m| fetch_started_at < m.marked_at && m.is_active(now));
    if bypassed {
      trace!(resource_key, %fetch_started_at, "fetch predates recent mutation");
    }
    bypassed
  }

  /// Active marker for a key, if any.
  pub fn marker(&self, resource_key: &str) -> Option<BypassMarker> {
    let now = self.clock.now();
    let markers = self.markers.lock().unwrap_or_else(|e| e.into_inner());
    markers
      .get(resource_key)
      .filter(|m| m.is_active(now))
      .cloned()
  }

  /// Number of markers currently held (expired ones included until pruned).
  pub fn len(&self) -> usize {
    self.markers.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn prune(markers: &mut HashMap<String, BypassMarker>, now: DateTime<Utc>) {
  markers.retain(|_, m| m.is_active(now));
}
