//! Driver matching: filter, score, rank, and truncate.
//!
//! A matching run takes a ride and a point-in-time snapshot of candidate
//! drivers and produces one [`DriverNotification`] per surviving candidate,
//! best first. It never mutates the ride or the directory.
//!
//! Each sub-score lies in `[0, 1]`:
//!
//! | Sub-score  | Formula                                         |
//! |------------|-------------------------------------------------|
//! | distance   | `1 / (1 + km)`                                  |
//! | rating     | `min(rating, 5) / 5`                            |
//! | fare       | `1 / (1 + abs(avg_fare - proposed_fare))`       |
//! | response   | `1 - min(avg_response_secs / 300, 1)`           |
//!
//! The total is the weighted sum. Weights are expected to sum to 1 but this
//! is not enforced.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  driver::{DriverCandidate, MAX_RATING},
  geo::distance_km,
  ride::Ride,
};

/// Response latency at which the response sub-score bottoms out.
pub const RESPONSE_CEILING_SECS: f64 = 300.0;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
  pub distance:             f64,
  pub rating:               f64,
  pub fare_competitiveness: f64,
  pub response_time:        f64,
}

impl Default for ScoreWeights {
  fn default() -> Self {
    Self {
      distance:             0.4,
      rating:               0.3,
      fare_competitiveness: 0.2,
      response_time:        0.1,
    }
  }
}

impl ScoreWeights {
  pub fn sum(&self) -> f64 {
    self.distance + self.rating + self.fare_competitiveness + self.response_time
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
  pub search_radius_km:      f64,
  pub max_drivers_to_notify: usize,
  pub weights:               ScoreWeights,
}

impl Default for MatchingConfig {
  fn default() -> Self {
    Self {
      search_radius_km:      5.0,
      max_drivers_to_notify: 5,
      weights:               ScoreWeights::default(),
    }
  }
}

impl MatchingConfig {
  pub fn validate(&self) -> Result<()> {
    if !(self.search_radius_km.is_finite() && self.search_radius_km > 0.0) {
      return Err(Error::InvalidInput(format!(
        "search_radius_km must be positive, got {}",
        self.search_radius_km
      )));
    }
    if self.max_drivers_to_notify == 0 {
      return Err(Error::InvalidInput(
        "max_drivers_to_notify must be at least 1".into(),
      ));
    }
    let w = &self.weights;
    for (name, value) in [
      ("distance", w.distance),
      ("rating", w.rating),
      ("fare_competitiveness", w.fare_competitiveness),
      ("response_time", w.response_time),
    ] {
      if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidInput(format!(
          "weight {name} must be a non-negative number, got {value}"
        )));
      }
    }
    if (w.sum() - 1.0).abs() > 1e-6 {
      tracing::warn!(sum = w.sum(), "matching weights do not sum to 1.0");
    }
    Ok(())
  }

  /// How many drivers a matching run pulls from the directory before
  /// scoring.
  pub fn pool_limit(&self) -> usize { self.max_drivers_to_notify.saturating_mul(3) }
}

// ─── Notifications ───────────────────────────────────────────────────────────

/// Per-candidate scoring detail, kept for observability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
  pub distance_km:    f64,
  pub distance_score: f64,
  pub rating_score:   f64,
  pub fare_score:     f64,
  pub response_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
  Pending,
  /// The driver answered with a bid.
  Bid,
  Declined,
  /// No answer within the configured window.
  Expired,
}

/// One candidate surfaced by one matching run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverNotification {
  pub notification_id: Uuid,
  pub ride_id:         Uuid,
  pub driver_id:       Uuid,
  pub score:           f64,
  pub breakdown:       ScoreBreakdown,
  pub status:          NotificationStatus,
  /// Seconds between notification and the driver's answer.
  pub response_secs:   Option<f64>,
  pub created_at:      DateTime<Utc>,
  pub resolved_at:     Option<DateTime<Utc>>,
}

impl DriverNotification {
  pub fn responded(&self) -> bool {
    matches!(self.status, NotificationStatus::Bid | NotificationStatus::Declined)
  }

  pub fn is_pending(&self) -> bool { self.status == NotificationStatus::Pending }

  /// Move out of `pending`. Returns `false`, changing nothing, if the
  /// notification was already resolved.
  pub fn resolve(&mut self, status: NotificationStatus, now: DateTime<Utc>) -> bool {
    if !self.is_pending() || status == NotificationStatus::Pending {
      return false;
    }
    if status != NotificationStatus::Expired {
      let elapsed = now.signed_duration_since(self.created_at);
      self.response_secs = Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
    }
    self.status = status;
    self.resolved_at = Some(now);
    true
  }
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// Rank `pool` for `ride`.
///
/// Candidates that are unavailable, have no position, or lie outside the
/// search radius are dropped. Candidates with malformed data (out-of-range
/// coordinates, non-finite rating) are skipped with a warning. Survivors are
/// sorted by total score descending, then distance ascending, then driver id,
/// and truncated to `max_drivers_to_notify`.
pub fn find_candidates(
  ride:   &Ride,
  pool:   &[DriverCandidate],
  config: &MatchingConfig,
  now:    DateTime<Utc>,
) -> Vec<DriverNotification> {
  let mut scored: Vec<(Uuid, f64, ScoreBreakdown)> = pool
    .iter()
    .filter(|c| c.available && c.driver_id != ride.rider_id)
    .filter_map(|c| score_candidate(ride, c, config))
    .collect();

  scored.sort_by(|(a_id, a_total, a), (b_id, b_total, b)| {
    b_total
      .total_cmp(a_total)
      .then_with(|| a.distance_km.partial_cmp(&b.distance_km).unwrap_or(Ordering::Equal))
      .then_with(|| a_id.cmp(b_id))
  });
  scored.truncate(config.max_drivers_to_notify);

  tracing::debug!(
    ride_id = %ride.ride_id,
    pool = pool.len(),
    matched = scored.len(),
    "matching run finished"
  );

  scored
    .into_iter()
    .map(|(driver_id, score, breakdown)| DriverNotification {
      notification_id: Uuid::new_v4(),
      ride_id: ride.ride_id,
      driver_id,
      score,
      breakdown,
      status: NotificationStatus::Pending,
      response_secs: None,
      created_at: now,
      resolved_at: None,
    })
    .collect()
}

fn score_candidate(
  ride:      &Ride,
  candidate: &DriverCandidate,
  config:    &MatchingConfig,
) -> Option<(Uuid, f64, ScoreBreakdown)> {
  let position = candidate.position?;
  if !position.is_valid() {
    tracing::warn!(
      driver_id = %candidate.driver_id,
      latitude = position.latitude,
      longitude = position.longitude,
      "skipping candidate with malformed position"
    );
    return None;
  }

  let km = distance_km(&ride.pickup, &position);
  if km.is_nan() || km > config.search_radius_km {
    return None;
  }

  let fare_gap = match (candidate.avg_fare, ride.proposed_fare) {
    (Some(avg), Some(asked)) => (avg - asked).abs().to_f64(),
    _ => Some(0.0),
  };
  let response_secs = candidate.avg_response_secs.unwrap_or(RESPONSE_CEILING_SECS / 2.0);
  // NaN and negative ratings fall through and are skipped below.
  let rating_score = if candidate.rating > MAX_RATING {
    1.0
  } else {
    candidate.rating / MAX_RATING
  };

  let breakdown = ScoreBreakdown {
    distance_km:    km,
    distance_score: 1.0 / (1.0 + km),
    rating_score,
    fare_score:     fare_gap.map_or(f64::NAN, |gap| 1.0 / (1.0 + gap)),
    response_score: 1.0 - (response_secs / RESPONSE_CEILING_SECS).min(1.0),
  };

  let w = &config.weights;
  let total = w.distance * breakdown.distance_score
    + w.rating * breakdown.rating_score
    + w.fare_competitiveness * breakdown.fare_score
    + w.response_time * breakdown.response_score;

  if !total.is_finite() || !in_unit_range(&breakdown) {
    tracing::warn!(
      driver_id = %candidate.driver_id,
      ?breakdown,
      "skipping candidate with unscorable data"
    );
    return None;
  }

  Some((candidate.driver_id, total, breakdown))
}

fn in_unit_range(b: &ScoreBreakdown) -> bool {
  [b.distance_score, b.rating_score, b.fare_score, b.response_score]
    .iter()
    .all(|s| (0.0..=1.0).contains(s))
}
