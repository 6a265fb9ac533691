//! Driver directory entries.
//!
//! The directory is owned by the driver-app heartbeat collaborator. The engine
//! only ever reads snapshots of it; see
//! [`DispatchStore::nearby_available_drivers`](crate::store::DispatchStore::nearby_available_drivers).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Coordinate;

/// Ratings are clamped to this ceiling when scored.
pub const MAX_RATING: f64 = 5.0;

/// One driver as last reported by their app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverCandidate {
  pub driver_id:         Uuid,
  /// `None` until the first heartbeat carrying a location arrives.
  pub position:          Option<Coordinate>,
  /// 0.0–5.0.
  pub rating:            f64,
  /// Mean fare over the driver's completed rides; `None` without history.
  pub avg_fare:          Option<Decimal>,
  /// Mean seconds between being notified and responding; `None` without
  /// history.
  pub avg_response_secs: Option<f64>,
  pub available:         bool,
  pub updated_at:        DateTime<Utc>,
}

impl DriverCandidate {
  /// A freshly-online driver with no history.
  pub fn new(driver_id: Uuid, position: Coordinate, rating: f64) -> Self {
    Self {
      driver_id,
      position: Some(position),
      rating,
      avg_fare: None,
      avg_response_secs: None,
      available: true,
      updated_at: Utc::now(),
    }
  }
}
