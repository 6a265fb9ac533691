//! Geocoding and routing collaborators.
//!
//! Both are reached over the network in production, so every call is
//! async and may fail. Implementations report failures as
//! [`Error::CollaboratorUnavailable`]; callers apply their own timeout.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  geo::{Coordinate, distance_km},
};

/// Result of a routing query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEstimate {
  pub eta_minutes: f64,
  pub distance_km: f64,
  /// Google encoded polyline of the route.
  pub polyline:    String,
}

/// Turns a coordinate into a human-readable address.
pub trait Geocoder: Send + Sync {
  fn reverse_geocode(
    &self,
    at: Coordinate,
  ) -> impl Future<Output = Result<String>> + Send + '_;
}

/// Computes travel time and distance between two points.
pub trait RoutePlanner: Send + Sync {
  fn compute_eta(
    &self,
    origin: Coordinate,
    destination: Coordinate,
  ) -> impl Future<Output = Result<RouteEstimate>> + Send + '_;
}

// ─── Straight-line fallback ──────────────────────────────────────────────────

/// A [`RoutePlanner`] that assumes a straight line at constant speed.
#[derive(Debug, Clone, Copy)]
pub struct StraightLineRouter {
  pub average_speed_kmh: f64,
}

impl Default for StraightLineRouter {
  fn default() -> Self { Self { average_speed_kmh: 40.0 } }
}

impl StraightLineRouter {
  pub fn estimate(&self, origin: Coordinate, destination: Coordinate) -> Result<RouteEstimate> {
    if !(self.average_speed_kmh.is_finite() && self.average_speed_kmh > 0.0) {
      return Err(Error::CollaboratorUnavailable(format!(
        "average speed must be positive, got {}",
        self.average_speed_kmh
      )));
    }
    let km = distance_km(&origin, &destination);
    Ok(RouteEstimate {
      eta_minutes: km / self.average_speed_kmh * 60.0,
      distance_km: km,
      polyline:    encode_polyline(&[origin, destination]),
    })
  }
}

impl RoutePlanner for StraightLineRouter {
  async fn compute_eta(&self, origin: Coordinate, destination: Coordinate) -> Result<RouteEstimate> {
    self.estimate(origin, destination)
  }
}

// ─── Polyline encoding ───────────────────────────────────────────────────────

/// Encode `points` with the Google polyline algorithm at 5-digit precision.
pub fn encode_polyline(points: &[Coordinate]) -> String {
  let mut out = String::new();
  let (mut prev_lat, mut prev_lon) = (0_i64, 0_i64);
  for p in points {
    let lat = (p.latitude * 1e5).round() as i64;
    let lon = (p.longitude * 1e5).round() as i64;
    encode_value(lat - prev_lat, &mut out);
    encode_value(lon - prev_lon, &mut out);
    prev_lat = lat;
    prev_lon = lon;
  }
  out
}

fn encode_value(delta: i64, out: &mut String) {
  let mut v = if delta < 0 { !(delta << 1) } else { delta << 1 };
  while v >= 0x20 {
    out.push(char::from((((v & 0x1f) | 0x20) + 63) as u8));
    v >>= 5;
  }
  out.push(char::from((v + 63) as u8));
}
