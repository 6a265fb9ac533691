//! Coordinates and great-circle distance.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Mean Earth radius used by every distance computation in the engine.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS-84 position. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
  pub latitude:  f64,
  pub longitude: f64,
}

impl Coordinate {
  /// Build a coordinate, rejecting non-finite or out-of-range values.
  pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
    let c = Self { latitude, longitude };
    if c.is_valid() {
      Ok(c)
    } else {
      Err(Error::InvalidInput(format!(
        "coordinate ({latitude}, {longitude}) is out of range"
      )))
    }
  }

  /// Deserialised coordinates bypass [`Coordinate::new`], so anything read
  /// from the outside world is re-checked with this before use.
  pub fn is_valid(&self) -> bool {
    self.latitude.is_finite()
      && self.longitude.is_finite()
      && (-90.0..=90.0).contains(&self.latitude)
      && (-180.0..=180.0).contains(&self.longitude)
  }

  /// A lat/lon box that contains every point within `radius_km`.
  ///
  /// The box is conservative: it may include points farther than the radius,
  /// never the other way round. Near the poles, or when the box would wrap
  /// the antimeridian, the longitude span widens to the full circle.
  pub fn bounding_box(&self, radius_km: f64) -> BoundingBox {
    let angular = radius_km.max(0.0) / EARTH_RADIUS_KM;
    let dlat = angular.to_degrees();
    let min_lat = (self.latitude - dlat).max(-90.0);
    let max_lat = (self.latitude + dlat).min(90.0);

    // Widest longitude offset of a spherical cap: asin(sin(r/R) / cos(lat)).
    let ratio = angular.sin() / self.latitude.to_radians().cos();
    let touches_pole = min_lat <= -90.0 || max_lat >= 90.0;
    let (min_lon, max_lon) = if touches_pole || ratio.is_nan() || ratio >= 1.0 {
      (-180.0, 180.0)
    } else {
      let dlon = ratio.asin().to_degrees();
      let (lo, hi) = (self.longitude - dlon, self.longitude + dlon);
      if lo < -180.0 || hi > 180.0 { (-180.0, 180.0) } else { (lo, hi) }
    };

    BoundingBox { min_lat, max_lat, min_lon, max_lon }
  }
}

/// Inclusive latitude/longitude bounds, see [`Coordinate::bounding_box`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub min_lat: f64,
  pub max_lat: f64,
  pub min_lon: f64,
  pub max_lon: f64,
}

impl BoundingBox {
  pub fn contains(&self, c: &Coordinate) -> bool {
    (self.min_lat..=self.max_lat).contains(&c.latitude)
      && (self.min_lon..=self.max_lon).contains(&c.longitude)
  }
}

/// Haversine great-circle distance in kilometres.
///
/// Exactly `0.0` for identical points and exactly symmetric in its
/// arguments; the intermediate term is clamped so antipodal points do not
/// produce `NaN` from rounding.
pub fn distance_km(a: &Coordinate, b: &Coordinate) -> f64 {
  let lat1 = a.latitude.to_radians();
  let lat2 = b.latitude.to_radians();
  let half_dlat = ((b.latitude - a.latitude).abs().to_radians() / 2.0).sin();
  let half_dlon = ((b.longitude - a.longitude).abs().to_radians() / 2.0).sin();

  let h = (half_dlat * half_dlat + lat1.cos() * lat2.cos() * half_dlon * half_dlon)
    .clamp(0.0, 1.0);
  2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}
