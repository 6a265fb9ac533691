//! ETA refresh for rides in progress.

use std::{sync::Arc, time::Duration};

use farebid_core::{
  event::{Event, Group},
  geo::Coordinate,
  ride::{Ride, RideStatus},
  route::{RouteEstimate, RoutePlanner},
};

use crate::{Error, FanoutRouter, Result};

/// Wraps a [`RoutePlanner`] with a timeout and publishes `eta_update`s.
pub struct EtaEstimator<R> {
  planner: R,
  router:  Arc<FanoutRouter>,
  timeout: Duration,
}

impl<R: RoutePlanner> EtaEstimator<R> {
  pub fn new(planner: R, router: Arc<FanoutRouter>, timeout: Duration) -> Self {
    Self { planner, router, timeout }
  }

  /// Where the driver is heading: the pickup until the ride starts, then
  /// the destination. `None` outside those states.
  pub fn target(ride: &Ride) -> Option<Coordinate> {
    match ride.status {
      RideStatus::Accepted => Some(ride.pickup),
      RideStatus::Started => Some(ride.destination),
      _ => None,
    }
  }

  /// Compute a fresh estimate from `position` and write it into `ride`.
  ///
  /// On failure `ride` is left untouched. Nothing is published here; call
  /// [`announce`](Self::announce) once the updated ride is committed.
  pub async fn refresh(&self, ride: &mut Ride, position: Coordinate) -> Result<RouteEstimate> {
    let Some(target) = Self::target(ride) else {
      return Err(farebid_core::Error::illegal(ride.status, "refresh eta").into());
    };

    let estimate = tokio::time::timeout(self.timeout, self.planner.compute_eta(position, target))
      .await
      .map_err(|_| Error::Timeout {
        what:     "route planner",
        after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
      })??;

    if !(estimate.eta_minutes.is_finite() && estimate.distance_km.is_finite()) {
      return Err(
        farebid_core::Error::CollaboratorUnavailable(format!(
          "route planner returned a non-finite estimate: {estimate:?}"
        ))
        .into(),
      );
    }

    ride.eta_minutes = Some(estimate.eta_minutes);
    ride.distance_km = Some(estimate.distance_km);
    ride.route_polyline = Some(estimate.polyline.clone());
    Ok(estimate)
  }

  /// Publish `eta_update` for a committed estimate to the ride group.
  pub fn announce(&self, ride: &Ride, estimate: &RouteEstimate) -> usize {
    self.router.publish(Group::Ride(ride.ride_id), Event::EtaUpdate {
      ride_id:     ride.ride_id,
      eta_minutes: estimate.eta_minutes,
      distance_km: estimate.distance_km,
      polyline:    estimate.polyline.clone(),
    })
  }
}
