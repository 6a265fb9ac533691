//! The ride aggregate.
//!
//! A [`Ride`] is created when a rider submits a request and is mutated only
//! through the negotiation ledger ([`crate::negotiation`]) and the state
//! machine ([`crate::lifecycle`]). Once `completed` or `cancelled` it is
//! frozen.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  geo::Coordinate,
  negotiation::{AcceptedProposal, CounterOffer, DriverProposal},
};

// ─── Enums ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
  Requested,
  Accepted,
  Started,
  Completed,
  Cancelled,
}

impl RideStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Requested => "requested",
      Self::Accepted => "accepted",
      Self::Started => "started",
      Self::Completed => "completed",
      Self::Cancelled => "cancelled",
    }
  }

  /// States in which a driver is assigned and a proposal has been accepted.
  pub fn is_assigned(self) -> bool {
    matches!(self, Self::Accepted | Self::Started | Self::Completed)
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Cancelled)
  }
}

impl fmt::Display for RideStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Which party made the proposal currently leading the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalType {
  Passenger,
  Driver,
}

/// An authenticated identity acting on a ride. Authentication itself is the
/// transport's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "lowercase")]
pub enum Actor {
  Rider(Uuid),
  Driver(Uuid),
}

impl Actor {
  pub fn id(&self) -> Uuid {
    match self {
      Self::Rider(id) | Self::Driver(id) => *id,
    }
  }
}

// ─── Input ───────────────────────────────────────────────────────────────────

/// A ride request as submitted by a rider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRide {
  pub pickup:              Coordinate,
  pub destination:         Coordinate,
  #[serde(default)]
  pub pickup_address:      Option<String>,
  #[serde(default)]
  pub destination_address: Option<String>,
  /// The rider's opening ask. May instead be supplied later through
  /// [`Ride::submit_initial_proposal`].
  #[serde(default)]
  pub proposed_fare:       Option<Decimal>,
}

// ─── Aggregate ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
  pub ride_id:                  Uuid,
  pub rider_id:                 Uuid,
  /// Set exactly when `status` is accepted, started, or completed.
  pub driver_id:                Option<Uuid>,

  pub pickup:                   Coordinate,
  pub destination:              Coordinate,
  pub pickup_address:           Option<String>,
  pub destination_address:      Option<String>,

  pub status:                   RideStatus,

  pub proposal_type:            ProposalType,
  pub proposed_fare:            Option<Decimal>,
  /// Equals `accepted_proposal.amount` once set.
  pub final_fare:               Option<Decimal>,
  pub driver_proposals:         Vec<DriverProposal>,
  pub passenger_counter_offers: Vec<CounterOffer>,
  pub accepted_proposal:        Option<AcceptedProposal>,

  pub eta_minutes:              Option<f64>,
  pub distance_km:              Option<f64>,
  pub route_polyline:           Option<String>,

  pub created_at:               DateTime<Utc>,
  pub accepted_at:              Option<DateTime<Utc>>,
  pub completed_at:             Option<DateTime<Utc>>,

  /// Optimistic-concurrency counter; bumped by the store on every write.
  pub version:                  u64,
}

impl Ride {
  /// Build a `requested` ride from a rider's input. The opening fare, if any,
  /// is not applied here; route it through the ledger so it is validated.
  pub fn new(rider_id: Uuid, input: &NewRide, now: DateTime<Utc>) -> Result<Self> {
    for c in [&input.pickup, &input.destination] {
      if !c.is_valid() {
        return Err(Error::InvalidInput(format!(
          "coordinate ({}, {}) is out of range",
          c.latitude, c.longitude
        )));
      }
    }

    Ok(Self {
      ride_id: Uuid::new_v4(),
      rider_id,
      driver_id: None,
      pickup: input.pickup,
      destination: input.destination,
      pickup_address: input.pickup_address.clone(),
      destination_address: input.destination_address.clone(),
      status: RideStatus::Requested,
      proposal_type: ProposalType::Passenger,
      proposed_fare: None,
      final_fare: None,
      driver_proposals: Vec::new(),
      passenger_counter_offers: Vec::new(),
      accepted_proposal: None,
      eta_minutes: None,
      distance_km: None,
      route_polyline: None,
      created_at: now,
      accepted_at: None,
      completed_at: None,
      version: 0,
    })
  }

  /// Whether `driver_id` is the driver assigned to this ride.
  pub fn is_assigned_to(&self, driver_id: Uuid) -> bool {
    self.driver_id == Some(driver_id)
  }

  /// Distinct drivers that have bid, in first-bid order.
  pub fn bidders(&self) -> Vec<Uuid> {
    let mut seen = Vec::new();
    for p in &self.driver_proposals {
      if !seen.contains(&p.driver_id) {
        seen.push(p.driver_id);
      }
    }
    seen
  }
}
