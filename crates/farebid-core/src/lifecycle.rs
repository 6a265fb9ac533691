//! The ride state machine.
//!
//! ```text
//!             driver accepts / negotiation accepted
//!  requested ───────────────────────────────────────► accepted ──► started ──► completed
//!      │                                                 start          complete
//!      └──► cancelled   (rider cancels)
//! ```
//!
//! Every transition is validated against the current state and the acting
//! party before anything is written. A rejected transition leaves the ride
//! exactly as it was.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Error, Result,
  event::Group,
  negotiation::AcceptedProposal,
  ride::{ProposalType, Ride, RideStatus},
};

/// A requested change of lifecycle state, carrying the acting party.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
  /// A driver takes the ride at the passenger's standing ask.
  DriverAccepts { driver_id: Uuid },
  /// A ledger entry was accepted; see [`Ride::accept_proposal`].
  NegotiationAccepted {
    driver_id: Uuid,
    accepted:  AcceptedProposal,
  },
  Start { driver_id: Uuid },
  Complete { driver_id: Uuid },
  Cancel { rider_id: Uuid },
}

impl Transition {
  pub fn action(&self) -> &'static str {
    match self {
      Self::DriverAccepts { .. } => "accept ride",
      Self::NegotiationAccepted { .. } => "accept proposal",
      Self::Start { .. } => "start ride",
      Self::Complete { .. } => "complete ride",
      Self::Cancel { .. } => "cancel ride",
    }
  }

  pub fn target(&self) -> RideStatus {
    match self {
      Self::DriverAccepts { .. } | Self::NegotiationAccepted { .. } => {
        RideStatus::Accepted
      }
      Self::Start { .. } => RideStatus::Started,
      Self::Complete { .. } => RideStatus::Completed,
      Self::Cancel { .. } => RideStatus::Cancelled,
    }
  }

  /// Groups that receive the `ride_update` once the transition commits.
  /// A direct acceptance goes to the rider's personal channel; everything
  /// else goes to the ride group.
  pub fn audience(&self, ride: &Ride) -> Group {
    match self {
      Self::DriverAccepts { .. } => Group::User(ride.rider_id),
      _ => Group::Ride(ride.ride_id),
    }
  }
}

impl Ride {
  /// Validate and apply `transition`. Returns the state the ride left.
  pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<RideStatus> {
    let from = self.status;
    let illegal = || Error::illegal(from, transition.action());
    let unassigned = self.driver_id.is_none() && self.accepted_proposal.is_none();

    match &transition {
      Transition::DriverAccepts { driver_id } => {
        if from != RideStatus::Requested || !unassigned || *driver_id == self.rider_id {
          return Err(illegal());
        }
        let (amount, source) = self.leading_passenger_ask().ok_or_else(|| {
          Error::InvalidInput("ride has no passenger fare to accept".into())
        })?;

        self.driver_id = Some(*driver_id);
        self.final_fare = Some(amount);
        self.proposal_type = ProposalType::Passenger;
        self.accepted_proposal = Some(AcceptedProposal {
          proposal_type: ProposalType::Passenger,
          amount,
          accepted_at: now,
          source,
        });
        self.accepted_at = Some(now);
      }

      Transition::NegotiationAccepted { driver_id, accepted } => {
        if from != RideStatus::Requested || !unassigned {
          return Err(illegal());
        }
        self.driver_id = Some(*driver_id);
        self.final_fare = Some(accepted.amount);
        self.proposal_type = accepted.proposal_type;
        self.accepted_proposal = Some(accepted.clone());
        self.accepted_at = Some(now);
      }

      Transition::Start { driver_id } => {
        if from != RideStatus::Accepted || !self.is_assigned_to(*driver_id) {
          return Err(illegal());
        }
      }

      Transition::Complete { driver_id } => {
        if from != RideStatus::Started || !self.is_assigned_to(*driver_id) {
          return Err(illegal());
        }
        self.completed_at = Some(now);
      }

      Transition::Cancel { rider_id } => {
        if from != RideStatus::Requested || *rider_id != self.rider_id {
          return Err(illegal());
        }
      }
    }

    self.status = transition.target();
    tracing::info!(
      ride_id = %self.ride_id,
      from = %from,
      to = %self.status,
      "ride transitioned"
    );
    Ok(from)
  }

  /// The data-model invariants that must hold between any two commits.
  pub fn invariants_hold(&self) -> bool {
    let assigned = self.status.is_assigned();
    let fare_matches = match (&self.accepted_proposal, self.final_fare) {
      (Some(accepted), Some(fare)) => accepted.amount == fare,
      (None, None) => true,
      _ => false,
    };
    let amounts_positive = self
      .driver_proposals
      .iter()
      .map(|p| p.amount)
      .chain(self.passenger_counter_offers.iter().map(|o| o.amount))
      .all(|a| a > rust_decimal::Decimal::ZERO);

    self.accepted_proposal.is_some() == assigned
      && self.driver_id.is_some() == assigned
      && self.accepted_at.is_some() == assigned
      && self.completed_at.is_some() == (self.status == RideStatus::Completed)
      && fare_matches
      && amounts_positive
  }
}

#[cfg(test)]
mod tests {
  use rust_decimal::Decimal;

  use super::*;
  use crate::{ErrorKind, geo::Coordinate, ride::NewRide};

  fn ride_with_fare() -> Ride {
    let input = NewRide {
      pickup:              Coordinate::new(12.90, 77.58).unwrap(),
      destination:         Coordinate::new(12.97, 77.64).unwrap(),
      pickup_address:      None,
      destination_address: None,
      proposed_fare:       None,
    };
    let mut ride = Ride::new(Uuid::new_v4(), &input, Utc::now()).unwrap();
    ride.submit_initial_proposal(Decimal::new(100, 0)).unwrap();
    ride
  }

  #[test]
  fn happy_path_to_completion() {
    let mut ride = ride_with_fare();
    let driver = Uuid::new_v4();
    let now = Utc::now();

    ride.apply(Transition::DriverAccepts { driver_id: driver }, now).unwrap();
    assert_eq!(ride.status, RideStatus::Accepted);
    assert_eq!(ride.final_fare, Some(Decimal::new(100, 0)));
    assert!(ride.invariants_hold());

    ride.apply(Transition::Start { driver_id: driver }, now).unwrap();
    assert_eq!(ride.status, RideStatus::Started);

    let from = ride.apply(Transition::Complete { driver_id: driver }, now).unwrap();
    assert_eq!(from, RideStatus::Started);
    assert_eq!(ride.status, RideStatus::Completed);
    assert_eq!(ride.completed_at, Some(now));
    assert!(ride.invariants_hold());
  }

  #[test]
  fn cannot_start_without_accepting() {
    let mut ride = ride_with_fare();
    let before = ride.clone();
    let err = ride
      .apply(Transition::Start { driver_id: Uuid::new_v4() }, Utc::now())
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
    assert!(err.to_string().contains("requested"));
    assert_eq!(ride, before);
  }

  #[test]
  fn only_assigned_driver_may_drive() {
    let mut ride = ride_with_fare();
    let driver = Uuid::new_v4();
    ride
      .apply(Transition::DriverAccepts { driver_id: driver }, Utc::now())
      .unwrap();

    let stranger = Uuid::new_v4();
    assert!(ride.apply(Transition::Start { driver_id: stranger }, Utc::now()).is_err());
    ride.apply(Transition::Start { driver_id: driver }, Utc::now()).unwrap();
    assert!(ride.apply(Transition::Complete { driver_id: stranger }, Utc::now()).is_err());
    assert_eq!(ride.status, RideStatus::Started);
  }

  #[test]
  fn second_driver_cannot_accept() {
    let mut ride = ride_with_fare();
    let first = Uuid::new_v4();
    ride.apply(Transition::DriverAccepts { driver_id: first }, Utc::now()).unwrap();

    let err = ride
      .apply(Transition::DriverAccepts { driver_id: Uuid::new_v4() }, Utc::now())
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
    assert_eq!(ride.driver_id, Some(first));
  }

  #[test]
  fn direct_accept_needs_a_fare() {
    let input = NewRide {
      pickup:              Coordinate::new(0.0, 0.0).unwrap(),
      destination:         Coordinate::new(0.1, 0.1).unwrap(),
      pickup_address:      None,
      destination_address: None,
      proposed_fare:       None,
    };
    let mut ride = Ride::new(Uuid::new_v4(), &input, Utc::now()).unwrap();
    let err = ride
      .apply(Transition::DriverAccepts { driver_id: Uuid::new_v4() }, Utc::now())
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(ride.status, RideStatus::Requested);
    assert!(ride.driver_id.is_none());
  }

  #[test]
  fn rider_cancels_only_while_requested() {
    let mut ride = ride_with_fare();
    let rider = ride.rider_id;

    assert!(ride.apply(Transition::Cancel { rider_id: Uuid::new_v4() }, Utc::now()).is_err());
    ride.apply(Transition::Cancel { rider_id: rider }, Utc::now()).unwrap();
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert!(ride.invariants_hold());

    let err = ride
      .apply(Transition::DriverAccepts { driver_id: Uuid::new_v4() }, Utc::now())
      .unwrap_err();
    assert!(err.to_string().contains("cancelled"));
  }

  #[test]
  fn accepted_ride_cannot_be_cancelled() {
    let mut ride = ride_with_fare();
    let rider = ride.rider_id;
    ride
      .apply(Transition::DriverAccepts { driver_id: Uuid::new_v4() }, Utc::now())
      .unwrap();
    let err = ride.apply(Transition::Cancel { rider_id: rider }, Utc::now()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
  }

  #[test]
  fn audience_follows_transition() {
    let ride = ride_with_fare();
    let driver = Uuid::new_v4();
    assert_eq!(
      Transition::DriverAccepts { driver_id: driver }.audience(&ride),
      Group::User(ride.rider_id)
    );
    assert_eq!(
      Transition::Start { driver_id: driver }.audience(&ride),
      Group::Ride(ride.ride_id)
    );
  }
}
