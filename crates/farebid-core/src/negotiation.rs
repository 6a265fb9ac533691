//! The negotiation ledger attached to every ride.
//!
//! Driver bids and passenger counter-offers are appended to two ordered,
//! append-only sequences on the [`Ride`]. Nothing is ever removed or edited;
//! once a proposal is accepted both sequences become frozen history. A driver
//! may bid any number of times; every bid is kept.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  lifecycle::Transition,
  ride::{Actor, ProposalType, Ride, RideStatus},
};

/// Largest fare representable in a `DECIMAL(10, 2)` column.
pub fn max_fare() -> Decimal { Decimal::new(9_999_999_999, 2) }

/// Reject non-positive amounts, sub-cent precision, and amounts too large to
/// store.
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
  if amount <= Decimal::ZERO {
    return Err(Error::InvalidInput(format!(
      "amount must be greater than zero, got {amount}"
    )));
  }
  if amount.normalize().scale() > 2 {
    return Err(Error::InvalidInput(format!(
      "amount {amount} has more than two decimal places"
    )));
  }
  if amount > max_fare() {
    return Err(Error::InvalidInput(format!(
      "amount {amount} exceeds the maximum fare {}",
      max_fare()
    )));
  }
  Ok(amount)
}

// ─── Ledger records ──────────────────────────────────────────────────────────

/// A fare offered by a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverProposal {
  pub driver_id:    Uuid,
  pub amount:       Decimal,
  pub submitted_at: DateTime<Utc>,
  pub message:      Option<String>,
}

/// A fare offered by the passenger in response to driver bids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterOffer {
  pub amount:       Decimal,
  pub submitted_at: DateTime<Utc>,
  pub message:      Option<String>,
}

/// Points at one entry of the ledger by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "index", rename_all = "lowercase")]
pub enum ProposalRef {
  /// Index into `driver_proposals`.
  Driver(usize),
  /// Index into `passenger_counter_offers`.
  Passenger(usize),
}

/// The proposal both parties settled on. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedProposal {
  pub proposal_type: ProposalType,
  pub amount:        Decimal,
  pub accepted_at:   DateTime<Utc>,
  /// The ledger entry that was accepted. `None` when a driver took the
  /// rider's opening fare directly.
  pub source:        Option<ProposalRef>,
}

// ─── Ledger operations ───────────────────────────────────────────────────────

impl Ride {
  /// Record the rider's opening ask. Only legal on a fresh `requested` ride
  /// with nothing on the table yet.
  pub fn submit_initial_proposal(&mut self, amount: Decimal) -> Result<()> {
    const ACTION: &str = "submit initial proposal";
    self.require_open(ACTION)?;
    if self.proposed_fare.is_some()
      || !self.driver_proposals.is_empty()
      || !self.passenger_counter_offers.is_empty()
    {
      return Err(Error::illegal(self.status, ACTION));
    }
    let amount = validate_amount(amount)?;

    self.proposed_fare = Some(amount);
    self.proposal_type = ProposalType::Passenger;
    Ok(())
  }

  pub fn submit_counter_offer(
    &mut self,
    amount:  Decimal,
    message: Option<String>,
    now:     DateTime<Utc>,
  ) -> Result<&CounterOffer> {
    self.require_open("submit counter-offer")?;
    let amount = validate_amount(amount)?;

    self.passenger_counter_offers.push(CounterOffer {
      amount,
      submitted_at: now,
      message,
    });
    self.proposal_type = ProposalType::Passenger;
    Ok(&self.passenger_counter_offers[self.passenger_counter_offers.len() - 1])
  }

  pub fn submit_driver_bid(
    &mut self,
    driver_id: Uuid,
    amount:    Decimal,
    message:   Option<String>,
    now:       DateTime<Utc>,
  ) -> Result<&DriverProposal> {
    self.require_open("submit bid")?;
    if driver_id == self.rider_id {
      return Err(Error::InvalidInput(
        "a rider cannot bid on their own ride".into(),
      ));
    }
    let amount = validate_amount(amount)?;

    self.driver_proposals.push(DriverProposal {
      driver_id,
      amount,
      submitted_at: now,
      message,
    });
    self.proposal_type = ProposalType::Driver;
    Ok(&self.driver_proposals[self.driver_proposals.len() - 1])
  }

  /// Accept one ledger entry and move the ride to `accepted`.
  ///
  /// The rider accepts driver bids; a driver accepts a passenger
  /// counter-offer and becomes the ride's driver by doing so. The state check
  /// runs before the index check, so a second acceptance always reports
  /// `IllegalStateTransition` regardless of the index it names.
  pub fn accept_proposal(
    &mut self,
    actor:    Actor,
    proposal: ProposalRef,
    now:      DateTime<Utc>,
  ) -> Result<&AcceptedProposal> {
    const ACTION: &str = "accept proposal";
    if self.status != RideStatus::Requested || self.accepted_proposal.is_some() {
      return Err(Error::illegal(self.status, ACTION));
    }

    let (driver_id, proposal_type, amount) = match (proposal, actor) {
      (ProposalRef::Driver(index), Actor::Rider(rider)) if rider == self.rider_id => {
        let bid = self.driver_proposals.get(index).ok_or(Error::ProposalOutOfRange {
          index,
          len: self.driver_proposals.len(),
        })?;
        (bid.driver_id, ProposalType::Driver, bid.amount)
      }
      (ProposalRef::Passenger(index), Actor::Driver(driver)) if driver != self.rider_id => {
        let offer =
          self.passenger_counter_offers.get(index).ok_or(Error::ProposalOutOfRange {
            index,
            len: self.passenger_counter_offers.len(),
          })?;
        (driver, ProposalType::Passenger, offer.amount)
      }
      _ => return Err(Error::illegal(self.status, ACTION)),
    };

    self.apply(
      Transition::NegotiationAccepted {
        driver_id,
        accepted: AcceptedProposal {
          proposal_type,
          amount,
          accepted_at: now,
          source: Some(proposal),
        },
      },
      now,
    )?;

    self
      .accepted_proposal
      .as_ref()
      .ok_or_else(|| Error::illegal(self.status, ACTION))
  }

  /// The passenger's standing ask: the latest counter-offer, else the opening
  /// fare.
  pub fn leading_passenger_ask(&self) -> Option<(Decimal, Option<ProposalRef>)> {
    match self.passenger_counter_offers.last() {
      Some(offer) => Some((
        offer.amount,
        Some(ProposalRef::Passenger(self.passenger_counter_offers.len() - 1)),
      )),
      None => self.proposed_fare.map(|fare| (fare, None)),
    }
  }

  fn require_open(&self, action: &'static str) -> Result<()> {
    if self.status == RideStatus::Requested && self.accepted_proposal.is_none() {
      Ok(())
    } else {
      Err(Error::illegal(self.status, action))
    }
  }
}
