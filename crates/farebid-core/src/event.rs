//! Fan-out groups and the events published to them.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error,
  chat::ChatMessage,
  geo::Coordinate,
  ride::{ProposalType, Ride},
};

// ─── Groups ──────────────────────────────────────────────────────────────────

/// A named set of subscribers.
///
/// Serialised in its wire form: `user:<uuid>`, `ride:<uuid>`, or `dispatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Group {
  /// A rider's or driver's personal channel.
  User(Uuid),
  /// Everyone currently party to one ride.
  Ride(Uuid),
  /// Every online driver; new ride requests are announced here.
  Dispatch,
}

impl fmt::Display for Group {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::User(id) => write!(f, "user:{id}"),
      Self::Ride(id) => write!(f, "ride:{id}"),
      Self::Dispatch => f.write_str("dispatch"),
    }
  }
}

impl FromStr for Group {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parse_id = |raw: &str| {
      Uuid::parse_str(raw)
        .map_err(|e| Error::InvalidInput(format!("bad group id {raw:?}: {e}")))
    };
    match s.split_once(':') {
      None if s == "dispatch" => Ok(Self::Dispatch),
      Some(("user", id)) => Ok(Self::User(parse_id(id)?)),
      Some(("ride", id)) => Ok(Self::Ride(parse_id(id)?)),
      _ => Err(Error::InvalidInput(format!("unknown group {s:?}"))),
    }
  }
}

impl From<Group> for String {
  fn from(g: Group) -> Self { g.to_string() }
}

impl TryFrom<String> for Group {
  type Error = Error;

  fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// The closed set of things subscribers can be told about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
  /// Full ride snapshot after a committed change.
  RideUpdate { ride: Box<Ride> },
  LocationUpdate {
    ride_id:     Uuid,
    driver_id:   Uuid,
    position:    Coordinate,
    recorded_at: DateTime<Utc>,
  },
  EtaUpdate {
    ride_id:     Uuid,
    eta_minutes: f64,
    distance_km: f64,
    polyline:    String,
  },
  /// A new bid or counter-offer landed in the ledger.
  BidUpdate {
    ride_id:  Uuid,
    amount:   Decimal,
    proposer: ProposalType,
  },
  /// A chat message between the rider and the assigned driver.
  ChatMessage { message: ChatMessage },
}

/// Discriminant of [`Event`], handy for dispatch and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
  RideUpdate,
  LocationUpdate,
  EtaUpdate,
  BidUpdate,
  ChatMessage,
}

impl Event {
  pub fn ride_update(ride: &Ride) -> Self {
    Self::RideUpdate { ride: Box::new(ride.clone()) }
  }

  pub fn kind(&self) -> EventKind {
    match self {
      Self::RideUpdate { .. } => EventKind::RideUpdate,
      Self::LocationUpdate { .. } => EventKind::LocationUpdate,
      Self::EtaUpdate { .. } => EventKind::EtaUpdate,
      Self::BidUpdate { .. } => EventKind::BidUpdate,
      Self::ChatMessage { .. } => EventKind::ChatMessage,
    }
  }
}

/// One delivery: the event plus the group it was published to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub group: Group,
  pub event: Event,
}
