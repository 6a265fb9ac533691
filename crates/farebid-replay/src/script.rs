//! The replay script format: one JSON object per line, tagged by `op`.
//!
//! Parties and rides are referred to by free-form labels; the replayer maps
//! each label to a fresh id the first time it sees it.
//!
//! ```text
//! {"op":"driver","driver":"d1","at":{"latitude":12.9,"longitude":77.58},"rating":4.6}
//! {"op":"connect","user":"alice"}
//! {"op":"request","rider":"alice","ride":"r1","pickup":{...},"destination":{...},"fare":"100"}
//! {"op":"bid","driver":"d1","ride":"r1","amount":"150"}
//! {"op":"accept_bid","rider":"alice","ride":"r1","index":0}
//! ```

use std::collections::HashMap;

use anyhow::Context as _;
use farebid_core::geo::Coordinate;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
  /// Register a driver in the directory and connect them.
  Driver {
    driver: String,
    at:     Coordinate,
    #[serde(default = "default_rating")]
    rating: f64,
  },
  /// Connect a rider (or an extra driver session) to the router.
  Connect {
    user:   String,
    #[serde(default)]
    driver: bool,
  },
  Disconnect { user: String },
  Heartbeat { driver: String, at: Coordinate },
  Availability { driver: String, available: bool },
  Request {
    rider:       String,
    ride:        String,
    pickup:      Coordinate,
    destination: Coordinate,
    #[serde(default)]
    fare:        Option<Decimal>,
  },
  Rematch { ride: String },
  /// The rider's opening ask on a ride requested without one.
  Propose { rider: String, ride: String, amount: Decimal },
  Bid {
    driver:  String,
    ride:    String,
    amount:  Decimal,
    #[serde(default)]
    message: Option<String>,
  },
  Counter {
    rider:   String,
    ride:    String,
    amount:  Decimal,
    #[serde(default)]
    message: Option<String>,
  },
  /// The rider accepts a driver bid by index.
  AcceptBid { rider: String, ride: String, index: usize },
  /// A driver accepts a passenger counter-offer by index.
  AcceptOffer { driver: String, ride: String, index: usize },
  Accept { driver: String, ride: String },
  Decline { driver: String, ride: String },
  Start { driver: String, ride: String },
  Complete { driver: String, ride: String },
  Cancel { rider: String, ride: String },
  Ping { driver: String, ride: String, at: Coordinate },
  /// A chat message from either party of the ride.
  Say { user: String, ride: String, text: String },
  /// Print the conversation as `user` sees it and mark it read.
  Read { user: String, ride: String },
  /// Expire notifications as if `after_secs` had passed.
  Expire { after_secs: i64 },
  /// Print the ride's current state.
  Show { ride: String },
}

fn default_rating() -> f64 { 5.0 }

pub fn parse(source: &str) -> anyhow::Result<Vec<Step>> {
  source
    .lines()
    .enumerate()
    .filter(|(_, line)| {
      let line = line.trim();
      !line.is_empty() && !line.starts_with('#')
    })
    .map(|(n, line)| {
      serde_json::from_str(line).with_context(|| format!("line {}: bad step", n + 1))
    })
    .collect()
}

/// Label ↔ id bookkeeping for one replay.
#[derive(Debug, Default)]
pub struct Labels {
  ids:   HashMap<String, Uuid>,
  names: HashMap<Uuid, String>,
}

impl Labels {
  /// The id for `label`, minted on first use.
  pub fn id(&mut self, label: &str) -> Uuid {
    if let Some(id) = self.ids.get(label) {
      return *id;
    }
    let id = Uuid::new_v4();
    self.ids.insert(label.to_owned(), id);
    self.names.insert(id, label.to_owned());
    id
  }

  /// Bind `label` to an id minted elsewhere.
  pub fn bind(&mut self, label: &str, id: Uuid) {
    self.ids.insert(label.to_owned(), id);
    self.names.insert(id, label.to_owned());
  }

  pub fn name(&self, id: Uuid) -> String {
    self.names.get(&id).cloned().unwrap_or_else(|| id.to_string())
  }
}
