//! Per-ride chat between the rider and the assigned driver.
//!
//! Messages are only exchanged once a driver is assigned and the ride is
//! still in progress. The recipient is always the other party; nobody else
//! can write to or read a ride's conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  ride::{Ride, RideStatus},
};

/// Longest message body accepted, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
  pub message_id:   Uuid,
  pub ride_id:      Uuid,
  pub sender_id:    Uuid,
  pub recipient_id: Uuid,
  pub body:         String,
  pub sent_at:      DateTime<Utc>,
  /// Set once the recipient has read the conversation.
  pub read_at:      Option<DateTime<Utc>>,
}

impl ChatMessage {
  /// Build a message from `sender_id` to the other party of `ride`.
  pub fn compose(
    ride:      &Ride,
    sender_id: Uuid,
    body:      &str,
    now:       DateTime<Utc>,
  ) -> Result<Self> {
    const ACTION: &str = "send message";
    if !matches!(ride.status, RideStatus::Accepted | RideStatus::Started) {
      return Err(Error::illegal(ride.status, ACTION));
    }
    let recipient_id = ride
      .counterpart(sender_id)
      .ok_or_else(|| Error::illegal(ride.status, ACTION))?;

    let body = body.trim();
    if body.is_empty() {
      return Err(Error::InvalidInput("message body is empty".into()));
    }
    if body.chars().count() > MAX_MESSAGE_CHARS {
      return Err(Error::InvalidInput(format!(
        "message body exceeds {MAX_MESSAGE_CHARS} characters"
      )));
    }

    Ok(Self {
      message_id: Uuid::new_v4(),
      ride_id: ride.ride_id,
      sender_id,
      recipient_id,
      body: body.to_owned(),
      sent_at: now,
      read_at: None,
    })
  }

  pub fn is_read(&self) -> bool { self.read_at.is_some() }
}

impl Ride {
  /// The other party of the ride as seen from `user_id`: the driver for the
  /// rider and the rider for the driver. `None` for anyone else, or while no
  /// driver is assigned.
  pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
    let driver_id = self.driver_id?;
    if user_id == self.rider_id {
      Some(driver_id)
    } else if user_id == driver_id {
      Some(self.rider_id)
    } else {
      None
    }
  }
}
