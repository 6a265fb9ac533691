//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings with a fixed microsecond width so that
//! text order is time order. Fares are canonical decimal text. Rides and
//! notifications are stored whole as JSON with a few projected columns.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use farebid_core::{
  chat::ChatMessage,
  driver::DriverCandidate,
  geo::Coordinate,
  matching::{DriverNotification, NotificationStatus},
  ride::{Ride, RideStatus},
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_decimal(d: Decimal) -> String { d.normalize().to_string() }

pub fn decode_decimal(s: &str) -> Result<Decimal> { Ok(Decimal::from_str(s)?) }

pub fn encode_status(s: RideStatus) -> &'static str { s.as_str() }

pub fn encode_notification_status(s: NotificationStatus) -> &'static str {
  match s {
    NotificationStatus::Pending => "pending",
    NotificationStatus::Bid => "bid",
    NotificationStatus::Declined => "declined",
    NotificationStatus::Expired => "expired",
  }
}

// ─── Rides ───────────────────────────────────────────────────────────────────

/// Column values for one `rides` row.
pub struct RideRow {
  pub ride_id:    String,
  pub rider_id:   String,
  pub driver_id:  Option<String>,
  pub status:     &'static str,
  pub version:    i64,
  pub created_at: String,
  pub body:       String,
}

pub fn encode_ride(ride: &Ride) -> Result<RideRow> {
  Ok(RideRow {
    ride_id:    encode_uuid(ride.ride_id),
    rider_id:   encode_uuid(ride.rider_id),
    driver_id:  ride.driver_id.map(encode_uuid),
    status:     encode_status(ride.status),
    version:    version_to_sql(ride.version),
    created_at: encode_dt(ride.created_at),
    body:       serde_json::to_string(ride)?,
  })
}

pub fn version_to_sql(v: u64) -> i64 { i64::try_from(v).unwrap_or(i64::MAX) }

/// Raw columns read back from `rides`.
pub struct RawRide {
  pub version: i64,
  pub body:    String,
}

impl RawRide {
  pub const COLUMNS: &'static str = "version, body";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self { version: row.get(0)?, body: row.get(1)? })
  }

  /// The `version` column is authoritative over the copy inside `body`.
  pub fn into_ride(self) -> Result<Ride> {
    let mut ride: Ride = serde_json::from_str(&self.body)?;
    ride.version = u64::try_from(self.version).unwrap_or_default();
    Ok(ride)
  }
}

// ─── Drivers ─────────────────────────────────────────────────────────────────

pub struct RawDriver {
  pub driver_id:         String,
  pub latitude:          Option<f64>,
  pub longitude:         Option<f64>,
  pub rating:            f64,
  pub avg_fare:          Option<String>,
  pub avg_response_secs: Option<f64>,
  pub available:         bool,
  pub updated_at:        String,
}

impl RawDriver {
  pub const COLUMNS: &'static str = "driver_id, latitude, longitude, rating, avg_fare, \
                                     avg_response_secs, available, updated_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      driver_id:         row.get(0)?,
      latitude:          row.get(1)?,
      longitude:         row.get(2)?,
      rating:            row.get(3)?,
      avg_fare:          row.get(4)?,
      avg_response_secs: row.get(5)?,
      available:         row.get(6)?,
      updated_at:        row.get(7)?,
    })
  }

  /// Stored positions are not range-checked here; matching skips malformed
  /// ones with a warning.
  pub fn into_driver(self) -> Result<DriverCandidate> {
    let position = match (self.latitude, self.longitude) {
      (Some(latitude), Some(longitude)) => Some(Coordinate { latitude, longitude }),
      _ => None,
    };
    Ok(DriverCandidate {
      driver_id: decode_uuid(&self.driver_id)?,
      position,
      rating: self.rating,
      avg_fare: self.avg_fare.as_deref().map(decode_decimal).transpose()?,
      avg_response_secs: self.avg_response_secs,
      available: self.available,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

// ─── Notifications ───────────────────────────────────────────────────────────

pub fn encode_notification(n: &DriverNotification) -> Result<String> {
  Ok(serde_json::to_string(n)?)
}

pub fn decode_notification(body: &str) -> Result<DriverNotification> {
  Ok(serde_json::from_str(body)?)
}

// ─── Messages ────────────────────────────────────────────────────────────────

pub struct RawMessage {
  pub message_id:   String,
  pub ride_id:      String,
  pub sender_id:    String,
  pub recipient_id: String,
  pub body:         String,
  pub sent_at:      String,
  pub read_at:      Option<String>,
}

impl RawMessage {
  pub const COLUMNS: &'static str =
    "message_id, ride_id, sender_id, recipient_id, body, sent_at, read_at";

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      message_id:   row.get(0)?,
      ride_id:      row.get(1)?,
      sender_id:    row.get(2)?,
      recipient_id: row.get(3)?,
      body:         row.get(4)?,
      sent_at:      row.get(5)?,
      read_at:      row.get(6)?,
    })
  }

  pub fn encode(m: &ChatMessage) -> Self {
    Self {
      message_id:   encode_uuid(m.message_id),
      ride_id:      encode_uuid(m.ride_id),
      sender_id:    encode_uuid(m.sender_id),
      recipient_id: encode_uuid(m.recipient_id),
      body:         m.body.clone(),
      sent_at:      encode_dt(m.sent_at),
      read_at:      m.read_at.map(encode_dt),
    }
  }

  pub fn into_message(self) -> Result<ChatMessage> {
    Ok(ChatMessage {
      message_id:   decode_uuid(&self.message_id)?,
      ride_id:      decode_uuid(&self.ride_id)?,
      sender_id:    decode_uuid(&self.sender_id)?,
      recipient_id: decode_uuid(&self.recipient_id)?,
      body:         self.body,
      sent_at:      decode_dt(&self.sent_at)?,
      read_at:      self.read_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}
