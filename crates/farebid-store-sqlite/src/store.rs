//! [`SqliteStore`]: the SQLite implementation of [`DispatchStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use farebid_core::{
  chat::ChatMessage,
  driver::DriverCandidate,
  geo::{Coordinate, distance_km},
  matching::DriverNotification,
  ride::{Ride, RideStatus},
  store::DispatchStore,
};

use crate::{
  Error, Result,
  encode::{
    RawDriver, RawMessage, RawRide, decode_notification, encode_decimal, encode_dt, encode_notification,
    encode_notification_status, encode_ride, encode_status, encode_uuid, version_to_sql,
  },
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A dispatch store backed by a single SQLite file.
///
/// Cheap to clone; the connection handle is shared.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open a private in-memory store.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run a `SELECT version, body FROM rides ...` query and decode the rows.
  async fn query_rides(
    &self,
    sql: String,
    params: Vec<String>,
  ) -> Result<Vec<Ride>> {
    let raws: Vec<RawRide> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params.iter()), RawRide::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRide::into_ride).collect()
  }

  async fn query_notifications(
    &self,
    sql: &'static str,
    param: String,
  ) -> Result<Vec<DriverNotification>> {
    let bodies: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
          .query_map(rusqlite::params![param], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;

    bodies.iter().map(String::as_str).map(decode_notification).collect()
  }

  /// Run a single-row driver `UPDATE`; `true` if the row existed.
  async fn update_driver(
    &self,
    sql: &'static str,
    params: Vec<rusqlite::types::Value>,
  ) -> Result<bool> {
    let changed = self
      .conn
      .call(move |conn| Ok(conn.execute(sql, rusqlite::params_from_iter(params))?))
      .await?;
    Ok(changed > 0)
  }
}

// ─── DispatchStore impl ──────────────────────────────────────────────────────

impl DispatchStore for SqliteStore {
  type Error = Error;

  // ── Rides ─────────────────────────────────────────────────────────────────

  async fn insert_ride(&self, ride: &Ride) -> Result<()> {
    let row = encode_ride(ride)?;
    let ride_id = ride.ride_id;

    let inserted = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "INSERT OR IGNORE INTO rides
             (ride_id, rider_id, driver_id, status, version, created_at, body)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![
            row.ride_id,
            row.rider_id,
            row.driver_id,
            row.status,
            row.version,
            row.created_at,
            row.body,
          ],
        )?)
      })
      .await?;

    if inserted == 0 {
      return Err(Error::DuplicateRide(ride_id));
    }
    Ok(())
  }

  async fn get_ride(&self, ride_id: Uuid) -> Result<Option<Ride>> {
    let id_str = encode_uuid(ride_id);

    let raw: Option<RawRide> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {} FROM rides WHERE ride_id = ?1", RawRide::COLUMNS),
              rusqlite::params![id_str],
              RawRide::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawRide::into_ride).transpose()
  }

  async fn update_ride(&self, ride: Ride) -> Result<Option<Ride>> {
    let expected = version_to_sql(ride.version);
    let mut committed = ride;
    committed.version += 1;
    let row = encode_ride(&committed)?;

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE rides
              SET driver_id = ?1, status = ?2, version = ?3, body = ?4
            WHERE ride_id = ?5 AND version = ?6",
          rusqlite::params![
            row.driver_id,
            row.status,
            row.version,
            row.body,
            row.ride_id,
            expected,
          ],
        )?)
      })
      .await?;

    Ok((changed == 1).then_some(committed))
  }

  async fn rides_for_rider(&self, rider_id: Uuid) -> Result<Vec<Ride>> {
    self
      .query_rides(
        format!(
          "SELECT {} FROM rides WHERE rider_id = ?1
           ORDER BY created_at DESC, rowid DESC",
          RawRide::COLUMNS
        ),
        vec![encode_uuid(rider_id)],
      )
      .await
  }

  async fn rides_for_driver(
    &self,
    driver_id: Uuid,
    statuses: &[RideStatus],
  ) -> Result<Vec<Ride>> {
    if statuses.is_empty() {
      return Ok(Vec::new());
    }
    let placeholders: Vec<String> =
      (0..statuses.len()).map(|i| format!("?{}", i + 2)).collect();

    let mut params = vec![encode_uuid(driver_id)];
    params.extend(statuses.iter().map(|s| encode_status(*s).to_owned()));

    self
      .query_rides(
        format!(
          "SELECT {} FROM rides WHERE driver_id = ?1 AND status IN ({})
           ORDER BY created_at DESC, rowid DESC",
          RawRide::COLUMNS,
          placeholders.join(", ")
        ),
        params,
      )
      .await
  }

  async fn open_rides(&self) -> Result<Vec<Ride>> {
    self
      .query_rides(
        format!(
          "SELECT {} FROM rides WHERE status = ?1 AND driver_id IS NULL
           ORDER BY created_at DESC, rowid DESC",
          RawRide::COLUMNS
        ),
        vec![encode_status(RideStatus::Requested).to_owned()],
      )
      .await
  }

  // ── Driver directory ──────────────────────────────────────────────────────

  async fn upsert_driver(&self, driver: &DriverCandidate) -> Result<()> {
    let id_str       = encode_uuid(driver.driver_id);
    let latitude     = driver.position.map(|p| p.latitude);
    let longitude    = driver.position.map(|p| p.longitude);
    let rating       = driver.rating;
    let avg_fare     = driver.avg_fare.map(encode_decimal);
    let avg_response = driver.avg_response_secs;
    let available    = driver.available;
    let updated_at   = encode_dt(driver.updated_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          &format!(
            "INSERT OR REPLACE INTO drivers ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            RawDriver::COLUMNS
          ),
          rusqlite::params![
            id_str,
            latitude,
            longitude,
            rating,
            avg_fare,
            avg_response,
            available,
            updated_at,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_driver(&self, driver_id: Uuid) -> Result<Option<DriverCandidate>> {
    let id_str = encode_uuid(driver_id);

    let raw: Option<RawDriver> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {} FROM drivers WHERE driver_id = ?1", RawDriver::COLUMNS),
              rusqlite::params![id_str],
              RawDriver::from_row,
            )
            .optional()?,
        )
      })
      .await?;

    raw.map(RawDriver::into_driver).transpose()
  }

  async fn nearby_available_drivers(
    &self,
    center: Coordinate,
    radius_km: f64,
    limit: usize,
  ) -> Result<Vec<DriverCandidate>> {
    // Coarse bounding-box filter in SQL, exact great-circle filter below.
    let bbox = center.bounding_box(radius_km);

    let raws: Vec<RawDriver> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM drivers
            WHERE available = 1
              AND latitude  BETWEEN ?1 AND ?2
              AND longitude BETWEEN ?3 AND ?4",
          RawDriver::COLUMNS
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![bbox.min_lat, bbox.max_lat, bbox.min_lon, bbox.max_lon],
            RawDriver::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    let mut within: Vec<(f64, DriverCandidate)> = raws
      .into_iter()
      .map(RawDriver::into_driver)
      .collect::<Result<Vec<_>>>()?
      .into_iter()
      .filter_map(|d| {
        let km = distance_km(&center, &d.position?);
        (km <= radius_km).then_some((km, d))
      })
      .collect();

    within.sort_by(|(a_km, a), (b_km, b)| {
      a_km.total_cmp(b_km).then_with(|| a.driver_id.cmp(&b.driver_id))
    });
    within.truncate(limit);

    Ok(within.into_iter().map(|(_, d)| d).collect())
  }

  async fn update_driver_position(
    &self,
    driver_id: Uuid,
    position: Coordinate,
    at: DateTime<Utc>,
  ) -> Result<bool> {
    self
      .update_driver(
        "UPDATE drivers SET latitude = ?1, longitude = ?2, updated_at = ?3 WHERE driver_id = ?4",
        vec![
          position.latitude.into(),
          position.longitude.into(),
          encode_dt(at).into(),
          encode_uuid(driver_id).into(),
        ],
      )
      .await
  }

  async fn set_driver_availability(
    &self,
    driver_id: Uuid,
    available: bool,
    at: DateTime<Utc>,
  ) -> Result<bool> {
    self
      .update_driver(
        "UPDATE drivers SET available = ?1, updated_at = ?2 WHERE driver_id = ?3",
        vec![
          i64::from(available).into(),
          encode_dt(at).into(),
          encode_uuid(driver_id).into(),
        ],
      )
      .await
  }

  // ── Notification log ──────────────────────────────────────────────────────

  async fn append_notifications(&self, notifications: &[DriverNotification]) -> Result<()> {
    let rows = notifications
      .iter()
      .map(|n| {
        Ok((
          encode_uuid(n.notification_id),
          encode_uuid(n.ride_id),
          encode_uuid(n.driver_id),
          encode_notification_status(n.status),
          encode_dt(n.created_at),
          encode_notification(n)?,
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO notifications
               (notification_id, ride_id, driver_id, status, created_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          )?;
          for (id, ride, driver, status, created_at, body) in &rows {
            stmt.execute(rusqlite::params![id, ride, driver, status, created_at, body])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn notifications_for(&self, ride_id: Uuid) -> Result<Vec<DriverNotification>> {
    self
      .query_notifications(
        "SELECT body FROM notifications WHERE ride_id = ?1 ORDER BY created_at, rowid",
        encode_uuid(ride_id),
      )
      .await
  }

  async fn resolve_notification(&self, notification: &DriverNotification) -> Result<bool> {
    let id_str = encode_uuid(notification.notification_id);
    let status = encode_notification_status(notification.status);
    let body   = encode_notification(notification)?;

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE notifications SET status = ?1, body = ?2
            WHERE notification_id = ?3 AND status = 'pending'",
          rusqlite::params![status, body, id_str],
        )?)
      })
      .await?;
    Ok(changed == 1)
  }

  async fn pending_notifications_before(
    &self,
    cutoff: DateTime<Utc>,
  ) -> Result<Vec<DriverNotification>> {
    self
      .query_notifications(
        "SELECT body FROM notifications
          WHERE status = 'pending' AND created_at < ?1
          ORDER BY created_at, rowid",
        encode_dt(cutoff),
      )
      .await
  }

  // ── Chat ──────────────────────────────────────────────────────────────────

  async fn append_message(&self, message: &ChatMessage) -> Result<()> {
    let row = RawMessage::encode(message);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          &format!(
            "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            RawMessage::COLUMNS
          ),
          rusqlite::params![
            row.message_id,
            row.ride_id,
            row.sender_id,
            row.recipient_id,
            row.body,
            row.sent_at,
            row.read_at,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn messages_for(&self, ride_id: Uuid) -> Result<Vec<ChatMessage>> {
    let id_str = encode_uuid(ride_id);

    let raws: Vec<RawMessage> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM messages WHERE ride_id = ?1 ORDER BY sent_at, rowid",
          RawMessage::COLUMNS
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![id_str], RawMessage::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawMessage::into_message).collect()
  }

  async fn mark_messages_read(
    &self,
    ride_id: Uuid,
    recipient_id: Uuid,
    at: DateTime<Utc>,
  ) -> Result<usize> {
    let ride_str      = encode_uuid(ride_id);
    let recipient_str = encode_uuid(recipient_id);
    let at_str        = encode_dt(at);

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE messages SET read_at = ?1
            WHERE ride_id = ?2 AND recipient_id = ?3 AND read_at IS NULL",
          rusqlite::params![at_str, ride_str, recipient_str],
        )?)
      })
      .await?;
    Ok(changed)
  }
}
