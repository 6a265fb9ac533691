//! The `DispatchStore` trait: the entity store the engine persists through.
//!
//! Implemented by storage backends (e.g. `farebid-store-sqlite`). The
//! dispatch layer depends on this abstraction, not on any concrete backend.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  chat::ChatMessage,
  driver::DriverCandidate,
  geo::Coordinate,
  matching::DriverNotification,
  ride::{Ride, RideStatus},
};

/// Abstraction over a dispatch entity store.
///
/// Ride writes are single-row and atomic. [`update_ride`] is a
/// compare-and-swap on [`Ride::version`]; a stale writer gets `None` and
/// nothing is written.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
///
/// [`update_ride`]: DispatchStore::update_ride
pub trait DispatchStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Rides ─────────────────────────────────────────────────────────────

  /// Persist a freshly created ride. Fails if the id is taken.
  fn insert_ride<'a>(
    &'a self,
    ride: &'a Ride,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Retrieve a ride by id. Returns `None` if not found.
  fn get_ride(
    &self,
    ride_id: Uuid,
  ) -> impl Future<Output = Result<Option<Ride>, Self::Error>> + Send + '_;

  /// Overwrite the stored ride if its version still equals `ride.version`.
  ///
  /// On success returns the committed ride, whose version is one higher.
  /// Returns `None` if the stored version moved on or the ride is missing.
  fn update_ride(
    &self,
    ride: Ride,
  ) -> impl Future<Output = Result<Option<Ride>, Self::Error>> + Send + '_;

  /// All rides requested by `rider_id`, newest first.
  fn rides_for_rider(
    &self,
    rider_id: Uuid,
  ) -> impl Future<Output = Result<Vec<Ride>, Self::Error>> + Send + '_;

  /// Rides assigned to `driver_id` whose status is one of `statuses`,
  /// newest first.
  fn rides_for_driver<'a>(
    &'a self,
    driver_id: Uuid,
    statuses: &'a [RideStatus],
  ) -> impl Future<Output = Result<Vec<Ride>, Self::Error>> + Send + 'a;

  /// Rides still `requested` with no driver, newest first.
  fn open_rides(&self) -> impl Future<Output = Result<Vec<Ride>, Self::Error>> + Send + '_;

  // ── Driver directory ──────────────────────────────────────────────────

  /// Insert or replace a driver's directory entry.
  fn upsert_driver<'a>(
    &'a self,
    driver: &'a DriverCandidate,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get_driver(
    &self,
    driver_id: Uuid,
  ) -> impl Future<Output = Result<Option<DriverCandidate>, Self::Error>> + Send + '_;

  /// Available drivers with a known position within `radius_km` of
  /// `center`, nearest first, at most `limit`.
  fn nearby_available_drivers(
    &self,
    center: Coordinate,
    radius_km: f64,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<DriverCandidate>, Self::Error>> + Send + '_;

  /// Record a heartbeat position. Returns `false` if the driver is unknown.
  fn update_driver_position(
    &self,
    driver_id: Uuid,
    position: Coordinate,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Returns `false` if the driver is unknown.
  fn set_driver_availability(
    &self,
    driver_id: Uuid,
    available: bool,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  // ── Notification log ──────────────────────────────────────────────────

  /// Append the output of one matching run.
  fn append_notifications<'a>(
    &'a self,
    notifications: &'a [DriverNotification],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Every notification for `ride_id`, in creation order.
  fn notifications_for(
    &self,
    ride_id: Uuid,
  ) -> impl Future<Output = Result<Vec<DriverNotification>, Self::Error>> + Send + '_;

  /// Persist a resolved notification. Only a `pending` row is overwritten;
  /// returns `false` if the row was already resolved or does not exist.
  fn resolve_notification<'a>(
    &'a self,
    notification: &'a DriverNotification,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Pending notifications created strictly before `cutoff`.
  fn pending_notifications_before(
    &self,
    cutoff: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<DriverNotification>, Self::Error>> + Send + '_;

  // ── Chat ──────────────────────────────────────────────────────────────

  fn append_message<'a>(
    &'a self,
    message: &'a ChatMessage,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// The ride's conversation, oldest first.
  fn messages_for(
    &self,
    ride_id: Uuid,
  ) -> impl Future<Output = Result<Vec<ChatMessage>, Self::Error>> + Send + '_;

  /// Stamp every unread message on `ride_id` addressed to `recipient_id`
  /// as read at `at`. Returns how many were updated.
  fn mark_messages_read(
    &self,
    ride_id: Uuid,
    recipient_id: Uuid,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;
}
