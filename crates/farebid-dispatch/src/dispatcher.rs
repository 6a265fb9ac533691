//! [`Dispatcher`]: the entry points a transport calls into.
//!
//! Every mutating operation follows the same shape:
//!
//! 1. take the ride's lock,
//! 2. read the ride from the store,
//! 3. apply the change to a local copy (validation errors stop here, before
//!    anything is written),
//! 4. compare-and-swap the copy back,
//! 5. publish, still under the lock, so events on `ride:<id>` follow commit
//!    order.
//!
//! Once step 4 succeeds the operation reports success. Follow-up work that
//! fails afterwards (notification bookkeeping, ETA refresh) is logged.

use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use farebid_core::{
  chat::ChatMessage,
  driver::DriverCandidate,
  event::{Event, Group},
  geo::Coordinate,
  lifecycle::Transition,
  matching::{DriverNotification, NotificationStatus, find_candidates},
  negotiation::ProposalRef,
  ride::{Actor, NewRide, ProposalType, Ride, RideStatus},
  route::{Geocoder, RoutePlanner},
  store::DispatchStore,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
  DispatchSettings, Error, EtaEstimator, FanoutRouter, Result, locks::RideLocks,
};

type CoreError = farebid_core::Error;

pub struct Dispatcher<S, G, R> {
  store:    S,
  geocoder: G,
  eta:      EtaEstimator<R>,
  router:   Arc<FanoutRouter>,
  locks:    RideLocks,
  settings: DispatchSettings,
}

impl<S, G, R> Dispatcher<S, G, R>
where
  S: DispatchStore,
  G: Geocoder,
  R: RoutePlanner,
{
  pub fn new(
    store:    S,
    geocoder: G,
    planner:  R,
    router:   Arc<FanoutRouter>,
    settings: DispatchSettings,
  ) -> Result<Self> {
    settings.validate()?;
    let eta = EtaEstimator::new(planner, router.clone(), settings.collaborator_timeout());
    Ok(Self {
      store,
      geocoder,
      eta,
      router,
      locks: RideLocks::default(),
      settings,
    })
  }

  pub fn router(&self) -> &Arc<FanoutRouter> { &self.router }

  pub fn settings(&self) -> &DispatchSettings { &self.settings }

  // ── Driver directory ──────────────────────────────────────────────────────

  pub async fn register_driver(&self, driver: DriverCandidate) -> Result<()> {
    if let Some(p) = driver.position {
      check_coordinate(&p)?;
    }
    self.timed("store", self.store.upsert_driver(&driver)).await
  }

  pub async fn driver_heartbeat(&self, driver_id: Uuid, position: Coordinate) -> Result<()> {
    check_coordinate(&position)?;
    let known = self
      .timed("store", self.store.update_driver_position(driver_id, position, Utc::now()))
      .await?;
    if known { Ok(()) } else { Err(CoreError::DriverNotFound(driver_id).into()) }
  }

  pub async fn set_driver_availability(&self, driver_id: Uuid, available: bool) -> Result<()> {
    let known = self
      .timed("store", self.store.set_driver_availability(driver_id, available, Utc::now()))
      .await?;
    if known { Ok(()) } else { Err(CoreError::DriverNotFound(driver_id).into()) }
  }

  // ── Ride creation and matching ────────────────────────────────────────────

  /// Create a ride, announce it, and run the first matching pass.
  ///
  /// A failed matching pass is logged and leaves the ride `requested`;
  /// call [`rematch`](Self::rematch) to retry.
  pub async fn request_ride(&self, rider_id: Uuid, input: NewRide) -> Result<Ride> {
    let now = Utc::now();
    let mut ride = Ride::new(rider_id, &input, now)?;
    if let Some(fare) = input.proposed_fare {
      ride.submit_initial_proposal(fare)?;
    }
    if ride.pickup_address.is_none() {
      ride.pickup_address = self.address_for(ride.pickup).await;
    }
    if ride.destination_address.is_none() {
      ride.destination_address = self.address_for(ride.destination).await;
    }

    let _guard = self.locks.acquire(ride.ride_id).await;
    self.settled("store", self.store.insert_ride(&ride)).await?;
    tracing::info!(ride_id = %ride.ride_id, rider_id = %rider_id, "ride requested");

    self.router.subscribe(Group::Ride(ride.ride_id), rider_id);
    if self.settings.announce_to_dispatch {
      self.router.publish(Group::Dispatch, Event::ride_update(&ride));
    }

    if let Err(e) = self.run_matching(&ride).await {
      tracing::warn!(ride_id = %ride.ride_id, error = %e, "initial matching failed");
    }
    Ok(ride)
  }

  /// Run another matching pass for a ride that is still `requested`.
  pub async fn rematch(&self, ride_id: Uuid) -> Result<Vec<DriverNotification>> {
    let _guard = self.locks.acquire(ride_id).await;
    let ride = self.load(ride_id).await?;
    if ride.status != RideStatus::Requested {
      return Err(CoreError::illegal(ride.status, "rematch").into());
    }
    self.run_matching(&ride).await
  }

  async fn run_matching(&self, ride: &Ride) -> Result<Vec<DriverNotification>> {
    let config = &self.settings.matching;
    let pool = self
      .timed(
        "driver directory",
        self.store.nearby_available_drivers(
          ride.pickup,
          config.search_radius_km,
          config.pool_limit(),
        ),
      )
      .await?;

    let notifications = find_candidates(ride, &pool, config, Utc::now());
    if notifications.is_empty() {
      tracing::info!(ride_id = %ride.ride_id, pool = pool.len(), "no drivers matched");
      return Ok(notifications);
    }
    self.settled("store", self.store.append_notifications(&notifications)).await?;

    for n in &notifications {
      self.router.publish(Group::User(n.driver_id), Event::ride_update(ride));
    }
    tracing::info!(
      ride_id = %ride.ride_id,
      notified = notifications.len(),
      "drivers notified"
    );
    Ok(notifications)
  }

  // ── Negotiation ───────────────────────────────────────────────────────────

  /// Record the rider's opening ask on a ride requested without one.
  pub async fn submit_initial_proposal(
    &self,
    rider_id: Uuid,
    ride_id:  Uuid,
    amount:   Decimal,
  ) -> Result<Ride> {
    let _guard = self.locks.acquire(ride_id).await;
    let mut ride = self.load(ride_id).await?;
    if ride.rider_id != rider_id {
      return Err(CoreError::illegal(ride.status, "submit initial proposal").into());
    }
    ride.submit_initial_proposal(amount)?;
    let ride = self.commit(ride).await?;

    self.router.publish(Group::Ride(ride_id), Event::BidUpdate {
      ride_id,
      amount,
      proposer: ProposalType::Passenger,
    });
    Ok(ride)
  }

  pub async fn submit_counter_offer(
    &self,
    rider_id: Uuid,
    ride_id:  Uuid,
    amount:   Decimal,
    message:  Option<String>,
  ) -> Result<Ride> {
    let _guard = self.locks.acquire(ride_id).await;
    let mut ride = self.load(ride_id).await?;
    if ride.rider_id != rider_id {
      return Err(CoreError::illegal(ride.status, "submit counter-offer").into());
    }
    let amount = ride.submit_counter_offer(amount, message, Utc::now())?.amount;
    let ride = self.commit(ride).await?;

    let event = Event::BidUpdate { ride_id, amount, proposer: ProposalType::Passenger };
    self.router.publish(Group::Ride(ride_id), event.clone());
    for driver_id in ride.bidders() {
      self.router.publish(Group::User(driver_id), event.clone());
    }
    Ok(ride)
  }

  pub async fn submit_bid(
    &self,
    driver_id: Uuid,
    ride_id:   Uuid,
    amount:    Decimal,
    message:   Option<String>,
  ) -> Result<Ride> {
    self.require_driver(driver_id).await?;

    let _guard = self.locks.acquire(ride_id).await;
    let mut ride = self.load(ride_id).await?;
    let now = Utc::now();
    let amount = ride.submit_driver_bid(driver_id, amount, message, now)?.amount;
    let ride = self.commit(ride).await?;

    self.router.publish(Group::Ride(ride_id), Event::BidUpdate {
      ride_id,
      amount,
      proposer: ProposalType::Driver,
    });
    if let Err(e) = self
      .resolve_notifications(ride_id, driver_id, NotificationStatus::Bid, now)
      .await
    {
      tracing::warn!(
        ride_id = %ride_id,
        driver_id = %driver_id,
        error = %e,
        "bid committed but its notification was not resolved"
      );
    }
    Ok(ride)
  }

  /// Accept one ledger entry. See [`Ride::accept_proposal`] for who may
  /// accept what.
  pub async fn accept_proposal(
    &self,
    actor:    Actor,
    ride_id:  Uuid,
    proposal: ProposalRef,
  ) -> Result<Ride> {
    if let Actor::Driver(driver_id) = actor {
      self.require_driver(driver_id).await?;
    }

    let _guard = self.locks.acquire(ride_id).await;
    let mut ride = self.load(ride_id).await?;
    ride.accept_proposal(actor, proposal, Utc::now())?;
    let ride = self.commit(ride).await?;

    if let Some(driver_id) = ride.driver_id {
      self.router.subscribe(Group::Ride(ride_id), driver_id);
    }
    self.router.publish(Group::Ride(ride_id), Event::ride_update(&ride));
    Ok(ride)
  }

  pub async fn decline_ride(&self, driver_id: Uuid, ride_id: Uuid) -> Result<()> {
    let _guard = self.locks.acquire(ride_id).await;
    self.load(ride_id).await?;
    let resolved = self
      .resolve_notifications(ride_id, driver_id, NotificationStatus::Declined, Utc::now())
      .await?;
    if resolved == 0 {
      return Err(CoreError::NotificationNotFound(ride_id).into());
    }
    Ok(())
  }

  // ── Lifecycle ─────────────────────────────────────────────────────────────

  /// A driver takes the ride at the passenger's standing ask.
  pub async fn accept_ride(&self, driver_id: Uuid, ride_id: Uuid) -> Result<Ride> {
    self.require_driver(driver_id).await?;
    self.transition(ride_id, Transition::DriverAccepts { driver_id }).await
  }

  pub async fn start_ride(&self, driver_id: Uuid, ride_id: Uuid) -> Result<Ride> {
    self.transition(ride_id, Transition::Start { driver_id }).await
  }

  pub async fn complete_ride(&self, driver_id: Uuid, ride_id: Uuid) -> Result<Ride> {
    self.transition(ride_id, Transition::Complete { driver_id }).await
  }

  pub async fn cancel_ride(&self, rider_id: Uuid, ride_id: Uuid) -> Result<Ride> {
    self.transition(ride_id, Transition::Cancel { rider_id }).await
  }

  async fn transition(&self, ride_id: Uuid, transition: Transition) -> Result<Ride> {
    let _guard = self.locks.acquire(ride_id).await;
    let mut ride = self.load(ride_id).await?;
    let audience = transition.audience(&ride);
    ride.apply(transition, Utc::now())?;
    let ride = self.commit(ride).await?;

    if let (RideStatus::Accepted, Some(driver_id)) = (ride.status, ride.driver_id) {
      self.router.subscribe(Group::Ride(ride_id), driver_id);
    }
    self.router.publish(audience, Event::ride_update(&ride));
    if ride.status.is_terminal() {
      self.router.dissolve(Group::Ride(ride_id));
    }
    Ok(ride)
  }

  // ── Location ──────────────────────────────────────────────────────────────

  /// Relay the assigned driver's position and refresh the ETA.
  ///
  /// A routing failure is logged and does not fail the ping; the ride's
  /// previous ETA stays in place and no `eta_update` is sent.
  pub async fn location_ping(
    &self,
    driver_id: Uuid,
    ride_id:   Uuid,
    position:  Coordinate,
  ) -> Result<Ride> {
    check_coordinate(&position)?;

    let _guard = self.locks.acquire(ride_id).await;
    let ride = self.load(ride_id).await?;
    let in_progress = matches!(ride.status, RideStatus::Accepted | RideStatus::Started);
    if !in_progress || !ride.is_assigned_to(driver_id) {
      return Err(CoreError::illegal(ride.status, "send location").into());
    }

    let now = Utc::now();
    if let Err(e) = self
      .timed("store", self.store.update_driver_position(driver_id, position, now))
      .await
    {
      tracing::warn!(driver_id = %driver_id, error = %e, "failed to record driver position");
    }
    self.router.publish(Group::Ride(ride_id), Event::LocationUpdate {
      ride_id,
      driver_id,
      position,
      recorded_at: now,
    });

    let mut next = ride.clone();
    let estimate = match self.eta.refresh(&mut next, position).await {
      Ok(estimate) => estimate,
      Err(e) => {
        tracing::warn!(ride_id = %ride_id, error = %e, "eta refresh failed");
        return Ok(ride);
      }
    };
    match self.commit(next).await {
      Ok(committed) => {
        self.eta.announce(&committed, &estimate);
        Ok(committed)
      }
      Err(e) => {
        tracing::warn!(ride_id = %ride_id, error = %e, "failed to store refreshed eta");
        Ok(ride)
      }
    }
  }

  // ── Notifications ─────────────────────────────────────────────────────────

  /// Mark every pending notification older than the TTL as expired.
  pub async fn expire_notifications(&self, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = now - self.settings.notification_ttl();
    let stale = self
      .timed("store", self.store.pending_notifications_before(cutoff))
      .await?;

    let mut expired = 0;
    for mut n in stale {
      if n.resolve(NotificationStatus::Expired, now)
        && self.settled("store", self.store.resolve_notification(&n)).await?
      {
        expired += 1;
      }
    }
    tracing::debug!(expired, "notifications expired");
    Ok(expired)
  }

  async fn resolve_notifications(
    &self,
    ride_id:   Uuid,
    driver_id: Uuid,
    status:    NotificationStatus,
    now:       DateTime<Utc>,
  ) -> Result<usize> {
    let pending = self
      .timed("store", self.store.notifications_for(ride_id))
      .await?
      .into_iter()
      .filter(|n| n.driver_id == driver_id && n.is_pending());

    let mut resolved = 0;
    for mut n in pending {
      if n.resolve(status, now) && self.settled("store", self.store.resolve_notification(&n)).await? {
        resolved += 1;
      }
    }
    Ok(resolved)
  }

  // ── Chat ──────────────────────────────────────────────────────────────────

  /// Send `body` from one party of an in-progress ride to the other and
  /// publish it to the ride group.
  pub async fn send_message(
    &self,
    sender_id: Uuid,
    ride_id:   Uuid,
    body:      &str,
  ) -> Result<ChatMessage> {
    let _guard = self.locks.acquire(ride_id).await;
    let ride = self.load(ride_id).await?;
    let message = ChatMessage::compose(&ride, sender_id, body, Utc::now())?;
    self.settled("store", self.store.append_message(&message)).await?;

    self.router.publish(Group::Ride(ride_id), Event::ChatMessage {
      message: message.clone(),
    });
    Ok(message)
  }

  /// The ride's conversation, oldest first. Only the rider and the assigned
  /// driver may read it.
  pub async fn messages_for(&self, reader_id: Uuid, ride_id: Uuid) -> Result<Vec<ChatMessage>> {
    self.require_party(reader_id, ride_id, "read messages").await?;
    self.timed("store", self.store.messages_for(ride_id)).await
  }

  /// Mark everything addressed to `reader_id` on the ride as read.
  pub async fn mark_messages_read(&self, reader_id: Uuid, ride_id: Uuid) -> Result<usize> {
    self.require_party(reader_id, ride_id, "mark messages read").await?;
    self
      .settled("store", self.store.mark_messages_read(ride_id, reader_id, Utc::now()))
      .await
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  pub async fn get_ride(&self, ride_id: Uuid) -> Result<Ride> { self.load(ride_id).await }

  pub async fn rides_for_rider(&self, rider_id: Uuid) -> Result<Vec<Ride>> {
    self.timed("store", self.store.rides_for_rider(rider_id)).await
  }

  /// An available driver sees open requests plus the rides they have
  /// accepted; an unavailable one sees only their own rides.
  pub async fn rides_for_driver(&self, driver_id: Uuid, available: bool) -> Result<Vec<Ride>> {
    if !available {
      const OWN: [RideStatus; 4] = [
        RideStatus::Accepted,
        RideStatus::Started,
        RideStatus::Completed,
        RideStatus::Cancelled,
      ];
      return self.timed("store", self.store.rides_for_driver(driver_id, &OWN)).await;
    }

    let mut rides = self.timed("store", self.store.open_rides()).await?;
    rides.extend(
      self
        .timed("store", self.store.rides_for_driver(driver_id, &[RideStatus::Accepted]))
        .await?,
    );
    rides.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(rides)
  }

  pub async fn notifications_for(&self, ride_id: Uuid) -> Result<Vec<DriverNotification>> {
    self.load(ride_id).await?;
    self.timed("store", self.store.notifications_for(ride_id)).await
  }

  // ── Helpers ───────────────────────────────────────────────────────────────

  async fn load(&self, ride_id: Uuid) -> Result<Ride> {
    self
      .timed("store", self.store.get_ride(ride_id))
      .await?
      .ok_or_else(|| CoreError::RideNotFound(ride_id).into())
  }

  async fn commit(&self, ride: Ride) -> Result<Ride> {
    let ride_id = ride.ride_id;
    self
      .settled("store", self.store.update_ride(ride))
      .await?
      .ok_or(Error::Conflict(ride_id))
  }

  async fn require_party(&self, user_id: Uuid, ride_id: Uuid, action: &'static str) -> Result<Ride> {
    let ride = self.load(ride_id).await?;
    if ride.rider_id == user_id || ride.is_assigned_to(user_id) {
      Ok(ride)
    } else {
      Err(CoreError::illegal(ride.status, action).into())
    }
  }

  async fn require_driver(&self, driver_id: Uuid) -> Result<()> {
    match self.timed("store", self.store.get_driver(driver_id)).await? {
      Some(_) => Ok(()),
      None => Err(CoreError::DriverNotFound(driver_id).into()),
    }
  }

  /// Reverse-geocode under the collaborator timeout. Failure is not fatal.
  async fn address_for(&self, at: Coordinate) -> Option<String> {
    let timeout = self.settings.collaborator_timeout();
    match tokio::time::timeout(timeout, self.geocoder.reverse_geocode(at)).await {
      Ok(Ok(address)) => Some(address),
      Ok(Err(e)) => {
        tracing::warn!(latitude = at.latitude, longitude = at.longitude, error = %e, "geocoding failed");
        None
      }
      Err(_) => {
        tracing::warn!(latitude = at.latitude, longitude = at.longitude, "geocoding timed out");
        None
      }
    }
  }

  /// Await a store write without ever abandoning it.
  ///
  /// A dropped write may already be queued on the store and land later, so a
  /// write that overruns the collaborator timeout is logged and then awaited
  /// to its real outcome. Callers publish only what actually committed.
  async fn settled<T, E>(
    &self,
    what: &'static str,
    fut:  impl Future<Output = std::result::Result<T, E>>,
  ) -> Result<T>
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    let mut fut = std::pin::pin!(fut);
    let timeout = self.settings.collaborator_timeout();
    let result = match tokio::time::timeout(timeout, fut.as_mut()).await {
      Ok(result) => result,
      Err(_) => {
        tracing::warn!(
          what,
          after_ms = self.settings.collaborator_timeout_ms,
          "store write overran its timeout, waiting for it to settle"
        );
        fut.await
      }
    };
    result.map_err(Error::store)
  }

  /// Await a store read under the collaborator timeout.
  async fn timed<T, E>(
    &self,
    what: &'static str,
    fut:  impl Future<Output = std::result::Result<T, E>>,
  ) -> Result<T>
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    let timeout = self.settings.collaborator_timeout();
    match tokio::time::timeout(timeout, fut).await {
      Ok(result) => result.map_err(Error::store),
      Err(_) => Err(Error::Timeout {
        what,
        after_ms: self.settings.collaborator_timeout_ms,
      }),
    }
  }
}

fn check_coordinate(c: &Coordinate) -> Result<()> {
  Coordinate::new(c.latitude, c.longitude)?;
  Ok(())
}
