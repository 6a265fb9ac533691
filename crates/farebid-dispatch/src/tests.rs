//! End-to-end tests for `Dispatcher` over an in-memory SQLite store.

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Duration as StdDuration,
};

use chrono::{DateTime, Duration, Utc};
use farebid_core::{
  ErrorKind,
  chat::ChatMessage,
  driver::DriverCandidate,
  event::{Envelope, Event, EventKind, Group},
  geo::{Coordinate, EARTH_RADIUS_KM},
  matching::{DriverNotification, NotificationStatus},
  negotiation::ProposalRef,
  ride::{Actor, NewRide, ProposalType, Ride, RideStatus},
  route::{Geocoder, RouteEstimate, RoutePlanner, StraightLineRouter},
  store::DispatchStore,
};
use farebid_store_sqlite::SqliteStore;
use rust_decimal::Decimal;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

use crate::{ChannelSink, DispatchSettings, Dispatcher, FanoutRouter};

/// How long a slow double stalls; well past [`quick_timeouts`].
const STALL: StdDuration = StdDuration::from_millis(400);

// ─── Doubles ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct TestGeocoder {
  fail: bool,
  slow: bool,
}

impl Geocoder for TestGeocoder {
  async fn reverse_geocode(&self, at: Coordinate) -> farebid_core::Result<String> {
    if self.slow {
      tokio::time::sleep(STALL).await;
    }
    if self.fail {
      return Err(farebid_core::Error::CollaboratorUnavailable("geocoder down".into()));
    }
    Ok(format!("{:.3}, {:.3}", at.latitude, at.longitude))
  }
}

/// Straight-line routing that can be switched off or slowed mid-test.
struct FlakyPlanner {
  down:  Arc<AtomicBool>,
  slow:  Arc<AtomicBool>,
  inner: StraightLineRouter,
}

impl RoutePlanner for FlakyPlanner {
  async fn compute_eta(
    &self,
    origin: Coordinate,
    destination: Coordinate,
  ) -> farebid_core::Result<RouteEstimate> {
    if self.slow.load(Ordering::SeqCst) {
      tokio::time::sleep(STALL).await;
    }
    if self.down.load(Ordering::SeqCst) {
      return Err(farebid_core::Error::CollaboratorUnavailable("router down".into()));
    }
    self.inner.estimate(origin, destination)
  }
}

/// Switches for [`FaultyStore`].
#[derive(Default)]
struct StoreFaults {
  /// `notifications_for` fails.
  notification_log_down: AtomicBool,
  /// Ride updates fail without writing.
  ride_writes_down:      AtomicBool,
  /// Ride updates land, then the reply is held back this long.
  slow_reply_ms:         AtomicU64,
}

#[derive(Debug, thiserror::Error)]
enum FaultyError {
  #[error(transparent)]
  Store(#[from] farebid_store_sqlite::Error),
  #[error("{0}")]
  Injected(&'static str),
}

/// The SQLite store with injectable faults.
struct FaultyStore {
  inner:  SqliteStore,
  faults: Arc<StoreFaults>,
}

impl DispatchStore for FaultyStore {
  type Error = FaultyError;

  async fn insert_ride(&self, ride: &Ride) -> Result<(), FaultyError> {
    Ok(self.inner.insert_ride(ride).await?)
  }

  async fn get_ride(&self, ride_id: Uuid) -> Result<Option<Ride>, FaultyError> {
    Ok(self.inner.get_ride(ride_id).await?)
  }

  async fn update_ride(&self, ride: Ride) -> Result<Option<Ride>, FaultyError> {
    if self.faults.ride_writes_down.load(Ordering::SeqCst) {
      return Err(FaultyError::Injected("ride writes down"));
    }
    let committed = self.inner.update_ride(ride).await?;
    let delay = self.faults.slow_reply_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(StdDuration::from_millis(delay)).await;
    }
    Ok(committed)
  }

  async fn rides_for_rider(&self, rider_id: Uuid) -> Result<Vec<Ride>, FaultyError> {
    Ok(self.inner.rides_for_rider(rider_id).await?)
  }

  async fn rides_for_driver(
    &self,
    driver_id: Uuid,
    statuses: &[RideStatus],
  ) -> Result<Vec<Ride>, FaultyError> {
    Ok(self.inner.rides_for_driver(driver_id, statuses).await?)
  }

  async fn open_rides(&self) -> Result<Vec<Ride>, FaultyError> {
    Ok(self.inner.open_rides().await?)
  }

  async fn upsert_driver(&self, driver: &DriverCandidate) -> Result<(), FaultyError> {
    Ok(self.inner.upsert_driver(driver).await?)
  }

  async fn get_driver(&self, driver_id: Uuid) -> Result<Option<DriverCandidate>, FaultyError> {
    Ok(self.inner.get_driver(driver_id).await?)
  }

  async fn nearby_available_drivers(
    &self,
    center: Coordinate,
    radius_km: f64,
    limit: usize,
  ) -> Result<Vec<DriverCandidate>, FaultyError> {
    Ok(self.inner.nearby_available_drivers(center, radius_km, limit).await?)
  }

  async fn update_driver_position(
    &self,
    driver_id: Uuid,
    position: Coordinate,
    at: DateTime<Utc>,
  ) -> Result<bool, FaultyError> {
    Ok(self.inner.update_driver_position(driver_id, position, at).await?)
  }

  async fn set_driver_availability(
    &self,
    driver_id: Uuid,
    available: bool,
    at: DateTime<Utc>,
  ) -> Result<bool, FaultyError> {
    Ok(self.inner.set_driver_availability(driver_id, available, at).await?)
  }

  async fn append_notifications(
    &self,
    notifications: &[DriverNotification],
  ) -> Result<(), FaultyError> {
    Ok(self.inner.append_notifications(notifications).await?)
  }

  async fn notifications_for(&self, ride_id: Uuid) -> Result<Vec<DriverNotification>, FaultyError> {
    if self.faults.notification_log_down.load(Ordering::SeqCst) {
      return Err(FaultyError::Injected("notification log down"));
    }
    Ok(self.inner.notifications_for(ride_id).await?)
  }

  async fn resolve_notification(
    &self,
    notification: &DriverNotification,
  ) -> Result<bool, FaultyError> {
    Ok(self.inner.resolve_notification(notification).await?)
  }

  async fn pending_notifications_before(
    &self,
    cutoff: DateTime<Utc>,
  ) -> Result<Vec<DriverNotification>, FaultyError> {
    Ok(self.inner.pending_notifications_before(cutoff).await?)
  }

  async fn append_message(&self, message: &ChatMessage) -> Result<(), FaultyError> {
    Ok(self.inner.append_message(message).await?)
  }

  async fn messages_for(&self, ride_id: Uuid) -> Result<Vec<ChatMessage>, FaultyError> {
    Ok(self.inner.messages_for(ride_id).await?)
  }

  async fn mark_messages_read(
    &self,
    ride_id: Uuid,
    recipient_id: Uuid,
    at: DateTime<Utc>,
  ) -> Result<usize, FaultyError> {
    Ok(self.inner.mark_messages_read(ride_id, recipient_id, at).await?)
  }
}

type TestDispatcher = Dispatcher<FaultyStore, TestGeocoder, FlakyPlanner>;

struct Harness {
  dispatcher:  TestDispatcher,
  router_down: Arc<AtomicBool>,
  router_slow: Arc<AtomicBool>,
  faults:      Arc<StoreFaults>,
}

async fn harness_with(geocoder: TestGeocoder, settings: DispatchSettings) -> Harness {
  let store = SqliteStore::open_in_memory().await.expect("in-memory store");
  let faults = Arc::new(StoreFaults::default());
  let router_down = Arc::new(AtomicBool::new(false));
  let router_slow = Arc::new(AtomicBool::new(false));
  let planner = FlakyPlanner {
    down:  router_down.clone(),
    slow:  router_slow.clone(),
    inner: StraightLineRouter::default(),
  };
  let dispatcher = Dispatcher::new(
    FaultyStore { inner: store, faults: faults.clone() },
    geocoder,
    planner,
    Arc::new(FanoutRouter::new()),
    settings,
  )
  .expect("valid settings");
  Harness { dispatcher, router_down, router_slow, faults }
}

async fn harness() -> Harness {
  harness_with(TestGeocoder::default(), DispatchSettings::default()).await
}

fn quick_timeouts() -> DispatchSettings {
  DispatchSettings { collaborator_timeout_ms: 100, ..DispatchSettings::default() }
}

fn pickup() -> Coordinate { Coordinate::new(12.90, 77.58).unwrap() }

fn destination() -> Coordinate { Coordinate::new(12.97, 77.64).unwrap() }

fn north_of_pickup(km: f64) -> Coordinate {
  Coordinate::new(12.90 + (km / EARTH_RADIUS_KM).to_degrees(), 77.58).unwrap()
}

fn request(fare: Option<i64>) -> NewRide {
  NewRide {
    pickup:              pickup(),
    destination:         destination(),
    pickup_address:      None,
    destination_address: None,
    proposed_fare:       fare.map(|f| Decimal::new(f, 0)),
  }
}

fn connect(d: &TestDispatcher, user: Uuid, is_driver: bool) -> Receiver<Envelope> {
  let (sink, rx) = ChannelSink::new(64);
  d.router().connect(user, Arc::new(sink), is_driver);
  rx
}

async fn online_driver(d: &TestDispatcher, km: f64) -> (Uuid, Receiver<Envelope>) {
  let id = Uuid::new_v4();
  d.register_driver(DriverCandidate::new(id, north_of_pickup(km), 4.5))
    .await
    .unwrap();
  (id, connect(d, id, true))
}

fn drain(rx: &mut Receiver<Envelope>) -> Vec<Envelope> {
  let mut out = Vec::new();
  while let Ok(e) = rx.try_recv() {
    out.push(e);
  }
  out
}

fn kinds(events: &[Envelope]) -> Vec<(Group, EventKind)> {
  events.iter().map(|e| (e.group, e.event.kind())).collect()
}

// ─── Request and matching ────────────────────────────────────────────────────

#[tokio::test]
async fn request_announces_and_notifies_matched_drivers() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (near, mut near_rx) = online_driver(d, 0.5).await;
  let (far, mut far_rx) = online_driver(d, 1.0).await;
  let (_, mut distant_rx) = online_driver(d, 20.0).await;

  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();
  assert_eq!(ride.status, RideStatus::Requested);
  assert_eq!(ride.proposed_fare, Some(Decimal::new(100, 0)));
  assert_eq!(ride.pickup_address.as_deref(), Some("12.900, 77.580"));
  assert!(ride.destination_address.is_some());

  assert!(drain(&mut rider_rx).is_empty());
  let expected = vec![
    (Group::Dispatch, EventKind::RideUpdate),
    (Group::User(near), EventKind::RideUpdate),
  ];
  assert_eq!(kinds(&drain(&mut near_rx)), expected);
  assert_eq!(kinds(&drain(&mut far_rx))[1], (Group::User(far), EventKind::RideUpdate));
  // Announced to every driver, matched only within the radius.
  assert_eq!(kinds(&drain(&mut distant_rx)), vec![(Group::Dispatch, EventKind::RideUpdate)]);

  let notes = d.notifications_for(ride.ride_id).await.unwrap();
  let order: Vec<Uuid> = notes.iter().map(|n| n.driver_id).collect();
  assert_eq!(order, vec![near, far]);
  assert!(notes.iter().all(|n| n.status == NotificationStatus::Pending));
  assert_eq!(d.router().subscribers(Group::Ride(ride.ride_id)), vec![rider]);
}

#[tokio::test]
async fn geocoder_failure_is_not_fatal() {
  let geocoder = TestGeocoder { fail: true, ..TestGeocoder::default() };
  let h = harness_with(geocoder, DispatchSettings::default()).await;
  let ride = h
    .dispatcher
    .request_ride(Uuid::new_v4(), request(Some(80)))
    .await
    .unwrap();
  assert!(ride.pickup_address.is_none());
  assert!(ride.destination_address.is_none());
}

#[tokio::test]
async fn bad_request_is_rejected_without_a_ride() {
  let h = harness().await;
  let rider = Uuid::new_v4();
  let mut input = request(Some(100));
  input.pickup = Coordinate { latitude: 91.0, longitude: 0.0 };
  let err = h.dispatcher.request_ride(rider, input).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);

  let err = h.dispatcher.request_ride(rider, request(Some(0))).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
  assert!(h.dispatcher.rides_for_rider(rider).await.unwrap().is_empty());
}

#[tokio::test]
async fn rematch_only_while_requested() {
  let h = harness().await;
  let d = &h.dispatcher;
  let ride = d.request_ride(Uuid::new_v4(), request(Some(100))).await.unwrap();
  assert!(d.rematch(ride.ride_id).await.unwrap().is_empty());

  let (driver, _rx) = online_driver(d, 0.3).await;
  let notes = d.rematch(ride.ride_id).await.unwrap();
  assert_eq!(notes.len(), 1);
  assert_eq!(notes[0].driver_id, driver);

  d.cancel_ride(ride.rider_id, ride.ride_id).await.unwrap();
  let err = d.rematch(ride.ride_id).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);

  let err = d.rematch(Uuid::new_v4()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ─── Negotiation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn bid_then_rider_accepts() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, mut driver_rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();

  let after_bid = d
    .submit_bid(driver, ride.ride_id, Decimal::new(150, 0), Some("on my way".into()))
    .await
    .unwrap();
  assert_eq!(after_bid.driver_proposals.len(), 1);
  let bid_events = drain(&mut rider_rx);
  assert_eq!(bid_events.len(), 1);
  assert_eq!(
    bid_events[0].event,
    Event::BidUpdate {
      ride_id:  ride.ride_id,
      amount:   Decimal::new(150, 0),
      proposer: ProposalType::Driver,
    }
  );

  // The bid answers the driver's notification.
  let notes = d.notifications_for(ride.ride_id).await.unwrap();
  assert_eq!(notes[0].status, NotificationStatus::Bid);
  assert!(notes[0].response_secs.is_some());

  drain(&mut driver_rx);
  let accepted = d
    .accept_proposal(Actor::Rider(rider), ride.ride_id, ProposalRef::Driver(0))
    .await
    .unwrap();
  assert_eq!(accepted.status, RideStatus::Accepted);
  assert_eq!(accepted.final_fare, Some(Decimal::new(150, 0)));
  assert_eq!(accepted.driver_id, Some(driver));
  assert!(accepted.invariants_hold());

  let rider_events = drain(&mut rider_rx);
  assert_eq!(kinds(&rider_events), vec![(Group::Ride(ride.ride_id), EventKind::RideUpdate)]);
  let Event::RideUpdate { ride: snapshot } = &rider_events[0].event else {
    panic!("expected ride_update");
  };
  assert_eq!(snapshot.status, RideStatus::Accepted);
  // The driver joined the ride group before the update went out.
  assert_eq!(
    kinds(&drain(&mut driver_rx)),
    vec![(Group::Ride(ride.ride_id), EventKind::RideUpdate)]
  );

  // The ledger is frozen.
  let err = d
    .accept_proposal(Actor::Rider(rider), ride.ride_id, ProposalRef::Driver(0))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
  let err = d
    .submit_bid(driver, ride.ride_id, Decimal::new(90, 0), None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
}

#[tokio::test]
async fn counter_offer_reaches_bidders_and_driver_accepts() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let (bidder, mut bidder_rx) = online_driver(d, 0.5).await;
  let (silent, mut silent_rx) = online_driver(d, 0.8).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();

  d.submit_bid(bidder, ride.ride_id, Decimal::new(140, 0), None).await.unwrap();
  drain(&mut bidder_rx);
  drain(&mut silent_rx);

  // Only the rider may counter.
  let err = d
    .submit_counter_offer(bidder, ride.ride_id, Decimal::new(120, 0), None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);

  d.submit_counter_offer(rider, ride.ride_id, Decimal::new(120, 0), None)
    .await
    .unwrap();
  assert_eq!(kinds(&drain(&mut bidder_rx)), vec![(Group::User(bidder), EventKind::BidUpdate)]);
  assert!(drain(&mut silent_rx).is_empty());

  let accepted = d
    .accept_proposal(Actor::Driver(silent), ride.ride_id, ProposalRef::Passenger(0))
    .await
    .unwrap();
  assert_eq!(accepted.driver_id, Some(silent));
  assert_eq!(accepted.final_fare, Some(Decimal::new(120, 0)));
}

#[tokio::test]
async fn invalid_amounts_and_unknown_parties() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let (driver, _rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();

  let err = d.submit_bid(driver, ride.ride_id, Decimal::ZERO, None).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
  let err = d
    .submit_bid(Uuid::new_v4(), ride.ride_id, Decimal::new(150, 0), None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
  let err = d
    .submit_bid(driver, Uuid::new_v4(), Decimal::new(150, 0), None)
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
  let err = d
    .accept_proposal(Actor::Rider(rider), ride.ride_id, ProposalRef::Driver(0))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);

  let stored = d.get_ride(ride.ride_id).await.unwrap();
  assert!(stored.driver_proposals.is_empty());
  assert_eq!(stored.version, ride.version);
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_have_one_winner() {
  let h = harness().await;
  let d = Arc::new(h.dispatcher);
  let ride = d.request_ride(Uuid::new_v4(), request(Some(100))).await.unwrap();

  let mut drivers = Vec::new();
  for i in 0..6 {
    let (id, rx) = online_driver(&d, 0.2 + i as f64 * 0.1).await;
    drivers.push((id, rx));
  }

  let tasks: Vec<_> = drivers
    .iter()
    .map(|(id, _)| {
      let d = d.clone();
      let (id, ride_id) = (*id, ride.ride_id);
      tokio::spawn(async move { (id, d.accept_ride(id, ride_id).await) })
    })
    .collect();

  let mut winners = Vec::new();
  for task in tasks {
    let (id, result) = task.await.unwrap();
    match result {
      Ok(_) => winners.push(id),
      Err(e) => assert_eq!(e.kind(), ErrorKind::IllegalStateTransition),
    }
  }
  assert_eq!(winners.len(), 1);

  let stored = d.get_ride(ride.ride_id).await.unwrap();
  assert_eq!(stored.driver_id, Some(winners[0]));
  assert_eq!(stored.status, RideStatus::Accepted);
  assert_eq!(stored.version, 1);
  assert!(stored.invariants_hold());
}

#[tokio::test]
async fn direct_accept_then_drive_to_completion() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, mut driver_rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();
  drain(&mut driver_rx);

  let accepted = d.accept_ride(driver, ride.ride_id).await.unwrap();
  assert_eq!(accepted.final_fare, Some(Decimal::new(100, 0)));
  // Direct acceptance is reported on the rider's personal channel.
  assert_eq!(kinds(&drain(&mut rider_rx)), vec![(Group::User(rider), EventKind::RideUpdate)]);

  let err = d.complete_ride(driver, ride.ride_id).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
  assert!(err.to_string().contains("accepted"));
  let err = d.cancel_ride(rider, ride.ride_id).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);

  d.start_ride(driver, ride.ride_id).await.unwrap();
  let done = d.complete_ride(driver, ride.ride_id).await.unwrap();
  assert_eq!(done.status, RideStatus::Completed);
  assert!(done.completed_at.is_some());

  let driver_events = kinds(&drain(&mut driver_rx));
  assert_eq!(driver_events, vec![
    (Group::Ride(ride.ride_id), EventKind::RideUpdate),
    (Group::Ride(ride.ride_id), EventKind::RideUpdate),
  ]);
  // Terminal rides leave no group behind.
  assert!(d.router().subscribers(Group::Ride(ride.ride_id)).is_empty());
}

#[tokio::test]
async fn direct_accept_without_fare_is_invalid() {
  let h = harness().await;
  let d = &h.dispatcher;
  let (driver, _rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(Uuid::new_v4(), request(None)).await.unwrap();
  let err = d.accept_ride(driver, ride.ride_id).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
  assert_eq!(d.get_ride(ride.ride_id).await.unwrap().status, RideStatus::Requested);
}

#[tokio::test]
async fn opening_ask_can_follow_the_request() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, _rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(None)).await.unwrap();
  assert!(ride.proposed_fare.is_none());

  let err = d
    .submit_initial_proposal(driver, ride.ride_id, Decimal::new(95, 0))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
  let err = d
    .submit_initial_proposal(rider, ride.ride_id, Decimal::new(-5, 0))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);

  let asked = d
    .submit_initial_proposal(rider, ride.ride_id, Decimal::new(95, 0))
    .await
    .unwrap();
  assert_eq!(asked.proposed_fare, Some(Decimal::new(95, 0)));
  assert_eq!(asked.proposal_type, ProposalType::Passenger);
  assert_eq!(drain(&mut rider_rx), vec![Envelope {
    group: Group::Ride(ride.ride_id),
    event: Event::BidUpdate {
      ride_id:  ride.ride_id,
      amount:   Decimal::new(95, 0),
      proposer: ProposalType::Passenger,
    },
  }]);

  // Only one opening ask, and none once bids are on the table.
  let err = d
    .submit_initial_proposal(rider, ride.ride_id, Decimal::new(90, 0))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);

  let other = d.request_ride(rider, request(None)).await.unwrap();
  d.submit_bid(driver, other.ride_id, Decimal::new(130, 0), None).await.unwrap();
  let err = d
    .submit_initial_proposal(rider, other.ride_id, Decimal::new(90, 0))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
  assert!(d.get_ride(other.ride_id).await.unwrap().proposed_fare.is_none());

  // The ask now backs a direct acceptance.
  let accepted = d.accept_ride(driver, ride.ride_id).await.unwrap();
  assert_eq!(accepted.final_fare, Some(Decimal::new(95, 0)));
}

#[tokio::test]
async fn cancel_notifies_and_dissolves() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();

  let err = d.cancel_ride(Uuid::new_v4(), ride.ride_id).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);

  let cancelled = d.cancel_ride(rider, ride.ride_id).await.unwrap();
  assert_eq!(cancelled.status, RideStatus::Cancelled);
  assert_eq!(kinds(&drain(&mut rider_rx)), vec![(Group::Ride(ride.ride_id), EventKind::RideUpdate)]);
  assert!(d.router().subscribers(Group::Ride(ride.ride_id)).is_empty());
}

// ─── Location and ETA ────────────────────────────────────────────────────────

#[tokio::test]
async fn location_ping_refreshes_eta_unless_router_fails() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, _driver_rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();
  d.accept_ride(driver, ride.ride_id).await.unwrap();

  // While accepted the ETA targets the pickup.
  let here = north_of_pickup(0.4);
  let pinged = d.location_ping(driver, ride.ride_id, here).await.unwrap();
  let to_pickup = pinged.distance_km.unwrap();
  assert!((to_pickup - 0.4).abs() < 1e-6);

  d.start_ride(driver, ride.ride_id).await.unwrap();
  drain(&mut rider_rx);

  let pinged = d.location_ping(driver, ride.ride_id, pickup()).await.unwrap();
  let eta = pinged.eta_minutes.unwrap();
  assert!(pinged.route_polyline.is_some());
  assert_eq!(kinds(&drain(&mut rider_rx)), vec![
    (Group::Ride(ride.ride_id), EventKind::LocationUpdate),
    (Group::Ride(ride.ride_id), EventKind::EtaUpdate),
  ]);

  h.router_down.store(true, Ordering::SeqCst);
  let pinged = d
    .location_ping(driver, ride.ride_id, north_of_pickup(1.0))
    .await
    .unwrap();
  assert_eq!(pinged.eta_minutes, Some(eta));
  assert_eq!(kinds(&drain(&mut rider_rx)), vec![(
    Group::Ride(ride.ride_id),
    EventKind::LocationUpdate
  )]);
  assert_eq!(d.get_ride(ride.ride_id).await.unwrap().eta_minutes, Some(eta));
}

#[tokio::test]
async fn only_the_assigned_driver_may_ping() {
  let h = harness().await;
  let d = &h.dispatcher;
  let (driver, _rx) = online_driver(d, 0.5).await;
  let (other, _other_rx) = online_driver(d, 0.6).await;
  let ride = d.request_ride(Uuid::new_v4(), request(Some(100))).await.unwrap();

  let err = d.location_ping(driver, ride.ride_id, pickup()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);

  d.accept_ride(driver, ride.ride_id).await.unwrap();
  let err = d.location_ping(other, ride.ride_id, pickup()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
  let bad = Coordinate { latitude: 0.0, longitude: 190.0 };
  let err = d.location_ping(driver, ride.ride_id, bad).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

// ─── Notifications and listings ──────────────────────────────────────────────

#[tokio::test]
async fn notifications_expire_and_decline() {
  let h = harness().await;
  let d = &h.dispatcher;
  let (first, _a) = online_driver(d, 0.5).await;
  let (second, _b) = online_driver(d, 0.9).await;
  let ride = d.request_ride(Uuid::new_v4(), request(Some(100))).await.unwrap();

  d.decline_ride(first, ride.ride_id).await.unwrap();
  let err = d.decline_ride(first, ride.ride_id).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);

  assert_eq!(d.expire_notifications(Utc::now()).await.unwrap(), 0);
  let later = Utc::now() + Duration::seconds(61);
  assert_eq!(d.expire_notifications(later).await.unwrap(), 1);
  assert_eq!(d.expire_notifications(later).await.unwrap(), 0);

  let notes = d.notifications_for(ride.ride_id).await.unwrap();
  let status_of = |id: Uuid| notes.iter().find(|n| n.driver_id == id).map(|n| n.status);
  assert_eq!(status_of(first), Some(NotificationStatus::Declined));
  assert_eq!(status_of(second), Some(NotificationStatus::Expired));
  // Expiry never touches the ride.
  assert_eq!(d.get_ride(ride.ride_id).await.unwrap().status, RideStatus::Requested);
}

#[tokio::test]
async fn ride_listings_follow_availability() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let (driver, _rx) = online_driver(d, 0.5).await;

  let mine = d.request_ride(rider, request(Some(100))).await.unwrap();
  let open = d.request_ride(rider, request(Some(90))).await.unwrap();
  d.accept_ride(driver, mine.ride_id).await.unwrap();

  let ids = |rides: Vec<Ride>| {
    rides.into_iter().map(|r| r.ride_id).collect::<Vec<_>>()
  };
  assert_eq!(ids(d.rides_for_rider(rider).await.unwrap()), vec![open.ride_id, mine.ride_id]);
  assert_eq!(
    ids(d.rides_for_driver(driver, true).await.unwrap()),
    vec![open.ride_id, mine.ride_id]
  );
  assert_eq!(ids(d.rides_for_driver(driver, false).await.unwrap()), vec![mine.ride_id]);

  d.set_driver_availability(driver, false).await.unwrap();
  let err = d.set_driver_availability(Uuid::new_v4(), false).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ─── Store and collaborator faults ───────────────────────────────────────────

#[tokio::test]
async fn bid_stands_when_the_notification_log_fails() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, _rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();

  h.faults.notification_log_down.store(true, Ordering::SeqCst);
  let after = d
    .submit_bid(driver, ride.ride_id, Decimal::new(150, 0), None)
    .await
    .unwrap();
  assert_eq!(after.driver_proposals.len(), 1);
  assert_eq!(kinds(&drain(&mut rider_rx)), vec![(Group::Ride(ride.ride_id), EventKind::BidUpdate)]);

  h.faults.notification_log_down.store(false, Ordering::SeqCst);
  let stored = d.get_ride(ride.ride_id).await.unwrap();
  assert_eq!(stored.driver_proposals.len(), 1);
  assert_eq!(stored.version, after.version);
  // The notification was left for the expiry sweep.
  let notes = d.notifications_for(ride.ride_id).await.unwrap();
  assert_eq!(notes[0].status, NotificationStatus::Pending);
}

#[tokio::test]
async fn slow_ride_write_is_reported_and_published() {
  let h = harness_with(TestGeocoder::default(), quick_timeouts()).await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, _rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();

  h.faults.slow_reply_ms.store(300, Ordering::SeqCst);
  let accepted = d.accept_ride(driver, ride.ride_id).await.unwrap();
  h.faults.slow_reply_ms.store(0, Ordering::SeqCst);

  assert_eq!(accepted.status, RideStatus::Accepted);
  assert_eq!(kinds(&drain(&mut rider_rx)), vec![(Group::User(rider), EventKind::RideUpdate)]);
  let stored = d.get_ride(ride.ride_id).await.unwrap();
  assert_eq!(stored.status, RideStatus::Accepted);
  assert_eq!(stored.version, accepted.version);
}

#[tokio::test]
async fn slow_geocoder_leaves_addresses_empty() {
  let geocoder = TestGeocoder { slow: true, ..TestGeocoder::default() };
  let h = harness_with(geocoder, quick_timeouts()).await;
  let started = tokio::time::Instant::now();
  let ride = h
    .dispatcher
    .request_ride(Uuid::new_v4(), request(Some(100)))
    .await
    .unwrap();
  assert!(ride.pickup_address.is_none());
  assert!(ride.destination_address.is_none());
  // Both lookups were cut off rather than waited out.
  assert!(started.elapsed() < STALL * 2);
}

#[tokio::test]
async fn slow_router_keeps_the_previous_eta() {
  let h = harness_with(TestGeocoder::default(), quick_timeouts()).await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, _rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();
  d.accept_ride(driver, ride.ride_id).await.unwrap();

  let first = d.location_ping(driver, ride.ride_id, north_of_pickup(0.4)).await.unwrap();
  let eta = first.eta_minutes;
  assert!(eta.is_some());
  drain(&mut rider_rx);

  h.router_slow.store(true, Ordering::SeqCst);
  let pinged = d.location_ping(driver, ride.ride_id, north_of_pickup(0.2)).await.unwrap();
  assert_eq!(pinged.eta_minutes, eta);
  assert_eq!(pinged.version, first.version);
  assert_eq!(kinds(&drain(&mut rider_rx)), vec![(
    Group::Ride(ride.ride_id),
    EventKind::LocationUpdate
  )]);
  assert_eq!(d.get_ride(ride.ride_id).await.unwrap().eta_minutes, eta);
}

#[tokio::test]
async fn eta_write_failure_does_not_fail_the_ping() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, _rx) = online_driver(d, 0.5).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();
  let accepted = d.accept_ride(driver, ride.ride_id).await.unwrap();
  drain(&mut rider_rx);

  h.faults.ride_writes_down.store(true, Ordering::SeqCst);
  let pinged = d.location_ping(driver, ride.ride_id, north_of_pickup(0.3)).await.unwrap();
  h.faults.ride_writes_down.store(false, Ordering::SeqCst);

  assert!(pinged.eta_minutes.is_none());
  assert_eq!(pinged.version, accepted.version);
  assert_eq!(kinds(&drain(&mut rider_rx)), vec![(
    Group::Ride(ride.ride_id),
    EventKind::LocationUpdate
  )]);
}

// ─── Chat ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_between_rider_and_assigned_driver() {
  let h = harness().await;
  let d = &h.dispatcher;
  let rider = Uuid::new_v4();
  let mut rider_rx = connect(d, rider, false);
  let (driver, mut driver_rx) = online_driver(d, 0.5).await;
  let (outsider, _rx) = online_driver(d, 0.6).await;
  let ride = d.request_ride(rider, request(Some(100))).await.unwrap();

  // No conversation before a driver is assigned.
  let err = d.send_message(rider, ride.ride_id, "anyone?").await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);

  d.accept_ride(driver, ride.ride_id).await.unwrap();
  drain(&mut rider_rx);
  drain(&mut driver_rx);

  let sent = d.send_message(rider, ride.ride_id, "at the gate").await.unwrap();
  assert_eq!(sent.recipient_id, driver);
  for rx in [&mut rider_rx, &mut driver_rx] {
    let got = drain(rx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].group, Group::Ride(ride.ride_id));
    assert_eq!(got[0].event, Event::ChatMessage { message: sent.clone() });
  }
  d.send_message(driver, ride.ride_id, "2 min").await.unwrap();

  let err = d.send_message(outsider, ride.ride_id, "hello").await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
  let err = d.send_message(rider, ride.ride_id, "  ").await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidInput);
  let err = d.messages_for(outsider, ride.ride_id).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);

  let log = d.messages_for(driver, ride.ride_id).await.unwrap();
  let bodies: Vec<&str> = log.iter().map(|m| m.body.as_str()).collect();
  assert_eq!(bodies, vec!["at the gate", "2 min"]);

  assert_eq!(d.mark_messages_read(driver, ride.ride_id).await.unwrap(), 1);
  assert_eq!(d.mark_messages_read(driver, ride.ride_id).await.unwrap(), 0);
  let log = d.messages_for(rider, ride.ride_id).await.unwrap();
  assert!(log[0].is_read());
  assert!(!log[1].is_read());
}
