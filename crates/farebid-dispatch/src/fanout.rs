//! Subscription groups and best-effort event delivery.
//!
//! The router knows nothing about transports. Each connected user registers
//! an [`EventSink`]; groups hold user ids. Publishing to a group hands the
//! event to the sink of every current member.
//!
//! Membership changes and publishes on the same group serialise on that
//! group's lock, so a subscribe that returned before a publish started is
//! always visible to it. Different groups never contend.

use std::{
  collections::{BTreeSet, HashMap},
  sync::Arc,
};

use farebid_core::event::{Envelope, Event, Group};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ─── Sinks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
  #[error("subscriber queue is full")]
  Full,

  #[error("subscriber is disconnected")]
  Closed,
}

/// The transport seam. `deliver` is called with the group lock held and must
/// not block.
pub trait EventSink: Send + Sync {
  fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// An [`EventSink`] backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
  tx: mpsc::Sender<Envelope>,
}

impl ChannelSink {
  pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Self { tx }, rx)
  }
}

impl EventSink for ChannelSink {
  fn deliver(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
    self.tx.try_send(envelope.clone()).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
      mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
    })
  }
}

// ─── Router ──────────────────────────────────────────────────────────────────

type Members = Arc<Mutex<BTreeSet<Uuid>>>;

#[derive(Default)]
pub struct FanoutRouter {
  groups: RwLock<HashMap<Group, Members>>,
  sinks:  RwLock<HashMap<Uuid, Arc<dyn EventSink>>>,
}

impl FanoutRouter {
  pub fn new() -> Self { Self::default() }

  /// Register `user`'s sink and join their personal group, plus `dispatch`
  /// for drivers. Reconnecting replaces the previous sink.
  pub fn connect(&self, user: Uuid, sink: Arc<dyn EventSink>, is_driver: bool) {
    self.sinks.write().insert(user, sink);
    self.subscribe(Group::User(user), user);
    if is_driver {
      self.subscribe(Group::Dispatch, user);
    }
    tracing::debug!(user_id = %user, is_driver, "subscriber connected");
  }

  /// Drop `user`'s sink and every membership they hold.
  pub fn disconnect(&self, user: Uuid) {
    self.sinks.write().remove(&user);
    self.dissolve(Group::User(user));
    let groups: Vec<Members> = self.groups.read().values().cloned().collect();
    for members in groups {
      members.lock().remove(&user);
    }
    tracing::debug!(user_id = %user, "subscriber disconnected");
  }

  /// Idempotent.
  pub fn subscribe(&self, group: Group, user: Uuid) {
    self.members(group).lock().insert(user);
  }

  /// Idempotent; removing a non-member is a no-op.
  pub fn unsubscribe(&self, group: Group, user: Uuid) {
    if let Some(members) = self.existing(group) {
      members.lock().remove(&user);
    }
  }

  /// Remove the group and all its memberships.
  pub fn dissolve(&self, group: Group) {
    let removed = self.groups.write().remove(&group);
    if let Some(members) = removed {
      members.lock().clear();
    }
  }

  /// Current members of `group`, in id order.
  pub fn subscribers(&self, group: Group) -> Vec<Uuid> {
    self
      .existing(group)
      .map(|m| m.lock().iter().copied().collect())
      .unwrap_or_default()
  }

  /// Deliver `event` to every current member of `group`.
  ///
  /// Failures are logged per subscriber and never reach the caller. Members
  /// without a registered sink are skipped. Returns how many sinks accepted
  /// the event.
  pub fn publish(&self, group: Group, event: Event) -> usize {
    let Some(members) = self.existing(group) else {
      return 0;
    };
    let envelope = Envelope { group, event };

    let members = members.lock();
    let mut delivered = 0;
    for user in members.iter() {
      let Some(sink) = self.sinks.read().get(user).cloned() else {
        continue;
      };
      match sink.deliver(&envelope) {
        Ok(()) => delivered += 1,
        Err(e) => tracing::warn!(
          group = %group,
          user_id = %user,
          kind = ?envelope.event.kind(),
          error = %e,
          "event delivery failed"
        ),
      }
    }
    delivered
  }

  fn existing(&self, group: Group) -> Option<Members> {
    self.groups.read().get(&group).cloned()
  }

  fn members(&self, group: Group) -> Members {
    if let Some(members) = self.existing(group) {
      return members;
    }
    self.groups.write().entry(group).or_default().clone()
  }
}
