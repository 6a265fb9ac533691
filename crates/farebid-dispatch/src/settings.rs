//! Runtime settings for the dispatcher.

use std::time::Duration;

use farebid_core::{Error, Result, matching::MatchingConfig};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
  pub matching:                MatchingConfig,
  /// A pending notification older than this is marked expired.
  pub notification_ttl_secs:   u64,
  /// Deadline for geocoding, routing, and store reads. A store write that
  /// overruns it is logged and still awaited.
  pub collaborator_timeout_ms: u64,
  /// Broadcast new ride requests to the `dispatch` group.
  pub announce_to_dispatch:    bool,
}

impl Default for DispatchSettings {
  fn default() -> Self {
    Self {
      matching:                MatchingConfig::default(),
      notification_ttl_secs:   60,
      collaborator_timeout_ms: 3000,
      announce_to_dispatch:    true,
    }
  }
}

impl DispatchSettings {
  pub fn validate(&self) -> Result<()> {
    self.matching.validate()?;
    if self.notification_ttl_secs == 0 {
      return Err(Error::InvalidInput("notification_ttl_secs must be positive".into()));
    }
    if self.collaborator_timeout_ms == 0 {
      return Err(Error::InvalidInput("collaborator_timeout_ms must be positive".into()));
    }
    Ok(())
  }

  pub fn collaborator_timeout(&self) -> Duration {
    Duration::from_millis(self.collaborator_timeout_ms)
  }

  pub fn notification_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(self.notification_ttl_secs).unwrap_or(i64::MAX))
  }
}
