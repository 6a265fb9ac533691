//! Error types for `farebid-core`.

use thiserror::Error;
use uuid::Uuid;

use crate::ride::RideStatus;

/// Coarse classification of every error the engine can raise. Callers decide
/// whether to retry, re-read, or give up based on this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Malformed request; the caller must fix it before retrying.
  InvalidInput,
  /// The ride is not in a state that allows the action. Nothing was mutated.
  IllegalStateTransition,
  /// An external collaborator failed or timed out. Safe to retry.
  CollaboratorUnavailable,
  NotFound,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid input: {0}")]
  InvalidInput(String),

  #[error("proposal index {index} is out of range (ledger holds {len})")]
  ProposalOutOfRange { index: usize, len: usize },

  #[error("cannot perform this transition: {action} while ride is {status}")]
  IllegalStateTransition {
    status: RideStatus,
    action: &'static str,
  },

  #[error("collaborator unavailable: {0}")]
  CollaboratorUnavailable(String),

  #[error("ride not found: {0}")]
  RideNotFound(Uuid),

  #[error("driver not found: {0}")]
  DriverNotFound(Uuid),

  #[error("notification not found: {0}")]
  NotificationNotFound(Uuid),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::InvalidInput(_) | Self::ProposalOutOfRange { .. } => {
        ErrorKind::InvalidInput
      }
      Self::IllegalStateTransition { .. } => ErrorKind::IllegalStateTransition,
      Self::CollaboratorUnavailable(_) | Self::Serialization(_) => {
        ErrorKind::CollaboratorUnavailable
      }
      Self::RideNotFound(_)
      | Self::DriverNotFound(_)
      | Self::NotificationNotFound(_) => ErrorKind::NotFound,
    }
  }

  pub fn illegal(status: RideStatus, action: &'static str) -> Self {
    Self::IllegalStateTransition { status, action }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
