//! Error type for `farebid-dispatch`.

use farebid_core::ErrorKind;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] farebid_core::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("{what} timed out after {after_ms} ms")]
  Timeout { what: &'static str, after_ms: u64 },

  /// Another writer committed to the ride between our read and our write.
  #[error("ride {0} was modified concurrently")]
  Conflict(Uuid),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Core(e) => e.kind(),
      Self::Store(_) | Self::Timeout { .. } => ErrorKind::CollaboratorUnavailable,
      Self::Conflict(_) => ErrorKind::IllegalStateTransition,
    }
  }

  pub(crate) fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
