use std::io;

use thiserror::Error;

/// Failures raised by a [`RecordStore`](crate::store::RecordStore).
///
/// Messages never include payload bytes.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record already exists under this handle. Only reachable through a
    /// handle collision, so callers treat it as an invariant violation.
    #[error("handle already exists")]
    DuplicateHandle,

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("seal record: {0}")]
    Seal(String),

    #[error("encode record: {0}")]
    Encode(String),
}

impl StoreError {
    pub(crate) fn io(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { op, source }
    }
}

/// Failures surfaced by the [`Broker`](crate::broker::Broker).
///
/// Unknown, expired and already-consumed handles are not errors; they come
/// back as an absent result. Everything here is an operational fault.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("ttl must be greater than zero and end before year 10000")]
    InvalidTtl,

    #[error("could not allocate a unique handle after {attempts} attempts")]
    HandleExhausted { attempts: u32 },

    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}
