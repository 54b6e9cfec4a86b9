//! The CRI gRPC surface: translates `RuntimeService`/`ImageService` calls
//! into [`Engine`](crate::engine::Engine) and
//! [`StreamingManager`](crate::streaming::StreamingManager) operations.
//!
//! Business logic does not belong in this module. Its job is to decode a
//! request, call the engine, and encode the response — matching the
//! division of labor the lifecycle engine and its adapters already assume.
//! `tonic`/`hyper` carry the HTTP/2 framing, the 5-byte gRPC message
//! prefix, and trailer-based status described in §4.9 of the
//! specification; nothing in this module hand-rolls that wire format.

pub(crate) mod image;
pub(crate) mod runtime;

use std::str::FromStr;
use std::sync::Arc;

use tonic::{Response, Status};

use crate::engine::Engine;
use crate::error::{IntoStatus, RuntimeError};
use crate::streaming::StreamingManager;

pub(crate) type TonicResult<T> = Result<Response<T>, Status>;

/// Shared state behind both `RuntimeService` and `ImageService`: one
/// [`Engine`] (the sole writer to the state store) and one
/// [`StreamingManager`] (the sole owner of the session table).
pub(crate) struct CriService {
    pub(crate) engine: Arc<Engine>,
    pub(crate) streaming: Arc<StreamingManager>,
}

impl CriService {
    pub fn new(engine: Arc<Engine>, streaming: Arc<StreamingManager>) -> Self {
        CriService { engine, streaming }
    }
}

/// Logs the cause, then converts to the `grpc-status`/`grpc-message` pair
/// the client sees. Detailed causes stay in the logs; `grpc-message` keeps
/// only the short kind/message pair, per §7.
pub(crate) fn into_status(error: RuntimeError) -> Status {
    tracing::error!(kind = ?error.kind, "{}", error.message);
    error.into_status()
}

pub(crate) fn parse_id<T: FromStr>(id: &str, what: &str) -> Result<T, Status> {
    id.parse()
        .map_err(|_| Status::invalid_argument(format!("malformed {what} id {id:?}")))
}

pub(crate) fn now_ns() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Converts a stored-seconds timestamp to the nanoseconds the CRI wire
/// expects, per §4.9. `0` (unset) is passed through unchanged.
pub(crate) fn seconds_to_wire_nanos(seconds: i64) -> i64 {
    if seconds == 0 {
        0
    } else {
        seconds.saturating_mul(1_000_000_000)
    }
}
