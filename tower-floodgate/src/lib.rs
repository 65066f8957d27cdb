//! # Tower Floodgate
//!
//! `tower-floodgate` puts a [`Floodgate`] admission gate in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! ## Per-request admission
//!
//! Each request is admitted through the shared gate before the inner
//! service runs, and its completion and latency are reported back when
//! the response resolves, so the gate's sliding-window statistics see the
//! whole call. Admission never blocks the executor: services use the
//! gate's non-waiting probe and nap on the refusal's back-off hint.
//!
//! A [`GateLayer`] guards one named resource. Any number of stacks and
//! clones can share a single [`Floodgate`], drawing down the same
//! thresholds; refusals surface as [`GateError::Blocked`], and an
//! optional deadline covering queueing and execution together surfaces as
//! [`GateError::Timeout`].
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`GateError`], allowing automatic
//!   conversion to HTTP status codes (429 with `Retry-After`, 408).

mod error;
mod layer;
mod service;


#[cfg(doc)]
use floodgate::Floodgate;

pub use error::GateError;
pub use layer::GateLayer;
pub use service::DEFAULT_ENTRY_POINT;
pub use service::GateService;
