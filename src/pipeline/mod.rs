//! Building blocks the coordinator drives.
//!
//! Each submodule owns one concern, so each can be tested without the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ client(detection) ──▶ client(extraction) ──▶ fanout(preprocessing)
//!                                                            │
//!     aggregate ◀── client(aggregation) ◀── fanout(recognition)
//! ```
//!
//! 1. [`input`]     : validate the upload into a [`input::Document`]
//! 2. [`encode`]    : base64 + per-stage JSON request/response shapes
//! 3. [`client`]    : one stage call with retry, backoff, deadline, cancel;
//!    the only module with network I/O
//! 4. [`fanout`]    : run a stage once per field, concurrently, isolating
//!    failures
//! 5. [`aggregate`] : shape recognised text for the aggregation stage
//! 6. [`run`]       : per-run state machine, budget and warnings

pub mod aggregate;
pub mod client;
pub mod encode;
pub mod fanout;
pub mod input;
pub mod run;
