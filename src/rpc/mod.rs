//! Call bookkeeping for both sides of a connection.
//!
//! - [`PendingCalls`]: client calls awaiting a response
//! - [`CallRegistry`]: server calls currently executing
//! - [`PullCoordinator`]: pull credits gating streaming results

mod client;
mod pull;
mod server;

pub use client::{PendingCalls, Responder};
pub use pull::{CallKey, PullCoordinator, PullOutcome};
pub use server::CallRegistry;
