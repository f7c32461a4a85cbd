//! Handler module - call dispatch.
//!
//! Provides:
//! - [`Dispatcher`] - what a gateway calls to execute a procedure
//! - [`ProcedureRegistry`] - maps procedure names to handlers
//! - [`CallContext`] - identity and cancellation of the executing call
//!
//! A gateway can run any [`Dispatcher`]; [`ProcedureRegistry`] is the
//! in-process router most applications use.

mod context;
mod registry;

pub use context::{CallContext, CallOutcome, CallRequest, ResultStream};
pub use registry::{DispatchResult, Dispatcher, Procedure, ProcedureRegistry, TypedProcedure};
