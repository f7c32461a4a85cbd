//! Procedure registry for dispatching calls by name.
//!
//! # Example
//!
//! ```
//! use callwire::handler::ProcedureRegistry;
//! use callwire::ProtocolError;
//! use futures_util::stream;
//! use serde_json::{json, Value};
//!
//! let mut registry = ProcedureRegistry::new();
//!
//! registry.typed("users/get", |id: u32, _ctx| async move {
//!     Ok::<_, ProtocolError>(json!({ "id": id }))
//! });
//!
//! registry.stream("count", |_payload, _ctx| {
//!     stream::iter((0..3).map(|i| Ok::<Value, ProtocolError>(json!(i))))
//! });
//!
//! assert!(registry.contains("users/get"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CallContext, CallOutcome, CallRequest};
use crate::error::{ErrorCode, ProtocolError};
use crate::value::{IncomingValue, OutgoingValue};

/// Result of a dispatched call.
pub type DispatchResult = Result<CallOutcome, ProtocolError>;

/// Executes calls on behalf of a gateway.
pub trait Dispatcher: Send + Sync + 'static {
    /// Run one call. The returned future is dropped if the call is aborted.
    fn call(&self, request: CallRequest) -> BoxFuture<'static, DispatchResult>;
}

/// One registered procedure.
pub trait Procedure: Send + Sync + 'static {
    fn call(&self, payload: IncomingValue, ctx: CallContext) -> BoxFuture<'static, DispatchResult>;
}

struct PlainProcedure<F>(F);

impl<F, Fut> Procedure for PlainProcedure<F>
where
    F: Fn(IncomingValue, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OutgoingValue, ProtocolError>> + Send + 'static,
{
    fn call(&self, payload: IncomingValue, ctx: CallContext) -> BoxFuture<'static, DispatchResult> {
        (self.0)(payload, ctx).map(|r| r.map(CallOutcome::Plain)).boxed()
    }
}

/// Wrapper that deserializes the payload and serializes the result.
pub struct TypedProcedure<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedProcedure<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Procedure for TypedProcedure<F, T, R, Fut>
where
    F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
{
    fn call(&self, payload: IncomingValue, ctx: CallContext) -> BoxFuture<'static, DispatchResult> {
        let parsed: T = match payload.deserialize() {
            Ok(v) => v,
            Err(e) => {
                let error = ProtocolError::new(ErrorCode::ValidationError, e.to_string());
                return async move { Err(error) }.boxed();
            }
        };

        let fut = (self.handler)(parsed, ctx);
        async move {
            fut.await.and_then(|result| {
                serde_json::to_value(&result)
                    .map(|value| CallOutcome::Plain(value.into()))
                    .map_err(|e| ProtocolError::new(ErrorCode::InternalServerError, e.to_string()))
            })
        }
        .boxed()
    }
}

struct StreamProcedure<F>(F);

impl<F, S> Procedure for StreamProcedure<F>
where
    F: Fn(IncomingValue, CallContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<serde_json::Value, ProtocolError>> + Send + 'static,
{
    fn call(&self, payload: IncomingValue, ctx: CallContext) -> BoxFuture<'static, DispatchResult> {
        let stream = (self.0)(payload, ctx).boxed();
        async move { Ok(CallOutcome::Stream(stream)) }.boxed()
    }
}

/// Registry mapping procedure names to handlers.
#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<String, Box<dyn Procedure>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a procedure working on raw payload trees.
    ///
    /// Use this when the payload or the result carries blobs.
    pub fn procedure<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(IncomingValue, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OutgoingValue, ProtocolError>> + Send + 'static,
    {
        self.register(name, PlainProcedure(handler))
    }

    /// Register a procedure with a deserialized payload and serialized result.
    pub fn typed<F, T, R, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(T, CallContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, ProtocolError>> + Send + 'static,
    {
        self.register(name, TypedProcedure::new(handler))
    }

    /// Register a procedure producing a streaming result.
    pub fn stream<F, S>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(IncomingValue, CallContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<serde_json::Value, ProtocolError>> + Send + 'static,
    {
        self.register(name, StreamProcedure(handler))
    }

    /// Register any [`Procedure`] implementation, replacing a previous one.
    pub fn register(&mut self, name: &str, procedure: impl Procedure) -> &mut Self {
        if self
            .procedures
            .insert(name.to_string(), Box::new(procedure))
            .is_some()
        {
            tracing::debug!(procedure = name, "procedure replaced");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl Dispatcher for ProcedureRegistry {
    fn call(&self, request: CallRequest) -> BoxFuture<'static, DispatchResult> {
        let CallRequest {
            procedure,
            payload,
            context,
        } = request;

        match self.procedures.get(&procedure) {
            Some(handler) => handler.call(payload, context),
            None => {
                tracing::debug!(procedure = %procedure, "unknown procedure");
                let error = ProtocolError::new(
                    ErrorCode::NotFound,
                    format!("Procedure not found: {procedure}"),
                );
                async move { Err(error) }.boxed()
            }
        }
    }
}
