//! Host→embedded future calls.
//!
//! A call is prepared on the caller's thread (descriptor lookup, argument
//! validation and packing) and then posted to the confinement thread, where
//! [`FutureDispatcher::dispatch`] evaluates the readiness guard and sends it.
//! Guard and send happen in the same confinement-thread turn, so a call can
//! never slip between a readiness check and a concurrent teardown.

use std::collections::HashMap;
use std::sync::Arc;

use chimera_types::{Arguments, MethodCall, MethodDescriptor, MethodResponse, Value};
use tokio::sync::oneshot;

use crate::channel::CommandChannel;
use crate::error::{BridgeError, TransportError};

/// Where the caller is waiting for the outcome
pub(crate) type Reply = oneshot::Sender<Result<serde_json::Value, BridgeError>>;

#[derive(Clone)]
pub(crate) struct FutureDispatcher {
    /// Channel name, used as the log prefix
    name: Arc<str>,
    methods: Arc<HashMap<String, MethodDescriptor>>,
}

impl FutureDispatcher {
    pub fn new<I>(name: impl Into<Arc<str>>, methods: I) -> Self
    where
        I: IntoIterator<Item = MethodDescriptor>,
    {
        Self {
            name: name.into(),
            methods: Arc::new(methods.into_iter().map(|m| (m.name.clone(), m)).collect()),
        }
    }

    pub fn descriptor(&self, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method)
    }

    /// Build the outbound call from positional host arguments.
    ///
    /// Arguments are converted to wire values and keyed by parameter name.
    pub fn prepare(&self, method: &str, args: Vec<serde_json::Value>) -> Result<MethodCall, BridgeError> {
        let descriptor = self
            .descriptor(method)
            .ok_or_else(|| BridgeError::UnknownMethod(method.to_string()))?;

        if args.len() != descriptor.parameters.len() {
            return Err(BridgeError::InvalidArguments {
                method: method.to_string(),
                reason: format!(
                    "expected {} argument(s), got {}",
                    descriptor.parameters.len(),
                    args.len()
                ),
            });
        }

        let mut packed = Arguments::new();
        for (param, arg) in descriptor.parameters.iter().zip(args) {
            let value = Value::from_host(arg);
            if !param.accepts(&value) {
                return Err(BridgeError::InvalidArguments {
                    method: method.to_string(),
                    reason: format!("{} expects {}, got {}", param.name, param.ty, value.kind()),
                });
            }
            packed.insert(param.name.clone(), value);
        }

        Ok(MethodCall::with_arguments(method, packed))
    }

    /// Send a prepared call, or reject it if the channel is not usable.
    ///
    /// Runs on the confinement thread.
    pub fn dispatch(&self, channel: Option<&mut CommandChannel>, call: MethodCall, reply: Reply) {
        let channel = match channel {
            Some(channel) if !channel.is_closed() => channel,
            _ => {
                tracing::debug!(
                    "[bridge:{}] Rejecting {} before engine is ready",
                    self.name,
                    call.method_name
                );
                let _ = reply.send(Err(BridgeError::Initialization));
                return;
            }
        };

        let method = call.method_name.clone();
        channel.send(
            call,
            Box::new(move |outcome: Result<MethodResponse, TransportError>| {
                let _ = reply.send(settle(&method, outcome));
            }),
        );
    }
}

/// Map a channel outcome onto what the caller sees
pub(crate) fn settle(
    method: &str,
    outcome: Result<MethodResponse, TransportError>,
) -> Result<serde_json::Value, BridgeError> {
    match outcome {
        Ok(MethodResponse::Success { value }) => Ok(value.into_host()),
        Ok(MethodResponse::Error {
            error_code,
            error_message,
            error_details,
        }) => Err(BridgeError::Remote {
            code: error_code,
            message: error_message,
            details: error_details.map(Value::into_host),
        }),
        Ok(MethodResponse::NotImplemented) => Err(BridgeError::NotImplemented(method.to_string())),
        Err(e) => Err(e.into()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
