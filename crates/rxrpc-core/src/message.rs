//! Wire envelope types.
//!
//! On the wire an [`Invocation`] carries three mutually exclusive flags
//! (`isSubscription`, `isUnsubscription`, `isKeepAlive`). In Rust the kind is
//! a proper enum; the flag form only exists in the private wire structs, and
//! any message that does not set exactly one flag is rejected at decode time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier correlating responses to the invocation that produced them.
pub type InvocationId = i64;

/// A single client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "InvocationWire", into = "InvocationWire")]
pub struct Invocation {
    /// Per-session invocation identifier.
    pub invocation_id: InvocationId,
    /// What the client is asking for.
    pub kind: InvocationKind,
}

/// Discriminates the three invocation kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum InvocationKind {
    /// Start a streaming call.
    Subscribe {
        /// Endpoint method name.
        method: String,
        /// Encoded arguments keyed by parameter name.
        arguments: BTreeMap<String, Value>,
    },
    /// Cancel a running call.
    Unsubscribe,
    /// Keep the channel from looking idle.
    KeepAlive,
}

impl Invocation {
    /// Build a subscribe invocation.
    pub fn subscribe(
        invocation_id: InvocationId,
        method: impl Into<String>,
        arguments: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            invocation_id,
            kind: InvocationKind::Subscribe {
                method: method.into(),
                arguments,
            },
        }
    }

    /// Build an unsubscribe invocation.
    pub fn unsubscribe(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            kind: InvocationKind::Unsubscribe,
        }
    }

    /// Build a keep-alive invocation.
    pub fn keep_alive(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            kind: InvocationKind::KeepAlive,
        }
    }

    /// Short label for logging.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            InvocationKind::Subscribe { .. } => "subscribe",
            InvocationKind::Unsubscribe => "unsubscribe",
            InvocationKind::KeepAlive => "keepAlive",
        }
    }
}

/// Rejected invocation envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// Zero or several of the kind flags were set.
    #[error("invocation {invocation_id} must set exactly one kind flag, found {count}")]
    AmbiguousKind {
        /// Offending invocation.
        invocation_id: InvocationId,
        /// Number of flags set.
        count: usize,
    },
    /// A subscription arrived without a method name.
    #[error("subscription {0} has no method")]
    MissingMethod(InvocationId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvocationWire {
    invocation_id: InvocationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    is_subscription: bool,
    #[serde(default)]
    is_unsubscription: bool,
    #[serde(default)]
    is_keep_alive: bool,
}

impl TryFrom<InvocationWire> for Invocation {
    type Error = EnvelopeError;

    fn try_from(wire: InvocationWire) -> Result<Self, Self::Error> {
        let flags = [wire.is_subscription, wire.is_unsubscription, wire.is_keep_alive];
        let count = flags.iter().filter(|set| **set).count();
        if count != 1 {
            return Err(EnvelopeError::AmbiguousKind {
                invocation_id: wire.invocation_id,
                count,
            });
        }

        let kind = if wire.is_subscription {
            let method = wire
                .method
                .ok_or(EnvelopeError::MissingMethod(wire.invocation_id))?;
            InvocationKind::Subscribe {
                method,
                arguments: wire.arguments.unwrap_or_default(),
            }
        } else if wire.is_unsubscription {
            InvocationKind::Unsubscribe
        } else {
            InvocationKind::KeepAlive
        };

        Ok(Self {
            invocation_id: wire.invocation_id,
            kind,
        })
    }
}

impl From<Invocation> for InvocationWire {
    fn from(invocation: Invocation) -> Self {
        let mut wire = Self {
            invocation_id: invocation.invocation_id,
            method: None,
            arguments: None,
            is_subscription: false,
            is_unsubscription: false,
            is_keep_alive: false,
        };
        match invocation.kind {
            InvocationKind::Subscribe { method, arguments } => {
                wire.method = Some(method);
                wire.arguments = Some(arguments);
                wire.is_subscription = true;
            }
            InvocationKind::Unsubscribe => wire.is_unsubscription = true,
            InvocationKind::KeepAlive => wire.is_keep_alive = true,
        }
        wire
    }
}

/// Structured error carried by an error response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g. `METHOD_NOT_FOUND`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// A single server-to-client message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResponseWire", into = "ResponseWire")]
pub struct Response {
    /// Invocation this response belongs to.
    pub invocation_id: InvocationId,
    /// Payload.
    pub kind: ResponseKind,
}

/// Data, error, or completion.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseKind {
    /// One produced value.
    Data(Value),
    /// The call failed. Terminal.
    Error(ErrorBody),
    /// The call finished. Terminal.
    Complete,
}

impl Response {
    /// Build a data response.
    pub fn data(invocation_id: InvocationId, value: Value) -> Self {
        Self {
            invocation_id,
            kind: ResponseKind::Data(value),
        }
    }

    /// Build an error response.
    pub fn error(invocation_id: InvocationId, error: ErrorBody) -> Self {
        Self {
            invocation_id,
            kind: ResponseKind::Error(error),
        }
    }

    /// Build a completion response.
    pub fn complete(invocation_id: InvocationId) -> Self {
        Self {
            invocation_id,
            kind: ResponseKind::Complete,
        }
    }

    /// Whether this response ends its invocation.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, ResponseKind::Data(_))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireResponseKind {
    Data,
    Error,
    Complete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseWire {
    invocation_id: InvocationId,
    kind: WireResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

/// Rejected response envelope.
#[derive(Debug, thiserror::Error)]
#[error("error response {0} has no error body")]
pub struct MissingErrorBody(InvocationId);

impl TryFrom<ResponseWire> for Response {
    type Error = MissingErrorBody;

    fn try_from(wire: ResponseWire) -> Result<Self, Self::Error> {
        let kind = match wire.kind {
            // A data response whose value is JSON null omits the payload.
            WireResponseKind::Data => ResponseKind::Data(wire.payload.unwrap_or(Value::Null)),
            WireResponseKind::Error => ResponseKind::Error(
                wire.error.ok_or(MissingErrorBody(wire.invocation_id))?,
            ),
            WireResponseKind::Complete => ResponseKind::Complete,
        };
        Ok(Self {
            invocation_id: wire.invocation_id,
            kind,
        })
    }
}

impl From<Response> for ResponseWire {
    fn from(response: Response) -> Self {
        let (kind, payload, error) = match response.kind {
            ResponseKind::Data(value) => (WireResponseKind::Data, Some(value), None),
            ResponseKind::Error(body) => (WireResponseKind::Error, None, Some(body)),
            ResponseKind::Complete => (WireResponseKind::Complete, None, None),
        };
        Self {
            invocation_id: response.invocation_id,
            kind,
            payload,
            error,
        }
    }
}
