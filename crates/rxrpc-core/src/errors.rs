//! RPC error codes and error type.
//!
//! An [`RpcError`] is always local to one invocation: it is reported to the
//! client as an error response and never tears down the session.

use crate::message::ErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// Invalid, missing, or undecodable arguments.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Method not found by the dispatcher.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Endpoint or resource not available.
pub const NOT_AVAILABLE: &str = "NOT_AVAILABLE";

/// RPC error type returned by dispatchers and result streams.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Argument missing or not convertible to the requested type.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// No endpoint method with this name.
    #[error("Method '{method}' not found")]
    MethodNotFound {
        /// Requested method.
        method: String,
    },

    /// Internal failure of the endpoint.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// The endpoint could not be resolved.
    #[error("{message}")]
    NotAvailable {
        /// Description.
        message: String,
    },

    /// Endpoint-defined error with an arbitrary code.
    #[error("{message}")]
    Custom {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl RpcError {
    /// Shorthand for an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for an argument error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Shorthand for an endpoint that could not be resolved.
    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable {
            message: message.into(),
        }
    }

    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::NotAvailable { .. } => NOT_AVAILABLE,
            Self::Custom { code, .. } => code,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
        }
    }
}

impl From<ErrorBody> for RpcError {
    fn from(body: ErrorBody) -> Self {
        match body.code.as_str() {
            INVALID_PARAMS => Self::InvalidParams {
                message: body.message,
            },
            INTERNAL_ERROR => Self::Internal {
                message: body.message,
            },
            NOT_AVAILABLE => Self::NotAvailable {
                message: body.message,
            },
            _ => Self::Custom {
                code: body.code,
                message: body.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_per_variant() {
        assert_eq!(RpcError::invalid_params("x").code(), INVALID_PARAMS);
        assert_eq!(RpcError::internal("x").code(), INTERNAL_ERROR);
        assert_eq!(
            RpcError::MethodNotFound {
                method: "m".into()
            }
            .code(),
            METHOD_NOT_FOUND
        );
        assert_eq!(
            RpcError::NotAvailable {
                message: "x".into()
            }
            .code(),
            NOT_AVAILABLE
        );
        assert_eq!(
            RpcError::Custom {
                code: "RATE_LIMITED".into(),
                message: "slow down".into()
            }
            .code(),
            "RATE_LIMITED"
        );
    }

    #[test]
    fn method_not_found_message_names_method() {
        let err = RpcError::MethodNotFound {
            method: "no.such".into(),
        };
        assert_eq!(err.to_string(), "Method 'no.such' not found");
    }

    #[test]
    fn error_body_carries_code_and_message() {
        let body = RpcError::invalid_params("Argument name not found").to_error_body();
        assert_eq!(body.code, "INVALID_PARAMS");
        assert_eq!(body.message, "Argument name not found");
    }

    #[test]
    fn body_converts_back_to_variant() {
        let err = RpcError::from(RpcError::internal("boom").to_error_body());
        assert_eq!(err, RpcError::internal("boom"));

        // Method-not-found has no message field of its own, so it comes back as custom.
        let err = RpcError::from(
            RpcError::MethodNotFound {
                method: "m".into(),
            }
            .to_error_body(),
        );
        assert_eq!(err.code(), METHOD_NOT_FOUND);
        assert_eq!(err.to_string(), "Method 'm' not found");
    }
}
