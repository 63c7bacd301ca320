// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Robust RabbitMQ Client
//!
//! This module provides the error taxonomy shared by the connection, channel and
//! topology layers. The `AmqpError` enum separates failures of the underlying
//! transport, which the reconnect machinery handles on its own, from broker
//! rejections, replay failures, configuration mistakes and use-after-close.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

/// Reply code used by the broker when a resource does not exist.
pub const REPLY_NOT_FOUND: u16 = 404;
/// Reply code used by the broker when an exclusive resource is held elsewhere.
pub const REPLY_RESOURCE_LOCKED: u16 = 405;
/// Reply code used by the broker when a re-declaration does not match.
pub const REPLY_PRECONDITION_FAILED: u16 = 406;

/// Represents errors that can occur during robust AMQP/RabbitMQ operations.
///
/// Errors are cheap to clone because a single replay failure is recorded on the
/// affected handle, broadcast to observers and logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid connection parameters, detected before any connection attempt
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing the first connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The underlying transport connection or channel is gone
    #[error("transport failure: {0}")]
    TransportError(String),

    /// The broker rejected an operation and closed the transport channel
    #[error("broker rejected the operation with code {code}: {reason}")]
    BrokerError { code: u16, reason: String },

    /// A topology entry could not be replayed after a reconnect
    #[error("failure to recover {entity}: {reason}")]
    RecoveryError { entity: String, reason: String },

    /// The operation was attempted while the channel is being recovered
    #[error("currently reconnecting")]
    ReconnectingError,

    /// The connection or channel was explicitly closed
    #[error("connection closed")]
    ClosedError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error reported by a consumer handler
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the error means the transport connection or channel died.
    pub fn is_transport(&self) -> bool {
        matches!(self, AmqpError::TransportError(_))
    }

    /// Whether the error is a topology replay failure.
    pub fn is_recovery(&self) -> bool {
        matches!(self, AmqpError::RecoveryError { .. })
    }

    /// The AMQP reply code carried by the error, if any.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            AmqpError::BrokerError { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn recovery(entity: impl Into<String>, cause: &AmqpError) -> AmqpError {
        AmqpError::RecoveryError {
            entity: entity.into(),
            reason: cause.to_string(),
        }
    }
}

impl From<lapin::Error> for AmqpError {
    /// Classifies lapin errors: soft protocol errors only close the channel and
    /// are reported as broker rejections, everything else means the transport
    /// is unusable.
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(_) => AmqpError::BrokerError {
                    code: amqp.get_id(),
                    reason: amqp.get_message().to_string(),
                },
                AMQPErrorKind::Hard(_) => AmqpError::TransportError(err.to_string()),
            },
            _ => AmqpError::TransportError(err.to_string()),
        }
    }
}

impl From<AMQPSoftError> for AmqpError {
    fn from(err: AMQPSoftError) -> Self {
        AmqpError::BrokerError {
            code: err.get_id(),
            reason: format!("{:?}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_transport_errors() {
        assert!(AmqpError::TransportError("io".to_owned()).is_transport());
        assert!(!AmqpError::ClosedError.is_transport());
        assert!(!AmqpError::BrokerError {
            code: REPLY_NOT_FOUND,
            reason: "NOT_FOUND".to_owned()
        }
        .is_transport());
    }

    #[test]
    fn should_wrap_cause_into_recovery_error() {
        let cause = AmqpError::BrokerError {
            code: REPLY_NOT_FOUND,
            reason: "no queue 'Q'".to_owned(),
        };

        let err = AmqpError::recovery("queue `Q`", &cause);

        assert!(err.is_recovery());
        assert_eq!(
            err.to_string(),
            "failure to recover queue `Q`: broker rejected the operation with code 404: no queue 'Q'"
        );
    }

    #[test]
    fn should_expose_reply_code() {
        let err: AmqpError = AMQPSoftError::NOTFOUND.into();
        assert_eq!(err.reply_code(), Some(REPLY_NOT_FOUND));
        assert_eq!(AmqpError::ReconnectingError.reply_code(), None);
    }
}
