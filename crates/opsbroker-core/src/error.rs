// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of error codes the broker ever puts on the wire (spec §6/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidMessageType,
    Unauthorized,
    AuthTimeout,
    InitFailed,
    SubscriptionFailed,
    UnsubscriptionFailed,
    Forbidden,
    RoutingFailed,
    CapacityExceeded,
    InternalError,
}

impl ErrorCode {
    /// WebSocket close code associated with errors that terminate the session.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(4003),
            Self::AuthTimeout => Some(4003),
            Self::CapacityExceeded => None,
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::AuthTimeout => "AUTH_TIMEOUT",
            Self::InitFailed => "INIT_FAILED",
            Self::SubscriptionFailed => "SUBSCRIPTION_FAILED",
            Self::UnsubscriptionFailed => "UNSUBSCRIPTION_FAILED",
            Self::Forbidden => "FORBIDDEN",
            Self::RoutingFailed => "ROUTING_FAILED",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error body matching the wire `ERROR.payload` shape (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Broker-internal error. Every fallible core operation returns this.
#[derive(Debug, Clone)]
pub struct BrokerError {
    pub code: ErrorCode,
    pub message: String,
}

impl BrokerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody { code: self.code.as_str().to_owned(), message: self.message.clone(), details: None }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BrokerError {}

pub type Result<T> = std::result::Result<T, BrokerError>;
