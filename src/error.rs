//! Error types shared by every source adapter, the meter codec and the main loop.
//!
//! Per-source failures are values of [`EmeterError`]; the scheduler decides which
//! of them degrade a single source and which escape to the cycle boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmeterError>;

#[derive(Debug, Error)]
pub enum EmeterError {
    /// Local inverter session failed (connect, read or exception response)
    #[error("Device error: {message}")]
    Device { message: String },

    /// Remote endpoint could not be reached or answered with an error status
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// Remote endpoint answered, but the body is missing fields or is not numeric
    #[error("Malformed payload: {message}")]
    Payload { message: String },

    #[error("Unknown {quantity} unit: {unit}")]
    Unit { quantity: String, unit: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Encode error: {message}")]
    Encode { message: String },

    #[error("Send error: {message}")]
    Send { message: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl EmeterError {
    pub fn device<S: Into<String>>(message: S) -> Self {
        EmeterError::Device {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        EmeterError::Transport {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        EmeterError::Timeout {
            message: message.into(),
        }
    }

    pub fn payload<S: Into<String>>(message: S) -> Self {
        EmeterError::Payload {
            message: message.into(),
        }
    }

    pub fn unit<Q: Into<String>, U: Into<String>>(quantity: Q, unit: U) -> Self {
        EmeterError::Unit {
            quantity: quantity.into(),
            unit: unit.into(),
        }
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        EmeterError::Decode {
            message: message.into(),
        }
    }

    pub fn encode<S: Into<String>>(message: S) -> Self {
        EmeterError::Encode {
            message: message.into(),
        }
    }

    pub fn send<S: Into<String>>(message: S) -> Self {
        EmeterError::Send {
            message: message.into(),
        }
    }

    pub fn persistence<S: Into<String>>(message: S) -> Self {
        EmeterError::Persistence {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        EmeterError::Config {
            message: message.into(),
        }
    }

    /// Failures of a remote poll that are charged against the source's timeout budget
    pub fn counts_as_poll_failure(&self) -> bool {
        matches!(
            self,
            EmeterError::Transport { .. }
                | EmeterError::Timeout { .. }
                | EmeterError::Payload { .. }
                | EmeterError::Unit { .. }
        )
    }
}

impl From<std::io::Error> for EmeterError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            EmeterError::timeout(err.to_string())
        } else {
            EmeterError::transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EmeterError {
    fn from(err: serde_json::Error) -> Self {
        EmeterError::payload(err.to_string())
    }
}

impl From<serde_yaml::Error> for EmeterError {
    fn from(err: serde_yaml::Error) -> Self {
        EmeterError::config(err.to_string())
    }
}

impl From<reqwest::Error> for EmeterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EmeterError::timeout(err.to_string())
        } else if err.is_decode() {
            EmeterError::payload(err.to_string())
        } else {
            EmeterError::transport(err.to_string())
        }
    }
}

impl From<tokio_modbus::Error> for EmeterError {
    fn from(err: tokio_modbus::Error) -> Self {
        EmeterError::device(err.to_string())
    }
}
