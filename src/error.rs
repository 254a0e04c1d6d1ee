// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Error taxonomy shared by every layer of the crate
#[derive(Error, Debug)]
pub enum VaultError {
    /// Malformed CID, address, size, duration or wire payload
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Deal, provider or content CID is absent
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// RPC or gateway failure; callers may retry or skip
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Proof, signature or block hash mismatch
    #[error("Verification failed: {details}")]
    Verification { details: String },

    /// Every candidate source or provider failed
    #[error("All providers exhausted: {}", attempts.join("; "))]
    ExhaustedProviders { attempts: Vec<String> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a verification error
    pub fn verification(details: impl Into<String>) -> Self {
        Self::Verification {
            details: details.into(),
        }
    }

    /// Create an exhausted-providers error from the list of failed attempts
    pub fn exhausted(attempts: Vec<String>) -> Self {
        Self::ExhaustedProviders { attempts }
    }

    /// Only network failures are absorbed by fallback loops
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        let message = match err.status() {
            Some(status) => format!("HTTP {status}: {err}"),
            None => err.to_string(),
        };
        Self::network_with_source(message, err.into())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(format!("JSON: {err}"))
    }
}

impl From<cid::Error> for VaultError {
    fn from(err: cid::Error) -> Self {
        Self::validation(format!("invalid CID: {err}"))
    }
}

/// Result type alias using VaultError
pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(VaultError::network("timeout").is_retryable());
        assert!(!VaultError::validation("bad cid").is_retryable());
        assert!(!VaultError::verification("root mismatch").is_retryable());
        assert!(!VaultError::exhausted(vec![]).is_retryable());
    }

    #[test]
    fn exhausted_lists_attempts() {
        let err = VaultError::exhausted(vec!["gateway: 504".into(), "pinning: 404".into()]);
        assert_eq!(
            err.to_string(),
            "All providers exhausted: gateway: 504; pinning: 404"
        );
    }
}
