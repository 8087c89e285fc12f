// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the rangelab agent.
//!
//! Batch operations collect per-item failures into a [`MultiError`] instead
//! of aborting on the first one; stepwise failures inside a lab create
//! short-circuit with compensation and surface the primary failure.

use thiserror::Error;

use crate::ipam::IpamError;
use crate::worker::WorkerError;

/// Agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Catalog database operation failed.
    #[error("Catalog error: {0}")]
    Catalog(#[from] sqlx::Error),

    /// IPAM operation failed.
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Orchestrator API call failed.
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] kube::Error),

    /// Orchestrator client configuration failed.
    #[error("Orchestrator config error: {0}")]
    OrchestratorConfig(String),

    /// Manifest serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Worker pool rejected or dropped a task.
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// A lab orchestration step failed.
    #[error("lab {lab_id}: {message}")]
    Lab {
        /// The lab the failure belongs to.
        lab_id: String,
        /// Step description.
        message: String,
        /// Underlying failure.
        #[source]
        source: Option<Box<Error>>,
    },

    /// A challenge operation failed.
    #[error("lab {lab_id} challenge {challenge_id}: {message}")]
    LabChallenge {
        /// The lab the failure belongs to.
        lab_id: String,
        /// The challenge the failure belongs to.
        challenge_id: String,
        /// The instance the failure belongs to, when known.
        instance_id: Option<String>,
        /// Step description.
        message: String,
        /// Underlying failure.
        #[source]
        source: Option<Box<Error>>,
    },

    /// A DNS zone operation failed.
    #[error("lab {lab_id} dns: {message}")]
    LabDns {
        /// The lab the failure belongs to.
        lab_id: String,
        /// Step description.
        message: String,
        /// Underlying failure.
        #[source]
        source: Option<Box<Error>>,
    },

    /// A top-level fan-out failed.
    #[error("{message}")]
    Platform {
        /// Batch description.
        message: String,
        /// Underlying failure.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Request validation failed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller authentication failed.
    #[error("Unauthenticated: {0}")]
    Auth(String),

    /// Wire-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Aggregate of per-item failures in a batch.
    #[error("{0}")]
    Multi(MultiError),
}

impl Error {
    /// Lab-scoped error with an underlying cause.
    pub fn lab(lab_id: impl Into<String>, message: impl Into<String>, source: Error) -> Self {
        Self::Lab {
            lab_id: lab_id.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Challenge-scoped error with an underlying cause.
    pub fn challenge(
        lab_id: impl Into<String>,
        challenge_id: impl Into<String>,
        instance_id: Option<String>,
        message: impl Into<String>,
        source: Option<Error>,
    ) -> Self {
        Self::LabChallenge {
            lab_id: lab_id.into(),
            challenge_id: challenge_id.into(),
            instance_id,
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    /// DNS-scoped error with an underlying cause.
    pub fn dns(lab_id: impl Into<String>, message: impl Into<String>, source: Option<Error>) -> Self {
        Self::LabDns {
            lab_id: lab_id.into(),
            message: message.into(),
            source: source.map(Box::new),
        }
    }

    /// Platform-scoped error wrapping a batch failure.
    pub fn platform(message: impl Into<String>, source: Error) -> Self {
        Self::Platform {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True if the error (or any aggregated error) is an auth failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// True if the error is a request validation failure.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

/// Collects per-item failures from a fan-out into one error.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a failure.
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// Append the failure of a result, keeping the success value.
    pub fn record<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.errors.push(e);
                None
            }
        }
    }

    /// Number of collected failures.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True when nothing failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collected failures.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when empty, otherwise the aggregate error.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else if self.errors.len() == 1 {
            Err(self.errors.into_iter().next().unwrap())
        } else {
            Err(Error::Multi(self))
        }
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors occurred: ", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{}]", e)?;
        }
        Ok(())
    }
}

/// Result type using the agent Error.
pub type Result<T> = std::result::Result<T, Error>;
