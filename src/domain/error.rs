// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Connection failed to endpoint: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Unique/primary key or foreign key violation raised by the store.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Deadlock, lock wait timeout or an explicit retry request.
    #[error("Retryable failure: {0}")]
    Retryable(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Payload decode failed: {0}")]
    Decode(String),

    #[error("Device error on {origin}: {message}")]
    Device { origin: String, message: String },

    #[error("Worker {origin} stopped: {reason}")]
    StopWorker { origin: String, reason: String },

    #[error("Validation failed for field {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl AppError {
    pub fn stop_worker(origin: &str, reason: impl Into<String>) -> Self {
        AppError::StopWorker {
            origin: origin.to_string(),
            reason: reason.into(),
        }
    }

    pub fn device(origin: &str, message: impl Into<String>) -> Self {
        AppError::Device {
            origin: origin.to_string(),
            message: message.into(),
        }
    }

    /// Errors the processor pool puts back on the queue instead of dropping.
    pub fn is_requeueable(&self) -> bool {
        matches!(self, AppError::Integrity(_) | AppError::Retryable(_))
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_)
            | AppError::Initialization(_)
            | AppError::Validation { .. }
            | AppError::Fatal(_) => 1,
            _ => 2,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Decode(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Cache(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() || db.is_foreign_key_violation() {
                    return AppError::Integrity(db.message().to_string());
                }
                let msg = db.message().to_ascii_lowercase();
                if msg.contains("database is locked")
                    || msg.contains("busy")
                    || msg.contains("deadlock")
                    || msg.contains("lock wait timeout")
                {
                    return AppError::Retryable(db.message().to_string());
                }
                AppError::Database(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut => AppError::Retryable("connection pool timed out".into()),
            _ => AppError::Database(err.to_string()),
        }
    }
}
