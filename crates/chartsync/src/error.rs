// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for acquisition, orchestration and persistence.

use crate::registry::DataType;

/// All errors the acquisition engine can surface.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    /// Every credential source was exhausted without a valid token.
    #[error("no valid credential found")]
    NoCredential,

    /// A fetch for this data type is already outstanding.
    #[error("request already in progress for {0}")]
    RequestInProgress(DataType),

    /// The subject changed or the store was cleared while the fetch was in
    /// flight; its result was dropped.
    #[error("fetch for {0} superseded by a session change")]
    Superseded(DataType),

    /// A full batch is already running; concurrent batches are rejected.
    #[error("batch fetch already in progress")]
    BatchInProgress,

    /// Non-2xx response after the retry policy gave up.
    #[error("HTTP {status} while fetching {data_type}")]
    HttpError { data_type: DataType, status: u16 },

    /// Body present but not in the shape the data type expects.
    #[error("malformed response for {data_type}: {reason}")]
    MalformedResponse { data_type: DataType, reason: String },

    /// Key not present in the registry.
    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// The call never produced a response.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            HarvestError::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type HarvestResult<T> = Result<T, HarvestError>;
