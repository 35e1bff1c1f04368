// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-facing error type. Wraps `agentbridge_core::CoreError` plus the two
//! transport-only codes that never originate inside the domain engine.

use agentbridge_core::CoreError;
use serde::Serialize;

#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    Validation(String),
    ResourceLimit(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Core(e) => e.code().as_str(),
            ApiError::Validation(_) => "VALIDATION_FAILED",
            ApiError::ResourceLimit(_) => "RESOURCE_LIMIT",
        }
    }

    /// Sanitized for the wire: home-directory paths are tilde-prefixed and
    /// anything resembling a credential assignment is redacted, even though
    /// `CoreError`'s own message construction already does this at the
    /// source — this is the last point before a message reaches a client.
    pub fn message(&self) -> String {
        let raw = match self {
            ApiError::Core(e) => e.to_string(),
            ApiError::Validation(m) => m.clone(),
            ApiError::ResourceLimit(m) => m.clone(),
        };
        agentbridge_core::redact::sanitize(&raw)
    }

    pub fn to_error_body(&self, project_id: Option<&str>) -> ErrorFrame {
        ErrorFrame {
            r#type: "error",
            project_id: project_id.map(str::to_string),
            data: ErrorBody { code: self.code().to_string(), message: self.message(), details: None },
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    pub r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub data: ErrorBody,
}
