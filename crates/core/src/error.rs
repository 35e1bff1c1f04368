// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the project/execution engine.

use serde::Serialize;

/// Machine-readable error codes shared between the engine and the wire
/// protocol. Every variant maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPath,
    ProjectNesting,
    ProjectNotFound,
    ProcessActive,
    ExecutionTimeout,
    ClaudeNotFound,
    JsonParsing,
    FileOperation,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::ProjectNesting => "PROJECT_NESTING",
            ErrorCode::ProjectNotFound => "PROJECT_NOT_FOUND",
            ErrorCode::ProcessActive => "PROCESS_ACTIVE",
            ErrorCode::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorCode::ClaudeNotFound => "CLAUDE_NOT_FOUND",
            ErrorCode::JsonParsing => "JSON_PARSING",
            ErrorCode::FileOperation => "FILE_OPERATION",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Domain-level errors raised by the registry, metadata store, message log,
/// and execution manager. Transport-only codes (`VALIDATION_FAILED`,
/// `RESOURCE_LIMIT`) live in the server crate's `ApiError`, since they never
/// originate inside this crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid project path: {0}")]
    InvalidPath(String),

    #[error("project path overlaps an existing project: {0}")]
    ProjectNesting(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project is currently executing")]
    ProcessActive,

    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(std::time::Duration),

    #[error("agent binary not found or not executable: {0}")]
    ClaudeNotFound(String),

    #[error("failed to parse agent output line: {0}")]
    JsonParsing(String),

    #[error("file operation failed: {0}")]
    FileOperation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::InvalidPath(_) => ErrorCode::InvalidPath,
            CoreError::ProjectNesting(_) => ErrorCode::ProjectNesting,
            CoreError::ProjectNotFound(_) => ErrorCode::ProjectNotFound,
            CoreError::ProcessActive => ErrorCode::ProcessActive,
            CoreError::ExecutionTimeout(_) => ErrorCode::ExecutionTimeout,
            CoreError::ClaudeNotFound(_) => ErrorCode::ClaudeNotFound,
            CoreError::JsonParsing(_) => ErrorCode::JsonParsing,
            CoreError::FileOperation(_) => ErrorCode::FileOperation,
            CoreError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::FileOperation(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
