use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_TRANSPORT: &str = "ERR_TRANSPORT";
pub const ERR_DEPENDENCY: &str = "ERR_DEPENDENCY";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    /// Device absent, unauthorized, on the wrong transport, or ambiguously attached.
    /// Always recoverable by the operator.
    pub fn transport(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TRANSPORT, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_DEPENDENCY, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn is_transport(&self) -> bool {
        self.code == ERR_TRANSPORT
    }

    /// Re-tags an error produced by a lower layer with the caller's trace id.
    pub fn with_trace(mut self, trace_id: &str) -> Self {
        if self.trace_id.is_empty() {
            self.trace_id = trace_id.to_string();
        }
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
