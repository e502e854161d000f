//! Error types for the node coordinator
//!
//! Only lifecycle failures reach this type. Everything else is isolated to
//! the request, circuit or announcement that caused it and is logged where
//! it happens.
//!
//! - **Fatal**: the node cannot serve its purpose (no listener could be
//!   bound, configuration is unusable)
//! - **Lifecycle**: the call does not fit the node's current state

use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Startup Errors ============
    /// No configured listener could be bound
    #[error("Failed to bind listeners: {0}")]
    Bind(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ Lifecycle Errors ============
    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if the node cannot continue after this error
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, NodeError::Bind(_) | NodeError::InvalidConfig(_))
    }

    /// Create a bind error with static context (zero allocation)
    #[must_use]
    pub const fn bind(context: &'static str) -> Self {
        NodeError::Bind(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
