//! Error types for Entangle

use thiserror::Error;

use crate::{ChannelId, ResourceId};

/// Core Entangle errors
///
/// None of these are fatal to a running engine. Hot paths convert them to
/// `bool`/`Option`/default results; background loops log and move on.
#[derive(Error, Debug)]
pub enum EntangleError {
    // Descriptor errors
    #[error("Resource carries no usable descriptor")]
    NotEligible,

    // Lookup errors
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),

    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    // I/O errors
    #[error("Transient I/O failure for {resource}: {source}")]
    TransientIo {
        resource: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Enumeration failed under {root}: {reason}")]
    Enumeration { root: String, reason: String },

    // Callback errors
    #[error("Callback panicked: {0}")]
    CallbackPanicked(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EntangleError {
    pub fn transient_io(resource: impl Into<String>, source: std::io::Error) -> Self {
        EntangleError::TransientIo {
            resource: resource.into(),
            source,
        }
    }

    /// Recoverable on the next poll cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EntangleError::TransientIo { .. } | EntangleError::Enumeration { .. }
        )
    }
}

/// Result type for Entangle operations
pub type EntangleResult<T> = Result<T, EntangleError>;

/// Render a `catch_unwind` payload for logging
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
