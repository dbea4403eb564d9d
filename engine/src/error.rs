//! Typed error surfaces for the engine. Panics are reserved for programmer
//! errors that can only happen if the core itself is broken; anything that
//! can be triggered by a malformed pedalboard or a misbehaving plugin comes
//! back as one of these.

use thiserror::Error;

/// Failure compiling a declarative [`crate::pedalboard::Pedalboard`] into a
/// runnable [`crate::runtime::PedalboardRuntime`].
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("plugin {uri} ({name}) failed to load: {reason}")]
    PluginLoadFailed {
        uri: String,
        name: String,
        reason: String,
    },

    #[error("graph invariant violated: {0}")]
    GraphInvariantViolated(String),

    #[error(
        "plugin {uri} declares block-length constraints [{min}, {max}] (power_of_2={pow2}) \
         that have no satisfiable block size"
    )]
    UnsatisfiableBlockLength {
        uri: String,
        min: u32,
        max: u32,
        pow2: bool,
    },
}

/// Failures reported back from the live host (service-thread-facing API).
#[derive(Debug, Error)]
pub enum HostError {
    #[error("audio engine is not active")]
    NotActive,

    #[error("parameter request timed out")]
    Timeout,

    #[error("command ring is full, command dropped")]
    RingOverflow,

    #[error("instance {0} is not part of the installed pedalboard")]
    UnknownInstance(u64),
}

/// Per-plugin errors that never take the engine down; they are recorded in
/// the plugin's error slot and relayed as `Lv2ErrorMessage`.
#[derive(Debug, Error, Clone)]
pub enum PluginRuntimeError {
    #[error("state restore failed: {0}")]
    StateRestoreFailed(String),

    #[error("{0}")]
    Generic(String),
}
