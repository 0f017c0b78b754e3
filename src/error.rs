//! Error taxonomy (§7). Configuration/domain errors surface at the entry
//! point; invariant violations abort immediately where detected; trace EOF
//! is recovered locally by the device FSM and never reaches the caller as
//! an `Err`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    /// Malformed parameter file, out-of-range value, or violated cross-field
    /// constraint. Fatal at startup.
    #[error("configuration error: {key} = {value:?}: {reason}")]
    Configuration {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// EOF mid-simulation when more requests were expected. Not fatal: the
    /// device FSM converts this into a graceful `StopSim` event rather than
    /// propagating it.
    #[error("trace exhausted: {context}")]
    Trace { context: String },

    /// Page-version ordering broken, free-block accounting diverged, or the
    /// cleaner selected an ineligible block. Indicates a simulator bug;
    /// never recovered.
    #[error("invariant violated: {context}")]
    Invariant { context: String },

    /// A request's `blkno + bcount` exceeds the device size, or an unknown
    /// event type was dispatched.
    #[error("domain error: {context}")]
    Domain { context: String },

    /// No free block could be found for active-block allocation in the
    /// requested scope; watermarks or reserve were misconfigured.
    #[error("resource exhaustion: {context}")]
    ResourceExhaustion { context: String },
}

impl SimError {
    pub fn config(key: &'static str, value: impl std::fmt::Debug, reason: impl Into<String>) -> Self {
        SimError::Configuration {
            key,
            value: format!("{value:?}"),
            reason: reason.into(),
        }
    }

    pub fn invariant(context: impl Into<String>) -> Self {
        SimError::Invariant {
            context: context.into(),
        }
    }

    pub fn domain(context: impl Into<String>) -> Self {
        SimError::Domain {
            context: context.into(),
        }
    }

    pub fn exhausted(context: impl Into<String>) -> Self {
        SimError::ResourceExhaustion {
            context: context.into(),
        }
    }

    /// Trace EOF is the one kind the device FSM is expected to recover from.
    pub fn is_trace_eof(&self) -> bool {
        matches!(self, SimError::Trace { .. })
    }
}
