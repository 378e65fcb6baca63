//! Control-flow signals produced by nodes and unwound through frames

use crate::error::ErrorDescriptor;
use crate::value::Value;

/// Outcome of executing one node
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Ok,
    Break,
    Continue,
    /// End the current macro, optionally with a result value
    Return(Option<Value>),
    Error(ErrorDescriptor),
}

impl Signal {
    pub fn is_error(&self) -> bool {
        matches!(self, Signal::Error(_))
    }
}

impl From<ErrorDescriptor> for Signal {
    fn from(error: ErrorDescriptor) -> Self {
        Signal::Error(error)
    }
}
