use std::error::Error;
use std::fmt::{Display, Formatter};

/// An error from composing or manipulating states.
#[derive(Debug)]
pub enum StateError {
    /// A caller-side precondition was violated; nothing was mutated.
    Precondition(String),
    /// An operator array does not have the shape the targets require.
    ShapeMismatch {
        /// The `(rows, cols)` shape the targets require.
        expected: (usize, usize),
        /// The shape that was supplied.
        found: (usize, usize),
    },
    /// A channel is not physically valid (e.g. Kraus family not summing
    /// to the identity).
    InvalidChannel(String),
    /// The backing array reached a physically invalid configuration.
    InvalidState(String),
}

impl StateError {
    /// Construct a precondition-violation error.
    pub fn precondition<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::Precondition(msg.into())
    }

    /// Construct an invalid-state error.
    pub fn invalid_state<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::InvalidState(msg.into())
    }
}

/// A result which may contain a state error.
pub type StateResult<T> = Result<T, StateError>;

impl Error for StateError {}

impl Display for StateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Precondition(msg) => write!(f, "precondition violated: {}", msg),
            Self::ShapeMismatch { expected, found } => write!(
                f,
                "operator has shape ({}, {}), expected ({}, {})",
                found.0, found.1, expected.0, expected.1
            ),
            Self::InvalidChannel(msg) => write!(f, "invalid channel: {}", msg),
            Self::InvalidState(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}
