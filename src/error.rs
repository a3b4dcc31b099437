use std::fmt::Display;

#[derive(Debug)]
pub enum Error {
    /// Declared type, relation or key does not fit the requested object.
    InvalidArgument(String),
    /// A collection changed while it was being enumerated.
    ConcurrentModification,
    /// A graph node was driven through an illegal state transition.
    InvalidState(&'static str),
    Plan(String),
    Materialize(String),
    Storage(String),
    Schema(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::ConcurrentModification => {
                write!(f, "Collection was modified during enumeration")
            }
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Plan(err) => write!(f, "Plan error: {}", err),
            Error::Materialize(err) => write!(f, "Materialization error: {}", err),
            Error::Storage(err) => write!(f, "Storage error: {}", err),
            Error::Schema(err) => write!(f, "Schema error: {}", err),
        }
    }
}

impl std::error::Error for Error {}
