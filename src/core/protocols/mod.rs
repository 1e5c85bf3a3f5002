pub mod ascii;

pub use ascii::{decode, AsciiCommand, AsciiResponse, ResponseKind, StoreMode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol parse error: {0}")]
    ParseError(String),
    #[error("Unexpected response to {command}: {line}")]
    UnexpectedResponse { command: &'static str, line: String },
    #[error("Response line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("Value of {size} bytes exceeds limit of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },
}
