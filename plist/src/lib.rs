//! The document model shared by everything that reads or writes structured files: a tree of
//! strings, numbers, booleans, blobs, arrays and ordered dictionaries. Concrete encodings implement
//! [`Format`].

use thiserror::Error;

mod json;
mod value;
mod xml;

pub use json::Json;
pub use value::{Dictionary, Value};
pub use xml::SimpleXml;

#[derive(Error, Debug, PartialEq)]
pub enum FormatError {
    #[error("invalid {format} document: {message}")]
    Invalid {
        format: &'static str,
        message: String,
    },
    #[error("{what} cannot be represented in {format}")]
    Unsupported {
        format: &'static str,
        what: &'static str,
    },
}

pub trait Format {
    fn name(&self) -> &'static str;

    /// Cheap sniffing of raw contents. A format that is never auto-detected returns false.
    fn identify(&self, contents: &[u8]) -> bool;

    fn deserialize(&self, contents: &[u8]) -> Result<Value, FormatError>;

    /// Fails rather than writing a lossy document when the value tree holds something this
    /// encoding cannot express.
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, FormatError>;
}
