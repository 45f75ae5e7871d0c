#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]

pub mod cursor;
pub mod error;

pub mod crypto;
pub mod wire;

pub use cursor::BinaryCursor;
pub use error::{ErrorCode, ProtocolError, Result};
