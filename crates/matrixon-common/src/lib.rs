//! Common types for the Matrixon appservice layer
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//!
//! Holds the error taxonomy shared by the sync engine, intents and the
//! room upgrade resolver, together with the helpers used to turn homeserver
//! error responses into typed errors.

pub mod error;
pub mod retry_after;

pub use error::{errcode, Error, MatrixError, Result};
pub use retry_after::{parse_retry_after_header, RetryAfterParseError};
