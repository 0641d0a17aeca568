//! The errors surfaced by the controller layer and the state stores.
//!
//! The device core wraps these in its own layered error types; see the
//! `nandfs_core` crate. The `#[error]` tag takes care of the `Display`
//! implementation, and `#[from]` generates the conversions that make the
//! `?` operator work across layers.

use std::io;
use thiserror::Error;

///Error type used in the controller layer and the state stores
#[derive(Error, Debug)]
pub enum ApiError {
    /// Error caused when performing IO on the flash image or a state store
    #[error("Issue using IO in the controller layer")]
    ApiIo(#[from] io::Error),
    /// Error caused when (de)serializing the framing header of a state store
    #[error("Issue with the framing header of a state store")]
    ApiFraming(#[from] bincode::Error),
    /// Invalid input to the controller layer
    #[error("Invalid controller input: {0}")]
    ControllerInput(&'static str),
    /// Invalid input to a state store
    #[error("Invalid store input: {0}")]
    StoreInput(&'static str),
    /// The byte source ran out of data in the middle of a read
    #[error("State source exhausted: {0}")]
    SourceExhausted(&'static str),

    ///Catch-all for errors that no caller is expected to match on
    #[error(transparent)]
    Other(#[from] anyhow::Error), // source and Display delegate to anyhow::Error
}

/// Define a generic alias for a `Result` with the error type `ApiError`.
pub type Result<T> = std::result::Result<T, ApiError>;
