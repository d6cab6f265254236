use std::{io, result, string::FromUtf8Error};

use crossbeam::channel::RecvError;

use thiserror::Error;

use crate::env;

// Errors are plain data so a group-commit leader can fan the same outcome
// out to every writer it absorbed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    IOError(String),

    #[error("lock error: {0}")]
    LockError(String),

    #[error("shutting down: {0}")]
    Shutdown(String),

    #[error("background error: {0}")]
    Background(String),

    #[error("channel receive: {0}")]
    ReceiveError(String),
}

impl Error {
    // The latched form handed to callers after a background task failed.
    pub fn background(&self) -> Error {
        Error::Background(self.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IOError(e.to_string())
    }
}

impl From<env::IoError> for Error {
    fn from(e: env::IoError) -> Self {
        Error::IOError(e.to_string())
    }
}

impl From<RecvError> for Error {
    fn from(e: RecvError) -> Self {
        Error::ReceiveError(e.to_string())
    }
}

impl From<FromUtf8Error> for Error {
    fn from(e: FromUtf8Error) -> Self {
        Error::Corruption(e.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;
