/*!
The [`Error`] type.
*/

use std::fmt;

/**
An error configuring or controlling a [`crate::Pipeline`].

Errors are only returned from configuration and lifecycle methods. Logging calls never fail with an error.
*/
pub struct Error(Box<dyn std::error::Error + Send + Sync>);

impl Error {
    /**
    Create an error from a message or another error.
    */
    pub fn new(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error(e.into())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<emit_async_ring::CapacityError> for Error {
    fn from(err: emit_async_ring::CapacityError) -> Self {
        Error::new(err)
    }
}

impl From<crate::level::ParseLevelError> for Error {
    fn from(err: crate::level::ParseLevelError) -> Self {
        Error::new(err)
    }
}
