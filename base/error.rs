// This file is part of protect-archiver, a Unifi Protect clip backup daemon.
// Copyright (C) 2026 The protect-archiver Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A small `grpc::StatusCode`-flavored error type, used the same way
//! throughout the crate: construct with [`err!`], return early with
//! [`bail!`], log full cause chains with [`Error::chain`].

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// a general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        };
        f.write_str(s)
    }
}

pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    #[must_use]
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, e: E) -> Self {
        self.source = Some(Box::new(e));
        self
    }

    /// Returns a `Display` impl that prints this error and every `source()`
    /// in its chain, one per "caused by:" line.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("msg", &self.msg)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            Some(m) => write!(f, "{}: {}", self.kind, m),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Error {
        Error::new(ErrorKind::Internal)
            .with_msg("sqlite error")
            .with_source(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::Internal,
        };
        Error::new(kind).with_msg("io error").with_source(e)
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cause = std::error::Error::source(self.0);
        while let Some(c) = cause {
            write!(f, "\ncaused by: {c}")?;
            cause = c.source();
        }
        Ok(())
    }
}

/// Extension methods for `Result`, for wrapping a foreign error with a kind.
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k).with_source(e))
    }
}

/// Constructs an [`Error`].
///
/// ```ignore
/// err!(NotFound, msg("no such event {}", id))
/// err!(Internal, msg("boot id is invalid"), source(e))
/// err!(OutOfRange, source(e))
/// err!(e, msg("failed to open {}", path.display())) // wraps a foreign error; kind defaults to Internal
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident, msg($($arg:tt)+), source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind)
            .with_msg(format!($($arg)+))
            .with_source($src)
    };
    ($kind:ident, msg($($arg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_msg(format!($($arg)+))
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).with_source($src)
    };
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
    ($src:expr, msg($($arg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::Internal)
            .with_msg(format!($($arg)+))
            .with_source($src)
    };
}

/// Like [`err!`], but returns the error from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($args:tt)+) => {
        return Err($crate::err!($($args)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_msg() {
        let e = Error::new(ErrorKind::NotFound);
        assert_eq!(e.to_string(), "Not found");
    }

    #[test]
    fn display_with_msg() {
        let e = err!(NotFound, msg("no such event {}", "abc"));
        assert_eq!(e.to_string(), "Not found: no such event abc");
    }

    #[test]
    fn chain_walks_sources() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = err!(Internal, msg("flush failed"), source(io_err));
        let chain = e.chain().to_string();
        assert!(chain.contains("Internal: flush failed"));
        assert!(chain.contains("caused by: disk full"));
    }

    #[test]
    fn bail_returns_early() {
        fn f() -> Result<(), Error> {
            bail!(Unauthenticated, msg("unknown user: {}", "slamb"));
        }
        let e = f().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Unauthenticated);
    }
}
