// Copyright 2025 salon Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::{Debug, Display},
    sync::Arc,
};

/// Classifies the failures salon itself can raise.
///
/// The set is deliberately small: failures of an individual image load travel as
/// *events* (`LoadError` in `salon-cache`), so an [`Error`] only ever means the
/// cache could not be built or asked at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or unusable configuration.
    Config,
    /// The byte transport could not be set up.
    Transport,
    /// An image payload cannot be probed for dimensions.
    Decode,
    /// The controller has been shut down.
    Closed,
    /// A failure outside salon's own taxonomy.
    External,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Transport => "transport",
            ErrorKind::Decode => "decode",
            ErrorKind::Closed => "closed",
            ErrorKind::External => "external",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by the fallible salon surface.
///
/// Errors are built with a kind constructor and enriched inline, which is how the
/// builder and the default transport/decoder construct them:
///
/// ```rust
/// # use salon_common::error::Error;
/// let err = Error::config("loaders_max must be greater than zero").with_detail("loaders_max", 0);
/// assert_eq!(
///     err.to_string(),
///     "config error: loaders_max must be greater than zero (loaders_max: 0)",
/// );
/// ```
///
/// `Display` renders the whole chain on a single line because error text ends up
/// inside event payloads (a blob-error reason) and log lines, never in a report of
/// its own.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    details: Vec<(&'static str, String)>,
    cause: Option<Arc<anyhow::Error>>,
}

impl Error {
    fn of(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
            cause: None,
        }
    }

    /// An [`ErrorKind::Config`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::Config, message)
    }

    /// An [`ErrorKind::Transport`] error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::Transport, message)
    }

    /// An [`ErrorKind::Decode`] error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::Decode, message)
    }

    /// An [`ErrorKind::Closed`] error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::Closed, message)
    }

    /// An [`ErrorKind::External`] error.
    pub fn external(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::External, message)
    }

    /// Attach a named value worth seeing next to the message, such as the
    /// offending configuration field.
    pub fn with_detail(mut self, key: &'static str, value: impl Display) -> Self {
        self.details.push((key, value.to_string()));
        self
    }

    /// Attach the underlying error. An earlier cause, if any, is replaced.
    pub fn caused_by(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(Arc::new(cause.into()));
        self
    }

    /// The error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The error message, without details or cause.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying cause, if one was attached.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    /// Borrow the cause as a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause()?.downcast_ref()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)?;
        if !self.details.is_empty() {
            f.write_str(" (")?;
            for (i, (key, value)) in self.details.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{key}: {value}")?;
            }
            f.write_str(")")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("details", &self.details)
            .field("cause", &self.cause)
            .finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|cause| cause.as_ref().as_ref())
    }
}

/// Result type for salon.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_constructors() {
        assert_eq!(Error::config("x").kind(), ErrorKind::Config);
        assert_eq!(Error::transport("x").kind(), ErrorKind::Transport);
        assert_eq!(Error::decode("x").kind(), ErrorKind::Decode);
        assert_eq!(Error::closed("x").kind(), ErrorKind::Closed);
        assert_eq!(Error::external("x").kind(), ErrorKind::External);
    }

    #[test]
    fn test_display_single_line() {
        let err = Error::config("memory budgets must be greater than zero")
            .with_detail("ram_bytes_budget", 0)
            .with_detail("video_bytes_budget", 512)
            .caused_by(std::io::Error::other("underlying"));

        assert_eq!(
            err.to_string(),
            "config error: memory budgets must be greater than zero \
             (ram_bytes_budget: 0, video_bytes_budget: 512): underlying",
        );
        assert_eq!(err.message(), "memory budgets must be greater than zero");
    }

    #[test]
    fn test_cause_chain() {
        let parse_err = "not a number".parse::<u32>().unwrap_err();
        let err = Error::decode("bad mock width").caused_by(parse_err.clone());

        assert_eq!(err.downcast_ref::<std::num::ParseIntError>(), Some(&parse_err));
        assert!(std::error::Error::source(&err).is_some());
        assert!(Error::decode("no cause").cause().is_none());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn check<T: Send + Sync + 'static>(_: T) {}
        check(Error::external("moves across threads"));
    }
}
