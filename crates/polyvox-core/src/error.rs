//! Error types for Polyvox.

use thiserror::Error;

/// Result type alias using Polyvox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Polyvox.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid source configuration. Fatal for the group being
    /// constructed; nothing else is affected.
    #[error("invalid group configuration: {0}")]
    Config(String),

    /// No source candidate has an extension the codec probe accepts.
    #[error("no playable source candidate: {0}")]
    NoCodec(String),

    /// Asynchronous decode failed or produced an empty buffer.
    #[error("audio decode failed: {0}")]
    Decode(String),

    /// The backend or media element refused to start playback, typically
    /// because of an autoplay policy. Scoped to a single voice.
    #[error("playback refused: {0}")]
    Play(String),

    /// Audio graph or lifecycle failure in the backend.
    #[error("audio backend error: {0}")]
    Backend(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns true if the failure is scoped to a single voice or load
    /// attempt and the rest of the engine keeps running.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Play(_) | Self::Decode(_) | Self::NoCodec(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverable() {
        assert!(Error::Play("autoplay blocked".into()).is_recoverable());
        assert!(Error::Decode("truncated".into()).is_recoverable());
        assert!(!Error::Config("no sources".into()).is_recoverable());
        assert!(!Error::Backend("graph torn down".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::NoCodec("tried ogg, flac".into());
        assert_eq!(err.to_string(), "no playable source candidate: tried ogg, flac");
    }
}
