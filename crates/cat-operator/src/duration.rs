//! Duration string parsing
//!
//! Durations are written as a sequence of numbers with unit suffixes, such
//! as `"300ms"`, `"5s"` or `"1h30m"`. Parsing is delegated to [`humantime`].

use chrono::TimeDelta;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DurationError {
    #[error("invalid duration {input:?}: {source}")]
    Invalid {
        input: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("duration {0:?} is out of range")]
    OutOfRange(String),
}

/// Parse a duration string into a [`TimeDelta`].
pub fn parse(input: &str) -> Result<TimeDelta, DurationError> {
    let parsed = humantime::parse_duration(input).map_err(|source| DurationError::Invalid {
        input: input.to_string(),
        source,
    })?;
    TimeDelta::from_std(parsed).map_err(|_| DurationError::OutOfRange(input.to_string()))
}
