//! Per-turn outcome classification and status tokens.

use crate::error::{FilterError, Result};
use std::fmt;

/// Final status token for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
    Delayed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "error",
            Status::Delayed => "delayed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands understood by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Clean,
    Smudge,
    ListAvailableBlobs,
}

impl Command {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(Command::Clean),
            "smudge" => Some(Command::Smudge),
            "list_available_blobs" => Some(Command::ListAvailableBlobs),
            _ => None,
        }
    }
}

/// What a transform reported for one turn.
#[derive(Debug)]
pub enum TurnOutcome {
    Ok,
    /// Smudge input was not a pointer and was written back unchanged.
    PassthroughNotAPointer,
    /// A recoverable failure, answered with `status=error`.
    Failure(FilterError),
    /// The request payload ended without its flush packet.
    EndOfStream,
}

impl TurnOutcome {
    /// Fold a transform result into an outcome.
    ///
    /// Fatal errors stay errors and end the session; everything else
    /// becomes `Failure`.
    pub fn from_result(result: Result<TurnOutcome>) -> Result<TurnOutcome> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(TurnOutcome::Failure(e)),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TurnOutcome::Failure(_))
    }
}

/// Map a turn's outcome to the status written after its content.
pub fn final_status(outcome: &TurnOutcome, delayed: bool) -> Status {
    if delayed {
        return Status::Delayed;
    }
    match outcome {
        TurnOutcome::Failure(_) => Status::Error,
        TurnOutcome::Ok | TurnOutcome::PassthroughNotAPointer | TurnOutcome::EndOfStream => {
            Status::Success
        }
    }
}
