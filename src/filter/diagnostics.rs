//! End-of-session advisories.

use crate::filter::status::{Command, TurnOutcome};
use std::io::{self, Write};

/// Git for Windows stores object sizes in a 32-bit `unsigned long`, so
/// larger smudge output may have been cut short.
pub const WINDOWS_SIZE_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

pub fn possibly_truncated_on_windows(written: u64) -> bool {
    written > WINDOWS_SIZE_LIMIT
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Smudged paths whose content was not a pointer
    pub malformed: Vec<String>,
    pub malformed_on_windows: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note anything worth reporting about a finished turn.
    ///
    /// Passthrough of non-pointer content is the defined behavior, so it is
    /// downgraded to `Ok` here.
    pub fn record(
        &mut self,
        pathname: &str,
        command: Command,
        outcome: TurnOutcome,
        written: u64,
    ) -> TurnOutcome {
        if let TurnOutcome::PassthroughNotAPointer = outcome {
            self.malformed.push(pathname.to_string());
            return TurnOutcome::Ok;
        }
        if command == Command::Smudge && possibly_truncated_on_windows(written) {
            self.malformed_on_windows.push(pathname.to_string());
        }
        outcome
    }

    pub fn is_empty(&self) -> bool {
        self.malformed.is_empty() && self.malformed_on_windows.is_empty()
    }

    pub fn report<W: Write>(&self, mut out: W) -> io::Result<()> {
        if !self.malformed.is_empty() {
            writeln!(
                out,
                "Encountered {} file(s) that should have been pointers, but weren't:",
                self.malformed.len()
            )?;
            for path in &self.malformed {
                writeln!(out, "\t{}", path)?;
            }
        }

        if !self.malformed_on_windows.is_empty() {
            writeln!(
                out,
                "Encountered {} file(s) that may not have been copied correctly on Windows:",
                self.malformed_on_windows.len()
            )?;
            for path in &self.malformed_on_windows {
                writeln!(out, "\t{}", path)?;
            }
            writeln!(out, "\nSee: `git lfs help smudge` for more details.")?;
        }

        out.flush()
    }
}
