//! Error types and the top-level pretty-printer used by the `main` entry
//! point. The wire-level error taxonomy (STATUS replies vs. silent drops
//! vs. fatal session teardown) lives in the dispatcher and session code;
//! these types exist only to make `?`-propagation inside one session
//! tractable.

use std::fmt::{self, Debug};

use colored::Colorize;
use thiserror::Error;

/// Failure decoding a single field or frame from the controller stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("not enough bytes available to decode this field")]
    Truncated,
    #[error("address tag {0} is neither 4 (IPv4) nor 6 (IPv6)")]
    UnknownAddressTag(u8),
}

/// Fatal errors that end a [`crate::session::ControlSession`] outright.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("controller connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("client id space exhausted: more than one full wraparound with no free id")]
    ClientIdsExhausted,
}

/// Wraps an [`anyhow::Error`] for the same nicely-formatted, chained
/// error report the CLI tool prints before exiting.
pub struct PrettyError {
    error: anyhow::Error,
}

impl PrettyError {
    /// Prints `result`'s error chain (if any) and exits the process:
    /// 0 on success, 1 on failure.
    pub fn report<T>(result: anyhow::Result<T>) -> ! {
        std::process::exit(match result {
            Ok(_) => 0,
            Err(error) => {
                eprintln!("{:?}", PrettyError { error });
                1
            }
        });
    }
}

impl Debug for PrettyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let error = &self.error;

        if f.alternate() {
            return Debug::fmt(error, f);
        }

        write!(f, "{}", format!("{}: {}", "error".red(), error).bold())?;

        let mut source = error.source();
        let mut n = 0;
        while let Some(cause) = source {
            writeln!(f)?;
            write!(f, "{: >6} {}", format!("{n}:", n = n + 1).dimmed(), cause)?;
            source = cause.source();
            n += 1;
        }

        Ok(())
    }
}
