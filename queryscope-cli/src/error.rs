//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the daemon binary: consistent formatting
//! and a non-zero exit code for unrecoverable initialization failures.

use std::fmt;
use std::process;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// Base directory or pid file could not be set up.
    Init(String),
    /// Configuration file or flag problem.
    Config(String),
    /// Logging could not be initialized.
    Logging(std::io::Error),
}

impl CliError {
    /// Exits the process with an error message and a non-zero code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::Init(_) = self {
            eprintln!();
            eprintln!("Check that the base directory exists and is writable,");
            eprintln!("or point --basedir somewhere else.");
        }

        process::exit(1);
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(msg) => write!(f, "initialization failed: {}", msg),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Logging(e) => write!(f, "cannot initialize logging: {}", e),
        }
    }
}

impl std::error::Error for CliError {}
