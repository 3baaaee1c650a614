//! Error types for policy construction and filter installation
//!
//! Every stage of the pipeline fails closed: an error anywhere in
//! parse → resolve → compile aborts policy construction, there is no
//! partially-built filter to fall back to.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;

/// A position in a policy file, used to point errors at the offending text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub file: PathBuf,
    pub line: usize,
}

impl Location {
    pub fn new(file: impl Into<PathBuf>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// Errors that can occur while building or installing a syscall filter
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("{file}:{line}:{column}: {reason}")]
    Parse {
        file: PathBuf,
        line: usize,
        column: usize,
        reason: String,
    },

    #[error("{location}: unresolved symbol '{symbol}'")]
    UnresolvedSymbol { symbol: String, location: Location },

    #[error("include cycle: {}", format_cycle(.cycle))]
    IncludeCycle { cycle: Vec<PathBuf> },

    #[error("syscall '{syscall}' defined more than once ({first} and {second})")]
    DuplicateSyscall {
        syscall: String,
        first: Location,
        second: Location,
    },

    #[error("conflicting default actions: '{first_action}' at {first}, '{second_action}' at {second}")]
    ConflictingDefault {
        first_action: String,
        first: Location,
        second_action: String,
        second: Location,
    },

    #[error("{location}: syscall '{syscall}' is not known on {arch}")]
    UnknownSyscall {
        syscall: String,
        arch: String,
        location: Location,
    },

    #[error("compile error: {0}")]
    Compile(String),

    #[error("failed to install seccomp filter: {0}")]
    Installation(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PolicyError {
    pub(crate) fn parse(
        file: impl Into<PathBuf>,
        line: usize,
        column: usize,
        reason: impl Into<String>,
    ) -> Self {
        PolicyError::Parse {
            file: file.into(),
            line,
            column,
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PolicyError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors raised after a filter was handed to the kernel
    /// capability. Callers must treat these as fatal.
    pub fn is_installation(&self) -> bool {
        matches!(self, PolicyError::Installation(_))
    }
}

fn format_cycle(cycle: &[PathBuf]) -> String {
    cycle
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
