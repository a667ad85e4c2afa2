//! Error types for mortem

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for whole-run operations
pub type Result<T> = std::result::Result<T, MortemError>;

/// Run-wide prerequisites that are missing or unusable.
///
/// Every variant maps to exit code 3 in the CLI.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API key in the environment or the credential store
    #[error("No API key configured. Run `mortem configure`, set MORTEM_API_KEY, or pass --no-narrative")]
    MissingKey,

    /// Target binary does not exist
    #[error("Executable '{path}' does not exist", path = .0.display())]
    ExecutableNotFound(PathBuf),

    /// Target exists but is not an executable file
    #[error("'{path}' is not executable. Try: chmod +x {path}", path = .0.display())]
    NotExecutable(PathBuf),

    /// The memory checker binary is not on $PATH
    #[error("'{name}' is not installed or not on $PATH")]
    CheckerMissing { name: String },

    /// An explicitly requested debugger binary is not on $PATH
    #[error("Debugger '{name}' is not installed or not on $PATH")]
    DebuggerMissing { name: String },

    /// Credential store could not be read or written
    #[error("Failed to access credential store at '{path}': {source}", path = .path.display())]
    CredentialStore {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// MORTEM_MAX_TRACE_STEPS is not a positive integer
    #[error("Invalid step cap '{value}': expected a positive integer")]
    BadStepCap { value: String },
}

/// Failure to recover structure from the checker's text report.
///
/// An individual malformed block is skipped, not raised; this error means
/// the report as a whole could not be parsed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Block structure could not be recovered after two resync attempts
    #[error("Malformed checker report: {detail}")]
    Malformed { detail: String },
}

/// Per-record or per-run failures of the dynamic tracer or the checker run.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The debugger process could not be spawned
    #[error("Debugger could not be started: {0}")]
    DebuggerUnavailable(#[source] io::Error),

    /// The binary carries no line information for main
    #[error("'{executable}' has no debug symbols (compile with -g -O0)")]
    SymbolsMissing { executable: String },

    /// The stepping loop hit the configured hard cap
    #[error("Trace exceeded {cap} steps (raise MORTEM_MAX_TRACE_STEPS if the program is long-running)")]
    StepLimitExceeded { cap: u32 },

    /// The checker subprocess failed or produced no report
    #[error("Checker run failed: {detail}")]
    CheckerFailed { detail: String },

    /// The debugger closed its pipe mid-conversation
    #[error("Debugger session ended unexpectedly: {detail}")]
    SessionClosed { detail: String },

    /// Cooperative cancellation was observed at a step boundary
    #[error("Trace cancelled")]
    Cancelled,
}

/// The context extractor could not deliver a function body. The tracker
/// treats the affected frame as opaque.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// No top-level function definition contains the requested line
    #[error("No function containing {file}:{line} could be isolated")]
    Unresolved { file: String, line: u32 },

    /// The file could not be located in the search tree
    #[error("Source file '{file}' not found")]
    FileNotFound { file: String },

    /// Non-UTF-8 bytes outside string/char literals
    #[error("Source file '{file}' is not valid UTF-8 outside literals")]
    NotUtf8 { file: String },
}

/// The ownership tracker could not produce a root cause.
///
/// Each variant names the exact missing precondition; no guess is produced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Inconclusive {
    /// The record's innermost frame has no source coordinates
    #[error("No debug info for the allocation site")]
    NoDebugInfo,

    /// The trace ended before the allocation's binding event was seen
    #[error("Trace truncated: {detail}")]
    TraceTruncated { detail: String },

    /// An opaque frame held the only root and its effect cannot be modeled
    #[error("Opaque function '{function}' holds the only path to the allocation")]
    OpaqueCritical { function: String },

    /// The trace shows the allocation freed, contradicting the report
    #[error("Trace shows the allocation freed; report disagrees")]
    ReasonMismatch,

    /// Classifier post-conditions disagree with the tracker's verdict
    #[error("Classifier disagrees with tracker: expected {expected}, tracker said {got}")]
    ClassifierMismatch { expected: String, got: String },
}

/// Narrator (LLM collaborator) failures. Never fatal: the structural
/// diagnosis is rendered without prose.
#[derive(Debug, Error)]
pub enum NarrateError {
    /// No narrator transport is configured
    #[error("No narrator configured")]
    Offline,

    /// The narrator command exceeded its per-call timeout
    #[error("Narrator timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The narrator command could not be run or exited non-zero
    #[error("Narrator transport failed: {detail}")]
    Transport { detail: String },

    /// The narrator produced unusable output
    #[error("Narrator response unusable: {detail}")]
    Malformed { detail: String },
}

/// Top-level error for pipeline entry points.
#[derive(Debug, Error)]
pub enum MortemError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Trace(#[from] TraceError),
}
