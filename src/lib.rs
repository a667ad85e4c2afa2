//! mortem - post-mortem root-cause analysis for C memory leaks
//!
//! Combines a Valgrind-style checker report with a GDB-driven execution
//! trace and a deterministic symbolic ownership tracker to name the exact
//! source line at which each definitely-lost allocation became
//! unreachable, classified into one of three leak kinds.
//!
//! # Pipeline
//!
//! - **report**: checker text report -> structured loss records
//! - **context**: source file + line -> enclosing function body
//! - **tracer**: executable + debugger -> linear execution trace
//! - **tracker**: record + trace -> root cause (pure, deterministic)
//! - **classify**: root cause -> confirmed leak kind
//!
//! The engine never prints; rendering and the optional LLM narration live
//! in the CLI crate.

pub mod checker;
pub mod classify;
pub mod config;
pub mod context;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod syntax;
pub mod tracer;
pub mod tracker;

pub use config::{AnalysisConfig, CancelFlag};
pub use error::{ConfigError, Inconclusive, MortemError, NarrateError, ParseError, TraceError};
pub use models::{
    Confidence, ExecTrace, Frame, LeakCategory, LeakDiagnosis, LeakKind, LeakRecord, RootCause,
};
pub use pipeline::{AnalysisOutcome, Analyzer, RecordFailure};
