//! Client for the persistent vision worker process.
//!
//! The worker is a long-lived external process that loads its models once,
//! prints `READY`, then answers one line-delimited request at a time on
//! stdin/stdout. This crate provides:
//! - Line framing over an unbounded byte stream
//! - The request/response frame alphabet
//! - A protocol channel correlating responses to pending requests
//! - A supervisor that starts each worker role at most once and respawns it after a crash
//! - The [`Analyzer`] capability used by the job queue

pub mod analyzer;
pub mod channel;
pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod supervisor;

pub use analyzer::{Analyzer, ProcessAnalyzer};
pub use channel::ProtocolChannel;
pub use config::{AnalyzerConfig, WorkerCommand};
pub use error::{AnalyzerError, AnalyzerResult};
pub use framing::LineBuffer;
pub use protocol::{MalformedFrame, Request, Response, ResponseKind};
pub use supervisor::{WorkerHandle, WorkerRole, WorkerSupervisor};
