//! Session management for a multi-tenant Python execution sandbox: a warm
//! pool of interpreter processes, per-session file manifests, and the
//! execution loop that drives a session to completion for one call.
//! Wire types (Worker Messages, Output Events, JSON-RPC, MCP) live in
//! `sandbox-protocol`; this crate is transport-agnostic.

pub mod config;
pub mod downloader;
pub mod error;
pub mod exec_loop;
pub mod manifest;
pub mod pool;
pub mod session;
pub mod worker;

pub use config::Config;
pub use downloader::Downloader;
pub use error::CoreError;
pub use error::DownloadError;
pub use error::Result;
pub use exec_loop::aggregate;
pub use exec_loop::execute;
pub use exec_loop::AggregatedError;
pub use exec_loop::AggregatedOutput;
pub use exec_loop::ExecuteRequest;
pub use manifest::FileManifest;
pub use pool::AcquireOutcome;
pub use pool::AcquireRequest;
pub use pool::FileRequest;
pub use pool::SessionManager;
pub use pool::SessionSummary;
pub use session::Session;
pub use worker::ProcessWorker;
pub use worker::Worker;
