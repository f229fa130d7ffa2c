//! autosubsync - subtitle synchronization front-end
//!
//! Drives external synchronization tools (executables or Python modules run in
//! an isolated worker process) for single reference/subtitle pairs and for
//! sequential batches, with progress parsing, cancellation of whole process
//! trees, and the preparation steps those tools need around them.

pub mod batch;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod encoding;
pub mod error;
pub mod events;
pub mod exec;
pub mod job;
pub mod media;
pub mod processed;
pub mod progress;
pub mod tools;
pub mod worker;
