//! End-to-end restore tests.
//!
//! Each test builds a dump directory or an archive on disk or in memory,
//! restores it into an `InMemoryDestination`, and checks the resulting
//! collections, the summary, and the oplog statistics.

#[path = "../common/mod.rs"]
mod common;

mod archive;
mod directory;
mod oplog;
