//! extract-pipeline - Distributed scan / queue / extract pipeline
//!
//! A scanner walks directory trees and enqueues every accepted file, a
//! drainer pulls files off the queue into a bounded worker pool, and each
//! outcome is recorded in a report map so interrupted runs can be resumed.
//! The queue and report map behave the same in memory, in MySQL and in
//! Redis, so scanners and drainers on different machines can share them.
//!
//! # Features
//!
//! - **Codec-driven storage**: backends only see named field maps produced
//!   by a codec, never item types.
//!
//! - **At-most-once delivery**: a queued record is claimed by flipping it
//!   from waiting to processed inside one atomic step.
//!
//! - **Distributed lock and condition**: MySQL `GET_LOCK`, tagged `SLEEP`
//!   and `KILL QUERY` give blocking consumers a mutex and a lossy condition
//!   variable without polling.
//!
//! - **Bulk streaming**: a rendezvous producer/consumer pages through a
//!   remote document store for copies, retagging and diffs.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────┐  add   ┌────────────────────┐  poll/take  ┌──────────┐
//!   │ Scanner  │ ─────▶ │  BlockingQueue     │ ──────────▶ │ Drainer  │
//!   │ (walkdir)│        │  memory/mysql/redis│             └────┬─────┘
//!   └────┬─────┘        └────────────────────┘                  │ dispatch
//!        │ signal/seal          ▲ lock + condition (mysql)       ▼
//!        ▼                      │                         ┌────────────┐
//!   ┌──────────┐ ───────────────┘                         │ WorkerPool │
//!   │  Latch   │ ◀──────────── wait ───────────────────── │ extract →  │
//!   └──────────┘                                          │ write →    │
//!                                                         │ report     │
//!                                                         └─────┬──────┘
//!                                                               ▼
//!                                                    ┌────────────────────┐
//!                                                    │ ConcurrentMap      │
//!                                                    │ path → Report      │
//!                                                    └────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Scan and extract in one process
//! extract-pipeline run /data/docs -j 8 -o out/
//!
//! # Share a MySQL queue between machines
//! extract-pipeline --backend mysql --url mysql://u:p@db/pipeline scan /data
//! extract-pipeline --backend mysql --url mysql://u:p@db/pipeline drain --poll-for 30
//! ```

pub mod backend;
pub mod bulk;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod document;
pub mod error;
pub mod latch;
pub mod lock;
pub mod map;
pub mod progress;
pub mod queue;
pub mod redis_client;
pub mod sql;
pub mod worker;

pub use backend::{open, Backend, BackendConfig, BackendKind};
pub use document::{ExtractionStatus, Report, WorkItem};
pub use error::{PipelineError, Result};
pub use queue::BlockingQueue;
pub use map::ConcurrentMap;
