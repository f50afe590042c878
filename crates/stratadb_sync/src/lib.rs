//! # StrataDB Sync
//!
//! The cloud sync pipeline for StrataDB.
//!
//! This crate turns committed local changes into an ordered,
//! dependency-aware queue of outbound operations:
//!
//! - [`CloudOperation`]: an immutable-once-submitted unit of work with
//!   uuid identity, dependencies, and priority
//! - [`OperationGraph`]: all operations generated by one local commit;
//!   graphs drain strictly in commit order
//! - [`Pipeline`]: the per-endpoint executor with a concurrency bound,
//!   nestable suspend counter, and retry-with-backoff requeuing
//! - [`CloudQueue`]: the extension that builds and durably persists graphs
//!   inside the committing transaction, so a local commit and its outbound
//!   operations are atomic
//! - [`MergeResolver`]: conflict resolution when the remote reports the
//!   local record stale, including proactive merging of still-queued local
//!   field changes
//!
//! ## Key invariants
//!
//! - No operation of graph N+1 starts before every operation of graph N is
//!   terminal
//! - Within a graph: dependencies first, then priority
//! - The pipeline never silently drops an operation; every terminal
//!   disposition is an explicit delegate decision
//! - Sync errors never affect local database state

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod graph;
mod merge;
mod operation;
mod pipeline;
mod queue;

pub use error::{SyncError, SyncResult};
pub use graph::OperationGraph;
pub use merge::{LocalWinsMerge, MergeResolver, RemoteWinsMerge};
pub use operation::{Attach, CloudOperation, OpStatus};
pub use pipeline::{Pipeline, PipelineConfig, PipelineDelegate, QueueObserver};
pub use queue::{CloudQueue, OutboundRecord, RecordHandler};
