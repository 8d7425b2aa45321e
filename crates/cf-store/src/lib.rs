//! # cf-store
//!
//! State ownership for batch runs:
//!
//! - **[`WorkStore`]** -- the ordered, in-memory work-item collection with
//!   compare-and-set transitions. The only shared mutable state of a run.
//! - **[`CheckpointStore`]** -- atomic, one-file-per-run persistence of
//!   [`BatchState`](cf_core::BatchState) snapshots.
//! - **[`ResumeNegotiator`]** -- classifies stored checkpoints and rebuilds a
//!   store for resumption, guarded by [`RunLeases`].
//! - **[`RunLeases`]** -- one live controller per run, enforced in-process
//!   and through lock files next to the checkpoints.

pub mod checkpoint;
pub mod lease;
pub mod resume;
pub mod store;

pub use checkpoint::{atomic_write, CheckpointStore, Checkpointer};
pub use lease::{lock_path, RunLease, RunLeases};
pub use resume::{CheckpointStatus, ResumeNegotiator, ResumeSummary};
pub use store::WorkStore;
