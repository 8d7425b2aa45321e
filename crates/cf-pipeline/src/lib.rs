//! # cf-pipeline
//!
//! Drives batch runs through their stages.
//!
//! - [`BatchController`] runs one stage: claims items in queue order, calls
//!   the stage's [`ItemProcessor`] under a timeout, records the outcome and
//!   checkpoints after every transition. Pause and stop are honoured only
//!   between items.
//! - [`PipelineSequencer`] walks the run's stage list, handing each stage to
//!   the controller and advancing the stage cursor as stages drain.
//! - [`StageProcessor`] implements the built-in stages on top of the
//!   adapters.
//! - [`RunManager`] is the control surface: start, recover, pause, resume,
//!   stop, status, reprocess and acknowledge runs.

pub mod control;
pub mod controller;
pub mod processor;
pub mod report;
pub mod runs;
pub mod sequencer;
pub mod sources;

pub use control::RunControl;
pub use controller::{BatchController, ControllerConfig, LoopExit};
pub use processor::{ItemOutput, ItemProcessor, StageContext, StageProcessor};
pub use report::{ReportEntry, RunReport};
pub use runs::{RunHandle, RunListing, RunManager, RunOutcome, RunPhase, RunStatus};
pub use sequencer::{PipelineSequencer, SequenceOutcome};
pub use sources::{collect_sources, expand_inputs};
