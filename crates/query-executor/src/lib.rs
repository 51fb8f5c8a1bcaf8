//! Stage execution for the query engine.
//!
//! A query fragment runs as a [`Pipeline`]: an input, an ordered chain of
//! [`StageUnit`]s and an output, driven cooperatively one quantum at a time.
//! Snapshot [`Marker`]s flow through the same channels as data so that every
//! stage can be captured at a consistent cut and restored after a failure.
//!
//! # Modules
//!
//! - [`stage`]: the stage unit contract and blocking states
//! - [`pipeline`]: the driver, pipeline outputs and configuration
//! - [`input`]: pipeline inputs, connector sources and marker injection
//! - [`element`]: stream elements, markers and captured stage state
//! - [`memory`]: per-pipeline and per-query memory accounting
//! - [`readiness`]: one-shot signals used to express blocking
//! - [`registry`]: stage kinds, factories and their capabilities
//! - [`stages`]: built-in stage units

pub mod element;
pub mod input;
pub mod memory;
pub mod pipeline;
pub mod readiness;
pub mod registry;
pub mod stage;
pub mod stages;

pub use element::{CapturedStates, Marker, SealedMarker, SnapshotReporter, StageState, StreamElement};
pub use input::{
    BatchSource, InputPoll, MarkerInjector, MemoryBatchSource, PipelineInput, QueueHandle,
    QueueInput, SourceInput,
};
pub use memory::{MemoryContext, MemoryPool};
pub use pipeline::{
    CollectOutput, Pipeline, PipelineConfig, PipelineOutput, PipelineState, PipelineStats,
    ProcessOutcome,
};
pub use readiness::{wait_any, Readiness};
pub use registry::{
    StageCapabilities, StageSpec, StageUnitFactory, StageUnitRegistry, TableFinishFactory,
};
pub use stage::{Blocked, StageLifecycle, StageUnit};
