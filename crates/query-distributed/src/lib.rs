//! Distributed execution for Query Engine
//!
//! This crate runs a fragmented query plan as a set of pipelines connected by
//! buffered exchanges, and keeps it alive across task failures with
//! marker-based snapshots.
//!
//! # Architecture
//!
//! - **Executor**: launches one pipeline per fragment partition and supervises the attempt
//! - **Buffers/Exchanges**: task output buffers read by token through exchange clients
//! - **Checkpoints**: the coordinator injects markers and seals complete snapshots
//! - **FaultManager**: decides between restoring, restarting and failing a query
//!
//! # Example
//!
//! ```ignore
//! use query_distributed::{DistributedExecutor, ExecuteOptions, ExecutorConfig, InMemorySnapshotStore};
//! use query_executor::StageUnitRegistry;
//! use std::sync::Arc;
//!
//! let executor = DistributedExecutor::new(
//!     ExecutorConfig::default(),
//!     Arc::new(StageUnitRegistry::with_builtins()),
//!     Arc::new(InMemorySnapshotStore::new()),
//! );
//!
//! let execution = executor.execute(plan, ExecuteOptions::default())?;
//! let status = execution.wait().await;
//! ```
//!
//! # Modules
//!
//! - [`executor`]: Distributed execution orchestration
//! - [`planner`]: Fragment plans and connector sources
//! - [`buffer`]: Task output buffers
//! - [`exchange`]: Exchange clients reading upstream buffers
//! - [`alignment`]: Marker alignment across exchange channels
//! - [`checkpoint`]: Snapshot coordination
//! - [`snapshot`]: Snapshot state storage
//! - [`fault`]: Fault tolerance and recovery
//! - [`partition`]: Output partitioning
//! - [`worker`]: Task execution slots

pub mod alignment;
pub mod buffer;
pub mod checkpoint;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod fault;
pub mod partition;
pub mod planner;
pub mod snapshot;
pub mod types;
pub mod worker;

// Re-exports
pub use alignment::MarkerAligner;
pub use buffer::{BufferPage, OutputBuffer, OutputBufferConfig, OutputBufferWriter};
pub use checkpoint::{CheckpointConfig, CheckpointCoordinator, CheckpointStats, RecoveryPlan};
pub use error::{DistributedError, Result};
pub use exchange::{
    DefaultExchangeClientSupplier, ExchangeClient, ExchangeClientConfig, ExchangeClientSupplier,
    ExchangeInput, ExchangeSource, LocalExchangeSource, RetryPolicy,
};
pub use executor::{
    DistributedExecutor, ExecuteOptions, ExecutionStats, ExecutorConfig, QueryExecution,
    RootOutput,
};
pub use fault::{FaultConfig, FaultManager, FaultStats, RecoveryAction, TaskFailure};
pub use partition::{OutputPartitioning, Partitioner};
pub use planner::{FragmentInput, FragmentPlan, MemorySourceProvider, QueryPlan, SourceProvider};
pub use snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotKey, SnapshotStore};
pub use types::*;
pub use worker::Worker;
