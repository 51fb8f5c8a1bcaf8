//! Built-in stage units

pub mod aggregation;
pub mod limit;
pub mod table_finish;

pub use aggregation::{AggregateFunction, AggregateSpec, AggregationStage};
pub use limit::LimitStage;
pub use table_finish::{TableFinishStage, TableFinisher};
