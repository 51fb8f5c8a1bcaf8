//! Stage unit registry.
//!
//! Built once at startup and passed around explicitly. Each factory's
//! capabilities are resolved when it is registered, so planners and the
//! checkpoint coordinator can ask "does this plan support snapshots?" without
//! instantiating or probing units.

use crate::stage::StageUnit;
use crate::stages::aggregation::{AggregateSpec, AggregationStage};
use crate::stages::limit::LimitStage;
use crate::stages::table_finish::{TableFinishStage, TableFinisher};
use query_core::{QueryError, Result, StageId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A planned stage: which factory builds it and with what options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl StageSpec {
    pub fn new(id: StageId, kind: impl Into<String>, options: serde_json::Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            options,
        }
    }

    /// Decode the options into a factory's own option type
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.options.clone()).map_err(|e| {
            QueryError::ExecutionError(format!(
                "invalid options for {} stage {}: {}",
                self.kind, self.id, e
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageCapabilities {
    /// Units can be captured into and restored from snapshots
    pub snapshot: bool,
}

pub trait StageUnitFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> StageCapabilities;

    fn create(&self, spec: &StageSpec) -> Result<Box<dyn StageUnit>>;
}

struct Registered {
    factory: Arc<dyn StageUnitFactory>,
    capabilities: StageCapabilities,
}

#[derive(Default)]
pub struct StageUnitRegistry {
    factories: HashMap<String, Registered>,
}

impl StageUnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `aggregation` and `limit` stages. `table_finish`
    /// needs a connector and is registered separately.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(
            AggregationFactory.kind().to_string(),
            Registered {
                capabilities: AggregationFactory.capabilities(),
                factory: Arc::new(AggregationFactory),
            },
        );
        registry.factories.insert(
            LimitFactory.kind().to_string(),
            Registered {
                capabilities: LimitFactory.capabilities(),
                factory: Arc::new(LimitFactory),
            },
        );
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn StageUnitFactory>) -> Result<()> {
        let kind = factory.kind();
        if self.factories.contains_key(kind) {
            return Err(QueryError::IllegalState(format!(
                "stage kind '{}' is already registered",
                kind
            )));
        }
        let capabilities = factory.capabilities();
        tracing::debug!("Registered stage kind '{}' ({:?})", kind, capabilities);
        self.factories.insert(
            kind.to_string(),
            Registered {
                factory,
                capabilities,
            },
        );
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn StageUnitFactory>> {
        self.factories.get(kind).map(|r| &r.factory)
    }

    pub fn capabilities(&self, kind: &str) -> Option<StageCapabilities> {
        self.factories.get(kind).map(|r| r.capabilities)
    }

    /// Whether every stage in `specs` is of a registered, snapshot-capable kind
    pub fn supports_snapshot(&self, specs: &[StageSpec]) -> bool {
        specs.iter().all(|spec| {
            self.capabilities(&spec.kind)
                .is_some_and(|capabilities| capabilities.snapshot)
        })
    }

    pub fn create(&self, spec: &StageSpec) -> Result<Box<dyn StageUnit>> {
        let factory = self.get(&spec.kind).ok_or_else(|| {
            QueryError::ExecutionError(format!("unknown stage kind '{}'", spec.kind))
        })?;
        factory.create(spec)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[derive(Deserialize)]
struct AggregationOptions {
    aggregates: Vec<AggregateSpec>,
}

pub struct AggregationFactory;

impl StageUnitFactory for AggregationFactory {
    fn kind(&self) -> &'static str {
        "aggregation"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities { snapshot: true }
    }

    fn create(&self, spec: &StageSpec) -> Result<Box<dyn StageUnit>> {
        let options: AggregationOptions = spec.options()?;
        Ok(Box::new(AggregationStage::new(spec.id, options.aggregates)))
    }
}

#[derive(Deserialize)]
struct LimitOptions {
    limit: u64,
}

pub struct LimitFactory;

impl StageUnitFactory for LimitFactory {
    fn kind(&self) -> &'static str {
        "limit"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities { snapshot: true }
    }

    fn create(&self, spec: &StageSpec) -> Result<Box<dyn StageUnit>> {
        let options: LimitOptions = spec.options()?;
        Ok(Box::new(LimitStage::new(spec.id, options.limit)))
    }
}

#[derive(Deserialize)]
struct TableFinishOptions {
    #[serde(default)]
    statistics: Vec<AggregateSpec>,
}

/// Builds `table_finish` stages committing through one connector
pub struct TableFinishFactory {
    finisher: Arc<dyn TableFinisher>,
}

impl TableFinishFactory {
    pub fn new(finisher: Arc<dyn TableFinisher>) -> Self {
        Self { finisher }
    }
}

impl StageUnitFactory for TableFinishFactory {
    fn kind(&self) -> &'static str {
        "table_finish"
    }

    fn capabilities(&self) -> StageCapabilities {
        StageCapabilities { snapshot: true }
    }

    fn create(&self, spec: &StageSpec) -> Result<Box<dyn StageUnit>> {
        let options: TableFinishOptions = spec.options()?;
        Ok(Box::new(TableFinishStage::new(
            spec.id,
            self.finisher.clone(),
            options.statistics,
        )))
    }
}
