//! Distributed query plans
//!
//! A [`QueryPlan`] is a list of fragments in topological order. Each fragment
//! is a chain of stages instantiated once per partition; it reads either a
//! connector source or the output of exactly one upstream fragment. The last
//! fragment is the root, whose output goes to the client.

use crate::error::{DistributedError, Result};
use crate::partition::OutputPartitioning;
use arrow::record_batch::RecordBatch;
use query_core::{FragmentId, PartitionId, StageId};
use query_executor::{BatchSource, MemoryBatchSource, StageSpec};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Connector boundary: opens the data of one source partition
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, partition: PartitionId) -> query_core::Result<Box<dyn BatchSource>>;
}

/// Source over in-memory batches, one list per partition
pub struct MemorySourceProvider {
    name: String,
    partitions: Vec<Arc<Vec<RecordBatch>>>,
}

impl MemorySourceProvider {
    pub fn new(name: impl Into<String>, partitions: Vec<Vec<RecordBatch>>) -> Self {
        Self {
            name: name.into(),
            partitions: partitions.into_iter().map(Arc::new).collect(),
        }
    }
}

impl SourceProvider for MemorySourceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, partition: PartitionId) -> query_core::Result<Box<dyn BatchSource>> {
        let batches = self
            .partitions
            .get(partition.0 as usize)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(MemoryBatchSource::shared(batches)))
    }
}

/// Where a fragment's first stage reads from
#[derive(Clone)]
pub enum FragmentInput {
    /// A connector source; `id` names its read position in snapshots
    Source {
        id: StageId,
        provider: Arc<dyn SourceProvider>,
    },
    /// Every partition of the upstream fragment
    Exchange { id: StageId, upstream: FragmentId },
}

impl FragmentInput {
    pub fn id(&self) -> StageId {
        match self {
            FragmentInput::Source { id, .. } | FragmentInput::Exchange { id, .. } => *id,
        }
    }
}

impl fmt::Debug for FragmentInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentInput::Source { id, provider } => f
                .debug_struct("Source")
                .field("id", id)
                .field("provider", &provider.name())
                .finish(),
            FragmentInput::Exchange { id, upstream } => f
                .debug_struct("Exchange")
                .field("id", id)
                .field("upstream", upstream)
                .finish(),
        }
    }
}

/// A pipeline shape and how many partitions run it
#[derive(Debug, Clone)]
pub struct FragmentPlan {
    pub id: FragmentId,
    pub partitions: u32,
    pub input: FragmentInput,
    pub stages: Vec<StageSpec>,
    /// How output rows are spread over the consumer's partitions
    pub output_partitioning: OutputPartitioning,
}

impl FragmentPlan {
    /// Fragment reading a connector source
    pub fn source(
        id: FragmentId,
        partitions: u32,
        input_id: StageId,
        provider: Arc<dyn SourceProvider>,
    ) -> Self {
        Self {
            id,
            partitions,
            input: FragmentInput::Source {
                id: input_id,
                provider,
            },
            stages: Vec::new(),
            output_partitioning: OutputPartitioning::Single,
        }
    }

    /// Fragment reading the output of `upstream`
    pub fn exchange(id: FragmentId, partitions: u32, input_id: StageId, upstream: FragmentId) -> Self {
        Self {
            id,
            partitions,
            input: FragmentInput::Exchange {
                id: input_id,
                upstream,
            },
            stages: Vec::new(),
            output_partitioning: OutputPartitioning::Single,
        }
    }

    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_output_partitioning(mut self, partitioning: OutputPartitioning) -> Self {
        self.output_partitioning = partitioning;
        self
    }

    /// Ids whose state a snapshot holds for each partition of this fragment
    pub fn snapshot_ids(&self) -> Vec<StageId> {
        let input = match &self.input {
            FragmentInput::Source { id, .. } => Some(*id),
            FragmentInput::Exchange { .. } => None,
        };
        input
            .into_iter()
            .chain(self.stages.iter().map(|stage| stage.id))
            .collect()
    }
}

/// Fragments in topological order; the last one is the root
#[derive(Debug, Clone)]
pub struct QueryPlan {
    fragments: Vec<FragmentPlan>,
}

impl QueryPlan {
    pub fn new(fragments: Vec<FragmentPlan>) -> Result<Self> {
        let plan = Self { fragments };
        plan.validate()?;
        Ok(plan)
    }

    pub fn fragments(&self) -> &[FragmentPlan] {
        &self.fragments
    }

    pub fn fragment(&self, id: FragmentId) -> Option<&FragmentPlan> {
        self.fragments.iter().find(|f| f.id == id)
    }

    pub fn root(&self) -> &FragmentPlan {
        // validate() guarantees at least one fragment
        &self.fragments[self.fragments.len() - 1]
    }

    /// The fragment reading `id`'s output, if any
    pub fn consumer_of(&self, id: FragmentId) -> Option<&FragmentPlan> {
        self.fragments.iter().find(|f| {
            matches!(f.input, FragmentInput::Exchange { upstream, .. } if upstream == id)
        })
    }

    pub fn stage_specs(&self) -> impl Iterator<Item = &StageSpec> {
        self.fragments.iter().flat_map(|f| f.stages.iter())
    }

    pub fn task_count(&self) -> usize {
        self.fragments.iter().map(|f| f.partitions as usize).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.fragments.is_empty() {
            return Err(DistributedError::InvalidPlan(
                "plan has no fragments".to_string(),
            ));
        }

        let mut seen_fragments = HashSet::new();
        let mut seen_ids = HashSet::new();
        let mut consumers: HashMap<FragmentId, FragmentId> = HashMap::new();
        for fragment in &self.fragments {
            if fragment.partitions == 0 {
                return Err(DistributedError::InvalidPlan(format!(
                    "fragment {} has no partitions",
                    fragment.id
                )));
            }
            if fragment.stages.is_empty() {
                return Err(DistributedError::InvalidPlan(format!(
                    "fragment {} has no stages",
                    fragment.id
                )));
            }
            if let OutputPartitioning::Hash { key_columns } = &fragment.output_partitioning {
                if key_columns.is_empty() {
                    return Err(DistributedError::InvalidPlan(format!(
                        "fragment {} hashes on no columns",
                        fragment.id
                    )));
                }
            }
            let ids = std::iter::once(fragment.input.id()).chain(fragment.stages.iter().map(|s| s.id));
            for id in ids {
                if !seen_ids.insert(id) {
                    return Err(DistributedError::InvalidPlan(format!(
                        "stage id {} is used twice",
                        id
                    )));
                }
            }
            if let FragmentInput::Exchange { upstream, .. } = &fragment.input {
                if !seen_fragments.contains(upstream) {
                    return Err(DistributedError::InvalidPlan(format!(
                        "fragment {} reads {} which is not defined before it",
                        fragment.id, upstream
                    )));
                }
                if let Some(other) = consumers.insert(*upstream, fragment.id) {
                    return Err(DistributedError::InvalidPlan(format!(
                        "fragment {} is read by both {} and {}",
                        upstream, other, fragment.id
                    )));
                }
            }
            if !seen_fragments.insert(fragment.id) {
                return Err(DistributedError::InvalidPlan(format!(
                    "fragment id {} is used twice",
                    fragment.id
                )));
            }
        }

        let root = self.root().id;
        for fragment in &self.fragments {
            if fragment.id != root && !consumers.contains_key(&fragment.id) {
                return Err(DistributedError::InvalidPlan(format!(
                    "output of fragment {} is never read",
                    fragment.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> Arc<dyn SourceProvider> {
        Arc::new(MemorySourceProvider::new("numbers", vec![vec![]]))
    }

    fn limit(id: u32) -> StageSpec {
        StageSpec::new(StageId(id), "limit", json!({ "limit": 10 }))
    }

    fn two_fragments() -> Vec<FragmentPlan> {
        vec![
            FragmentPlan::source(FragmentId(0), 2, StageId(0), provider()).with_stage(limit(1)),
            FragmentPlan::exchange(FragmentId(1), 1, StageId(2), FragmentId(0)).with_stage(limit(3)),
        ]
    }

    #[test]
    fn test_valid_plan() {
        let plan = QueryPlan::new(two_fragments()).unwrap();
        assert_eq!(plan.root().id, FragmentId(1));
        assert_eq!(plan.consumer_of(FragmentId(0)).unwrap().id, FragmentId(1));
        assert!(plan.consumer_of(FragmentId(1)).is_none());
        assert_eq!(plan.task_count(), 3);
        assert_eq!(plan.fragments()[0].snapshot_ids(), vec![StageId(0), StageId(1)]);
        assert_eq!(plan.root().snapshot_ids(), vec![StageId(3)]);
    }

    #[test]
    fn test_duplicate_stage_ids() {
        let mut fragments = two_fragments();
        fragments[1].stages[0].id = StageId(1);
        assert!(matches!(
            QueryPlan::new(fragments),
            Err(DistributedError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_upstream_must_come_first() {
        let mut fragments = two_fragments();
        fragments.reverse();
        assert!(QueryPlan::new(fragments).is_err());
    }

    #[test]
    fn test_unread_fragment_and_empty_plan() {
        let mut fragments = two_fragments();
        fragments.push(
            FragmentPlan::source(FragmentId(2), 1, StageId(4), provider()).with_stage(limit(5)),
        );
        assert!(QueryPlan::new(fragments).is_err());
        assert!(QueryPlan::new(Vec::new()).is_err());
    }

    #[test]
    fn test_fragment_without_stages() {
        let fragments = vec![FragmentPlan::source(FragmentId(0), 1, StageId(0), provider())];
        assert!(QueryPlan::new(fragments).is_err());
    }

    #[test]
    fn test_memory_provider_partitions() {
        let provider = MemorySourceProvider::new("empty", vec![vec![]]);
        let mut source = provider.open(PartitionId(5)).unwrap();
        assert!(source.next_batch().unwrap().is_none());
        assert_eq!(provider.name(), "empty");
    }
}
