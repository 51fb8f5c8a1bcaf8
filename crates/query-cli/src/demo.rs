use anyhow::{bail, Result};
use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use colored::Colorize;
use query_core::{FragmentId, PartitionId, QueryId, StageId, TaskLocation};
use query_distributed::{
    DefaultExchangeClientSupplier, DistributedExecutor, FileSnapshotStore, FragmentPlan,
    InMemorySnapshotStore, MemorySourceProvider, QueryPlan, SnapshotStore,
};
use query_executor::{StageSpec, StageUnitRegistry};
use query_server::{LocalQueryManager, QueryRegistry, ResultsPage, Session};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use crate::config::Config;

/// Shape of the generated numbers query
#[derive(Debug, Clone, Copy)]
pub struct NumbersQuery {
    pub rows: u64,
    pub partitions: u32,
    pub batch_rows: u64,
}

impl NumbersQuery {
    /// Sum of `1..=rows`
    pub fn expected_total(&self) -> i64 {
        let n = self.rows as i64;
        n * (n + 1) / 2
    }

    /// Two fragments: partitioned number sources feeding a single summing root
    pub fn plan(&self) -> Result<QueryPlan> {
        if self.partitions == 0 || self.batch_rows == 0 {
            bail!("partitions and batch rows must be positive");
        }
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        let mut partitions = vec![Vec::new(); self.partitions as usize];
        let mut next = 1i64;
        let mut index = 0usize;
        while next <= self.rows as i64 {
            let end = (next + self.batch_rows as i64 - 1).min(self.rows as i64);
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(Int64Array::from_iter_values(next..=end))],
            )?;
            let target = index % partitions.len();
            partitions[target].push(batch);
            index += 1;
            next = end + 1;
        }

        // partial sums per source partition, summed again at the root
        let sum = |id| {
            StageSpec::new(
                StageId(id),
                "aggregation",
                json!({ "aggregates": [{ "function": "sum", "column": 0, "name": "total" }] }),
            )
        };
        let plan = QueryPlan::new(vec![
            FragmentPlan::source(
                FragmentId(0),
                self.partitions,
                StageId(0),
                Arc::new(MemorySourceProvider::new("numbers", partitions)),
            )
            .with_stage(sum(1)),
            FragmentPlan::exchange(FragmentId(1), 1, StageId(2), FragmentId(0)).with_stage(sum(3)),
        ])?;
        Ok(plan)
    }
}

pub fn snapshot_store(config: &Config) -> Result<Arc<dyn SnapshotStore>> {
    Ok(match &config.snapshot_dir {
        Some(dir) => {
            tracing::info!("Keeping snapshots under {}", dir.display());
            Arc::new(FileSnapshotStore::new(dir.clone())?)
        }
        None => Arc::new(InMemorySnapshotStore::new()),
    })
}

pub fn build_executor(config: &Config) -> Result<Arc<DistributedExecutor>> {
    Ok(DistributedExecutor::new(
        config.executor.clone(),
        Arc::new(StageUnitRegistry::with_builtins()),
        snapshot_store(config)?,
    ))
}

fn print_page(page: &ResultsPage) {
    let results = &page.results;
    if !page.session.is_empty() {
        println!("{} {:?}", "session:".bright_black(), page.session);
    }
    if let Some(columns) = &results.columns {
        if results.data.is_some() {
            let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
            println!("{}", names.join(" | ").bold());
        }
    }
    for row in results.data.iter().flatten() {
        let cells: Vec<String> = row.iter().map(|value| value.to_string()).collect();
        println!("{}", cells.join(" | "));
    }
    if results.stats.recovering {
        println!(
            "{}",
            format!("query {} is recovering", results.id).bright_yellow()
        );
    }
}

/// Follow a query's pages from token 0 until the last one; returns the last page
pub async fn follow(
    registry: &QueryRegistry,
    query_id: QueryId,
    slug: &str,
    base: &Url,
) -> Result<ResultsPage> {
    let mut token = 0u64;
    loop {
        let page = registry
            .wait_for_results(query_id, slug, token, None, None, base)
            .await?;
        print_page(&page);
        match &page.results.next_uri {
            Some(uri) => {
                token = uri
                    .rsplit('/')
                    .next()
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(token);
            }
            None => return Ok(page),
        }
    }
}

/// Run the numbers query in-process and print its pages as a client would see them
pub async fn run_demo(config: Config, query: NumbersQuery, kill_after: Option<Duration>) -> Result<()> {
    let executor = build_executor(&config)?;
    let cancel = tokio_util::sync::CancellationToken::new();
    let checkpointing = executor.start_checkpointing(cancel.clone());

    let manager = Arc::new(LocalQueryManager::new(
        executor.clone(),
        Duration::from_millis(config.server.query_retention_ms),
    ));
    let (query_id, slug) = manager.submit(query.plan()?, Session::new("demo"))?;
    println!("{} {}", "query:".bright_green(), query_id);

    if let Some(delay) = kill_after {
        let executor = executor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let task = TaskLocation::new(FragmentId(0), PartitionId(0));
            match executor.kill_task(query_id, task) {
                Ok(()) => println!("{}", format!("killed task {}", task).bright_red()),
                Err(e) => println!("{}", format!("could not kill task {}: {}", task, e).bright_black()),
            }
        });
    }

    let registry = QueryRegistry::new(
        manager.clone(),
        Arc::new(DefaultExchangeClientSupplier::default()),
        config.server.clone(),
    );
    let base = Url::parse(&format!("http://{}", config.server.bind_address))?;
    let started = Instant::now();
    let last = follow(&registry, query_id, &slug, &base).await?;

    let execution = manager.execution(query_id)?;
    let stats = execution.stats();
    match &last.results.error {
        Some(error) => println!(
            "{} {} ({})",
            "failed:".bright_red(),
            error.message,
            error.error_name
        ),
        None => println!(
            "{} expected total {} in {:?}, {} attempt(s), {} recover(ies)",
            "finished:".bright_green(),
            query.expected_total(),
            started.elapsed(),
            stats.attempts,
            stats.recoveries
        ),
    }

    registry.stop().await;
    cancel.cancel();
    if let Some(handle) = checkpointing {
        let _ = handle.await;
    }
    executor.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_distributed::QueryStatus;

    #[test]
    fn test_plan_spreads_batches() {
        let query = NumbersQuery {
            rows: 10,
            partitions: 3,
            batch_rows: 3,
        };
        let plan = query.plan().unwrap();
        assert_eq!(plan.fragments().len(), 2);
        assert_eq!(plan.task_count(), 4);
        assert_eq!(query.expected_total(), 55);
        assert!(NumbersQuery {
            partitions: 0,
            ..query
        }
        .plan()
        .is_err());
    }

    #[tokio::test]
    async fn test_follow_reads_total() {
        let config = Config::default();
        let executor = build_executor(&config).unwrap();
        let manager = Arc::new(LocalQueryManager::new(executor, Duration::from_secs(60)));
        let query = NumbersQuery {
            rows: 100,
            partitions: 2,
            batch_rows: 7,
        };
        let (query_id, slug) = manager.submit(query.plan().unwrap(), Session::new("t")).unwrap();
        let registry = QueryRegistry::new(
            manager.clone(),
            Arc::new(DefaultExchangeClientSupplier::default()),
            config.server.clone(),
        );
        let base = Url::parse("http://localhost:8080").unwrap();

        let mut token = 0;
        let mut rows = Vec::new();
        loop {
            let page = registry
                .wait_for_results(query_id, &slug, token, None, None, &base)
                .await
                .unwrap();
            rows.extend(page.results.data.clone().unwrap_or_default());
            match page.results.next_uri {
                Some(uri) => token = uri.rsplit('/').next().unwrap().parse().unwrap(),
                None => break,
            }
        }
        assert_eq!(rows, vec![vec![json!(5050)]]);
        assert_eq!(
            manager.execution(query_id).unwrap().status(),
            QueryStatus::Finished
        );
        registry.stop().await;
    }
}
