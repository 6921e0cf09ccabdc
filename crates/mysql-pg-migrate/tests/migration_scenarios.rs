//! End-to-end migration scenarios against the in-memory backends.

use std::sync::Arc;

use mysql_pg_migrate::core::{
    ForeignKeyDescriptor, IndexDescriptor, IndexKind, Row, SourceColumn, SourceValue,
};
use mysql_pg_migrate::drivers::{
    Fault, MemoryChunkStore, MemoryPhaseStore, MemorySource, MemoryTable, MemoryTarget, StoreOp,
};
use mysql_pg_migrate::state::{PhaseStore, StateManager};
use mysql_pg_migrate::{
    ChunkStatus, Config, MigrateError, MigrationContext, MigrationReport, Orchestrator, PhaseFlag,
    RunStatus,
};
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
source:
  host: mysql.test
  database: shop
  user: root
target:
  host: pg.test
  database: shop
  user: postgres
migration:
  workers: 4
  ddl_workers: 2
  batch_size: 5000
  read_ahead: 2
  chunk_byte_budget: 5000000
  small_table_threshold: 10000
  max_attempts: 3
  retry_backoff_ms: 1
"#;

/// Shared in-memory backends; every `orchestrator()` call is a fresh process.
#[derive(Default)]
struct Harness {
    source: MemorySource,
    target: MemoryTarget,
    chunks: MemoryChunkStore,
    phases: MemoryPhaseStore,
}

impl Harness {
    fn orchestrator(&self) -> Orchestrator {
        let config = Config::from_yaml(CONFIG).unwrap();
        Orchestrator::with_backends(
            MigrationContext::from_config(&config),
            Arc::new(self.source.clone()),
            Arc::new(self.target.clone()),
            Arc::new(self.chunks.clone()),
            Arc::new(self.phases.clone()),
        )
    }

    async fn run(&self) -> MigrationReport {
        self.orchestrator()
            .run(&CancellationToken::new())
            .await
            .unwrap()
    }
}

fn id_column() -> SourceColumn {
    SourceColumn::new("id", "int", "int(11)").auto_increment()
}

fn text_row(id: i64, rest: &[&str]) -> Row {
    let mut row = vec![SourceValue::text(id.to_string())];
    row.extend(rest.iter().map(|v| SourceValue::text(*v)));
    row
}

/// 250 000 rows of ~100 bytes; with a 5 MB chunk budget that is 5 chunks.
fn orders_table() -> MemoryTable {
    MemoryTable::new(
        "orders",
        vec![id_column(), SourceColumn::new("code", "varchar", "varchar(20)")],
    )
    .index(IndexDescriptor::primary(["id"]))
    .rows(
        (1..=250_000)
            .map(|i| text_row(i, &[&format!("o-{}", i)]))
            .collect(),
    )
}

fn small_table(name: &str) -> MemoryTable {
    MemoryTable::new(name, vec![id_column(), SourceColumn::new("ref_id", "int", "int(11)")])
        .index(IndexDescriptor::primary(["id"]))
        .rows((1..=3).map(|i| text_row(i, &["1"])).collect())
}

#[tokio::test]
async fn test_large_table_transfers_in_five_chunks() {
    let h = Harness::default();
    h.source.add_table(orders_table()).await;

    let report = h.run().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.chunks_total, 5);
    assert_eq!(report.chunks_done, 5);
    assert_eq!(report.chunks_failed, 0);
    assert_eq!(report.rows_transferred, 250_000);
    assert!(report.phases.data_loaded);
    assert!(report.phases.is_complete());

    let rows = h.target.rows("public", "orders").await;
    assert_eq!(rows.len(), 250_000);
    assert!(rows.contains(&"125000\to-125000".to_string()));
}

#[tokio::test]
async fn test_transient_chunk_failure_is_retried() {
    let h = Harness::default();
    h.source.add_table(orders_table()).await;
    // Key 125 000 lives in the third chunk
    h.source
        .fail_reads("orders", 125_000, Fault::Transient, Some(1))
        .await;

    let report = h.run().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.chunks_retried, 1);
    assert_eq!(report.chunks_done, 5);
    assert_eq!(report.chunks_failed, 0);
    assert_eq!(h.target.rows("public", "orders").await.len(), 250_000);
}

#[tokio::test]
async fn test_permanent_chunk_failure_withholds_data_phase() {
    let h = Harness::default();
    h.source.add_table(orders_table()).await;
    h.source
        .fail_reads("orders", 10, Fault::Permanent, Some(1))
        .await;

    let report = h.run().await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.chunks_failed, 1);
    assert_eq!(report.chunk_failures[0].table, "orders");
    assert_eq!(report.chunk_failures[0].index, 0);
    assert!(!report.phases.data_loaded);
    assert!(!report.phases.constraints_applied);
    // No constraint work happens before the data is complete
    assert!(!h
        .target
        .statements()
        .await
        .iter()
        .any(|s| s.contains("PRIMARY KEY")));
}

#[tokio::test]
async fn test_unique_violation_fails_only_that_constraint() {
    let h = Harness::default();
    h.source
        .add_table(
            MemoryTable::new(
                "customers",
                vec![id_column(), SourceColumn::new("email", "varchar", "varchar(100)")],
            )
            .index(IndexDescriptor::primary(["id"]))
            .index(IndexDescriptor::new("uq_email", IndexKind::Unique, ["email"]))
            .rows(vec![text_row(1, &["a@x"]), text_row(2, &["a@x"])]),
        )
        .await;
    h.source
        .add_table(
            MemoryTable::new(
                "products",
                vec![id_column(), SourceColumn::new("sku", "varchar", "varchar(20)")],
            )
            .index(IndexDescriptor::primary(["id"]))
            .index(IndexDescriptor::new("idx_sku", IndexKind::Plain, ["sku"]))
            .rows(vec![text_row(1, &["p1"])]),
        )
        .await;
    h.target
        .fail_statements("UNIQUE (\"email\")", Fault::Permanent, Some(1))
        .await;

    let first = h.run().await;

    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(first.constraints_failed, 1);
    assert_eq!(first.constraint_failures[0].table, "customers");
    assert!(first.phases.data_loaded);
    assert!(!first.phases.constraints_applied);

    let statements = h.target.statements().await;
    assert!(statements
        .iter()
        .any(|s| s.contains("\"products\" ADD CONSTRAINT \"products_pkey\" PRIMARY KEY")));
    assert!(statements
        .iter()
        .any(|s| s.starts_with("CREATE INDEX \"products_idx_sku\"")));

    // After the data is fixed, a re-run only re-enters the constraints phase
    let second = h.run().await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.chunks_transferred, 0);
    assert!(second.phases.constraints_applied);
    assert_eq!(h.target.rows("public", "customers").await.len(), 2);
}

#[tokio::test]
async fn test_resume_never_reloads_done_chunks() {
    let h = Harness::default();
    h.source.add_table(orders_table()).await;
    h.source
        .fail_reads("orders", 200_000, Fault::Exhausted, Some(1))
        .await;

    let first = h.run().await;
    assert_eq!(first.status, RunStatus::Interrupted);
    assert!(!first.phases.data_loaded);
    let done_before = first.chunks_done;
    let reads_before = h.source.reads().await;

    let status = h.orchestrator().status().await.unwrap();
    assert_eq!(status.pool.done, done_before);
    assert_eq!(status.pool.in_progress, 0);

    let second = h.run().await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.resumed_from.as_deref(), Some(first.run_id.as_str()));
    assert_eq!(h.source.reads().await - reads_before, 5 - done_before);
    assert_eq!(second.chunks_transferred, 5 - done_before);

    // Exactly one copy of every row
    assert_eq!(h.target.rows("public", "orders").await.len(), 250_000);
}

#[tokio::test]
async fn test_cancelled_run_stops_before_data() {
    let h = Harness::default();
    h.source.add_table(small_table("items")).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.orchestrator().run(&cancel).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.phases.structure_loaded);
    assert!(!report.phases.data_loaded);
    assert_eq!(h.target.rows("public", "items").await.len(), 0);
}

#[tokio::test]
async fn test_phase_flags_survive_restart() {
    let phases = MemoryPhaseStore::new();
    let chunks = MemoryChunkStore::new();

    let first = StateManager::new(Arc::new(phases.clone()), Arc::new(chunks.clone()));
    first.ensure_state_table("hash-a", "run-1").await.unwrap();
    first.set_phase(PhaseFlag::StructureLoaded).await.unwrap();
    first.set_phase(PhaseFlag::DataLoaded).await.unwrap();
    drop(first);

    let second = StateManager::new(Arc::new(phases.clone()), Arc::new(chunks.clone()));
    let state = second.ensure_state_table("hash-a", "run-2").await.unwrap();
    assert_eq!(state.run_id, "run-1");
    assert!(state.structure_loaded);
    assert!(state.data_loaded);
    assert!(!state.binary_decoded);

    assert!(matches!(
        second.ensure_state_table("hash-b", "run-3").await,
        Err(MigrateError::ConfigChanged)
    ));

    second.reset().await.unwrap();
    assert!(phases.load().await.unwrap().is_none());
    let fresh = second.ensure_state_table("hash-b", "run-3").await.unwrap();
    assert!(!fresh.structure_loaded);
}

#[tokio::test]
async fn test_foreign_keys_follow_dependency_order() {
    let h = Harness::default();
    h.source.add_table(small_table("customers")).await;
    h.source
        .add_table(small_table("orders_fk").foreign_key(ForeignKeyDescriptor::new(
            "fk_customer",
            ["ref_id"],
            "customers",
            ["id"],
        )))
        .await;
    h.source
        .add_table(small_table("a_lines").foreign_key(ForeignKeyDescriptor::new(
            "fk_order",
            ["ref_id"],
            "orders_fk",
            ["id"],
        )))
        .await;
    // left_t <-> right_t form a cycle
    h.source
        .add_table(small_table("left_t").foreign_key(ForeignKeyDescriptor::new(
            "fk_right",
            ["ref_id"],
            "right_t",
            ["id"],
        )))
        .await;
    h.source
        .add_table(small_table("right_t").foreign_key(ForeignKeyDescriptor::new(
            "fk_left",
            ["ref_id"],
            "left_t",
            ["id"],
        )))
        .await;

    let report = h.run().await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.deferred_fk_tables, vec!["left_t", "right_t"]);

    let statements = h.target.statements().await;
    let position = |needle: &str| {
        statements
            .iter()
            .position(|s| s.contains(needle))
            .unwrap_or_else(|| panic!("no statement containing {}", needle))
    };

    let last_pk = statements
        .iter()
        .rposition(|s| s.contains("PRIMARY KEY"))
        .unwrap();
    let first_fk = position("FOREIGN KEY");
    assert!(last_pk < first_fk);

    assert!(position("\"orders_fk_fk_customer\"") < position("\"a_lines_fk_order\""));
    // Cycle members are created after every ordered table, never dropped
    assert!(position("\"a_lines_fk_order\"") < position("\"left_t_fk_right\""));
    assert!(position("\"a_lines_fk_order\"") < position("\"right_t_fk_left\""));
}

#[tokio::test]
async fn test_binary_columns_are_loaded_as_hex_then_decoded() {
    let h = Harness::default();
    h.source
        .add_table(
            MemoryTable::new(
                "files",
                vec![id_column(), SourceColumn::new("body", "blob", "blob")],
            )
            .index(IndexDescriptor::primary(["id"]))
            .rows(vec![vec![
                SourceValue::text("1"),
                SourceValue::Bytes(vec![0x00, 0xff, 0x5c]),
            ]]),
        )
        .await;

    let report = h.run().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.binary_columns_decoded, 1);
    assert_eq!(h.target.rows("public", "files").await, vec!["1\t00ff5c"]);
    assert!(h.target.statements().await.iter().any(|s| s
        == "UPDATE \"public\".\"files\" SET \"body\" = DECODE(ENCODE(\"body\", 'escape'), 'hex')"));
}

fn blob_table(name: &str) -> MemoryTable {
    MemoryTable::new(name, vec![id_column(), SourceColumn::new("body", "blob", "blob")])
        .index(IndexDescriptor::primary(["id"]))
        .rows(vec![vec![
            SourceValue::text("1"),
            SourceValue::Bytes(vec![0x00, 0xff, 0x5c]),
        ]])
}

async fn decode_updates(target: &MemoryTarget, table: &str) -> usize {
    let prefix = format!("UPDATE \"public\".\"{}\"", table);
    target
        .statements()
        .await
        .iter()
        .filter(|s| s.starts_with(&prefix))
        .count()
}

#[tokio::test]
async fn test_decode_failure_resumes_without_decoding_twice() {
    let h = Harness::default();
    h.source.add_table(blob_table("a_files")).await;
    h.source.add_table(blob_table("b_files")).await;
    // Outlasts every retry of the first run
    h.target
        .fail_statements("UPDATE \"public\".\"b_files\"", Fault::Transient, Some(3))
        .await;

    let err = h
        .orchestrator()
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(&err, MigrateError::Decode { table, .. } if table == "b_files"));
    let message = err.to_string();
    assert!(message.contains("b_files"));
    assert!(!message.contains("UPDATE"));
    assert_eq!(decode_updates(&h.target, "a_files").await, 1);
    assert_eq!(decode_updates(&h.target, "b_files").await, 0);

    let second = h.run().await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.binary_columns_decoded, 1);
    assert_eq!(decode_updates(&h.target, "a_files").await, 1);
    assert_eq!(decode_updates(&h.target, "b_files").await, 1);
    assert_eq!(h.target.rows("public", "a_files").await, vec!["1\t00ff5c"]);
    assert_eq!(h.target.rows("public", "b_files").await, vec!["1\t00ff5c"]);
}

#[tokio::test]
async fn test_transient_decode_failure_is_retried() {
    let h = Harness::default();
    h.source.add_table(blob_table("a_files")).await;
    h.source.add_table(blob_table("b_files")).await;
    h.target
        .fail_statements("UPDATE \"public\".\"b_files\"", Fault::Transient, Some(1))
        .await;

    let report = h.run().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.binary_columns_decoded, 2);
    assert_eq!(decode_updates(&h.target, "a_files").await, 1);
    assert_eq!(decode_updates(&h.target, "b_files").await, 1);
}

#[tokio::test]
async fn test_unreleasable_chunk_is_requeued_by_next_run() {
    let h = Harness::default();
    h.source.add_table(orders_table()).await;
    h.target.fail_loads("orders", Fault::Exhausted, Some(1)).await;
    h.chunks
        .fail_operations(StoreOp::Release, Fault::Transient, Some(1))
        .await;

    let first = h.run().await;
    assert_eq!(first.status, RunStatus::Interrupted);
    assert!(!first.phases.data_loaded);

    let status = h.orchestrator().status().await.unwrap();
    assert_eq!(status.pool.in_progress, 1);
    assert_eq!(status.pool.failed, 0);

    let second = h.run().await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(h.target.rows("public", "orders").await.len(), 250_000);
}

#[tokio::test]
async fn test_store_failure_stops_every_worker() {
    let h = Harness::default();
    h.source.add_table(orders_table()).await;
    h.chunks
        .fail_operations(StoreOp::MarkDone, Fault::Permanent, Some(1))
        .await;

    let result = h.orchestrator().run(&CancellationToken::new()).await;
    assert!(result.is_err());

    // Four workers hold four chunks when the first completion fails; the
    // fifth is never claimed
    let chunks = h.chunks.chunks().await;
    assert_eq!(chunks.len(), 5);
    let pending = chunks
        .iter()
        .filter(|c| c.status == ChunkStatus::Pending)
        .count();
    assert!(pending >= 1);
    assert!(chunks.iter().filter(|c| c.status == ChunkStatus::Done).count() <= 3);
}

#[tokio::test]
async fn test_every_row_lands_exactly_once_across_chunk_kinds() {
    let h = Harness::default();
    // Composite primary key: split into row windows
    h.source
        .add_table(
            MemoryTable::new(
                "events",
                vec![
                    SourceColumn::new("tenant", "varchar", "varchar(8)"),
                    SourceColumn::new("seq", "int", "int(11)"),
                ],
            )
            .index(IndexDescriptor::primary(["tenant", "seq"]))
            .rows(
                (0..120_000)
                    .map(|i| {
                        vec![
                            SourceValue::text(format!("t{:02}", i / 10_000)),
                            SourceValue::text((i % 10_000).to_string()),
                        ]
                    })
                    .collect(),
            ),
        )
        .await;
    // Odd keys only: split into key ranges over a sparse key space
    h.source
        .add_table(
            MemoryTable::new(
                "sparse",
                vec![id_column(), SourceColumn::new("code", "varchar", "varchar(20)")],
            )
            .index(IndexDescriptor::primary(["id"]))
            .rows(
                (0..120_000)
                    .map(|i| text_row(2 * i + 1, &[&format!("s-{}", 2 * i + 1)]))
                    .collect(),
            ),
        )
        .await;

    let report = h.run().await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.chunks_total, 6);

    let mut events = h.target.rows("public", "events").await;
    let mut expected: Vec<String> = (0..120_000)
        .map(|i| format!("t{:02}\t{}", i / 10_000, i % 10_000))
        .collect();
    events.sort();
    expected.sort();
    assert_eq!(events, expected);

    let mut sparse = h.target.rows("public", "sparse").await;
    let mut expected: Vec<String> = (0..120_000)
        .map(|i| format!("{}\ts-{}", 2 * i + 1, 2 * i + 1))
        .collect();
    sparse.sort();
    expected.sort();
    assert_eq!(sparse, expected);
}
