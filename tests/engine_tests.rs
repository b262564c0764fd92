use anyhow::Result;
use bigquery_bridge::client::{
    fields_to_schema, DatasetName, FieldMode, FieldType, InMemoryWarehouse, MemoryConnector,
    TableFieldSchema, TableKind, TableResource,
};
use bigquery_bridge::{AccessMode, BigqueryEngine, BigqueryError, BigqueryOptions, Credentials};
use datafusion::arrow::array::{Array, BooleanArray, Int64Array, RecordBatch, StringArray, UInt64Array};
use std::sync::Arc;

fn engine_with(mode: AccessMode) -> Result<(Arc<InMemoryWarehouse>, Arc<MemoryConnector>, BigqueryEngine)> {
    let warehouse = Arc::new(InMemoryWarehouse::new());
    warehouse.seed_dataset(DatasetName::new("p", "ds"));
    let connector = Arc::new(MemoryConnector::new(warehouse.clone()));
    let engine = BigqueryEngine::builder().connector(connector.clone()).build()?;
    engine.attach(
        "db1",
        BigqueryOptions::new("p").with_access_mode(mode),
        Credentials::ApplicationDefault,
    )?;
    Ok((warehouse, connector, engine))
}

fn seed_people(warehouse: &InMemoryWarehouse) {
    let fields = vec![
        TableFieldSchema::new("id", FieldType::Int64).with_mode(FieldMode::Required),
        TableFieldSchema::new("name", FieldType::String),
    ];
    let schema = Arc::new(fields_to_schema(&fields));
    let batches = (0..3)
        .map(|b| {
            let ids: Vec<i64> = (0..4).map(|r| b * 4 + r).collect();
            let names: Vec<Option<String>> = ids
                .iter()
                .map(|i| if i % 5 == 0 { None } else { Some(format!("n{i}")) })
                .collect();
            RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(Int64Array::from(ids)),
                    Arc::new(StringArray::from(names)),
                ],
            )
            .unwrap()
        })
        .collect();
    warehouse.seed_table(
        TableResource {
            name: DatasetName::new("p", "ds").table("people"),
            kind: TableKind::Table,
            fields,
            primary_key: vec!["id".to_string()],
            view_query: None,
        },
        batches,
    );
}

fn int64_column(batches: &[RecordBatch], index: usize) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|b| {
            b.column(index)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .values()
                .to_vec()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_create_table_on_read_write_transaction() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;

    let response = engine
        .execute_query("SELECT * FROM bigquery_execute('db1', 'CREATE TABLE t1 (a INT64)')")
        .await?;

    assert_eq!(response.schema.field(0).name(), "success");
    assert_eq!(response.results.len(), 1);
    let success = response.results[0]
        .column(0)
        .as_any()
        .downcast_ref::<BooleanArray>()
        .unwrap();
    assert_eq!(success.len(), 1);
    assert!(success.value(0));
    assert_eq!(
        warehouse.executed_queries(),
        vec!["CREATE TABLE t1 (a INT64)".to_string()]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_on_read_only_transaction_issues_no_job() -> Result<()> {
    let (warehouse, connector, engine) = engine_with(AccessMode::ReadOnly)?;

    let err = engine
        .execute_query("SELECT * FROM bigquery_execute('db1', 'CREATE TABLE t1 (a INT64)')")
        .await
        .err()
        .expect("read-only execute must fail");

    assert!(err.to_string().contains("permission denied"), "{err}");
    assert_eq!(warehouse.calls().insert_job, 0);
    assert_eq!(warehouse.calls().total(), 0);
    assert_eq!(connector.connect_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_binding_errors() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;

    let err = engine
        .execute_query("SELECT * FROM bigquery_execute('nope', 'SELECT 1')")
        .await
        .err()
        .expect("unknown database");
    assert!(err
        .to_string()
        .contains("Failed to find attached database \"nope\""));

    let err = engine
        .execute_query("SELECT * FROM bigquery_execute('datafusion', 'SELECT 1')")
        .await
        .err()
        .expect("default catalog is not a warehouse database");
    assert!(err
        .to_string()
        .contains("Database \"datafusion\" is not a BigQuery database"));

    assert_eq!(warehouse.calls().total(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_job_surfaces_remote_message() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;
    warehouse.fail_jobs_matching("DROP", "notFound", "Not found: Table p:ds.gone");

    let err = engine
        .execute_query("SELECT * FROM bigquery_execute('db1', 'DROP TABLE ds.gone')")
        .await
        .err()
        .expect("job failure");
    assert!(err.to_string().contains("Not found: Table p:ds.gone"), "{err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_select_reapplies_filters_and_projection() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;
    seed_people(&warehouse);

    let response = engine
        .execute_query("SELECT id, name FROM db1.ds.people WHERE id >= 6 ORDER BY id")
        .await?;
    assert_eq!(int64_column(&response.results, 0), vec![6, 7, 8, 9, 10, 11]);
    assert_eq!(warehouse.calls().create_read_session, 1);

    let response = engine
        .execute_query("SELECT COUNT(*) FROM db1.ds.people WHERE name IS NULL")
        .await?;
    assert_eq!(int64_column(&response.results, 0), vec![3]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_count_star_reads_without_columns() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;
    seed_people(&warehouse);

    let response = engine
        .execute_query("SELECT COUNT(*) FROM db1.ds.people")
        .await?;
    assert_eq!(int64_column(&response.results, 0), vec![12]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_table_metadata_is_cached_across_queries() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;
    seed_people(&warehouse);

    engine.execute_query("SELECT id FROM db1.ds.people").await?;
    engine.execute_query("SELECT name FROM db1.ds.people").await?;
    assert_eq!(warehouse.calls().get_table, 1);
    assert_eq!(warehouse.calls().get_dataset, 1);

    // Passthrough SQL may change anything, so the cache starts over
    engine
        .execute_query("SELECT * FROM bigquery_execute('db1', 'ALTER TABLE ds.people ADD COLUMN x INT64')")
        .await?;
    engine.execute_query("SELECT id FROM db1.ds.people").await?;
    assert_eq!(warehouse.calls().get_table, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_insert_select_drop() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;

    engine
        .execute_query("CREATE TABLE db1.ds.events (id BIGINT, label VARCHAR)")
        .await?;
    assert_eq!(warehouse.calls().insert_table, 1);

    let response = engine
        .execute_query("INSERT INTO db1.ds.events VALUES (1, 'a'), (2, 'b'), (3, NULL)")
        .await?;
    let inserted = response.results[0]
        .column(0)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .unwrap();
    assert_eq!(inserted.value(0), 3);
    assert_eq!(warehouse.calls().batch_commit_write_streams, 1);
    let table = DatasetName::new("p", "ds").table("events");
    assert_eq!(warehouse.table_row_count(&table), 3);

    let response = engine
        .execute_query("SELECT id FROM db1.ds.events ORDER BY id")
        .await?;
    assert_eq!(int64_column(&response.results, 0), vec![1, 2, 3]);

    engine.execute_query("DROP TABLE db1.ds.events").await?;
    assert_eq!(warehouse.calls().delete_table, 1);
    let err = engine
        .execute_query("SELECT id FROM db1.ds.events")
        .await
        .err()
        .expect("dropped table");
    assert!(err.to_string().contains("not found"), "{err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_table_as_select_loads_rows() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;

    engine
        .execute_query("CREATE TABLE db1.ds.copied AS SELECT * FROM (VALUES (1), (2)) AS v(a)")
        .await?;
    let table = DatasetName::new("p", "ds").table("copied");
    assert_eq!(warehouse.table_row_count(&table), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_only_database_rejects_insert_before_any_write() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadOnly)?;
    seed_people(&warehouse);

    let err = engine
        .execute_query("INSERT INTO db1.ds.people VALUES (100, 'x')")
        .await
        .err()
        .expect("read-only insert");
    assert!(err.to_string().contains("permission denied"), "{err}");
    assert_eq!(warehouse.calls().create_write_stream, 0);
    assert_eq!(warehouse.calls().append_rows, 0);

    // Reads are still allowed
    let response = engine
        .execute_query("SELECT COUNT(*) FROM db1.ds.people")
        .await?;
    assert_eq!(int64_column(&response.results, 0), vec![12]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_read_only_transaction() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;

    let tx = engine.begin("db1", Some(AccessMode::ReadOnly))?;
    let sql = "SELECT * FROM bigquery_execute('db1', 'CREATE TABLE t1 (a INT64)')";
    assert!(engine.execute_query(sql).await.is_err());
    // The explicit transaction outlives the statement
    assert!(Arc::ptr_eq(&tx, &engine.transaction("db1")?));

    engine.commit("db1")?;
    engine.execute_query(sql).await?;
    assert_eq!(warehouse.executed_queries().len(), 1);
    assert!(engine.commit("db1").is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_and_drop_schema() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;

    engine.execute_query("CREATE SCHEMA db1.staging").await?;
    assert_eq!(warehouse.calls().insert_dataset, 1);
    let catalog = engine.catalog("db1")?;
    let tx = engine.transaction("db1")?;
    let names: Vec<String> = catalog
        .list_datasets(tx.client().await?)
        .await?
        .iter()
        .map(|d| d.name.dataset_id.clone())
        .collect();
    assert!(names.contains(&"staging".to_string()));

    engine.execute_query("DROP SCHEMA db1.staging").await?;
    assert_eq!(warehouse.calls().delete_dataset, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_attach_and_detach() -> Result<()> {
    let (_warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;
    assert_eq!(engine.attached(), vec!["db1".to_string()]);

    assert!(engine
        .attach("db1", BigqueryOptions::new("p"), Credentials::ApplicationDefault)
        .is_err());
    assert!(engine
        .attach("bad", BigqueryOptions::new(""), Credentials::ApplicationDefault)
        .is_err());

    engine.detach("db1")?;
    assert!(engine.attached().is_empty());
    let err = engine
        .execute_query("SELECT * FROM bigquery_execute('db1', 'SELECT 1')")
        .await
        .err()
        .expect("detached");
    assert!(err.to_string().contains("Failed to find attached database"));
    assert!(engine.detach("db1").is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explain_execute_submits_no_job() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;

    let response = engine
        .execute_query("EXPLAIN SELECT * FROM bigquery_execute('db1', 'CREATE TABLE t1 (a INT64)')")
        .await?;

    assert!(!response.results.is_empty());
    assert!(warehouse.executed_queries().is_empty());
    assert_eq!(warehouse.calls().insert_job, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_only_create_table_never_reaches_warehouse() -> Result<()> {
    let (warehouse, connector, engine) = engine_with(AccessMode::ReadOnly)?;

    let err = engine
        .execute_query("CREATE TABLE db1.ds.x (a BIGINT)")
        .await
        .err()
        .expect("read-only create");
    assert!(err.to_string().contains("permission denied"), "{err}");
    assert_eq!(warehouse.calls().total(), 0);
    assert_eq!(connector.connect_count(), 0);

    let err = engine
        .execute_query("DROP SCHEMA db1.ds")
        .await
        .err()
        .expect("read-only drop schema");
    assert!(err.to_string().contains("permission denied"), "{err}");
    assert_eq!(warehouse.calls().total(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_select_from_view_then_drop_it() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;
    seed_people(&warehouse);
    warehouse.seed_table(
        TableResource {
            name: DatasetName::new("p", "ds").table("first_people"),
            kind: TableKind::View,
            fields: vec![
                TableFieldSchema::new("id", FieldType::Int64).with_mode(FieldMode::Required),
                TableFieldSchema::new("name", FieldType::String),
            ],
            primary_key: vec![],
            view_query: Some("SELECT id, name FROM ds.people WHERE id < 4".to_string()),
        },
        vec![],
    );

    let response = engine
        .execute_query("SELECT id FROM db1.ds.first_people WHERE id > 0 ORDER BY id")
        .await?;
    assert_eq!(int64_column(&response.results, 0), vec![1, 2, 3]);
    assert_eq!(warehouse.calls().create_write_stream, 0);

    engine.execute_query("DROP VIEW db1.ds.first_people").await?;
    let err = engine
        .execute_query("SELECT * FROM db1.ds.first_people")
        .await
        .err()
        .expect("dropped view");
    assert!(err.to_string().contains("not found"), "{err}");

    // The underlying table is untouched
    let response = engine
        .execute_query("SELECT COUNT(*) FROM db1.ds.people")
        .await?;
    assert_eq!(int64_column(&response.results, 0), vec![12]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dataset_lookup_failure_surfaces_transport_error() -> Result<()> {
    let (warehouse, _connector, engine) = engine_with(AccessMode::ReadWrite)?;
    seed_people(&warehouse);
    warehouse.fail_next_metadata(BigqueryError::Transport("connection reset".to_string()));
    warehouse.fail_next_metadata(BigqueryError::Transport("connection reset".to_string()));

    let err = engine
        .execute_query("SELECT * FROM db1.ds.people")
        .await
        .err()
        .expect("transport failure");
    assert!(err.to_string().contains("connection reset"), "{err}");

    // Nothing stale was cached; the next statement succeeds
    let response = engine
        .execute_query("SELECT COUNT(*) FROM db1.ds.people")
        .await?;
    assert_eq!(int64_column(&response.results, 0), vec![12]);
    Ok(())
}
