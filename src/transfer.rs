//! Import, export and space diagnostics.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use rusqlite::Connection as SqliteConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::Cipher;
use crate::db;
use crate::envelope::prepare_record_for_store;
use crate::error::{Result, StoreError};
use crate::models::{CompleteJobApplication, Record, field, new_id, now_timestamp, to_record};
use crate::repository::{Store, insert_failure, load_all, validate_job_application};
use crate::schema::{SCHEMA_VERSION, Table};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableUsage {
    pub table: Table,
    pub records: usize,
    /// Size of the decrypted records serialized as JSON.
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub tables: Vec<TableUsage>,
    pub total_records: usize,
    pub total_bytes: usize,
}

/// The whole store as nested job applications, keyed by their ids at
/// export time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub format_version: u32,
    pub schema_version: u32,
    pub exported_at: String,
    pub job_applications: BTreeMap<String, CompleteJobApplication>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// Snapshot id to the id the job application was stored under.
    pub id_map: BTreeMap<String, String>,
    pub records: BTreeMap<Table, usize>,
}

impl ImportSummary {
    pub fn total(&self) -> usize {
        self.records.values().sum()
    }
}

impl Store {
    /// Every record of `table`, decrypted.
    pub async fn export_table(&self, table: Table) -> Result<Vec<Record>> {
        let cipher = self.cipher().await;
        let records = self
            .run(move |conn| load_all(conn, table, cipher.as_deref()))
            .await?;
        tracing::debug!(table = %table, records = records.len(), "Exported table");
        Ok(records)
    }

    /// Upsert `records` by id in one transaction. Missing ids and
    /// timestamps are generated. Parents are not checked; job applications
    /// must be complete and get their url canonicalized.
    pub async fn import_table(&self, table: Table, records: Vec<Record>) -> Result<usize> {
        let cipher = self.cipher().await;
        let imported = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let mut imported = 0;
                for record in records {
                    let mut record = fill_identity(record);
                    if table == Table::JobApplications {
                        record = validate_job_application(record)?;
                    }
                    let stored = prepare_record_for_store(table, &record, cipher.as_deref())?;
                    db::upsert(&tx, table, &stored).map_err(|e| insert_failure(table, e))?;
                    imported += 1;
                }
                tx.commit()?;
                Ok(imported)
            })
            .await?;
        tracing::info!(table = %table, records = imported, "Imported table");
        Ok(imported)
    }

    /// Per-table record counts and decrypted JSON size. A table that cannot
    /// be read is reported as empty.
    pub async fn get_space_usage(&self) -> SpaceUsage {
        let mut tables = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            let measured = self
                .export_table(table)
                .await
                .and_then(|records| measure(&records));
            let (records, bytes) = match measured {
                Ok(usage) => usage,
                Err(e) => {
                    tracing::warn!(table = %table, error = %e, "Skipping table in space usage");
                    (0, 0)
                }
            };
            tables.push(TableUsage {
                table,
                records,
                bytes,
            });
        }

        SpaceUsage {
            total_records: tables.iter().map(|t| t.records).sum(),
            total_bytes: tables.iter().map(|t| t.bytes).sum(),
            tables,
        }
    }

    pub async fn export_database(&self) -> Result<DatabaseSnapshot> {
        let applications = self.get_all_job_applications().await?;
        let complete = try_join_all(
            applications
                .iter()
                .map(|application| self.get_complete_job_application(&application.id)),
        )
        .await?;

        let snapshot = DatabaseSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version: self.schema_version().await?,
            exported_at: now_timestamp(),
            job_applications: complete
                .into_iter()
                .map(|c| (c.job_application.id.clone(), c))
                .collect(),
        };
        tracing::info!(
            job_applications = snapshot.job_applications.len(),
            "Exported database"
        );
        Ok(snapshot)
    }

    /// Replace the whole store with `snapshot`, in one transaction.
    ///
    /// Job applications get fresh ids and their direct children are
    /// re-parented. Section ids are kept, so nested rows still find their
    /// parents.
    pub async fn import_database(&self, snapshot: DatabaseSnapshot) -> Result<ImportSummary> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(StoreError::Validation(format!(
                "Unsupported snapshot format {}",
                snapshot.format_version
            )));
        }
        if snapshot.schema_version > SCHEMA_VERSION {
            return Err(StoreError::Configuration(format!(
                "Snapshot schema version {} is newer than supported version {SCHEMA_VERSION}",
                snapshot.schema_version
            )));
        }

        let cipher = self.cipher().await;
        let summary = self
            .run(move |conn| restore_snapshot(conn, snapshot, cipher.as_deref()))
            .await?;
        tracing::info!(
            job_applications = summary.id_map.len(),
            records = summary.total(),
            "Imported database"
        );
        Ok(summary)
    }
}

fn fill_identity(mut record: Record) -> Record {
    if field(&record, "id").is_none() {
        record.insert("id".to_string(), Value::String(new_id()));
    }
    let created_at = match field(&record, "created_at") {
        Some(created_at) => created_at.to_string(),
        None => {
            let now = now_timestamp();
            record.insert("created_at".to_string(), Value::String(now.clone()));
            now
        }
    };
    if field(&record, "updated_at").is_none() {
        record.insert("updated_at".to_string(), Value::String(created_at));
    }
    record
}

fn measure(records: &[Record]) -> Result<(usize, usize)> {
    let mut bytes = 0;
    for record in records {
        bytes += serde_json::to_vec(record)?.len();
    }
    Ok((records.len(), bytes))
}

/// Raw storage failures inside an all-or-nothing import are reported as
/// transaction failures.
fn in_transaction(err: StoreError) -> StoreError {
    match err {
        StoreError::Storage(reason) | StoreError::Insert { reason, .. } => {
            StoreError::Transaction(reason)
        }
        other => other,
    }
}

fn write_record(
    conn: &SqliteConnection,
    table: Table,
    record: &Record,
    cipher: Option<&Cipher>,
) -> Result<()> {
    let stored = prepare_record_for_store(table, record, cipher)?;
    db::insert(conn, table, &stored).map_err(in_transaction)
}

fn restore_snapshot(
    conn: &mut SqliteConnection,
    snapshot: DatabaseSnapshot,
    cipher: Option<&Cipher>,
) -> Result<ImportSummary> {
    let tx = conn
        .transaction()
        .map_err(|e| StoreError::Transaction(e.to_string()))?;

    for table in Table::ALL.into_iter().rev() {
        db::delete_all(&tx, table).map_err(|e| StoreError::Transaction(e.to_string()))?;
    }

    let mut records: BTreeMap<Table, usize> = Table::ALL.into_iter().map(|t| (t, 0)).collect();
    let mut id_map = BTreeMap::new();

    for (original_id, complete) in snapshot.job_applications {
        let job_id = new_id();
        let mut root = validate_job_application(to_record(&complete.job_application)?)?;
        root.insert("id".to_string(), Value::String(job_id.clone()));
        write_record(&tx, Table::JobApplications, &root, cipher)?;
        *records.entry(Table::JobApplications).or_default() += 1;

        for (table, rows) in complete.sections {
            if table == Table::JobApplications {
                continue;
            }
            let reparent = table
                .foreign_key()
                .filter(|fk| fk.parent == Table::JobApplications);
            for mut row in rows {
                if let Some(fk) = reparent {
                    row.insert(fk.field.to_string(), Value::String(job_id.clone()));
                }
                write_record(&tx, table, &row, cipher)?;
                *records.entry(table).or_default() += 1;
            }
        }
        id_map.insert(original_id, job_id);
    }

    tx.commit()
        .map_err(|e| StoreError::Transaction(e.to_string()))?;
    Ok(ImportSummary { id_map, records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobApplication, NewJobApplication};
    use crate::relations::tests::populate_every_section;
    use serde_json::json;

    async fn create_job(store: &Store, url: &str) -> JobApplication {
        store
            .create_job_application(NewJobApplication::new(url, "Engineer", "Acme"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_table_export_import_round_trip() {
        let source = Store::open_in_memory().await.unwrap();
        let job = create_job(&source, "https://x.example/job/1").await;
        populate_every_section(&source, &job.id).await;

        let target = Store::open_in_memory().await.unwrap();
        for table in Table::ALL {
            let exported = source.export_table(table).await.unwrap();
            let count = exported.len();
            assert_eq!(target.import_table(table, exported.clone()).await.unwrap(), count);
            // Importing the same export again changes nothing.
            target.import_table(table, exported.clone()).await.unwrap();
            assert_eq!(target.export_table(table).await.unwrap(), exported);
        }

        let copied = target.get_complete_job_application(&job.id).await.unwrap();
        assert_eq!(copied.section(Table::SkillAssessments).len(), 2);
    }

    #[tokio::test]
    async fn test_import_table_generates_missing_identity() {
        let store = Store::open_in_memory().await.unwrap();
        let record = to_record(&json!({"job_application_id": "j1", "name": "Ada"})).unwrap();
        store.import_table(Table::KeyContacts, vec![record]).await.unwrap();

        let exported = store.export_table(Table::KeyContacts).await.unwrap();
        assert_eq!(exported.len(), 1);
        let created_at = field(&exported[0], "created_at").unwrap();
        assert_eq!(field(&exported[0], "updated_at"), Some(created_at));
        assert!(field(&exported[0], "id").is_some());
    }

    #[tokio::test]
    async fn test_import_table_collision_writes_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        let existing = create_job(&store, "https://x.example/job/1").await;

        let mut fresh = to_record(&existing).unwrap();
        fresh.insert("id".to_string(), json!("fresh"));
        fresh.insert("canonical_url".to_string(), json!("https://x.example/job/2"));
        let mut colliding = to_record(&existing).unwrap();
        colliding.insert("id".to_string(), json!("other"));

        let result = store
            .import_table(Table::JobApplications, vec![fresh, colliding])
            .await;
        assert!(matches!(
            result,
            Err(StoreError::UniqueConstraint {
                field: "canonical_url",
                ..
            })
        ));
        assert_eq!(store.get_all_job_applications().await.unwrap(), vec![existing]);
    }

    #[tokio::test]
    async fn test_import_table_rejects_incomplete_job_applications() {
        let store = Store::open_in_memory().await.unwrap();
        let existing = create_job(&store, "https://x.example/job/1").await;

        let mut valid = to_record(&existing).unwrap();
        valid.insert("id".to_string(), json!("valid"));
        valid.insert(
            "canonical_url".to_string(),
            json!("https://x.example/job/2?utm_source=feed"),
        );
        let bad_status = to_record(&json!({
            "id": "a",
            "canonical_url": "https://x.example/job/3",
            "job_title": "Engineer",
            "company_name": "Acme",
            "status": "ghosted"
        }))
        .unwrap();
        let no_title = to_record(&json!({
            "id": "b",
            "canonical_url": "https://x.example/job/4",
            "company_name": "Acme",
            "status": "saved"
        }))
        .unwrap();

        for bad in [bad_status, no_title] {
            let result = store
                .import_table(Table::JobApplications, vec![valid.clone(), bad])
                .await;
            assert!(matches!(result, Err(StoreError::Validation(_))));
        }
        assert_eq!(store.get_all_job_applications().await.unwrap(), vec![existing]);

        store
            .import_table(Table::JobApplications, vec![valid])
            .await
            .unwrap();
        let imported = store
            .check_job_application_exists("https://x.example/job/2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(imported.id, "valid");
        assert_eq!(imported.canonical_url, "https://x.example/job/2");
        assert_eq!(store.export_database().await.unwrap().job_applications.len(), 2);
    }

    #[tokio::test]
    async fn test_space_usage_counts_records() {
        let store = Store::open_in_memory().await.unwrap();
        let empty = store.get_space_usage().await;
        assert_eq!(empty.tables.len(), 18);
        assert_eq!(empty.total_records, 0);
        assert_eq!(empty.total_bytes, 0);

        let job = create_job(&store, "https://x.example/job/1").await;
        populate_every_section(&store, &job.id).await;

        let usage = store.get_space_usage().await;
        assert_eq!(usage.total_records, 1 + 16 + 2);
        let skills = usage
            .tables
            .iter()
            .find(|t| t.table == Table::SkillAssessments)
            .unwrap();
        assert_eq!(skills.records, 2);
        assert!(skills.bytes > 0);
        assert_eq!(usage.total_bytes, usage.tables.iter().map(|t| t.bytes).sum::<usize>());
    }

    #[tokio::test]
    async fn test_space_usage_skips_unreadable_tables() {
        let store = Store::open_in_memory().await.unwrap();
        let job = create_job(&store, "https://x.example/job/1").await;
        store.enable_encryption("correct horse battery").await.unwrap();
        store
            .save_section_data(
                Table::OfferDetails,
                to_record(&json!({"job_application_id": job.id, "base_salary": 1})).unwrap(),
            )
            .await
            .unwrap();
        store.disable_encryption().await;

        let usage = store.get_space_usage().await;
        let offers = usage
            .tables
            .iter()
            .find(|t| t.table == Table::OfferDetails)
            .unwrap();
        assert_eq!((offers.records, offers.bytes), (0, 0));
        assert_eq!(usage.total_records, 1);
    }

    #[tokio::test]
    async fn test_database_snapshot_round_trip() {
        let source = Store::open_in_memory().await.unwrap();
        let first = create_job(&source, "https://x.example/job/1").await;
        let second = create_job(&source, "https://x.example/job/2").await;
        populate_every_section(&source, &first.id).await;
        populate_every_section(&source, &second.id).await;

        let snapshot = source.export_database().await.unwrap();
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.job_applications.len(), 2);

        // Through JSON, the way the CLI writes it.
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: DatabaseSnapshot = serde_json::from_str(&json).unwrap();

        let target = Store::open_in_memory().await.unwrap();
        create_job(&target, "https://x.example/stale").await;
        let summary = target.import_database(parsed).await.unwrap();
        assert_eq!(summary.id_map.len(), 2);
        assert_eq!(summary.total(), 2 * (1 + 16 + 2));

        let imported = target.get_all_job_applications().await.unwrap();
        assert_eq!(imported.len(), 2);
        assert!(target
            .check_job_application_exists("https://x.example/stale")
            .await
            .unwrap()
            .is_none());

        for (original_id, original) in &snapshot.job_applications {
            let new_id = &summary.id_map[original_id];
            assert_ne!(new_id, original_id);

            let restored = target.get_complete_job_application(new_id).await.unwrap();
            assert_eq!(restored.record_counts(), original.record_counts());
            assert_eq!(
                restored.job_application.canonical_url,
                original.job_application.canonical_url
            );
            assert_eq!(
                restored.job_application.created_at,
                original.job_application.created_at
            );
            for record in restored.section(Table::CompanyInformation) {
                assert_eq!(field(record, "job_application_id"), Some(new_id.as_str()));
            }
        }
    }

    #[tokio::test]
    async fn test_encrypted_snapshot_round_trip() {
        let passphrase = "correct horse battery";
        let source = Store::open_in_memory().await.unwrap();
        source.enable_encryption(passphrase).await.unwrap();
        let job = create_job(&source, "https://x.example/job/1").await;
        populate_every_section(&source, &job.id).await;
        let snapshot = source.export_database().await.unwrap();

        let target = Store::open_in_memory().await.unwrap();
        target.enable_encryption(passphrase).await.unwrap();
        let summary = target.import_database(snapshot.clone()).await.unwrap();
        assert_eq!(summary.total(), 1 + 16 + 2);
        let new_id = &summary.id_map[&job.id];

        let sealed_rows = target
            .run(|conn| {
                let mut sealed = 0;
                for table in Table::ALL {
                    let sql = format!("SELECT COUNT(*) FROM {} WHERE encrypted = 1", table.name());
                    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                    sealed += count;
                }
                Ok(sealed)
            })
            .await
            .unwrap();
        assert_eq!(sealed_rows, 1 + 16 + 2);

        // Every row decrypts under its new id.
        for table in Table::ALL {
            target.export_table(table).await.unwrap();
        }
        let restored = target.get_complete_job_application(new_id).await.unwrap();
        assert_eq!(
            restored.record_counts(),
            snapshot.job_applications[&job.id].record_counts()
        );
        for record in restored.section(Table::OfferDetails) {
            assert_eq!(field(record, "notes"), Some("offer_details notes"));
        }

        target.disable_encryption().await;
        assert!(matches!(
            target.get_complete_job_application(new_id).await,
            Err(StoreError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_database_import_keeps_existing_data() {
        let store = Store::open_in_memory().await.unwrap();
        let job = create_job(&store, "https://x.example/job/1").await;
        populate_every_section(&store, &job.id).await;

        let mut snapshot = store.export_database().await.unwrap();
        let mut duplicate = snapshot.job_applications[&job.id].clone();
        duplicate.sections.clear();
        snapshot.job_applications.insert("copy".to_string(), duplicate);

        let result = store.import_database(snapshot).await;
        assert!(matches!(result, Err(StoreError::UniqueConstraint { .. })));

        let complete = store.get_complete_job_application(&job.id).await.unwrap();
        assert_eq!(complete.section(Table::SkillAssessments).len(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_snapshot_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let mut snapshot = store.export_database().await.unwrap();
        snapshot.format_version = 99;
        assert!(matches!(
            store.import_database(snapshot).await,
            Err(StoreError::Validation(_))
        ));
    }
}
