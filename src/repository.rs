//! The store handle and generic record repository.
//!
//! A [`Store`] owns one `tokio_rusqlite` connection. Each operation ships a
//! closure to the connection thread, so everything inside one closure runs
//! without interleaving with other operations on the same store.

use std::sync::Arc;

use rusqlite::Connection as SqliteConnection;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_rusqlite::Connection;
use zeroize::Zeroizing;

use crate::clip::canonicalize_url;
use crate::config::StoreConfig;
use crate::crypto::{self, Cipher};
use crate::db;
use crate::envelope::{prepare_record_for_store, reconstruct_record_from_store};
use crate::error::{Result, StoreError};
use crate::models::{
    ApplicationStatus, Entity, JobApplication, NewJobApplication, Record, field, from_record,
    new_id, now_timestamp, timestamp_after, to_record,
};
use crate::schema::{self, Table};
use crate::sections::Section;

pub struct Store {
    conn: Connection,
    config: StoreConfig,
    cipher: RwLock<Option<Arc<Cipher>>>,
}

impl Store {
    /// Open (creating if needed) the store at `config.path` and bring its
    /// schema up to date.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        if config.is_in_memory() {
            let conn = Connection::open_in_memory().await?;
            return Self::initialize(conn, config).await;
        }
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Configuration(format!(
                        "Cannot create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(config.path.clone()).await?;
        Self::initialize(conn, config).await
    }

    /// A private in-memory store; data is gone once the handle is dropped.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory()).await
    }

    async fn initialize(conn: Connection, config: StoreConfig) -> Result<Self> {
        let version = conn.call(|conn| Ok(schema::migrate(conn))).await??;
        tracing::info!(
            path = %config.path.display(),
            schema_version = version,
            "Opened store"
        );
        Ok(Self {
            conn,
            config,
            cipher: RwLock::new(None),
        })
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        tracing::debug!(path = %self.config.path.display(), "Closed store");
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn schema_version(&self) -> Result<u32> {
        self.run(|conn| schema::schema_version(conn)).await
    }

    /// Run `f` on the connection thread.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn.call(move |conn| Ok(f(conn))).await?
    }

    pub(crate) async fn cipher(&self) -> Option<Arc<Cipher>> {
        self.cipher.read().await.clone()
    }

    // --- Encryption ---

    /// Turn at-rest encryption on (with `passphrase`) or off.
    pub async fn configure_encryption(&self, enabled: bool, passphrase: Option<&str>) -> Result<()> {
        if !enabled {
            self.disable_encryption().await;
            return Ok(());
        }
        let passphrase = passphrase.ok_or_else(|| {
            StoreError::Validation("A passphrase is required to enable encryption".to_string())
        })?;
        self.enable_encryption(passphrase).await
    }

    /// Derive the key from `passphrase` and the persisted salt. Records
    /// written from now on are sealed.
    pub async fn enable_encryption(&self, passphrase: &str) -> Result<()> {
        crypto::validate_passphrase(passphrase)?;
        crypto::validate_kdf_iterations(self.config.kdf_iterations)?;

        let salt = self.run(|conn| schema::get_or_create_salt(conn)).await?;
        let passphrase = Zeroizing::new(passphrase.to_owned());
        let iterations = self.config.kdf_iterations;
        let key = tokio::task::spawn_blocking(move || {
            crypto::derive_key(&passphrase, &salt, iterations)
        })
        .await
        .map_err(|e| StoreError::Configuration(format!("Key derivation task failed: {e}")))??;

        *self.cipher.write().await = Some(Arc::new(Cipher::new(&key)));
        tracing::info!(iterations, "Encryption enabled");
        Ok(())
    }

    /// Forget the key. Already sealed records stay sealed and become
    /// unreadable until encryption is enabled again.
    pub async fn disable_encryption(&self) {
        self.cipher.write().await.take();
        tracing::info!("Encryption disabled");
    }

    pub async fn is_encryption_enabled(&self) -> bool {
        self.cipher.read().await.is_some()
    }

    // --- Job applications ---

    pub async fn create_job_application(&self, new: NewJobApplication) -> Result<JobApplication> {
        let application = build_job_application(new)?;
        let record = to_record(&application)?;
        let cipher = self.cipher().await;

        self.run(move |conn| {
            let stored =
                prepare_record_for_store(Table::JobApplications, &record, cipher.as_deref())?;
            db::insert(conn, Table::JobApplications, &stored)
                .map_err(|e| insert_failure(Table::JobApplications, e))
        })
        .await?;

        tracing::debug!(
            id = %application.id,
            url = %application.canonical_url,
            "Created job application"
        );
        Ok(application)
    }

    pub async fn get_job_application(&self, id: &str) -> Result<Option<JobApplication>> {
        let record = self.get_section_data(Table::JobApplications, id).await?;
        record.map(from_record).transpose()
    }

    /// The job application already tracking `url`, if any. The url is
    /// canonicalized before the lookup.
    pub async fn check_job_application_exists(&self, url: &str) -> Result<Option<JobApplication>> {
        let key = canonicalize_url(url).unwrap_or_else(|_| url.trim().to_string());
        let cipher = self.cipher().await;
        let mut found = self
            .run(move |conn| {
                load_where(
                    conn,
                    Table::JobApplications,
                    "canonical_url",
                    &key,
                    cipher.as_deref(),
                )
            })
            .await?;
        found.pop().map(from_record).transpose()
    }

    /// Every job application, most recently updated first.
    pub async fn get_all_job_applications(&self) -> Result<Vec<JobApplication>> {
        let cipher = self.cipher().await;
        let records = self
            .run(move |conn| load_all(conn, Table::JobApplications, cipher.as_deref()))
            .await?;
        let mut applications = records
            .into_iter()
            .map(from_record)
            .collect::<Result<Vec<JobApplication>>>()?;
        applications.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(applications)
    }

    pub async fn list_job_applications_by_status(
        &self,
        status: ApplicationStatus,
    ) -> Result<Vec<JobApplication>> {
        let cipher = self.cipher().await;
        let records = self
            .run(move |conn| {
                load_where(
                    conn,
                    Table::JobApplications,
                    "status",
                    status.as_str(),
                    cipher.as_deref(),
                )
            })
            .await?;
        let mut applications = records
            .into_iter()
            .map(from_record)
            .collect::<Result<Vec<JobApplication>>>()?;
        applications.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(applications)
    }

    /// Shallow-merge `partial` into the job application. Concurrent updates
    /// are serialized; see [`Store::update_job_application_checked`] for
    /// detecting stale writers.
    pub async fn update_job_application(&self, id: &str, partial: Record) -> Result<JobApplication> {
        let record = self
            .update_record(Table::JobApplications, id, partial, None)
            .await?;
        from_record(record)
    }

    /// Like [`Store::update_job_application`], but fails `Conflict` unless
    /// the stored `updated_at` equals `expected_updated_at`.
    pub async fn update_job_application_checked(
        &self,
        id: &str,
        partial: Record,
        expected_updated_at: &str,
    ) -> Result<JobApplication> {
        let record = self
            .update_record(
                Table::JobApplications,
                id,
                partial,
                Some(expected_updated_at.to_string()),
            )
            .await?;
        from_record(record)
    }

    // --- Sections ---

    /// Insert a new section record with a generated id and timestamps.
    /// The referenced parent must exist.
    pub async fn save_section_data(&self, table: Table, data: Record) -> Result<Record> {
        if table == Table::JobApplications {
            return Err(StoreError::Validation(
                "Job applications are created with create_job_application".to_string(),
            ));
        }
        let record = stamp_new(data);
        let cipher = self.cipher().await;

        let saved = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                ensure_parent(&tx, table, &record)?;
                let stored = prepare_record_for_store(table, &record, cipher.as_deref())?;
                db::insert(&tx, table, &stored).map_err(|e| insert_failure(table, e))?;
                tx.commit()?;
                Ok(record)
            })
            .await?;

        tracing::debug!(table = %table, id = field(&saved, "id"), "Saved section record");
        Ok(saved)
    }

    pub async fn update_section_data(&self, table: Table, id: &str, partial: Record) -> Result<Record> {
        self.update_record(table, id, partial, None).await
    }

    pub async fn update_section_data_checked(
        &self,
        table: Table,
        id: &str,
        partial: Record,
        expected_updated_at: &str,
    ) -> Result<Record> {
        self.update_record(table, id, partial, Some(expected_updated_at.to_string()))
            .await
    }

    pub async fn get_section_data(&self, table: Table, id: &str) -> Result<Option<Record>> {
        let id = id.to_string();
        let cipher = self.cipher().await;
        self.run(move |conn| load(conn, table, &id, cipher.as_deref()))
            .await
    }

    /// Records of `table` whose foreign key equals `parent_id`. For
    /// `skill_assessments` the parent is a skills matrix row.
    pub async fn get_section_data_by_job_id(&self, table: Table, parent_id: &str) -> Result<Vec<Record>> {
        let fk = table
            .foreign_key()
            .ok_or_else(|| StoreError::Validation(format!("{table} has no parent table")))?;
        let parent_id = parent_id.to_string();
        let cipher = self.cipher().await;
        self.run(move |conn| load_where(conn, table, fk.field, &parent_id, cipher.as_deref()))
            .await
    }

    pub async fn save_section<S: Section>(&self, section: &S) -> Result<Entity<S>> {
        let saved = self.save_section_data(S::TABLE, to_record(section)?).await?;
        from_record(saved)
    }

    pub async fn sections_for<S: Section>(&self, parent_id: &str) -> Result<Vec<Entity<S>>> {
        self.get_section_data_by_job_id(S::TABLE, parent_id)
            .await?
            .into_iter()
            .map(from_record)
            .collect()
    }

    pub async fn update_section<S: Section>(&self, id: &str, partial: Record) -> Result<Entity<S>> {
        let updated = self.update_section_data(S::TABLE, id, partial).await?;
        from_record(updated)
    }

    async fn update_record(
        &self,
        table: Table,
        id: &str,
        partial: Record,
        expected_updated_at: Option<String>,
    ) -> Result<Record> {
        let id = id.to_string();
        let cipher = self.cipher().await;
        let record = self
            .run(move |conn| {
                update_in_place(
                    conn,
                    table,
                    &id,
                    partial,
                    expected_updated_at.as_deref(),
                    cipher.as_deref(),
                )
            })
            .await?;
        tracing::debug!(table = %table, id = field(&record, "id"), "Updated record");
        Ok(record)
    }
}

// --- Connection-thread helpers ---

pub(crate) fn load(
    conn: &SqliteConnection,
    table: Table,
    id: &str,
    cipher: Option<&Cipher>,
) -> Result<Option<Record>> {
    db::fetch_by_id(conn, table, id)?
        .map(|stored| reconstruct_record_from_store(table, stored, cipher))
        .transpose()
}

pub(crate) fn load_where(
    conn: &SqliteConnection,
    table: Table,
    field: &str,
    value: &str,
    cipher: Option<&Cipher>,
) -> Result<Vec<Record>> {
    db::fetch_where(conn, table, field, value)?
        .into_iter()
        .map(|stored| reconstruct_record_from_store(table, stored, cipher))
        .collect()
}

pub(crate) fn load_all(
    conn: &SqliteConnection,
    table: Table,
    cipher: Option<&Cipher>,
) -> Result<Vec<Record>> {
    db::fetch_all(conn, table)?
        .into_iter()
        .map(|stored| reconstruct_record_from_store(table, stored, cipher))
        .collect()
}

/// Fails `NotFound` unless the parent named by the record's foreign key exists.
fn ensure_parent(conn: &SqliteConnection, table: Table, record: &Record) -> Result<()> {
    let Some(fk) = table.foreign_key() else {
        return Ok(());
    };
    let parent_id = field(record, fk.field).ok_or_else(|| {
        StoreError::Validation(format!("{table} record needs a string '{}'", fk.field))
    })?;
    if db::exists(conn, fk.parent, parent_id)? {
        Ok(())
    } else {
        Err(StoreError::not_found(fk.parent.name(), parent_id))
    }
}

pub(crate) fn stamp_new(mut record: Record) -> Record {
    let now = now_timestamp();
    record.insert("id".to_string(), Value::String(new_id()));
    record.insert("created_at".to_string(), Value::String(now.clone()));
    record.insert("updated_at".to_string(), Value::String(now));
    record
}

/// Storage failures on insert surface as `Insert`; semantic errors pass through.
pub(crate) fn insert_failure(table: Table, err: StoreError) -> StoreError {
    match err {
        StoreError::Storage(reason) => StoreError::Insert {
            table: table.name(),
            reason,
        },
        other => other,
    }
}

/// A job application built from `new` with a fresh id and timestamps.
pub(crate) fn build_job_application(new: NewJobApplication) -> Result<JobApplication> {
    let now = now_timestamp();
    Ok(JobApplication {
        id: new_id(),
        canonical_url: canonicalize_url(&new.canonical_url)?,
        job_title: new.job_title,
        company_name: new.company_name,
        application_date: new.application_date,
        status: new.status,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Canonicalize the url of a raw job application record and check it has
/// the full root shape. Every generic write of the root table goes through
/// here.
pub(crate) fn validate_job_application(mut record: Record) -> Result<Record> {
    if let Some(url) = field(&record, "canonical_url") {
        let canonical = canonicalize_url(url)?;
        record.insert("canonical_url".to_string(), Value::String(canonical));
    }
    from_record::<JobApplication>(record.clone())
        .map_err(|e| StoreError::Validation(format!("Invalid job application: {e}")))?;
    Ok(record)
}

fn update_in_place(
    conn: &mut SqliteConnection,
    table: Table,
    id: &str,
    partial: Record,
    expected_updated_at: Option<&str>,
    cipher: Option<&Cipher>,
) -> Result<Record> {
    if let Some(new_id) = partial.get("id") {
        if new_id.as_str() != Some(id) {
            return Err(StoreError::Validation(format!("{table} ids are immutable")));
        }
    }

    let tx = conn.transaction()?;
    let mut record =
        load(&tx, table, id, cipher)?.ok_or_else(|| StoreError::not_found(table.name(), id))?;

    let current = field(&record, "updated_at").unwrap_or_default().to_string();
    if let Some(expected) = expected_updated_at {
        if expected != current {
            return Err(StoreError::Conflict {
                table: table.name(),
                id: id.to_string(),
                expected: expected.to_string(),
                actual: current,
            });
        }
    }

    let parent_before = table
        .foreign_key()
        .and_then(|fk| field(&record, fk.field).map(str::to_string));

    for (key, value) in partial {
        if matches!(key.as_str(), "id" | "created_at" | "updated_at") {
            continue;
        }
        record.insert(key, value);
    }
    record.insert(
        "updated_at".to_string(),
        Value::String(timestamp_after(Some(&current))),
    );

    if let Some(fk) = table.foreign_key() {
        if field(&record, fk.field).map(str::to_string) != parent_before {
            ensure_parent(&tx, table, &record)?;
        }
    }
    if table == Table::JobApplications {
        record = validate_job_application(record)?;
    }

    let stored = prepare_record_for_store(table, &record, cipher)?;
    db::update(&tx, table, &stored)?;
    tx.commit()?;
    Ok(record)
}
