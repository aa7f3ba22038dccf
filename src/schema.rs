//! Table declarations, additive migrations and the metadata table.
//!
//! Every logical table is described once in [`TABLES`]. DDL, index
//! creation, cascade delete, fan-out reads and snapshot handling all
//! iterate that list instead of naming tables one by one.

use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, SALT_LEN};
use crate::error::{Result, StoreError};

/// Latest schema version this build knows how to create.
pub const SCHEMA_VERSION: u32 = 3;

pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";
pub const SALT_KEY: &str = "encryption_salt";

/// Version that added `updated_at` indices to every table.
const UPDATED_AT_INDEX_SINCE: u32 = 3;

const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    JobApplications,
    PositionDetails,
    JobRequirements,
    CompanyInformation,
    SkillsMatrix,
    ApplicationMaterials,
    InterviewSchedule,
    InterviewPreparation,
    CommunicationLog,
    KeyContacts,
    InterviewFeedback,
    OfferDetails,
    RejectionAnalysis,
    PrivacyPolicy,
    LessonsLearned,
    PerformanceMetrics,
    AdvisorReview,
    SkillAssessments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: &'static str,
    pub parent: Table,
}

#[derive(Debug, Clone, Copy)]
pub struct TableDescriptor {
    pub table: Table,
    pub name: &'static str,
    pub foreign_key: Option<ForeignKey>,
    /// Fields backed by a unique index.
    pub unique: &'static [&'static str],
    /// Fields backed by a non-unique index, besides the foreign key.
    pub indexed: &'static [&'static str],
    /// Schema version that introduced the table.
    pub since: u32,
}

const fn section(table: Table, name: &'static str, since: u32) -> TableDescriptor {
    TableDescriptor {
        table,
        name,
        foreign_key: Some(ForeignKey {
            field: "job_application_id",
            parent: Table::JobApplications,
        }),
        unique: &[],
        indexed: &[],
        since,
    }
}

/// Declaration order matches the `Table` discriminants.
pub const TABLES: [TableDescriptor; 18] = [
    TableDescriptor {
        table: Table::JobApplications,
        name: "job_applications",
        foreign_key: None,
        unique: &["canonical_url"],
        indexed: &["status"],
        since: 1,
    },
    section(Table::PositionDetails, "position_details", 1),
    section(Table::JobRequirements, "job_requirements", 1),
    section(Table::CompanyInformation, "company_information", 1),
    section(Table::SkillsMatrix, "skills_matrix", 1),
    section(Table::ApplicationMaterials, "application_materials", 1),
    section(Table::InterviewSchedule, "interview_schedule", 2),
    section(Table::InterviewPreparation, "interview_preparation", 2),
    section(Table::CommunicationLog, "communication_log", 2),
    section(Table::KeyContacts, "key_contacts", 2),
    section(Table::InterviewFeedback, "interview_feedback", 2),
    section(Table::OfferDetails, "offer_details", 2),
    section(Table::RejectionAnalysis, "rejection_analysis", 2),
    section(Table::PrivacyPolicy, "privacy_policy", 3),
    section(Table::LessonsLearned, "lessons_learned", 3),
    section(Table::PerformanceMetrics, "performance_metrics", 3),
    section(Table::AdvisorReview, "advisor_review", 3),
    TableDescriptor {
        table: Table::SkillAssessments,
        name: "skill_assessments",
        foreign_key: Some(ForeignKey {
            field: "skills_matrix_id",
            parent: Table::SkillsMatrix,
        }),
        unique: &[],
        indexed: &[],
        since: 1,
    },
];

impl Table {
    pub const ALL: [Table; 18] = [
        Table::JobApplications,
        Table::PositionDetails,
        Table::JobRequirements,
        Table::CompanyInformation,
        Table::SkillsMatrix,
        Table::ApplicationMaterials,
        Table::InterviewSchedule,
        Table::InterviewPreparation,
        Table::CommunicationLog,
        Table::KeyContacts,
        Table::InterviewFeedback,
        Table::OfferDetails,
        Table::RejectionAnalysis,
        Table::PrivacyPolicy,
        Table::LessonsLearned,
        Table::PerformanceMetrics,
        Table::AdvisorReview,
        Table::SkillAssessments,
    ];

    pub fn descriptor(self) -> &'static TableDescriptor {
        &TABLES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn foreign_key(self) -> Option<ForeignKey> {
        self.descriptor().foreign_key
    }

    /// The seventeen tables that hang off a job application, directly or not.
    pub fn sections() -> impl Iterator<Item = Table> {
        Self::ALL.into_iter().filter(|t| *t != Table::JobApplications)
    }

    /// Tables whose foreign key points straight at `job_applications`.
    pub fn direct_children() -> impl Iterator<Item = Table> {
        Self::ALL.into_iter().filter(|t| {
            t.foreign_key()
                .is_some_and(|fk| fk.parent == Table::JobApplications)
        })
    }

    /// Tables whose foreign key points at `parent`.
    pub fn children_of(parent: Table) -> impl Iterator<Item = Table> {
        Self::ALL
            .into_iter()
            .filter(move |t| t.foreign_key().is_some_and(|fk| fk.parent == parent))
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().replace('-', "_").to_lowercase();
        Table::ALL
            .into_iter()
            .find(|t| t.name() == wanted)
            .ok_or_else(|| StoreError::Validation(format!("Unknown table '{s}'")))
    }
}

impl TableDescriptor {
    /// Fields kept in plaintext columns: id, timestamps, foreign key and
    /// every indexed field.
    pub fn index_fields(&self) -> Vec<&'static str> {
        let mut fields = vec!["id", "created_at", "updated_at"];
        if let Some(fk) = self.foreign_key {
            fields.push(fk.field);
        }
        fields.extend(self.unique.iter().copied());
        fields.extend(self.indexed.iter().copied());
        fields
    }

    fn create_sql(&self) -> String {
        let mut columns = vec![
            "    id TEXT PRIMARY KEY".to_string(),
            "    created_at TEXT NOT NULL".to_string(),
            "    updated_at TEXT NOT NULL".to_string(),
        ];
        for field in self.index_fields().into_iter().skip(3) {
            columns.push(format!("    {field} TEXT NOT NULL"));
        }
        columns.push("    encrypted INTEGER NOT NULL DEFAULT 0".to_string());
        columns.push("    body TEXT NOT NULL".to_string());

        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n",
            self.name,
            columns.join(",\n")
        );
        if let Some(fk) = self.foreign_key {
            sql.push_str(&index_sql(self.name, fk.field, false));
        }
        for field in self.unique {
            sql.push_str(&index_sql(self.name, field, true));
        }
        for field in self.indexed {
            sql.push_str(&index_sql(self.name, field, false));
        }
        sql
    }
}

fn index_sql(table: &str, field: &str, unique: bool) -> String {
    let kind = if unique { "UNIQUE INDEX" } else { "INDEX" };
    format!("CREATE {kind} IF NOT EXISTS idx_{table}_{field} ON {table}({field});\n")
}

/// DDL for a single version increment. Only ever adds objects.
fn migration_sql(version: u32) -> String {
    let mut sql = String::new();
    for descriptor in TABLES.iter().filter(|d| d.since == version) {
        sql.push_str(&descriptor.create_sql());
    }
    if version == UPDATED_AT_INDEX_SINCE {
        for descriptor in TABLES.iter().filter(|d| d.since <= version) {
            sql.push_str(&index_sql(descriptor.name, "updated_at", false));
        }
    }
    sql
}

/// Every table and index of the current schema. Safe to run on any store.
fn current_schema_sql() -> String {
    (1..=SCHEMA_VERSION).map(migration_sql).collect()
}

/// Bring the store up to [`SCHEMA_VERSION`], applying the missing
/// increments, then recreate any table or index that has gone missing.
/// Returns the version now in effect.
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    conn.execute_batch(CREATE_METADATA)?;

    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Configuration(format!(
            "Store uses schema version {current}, this build supports up to {SCHEMA_VERSION}"
        )));
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        let tx = conn.transaction()?;
        tx.execute_batch(&migration_sql(version))?;
        set_metadata(&tx, SCHEMA_VERSION_KEY, &version.to_string())?;
        tx.commit()?;
        tracing::info!(version, "Applied schema migration");
    }
    conn.execute_batch(&current_schema_sql())?;

    Ok(SCHEMA_VERSION.max(current))
}

pub fn schema_version(conn: &Connection) -> Result<u32> {
    match get_metadata(conn, SCHEMA_VERSION_KEY)? {
        Some(raw) => raw.parse().map_err(|_| {
            StoreError::Configuration(format!("Corrupt schema version in metadata: '{raw}'"))
        }),
        None => Ok(0),
    }
}

pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Return the persisted key-derivation salt, creating it on first use.
/// An existing salt is never replaced.
pub fn get_or_create_salt(conn: &Connection) -> Result<[u8; SALT_LEN]> {
    if get_metadata(conn, SALT_KEY)?.is_none() {
        let salt = crypto::generate_salt();
        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES (?1, ?2)",
            params![SALT_KEY, STANDARD.encode(salt)],
        )?;
        tracing::info!("Created encryption salt");
    }

    let encoded = get_metadata(conn, SALT_KEY)?
        .ok_or_else(|| StoreError::Configuration("Encryption salt missing".to_string()))?;
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| StoreError::Configuration(format!("Corrupt encryption salt: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::Configuration("Encryption salt has wrong length".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    fn index_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name=?1")
            .unwrap();
        stmt.query_map([table], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn test_descriptor_order_matches_enum() {
        for table in Table::ALL {
            assert_eq!(table.descriptor().table, table);
        }
    }

    #[test]
    fn test_table_partitions() {
        assert_eq!(Table::sections().count(), 17);
        assert_eq!(Table::direct_children().count(), 16);
        let nested: Vec<_> = Table::children_of(Table::SkillsMatrix).collect();
        assert_eq!(nested, vec![Table::SkillAssessments]);
    }

    #[test]
    fn test_table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(table.name().parse::<Table>().unwrap(), table);
            let json = serde_json::to_value(table).unwrap();
            assert_eq!(json, serde_json::Value::String(table.name().to_string()));
        }
        assert_eq!("skill-assessments".parse::<Table>().unwrap(), Table::SkillAssessments);
        assert!("nonsense".parse::<Table>().is_err());
    }

    #[test]
    fn test_index_fields() {
        let root = Table::JobApplications.descriptor().index_fields();
        assert_eq!(
            root,
            vec!["id", "created_at", "updated_at", "canonical_url", "status"]
        );
        let nested = Table::SkillAssessments.descriptor().index_fields();
        assert_eq!(
            nested,
            vec!["id", "created_at", "updated_at", "skills_matrix_id"]
        );
    }

    #[test]
    fn test_migrate_creates_everything() {
        let mut conn = Connection::open_in_memory().unwrap();
        let version = migrate(&mut conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        assert!(table_exists(&conn, "metadata"));
        for table in Table::ALL {
            assert!(table_exists(&conn, table.name()), "missing {table}");
            let indices = index_names(&conn, table.name());
            let updated = format!("idx_{}_updated_at", table.name());
            assert!(indices.contains(&updated), "missing {updated}");
        }
        let root_indices = index_names(&conn, "job_applications");
        assert!(root_indices.contains(&"idx_job_applications_canonical_url".to_string()));
        assert!(root_indices.contains(&"idx_job_applications_status".to_string()));
        let nested = index_names(&conn, "skill_assessments");
        assert!(nested.contains(&"idx_skill_assessments_skills_matrix_id".to_string()));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_applies_only_missing_increments() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_METADATA).unwrap();
        conn.execute_batch(&migration_sql(1)).unwrap();
        set_metadata(&conn, SCHEMA_VERSION_KEY, "1").unwrap();
        conn.execute(
            "INSERT INTO job_applications (id, created_at, updated_at, canonical_url, status, body)
             VALUES ('a', 't', 't', 'https://x.example/job/1', 'saved', '{}')",
            [],
        )
        .unwrap();

        assert!(!table_exists(&conn, "privacy_policy"));
        migrate(&mut conn).unwrap();
        assert!(table_exists(&conn, "privacy_policy"));

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM job_applications", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_migrate_restores_dropped_objects() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute_batch(
            "DROP INDEX idx_job_applications_canonical_url;
             DROP INDEX idx_advisor_review_updated_at;
             DROP TABLE lessons_learned;",
        )
        .unwrap();

        migrate(&mut conn).unwrap();
        assert!(index_names(&conn, "job_applications")
            .contains(&"idx_job_applications_canonical_url".to_string()));
        assert!(index_names(&conn, "advisor_review")
            .contains(&"idx_advisor_review_updated_at".to_string()));
        assert!(table_exists(&conn, "lessons_learned"));
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        set_metadata(&conn, SCHEMA_VERSION_KEY, &(SCHEMA_VERSION + 1).to_string()).unwrap();
        assert!(matches!(
            migrate(&mut conn),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_salt_created_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        let first = get_or_create_salt(&conn).unwrap();
        let second = get_or_create_salt(&conn).unwrap();
        assert_eq!(first, second);
    }
}
