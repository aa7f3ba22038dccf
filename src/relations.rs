//! Operations that span a job application and everything hanging off it.

use std::collections::BTreeMap;

use futures::future::try_join_all;
use rusqlite::Connection as SqliteConnection;
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::{Result, StoreError};
use crate::models::{CompleteJobApplication, Record, field};
use crate::repository::Store;
use crate::schema::Table;

/// Rows removed by a cascade delete, per table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub job_application_id: String,
    pub deleted: BTreeMap<Table, usize>,
}

impl DeleteSummary {
    pub fn total(&self) -> usize {
        self.deleted.values().sum()
    }
}

impl Store {
    /// The job application with every section record attached.
    ///
    /// Direct child tables are fetched concurrently, then the tables nested
    /// under those rows (skill assessments under each skills matrix). Any
    /// failed fetch fails the whole read.
    pub async fn get_complete_job_application(&self, id: &str) -> Result<CompleteJobApplication> {
        let job_application = self
            .get_job_application(id)
            .await?
            .ok_or_else(|| StoreError::not_found(Table::JobApplications.name(), id))?;

        let fetched = try_join_all(Table::direct_children().map(|table| async move {
            let records = self.get_section_data_by_job_id(table, id).await?;
            Ok::<_, StoreError>((table, records))
        }))
        .await?;
        let mut sections: BTreeMap<Table, Vec<Record>> = fetched.into_iter().collect();

        let mut nested = Vec::new();
        for (&parent, records) in &sections {
            for child in Table::children_of(parent) {
                for record in records {
                    if let Some(parent_id) = field(record, "id") {
                        nested.push((child, parent_id.to_string()));
                    }
                }
            }
        }
        let nested_records = try_join_all(
            nested
                .iter()
                .map(|(table, parent_id)| self.get_section_data_by_job_id(*table, parent_id)),
        )
        .await?;
        for ((table, _), records) in nested.iter().zip(nested_records) {
            sections.entry(*table).or_default().extend(records);
        }
        for table in Table::sections() {
            sections.entry(table).or_default();
        }

        tracing::debug!(id, "Assembled complete job application");
        Ok(CompleteJobApplication {
            job_application,
            sections,
        })
    }

    /// Delete a job application and every record referencing it, in one
    /// transaction.
    pub async fn delete_job_application(&self, id: &str) -> Result<DeleteSummary> {
        let id = id.to_string();
        let summary = self.run(move |conn| cascade_delete(conn, &id)).await?;
        tracing::info!(
            id = %summary.job_application_id,
            records = summary.total(),
            "Deleted job application"
        );
        Ok(summary)
    }
}

fn transaction_error(err: rusqlite::Error) -> StoreError {
    StoreError::Transaction(err.to_string())
}

fn cascade_delete(conn: &mut SqliteConnection, id: &str) -> Result<DeleteSummary> {
    let tx = conn.transaction().map_err(transaction_error)?;
    if !db::exists(&tx, Table::JobApplications, id)? {
        return Err(StoreError::not_found(Table::JobApplications.name(), id));
    }

    let mut deleted: BTreeMap<Table, usize> = Table::ALL.into_iter().map(|t| (t, 0)).collect();
    delete_children(&tx, Table::JobApplications, id, &mut deleted).map_err(transaction_error)?;
    let root = db::delete_by_id(&tx, Table::JobApplications, id).map_err(transaction_error)?;
    deleted.insert(Table::JobApplications, root);
    tx.commit().map_err(transaction_error)?;

    Ok(DeleteSummary {
        job_application_id: id.to_string(),
        deleted,
    })
}

/// Deepest rows first, so nothing is left pointing at a removed parent.
fn delete_children(
    conn: &SqliteConnection,
    parent: Table,
    parent_id: &str,
    deleted: &mut BTreeMap<Table, usize>,
) -> rusqlite::Result<()> {
    for child in Table::children_of(parent) {
        let Some(fk) = child.foreign_key() else {
            continue;
        };
        if Table::children_of(child).next().is_some() {
            for child_id in db::ids_where(conn, child, fk.field, parent_id)? {
                delete_children(conn, child, &child_id, deleted)?;
            }
        }
        let removed = db::delete_where(conn, child, fk.field, parent_id)?;
        *deleted.entry(child).or_default() += removed;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{Entity, JobApplication, NewJobApplication, to_record};
    use crate::sections::{PositionDetails, SkillAssessment};
    use serde_json::json;

    /// One record in every direct child table, plus two skill assessments
    /// under the skills matrix.
    pub(crate) async fn populate_every_section(store: &Store, job_id: &str) {
        let mut matrix_id = None;
        for table in Table::direct_children() {
            let record = to_record(&json!({
                "job_application_id": job_id,
                "notes": format!("{table} notes")
            }))
            .unwrap();
            let saved = store.save_section_data(table, record).await.unwrap();
            if table == Table::SkillsMatrix {
                matrix_id = field(&saved, "id").map(str::to_string);
            }
        }
        let matrix_id = matrix_id.unwrap();
        for skill in ["rust", "sql"] {
            store
                .save_section(&SkillAssessment {
                    skills_matrix_id: matrix_id.clone(),
                    skill_name: Some(skill.to_string()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
    }

    async fn create_job(store: &Store, url: &str) -> JobApplication {
        store
            .create_job_application(NewJobApplication::new(url, "Engineer", "Acme"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_aggregate_shows_saved_position() {
        let store = Store::open_in_memory().await.unwrap();
        let job = create_job(&store, "https://x.example/job/1").await;
        store
            .save_section(&PositionDetails {
                job_application_id: job.id.clone(),
                job_title: Some("Engineer".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let complete = store.get_complete_job_application(&job.id).await.unwrap();
        assert_eq!(complete.job_application.canonical_url, "https://x.example/job/1");

        let positions: Vec<Entity<PositionDetails>> = complete.section_as().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].data.job_title.as_deref(), Some("Engineer"));

        assert_eq!(complete.sections.len(), 17);
        assert!(complete.section(Table::OfferDetails).is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_includes_nested_skill_assessments() {
        let store = Store::open_in_memory().await.unwrap();
        let job = create_job(&store, "https://x.example/job/1").await;
        let other = create_job(&store, "https://x.example/job/2").await;
        populate_every_section(&store, &job.id).await;
        populate_every_section(&store, &other.id).await;

        let complete = store.get_complete_job_application(&job.id).await.unwrap();
        for (table, count) in complete.record_counts() {
            let expected = if table == Table::SkillAssessments { 2 } else { 1 };
            assert_eq!(count, expected, "{table}");
        }
        for record in complete.section(Table::PositionDetails) {
            assert_eq!(field(record, "job_application_id"), Some(job.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_aggregate_of_missing_job_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let result = store.get_complete_job_application("missing").await;
        assert!(matches!(
            result,
            Err(StoreError::NotFound {
                table: "job_applications",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cascade_delete_removes_everything() {
        let store = Store::open_in_memory().await.unwrap();
        let job = create_job(&store, "https://x.example/job/1").await;
        let keep = create_job(&store, "https://x.example/job/2").await;
        populate_every_section(&store, &job.id).await;
        populate_every_section(&store, &keep.id).await;

        let summary = store.delete_job_application(&job.id).await.unwrap();
        assert_eq!(summary.deleted[&Table::JobApplications], 1);
        assert_eq!(summary.deleted[&Table::SkillAssessments], 2);
        assert_eq!(summary.deleted[&Table::AdvisorReview], 1);
        assert_eq!(summary.total(), 1 + 16 + 2);

        assert!(matches!(
            store.get_complete_job_application(&job.id).await,
            Err(StoreError::NotFound { .. })
        ));
        for table in Table::direct_children() {
            assert!(store
                .get_section_data_by_job_id(table, &job.id)
                .await
                .unwrap()
                .is_empty());
        }

        let remaining = store.get_complete_job_application(&keep.id).await.unwrap();
        assert_eq!(remaining.section(Table::SkillAssessments).len(), 2);
        let counts = store
            .run(|conn| Ok(db::count(conn, Table::SkillAssessments)?))
            .await
            .unwrap();
        assert_eq!(counts, 2);
    }

    #[tokio::test]
    async fn test_delete_missing_job_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let result = store.delete_job_application("missing").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_failed_sub_delete_rolls_back() {
        let store = Store::open_in_memory().await.unwrap();
        let job = create_job(&store, "https://x.example/job/1").await;
        populate_every_section(&store, &job.id).await;

        store
            .run(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER block_offer_delete BEFORE DELETE ON offer_details
                     BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let result = store.delete_job_application(&job.id).await;
        assert!(matches!(result, Err(StoreError::Transaction(_))));

        let complete = store.get_complete_job_application(&job.id).await.unwrap();
        for (table, count) in complete.record_counts() {
            assert!(count > 0, "{table} lost records after rollback");
        }
    }
}
