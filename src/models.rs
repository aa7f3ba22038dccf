use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::schema::Table;
use crate::sections::Section;

/// A stored record as a JSON object. Generic operations work on this shape.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    #[default]
    Saved,
    Applied,
    Interviewing,
    Offer,
    Accepted,
    Rejected,
    Withdrawn,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 7] = [
        ApplicationStatus::Saved,
        ApplicationStatus::Applied,
        ApplicationStatus::Interviewing,
        ApplicationStatus::Offer,
        ApplicationStatus::Accepted,
        ApplicationStatus::Rejected,
        ApplicationStatus::Withdrawn,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationStatus::Saved => "saved",
            ApplicationStatus::Applied => "applied",
            ApplicationStatus::Interviewing => "interviewing",
            ApplicationStatus::Offer => "offer",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::Withdrawn => "withdrawn",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        ApplicationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| StoreError::Validation(format!("Unknown status '{s}'")))
    }
}

/// Root entity: one row per distinct canonical URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobApplication {
    pub id: String,
    pub canonical_url: String,
    pub job_title: String,
    pub company_name: String,
    pub application_date: Option<NaiveDate>,
    pub status: ApplicationStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields supplied when creating a job application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobApplication {
    pub canonical_url: String,
    pub job_title: String,
    pub company_name: String,
    #[serde(default)]
    pub application_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: ApplicationStatus,
}

impl NewJobApplication {
    pub fn new(
        canonical_url: impl Into<String>,
        job_title: impl Into<String>,
        company_name: impl Into<String>,
    ) -> Self {
        Self {
            canonical_url: canonical_url.into(),
            job_title: job_title.into(),
            company_name: company_name.into(),
            application_date: None,
            status: ApplicationStatus::default(),
        }
    }
}

/// A typed section row together with its store-assigned fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity<T> {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(flatten)]
    pub data: T,
}

/// A job application with every section attached, keyed by section name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteJobApplication {
    pub job_application: JobApplication,
    pub sections: BTreeMap<Table, Vec<Record>>,
}

impl CompleteJobApplication {
    pub fn section(&self, table: Table) -> &[Record] {
        self.sections.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn section_as<S: Section>(&self) -> Result<Vec<Entity<S>>> {
        self.section(S::TABLE)
            .iter()
            .cloned()
            .map(from_record)
            .collect()
    }

    /// Record count for every section table, zeros included.
    pub fn record_counts(&self) -> BTreeMap<Table, usize> {
        Table::sections()
            .map(|table| (table, self.section(table).len()))
            .collect()
    }
}

pub fn to_record<T: Serialize>(value: &T) -> Result<Record> {
    match serde_json::to_value(value)? {
        Value::Object(record) => Ok(record),
        other => Err(StoreError::Validation(format!(
            "Expected a JSON object, got {other}"
        ))),
    }
}

pub fn from_record<T: DeserializeOwned>(record: Record) -> Result<T> {
    serde_json::from_value(Value::Object(record)).map_err(StoreError::from)
}

/// String field of a record, if present and a string.
pub fn field<'a>(record: &'a Record, name: &str) -> Option<&'a str> {
    record.get(name).and_then(Value::as_str)
}

/// Current time as a sortable RFC 3339 string, strictly after `previous`.
pub(crate) fn timestamp_after(previous: Option<&str>) -> String {
    let now = Utc::now().trunc_subsecs(6);
    let next = match previous.and_then(|p| DateTime::parse_from_rfc3339(p).ok()) {
        Some(prev) => {
            let prev = prev.with_timezone(&Utc).trunc_subsecs(6);
            if now > prev {
                now
            } else {
                prev + Duration::microseconds(1)
            }
        }
        None => now,
    };
    next.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_timestamp() -> String {
    timestamp_after(None)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
