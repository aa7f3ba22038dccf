//! Intake of clipped job postings.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::db;
use crate::envelope::prepare_record_for_store;
use crate::error::{Result, StoreError};
use crate::models::{JobApplication, NewJobApplication, to_record};
use crate::repository::{Store, build_job_application, insert_failure, stamp_new};
use crate::schema::Table;
use crate::sections::PositionDetails;

const MAX_TITLE_CHARS: usize = 100;

/// A posting as captured from the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClippedPage {
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClipOutcome {
    Created(JobApplication),
    /// The url was already tracked; nothing was written.
    Existing(JobApplication),
}

impl ClipOutcome {
    pub fn application(&self) -> &JobApplication {
        match self {
            ClipOutcome::Created(app) | ClipOutcome::Existing(app) => app,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, ClipOutcome::Created(_))
    }
}

/// Scheme, host, non-default port and path of `raw`. Query, fragment and
/// user info are dropped so tracking parameters don't create duplicates.
pub fn canonicalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| StoreError::Validation(format!("Invalid URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(StoreError::Validation(format!(
            "Not a web page URL: '{raw}'"
        )));
    }
    url.set_query(None);
    url.set_fragment(None);
    url.set_username("")
        .and_then(|()| url.set_password(None))
        .map_err(|()| StoreError::Validation(format!("Cannot strip credentials from '{raw}'")))?;
    Ok(url.to_string())
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Page title, or the first non-empty body line.
fn clip_title(page: &ClippedPage) -> String {
    let title = page.title.trim();
    let title = if title.is_empty() {
        page.body
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("Untitled posting")
    } else {
        title
    };
    truncate_chars(title, MAX_TITLE_CHARS)
}

/// Employer named like "Engineer at Acme, Berlin".
fn extract_employer(content: &str) -> Option<String> {
    let first_line = content.lines().find(|line| !line.trim().is_empty())?;
    let idx = first_line
        .as_bytes()
        .windows(4)
        .position(|w| w.eq_ignore_ascii_case(b" at "))?;
    let after = &first_line[idx + 4..];
    let end = after
        .find(|c: char| c == ',' || c == '-' || c == '|' || c == '(')
        .unwrap_or(after.len());
    let company = after[..end].trim();
    (!company.is_empty() && company.chars().count() < 50).then(|| company.to_string())
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| "Unknown".to_string())
}

impl Store {
    /// Track a clipped posting unless its url is already tracked.
    ///
    /// A new job application and one `position_details` record holding the
    /// page body are written in one transaction. Without `company_name` the
    /// employer is guessed from the page, then from the host.
    pub async fn clip_page(&self, page: &ClippedPage, company_name: Option<&str>) -> Result<ClipOutcome> {
        let url = canonicalize_url(&page.url)?;
        if let Some(existing) = self.check_job_application_exists(&url).await? {
            tracing::debug!(id = %existing.id, url = %url, "Posting already clipped");
            return Ok(ClipOutcome::Existing(existing));
        }

        let title = clip_title(page);
        let company = company_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| extract_employer(&page.title))
            .or_else(|| extract_employer(&page.body))
            .unwrap_or_else(|| host_of(&url));

        let application =
            build_job_application(NewJobApplication::new(url.clone(), title.clone(), company))?;
        let root = to_record(&application)?;
        let details = stamp_new(to_record(&PositionDetails {
            job_application_id: application.id.clone(),
            job_title: Some(title),
            job_description: Some(page.body.clone()).filter(|body| !body.trim().is_empty()),
            ..Default::default()
        })?);

        let cipher = self.cipher().await;
        let written = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                for (table, record) in [(Table::JobApplications, &root), (Table::PositionDetails, &details)] {
                    let stored = prepare_record_for_store(table, record, cipher.as_deref())?;
                    db::insert(&tx, table, &stored).map_err(|e| insert_failure(table, e))?;
                }
                tx.commit()?;
                Ok(())
            })
            .await;

        match written {
            Ok(()) => {}
            Err(StoreError::UniqueConstraint { .. }) => {
                // Clipped by someone else since the lookup.
                let existing = self
                    .check_job_application_exists(&url)
                    .await?
                    .ok_or_else(|| StoreError::not_found("job_applications", url.clone()))?;
                return Ok(ClipOutcome::Existing(existing));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(id = %application.id, url = %application.canonical_url, "Clipped posting");
        Ok(ClipOutcome::Created(application))
    }
}
