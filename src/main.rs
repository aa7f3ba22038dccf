use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use jobvault::crypto::MIN_KDF_ITERATIONS;
use jobvault::models::{field, to_record};
use jobvault::{
    ApplicationStatus, ClipOutcome, ClippedPage, DatabaseSnapshot, JobApplication,
    NewJobApplication, Record, Store, StoreConfig, Table,
};

const PASSPHRASE_ENV: &str = "JOBVAULT_PASSPHRASE";

#[derive(Parser)]
#[command(name = "jobvault")]
#[command(about = "Track job applications in a local, optionally encrypted store")]
struct Cli {
    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true, env = "JOBVAULT_DB")]
    db: Option<PathBuf>,

    /// Encrypt records at rest; the passphrase is read from JOBVAULT_PASSPHRASE
    #[arg(long, global = true)]
    encrypt: bool,

    /// PBKDF2 iterations used to derive the encryption key
    #[arg(long, global = true, env = "JOBVAULT_KDF_ITERATIONS", default_value_t = MIN_KDF_ITERATIONS)]
    kdf_iterations: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Track a clipped job posting
    Clip {
        /// Posting URL
        #[arg(long)]
        url: String,

        /// Page title
        #[arg(long, default_value = "")]
        title: String,

        /// Employer (guessed from the page when omitted)
        #[arg(long)]
        company: Option<String>,

        /// Page text
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,

        /// Read the page text from a file
        #[arg(long)]
        body_file: Option<PathBuf>,
    },

    /// Add a job application
    Add {
        #[arg(long)]
        url: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        company: String,

        /// Application date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// saved, applied, interviewing, offer, accepted, rejected, withdrawn
        #[arg(long, default_value = "saved")]
        status: ApplicationStatus,
    },

    /// List job applications
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<ApplicationStatus>,
    },

    /// Show a job application with all its sections
    Show {
        /// Job application ID
        id: String,

        /// Print the whole record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Change the status of a job application
    Status {
        /// Job application ID
        id: String,

        status: ApplicationStatus,
    },

    /// Manage section records
    Section {
        #[command(subcommand)]
        command: SectionCommands,
    },

    /// Delete a job application and everything attached to it
    Delete {
        /// Job application ID
        id: String,
    },

    /// Export the whole database to a JSON file
    Export { file: PathBuf },

    /// Replace the whole database with a JSON export
    Import { file: PathBuf },

    /// Export one table to a JSON file
    ExportTable { table: Table, file: PathBuf },

    /// Upsert records from a JSON file into one table
    ImportTable { table: Table, file: PathBuf },

    /// Show per-table record counts and sizes
    Usage,
}

#[derive(Subcommand)]
enum SectionCommands {
    /// Add a section record
    Add {
        /// Section table, e.g. position_details
        table: Table,

        /// Job application ID (skills matrix ID for skill_assessments)
        parent_id: String,

        /// Record fields as a JSON object
        json: String,
    },

    /// List section records for a parent
    List { table: Table, parent_id: String },

    /// Merge fields into a section record
    Update {
        table: Table,

        /// Section record ID
        id: String,

        /// Fields to change as a JSON object
        json: String,

        /// Fail if the record changed since this updated_at
        #[arg(long)]
        expect_updated_at: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "jobvault=warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = StoreConfig::default().with_kdf_iterations(cli.kdf_iterations);
    if let Some(path) = cli.db {
        config.path = path;
    }
    let store = Store::open(config.clone())
        .await
        .with_context(|| format!("Failed to open {}", config.path.display()))?;

    if cli.encrypt {
        let passphrase = Zeroizing::new(
            std::env::var(PASSPHRASE_ENV)
                .with_context(|| format!("--encrypt needs {PASSPHRASE_ENV} to be set"))?,
        );
        store
            .configure_encryption(true, Some(passphrase.as_str()))
            .await
            .context("Failed to enable encryption")?;
    }

    let result = run(&store, cli.command).await;
    store.close().await?;
    result
}

async fn run(store: &Store, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Database initialized at {} (schema v{})",
                store.config().path.display(),
                store.schema_version().await?
            );
        }

        Commands::Clip {
            url,
            title,
            company,
            body,
            body_file,
        } => {
            let body = match (body, body_file) {
                (Some(body), _) => body,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (None, None) => String::new(),
            };
            let page = ClippedPage { title, url, body };
            match store.clip_page(&page, company.as_deref()).await? {
                ClipOutcome::Created(app) => println!("Added job application {}", app.id),
                ClipOutcome::Existing(app) => {
                    println!("Already tracked as {} ({})", app.id, app.status)
                }
            }
        }

        Commands::Add {
            url,
            title,
            company,
            date,
            status,
        } => {
            if let Some(existing) = store.check_job_application_exists(&url).await? {
                bail!("{} is already tracked as {}", existing.canonical_url, existing.id);
            }
            let mut new = NewJobApplication::new(url, title, company);
            new.application_date = date;
            new.status = status;
            let app = store.create_job_application(new).await?;
            println!("Added job application {}", app.id);
        }

        Commands::List { status } => {
            let apps = match status {
                Some(status) => store.list_job_applications_by_status(status).await?,
                None => store.get_all_job_applications().await?,
            };
            print_applications(&apps);
        }

        Commands::Show { id, json } => {
            let complete = store
                .get_complete_job_application(&id)
                .await
                .with_context(|| format!("Failed to load job application {id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&complete)?);
            } else {
                let app = &complete.job_application;
                println!("Job application {}", app.id);
                println!("Title: {}", app.job_title);
                println!("Company: {}", app.company_name);
                println!("Status: {}", app.status);
                println!("URL: {}", app.canonical_url);
                if let Some(date) = app.application_date {
                    println!("Applied: {}", date);
                }
                println!("Created: {}", app.created_at);
                println!("Updated: {}", app.updated_at);

                for (table, records) in &complete.sections {
                    if records.is_empty() {
                        continue;
                    }
                    println!("\n--- {} ({}) ---", table, records.len());
                    for record in records {
                        print_record(record);
                    }
                }
            }
        }

        Commands::Status { id, status } => {
            let partial = to_record(&json!({ "status": status }))?;
            let app = store.update_job_application(&id, partial).await?;
            println!("{} is now {}", app.id, app.status);
        }

        Commands::Section { command } => run_section(store, command).await?,

        Commands::Delete { id } => {
            let summary = store.delete_job_application(&id).await?;
            println!(
                "Deleted job application {} ({} records)",
                summary.job_application_id,
                summary.total()
            );
            for (table, count) in summary.deleted.iter().filter(|(_, count)| **count > 0) {
                println!("  {:<24} {:>6}", table, count);
            }
        }

        Commands::Export { file } => {
            let snapshot = store.export_database().await?;
            write_json(&file, &snapshot)?;
            println!(
                "Exported {} job applications to {}",
                snapshot.job_applications.len(),
                file.display()
            );
        }

        Commands::Import { file } => {
            let snapshot: DatabaseSnapshot = read_json(&file)?;
            let summary = store
                .import_database(snapshot)
                .await
                .context("Import failed; the database was left unchanged")?;
            println!(
                "Imported {} job applications ({} records)",
                summary.id_map.len(),
                summary.total()
            );
        }

        Commands::ExportTable { table, file } => {
            let records = store.export_table(table).await?;
            write_json(&file, &records)?;
            println!("Exported {} {} records to {}", records.len(), table, file.display());
        }

        Commands::ImportTable { table, file } => {
            let records: Vec<Record> = read_json(&file)?;
            let count = store.import_table(table, records).await?;
            println!("Imported {} {} records", count, table);
        }

        Commands::Usage => {
            let usage = store.get_space_usage().await;
            println!("{:<24} {:>8} {:>12}", "TABLE", "RECORDS", "BYTES");
            println!("{}", "-".repeat(46));
            for table in &usage.tables {
                println!("{:<24} {:>8} {:>12}", table.table, table.records, table.bytes);
            }
            println!("{}", "-".repeat(46));
            println!("{:<24} {:>8} {:>12}", "TOTAL", usage.total_records, usage.total_bytes);
        }
    }

    Ok(())
}

async fn run_section(store: &Store, command: SectionCommands) -> Result<()> {
    match command {
        SectionCommands::Add {
            table,
            parent_id,
            json,
        } => {
            let Some(fk) = table.foreign_key() else {
                bail!("{table} is not a section table; use `add` or `clip`");
            };
            let mut record = parse_record(&json)?;
            record.insert(fk.field.to_string(), parent_id.into());
            let saved = store.save_section_data(table, record).await?;
            println!("Added {} {}", table, field(&saved, "id").unwrap_or_default());
        }

        SectionCommands::List { table, parent_id } => {
            let records = store.get_section_data_by_job_id(table, &parent_id).await?;
            if records.is_empty() {
                println!("No {table} records found.");
            }
            for record in &records {
                print_record(record);
            }
        }

        SectionCommands::Update {
            table,
            id,
            json,
            expect_updated_at,
        } => {
            let partial = parse_record(&json)?;
            let updated = match expect_updated_at {
                Some(expected) => {
                    store
                        .update_section_data_checked(table, &id, partial, &expected)
                        .await?
                }
                None => store.update_section_data(table, &id, partial).await?,
            };
            println!(
                "Updated {} {} at {}",
                table,
                id,
                field(&updated, "updated_at").unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn print_applications(apps: &[JobApplication]) {
    if apps.is_empty() {
        println!("No job applications found.");
        return;
    }
    println!(
        "{:<36} {:<12} {:<30} {:<20} {:<10}",
        "ID", "STATUS", "TITLE", "COMPANY", "UPDATED"
    );
    println!("{}", "-".repeat(112));
    for app in apps {
        println!(
            "{:<36} {:<12} {:<30} {:<20} {:<10}",
            app.id,
            app.status,
            truncate(&app.job_title, 28),
            truncate(&app.company_name, 18),
            app.updated_at.get(..10).unwrap_or(&app.updated_at)
        );
    }
}

fn print_record(record: &Record) {
    println!("{}", field(record, "id").unwrap_or("?"));
    for (key, value) in record {
        if matches!(key.as_str(), "id" | "created_at") || value.is_null() {
            continue;
        }
        let text = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        println!("  {:<24} {}", key, truncate(&text.replace('\n', " "), 80));
    }
}

fn parse_record(json: &str) -> Result<Record> {
    serde_json::from_str(json).context("Expected a JSON object")
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
