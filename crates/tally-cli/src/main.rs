use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tally_core::{codec, DeviceInfo};
use tally_service::{AttendanceService, Config, Recognition, RegistrationRequest};
use tally_store::{LiveFeed, SqliteStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tally", about = "Face recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a descriptor file and a captured image
    Enroll {
        #[arg(long)]
        name: String,
        #[arg(long)]
        employee_id: String,
        #[arg(long, default_value = "")]
        department: String,
        #[arg(long, default_value = "")]
        position: String,
        /// Descriptor file (JSON array or comma-separated numbers)
        #[arg(long)]
        descriptor: PathBuf,
        /// Captured face image (PNG, JPEG or WebP)
        #[arg(long)]
        image: PathBuf,
    },
    /// Match a sample descriptor and record attendance
    Recognize {
        /// Descriptor file (JSON array or comma-separated numbers)
        descriptor: PathBuf,
        /// Capture source written to the record's device info
        #[arg(long, default_value = "tally-cli")]
        source: String,
    },
    /// List enrolled identities
    List,
    /// Show the latest attendance records of everybody
    Recent {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show an identity's attendance calendar
    Calendar {
        /// Identity id
        #[arg(long)]
        identity: String,
        #[arg(long, requires = "month")]
        year: Option<i32>,
        #[arg(long, requires = "year")]
        month: Option<u32>,
        /// Also show the detail of one day (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn read_descriptor(path: &Path) -> Result<Vec<f32>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading descriptor {}", path.display()))?;
    let descriptor =
        codec::decode(&raw).with_context(|| format!("decoding descriptor {}", path.display()))?;
    Ok(descriptor.values().to_vec())
}

fn device_info(source: &str) -> DeviceInfo {
    DeviceInfo {
        source: Some(source.to_string()),
        user_agent: Some(format!("tally/{}", env!("CARGO_PKG_VERSION"))),
        ..DeviceInfo::default()
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = Config::load()?;
    let feed = LiveFeed::new(config.feed_capacity);
    let store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?
        .with_feed(feed.clone());
    tracing::debug!(db = %config.db_path.display(), "store opened");
    let service = AttendanceService::new(Arc::new(store), config)?;

    match cli.command {
        Commands::Enroll {
            name,
            employee_id,
            department,
            position,
            descriptor,
            image,
        } => {
            let request = RegistrationRequest {
                display_name: name,
                employee_id,
                department,
                position,
                descriptor: read_descriptor(&descriptor)?,
                image: std::fs::read(&image)
                    .with_context(|| format!("reading image {}", image.display()))?,
                device_info: Some(device_info("tally-cli")),
            };
            let (identity, _) = service.register(request).await?;
            println!("Enrolled {} ({})", identity.display_name, identity.identity_id);
        }
        Commands::Recognize { descriptor, source } => {
            let sample = read_descriptor(&descriptor)?;
            match service
                .recognize_and_record(sample, Some(device_info(&source)))
                .await?
            {
                Recognition::Recognized { result, record } => {
                    println!(
                        "Recognized {} (distance {:.4}, confidence {:.4}): {}",
                        result.display_name.as_deref().unwrap_or("?"),
                        result.distance.unwrap_or_default(),
                        result.confidence.unwrap_or_default(),
                        record.status,
                    );
                }
                Recognition::Unrecognized { result, record } => {
                    match result.distance {
                        Some(d) => println!("Not recognized (closest distance {d:.4})"),
                        None => println!("Not recognized (no comparable identities)"),
                    }
                    if record.is_some() {
                        println!("Unauthorized attempt recorded");
                    }
                }
            }
        }
        Commands::List => {
            let identities = service.enrolled().await?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}  {}  {}  {}",
                    identity.identity_id, identity.employee_id, identity.display_name, identity.department
                );
            }
        }
        Commands::Recent { limit } => {
            print_json(&service.recent_activity(limit).await?)?;
        }
        Commands::Calendar {
            identity,
            year,
            month,
            date,
        } => {
            let mut session = service.calendar_session(feed);
            if let (Some(year), Some(month)) = (year, month) {
                session.show_month(year, month).await?;
            }
            session.select_identity(&identity).await?;
            if let Some(date) = date {
                session.select_date(date).await?;
            }
            print_json(session.calendar())?;
        }
    }

    Ok(())
}
