mod api_client;
mod config;
mod data;
mod day_key;
mod decode;
mod error;
mod report;
mod runner;
mod sink;

use api_client::{AccessType, Granularity, ReportCategory};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::Config;
use day_key::{DateTimeSample, DayKeyNormalizer, SourceConvention, DEFAULT_TIME_ZONE};
use error::Error;
use log::error;
use runner::PollRequest;

const DAYS_BACK: &str = "7";
const DEFAULT_CATEGORIES: [ReportCategory; 3] = [
    ReportCategory::AppStoreEngagement,
    ReportCategory::AppStoreCommerce,
    ReportCategory::AppUsage,
];

#[derive(Parser)]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch analytics reports for every app of a group and load them.
    Poll {
        group: String,

        /// Report categories to poll; repeat or separate with commas.
        #[arg(
            long = "category",
            value_enum,
            value_delimiter = ',',
            default_values_t = DEFAULT_CATEGORIES
        )]
        categories: Vec<ReportCategory>,

        #[arg(long, value_enum, default_value_t = Granularity::Daily)]
        granularity: Granularity,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: Option<NaiveDate>,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        end: Option<NaiveDate>,

        #[arg(long, default_value = DAYS_BACK, env = "APPSTORE_BACKFILL_DAYS")]
        days_back: u32,

        /// Read one-time snapshot requests instead of ongoing ones.
        #[arg(long)]
        one_time: bool,
    },

    /// Create ongoing report requests for every app of a group.
    CreateRequests { group: String },

    /// Print the business day of a date or timestamp.
    DayKey {
        value: String,

        #[arg(long, value_enum, default_value_t = SourceConvention::AbsoluteInstant)]
        convention: SourceConvention,

        #[arg(long, default_value = DEFAULT_TIME_ZONE)]
        time_zone: String,
    },
}

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    let error_message = "Invalid date, expected YYYY-MM-DD";

    let parts = s
        .split("-")
        .map(|part| part.parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| error_message)?;

    match parts.as_slice() {
        &[year, month, day] if month <= 12 && day <= 31 => {
            Ok(
                NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .ok_or(error_message)?,
            )
        }
        _ => Err(error_message.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::init();

    match args.command {
        Command::Poll {
            group,
            categories,
            granularity,
            start,
            end,
            days_back,
            one_time,
        } => {
            let request = PollRequest {
                group,
                categories,
                granularity,
                start,
                end,
                days_back,
                access_type: if one_time {
                    AccessType::OneTimeSnapshot
                } else {
                    AccessType::Ongoing
                },
            };

            match runner::poll_group(args.config, request).await {
                Ok(summary) => {
                    summary.log();
                    if summary.has_failures() {
                        std::process::exit(1);
                    }
                }
                Err(err) => {
                    error!("failed to poll reports: {}", err);
                    std::process::exit(1);
                }
            }
        }
        Command::CreateRequests { group } => {
            match runner::create_report_requests(args.config, &group).await {
                Ok(summary) if summary.failed > 0 => std::process::exit(1),
                Ok(_) => {}
                Err(err) => {
                    error!("failed to create report requests: {}", err);
                    std::process::exit(1);
                }
            }
        }
        Command::DayKey {
            value,
            convention,
            time_zone,
        } => {
            let normalizer = DayKeyNormalizer::from_zone_name(&time_zone)?;
            let key = normalizer.normalize(&DateTimeSample::Text(value), convention)?;
            println!("{key}");
        }
    };

    Ok(())
}
