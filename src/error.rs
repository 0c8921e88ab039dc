use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Unable to parse '{value}' as a calendar date")]
    ParseError { value: String },

    #[error("The start date: '{start_date}' is greater than the end date: '{end_date}'")]
    StartDateAfterEndDate {
        start_date: String,
        end_date: String,
    },

    #[error("API request failed: {0}")]
    ApiFailure(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown time zone '{name}'")]
    UnknownTimeZone { name: String },

    #[error("Group '{group}' not found in {path}")]
    GroupNotFound { group: String, path: String },

    #[error("No API token configured for group '{group}'")]
    MissingToken { group: String },

    #[error("No {category} reports available yet for {entity}")]
    NotReadyYet { entity: String, category: String },

    #[error("Report request for {entity} already exists but is not listed yet")]
    RequestNotListed { entity: String },

    #[error("Cannot look back {days} days from {end}")]
    WindowOutOfRange { end: String, days: u32 },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Not found: {message}")]
    EntityNotFound { message: String },

    #[error("Already exists: {message}")]
    AlreadyExists { message: String },

    #[error("Download location for segment {segment} has expired")]
    LocationExpired { segment: String },

    #[error("Malformed payload for {entity} (instance {instance}, segment {segment}): {reason}")]
    MalformedPayload {
        entity: String,
        instance: String,
        segment: String,
        reason: String,
    },

    #[error("API responded with {status}: {message}")]
    UnexpectedStatus { status: StatusCode, message: String },
}

impl Error {
    /// Whether the provider simply has nothing for us yet and a later run
    /// may succeed.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Error::NotReadyYet { .. } | Error::RequestNotListed { .. }
        )
    }
}
