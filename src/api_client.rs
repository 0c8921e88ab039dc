use crate::error::Error;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use log::debug;
use reqwest::{header::AUTHORIZATION, Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Largest page size the API accepts.
const PAGE_LIMIT: &str = "200";

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AnalyticsApi: Send + Sync + 'static {
    /// Lists every app visible to the credentials.
    async fn list_apps(&self) -> Result<Vec<App>, Error>;

    /// Lists the standing report requests of an app with the given access type.
    async fn list_report_requests(
        &self,
        app_id: &str,
        access_type: AccessType,
    ) -> Result<Vec<ReportRequest>, Error>;

    /// Creates a report request. Fails with [`Error::AlreadyExists`] when the
    /// provider already holds an equivalent one.
    async fn create_report_request(
        &self,
        app_id: &str,
        access_type: AccessType,
    ) -> Result<ReportRequest, Error>;

    /// Lists the reports of a request, filtered by category.
    async fn list_reports(
        &self,
        request_id: &str,
        category: ReportCategory,
    ) -> Result<Vec<AnalyticsReport>, Error>;

    /// Lists the materialized instances of a report at one granularity.
    async fn list_instances(
        &self,
        report_id: &str,
        granularity: Granularity,
    ) -> Result<Vec<ReportInstance>, Error>;

    /// Lists the downloadable segments of an instance. Each call hands out
    /// fresh download locations.
    async fn list_segments(&self, instance_id: &str) -> Result<Vec<ReportSegment>, Error>;

    /// Downloads the raw segment payload. An expired location yields
    /// [`Error::LocationExpired`].
    async fn fetch_segment(&self, segment: &ReportSegment) -> Result<Vec<u8>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessType {
    Ongoing,
    OneTimeSnapshot,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Ongoing => "ONGOING",
            AccessType::OneTimeSnapshot => "ONE_TIME_SNAPSHOT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportCategory {
    AppStoreEngagement,
    AppStoreCommerce,
    AppUsage,
    FrameworkUsage,
    Performance,
}

impl ReportCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportCategory::AppStoreEngagement => "APP_STORE_ENGAGEMENT",
            ReportCategory::AppStoreCommerce => "APP_STORE_COMMERCE",
            ReportCategory::AppUsage => "APP_USAGE",
            ReportCategory::FrameworkUsage => "FRAMEWORK_USAGE",
            ReportCategory::Performance => "PERFORMANCE",
        }
    }
}

impl fmt::Display for ReportCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "DAILY",
            Granularity::Weekly => "WEEKLY",
            Granularity::Monthly => "MONTHLY",
        }
    }

    /// The next coarser granularity, if any.
    pub fn coarser(&self) -> Option<Granularity> {
        match self {
            Granularity::Daily => Some(Granularity::Weekly),
            Granularity::Weekly => Some(Granularity::Monthly),
            Granularity::Monthly => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub id: String,
    pub bundle_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub id: String,
    pub access_type: AccessType,
    pub stopped_due_to_inactivity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsReport {
    pub id: String,
    pub name: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportInstance {
    pub id: String,
    pub granularity: Granularity,
    pub processing_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSegment {
    pub id: String,
    pub url: String,
    pub checksum: Option<String>,
    pub size_in_bytes: Option<u64>,
    /// When the download location was handed out.
    pub resolved_at: DateTime<Utc>,
}

impl ReportSegment {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now - self.resolved_at >= ttl
    }
}

/// Everything needed to talk to the provider on behalf of one group.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_url: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct Document<T> {
    data: Vec<Resource<T>>,
    links: Option<Links>,
}

#[derive(Deserialize)]
struct SingleDocument<T> {
    data: Resource<T>,
}

#[derive(Deserialize)]
struct Resource<T> {
    id: String,
    attributes: T,
}

#[derive(Deserialize)]
struct Links {
    next: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppAttributes {
    bundle_id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequestAttributes {
    access_type: AccessType,
    #[serde(default)]
    stopped_due_to_inactivity: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportAttributes {
    name: Option<String>,
    category: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceAttributes {
    granularity: Granularity,
    processing_date: NaiveDate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentAttributes {
    url: Option<String>,
    checksum: Option<String>,
    size_in_bytes: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorDocument {
    errors: Vec<ErrorEntry>,
}

#[derive(Deserialize)]
struct ErrorEntry {
    title: Option<String>,
    detail: Option<String>,
}

impl From<Resource<ReportRequestAttributes>> for ReportRequest {
    fn from(resource: Resource<ReportRequestAttributes>) -> Self {
        ReportRequest {
            id: resource.id,
            access_type: resource.attributes.access_type,
            stopped_due_to_inactivity: resource.attributes.stopped_due_to_inactivity,
        }
    }
}

impl ApiClient {
    pub fn new(credentials: &Credentials) -> Result<Self, Error> {
        let client = Client::builder().timeout(credentials.timeout).build()?;

        Ok(ApiClient {
            client,
            base_url: credentials.api_url.to_string(),
            token: format!("Bearer {}", credentials.token),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Collects every page of a listing by following `links.next`.
    async fn get_all<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<Resource<T>>, Error> {
        let mut resources = vec![];
        let mut next = Some(url);

        while let Some(url) = next.take() {
            debug!("GET {}", url);

            let resp = self
                .client
                .get(url)
                .header(AUTHORIZATION, &self.token)
                .send()
                .await?;

            let page: Document<T> = check_status(resp).await?.json().await?;
            resources.extend(page.data);

            next = page
                .links
                .and_then(|links| links.next)
                .map(|next| Url::parse(&next))
                .transpose()?;
        }

        Ok(resources)
    }
}

#[async_trait::async_trait]
impl AnalyticsApi for ApiClient {
    async fn list_apps(&self) -> Result<Vec<App>, Error> {
        let mut url = self.endpoint(&["v1", "apps"])?;
        url.query_pairs_mut().append_pair("limit", PAGE_LIMIT);

        let apps = self.get_all::<AppAttributes>(url).await?;

        Ok(apps
            .into_iter()
            .map(|app| App {
                id: app.id,
                bundle_id: app.attributes.bundle_id,
                name: app.attributes.name,
            })
            .collect())
    }

    async fn list_report_requests(
        &self,
        app_id: &str,
        access_type: AccessType,
    ) -> Result<Vec<ReportRequest>, Error> {
        let mut url = self.endpoint(&["v1", "apps", app_id, "analyticsReportRequests"])?;
        url.query_pairs_mut()
            .append_pair("filter[accessType]", access_type.as_str())
            .append_pair("limit", PAGE_LIMIT);

        let requests = self.get_all::<ReportRequestAttributes>(url).await?;

        Ok(requests.into_iter().map(ReportRequest::from).collect())
    }

    async fn create_report_request(
        &self,
        app_id: &str,
        access_type: AccessType,
    ) -> Result<ReportRequest, Error> {
        let url = self.endpoint(&["v1", "analyticsReportRequests"])?;
        let payload = json!({
            "data": {
                "type": "analyticsReportRequests",
                "attributes": { "accessType": access_type.as_str() },
                "relationships": {
                    "app": { "data": { "type": "apps", "id": app_id } }
                }
            }
        });

        let resp = self
            .client
            .post(url)
            .header(AUTHORIZATION, &self.token)
            .json(&payload)
            .send()
            .await?;

        let created: SingleDocument<ReportRequestAttributes> = check_status(resp).await?.json().await?;

        Ok(created.data.into())
    }

    async fn list_reports(
        &self,
        request_id: &str,
        category: ReportCategory,
    ) -> Result<Vec<AnalyticsReport>, Error> {
        let mut url = self.endpoint(&["v1", "analyticsReportRequests", request_id, "reports"])?;
        url.query_pairs_mut()
            .append_pair("filter[category]", category.as_str())
            .append_pair("limit", PAGE_LIMIT);

        let reports = self.get_all::<ReportAttributes>(url).await?;

        Ok(reports
            .into_iter()
            .map(|report| AnalyticsReport {
                name: report.attributes.name.unwrap_or_else(|| report.id.clone()),
                category: report
                    .attributes
                    .category
                    .unwrap_or_else(|| category.as_str().to_string()),
                id: report.id,
            })
            .collect())
    }

    async fn list_instances(
        &self,
        report_id: &str,
        granularity: Granularity,
    ) -> Result<Vec<ReportInstance>, Error> {
        let mut url = self.endpoint(&["v1", "analyticsReports", report_id, "instances"])?;
        url.query_pairs_mut()
            .append_pair("filter[granularity]", granularity.as_str())
            .append_pair("limit", PAGE_LIMIT);

        let instances = self.get_all::<InstanceAttributes>(url).await?;

        Ok(instances
            .into_iter()
            .map(|instance| ReportInstance {
                id: instance.id,
                granularity: instance.attributes.granularity,
                processing_date: instance.attributes.processing_date,
            })
            .collect())
    }

    async fn list_segments(&self, instance_id: &str) -> Result<Vec<ReportSegment>, Error> {
        let mut url = self.endpoint(&["v1", "analyticsReportInstances", instance_id, "segments"])?;
        url.query_pairs_mut()
            .append_pair("fields[analyticsReportSegments]", "url,checksum,sizeInBytes")
            .append_pair("limit", PAGE_LIMIT);

        let segments = self.get_all::<SegmentAttributes>(url).await?;
        let resolved_at = Utc::now();

        Ok(segments
            .into_iter()
            .filter_map(|segment| {
                let url = segment.attributes.url?;
                Some(ReportSegment {
                    id: segment.id,
                    url,
                    checksum: segment.attributes.checksum,
                    size_in_bytes: segment.attributes.size_in_bytes,
                    resolved_at,
                })
            })
            .collect())
    }

    async fn fetch_segment(&self, segment: &ReportSegment) -> Result<Vec<u8>, Error> {
        // Segment locations are pre-signed; the API token must not be sent along.
        let resp = self.client.get(&segment.url).send().await?;

        match resp.status() {
            StatusCode::FORBIDDEN | StatusCode::GONE => Err(Error::LocationExpired {
                segment: segment.id.clone(),
            }),
            _ => {
                let bytes = check_status(resp).await?.bytes().await?;
                debug!("Downloaded {} bytes for segment {}", bytes.len(), segment.id);
                Ok(bytes.to_vec())
            }
        }
    }
}

async fn check_status(resp: Response) -> Result<Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status, error_message(&body)))
}

fn status_error(status: StatusCode, message: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::PermissionDenied { message },
        StatusCode::NOT_FOUND => Error::EntityNotFound { message },
        StatusCode::CONFLICT => Error::AlreadyExists { message },
        status => Error::UnexpectedStatus { status, message },
    }
}

/// Pulls the first human-readable message out of an error document,
/// falling back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorDocument>(body)
        .ok()
        .and_then(|doc| doc.errors.into_iter().next())
        .and_then(|entry| entry.detail.or(entry.title))
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(api_url: &str) -> Credentials {
        Credentials {
            api_url: api_url.to_string(),
            token: "test_token".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_list_apps_invalid_url() {
        let client = ApiClient::new(&credentials("invalid_url")).unwrap();

        let result = client.list_apps().await;
        assert!(matches!(result.unwrap_err(), Error::UrlParsingFailed(_)));
    }

    #[tokio::test]
    async fn test_list_segments_invalid_url() {
        let client = ApiClient::new(&credentials("invalid_url")).unwrap();

        let result = client.list_segments("instance-1").await;
        assert!(matches!(result.unwrap_err(), Error::UrlParsingFailed(_)));
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let client = ApiClient::new(&credentials("https://api.example.com/")).unwrap();
        let url = client
            .endpoint(&["v1", "apps", "12 34", "analyticsReportRequests"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/v1/apps/12%2034/analyticsReportRequests"
        );
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "role".to_string()),
            Error::PermissionDenied { message } if message == "role"
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, String::new()),
            Error::PermissionDenied { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, String::new()),
            Error::EntityNotFound { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT, String::new()),
            Error::AlreadyExists { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, String::new()),
            Error::UnexpectedStatus { status, .. } if status == StatusCode::BAD_GATEWAY
        ));
    }

    #[test]
    fn test_error_message_prefers_detail() {
        let body = r#"{"errors":[{"status":"403","code":"FORBIDDEN_ERROR","title":"Forbidden","detail":"The API key in use does not allow this request"}]}"#;
        assert_eq!(
            error_message(body),
            "The API key in use does not allow this request"
        );
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
    }

    #[test]
    fn test_instance_document_deserializes() {
        let body = r#"{
            "data": [
                {"type": "analyticsReportInstances", "id": "inst-1",
                 "attributes": {"granularity": "DAILY", "processingDate": "2025-10-07"}}
            ],
            "links": {"self": "https://api.example.com/v1/analyticsReports/r/instances",
                      "next": "https://api.example.com/v1/analyticsReports/r/instances?cursor=AQ"}
        }"#;
        let doc: Document<InstanceAttributes> = serde_json::from_str(body).unwrap();
        assert_eq!(doc.data.len(), 1);
        assert_eq!(doc.data[0].id, "inst-1");
        assert_eq!(doc.data[0].attributes.granularity, Granularity::Daily);
        assert_eq!(
            doc.data[0].attributes.processing_date,
            NaiveDate::from_ymd_opt(2025, 10, 7).unwrap()
        );
        assert!(doc.links.and_then(|l| l.next).is_some());
    }

    #[test]
    fn test_report_request_document_deserializes() {
        let body = r#"{"data": {"type": "analyticsReportRequests", "id": "req-1",
            "attributes": {"accessType": "ONGOING", "stoppedDueToInactivity": false}}}"#;
        let doc: SingleDocument<ReportRequestAttributes> = serde_json::from_str(body).unwrap();
        let request: ReportRequest = doc.data.into();
        assert_eq!(request.id, "req-1");
        assert_eq!(request.access_type, AccessType::Ongoing);
        assert!(!request.stopped_due_to_inactivity);
    }

    #[test]
    fn test_granularity_fallback_order() {
        assert_eq!(Granularity::Daily.coarser(), Some(Granularity::Weekly));
        assert_eq!(Granularity::Weekly.coarser(), Some(Granularity::Monthly));
        assert_eq!(Granularity::Monthly.coarser(), None);
    }

    #[test]
    fn test_segment_expiry() {
        let resolved_at = Utc::now();
        let segment = ReportSegment {
            id: "seg-1".to_string(),
            url: "https://example.com/seg-1".to_string(),
            checksum: None,
            size_in_bytes: None,
            resolved_at,
        };
        let ttl = TimeDelta::minutes(15);
        assert!(!segment.is_expired(resolved_at + TimeDelta::minutes(14), ttl));
        assert!(segment.is_expired(resolved_at + TimeDelta::minutes(15), ttl));
    }
}
