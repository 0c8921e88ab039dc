use crate::api_client::{
    AccessType, AnalyticsApi, AnalyticsReport, Granularity, ReportCategory, ReportInstance,
    ReportSegment,
};
use crate::decode::{decode_segment, ReportRow};
use crate::error::Error;
use chrono::{NaiveDate, TimeDelta, Utc};
use futures::stream::{self, Stream};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_SEGMENT_TTL_SECS: i64 = 15 * 60;
pub const DEFAULT_MAX_RESOLVE_ATTEMPTS: u32 = 3;

/// Inclusive range of processing dates a poll is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, Error> {
        if start > end {
            return Err(Error::StartDateAfterEndDate {
                start_date: start.to_string(),
                end_date: end.to_string(),
            });
        }
        Ok(DateWindow { start, end })
    }

    /// The `days` days ending on (and including) `end`.
    pub fn trailing(end: NaiveDate, days: u32) -> Result<Self, Error> {
        let start = end
            .checked_sub_signed(TimeDelta::days(i64::from(days.max(1)) - 1))
            .ok_or_else(|| Error::WindowOutOfRange {
                end: end.to_string(),
                days,
            })?;
        Ok(DateWindow { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// What one pipeline polls for.
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub entity: String,
    pub category: ReportCategory,
    pub granularity: Granularity,
    pub window: DateWindow,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// How long a segment's download location is trusted after listing.
    pub segment_ttl: TimeDelta,
    /// Fresh segment listings allowed per instance before giving up.
    pub max_resolve_attempts: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions {
            segment_ttl: TimeDelta::seconds(DEFAULT_SEGMENT_TTL_SECS),
            max_resolve_attempts: DEFAULT_MAX_RESOLVE_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PermissionDenied,
    EntityNotFound,
    MalformedPayload,
    LocationExpired,
    Storage,
    Transport,
}

impl FailureReason {
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::PermissionDenied { .. } => FailureReason::PermissionDenied,
            Error::EntityNotFound { .. } => FailureReason::EntityNotFound,
            Error::MalformedPayload { .. } => FailureReason::MalformedPayload,
            Error::LocationExpired { .. } => FailureReason::LocationExpired,
            Error::DataFusion(_) | Error::Arrow(_) | Error::Io(_) => FailureReason::Storage,
            _ => FailureReason::Transport,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FailureReason::PermissionDenied => "permission denied",
            FailureReason::EntityNotFound => "entity not found",
            FailureReason::MalformedPayload => "malformed payload",
            FailureReason::LocationExpired => "download location expired",
            FailureReason::Storage => "storage error",
            FailureReason::Transport => "transport error",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    NotRequested,
    Requested {
        request_id: String,
    },
    Listed,
    InstanceResolved {
        instance: ReportInstance,
    },
    SegmentResolved {
        instance: ReportInstance,
        segments: Vec<ReportSegment>,
    },
    Fetched,
    /// The provider has not generated the category yet; poll again later.
    NotReady,
    Failed(FailureReason),
}

/// All rows of one report instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportBatch {
    pub entity: String,
    pub category: ReportCategory,
    pub report_name: String,
    pub instance: ReportInstance,
    pub rows: Vec<ReportRow>,
}

enum Step {
    Advanced,
    Emitted(ReportBatch),
    Finished,
}

/// Whether [`ensure_report_request`] had to create the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Created(String),
    Existing(String),
}

impl RequestOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            RequestOutcome::Created(id) | RequestOutcome::Existing(id) => id,
        }
    }
}

/// Finds the standing report request for an app, creating it only when none
/// exists. A create that races with another creator and reports "already
/// exists" resolves to the existing request.
pub async fn ensure_report_request(
    api: &dyn AnalyticsApi,
    app_id: &str,
    access_type: AccessType,
) -> Result<RequestOutcome, Error> {
    if let Some(id) = find_active_request(api, app_id, access_type).await? {
        return Ok(RequestOutcome::Existing(id));
    }

    match api.create_report_request(app_id, access_type).await {
        Ok(request) => {
            info!(
                "Created {} report request {} for {}",
                access_type.as_str(),
                request.id,
                app_id
            );
            Ok(RequestOutcome::Created(request.id))
        }
        Err(Error::AlreadyExists { message }) => {
            debug!("Report request for {} already exists: {}", app_id, message);
            find_active_request(api, app_id, access_type)
                .await?
                .map(RequestOutcome::Existing)
                .ok_or_else(|| Error::RequestNotListed {
                    entity: app_id.to_string(),
                })
        }
        Err(err) => Err(err),
    }
}

async fn find_active_request(
    api: &dyn AnalyticsApi,
    app_id: &str,
    access_type: AccessType,
) -> Result<Option<String>, Error> {
    let requests = api.list_report_requests(app_id, access_type).await?;

    Ok(requests
        .into_iter()
        .find(|request| request.access_type == access_type && !request.stopped_due_to_inactivity)
        .map(|request| request.id))
}

/// Drives one (entity, category) pipeline through the report lifecycle.
pub struct ReportPoller {
    api: Arc<dyn AnalyticsApi>,
    target: PollTarget,
    options: PollOptions,
    state: PollState,
    reports: VecDeque<AnalyticsReport>,
    current_report: Option<AnalyticsReport>,
    instances: VecDeque<ReportInstance>,
    resolve_attempts: u32,
}

impl ReportPoller {
    pub fn new(api: Arc<dyn AnalyticsApi>, target: PollTarget, options: PollOptions) -> Self {
        ReportPoller {
            api,
            target,
            options,
            state: PollState::NotRequested,
            reports: VecDeque::new(),
            current_report: None,
            instances: VecDeque::new(),
            resolve_attempts: 0,
        }
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Runs transitions until the next instance is fully fetched.
    ///
    /// Returns `Ok(None)` once a terminal state is reached. An error moves
    /// the machine to [`PollState::NotReady`] or [`PollState::Failed`]; later
    /// calls return `Ok(None)`.
    pub async fn next_batch(&mut self) -> Result<Option<ReportBatch>, Error> {
        loop {
            match self.step().await {
                Ok(Step::Advanced) => continue,
                Ok(Step::Emitted(batch)) => return Ok(Some(batch)),
                Ok(Step::Finished) => return Ok(None),
                Err(err) => {
                    self.state = if err.is_not_ready() {
                        PollState::NotReady
                    } else {
                        PollState::Failed(FailureReason::classify(&err))
                    };
                    return Err(err);
                }
            }
        }
    }

    async fn step(&mut self) -> Result<Step, Error> {
        let state = std::mem::replace(&mut self.state, PollState::Listed);

        match state {
            PollState::NotRequested => {
                let outcome = ensure_report_request(
                    self.api.as_ref(),
                    &self.target.entity,
                    self.target.access_type,
                )
                .await?;
                self.state = PollState::Requested {
                    request_id: outcome.request_id().to_string(),
                };
                Ok(Step::Advanced)
            }
            PollState::Requested { request_id } => {
                let reports = self
                    .api
                    .list_reports(&request_id, self.target.category)
                    .await?;

                if reports.is_empty() {
                    info!(
                        "No {} reports available yet for {}",
                        self.target.category, self.target.entity
                    );
                    return Err(Error::NotReadyYet {
                        entity: self.target.entity.clone(),
                        category: self.target.category.to_string(),
                    });
                }

                self.reports = reports.into();
                self.state = PollState::Listed;
                Ok(Step::Advanced)
            }
            PollState::Listed => {
                if let Some(instance) = self.instances.pop_front() {
                    self.resolve_attempts = 0;
                    self.state = PollState::InstanceResolved { instance };
                    return Ok(Step::Advanced);
                }

                match self.reports.pop_front() {
                    Some(report) => {
                        info!("Processing report: {} ({})", report.name, report.category);
                        self.instances = self.resolve_instances(&report).await?.into();
                        self.current_report = Some(report);
                        self.state = PollState::Listed;
                        Ok(Step::Advanced)
                    }
                    None => {
                        self.state = PollState::Fetched;
                        Ok(Step::Finished)
                    }
                }
            }
            PollState::InstanceResolved { instance } => {
                let segments = self.api.list_segments(&instance.id).await?;
                self.resolve_attempts += 1;
                self.state = PollState::SegmentResolved { instance, segments };
                Ok(Step::Advanced)
            }
            PollState::SegmentResolved { instance, segments } => {
                self.fetch_instance(instance, segments).await
            }
            terminal => {
                self.state = terminal;
                Ok(Step::Finished)
            }
        }
    }

    /// Lists instances of a report inside the window, falling back to
    /// coarser granularities when the requested one has none.
    async fn resolve_instances(
        &self,
        report: &AnalyticsReport,
    ) -> Result<Vec<ReportInstance>, Error> {
        let mut granularity = Some(self.target.granularity);

        while let Some(current) = granularity {
            let listed = self.api.list_instances(&report.id, current).await?;
            let total = listed.len();
            let instances: Vec<ReportInstance> = listed
                .into_iter()
                .filter(|instance| self.target.window.contains(instance.processing_date))
                .collect();

            debug!(
                "Report {} has {} {} instances, {} inside the window",
                report.name,
                total,
                current,
                instances.len()
            );

            if !instances.is_empty() {
                return Ok(instances);
            }
            granularity = current.coarser();
        }

        info!(
            "No instances of {} for {} between {} and {}",
            report.name,
            self.target.entity,
            self.target.window.start(),
            self.target.window.end()
        );
        Ok(vec![])
    }

    async fn fetch_instance(
        &mut self,
        instance: ReportInstance,
        segments: Vec<ReportSegment>,
    ) -> Result<Step, Error> {
        let mut rows = Vec::new();

        for segment in &segments {
            debug!(
                "Fetching segment {} ({} bytes, checksum {})",
                segment.id,
                segment.size_in_bytes.unwrap_or_default(),
                segment.checksum.as_deref().unwrap_or("-")
            );

            let payload = if segment.is_expired(Utc::now(), self.options.segment_ttl) {
                Err(Error::LocationExpired {
                    segment: segment.id.clone(),
                })
            } else {
                self.api.fetch_segment(segment).await
            };

            let payload = match payload {
                Ok(payload) => payload,
                Err(Error::LocationExpired { segment }) => {
                    return self.re_resolve(instance, segment);
                }
                Err(err) => return Err(err),
            };

            let decoded = decode_segment(&payload).map_err(|err| Error::MalformedPayload {
                entity: self.target.entity.clone(),
                instance: instance.id.clone(),
                segment: segment.id.clone(),
                reason: err.to_string(),
            })?;
            rows.extend(decoded);
        }

        let report_name = self
            .current_report
            .as_ref()
            .map(|report| report.name.clone())
            .unwrap_or_default();

        info!(
            "Fetched {} rows of {} ({} {}) for {}",
            rows.len(),
            report_name,
            instance.granularity,
            instance.processing_date,
            self.target.entity
        );

        self.state = PollState::Listed;
        Ok(Step::Emitted(ReportBatch {
            entity: self.target.entity.clone(),
            category: self.target.category,
            report_name,
            instance,
            rows,
        }))
    }

    /// Sends the machine back for a fresh segment listing; the stale
    /// location is never fetched again.
    fn re_resolve(&mut self, instance: ReportInstance, segment: String) -> Result<Step, Error> {
        if self.resolve_attempts >= self.options.max_resolve_attempts {
            return Err(Error::LocationExpired { segment });
        }

        warn!(
            "Download location for segment {} of instance {} expired, listing segments again",
            segment, instance.id
        );
        self.state = PollState::InstanceResolved { instance };
        Ok(Step::Advanced)
    }
}

/// Polls one entity's reports as a lazy, finite stream of fetched instances.
///
/// The stream ends after the first error. Polling again from scratch is safe:
/// the standing request is reused and instances are immutable.
pub fn poll_reports(
    api: Arc<dyn AnalyticsApi>,
    target: PollTarget,
    options: PollOptions,
) -> impl Stream<Item = Result<ReportBatch, Error>> {
    let poller = ReportPoller::new(api, target, options);

    stream::unfold(Some(poller), |poller| async move {
        let mut poller = poller?;
        match poller.next_batch().await {
            Ok(Some(batch)) => Some((Ok(batch), Some(poller))),
            Ok(None) => {
                debug!("Poller finished in state {:?}", poller.state());
                None
            }
            Err(err) => Some((Err(err), None)),
        }
    })
}
