use crate::api_client::{AccessType, AnalyticsApi, ApiClient, Granularity, ReportCategory};
use crate::config::{AppConfig, Config};
use crate::data::canonicalize_batch;
use crate::day_key::DayKeyNormalizer;
use crate::error::Error;
use crate::report::{
    ensure_report_request, poll_reports, DateWindow, FailureReason, PollOptions, PollTarget,
    RequestOutcome,
};
use crate::sink::{ParquetSink, RecordSink};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

/// What to poll for a group, as given on the command line.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub group: String,
    pub categories: Vec<ReportCategory>,
    pub granularity: Granularity,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub days_back: u32,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityStatus {
    Loaded { instances: usize, records: usize },
    NotReady,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOutcome {
    pub name: String,
    pub category: ReportCategory,
    pub status: EntityStatus,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<EntityOutcome>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|outcome| matches!(outcome.status, EntityStatus::Failed(_)))
    }

    pub fn log(&self) {
        for outcome in &self.outcomes {
            match &outcome.status {
                EntityStatus::Loaded { instances, records } => info!(
                    "{} {}: {} records stored after {} instances",
                    outcome.name, outcome.category, records, instances
                ),
                EntityStatus::NotReady => info!(
                    "{} {}: not ready yet, will retry next run",
                    outcome.name, outcome.category
                ),
                EntityStatus::Failed(reason) => error!(
                    "{} {}: failed ({})",
                    outcome.name, outcome.category, reason
                ),
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RequestSummary {
    pub created: usize,
    pub existing: usize,
    pub failed: usize,
}

/// Polls every app of a group and loads the rows into the Parquet sink.
pub async fn poll_group(config: Config, request: PollRequest) -> Result<RunSummary, Error> {
    let group = config.load_group(&request.group)?;
    let normalizer = group.normalizer()?;
    let credentials = config.credentials(&request.group, &group)?;

    let window = resolve_window(
        request.start,
        request.end,
        request.days_back,
        normalizer.today().date(),
    )?;

    info!(
        "Polling {} {:?} reports for group {} ({} apps) from {} to {}",
        request.granularity,
        request.categories,
        request.group,
        group.apps.len(),
        window.start(),
        window.end()
    );

    let api: Arc<dyn AnalyticsApi> = Arc::new(ApiClient::new(&credentials)?);
    let sink: Arc<dyn RecordSink> = Arc::new(ParquetSink::new(&config));

    let summary = poll_apps(
        api,
        sink,
        normalizer,
        &group.apps,
        &request,
        window,
        config.poll_options(),
        config.parallelism,
    )
    .await;

    Ok(summary)
}

/// Ensures an ongoing report request exists for every app of a group.
/// Needs credentials allowed to create requests.
pub async fn create_report_requests(config: Config, group_name: &str) -> Result<RequestSummary, Error> {
    let group = config.load_group(group_name)?;
    let credentials = config.credentials(group_name, &group)?;
    let api = ApiClient::new(&credentials)?;

    info!("Creating analytics report requests for group: {}", group_name);

    let summary = create_requests_for_apps(&api, &group.apps).await;

    info!(
        "Created: {}, already existed: {}, failed: {}",
        summary.created, summary.existing, summary.failed
    );
    if summary.created > 0 {
        info!("New report requests take one to two days to generate their first data");
    }

    Ok(summary)
}

/// Explicit start/end win; a missing bound is derived from `days_back`
/// and today's business day.
pub fn resolve_window(
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    days_back: u32,
    today: NaiveDate,
) -> Result<DateWindow, Error> {
    match (start, end) {
        (Some(start), Some(end)) => DateWindow::new(start, end),
        (Some(start), None) => DateWindow::new(start, today),
        (None, end) => DateWindow::trailing(end.unwrap_or(today), days_back),
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_apps(
    api: Arc<dyn AnalyticsApi>,
    sink: Arc<dyn RecordSink>,
    normalizer: DayKeyNormalizer,
    apps: &[AppConfig],
    request: &PollRequest,
    window: DateWindow,
    options: PollOptions,
    parallelism: usize,
) -> RunSummary {
    let mut categories: Vec<ReportCategory> = Vec::new();
    for category in &request.categories {
        if !categories.contains(category) {
            categories.push(*category);
        }
    }

    // one pipeline per (app, category); an unresolved app fails all of its pairs
    let mut pipelines = Vec::new();
    for (app, app_id) in resolve_app_ids(api.as_ref(), apps).await {
        let name = app.display_name().to_string();
        let app_id = app_id.map_err(|err| {
            error!("Skipping {}: {}", name, err);
            FailureReason::classify(&err)
        });
        for category in &categories {
            pipelines.push((name.clone(), *category, app_id.clone()));
        }
    }

    let outcomes = stream::iter(pipelines.into_iter().map(|(name, category, app_id)| {
        let api = api.clone();
        let sink = sink.clone();

        async move {
            let status = match app_id {
                Ok(app_id) => {
                    let target = PollTarget {
                        entity: app_id,
                        category,
                        granularity: request.granularity,
                        window,
                        access_type: request.access_type,
                    };
                    run_entity(api, sink, normalizer, target, options).await
                }
                Err(reason) => EntityStatus::Failed(reason),
            };
            EntityOutcome {
                name,
                category,
                status,
            }
        }
    }))
    .buffer_unordered(parallelism.max(1))
    .collect::<Vec<_>>()
    .await;

    RunSummary { outcomes }
}

/// Runs one entity's pipeline to completion and stores what it fetched.
async fn run_entity(
    api: Arc<dyn AnalyticsApi>,
    sink: Arc<dyn RecordSink>,
    normalizer: DayKeyNormalizer,
    target: PollTarget,
    options: PollOptions,
) -> EntityStatus {
    let entity = target.entity.clone();
    let category = target.category;

    let mut batches = Box::pin(poll_reports(api, target, options));
    let mut records = Vec::new();
    let mut instances = 0;
    let mut failure = None;

    while let Some(result) = batches.next().await {
        match result {
            Ok(batch) => {
                instances += 1;
                records.extend(canonicalize_batch(&batch, &normalizer));
            }
            Err(err) if err.is_not_ready() => return EntityStatus::NotReady,
            Err(err) => {
                error!("Error fetching {} for {}: {}", category, entity, err);
                failure = Some(FailureReason::classify(&err));
            }
        }
    }

    // batches fetched before a failure are complete instances, and the sink
    // merges them with what earlier runs stored
    let written = match sink.write(&entity, category, &records).await {
        Ok(written) => written,
        Err(err) => {
            error!("Error storing {} for {}: {}", category, entity, err);
            return EntityStatus::Failed(FailureReason::classify(&err));
        }
    };

    match failure {
        Some(reason) => EntityStatus::Failed(reason),
        None => EntityStatus::Loaded {
            instances,
            records: written,
        },
    }
}

/// Pairs each configured app with its provider ID, looking IDs up by bundle
/// ID when the config only names the bundle.
async fn resolve_app_ids(
    api: &dyn AnalyticsApi,
    apps: &[AppConfig],
) -> Vec<(AppConfig, Result<String, Error>)> {
    let needs_lookup = apps.iter().any(|app| app.app_id.is_none());

    let by_bundle: Result<HashMap<String, String>, String> = if needs_lookup {
        info!("Fetching list of accessible apps...");
        api.list_apps()
            .await
            .map(|listed| {
                listed
                    .into_iter()
                    .filter_map(|app| {
                        debug!("Accessible app {} ({:?})", app.id, app.name);
                        Some((app.bundle_id?, app.id))
                    })
                    .collect()
            })
            .map_err(|err| err.to_string())
    } else {
        Ok(HashMap::new())
    };

    apps.iter()
        .map(|app| {
            let app_id = match (&app.app_id, &app.bundle_id) {
                (Some(app_id), _) => Ok(app_id.clone()),
                (None, Some(bundle_id)) => match &by_bundle {
                    Ok(by_bundle) => by_bundle.get(bundle_id).cloned().ok_or_else(|| {
                        Error::EntityNotFound {
                            message: format!("no accessible app with bundle ID {bundle_id}"),
                        }
                    }),
                    Err(message) => Err(Error::EntityNotFound {
                        message: format!("could not list apps: {message}"),
                    }),
                },
                (None, None) => Err(Error::EntityNotFound {
                    message: "app has neither app_id nor bundle_id".to_string(),
                }),
            };
            (app.clone(), app_id)
        })
        .collect()
}

async fn create_requests_for_apps(api: &dyn AnalyticsApi, apps: &[AppConfig]) -> RequestSummary {
    let mut summary = RequestSummary::default();

    for (app, app_id) in resolve_app_ids(api, apps).await {
        let app_id = match app_id {
            Ok(app_id) => app_id,
            Err(err) => {
                warn!("Could not find app ID for {}: {}", app.display_name(), err);
                summary.failed += 1;
                continue;
            }
        };

        match ensure_report_request(api, &app_id, AccessType::Ongoing).await {
            Ok(RequestOutcome::Created(id)) => {
                info!("{}: created ONGOING report request {}", app.display_name(), id);
                summary.created += 1;
            }
            Ok(RequestOutcome::Existing(id)) => {
                info!("{}: ONGOING report request already exists: {}", app.display_name(), id);
                summary.existing += 1;
            }
            Err(err) => {
                error!("{}: {}", app.display_name(), err);
                summary.failed += 1;
            }
        }
    }

    summary
}
