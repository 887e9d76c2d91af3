use std::sync::Arc;

use anyhow::Context;
use bidscout_adapters::{
    scrape_detail, scrape_list, CancelSignal, DetailScrape, FetchLayer, PageFetcher,
    ScrapeContext,
};
use bidscout_core::{
    is_quota_or_credential_failure, CollectionResult, ListSettingsRecord, OrganizationDetailConfig,
    OrganizationListConfig, RawNoticeRow, RunStatus, ScrapeError,
};
use bidscout_storage::{ArtifactStore, BrowserPool, HttpFetcher};
use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::RuleSet;
use crate::config::SyncConfig;
use crate::reconcile::Reconciler;
use crate::store::{NoticeDetailRecord, NoticeStore, RunLog};

/// Organizations with fewer scraped rows are reported as suspicious.
pub const MIN_EXPECTED_ROWS: usize = 2;

/// Inclusive posted-date window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    /// Cap on the number of organizations processed.
    pub limit: Option<usize>,
    pub dry_run: bool,
    /// Store every fetched page under the artifacts directory.
    pub debug: bool,
    pub date_range: Option<DateRange>,
}

/// Outcome of one batch run: the total plus one result per organization.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub total: CollectionResult,
    pub organizations: Vec<CollectionResult>,
}

pub struct Orchestrator {
    config: SyncConfig,
    store: Arc<dyn NoticeStore>,
    fetcher: Arc<dyn PageFetcher>,
    reconciler: Reconciler,
    cancel: CancelSignal,
}

impl Orchestrator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn NoticeStore>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone());
        Self {
            config,
            store,
            fetcher,
            reconciler,
            cancel: CancelSignal::never(),
        }
    }

    /// Wires the production fetch layer: shared HTTP client plus a browser
    /// pool when this build has browser support.
    pub fn with_fetch_layer(config: SyncConfig, store: Arc<dyn NoticeStore>) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let pool = BrowserPool::new(config.browser_pool_config());
        let browser = if pool.is_available() {
            Some(Arc::new(pool))
        } else {
            warn!("browser support not compiled in; pages needing javascript will fail");
            None
        };
        let fetcher = Arc::new(FetchLayer::new(Arc::new(http), browser));
        Ok(Self::new(config, store, fetcher))
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Arc<dyn NoticeStore> {
        &self.store
    }

    fn context(&self, run_id: Uuid, options: &RunOptions) -> ScrapeContext {
        let debug_store = options
            .debug
            .then(|| ArtifactStore::new(self.config.artifacts_dir.clone()));
        ScrapeContext::new(run_id, Utc::now())
            .with_cancel(self.cancel.clone())
            .with_debug_store(debug_store)
            .with_page_concurrency(self.config.page_concurrency)
    }

    async fn load_rules(&self) -> Result<RuleSet, ScrapeError> {
        let rules = RuleSet::from_records(self.store.active_rules().await?);
        info!(rules = rules.len(), "category rules loaded");
        Ok(rules)
    }

    /// Scrapes, filters, classifies and persists one organization. Every
    /// failure is recorded on the returned result.
    async fn collect_org(
        &self,
        record: ListSettingsRecord,
        rules: &RuleSet,
        ctx: &ScrapeContext,
        options: &RunOptions,
    ) -> CollectionResult {
        let org_name = record.org_name.clone();
        let mut result = CollectionResult::new(&org_name, Utc::now());

        let config = match OrganizationListConfig::from_record(record) {
            Ok(config) => config,
            Err(err) => {
                result.record_error(&err);
                result.finish(Utc::now());
                return result;
            }
        };

        let scrape = scrape_list(self.fetcher.as_ref(), &config, ctx).await;
        result.total_seen = scrape.seen;
        result.collected = scrape.rows.len();
        result.dropped = scrape.dropped;
        for warning in &scrape.warnings {
            result.record_error(warning);
        }
        if let Some(err) = &scrape.error {
            result.record_error(err);
        } else if scrape.rows.len() < MIN_EXPECTED_ROWS {
            result.record_error(&ScrapeError::RowValidation {
                field: "rows".to_string(),
                message: format!("only {} rows collected", scrape.rows.len()),
            });
        }

        let rows: Vec<RawNoticeRow> = match options.date_range {
            Some(range) => scrape
                .rows
                .into_iter()
                .filter(|row| range.contains(row.posted_date))
                .collect(),
            None => scrape.rows,
        };

        if !rows.is_empty() {
            match self.persist(&org_name, rows, rules, options.dry_run).await {
                Ok((new, inserted, archived)) => {
                    result.new = new;
                    result.inserted = inserted;
                    result.archived = archived;
                }
                Err(err) => result.record_error(&err),
            }
        }

        result.finish(Utc::now());
        info!(
            org_name,
            seen = result.total_seen,
            collected = result.collected,
            new = result.new,
            inserted = result.inserted,
            archived = result.archived,
            errors = result.error_count,
            "organization finished"
        );
        result
    }

    async fn persist(
        &self,
        org_name: &str,
        rows: Vec<RawNoticeRow>,
        rules: &RuleSet,
        dry_run: bool,
    ) -> Result<(usize, usize, usize), ScrapeError> {
        let fresh = self.reconciler.filter_new(org_name, rows).await?;
        let new = fresh.len();
        let classified = rules.classify(fresh);
        let outcome = self.reconciler.reconcile(org_name, classified, dry_run).await?;
        Ok((new, outcome.inserted, outcome.archived))
    }

    fn skipped(org_name: &str, reason: &ScrapeError) -> CollectionResult {
        let now = Utc::now();
        let mut result = CollectionResult::new(org_name, now);
        result.record_error(reason);
        result.finish(now);
        result
    }

    /// Runs every active organization in bounded concurrent chunks.
    pub async fn run_batch(&self, options: &RunOptions) -> BatchReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("run_batch", %run_id, dry_run = options.dry_run);
        async move {
            let started_at = Utc::now();
            let mut total = CollectionResult::new("batch", started_at);
            let mut organizations = Vec::new();

            let (records, rules) = match self.batch_inputs(options).await {
                Ok(inputs) => inputs,
                Err(err) => {
                    error!(error = %err, "could not load run inputs");
                    total.record_error(&err);
                    total.finish(Utc::now());
                    self.write_log(run_id, "sync", options, &total).await;
                    return BatchReport { run_id, total, organizations };
                }
            };

            info!(organizations = records.len(), "batch starting");
            let ctx = self.context(run_id, options);
            let mut abort: Option<ScrapeError> = None;

            for chunk in records.chunks(self.config.org_batch_size.max(1)) {
                if abort.is_none() && self.cancel.is_cancelled() {
                    abort = Some(ScrapeError::Cancelled);
                }
                if let Some(reason) = &abort {
                    organizations.extend(chunk.iter().map(|r| Self::skipped(&r.org_name, reason)));
                    continue;
                }

                let results = join_all(
                    chunk
                        .iter()
                        .cloned()
                        .map(|record| self.collect_org(record, &rules, &ctx, options)),
                )
                .await;

                if let Some(failure) = results.iter().flat_map(|r| r.errors.iter()).find(|e| {
                    is_quota_or_credential_failure(e)
                }) {
                    warn!(error = %failure, "quota or credential failure, aborting run");
                    abort = Some(ScrapeError::Unknown(format!(
                        "run aborted after quota or credential failure: {failure}"
                    )));
                }
                organizations.extend(results);
            }

            for result in &organizations {
                total.absorb(result);
            }
            if abort.is_some() && total.status == RunStatus::Success {
                total.status = RunStatus::Failed;
            }
            total.finish(Utc::now());
            self.write_log(run_id, "sync", options, &total).await;
            info!(
                collected = total.collected,
                inserted = total.inserted,
                archived = total.archived,
                errors = total.error_count,
                "batch finished"
            );
            BatchReport { run_id, total, organizations }
        }
        .instrument(span)
        .await
    }

    async fn batch_inputs(
        &self,
        options: &RunOptions,
    ) -> Result<(Vec<ListSettingsRecord>, RuleSet), ScrapeError> {
        let mut records: Vec<_> = self
            .store
            .list_configs()
            .await?
            .into_iter()
            .filter(|r| r.active)
            .collect();
        if let Some(limit) = options.limit {
            records.truncate(limit);
        }
        Ok((records, self.load_rules().await?))
    }

    /// Runs one organization regardless of its active flag.
    pub async fn run_single(&self, org_name: &str, options: &RunOptions) -> CollectionResult {
        let run_id = Uuid::new_v4();
        let span = info_span!("run_single", %run_id, org_name);
        async move {
            let inputs = async {
                let record = self.store.list_config(org_name).await?.ok_or_else(|| {
                    ScrapeError::ConfigurationMissing {
                        org_name: org_name.to_string(),
                        detail: "no list settings row".to_string(),
                    }
                })?;
                Ok::<_, ScrapeError>((record, self.load_rules().await?))
            };
            let result = match inputs.await {
                Ok((record, rules)) => {
                    let ctx = self.context(run_id, options);
                    self.collect_org(record, &rules, &ctx, options).await
                }
                Err(err) => Self::skipped(org_name, &err),
            };
            self.write_log(run_id, "scrape", options, &result).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Scrapes the detail page of a stored notice and upserts the fields.
    pub async fn fetch_notice_detail(
        &self,
        notice_id: i64,
        options: &RunOptions,
    ) -> Result<DetailScrape, ScrapeError> {
        let run_id = Uuid::new_v4();
        let notice = self.store.notice(notice_id).await?.ok_or_else(|| {
            ScrapeError::Unknown(format!("notice {notice_id} does not exist"))
        })?;
        let record = self
            .store
            .detail_config(&notice.org_name)
            .await?
            .ok_or_else(|| ScrapeError::ConfigurationMissing {
                org_name: notice.org_name.clone(),
                detail: "no detail settings row".to_string(),
            })?;
        let config = OrganizationDetailConfig::from_record(record)?;

        let ctx = self.context(run_id, options);
        let scrape = scrape_detail(
            self.fetcher.as_ref(),
            &notice.org_name,
            &notice.detail_url,
            &config,
            &ctx,
        )
        .await;
        if let Some(err) = &scrape.error {
            return Err(err.clone());
        }

        if !options.dry_run {
            self.store
                .upsert_detail(&NoticeDetailRecord {
                    notice_id,
                    org_name: notice.org_name.clone(),
                    detail_url: notice.detail_url.clone(),
                    fields: scrape.fields.clone(),
                    scraped_at: ctx.scraped_at,
                })
                .await?;
        }
        Ok(scrape)
    }

    async fn write_log(
        &self,
        run_id: Uuid,
        endpoint: &str,
        options: &RunOptions,
        result: &CollectionResult,
    ) {
        if options.dry_run {
            return;
        }
        let log = RunLog {
            run_id,
            endpoint: endpoint.to_string(),
            params: serde_json::to_value(options).unwrap_or_default(),
            total_seen: result.total_seen,
            collected: result.collected,
            new: result.new,
            inserted: result.inserted,
            archived: result.archived,
            error_count: result.error_count,
            status: result.status,
            error_text: (!result.errors.is_empty()).then(|| result.errors.join("\n")),
            started_at: result.started_at,
            finished_at: result.finished_at.unwrap_or_else(Utc::now),
        };
        if let Err(err) = self.store.append_run_log(&log).await {
            warn!(%run_id, error = %err, "could not append run log");
        }
    }
}

/// Cron scheduler running a full batch on `cron`.
pub async fn build_scheduler(
    orchestrator: Arc<Orchestrator>,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            let report = orchestrator.run_batch(&RunOptions::default()).await;
            info!(
                run_id = %report.run_id,
                inserted = report.total.inserted,
                errors = report.total.error_count,
                "scheduled sync finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
