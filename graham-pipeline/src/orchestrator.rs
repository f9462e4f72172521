//! Batch orchestration.
//!
//! The orchestrator owns every pipeline component and hands cloned handles to
//! each attempt: rate limit the target host, lease a relay, fetch, report the
//! relay's result, then parse and value the record. The worker pool turns
//! attempts into one terminal outcome per security; partial failures never
//! abort the batch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use graham_common::logging::generate_batch_id;
use graham_common::Validate;

use crate::backoff::RetryBackoff;
use crate::config::{PipelineConfig, SourceConfig};
use crate::error::{FailureKind, PipelineError, TaskFailure};
use crate::fetcher::{FetchError, Fetcher};
use crate::proxy::{ProxyPool, ProxyState};
use crate::rate_limiter::{host_key, RateLimiter};
use crate::valuation::{FinancialRecord, ValuationEngine, ValuationResult};
use crate::worker::{Attempt, CancelSignal, Task, TaskContext, WorkerPool};

/// Placeholder replaced by the security id in source URL templates.
const ID_PLACEHOLDER: &str = "{id}";

// ============================================================================
// Report
// ============================================================================

/// Why a security has no valuation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    #[serde(flatten)]
    pub kind: FailureKind,
    pub detail: String,
    pub attempts: u32,
}

/// Result of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub succeeded: BTreeMap<String, ValuationResult>,
    pub failed: BTreeMap<String, BatchFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Failed securities grouped by failure kind.
    pub fn failure_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for failure in self.failed.values() {
            *counts.entry(failure.kind.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

// ============================================================================
// Source Selection
// ============================================================================

/// Which configured source an attempt goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Primary,
    Fallback,
}

/// The primary takes attempts `1..=max_attempts` when enabled; the fallback
/// takes whatever follows (or everything when the primary is disabled).
pub fn select_source(source: &SourceConfig, max_attempts: u32, attempt: u32) -> SourceKind {
    let has_fallback = source.fallback_url_template.is_some();
    if !source.primary_enabled && has_fallback {
        return SourceKind::Fallback;
    }
    if attempt > max_attempts && has_fallback {
        SourceKind::Fallback
    } else {
        SourceKind::Primary
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Components shared by every attempt.
struct Pipeline {
    config: PipelineConfig,
    proxies: Arc<ProxyPool>,
    limiter: RateLimiter,
    primary: Arc<dyn Fetcher>,
    fallback: Option<Arc<dyn Fetcher>>,
    engine: ValuationEngine,
}

impl Pipeline {
    fn url_for(&self, kind: SourceKind, security_id: &str) -> String {
        let template = match kind {
            SourceKind::Fallback => self
                .config
                .source
                .fallback_url_template
                .as_deref()
                .unwrap_or(&self.config.source.primary_url_template),
            SourceKind::Primary => &self.config.source.primary_url_template,
        };
        template.replace(ID_PLACEHOLDER, security_id)
    }

    fn fetcher_for(&self, kind: SourceKind) -> &dyn Fetcher {
        match (kind, &self.fallback) {
            (SourceKind::Fallback, Some(fetcher)) => fetcher.as_ref(),
            _ => self.primary.as_ref(),
        }
    }

    fn direct_mode(&self) -> bool {
        self.proxies.is_empty() && !self.config.proxy.required
    }

    async fn run_attempt(&self, ctx: TaskContext) -> Attempt<ValuationResult> {
        let source = select_source(&self.config.source, self.config.max_attempts, ctx.attempt);
        let url = self.url_for(source, &ctx.target_id);
        let fetcher = self.fetcher_for(source);

        self.limiter.acquire(&host_key(&url)).await;

        let lease = if self.direct_mode() {
            None
        } else {
            match self.proxies.get() {
                Ok(lease) => Some(lease),
                Err(e) => {
                    debug!(security_id = %ctx.target_id, attempt = ctx.attempt, "No proxy available");
                    return Attempt::direct(Err(TaskFailure::new(FailureKind::ProxyExhausted, e.to_string())));
                }
            }
        };
        let route = lease.as_ref().map(|lease| lease.route().clone());

        let timeout = self.config.fetch_timeout();
        let start = Instant::now();
        let fetched = tokio::time::timeout(timeout, fetcher.fetch(&url, route.as_ref(), timeout))
            .await
            .unwrap_or(Err(FetchError::Timeout));
        let latency = start.elapsed();

        if let Some(lease) = lease {
            if self.proxies.report(lease, fetched.is_ok(), latency) == Some(ProxyState::Banned) {
                if let Some(route) = &route {
                    fetcher.release_route(route);
                }
            }
        }
        let proxy = route.map(|route| route.address);

        let payload = match fetched {
            Ok(payload) => payload,
            Err(e) => {
                debug!(
                    security_id = %ctx.target_id,
                    attempt = ctx.attempt,
                    source = ?source,
                    fetcher = fetcher.name(),
                    error = %e,
                    "Fetch failed"
                );
                return Attempt {
                    proxy,
                    result: Err(e.into()),
                };
            }
        };

        let result = FinancialRecord::from_payload(&payload).and_then(|record| {
            self.engine
                .evaluate(&ctx.target_id, &record, Utc::now())
                .map_err(TaskFailure::from)
        });
        Attempt { proxy, result }
    }
}

/// Runs batches of securities through fetch and valuation.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    workers: WorkerPool,
}

impl Orchestrator {
    /// Validate `config` and build the pipeline. Any configuration error is
    /// returned before a task can be dispatched.
    pub fn new(config: PipelineConfig, proxies: Arc<ProxyPool>, fetcher: Arc<dyn Fetcher>) -> Result<Self, PipelineError> {
        config.validate()?;

        let limiter = RateLimiter::new(config.rate_limit_per_host.clone())?;
        let engine = ValuationEngine::new(config.valuation_thresholds.clone())?;
        let backoff = RetryBackoff::from_config(&config);
        let workers = WorkerPool::new(config.worker_count)?
            .with_backoff(backoff)
            .with_cancel_grace(config.cancel_grace());

        Ok(Self {
            pipeline: Arc::new(Pipeline {
                config,
                proxies,
                limiter,
                primary: fetcher,
                fallback: None,
                engine,
            }),
            workers,
        })
    }

    /// Use a separate fetcher for the fallback source.
    pub fn with_fallback_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        match Arc::get_mut(&mut self.pipeline) {
            Some(pipeline) => pipeline.fallback = Some(fetcher),
            None => warn!("Pipeline already shared, fallback fetcher ignored"),
        }
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.pipeline.config
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.pipeline.proxies
    }

    /// Value every id once. Duplicates are collapsed.
    pub async fn run_batch<I, S>(&self, security_ids: I) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.run_batch_with_cancel(security_ids, CancelSignal::never()).await
    }

    /// [`Self::run_batch`] with batch-level cancellation.
    pub async fn run_batch_with_cancel<I, S>(&self, security_ids: I, cancel: CancelSignal) -> BatchReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let batch_id = generate_batch_id();
        let started_at = Utc::now();
        let clock = Instant::now();
        let pipeline = &self.pipeline;
        let config = &pipeline.config;

        let ids: BTreeSet<String> = security_ids
            .into_iter()
            .map(|id| id.as_ref().trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        info!(
            batch_id = %batch_id,
            securities = ids.len(),
            workers = self.workers.worker_count(),
            proxies = pipeline.proxies.len(),
            "Starting batch"
        );

        if pipeline.direct_mode() {
            debug!(batch_id = %batch_id, "No proxies registered, fetching directly");
        } else {
            pipeline
                .proxies
                .verify_inactive(
                    pipeline.primary.as_ref(),
                    &config.proxy.canary_url,
                    config.proxy.check_timeout(),
                )
                .await;
        }

        let budget = config.attempt_budget();
        let tasks: Vec<Task> = ids
            .into_iter()
            .enumerate()
            .map(|(index, id)| Task::new(index, id, budget))
            .collect();

        let handler = {
            let pipeline = Arc::clone(pipeline);
            move |ctx: TaskContext| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.run_attempt(ctx).await }
            }
        };
        let outcomes = self.workers.submit_tasks_with_cancel(tasks, handler, cancel).await;

        let mut succeeded = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for outcome in outcomes.into_values() {
            match outcome.result {
                Ok(result) => {
                    succeeded.insert(outcome.target_id, result);
                }
                Err(failure) => {
                    warn!(
                        batch_id = %batch_id,
                        security_id = %outcome.target_id,
                        attempts = outcome.attempts,
                        error = %failure,
                        "Security failed"
                    );
                    failed.insert(
                        outcome.target_id,
                        BatchFailure {
                            kind: failure.kind,
                            detail: failure.detail,
                            attempts: outcome.attempts,
                        },
                    );
                }
            }
        }

        let report = BatchReport {
            batch_id,
            succeeded,
            failed,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            batch_id = %report.batch_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "Batch complete"
        );
        report
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn source(fallback: bool, primary_enabled: bool) -> SourceConfig {
        SourceConfig {
            fallback_url_template: fallback.then(|| "https://backup.example.com/{id}".to_string()),
            primary_enabled,
            ..Default::default()
        }
    }

    #[test]
    fn test_select_source_primary_only() {
        let source = source(false, true);
        for attempt in 1..=5 {
            assert_eq!(select_source(&source, 3, attempt), SourceKind::Primary);
        }
    }

    #[test]
    fn test_select_source_falls_back_after_primary_budget() {
        let source = source(true, true);
        assert_eq!(select_source(&source, 3, 1), SourceKind::Primary);
        assert_eq!(select_source(&source, 3, 3), SourceKind::Primary);
        assert_eq!(select_source(&source, 3, 4), SourceKind::Fallback);
    }

    #[test]
    fn test_select_source_primary_disabled() {
        let source = source(true, false);
        assert_eq!(select_source(&source, 3, 1), SourceKind::Fallback);
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = PipelineConfig {
            rate_limit_per_host: crate::config::RateLimitConfig {
                capacity: 0,
                refill_per_sec: 1.0,
            },
            ..Default::default()
        };
        let proxies = Arc::new(ProxyPool::new(&config.proxy));
        let fetcher: Arc<dyn Fetcher> = Arc::new(crate::fetcher::HttpFetcher::default());

        assert!(matches!(
            Orchestrator::new(config, proxies, fetcher),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_failure_counts() {
        let failure = |kind| BatchFailure {
            kind,
            detail: String::new(),
            attempts: 1,
        };
        let report = BatchReport {
            batch_id: "b".into(),
            succeeded: BTreeMap::new(),
            failed: BTreeMap::from([
                ("A".to_string(), failure(FailureKind::ParseError)),
                ("B".to_string(), failure(FailureKind::ParseError)),
                ("C".to_string(), failure(FailureKind::HttpStatus(404))),
            ]),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        let counts = report.failure_counts();
        assert_eq!(counts["parse error"], 2);
        assert_eq!(counts["HTTP status 404"], 1);
        assert_eq!(report.total(), 3);
    }
}
