//! Graham Pipeline Library
//!
//! Concurrent acquisition of per-security financial data from a rate-limited,
//! anti-scraping source, followed by Graham-style valuation scoring.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                                │
//! │   run_batch(ids) ──► WorkerPool (N consumers, one shared queue)      │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  per attempt:                                                        │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────┐  │
//! │  │ RateLimiter │──►│  ProxyPool  │──►│   Fetcher   │──►│Valuation │  │
//! │  │ (per host)  │   │ get/report  │   │ (HTTP/mock) │   │  Engine  │  │
//! │  └─────────────┘   └─────────────┘   └─────────────┘   └──────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failure Handling
//!
//! Each attempt ends in a typed [`FailureKind`] or a [`ValuationResult`].
//! Transient kinds are retried with exponential backoff and jitter up to the
//! task's attempt budget; everything else is recorded in the [`BatchReport`]
//! and the batch carries on.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod orchestrator;
pub mod proxy;
pub mod rate_limiter;
pub mod valuation;
pub mod worker;

pub use backoff::RetryBackoff;
pub use config::{PipelineConfig, ProxyConfig, RateLimitConfig, SourceConfig};
pub use error::{retry_decision, FailureKind, PipelineError, RetryDecision, TaskFailure};
pub use fetcher::{FetchError, Fetcher, HttpFetcher, ProxyRoute};
pub use orchestrator::{select_source, BatchFailure, BatchReport, Orchestrator, SourceKind};
pub use proxy::{ProxyEndpoint, ProxyLease, ProxyPool, ProxyPoolError, ProxyState};
pub use rate_limiter::RateLimiter;
pub use valuation::{FinancialRecord, RecommendationTier, RiskLevel, ValuationEngine, ValuationResult};
pub use worker::{cancel_channel, Attempt, CancelHandle, CancelSignal, Task, TaskContext, TaskOutcome, WorkerPool};
