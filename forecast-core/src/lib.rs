//! Core library for the `forecast` CLI.
//!
//! This crate defines:
//! - A dependency-ordered task scheduler with a concurrency ceiling
//! - Site and forecast fetch pipelines built on top of it
//! - The orchestrator that serves cached sites or refreshes them
//! - Configuration, the HTTP fetch client and the on-disk site cache
//!
//! It is used by `forecast-cli`, but can also be reused by other binaries or services.

pub mod cache;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod model;
pub mod orchestrator;
pub mod scheduler;
pub mod task;

pub use cache::{JsonFileStore, MemoryStore, SiteStore, StoreError};
pub use client::{FetchClient, HttpFetchClient, LimitedFetchClient};
pub use config::Config;
pub use endpoint::Endpoints;
pub use model::{
    Coordinates, DetailedForecast, Forecast, ForecastKind, ForecastPeriod, SearchResult, Site,
    SnapshotForecast,
};
pub use orchestrator::{OrchestratorSettings, SiteOrchestrator, SiteSubscriber, StalenessPolicy};
pub use scheduler::{GraphError, RunSummary, Scheduler, Task, TaskGraph};
pub use task::{ForecastFetchTask, SiteFetchTask};
