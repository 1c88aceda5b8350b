//! Top-level coordination of site refreshes.
//!
//! [`SiteOrchestrator`] owns the published site collection. It decides between
//! serving the cache and refreshing every cached site over the network, and it
//! is the only writer of the collection, the cache store and the subscriber list.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    Config,
    cache::{JsonFileStore, SiteStore},
    client::{FetchClient, HttpFetchClient, LimitedFetchClient},
    endpoint::Endpoints,
    model::{SearchResult, Site},
    scheduler::{Scheduler, TaskGraph, gate},
    task::SiteFetchTask,
};

/// Site fetch pipelines allowed to run at once during a refresh.
pub const DEFAULT_MAX_CONCURRENT_SITES: usize = 5;

/// Receives the published collection every time it changes.
pub trait SiteSubscriber: Send + Sync {
    fn sites_changed(&self, sites: &[Site]);
}

impl<F> SiteSubscriber for F
where
    F: Fn(&[Site]) + Send + Sync,
{
    fn sites_changed(&self, sites: &[Site]) {
        self(sites)
    }
}

/// Fixed freshness window for the whole cached collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    window: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::new(Duration::minutes(3))
    }
}

impl StalenessPolicy {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// A collection never refreshed is not stale: there is nothing to measure against.
    pub fn is_stale(&self, last_refreshed: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last_refreshed.is_some_and(|at| now - at > self.window)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_concurrent_sites: usize,
    pub staleness: StalenessPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sites: DEFAULT_MAX_CONCURRENT_SITES,
            staleness: StalenessPolicy::default(),
        }
    }
}

pub struct SiteOrchestrator {
    client: Arc<dyn FetchClient>,
    endpoints: Arc<Endpoints>,
    store: Arc<dyn SiteStore>,
    settings: OrchestratorSettings,
    sites: RwLock<Option<Vec<Site>>>,
    subscribers: RwLock<Vec<Arc<dyn SiteSubscriber>>>,
}

impl std::fmt::Debug for SiteOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteOrchestrator")
            .field("endpoints", &self.endpoints)
            .field("settings", &self.settings)
            .field("sites", &self.sites.read().as_ref().map(Vec::len))
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

impl SiteOrchestrator {
    pub fn new(
        client: Arc<dyn FetchClient>,
        endpoints: Endpoints,
        store: Arc<dyn SiteStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            client,
            endpoints: Arc::new(endpoints),
            store,
            settings,
            sites: RwLock::new(None),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Wires the HTTP client, endpoints and on-disk cache described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let endpoints = config.endpoints()?;
        let http = HttpFetchClient::new(config.request_timeout(), config.api.api_key.clone())?;
        let client: Arc<dyn FetchClient> = match config.refresh.max_in_flight_requests {
            Some(limit) => Arc::new(LimitedFetchClient::new(http, limit)),
            None => Arc::new(http),
        };
        let store = Arc::new(JsonFileStore::new(Config::cache_file_path()?));

        Ok(Self::new(client, endpoints, store, config.orchestrator_settings()))
    }

    pub fn subscribe(&self, subscriber: Arc<dyn SiteSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// The currently published collection, if anything has been published yet.
    pub fn sites(&self) -> Option<Vec<Site>> {
        self.sites.read().clone()
    }

    /// Publishes the cached sites, refreshing them first when the cache is stale.
    pub async fn request_sites(&self) -> Vec<Site> {
        let cached = match self.store.load_sites() {
            Ok(cached) => cached,
            Err(err) => {
                warn!(error = %err, "could not read cached sites");
                None
            }
        };

        let Some(cached) = cached else {
            debug!("no cached sites");
            self.publish(Vec::new());
            return Vec::new();
        };

        let last_refreshed = self.store.last_refreshed().unwrap_or_else(|err| {
            warn!(error = %err, "could not read last refresh time");
            None
        });

        if !self.settings.staleness.is_stale(last_refreshed, Utc::now()) {
            debug!(count = cached.len(), "serving cached sites");
            self.publish(cached.clone());
            return cached;
        }

        let sites = self.refresh(&cached).await;
        self.publish(sites.clone());
        sites
    }

    /// Fetches the site at a searched location and appends it to the published collection.
    pub async fn request_site_for_search(&self, result: &SearchResult) -> Option<Site> {
        let (latitude, longitude) = result.coordinates.query_strings();
        let task = SiteFetchTask::new(
            latitude,
            longitude,
            Arc::clone(&self.client),
            Arc::clone(&self.endpoints),
        );

        let (signal, done) = gate();
        let mut graph = TaskGraph::new();
        graph.add(task, move |site| signal.signal(site));

        let plan = match graph.build() {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "invalid search graph");
                return None;
            }
        };
        Scheduler::unbounded().run(plan).await;

        let Some(site) = done.wait().await else {
            info!(name = ?result.name, "no site found for search result");
            return None;
        };

        let updated = {
            let mut published = self.sites.write();
            let Some(current) = published.as_mut() else {
                debug!(site = %site.id, "nothing published yet, dropping search result");
                return None;
            };
            current.push(site.clone());
            current.clone()
        };

        self.persist(&updated);
        self.notify(&updated);
        Some(site)
    }

    async fn refresh(&self, cached: &[Site]) -> Vec<Site> {
        let fetched: Arc<Mutex<Vec<(usize, Site)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TaskGraph::new();
        let mut pipelines = Vec::with_capacity(cached.len());

        for (index, site) in cached.iter().enumerate() {
            let (latitude, longitude) = site.coordinates.query_strings();
            let task = SiteFetchTask::new(
                latitude,
                longitude,
                Arc::clone(&self.client),
                Arc::clone(&self.endpoints),
            );
            let fetched = Arc::clone(&fetched);
            pipelines.push(graph.add(task, move |site| {
                if let Some(site) = site {
                    fetched.lock().push((index, site));
                }
            }));
        }

        let (signal, done) = gate();
        let collected = Arc::clone(&fetched);
        let fan_in = graph.add_after(
            SiteFetchTask::fan_in(),
            move |_| {
                let mut sites = std::mem::take(&mut *collected.lock());
                sites.sort_by_key(|(index, _)| *index);
                signal.signal(Some(sites.into_iter().map(|(_, site)| site).collect()));
            },
            &pipelines,
        );

        let plan = match fan_in.and_then(|_| graph.build()) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "invalid refresh graph");
                return Vec::new();
            }
        };

        info!(count = cached.len(), "refreshing sites");
        let summary = Scheduler::bounded(self.settings.max_concurrent_sites)
            .run(plan)
            .await;
        let sites: Vec<Site> = done.wait().await.unwrap_or_default();

        info!(
            fetched = sites.len(),
            dropped = cached.len() - sites.len(),
            peak_running = summary.peak_running,
            "site refresh complete"
        );
        sites
    }

    /// Replaces the collection, persists it when non-empty and notifies subscribers.
    fn publish(&self, sites: Vec<Site>) {
        *self.sites.write() = Some(sites.clone());
        self.persist(&sites);
        self.notify(&sites);
    }

    fn persist(&self, sites: &[Site]) {
        if sites.is_empty() {
            return;
        }
        if let Err(err) = self.store.save_sites(sites) {
            warn!(error = %err, "could not persist sites");
        }
    }

    fn notify(&self, sites: &[Site]) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber.sites_changed(sites);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::model::Coordinates;
    use crate::task::testing::FakeClient;
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: &str = "http://svc/";

    fn endpoints() -> Endpoints {
        Endpoints::new(BASE, "sites?lat={{LAT}}&long={{LONG}}").unwrap()
    }

    fn cached_site(id: &str, lat: f64) -> Site {
        Site {
            id: id.into(),
            name: Some(format!("cached {id}")),
            coordinates: Coordinates::new(lat, 1.0),
            links: BTreeMap::new(),
            snapshot: None,
            forecast: None,
        }
    }

    fn site_url(lat: f64) -> String {
        format!("{BASE}sites?lat={lat}&long=1")
    }

    fn site_payload(id: &str, lat: f64) -> Value {
        json!({ "data": {
            "id": id,
            "name": format!("fresh {id}"),
            "latitude": lat,
            "longitude": 1.0,
            "links": { "snapshot": format!("sites/{id}/snapshot") }
        } })
    }

    fn snapshot_payload() -> Value {
        json!({ "data": { "observed_at": "2026-01-30T12:00:00Z", "temperature_c": 3.0 } })
    }

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
        last_len: AtomicUsize,
    }

    impl SiteSubscriber for Counter {
        fn sites_changed(&self, sites: &[Site]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_len.store(sites.len(), Ordering::SeqCst);
        }
    }

    fn orchestrator(client: &Arc<FakeClient>, store: &Arc<MemoryStore>) -> (SiteOrchestrator, Arc<Counter>) {
        let client: Arc<dyn FetchClient> = client.clone();
        let store: Arc<dyn SiteStore> = store.clone();
        let orchestrator = SiteOrchestrator::new(client, endpoints(), store, OrchestratorSettings::default());
        let counter = Arc::new(Counter::default());
        orchestrator.subscribe(counter.clone());
        (orchestrator, counter)
    }

    #[test]
    fn staleness_window_is_three_minutes() {
        let policy = StalenessPolicy::default();
        let now = Utc::now();

        assert!(!policy.is_stale(Some(now - Duration::minutes(2)), now));
        assert!(policy.is_stale(Some(now - Duration::minutes(4)), now));
        assert!(!policy.is_stale(None, now));
    }

    #[tokio::test]
    async fn empty_cache_publishes_empty_collection() {
        let client = Arc::new(FakeClient::new());
        let store = Arc::new(MemoryStore::new());
        let (orchestrator, counter) = orchestrator(&client, &store);

        let sites = orchestrator.request_sites().await;

        assert!(sites.is_empty());
        assert_eq!(orchestrator.sites(), Some(Vec::new()));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.save_count(), 0);
        assert!(store.last_refreshed().unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_cache_is_republished_without_network() {
        let client = Arc::new(FakeClient::new());
        let refreshed_at = Utc::now() - Duration::minutes(2);
        let cached = vec![cached_site("a", 10.0), cached_site("b", 20.0)];
        let store = Arc::new(MemoryStore::seeded(cached.clone(), Some(refreshed_at)));
        let (orchestrator, counter) = orchestrator(&client, &store);

        let sites = orchestrator.request_sites().await;

        assert_eq!(sites, cached);
        assert_eq!(orchestrator.sites(), Some(cached));
        assert!(client.requests().is_empty());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.save_count(), 1);
        assert!(store.last_refreshed().unwrap() > Some(refreshed_at));
    }

    #[tokio::test]
    async fn stale_cache_refreshes_every_site_and_drops_failures() {
        let mut client = FakeClient::new().with_delay(std::time::Duration::from_millis(5));
        for (id, lat) in [("a", 10.0), ("b", 20.0), ("d", 40.0)] {
            client = client
                .with(&site_url(lat), site_payload(id, lat))
                .with(&format!("{BASE}sites/{id}/snapshot"), snapshot_payload());
        }
        let client = Arc::new(client);

        let cached: Vec<Site> = [("a", 10.0), ("b", 20.0), ("c", 30.0), ("d", 40.0)]
            .into_iter()
            .map(|(id, lat)| cached_site(id, lat))
            .collect();
        let store = Arc::new(MemoryStore::seeded(cached, Some(Utc::now() - Duration::minutes(4))));
        let (orchestrator, counter) = orchestrator(&client, &store);

        let sites = orchestrator.request_sites().await;

        let ids: Vec<&str> = sites.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "d"]);
        assert!(sites.iter().all(|s| s.snapshot.is_some() && s.forecast.is_none()));

        let metadata_requests = client
            .requests()
            .into_iter()
            .filter(|url| url.contains("?lat="))
            .count();
        assert_eq!(metadata_requests, 4);

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load_sites().unwrap(), Some(sites.clone()));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.last_len.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn refresh_respects_site_ceiling() {
        let mut client = FakeClient::new().with_delay(std::time::Duration::from_millis(10));
        let mut cached = Vec::new();
        for i in 0..12 {
            let lat = f64::from(i) + 0.5;
            let id = format!("s{i}");
            client = client.with(&site_url(lat), json!({ "data": {
                "id": id, "latitude": lat, "longitude": 1.0
            } }));
            cached.push(cached_site(&id, lat));
        }
        let client = Arc::new(client);
        let store = Arc::new(MemoryStore::seeded(cached, Some(Utc::now() - Duration::hours(1))));
        let (orchestrator, _) = orchestrator(&client, &store);

        let sites = orchestrator.request_sites().await;

        assert_eq!(sites.len(), 12);
        assert!(client.peak_in_flight() <= DEFAULT_MAX_CONCURRENT_SITES);
    }

    #[tokio::test]
    async fn refresh_where_every_site_fails_keeps_the_old_cache() {
        let client = Arc::new(FakeClient::new());
        let cached = vec![cached_site("a", 10.0)];
        let refreshed_at = Utc::now() - Duration::minutes(10);
        let store = Arc::new(MemoryStore::seeded(cached.clone(), Some(refreshed_at)));
        let (orchestrator, counter) = orchestrator(&client, &store);

        let sites = orchestrator.request_sites().await;

        assert!(sites.is_empty());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.last_len.load(Ordering::SeqCst), 0);
        assert_eq!(store.load_sites().unwrap(), Some(cached));
        assert_eq!(store.last_refreshed().unwrap(), Some(refreshed_at));
    }

    #[tokio::test]
    async fn search_result_is_appended() {
        let client = Arc::new(
            FakeClient::new()
                .with(&site_url(60.0), site_payload("new", 60.0))
                .with(&format!("{BASE}sites/new/snapshot"), snapshot_payload()),
        );
        let cached = vec![cached_site("a", 10.0), cached_site("b", 20.0)];
        let store = Arc::new(MemoryStore::seeded(cached, Some(Utc::now())));
        let (orchestrator, counter) = orchestrator(&client, &store);
        orchestrator.request_sites().await;

        let added = orchestrator
            .request_site_for_search(&SearchResult {
                name: Some("Somewhere".into()),
                coordinates: Coordinates::new(60.0, 1.0),
            })
            .await
            .expect("site found");

        let published = orchestrator.sites().unwrap();
        assert_eq!(published.len(), 3);
        assert_eq!(published[0].id, "a");
        assert_eq!(published[2], added);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.load_sites().unwrap().map(|s| s.len()), Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_searches_keep_every_append() {
        let mut client = FakeClient::new().with_delay(std::time::Duration::from_millis(5));
        for i in 0..8 {
            let lat = 60.0 + f64::from(i);
            client = client.with(&site_url(lat), site_payload(&format!("n{i}"), lat));
        }
        let client = Arc::new(client);
        let store = Arc::new(MemoryStore::seeded(vec![cached_site("a", 10.0)], Some(Utc::now())));
        let (orchestrator, _) = orchestrator(&client, &store);
        let orchestrator = Arc::new(orchestrator);
        orchestrator.request_sites().await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let orchestrator = Arc::clone(&orchestrator);
            handles.push(tokio::spawn(async move {
                orchestrator
                    .request_site_for_search(&SearchResult {
                        name: None,
                        coordinates: Coordinates::new(60.0 + f64::from(i), 1.0),
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_some());
        }

        let published = orchestrator.sites().unwrap();
        assert_eq!(published.len(), 9);
        assert_eq!(published[0].id, "a");
    }

    #[tokio::test]
    async fn failed_search_leaves_collection_alone() {
        let client = Arc::new(FakeClient::new());
        let store = Arc::new(MemoryStore::seeded(vec![cached_site("a", 10.0)], Some(Utc::now())));
        let (orchestrator, counter) = orchestrator(&client, &store);
        orchestrator.request_sites().await;

        let added = orchestrator
            .request_site_for_search(&SearchResult {
                name: None,
                coordinates: Coordinates::new(60.0, 1.0),
            })
            .await;

        assert!(added.is_none());
        assert_eq!(orchestrator.sites().map(|s| s.len()), Some(1));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn search_before_any_publish_is_dropped() {
        let client = Arc::new(FakeClient::new().with(&site_url(60.0), site_payload("new", 60.0)));
        let store = Arc::new(MemoryStore::new());
        let (orchestrator, counter) = orchestrator(&client, &store);

        let added = orchestrator
            .request_site_for_search(&SearchResult {
                name: None,
                coordinates: Coordinates::new(60.0, 1.0),
            })
            .await;

        assert!(added.is_none());
        assert!(orchestrator.sites().is_none());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closures_can_subscribe() {
        let client = Arc::new(FakeClient::new());
        let store = Arc::new(MemoryStore::new());
        let (orchestrator, _) = orchestrator(&client, &store);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        orchestrator.subscribe(Arc::new(move |_: &[Site]| {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        orchestrator.request_sites().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
