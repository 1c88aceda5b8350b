use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    client::FetchClient,
    endpoint::Endpoints,
    model::{DETAILED_FORECAST_LINK, ForecastKind, SNAPSHOT_LINK, Site, data_section},
    scheduler::{Scheduler, Task, TaskGraph, gate},
    task::ForecastFetchTask,
};

#[derive(Debug, Clone)]
struct SiteRequest {
    latitude: String,
    longitude: String,
    client: Arc<dyn FetchClient>,
    endpoints: Arc<Endpoints>,
}

/// Fetches a site's metadata and then both of its forecasts.
#[derive(Debug)]
pub struct SiteFetchTask {
    request: Option<SiteRequest>,
}

impl SiteFetchTask {
    pub fn new(
        latitude: impl Into<String>,
        longitude: impl Into<String>,
        client: Arc<dyn FetchClient>,
        endpoints: Arc<Endpoints>,
    ) -> Self {
        Self {
            request: Some(SiteRequest {
                latitude: latitude.into(),
                longitude: longitude.into(),
                client,
                endpoints,
            }),
        }
    }

    /// A task that fetches nothing and completes with no result.
    pub fn fan_in() -> Self {
        Self { request: None }
    }
}

#[async_trait]
impl Task for SiteFetchTask {
    type Output = Site;

    async fn run(self: Box<Self>) -> Option<Site> {
        let request = self.request?;
        request.fetch().await
    }
}

impl SiteRequest {
    async fn fetch(self) -> Option<Site> {
        let Some(url) = self.endpoints.site_url(&self.latitude, &self.longitude) else {
            warn!(lat = %self.latitude, long = %self.longitude, "could not build site URL");
            return None;
        };

        let Some(site) = self
            .client
            .fetch(&url)
            .await
            .as_ref()
            .and_then(data_section)
            .and_then(Site::from_payload)
        else {
            debug!(url = %url, "site metadata unavailable");
            return None;
        };

        let snapshot_url = self.endpoints.link_url(&site, SNAPSHOT_LINK);
        let detailed_url = self.endpoints.link_url(&site, DETAILED_FORECAST_LINK);
        let site_id = site.id.clone();
        let site = Arc::new(Mutex::new(site));

        let mut graph = TaskGraph::new();
        let snapshot = {
            let site = Arc::clone(&site);
            graph.add(
                ForecastFetchTask::new(ForecastKind::Snapshot, snapshot_url, Arc::clone(&self.client)),
                move |forecast| {
                    if let Some(forecast) = forecast {
                        forecast.attach_to(&mut site.lock());
                    }
                },
            )
        };
        let detailed = {
            let site = Arc::clone(&site);
            graph.add(
                ForecastFetchTask::new(ForecastKind::Detailed, detailed_url, Arc::clone(&self.client)),
                move |forecast| {
                    if let Some(forecast) = forecast {
                        forecast.attach_to(&mut site.lock());
                    }
                },
            )
        };

        let (signal, done) = gate();
        let fan_in = graph.add_after(
            ForecastFetchTask::fan_in(),
            move |_| {
                let site = match Arc::try_unwrap(site) {
                    Ok(site) => site.into_inner(),
                    Err(shared) => shared.lock().clone(),
                };
                signal.signal(Some(site));
            },
            &[snapshot, detailed],
        );

        let plan = match fan_in.and_then(|_| graph.build()) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(site = %site_id, error = %err, "invalid forecast graph");
                return None;
            }
        };

        // The slot this task holds is only released once the nested forecasts finish.
        tokio::spawn(async move { Scheduler::unbounded().run(plan).await });
        let site = done.wait().await;

        debug!(
            site = %site_id,
            snapshot = site.as_ref().is_some_and(|s| s.snapshot.is_some()),
            forecast = site.as_ref().is_some_and(|s| s.forecast.is_some()),
            "site fetched"
        );
        site
    }
}
