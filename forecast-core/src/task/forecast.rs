use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    client::FetchClient,
    model::{Forecast, ForecastKind, data_section},
    scheduler::Task,
};

/// Fetches one forecast variant.
#[derive(Debug)]
pub struct ForecastFetchTask {
    kind: ForecastKind,
    url: Option<String>,
    client: Option<Arc<dyn FetchClient>>,
}

impl ForecastFetchTask {
    pub fn new(kind: ForecastKind, url: Option<String>, client: Arc<dyn FetchClient>) -> Self {
        Self {
            kind,
            url,
            client: Some(client),
        }
    }

    /// A task that fetches nothing and completes with no result.
    pub fn fan_in() -> Self {
        Self {
            kind: ForecastKind::None,
            url: None,
            client: None,
        }
    }
}

#[async_trait]
impl Task for ForecastFetchTask {
    type Output = Forecast;

    async fn run(self: Box<Self>) -> Option<Forecast> {
        let (Some(url), Some(client)) = (self.url.as_deref(), self.client.as_ref()) else {
            return None;
        };

        let payload = client.fetch(url).await;
        let forecast = payload
            .as_ref()
            .and_then(data_section)
            .and_then(|data| Forecast::from_payload(self.kind, data));

        if forecast.is_none() {
            debug!(kind = %self.kind, url, "forecast unavailable");
        }
        forecast
    }
}
