use anyhow::{Context, Result};
use reqwest::Url;

use crate::model::Site;

pub const LAT_PLACEHOLDER: &str = "{{LAT}}";
pub const LONG_PLACEHOLDER: &str = "{{LONG}}";

/// Builds request URLs for the forecast service.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
    site_path: String,
}

impl Endpoints {
    /// `site_path` is relative to `base_url` and carries the `{{LAT}}` / `{{LONG}}` tokens.
    pub fn new(base_url: &str, site_path: impl Into<String>) -> Result<Self> {
        let mut base =
            Url::parse(base_url).with_context(|| format!("Invalid base URL: {base_url}"))?;

        // Without a trailing slash `join` would replace the last path segment.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            base,
            site_path: site_path.into(),
        })
    }

    /// Site metadata URL for a coordinate pair.
    pub fn site_url(&self, latitude: &str, longitude: &str) -> Option<String> {
        let path = self
            .site_path
            .replace(LONG_PLACEHOLDER, longitude)
            .replace(LAT_PLACEHOLDER, latitude);

        self.base.join(&path).ok().map(String::from)
    }

    /// Absolute URL of a named link in a site's link mapping.
    pub fn link_url(&self, site: &Site, name: &str) -> Option<String> {
        let link = site.link(name)?;
        self.base.join(link).ok().map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinates, SNAPSHOT_LINK, DETAILED_FORECAST_LINK};
    use std::collections::BTreeMap;

    fn site_with_links(links: &[(&str, &str)]) -> Site {
        Site {
            id: "1".into(),
            name: None,
            coordinates: Coordinates::new(0.0, 0.0),
            links: links
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            snapshot: None,
            forecast: None,
        }
    }

    #[test]
    fn site_url_substitutes_both_placeholders() {
        let endpoints = Endpoints::new("https://api.example.com/v1", "sites?lat={{LAT}}&long={{LONG}}").unwrap();

        let url = endpoints.site_url("51.5", "-0.12").unwrap();

        assert_eq!(url, "https://api.example.com/v1/sites?lat=51.5&long=-0.12");
    }

    #[test]
    fn link_url_resolves_relative_and_keeps_absolute() {
        let endpoints = Endpoints::new("https://api.example.com/v1/", "sites").unwrap();
        let site = site_with_links(&[
            (SNAPSHOT_LINK, "sites/9/snapshot"),
            (DETAILED_FORECAST_LINK, "https://cdn.example.org/forecast/9"),
        ]);

        assert_eq!(
            endpoints.link_url(&site, SNAPSHOT_LINK).as_deref(),
            Some("https://api.example.com/v1/sites/9/snapshot")
        );
        assert_eq!(
            endpoints.link_url(&site, DETAILED_FORECAST_LINK).as_deref(),
            Some("https://cdn.example.org/forecast/9")
        );
        assert_eq!(endpoints.link_url(&site, "missing"), None);
    }

    #[test]
    fn invalid_base_url_is_an_error() {
        let err = Endpoints::new("not a url", "sites").unwrap_err();
        assert!(err.to_string().contains("Invalid base URL"));
    }
}
