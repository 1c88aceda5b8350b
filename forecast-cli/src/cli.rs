use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use forecast_core::{Config, Coordinates, SearchResult, Site, SiteOrchestrator};
use inquire::Text;
use tracing::info;

/// Forecast periods shown per site.
const PERIODS_SHOWN: usize = 3;

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "forecast", version, about = "Site forecast CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure the forecast service URL and API key.
    Configure,

    /// Show forecasts for every saved site, refreshing them when stale.
    Sites,

    /// Look up the site nearest to a location and add it to the saved sites.
    Add {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        long: f64,

        /// Optional label for the searched location.
        #[arg(long)]
        name: Option<String>,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure => configure(),
            Command::Sites => {
                let orchestrator = orchestrator()?;
                let sites = orchestrator.request_sites().await;
                print_sites(&sites);
                Ok(())
            }
            Command::Add { lat, long, name } => {
                let orchestrator = orchestrator()?;
                orchestrator.request_sites().await;

                let result = SearchResult {
                    name,
                    coordinates: Coordinates::new(lat, long),
                };
                match orchestrator.request_site_for_search(&result).await {
                    Some(site) => println!("Added {}", site.display_name()),
                    None => println!("No site found at {lat}, {long}"),
                }

                print_sites(&orchestrator.sites().unwrap_or_default());
                Ok(())
            }
        }
    }
}

fn orchestrator() -> anyhow::Result<SiteOrchestrator> {
    let config = Config::load()?;
    SiteOrchestrator::from_config(&config)
}

fn configure() -> anyhow::Result<()> {
    let mut config = Config::load()?;

    let current_url = config.api.base_url.clone().unwrap_or_default();
    let base_url = Text::new("Forecast service URL:")
        .with_default(&current_url)
        .prompt()
        .context("Failed to read service URL")?;

    let site_path = Text::new("Site lookup path:")
        .with_default(&config.api.site_path)
        .with_help_message("Use {{LAT}} and {{LONG}} as coordinate placeholders")
        .prompt()
        .context("Failed to read site path")?;

    let api_key = Text::new("API key (leave empty for none):")
        .prompt()
        .context("Failed to read API key")?;

    config.set_service(base_url, Some(api_key));
    config.api.site_path = site_path;

    // Fail before saving if the URL cannot be used.
    config.endpoints()?;
    config.save()?;

    let path = Config::config_file_path()?;
    info!(path = %path.display(), "configuration saved");
    println!("Saved configuration to {}", path.display());
    Ok(())
}

fn print_sites(sites: &[Site]) {
    if sites.is_empty() {
        println!("No saved sites. Add one with `forecast add --lat <LAT> --long <LONG>`.");
        return;
    }

    for site in sites {
        println!(
            "{} ({:.3}, {:.3})",
            site.display_name(),
            site.coordinates.latitude,
            site.coordinates.longitude
        );

        match &site.snapshot {
            Some(now) => println!(
                "  now: {} {} (observed {})",
                celsius(now.temperature_c),
                now.condition.as_deref().unwrap_or("-"),
                now.observed_at.with_timezone(&Local).format("%H:%M"),
            ),
            None => println!("  now: unavailable"),
        }

        match &site.forecast {
            Some(forecast) => {
                for period in forecast.periods.iter().take(PERIODS_SHOWN) {
                    println!(
                        "  {}: {} {}",
                        period.starts_at.with_timezone(&Local).format("%a %H:%M"),
                        celsius(period.temperature_c),
                        period.condition.as_deref().unwrap_or("-"),
                    );
                }
            }
            None => println!("  forecast: unavailable"),
        }
    }
}

fn celsius(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |t| format!("{t:.1}°C"))
}
