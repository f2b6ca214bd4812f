#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `safewalk` operator CLI.
//!
//! Plans risk-annotated routes, evaluates alerts and runs the batch jobs
//! against a JSON data snapshot. Uses `indicatif-log-bridge` (via
//! [`safewalk_cli_utils::init_logger`]) so log lines and progress bars
//! share the terminal.

mod app;
mod config;

use std::{path::PathBuf, sync::Arc, time::Instant};

use clap::{Parser, Subcommand};
use safewalk_cli_utils::IndicatifProgress;
use safewalk_jobs::{
    AnonymizeLocationData, CacheSweep, ExpireOccurrences, ImportOccurrences, ProgressCallback,
    RecalculateRiskIndex, Scheduler, recalculate::DEFAULT_BATCH_SIZE,
};
use safewalk_risk_models::{BoundingBox, Coordinates};
use safewalk_routing::{MapAdapter, RoutePlanner};
use safewalk_routing_models::{RouteOptions, TravelMode};
use safewalk_spatial::{generate_grid, regions_from_geojson};
use safewalk_store::RegionRepository;
use serde::Serialize;

use crate::{app::App, config::AppConfig};

#[derive(Parser)]
#[command(name = "safewalk", about = "Safe pedestrian navigation toolkit")]
struct Cli {
    /// TOML config file (default: `SAFEWALK_CONFIG` or built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// JSON data snapshot holding regions, occurrences and sessions
    #[arg(long, global = true, default_value = "safewalk-data.json")]
    data: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan routes between two points, safest first
    Route {
        /// Origin as `lat,lng`
        #[arg(long, value_parser = parse_coordinates, allow_hyphen_values = true)]
        from: Coordinates,
        /// Destination as `lat,lng`
        #[arg(long, value_parser = parse_coordinates, allow_hyphen_values = true)]
        to: Coordinates,
        /// `walking`, `cycling` or `driving`
        #[arg(long, default_value = "walking", value_parser = parse_mode)]
        mode: TravelMode,
        /// Alternatives to request (1 = single route)
        #[arg(long, default_value = "3")]
        alternatives: usize,
        #[arg(long)]
        avoid_highways: bool,
        #[arg(long)]
        avoid_tolls: bool,
        /// Use only this provider instead of the fallback chain
        #[arg(long)]
        provider: Option<String>,
        /// Also fetch live traffic for the safest route
        #[arg(long)]
        traffic: bool,
    },
    /// Resolve an address to coordinates
    Geocode {
        address: String,
    },
    /// Resolve coordinates to an address
    ReverseGeocode {
        /// Position as `lat,lng`
        #[arg(value_parser = parse_coordinates, allow_hyphen_values = true)]
        at: Coordinates,
    },
    /// Recompute region risk indexes
    Recalculate {
        /// Only this region
        #[arg(long)]
        region: Option<i64>,
        /// Regions per page
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
        /// Concurrent id-range partitions
        #[arg(long, default_value = "1")]
        workers: usize,
    },
    /// Strip user identity from old location data
    Anonymize,
    /// Expire stale collaborative reports
    Expire,
    /// Import occurrences from a CSV file
    Import {
        file: PathBuf,
        /// Rows per insert
        #[arg(long, default_value = "500")]
        batch_size: usize,
    },
    /// Cover a bounding box with square regions
    SeedGrid {
        #[arg(long, allow_hyphen_values = true)]
        min_lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        min_lng: f64,
        #[arg(long, allow_hyphen_values = true)]
        max_lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        max_lng: f64,
        /// Cell edge in degrees
        #[arg(long, default_value = "0.01")]
        cell_size: f64,
        /// Region name prefix
        #[arg(long, default_value = "Cell")]
        prefix: String,
    },
    /// Load regions from a `GeoJSON` `FeatureCollection`
    SeedGeojson {
        file: PathBuf,
    },
    /// Evaluate alerts at a position
    Alerts {
        /// Position as `lat,lng`
        #[arg(long, value_parser = parse_coordinates, allow_hyphen_values = true)]
        at: Coordinates,
        /// Current speed in km/h
        #[arg(long, default_value = "5")]
        speed: f64,
        /// Apply this user's stored preferences
        #[arg(long)]
        user: Option<i64>,
        /// Upcoming route point as `lat,lng` (repeatable)
        #[arg(long = "waypoint", value_parser = parse_coordinates, allow_hyphen_values = true)]
        waypoints: Vec<Coordinates>,
    },
    /// Show provider cache statistics, optionally cleaning up first
    CacheStats {
        #[arg(long)]
        cleanup: bool,
        /// With --cleanup, also evict entries about to expire
        #[arg(long)]
        force: bool,
    },
    /// List configured map providers
    Providers,
    /// Run the periodic jobs until interrupted
    Schedule,
}

fn parse_coordinates(s: &str) -> Result<Coordinates, String> {
    let (lat, lng) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `lat,lng`, got {s:?}"))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("latitude: {e}"))?;
    let lng: f64 = lng.trim().parse().map_err(|e| format!("longitude: {e}"))?;
    Coordinates::new(lat, lng).map_err(|e| e.to_string())
}

fn parse_mode(s: &str) -> Result<TravelMode, String> {
    s.parse()
        .map_err(|_| format!("unknown mode {s:?}: expected walking, cycling or driving"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = safewalk_cli_utils::init_logger();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    let app = App::open(config, &cli.data)?;

    match cli.command {
        Commands::Route {
            from,
            to,
            mode,
            alternatives,
            avoid_highways,
            avoid_tolls,
            provider,
            traffic,
        } => {
            let factory = app.factory()?;
            let adapter: Arc<dyn MapAdapter> = match provider {
                Some(name) => factory
                    .adapter(&name)
                    .ok_or_else(|| format!("Unknown provider: {name}"))?,
                None => Arc::new(factory.adapter_with_fallback()),
            };
            let options = RouteOptions {
                mode,
                avoid_highways,
                avoid_tolls,
                language: None,
            };

            let planner = RoutePlanner::new(adapter.clone(), app.annotator().await?)
                .with_alternatives(alternatives);
            let routes = planner.plan(from, to, &options).await?;
            print_json(&routes)?;

            if traffic && let Some(safest) = routes.first() {
                print_json(&adapter.traffic_data(safest).await?)?;
            }
        }
        Commands::Geocode { address } => {
            let addresses = app
                .factory()?
                .adapter_with_fallback()
                .geocode(&address)
                .await?;
            print_json(&addresses)?;
        }
        Commands::ReverseGeocode { at } => {
            let address = app
                .factory()?
                .adapter_with_fallback()
                .reverse_geocode(at)
                .await?;
            print_json(&address)?;
        }
        Commands::Recalculate {
            region,
            batch_size,
            workers,
        } => {
            let job = RecalculateRiskIndex::new(app.risk());
            if let Some(region_id) = region {
                print_json(&job.run_region(region_id).await?)?;
            } else {
                let total = app.store.all_regions().await?.len();
                let progress = IndicatifProgress::batch_bar(&multi, "Recalculating regions");
                progress.set_total(total as u64);
                let summary = job.run_all(batch_size, workers, &progress).await?;
                print_json(&summary)?;
            }
            app.save().await?;
        }
        Commands::Anonymize => {
            let job = AnonymizeLocationData::new(app.store.clone(), app.config.anonymize);
            print_json(&job.run().await?)?;
            app.save().await?;
        }
        Commands::Expire => {
            let job = ExpireOccurrences::new(app.store.clone(), app.risk());
            print_json(&job.run().await?)?;
            app.save().await?;
        }
        Commands::Import { file, batch_size } => {
            let job =
                ImportOccurrences::new(app.store.clone(), app.region_index().await?, app.risk())
                    .with_batch_size(batch_size);
            let progress = IndicatifProgress::rows_bar(&multi, "Reading CSV");
            print_json(&job.run_path(&file, &progress).await?)?;
            app.save().await?;
        }
        Commands::SeedGrid {
            min_lat,
            min_lng,
            max_lat,
            max_lng,
            cell_size,
            prefix,
        } => {
            let bbox = BoundingBox {
                min_lat,
                min_lng,
                max_lat,
                max_lng,
            };
            let first_id = next_region_id(&app).await?;
            let regions = generate_grid(&bbox, cell_size, first_id, &prefix)?;
            let inserted = app.store.insert_regions(regions).await?;
            log::info!("Seeded {inserted} grid regions starting at id {first_id}");
            app.save().await?;
        }
        Commands::SeedGeojson { file } => {
            let text = std::fs::read_to_string(&file)?;
            let first_id = next_region_id(&app).await?;
            let regions = regions_from_geojson(&text, first_id)?;
            let inserted = app.store.insert_regions(regions).await?;
            log::info!("Seeded {inserted} regions from {}", file.display());
            app.save().await?;
        }
        Commands::Alerts {
            at,
            speed,
            user,
            waypoints,
        } => {
            let service = app.alerts().await?;
            let now = chrono::Local::now().fixed_offset();
            let evaluation = match user {
                Some(user_id) => {
                    service
                        .evaluate_for_user(user_id, at, speed, &waypoints, now)
                        .await?
                }
                None => service.evaluate_at(at, speed, &waypoints, None, now).await?,
            };
            print_json(&evaluation)?;
        }
        Commands::CacheStats { cleanup, force } => {
            if cleanup {
                let removed = CacheSweep::new(app.cache.clone()).run(force);
                println!("Removed {removed} entries");
            }
            print_json(&app.cache.cache_stats())?;
        }
        Commands::Providers => {
            let factory = app.factory()?;
            println!("{:<10} {:<28} {:>8} {:>10}  QUOTA", "ID", "NAME", "PRIORITY", "AVAILABLE");
            println!("{}", "-".repeat(72));
            for service in app.services()? {
                let available = factory
                    .adapter(&service.id)
                    .is_some_and(|a| a.is_available());
                let quota = service.quota.map_or_else(
                    || "unlimited".to_string(),
                    |q| format!("{}/{}s", q.limit, q.window_secs),
                );
                println!(
                    "{:<10} {:<28} {:>8} {:>10}  {quota}",
                    service.id, service.name, service.priority, available
                );
            }
        }
        Commands::Schedule => {
            run_scheduler(&app).await?;
        }
    }

    Ok(())
}

async fn next_region_id(app: &App) -> Result<i64, safewalk_store::StoreError> {
    Ok(app
        .store
        .region_id_bounds()
        .await?
        .map_or(1, |(_, max)| max + 1))
}

async fn run_scheduler(app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let risk = app.risk();
    let scheduler = Scheduler::new(
        app.config.schedule,
        RecalculateRiskIndex::new(risk.clone()),
        AnonymizeLocationData::new(app.store.clone(), app.config.anonymize),
        ExpireOccurrences::new(app.store.clone(), risk),
        CacheSweep::new(app.cache.clone()),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = scheduler.spawn(shutdown_rx);

    log::info!("Scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down scheduler");
    shutdown_tx.send(true)?;

    for handle in handles {
        if let Err(e) = handle.await {
            log::error!("Scheduled task panicked: {e}");
        }
    }

    app.save().await?;
    log::info!(
        "Scheduler stopped after {:.1}s",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coordinate_pairs() {
        let c = parse_coordinates("-23.55, -46.63").unwrap();
        assert!((c.lat + 23.55).abs() < f64::EPSILON);
        assert!((c.lng + 46.63).abs() < f64::EPSILON);

        assert!(parse_coordinates("-23.55").is_err());
        assert!(parse_coordinates("abc,1").is_err());
        assert!(parse_coordinates("91,0").is_err());
    }

    #[test]
    fn cli_parses_route_arguments() {
        let cli = Cli::try_parse_from([
            "safewalk",
            "route",
            "--from",
            "-23.55,-46.63",
            "--to",
            "-23.56,-46.64",
            "--mode",
            "cycling",
        ])
        .unwrap();

        match cli.command {
            Commands::Route {
                mode, alternatives, ..
            } => {
                assert_eq!(mode, TravelMode::Cycling);
                assert_eq!(alternatives, 3);
            }
            _ => panic!("expected route"),
        }
        assert_eq!(cli.data, PathBuf::from("safewalk-data.json"));
    }
}
