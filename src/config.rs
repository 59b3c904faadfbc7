//! Configuration and command-line argument parsing

use std::env;
use std::time::Duration;

use crate::ingest::ENRICHMENT_INTERVAL;
use crate::merge::DEDUP_WINDOW_MS;
use crate::scheduler::POLL_INTERVAL;
use crate::source::Query;
use crate::sweeper::{DURABLE_STALE_MS, DURABLE_SWEEP_INTERVAL};
use crate::track_map::{MEMORY_STALE_MS, MEMORY_SWEEP_EVERY_MS, TrackMapConfig};

#[derive(Debug, Clone)]
pub struct Config {
    // Poll feed
    pub feed: Option<String>,
    pub loop_feed: bool,
    /// Stamp replayed frames with the wall clock
    pub rebase_feed: bool,
    pub poll_interval_ms: u64,
    pub start_hidden: bool,

    // Query
    pub query: String,
    pub lat: f64,
    pub lon: f64,
    pub radius_nm: f64,
    pub focus: Option<String>,

    // Merging and eviction
    pub dedup_window_ms: i64,
    pub memory_ttl_ms: i64,
    pub memory_sweep_ms: i64,
    pub store_ttl_ms: i64,
    pub store_sweep_ms: u64,

    // Durable store
    pub store_dir: String,
    pub memory_store: bool,

    // Enrichment
    pub enrichment: Option<String>,
    pub enrichment_interval_ms: u64,

    // Networking
    pub http: bool,
    pub http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed: None,
            loop_feed: false,
            rebase_feed: true,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            start_hidden: false,
            query: "radius".to_string(),
            // Salt Lake City
            lat: 40.7903,
            lon: -111.9771,
            radius_nm: 100.0,
            focus: None,
            dedup_window_ms: DEDUP_WINDOW_MS,
            memory_ttl_ms: MEMORY_STALE_MS,
            memory_sweep_ms: MEMORY_SWEEP_EVERY_MS,
            store_ttl_ms: DURABLE_STALE_MS,
            store_sweep_ms: DURABLE_SWEEP_INTERVAL.as_millis() as u64,
            store_dir: "track-cache".to_string(),
            memory_store: false,
            enrichment: None,
            enrichment_interval_ms: ENRICHMENT_INTERVAL.as_millis() as u64,
            http: true,
            http_port: 8080,
        }
    }
}

impl Config {
    pub fn from_args() -> Self {
        let args: Vec<String> = env::args().collect();
        match Self::parse(options(&args)) {
            Ok(config) => config,
            Err(ParseOutcome::Help) => {
                print_help();
                std::process::exit(0);
            }
            Err(ParseOutcome::Invalid(msg)) => {
                eprintln!("{}", msg);
                print_help();
                std::process::exit(1);
            }
        }
    }

    fn parse(args: &[String]) -> Result<Self, ParseOutcome> {
        let mut config = Config::default();

        let mut i = 0;
        while i < args.len() {
            let opt = args[i].as_str();
            let mut value = || -> Result<&str, ParseOutcome> {
                i += 1;
                args.get(i)
                    .map(String::as_str)
                    .ok_or_else(|| ParseOutcome::Invalid(format!("Missing value for {}", opt)))
            };
            match opt {
                "--feed" => config.feed = Some(value()?.to_string()),
                "--loop" => config.loop_feed = true,
                "--no-rebase" => config.rebase_feed = false,
                "--poll-interval-ms" => config.poll_interval_ms = interval_ms(opt, value()?)?,
                "--background" => config.start_hidden = true,
                "--query" => config.query = value()?.to_string(),
                "--lat" => config.lat = number(opt, value()?)?,
                "--lon" => config.lon = number(opt, value()?)?,
                "--radius-nm" => config.radius_nm = number(opt, value()?)?,
                "--focus" => config.focus = Some(value()?.to_string()),
                "--dedup-window-ms" => config.dedup_window_ms = number(opt, value()?)?,
                "--memory-ttl-ms" => config.memory_ttl_ms = number(opt, value()?)?,
                "--store-ttl-ms" => config.store_ttl_ms = number(opt, value()?)?,
                "--store-dir" => config.store_dir = value()?.to_string(),
                "--memory-store" => config.memory_store = true,
                "--enrichment" => config.enrichment = Some(value()?.to_string()),
                "--enrichment-interval-ms" => {
                    config.enrichment_interval_ms = interval_ms(opt, value()?)?
                }
                "--http-port" => config.http_port = number(opt, value()?)?,
                "--no-http" => config.http = false,
                "--help" => return Err(ParseOutcome::Help),
                other => {
                    return Err(ParseOutcome::Invalid(format!("Unknown option: {}", other)));
                }
            }
            i += 1;
        }

        Ok(config)
    }

    /// The poll query described by `--query` and the center options
    pub fn query(&self) -> Result<Query, String> {
        if self.query == "radius" {
            Ok(Query::radius(self.lat, self.lon, self.radius_nm))
        } else {
            self.query.parse()
        }
    }

    pub fn track_map_config(&self) -> TrackMapConfig {
        TrackMapConfig {
            dedup_window_ms: self.dedup_window_ms,
            stale_after_ms: self.memory_ttl_ms,
            sweep_every_ms: self.memory_sweep_ms,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn store_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.store_sweep_ms)
    }

    pub fn enrichment_interval(&self) -> Duration {
        Duration::from_millis(self.enrichment_interval_ms)
    }
}

#[derive(Debug, PartialEq)]
enum ParseOutcome {
    Help,
    Invalid(String),
}

fn number<T: std::str::FromStr>(opt: &str, value: &str) -> Result<T, ParseOutcome> {
    value
        .parse()
        .map_err(|_| ParseOutcome::Invalid(format!("Invalid value for {}: {}", opt, value)))
}

/// Everything after the program name; argv may be empty
fn options(argv: &[String]) -> &[String] {
    argv.get(1..).unwrap_or_default()
}

/// A timer period; zero would stall the timer
fn interval_ms(opt: &str, value: &str) -> Result<u64, ParseOutcome> {
    match number(opt, value)? {
        0 => Err(ParseOutcome::Invalid(format!("{} must be greater than zero", opt))),
        ms => Ok(ms),
    }
}

fn print_help() {
    println!(
        r#"flighttrack - aircraft position history tracker

Usage: flighttrack --feed <file> [OPTIONS]

Options:
  --feed <file>                 Poll feed: newline-delimited JSON frames
  --loop                        Restart the feed when it runs out
  --no-rebase                   Keep recorded frame times instead of the wall clock
  --poll-interval-ms <ms>       Poll cadence (default: 1000)
  --background                  Start with polling suspended
  --query <q>                   radius | mil | ladd | pia | hex:<id> | callsign:<cs>
                                | reg:<reg> | type:<type> | squawk:<code> (default: radius)
  --lat <degrees>               Radius query center latitude (default: 40.7903)
  --lon <degrees>               Radius query center longitude (default: -111.9771)
  --radius-nm <nm>              Radius query range, capped at 250 (default: 100)
  --focus <id>                  Keep this aircraft in the active set
  --dedup-window-ms <ms>        Enrichment de-duplication window (default: 30000)
  --memory-ttl-ms <ms>          Drop in-memory tracks idle this long (default: 300000)
  --store-ttl-ms <ms>           Purge stored tracks idle this long (default: 120000)
  --store-dir <dir>             Durable store directory (default: track-cache)
  --memory-store                Keep the durable store in memory only
  --enrichment <file>           Enrichment positions: JSON object id -> positions
  --enrichment-interval-ms <ms> Enrichment cadence (default: 15000)
  --http-port <port>            HTTP server port (default: 8080)
  --no-http                     Disable the HTTP server
  --help                        Show this help
"#
    );
}
