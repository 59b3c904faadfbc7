//!   flighttrack:   aircraft position history tracker
//!
//!  Polls a positional feed, merges in enrichment positions, and keeps a
//!  de-duplicated, time-ordered track per aircraft in memory and on disk.
//!

mod aircraft;
mod config;
mod error;
mod ingest;
mod merge;
mod network;
mod sample;
mod scheduler;
mod source;
mod storage;
mod store;
mod sweeper;
mod track_map;

use std::sync::Arc;

use crossbeam_channel::bounded;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::ingest::BATCH_CHANNEL_CAPACITY;
use crate::network::HttpState;
use crate::scheduler::{PollContext, Visibility};
use crate::source::{EnrichmentSource, ReplayEnrichmentSource, ReplayPollSource};
use crate::storage::{FileStorage, MemoryStorage};
use crate::store::TrackStore;
use crate::track_map::TrackMap;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_args();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    info!("flighttrack starting...");
    info!("Configuration: {:?}", config);

    let query = config.query()?;
    let Some(feed) = config.feed.as_deref() else {
        return Err("no poll feed given (use --feed <file>)".into());
    };
    let poll_source = Arc::new(ReplayPollSource::open(feed, config.loop_feed, config.rebase_feed)?);
    let enrichment_source: Option<Arc<dyn EnrichmentSource>> = match &config.enrichment {
        Some(path) => Some(Arc::new(ReplayEnrichmentSource::open(path)?)),
        None => None,
    };

    let store = Arc::new(if config.memory_store {
        TrackStore::new(MemoryStorage::new(), config.dedup_window_ms)
    } else {
        TrackStore::new(FileStorage::open(&config.store_dir)?, config.dedup_window_ms)
    });
    info!("Durable store holds {} tracks", store.list_tracked_ids().len());

    let map = Arc::new(TrackMap::new(config.track_map_config()));
    map.set_focus(config.focus.clone());
    if let Some(id) = map.focus() {
        info!("Focused on {}", id);
    }
    let visibility = Arc::new(Visibility::new(!config.start_hidden));

    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let (stop_tx, stop_rx) = watch::channel(false);

        let poll_handle = scheduler::spawn_poll_scheduler(
            PollContext {
                source: poll_source,
                query,
                map: Arc::clone(&map),
                store: Arc::clone(&store),
                interval: config.poll_interval(),
            },
            visibility.subscribe(),
        );

        let sweeper_handle = sweeper::spawn_durable_sweeper(
            Arc::clone(&store),
            config.store_sweep_interval(),
            config.store_ttl_ms,
            stop_rx.clone(),
        );

        // Enrichment fetchers feed a single blocking ingest worker
        let enrichment_handles = enrichment_source.map(|source| {
            let (batch_tx, batch_rx) = bounded(BATCH_CHANNEL_CAPACITY);
            let worker = {
                let map = Arc::clone(&map);
                let store = Arc::clone(&store);
                tokio::task::spawn_blocking(move || ingest::process_batches(batch_rx, map, store))
            };
            let fetcher = ingest::spawn_enrichment_fetcher(
                source,
                Arc::clone(&map),
                config.enrichment_interval(),
                batch_tx,
                stop_rx.clone(),
            );
            (fetcher, worker)
        });

        let http_handle = if config.http {
            let state = Arc::new(HttpState {
                map: Arc::clone(&map),
                visibility: Arc::clone(&visibility),
            });
            let port = config.http_port;
            Some(tokio::spawn(async move {
                if let Err(e) = network::run_http_server(port, state).await {
                    error!("HTTP server error: {}", e);
                }
            }))
        } else {
            None
        };

        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down");

        // Cleanup
        poll_handle.shutdown().await;
        stop_tx.send_replace(true);
        sweeper_handle.await.ok();
        if let Some((fetcher, worker)) = enrichment_handles {
            fetcher.await.ok();
            // the worker exits once in-flight fetches drop their senders
            worker.await.ok();
        }
        if let Some(h) = http_handle {
            h.abort();
        }
    });

    info!("{} tracks in memory at exit", map.len());
    Ok(())
}
