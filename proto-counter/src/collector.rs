use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::maps::{Map, MapData, PerCpuArray, PerCpuHashMap, PerCpuValues};
use chrono::Utc;
use log::{debug, info, warn};
use tokio::{signal, time};

use proto_counter_common::{IfProtoKey, MAP_IF_STATS, MAP_STATS, ProtoStats, ProtoTag};

use crate::{
    metrics::{self, ProtoMetrics},
    model::{Delta, DeltaTracker, Report, Snapshot, reports, sum_counters},
};

pub const DEFAULT_INTERVAL_SECS: u64 = 5;

#[derive(Clone, Debug)]
pub struct CollectOptions {
    pub pin_dir: PathBuf,
    pub interval: Duration,
    pub once: bool,
    pub json: bool,
    pub metrics_addr: SocketAddr,
}

/// Pinned maps opened read-only from userspace.
struct PinnedMaps {
    stats: PerCpuArray<MapData, ProtoStats>,
    if_stats: Option<PerCpuHashMap<MapData, IfProtoKey, ProtoStats>>,
}

impl PinnedMaps {
    fn open(pin_dir: &Path) -> Result<Self> {
        let stats_path = pin_dir.join(MAP_STATS);
        let stats = PerCpuArray::try_from(open_pinned(&stats_path)?)
            .map_err(|e| anyhow!("{MAP_STATS} is not a per-CPU array: {e}"))?;

        // The per-interface table is optional; globals are still worth exporting without it.
        let if_stats_path = pin_dir.join(MAP_IF_STATS);
        let if_stats = match open_pinned(&if_stats_path) {
            Ok(map) => Some(
                PerCpuHashMap::try_from(map)
                    .map_err(|e| anyhow!("{MAP_IF_STATS} is not a per-CPU hash: {e}"))?,
            ),
            Err(err) => {
                warn!("per-interface counters unavailable: {err:#}");
                None
            }
        };

        Ok(Self { stats, if_stats })
    }

    fn scrape(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();

        for tag in ProtoTag::ALL {
            let per_cpu: PerCpuValues<ProtoStats> = self
                .stats
                .get(&tag.slot(), 0)
                .map_err(|e| anyhow!("lookup {MAP_STATS}[{}]: {e}", tag.slot()))?;
            snapshot.global.push((tag, sum_counters(per_cpu.iter())));
        }

        if let Some(if_stats) = &self.if_stats {
            for item in if_stats.iter() {
                let (key, per_cpu) = item.map_err(|e| anyhow!("iterate {MAP_IF_STATS}: {e}"))?;
                snapshot.interfaces.push((key, sum_counters(per_cpu.iter())));
            }
            snapshot.interfaces.sort_unstable_by_key(|(key, _)| *key);
        }

        Ok(snapshot)
    }
}

fn open_pinned(path: &Path) -> Result<Map> {
    let map_data = MapData::from_pin(path)
        .map_err(|e| anyhow!("failed to open pinned map {}: {e}", path.display()))?;
    Map::from_map_data(map_data).map_err(|e| anyhow!("invalid map type at {}: {e}", path.display()))
}

pub fn emit(reports: &[Report]) -> Result<()> {
    for report in reports {
        let line = serde_json::to_string(report).context("failed to encode report")?;
        println!("{line}");
    }
    Ok(())
}

fn publish(metrics: &ProtoMetrics, deltas: &[Delta], json: bool) -> Result<()> {
    metrics.record(deltas);
    if json {
        emit(&reports(deltas, Utc::now()))?;
    }
    Ok(())
}

pub async fn run_collector(opts: CollectOptions) -> Result<()> {
    ensure!(
        !opts.interval.is_zero(),
        "collect interval must be greater than zero"
    );

    let maps = PinnedMaps::open(&opts.pin_dir)?;
    let mut tracker = DeltaTracker::default();

    // The first scrape sets the baselines; if it fails there is nothing to report against.
    let snapshot = maps.scrape().context("initial scrape failed")?;
    let deltas = tracker.advance(&snapshot);
    if opts.once {
        return emit(&reports(&deltas, Utc::now()));
    }

    let metrics = ProtoMetrics::new().context("failed to register metrics")?;
    publish(&metrics, &deltas, opts.json)?;
    let server = metrics::serve(metrics.clone(), opts.metrics_addr).await?;

    info!(
        "collecting from {} every {:?}",
        opts.pin_dir.display(),
        opts.interval
    );
    let mut ticker = time::interval(opts.interval);
    ticker.tick().await;
    let outcome = loop {
        tokio::select! {
            res = signal::ctrl_c() => {
                info!("stopping collector");
                break res.context("failed to wait for shutdown signal");
            }
            _ = ticker.tick() => {
                match maps.scrape() {
                    Ok(snapshot) => {
                        let deltas = tracker.advance(&snapshot);
                        debug!("scrape produced {} deltas", deltas.len());
                        if let Err(err) = publish(&metrics, &deltas, opts.json) {
                            break Err(err);
                        }
                    }
                    Err(err) => warn!("scrape failed: {err:#}"),
                }
            }
        }
    };

    server.shutdown().await;
    outcome
}
