use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, ensure};
use chrono::Utc;
use log::{debug, info};
use tokio::task;

use proto_counter_common::{PacketView, on_packet};

use crate::{
    collector::emit,
    model::{DeltaTracker, reports},
    store::{CoreCounters, InterfaceKeys, PerCoreCounters},
};

#[derive(Clone, Debug)]
pub struct ReplayOptions {
    pub input: PathBuf,
    pub workers: usize,
    pub ifindex: u32,
    pub if_map_entries: u32,
}

/// One captured frame with the interface metadata it arrived with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub ifindex: u32,
    pub ingress_ifindex: u32,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn view(&self) -> PacketView<'_> {
        PacketView::from_slice(&self.bytes).with_ifindex(self.ifindex, self.ingress_ifindex)
    }
}

/// Reads `<hex>` or `<ifindex> <ingress_ifindex> <hex>` lines; `#` starts a comment.
pub fn load_frames(path: &Path, default_ifindex: u32) -> Result<Vec<Frame>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open replay input at {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut frames = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} of {}", line_no + 1, path.display())
        })?;
        let trimmed = line.split('#').next().unwrap_or("").trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame = parse_frame_line(trimmed, default_ifindex)
            .with_context(|| format!("line {} of {}", line_no + 1, path.display()))?;
        frames.push(frame);
    }

    Ok(frames)
}

fn parse_frame_line(line: &str, default_ifindex: u32) -> Result<Frame> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let (ifindex, ingress_ifindex, payload) = match fields.as_slice() {
        [payload] => (default_ifindex, 0, *payload),
        [ifindex, ingress, payload] => (
            ifindex
                .parse::<u32>()
                .with_context(|| format!("invalid ifindex '{ifindex}'"))?,
            ingress
                .parse::<u32>()
                .with_context(|| format!("invalid ingress ifindex '{ingress}'"))?,
            *payload,
        ),
        _ => {
            return Err(anyhow!(
                "expected '<hex>' or '<ifindex> <ingress_ifindex> <hex>', got {} fields",
                fields.len()
            ));
        }
    };
    let cleaned: String = payload.chars().filter(|c| *c != ':').collect();
    let bytes = hex::decode(&cleaned).with_context(|| format!("invalid hex frame '{payload}'"))?;
    Ok(Frame {
        ifindex,
        ingress_ifindex,
        bytes,
    })
}

/// Frames are dealt round-robin; each worker owns one core's counters.
/// All workers share one per-interface key space of `capacity` entries.
pub async fn replay_frames(
    frames: Vec<Frame>,
    workers: usize,
    capacity: u32,
) -> Result<PerCoreCounters> {
    ensure!(workers > 0, "workers must be at least 1");
    ensure!(capacity > 0, "per-interface map size must be greater than zero");

    let keys = InterfaceKeys::new(capacity);
    let frames = Arc::new(frames);
    let mut handles = Vec::with_capacity(workers);
    for core in 0..workers {
        let frames = frames.clone();
        let keys = keys.clone();
        handles.push(task::spawn_blocking(move || {
            let mut shard = CoreCounters::new(keys);
            for frame in frames.iter().skip(core).step_by(workers) {
                on_packet(&mut shard, &frame.view());
            }
            shard
        }));
    }

    let mut cores = Vec::with_capacity(workers);
    for handle in handles {
        cores.push(handle.await.map_err(|err| anyhow!("worker panicked: {err}"))?);
    }
    Ok(PerCoreCounters::from_cores(keys, cores))
}

pub async fn run_replay(opts: ReplayOptions) -> Result<()> {
    let frames = load_frames(&opts.input, opts.ifindex)?;
    info!(
        "replaying {} frames from {} on {} workers",
        frames.len(),
        opts.input.display(),
        opts.workers
    );
    let counters = replay_frames(frames, opts.workers, opts.if_map_entries).await?;
    debug!(
        "collected {} core shards over {} interface keys",
        counters.core_count(),
        counters.key_count()
    );
    let deltas = DeltaTracker::default().advance(&counters.snapshot());
    emit(&reports(&deltas, Utc::now()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use proto_counter_common::{IF_STATS_MAX_ENTRIES, IfProtoKey, ProtoTag};
    use tempfile::NamedTempFile;

    use super::*;
    use crate::model::Totals;

    const IPV4_64: &str = concat!(
        "ffffffffffff020000000001", "0800",
        "4500003c00000000401100000a0000010a000002",
        "000000000000000000000000000000",
        "000000000000000000000000000000"
    );

    #[test]
    fn parses_bare_and_annotated_lines() {
        let frame = parse_frame_line("0a:0b:0c", 4).expect("bare line");
        assert_eq!(frame.bytes, vec![0x0a, 0x0b, 0x0c]);
        assert_eq!((frame.ifindex, frame.ingress_ifindex), (4, 0));

        let frame = parse_frame_line("0 9 ff", 4).expect("annotated line");
        assert_eq!((frame.ifindex, frame.ingress_ifindex), (0, 9));
        assert_eq!(frame.view().selected_ifindex(), 9);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_frame_line("zz", 0).is_err());
        assert!(parse_frame_line("abc", 0).is_err());
        assert!(parse_frame_line("1 ff", 0).is_err());
        assert!(parse_frame_line("x 0 ff", 0).is_err());
    }

    #[test]
    fn load_frames_skips_comments_and_reports_line_numbers() {
        let mut file = NamedTempFile::new().expect("tempfile");
        writeln!(file, "# capture from eth3").expect("write");
        writeln!(file).expect("write");
        writeln!(file, "{IPV4_64} # ipv4").expect("write");
        writeln!(file, "not-hex").expect("write");

        let err = load_frames(file.path(), 3).expect_err("line 4 is invalid");
        assert!(format!("{err:#}").contains("line 4"));
    }

    #[tokio::test]
    async fn replay_counts_example_ipv4_frame() {
        assert_eq!(IPV4_64.len(), 128);
        let mut file = NamedTempFile::new().expect("tempfile");
        writeln!(file, "{IPV4_64}").expect("write");

        let frames = load_frames(file.path(), 3).expect("frames");
        let counters = replay_frames(frames, 2, IF_STATS_MAX_ENTRIES)
            .await
            .expect("replay");
        let snapshot = counters.snapshot();

        let expected = Totals {
            packets: 1,
            bytes: 64,
        };
        assert!(snapshot.global.contains(&(ProtoTag::Ipv4, expected)));
        assert_eq!(
            snapshot.interfaces,
            vec![(IfProtoKey::new(3, ProtoTag::Ipv4), expected)]
        );
    }

    #[tokio::test]
    async fn replay_rejects_empty_pools() {
        assert!(replay_frames(Vec::new(), 0, IF_STATS_MAX_ENTRIES).await.is_err());
        assert!(replay_frames(Vec::new(), 1, 0).await.is_err());
    }

    #[tokio::test]
    async fn workers_share_one_bounded_key_space() {
        let frames: Vec<Frame> = (1..=16)
            .map(|ifindex| Frame {
                ifindex,
                ingress_ifindex: 0,
                bytes: hex::decode(IPV4_64).expect("hex"),
            })
            .collect();

        let counters = replay_frames(frames, 4, 4).await.expect("replay");
        assert_eq!(counters.key_count(), 4);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.interfaces.len(), 4);
        let global_ipv4 = snapshot
            .global
            .iter()
            .find(|(tag, _)| *tag == ProtoTag::Ipv4)
            .map(|(_, totals)| totals.packets);
        assert_eq!(global_ipv4, Some(16));
    }
}
