use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Number as JsonNumber, Value};

use proto_counter_common::{IfProtoKey, ProtoStats, ProtoTag};

/// Sum of one key's per-core records. Kept in `u128` so adding cores never wraps.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Totals {
    pub packets: u128,
    pub bytes: u128,
}

impl Totals {
    pub fn is_zero(&self) -> bool {
        self.packets == 0 && self.bytes == 0
    }

    /// Change since `prev`. A value below the baseline means the counter
    /// was reset or wrapped, so the current value is taken as the delta.
    pub fn since(&self, prev: &Totals) -> Totals {
        Totals {
            packets: diff_total(self.packets, prev.packets),
            bytes: diff_total(self.bytes, prev.bytes),
        }
    }
}

pub fn diff_total(cur: u128, prev: u128) -> u128 {
    if cur >= prev { cur - prev } else { cur }
}

pub fn sum_counters<'a, I>(values: I) -> Totals
where
    I: IntoIterator<Item = &'a ProtoStats>,
{
    let mut totals = Totals::default();
    for v in values {
        totals.packets = totals.packets.wrapping_add(v.packets as u128);
        totals.bytes = totals.bytes.wrapping_add(v.bytes as u128);
    }
    totals
}

/// JSON has no portable integer above `u64::MAX`; those go out as strings.
pub fn value_from_u128(n: u128) -> Value {
    if n <= u64::MAX as u128 {
        Value::Number(JsonNumber::from(n as u64))
    } else {
        Value::String(n.to_string())
    }
}

/// Summed view of both tables at one point in time.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    pub global: Vec<(ProtoTag, Totals)>,
    pub interfaces: Vec<(IfProtoKey, Totals)>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CounterKey {
    Global(ProtoTag),
    Interface(IfProtoKey),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Interface,
}

/// One exported line.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub timestamp: String,
    pub scope: Scope,
    pub proto: ProtoTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ifindex: Option<u32>,
    pub packets: Value,
    pub bytes: Value,
    pub total_packets: Value,
    pub total_bytes: Value,
}

impl Report {
    fn new(timestamp: &str, delta: &Delta) -> Self {
        let (scope, proto, ifindex) = match delta.key {
            CounterKey::Global(tag) => (Scope::Global, tag, None),
            CounterKey::Interface(k) => (Scope::Interface, k.tag(), Some(k.ifindex)),
        };
        Self {
            timestamp: timestamp.to_string(),
            scope,
            proto,
            ifindex,
            packets: value_from_u128(delta.change.packets),
            bytes: value_from_u128(delta.change.bytes),
            total_packets: value_from_u128(delta.total.packets),
            total_bytes: value_from_u128(delta.total.bytes),
        }
    }
}

pub fn reports(deltas: &[Delta], at: DateTime<Utc>) -> Vec<Report> {
    let timestamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
    deltas.iter().map(|delta| Report::new(&timestamp, delta)).collect()
}

/// Movement of one key between two scrapes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Delta {
    pub key: CounterKey,
    pub change: Totals,
    pub total: Totals,
}

/// Remembers the previous totals per key and turns snapshots into deltas.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    last: HashMap<CounterKey, Totals>,
    primed: bool,
}

impl DeltaTracker {
    /// The first call reports every key; later calls only keys that moved.
    pub fn advance(&mut self, snapshot: &Snapshot) -> Vec<Delta> {
        let first = !self.primed;
        self.primed = true;

        let keyed = snapshot
            .global
            .iter()
            .map(|(tag, totals)| (CounterKey::Global(*tag), *totals))
            .chain(
                snapshot
                    .interfaces
                    .iter()
                    .map(|(key, totals)| (CounterKey::Interface(*key), *totals)),
            );

        let mut deltas = Vec::new();
        for (key, total) in keyed {
            let prev = self.last.insert(key, total).unwrap_or_default();
            let change = total.since(&prev);
            if first || !change.is_zero() {
                deltas.push(Delta { key, change, total });
            }
        }
        deltas
    }
}
