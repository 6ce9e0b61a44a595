use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};

use proto_counter_common::{
    CounterStore, IfProtoKey, PROTO_TAG_COUNT, ProtoStats, ProtoTag, StoreFull,
};

use crate::model::{Snapshot, sum_counters};

/// Key space of the per-interface table, shared by every core.
///
/// Like a kernel per-CPU hash, a key admitted from one core exists on all of
/// them; only the records behind it are per core.
#[derive(Debug)]
pub struct InterfaceKeys {
    keys: RwLock<HashSet<IfProtoKey>>,
    capacity: usize,
}

impl InterfaceKeys {
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            keys: RwLock::new(HashSet::new()),
            capacity: capacity as usize,
        })
    }

    pub fn contains(&self, key: &IfProtoKey) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Admitting a key that is already present always succeeds.
    pub fn admit(&self, key: &IfProtoKey) -> Result<(), StoreFull> {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if keys.contains(key) {
            return Ok(());
        }
        if keys.len() >= self.capacity {
            return Err(StoreFull);
        }
        keys.insert(*key);
        Ok(())
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn sorted(&self) -> Vec<IfProtoKey> {
        let mut keys: Vec<IfProtoKey> = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        keys.sort_unstable();
        keys
    }
}

/// Userspace counterpart of one CPU's slice of the kernel maps.
///
/// Owned by exactly one worker while packets are being accounted, so the
/// records need no synchronisation. Only key admission goes through the
/// shared [`InterfaceKeys`].
#[derive(Clone, Debug)]
pub struct CoreCounters {
    global: [ProtoStats; PROTO_TAG_COUNT as usize],
    keys: Arc<InterfaceKeys>,
    interfaces: HashMap<IfProtoKey, ProtoStats>,
}

impl CoreCounters {
    pub fn new(keys: Arc<InterfaceKeys>) -> Self {
        Self {
            global: [ProtoStats::default(); PROTO_TAG_COUNT as usize],
            keys,
            interfaces: HashMap::new(),
        }
    }

    pub fn global(&self, tag: ProtoTag) -> ProtoStats {
        self.global[tag.slot() as usize]
    }

    /// Registered keys this core never touched read as zero.
    pub fn interface(&self, key: &IfProtoKey) -> Option<ProtoStats> {
        match self.interfaces.get(key) {
            Some(stats) => Some(*stats),
            None => self.keys.contains(key).then(ProtoStats::default),
        }
    }
}

impl CounterStore for CoreCounters {
    fn global_slot(&mut self, tag: ProtoTag) -> Option<&mut ProtoStats> {
        self.global.get_mut(tag.slot() as usize)
    }

    fn interface_slot(&mut self, key: &IfProtoKey) -> Option<&mut ProtoStats> {
        if !self.interfaces.contains_key(key) {
            if !self.keys.contains(key) {
                return None;
            }
            self.interfaces.insert(*key, ProtoStats::default());
        }
        self.interfaces.get_mut(key)
    }

    fn insert_interface(&mut self, key: &IfProtoKey, init: &ProtoStats) -> Result<(), StoreFull> {
        self.keys.admit(key)?;
        self.interfaces.insert(*key, *init);
        Ok(())
    }
}

/// Both tables, one [`CoreCounters`] per core id over one shared key space.
///
/// Reads return per-core lists, the same shape the kernel hands out for
/// per-CPU maps; summing is left to the caller.
#[derive(Clone, Debug)]
pub struct PerCoreCounters {
    keys: Arc<InterfaceKeys>,
    cores: Vec<CoreCounters>,
}

impl PerCoreCounters {
    #[cfg(test)]
    pub fn new(cores: usize, capacity: u32) -> Self {
        let keys = InterfaceKeys::new(capacity);
        Self {
            cores: (0..cores).map(|_| CoreCounters::new(keys.clone())).collect(),
            keys,
        }
    }

    /// `cores` must have been built over `keys`.
    pub fn from_cores(keys: Arc<InterfaceKeys>, cores: Vec<CoreCounters>) -> Self {
        debug_assert!(cores.iter().all(|core| Arc::ptr_eq(&core.keys, &keys)));
        Self { keys, cores }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn key_count(&self) -> usize {
        self.keys.key_count()
    }

    #[cfg(test)]
    pub fn core_mut(&mut self, core: usize) -> Option<&mut CoreCounters> {
        self.cores.get_mut(core)
    }

    pub fn read_global(&self, tag: ProtoTag) -> Vec<ProtoStats> {
        self.cores.iter().map(|core| core.global(tag)).collect()
    }

    /// Keys in ascending order, each with one record per core.
    pub fn iter_interfaces(&self) -> impl Iterator<Item = (IfProtoKey, Vec<ProtoStats>)> + '_ {
        self.keys.sorted().into_iter().map(move |key| {
            let per_core = self
                .cores
                .iter()
                .map(|core| core.interface(&key).unwrap_or_default())
                .collect();
            (key, per_core)
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        let global = ProtoTag::ALL
            .iter()
            .map(|tag| (*tag, sum_counters(self.read_global(*tag).iter())))
            .collect();
        let interfaces = self
            .iter_interfaces()
            .map(|(key, per_core)| (key, sum_counters(per_core.iter())))
            .collect();
        Snapshot { global, interfaces }
    }
}
