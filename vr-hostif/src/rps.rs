//! Receive packet steering.
//!
//! Spreads receive work across cores. A flow always hashes to the same core,
//! never to the core doing the steering (or its hyperthread siblings), and
//! never back to the core that handled the previous stage.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::config::SteeringPoint;
use crate::error::DatapathError;
use crate::frame::{ETH_HLEN, ETH_P_IP, Frame, IPPROTO_TCP, IPPROTO_UDP};

/// Default sysfs root for CPU topology.
pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Default sysfs root for NUMA nodes.
pub const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

/// Set of cores.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct CoreMask {
    words: Vec<u64>,
}

impl CoreMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cores(cores: impl IntoIterator<Item = usize>) -> Self {
        let mut mask = Self::new();
        for core in cores {
            mask.set(core);
        }
        mask
    }

    pub fn set(&mut self, core: usize) {
        let word = core / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (core % 64);
    }

    pub fn clear(&mut self, core: usize) {
        if let Some(w) = self.words.get_mut(core / 64) {
            *w &= !(1u64 << (core % 64));
        }
    }

    pub fn contains(&self, core: usize) -> bool {
        self.words
            .get(core / 64)
            .is_some_and(|w| w & (1u64 << (core % 64)) != 0)
    }

    /// Remove every core in `other`.
    pub fn subtract(&mut self, other: &CoreMask) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Cores in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64usize).filter(move |&b| w & (1u64 << b) != 0).map(move |b| i * 64 + b)
        })
    }

    /// The `n`-th core in ascending order.
    pub fn nth(&self, n: usize) -> Option<usize> {
        self.iter().nth(n)
    }
}

impl fmt::Debug for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Parse a sysfs cpu list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Result<CoreMask, DatapathError> {
    let mut mask = CoreMask::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        let bad = || DatapathError::Topology(format!("bad cpu list entry: {part:?}"));
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().map_err(|_| bad())?;
                let hi: usize = hi.parse().map_err(|_| bad())?;
                if hi < lo {
                    return Err(bad());
                }
                for core in lo..=hi {
                    mask.set(core);
                }
            }
            None => mask.set(part.parse().map_err(|_| bad())?),
        }
    }
    Ok(mask)
}

/// Which NUMA node each core sits on and which cores are its siblings.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    node_of: Vec<usize>,
    siblings: Vec<CoreMask>,
    nodes: Vec<CoreMask>,
}

impl CpuTopology {
    /// Build from explicit per-core data. `siblings[c]` includes `c`.
    pub fn new(node_of: Vec<usize>, siblings: Vec<CoreMask>) -> Result<Self, DatapathError> {
        if node_of.is_empty() || node_of.len() != siblings.len() {
            return Err(DatapathError::Topology(format!(
                "{} node entries for {} sibling entries",
                node_of.len(),
                siblings.len()
            )));
        }
        let node_count = node_of.iter().max().map_or(0, |&n| n + 1);
        let mut nodes = vec![CoreMask::new(); node_count];
        for (core, &node) in node_of.iter().enumerate() {
            nodes[node].set(core);
        }
        Ok(Self {
            node_of,
            siblings,
            nodes,
        })
    }

    /// `cores` cores split evenly over `nodes` nodes, with
    /// `threads_per_core` consecutive cores forming a sibling group.
    pub fn uniform(cores: usize, nodes: usize, threads_per_core: usize) -> Self {
        let cores = cores.max(1);
        let nodes = nodes.clamp(1, cores);
        let threads = threads_per_core.max(1);
        let per_node = cores.div_ceil(nodes);
        let node_of: Vec<usize> = (0..cores).map(|c| c / per_node).collect();
        let siblings = (0..cores)
            .map(|c| {
                let first = c - c % threads;
                CoreMask::from_cores((first..first + threads).filter(|&s| s < cores))
            })
            .collect();
        let node_count = node_of.iter().max().map_or(0, |&n| n + 1);
        let mut node_masks = vec![CoreMask::new(); node_count];
        for (core, &node) in node_of.iter().enumerate() {
            node_masks[node].set(core);
        }
        Self {
            node_of,
            siblings,
            nodes: node_masks,
        }
    }

    /// Read the running system's topology.
    pub fn detect() -> Result<Self, DatapathError> {
        Self::from_sysfs(Path::new(SYSFS_CPU_ROOT), Path::new(SYSFS_NODE_ROOT))
    }

    /// Read topology from sysfs-shaped directories. Missing node data puts
    /// every core on node 0; missing sibling data makes every core its own
    /// group.
    pub fn from_sysfs(cpu_root: &Path, node_root: &Path) -> Result<Self, DatapathError> {
        let online = fs::read_to_string(cpu_root.join("online"))?;
        let online = parse_cpu_list(&online)?;
        let cores = online.iter().last().map_or(0, |c| c + 1);
        if cores == 0 {
            return Err(DatapathError::Topology("no online cpus".into()));
        }

        let mut node_of = vec![0; cores];
        if let Ok(entries) = fs::read_dir(node_root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(node) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("node"))
                    .and_then(|n| n.parse::<usize>().ok())
                else {
                    continue;
                };
                let Ok(list) = fs::read_to_string(entry.path().join("cpulist")) else {
                    continue;
                };
                for core in parse_cpu_list(&list)?.iter().filter(|&c| c < cores) {
                    node_of[core] = node;
                }
            }
        }

        let mut siblings = Vec::with_capacity(cores);
        for core in 0..cores {
            let path = cpu_root
                .join(format!("cpu{core}"))
                .join("topology")
                .join("thread_siblings_list");
            let mut mask = match fs::read_to_string(path) {
                Ok(list) => parse_cpu_list(&list)?,
                Err(_) => CoreMask::new(),
            };
            mask.set(core);
            siblings.push(mask);
        }

        Self::new(node_of, siblings)
    }

    pub fn num_cores(&self) -> usize {
        self.node_of.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_of(&self, core: usize) -> Option<usize> {
        self.node_of.get(core).copied()
    }

    pub fn node_mask(&self, node: usize) -> Option<&CoreMask> {
        self.nodes.get(node)
    }

    pub fn siblings(&self, core: usize) -> Option<&CoreMask> {
        self.siblings.get(core)
    }

    /// Cores `current` may steer to, excluding `previous` and its siblings.
    pub fn eligible(&self, current: usize, previous: Option<usize>) -> CoreMask {
        let Some(node) = self.node_of(current) else {
            return CoreMask::new();
        };
        let mut mask = self.nodes[node].clone();
        mask.clear(current);
        mask.subtract(&self.siblings[current]);
        if let Some(prev) = previous {
            mask.clear(prev);
            if let Some(sib) = self.siblings(prev) {
                mask.subtract(sib);
            }
        }
        mask
    }
}

/// Pick a core for a flow.
///
/// The eligible set is `current`'s NUMA node minus `current`, its siblings,
/// and `previous` with its siblings. The core at ordinal
/// `(hash * count) >> 32` is chosen; with nothing eligible the work stays on
/// `current`.
pub fn choose_core(hash: u32, current: usize, previous: Option<usize>, topo: &CpuTopology) -> usize {
    let eligible = topo.eligible(current, previous);
    let count = eligible.count();
    if count == 0 {
        return current;
    }
    let ordinal = ((hash as u64 * count as u64) >> 32) as usize;
    eligible.nth(ordinal).unwrap_or(current)
}

/// Target core for a steering point: its fixed core, or the hashed choice.
pub fn steer_target(
    point: &SteeringPoint,
    hash: u32,
    current: usize,
    previous: Option<usize>,
    topo: &CpuTopology,
) -> usize {
    match point.fixed_core {
        Some(core) => core,
        None => choose_core(hash, current, previous, topo),
    }
}

fn jhash_final(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c.wrapping_sub(b.rotate_left(24))
}

/// Hash of three words, in the style of the kernel's `jhash_3words`.
pub fn hash_3words(a: u32, b: u32, c: u32, seed: u32) -> u32 {
    let init = 0xdead_beef_u32.wrapping_add(12).wrapping_add(seed);
    jhash_final(a.wrapping_add(init), b.wrapping_add(init), c.wrapping_add(init))
}

/// Flow hash of a frame.
///
/// A non-zero `rx_hash` is used as is. Otherwise the IPv4 addresses,
/// protocol and (for TCP/UDP) ports are hashed; non-IP frames hash to 0.
/// The result is stored back in `rx_hash`.
pub fn flow_hash(frame: &mut Frame) -> u32 {
    if frame.rx_hash != 0 {
        return frame.rx_hash;
    }
    let net = match frame.network_header() {
        Some(net) => net,
        None if frame.protocol == ETH_P_IP => frame.data_offset() + ETH_HLEN,
        None => return 0,
    };
    let buf = frame.buffer();
    let Some(ip) = buf.get(net..frame.tail_offset()) else {
        return 0;
    };
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return 0;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let proto = ip[9];
    let src = u32::from_be_bytes([ip[12], ip[13], ip[14], ip[15]]);
    let dst = u32::from_be_bytes([ip[16], ip[17], ip[18], ip[19]]);
    let unfragmented = u16::from_be_bytes([ip[6], ip[7]]) & 0x3fff == 0;
    let ports = match proto {
        IPPROTO_TCP | IPPROTO_UDP if unfragmented && ip.len() >= ihl + 4 => {
            u32::from_be_bytes([ip[ihl], ip[ihl + 1], ip[ihl + 2], ip[ihl + 3]])
        }
        _ => 0,
    };
    let hash = match hash_3words(src, dst, ports ^ proto as u32, 0) {
        0 => 1,
        h => h,
    };
    frame.rx_hash = hash;
    hash
}

/// Steering metadata carried by a core-to-core message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SteerMeta {
    pub flow_hash: u32,
    /// Interface the frame arrived on, for ingress steering.
    pub source_vif: Option<u32>,
    pub source_rid: u16,
    /// Core that steered the frame.
    pub prior_core: usize,
}
