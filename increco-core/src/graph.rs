//! Module graph persistence (§4.6, §6): BFS-discover a running graph, freeze
//! it as `(module_list, connection_list)`, and frame it to a versioned,
//! length-prefixed `.rtc` blob. Grounded in the `ModuleRegistry`'s
//! `class_tag`/`init_args` contract; there is no analogous persistence code
//! in the original source (its GUI builder, which does have one, is out of
//! scope), so the framing and BFS are designed directly from §4.6/§6.1.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::ids::ModuleId;
use crate::meta::MetaValue;
use crate::module::registry::ModuleRegistry;
use crate::module::ModuleHandle;

const MAGIC: [u8; 4] = *b"IRTC";
const VERSION: u16 = 1;

/// One module entry in a persisted graph (§6): `class_tag`, constructor
/// arguments, stable id, and opaque metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub class: String,
    pub args: BTreeMap<String, MetaValue>,
    pub id: u64,
    pub meta: BTreeMap<String, MetaValue>,
}

/// `(consumer_id, producer_id)` (§6).
pub type Connection = (u64, u64);

/// The logical content of a `.rtc` file: `(module_list, connection_list)`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModuleGraph {
    pub modules: Vec<ModuleRecord>,
    pub connections: Vec<Connection>,
}

/// BFS over a running graph's left and right buffers starting from `seeds`,
/// recording every reachable module and every producer→consumer edge
/// encountered through a producer's right buffers (§4.6).
pub fn discover(seeds: &[Arc<ModuleHandle>]) -> ModuleGraph {
    let mut visited: HashSet<ModuleId> = HashSet::new();
    let mut by_id: BTreeMap<ModuleId, Arc<ModuleHandle>> = BTreeMap::new();
    let mut queue: VecDeque<Arc<ModuleHandle>> = seeds.iter().cloned().collect();

    while let Some(handle) = queue.pop_front() {
        if !visited.insert(handle.id()) {
            continue;
        }
        by_id.insert(handle.id(), Arc::clone(&handle));

        for consumer_id in handle.right_buffer_consumers() {
            if let Some(consumer) = find(seeds, &by_id, &queue, consumer_id) {
                if !visited.contains(&consumer_id) {
                    queue.push_back(consumer);
                }
            }
        }
        for producer_id in handle.left_buffer_producers() {
            if let Some(producer) = find(seeds, &by_id, &queue, producer_id) {
                if !visited.contains(&producer_id) {
                    queue.push_back(producer);
                }
            }
        }
    }

    // A second pass resolves connections once every reachable module is
    // known by id, so a connection is recorded only between two modules
    // that actually survived the BFS (both endpoints reachable from seeds).
    let mut connections = Vec::new();
    for handle in by_id.values() {
        for consumer_id in handle.right_buffer_consumers() {
            if by_id.contains_key(&consumer_id) {
                connections.push((consumer_id.raw(), handle.id().raw()));
            }
        }
    }

    let modules = by_id
        .values()
        .map(|handle| ModuleRecord {
            class: handle.class_tag().to_string(),
            args: handle.init_args(),
            id: handle.id().raw(),
            meta: BTreeMap::new(),
        })
        .collect();

    ModuleGraph { modules, connections }
}

/// Looks a module id up among the handles we already know about (seeds,
/// already-visited, or still-queued) without re-traversing buffers.
fn find(
    seeds: &[Arc<ModuleHandle>],
    by_id: &BTreeMap<ModuleId, Arc<ModuleHandle>>,
    queue: &VecDeque<Arc<ModuleHandle>>,
    id: ModuleId,
) -> Option<Arc<ModuleHandle>> {
    by_id
        .get(&id)
        .cloned()
        .or_else(|| seeds.iter().find(|h| h.id() == id).cloned())
        .or_else(|| queue.iter().find(|h| h.id() == id).cloned())
}

/// Freezes `graph` as a versioned, length-prefixed `.rtc` blob: `MAGIC (4
/// bytes) || version: u16 (LE) || payload_len: u64 (LE) || payload`, where
/// `payload` is `graph` bincode-encoded (§6.1).
pub fn save(graph: &ModuleGraph, path: impl AsRef<Path>) -> Result<()> {
    let payload = bincode::serde::encode_to_vec(graph, bincode::config::standard())
        .map_err(|e| RuntimeError::Other(anyhow::anyhow!(e)))?;

    let mut bytes = Vec::with_capacity(4 + 2 + 8 + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);

    fs::write(path, bytes)?;
    Ok(())
}

/// Reads back a `.rtc` file written by [`save`], rejecting a bad magic,
/// a version mismatch, or a truncated/oversized payload with
/// `RuntimeError::MalformedGraph`.
pub fn open(path: impl AsRef<Path>) -> Result<ModuleGraph> {
    let bytes = fs::read(path)?;
    if bytes.len() < 14 {
        return Err(RuntimeError::MalformedGraph("file shorter than frame header".to_string()));
    }
    if bytes[0..4] != MAGIC {
        return Err(RuntimeError::MalformedGraph("bad magic".to_string()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(RuntimeError::MalformedGraph(format!("unsupported version {version}")));
    }
    let payload_len = u64::from_le_bytes(bytes[6..14].try_into().unwrap()) as usize;
    let payload = bytes.get(14..14 + payload_len).ok_or_else(|| {
        RuntimeError::MalformedGraph("payload_len exceeds file length".to_string())
    })?;

    let (graph, _): (ModuleGraph, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| RuntimeError::MalformedGraph(e.to_string()))?;
    Ok(graph)
}

/// Instantiates every module in `graph` from the registry, indexed by its
/// *saved* id, and wires every connection as a subscription. Fails
/// atomically (no module is left half-wired into the caller's graph) if any
/// class tag is unregistered or any connection references an unknown id.
pub fn load(
    graph: &ModuleGraph,
    registry: &ModuleRegistry,
) -> Result<BTreeMap<u64, Arc<ModuleHandle>>> {
    let mut by_saved_id: BTreeMap<u64, Arc<ModuleHandle>> = BTreeMap::new();
    for record in &graph.modules {
        let module = registry.construct(&record.class, &record.args)?;
        let handle = ModuleHandle::new(record.class.clone(), module);
        by_saved_id.insert(record.id, handle);
    }

    for &(consumer_id, producer_id) in &graph.connections {
        let producer = by_saved_id.get(&producer_id).ok_or_else(|| {
            RuntimeError::MalformedGraph(format!("connection references unknown producer id {producer_id}"))
        })?;
        let consumer = by_saved_id.get(&consumer_id).ok_or_else(|| {
            RuntimeError::MalformedGraph(format!("connection references unknown consumer id {consumer_id}"))
        })?;
        producer.subscribe(consumer, None)?;
    }

    Ok(by_saved_id)
}
