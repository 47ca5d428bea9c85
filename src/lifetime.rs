//! DRAM buffer bookkeeping.
//!
//! Every DRAM buffer the command stream refers to gets an id here. Buffers of
//! the same kind share a region of DRAM: constants are packed back to back,
//! intermediates are packed so that two of them share bytes only when their
//! lifetimes (measured in agent ids) do not overlap, and network inputs and
//! outputs are each bound to their own allocation by the runtime.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::utils::round_up_to_multiple;

pub type DramBufferId = u32;

pub const DRAM_ALIGNMENT: u32 = 64;

/// The id of the buffer holding the command stream itself.
pub const COMMAND_STREAM_BUFFER_ID: DramBufferId = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum DramBufferKind {
    /// Read by the DMA engines: encoded weights and constant tensors.
    ConstantDma,
    /// Read by the control unit: the command stream and weight metadata.
    ConstantControlUnit,
    Input,
    Output,
    Intermediate,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DramBuffer {
    pub id: DramBufferId,
    pub kind: DramBufferKind,
    pub size: u32,
    /// Offset within the region of `kind`. Assigned by [BufferManager::allocate].
    pub offset: Option<u32>,
    /// Half-open interval of agent ids during which the buffer holds live data.
    pub lifetime: Option<(u32, u32)>,
    /// Index of the network input or output bound to this buffer.
    pub source_id: Option<u32>,
    #[serde(skip)]
    pub data: Option<Arc<Vec<u8>>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Alias {
    target: DramBufferId,
    offset: u32,
}

#[derive(Clone, Debug)]
pub struct BufferManager {
    buffers: BTreeMap<DramBufferId, DramBuffer>,
    aliases: BTreeMap<DramBufferId, Alias>,
    next_id: DramBufferId,
}

/// One row of the buffer table handed to the runtime.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BufferTableEntry {
    pub id: DramBufferId,
    pub kind: DramBufferKind,
    pub offset: u32,
    pub size: u32,
    /// `(first writer, last reader + 1)`, in agent ids: the agents from the
    /// first that writes the buffer up to and including the last that reads it.
    pub lifetime: Option<(u32, u32)>,
    pub source_id: Option<u32>,
}

impl DramBuffer {
    fn new(id: DramBufferId, kind: DramBufferKind, size: u32) -> Self {
        DramBuffer {
            id,
            kind,
            size,
            offset: None,
            lifetime: None,
            source_id: None,
            data: None,
        }
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferManager {
    pub fn new() -> Self {
        let mut buffers = BTreeMap::new();
        buffers.insert(
            COMMAND_STREAM_BUFFER_ID,
            DramBuffer::new(
                COMMAND_STREAM_BUFFER_ID,
                DramBufferKind::ConstantControlUnit,
                0,
            ),
        );
        BufferManager {
            buffers,
            aliases: BTreeMap::new(),
            next_id: COMMAND_STREAM_BUFFER_ID + 1,
        }
    }

    fn push(&mut self, buffer: DramBuffer) -> DramBufferId {
        let id = buffer.id;
        self.buffers.insert(id, buffer);
        self.next_id += 1;
        id
    }

    pub fn add_dram(&mut self, kind: DramBufferKind, size: u32) -> DramBufferId {
        self.push(DramBuffer::new(self.next_id, kind, size))
    }

    pub fn add_dram_constant(&mut self, kind: DramBufferKind, data: Arc<Vec<u8>>) -> DramBufferId {
        assert!(
            matches!(
                kind,
                DramBufferKind::ConstantDma | DramBufferKind::ConstantControlUnit
            ),
            "{kind:?} is not a constant kind"
        );
        let mut buffer = DramBuffer::new(self.next_id, kind, data.len() as u32);
        buffer.data = Some(data);
        self.push(buffer)
    }

    pub fn add_dram_input(&mut self, size: u32, source_id: u32) -> DramBufferId {
        let mut buffer = DramBuffer::new(self.next_id, DramBufferKind::Input, size);
        buffer.source_id = Some(source_id);
        self.push(buffer)
    }

    /// Turns an intermediate buffer into network output `source_id`.
    pub fn change_to_output(&mut self, id: DramBufferId, source_id: u32) {
        let buffer = self.buffer_mut(id);
        assert_eq!(buffer.kind, DramBufferKind::Intermediate);
        buffer.kind = DramBufferKind::Output;
        buffer.source_id = Some(source_id);
    }

    /// Registers a view of `size` bytes at `offset` within `target`, as used
    /// for each input of a concatenation.
    pub fn add_alias(&mut self, target: DramBufferId, offset: u32, size: u32) -> DramBufferId {
        let (target, base) = self.resolve(target);
        assert!(
            base + offset + size <= self.buffers[&target].size,
            "alias overruns buffer {target}"
        );
        let id = self.next_id;
        self.next_id += 1;
        self.aliases.insert(
            id,
            Alias {
                target,
                offset: base + offset,
            },
        );
        id
    }

    /// The real buffer behind `id` and the byte offset of `id` within it.
    pub fn resolve(&self, id: DramBufferId) -> (DramBufferId, u32) {
        match self.aliases.get(&id) {
            Some(alias) => (alias.target, alias.offset),
            None => (id, 0),
        }
    }

    pub fn set_command_stream(&mut self, data: Vec<u8>) {
        let buffer = self.buffer_mut(COMMAND_STREAM_BUFFER_ID);
        buffer.size = data.len() as u32;
        buffer.data = Some(Arc::new(data));
    }

    /// Extends the lifetime of `id` to cover `[start, end)`.
    pub fn mark_buffer_used_at_time(&mut self, id: DramBufferId, start: u32, end: u32) {
        assert!(start < end, "empty use of buffer {id}");
        let buffer = self.buffer_mut(id);
        buffer.lifetime = Some(match buffer.lifetime {
            Some((s, e)) => (s.min(start), e.max(end)),
            None => (start, end),
        });
    }

    pub fn buffer(&self, id: DramBufferId) -> &DramBuffer {
        let (id, _) = self.resolve(id);
        match self.buffers.get(&id) {
            Some(b) => b,
            None => panic!("no DRAM buffer {id}"),
        }
    }

    fn buffer_mut(&mut self, id: DramBufferId) -> &mut DramBuffer {
        let (id, _) = self.resolve(id);
        match self.buffers.get_mut(&id) {
            Some(b) => b,
            None => panic!("no DRAM buffer {id}"),
        }
    }

    pub fn buffers(&self) -> impl Iterator<Item = &DramBuffer> + '_ {
        self.buffers.values()
    }

    /// Assigns an offset to every buffer. Returns the size of the constant
    /// and intermediate regions.
    pub fn allocate(&mut self) -> (u32, u32) {
        let mut constants = 0;
        let mut placed: Vec<(u32, u32, (u32, u32))> = vec![];
        let mut intermediates = 0;
        let mut by_start: Vec<&mut DramBuffer> = self.buffers.values_mut().collect();
        by_start.sort_by_key(|b| (b.lifetime.map(|l| l.0), b.id));
        for buffer in by_start {
            if buffer.id == COMMAND_STREAM_BUFFER_ID {
                buffer.offset = Some(0);
                continue;
            }
            let offset = match buffer.kind {
                DramBufferKind::ConstantDma | DramBufferKind::ConstantControlUnit => {
                    let offset = constants;
                    constants = round_up_to_multiple(offset + buffer.size, DRAM_ALIGNMENT);
                    offset
                }
                DramBufferKind::Input | DramBufferKind::Output => 0,
                DramBufferKind::Intermediate => {
                    let Some(lifetime) = buffer.lifetime else {
                        panic!("intermediate buffer {} is never used", buffer.id);
                    };
                    let offset = first_fit(&placed, buffer.size, lifetime);
                    placed.push((offset, buffer.size, lifetime));
                    intermediates = intermediates.max(offset + buffer.size);
                    offset
                }
            };
            buffer.offset = Some(offset);
        }
        debug!(
            "Allocated {} bytes of constants and {} bytes of intermediates",
            constants, intermediates
        );
        (constants, intermediates)
    }

    pub fn buffer_table(&self) -> Vec<BufferTableEntry> {
        self.buffers
            .values()
            .map(|b| BufferTableEntry {
                id: b.id,
                kind: b.kind,
                offset: b.offset.unwrap_or(0),
                size: b.size,
                lifetime: b.lifetime,
                source_id: b.source_id,
            })
            .collect()
    }
}

/// The lowest aligned offset at which `size` bytes live during `lifetime`
/// clash with nothing in `placed`.
fn first_fit(placed: &[(u32, u32, (u32, u32))], size: u32, lifetime: (u32, u32)) -> u32 {
    let mut clashes: Vec<(u32, u32)> = placed
        .iter()
        .filter(|(_, _, (s, e))| *s < lifetime.1 && lifetime.0 < *e)
        .map(|(offset, size, _)| (*offset, offset + size))
        .collect();
    clashes.sort_unstable();
    let mut candidate = 0;
    for (start, end) in clashes {
        if candidate + size <= start {
            break;
        }
        candidate = candidate.max(round_up_to_multiple(end, DRAM_ALIGNMENT));
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_command_stream_is_buffer_zero() {
        let mut manager = BufferManager::new();
        let id = manager.add_dram(DramBufferKind::Intermediate, 10);
        assert_eq!(id, 1);
        manager.set_command_stream(vec![0; 100]);
        assert_eq!(manager.buffer(COMMAND_STREAM_BUFFER_ID).size, 100);
    }

    #[test]
    fn test_constants_pack_with_alignment() {
        let mut manager = BufferManager::new();
        let a = manager.add_dram_constant(DramBufferKind::ConstantDma, Arc::new(vec![1; 10]));
        let b = manager.add_dram_constant(DramBufferKind::ConstantControlUnit, Arc::new(vec![2; 70]));
        let c = manager.add_dram_constant(DramBufferKind::ConstantDma, Arc::new(vec![3; 1]));
        manager.allocate();
        let offsets: Vec<u32> = [a, b, c]
            .iter()
            .map(|id| manager.buffer(*id).offset.unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 64, 192]);
        assert_eq!(manager.buffer(COMMAND_STREAM_BUFFER_ID).offset, Some(0));
    }

    #[test]
    fn test_disjoint_lifetimes_share_bytes() {
        let mut manager = BufferManager::new();
        let a = manager.add_dram(DramBufferKind::Intermediate, 100);
        let b = manager.add_dram(DramBufferKind::Intermediate, 100);
        let c = manager.add_dram(DramBufferKind::Intermediate, 100);
        manager.mark_buffer_used_at_time(a, 0, 3);
        manager.mark_buffer_used_at_time(b, 2, 5);
        manager.mark_buffer_used_at_time(c, 5, 7);
        manager.allocate();
        assert_eq!(manager.buffer(a).offset, Some(0));
        assert_eq!(manager.buffer(b).offset, Some(128));
        assert_eq!(manager.buffer(c).offset, Some(0));
    }

    #[test]
    fn test_aliases_resolve_to_target() {
        let mut manager = BufferManager::new();
        let target = manager.add_dram(DramBufferKind::Intermediate, 4096);
        let first = manager.add_alias(target, 0, 2048);
        let second = manager.add_alias(target, 2048, 2048);
        assert_eq!(manager.resolve(second), (target, 2048));
        manager.mark_buffer_used_at_time(first, 1, 2);
        manager.mark_buffer_used_at_time(second, 3, 9);
        assert_eq!(manager.buffer(target).lifetime, Some((1, 9)));
        manager.change_to_output(second, 0);
        assert_eq!(manager.buffer(target).kind, DramBufferKind::Output);
        assert_eq!(manager.buffer_table().len(), 2);
    }

    #[test]
    #[should_panic(expected = "never used")]
    fn test_unused_intermediate_is_fatal() {
        let mut manager = BufferManager::new();
        manager.add_dram(DramBufferKind::Intermediate, 100);
        manager.allocate();
    }

    proptest! {
        #[test]
        fn test_live_intermediates_never_overlap(
            uses in prop::collection::vec((1u32..5000, 0u32..40, 1u32..10), 1..24)
        ) {
            let mut manager = BufferManager::new();
            let ids: Vec<_> = uses
                .iter()
                .map(|&(size, start, len)| {
                    let id = manager.add_dram(DramBufferKind::Intermediate, size);
                    manager.mark_buffer_used_at_time(id, start, start + len);
                    id
                })
                .collect();
            manager.allocate();
            for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    let (a, b) = (manager.buffer(a), manager.buffer(b));
                    let (la, lb) = (a.lifetime.unwrap(), b.lifetime.unwrap());
                    let live_together = la.0 < lb.1 && lb.0 < la.1;
                    let (oa, ob) = (a.offset.unwrap(), b.offset.unwrap());
                    let share_bytes = oa < ob + b.size && ob < oa + a.size;
                    prop_assert!(!(live_together && share_bytes));
                    prop_assert_eq!(oa % DRAM_ALIGNMENT, 0);
                }
            }
        }
    }
}
