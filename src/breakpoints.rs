#[allow(unused_imports)]
use tracing::{trace, debug, error, warn, info};

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

pub const MAXIMUM_MEMORY_BREAKPOINTS: usize = 128;

// empty table slot; guest addresses never reach this value after masking
const EMPTY: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Read,
    Write,
}

/// Opaque handle returned at registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointHit {
    pub pc: u32,
    pub address: u32,
    pub id: BreakpointId,
    pub direction: AccessDirection,
}

/// Fixed-capacity memory breakpoint tables, one per access direction.
///
/// The per-direction count words are read directly by generated code: blocks
/// compiled with the debugging feature test the count before each guest
/// memory access and call into the table scan only when it is non-zero. A
/// debugger thread may register and remove entries while generated code is
/// scanning, hence the atomic cells.
pub struct MemoryBreakpoints {
    read_count: AtomicU32,
    write_count: AtomicU32,
    read_addresses: [AtomicU32; MAXIMUM_MEMORY_BREAKPOINTS],
    read_ids: [AtomicU32; MAXIMUM_MEMORY_BREAKPOINTS],
    write_addresses: [AtomicU32; MAXIMUM_MEMORY_BREAKPOINTS],
    write_ids: [AtomicU32; MAXIMUM_MEMORY_BREAKPOINTS],
    next_id: AtomicU32,
    last_hit: Mutex<Option<BreakpointHit>>,
}

impl MemoryBreakpoints {
    pub fn new() -> MemoryBreakpoints {
        MemoryBreakpoints {
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
            read_addresses: std::array::from_fn(|_| AtomicU32::new(EMPTY)),
            read_ids: std::array::from_fn(|_| AtomicU32::new(0)),
            write_addresses: std::array::from_fn(|_| AtomicU32::new(EMPTY)),
            write_ids: std::array::from_fn(|_| AtomicU32::new(0)),
            next_id: AtomicU32::new(1),
            last_hit: Mutex::new(None),
        }
    }

    fn tables(&self, direction: AccessDirection) -> (&AtomicU32, &[AtomicU32], &[AtomicU32]) {
        match direction {
            AccessDirection::Read => (&self.read_count, &self.read_addresses, &self.read_ids),
            AccessDirection::Write => (&self.write_count, &self.write_addresses, &self.write_ids),
        }
    }

    /// Returns None when the table for that direction is full.
    pub fn register(&self, address: u32, direction: AccessDirection) -> Option<BreakpointId> {
        let (count, addresses, ids) = self.tables(direction);

        for n in 0..MAXIMUM_MEMORY_BREAKPOINTS {
            if addresses[n].compare_exchange(EMPTY, address, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                ids[n].store(id, Ordering::SeqCst);
                count.fetch_add(1, Ordering::SeqCst);
                debug!(target: "BP", "memory breakpoint {} set at ${:08X} ({:?})", id, address, direction);
                return Some(BreakpointId(id));
            }
        }
        None
    }

    pub fn remove(&self, id: BreakpointId) -> bool {
        for direction in [AccessDirection::Read, AccessDirection::Write] {
            let (count, addresses, ids) = self.tables(direction);
            for n in 0..MAXIMUM_MEMORY_BREAKPOINTS {
                if addresses[n].load(Ordering::SeqCst) != EMPTY && ids[n].load(Ordering::SeqCst) == id.0 {
                    addresses[n].store(EMPTY, Ordering::SeqCst);
                    count.fetch_sub(1, Ordering::SeqCst);
                    return true;
                }
            }
        }
        false
    }

    pub fn count(&self, direction: AccessDirection) -> u32 {
        self.tables(direction).0.load(Ordering::SeqCst)
    }

    /// Address of the count word generated code compares against zero.
    pub(crate) fn count_cell(&self, direction: AccessDirection) -> &AtomicU32 {
        self.tables(direction).0
    }

    /// Table scan behind the emitted check. Records the first match.
    pub(crate) fn scan(&self, pc: u32, address: u32, direction: AccessDirection) {
        let (_, addresses, ids) = self.tables(direction);
        for n in 0..MAXIMUM_MEMORY_BREAKPOINTS {
            if addresses[n].load(Ordering::SeqCst) == address {
                let hit = BreakpointHit {
                    pc: pc,
                    address: address,
                    id: BreakpointId(ids[n].load(Ordering::SeqCst)),
                    direction: direction,
                };
                warn!(target: "BP", "memory breakpoint {} hit at pc=${:08X} address=${:08X} ({:?})",
                      hit.id.0, pc, address, direction);
                *self.last_hit.lock().unwrap() = Some(hit);
                break;
            }
        }
    }

    /// Take the most recent hit, clearing it.
    pub fn last_hit(&self) -> Option<BreakpointHit> {
        self.last_hit.lock().unwrap().take()
    }
}
