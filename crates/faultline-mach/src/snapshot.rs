//! Fixed-capacity record of previously installed exception handlers.

use crate::exception::{ExceptionBehavior, ExceptionMask, MAX_EXCEPTION_TYPES};
use crate::kernel::Port;

/// One handler registration: which exceptions go to which port, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerEntry {
    pub mask: ExceptionMask,
    pub port: Port,
    pub behavior: ExceptionBehavior,
    pub flavor: i32,
}

/// Ordered handler entries as returned by the kernel, at most one per
/// exception slot.
///
/// The kernel reports this as four parallel arrays; keeping whole records
/// makes it impossible to pair a mask with another entry's port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerSnapshot {
    entries: heapless::Vec<HandlerEntry, MAX_EXCEPTION_TYPES>,
}

impl HandlerSnapshot {
    pub const fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    /// Build from the kernel's parallel-array output. Entries past `count`,
    /// past the shortest array or past capacity are ignored.
    pub fn from_parallel(
        masks: &[u32],
        ports: &[Port],
        behaviors: &[i32],
        flavors: &[i32],
        count: usize,
    ) -> Self {
        let mut snapshot = Self::new();
        let n = count
            .min(masks.len())
            .min(ports.len())
            .min(behaviors.len())
            .min(flavors.len());
        for i in 0..n {
            let entry = HandlerEntry {
                mask: ExceptionMask::from_bits_retain(masks[i]),
                port: ports[i],
                behavior: ExceptionBehavior(behaviors[i]),
                flavor: flavors[i],
            };
            if snapshot.push(entry).is_err() {
                break;
            }
        }
        snapshot
    }

    /// Append an entry; returns it back when the snapshot is full.
    pub fn push(&mut self, entry: HandlerEntry) -> Result<(), HandlerEntry> {
        self.entries.push(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HandlerEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[HandlerEntry] {
        &self.entries
    }

    /// Union of all entry masks.
    pub fn covered_mask(&self) -> ExceptionMask {
        self.iter().fold(ExceptionMask::empty(), |acc, e| acc | e.mask)
    }

    /// True if any entry routes to `port`.
    pub fn contains_port(&self, port: Port) -> bool {
        self.iter().any(|e| e.port == port)
    }
}

impl<'a> IntoIterator for &'a HandlerSnapshot {
    type Item = &'a HandlerEntry;
    type IntoIter = std::slice::Iter<'a, HandlerEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
