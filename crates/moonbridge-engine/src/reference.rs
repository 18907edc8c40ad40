//! Reference table
//!
//! Maps integer handles to host values so VM memory can point at host objects
//! without holding native pointers. Handles are refcounted: marshaling the same
//! object twice returns the same handle and bumps its count, and the VM's
//! finalizers release them one by one.
//!
//! Identity is the address of the value's shared allocation, so cyclic host
//! graphs are fine: the table never looks inside the values it stores.

use rustc_hash::FxHashMap;
use std::num::NonZeroU32;

use crate::value::Value;

/// Key into the reference table. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// Wrap a raw handle value, `None` for zero.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Handle)
    }

    /// Raw handle value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Entry {
    value: Value,
    ref_count: usize,
}

/// Host-side registry of values referenced from VM memory
#[derive(Default)]
pub struct ReferenceTable {
    entries: FxHashMap<Handle, Entry>,
    by_identity: FxHashMap<usize, Handle>,
    available: Vec<Handle>,
    last: Option<Handle>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference `value`, reusing its handle when it is already tracked.
    ///
    /// Values without identity (primitives, errors) always get a fresh handle.
    pub fn reference(&mut self, value: Value) -> Handle {
        let identity = value.identity();
        if let Some(handle) = identity.and_then(|id| self.by_identity.get(&id).copied()) {
            if let Some(entry) = self.entries.get_mut(&handle) {
                entry.ref_count += 1;
                return handle;
            }
        }

        // Freed handles first; otherwise `len + 1` is unused because every
        // removal pushes onto `available`.
        let handle = match self.available.pop() {
            Some(handle) => handle,
            None => Handle::new(self.entries.len() as u32 + 1).unwrap_or(Handle(NonZeroU32::MIN)),
        };
        self.entries.insert(handle, Entry { value, ref_count: 1 });
        if let Some(id) = identity {
            self.by_identity.insert(id, handle);
        }
        self.last = Some(handle);
        tracing::trace!(%handle, "reference acquired");
        handle
    }

    /// Release one reference. At zero the handle is recycled.
    ///
    /// Returns the value when this call removed it. Unknown handles are ignored.
    pub fn unreference(&mut self, handle: Handle) -> Option<Value> {
        let entry = self.entries.get_mut(&handle)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return None;
        }
        let entry = self.entries.remove(&handle)?;
        if let Some(id) = entry.value.identity() {
            if self.by_identity.get(&id) == Some(&handle) {
                self.by_identity.remove(&id);
            }
        }
        self.available.push(handle);
        tracing::trace!(%handle, "reference released");
        Some(entry.value)
    }

    /// Value behind `handle`.
    pub fn get(&self, handle: Handle) -> Option<&Value> {
        self.entries.get(&handle).map(|entry| &entry.value)
    }

    /// Current refcount of `handle`, zero when untracked.
    pub fn ref_count(&self, handle: Handle) -> usize {
        self.entries.get(&handle).map_or(0, |entry| entry.ref_count)
    }

    /// Handle of an identity-bearing value, if tracked.
    pub fn handle_of(&self, value: &Value) -> Option<Handle> {
        value.identity().and_then(|id| self.by_identity.get(&id).copied())
    }

    /// Most recently allocated handle.
    pub fn last_handle(&self) -> Option<Handle> {
        self.last
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry. Returns the values so the caller can release them
    /// outside any borrow of the table.
    pub fn clear(&mut self) -> Vec<Value> {
        self.by_identity.clear();
        self.available.clear();
        self.last = None;
        self.entries.drain().map(|(_, entry)| entry.value).collect()
    }

    /// Log every live entry at trace level.
    pub fn trace_entries(&self) {
        let mut handles: Vec<_> = self.entries.keys().copied().collect();
        handles.sort();
        for handle in handles {
            if let Some(entry) = self.entries.get(&handle) {
                tracing::trace!(%handle, refs = entry.ref_count, value = ?entry.value, "live reference");
            }
        }
    }
}

impl std::fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceTable")
            .field("entries", &self.entries.len())
            .field("available", &self.available.len())
            .finish()
    }
}
