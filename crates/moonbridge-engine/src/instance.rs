//! VM instance
//!
//! One [`Instance`] per interpreter state. It owns the reference table, the
//! registered type extensions, per-context deadlines, the coroutine bridge and
//! the optional memory accounting. Trampolines find it through a light
//! userdata slot in the VM registry; the slot is cleared before the state is
//! closed so finalizers running during shutdown become no-ops.

use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::ffi::{c_int, c_void};
use std::ptr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::binding::{self, ffi, LuaState};
use crate::bridge::CoroutineBridge;
use crate::error::{Error, Result};
use crate::extension::TypeExtension;
use crate::reference::{Handle, ReferenceTable};
use crate::thread::Thread;
use crate::value::Value;

/// Allocation counters shared with the allocator hook
#[derive(Default)]
pub(crate) struct MemoryStats {
    used: Cell<usize>,
    max: Cell<Option<usize>>,
}

struct RegisteredExtension {
    priority: i32,
    extension: Rc<dyn TypeExtension>,
}

pub(crate) struct Instance {
    state: Cell<*mut LuaState>,
    closed: Cell<bool>,
    references: RefCell<ReferenceTable>,
    extensions: RefCell<Vec<RegisteredExtension>>,
    deadlines: RefCell<FxHashMap<usize, Instant>>,
    bridge: CoroutineBridge,
    memory: Option<Box<MemoryStats>>,
    callback_context: RefCell<Option<(Thread, c_int)>>,
    function_timeout: Cell<Option<Duration>>,
}

impl Instance {
    /// Create a VM state, with the accounting allocator when `trace_allocations` is set.
    pub(crate) fn create(trace_allocations: bool) -> Result<Rc<Instance>> {
        let memory = trace_allocations.then(|| Box::new(MemoryStats::default()));
        let state = unsafe {
            match &memory {
                Some(stats) => {
                    let stats: *const MemoryStats = &**stats;
                    ffi::lua_newstate(traced_allocator, stats as *mut c_void)
                }
                None => ffi::luaL_newstate(),
            }
        };
        if state.is_null() {
            return Err(Error::Memory("cannot allocate a new VM state".to_string()));
        }

        let instance = Rc::new(Instance {
            state: Cell::new(state),
            closed: Cell::new(false),
            references: RefCell::new(ReferenceTable::new()),
            extensions: RefCell::new(Vec::new()),
            deadlines: RefCell::new(FxHashMap::default()),
            bridge: CoroutineBridge::default(),
            memory,
            callback_context: RefCell::new(None),
            function_timeout: Cell::new(None),
        });
        unsafe {
            binding::set_instance_pointer(state, Rc::as_ptr(&instance) as *const c_void);
        }
        tracing::debug!(traced = trace_allocations, "VM instance created");
        Ok(instance)
    }

    /// Instance attached to `state`, `None` once detached or closed.
    pub(crate) unsafe fn from_state(state: *mut LuaState) -> Option<Rc<Instance>> {
        let pointer = binding::instance_pointer(state) as *const Instance;
        if pointer.is_null() {
            return None;
        }
        Rc::increment_strong_count(pointer);
        let instance = Rc::from_raw(pointer);
        if instance.is_closed() {
            return None;
        }
        Some(instance)
    }

    pub(crate) fn state(&self) -> *mut LuaState {
        self.state.get()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn bridge(&self) -> &CoroutineBridge {
        &self.bridge
    }

    // ------------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------------

    pub(crate) fn reference(&self, value: Value) -> Handle {
        self.references.borrow_mut().reference(value)
    }

    pub(crate) fn unreference(&self, handle: Handle) {
        // Dropping the value may re-enter the instance (VM callables release
        // their registry slot), so it must happen after the borrow ends.
        let removed = self.references.borrow_mut().unreference(handle);
        drop(removed);
    }

    pub(crate) fn get_reference(&self, handle: Handle) -> Option<Value> {
        self.references.borrow().get(handle).cloned()
    }

    #[cfg(test)]
    pub(crate) fn with_references<R>(&self, f: impl FnOnce(&ReferenceTable) -> R) -> R {
        f(&self.references.borrow())
    }

    // ------------------------------------------------------------------------
    // Type extensions
    // ------------------------------------------------------------------------

    /// Register `extension`. Higher priorities are tried first, ties keep registration order.
    pub(crate) fn register_extension(&self, priority: i32, extension: Rc<dyn TypeExtension>) {
        let mut extensions = self.extensions.borrow_mut();
        tracing::debug!(name = ?extension.name(), priority, "type extension registered");
        extensions.push(RegisteredExtension { priority, extension });
        extensions.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Snapshot of the extensions in dispatch order.
    pub(crate) fn extensions(&self) -> Vec<Rc<dyn TypeExtension>> {
        self.extensions
            .borrow()
            .iter()
            .map(|registered| registered.extension.clone())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Deadlines
    // ------------------------------------------------------------------------

    pub(crate) fn deadline(&self, state: *mut LuaState) -> Option<Instant> {
        self.deadlines.borrow().get(&(state as usize)).copied()
    }

    pub(crate) fn set_deadline(&self, state: *mut LuaState, deadline: Option<Instant>) {
        let mut deadlines = self.deadlines.borrow_mut();
        match deadline {
            Some(deadline) => deadlines.insert(state as usize, deadline),
            None => deadlines.remove(&(state as usize)),
        };
    }

    // ------------------------------------------------------------------------
    // Callback context
    // ------------------------------------------------------------------------

    pub(crate) fn set_callback_context(&self, context: Thread, anchor: c_int) {
        *self.callback_context.borrow_mut() = Some((context, anchor));
    }

    pub(crate) fn callback_context(&self) -> Option<Thread> {
        self.callback_context
            .borrow()
            .as_ref()
            .map(|(context, _)| context.clone())
    }

    /// Detach the callback context, returning its registry anchor.
    pub(crate) fn take_callback_context(&self) -> Option<(Thread, c_int)> {
        self.callback_context.borrow_mut().take()
    }

    pub(crate) fn function_timeout(&self) -> Option<Duration> {
        self.function_timeout.get()
    }

    pub(crate) fn set_function_timeout(&self, timeout: Option<Duration>) {
        self.function_timeout.set(timeout);
    }

    // ------------------------------------------------------------------------
    // Memory accounting
    // ------------------------------------------------------------------------

    fn memory_stats(&self) -> Result<&MemoryStats> {
        self.memory.as_deref().ok_or_else(|| {
            Error::programming("memory allocations are not being traced, enable trace_allocations")
        })
    }

    pub(crate) fn memory_used(&self) -> Result<usize> {
        Ok(self.memory_stats()?.used.get())
    }

    pub(crate) fn memory_max(&self) -> Result<Option<usize>> {
        Ok(self.memory_stats()?.max.get())
    }

    pub(crate) fn set_memory_max(&self, max: Option<usize>) -> Result<()> {
        self.memory_stats()?.max.set(max);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Close the VM. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.get() {
            return;
        }

        for extension in self.extensions() {
            extension.close();
        }

        self.closed.set(true);
        self.bridge.clear();
        self.deadlines.borrow_mut().clear();
        let context = self.callback_context.borrow_mut().take();
        drop(context);

        let state = self.state.replace(ptr::null_mut());
        if !state.is_null() {
            unsafe {
                binding::set_instance_pointer(state, ptr::null());
                ffi::lua_close(state);
            }
        }

        let values = self.references.borrow_mut().clear();
        drop(values);
        let extensions = std::mem::take(&mut *self.extensions.borrow_mut());
        drop(extensions);
        tracing::debug!("VM instance closed");
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.close();
    }
}

/// `lua_Alloc` hook enforcing the memory ceiling.
unsafe extern "C-unwind" fn traced_allocator(
    ud: *mut c_void,
    block: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let stats = &*(ud as *const MemoryStats);
    // For new blocks `osize` encodes the object kind, not a size.
    let old = if block.is_null() { 0 } else { osize };

    if nsize == 0 {
        if !block.is_null() {
            libc::free(block);
            stats.used.set(stats.used.get().saturating_sub(old));
        }
        return ptr::null_mut();
    }

    if nsize > old {
        if let Some(max) = stats.max.get() {
            if stats.used.get() + (nsize - old) > max {
                return ptr::null_mut();
            }
        }
    }

    let resized = libc::realloc(block, nsize);
    if resized.is_null() {
        return ptr::null_mut();
    }
    stats.used.set(stats.used.get().saturating_sub(old) + nsize);
    resized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untraced_memory_is_a_programming_error() {
        let instance = Instance::create(false).unwrap();
        assert!(matches!(instance.memory_used(), Err(Error::Programming(_))));
        assert!(matches!(instance.set_memory_max(Some(1)), Err(Error::Programming(_))));
        instance.close();
    }

    #[test]
    fn test_traced_memory_reports_usage() {
        let instance = Instance::create(true).unwrap();
        assert!(instance.memory_used().unwrap() > 0);
        instance.set_memory_max(Some(1 << 20)).unwrap();
        assert_eq!(instance.memory_max().unwrap(), Some(1 << 20));
        instance.close();
    }

    #[test]
    fn test_lookup_from_state_until_closed() {
        let instance = Instance::create(false).unwrap();
        let state = instance.state();
        let found = unsafe { Instance::from_state(state) }.unwrap();
        assert!(Rc::ptr_eq(&found, &instance));
        drop(found);
        instance.close();
        assert!(instance.is_closed());
        assert!(instance.state().is_null());
        instance.close();
    }

    #[test]
    fn test_deadlines_keyed_by_state() {
        let instance = Instance::create(false).unwrap();
        let state = instance.state();
        let deadline = Instant::now() + Duration::from_secs(1);
        instance.set_deadline(state, Some(deadline));
        assert_eq!(instance.deadline(state), Some(deadline));
        instance.set_deadline(state, None);
        assert_eq!(instance.deadline(state), None);
        instance.close();
    }
}
