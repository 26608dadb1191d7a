//! Service addressing: the slot table mapping handles to live contexts and
//! the sorted name table.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::ServiceContext;

/// 32-bit service address: upper 8 bits are the node (harbor) id, lower 24
/// the service index within the node. Address 0 is reserved.
pub type Handle = u32;

/// Mask selecting the node-local part of a handle.
pub const HANDLE_MASK: Handle = 0x00FF_FFFF;
/// Shift isolating the harbor id.
pub const HANDLE_REMOTE_SHIFT: u32 = 24;

const DEFAULT_SLOT_SIZE: usize = 4;
const MAX_SLOT_SIZE: usize = 0x4000_0000;

#[derive(Debug)]
struct NameEntry {
    name: Box<str>,
    handle: Handle,
}

struct Inner {
    /// Next allocation starting point; monotonically increasing.
    handle_index: Handle,
    /// Power-of-two slot array so `handle & (len - 1)` is the hash.
    slots: Vec<Option<Arc<ServiceContext>>>,
    /// Sorted by name; lookup is binary search.
    names: Vec<NameEntry>,
}

/// The service registry. Writers take the lock for register/retire/naming,
/// readers for grab/find.
pub struct HandleStorage {
    /// Local harbor id shifted into the high byte.
    harbor: Handle,
    inner: RwLock<Inner>,
}

impl HandleStorage {
    pub fn new(harbor: u32) -> Self {
        Self {
            harbor: (harbor & 0xFF) << HANDLE_REMOTE_SHIFT,
            inner: RwLock::new(Inner {
                // handle 0 is reserved for the system
                handle_index: 1,
                slots: vec![None; DEFAULT_SLOT_SIZE],
                names: Vec::with_capacity(2),
            }),
        }
    }

    /// Register a context, assigning it the lowest free handle at or after
    /// the last allocation point. The context's own handle field is set
    /// under the write lock, before the slot becomes visible.
    pub fn register(&self, ctx: &Arc<ServiceContext>) -> crate::Result<Handle> {
        let mut s = self.inner.write();
        loop {
            let slot_size = s.slots.len();
            for i in 0..slot_size {
                let handle = (i as Handle + s.handle_index) & HANDLE_MASK;
                if handle == 0 {
                    // reserved address, never allocated
                    continue;
                }
                let hash = handle as usize & (slot_size - 1);
                if s.slots[hash].is_none() {
                    let full = handle | self.harbor;
                    ctx.bind_handle(full);
                    s.slots[hash] = Some(ctx.clone());
                    s.handle_index = handle + 1;
                    return Ok(full);
                }
            }
            if slot_size * 2 > MAX_SLOT_SIZE {
                return Err(crate::Error::HandleTableFull);
            }
            // grow and rehash: slot count stays a power of two
            let mut grown: Vec<Option<Arc<ServiceContext>>> = vec![None; slot_size * 2];
            for ctx in s.slots.drain(..).flatten() {
                let hash = ctx.handle() as usize & (slot_size * 2 - 1);
                debug_assert!(grown[hash].is_none());
                grown[hash] = Some(ctx);
            }
            s.slots = grown;
        }
    }

    /// Drop the slot for `handle` and every name bound to it. Idempotent;
    /// returns whether a live context was actually retired.
    pub fn retire(&self, handle: Handle) -> bool {
        let retired = {
            let mut s = self.inner.write();
            let hash = handle as usize & (s.slots.len() - 1);
            match &s.slots[hash] {
                Some(ctx) if ctx.handle() == handle => {
                    let ctx = s.slots[hash].take();
                    s.names.retain(|n| n.handle != handle);
                    ctx
                }
                _ => None,
            }
        };
        // the context may release (and re-enter the registry) outside the lock
        retired.is_some()
    }

    /// Retire every live service; loops until a full pass finds none.
    pub fn retire_all(&self) {
        loop {
            let mut n = 0;
            let slot_count = self.inner.read().slots.len();
            for i in 0..slot_count {
                let handle = {
                    let s = self.inner.read();
                    // the table only ever grows, but re-check the index
                    s.slots.get(i).and_then(|slot| slot.as_ref()).map(|c| c.handle())
                };
                if let Some(handle) = handle {
                    if handle != 0 && self.retire(handle) {
                        n += 1;
                    }
                }
            }
            if n == 0 {
                return;
            }
        }
    }

    /// Fetch the live context at `handle`, if any. The clone keeps the
    /// context alive for the duration of the caller's use.
    pub fn grab(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        let s = self.inner.read();
        let hash = handle as usize & (s.slots.len() - 1);
        match &s.slots[hash] {
            Some(ctx) if ctx.handle() == handle => Some(ctx.clone()),
            _ => None,
        }
    }

    /// Resolve a registered name.
    pub fn find_name(&self, name: &str) -> Option<Handle> {
        let s = self.inner.read();
        s.names
            .binary_search_by(|e| e.name.as_ref().cmp(name))
            .ok()
            .map(|i| s.names[i].handle)
    }

    /// Bind `name` to `handle`. Names are unique; returns false if taken.
    pub fn bind_name(&self, handle: Handle, name: &str) -> bool {
        let mut s = self.inner.write();
        match s.names.binary_search_by(|e| e.name.as_ref().cmp(name)) {
            Ok(_) => false,
            Err(at) => {
                s.names.insert(
                    at,
                    NameEntry {
                        name: name.into(),
                        handle,
                    },
                );
                true
            }
        }
    }

    /// Local harbor id shifted into the high byte, for remote detection.
    pub fn harbor_bits(&self) -> Handle {
        self.harbor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bare_context, test_node};

    #[test]
    fn register_assigns_unique_increasing_handles() {
        let node = test_node();
        let storage = HandleStorage::new(3);
        let mut handles = Vec::new();
        for _ in 0..40 {
            let ctx = bare_context(&node);
            let h = storage.register(&ctx).unwrap();
            assert_eq!(ctx.handle(), h);
            assert_eq!(h >> HANDLE_REMOTE_SHIFT, 3);
            handles.push((h, ctx));
        }
        let mut sorted: Vec<_> = handles.iter().map(|(h, _)| *h).collect();
        sorted.dedup();
        assert_eq!(sorted.len(), 40);

        for (h, _) in &handles {
            assert_eq!(storage.grab(*h).unwrap().handle(), *h);
        }
    }

    #[test]
    fn retire_is_idempotent_and_blocks_grab() {
        let node = test_node();
        let storage = HandleStorage::new(1);
        let ctx = bare_context(&node);
        let h = storage.register(&ctx).unwrap();

        assert!(storage.retire(h));
        assert!(!storage.retire(h));
        assert!(storage.grab(h).is_none());

        // the address is not immediately reused
        let other = bare_context(&node);
        let h2 = storage.register(&other).unwrap();
        assert_ne!(h, h2);
    }

    #[test]
    fn names_are_unique_and_sorted() {
        let node = test_node();
        let storage = HandleStorage::new(1);
        let a = bare_context(&node);
        let b = bare_context(&node);
        let ha = storage.register(&a).unwrap();
        let hb = storage.register(&b).unwrap();

        assert!(storage.bind_name(ha, "launcher"));
        assert!(storage.bind_name(hb, "gate"));
        assert!(!storage.bind_name(hb, "launcher"));

        assert_eq!(storage.find_name("launcher"), Some(ha));
        assert_eq!(storage.find_name("gate"), Some(hb));
        assert_eq!(storage.find_name("missing"), None);
    }

    #[test]
    fn retire_removes_names() {
        let node = test_node();
        let storage = HandleStorage::new(1);
        let ctx = bare_context(&node);
        let h = storage.register(&ctx).unwrap();
        assert!(storage.bind_name(h, "db"));
        assert!(storage.bind_name(h, "db2"));

        storage.retire(h);
        assert_eq!(storage.find_name("db"), None);
        assert_eq!(storage.find_name("db2"), None);
    }

    #[test]
    fn retire_all_empties_the_table() {
        let node = test_node();
        let storage = HandleStorage::new(1);
        let ctxs: Vec<_> = (0..9).map(|_| bare_context(&node)).collect();
        let handles: Vec<_> = ctxs
            .iter()
            .map(|c| storage.register(c).unwrap())
            .collect();

        storage.retire_all();
        for h in handles {
            assert!(storage.grab(h).is_none());
        }
    }

    #[test]
    fn grows_past_initial_capacity() {
        let node = test_node();
        let storage = HandleStorage::new(0);
        let ctxs: Vec<_> = (0..100).map(|_| bare_context(&node)).collect();
        for ctx in &ctxs {
            storage.register(ctx).unwrap();
        }
        for ctx in &ctxs {
            assert!(storage.grab(ctx.handle()).is_some());
        }
    }
}
