//! Zone groups: exclusive-access domains.
//!
//! At most one cooperating thread is inside a group at a time; entry is
//! reentrant for the owning thread and blocks everyone else. A group owns one
//! or more zones, the nursery its mutator allocates from, and the store
//! buffer remembering tenured-to-nursery edges.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use super::Zone;
use crate::nursery::Nursery;
use crate::store_buffer::StoreBuffer;

struct AccessSync {
    owner: Option<ThreadId>,
    depth: usize,
}

/// The reentrant exclusive-access token of a group.
struct GroupAccess {
    sync: Mutex<AccessSync>,
    available: Condvar,
}

impl GroupAccess {
    fn new() -> Self {
        Self {
            sync: Mutex::new(AccessSync {
                owner: None,
                depth: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn enter(&self) {
        let me = std::thread::current().id();
        let mut sync = self.sync.lock().unwrap();
        loop {
            match sync.owner {
                None => {
                    sync.owner = Some(me);
                    sync.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    sync.depth += 1;
                    return;
                }
                Some(_) => sync = self.available.wait(sync).unwrap(),
            }
        }
    }

    fn leave(&self) {
        let me = std::thread::current().id();
        let mut sync = self.sync.lock().unwrap();
        assert_eq!(sync.owner, Some(me), "leaving a group we do not own");
        sync.depth -= 1;
        if sync.depth == 0 {
            sync.owner = None;
            drop(sync);
            self.available.notify_one();
        }
    }

    fn owned_by_current_thread(&self) -> bool {
        self.sync.lock().unwrap().owner == Some(std::thread::current().id())
    }
}

static NEXT_GROUP_ID: AtomicUsize = AtomicUsize::new(1);

/// An exclusive-access domain holding one or more zones and a nursery.
pub struct ZoneGroup {
    id: usize,
    access: GroupAccess,
    zones: Mutex<Vec<Arc<Zone>>>,
    /// The owning runtime, set at creation. Barriers reach the collector
    /// through this.
    runtime: AtomicUsize,
    /// The young generation for this group's mutator.
    pub nursery: Nursery,
    /// The remembered set of tenured-to-nursery edges.
    pub store_buffer: StoreBuffer,
}

impl ZoneGroup {
    pub(crate) fn new(nursery_bytes: usize, generational_enabled: bool) -> Arc<ZoneGroup> {
        Arc::new(ZoneGroup {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            access: GroupAccess::new(),
            zones: Mutex::new(Vec::new()),
            runtime: AtomicUsize::new(0),
            nursery: Nursery::new(nursery_bytes, generational_enabled),
            store_buffer: StoreBuffer::new(generational_enabled),
        })
    }

    pub(crate) fn set_runtime(&self, runtime: *const crate::runtime::GcRuntime) {
        self.runtime.store(runtime as usize, Ordering::Release);
    }

    /// The runtime this group belongs to.
    pub fn runtime(&self) -> &crate::runtime::GcRuntime {
        let raw = self.runtime.load(Ordering::Acquire);
        assert!(raw != 0, "zone group {} is not attached to a runtime", self.id);
        unsafe { &*(raw as *const crate::runtime::GcRuntime) }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Enter the group. Blocks while another thread is inside; reentrant for
    /// the owning thread.
    pub fn enter(&self) {
        self.access.enter();
    }

    /// Leave the group, waking one waiter once the reentrancy count drops to
    /// zero.
    pub fn leave(&self) {
        self.access.leave();
    }

    /// Does the current thread hold this group's access token? Barriers and
    /// allocation assert this.
    pub fn owned_by_current_thread(&self) -> bool {
        self.access.owned_by_current_thread()
    }

    pub(crate) fn add_zone(self: &Arc<Self>, zone: Arc<Zone>) {
        zone.attach_to_group(Arc::as_ptr(self));
        self.zones.lock().unwrap().push(zone);
    }

    /// The group's zones.
    pub fn zones(&self) -> Vec<Arc<Zone>> {
        self.zones.lock().unwrap().clone()
    }

    pub(crate) fn remove_zone(&self, id: usize) {
        self.zones.lock().unwrap().retain(|z| z.id() != id);
    }
}

impl std::fmt::Debug for ZoneGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ZoneGroup")
            .field("id", &self.id)
            .field("zones", &self.zones.lock().unwrap().len())
            .finish()
    }
}

/// RAII guard for group entry.
pub struct GroupGuard<'a> {
    group: &'a ZoneGroup,
}

impl<'a> GroupGuard<'a> {
    pub fn enter(group: &'a ZoneGroup) -> GroupGuard<'a> {
        group.enter();
        GroupGuard { group }
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        self.group.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_access() {
        let group = ZoneGroup::new(1 << 16, true);
        group.enter();
        group.enter();
        assert!(group.owned_by_current_thread());
        group.leave();
        assert!(group.owned_by_current_thread());
        group.leave();
        assert!(!group.owned_by_current_thread());
    }

    #[test]
    fn exclusive_across_threads() {
        let group = ZoneGroup::new(1 << 16, true);
        group.enter();
        let other = {
            let group = group.clone();
            std::thread::spawn(move || {
                // This blocks until the main thread leaves.
                let _guard = GroupGuard::enter(&group);
                group.owned_by_current_thread()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        group.leave();
        assert!(other.join().unwrap());
    }
}
