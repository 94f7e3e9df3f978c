// Shared helpers for the integration tests. Not every test file uses every
// helper.
#![allow(dead_code)]

use std::sync::Mutex;

use tephra::cell::{CellRef, TraceKind, Value};
use tephra::memory_manager as mm;
use tephra::{GcRuntime, Mutator, RuntimeBuilder};

/// A fresh runtime with the given `key=value` option pairs on top of the
/// defaults. Environment variables are ignored so tests are hermetic.
pub fn new_runtime_with(options: &str) -> Box<GcRuntime> {
    let mut builder = RuntimeBuilder::new_no_env_vars();
    builder
        .options
        .set_bulk(options)
        .unwrap_or_else(|e| panic!("bad test options {:?}: {}", options, e));
    builder.build()
}

/// A fresh runtime with default options.
pub fn new_runtime() -> Box<GcRuntime> {
    RuntimeBuilder::new_no_env_vars().build()
}

/// A runtime plus a mutator bound to its system group.
pub fn runtime_and_mutator() -> (Box<GcRuntime>, Box<Mutator>) {
    let rt = new_runtime();
    let mutator = rt.bind_mutator(rt.system_group());
    (rt, mutator)
}

/// Build a singly linked list of `count` objects: slot 0 is the next link,
/// slot 1 holds the node's index as an integer. The intermediate nodes are
/// kept rooted across allocation, which may run collections. Returns the
/// (possibly relocated) head.
pub fn build_chain(mutator: &Mutator, count: usize) -> CellRef {
    assert!(count > 0);
    let mut head_slot: Option<CellRef> = None;
    let _head_guard = mm::root_stack_slot(mutator, TraceKind::Object, &mut head_slot);
    let mut tail_slot: Option<CellRef> = None;
    let _tail_guard = mm::root_stack_slot(mutator, TraceKind::Object, &mut tail_slot);

    for i in 0..count {
        let obj = mm::new_object(mutator, 2).expect("allocation failed");
        mm::write_slot(obj, 1, Value::from_int(i as i32));
        match tail_slot {
            None => head_slot = Some(obj),
            Some(tail) => mm::write_slot(tail, 0, Value::from_cell(obj)),
        }
        tail_slot = Some(obj);
    }
    head_slot.expect("non-empty chain")
}

/// Walk a chain built by `build_chain`, returning every node.
pub fn walk_chain(head: CellRef) -> Vec<CellRef> {
    let mut nodes = vec![head];
    let mut cur = head;
    while let Some(next) = mm::read_slot(cur, 0).as_cell() {
        nodes.push(next);
        cur = next;
    }
    nodes
}

/// A lazily created fixture shared serially between the tests of one file.
/// `with_fixture` calls are serialized, so at most one test is inside the
/// fixture's zone group at a time.
pub struct SerialFixture<T> {
    content: Mutex<Option<Box<T>>>,
    create: fn() -> T,
}

impl<T> SerialFixture<T> {
    pub const fn new(create: fn() -> T) -> Self {
        Self {
            content: Mutex::new(None),
            create,
        }
    }

    pub fn with_fixture<F: Fn(&T)>(&self, func: F) {
        let mut c = self.content.lock().unwrap();
        if c.is_none() {
            *c = Some(Box::new((self.create)()));
        }
        func(c.as_ref().unwrap())
    }
}
