//! Cycle collection.
//!
//! Plain reference counting (`Rc`) reclaims acyclic garbage as soon as
//! the last handle drops. Cycles (a closure capturing the scope that
//! owns it, self-referencing objects) need help: the context registers
//! every allocation here, and an explicit sweep stamps everything
//! reachable from the roots with a fresh unique id, then breaks the
//! links of whatever the stamp missed so `Rc` can finish the job.
//! Values held only by the host are detected by comparing their strong
//! counts against the references the tracked graph itself accounts for,
//! and survive as additional roots.

use std::rc::{Rc, Weak};
use std::cell::RefCell;

use tracing::debug;

use crate::value::{ScriptFunction, ScriptVar, VarKind, VarPtr};

/// The context's allocation registry.
pub struct Heap {
    /// Weak handle to every value allocated through the context.
    live: Vec<Weak<RefCell<ScriptVar>>>,
    /// Monotonically increasing stamp source.
    unique_id: u32,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    /// Values whose links were cleared this sweep.
    pub collected: usize,
    /// Values still alive after the sweep.
    pub live: usize,
    /// The stamp used for the mark phase.
    pub stamp: u32,
}

impl Heap {
    /// Create an empty heap registry.
    pub fn new() -> Self {
        Heap { live: Vec::new(), unique_id: 0 }
    }

    /// Register a value. Every factory allocation passes through here.
    pub fn track(&mut self, var: &VarPtr) {
        self.live.push(Rc::downgrade(var));
    }

    /// Number of currently live tracked values.
    pub fn live_count(&mut self) -> usize {
        self.live.retain(|w| w.strong_count() > 0);
        self.live.len()
    }

    /// Next unique stamp.
    fn next_stamp(&mut self) -> u32 {
        self.unique_id = self.unique_id.wrapping_add(1).max(1);
        self.unique_id
    }

    /// Mark-and-break sweep. `roots` must contain everything the caller
    /// wants kept: the root scope, the constant singletons, the scope
    /// stack, a pending exception, plus any extra host values.
    pub fn collect(&mut self, roots: &[VarPtr]) -> GcStats {
        let stamp = self.next_stamp();

        // Drop registry entries whose values already died through
        // plain reference counting, keep strong handles to the rest.
        self.live.retain(|w| w.strong_count() > 0);
        let tracked: Vec<VarPtr> = self.live.iter().filter_map(|w| w.upgrade()).collect();

        mark(roots, stamp);

        // Values referenced from outside the tracked graph (host
        // handles) are roots too. Marking can uncover more, so iterate
        // to a fixpoint.
        loop {
            let mut found_external = false;
            for var in &tracked {
                if var.borrow().temp_id == stamp {
                    continue;
                }
                // Count references from the other unreachable values;
                // self-links count too.
                let mut incoming = 0usize;
                for other in &tracked {
                    if other.borrow().temp_id == stamp {
                        continue;
                    }
                    let mut links = Vec::new();
                    other.borrow().collect_links(&mut links);
                    incoming += links.iter().filter(|l| Rc::ptr_eq(l, var)).count();
                }
                // One strong handle is ours (the `tracked` vector).
                if Rc::strong_count(var) > incoming + 1 {
                    mark(std::slice::from_ref(var), stamp);
                    found_external = true;
                }
            }
            if !found_external {
                break;
            }
        }

        // Everything the stamp missed is unreachable. Clearing the
        // property lists and internal links breaks the cycles; the
        // values themselves die when `tracked` drops.
        let mut collected = 0usize;
        for var in &tracked {
            if var.borrow().temp_id == stamp {
                continue;
            }
            collected += 1;
            let mut v = var.borrow_mut();
            v.childs.clear();
            v.prototype = None;
            match &mut v.kind {
                VarKind::Function(ScriptFunction { closure, .. }) => *closure = None,
                kind @ VarKind::Scope(_) => *kind = VarKind::Object,
                _ => {}
            }
        }

        drop(tracked);
        self.live.retain(|w| w.strong_count() > 0);
        let stats = GcStats { collected, live: self.live.len(), stamp };
        debug!(collected = stats.collected, live = stats.live, "gc sweep");
        stats
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Stamp every value reachable from `roots`.
fn mark(roots: &[VarPtr], stamp: u32) {
    let mut worklist: Vec<VarPtr> = roots.to_vec();
    while let Some(var) = worklist.pop() {
        {
            let mut v = var.borrow_mut();
            if v.temp_id == stamp {
                continue;
            }
            v.temp_id = stamp;
        }
        var.borrow().collect_links(&mut worklist);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::LinkFlags;
    use crate::value::{ScriptVar, VarKind};

    fn tracked_obj(heap: &mut Heap) -> VarPtr {
        let v = ScriptVar::new(VarKind::Object);
        heap.track(&v);
        v
    }

    #[test]
    fn test_acyclic_garbage_dies_without_sweep() {
        let mut heap = Heap::new();
        let v = tracked_obj(&mut heap);
        drop(v);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_cycle_needs_sweep() {
        let mut heap = Heap::new();
        let a = tracked_obj(&mut heap);
        let b = tracked_obj(&mut heap);
        a.borrow_mut().add_child("b", b.clone(), LinkFlags::DEFAULT);
        b.borrow_mut().add_child("a", a.clone(), LinkFlags::DEFAULT);
        drop(a);
        drop(b);
        // The cycle keeps both alive past the last external handle.
        assert_eq!(heap.live_count(), 2);
        let stats = heap.collect(&[]);
        assert_eq!(stats.collected, 2);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_reachable_cycle_survives() {
        let mut heap = Heap::new();
        let root = tracked_obj(&mut heap);
        let a = tracked_obj(&mut heap);
        a.borrow_mut().add_child("self", a.clone(), LinkFlags::DEFAULT);
        root.borrow_mut().add_child("a", a.clone(), LinkFlags::DEFAULT);
        drop(a);
        let stats = heap.collect(&[root.clone()]);
        assert_eq!(stats.collected, 0);
        assert!(root.borrow().find_own("a").is_some());
    }

    #[test]
    fn test_host_handle_counts_as_root() {
        let mut heap = Heap::new();
        let held = tracked_obj(&mut heap);
        held.borrow_mut().add_child("self", held.clone(), LinkFlags::DEFAULT);
        // Not in the root set, but the `held` binding is an external
        // strong reference, so the sweep must keep it.
        let stats = heap.collect(&[]);
        assert_eq!(stats.collected, 0);
        assert!(held.borrow().find_own("self").is_some());
    }

    #[test]
    fn test_stamp_advances() {
        let mut heap = Heap::new();
        let r = tracked_obj(&mut heap);
        let s1 = heap.collect(&[r.clone()]).stamp;
        let s2 = heap.collect(&[r.clone()]).stamp;
        assert!(s2 > s1);
        assert_eq!(r.borrow().temp_id, s2);
    }
}
