//! The propagation tree: internal nodes tracking which tasks are effectively
//! cancelled right now, as opposed to `CancelScope` which tracks *why*.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;

use crate::cancel_scope::CancelScopeInner;
use crate::task::TaskInner;

static NEXT_STATUS_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// One node of the cancel-status tree. Mirrors the lexical nesting of active
/// cancel scopes within a task at any instant.
pub struct CancelStatusInner {
    pub id: u64,
    /// Back-reference to the scope that owns this status.
    pub scope: Weak<CancelScopeInner>,
    pub effectively_cancelled: Cell<bool>,
    /// Strong: a child status's parent scope is, by the lexical-nesting
    /// invariant, always still active (and hence alive) while the child is,
    /// so holding it strongly costs nothing and avoids weak-upgrade failure
    /// paths entirely.
    parent: RefCell<Option<CancelStatus>>,
    /// Weak: children are kept alive by their own owning `CancelScope`, not
    /// by their parent; we only need to reach them to propagate state.
    children: RefCell<FxHashMap<u64, Weak<CancelStatusInner>>>,
    /// Weak: tasks are kept alive by `Runner::tasks` / `Nursery::children`.
    tasks: RefCell<FxHashMap<u64, Weak<TaskInner>>>,
    pub abandoned_by_misnesting: Cell<bool>,
}

/// Cheap-to-clone handle to a `CancelStatusInner`.
#[derive(Clone)]
pub struct CancelStatus(pub Rc<CancelStatusInner>);

impl CancelStatus {
    pub fn new(scope: Weak<CancelScopeInner>, parent: Option<CancelStatus>) -> Self {
        let id = NEXT_STATUS_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let inner = Rc::new(CancelStatusInner {
            id,
            scope,
            effectively_cancelled: Cell::new(false),
            parent: RefCell::new(None),
            children: RefCell::new(FxHashMap::default()),
            tasks: RefCell::new(FxHashMap::default()),
            abandoned_by_misnesting: Cell::new(false),
        });
        let status = CancelStatus(inner);
        if let Some(parent) = parent {
            status.set_parent(Some(parent));
        }
        status
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn effectively_cancelled(&self) -> bool {
        self.0.effectively_cancelled.get()
    }

    pub fn parent(&self) -> Option<CancelStatus> {
        self.0.parent.borrow().clone()
    }

    /// Detach from the old parent's child set, reattach to the new one, and
    /// recalculate. A `None` parent is used only for the outermost status of
    /// a run, and transiently during mis-nesting recovery.
    pub fn set_parent(&self, parent: Option<CancelStatus>) {
        if let Some(old) = self.0.parent.borrow_mut().take() {
            old.0.children.borrow_mut().remove(&self.id());
        }
        *self.0.parent.borrow_mut() = parent.clone();
        if let Some(parent) = parent {
            parent
                .0
                .children
                .borrow_mut()
                .insert(self.id(), Rc::downgrade(&self.0));
            self.recalculate();
        }
    }

    pub fn add_task(&self, task: &Rc<TaskInner>) {
        self.0
            .tasks
            .borrow_mut()
            .insert(task.id.0, Rc::downgrade(task));
    }

    pub fn remove_task(&self, task_id: u64) {
        self.0.tasks.borrow_mut().remove(&task_id);
    }

    fn live_tasks(&self) -> Vec<Rc<TaskInner>> {
        self.0
            .tasks
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Snapshot of currently-live child statuses. Used by `Nursery::start`
    /// to reparent a staging nursery's whole cancel-status subtree onto the
    /// target nursery in one step.
    pub fn child_statuses(&self) -> Vec<CancelStatus> {
        self.live_children()
    }

    fn live_children(&self) -> Vec<CancelStatus> {
        self.0
            .children
            .borrow()
            .values()
            .filter_map(Weak::upgrade)
            .map(CancelStatus)
            .collect()
    }

    /// True iff an ancestor's cancellation would be observed here: our own
    /// scope isn't shielding and a parent exists and is effectively cancelled.
    pub fn parent_cancellation_is_visible_to_us(&self) -> bool {
        let Some(scope) = self.0.scope.upgrade() else {
            return false;
        };
        if scope.shield.get() {
            return false;
        }
        match self.parent() {
            Some(p) => p.effectively_cancelled(),
            None => false,
        }
    }

    /// Explicit-stack depth-first recomputation of `effectively_cancelled`,
    /// starting at `self`. Any node whose flag flips gets its tasks notified;
    /// children are always revisited since a flip may affect them too.
    pub fn recalculate(&self) {
        let mut todo = vec![self.clone()];
        while let Some(current) = todo.pop() {
            let Some(scope) = current.0.scope.upgrade() else {
                continue;
            };
            let new_state =
                scope.cancel_called.get() || current.parent_cancellation_is_visible_to_us();
            if new_state != current.effectively_cancelled() {
                current.0.effectively_cancelled.set(new_state);
                if new_state {
                    for task in current.live_tasks() {
                        task.attempt_delivery_of_any_pending_cancel();
                    }
                }
                todo.extend(current.live_children());
            }
        }
    }

    fn mark_abandoned(&self) {
        self.0.abandoned_by_misnesting.set(true);
        for child in self.live_children() {
            child.mark_abandoned();
        }
    }

    /// Called when the owning scope exits. Detaches from the parent; if
    /// tasks or children remain, the scope was exited out of lexical order,
    /// and we mark the whole abandoned subtree cancelled so it can unwind.
    pub fn close(&self) {
        self.set_parent(None);
        let tasks = self.live_tasks();
        let children = self.live_children();
        if !tasks.is_empty() || !children.is_empty() {
            self.mark_abandoned();
            self.0.effectively_cancelled.set(true);
            for task in &tasks {
                task.attempt_delivery_of_any_pending_cancel();
            }
            for child in &children {
                child.recalculate();
            }
        }
    }

    /// `-inf` if cancelled; otherwise `scope.deadline`, narrowed by the
    /// parent's effective deadline unless shielded.
    pub fn effective_deadline(&self) -> f64 {
        if self.effectively_cancelled() {
            return f64::NEG_INFINITY;
        }
        let Some(scope) = self.0.scope.upgrade() else {
            return f64::INFINITY;
        };
        if scope.shield.get() {
            return scope.deadline.get();
        }
        match self.parent() {
            None => scope.deadline.get(),
            Some(p) => scope.deadline.get().min(p.effective_deadline()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel_scope::CancelScope;

    #[test]
    fn recalculate_propagates_through_unshielded_children() {
        let outer = CancelScope::new(f64::INFINITY, false);
        let outer_status = outer.bind_root();
        let inner = CancelScope::new(f64::INFINITY, false);
        let inner_status = inner.bind_child(&outer_status);

        assert!(!inner_status.effectively_cancelled());
        outer.cancel();
        assert!(inner_status.effectively_cancelled());
    }

    #[test]
    fn shield_blocks_parent_cancellation() {
        let outer = CancelScope::new(f64::INFINITY, false);
        let outer_status = outer.bind_root();
        let inner = CancelScope::new(f64::INFINITY, true);
        let inner_status = inner.bind_child(&outer_status);

        outer.cancel();
        assert!(outer_status.effectively_cancelled());
        assert!(!inner_status.effectively_cancelled());

        inner.set_shield(false);
        assert!(inner_status.effectively_cancelled());
    }
}
