//! Resource contexts and deferred-action indexes
//!
//! A `ResourceContext` is the reactor-side record of one resource: which
//! operations it owns, whether a user-side handle is still attached, and
//! which deferred-action indexes currently list it. A context is reaped
//! only when nothing references it anymore (`is_referenced()`), which is
//! what lets a resource be dropped while its operations are still in
//! flight: the context lingers, the reactor drains it, then reaps it.
//!
//! An `ActionIndex` is an ordered work list of context ids the reactor
//! drains once per step. Membership is kept idempotent by the context's
//! `ActionSet` bitset, not by searching the index. Iteration uses a
//! detached `Cursor` so the reactor can mutate contexts (and append to the
//! index) mid-drain; structural removal (`vacuum`, `truncate`) is only
//! legal with zero live cursors and asserts it.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::rc::Rc;

use rivet_core::id::{CtxId, OpId};

/// The reactor's deferred actions on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeferredAction {
    /// Context has spooled operations waiting for the backend.
    Submit = 0,

    /// Context has completed operations whose owners must be told.
    Notify = 1,

    /// Context has terminal operations to reap.
    Remove = 2,
}

impl DeferredAction {
    pub const COUNT: usize = 3;

    pub const ALL: [DeferredAction; 3] = [
        DeferredAction::Submit,
        DeferredAction::Notify,
        DeferredAction::Remove,
    ];

    #[inline]
    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Small bitset over `DeferredAction`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSet(u8);

impl ActionSet {
    #[inline]
    pub const fn empty() -> Self {
        ActionSet(0)
    }

    /// Set the bit. Returns true when it was newly set.
    #[inline]
    pub fn insert(&mut self, action: DeferredAction) -> bool {
        let was = self.0 & action.bit() != 0;
        self.0 |= action.bit();
        !was
    }

    /// Clear the bit. Returns true when it was set.
    #[inline]
    pub fn remove(&mut self, action: DeferredAction) -> bool {
        let was = self.0 & action.bit() != 0;
        self.0 &= !action.bit();
        was
    }

    #[inline]
    pub const fn contains(&self, action: DeferredAction) -> bool {
        self.0 & action.bit() != 0
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Reactor-side state of one resource.
#[derive(Debug)]
pub struct ResourceContext {
    id: CtxId,
    /// A user-side Resource handle still points here.
    attached: bool,
    /// Which indexes currently list this context.
    pub deferred: ActionSet,
    /// Operations owned by this context, in spool order.
    ops: Vec<OpId>,
    /// Descriptor to close when the context winds down; -1 when none.
    pub fd: RawFd,
}

impl ResourceContext {
    pub fn new(id: CtxId) -> Self {
        Self {
            id,
            attached: true,
            deferred: ActionSet::empty(),
            ops: Vec::new(),
            fd: -1,
        }
    }

    #[inline]
    pub fn id(&self) -> CtxId {
        self.id
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// The user-side handle is gone. The context stays alive until its
    /// operations and index entries drain.
    pub fn detach(&mut self) {
        self.attached = false;
    }

    /// Anything still keeping this context alive?
    #[inline]
    pub fn is_referenced(&self) -> bool {
        self.attached || !self.deferred.is_empty() || !self.ops.is_empty()
    }

    pub fn add_op(&mut self, op: OpId) {
        debug_assert!(!self.ops.contains(&op));
        self.ops.push(op);
    }

    /// Forget an operation. Returns true when it was present.
    ///
    /// Order-preserving: the submit drain walks this list, and ops must
    /// reach the backend in spool order even when an earlier reap has
    /// punched a hole in the middle. The list is short; O(n) is fine.
    pub fn remove_op(&mut self, op: OpId) -> bool {
        match self.ops.iter().position(|o| *o == op) {
            Some(pos) => {
                self.ops.remove(pos);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    #[inline]
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }
}

/// Ordered work list of contexts with a pending action.
///
/// Insertion is append-only; the caller keeps membership idempotent via
/// the context's `ActionSet` bit for this index's action. Removal happens
/// in batch via `vacuum()` between drains.
pub struct ActionIndex {
    action: DeferredAction,
    entries: Vec<CtxId>,
    live_cursors: Rc<Cell<u32>>,
}

impl ActionIndex {
    pub fn new(action: DeferredAction) -> Self {
        Self {
            action,
            entries: Vec::new(),
            live_cursors: Rc::new(Cell::new(0)),
        }
    }

    #[inline]
    pub fn action(&self) -> DeferredAction {
        self.action
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a context id. The caller has already flipped the context's
    /// deferred bit from clear to set; duplicates are its bug.
    pub fn push(&mut self, id: CtxId) {
        self.entries.push(id);
    }

    /// Open a cursor at the front. The cursor borrows nothing; it pins the
    /// index against structural removal through a live-cursor count.
    pub fn cursor(&self) -> Cursor {
        self.live_cursors.set(self.live_cursors.get() + 1);
        Cursor {
            pos: 0,
            live: Rc::clone(&self.live_cursors),
        }
    }

    /// Advance a cursor. Entries appended after the cursor was opened are
    /// seen too; a drain loop therefore reaches work it queues itself.
    pub fn next(&self, cursor: &mut Cursor) -> Option<CtxId> {
        debug_assert!(Rc::ptr_eq(&cursor.live, &self.live_cursors));
        let id = self.entries.get(cursor.pos).copied()?;
        cursor.pos += 1;
        Some(id)
    }

    /// Drop every entry whose context no longer wants this action.
    ///
    /// `keep` is typically "is the deferred bit for this action still
    /// set", which retains contexts re-queued during the drain. Keeps at
    /// most one entry per id.
    ///
    /// Panics if any cursor is live: removal would shift positions under
    /// it.
    pub fn vacuum<F: FnMut(CtxId) -> bool>(&mut self, mut keep: F) {
        assert_eq!(
            self.live_cursors.get(),
            0,
            "vacuum of {:?} index with live cursors",
            self.action
        );
        let mut kept: Vec<CtxId> = Vec::new();
        for id in self.entries.drain(..) {
            if keep(id) && !kept.contains(&id) {
                kept.push(id);
            }
        }
        self.entries = kept;
    }

    /// Drop everything. Panics if any cursor is live.
    pub fn truncate(&mut self) {
        assert_eq!(
            self.live_cursors.get(),
            0,
            "truncate of {:?} index with live cursors",
            self.action
        );
        self.entries.clear();
    }

    #[cfg(test)]
    fn live_cursor_count(&self) -> u32 {
        self.live_cursors.get()
    }
}

/// Position into an `ActionIndex`. Holds no borrow; advancing goes
/// through `ActionIndex::next()`.
pub struct Cursor {
    pos: usize,
    live: Rc<Cell<u32>>,
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_set_idempotent_insert() {
        let mut set = ActionSet::empty();
        assert!(set.insert(DeferredAction::Submit));
        assert!(!set.insert(DeferredAction::Submit));
        assert!(set.contains(DeferredAction::Submit));
        assert!(!set.contains(DeferredAction::Notify));
        assert!(set.remove(DeferredAction::Submit));
        assert!(!set.remove(DeferredAction::Submit));
        assert!(set.is_empty());
    }

    #[test]
    fn test_context_liveness() {
        let mut ctx = ResourceContext::new(CtxId::new(0));
        assert!(ctx.is_referenced()); // attached

        ctx.detach();
        assert!(!ctx.is_referenced());

        ctx.add_op(OpId::new(3, 1));
        assert!(ctx.is_referenced());
        assert!(ctx.remove_op(OpId::new(3, 1)));
        assert!(!ctx.is_referenced());

        ctx.deferred.insert(DeferredAction::Remove);
        assert!(ctx.is_referenced());
        ctx.deferred.remove(DeferredAction::Remove);
        assert!(!ctx.is_referenced());
    }

    #[test]
    fn test_cursor_walks_in_order() {
        let mut idx = ActionIndex::new(DeferredAction::Submit);
        idx.push(CtxId::new(2));
        idx.push(CtxId::new(5));
        idx.push(CtxId::new(1));

        let mut cur = idx.cursor();
        assert_eq!(idx.next(&mut cur), Some(CtxId::new(2)));
        assert_eq!(idx.next(&mut cur), Some(CtxId::new(5)));
        assert_eq!(idx.next(&mut cur), Some(CtxId::new(1)));
        assert_eq!(idx.next(&mut cur), None);
    }

    #[test]
    fn test_cursor_sees_appends_during_drain() {
        let mut idx = ActionIndex::new(DeferredAction::Notify);
        idx.push(CtxId::new(0));

        let mut cur = idx.cursor();
        assert_eq!(idx.next(&mut cur), Some(CtxId::new(0)));
        idx.push(CtxId::new(7));
        assert_eq!(idx.next(&mut cur), Some(CtxId::new(7)));
        assert_eq!(idx.next(&mut cur), None);
    }

    #[test]
    fn test_cursor_count_tracks_drops() {
        let idx = ActionIndex::new(DeferredAction::Remove);
        assert_eq!(idx.live_cursor_count(), 0);
        {
            let _a = idx.cursor();
            let _b = idx.cursor();
            assert_eq!(idx.live_cursor_count(), 2);
        }
        assert_eq!(idx.live_cursor_count(), 0);
    }

    #[test]
    #[should_panic(expected = "vacuum of Submit index with live cursors")]
    fn test_vacuum_with_live_cursor_panics() {
        let mut idx = ActionIndex::new(DeferredAction::Submit);
        idx.push(CtxId::new(0));
        let _cur = idx.cursor();
        idx.vacuum(|_| true);
    }

    #[test]
    fn test_vacuum_keeps_requeued_and_dedups() {
        let mut idx = ActionIndex::new(DeferredAction::Submit);
        idx.push(CtxId::new(0));
        idx.push(CtxId::new(1));
        idx.push(CtxId::new(2));
        idx.push(CtxId::new(1)); // re-queued mid-drain

        idx.vacuum(|id| id.as_u32() % 2 == 1);
        assert_eq!(idx.len(), 1);
        let mut cur = idx.cursor();
        assert_eq!(idx.next(&mut cur), Some(CtxId::new(1)));
    }

    #[test]
    fn test_remove_op_preserves_order() {
        let mut ctx = ResourceContext::new(CtxId::new(0));
        let a = OpId::new(0, 1);
        let b = OpId::new(1, 1);
        let c = OpId::new(2, 1);
        ctx.add_op(a);
        ctx.add_op(b);
        ctx.add_op(c);

        // Reaping from the middle must not reorder the survivors.
        assert!(ctx.remove_op(b));
        assert_eq!(ctx.ops(), &[a, c]);
        assert!(ctx.remove_op(a));
        assert_eq!(ctx.ops(), &[c]);
    }

    #[test]
    #[should_panic(expected = "truncate of Remove index with live cursors")]
    fn test_truncate_with_live_cursor_panics() {
        let mut idx = ActionIndex::new(DeferredAction::Remove);
        idx.push(CtxId::new(0));
        let _cur = idx.cursor();
        idx.truncate();
    }

    #[test]
    fn test_structural_removal_allowed_after_cursor_drops() {
        let mut idx = ActionIndex::new(DeferredAction::Submit);
        idx.push(CtxId::new(0));
        {
            let mut cur = idx.cursor();
            assert_eq!(idx.next(&mut cur), Some(CtxId::new(0)));
        }
        idx.vacuum(|_| false);
        assert!(idx.is_empty());

        idx.push(CtxId::new(1));
        {
            let _cur = idx.cursor();
        }
        idx.truncate();
        assert!(idx.is_empty());
    }

    #[test]
    fn test_truncate_clears() {
        let mut idx = ActionIndex::new(DeferredAction::Remove);
        idx.push(CtxId::new(4));
        idx.truncate();
        assert!(idx.is_empty());
    }
}
