//! Deadline-ordered timer queue with node recycling.

use std::rc::Rc;

use tracing::trace;

use super::Reactor;
use crate::error::{Error, Result};
use crate::rbtree::{KeyOrder, NodeId, RbTree, TimerOrder};

/// Callback run when a timer expires.
///
/// The timer has already been removed from the queue when this runs, so
/// cancelling `timer` from inside the callback is a no-op.
pub trait TimerHandler<P> {
    fn on_timeout(self: Rc<Self>, reactor: &mut Reactor<P>, timer: TimerId, data: usize);
}

/// Handle returned by [`Reactor::add_timer`].
///
/// Handles go stale once their timer fires or is cancelled; stale handles are
/// ignored everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    node: NodeId,
    generation: u32,
}

pub(crate) struct Timer<P> {
    handler: Option<Rc<dyn TimerHandler<P>>>,
    data: usize,
    next_free: Option<NodeId>,
    generation: u32,
}

/// An expired timer, already unlinked and recycled.
pub(crate) struct Expired<P> {
    pub(crate) id: TimerId,
    pub(crate) handler: Rc<dyn TimerHandler<P>>,
    pub(crate) data: usize,
}

pub(crate) struct TimerQueue<P> {
    tree: RbTree<Timer<P>, TimerOrder>,
    free: Option<NodeId>,
    limit: usize,
}

impl<P> TimerQueue<P> {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            tree: RbTree::with_capacity(limit.min(1024)),
            free: None,
            limit,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tree.len()
    }

    pub(crate) fn add(
        &mut self,
        deadline: u64,
        handler: Rc<dyn TimerHandler<P>>,
        data: usize,
    ) -> Result<TimerId> {
        let node = match self.free {
            Some(node) => {
                let timer = self
                    .tree
                    .get_mut(node)
                    .ok_or(Error::TimerCapacity { limit: self.limit })?;
                self.free = timer.next_free.take();
                timer.handler = Some(handler);
                timer.data = data;
                self.tree.set_key(node, deadline);
                node
            }
            None => {
                if self.tree.allocated() >= self.limit {
                    return Err(Error::TimerCapacity { limit: self.limit });
                }
                self.tree.alloc(
                    deadline,
                    Timer {
                        handler: Some(handler),
                        data,
                        next_free: None,
                        generation: 0,
                    },
                )?
            }
        };

        self.tree.insert(node);
        let generation = self.tree.get(node).map_or(0, |t| t.generation);
        trace!(?node, deadline, "timer armed");
        Ok(TimerId { node, generation })
    }

    /// Unlinks a live timer. Stale handles return `false`.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        self.tree.delete(id.node);
        self.recycle(id.node);
        trace!(node = ?id.node, "timer cancelled");
        true
    }

    pub(crate) fn is_live(&self, id: TimerId) -> bool {
        self.tree.is_linked(id.node)
            && self
                .tree
                .get(id.node)
                .is_some_and(|t| t.generation == id.generation)
    }

    /// Earliest deadline, if any timer is armed.
    pub(crate) fn earliest(&self) -> Option<u64> {
        self.tree.min().and_then(|node| self.tree.key(node))
    }

    /// Removes and returns the earliest timer if its deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: u64) -> Option<Expired<P>> {
        let node = self.tree.min()?;
        let deadline = self.tree.key(node)?;
        if TimerOrder::less(now, deadline) {
            return None;
        }

        self.tree.delete(node);
        let timer = self.tree.get_mut(node)?;
        let id = TimerId {
            node,
            generation: timer.generation,
        };
        let handler = timer.handler.take();
        let data = timer.data;
        self.recycle(node);

        handler.map(|handler| Expired { id, handler, data })
    }

    fn recycle(&mut self, node: NodeId) {
        let free = self.free;
        if let Some(timer) = self.tree.get_mut(node) {
            timer.handler = None;
            timer.data = 0;
            timer.generation = timer.generation.wrapping_add(1);
            timer.next_free = free;
            self.free = Some(node);
        }
    }
}
