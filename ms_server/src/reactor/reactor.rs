use std::fmt;
use std::mem;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::rc::Rc;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::poller::{Control, Interest, MioPoller, Poller, ReadyEvent};
use super::timer::{TimerHandler, TimerId, TimerQueue};
use crate::arena::{Arena, ArenaStats, DEFAULT_CAPACITY};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{Error, Result};

/// Expired timers run per iteration before the rest are deferred.
pub const MAX_TIMERS_PER_TICK: usize = 100_000;

/// Callbacks for descriptor readiness.
///
/// Both methods receive the reactor mutably, so a handler can re-register
/// interest, arm timers and reach its slot payload from inside the callback.
pub trait FileHandler<P> {
    fn on_readable(self: Rc<Self>, reactor: &mut Reactor<P>, fd: RawFd, ready: Interest) {
        let _ = (reactor, fd, ready);
    }

    fn on_writable(self: Rc<Self>, reactor: &mut Reactor<P>, fd: RawFd, ready: Interest) {
        let _ = (reactor, fd, ready);
    }
}

/// Sizing of a [`Reactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Number of descriptor slots; valid descriptors are `0..capacity`.
    pub capacity: usize,
    /// Capacity of each arena block.
    pub arena_size: usize,
    /// Bytes of arena memory attached to every slot.
    pub payload_size: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            arena_size: DEFAULT_CAPACITY,
            payload_size: 0,
        }
    }
}

struct Slot<P> {
    interest: Interest,
    read: Option<Rc<dyn FileHandler<P>>>,
    write: Option<Rc<dyn FileHandler<P>>>,
    payload: P,
}

/// Single-threaded readiness and timer loop.
///
/// Descriptors index a fixed slot array directly. Each slot carries a typed
/// payload `P` built once at construction plus a zeroed region of
/// `payload_size` bytes carved from the reactor's arena.
pub struct Reactor<P> {
    slots: Vec<Slot<P>>,
    events: Vec<ReadyEvent>,
    timers: TimerQueue<P>,
    poller: Box<dyn Poller>,
    clock: Rc<dyn Clock>,
    capacity: usize,
    stop: Arc<AtomicBool>,
    max_timers_per_tick: usize,
    payload_base: Option<NonNull<u8>>,
    payload_size: usize,
    // Dropped last: `payload_base` points into it.
    arena: Arena,
}

impl<P> Reactor<P> {
    /// Builds a reactor over an explicit poller and clock.
    ///
    /// `init` is called once per slot with its descriptor number.
    pub fn new(
        config: ReactorConfig,
        poller: Box<dyn Poller>,
        clock: Rc<dyn Clock>,
        mut init: impl FnMut(RawFd) -> P,
    ) -> Result<Self> {
        let capacity = config.capacity;
        let mut arena = Arena::new(config.arena_size)?;

        let payload_base = if capacity > 0 && config.payload_size > 0 {
            let total = capacity
                .checked_mul(config.payload_size)
                .ok_or(Error::OutOfMemory { size: usize::MAX })?;
            Some(arena.allocate(total)?)
        } else {
            None
        };

        let slots = (0..capacity)
            .map(|fd| Slot {
                interest: Interest::empty(),
                read: None,
                write: None,
                payload: init(fd as RawFd),
            })
            .collect();

        debug!(
            capacity,
            arena_size = arena.capacity(),
            payload_size = config.payload_size,
            "reactor created"
        );

        Ok(Self {
            slots,
            events: Vec::with_capacity(capacity),
            timers: TimerQueue::new(capacity.saturating_mul(2)),
            poller,
            clock,
            capacity,
            stop: Arc::new(AtomicBool::new(false)),
            max_timers_per_tick: MAX_TIMERS_PER_TICK,
            payload_base,
            payload_size: config.payload_size,
            arena,
        })
    }

    /// Builds a reactor on `mio` and the monotonic clock.
    pub fn with_mio(config: ReactorConfig, init: impl FnMut(RawFd) -> P) -> Result<Self> {
        let poller = MioPoller::new(config.capacity).map_err(|e| {
            error!(error = %e, "failed to create multiplexer");
            Error::PollerCreate(e)
        })?;
        Self::new(config, Box::new(poller), Rc::new(MonotonicClock::new()), init)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Number of armed timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Earliest armed deadline, in clock milliseconds.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.earliest()
    }

    /// Bookkeeping of the arena backing slot payloads. Timer nodes are pooled
    /// separately and never show up here.
    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// Overrides the per-iteration timer cap.
    pub fn set_max_timers_per_tick(&mut self, max: usize) {
        self.max_timers_per_tick = max.max(1);
    }

    fn index(&self, fd: RawFd) -> Option<usize> {
        usize::try_from(fd).ok().filter(|&i| i < self.capacity)
    }

    fn checked_index(&self, fd: RawFd) -> Result<usize> {
        self.index(fd).ok_or_else(|| {
            error!(fd, capacity = self.capacity, "descriptor exceeds reactor capacity");
            Error::DescriptorOutOfRange {
                fd,
                capacity: self.capacity,
            }
        })
    }

    /// Current interest of a descriptor; empty when unregistered or out of range.
    pub fn interest(&self, fd: RawFd) -> Interest {
        self.index(fd)
            .map_or(Interest::empty(), |i| self.slots[i].interest)
    }

    pub fn payload(&self, fd: RawFd) -> Option<&P> {
        self.index(fd).map(|i| &self.slots[i].payload)
    }

    /// Typed payload of a slot together with its arena region.
    pub fn payload_mut(&mut self, fd: RawFd) -> Option<(&mut P, &mut [u8])> {
        let idx = self.index(fd)?;
        let region: &mut [u8] = match self.payload_base {
            // SAFETY: the block holds `capacity * payload_size` bytes, slot
            // regions are disjoint, the arena is never reset while the
            // reactor lives, and the `&mut self` borrow makes the region
            // exclusive.
            Some(base) => unsafe {
                slice::from_raw_parts_mut(
                    base.as_ptr().add(idx * self.payload_size),
                    self.payload_size,
                )
            },
            None => &mut [],
        };
        Some((&mut self.slots[idx].payload, region))
    }

    /// Adds `mask` to the descriptor's interest and binds `handler` to the
    /// directions named in `mask`.
    pub fn register_interest(
        &mut self,
        fd: RawFd,
        mask: Interest,
        handler: Rc<dyn FileHandler<P>>,
    ) -> Result<()> {
        let idx = self.checked_index(fd)?;
        let current = self.slots[idx].interest;
        let merged = current | mask;
        self.control(current, fd, merged)?;

        let slot = &mut self.slots[idx];
        slot.interest = merged;
        if mask.is_readable() {
            slot.read = Some(handler.clone());
        }
        if mask.is_writable() {
            slot.write = Some(handler);
        }
        trace!(fd, interest = ?merged, "interest added");
        Ok(())
    }

    /// Replaces the descriptor's interest with `mask`.
    pub fn modify_interest(
        &mut self,
        fd: RawFd,
        mask: Interest,
        handler: Rc<dyn FileHandler<P>>,
    ) -> Result<()> {
        let idx = self.checked_index(fd)?;
        let current = self.slots[idx].interest;
        self.control(current, fd, mask)?;

        let slot = &mut self.slots[idx];
        slot.interest = mask;
        slot.read = mask.is_readable().then(|| handler.clone());
        slot.write = mask.is_writable().then_some(handler);
        trace!(fd, interest = ?mask, "interest replaced");
        Ok(())
    }

    fn control(&mut self, current: Interest, fd: RawFd, mask: Interest) -> Result<()> {
        let op = if current.is_empty() {
            Control::Add
        } else {
            Control::Modify
        };
        self.poller.control(op, fd, mask).map_err(|source| {
            error!(fd, op = op.as_str(), error = %source, "multiplexer control failed");
            Error::Control {
                op: op.as_str(),
                fd,
                source,
            }
        })
    }

    /// Clears `mask` from the descriptor's interest.
    ///
    /// Out-of-range or unregistered descriptors are ignored.
    pub fn unregister_interest(&mut self, fd: RawFd, mask: Interest) {
        let Some(idx) = self.index(fd) else {
            return;
        };
        let current = self.slots[idx].interest;
        if current.is_empty() {
            return;
        }

        let remaining = current - mask;
        let op = if remaining.is_empty() {
            Control::Delete
        } else {
            Control::Modify
        };
        if let Err(e) = self.poller.control(op, fd, remaining) {
            // The descriptor may already be closed; the slot is cleared anyway.
            debug!(fd, op = op.as_str(), error = %e, "multiplexer control failed");
        }

        let slot = &mut self.slots[idx];
        slot.interest = remaining;
        if !remaining.is_readable() {
            slot.read = None;
        }
        if !remaining.is_writable() {
            slot.write = None;
        }
        trace!(fd, interest = ?remaining, "interest removed");
    }

    /// Arms a one-shot timer `delay_ms` from now.
    pub fn add_timer(
        &mut self,
        delay_ms: u64,
        handler: Rc<dyn TimerHandler<P>>,
        data: usize,
    ) -> Result<TimerId> {
        let deadline = self.clock.now_ms().wrapping_add(delay_ms);
        self.timers.add(deadline, handler, data).inspect_err(|e| {
            error!(error = %e, "failed to arm timer");
        })
    }

    /// Disarms a timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    pub fn is_timer_armed(&self, id: TimerId) -> bool {
        self.timers.is_live(id)
    }

    /// Requests the loop to exit after the current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Shared stop flag, for paths that cannot borrow the reactor.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs until [`stop`](Self::stop) is called.
    ///
    /// `max_block` bounds each wait; `None` blocks until an event or the
    /// earliest deadline.
    pub fn run(&mut self, max_block: Option<Duration>) {
        debug!(?max_block, "reactor loop started");
        while !self.is_stopped() {
            self.turn(max_block);
        }
        debug!("reactor loop stopped");
    }

    /// One iteration: wait, dispatch ready descriptors, then expired timers.
    ///
    /// Returns the number of ready descriptors. A failed wait is logged and
    /// counts as zero; expired timers still run.
    pub fn turn(&mut self, max_block: Option<Duration>) -> usize {
        let timeout = self.wait_timeout(max_block);

        let mut events = mem::take(&mut self.events);
        events.clear();
        let ready = match self.poller.wait(&mut events, self.capacity, timeout) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, ?timeout, "multiplexer wait failed");
                events.clear();
                0
            }
        };
        trace!(ready, ?timeout, "reactor woke");

        for event in &events {
            self.dispatch(event.fd, event.ready);
        }
        self.events = events;

        self.expire_timers();
        ready
    }

    fn wait_timeout(&self, max_block: Option<Duration>) -> Option<Duration> {
        let Some(deadline) = self.timers.earliest() else {
            return max_block;
        };
        let remaining = deadline.wrapping_sub(self.clock.now_ms()) as i64;
        let until = Duration::from_millis(remaining.max(0) as u64);
        Some(max_block.map_or(until, |max| max.min(until)))
    }

    fn dispatch(&mut self, fd: RawFd, ready: Interest) {
        let Some(idx) = self.index(fd) else {
            warn!(fd, "event for descriptor outside the slot array");
            return;
        };

        if (self.slots[idx].interest & ready).is_readable() {
            let handler = self.slots[idx].read.clone();
            if let Some(handler) = handler {
                handler.on_readable(self, fd, ready);
            }
        }

        // The read handler may have changed the registration.
        if (self.slots[idx].interest & ready).is_writable() {
            let handler = self.slots[idx].write.clone();
            if let Some(handler) = handler {
                handler.on_writable(self, fd, ready);
            }
        }
    }

    fn expire_timers(&mut self) {
        let mut fired = 0;
        loop {
            let now = self.clock.now_ms();
            let Some(expired) = self.timers.pop_expired(now) else {
                break;
            };
            expired.handler.on_timeout(self, expired.id, expired.data);

            fired += 1;
            if fired >= self.max_timers_per_tick && self.has_expired_timer() {
                error!(
                    limit = self.max_timers_per_tick,
                    "too many expired timers in one iteration, deferring the rest"
                );
                break;
            }
        }
    }

    fn has_expired_timer(&self) -> bool {
        self.timers
            .earliest()
            .is_some_and(|deadline| (deadline.wrapping_sub(self.clock.now_ms()) as i64) <= 0)
    }
}

impl<P> fmt::Debug for Reactor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("capacity", &self.capacity)
            .field("timers", &self.timers.len())
            .field("stopped", &self.is_stopped())
            .field("arena", &self.arena.stats())
            .finish()
    }
}
