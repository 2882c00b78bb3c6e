//! Connection slot manager
//!
//! A bounded set of reusable client handles with a FIFO queue of waiting
//! callers. One mutex covers the free set, the leased set, the waiter queue
//! and the size counters, so a slot being released and a waiter timing out
//! can never both claim (or both drop) the same slot.
//!
//! Waiters park on a `oneshot` receiver. Whoever frees capacity pops the
//! oldest waiter and sends it a [`Grant`] while still holding the lock:
//! - `Grant::Slot` hands over an existing client
//! - `Grant::Capacity` lets the waiter construct a new client (issued when an
//!   on-demand creation failed and gave its capacity back)
//! - `Grant::Closed` wakes the waiter at shutdown

use crate::clock::Clock;
use crate::error::PoolError;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

/// Factory for downstream clients
///
/// Credentials and endpoint details live with the implementor; the pool only
/// asks for another client.
#[async_trait::async_trait]
pub trait ClientFactory<C, E>: Send + Sync {
    /// Construct one new client
    async fn create(&self) -> Result<C, E>;
}

/// [`ClientFactory`] backed by an async closure
pub struct FnClientFactory<F>(F);

impl<F> FnClientFactory<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait::async_trait]
impl<C, E, F, Fut> ClientFactory<C, E> for FnClientFactory<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<C, E>> + Send + 'static,
    C: 'static,
    E: 'static,
{
    async fn create(&self) -> Result<C, E> {
        (self.0)().await
    }
}

/// Wrap an async closure as a shared client factory
pub fn factory_fn<C, E, F, Fut>(f: F) -> Arc<dyn ClientFactory<C, E>>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<C, E>> + Send + 'static,
    C: 'static,
    E: 'static,
{
    Arc::new(FnClientFactory::new(f))
}

/// Identifier of one slot, unique within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One client plus bookkeeping
struct Slot<C> {
    id: SlotId,
    client: C,
    created_at: Instant,
}

enum Grant<C> {
    Slot(Slot<C>),
    Capacity,
    Closed,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
}

/// Gauges read from the slot manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounts {
    /// Slots that exist (free + leased)
    pub pool_size: usize,
    /// Leased slots
    pub active: usize,
    /// Free slots
    pub available: usize,
    /// Callers queued for a slot
    pub waiters: usize,
    /// Clients under construction
    pub pending: usize,
    /// Since when the free set has been empty
    pub exhausted_since: Option<Instant>,
}

struct SlotState<C> {
    free: VecDeque<Slot<C>>,
    leased: HashSet<SlotId>,
    waiters: VecDeque<Waiter<C>>,
    pool_size: usize,
    pending: usize,
    next_waiter_id: u64,
    closed: bool,
    destroyed: bool,
    exhausted_since: Option<Instant>,
}

impl<C> SlotState<C> {
    fn new() -> Self {
        Self {
            free: VecDeque::new(),
            leased: HashSet::new(),
            waiters: VecDeque::new(),
            pool_size: 0,
            pending: 0,
            next_waiter_id: 0,
            closed: false,
            destroyed: false,
            exhausted_since: None,
        }
    }

    fn touch(&mut self, now: Instant) {
        if self.free.is_empty() {
            self.exhausted_since.get_or_insert(now);
        } else {
            self.exhausted_since = None;
        }
    }

    /// Offer a grant to the oldest live waiter; gives it back if nobody took it
    fn hand_off(&mut self, mut grant: Grant<C>) -> Option<Grant<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    /// Keep a grant nobody was waiting for
    fn park(&mut self, grant: Grant<C>) {
        match grant {
            Grant::Slot(slot) => self.free.push_back(slot),
            Grant::Capacity => self.pending -= 1,
            Grant::Closed => {}
        }
    }

    /// Route a slot that just became free
    fn dispatch(&mut self, slot: Slot<C>, now: Instant) {
        let id = slot.id;
        match self.hand_off(Grant::Slot(slot)) {
            None => {
                self.leased.insert(id);
            }
            Some(grant) => self.park(grant),
        }
        self.touch(now);
    }

    fn counts(&self) -> SlotCounts {
        SlotCounts {
            pool_size: self.pool_size,
            active: self.leased.len(),
            available: self.free.len(),
            waiters: self.waiters.len(),
            pending: self.pending,
            exhausted_since: self.exhausted_since,
        }
    }

    fn is_quiescent(&self) -> bool {
        self.leased.is_empty() && self.waiters.is_empty() && self.pending == 0
    }
}

struct Shared<C, E> {
    factory: Arc<dyn ClientFactory<C, E>>,
    max_slots: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<SlotState<C>>,
    next_slot_id: AtomicU64,
    drained: Notify,
}

impl<C, E> Shared<C, E> {
    fn lock(&self) -> MutexGuard<'_, SlotState<C>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_slot(&self, client: C) -> Slot<C> {
        Slot {
            id: SlotId(self.next_slot_id.fetch_add(1, Ordering::Relaxed)),
            client,
            created_at: self.clock.now(),
        }
    }

    fn notify_if_closing(&self, closed: bool) {
        if closed {
            self.drained.notify_waiters();
        }
    }

    /// Return a leased slot
    fn check_in(&self, slot: Slot<C>) -> Result<(), PoolError<E>> {
        let now = self.clock.now();
        let mut st = self.lock();

        if !st.leased.remove(&slot.id) {
            drop(st);
            let slot_id = slot.id;
            error!(slot = %slot_id, "Slot released more than once, refusing to corrupt pool accounting");
            if cfg!(debug_assertions) {
                panic!("slot {} released more than once", slot_id);
            }
            return Err(PoolError::DoubleRelease { slot_id });
        }

        if st.destroyed {
            st.pool_size -= 1;
            st.touch(now);
            let closed = st.closed;
            drop(st);
            drop(slot);
            self.notify_if_closing(closed);
            return Ok(());
        }

        st.dispatch(slot, now);
        let closed = st.closed;
        drop(st);
        self.notify_if_closing(closed);
        Ok(())
    }

    /// Give back capacity reserved for a creation that did not finish
    fn release_capacity(&self) {
        let mut st = self.lock();
        st.pending -= 1;
        if !st.closed && !st.waiters.is_empty() {
            st.pending += 1;
            if let Some(grant) = st.hand_off(Grant::Capacity) {
                st.park(grant);
            }
        }
        let closed = st.closed;
        drop(st);
        self.notify_if_closing(closed);
    }

    /// Put a grant that was sent to a departed waiter back into circulation
    fn recycle(&self, grant: Grant<C>) {
        match grant {
            Grant::Slot(slot) => {
                // The granter already recorded it as leased
                let _ = self.check_in(slot);
            }
            Grant::Capacity => self.release_capacity(),
            Grant::Closed => {}
        }
    }

    /// Turn a freshly constructed client into a leased slot
    fn admit_leased(&self, client: C) -> Result<Slot<C>, PoolError<E>> {
        let slot = self.new_slot(client);
        let now = self.clock.now();
        let mut st = self.lock();
        st.pending -= 1;
        if st.closed {
            drop(st);
            self.notify_if_closing(true);
            return Err(PoolError::PoolClosed);
        }
        st.pool_size += 1;
        st.leased.insert(slot.id);
        st.touch(now);
        Ok(slot)
    }

    /// Turn a freshly constructed client into a free slot
    fn admit_idle(&self, client: C) {
        let slot = self.new_slot(client);
        let now = self.clock.now();
        let mut st = self.lock();
        st.pending -= 1;
        if st.closed {
            drop(st);
            self.notify_if_closing(true);
            return;
        }
        st.pool_size += 1;
        st.dispatch(slot, now);
    }
}

/// Capacity reserved for a client under construction; returned on drop
/// unless the construction completed.
struct PendingCreation<'a, C, E> {
    shared: &'a Shared<C, E>,
    armed: bool,
}

impl<'a, C, E> PendingCreation<'a, C, E> {
    fn new(shared: &'a Shared<C, E>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C, E> Drop for PendingCreation<'_, C, E> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_capacity();
        }
    }
}

/// A queued caller's place in line
///
/// Dropping an unsettled ticket (timeout or cancellation) removes the waiter
/// from the queue; if a grant already arrived, it is passed on.
struct WaitTicket<C, E> {
    shared: Arc<Shared<C, E>>,
    id: u64,
    rx: oneshot::Receiver<Grant<C>>,
    settled: bool,
}

impl<C, E> Drop for WaitTicket<C, E> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let mut st = self.shared.lock();
        if let Some(pos) = st.waiters.iter().position(|w| w.id == self.id) {
            st.waiters.remove(pos);
            let closed = st.closed;
            drop(st);
            self.shared.notify_if_closing(closed);
            return;
        }
        drop(st);

        // Already popped, so the grant was sent under the lock we just took
        if let Ok(grant) = self.rx.try_recv() {
            debug!(waiter = self.id, "Waiter left after being granted, passing grant on");
            self.shared.recycle(grant);
        }
    }
}

enum Next<C, E> {
    Leased(Slot<C>),
    Create,
    Wait(WaitTicket<C, E>),
}

/// Bounded, FIFO-fair manager of reusable client slots
pub struct SlotManager<C, E> {
    shared: Arc<Shared<C, E>>,
}

impl<C, E> Clone for SlotManager<C, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C, E> SlotManager<C, E> {
    /// Create an empty manager; call [`SlotManager::warm_up`] to pre-create slots
    pub fn new(
        factory: Arc<dyn ClientFactory<C, E>>,
        max_slots: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                max_slots,
                clock,
                state: Mutex::new(SlotState::new()),
                next_slot_id: AtomicU64::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.shared.max_slots
    }

    /// Eagerly create up to `count` free slots
    pub async fn warm_up(&self, count: usize) -> Result<(), PoolError<E>> {
        for _ in 0..count {
            {
                let mut st = self.shared.lock();
                if st.closed {
                    return Err(PoolError::PoolClosed);
                }
                if st.pool_size + st.pending >= self.shared.max_slots {
                    break;
                }
                st.pending += 1;
            }

            let pending = PendingCreation::new(&self.shared);
            let client = self
                .shared
                .factory
                .create()
                .await
                .map_err(PoolError::ClientFactory)?;
            pending.disarm();
            self.shared.admit_idle(client);
        }

        debug!(slots = self.counts().pool_size, "Slot warm-up complete");
        Ok(())
    }

    /// Lease a slot, waiting up to `timeout`
    ///
    /// A free slot is leased immediately; otherwise a new client is built if
    /// the pool is below its maximum; otherwise the caller queues in FIFO order.
    pub async fn acquire(&self, timeout: Duration) -> Result<ConnectionHandle<C, E>, PoolError<E>> {
        let deadline = tokio::time::Instant::now() + timeout;

        let next = {
            let now = self.shared.clock.now();
            let mut st = self.shared.lock();
            if st.closed {
                return Err(PoolError::PoolClosed);
            }

            if let Some(slot) = st.free.pop_front() {
                st.leased.insert(slot.id);
                st.touch(now);
                Next::Leased(slot)
            } else if st.pool_size + st.pending < self.shared.max_slots {
                st.pending += 1;
                Next::Create
            } else {
                let id = st.next_waiter_id;
                st.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(Waiter { id, tx });
                Next::Wait(WaitTicket {
                    shared: self.shared.clone(),
                    id,
                    rx,
                    settled: false,
                })
            }
        };

        match next {
            Next::Leased(slot) => Ok(self.handle(slot)),
            Next::Create => self.create_leased(deadline, timeout).await,
            Next::Wait(mut ticket) => {
                match tokio::time::timeout_at(deadline, &mut ticket.rx).await {
                    Ok(Ok(grant)) => {
                        ticket.settled = true;
                        match grant {
                            Grant::Slot(slot) => Ok(self.handle(slot)),
                            Grant::Capacity => self.create_leased(deadline, timeout).await,
                            Grant::Closed => Err(PoolError::PoolClosed),
                        }
                    }
                    Ok(Err(_)) => {
                        ticket.settled = true;
                        Err(PoolError::PoolClosed)
                    }
                    Err(_) => Err(PoolError::AcquireTimeout(timeout)),
                }
            }
        }
    }

    async fn create_leased(
        &self,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<ConnectionHandle<C, E>, PoolError<E>> {
        let pending = PendingCreation::new(&self.shared);

        match tokio::time::timeout_at(deadline, self.shared.factory.create()).await {
            Ok(Ok(client)) => {
                pending.disarm();
                let slot = self.shared.admit_leased(client)?;
                debug!(slot = %slot.id, "Created slot on demand");
                Ok(self.handle(slot))
            }
            Ok(Err(e)) => {
                warn!("Client construction failed");
                Err(PoolError::ClientFactory(e))
            }
            Err(_) => Err(PoolError::AcquireTimeout(timeout)),
        }
    }

    fn handle(&self, slot: Slot<C>) -> ConnectionHandle<C, E> {
        ConnectionHandle {
            shared: self.shared.clone(),
            slot: ManuallyDrop::new(slot),
        }
    }

    /// Current gauges
    pub fn counts(&self) -> SlotCounts {
        self.shared.lock().counts()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop accepting new acquires. Returns false if already closed.
    pub fn close(&self) -> bool {
        let mut st = self.shared.lock();
        let first = !st.closed;
        st.closed = true;
        first
    }

    /// Wait up to `grace` for every lease, waiter and pending creation to
    /// finish. Returns true if the manager drained in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.lock().is_quiescent() {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.shared.lock().is_quiescent();
            }
        }
    }

    /// Drop every free slot and wake every remaining waiter with `PoolClosed`.
    /// Slots still leased are destroyed when they come back.
    pub fn force_destroy(&self) -> SlotCounts {
        let mut st = self.shared.lock();
        st.closed = true;
        st.destroyed = true;

        let idle = std::mem::take(&mut st.free);
        st.pool_size -= idle.len();

        let woken = st.waiters.len();
        while let Some(waiter) = st.waiters.pop_front() {
            let _ = waiter.tx.send(Grant::Closed);
        }
        let remaining = st.counts();
        drop(st);

        let destroyed = idle.len();
        drop(idle);

        if destroyed > 0 || woken > 0 || remaining.active > 0 {
            info!(
                destroyed,
                woken_waiters = woken,
                still_leased = remaining.active,
                "Slots force-destroyed"
            );
        }
        remaining
    }
}

/// Exclusive lease on one slot for one logical call
///
/// Dereferences to the client. Return it with [`ConnectionHandle::release`];
/// a handle dropped without release is returned automatically.
pub struct ConnectionHandle<C, E> {
    shared: Arc<Shared<C, E>>,
    // Taken exactly once, by `release` or by `Drop`
    slot: ManuallyDrop<Slot<C>>,
}

impl<C, E> ConnectionHandle<C, E> {
    pub fn slot_id(&self) -> SlotId {
        self.slot.id
    }

    /// When the underlying client was constructed
    pub fn created_at(&self) -> Instant {
        self.slot.created_at
    }

    pub fn client(&self) -> &C {
        &self.slot.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.slot.client
    }

    /// Return the slot to the pool
    pub fn release(self) -> Result<(), PoolError<E>> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so both fields are moved out once
        // and `Drop for ConnectionHandle` does not run.
        let (shared, slot) = unsafe {
            (
                ptr::read(&this.shared),
                ManuallyDrop::take(&mut this.slot),
            )
        };
        shared.check_in(slot)
    }
}

impl<C, E> Deref for ConnectionHandle<C, E> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client()
    }
}

impl<C, E> DerefMut for ConnectionHandle<C, E> {
    fn deref_mut(&mut self) -> &mut C {
        self.client_mut()
    }
}

impl<C, E> Drop for ConnectionHandle<C, E> {
    fn drop(&mut self) {
        // SAFETY: `release` bypasses this impl, so the slot is still present
        // and is not touched again after this point.
        let slot = unsafe { ManuallyDrop::take(&mut self.slot) };
        debug!(slot = %slot.id, "Handle dropped without release, returning slot");
        let _ = self.shared.check_in(slot);
    }
}

impl<C, E> fmt::Debug for ConnectionHandle<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("slot", &self.slot.id)
            .finish()
    }
}
