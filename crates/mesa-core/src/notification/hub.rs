//! The notification hub: a single-threaded publish/subscribe dispatcher.
//!
//! # Pieces
//!
//! - [`Receptor`] – the capability set a component implements to receive
//!   notifications: `handle_local` for in-process delivery and
//!   `handle_remote` for transport delivery.
//! - [`Bus`] – a cheap, cloneable handle injected into every component's
//!   constructor.  It owns the pending queue and the two subscription lists,
//!   so a component can publish and (de)register itself from inside its own
//!   handler while a dispatch pass is running.
//! - [`Hub`] – owns the receptors themselves and runs [`Hub::dispatch`].
//!
//! # Dispatch semantics
//!
//! `dispatch` swaps the pending queue for an empty one and walks the
//! swapped-out batch once.  Anything enqueued while the batch is being
//! delivered lands in the fresh queue and is delivered on the *next*
//! `dispatch` call, so a receptor reacting to X by publishing Y can never
//! grow the current pass.
//!
//! Delivery is a broadcast: every subscribed receptor sees every
//! notification, in registration order, regardless of what earlier
//! receptors returned.  The `bool` a handler returns only tells its caller
//! whether it recognised the notification; the hub ignores it.
//!
//! # Thread safety
//!
//! The hub itself is driven from one thread.  The [`Bus`] state sits behind
//! a `Mutex` so that handles may be moved into other threads or tasks
//! without breaking the enqueue/dispatch contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use super::{Kind, Notification};

/// Identity of a receptor registered with a [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceptorId(u64);

/// A component that receives dispatched notifications.
///
/// Both handlers default to "not handled"; implement the ones that apply.
/// The return value is advisory: the hub delivers to every subscribed
/// receptor whatever the previous ones returned.
#[cfg_attr(test, mockall::automock)]
pub trait Receptor {
    /// The id this receptor was allocated from [`Bus::allocate_id`].
    fn receptor_id(&self) -> ReceptorId;

    /// Called for every notification with `local` set.
    fn handle_local(&mut self, _notification: &Notification) -> bool {
        false
    }

    /// Called for every notification with `remote` set.
    fn handle_remote(&mut self, _notification: &Notification) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct BusState {
    pending: Vec<Notification>,
    local: Vec<ReceptorId>,
    remote: Vec<ReceptorId>,
    next_id: u64,
}

/// Shared handle to the hub's pending queue and subscription lists.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    state: Arc<Mutex<BusState>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panic inside a handler must not wedge the whole bus.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out a fresh receptor id.
    pub fn allocate_id(&self) -> ReceptorId {
        let mut state = self.lock();
        let id = ReceptorId(state.next_id);
        state.next_id += 1;
        id
    }

    /// Appends `notification` to the pending queue.  Never blocks on I/O and
    /// may be called from inside a handler.
    pub fn enqueue(&self, notification: Notification) {
        self.lock().pending.push(notification);
    }

    /// Subscribes `id` to local delivery.  Registering twice is a no-op.
    pub fn register_local(&self, id: ReceptorId) {
        let mut state = self.lock();
        if !state.local.contains(&id) {
            state.local.push(id);
        }
    }

    /// Subscribes `id` to remote delivery.  Registering twice is a no-op.
    pub fn register_remote(&self, id: ReceptorId) {
        let mut state = self.lock();
        if !state.remote.contains(&id) {
            state.remote.push(id);
        }
    }

    /// Removes `id` from both subscription lists.  Idempotent.
    pub fn deregister(&self, id: ReceptorId) {
        let mut state = self.lock();
        state.local.retain(|r| *r != id);
        state.remote.retain(|r| *r != id);
    }

    /// Removes `id` from remote delivery only.  Idempotent.
    pub fn deregister_remote(&self, id: ReceptorId) {
        self.lock().remote.retain(|r| *r != id);
    }

    pub fn is_local_registered(&self, id: ReceptorId) -> bool {
        self.lock().local.contains(&id)
    }

    pub fn is_remote_registered(&self, id: ReceptorId) -> bool {
        self.lock().remote.contains(&id)
    }

    /// Number of notifications waiting for the next dispatch.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Swaps the pending queue out, leaving an empty one behind.
    pub fn take_pending(&self) -> Vec<Notification> {
        std::mem::take(&mut self.lock().pending)
    }

    fn local_receptors(&self) -> Vec<ReceptorId> {
        self.lock().local.clone()
    }

    fn remote_receptors(&self) -> Vec<ReceptorId> {
        self.lock().remote.clone()
    }
}

/// In-process publish/subscribe dispatcher.
pub struct Hub {
    bus: Bus,
    receptors: HashMap<ReceptorId, Box<dyn Receptor>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::with_bus(Bus::new())
    }

    pub fn with_bus(bus: Bus) -> Self {
        Self {
            bus,
            receptors: HashMap::new(),
        }
    }

    /// Returns a handle to this hub's bus for injection into components.
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    /// Takes ownership of `receptor` without subscribing it to anything.
    /// The receptor subscribes itself later through its [`Bus`].
    pub fn attach(&mut self, receptor: Box<dyn Receptor>) -> ReceptorId {
        let id = receptor.receptor_id();
        self.receptors.insert(id, receptor);
        id
    }

    /// Attaches `receptor` and subscribes it to local delivery.
    pub fn register_local(&mut self, receptor: Box<dyn Receptor>) -> ReceptorId {
        let id = self.attach(receptor);
        self.bus.register_local(id);
        id
    }

    /// Attaches `receptor` and subscribes it to remote delivery.
    pub fn register_remote(&mut self, receptor: Box<dyn Receptor>) -> ReceptorId {
        let id = self.attach(receptor);
        self.bus.register_remote(id);
        id
    }

    /// Unsubscribes `id` from both lists.  Idempotent.
    pub fn deregister(&mut self, id: ReceptorId) {
        self.bus.deregister(id);
    }

    /// Unsubscribes `id` and hands the receptor back to the caller.
    pub fn detach(&mut self, id: ReceptorId) -> Option<Box<dyn Receptor>> {
        self.bus.deregister(id);
        self.receptors.remove(&id)
    }

    pub fn enqueue(&self, notification: Notification) {
        self.bus.enqueue(notification);
    }

    /// Delivers every notification queued before this call.
    ///
    /// Returns the number of notifications dispatched.
    pub fn dispatch(&mut self) -> usize {
        let batch = self.bus.take_pending();
        for notification in &batch {
            if notification.kind == Kind::TimerTick {
                trace!("dispatching {:?}", notification.kind);
            } else {
                debug!(
                    "dispatching {:?} (local={}, remote={}, client_id={:?}, error={:?})",
                    notification.kind,
                    notification.local,
                    notification.remote,
                    notification.client_id,
                    notification.error
                );
            }

            // Subscription lists are re-read per notification so that a
            // receptor (de)registering mid-pass affects the next one.
            if notification.local {
                for id in self.bus.local_receptors() {
                    if let Some(receptor) = self.receptors.get_mut(&id) {
                        let _ = receptor.handle_local(notification);
                    }
                }
            }
            if notification.remote {
                for id in self.bus.remote_receptors() {
                    if let Some(receptor) = self.receptors.get_mut(&id) {
                        let _ = receptor.handle_remote(notification);
                    }
                }
            }
        }
        batch.len()
    }

    /// Enqueues a [`Kind::TimerTick`] and dispatches.  This is the call the
    /// host makes once per tick.
    pub fn pump(&mut self) -> usize {
        self.enqueue(Notification::new(Kind::TimerTick));
        self.dispatch()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
