//! Listener dispatch: routes engine upcalls to the one callback registered per event kind.
//!
//! Each endpoint type has its own event enum and listener struct, so an event kind that does
//! not belong to an endpoint cannot be registered or delivered. The registry also carries the
//! endpoint's protocol state, advanced by every delivered event.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::error::{KmError, Status};
use crate::handle::Handle;

/// Completion of an asynchronous operation.
pub type StatusCallback = Arc<dyn Fn(Status) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(KmError) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Signal without payload, e.g. "headers complete".
pub type NotifyCallback = Arc<dyn Fn() + Send + Sync>;

/// Ties an endpoint type to its events, listener slots and state machine.
pub trait EndpointKind: 'static {
    /// Short name used in logs.
    const NAME: &'static str;
    type Event: fmt::Debug + Send;
    type Listeners: Clone + Default + Send;
    type State: Copy + Default + fmt::Debug + PartialEq + Send;

    /// State after `event` was delivered in `state`.
    fn advance(state: Self::State, event: &Self::Event) -> Self::State;

    /// Invoke the slot registered for `event`, if any.
    fn invoke(listeners: &Self::Listeners, event: Self::Event);
}

/// Per-endpoint routing table plus protocol state.
pub struct Registry<K: EndpointKind> {
    listeners: Mutex<K::Listeners>,
    state: Mutex<K::State>,
}

impl<K: EndpointKind> Default for Registry<K> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(K::Listeners::default()),
            state: Mutex::new(K::State::default()),
        }
    }
}

impl<K: EndpointKind> Registry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit the listener slots in place. Setting a slot replaces the previous callback.
    pub fn register(&self, f: impl FnOnce(&mut K::Listeners)) {
        f(&mut self.listeners.lock());
    }

    /// Replace every slot at once.
    pub fn replace(&self, listeners: K::Listeners) {
        *self.listeners.lock() = listeners;
    }

    pub fn state(&self) -> K::State {
        *self.state.lock()
    }

    pub fn set_state(&self, state: K::State) {
        *self.state.lock() = state;
    }

    /// Advance the state and run the matching callback on the calling thread.
    /// Slots are cloned out of the lock first, so callbacks may re-register freely.
    pub fn dispatch(&self, event: K::Event) {
        {
            let mut state = self.state.lock();
            *state = K::advance(*state, &event);
        }
        let listeners = self.listeners.lock().clone();
        K::invoke(&listeners, event);
    }
}

/// The delivery target handed to the engine when a handle is created.
/// Live until the owning endpoint closes that handle; afterwards every event is dropped.
///
/// Deliveries on one port run one at a time under a gate that `invalidate` also takes, so
/// once `close` returns no listener of that handle is running or will run. The gate is
/// reentrant: a listener may close its own endpoint. A listener that blocks on another
/// thread closing the same endpoint deadlocks.
pub struct UpcallPort<K: EndpointKind> {
    inner: Arc<PortInner<K>>,
}

struct PortInner<K: EndpointKind> {
    live: AtomicBool,
    gate: ReentrantMutex<()>,
    handle: Mutex<Option<Handle>>,
    registry: Arc<Registry<K>>,
}

impl<K: EndpointKind> Clone for UpcallPort<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: EndpointKind> fmt::Debug for UpcallPort<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcallPort")
            .field("kind", &K::NAME)
            .field("handle", &*self.inner.handle.lock())
            .field("live", &self.is_live())
            .finish()
    }
}

impl<K: EndpointKind> UpcallPort<K> {
    pub(crate) fn new(registry: Arc<Registry<K>>) -> Self {
        Self {
            inner: Arc::new(PortInner {
                live: AtomicBool::new(true),
                gate: ReentrantMutex::new(()),
                handle: Mutex::new(None),
                registry,
            }),
        }
    }

    /// Route one engine event. Returns false when the port was already closed and the event dropped.
    pub fn deliver(&self, event: K::Event) -> bool {
        let _gate = self.inner.gate.lock();
        if !self.inner.live.load(Ordering::Acquire) {
            tracing::trace!(
                kind = K::NAME,
                handle = ?*self.inner.handle.lock(),
                ?event,
                "dropping upcall after close"
            );
            return false;
        }
        self.inner.registry.dispatch(event);
        true
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub(crate) fn bind(&self, handle: Handle) {
        *self.inner.handle.lock() = Some(handle);
    }

    /// Stop delivery, waiting for a delivery in progress on another thread to finish.
    pub(crate) fn invalidate(&self) {
        let _gate = self.inner.gate.lock();
        self.inner.live.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Beacon;

    #[derive(Debug)]
    enum BeaconEvent {
        Ping(u32),
        Fail,
    }

    type Slot = Option<Arc<dyn Fn(u32) + Send + Sync>>;

    #[derive(Clone, Default)]
    struct BeaconListeners {
        ping: Slot,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    enum BeaconState {
        #[default]
        Quiet,
        Pinged,
        Failed,
    }

    impl EndpointKind for Beacon {
        const NAME: &'static str = "beacon";
        type Event = BeaconEvent;
        type Listeners = BeaconListeners;
        type State = BeaconState;

        fn advance(_: BeaconState, event: &BeaconEvent) -> BeaconState {
            match event {
                BeaconEvent::Ping(_) => BeaconState::Pinged,
                BeaconEvent::Fail => BeaconState::Failed,
            }
        }

        fn invoke(listeners: &BeaconListeners, event: BeaconEvent) {
            if let (BeaconEvent::Ping(v), Some(cb)) = (event, &listeners.ping) {
                cb(v);
            }
        }
    }

    #[test]
    fn last_registration_wins() {
        let reg = Arc::new(Registry::<Beacon>::new());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = first.clone();
        reg.register(|l| l.ping = Some(Arc::new(move |_: u32| { f.fetch_add(1, Ordering::SeqCst); })));
        let s = second.clone();
        reg.register(|l| l.ping = Some(Arc::new(move |_: u32| { s.fetch_add(1, Ordering::SeqCst); })));
        reg.dispatch(BeaconEvent::Ping(1));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_listener_is_silent_but_state_advances() {
        let reg = Registry::<Beacon>::new();
        reg.dispatch(BeaconEvent::Fail);
        assert_eq!(reg.state(), BeaconState::Failed);
    }

    #[test]
    fn callback_may_reregister() {
        let reg = Arc::new(Registry::<Beacon>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_reg = reg.clone();
        let h = hits.clone();
        reg.register(|l| {
            l.ping = Some(Arc::new(move |_: u32| {
                h.fetch_add(1, Ordering::SeqCst);
                inner_reg.register(|l| l.ping = None);
            }))
        });
        reg.dispatch(BeaconEvent::Ping(1));
        reg.dispatch(BeaconEvent::Ping(2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidated_port_drops_events() {
        let reg = Arc::new(Registry::<Beacon>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        reg.register(|l| l.ping = Some(Arc::new(move |_: u32| { h.fetch_add(1, Ordering::SeqCst); })));
        let port = UpcallPort::new(reg.clone());
        assert!(port.deliver(BeaconEvent::Ping(1)));
        port.clone().invalidate();
        assert!(!port.deliver(BeaconEvent::Ping(2)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reg.state(), BeaconState::Pinged);
    }

    #[test]
    fn close_waits_for_delivery_in_flight() {
        use std::sync::mpsc;
        use std::time::Duration;

        let reg = Arc::new(Registry::<Beacon>::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        reg.register(|l| {
            l.ping = Some(Arc::new(move |_: u32| {
                let _ = entered_tx.send(());
                let _ = release_rx.lock().recv();
                f.store(true, Ordering::SeqCst);
            }))
        });
        let port = UpcallPort::new(reg);
        let upcall = {
            let port = port.clone();
            std::thread::spawn(move || port.deliver(BeaconEvent::Ping(1)))
        };
        entered_rx.recv().unwrap();

        let closer = {
            let port = port.clone();
            std::thread::spawn(move || port.invalidate())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(port.is_live());
        release_tx.send(()).unwrap();
        closer.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(!port.is_live());
        assert!(upcall.join().unwrap());
    }

    #[test]
    fn listener_may_close_its_own_port() {
        let reg = Arc::new(Registry::<Beacon>::new());
        let port = UpcallPort::new(reg.clone());
        let inner = port.clone();
        reg.register(|l| l.ping = Some(Arc::new(move |_: u32| inner.invalidate())));
        assert!(port.deliver(BeaconEvent::Ping(1)));
        assert!(!port.deliver(BeaconEvent::Ping(2)));
    }
}
