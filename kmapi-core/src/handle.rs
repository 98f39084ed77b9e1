//! Native handle lifecycle: created lazily on first use, destroyed exactly once on close.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

use crate::binding::Binding;
use crate::dispatch::{EndpointKind, Registry, UpcallPort};
use crate::engine::{Engine, EngineResult};
use crate::error::{AttachError, EndpointError, KmError, Result};

/// Opaque identifier of one live native endpoint object. Zero is never a valid handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// `None` for the raw value 0, which engines use for "no object".
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Handle)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One endpoint's handle slot: at most one live handle and the port the engine delivers to.
/// Once `close` has destroyed a handle the slot stays empty for good.
pub(crate) struct HandleSlot<K: EndpointKind> {
    live: Option<(Handle, UpcallPort<K>)>,
    closed: bool,
}

impl<K: EndpointKind> Default for HandleSlot<K> {
    fn default() -> Self {
        Self {
            live: None,
            closed: false,
        }
    }
}

impl<K: EndpointKind> HandleSlot<K> {
    pub fn handle(&self) -> Option<Handle> {
        self.live.as_ref().map(|(h, _)| *h)
    }

    /// The live handle, or `NoHandle` when the endpoint has none.
    pub fn get(&self) -> Result<Handle> {
        self.handle().ok_or(EndpointError::NoHandle)
    }

    /// Return the live handle, creating one through `create` if there is none.
    /// `create` receives a fresh port bound to `registry`; the engine keeps it for upcalls.
    /// A closed slot never creates again: `NoHandle`.
    pub fn ensure(
        &mut self,
        registry: &Arc<Registry<K>>,
        create: impl FnOnce(UpcallPort<K>) -> std::result::Result<Handle, KmError>,
    ) -> Result<Handle> {
        if let Some((h, _)) = &self.live {
            return Ok(*h);
        }
        if self.closed {
            return Err(EndpointError::NoHandle);
        }
        let port = UpcallPort::new(registry.clone());
        let handle = create(port.clone())?;
        port.bind(handle);
        tracing::debug!(kind = K::NAME, %handle, "native handle created");
        self.live = Some((handle, port));
        Ok(handle)
    }

    /// Invalidate the port, then tear the handle down through `destroy`.
    /// Returns false, without calling `destroy`, when there was nothing to close.
    pub fn close(&mut self, destroy: impl FnOnce(Handle)) -> bool {
        let closed = self.recycle(destroy);
        self.closed |= closed;
        closed
    }

    /// Like `close`, but the next `ensure` may create a replacement handle.
    pub fn recycle(&mut self, destroy: impl FnOnce(Handle)) -> bool {
        match self.live.take() {
            Some((handle, port)) => {
                port.invalidate();
                destroy(handle);
                tracing::debug!(kind = K::NAME, %handle, "native handle destroyed");
                true
            }
            None => false,
        }
    }
}

/// What every endpoint owns: the attach outcome it was built under, its handle slot and
/// its listener registry. All engine access goes through here so the "create on first use"
/// and "detached means always fail" rules live in one place.
pub(crate) struct HandleOwner<K: EndpointKind> {
    engine: std::result::Result<Arc<dyn Engine>, AttachError>,
    slot: HandleSlot<K>,
    registry: Arc<Registry<K>>,
    destroy: fn(&dyn Engine, Handle),
}

impl<K: EndpointKind> HandleOwner<K> {
    /// `destroy` is the kind's close-and-destroy entry point, also used on drop.
    pub fn new(binding: &Binding, destroy: fn(&dyn Engine, Handle)) -> Self {
        Self {
            engine: binding.engine(),
            slot: HandleSlot::default(),
            registry: Arc::new(Registry::new()),
            destroy,
        }
    }

    pub fn registry(&self) -> &Arc<Registry<K>> {
        &self.registry
    }

    pub fn handle(&self) -> Option<Handle> {
        self.slot.handle()
    }

    pub fn state(&self) -> K::State {
        self.registry.state()
    }

    pub fn set_state(&self, state: K::State) {
        self.registry.set_state(state);
    }

    pub fn engine(&self) -> Result<&Arc<dyn Engine>> {
        self.engine.as_ref().map_err(|e| EndpointError::Detached(e.clone()))
    }

    /// The live handle, created through `create` if needed.
    pub fn ensure(
        &mut self,
        create: impl FnOnce(&dyn Engine, UpcallPort<K>) -> EngineResult<Handle>,
    ) -> Result<(Handle, Arc<dyn Engine>)> {
        let engine = self.engine()?.clone();
        let handle = self
            .slot
            .ensure(&self.registry, |port| create(engine.as_ref(), port))?;
        Ok((handle, engine))
    }

    /// The live handle; `NoHandle` if none exists yet or it was closed.
    pub fn live(&self) -> Result<(Handle, &dyn Engine)> {
        let engine = self.engine()?;
        let handle = self.slot.get()?;
        Ok((handle, engine.as_ref()))
    }

    /// Invalidate the port and destroy the handle. False when there was nothing to close.
    pub fn close(&mut self) -> bool {
        let destroy = self.destroy;
        match &self.engine {
            Ok(engine) => self.slot.close(|h| destroy(engine.as_ref(), h)),
            Err(_) => false,
        }
    }

    /// Destroy the current handle so the next `ensure` creates a fresh one.
    pub fn recycle(&mut self) -> bool {
        let destroy = self.destroy;
        match &self.engine {
            Ok(engine) => self.slot.recycle(|h| destroy(engine.as_ref(), h)),
            Err(_) => false,
        }
    }
}

impl<K: EndpointKind> Drop for HandleOwner<K> {
    fn drop(&mut self) {
        self.close();
    }
}
