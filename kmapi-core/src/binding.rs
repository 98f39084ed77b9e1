//! Engine attach: one-time engine resolution and trust bundle installation.
//!
//! The first `ensure_initialized` resolves the engine, builds the PEM bundle from the
//! trust store and calls `lib_init`. The outcome, success or failure, is cached; later
//! calls return it without touching the engine again. A failed attach never panics;
//! endpoints created under it fail every operation instead.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::engine::Engine;
use crate::error::AttachError;
use crate::trust::{SystemTrustStore, TrustBundle, TrustStore};

/// Produces the engine on first attach.
pub type EngineFactory = Arc<dyn Fn() -> Result<Arc<dyn Engine>, AttachError> + Send + Sync>;

type Attachment = Result<Arc<dyn Engine>, AttachError>;

pub struct Binding {
    factory: EngineFactory,
    trust: Box<dyn TrustStore>,
    outcome: Mutex<Option<Attachment>>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.outcome.lock() {
            None => "pending".to_string(),
            Some(Ok(_)) => "attached".to_string(),
            Some(Err(e)) => format!("failed: {e}"),
        };
        f.debug_struct("Binding").field("state", &state).finish()
    }
}

impl Binding {
    pub fn new(factory: EngineFactory, trust: Box<dyn TrustStore>) -> Self {
        Self {
            factory,
            trust,
            outcome: Mutex::new(None),
        }
    }

    /// Binding over an already constructed engine.
    pub fn with_engine(engine: Arc<dyn Engine>, trust: Box<dyn TrustStore>) -> Self {
        Self::new(Arc::new(move || Ok(engine.clone())), trust)
    }

    pub fn ensure_initialized(&self) -> Result<(), AttachError> {
        self.engine().map(|_| ())
    }

    /// The attached engine, attaching on first call.
    pub fn engine(&self) -> Result<Arc<dyn Engine>, AttachError> {
        let mut outcome = self.outcome.lock();
        if let Some(cached) = &*outcome {
            return cached.clone();
        }
        let attached = self.attach();
        match &attached {
            Ok(_) => tracing::debug!("native engine attached"),
            Err(e) => tracing::warn!(error = %e, "native engine attach failed"),
        }
        *outcome = Some(attached.clone());
        attached
    }

    pub fn is_attached(&self) -> bool {
        matches!(&*self.outcome.lock(), Some(Ok(_)))
    }

    /// Forget the cached outcome; the next call attaches again.
    pub fn reset(&self) {
        *self.outcome.lock() = None;
    }

    fn attach(&self) -> Attachment {
        let engine = (self.factory)()?;
        let bundle = TrustBundle::load(self.trust.as_ref());
        tracing::debug!(certs = bundle.cert_count(), "installing trust bundle");
        engine
            .lib_init(bundle.as_str())
            .map_err(AttachError::InitFailed)?;
        Ok(engine)
    }
}

static REGISTERED: RwLock<Option<EngineFactory>> = parking_lot::const_rwlock(None);
static GLOBAL: OnceLock<Binding> = OnceLock::new();

/// Register the engine the process-wide binding attaches to. Replaces any earlier registration;
/// takes effect on the next attach (after `global().reset()` if one already happened).
pub fn register_engine(factory: EngineFactory) {
    *REGISTERED.write() = Some(factory);
}

/// The process-wide binding used by the endpoints' `new()` constructors.
/// Reads the system trust store; attach fails with `NoEngine` until an engine is registered.
pub fn global() -> &'static Binding {
    GLOBAL.get_or_init(|| {
        Binding::new(
            Arc::new(|| {
                let factory = REGISTERED.read().clone();
                match factory {
                    Some(f) => f(),
                    None => Err(AttachError::NoEngine),
                }
            }),
            Box::new(SystemTrustStore::new()),
        )
    })
}
