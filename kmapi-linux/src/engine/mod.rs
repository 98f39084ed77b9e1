//! Tokio transport engine: implements the kmapi engine traits on a multi-threaded runtime.
//!
//! Every handle is an entry in a per-kind table. Calls from the endpoints are answered on the
//! caller's thread (accept/reject, queued byte counts); the network work runs as one task per
//! handle, fed by an unbounded command channel, and reports back through the handle's port.

mod http;
mod tcp;
mod tls;
mod udp;
mod ws;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kmapi_core::{Engine, EngineResult, Handle, HttpEngine, KmError, TcpEngine, UdpEngine, WsEngine};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime;

pub use tls::load_identity;

/// Runtime knobs, normally taken from the config file.
#[derive(Debug)]
pub struct EngineSettings {
    /// Used when a connect passes `timeout_ms == 0`.
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    /// Certificate chain and key for the server side of a TCP TLS handshake.
    pub identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_buffer_size: 16 * 1024,
            identity: None,
        }
    }
}

/// Byte stream a connection task reads and writes, plain or TLS.
trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type BoxIo = Box<dyn Io>;

pub struct TokioEngine {
    rt: runtime::Handle,
    settings: EngineSettings,
    roots: RwLock<Arc<RootCertStore>>,
    next: AtomicU64,
    tcp: Mutex<HashMap<Handle, tcp::TcpEntry>>,
    udp: Mutex<HashMap<Handle, udp::UdpEntry>>,
    http: Mutex<HashMap<Handle, http::HttpEntry>>,
    ws: Mutex<HashMap<Handle, ws::WsEntry>>,
}

impl TokioEngine {
    /// Engine spawning its tasks on `rt`.
    pub fn new(rt: runtime::Handle, settings: EngineSettings) -> Self {
        Self {
            rt,
            settings,
            roots: RwLock::new(Arc::new(RootCertStore::empty())),
            next: AtomicU64::new(0),
            tcp: Mutex::new(HashMap::new()),
            udp: Mutex::new(HashMap::new()),
            http: Mutex::new(HashMap::new()),
            ws: Mutex::new(HashMap::new()),
        }
    }

    fn allocate(&self) -> EngineResult<Handle> {
        Handle::new(self.next.fetch_add(1, Ordering::Relaxed) + 1).ok_or(KmError::Fatal)
    }

    fn roots(&self) -> Arc<RootCertStore> {
        self.roots.read().clone()
    }
}

impl Engine for TokioEngine {
    fn lib_init(&self, ca_certs_pem: &str) -> EngineResult {
        let roots = tls::roots_from_pem(ca_certs_pem);
        tracing::debug!(roots = roots.len(), "engine trust store installed");
        *self.roots.write() = Arc::new(roots);
        Ok(())
    }

    fn http(&self) -> &dyn HttpEngine {
        self
    }

    fn tcp(&self) -> &dyn TcpEngine {
        self
    }

    fn udp(&self) -> &dyn UdpEngine {
        self
    }

    fn ws(&self) -> &dyn WsEngine {
        self
    }
}

/// Engine code for an I/O failure.
fn io_code(e: &io::Error) -> KmError {
    match e.kind() {
        io::ErrorKind::TimedOut => KmError::Timeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe => KmError::Closed,
        io::ErrorKind::InvalidInput => KmError::InvalidParam,
        io::ErrorKind::WouldBlock => KmError::Again,
        io::ErrorKind::InvalidData => KmError::SslError,
        _ => KmError::SockError,
    }
}
