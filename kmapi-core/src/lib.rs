//! kmapi binding core: endpoints over opaque native engine handles.
//! No I/O of its own; the engine does the networking and reports back through upcalls.

pub mod binding;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod handle;
pub mod http;
pub mod payload;
pub mod tcp;
pub mod tls;
pub mod trust;
pub mod udp;
pub mod ws;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use binding::{global, register_engine, Binding, EngineFactory};
pub use dispatch::{EndpointKind, UpcallPort};
pub use engine::{Engine, EngineResult, HttpEngine, TcpEngine, UdpEngine, WsEngine};
pub use error::{AttachError, EndpointError, KmError, Result, Status};
pub use handle::Handle;
pub use http::{HttpEvent, HttpListeners, HttpRequest, HttpState, HTTP_1_1, HTTP_2_0};
pub use payload::Payload;
pub use tcp::{TcpEvent, TcpListeners, TcpSocket, TcpState};
pub use tls::{SslFlags, SslRole, TlsConfig};
pub use trust::{StaticTrustStore, SystemTrustStore, TrustBundle, TrustStore};
pub use udp::{UdpEvent, UdpFlags, UdpListeners, UdpSocket, UdpState};
pub use ws::{WebSocket, WsConfig, WsEvent, WsListeners, WsState};

/// Binding version reported over the C ABI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
