//! The native transport engine's capability contract, as consumed by the endpoints.
//!
//! Every call returns immediately. Progress is reported later through the [`UpcallPort`]
//! handed over at `create`, on whatever thread the engine delivers from. After
//! `close_and_destroy` returns, the engine must not use that port again; the port is
//! already dead by then, so anything it still delivers is dropped.

use crate::dispatch::UpcallPort;
use crate::error::KmError;
use crate::handle::Handle;
use crate::http::HttpRequest;
use crate::payload::Payload;
use crate::tcp::TcpSocket;
use crate::tls::{SslFlags, SslRole};
use crate::udp::{UdpFlags, UdpSocket};
use crate::ws::WebSocket;

pub type EngineResult<T = ()> = Result<T, KmError>;

/// Process-wide engine entry point.
pub trait Engine: Send + Sync {
    /// Global initialization with the PEM trust bundle. Called once per attach.
    fn lib_init(&self, ca_certs_pem: &str) -> EngineResult;

    fn http(&self) -> &dyn HttpEngine;
    fn tcp(&self) -> &dyn TcpEngine;
    fn udp(&self) -> &dyn UdpEngine;
    fn ws(&self) -> &dyn WsEngine;
}

/// Request/response HTTP. `version` is e.g. `"HTTP/1.1"` or `"HTTP/2.0"`.
pub trait HttpEngine: Send + Sync {
    fn create(&self, version: &str, port: UpcallPort<HttpRequest>) -> EngineResult<Handle>;
    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult;
    fn add_header(&self, h: Handle, name: &str, value: &str) -> EngineResult;
    /// Start the request. Success means pending; the response arrives as upcalls.
    fn send_request(&self, h: Handle, method: &str, url: &str) -> EngineResult;
    /// Write request body bytes; returns the count accepted.
    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize>;
    /// Drop request/response state so the handle can carry another request.
    fn reset(&self, h: Handle);
    /// Response status, once headers are complete.
    fn status_code(&self, h: Handle) -> Option<u16>;
    /// Response header value by case-insensitive name, once headers are complete.
    fn header_value(&self, h: Handle, name: &str) -> Option<String>;
    fn close(&self, h: Handle);
    fn destroy(&self, h: Handle);

    fn close_and_destroy(&self, h: Handle) {
        self.close(h);
        self.destroy(h);
    }
}

/// Raw TCP stream.
pub trait TcpEngine: Send + Sync {
    fn create(&self, port: UpcallPort<TcpSocket>) -> EngineResult<Handle>;
    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult;
    fn set_ssl_server_name(&self, h: Handle, name: &str) -> EngineResult;
    fn bind(&self, h: Handle, host: &str, port: u16) -> EngineResult;
    /// Begin connecting. Success only means the dial was accepted; completion is the connect upcall.
    /// `timeout_ms == 0` uses the engine default.
    fn connect(&self, h: Handle, host: &str, port: u16, timeout_ms: u32) -> EngineResult;
    fn start_ssl_handshake(&self, h: Handle, role: SslRole) -> EngineResult;
    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize>;
    /// Stop delivering inbound data until `resume`.
    fn pause(&self, h: Handle) -> EngineResult;
    fn resume(&self, h: Handle) -> EngineResult;
    fn close(&self, h: Handle);
    fn destroy(&self, h: Handle);

    fn close_and_destroy(&self, h: Handle) {
        self.close(h);
        self.destroy(h);
    }
}

/// Datagram socket.
pub trait UdpEngine: Send + Sync {
    fn create(&self, port: UpcallPort<UdpSocket>) -> EngineResult<Handle>;
    fn bind(&self, h: Handle, host: &str, port: u16, flags: UdpFlags) -> EngineResult;
    /// Record a default destination. No handshake happens.
    fn connect(&self, h: Handle, host: &str, port: u16) -> EngineResult;
    /// Send one datagram to `host:port`.
    fn send(&self, h: Handle, payload: Payload<'_>, host: &str, port: u16) -> EngineResult<usize>;
    fn mcast_join(&self, h: Handle, addr: &str, port: u16) -> EngineResult;
    fn mcast_leave(&self, h: Handle, addr: &str, port: u16) -> EngineResult;
    fn close(&self, h: Handle);
    fn destroy(&self, h: Handle);

    fn close_and_destroy(&self, h: Handle) {
        self.close(h);
        self.destroy(h);
    }
}

/// WebSocket client.
pub trait WsEngine: Send + Sync {
    fn create(&self, version: &str, port: UpcallPort<WebSocket>) -> EngineResult<Handle>;
    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult;
    fn set_origin(&self, h: Handle, origin: &str) -> EngineResult;
    fn set_subprotocol(&self, h: Handle, subprotocol: &str) -> EngineResult;
    fn add_header(&self, h: Handle, name: &str, value: &str) -> EngineResult;
    fn open(&self, h: Handle, url: &str) -> EngineResult;
    /// Text payloads go out as text frames, everything else as binary frames.
    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize>;
    fn close(&self, h: Handle);
    fn destroy(&self, h: Handle);

    fn close_and_destroy(&self, h: Handle) {
        self.close(h);
        self.destroy(h);
    }
}
