//! In-process engine that records every call and lets tests fire upcalls by hand.
//!
//! Enabled for this crate's tests and, through the `testing` feature, for other crates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::binding::Binding;
use crate::dispatch::UpcallPort;
use crate::engine::{Engine, EngineResult, HttpEngine, TcpEngine, UdpEngine, WsEngine};
use crate::error::KmError;
use crate::handle::Handle;
use crate::http::HttpRequest;
use crate::payload::Payload;
use crate::tcp::TcpSocket;
use crate::tls::{SslFlags, SslRole};
use crate::trust::StaticTrustStore;
use crate::udp::{UdpFlags, UdpSocket};
use crate::ws::WebSocket;

/// One engine call as seen by the recording engine. Payloads are captured as bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LibInit(String),
    Create(&'static str, Handle),
    CreateHttp(Handle, String),
    CreateWs(Handle, String),
    SetSslFlags(Handle, SslFlags),
    SetSslServerName(Handle, String),
    AddHeader(Handle, String, String),
    SetOrigin(Handle, String),
    SetSubprotocol(Handle, String),
    Bind(Handle, String, u16),
    UdpBind(Handle, String, u16, UdpFlags),
    Connect(Handle, String, u16, u32),
    UdpConnect(Handle, String, u16),
    StartSslHandshake(Handle, SslRole),
    SendRequest(Handle, String, String),
    Send(Handle, Vec<u8>),
    SendTo(Handle, Vec<u8>, String, u16),
    /// Payload and whether it went out as a text frame.
    WsSend(Handle, Vec<u8>, bool),
    Open(Handle, String),
    Pause(Handle),
    Resume(Handle),
    Reset(Handle),
    McastJoin(Handle, String, u16),
    McastLeave(Handle, String, u16),
    Close(&'static str, Handle),
    Destroy(&'static str, Handle),
}

#[derive(Default)]
struct Ports {
    http: HashMap<Handle, UpcallPort<HttpRequest>>,
    tcp: HashMap<Handle, UpcallPort<TcpSocket>>,
    udp: HashMap<Handle, UpcallPort<UdpSocket>>,
    ws: HashMap<Handle, UpcallPort<WebSocket>>,
}

#[derive(Default)]
struct Response {
    status: u16,
    headers: Vec<(String, String)>,
}

#[derive(Default)]
pub struct RecordingEngine {
    next: AtomicU64,
    calls: Mutex<Vec<Call>>,
    ports: Mutex<Ports>,
    responses: Mutex<HashMap<Handle, Response>>,
    reject_next: Mutex<Option<KmError>>,
    lib_init_error: Mutex<Option<KmError>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A binding attached to this engine with an empty trust store.
    pub fn binding(self: &Arc<Self>) -> Binding {
        Binding::with_engine(self.clone(), Box::new(StaticTrustStore::default()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn lib_inits(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::LibInit(pem) => Some(pem.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of handles created for `kind` (`"http"`, `"tcp"`, `"udp"`, `"ws"`).
    pub fn created(&self, kind: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| match c {
                Call::Create(k, _) => *k == kind,
                Call::CreateHttp(..) => kind == "http",
                Call::CreateWs(..) => kind == "ws",
                _ => false,
            })
            .count()
    }

    pub fn destroyed(&self, kind: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Destroy(k, _) if *k == kind))
            .count()
    }

    /// Every payload written on `h`, in order.
    pub fn sent(&self, h: Handle) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Send(x, b) | Call::SendTo(x, b, ..) | Call::WsSend(x, b, _) if *x == h => {
                    Some(b.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Make the next fallible call fail with `err`.
    pub fn reject_next(&self, err: KmError) {
        *self.reject_next.lock() = Some(err);
    }

    pub fn fail_lib_init(&self, err: KmError) {
        *self.lib_init_error.lock() = Some(err);
    }

    /// Response metadata reported by `status_code` / `header_value` for `h`.
    pub fn set_response(&self, h: Handle, status: u16, headers: &[(&str, &str)]) {
        self.responses.lock().insert(
            h,
            Response {
                status,
                headers: headers
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect(),
            },
        );
    }

    /// # Panics
    /// If `h` is not a live HTTP handle of this engine.
    pub fn http_port(&self, h: Handle) -> UpcallPort<HttpRequest> {
        let port = self.ports.lock().http.get(&h).cloned();
        port.unwrap_or_else(|| panic!("no live http handle {h}"))
    }

    /// # Panics
    /// If `h` is not a live TCP handle of this engine.
    pub fn tcp_port(&self, h: Handle) -> UpcallPort<TcpSocket> {
        let port = self.ports.lock().tcp.get(&h).cloned();
        port.unwrap_or_else(|| panic!("no live tcp handle {h}"))
    }

    /// # Panics
    /// If `h` is not a live UDP handle of this engine.
    pub fn udp_port(&self, h: Handle) -> UpcallPort<UdpSocket> {
        let port = self.ports.lock().udp.get(&h).cloned();
        port.unwrap_or_else(|| panic!("no live udp handle {h}"))
    }

    /// # Panics
    /// If `h` is not a live WebSocket handle of this engine.
    pub fn ws_port(&self, h: Handle) -> UpcallPort<WebSocket> {
        let port = self.ports.lock().ws.get(&h).cloned();
        port.unwrap_or_else(|| panic!("no live ws handle {h}"))
    }

    fn record(&self, call: Call) -> EngineResult {
        self.calls.lock().push(call);
        match self.reject_next.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn allocate(&self) -> EngineResult<Handle> {
        if let Some(err) = self.reject_next.lock().take() {
            return Err(err);
        }
        let raw = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Handle::new(raw).ok_or(KmError::Fatal)
    }

    fn send_len(&self, call: Call, len: usize) -> EngineResult<usize> {
        self.record(call).map(|_| len)
    }

    fn close_call(&self, kind: &'static str, h: Handle) {
        self.calls.lock().push(Call::Close(kind, h));
    }

    fn destroy_call(&self, kind: &'static str, h: Handle) {
        let mut ports = self.ports.lock();
        match kind {
            "http" => {
                ports.http.remove(&h);
            }
            "tcp" => {
                ports.tcp.remove(&h);
            }
            "udp" => {
                ports.udp.remove(&h);
            }
            _ => {
                ports.ws.remove(&h);
            }
        }
        drop(ports);
        self.calls.lock().push(Call::Destroy(kind, h));
    }
}

impl Engine for RecordingEngine {
    fn lib_init(&self, ca_certs_pem: &str) -> EngineResult {
        self.calls.lock().push(Call::LibInit(ca_certs_pem.to_string()));
        match *self.lib_init_error.lock() {
            Some(err) => Err(err),
            None => Ok(()),
        }
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

impl HttpEngine for RecordingEngine {
    fn create(&self, version: &str, port: UpcallPort<HttpRequest>) -> EngineResult<Handle> {
        let h = self.allocate()?;
        self.ports.lock().http.insert(h, port);
        self.calls.lock().push(Call::CreateHttp(h, version.to_string()));
        Ok(h)
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        self.record(Call::SetSslFlags(h, flags))
    }

    fn add_header(&self, h: Handle, name: &str, value: &str) -> EngineResult {
        self.record(Call::AddHeader(h, name.to_string(), value.to_string()))
    }

    fn send_request(&self, h: Handle, method: &str, url: &str) -> EngineResult {
        self.record(Call::SendRequest(h, method.to_string(), url.to_string()))
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        self.send_len(Call::Send(h, payload.as_bytes().to_vec()), payload.len())
    }

    fn reset(&self, h: Handle) {
        self.responses.lock().remove(&h);
        self.calls.lock().push(Call::Reset(h));
    }

    fn status_code(&self, h: Handle) -> Option<u16> {
        self.responses.lock().get(&h).map(|r| r.status)
    }

    fn header_value(&self, h: Handle, name: &str) -> Option<String> {
        self.responses.lock().get(&h).and_then(|r| {
            r.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        })
    }

    fn close(&self, h: Handle) {
        self.close_call("http", h);
    }

    fn destroy(&self, h: Handle) {
        self.destroy_call("http", h);
    }
}

impl TcpEngine for RecordingEngine {
    fn create(&self, port: UpcallPort<TcpSocket>) -> EngineResult<Handle> {
        let h = self.allocate()?;
        self.ports.lock().tcp.insert(h, port);
        self.calls.lock().push(Call::Create("tcp", h));
        Ok(h)
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        self.record(Call::SetSslFlags(h, flags))
    }

    fn set_ssl_server_name(&self, h: Handle, name: &str) -> EngineResult {
        self.record(Call::SetSslServerName(h, name.to_string()))
    }

    fn bind(&self, h: Handle, host: &str, port: u16) -> EngineResult {
        self.record(Call::Bind(h, host.to_string(), port))
    }

    fn connect(&self, h: Handle, host: &str, port: u16, timeout_ms: u32) -> EngineResult {
        self.record(Call::Connect(h, host.to_string(), port, timeout_ms))
    }

    fn start_ssl_handshake(&self, h: Handle, role: SslRole) -> EngineResult {
        self.record(Call::StartSslHandshake(h, role))
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        self.send_len(Call::Send(h, payload.as_bytes().to_vec()), payload.len())
    }

    fn pause(&self, h: Handle) -> EngineResult {
        self.record(Call::Pause(h))
    }

    fn resume(&self, h: Handle) -> EngineResult {
        self.record(Call::Resume(h))
    }

    fn close(&self, h: Handle) {
        self.close_call("tcp", h);
    }

    fn destroy(&self, h: Handle) {
        self.destroy_call("tcp", h);
    }
}

impl UdpEngine for RecordingEngine {
    fn create(&self, port: UpcallPort<UdpSocket>) -> EngineResult<Handle> {
        let h = self.allocate()?;
        self.ports.lock().udp.insert(h, port);
        self.calls.lock().push(Call::Create("udp", h));
        Ok(h)
    }

    fn bind(&self, h: Handle, host: &str, port: u16, flags: UdpFlags) -> EngineResult {
        self.record(Call::UdpBind(h, host.to_string(), port, flags))
    }

    fn connect(&self, h: Handle, host: &str, port: u16) -> EngineResult {
        self.record(Call::UdpConnect(h, host.to_string(), port))
    }

    fn send(&self, h: Handle, payload: Payload<'_>, host: &str, port: u16) -> EngineResult<usize> {
        let call = Call::SendTo(h, payload.as_bytes().to_vec(), host.to_string(), port);
        self.send_len(call, payload.len())
    }

    fn mcast_join(&self, h: Handle, addr: &str, port: u16) -> EngineResult {
        self.record(Call::McastJoin(h, addr.to_string(), port))
    }

    fn mcast_leave(&self, h: Handle, addr: &str, port: u16) -> EngineResult {
        self.record(Call::McastLeave(h, addr.to_string(), port))
    }

    fn close(&self, h: Handle) {
        self.close_call("udp", h);
    }

    fn destroy(&self, h: Handle) {
        self.destroy_call("udp", h);
    }
}

impl WsEngine for RecordingEngine {
    fn create(&self, version: &str, port: UpcallPort<WebSocket>) -> EngineResult<Handle> {
        let h = self.allocate()?;
        self.ports.lock().ws.insert(h, port);
        self.calls.lock().push(Call::CreateWs(h, version.to_string()));
        Ok(h)
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        self.record(Call::SetSslFlags(h, flags))
    }

    fn set_origin(&self, h: Handle, origin: &str) -> EngineResult {
        self.record(Call::SetOrigin(h, origin.to_string()))
    }

    fn set_subprotocol(&self, h: Handle, subprotocol: &str) -> EngineResult {
        self.record(Call::SetSubprotocol(h, subprotocol.to_string()))
    }

    fn add_header(&self, h: Handle, name: &str, value: &str) -> EngineResult {
        self.record(Call::AddHeader(h, name.to_string(), value.to_string()))
    }

    fn open(&self, h: Handle, url: &str) -> EngineResult {
        self.record(Call::Open(h, url.to_string()))
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        let call = Call::WsSend(h, payload.as_bytes().to_vec(), payload.is_text());
        self.send_len(call, payload.len())
    }

    fn close(&self, h: Handle) {
        self.close_call("ws", h);
    }

    fn destroy(&self, h: Handle) {
        self.destroy_call("ws", h);
    }
}
