//! Raw TCP endpoint with optional TLS.

use std::sync::Arc;

use bytes::Bytes;

use crate::binding::{self, Binding};
use crate::dispatch::{DataCallback, EndpointKind, ErrorCallback, StatusCallback};
use crate::engine::Engine;
use crate::error::{KmError, Result, Status};
use crate::handle::{Handle, HandleOwner};
use crate::payload::Payload;
use crate::tls::{SslFlags, SslRole, TlsConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpEvent {
    Connect(Status),
    SslHandshake(Status),
    Send(Status),
    Data(Bytes),
    Error(KmError),
}

#[derive(Clone, Default)]
pub struct TcpListeners {
    connect: Option<StatusCallback>,
    ssl_handshake: Option<StatusCallback>,
    send: Option<StatusCallback>,
    data: Option<DataCallback>,
    error: Option<ErrorCallback>,
}

impl TcpListeners {
    pub fn on_connect(mut self, f: impl Fn(Status) + Send + Sync + 'static) -> Self {
        self.connect = Some(Arc::new(f));
        self
    }

    pub fn on_ssl_handshake(mut self, f: impl Fn(Status) + Send + Sync + 'static) -> Self {
        self.ssl_handshake = Some(Arc::new(f));
        self
    }

    pub fn on_send(mut self, f: impl Fn(Status) + Send + Sync + 'static) -> Self {
        self.send = Some(Arc::new(f));
        self
    }

    pub fn on_data(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.data = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(KmError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TcpState {
    #[default]
    Created,
    Bound,
    Connecting,
    Connected,
    SslHandshaking,
    SslEstablished,
    Failed,
    Closed,
}

/// A TCP connection backed by one engine handle.
///
/// `connect` and `start_ssl_handshake` only report whether the engine accepted the
/// request; completion arrives through the connect / ssl-handshake listeners.
pub struct TcpSocket {
    owner: HandleOwner<TcpSocket>,
    tls: TlsConfig,
}

impl EndpointKind for TcpSocket {
    const NAME: &'static str = "tcp";
    type Event = TcpEvent;
    type Listeners = TcpListeners;
    type State = TcpState;

    fn advance(state: TcpState, event: &TcpEvent) -> TcpState {
        match event {
            TcpEvent::Connect(Ok(())) => TcpState::Connected,
            TcpEvent::SslHandshake(Ok(())) => TcpState::SslEstablished,
            TcpEvent::Connect(Err(_)) | TcpEvent::SslHandshake(Err(_)) | TcpEvent::Error(_) => {
                TcpState::Failed
            }
            TcpEvent::Send(_) | TcpEvent::Data(_) => state,
        }
    }

    fn invoke(l: &TcpListeners, event: TcpEvent) {
        match event {
            TcpEvent::Connect(s) => {
                if let Some(f) = &l.connect {
                    f(s)
                }
            }
            TcpEvent::SslHandshake(s) => {
                if let Some(f) = &l.ssl_handshake {
                    f(s)
                }
            }
            TcpEvent::Send(s) => {
                if let Some(f) = &l.send {
                    f(s)
                }
            }
            TcpEvent::Data(d) => {
                if let Some(f) = &l.data {
                    f(&d)
                }
            }
            TcpEvent::Error(e) => {
                if let Some(f) = &l.error {
                    f(e)
                }
            }
        }
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocket {
    /// Endpoint on the process-wide binding.
    pub fn new() -> Self {
        Self::with_binding(binding::global())
    }

    pub fn with_binding(binding: &Binding) -> Self {
        Self {
            owner: HandleOwner::new(binding, |e, h| e.tcp().close_and_destroy(h)),
            tls: TlsConfig::default(),
        }
    }

    pub fn set_listeners(&self, listeners: TcpListeners) -> &Self {
        self.owner.registry().replace(listeners);
        self
    }

    pub fn on_connect(&self, f: impl Fn(Status) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.connect = Some(Arc::new(f)));
        self
    }

    pub fn on_ssl_handshake(&self, f: impl Fn(Status) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.ssl_handshake = Some(Arc::new(f)));
        self
    }

    pub fn on_send(&self, f: impl Fn(Status) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.send = Some(Arc::new(f)));
        self
    }

    pub fn on_data(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.data = Some(Arc::new(f)));
        self
    }

    pub fn on_error(&self, f: impl Fn(KmError) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.error = Some(Arc::new(f)));
        self
    }

    pub fn set_ssl_flags(&mut self, flags: SslFlags) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.tcp().set_ssl_flags(h, flags)?;
        self.tls.flags = Some(flags);
        Ok(())
    }

    /// Name sent in SNI and checked against the peer certificate instead of the dialed host.
    pub fn set_ssl_server_name(&mut self, name: &str) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.tcp().set_ssl_server_name(h, name)?;
        self.tls.server_name = Some(name.to_string());
        Ok(())
    }

    pub fn bind(&mut self, host: &str, port: u16) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.tcp().bind(h, host, port)?;
        self.owner.set_state(TcpState::Bound);
        Ok(())
    }

    /// `timeout_ms == 0` leaves the timeout to the engine.
    pub fn connect(&mut self, host: &str, port: u16, timeout_ms: u32) -> Result<()> {
        let (h, engine) = self.ensure()?;
        let prev = self.transition(TcpState::Connecting);
        if let Err(e) = engine.tcp().connect(h, host, port, timeout_ms) {
            self.owner.set_state(prev);
            return Err(e.into());
        }
        tracing::debug!(handle = %h, host, port, "tcp connect accepted");
        Ok(())
    }

    /// Upgrade the established connection. Needs a live handle.
    pub fn start_ssl_handshake(&mut self, role: SslRole) -> Result<()> {
        let (h, engine) = self.owner.live()?;
        let prev = self.owner.state();
        self.owner.set_state(TcpState::SslHandshaking);
        if let Err(e) = engine.tcp().start_ssl_handshake(h, role) {
            self.owner.set_state(prev);
            return Err(e.into());
        }
        Ok(())
    }

    /// Queue bytes for sending; returns the count the engine accepted.
    pub fn send<'a>(&self, payload: impl Into<Payload<'a>>) -> Result<usize> {
        let (h, engine) = self.owner.live()?;
        Ok(engine.tcp().send(h, payload.into())?)
    }

    /// Stop inbound data delivery until `resume`.
    pub fn pause(&self) -> Result<()> {
        let (h, engine) = self.owner.live()?;
        Ok(engine.tcp().pause(h)?)
    }

    pub fn resume(&self) -> Result<()> {
        let (h, engine) = self.owner.live()?;
        Ok(engine.tcp().resume(h)?)
    }

    /// Tear the connection down. No listener fires afterwards. False if already closed.
    pub fn close(&mut self) -> bool {
        let closed = self.owner.close();
        if closed {
            self.owner.set_state(TcpState::Closed);
        }
        closed
    }

    pub fn handle(&self) -> Option<Handle> {
        self.owner.handle()
    }

    pub fn state(&self) -> TcpState {
        self.owner.state()
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    fn ensure(&mut self) -> Result<(Handle, Arc<dyn Engine>)> {
        self.owner.ensure(|e, port| e.tcp().create(port))
    }

    fn transition(&self, next: TcpState) -> TcpState {
        let prev = self.owner.state();
        self.owner.set_state(next);
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EndpointError;
    use crate::testing::{Call, RecordingEngine};
    use parking_lot::Mutex;

    fn socket() -> (Arc<RecordingEngine>, TcpSocket) {
        let engine = Arc::new(RecordingEngine::new());
        let binding = engine.binding();
        (engine, TcpSocket::with_binding(&binding))
    }

    #[test]
    fn configuration_materializes_handle() {
        let (engine, mut tcp) = socket();
        assert!(tcp.handle().is_none());
        tcp.set_ssl_flags(SslFlags::ENABLE).unwrap();
        let h = tcp.handle().unwrap();
        tcp.set_ssl_server_name("api.example.test").unwrap();
        assert_eq!(tcp.handle(), Some(h));
        assert_eq!(engine.created("tcp"), 1);
        assert_eq!(tcp.tls().server_name.as_deref(), Some("api.example.test"));
    }

    #[test]
    fn connect_send_data_close() {
        let (engine, mut tcp) = socket();
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        tcp.on_connect(move |s| a.lock().push(format!("connect {s:?}")))
            .on_data(move |d| b.lock().push(String::from_utf8_lossy(d).into_owned()))
            .on_error(move |e| c.lock().push(format!("error {e}")));

        tcp.connect("example.test", 443, 5000).unwrap();
        assert_eq!(tcp.state(), TcpState::Connecting);
        let port = engine.tcp_port(tcp.handle().unwrap());
        port.deliver(TcpEvent::Connect(Ok(())));
        assert_eq!(tcp.state(), TcpState::Connected);

        assert_eq!(tcp.send("GET / \r\n").unwrap(), 8);
        port.deliver(TcpEvent::Data(Bytes::from_static(b"HTTP/1.0 200 OK")));
        assert!(tcp.close());
        assert!(!port.deliver(TcpEvent::Error(KmError::Closed)));

        assert_eq!(*log.lock(), vec!["connect Ok(())", "HTTP/1.0 200 OK"]);
        assert_eq!(tcp.state(), TcpState::Closed);
    }

    #[test]
    fn double_close_is_noop() {
        let (engine, mut tcp) = socket();
        assert!(!tcp.close());
        tcp.bind("127.0.0.1", 0).unwrap();
        assert!(tcp.close());
        assert!(!tcp.close());
        assert_eq!(engine.destroyed("tcp"), 1);
        assert_eq!(tcp.send(&b"x"[..]), Err(EndpointError::NoHandle));
    }

    #[test]
    fn operations_after_close_are_rejected() {
        let (engine, mut tcp) = socket();
        tcp.bind("127.0.0.1", 0).unwrap();
        assert!(tcp.close());
        assert_eq!(tcp.connect("127.0.0.1", 80, 0), Err(EndpointError::NoHandle));
        assert_eq!(tcp.set_ssl_flags(SslFlags::ENABLE), Err(EndpointError::NoHandle));
        assert_eq!(tcp.bind("127.0.0.1", 0), Err(EndpointError::NoHandle));
        assert_eq!(engine.created("tcp"), 1);
        assert_eq!(tcp.handle(), None);
        assert_eq!(tcp.state(), TcpState::Closed);
    }

    #[test]
    fn rejected_connect_restores_state() {
        let (engine, mut tcp) = socket();
        tcp.bind("127.0.0.1", 0).unwrap();
        engine.reject_next(KmError::InvalidParam);
        assert_eq!(
            tcp.connect("bad host", 1, 0),
            Err(EndpointError::Engine(KmError::InvalidParam))
        );
        assert_eq!(tcp.state(), TcpState::Bound);
    }

    #[test]
    fn handshake_needs_a_handle() {
        let (_engine, mut tcp) = socket();
        assert_eq!(
            tcp.start_ssl_handshake(SslRole::Client),
            Err(EndpointError::NoHandle)
        );
    }

    #[test]
    fn handshake_events_advance_state() {
        let (engine, mut tcp) = socket();
        tcp.connect("peer.test", 443, 0).unwrap();
        let port = engine.tcp_port(tcp.handle().unwrap());
        port.deliver(TcpEvent::Connect(Ok(())));
        tcp.start_ssl_handshake(SslRole::Server).unwrap();
        assert_eq!(tcp.state(), TcpState::SslHandshaking);
        port.deliver(TcpEvent::SslHandshake(Err(KmError::SslError)));
        assert_eq!(tcp.state(), TcpState::Failed);
        assert!(engine
            .calls()
            .contains(&Call::StartSslHandshake(tcp.handle().unwrap(), SslRole::Server)));
    }

    #[test]
    fn late_listener_sees_no_replay() {
        let (engine, mut tcp) = socket();
        tcp.connect("peer.test", 80, 0).unwrap();
        let port = engine.tcp_port(tcp.handle().unwrap());
        port.deliver(TcpEvent::Connect(Ok(())));
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        tcp.on_connect(move |_| *h.lock() += 1);
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn payload_kinds_write_identical_bytes() {
        let (engine, mut tcp) = socket();
        tcp.connect("peer.test", 80, 0).unwrap();
        tcp.send("héllo").unwrap();
        tcp.send("héllo".as_bytes()).unwrap();
        tcp.send(Bytes::from("héllo")).unwrap();
        let sent = engine.sent(tcp.handle().unwrap());
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| s == "héllo".as_bytes()));
    }

    #[test]
    fn pause_and_resume_reach_engine() {
        let (engine, mut tcp) = socket();
        assert_eq!(tcp.pause(), Err(EndpointError::NoHandle));
        tcp.connect("peer.test", 80, 0).unwrap();
        let h = tcp.handle().unwrap();
        tcp.pause().unwrap();
        tcp.resume().unwrap();
        let calls = engine.calls();
        assert!(calls.contains(&Call::Pause(h)));
        assert!(calls.contains(&Call::Resume(h)));
    }

    #[test]
    fn drop_destroys_handle() {
        let (engine, mut tcp) = socket();
        tcp.bind("0.0.0.0", 0).unwrap();
        drop(tcp);
        assert_eq!(engine.destroyed("tcp"), 1);
    }
}
