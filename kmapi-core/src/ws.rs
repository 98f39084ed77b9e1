//! WebSocket client endpoint.
//!
//! Configuration (flags, origin, subprotocol, headers) is applied to the current handle
//! and also remembered. Each `open` after the first runs on a fresh handle: the old one
//! is closed and the remembered configuration is replayed onto the new one.

use std::sync::Arc;

use bytes::Bytes;

use crate::binding::{self, Binding};
use crate::dispatch::{EndpointKind, ErrorCallback, StatusCallback};
use crate::engine::{Engine, EngineResult};
use crate::error::{KmError, Result, Status};
use crate::handle::{Handle, HandleOwner};
use crate::http::HTTP_1_1;
use crate::payload::Payload;
use crate::tls::SslFlags;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Open(Status),
    Send(Status),
    /// A text message or fragment; `fin` marks the last fragment.
    Text { text: String, fin: bool },
    Binary { data: Bytes, fin: bool },
    Error(KmError),
}

pub type TextCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;
pub type BinaryCallback = Arc<dyn Fn(&[u8], bool) + Send + Sync>;

#[derive(Clone, Default)]
pub struct WsListeners {
    open: Option<StatusCallback>,
    send: Option<StatusCallback>,
    text: Option<TextCallback>,
    binary: Option<BinaryCallback>,
    error: Option<ErrorCallback>,
}

impl WsListeners {
    pub fn on_open(mut self, f: impl Fn(Status) + Send + Sync + 'static) -> Self {
        self.open = Some(Arc::new(f));
        self
    }

    pub fn on_send(mut self, f: impl Fn(Status) + Send + Sync + 'static) -> Self {
        self.send = Some(Arc::new(f));
        self
    }

    pub fn on_text(mut self, f: impl Fn(&str, bool) + Send + Sync + 'static) -> Self {
        self.text = Some(Arc::new(f));
        self
    }

    pub fn on_binary(mut self, f: impl Fn(&[u8], bool) + Send + Sync + 'static) -> Self {
        self.binary = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(KmError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WsState {
    #[default]
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
    Failed,
}

/// Settings replayed onto every fresh handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsConfig {
    pub ssl_flags: Option<SslFlags>,
    pub origin: Option<String>,
    pub subprotocol: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl WsConfig {
    fn apply(&self, engine: &dyn Engine, h: Handle) -> EngineResult {
        let ws = engine.ws();
        if let Some(flags) = self.ssl_flags {
            ws.set_ssl_flags(h, flags)?;
        }
        if let Some(origin) = &self.origin {
            ws.set_origin(h, origin)?;
        }
        if let Some(proto) = &self.subprotocol {
            ws.set_subprotocol(h, proto)?;
        }
        for (name, value) in &self.headers {
            ws.add_header(h, name, value)?;
        }
        Ok(())
    }
}

pub struct WebSocket {
    version: String,
    owner: HandleOwner<WebSocket>,
    config: WsConfig,
    /// Whether `open` has been issued on the current handle.
    opened: bool,
}

impl EndpointKind for WebSocket {
    const NAME: &'static str = "ws";
    type Event = WsEvent;
    type Listeners = WsListeners;
    type State = WsState;

    fn advance(state: WsState, event: &WsEvent) -> WsState {
        match event {
            WsEvent::Open(Ok(())) => WsState::Open,
            WsEvent::Open(Err(_)) | WsEvent::Error(_) => WsState::Failed,
            WsEvent::Send(_) | WsEvent::Text { .. } | WsEvent::Binary { .. } => state,
        }
    }

    fn invoke(l: &WsListeners, event: WsEvent) {
        match event {
            WsEvent::Open(s) => {
                if let Some(f) = &l.open {
                    f(s)
                }
            }
            WsEvent::Send(s) => {
                if let Some(f) = &l.send {
                    f(s)
                }
            }
            WsEvent::Text { text, fin } => {
                if let Some(f) = &l.text {
                    f(&text, fin)
                }
            }
            WsEvent::Binary { data, fin } => {
                if let Some(f) = &l.binary {
                    f(&data, fin)
                }
            }
            WsEvent::Error(e) => {
                if let Some(f) = &l.error {
                    f(e)
                }
            }
        }
    }
}

impl Default for WebSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocket {
    /// Handshake over HTTP/1.1.
    pub fn new() -> Self {
        Self::with_binding(binding::global(), HTTP_1_1)
    }

    pub fn with_binding(binding: &Binding, version: &str) -> Self {
        Self {
            version: version.to_string(),
            owner: HandleOwner::new(binding, |e, h| e.ws().close_and_destroy(h)),
            config: WsConfig::default(),
            opened: false,
        }
    }

    pub fn set_listeners(&self, listeners: WsListeners) -> &Self {
        self.owner.registry().replace(listeners);
        self
    }

    pub fn on_open(&self, f: impl Fn(Status) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.open = Some(Arc::new(f)));
        self
    }

    pub fn on_send(&self, f: impl Fn(Status) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.send = Some(Arc::new(f)));
        self
    }

    pub fn on_text(&self, f: impl Fn(&str, bool) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.text = Some(Arc::new(f)));
        self
    }

    pub fn on_binary(&self, f: impl Fn(&[u8], bool) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.binary = Some(Arc::new(f)));
        self
    }

    pub fn on_error(&self, f: impl Fn(KmError) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.error = Some(Arc::new(f)));
        self
    }

    pub fn set_ssl_flags(&mut self, flags: SslFlags) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.ws().set_ssl_flags(h, flags)?;
        self.config.ssl_flags = Some(flags);
        Ok(())
    }

    pub fn set_origin(&mut self, origin: &str) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.ws().set_origin(h, origin)?;
        self.config.origin = Some(origin.to_string());
        Ok(())
    }

    pub fn set_subprotocol(&mut self, subprotocol: &str) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.ws().set_subprotocol(h, subprotocol)?;
        self.config.subprotocol = Some(subprotocol.to_string());
        Ok(())
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.ws().add_header(h, name, value)?;
        self.config.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Start the opening handshake to `url` (`ws://` or `wss://`). A handle that was
    /// already opened is closed first and replaced.
    pub fn open(&mut self, url: &str) -> Result<()> {
        if self.opened && self.owner.recycle() {
            tracing::debug!(url, "reopening websocket on a fresh handle");
        }
        let (h, engine) = self.ensure()?;
        self.opened = true;
        self.owner.set_state(WsState::Opening);
        if let Err(e) = engine.ws().open(h, url) {
            self.owner.set_state(WsState::Failed);
            return Err(e.into());
        }
        Ok(())
    }

    /// Text payloads go out as a text frame, bytes and buffers as a binary frame.
    pub fn send<'a>(&self, payload: impl Into<Payload<'a>>) -> Result<usize> {
        let (h, engine) = self.owner.live()?;
        Ok(engine.ws().send(h, payload.into())?)
    }

    pub fn close(&mut self) -> bool {
        if self.owner.handle().is_none() {
            return false;
        }
        self.owner.set_state(WsState::Closing);
        self.owner.close();
        self.opened = false;
        self.owner.set_state(WsState::Closed);
        true
    }

    pub fn handle(&self) -> Option<Handle> {
        self.owner.handle()
    }

    pub fn state(&self) -> WsState {
        self.owner.state()
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Current handle, or a new one carrying the remembered configuration.
    fn ensure(&mut self) -> Result<(Handle, Arc<dyn Engine>)> {
        let version = &self.version;
        let config = &self.config;
        self.owner.ensure(|e, port| {
            let h = e.ws().create(version, port)?;
            if let Err(err) = config.apply(e, h) {
                e.ws().close_and_destroy(h);
                return Err(err);
            }
            Ok(h)
        })
    }
}
