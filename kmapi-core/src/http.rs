//! HTTP request endpoint: one request/response exchange per handle, reusable after `reset`.

use std::sync::Arc;

use bytes::Bytes;

use crate::binding::{self, Binding};
use crate::dispatch::{DataCallback, EndpointKind, ErrorCallback, NotifyCallback, StatusCallback};
use crate::engine::Engine;
use crate::error::{KmError, Result, Status};
use crate::handle::{Handle, HandleOwner};
use crate::payload::Payload;
use crate::tls::{SslFlags, TlsConfig};

pub const HTTP_1_1: &str = "HTTP/1.1";
pub const HTTP_2_0: &str = "HTTP/2.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpEvent {
    HeaderComplete,
    Send(Status),
    Data(Bytes),
    ResponseComplete,
    Error(KmError),
}

#[derive(Clone, Default)]
pub struct HttpListeners {
    header_complete: Option<NotifyCallback>,
    send: Option<StatusCallback>,
    data: Option<DataCallback>,
    response_complete: Option<NotifyCallback>,
    error: Option<ErrorCallback>,
}

impl HttpListeners {
    pub fn on_header_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.header_complete = Some(Arc::new(f));
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

    pub fn on_response_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.response_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(KmError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpState {
    #[default]
    Unconfigured,
    Configured,
    Sent,
    Streaming,
    Completed,
    Failed,
    Closed,
}

/// An HTTP request. Headers and flags go in first, then `send_request`; the response
/// streams back as header-complete, zero or more data events, then response-complete.
pub struct HttpRequest {
    version: String,
    owner: HandleOwner<HttpRequest>,
    tls: TlsConfig,
}

impl EndpointKind for HttpRequest {
    const NAME: &'static str = "http";
    type Event = HttpEvent;
    type Listeners = HttpListeners;
    type State = HttpState;

    fn advance(state: HttpState, event: &HttpEvent) -> HttpState {
        match event {
            HttpEvent::HeaderComplete | HttpEvent::Data(_) => HttpState::Streaming,
            HttpEvent::ResponseComplete => HttpState::Completed,
            HttpEvent::Error(_) => HttpState::Failed,
            HttpEvent::Send(_) => state,
        }
    }

    fn invoke(l: &HttpListeners, event: HttpEvent) {
        match event {
            HttpEvent::HeaderComplete => {
                if let Some(f) = &l.header_complete {
                    f()
                }
            }
            HttpEvent::Send(s) => {
                if let Some(f) = &l.send {
                    f(s)
                }
            }
            HttpEvent::Data(d) => {
                if let Some(f) = &l.data {
                    f(&d)
                }
            }
            HttpEvent::ResponseComplete => {
                if let Some(f) = &l.response_complete {
                    f()
                }
            }
            HttpEvent::Error(e) => {
                if let Some(f) = &l.error {
                    f(e)
                }
            }
        }
    }
}

impl HttpRequest {
    /// `version` is passed to the engine as is, e.g. [`HTTP_1_1`].
    pub fn new(version: &str) -> Self {
        Self::with_binding(binding::global(), version)
    }

    pub fn with_binding(binding: &Binding, version: &str) -> Self {
        Self {
            version: version.to_string(),
            owner: HandleOwner::new(binding, |e, h| e.http().close_and_destroy(h)),
            tls: TlsConfig::default(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_listeners(&self, listeners: HttpListeners) -> &Self {
        self.owner.registry().replace(listeners);
        self
    }

    pub fn on_header_complete(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.header_complete = Some(Arc::new(f)));
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

    pub fn on_response_complete(&self, f: impl Fn() + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.response_complete = Some(Arc::new(f)));
        self
    }

    pub fn on_error(&self, f: impl Fn(KmError) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.error = Some(Arc::new(f)));
        self
    }

    pub fn set_ssl_flags(&mut self, flags: SslFlags) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.http().set_ssl_flags(h, flags)?;
        self.tls.flags = Some(flags);
        self.configured();
        Ok(())
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.http().add_header(h, name, value)?;
        self.configured();
        Ok(())
    }

    /// Start the request. `Ok` means pending.
    pub fn send_request(&mut self, method: &str, url: &str) -> Result<()> {
        let (h, engine) = self.ensure()?;
        let prev = self.owner.state();
        self.owner.set_state(HttpState::Sent);
        if let Err(e) = engine.http().send_request(h, method, url) {
            self.owner.set_state(prev);
            return Err(e.into());
        }
        tracing::debug!(handle = %h, method, url, "http request sent");
        Ok(())
    }

    /// Write request body bytes; an empty payload ends a body of unknown length.
    pub fn send_data<'a>(&self, payload: impl Into<Payload<'a>>) -> Result<usize> {
        let (h, engine) = self.owner.live()?;
        Ok(engine.http().send(h, payload.into())?)
    }

    /// Drop the previous exchange; the handle and its listeners stay for the next request.
    pub fn reset(&mut self) -> Result<()> {
        let (h, engine) = self.owner.live()?;
        engine.http().reset(h);
        self.owner.set_state(HttpState::Configured);
        Ok(())
    }

    /// Response status code, once headers are complete.
    pub fn status_code(&self) -> Option<u16> {
        let (h, engine) = self.owner.live().ok()?;
        engine.http().status_code(h)
    }

    pub fn header_value(&self, name: &str) -> Option<String> {
        let (h, engine) = self.owner.live().ok()?;
        engine.http().header_value(h, name)
    }

    pub fn close(&mut self) -> bool {
        let closed = self.owner.close();
        if closed {
            self.owner.set_state(HttpState::Closed);
        }
        closed
    }

    pub fn handle(&self) -> Option<Handle> {
        self.owner.handle()
    }

    pub fn state(&self) -> HttpState {
        self.owner.state()
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    fn ensure(&mut self) -> Result<(Handle, Arc<dyn Engine>)> {
        let version = &self.version;
        self.owner.ensure(|e, port| e.http().create(version, port))
    }

    fn configured(&self) {
        if self.owner.state() == HttpState::Unconfigured {
            self.owner.set_state(HttpState::Configured);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AttachError, EndpointError};
    use crate::testing::{Call, RecordingEngine};
    use crate::trust::StaticTrustStore;
    use parking_lot::Mutex;

    fn request() -> (Arc<RecordingEngine>, HttpRequest) {
        let engine = Arc::new(RecordingEngine::new());
        let binding = engine.binding();
        (engine, HttpRequest::with_binding(&binding, HTTP_1_1))
    }

    #[test]
    fn header_before_request_creates_handle_with_version() {
        let (engine, mut req) = request();
        req.add_header("Accept", "*/*").unwrap();
        let h = req.handle().unwrap();
        assert_eq!(req.state(), HttpState::Configured);
        let calls: Vec<_> = engine
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::LibInit(_)))
            .collect();
        assert_eq!(calls[0], Call::CreateHttp(h, HTTP_1_1.to_string()));
        assert_eq!(calls[1], Call::AddHeader(h, "Accept".into(), "*/*".into()));
    }

    #[test]
    fn get_streams_body_and_completes_once() {
        let (engine, mut req) = request();
        let body = Arc::new(Mutex::new(Vec::new()));
        let completes = Arc::new(Mutex::new(0));
        let headers = Arc::new(Mutex::new(0));
        let (b, c, hd) = (body.clone(), completes.clone(), headers.clone());
        req.on_header_complete(move || *hd.lock() += 1)
            .on_data(move |d| b.lock().extend_from_slice(d))
            .on_response_complete(move || *c.lock() += 1);

        req.send_request("GET", "http://x.test/").unwrap();
        assert_eq!(req.state(), HttpState::Sent);
        let port = engine.http_port(req.handle().unwrap());
        port.deliver(HttpEvent::HeaderComplete);
        port.deliver(HttpEvent::Data(Bytes::from_static(b"hello, ")));
        port.deliver(HttpEvent::Data(Bytes::from_static(b"world")));
        assert_eq!(req.state(), HttpState::Streaming);
        port.deliver(HttpEvent::ResponseComplete);

        assert_eq!(*headers.lock(), 1);
        assert_eq!(&body.lock()[..], b"hello, world");
        assert_eq!(*completes.lock(), 1);
        assert_eq!(req.state(), HttpState::Completed);
    }

    #[test]
    fn reset_keeps_handle() {
        let (engine, mut req) = request();
        req.send_request("GET", "http://x.test/").unwrap();
        let h = req.handle().unwrap();
        engine.http_port(h).deliver(HttpEvent::ResponseComplete);
        req.reset().unwrap();
        assert_eq!(req.handle(), Some(h));
        assert_eq!(req.state(), HttpState::Configured);
        assert!(engine.calls().contains(&Call::Reset(h)));
    }

    #[test]
    fn response_metadata_comes_from_engine() {
        let (engine, mut req) = request();
        assert_eq!(req.status_code(), None);
        req.send_request("GET", "http://x.test/").unwrap();
        let h = req.handle().unwrap();
        engine.set_response(h, 204, &[("Content-Type", "text/plain")]);
        assert_eq!(req.status_code(), Some(204));
        assert_eq!(req.header_value("content-type").as_deref(), Some("text/plain"));
        assert_eq!(req.header_value("x-missing"), None);
    }

    #[test]
    fn body_send_without_request_is_rejected() {
        let (_engine, req) = request();
        assert_eq!(req.send_data("x"), Err(EndpointError::NoHandle));
    }

    #[test]
    fn detached_binding_fails_every_operation() {
        let binding = Binding::new(
            Arc::new(|| Err::<Arc<dyn Engine>, _>(AttachError::Unavailable("libkev.so".into()))),
            Box::new(StaticTrustStore::default()),
        );
        let mut req = HttpRequest::with_binding(&binding, HTTP_1_1);
        let detached = Err(EndpointError::Detached(AttachError::Unavailable(
            "libkev.so".into(),
        )));
        assert_eq!(req.add_header("a", "b"), detached);
        assert_eq!(req.send_request("GET", "http://x.test/"), detached);
        assert!(req.handle().is_none());
        assert!(!req.close());
    }

    #[test]
    fn closed_request_cannot_be_reused() {
        let (engine, mut req) = request();
        req.send_request("GET", "http://a.test/").unwrap();
        assert!(req.close());
        assert_eq!(req.add_header("a", "b"), Err(EndpointError::NoHandle));
        assert_eq!(req.send_request("GET", "http://a.test/"), Err(EndpointError::NoHandle));
        assert_eq!(req.reset(), Err(EndpointError::NoHandle));
        assert_eq!(engine.created("http"), 1);
        assert_eq!(req.state(), HttpState::Closed);
    }

    #[test]
    fn error_event_fails_request() {
        let (engine, mut req) = request();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        req.on_error(move |e| *s.lock() = Some(e));
        req.send_request("GET", "https://x.test/").unwrap();
        engine
            .http_port(req.handle().unwrap())
            .deliver(HttpEvent::Error(KmError::Other(-1234)));
        assert_eq!(*seen.lock(), Some(KmError::Other(-1234)));
        assert_eq!(req.state(), HttpState::Failed);
    }
}
