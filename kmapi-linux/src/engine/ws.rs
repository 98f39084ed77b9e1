//! WebSocket handles: TCP (plus TLS for `wss://`), the tungstenite client handshake,
//! then one loop pumping queued messages out and frames in.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use kmapi_core::{
    EngineResult, Handle, KmError, Payload, SslFlags, UpcallPort, WebSocket, WsEngine, WsEvent,
    HTTP_1_1,
};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::{io_code, tls, BoxIo, TokioEngine};

pub(super) struct WsEntry {
    port: UpcallPort<WebSocket>,
    flags: SslFlags,
    origin: Option<HeaderValue>,
    subprotocol: Option<HeaderValue>,
    headers: Vec<(HeaderName, HeaderValue)>,
    out: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

struct Target {
    host: String,
    port: u16,
    tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    timeout: Duration,
}

fn ws_code(e: &WsError) -> KmError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => KmError::Closed,
        WsError::Io(e) => io_code(e),
        WsError::Url(_) => KmError::InvalidParam,
        WsError::Capacity(_) => KmError::BufferTooLong,
        WsError::Protocol(_) | WsError::Http(_) | WsError::HttpFormat(_) | WsError::Utf8 => {
            KmError::ProtoError
        }
        _ => KmError::Failed,
    }
}

fn header_value(v: &str) -> EngineResult<HeaderValue> {
    HeaderValue::from_str(v).map_err(|_| KmError::InvalidParam)
}

impl TokioEngine {
    fn with_ws<T>(&self, h: Handle, f: impl FnOnce(&mut WsEntry) -> EngineResult<T>) -> EngineResult<T> {
        let mut table = self.ws.lock();
        let entry = table.get_mut(&h).ok_or(KmError::NotExist)?;
        f(entry)
    }
}

impl WsEngine for TokioEngine {
    fn create(&self, version: &str, port: UpcallPort<WebSocket>) -> EngineResult<Handle> {
        if version != HTTP_1_1 {
            return Err(KmError::NotSupported);
        }
        let h = self.allocate()?;
        self.ws.lock().insert(
            h,
            WsEntry {
                port,
                flags: SslFlags::NONE,
                origin: None,
                subprotocol: None,
                headers: Vec::new(),
                out: None,
                task: None,
            },
        );
        Ok(h)
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        self.with_ws(h, |e| {
            e.flags = flags;
            Ok(())
        })
    }

    fn set_origin(&self, h: Handle, origin: &str) -> EngineResult {
        let v = header_value(origin)?;
        self.with_ws(h, |e| {
            e.origin = Some(v);
            Ok(())
        })
    }

    fn set_subprotocol(&self, h: Handle, subprotocol: &str) -> EngineResult {
        let v = header_value(subprotocol)?;
        self.with_ws(h, |e| {
            e.subprotocol = Some(v);
            Ok(())
        })
    }

    fn add_header(&self, h: Handle, name: &str, value: &str) -> EngineResult {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| KmError::InvalidParam)?;
        let value = header_value(value)?;
        self.with_ws(h, |e| {
            e.headers.push((name, value));
            Ok(())
        })
    }

    fn open(&self, h: Handle, url: &str) -> EngineResult {
        let mut request = url.into_client_request().map_err(|e| ws_code(&e))?;
        let secure = match request.uri().scheme_str() {
            Some("ws") => false,
            Some("wss") => true,
            _ => return Err(KmError::InvalidProto),
        };
        let host = request
            .uri()
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or(KmError::InvalidParam)?;
        let port = request
            .uri()
            .port_u16()
            .unwrap_or(if secure { 443 } else { 80 });

        let roots = self.roots();
        let mut table = self.ws.lock();
        let e = table.get_mut(&h).ok_or(KmError::NotExist)?;
        if e.out.is_some() {
            return Err(KmError::InvalidState);
        }
        let tls = if secure {
            let mut config = tls::client_config(roots, e.flags | SslFlags::ENABLE)?;
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Some((Arc::new(config), tls::server_name(None, &host)?))
        } else {
            None
        };

        let headers = request.headers_mut();
        if let Some(origin) = &e.origin {
            headers.insert("origin", origin.clone());
        }
        if let Some(proto) = &e.subprotocol {
            headers.insert("sec-websocket-protocol", proto.clone());
        }
        for (name, value) in &e.headers {
            headers.append(name.clone(), value.clone());
        }

        let target = Target {
            host,
            port,
            tls,
            timeout: self.settings.connect_timeout,
        };
        tracing::debug!(handle = %h, url, "websocket opening");
        let (tx, rx) = mpsc::unbounded_channel();
        e.out = Some(tx);
        e.task = Some(self.rt.spawn(run(e.port.clone(), target, request, rx)));
        Ok(())
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        let len = payload.len();
        let msg = if payload.is_text() {
            Message::Text(String::from_utf8_lossy(payload.as_bytes()).into_owned())
        } else {
            Message::Binary(payload.as_bytes().to_vec())
        };
        self.with_ws(h, |e| {
            let tx = e.out.as_ref().ok_or(KmError::InvalidState)?;
            tx.send(msg).map_err(|_| KmError::Closed)
        })?;
        Ok(len)
    }

    fn close(&self, h: Handle) {
        if let Some(e) = self.ws.lock().get_mut(&h) {
            // dropping the sender lets the task send a close frame and exit
            e.out = None;
            e.task = None;
        }
    }

    fn destroy(&self, h: Handle) {
        self.ws.lock().remove(&h);
    }
}

async fn connect(t: &Target) -> std::io::Result<BoxIo> {
    let stream = TcpStream::connect((t.host.as_str(), t.port)).await?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let io: BoxIo = match &t.tls {
        Some((config, name)) => {
            Box::new(TlsConnector::from(config.clone()).connect(name.clone(), stream).await?)
        }
        None => Box::new(stream),
    };
    Ok(io)
}

async fn run(
    port: UpcallPort<WebSocket>,
    target: Target,
    request: Request,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let io = match tokio::time::timeout(target.timeout, connect(&target)).await {
        Ok(Ok(io)) => io,
        Ok(Err(e)) => {
            tracing::debug!(host = %target.host, error = %e, "websocket connect failed");
            port.deliver(WsEvent::Open(Err(io_code(&e))));
            return;
        }
        Err(_) => {
            port.deliver(WsEvent::Open(Err(KmError::Timeout)));
            return;
        }
    };
    let mut ws = match tokio_tungstenite::client_async_with_config(request, io, None).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            tracing::debug!(error = %e, "websocket handshake failed");
            port.deliver(WsEvent::Open(Err(ws_code(&e))));
            return;
        }
    };
    port.deliver(WsEvent::Open(Ok(())));

    loop {
        tokio::select! {
            out = rx.recv() => match out {
                None => {
                    let _ = ws.close(None).await;
                    break;
                }
                Some(msg) => {
                    if let Err(e) = ws.send(msg).await {
                        port.deliver(WsEvent::Send(Err(ws_code(&e))));
                        port.deliver(WsEvent::Error(ws_code(&e)));
                        break;
                    }
                    port.deliver(WsEvent::Send(Ok(())));
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    port.deliver(WsEvent::Text { text, fin: true });
                }
                Some(Ok(Message::Binary(data))) => {
                    port.deliver(WsEvent::Binary { data: Bytes::from(data), fin: true });
                }
                Some(Ok(Message::Close(_))) | None => {
                    port.deliver(WsEvent::Error(KmError::Closed));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    port.deliver(WsEvent::Error(ws_code(&e)));
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use kmapi_core::{Binding, EndpointError, StaticTrustStore, WsState};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response,
    };

    fn binding() -> Binding {
        let engine = Arc::new(TokioEngine::new(
            tokio::runtime::Handle::current(),
            EngineSettings::default(),
        ));
        Binding::with_engine(engine, Box::new(StaticTrustStore::default()))
    }

    /// Accept one client, report its Origin header, echo every data frame.
    async fn echo_server(listener: TcpListener, origin: mpsc::UnboundedSender<Option<String>>) {
        let (stream, _) = listener.accept().await.unwrap();
        let check = |req: &ServerRequest, resp: Response| -> Result<Response, ErrorResponse> {
            let o = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = origin.send(o);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, check).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_text() || msg.is_binary() {
                ws.send(msg).await.unwrap();
            }
        }
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Open(bool),
        Text(String, bool),
        Binary(Vec<u8>, bool),
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echo_text_and_binary() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (otx, mut orx) = mpsc::unbounded_channel();
        tokio::spawn(echo_server(listener, otx));

        let binding = binding();
        let mut ws = kmapi_core::WebSocket::with_binding(&binding, HTTP_1_1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, b, c) = (tx.clone(), tx.clone(), tx);
        ws.on_open(move |s| {
            let _ = a.send(Seen::Open(s.is_ok()));
        })
        .on_text(move |t, fin| {
            let _ = b.send(Seen::Text(t.to_string(), fin));
        })
        .on_binary(move |d, fin| {
            let _ = c.send(Seen::Binary(d.to_vec(), fin));
        });

        ws.set_origin("http://origin.test").unwrap();
        ws.open(&format!("ws://{addr}/echo")).unwrap();
        assert_eq!(orx.recv().await.unwrap().as_deref(), Some("http://origin.test"));
        assert_eq!(rx.recv().await.unwrap(), Seen::Open(true));
        assert_eq!(ws.state(), WsState::Open);

        assert_eq!(ws.send("hi").unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap(), Seen::Text("hi".into(), true));
        assert_eq!(ws.send(&[1u8, 2, 3]).unwrap(), 3);
        assert_eq!(rx.recv().await.unwrap(), Seen::Binary(vec![1, 2, 3], true));

        assert!(ws.close());
        assert_eq!(ws.state(), WsState::Closed);
    }

    #[tokio::test]
    async fn non_websocket_scheme_is_rejected() {
        let binding = binding();
        let mut ws = kmapi_core::WebSocket::with_binding(&binding, HTTP_1_1);
        assert_eq!(
            ws.open("http://127.0.0.1:1/"),
            Err(EndpointError::Engine(KmError::InvalidProto))
        );
        assert_eq!(ws.state(), WsState::Failed);
        assert_eq!(ws.send("x"), Err(EndpointError::Engine(KmError::InvalidState)));
    }

    #[test]
    fn closed_connection_maps_to_closed() {
        assert_eq!(ws_code(&WsError::ConnectionClosed), KmError::Closed);
        let io = WsError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert_eq!(ws_code(&io), KmError::Timeout);
    }
}
