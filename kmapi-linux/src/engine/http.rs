//! HTTP handles over reqwest. A request with a declared body (Content-Length or chunked
//! transfer encoding) streams whatever `send` hands over; the response comes back as
//! header-complete, data chunks, then response-complete.

use std::sync::Arc;

use bytes::Bytes;
use kmapi_core::{
    EngineResult, Handle, HttpEngine, HttpEvent, HttpRequest, KmError, Payload, SslFlags,
    UpcallPort, HTTP_1_1, HTTP_2_0,
};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use reqwest::{Method, Url};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{tls, TokioEngine};

/// Response metadata, present once headers are in.
struct Meta {
    status: u16,
    headers: HeaderMap,
}

pub(super) struct HttpEntry {
    port: UpcallPort<HttpRequest>,
    version: String,
    flags: SslFlags,
    headers: HeaderMap,
    body: Option<mpsc::UnboundedSender<Bytes>>,
    /// Bytes still owed when the body length was declared.
    remaining: Option<u64>,
    meta: Arc<Mutex<Option<Meta>>>,
    task: Option<JoinHandle<()>>,
}

impl HttpEntry {
    fn stop(&mut self) {
        self.body = None;
        self.remaining = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// How the request body is framed, from the caller's headers.
enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

fn framing(headers: &HeaderMap) -> EngineResult<BodyFraming> {
    if let Some(v) = headers.get(CONTENT_LENGTH) {
        let n = v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or(KmError::InvalidParam)?;
        return Ok(if n == 0 { BodyFraming::None } else { BodyFraming::Length(n) });
    }
    let chunked = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("chunked"));
    Ok(if chunked { BodyFraming::Chunked } else { BodyFraming::None })
}

fn reqwest_code(e: &reqwest::Error) -> KmError {
    if e.is_timeout() {
        KmError::Timeout
    } else if e.is_connect() {
        KmError::SockError
    } else if e.is_builder() {
        KmError::InvalidParam
    } else if e.is_body() || e.is_decode() {
        KmError::ProtoError
    } else {
        KmError::Failed
    }
}

impl TokioEngine {
    fn with_http<T>(&self, h: Handle, f: impl FnOnce(&mut HttpEntry) -> EngineResult<T>) -> EngineResult<T> {
        let mut table = self.http.lock();
        let entry = table.get_mut(&h).ok_or(KmError::NotExist)?;
        f(entry)
    }

    fn http_client(&self, version: &str, flags: SslFlags, plain: bool) -> EngineResult<reqwest::Client> {
        let mut tls = tls::client_config(self.roots(), flags)?;
        let mut builder = reqwest::Client::builder().connect_timeout(self.settings.connect_timeout);
        if version == HTTP_2_0 {
            tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
            if plain {
                builder = builder.http2_prior_knowledge();
            }
        } else {
            tls.alpn_protocols = vec![b"http/1.1".to_vec()];
            builder = builder.http1_only();
        }
        builder.use_preconfigured_tls(tls).build().map_err(|e| {
            tracing::warn!(error = %e, "http client build failed");
            KmError::Fatal
        })
    }
}

impl HttpEngine for TokioEngine {
    fn create(&self, version: &str, port: UpcallPort<HttpRequest>) -> EngineResult<Handle> {
        if version != HTTP_1_1 && version != HTTP_2_0 {
            return Err(KmError::NotSupported);
        }
        let h = self.allocate()?;
        self.http.lock().insert(
            h,
            HttpEntry {
                port,
                version: version.to_string(),
                flags: SslFlags::NONE,
                headers: HeaderMap::new(),
                body: None,
                remaining: None,
                meta: Arc::new(Mutex::new(None)),
                task: None,
            },
        );
        Ok(h)
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        self.with_http(h, |e| {
            e.flags = flags;
            Ok(())
        })
    }

    fn add_header(&self, h: Handle, name: &str, value: &str) -> EngineResult {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| KmError::InvalidParam)?;
        let value = HeaderValue::from_str(value).map_err(|_| KmError::InvalidParam)?;
        self.with_http(h, |e| {
            e.headers.append(name, value);
            Ok(())
        })
    }

    fn send_request(&self, h: Handle, method: &str, url: &str) -> EngineResult {
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| KmError::InvalidParam)?;
        let url = Url::parse(url).map_err(|_| KmError::InvalidParam)?;
        let plain = match url.scheme() {
            "http" => true,
            "https" => false,
            _ => return Err(KmError::InvalidProto),
        };
        let mut table = self.http.lock();
        let e = table.get_mut(&h).ok_or(KmError::NotExist)?;
        if e.task.is_some() {
            return Err(KmError::InvalidState);
        }
        let flags = if plain { e.flags } else { e.flags | SslFlags::ENABLE };
        let client = self.http_client(&e.version, flags, plain)?;

        let mut headers = e.headers.clone();
        let mut request = client.request(method.clone(), url.clone());
        match framing(&headers)? {
            BodyFraming::None => {}
            framed => {
                // hyper frames a streamed body itself
                headers.remove(TRANSFER_ENCODING);
                let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
                let port = e.port.clone();
                let chunks = futures_util::stream::unfold((rx, port), |(mut rx, port)| async move {
                    let chunk = rx.recv().await?;
                    port.deliver(HttpEvent::Send(Ok(())));
                    Some((Ok::<_, std::io::Error>(chunk), (rx, port)))
                });
                request = request.body(reqwest::Body::wrap_stream(chunks));
                e.remaining = match framed {
                    BodyFraming::Length(n) => Some(n),
                    _ => None,
                };
                e.body = Some(tx);
            }
        }
        let request = request.headers(headers);

        *e.meta.lock() = None;
        tracing::debug!(handle = %h, %method, %url, version = %e.version, "http exchange started");
        e.task = Some(self.rt.spawn(exchange(e.port.clone(), e.meta.clone(), request)));
        Ok(())
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        self.with_http(h, |e| {
            let tx = e.body.as_ref().ok_or(KmError::InvalidState)?;
            let len = payload.len();
            if len == 0 {
                if e.remaining.is_none() {
                    e.body = None;
                }
                return Ok(0);
            }
            if let Some(left) = e.remaining {
                if len as u64 > left {
                    return Err(KmError::BufferTooLong);
                }
            }
            tx.send(payload.to_bytes()).map_err(|_| KmError::Closed)?;
            if let Some(left) = e.remaining.as_mut() {
                *left -= len as u64;
                if *left == 0 {
                    e.body = None;
                    e.remaining = None;
                }
            }
            Ok(len)
        })
    }

    fn reset(&self, h: Handle) {
        if let Some(e) = self.http.lock().get_mut(&h) {
            e.stop();
            *e.meta.lock() = None;
        }
    }

    fn status_code(&self, h: Handle) -> Option<u16> {
        let table = self.http.lock();
        let meta = table.get(&h)?.meta.lock();
        meta.as_ref().map(|m| m.status)
    }

    fn header_value(&self, h: Handle, name: &str) -> Option<String> {
        let table = self.http.lock();
        let meta = table.get(&h)?.meta.lock();
        let value = meta.as_ref()?.headers.get(name)?;
        value.to_str().ok().map(str::to_string)
    }

    fn close(&self, h: Handle) {
        if let Some(e) = self.http.lock().get_mut(&h) {
            e.stop();
        }
    }

    fn destroy(&self, h: Handle) {
        self.http.lock().remove(&h);
    }
}

async fn exchange(port: UpcallPort<HttpRequest>, meta: Arc<Mutex<Option<Meta>>>, request: reqwest::RequestBuilder) {
    let mut response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "http request failed");
            port.deliver(HttpEvent::Error(reqwest_code(&e)));
            return;
        }
    };
    *meta.lock() = Some(Meta {
        status: response.status().as_u16(),
        headers: response.headers().clone(),
    });
    port.deliver(HttpEvent::HeaderComplete);
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                port.deliver(HttpEvent::Data(chunk));
            }
            Ok(None) => {
                port.deliver(HttpEvent::ResponseComplete);
                break;
            }
            Err(e) => {
                port.deliver(HttpEvent::Error(reqwest_code(&e)));
                break;
            }
        }
    }
}
