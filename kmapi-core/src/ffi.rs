//! C ABI for native engines written outside Rust.
//! The engine fills a `KmEngineVTable`, registers it with `kmapi_attach_engine`, and reports
//! progress through the exported `kmapi_*_on_*` upcalls using the `ctx` it got at create.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::binding::register_engine;
use crate::dispatch::{EndpointKind, UpcallPort};
use crate::engine::{Engine, EngineResult, HttpEngine, TcpEngine, UdpEngine, WsEngine};
use crate::error::KmError;
use crate::handle::Handle;
use crate::http::{HttpEvent, HttpRequest};
use crate::payload::Payload;
use crate::tcp::{TcpEvent, TcpSocket};
use crate::tls::{SslFlags, SslRole};
use crate::udp::{UdpEvent, UdpFlags, UdpSocket};
use crate::ws::{WebSocket, WsEvent};

/// Engine entry points. Handles are non-zero `u64`; a create returning 0 failed.
/// Status returns are 0 or a negative engine code; send returns bytes accepted or a negative code.
/// Strings are NUL-terminated UTF-8 and only valid for the duration of the call.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KmEngineVTable {
    pub lib_init: unsafe extern "C" fn(ca_pem: *const c_char) -> c_int,

    pub http_create: unsafe extern "C" fn(ctx: *mut c_void, version: *const c_char) -> u64,
    pub http_set_ssl_flags: unsafe extern "C" fn(h: u64, flags: u32) -> c_int,
    pub http_add_header:
        unsafe extern "C" fn(h: u64, name: *const c_char, value: *const c_char) -> c_int,
    pub http_send_request:
        unsafe extern "C" fn(h: u64, method: *const c_char, url: *const c_char) -> c_int,
    pub http_send: unsafe extern "C" fn(h: u64, data: *const u8, len: usize) -> isize,
    pub http_reset: unsafe extern "C" fn(h: u64),
    /// Status code, or <= 0 before headers are complete.
    pub http_status_code: unsafe extern "C" fn(h: u64) -> c_int,
    /// Full value length (writing at most `out_len` bytes, no NUL), or negative if absent.
    pub http_header_value: unsafe extern "C" fn(
        h: u64,
        name: *const c_char,
        out: *mut c_char,
        out_len: usize,
    ) -> isize,
    pub http_close: unsafe extern "C" fn(h: u64),
    pub http_destroy: unsafe extern "C" fn(h: u64),

    pub tcp_create: unsafe extern "C" fn(ctx: *mut c_void) -> u64,
    pub tcp_set_ssl_flags: unsafe extern "C" fn(h: u64, flags: u32) -> c_int,
    pub tcp_set_ssl_server_name: unsafe extern "C" fn(h: u64, name: *const c_char) -> c_int,
    pub tcp_bind: unsafe extern "C" fn(h: u64, host: *const c_char, port: u16) -> c_int,
    pub tcp_connect:
        unsafe extern "C" fn(h: u64, host: *const c_char, port: u16, timeout_ms: u32) -> c_int,
    pub tcp_start_ssl_handshake: unsafe extern "C" fn(h: u64, role: c_int) -> c_int,
    pub tcp_send: unsafe extern "C" fn(h: u64, data: *const u8, len: usize) -> isize,
    pub tcp_pause: unsafe extern "C" fn(h: u64) -> c_int,
    pub tcp_resume: unsafe extern "C" fn(h: u64) -> c_int,
    pub tcp_close: unsafe extern "C" fn(h: u64),
    pub tcp_destroy: unsafe extern "C" fn(h: u64),

    pub udp_create: unsafe extern "C" fn(ctx: *mut c_void) -> u64,
    pub udp_bind:
        unsafe extern "C" fn(h: u64, host: *const c_char, port: u16, flags: u32) -> c_int,
    pub udp_connect: unsafe extern "C" fn(h: u64, host: *const c_char, port: u16) -> c_int,
    pub udp_send: unsafe extern "C" fn(
        h: u64,
        data: *const u8,
        len: usize,
        host: *const c_char,
        port: u16,
    ) -> isize,
    pub udp_mcast_join: unsafe extern "C" fn(h: u64, addr: *const c_char, port: u16) -> c_int,
    pub udp_mcast_leave: unsafe extern "C" fn(h: u64, addr: *const c_char, port: u16) -> c_int,
    pub udp_close: unsafe extern "C" fn(h: u64),
    pub udp_destroy: unsafe extern "C" fn(h: u64),

    pub ws_create: unsafe extern "C" fn(ctx: *mut c_void, version: *const c_char) -> u64,
    pub ws_set_ssl_flags: unsafe extern "C" fn(h: u64, flags: u32) -> c_int,
    pub ws_set_origin: unsafe extern "C" fn(h: u64, origin: *const c_char) -> c_int,
    pub ws_set_subprotocol: unsafe extern "C" fn(h: u64, proto: *const c_char) -> c_int,
    pub ws_add_header:
        unsafe extern "C" fn(h: u64, name: *const c_char, value: *const c_char) -> c_int,
    pub ws_open: unsafe extern "C" fn(h: u64, url: *const c_char) -> c_int,
    /// `is_text` != 0 sends a text frame.
    pub ws_send: unsafe extern "C" fn(h: u64, data: *const u8, len: usize, is_text: c_int) -> isize,
    pub ws_close: unsafe extern "C" fn(h: u64),
    pub ws_destroy: unsafe extern "C" fn(h: u64),
}

/// [`Engine`] over a C function table. Owns the upcall contexts handed out at create and
/// frees each one right after the engine's destroy returns.
pub struct FfiEngine {
    vt: KmEngineVTable,
    contexts: Mutex<HashMap<u64, Box<dyn Any + Send>>>,
}

impl FfiEngine {
    pub fn new(vt: KmEngineVTable) -> Self {
        Self {
            vt,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    fn adopt<K: EndpointKind>(
        &self,
        port: UpcallPort<K>,
        create: impl FnOnce(*mut c_void) -> u64,
    ) -> EngineResult<Handle> {
        let boxed = Box::new(port);
        let ctx = &*boxed as *const UpcallPort<K> as *mut c_void;
        let h = Handle::new(create(ctx)).ok_or(KmError::Failed)?;
        self.contexts.lock().insert(h.get(), boxed);
        Ok(h)
    }

    fn release(&self, h: Handle) {
        self.contexts.lock().remove(&h.get());
    }
}

fn cstr(s: &str) -> EngineResult<CString> {
    CString::new(s).map_err(|_| KmError::InvalidParam)
}

fn written(n: isize) -> EngineResult<usize> {
    if n < 0 {
        Err(KmError::from_code(n as i32))
    } else {
        Ok(n as usize)
    }
}

impl Engine for FfiEngine {
    fn lib_init(&self, ca_certs_pem: &str) -> EngineResult {
        let pem = cstr(ca_certs_pem)?;
        KmError::check(unsafe { (self.vt.lib_init)(pem.as_ptr()) })
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

impl HttpEngine for FfiEngine {
    fn create(&self, version: &str, port: UpcallPort<HttpRequest>) -> EngineResult<Handle> {
        let version = cstr(version)?;
        self.adopt(port, |ctx| unsafe { (self.vt.http_create)(ctx, version.as_ptr()) })
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        KmError::check(unsafe { (self.vt.http_set_ssl_flags)(h.get(), flags.bits()) })
    }

    fn add_header(&self, h: Handle, name: &str, value: &str) -> EngineResult {
        let (name, value) = (cstr(name)?, cstr(value)?);
        KmError::check(unsafe { (self.vt.http_add_header)(h.get(), name.as_ptr(), value.as_ptr()) })
    }

    fn send_request(&self, h: Handle, method: &str, url: &str) -> EngineResult {
        let (method, url) = (cstr(method)?, cstr(url)?);
        KmError::check(unsafe {
            (self.vt.http_send_request)(h.get(), method.as_ptr(), url.as_ptr())
        })
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        let data = payload.as_bytes();
        written(unsafe { (self.vt.http_send)(h.get(), data.as_ptr(), data.len()) })
    }

    fn reset(&self, h: Handle) {
        unsafe { (self.vt.http_reset)(h.get()) }
    }

    fn status_code(&self, h: Handle) -> Option<u16> {
        let code = unsafe { (self.vt.http_status_code)(h.get()) };
        u16::try_from(code).ok().filter(|c| *c > 0)
    }

    fn header_value(&self, h: Handle, name: &str) -> Option<String> {
        let name = cstr(name).ok()?;
        let mut buf = vec![0u8; 256];
        loop {
            let n = unsafe {
                (self.vt.http_header_value)(
                    h.get(),
                    name.as_ptr(),
                    buf.as_mut_ptr() as *mut c_char,
                    buf.len(),
                )
            };
            let n = usize::try_from(n).ok()?;
            if n <= buf.len() {
                buf.truncate(n);
                return String::from_utf8(buf).ok();
            }
            buf.resize(n, 0);
        }
    }

    fn close(&self, h: Handle) {
        unsafe { (self.vt.http_close)(h.get()) }
    }

    fn destroy(&self, h: Handle) {
        unsafe { (self.vt.http_destroy)(h.get()) };
        self.release(h);
    }
}

impl TcpEngine for FfiEngine {
    fn create(&self, port: UpcallPort<TcpSocket>) -> EngineResult<Handle> {
        self.adopt(port, |ctx| unsafe { (self.vt.tcp_create)(ctx) })
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        KmError::check(unsafe { (self.vt.tcp_set_ssl_flags)(h.get(), flags.bits()) })
    }

    fn set_ssl_server_name(&self, h: Handle, name: &str) -> EngineResult {
        let name = cstr(name)?;
        KmError::check(unsafe { (self.vt.tcp_set_ssl_server_name)(h.get(), name.as_ptr()) })
    }

    fn bind(&self, h: Handle, host: &str, port: u16) -> EngineResult {
        let host = cstr(host)?;
        KmError::check(unsafe { (self.vt.tcp_bind)(h.get(), host.as_ptr(), port) })
    }

    fn connect(&self, h: Handle, host: &str, port: u16, timeout_ms: u32) -> EngineResult {
        let host = cstr(host)?;
        KmError::check(unsafe { (self.vt.tcp_connect)(h.get(), host.as_ptr(), port, timeout_ms) })
    }

    fn start_ssl_handshake(&self, h: Handle, role: SslRole) -> EngineResult {
        KmError::check(unsafe { (self.vt.tcp_start_ssl_handshake)(h.get(), role as c_int) })
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        let data = payload.as_bytes();
        written(unsafe { (self.vt.tcp_send)(h.get(), data.as_ptr(), data.len()) })
    }

    fn pause(&self, h: Handle) -> EngineResult {
        KmError::check(unsafe { (self.vt.tcp_pause)(h.get()) })
    }

    fn resume(&self, h: Handle) -> EngineResult {
        KmError::check(unsafe { (self.vt.tcp_resume)(h.get()) })
    }

    fn close(&self, h: Handle) {
        unsafe { (self.vt.tcp_close)(h.get()) }
    }

    fn destroy(&self, h: Handle) {
        unsafe { (self.vt.tcp_destroy)(h.get()) };
        self.release(h);
    }
}

impl UdpEngine for FfiEngine {
    fn create(&self, port: UpcallPort<UdpSocket>) -> EngineResult<Handle> {
        self.adopt(port, |ctx| unsafe { (self.vt.udp_create)(ctx) })
    }

    fn bind(&self, h: Handle, host: &str, port: u16, flags: UdpFlags) -> EngineResult {
        let host = cstr(host)?;
        KmError::check(unsafe { (self.vt.udp_bind)(h.get(), host.as_ptr(), port, flags.bits()) })
    }

    fn connect(&self, h: Handle, host: &str, port: u16) -> EngineResult {
        let host = cstr(host)?;
        KmError::check(unsafe { (self.vt.udp_connect)(h.get(), host.as_ptr(), port) })
    }

    fn send(&self, h: Handle, payload: Payload<'_>, host: &str, port: u16) -> EngineResult<usize> {
        let host = cstr(host)?;
        let data = payload.as_bytes();
        written(unsafe {
            (self.vt.udp_send)(h.get(), data.as_ptr(), data.len(), host.as_ptr(), port)
        })
    }

    fn mcast_join(&self, h: Handle, addr: &str, port: u16) -> EngineResult {
        let addr = cstr(addr)?;
        KmError::check(unsafe { (self.vt.udp_mcast_join)(h.get(), addr.as_ptr(), port) })
    }

    fn mcast_leave(&self, h: Handle, addr: &str, port: u16) -> EngineResult {
        let addr = cstr(addr)?;
        KmError::check(unsafe { (self.vt.udp_mcast_leave)(h.get(), addr.as_ptr(), port) })
    }

    fn close(&self, h: Handle) {
        unsafe { (self.vt.udp_close)(h.get()) }
    }

    fn destroy(&self, h: Handle) {
        unsafe { (self.vt.udp_destroy)(h.get()) };
        self.release(h);
    }
}

impl WsEngine for FfiEngine {
    fn create(&self, version: &str, port: UpcallPort<WebSocket>) -> EngineResult<Handle> {
        let version = cstr(version)?;
        self.adopt(port, |ctx| unsafe { (self.vt.ws_create)(ctx, version.as_ptr()) })
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        KmError::check(unsafe { (self.vt.ws_set_ssl_flags)(h.get(), flags.bits()) })
    }

    fn set_origin(&self, h: Handle, origin: &str) -> EngineResult {
        let origin = cstr(origin)?;
        KmError::check(unsafe { (self.vt.ws_set_origin)(h.get(), origin.as_ptr()) })
    }

    fn set_subprotocol(&self, h: Handle, subprotocol: &str) -> EngineResult {
        let proto = cstr(subprotocol)?;
        KmError::check(unsafe { (self.vt.ws_set_subprotocol)(h.get(), proto.as_ptr()) })
    }

    fn add_header(&self, h: Handle, name: &str, value: &str) -> EngineResult {
        let (name, value) = (cstr(name)?, cstr(value)?);
        KmError::check(unsafe { (self.vt.ws_add_header)(h.get(), name.as_ptr(), value.as_ptr()) })
    }

    fn open(&self, h: Handle, url: &str) -> EngineResult {
        let url = cstr(url)?;
        KmError::check(unsafe { (self.vt.ws_open)(h.get(), url.as_ptr()) })
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        let data = payload.as_bytes();
        let is_text = c_int::from(payload.is_text());
        written(unsafe { (self.vt.ws_send)(h.get(), data.as_ptr(), data.len(), is_text) })
    }

    fn close(&self, h: Handle) {
        unsafe { (self.vt.ws_close)(h.get()) }
    }

    fn destroy(&self, h: Handle) {
        unsafe { (self.vt.ws_destroy)(h.get()) };
        self.release(h);
    }
}

/// Register a C engine with the process-wide binding. Returns 0, or -1 if `vt` is null.
/// The table is copied; the caller may free it afterwards.
#[no_mangle]
pub unsafe extern "C" fn kmapi_attach_engine(vt: *const KmEngineVTable) -> c_int {
    if vt.is_null() {
        return -1;
    }
    let vt = *vt;
    register_engine(Arc::new(move || Ok(Arc::new(FfiEngine::new(vt)) as Arc<dyn Engine>)));
    0
}

/// Binding version as a static NUL-terminated string.
#[no_mangle]
pub extern "C" fn kmapi_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Route one upcall. Null contexts are ignored; a panicking listener is logged, not unwound into C.
unsafe fn deliver<K: EndpointKind>(ctx: *mut c_void, event: impl FnOnce() -> K::Event) {
    if ctx.is_null() {
        return;
    }
    let port = &*(ctx as *const UpcallPort<K>);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        port.deliver(event());
    }));
    if result.is_err() {
        tracing::error!(kind = K::NAME, "listener panicked during upcall");
    }
}

unsafe fn bytes(data: *const u8, len: usize) -> Bytes {
    if data.is_null() || len == 0 {
        return Bytes::new();
    }
    Bytes::copy_from_slice(slice::from_raw_parts(data, len))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_http_on_header_complete(ctx: *mut c_void) {
    deliver::<HttpRequest>(ctx, || HttpEvent::HeaderComplete)
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_http_on_send(ctx: *mut c_void, err: c_int) {
    deliver::<HttpRequest>(ctx, || HttpEvent::Send(KmError::check(err)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_http_on_data(ctx: *mut c_void, data: *const u8, len: usize) {
    deliver::<HttpRequest>(ctx, || HttpEvent::Data(bytes(data, len)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_http_on_response_complete(ctx: *mut c_void) {
    deliver::<HttpRequest>(ctx, || HttpEvent::ResponseComplete)
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_http_on_error(ctx: *mut c_void, err: c_int) {
    deliver::<HttpRequest>(ctx, || HttpEvent::Error(KmError::from_code(err)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_tcp_on_connect(ctx: *mut c_void, err: c_int) {
    deliver::<TcpSocket>(ctx, || TcpEvent::Connect(KmError::check(err)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_tcp_on_ssl_handshake(ctx: *mut c_void, err: c_int) {
    deliver::<TcpSocket>(ctx, || TcpEvent::SslHandshake(KmError::check(err)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_tcp_on_send(ctx: *mut c_void, err: c_int) {
    deliver::<TcpSocket>(ctx, || TcpEvent::Send(KmError::check(err)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_tcp_on_data(ctx: *mut c_void, data: *const u8, len: usize) {
    deliver::<TcpSocket>(ctx, || TcpEvent::Data(bytes(data, len)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_tcp_on_error(ctx: *mut c_void, err: c_int) {
    deliver::<TcpSocket>(ctx, || TcpEvent::Error(KmError::from_code(err)))
}

/// One datagram from `host:port`. `host` may be null when the engine cannot format it.
#[no_mangle]
pub unsafe extern "C" fn kmapi_udp_on_data(
    ctx: *mut c_void,
    data: *const u8,
    len: usize,
    host: *const c_char,
    port: u16,
) {
    deliver::<UdpSocket>(ctx, || {
        let host = if host.is_null() {
            String::new()
        } else {
            CStr::from_ptr(host).to_string_lossy().into_owned()
        };
        UdpEvent::Data {
            payload: bytes(data, len),
            host,
            port,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_udp_on_error(ctx: *mut c_void, err: c_int) {
    deliver::<UdpSocket>(ctx, || UdpEvent::Error(KmError::from_code(err)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_ws_on_open(ctx: *mut c_void, err: c_int) {
    deliver::<WebSocket>(ctx, || WsEvent::Open(KmError::check(err)))
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_ws_on_send(ctx: *mut c_void, err: c_int) {
    deliver::<WebSocket>(ctx, || WsEvent::Send(KmError::check(err)))
}

/// One message or fragment. Text payloads must be UTF-8; invalid sequences are replaced.
#[no_mangle]
pub unsafe extern "C" fn kmapi_ws_on_data(
    ctx: *mut c_void,
    data: *const u8,
    len: usize,
    is_text: c_int,
    fin: c_int,
) {
    deliver::<WebSocket>(ctx, || {
        let data = bytes(data, len);
        let fin = fin != 0;
        if is_text != 0 {
            WsEvent::Text {
                text: String::from_utf8_lossy(&data).into_owned(),
                fin,
            }
        } else {
            WsEvent::Binary { data, fin }
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn kmapi_ws_on_error(ctx: *mut c_void, err: c_int) {
    deliver::<WebSocket>(ctx, || WsEvent::Error(KmError::from_code(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Binding;
    use crate::error::EndpointError;
    use crate::trust::StaticTrustStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // The fake engine below keeps its state in statics; only `tcp_through_vtable` drives it.
    static LAST_CTX: AtomicUsize = AtomicUsize::new(0);
    static DESTROYED: AtomicUsize = AtomicUsize::new(0);
    static SENT: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn ok_str(_: *const c_char) -> c_int {
        0
    }
    unsafe extern "C" fn create_v(ctx: *mut c_void, _: *const c_char) -> u64 {
        LAST_CTX.store(ctx as usize, Ordering::SeqCst);
        7
    }
    unsafe extern "C" fn create(ctx: *mut c_void) -> u64 {
        LAST_CTX.store(ctx as usize, Ordering::SeqCst);
        7
    }
    unsafe extern "C" fn ok_flags(_: u64, _: u32) -> c_int {
        0
    }
    unsafe extern "C" fn ok_h_str(_: u64, _: *const c_char) -> c_int {
        0
    }
    unsafe extern "C" fn ok_h_str2(_: u64, _: *const c_char, _: *const c_char) -> c_int {
        0
    }
    unsafe extern "C" fn ok_h_str_port(_: u64, _: *const c_char, _: u16) -> c_int {
        0
    }
    unsafe extern "C" fn ok_h_str_port_u32(_: u64, _: *const c_char, _: u16, _: u32) -> c_int {
        0
    }
    unsafe extern "C" fn rejects_role(_: u64, role: c_int) -> c_int {
        if role == 1 {
            -16
        } else {
            0
        }
    }
    unsafe extern "C" fn send(_: u64, _: *const u8, len: usize) -> isize {
        SENT.fetch_add(len, Ordering::SeqCst);
        len as isize
    }
    unsafe extern "C" fn send_to(_: u64, _: *const u8, len: usize, _: *const c_char, _: u16) -> isize {
        len as isize
    }
    unsafe extern "C" fn ws_send(_: u64, _: *const u8, len: usize, _: c_int) -> isize {
        len as isize
    }
    unsafe extern "C" fn ok_h(_: u64) -> c_int {
        0
    }
    unsafe extern "C" fn noop(_: u64) {}
    unsafe extern "C" fn destroy(_: u64) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }
    unsafe extern "C" fn status(_: u64) -> c_int {
        0
    }
    unsafe extern "C" fn header(_: u64, _: *const c_char, _: *mut c_char, _: usize) -> isize {
        -1
    }

    fn vtable() -> KmEngineVTable {
        KmEngineVTable {
            lib_init: ok_str,
            http_create: create_v,
            http_set_ssl_flags: ok_flags,
            http_add_header: ok_h_str2,
            http_send_request: ok_h_str2,
            http_send: send,
            http_reset: noop,
            http_status_code: status,
            http_header_value: header,
            http_close: noop,
            http_destroy: destroy,
            tcp_create: create,
            tcp_set_ssl_flags: ok_flags,
            tcp_set_ssl_server_name: ok_h_str,
            tcp_bind: ok_h_str_port,
            tcp_connect: ok_h_str_port_u32,
            tcp_start_ssl_handshake: rejects_role,
            tcp_send: send,
            tcp_pause: ok_h,
            tcp_resume: ok_h,
            tcp_close: noop,
            tcp_destroy: destroy,
            udp_create: create,
            udp_bind: ok_h_str_port_u32,
            udp_connect: ok_h_str_port,
            udp_send: send_to,
            udp_mcast_join: ok_h_str_port,
            udp_mcast_leave: ok_h_str_port,
            udp_close: noop,
            udp_destroy: destroy,
            ws_create: create_v,
            ws_set_ssl_flags: ok_flags,
            ws_set_origin: ok_h_str,
            ws_set_subprotocol: ok_h_str,
            ws_add_header: ok_h_str2,
            ws_open: ok_h_str,
            ws_send,
            ws_close: noop,
            ws_destroy: destroy,
        }
    }

    #[test]
    fn tcp_through_vtable() {
        let binding = Binding::with_engine(
            Arc::new(FfiEngine::new(vtable())),
            Box::new(StaticTrustStore::default()),
        );
        let mut tcp = TcpSocket::with_binding(&binding);
        let connects = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let c = connects.clone();
        let r = received.clone();
        tcp.on_connect(move |s| {
            assert!(s.is_ok());
            c.fetch_add(1, Ordering::SeqCst);
        })
        .on_data(move |d| r.lock().extend_from_slice(d));

        tcp.connect("peer.test", 443, 1000).unwrap();
        assert_eq!(tcp.handle().map(Handle::get), Some(7));
        let ctx = LAST_CTX.load(Ordering::SeqCst) as *mut c_void;
        let body = b"pong";
        unsafe {
            kmapi_tcp_on_connect(ctx, 0);
            kmapi_tcp_on_data(ctx, body.as_ptr(), body.len());
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(&received.lock()[..], b"pong");

        assert_eq!(tcp.send("ping").unwrap(), 4);
        assert_eq!(SENT.load(Ordering::SeqCst), 4);
        assert_eq!(
            tcp.start_ssl_handshake(SslRole::Server),
            Err(EndpointError::Engine(KmError::SslError))
        );

        assert!(tcp.close());
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn null_context_is_ignored() {
        unsafe {
            kmapi_tcp_on_connect(std::ptr::null_mut(), 0);
            kmapi_ws_on_data(std::ptr::null_mut(), std::ptr::null(), 0, 1, 1);
        }
    }

    #[test]
    fn attach_rejects_null_table() {
        assert_eq!(unsafe { kmapi_attach_engine(std::ptr::null()) }, -1);
    }

    #[test]
    fn version_is_nul_terminated() {
        let v = unsafe { CStr::from_ptr(kmapi_version()) };
        assert_eq!(v.to_str().unwrap(), crate::VERSION);
    }

    #[test]
    fn negative_send_maps_to_error() {
        assert_eq!(written(-4), Err(KmError::Closed));
        assert_eq!(written(12), Ok(12));
    }
}
