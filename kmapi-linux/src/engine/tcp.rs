//! TCP handles: dial, optional TLS (on connect or upgraded later), then one read/command loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kmapi_core::{
    EngineResult, Handle, KmError, Payload, SslFlags, SslRole, TcpEngine, TcpEvent, TcpSocket,
    UpcallPort,
};
use rustls::{ClientConfig, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket as RawSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{io_code, tls, BoxIo, TokioEngine};

pub(super) struct TcpEntry {
    port: UpcallPort<TcpSocket>,
    flags: SslFlags,
    server_name: Option<String>,
    bind: Option<SocketAddr>,
    /// Dialed host, for SNI on a later client handshake.
    host: Option<String>,
    cmd: Option<mpsc::UnboundedSender<Cmd>>,
    task: Option<JoinHandle<()>>,
}

enum Cmd {
    Send(Bytes),
    Upgrade(Upgrade),
    Pause,
    Resume,
}

enum Upgrade {
    Client(Arc<ClientConfig>, rustls::pki_types::ServerName<'static>),
    Server(Arc<ServerConfig>),
}

struct Dial {
    host: String,
    port: u16,
    timeout: Duration,
    bind: Option<SocketAddr>,
    tls: Option<Upgrade>,
    read_buffer: usize,
}

impl TokioEngine {
    fn with_tcp<T>(&self, h: Handle, f: impl FnOnce(&mut TcpEntry) -> EngineResult<T>) -> EngineResult<T> {
        let mut table = self.tcp.lock();
        let entry = table.get_mut(&h).ok_or(KmError::NotExist)?;
        f(entry)
    }

    fn tcp_command(&self, h: Handle, cmd: Cmd) -> EngineResult {
        self.with_tcp(h, |e| {
            let tx = e.cmd.as_ref().ok_or(KmError::InvalidState)?;
            tx.send(cmd).map_err(|_| KmError::Closed)
        })
    }
}

impl TcpEngine for TokioEngine {
    fn create(&self, port: UpcallPort<TcpSocket>) -> EngineResult<Handle> {
        let h = self.allocate()?;
        self.tcp.lock().insert(
            h,
            TcpEntry {
                port,
                flags: SslFlags::NONE,
                server_name: None,
                bind: None,
                host: None,
                cmd: None,
                task: None,
            },
        );
        Ok(h)
    }

    fn set_ssl_flags(&self, h: Handle, flags: SslFlags) -> EngineResult {
        self.with_tcp(h, |e| {
            if e.cmd.is_some() {
                return Err(KmError::InvalidState);
            }
            e.flags = flags;
            Ok(())
        })
    }

    fn set_ssl_server_name(&self, h: Handle, name: &str) -> EngineResult {
        self.with_tcp(h, |e| {
            e.server_name = Some(name.to_string());
            Ok(())
        })
    }

    fn bind(&self, h: Handle, host: &str, port: u16) -> EngineResult {
        let ip = host.parse::<IpAddr>().map_err(|_| KmError::InvalidParam)?;
        self.with_tcp(h, |e| {
            if e.cmd.is_some() {
                return Err(KmError::InvalidState);
            }
            e.bind = Some(SocketAddr::new(ip, port));
            Ok(())
        })
    }

    fn connect(&self, h: Handle, host: &str, port: u16, timeout_ms: u32) -> EngineResult {
        if host.is_empty() {
            return Err(KmError::InvalidParam);
        }
        let roots = self.roots();
        let read_buffer = self.settings.read_buffer_size;
        let timeout = match timeout_ms {
            0 => self.settings.connect_timeout,
            ms => Duration::from_millis(u64::from(ms)),
        };
        let mut table = self.tcp.lock();
        let entry = table.get_mut(&h).ok_or(KmError::NotExist)?;
        if entry.cmd.is_some() {
            return Err(KmError::InvalidState);
        }
        let tls = if entry.flags.contains(SslFlags::ENABLE) {
            let config = tls::client_config(roots, entry.flags)?;
            let name = tls::server_name(entry.server_name.as_deref(), host)?;
            Some(Upgrade::Client(Arc::new(config), name))
        } else {
            None
        };
        let dial = Dial {
            host: host.to_string(),
            port,
            timeout,
            bind: entry.bind,
            tls,
            read_buffer,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        entry.host = Some(host.to_string());
        entry.cmd = Some(tx);
        entry.task = Some(self.rt.spawn(run(entry.port.clone(), dial, rx)));
        Ok(())
    }

    fn start_ssl_handshake(&self, h: Handle, role: SslRole) -> EngineResult {
        let upgrade = match role {
            SslRole::Server => Upgrade::Server(Arc::new(tls::server_config(&self.settings)?)),
            SslRole::Client => {
                let roots = self.roots();
                self.with_tcp(h, |e| {
                    let host = e.host.as_deref().ok_or(KmError::InvalidState)?;
                    let name = tls::server_name(e.server_name.as_deref(), host)?;
                    let config = tls::client_config(roots, e.flags)?;
                    Ok(Upgrade::Client(Arc::new(config), name))
                })?
            }
        };
        self.tcp_command(h, Cmd::Upgrade(upgrade))
    }

    fn send(&self, h: Handle, payload: Payload<'_>) -> EngineResult<usize> {
        let len = payload.len();
        self.tcp_command(h, Cmd::Send(payload.to_bytes()))?;
        Ok(len)
    }

    fn pause(&self, h: Handle) -> EngineResult {
        self.tcp_command(h, Cmd::Pause)
    }

    fn resume(&self, h: Handle) -> EngineResult {
        self.tcp_command(h, Cmd::Resume)
    }

    fn close(&self, h: Handle) {
        if let Some(e) = self.tcp.lock().get_mut(&h) {
            e.cmd = None;
            if let Some(task) = e.task.take() {
                task.abort();
            }
        }
    }

    fn destroy(&self, h: Handle) {
        self.tcp.lock().remove(&h);
    }
}

async fn dial(d: &Dial) -> std::io::Result<TcpStream> {
    let mut last = None;
    for addr in lookup_host((d.host.as_str(), d.port)).await? {
        let socket = if addr.is_ipv4() {
            RawSocket::new_v4()?
        } else {
            RawSocket::new_v6()?
        };
        if let Some(local) = d.bind {
            if local.is_ipv4() != addr.is_ipv4() {
                continue;
            }
            socket.bind(local)?;
        }
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no usable address")
    }))
}

async fn upgrade(io: BoxIo, how: Upgrade) -> std::io::Result<BoxIo> {
    let io: BoxIo = match how {
        Upgrade::Client(config, name) => Box::new(TlsConnector::from(config).connect(name, io).await?),
        Upgrade::Server(config) => Box::new(TlsAcceptor::from(config).accept(io).await?),
    };
    Ok(io)
}

async fn run(port: UpcallPort<TcpSocket>, d: Dial, mut rx: mpsc::UnboundedReceiver<Cmd>) {
    let stream = match tokio::time::timeout(d.timeout, dial(&d)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            tracing::debug!(host = %d.host, port = d.port, error = %e, "tcp connect failed");
            port.deliver(TcpEvent::Connect(Err(io_code(&e))));
            return;
        }
        Err(_) => {
            port.deliver(TcpEvent::Connect(Err(KmError::Timeout)));
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    let mut io: BoxIo = Box::new(stream);
    if let Some(how) = d.tls {
        io = match upgrade(io, how).await {
            Ok(io) => io,
            Err(e) => {
                tracing::debug!(host = %d.host, error = %e, "tls on connect failed");
                port.deliver(TcpEvent::Connect(Err(KmError::SslError)));
                return;
            }
        };
    }
    port.deliver(TcpEvent::Connect(Ok(())));

    let mut buf = vec![0u8; d.read_buffer];
    let mut paused = false;
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                None => break,
                Some(Cmd::Send(data)) => {
                    let res = io.write_all(&data).await;
                    match res {
                        Ok(()) => {
                            port.deliver(TcpEvent::Send(Ok(())));
                        }
                        Err(e) => {
                            port.deliver(TcpEvent::Send(Err(io_code(&e))));
                            port.deliver(TcpEvent::Error(io_code(&e)));
                            break;
                        }
                    }
                }
                Some(Cmd::Upgrade(how)) => {
                    io = match upgrade(io, how).await {
                        Ok(io) => io,
                        Err(e) => {
                            tracing::debug!(error = %e, "tls handshake failed");
                            port.deliver(TcpEvent::SslHandshake(Err(KmError::SslError)));
                            // The failed handshake consumed the stream.
                            return;
                        }
                    };
                    port.deliver(TcpEvent::SslHandshake(Ok(())));
                }
                Some(Cmd::Pause) => paused = true,
                Some(Cmd::Resume) => paused = false,
            },
            n = io.read(&mut buf), if !paused => match n {
                Ok(0) => {
                    port.deliver(TcpEvent::Error(KmError::Closed));
                    break;
                }
                Ok(n) => {
                    port.deliver(TcpEvent::Data(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(e) => {
                    port.deliver(TcpEvent::Error(io_code(&e)));
                    break;
                }
            },
        }
    }
    let _ = io.shutdown().await;
}
