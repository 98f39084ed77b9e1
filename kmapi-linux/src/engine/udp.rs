//! UDP handles: a bound tokio socket plus one task that receives datagrams and drains the
//! send queue. Destinations given by name are resolved on that task.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use kmapi_core::{
    EngineResult, Handle, KmError, Payload, UdpEngine, UdpEvent, UdpFlags, UdpSocket, UpcallPort,
};
use tokio::net::UdpSocket as RawSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{io_code, TokioEngine};

const MAX_DATAGRAM: usize = 64 * 1024;

struct Datagram {
    payload: Bytes,
    host: String,
    port: u16,
}

pub(super) struct UdpEntry {
    port: UpcallPort<UdpSocket>,
    /// Kept beside the task for multicast membership changes.
    socket: Option<Arc<RawSocket>>,
    out: Option<mpsc::UnboundedSender<Datagram>>,
    /// Recorded by `connect`; sends always name their destination.
    peer: Option<(String, u16)>,
    task: Option<JoinHandle<()>>,
}

fn literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

fn unspecified(like: IpAddr) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

impl TokioEngine {
    /// Bind the entry's socket and start its task.
    fn udp_open(&self, e: &mut UdpEntry, local: SocketAddr, flags: UdpFlags) -> EngineResult<Arc<RawSocket>> {
        if e.socket.is_some() {
            return Err(KmError::InvalidState);
        }
        let std_sock = std::net::UdpSocket::bind(local).map_err(|e| io_code(&e))?;
        std_sock.set_nonblocking(true).map_err(|e| io_code(&e))?;
        let socket = {
            let _rt = self.rt.enter();
            Arc::new(RawSocket::from_std(std_sock).map_err(|e| io_code(&e))?)
        };
        if local.is_ipv4() {
            socket
                .set_multicast_loop_v4(flags.contains(UdpFlags::MULTICAST_LOOP))
                .map_err(|e| io_code(&e))?;
        } else {
            socket
                .set_multicast_loop_v6(flags.contains(UdpFlags::MULTICAST_LOOP))
                .map_err(|e| io_code(&e))?;
        }
        tracing::debug!(local = ?socket.local_addr().ok(), "udp socket bound");
        let (tx, rx) = mpsc::unbounded_channel();
        e.task = Some(self.rt.spawn(run(e.port.clone(), socket.clone(), rx)));
        e.out = Some(tx);
        e.socket = Some(socket.clone());
        Ok(socket)
    }
}

impl UdpEngine for TokioEngine {
    fn create(&self, port: UpcallPort<UdpSocket>) -> EngineResult<Handle> {
        let h = self.allocate()?;
        self.udp.lock().insert(
            h,
            UdpEntry {
                port,
                socket: None,
                out: None,
                peer: None,
                task: None,
            },
        );
        Ok(h)
    }

    /// `host` must be a literal address.
    fn bind(&self, h: Handle, host: &str, port: u16, flags: UdpFlags) -> EngineResult {
        let ip = literal(host).ok_or(KmError::InvalidParam)?;
        let mut table = self.udp.lock();
        let e = table.get_mut(&h).ok_or(KmError::NotExist)?;
        self.udp_open(e, SocketAddr::new(ip, port), flags).map(|_| ())
    }

    fn connect(&self, h: Handle, host: &str, port: u16) -> EngineResult {
        if host.is_empty() {
            return Err(KmError::InvalidParam);
        }
        let mut table = self.udp.lock();
        let e = table.get_mut(&h).ok_or(KmError::NotExist)?;
        e.peer = Some((host.to_string(), port));
        Ok(())
    }

    /// Queues the datagram. An unbound handle binds an ephemeral socket in the family of a
    /// literal destination, IPv4 for names. Send failures arrive as error events.
    fn send(&self, h: Handle, payload: Payload<'_>, host: &str, port: u16) -> EngineResult<usize> {
        if host.is_empty() {
            return Err(KmError::InvalidParam);
        }
        let mut table = self.udp.lock();
        let e = table.get_mut(&h).ok_or(KmError::NotExist)?;
        if e.socket.is_none() {
            let family = literal(host).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            self.udp_open(e, SocketAddr::new(unspecified(family), 0), UdpFlags::NONE)?;
        }
        let out = e.out.as_ref().ok_or(KmError::InvalidState)?;
        let len = payload.len();
        out.send(Datagram {
            payload: payload.to_bytes(),
            host: host.to_string(),
            port,
        })
        .map_err(|_| KmError::Closed)?;
        Ok(len)
    }

    fn mcast_join(&self, h: Handle, addr: &str, port: u16) -> EngineResult {
        let group: IpAddr = addr.parse().map_err(|_| KmError::InvalidParam)?;
        let mut table = self.udp.lock();
        let e = table.get_mut(&h).ok_or(KmError::NotExist)?;
        let socket = match &e.socket {
            Some(s) => s.clone(),
            None => self.udp_open(e, SocketAddr::new(unspecified(group), port), UdpFlags::NONE)?,
        };
        let joined = match group {
            IpAddr::V4(g) => socket.join_multicast_v4(g, Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(g) => socket.join_multicast_v6(&g, 0),
        };
        joined.map_err(|e| io_code(&e))
    }

    fn mcast_leave(&self, h: Handle, addr: &str, _port: u16) -> EngineResult {
        let group: IpAddr = addr.parse().map_err(|_| KmError::InvalidParam)?;
        let table = self.udp.lock();
        let e = table.get(&h).ok_or(KmError::NotExist)?;
        let socket = e.socket.as_ref().ok_or(KmError::InvalidState)?;
        let left = match group {
            IpAddr::V4(g) => socket.leave_multicast_v4(g, Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(g) => socket.leave_multicast_v6(&g, 0),
        };
        left.map_err(|e| io_code(&e))
    }

    fn close(&self, h: Handle) {
        if let Some(e) = self.udp.lock().get_mut(&h) {
            e.out = None;
            if let Some(task) = e.task.take() {
                task.abort();
            }
            e.socket = None;
        }
    }

    fn destroy(&self, h: Handle) {
        self.udp.lock().remove(&h);
    }
}

/// First address for `host` in the socket's family. Names go through the system resolver.
async fn destination(local: SocketAddr, host: &str, port: u16) -> Result<SocketAddr, KmError> {
    if let Some(ip) = literal(host) {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
        tracing::debug!(host, error = %e, "udp destination did not resolve");
        KmError::InvalidParam
    })?;
    addrs
        .find(|a| a.is_ipv4() == local.is_ipv4())
        .ok_or(KmError::NotExist)
}

async fn transmit(socket: &RawSocket, d: Datagram) -> Result<(), KmError> {
    let local = socket.local_addr().map_err(|e| io_code(&e))?;
    let to = destination(local, &d.host, d.port).await?;
    socket.send_to(&d.payload, to).await.map_err(|e| io_code(&e))?;
    Ok(())
}

async fn run(
    port: UpcallPort<UdpSocket>,
    socket: Arc<RawSocket>,
    mut rx: mpsc::UnboundedReceiver<Datagram>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            d = rx.recv() => match d {
                None => break,
                Some(d) => {
                    if let Err(code) = transmit(&socket, d).await {
                        port.deliver(UdpEvent::Error(code));
                    }
                }
            },
            r = socket.recv_from(&mut buf) => match r {
                Ok((n, from)) => {
                    port.deliver(UdpEvent::Data {
                        payload: Bytes::copy_from_slice(&buf[..n]),
                        host: from.ip().to_string(),
                        port: from.port(),
                    });
                }
                Err(e) => {
                    port.deliver(UdpEvent::Error(io_code(&e)));
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
    use kmapi_core::{Binding, StaticTrustStore, UdpState};

    fn binding() -> Binding {
        let engine = Arc::new(TokioEngine::new(
            tokio::runtime::Handle::current(),
            EngineSettings::default(),
        ));
        Binding::with_engine(engine, Box::new(StaticTrustStore::default()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn datagram_round_trip() {
        let peer = RawSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            peer.send_to(b"pong", from).await.unwrap();
        });

        let binding = binding();
        let mut udp = kmapi_core::UdpSocket::with_binding(&binding);
        let (tx, mut rx) = mpsc::unbounded_channel();
        udp.on_data(move |d, host, port| {
            let _ = tx.send((d.to_vec(), host.to_string(), port));
        });
        udp.bind("127.0.0.1", 0, UdpFlags::NONE).unwrap();
        assert_eq!(udp.send("ping", "127.0.0.1", peer_addr.port()).unwrap(), 4);

        let (data, host, port) = rx.recv().await.unwrap();
        assert_eq!(data, b"pong");
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, peer_addr.port());
        assert_eq!(udp.state(), UdpState::Active);
        assert!(udp.close());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_send_on_fresh_socket_goes_out() {
        let peer = RawSocket::bind("127.0.0.1:0").await.unwrap();

        let binding = binding();
        let mut udp = kmapi_core::UdpSocket::with_binding(&binding);
        assert_eq!(udp.send("one", "127.0.0.1", peer.local_addr().unwrap().port()).unwrap(), 3);
        udp.send("two", "127.0.0.1", peer.local_addr().unwrap().port()).unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_ignores_connected_peer() {
        let a = RawSocket::bind("127.0.0.1:0").await.unwrap();
        let b = RawSocket::bind("127.0.0.1:0").await.unwrap();

        let binding = binding();
        let mut udp = kmapi_core::UdpSocket::with_binding(&binding);
        udp.connect("127.0.0.1", a.local_addr().unwrap().port()).unwrap();
        udp.send(&b"to-b"[..], "127.0.0.1", b.local_addr().unwrap().port())
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"to-b");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn named_destination_resolves_off_the_caller() {
        let peer = RawSocket::bind("127.0.0.1:0").await.unwrap();

        let binding = binding();
        let mut udp = kmapi_core::UdpSocket::with_binding(&binding);
        udp.bind("127.0.0.1", 0, UdpFlags::NONE).unwrap();
        udp.send("hi", "localhost", peer.local_addr().unwrap().port()).unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unresolvable_destination_reports_error_event() {
        let binding = binding();
        let mut udp = kmapi_core::UdpSocket::with_binding(&binding);
        let (tx, mut rx) = mpsc::unbounded_channel();
        udp.on_error(move |e| {
            let _ = tx.send(e);
        });
        udp.bind("127.0.0.1", 0, UdpFlags::NONE).unwrap();
        assert_eq!(udp.send("x", "nowhere.invalid", 9).unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), KmError::InvalidParam);
        assert_eq!(udp.state(), UdpState::Failed);
    }

    #[tokio::test]
    async fn bind_needs_a_literal_address() {
        let binding = binding();
        let mut udp = kmapi_core::UdpSocket::with_binding(&binding);
        assert_eq!(
            udp.bind("localhost", 0, UdpFlags::NONE),
            Err(kmapi_core::EndpointError::Engine(KmError::InvalidParam))
        );
    }

    #[tokio::test]
    async fn leave_without_socket_is_invalid_state() {
        let binding = binding();
        let mut udp = kmapi_core::UdpSocket::with_binding(&binding);
        udp.connect("127.0.0.1", 9).unwrap();
        assert!(udp.mcast_leave("239.1.2.3", 5000).is_err());
        assert!(udp.mcast_join("not-an-ip", 5000).is_err());
    }
}
