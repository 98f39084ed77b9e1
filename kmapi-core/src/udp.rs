//! Datagram endpoint.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use bytes::Bytes;

use crate::binding::{self, Binding};
use crate::dispatch::{EndpointKind, ErrorCallback};
use crate::engine::Engine;
use crate::error::{KmError, Result};
use crate::handle::{Handle, HandleOwner};
use crate::payload::Payload;

/// Options for `bind`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UdpFlags(u32);

impl UdpFlags {
    pub const NONE: UdpFlags = UdpFlags(0);
    /// Deliver our own multicast datagrams back to this socket.
    pub const MULTICAST_LOOP: UdpFlags = UdpFlags(0x01);

    pub const fn from_bits(bits: u32) -> Self {
        UdpFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: UdpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for UdpFlags {
    type Output = UdpFlags;

    fn bitor(self, rhs: UdpFlags) -> UdpFlags {
        UdpFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for UdpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpFlags({:#x})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpEvent {
    /// One whole datagram and its source.
    Data { payload: Bytes, host: String, port: u16 },
    Error(KmError),
}

pub type DatagramCallback = Arc<dyn Fn(&[u8], &str, u16) + Send + Sync>;

#[derive(Clone, Default)]
pub struct UdpListeners {
    data: Option<DatagramCallback>,
    error: Option<ErrorCallback>,
}

impl UdpListeners {
    pub fn on_data(mut self, f: impl Fn(&[u8], &str, u16) + Send + Sync + 'static) -> Self {
        self.data = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(KmError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UdpState {
    #[default]
    Created,
    Bound,
    Connected,
    Active,
    Failed,
    Closed,
}

/// A UDP socket. Unlike TCP, sending may create the handle: an unbound socket
/// sends from an ephemeral port.
pub struct UdpSocket {
    owner: HandleOwner<UdpSocket>,
    default_peer: Option<(String, u16)>,
}

impl EndpointKind for UdpSocket {
    const NAME: &'static str = "udp";
    type Event = UdpEvent;
    type Listeners = UdpListeners;
    type State = UdpState;

    fn advance(_: UdpState, event: &UdpEvent) -> UdpState {
        match event {
            UdpEvent::Data { .. } => UdpState::Active,
            UdpEvent::Error(_) => UdpState::Failed,
        }
    }

    fn invoke(l: &UdpListeners, event: UdpEvent) {
        match event {
            UdpEvent::Data { payload, host, port } => {
                if let Some(f) = &l.data {
                    f(&payload, &host, port)
                }
            }
            UdpEvent::Error(e) => {
                if let Some(f) = &l.error {
                    f(e)
                }
            }
        }
    }
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpSocket {
    pub fn new() -> Self {
        Self::with_binding(binding::global())
    }

    pub fn with_binding(binding: &Binding) -> Self {
        Self {
            owner: HandleOwner::new(binding, |e, h| e.udp().close_and_destroy(h)),
            default_peer: None,
        }
    }

    pub fn set_listeners(&self, listeners: UdpListeners) -> &Self {
        self.owner.registry().replace(listeners);
        self
    }

    pub fn on_data(&self, f: impl Fn(&[u8], &str, u16) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.data = Some(Arc::new(f)));
        self
    }

    pub fn on_error(&self, f: impl Fn(KmError) + Send + Sync + 'static) -> &Self {
        self.owner.registry().register(|l| l.error = Some(Arc::new(f)));
        self
    }

    pub fn bind(&mut self, host: &str, port: u16, flags: UdpFlags) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.udp().bind(h, host, port, flags)?;
        self.owner.set_state(UdpState::Bound);
        Ok(())
    }

    /// Record a default destination. Nothing goes on the wire.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let (h, engine) = self.ensure()?;
        engine.udp().connect(h, host, port)?;
        self.default_peer = Some((host.to_string(), port));
        if matches!(self.owner.state(), UdpState::Created | UdpState::Bound) {
            self.owner.set_state(UdpState::Connected);
        }
        Ok(())
    }

    /// Send one datagram to `host:port`, whatever `connect` recorded.
    pub fn send<'a>(&mut self, payload: impl Into<Payload<'a>>, host: &str, port: u16) -> Result<usize> {
        let (h, engine) = self.ensure()?;
        let n = engine.udp().send(h, payload.into(), host, port)?;
        self.owner.set_state(UdpState::Active);
        Ok(n)
    }

    pub fn mcast_join(&mut self, addr: &str, port: u16) -> Result<()> {
        let (h, engine) = self.ensure()?;
        Ok(engine.udp().mcast_join(h, addr, port)?)
    }

    pub fn mcast_leave(&self, addr: &str, port: u16) -> Result<()> {
        let (h, engine) = self.owner.live()?;
        Ok(engine.udp().mcast_leave(h, addr, port)?)
    }

    pub fn close(&mut self) -> bool {
        let closed = self.owner.close();
        if closed {
            self.default_peer = None;
            self.owner.set_state(UdpState::Closed);
        }
        closed
    }

    /// Destination recorded by the last `connect`.
    pub fn default_peer(&self) -> Option<(&str, u16)> {
        self.default_peer.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    pub fn handle(&self) -> Option<Handle> {
        self.owner.handle()
    }

    pub fn state(&self) -> UdpState {
        self.owner.state()
    }

    fn ensure(&mut self) -> Result<(Handle, Arc<dyn Engine>)> {
        self.owner.ensure(|e, port| e.udp().create(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EndpointError;
    use crate::testing::{Call, RecordingEngine};
    use parking_lot::Mutex;

    fn socket() -> (Arc<RecordingEngine>, UdpSocket) {
        let engine = Arc::new(RecordingEngine::new());
        let binding = engine.binding();
        (engine, UdpSocket::with_binding(&binding))
    }

    #[test]
    fn explicit_destination_wins_over_connect() {
        let (engine, mut udp) = socket();
        udp.connect("10.0.0.1", 5000).unwrap();
        assert_eq!(udp.state(), UdpState::Connected);
        udp.send("ping", "10.0.0.2", 6000).unwrap();
        let h = udp.handle().unwrap();
        assert!(engine
            .calls()
            .contains(&Call::SendTo(h, b"ping".to_vec(), "10.0.0.2".into(), 6000)));
        assert_eq!(udp.default_peer(), Some(("10.0.0.1", 5000)));
    }

    #[test]
    fn datagram_carries_source() {
        let (engine, mut udp) = socket();
        let got = Arc::new(Mutex::new(Vec::new()));
        let g = got.clone();
        udp.on_data(move |d, host, port| g.lock().push((d.to_vec(), host.to_string(), port)));
        udp.bind("0.0.0.0", 0, UdpFlags::MULTICAST_LOOP).unwrap();
        engine.udp_port(udp.handle().unwrap()).deliver(UdpEvent::Data {
            payload: Bytes::from_static(b"dgram"),
            host: "192.0.2.7".into(),
            port: 4433,
        });
        assert_eq!(
            *got.lock(),
            vec![(b"dgram".to_vec(), "192.0.2.7".to_string(), 4433)]
        );
        assert_eq!(udp.state(), UdpState::Active);
    }

    #[test]
    fn multicast_membership() {
        let (engine, mut udp) = socket();
        assert_eq!(udp.mcast_leave("239.0.0.1", 5353), Err(EndpointError::NoHandle));
        udp.mcast_join("239.0.0.1", 5353).unwrap();
        udp.mcast_leave("239.0.0.1", 5353).unwrap();
        let h = udp.handle().unwrap();
        let calls = engine.calls();
        assert!(calls.contains(&Call::McastJoin(h, "239.0.0.1".into(), 5353)));
        assert!(calls.contains(&Call::McastLeave(h, "239.0.0.1".into(), 5353)));
    }

    #[test]
    fn close_clears_peer_and_suppresses_events() {
        let (engine, mut udp) = socket();
        udp.connect("10.0.0.1", 5000).unwrap();
        let port = engine.udp_port(udp.handle().unwrap());
        assert!(udp.close());
        assert!(!udp.close());
        assert!(!port.deliver(UdpEvent::Error(KmError::Closed)));
        assert_eq!(udp.default_peer(), None);
        assert_eq!(udp.state(), UdpState::Closed);
    }

    #[test]
    fn send_after_close_does_not_recreate() {
        let (engine, mut udp) = socket();
        udp.send("a", "10.0.0.1", 5000).unwrap();
        assert!(udp.close());
        assert_eq!(udp.send("b", "10.0.0.1", 5000), Err(EndpointError::NoHandle));
        assert_eq!(udp.mcast_join("239.0.0.1", 5353), Err(EndpointError::NoHandle));
        assert_eq!(engine.created("udp"), 1);
        assert_eq!(udp.state(), UdpState::Closed);
    }

    #[test]
    fn flags_compose() {
        let f = UdpFlags::NONE | UdpFlags::MULTICAST_LOOP;
        assert!(f.contains(UdpFlags::MULTICAST_LOOP));
        assert_eq!(f.bits(), 1);
    }
}
