//! Listener side of the link: accepts peer connections and installs them
//! into per-port slots that the link sessions poll.
//!
//! A peer opens one connection to the data listener and one to the clock
//! listener. Each connection starts with a 4-byte handshake, `'G' 'B' 'A'`
//! followed by the SI port number, which the registry echoes back once the
//! socket has been installed.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::joybus::MAX_PORTS;
use crate::session::LinkSession;

pub const HANDSHAKE_MAGIC: [u8; 3] = *b"GBA";
pub const HANDSHAKE_SIZE: usize = 4;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(1);
const EVENT_QUEUE_DEPTH: usize = 64;

pub fn handshake_bytes(port: u8) -> [u8; HANDSHAKE_SIZE] {
    [HANDSHAKE_MAGIC[0], HANDSHAKE_MAGIC[1], HANDSHAKE_MAGIC[2], port]
}

pub fn parse_handshake(bytes: &[u8; HANDSHAKE_SIZE]) -> Result<u8, LinkError> {
    if bytes[..3] != HANDSHAKE_MAGIC {
        return Err(LinkError::Handshake(format!(
            "bad magic {:02X} {:02X} {:02X}",
            bytes[0], bytes[1], bytes[2]
        )));
    }
    let port = bytes[3];
    if port as usize >= MAX_PORTS {
        return Err(LinkError::InvalidPort(port));
    }
    Ok(port)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkChannel {
    Data,
    Sync,
}

impl fmt::Display for LinkChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => f.write_str("data"),
            Self::Sync => f.write_str("clock"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Listening { data: SocketAddr, clock: SocketAddr },
    PeerAttached { port: u8, channel: LinkChannel },
    PeerDetached { port: u8, channel: LinkChannel },
    HandshakeRejected { addr: SocketAddr, reason: String },
    Stopped,
}

/// Sockets currently installed for one port.
///
/// The generation counters move every time a socket is installed so a
/// session can tell a fresh connection from the one it was already using.
#[derive(Default)]
pub(crate) struct Channels {
    pub(crate) data: Option<TcpStream>,
    pub(crate) sync: Option<TcpStream>,
    pub(crate) data_generation: u64,
    pub(crate) sync_generation: u64,
}

pub(crate) struct Shared {
    ports: [Mutex<Channels>; MAX_PORTS],
    claimed: [AtomicBool; MAX_PORTS],
    connected: AtomicUsize,
    running: AtomicBool,
    event_tx: cb::Sender<LinkEvent>,
}

impl Shared {
    fn new(event_tx: cb::Sender<LinkEvent>) -> Self {
        Self {
            ports: std::array::from_fn(|_| Mutex::new(Channels::default())),
            claimed: std::array::from_fn(|_| AtomicBool::new(false)),
            connected: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            event_tx,
        }
    }

    pub(crate) fn lock_port(&self, port: u8) -> MutexGuard<'_, Channels> {
        self.ports[port as usize]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        let _ = self.event_tx.try_send(event);
    }

    /// Places `stream` into `port`'s slot. When `ack` is given it is written
    /// while the slot lock is held, so the peer always sees the ack before
    /// any command the session sends on the new socket.
    fn install(
        &self,
        port: u8,
        channel: LinkChannel,
        mut stream: TcpStream,
        ack: Option<([u8; HANDSHAKE_SIZE], Duration)>,
    ) -> Result<(), LinkError> {
        if port as usize >= MAX_PORTS {
            return Err(LinkError::InvalidPort(port));
        }

        {
            let mut channels = self.lock_port(port);
            if let Some((bytes, timeout)) = ack {
                stream.set_nonblocking(false)?;
                stream.set_write_timeout(Some(timeout))?;
                stream.write_all(&bytes)?;
                stream.set_write_timeout(None)?;
            }
            stream.set_nonblocking(true)?;
            let _ = stream.set_nodelay(true);

            match channel {
                LinkChannel::Data => {
                    channels.data_generation = channels.data_generation.wrapping_add(1);
                    match channels.data.replace(stream) {
                        Some(old) => {
                            let _ = old.shutdown(Shutdown::Both);
                            info!("GBA link {port}: replaced data connection");
                        }
                        None => {
                            self.connected.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                }
                LinkChannel::Sync => {
                    channels.sync_generation = channels.sync_generation.wrapping_add(1);
                    if let Some(old) = channels.sync.replace(stream) {
                        let _ = old.shutdown(Shutdown::Both);
                        info!("GBA link {port}: replaced clock connection");
                    }
                }
            }
        }

        self.emit(LinkEvent::PeerAttached { port, channel });
        Ok(())
    }

    /// Closes both channels of `port`. Returns whether anything was open.
    pub(crate) fn release(&self, port: u8) -> bool {
        let (had_data, had_sync) = {
            let mut channels = self.lock_port(port);
            let had_data = match channels.data.take() {
                Some(stream) => {
                    let _ = stream.shutdown(Shutdown::Both);
                    self.connected.fetch_sub(1, Ordering::AcqRel);
                    true
                }
                None => false,
            };
            let had_sync = match channels.sync.take() {
                Some(stream) => {
                    let _ = stream.shutdown(Shutdown::Both);
                    true
                }
                None => false,
            };
            (had_data, had_sync)
        };

        if had_data {
            self.emit(LinkEvent::PeerDetached {
                port,
                channel: LinkChannel::Data,
            });
        }
        if had_sync {
            self.emit(LinkEvent::PeerDetached {
                port,
                channel: LinkChannel::Sync,
            });
        }
        had_data || had_sync
    }

    pub(crate) fn release_sync(&self, channels: &mut Channels, port: u8) {
        if let Some(stream) = channels.sync.take() {
            let _ = stream.shutdown(Shutdown::Both);
            self.emit(LinkEvent::PeerDetached {
                port,
                channel: LinkChannel::Sync,
            });
        }
    }

    fn claim(&self, port: u8) -> bool {
        self.claimed[port as usize]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn unclaim(&self, port: u8) {
        self.claimed[port as usize].store(false, Ordering::Release);
    }
}

/// Cheap handle onto the registry's shared state, carried by each session.
#[derive(Clone)]
pub struct RegistryHandle {
    pub(crate) shared: Arc<Shared>,
}

impl RegistryHandle {
    pub fn connected_count(&self) -> usize {
        self.shared.connected.load(Ordering::Acquire).min(MAX_PORTS)
    }
}

pub struct ConnectionRegistry {
    config: LinkConfig,
    shared: Arc<Shared>,
    events: cb::Receiver<LinkEvent>,
    accept_thread: Option<JoinHandle<()>>,
    local_addrs: Option<(SocketAddr, SocketAddr)>,
}

impl ConnectionRegistry {
    /// Creates a stopped registry. Sessions can be handed out right away;
    /// they stay on the fallback path until a peer is installed.
    pub fn new(config: LinkConfig) -> Self {
        let (event_tx, events) = cb::bounded(EVENT_QUEUE_DEPTH);
        Self {
            config,
            shared: Arc::new(Shared::new(event_tx)),
            events,
            accept_thread: None,
            local_addrs: None,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Binds both listeners and spawns the accept thread. A registry that is
    /// already running is left untouched.
    pub fn start(&mut self) -> Result<(), LinkError> {
        if self.accept_thread.is_some() {
            return Ok(());
        }

        let data = bind_listener(self.config.data_addr(), "data")?;
        let clock = bind_listener(self.config.clock_addr(), "clock")?;
        let data_addr = data.local_addr()?;
        let clock_addr = clock.local_addr()?;

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handshake_timeout = self.config.handshake_timeout();
        let spawned = thread::Builder::new()
            .name("GBA link acceptor".to_string())
            .spawn(move || accept_loop(shared, data, clock, handshake_timeout));

        match spawned {
            Ok(handle) => {
                info!("GBA link: listening for data on {data_addr}, clock on {clock_addr}");
                self.accept_thread = Some(handle);
                self.local_addrs = Some((data_addr, clock_addr));
                self.shared.emit(LinkEvent::Listening {
                    data: data_addr,
                    clock: clock_addr,
                });
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(LinkError::Spawn(e))
            }
        }
    }

    /// Stops the accept thread and closes the listeners. Installed sessions
    /// keep their sockets. Safe to call when never started.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let Some(handle) = self.accept_thread.take() else {
            return;
        };
        if handle.join().is_err() {
            warn!("GBA link: accept thread panicked");
        }
        self.local_addrs = None;
        info!("GBA link: listeners closed");
        self.shared.emit(LinkEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.accept_thread.is_some()
    }

    pub fn connected_count(&self) -> usize {
        self.handle().connected_count()
    }

    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Local address of the data listener while running.
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.map(|(data, _)| data)
    }

    /// Local address of the clock listener while running.
    pub fn clock_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.map(|(_, clock)| clock)
    }

    pub fn events(&self) -> cb::Receiver<LinkEvent> {
        self.events.clone()
    }

    /// Creates the session for `port`. Each port can only have one live
    /// session; the claim is released when the session is dropped.
    pub fn session(&self, port: u8) -> Result<LinkSession, LinkError> {
        if port as usize >= MAX_PORTS {
            return Err(LinkError::InvalidPort(port));
        }
        if !self.shared.claim(port) {
            return Err(LinkError::PortInUse(port));
        }
        Ok(LinkSession::new(
            port,
            self.handle(),
            self.config.ticks_per_second,
            self.config.fallback,
        ))
    }

    /// Installs an already-established socket as `port`'s `channel`,
    /// bypassing the listeners and the handshake.
    pub fn attach(&self, port: u8, channel: LinkChannel, stream: TcpStream) -> Result<(), LinkError> {
        self.shared.install(port, channel, stream, None)
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_listener(addr: SocketAddr, what: &'static str) -> Result<TcpListener, LinkError> {
    let bind_err = move |source: io::Error| LinkError::Bind { what, addr, source };

    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(MAX_PORTS as i32).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    Ok(socket.into())
}

/// Accepted connection that has not finished its handshake yet.
struct PendingPeer {
    stream: TcpStream,
    addr: SocketAddr,
    channel: LinkChannel,
    hello: [u8; HANDSHAKE_SIZE],
    filled: usize,
    deadline: Instant,
}

enum HandshakePoll {
    Waiting,
    Done(u8),
    Failed(String),
}

impl PendingPeer {
    fn poll(&mut self, now: Instant) -> HandshakePoll {
        while self.filled < HANDSHAKE_SIZE {
            match self.stream.read(&mut self.hello[self.filled..]) {
                Ok(0) => return HandshakePoll::Failed("closed during handshake".to_string()),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if now >= self.deadline {
                        return HandshakePoll::Failed("handshake timed out".to_string());
                    }
                    return HandshakePoll::Waiting;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return HandshakePoll::Failed(e.to_string()),
            }
        }
        match parse_handshake(&self.hello) {
            Ok(port) => HandshakePoll::Done(port),
            Err(e) => HandshakePoll::Failed(e.to_string()),
        }
    }
}

fn accept_loop(
    shared: Arc<Shared>,
    data: TcpListener,
    clock: TcpListener,
    handshake_timeout: Duration,
) {
    let mut pending: Vec<PendingPeer> = Vec::new();

    while shared.running.load(Ordering::Acquire) {
        let mut idle = true;
        for (listener, channel) in [(&data, LinkChannel::Data), (&clock, LinkChannel::Sync)] {
            match listener.accept() {
                Ok((stream, addr)) => {
                    idle = false;
                    // Handshakes are polled alongside accept.
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("GBA link: dropping {channel} connection from {addr}: {e}");
                        continue;
                    }
                    pending.push(PendingPeer {
                        stream,
                        addr,
                        channel,
                        hello: [0; HANDSHAKE_SIZE],
                        filled: 0,
                        deadline: Instant::now() + handshake_timeout,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => warn!("GBA link: {channel} listener accept error: {e}"),
            }
        }

        let now = Instant::now();
        let mut i = 0;
        while i < pending.len() {
            match pending[i].poll(now) {
                HandshakePoll::Waiting => i += 1,
                HandshakePoll::Done(port) => {
                    idle = false;
                    let peer = pending.swap_remove(i);
                    install_peer(&shared, peer, port, handshake_timeout);
                }
                HandshakePoll::Failed(reason) => {
                    let peer = pending.swap_remove(i);
                    warn!(
                        "GBA link: rejected {} connection from {}: {reason}",
                        peer.channel, peer.addr
                    );
                    shared.emit(LinkEvent::HandshakeRejected {
                        addr: peer.addr,
                        reason,
                    });
                }
            }
        }

        if idle {
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    }
    debug!(
        "GBA link: accept loop exiting, dropping {} unidentified connection(s)",
        pending.len()
    );
}

fn install_peer(shared: &Shared, peer: PendingPeer, port: u8, write_timeout: Duration) {
    let PendingPeer {
        stream,
        addr,
        channel,
        ..
    } = peer;
    match shared.install(port, channel, stream, Some((handshake_bytes(port), write_timeout))) {
        Ok(()) => info!("GBA link {port}: {channel} connection from {addr}"),
        Err(e) => {
            warn!("GBA link {port}: failed to install {channel} connection from {addr}: {e}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_peer(addr: SocketAddr, port: u8) -> TcpStream {
        let mut peer = TcpStream::connect(addr).expect("connect peer");
        peer.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set peer timeout");
        peer.write_all(&handshake_bytes(port)).expect("send handshake");
        let mut ack = [0u8; HANDSHAKE_SIZE];
        peer.read_exact(&mut ack).expect("read handshake ack");
        assert_eq!(ack, handshake_bytes(port));
        peer
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn shutdown_without_start_is_a_no_op() {
        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        registry.shutdown();
        registry.shutdown();
        assert!(!registry.is_running());
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn start_then_shutdown_joins_accept_thread() {
        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        registry.start().expect("start registry");
        assert!(registry.is_running());
        assert!(registry.data_addr().is_some());
        registry.start().expect("second start is a no-op");
        registry.shutdown();
        assert!(!registry.is_running());
        assert!(registry.data_addr().is_none());
    }

    #[test]
    fn bind_failure_leaves_registry_stopped() {
        let occupied = TcpListener::bind("127.0.0.1:0").expect("bind blocker");
        let port = occupied.local_addr().expect("blocker addr").port();
        let mut config = LinkConfig::loopback_ephemeral();
        config.data_port = port;

        let mut registry = ConnectionRegistry::new(config);
        let err = registry.start();
        // Address reuse may allow the bind on some platforms; only a
        // reported failure is checked here.
        if let Err(err) = err {
            assert!(matches!(err, LinkError::Bind { what: "data", .. }));
            assert!(!registry.is_running());
        }
    }

    #[test]
    fn handshake_installs_data_channel_and_counts_it() {
        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        registry.start().expect("start registry");
        let addr = registry.data_addr().expect("data addr");

        let _peer = connect_peer(addr, 2);
        assert_eq!(registry.connected_count(), 1);

        let mut session = registry.session(2).expect("claim port 2");
        assert!(session.is_connected());
        session.disconnect();
        assert_eq!(registry.connected_count(), 0);
        registry.shutdown();
    }

    #[test]
    fn clock_channel_does_not_count_as_connected() {
        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        registry.start().expect("start registry");
        let addr = registry.clock_addr().expect("clock addr");

        let _peer = connect_peer(addr, 0);
        assert_eq!(registry.connected_count(), 0);
        registry.shutdown();
    }

    #[test]
    fn invalid_handshake_is_rejected() {
        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        let events = registry.events();
        registry.start().expect("start registry");
        let addr = registry.data_addr().expect("data addr");

        let mut peer = TcpStream::connect(addr).expect("connect peer");
        peer.write_all(&handshake_bytes(7)).expect("send handshake");

        let rejected = wait_for(|| {
            events
                .try_iter()
                .any(|event| matches!(event, LinkEvent::HandshakeRejected { .. }))
        });
        assert!(rejected, "expected a HandshakeRejected event");
        assert_eq!(registry.connected_count(), 0);
        registry.shutdown();
    }

    #[test]
    fn reconnecting_same_port_replaces_without_double_counting() {
        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        registry.start().expect("start registry");
        let addr = registry.data_addr().expect("data addr");

        let _first = connect_peer(addr, 1);
        let _second = connect_peer(addr, 1);
        assert_eq!(registry.connected_count(), 1);

        let _third = connect_peer(addr, 3);
        assert_eq!(registry.connected_count(), 2);
        registry.shutdown();
    }

    #[test]
    fn a_port_can_only_be_claimed_once() {
        let registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        let session = registry.session(0).expect("first claim");
        assert!(matches!(registry.session(0), Err(LinkError::PortInUse(0))));
        drop(session);
        assert!(registry.session(0).is_ok());
        assert!(matches!(registry.session(4), Err(LinkError::InvalidPort(4))));
    }

    #[test]
    fn silent_connection_does_not_stall_accept_or_shutdown() {
        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        assert!(registry.config().handshake_timeout() >= Duration::from_secs(1));
        registry.start().expect("start registry");
        let addr = registry.data_addr().expect("data addr");

        let _silent = TcpStream::connect(addr).expect("connect silent peer");
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        let _peer = connect_peer(addr, 1);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(registry.connected_count(), 1);

        let _another = TcpStream::connect(addr).expect("connect second silent peer");
        thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        registry.shutdown();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn unidentified_connection_times_out() {
        let mut config = LinkConfig::loopback_ephemeral();
        config.handshake_timeout_ms = 50;
        let mut registry = ConnectionRegistry::new(config);
        let events = registry.events();
        registry.start().expect("start registry");
        let addr = registry.clock_addr().expect("clock addr");

        let mut silent = TcpStream::connect(addr).expect("connect silent peer");
        let rejected = wait_for(|| {
            events.try_iter().any(|event| {
                matches!(event, LinkEvent::HandshakeRejected { ref reason, .. } if reason.contains("timed out"))
            })
        });
        assert!(rejected, "expected the silent peer to time out");

        silent
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("set silent timeout");
        let mut buf = [0u8; 1];
        assert!(matches!(silent.read(&mut buf), Ok(0) | Err(_)));
        registry.shutdown();
    }

    #[test]
    fn ack_reaches_peer_before_first_command() {
        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        registry.start().expect("start registry");
        let addr = registry.data_addr().expect("data addr");
        let mut session = registry.session(0).expect("claim port 0");

        for round in 0..10u8 {
            let peer = thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).expect("connect peer");
                stream
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .expect("set peer timeout");
                stream.write_all(&handshake_bytes(0)).expect("send handshake");
                let mut seen = [0u8; HANDSHAKE_SIZE + 5];
                stream.read_exact(&mut seen).expect("read ack and command");
                seen
            });

            assert!(wait_for(|| session.is_connected()), "peer never installed");
            session
                .send(&[0x15, round, 0, 0, 0], 0)
                .expect("send right after install");

            let seen = peer.join().expect("peer thread");
            assert_eq!(seen[..HANDSHAKE_SIZE], handshake_bytes(0));
            assert_eq!(seen[HANDSHAKE_SIZE..], [0x15, round, 0, 0, 0]);
            session.disconnect();
        }
        registry.shutdown();
    }

    #[test]
    fn parse_handshake_validates_magic_and_port() {
        assert_eq!(parse_handshake(&handshake_bytes(3)).unwrap(), 3);
        assert!(matches!(
            parse_handshake(&[b'G', b'B', b'C', 0]),
            Err(LinkError::Handshake(_))
        ));
        assert!(matches!(
            parse_handshake(&handshake_bytes(4)),
            Err(LinkError::InvalidPort(4))
        ));
    }
}
