//! Per-port network session for a GBA link cable.
//!
//! All operations run on the emulation thread and never block: sockets are
//! non-blocking, short writes are queued and flushed on later calls, and a
//! response that has not fully arrived yet is reported as
//! [`ReceiveStatus::Pending`]. Without a data connection every receive is
//! answered from the fallback table so the bus never stalls.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::joybus::{FallbackTable, PACKET_SIZE, Packet, clock_slice, sync_interval, transfer_time};
use crate::registry::{Channels, RegistryHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// A full 5-byte response was copied out.
    Ready,
    /// Fewer than 5 bytes have arrived so far.
    Pending,
    /// The peer went away while reading; the session is now disconnected.
    Disconnected,
}

enum ReadState {
    Alive,
    Closed,
}

pub struct LinkSession {
    port: u8,
    registry: RegistryHandle,
    ticks_per_second: u64,
    fallback: FallbackTable,

    last_command: u8,
    last_command_sent_at: u64,
    last_sync_sent_at: Option<u64>,
    handshake_complete: bool,

    rx_buf: Vec<u8>,
    tx_queue: VecDeque<u8>,
    sync_queue: VecDeque<u8>,
    data_generation: u64,
    sync_generation: u64,
}

impl LinkSession {
    pub(crate) fn new(
        port: u8,
        registry: RegistryHandle,
        ticks_per_second: u64,
        fallback: FallbackTable,
    ) -> Self {
        Self {
            port,
            registry,
            ticks_per_second,
            fallback,
            last_command: 0,
            last_command_sent_at: 0,
            last_sync_sent_at: None,
            handshake_complete: false,
            rx_buf: Vec::with_capacity(PACKET_SIZE),
            tx_queue: VecDeque::new(),
            sync_queue: VecDeque::new(),
            data_generation: 0,
            sync_generation: 0,
        }
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn last_command(&self) -> u8 {
        self.last_command
    }

    pub fn last_command_sent_at(&self) -> u64 {
        self.last_command_sent_at
    }

    pub fn last_sync_sent_at(&self) -> Option<u64> {
        self.last_sync_sent_at
    }

    /// True once the peer has answered at least one command since it was
    /// installed.
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn is_connected(&self) -> bool {
        self.registry.shared.lock_port(self.port).data.is_some()
    }

    pub fn is_clock_connected(&self) -> bool {
        self.registry.shared.lock_port(self.port).sync.is_some()
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }

    /// Transfer interval for `cmd` given how many peers currently share the
    /// cable.
    pub fn transfer_time(&self, cmd: u8) -> u64 {
        transfer_time(cmd, self.ticks_per_second, self.registry.connected_count())
    }

    /// Closes both channels and forgets in-flight bytes. The last command
    /// byte survives so fallback output stays tied to it.
    pub fn disconnect(&mut self) {
        let closed = self.registry.shared.release(self.port);
        self.handshake_complete = false;
        self.last_sync_sent_at = None;
        self.rx_buf.clear();
        self.tx_queue.clear();
        self.sync_queue.clear();
        if closed {
            info!("GBA link {}: disconnected", self.port);
        }
    }

    /// Sends the elapsed cycle slice to the peer, at most once per frame.
    ///
    /// Returns whether a message was queued. Failing to write only drops the
    /// clock channel; the data channel is left alone.
    pub fn clock_sync(&mut self, now: u64) -> bool {
        let shared = Arc::clone(&self.registry.shared);
        let mut channels = shared.lock_port(self.port);
        self.observe_channels(&channels);

        let Some(stream) = channels.sync.as_mut() else {
            return false;
        };

        let interval = sync_interval(self.ticks_per_second);
        let elapsed = match self.last_sync_sent_at {
            None => interval,
            Some(last) if now.saturating_sub(last) >= interval => now - last,
            Some(_) => return false,
        };

        // A peer that stopped draining the clock channel gets no new slices
        // until the previous one is out.
        let mut queued = false;
        if self.sync_queue.is_empty() {
            let slice = clock_slice(elapsed, self.ticks_per_second);
            self.sync_queue.extend(slice.to_be_bytes());
            self.last_sync_sent_at = Some(now);
            queued = true;
            trace!("GBA link {}: clock slice {slice}", self.port);
        }

        if let Err(e) = flush_send_queue(stream, &mut self.sync_queue) {
            warn!("GBA link {}: clock write error: {e}", self.port);
            shared.release_sync(&mut channels, self.port);
            self.sync_queue.clear();
            self.last_sync_sent_at = None;
            return false;
        }
        queued
    }

    /// Transmits one command packet.
    ///
    /// The command byte and timestamp are recorded even when offline. A
    /// broken connection is torn down and reported to the caller.
    pub fn send(&mut self, packet: &Packet, now: u64) -> Result<(), LinkError> {
        self.last_command = packet[0];
        self.last_command_sent_at = now;

        let shared = Arc::clone(&self.registry.shared);
        let mut channels = shared.lock_port(self.port);
        self.observe_channels(&channels);

        let Some(stream) = channels.data.as_mut() else {
            trace!(
                "GBA link {}: offline, command 0x{:02X} not transmitted",
                self.port, packet[0]
            );
            return Ok(());
        };

        let stale = discard_stale(stream, &mut self.rx_buf);
        if stale > 0 {
            debug!(
                "GBA link {}: dropped {stale} stale byte(s) before command 0x{:02X}",
                self.port, packet[0]
            );
        }

        self.tx_queue.extend(packet.iter().copied());
        match flush_send_queue(stream, &mut self.tx_queue) {
            Ok(()) => {
                debug!(
                    "GBA link {}: sent {:02X?} at cycle {now}",
                    self.port, packet
                );
                Ok(())
            }
            Err(e) => {
                warn!("GBA link {}: write error: {e}", self.port);
                drop(channels);
                self.disconnect();
                Err(LinkError::Transport(e))
            }
        }
    }

    /// Polls for the response to the last command.
    pub fn receive(&mut self, out: &mut Packet) -> ReceiveStatus {
        let shared = Arc::clone(&self.registry.shared);
        let mut channels = shared.lock_port(self.port);
        self.observe_channels(&channels);

        let Some(stream) = channels.data.as_mut() else {
            drop(channels);
            self.create_fake_response(out);
            return ReceiveStatus::Ready;
        };

        let polled = flush_send_queue(stream, &mut self.tx_queue)
            .and_then(|()| poll_stream_read(stream, &mut self.rx_buf));
        match polled {
            Ok(ReadState::Alive) => {}
            Ok(ReadState::Closed) => {
                info!("GBA link {}: peer closed the connection", self.port);
                drop(channels);
                self.disconnect();
                return ReceiveStatus::Disconnected;
            }
            Err(e) => {
                warn!("GBA link {}: read error: {e}", self.port);
                drop(channels);
                self.disconnect();
                return ReceiveStatus::Disconnected;
            }
        }

        if self.rx_buf.len() < PACKET_SIZE {
            return ReceiveStatus::Pending;
        }

        out.copy_from_slice(&self.rx_buf[..PACKET_SIZE]);
        self.rx_buf.drain(..PACKET_SIZE);
        if !self.handshake_complete {
            self.handshake_complete = true;
            info!("GBA link {}: peer is responding", self.port);
        }
        trace!("GBA link {}: received {:02X?}", self.port, out);
        ReceiveStatus::Ready
    }

    /// Deterministic reply to the last command, used whenever no peer
    /// answers.
    pub fn create_fake_response(&self, out: &mut Packet) {
        *out = self.fallback.response(self.last_command);
    }

    /// Re-seeds command tracking after a save-state load. Bytes buffered for
    /// the pre-load transfer no longer belong to anything.
    pub(crate) fn restore_command(&mut self, cmd: u8, sent_at: u64) {
        self.last_command = cmd;
        self.last_command_sent_at = sent_at;
        self.rx_buf.clear();
    }

    fn observe_channels(&mut self, channels: &Channels) {
        if channels.data_generation != self.data_generation {
            self.data_generation = channels.data_generation;
            self.rx_buf.clear();
            self.tx_queue.clear();
            self.handshake_complete = false;
        }
        if channels.sync_generation != self.sync_generation {
            self.sync_generation = channels.sync_generation;
            self.sync_queue.clear();
            self.last_sync_sent_at = None;
        }
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.disconnect();
        self.registry.shared.unclaim(self.port);
    }
}

fn flush_send_queue(stream: &mut TcpStream, tx_queue: &mut VecDeque<u8>) -> io::Result<()> {
    while !tx_queue.is_empty() {
        let (front, _) = tx_queue.as_slices();
        match stream.write(front) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket closed while writing",
                ));
            }
            Ok(written) => {
                tx_queue.drain(..written);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads until a full packet is buffered or the socket runs dry. Never reads
/// past the current packet.
fn poll_stream_read(stream: &mut TcpStream, rx_buf: &mut Vec<u8>) -> io::Result<ReadState> {
    let mut temp = [0u8; PACKET_SIZE];
    while rx_buf.len() < PACKET_SIZE {
        let want = PACKET_SIZE - rx_buf.len();
        match stream.read(&mut temp[..want]) {
            Ok(0) => return Ok(ReadState::Closed),
            Ok(n) => rx_buf.extend_from_slice(&temp[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadState::Alive),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadState::Alive)
}

/// Drops leftovers of an abandoned transfer. Errors are left for the next
/// receive to report.
fn discard_stale(stream: &mut TcpStream, rx_buf: &mut Vec<u8>) -> usize {
    let mut discarded = rx_buf.len();
    rx_buf.clear();

    let mut temp = [0u8; 64];
    loop {
        match stream.read(&mut temp) {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    discarded
}
