//! SI device that forwards bus traffic over a [`LinkSession`].
//!
//! A poll either issues a new command (the first 5 bytes of the bus buffer)
//! or collects the answer to the outstanding one. The bus is never stalled:
//! a peer that stays silent past the command's transfer interval, or drops
//! the connection, is answered from the fallback table instead.

use log::{debug, warn};

use crate::error::{LinkError, StateError};
use crate::joybus::{PACKET_SIZE, Packet};
use crate::registry::ConnectionRegistry;
use crate::session::{LinkSession, ReceiveStatus};
use crate::si::SiDevice;
use crate::state::{CursorMode, StateCursor};

pub struct GbaLinkDevice {
    session: LinkSession,
    pending_command: Packet,
    bytes_received: u32,
    command_sent_at: u64,
    awaiting_response: bool,
}

impl GbaLinkDevice {
    /// Claims `port` on `registry` and wraps its session.
    pub fn new(registry: &ConnectionRegistry, port: u8) -> Result<Self, LinkError> {
        Ok(Self::with_session(registry.session(port)?))
    }

    pub fn with_session(session: LinkSession) -> Self {
        Self {
            session,
            pending_command: [0; PACKET_SIZE],
            bytes_received: 0,
            command_sent_at: 0,
            awaiting_response: false,
        }
    }

    pub fn port(&self) -> u8 {
        self.session.port()
    }

    pub fn session(&self) -> &LinkSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut LinkSession {
        &mut self.session
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    /// Outstanding command while awaiting a response, otherwise the last
    /// delivered response.
    pub fn pending_command(&self) -> &Packet {
        &self.pending_command
    }

    pub fn bytes_received(&self) -> u32 {
        self.bytes_received
    }

    pub fn command_sent_at(&self) -> u64 {
        self.command_sent_at
    }

    fn issue_command(&mut self, buffer: &[u8], now: u64) {
        let len = buffer.len().min(PACKET_SIZE);
        self.pending_command = [0; PACKET_SIZE];
        self.pending_command[..len].copy_from_slice(&buffer[..len]);

        // A failed send has already dropped the connection; the response
        // comes from the fallback table on the next poll.
        if let Err(e) = self.session.send(&self.pending_command, now) {
            warn!(
                "GBA link {}: command 0x{:02X} not delivered: {e}",
                self.port(),
                self.pending_command[0]
            );
        }

        self.command_sent_at = now;
        self.bytes_received = 0;
        self.awaiting_response = true;
    }

    /// Always reports a full packet. A bus buffer shorter than that only
    /// receives the leading bytes of the reply.
    fn complete(&mut self, buffer: &mut [u8]) -> usize {
        let len = buffer.len().min(PACKET_SIZE);
        buffer[..len].copy_from_slice(&self.pending_command[..len]);
        self.bytes_received = PACKET_SIZE as u32;
        self.awaiting_response = false;
        PACKET_SIZE
    }

    fn complete_with_fallback(&mut self, buffer: &mut [u8]) -> usize {
        self.session.create_fake_response(&mut self.pending_command);
        self.complete(buffer)
    }
}

impl SiDevice for GbaLinkDevice {
    fn run_buffer(&mut self, buffer: &mut [u8], now: u64) -> usize {
        self.session.clock_sync(now);

        if !self.awaiting_response {
            self.issue_command(buffer, now);
            return 1;
        }

        let mut response = [0u8; PACKET_SIZE];
        match self.session.receive(&mut response) {
            ReceiveStatus::Ready => {
                self.pending_command = response;
                self.complete(buffer)
            }
            ReceiveStatus::Pending => {
                let elapsed = now.saturating_sub(self.command_sent_at);
                if elapsed < self.transfer_interval() {
                    return 0;
                }
                debug!(
                    "GBA link {}: no response to 0x{:02X} after {elapsed} cycles, using fallback",
                    self.port(),
                    self.session.last_command()
                );
                self.complete_with_fallback(buffer)
            }
            ReceiveStatus::Disconnected => self.complete_with_fallback(buffer),
        }
    }

    fn transfer_interval(&self) -> u64 {
        self.session.transfer_time(self.session.last_command())
    }

    fn do_state(&mut self, cursor: &mut dyn StateCursor) -> Result<(), StateError> {
        let mut pending_command = self.pending_command;
        let mut bytes_received = self.bytes_received;
        let mut command_sent_at = self.command_sent_at;
        let mut awaiting_response = self.awaiting_response;

        cursor.do_bytes(&mut pending_command)?;
        cursor.do_u32(&mut bytes_received)?;
        cursor.do_u64(&mut command_sent_at)?;
        cursor.do_bool(&mut awaiting_response)?;

        if cursor.mode() != CursorMode::Read {
            return Ok(());
        }

        // Loads are all-or-nothing: nothing above touched the device.
        self.pending_command = pending_command;
        self.bytes_received = bytes_received;
        self.command_sent_at = command_sent_at;
        self.awaiting_response = awaiting_response;

        if awaiting_response && bytes_received < PACKET_SIZE as u32 {
            self.session
                .restore_command(pending_command[0], command_sent_at);
        }
        Ok(())
    }
}
