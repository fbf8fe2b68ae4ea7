//! Scripted stand-in for a GBA on the far end of the cable.
//!
//! Answers JOY bus commands from a tiny register model and tallies the clock
//! slices the host sends, which is enough to exercise a host end to end.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use gba_link_core::LinkError;
use gba_link_core::joybus::{
    CMD_READ, CMD_RESET, CMD_STATUS, CMD_WRITE, GBA_CLOCK_HZ, PACKET_SIZE, Packet,
};
use gba_link_core::registry::{HANDSHAKE_SIZE, handshake_bytes, parse_handshake};
use log::{debug, info, warn};

use crate::link_config::CliConfig;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// JOYSTAT: the console has written JOY_RECV.
const JOYSTAT_RECV: u8 = 0x02;
/// JOYSTAT: JOY_TRANS holds a word the console has not read yet.
const JOYSTAT_SEND: u8 = 0x08;

#[derive(Default)]
struct JoyRegisters {
    joystat: u8,
    recv: u32,
    trans: u32,
}

impl JoyRegisters {
    fn respond(&mut self, command: &Packet) -> Packet {
        match command[0] {
            CMD_RESET => {
                *self = Self {
                    trans: self.trans,
                    ..Self::default()
                };
                [0x00, 0x04, self.joystat, 0, 0]
            }
            CMD_STATUS => [0x00, 0x04, self.joystat, 0, 0],
            CMD_READ => {
                let word = self.trans.to_le_bytes();
                // Queue the next word so every read sees fresh data.
                self.trans = self.trans.wrapping_add(1);
                self.joystat |= JOYSTAT_SEND;
                [word[0], word[1], word[2], word[3], self.joystat]
            }
            CMD_WRITE => {
                self.recv = u32::from_le_bytes([command[1], command[2], command[3], command[4]]);
                self.joystat |= JOYSTAT_RECV;
                [self.joystat, 0, 0, 0, 0]
            }
            _ => [0; PACKET_SIZE],
        }
    }
}

pub fn run(config: &CliConfig, port: u8, seconds: Option<u64>) -> Result<(), LinkError> {
    let data_addr = resolve(&config.host, config.link.data_port)?;
    let clock_addr = resolve(&config.host, config.link.clock_port)?;

    let mut data = connect(data_addr, port)?;
    info!("Peer {port}: data channel connected to {data_addr}");

    let (slice_tx, slice_rx) = cb::unbounded::<u32>();
    match connect(clock_addr, port) {
        Ok(clock) => {
            info!("Peer {port}: clock channel connected to {clock_addr}");
            thread::Builder::new()
                .name("GBA peer clock".to_string())
                .spawn(move || read_clock(clock, slice_tx))
                .map_err(LinkError::Spawn)?;
        }
        Err(e) => warn!("Peer {port}: running without clock sync: {e}"),
    }

    data.set_read_timeout(Some(READ_TIMEOUT))?;
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut regs = JoyRegisters::default();
    let mut command = [0u8; PACKET_SIZE];
    let mut filled = 0;
    let mut handheld_cycles: u64 = 0;

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        for slice in slice_rx.try_iter() {
            handheld_cycles += u64::from(slice);
        }

        match data.read(&mut command[filled..]) {
            Ok(0) => {
                info!("Peer {port}: host closed the connection");
                break;
            }
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
        if filled < PACKET_SIZE {
            continue;
        }
        filled = 0;

        let reply = regs.respond(&command);
        debug!(
            "Peer {port}: {:02X?} -> {:02X?} ({:.2}s of handheld time)",
            command,
            reply,
            handheld_cycles as f64 / GBA_CLOCK_HZ as f64
        );
        data.write_all(&reply)?;
    }

    info!(
        "Peer {port}: done, last word from host 0x{:08X}, {handheld_cycles} handheld cycles",
        regs.recv
    );
    Ok(())
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, LinkError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| LinkError::Transport(io::Error::other(format!("cannot resolve {host}"))))
}

fn connect(addr: SocketAddr, port: u8) -> Result<TcpStream, LinkError> {
    let mut stream = TcpStream::connect(addr)?;
    let _ = stream.set_nodelay(true);
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.write_all(&handshake_bytes(port))?;

    let mut ack = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut ack)?;
    if parse_handshake(&ack)? != port {
        return Err(LinkError::Handshake(format!(
            "host acknowledged port {} instead of {port}",
            ack[3]
        )));
    }
    Ok(stream)
}

fn read_clock(mut clock: TcpStream, slices: cb::Sender<u32>) {
    if clock.set_read_timeout(None).is_err() {
        return;
    }
    let mut buf = [0u8; 4];
    while clock.read_exact(&mut buf).is_ok() {
        if slices.send(u32::from_be_bytes(buf)).is_err() {
            break;
        }
    }
    debug!("Peer clock channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_gba_device_id() {
        let mut regs = JoyRegisters::default();
        assert_eq!(regs.respond(&[CMD_STATUS, 0, 0, 0, 0]), [0x00, 0x04, 0, 0, 0]);
    }

    #[test]
    fn write_latches_word_and_sets_receive_flag() {
        let mut regs = JoyRegisters::default();
        let reply = regs.respond(&[CMD_WRITE, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(regs.recv, 0x1234_5678);
        assert_eq!(reply[0] & JOYSTAT_RECV, JOYSTAT_RECV);

        let reset = regs.respond(&[CMD_RESET, 0, 0, 0, 0]);
        assert_eq!(reset, [0x00, 0x04, 0, 0, 0]);
    }

    #[test]
    fn reads_return_successive_words() {
        let mut regs = JoyRegisters::default();
        let first = regs.respond(&[CMD_READ, 0, 0, 0, 0]);
        let second = regs.respond(&[CMD_READ, 0, 0, 0, 0]);
        assert_eq!(first[..4], 0u32.to_le_bytes());
        assert_eq!(second[..4], 1u32.to_le_bytes());
        assert_eq!(second[4] & JOYSTAT_SEND, JOYSTAT_SEND);
    }

    #[test]
    fn peer_handshake_against_live_registry() {
        use gba_link_core::{ConnectionRegistry, LinkConfig};

        let mut registry = ConnectionRegistry::new(LinkConfig::loopback_ephemeral());
        registry.start().expect("start registry");
        let addr = registry.data_addr().expect("data addr");

        let stream = connect(addr, 2).expect("peer connects");
        assert_eq!(registry.connected_count(), 1);
        drop(stream);
        registry.shutdown();
    }
}
