//! Headless SI host: listens for peers and polls each configured port the way
//! the bus dispatcher would, reading the cycle counter off the wall clock.

use std::thread;
use std::time::{Duration, Instant};

use gba_link_core::joybus::{
    CMD_READ, CMD_RESET, CMD_STATUS, CMD_WRITE, MAX_PORTS, PACKET_SIZE, sync_interval,
};
use gba_link_core::{ConnectionRegistry, GbaLinkDevice, LinkError, LinkEvent, SiDevice};
use log::{debug, info, warn};

use crate::link_config::CliConfig;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Commands issued after the initial reset, round-robin.
const SCRIPT: [u8; 3] = [CMD_STATUS, CMD_READ, CMD_WRITE];

struct PortDriver {
    device: GbaLinkDevice,
    next_poll: u64,
    step: usize,
    written: u32,
}

impl PortDriver {
    fn next_command(&mut self) -> [u8; PACKET_SIZE] {
        let cmd = match self.step {
            0 => CMD_RESET,
            n => SCRIPT[(n - 1) % SCRIPT.len()],
        };
        let mut packet = [cmd, 0, 0, 0, 0];
        if cmd == CMD_WRITE {
            self.written = self.written.wrapping_add(1);
            packet[1..].copy_from_slice(&self.written.to_le_bytes());
        }
        packet
    }

    fn poll(&mut self, now: u64, frame: u64) {
        let mut buffer = if self.device.is_awaiting_response() {
            [0; PACKET_SIZE]
        } else {
            self.next_command()
        };

        match self.device.run_buffer(&mut buffer, now) {
            1 => self.next_poll = now + self.device.transfer_interval(),
            0 => self.next_poll = now + (self.device.transfer_interval() / 8).max(1),
            _ => {
                debug!(
                    "SI port {}: reply to 0x{:02X}: {:02X?}",
                    self.device.port(),
                    self.device.session().last_command(),
                    buffer
                );
                self.step += 1;
                self.next_poll = now + frame;
            }
        }
    }
}

pub fn run(config: &CliConfig, seconds: Option<u64>) -> Result<(), LinkError> {
    let mut registry = ConnectionRegistry::new(config.link.clone());
    let events = registry.events();
    registry.start()?;

    let mut ports: Vec<u8> = config
        .ports
        .iter()
        .copied()
        .filter(|&p| (p as usize) < MAX_PORTS)
        .collect();
    ports.sort_unstable();
    ports.dedup();
    if ports.is_empty() {
        warn!("No valid SI ports configured; only accepting connections");
    }

    let mut drivers = Vec::with_capacity(ports.len());
    for port in ports {
        drivers.push(PortDriver {
            device: GbaLinkDevice::new(&registry, port)?,
            next_poll: 0,
            step: 0,
            written: 0,
        });
    }

    let tps = config.link.ticks_per_second;
    let frame = sync_interval(tps);
    let started = Instant::now();
    let deadline = seconds.map(|s| started + Duration::from_secs(s));
    let mut last_connected = usize::MAX;

    loop {
        let wall = Instant::now();
        if deadline.is_some_and(|d| wall >= d) {
            break;
        }
        let now = cycles_since(started, wall, tps);

        for driver in &mut drivers {
            if now >= driver.next_poll {
                driver.poll(now, frame);
            }
        }

        for event in events.try_iter() {
            log_event(&event);
        }

        let connected = registry.connected_count();
        if connected != last_connected {
            info!("{connected} peer(s) connected");
            last_connected = connected;
        }

        thread::sleep(IDLE_SLEEP);
    }

    drop(drivers);
    registry.shutdown();
    for event in events.try_iter() {
        log_event(&event);
    }
    Ok(())
}

fn cycles_since(started: Instant, now: Instant, ticks_per_second: u64) -> u64 {
    let nanos = now.duration_since(started).as_nanos();
    let cycles = nanos * u128::from(ticks_per_second) / 1_000_000_000;
    u64::try_from(cycles).unwrap_or(u64::MAX)
}

fn log_event(event: &LinkEvent) {
    match event {
        LinkEvent::Listening { data, clock } => {
            info!("Listening for peers: data {data}, clock {clock}")
        }
        LinkEvent::PeerAttached { port, channel } => {
            info!("SI port {port}: {channel} channel attached")
        }
        LinkEvent::PeerDetached { port, channel } => {
            info!("SI port {port}: {channel} channel detached")
        }
        LinkEvent::HandshakeRejected { addr, reason } => {
            warn!("Rejected connection from {addr}: {reason}")
        }
        LinkEvent::Stopped => info!("Listeners stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gba_link_core::LinkConfig;

    #[test]
    fn wall_clock_maps_to_cycles() {
        let started = Instant::now();
        let later = started + Duration::from_millis(500);
        assert_eq!(cycles_since(started, later, 486_000_000), 243_000_000);
        assert_eq!(cycles_since(started, started, 486_000_000), 0);
    }

    #[test]
    fn driver_starts_with_reset_then_cycles_script() {
        let registry = ConnectionRegistry::new(LinkConfig::default());
        let mut driver = PortDriver {
            device: GbaLinkDevice::new(&registry, 0).expect("create device"),
            next_poll: 0,
            step: 0,
            written: 0,
        };
        let frame = sync_interval(registry.config().ticks_per_second);

        let mut issued = Vec::new();
        let mut now = 0;
        for _ in 0..5 {
            driver.poll(now, frame);
            issued.push(driver.device.session().last_command());
            now = driver.next_poll;
            driver.poll(now, frame);
            now = driver.next_poll;
        }
        assert_eq!(issued, vec![CMD_RESET, CMD_STATUS, CMD_READ, CMD_WRITE, CMD_STATUS]);
        assert_eq!(driver.written, 1);
    }
}
