use crate::error::StateError;
use crate::state::StateCursor;

/// A device plugged into one SI port, as seen by the bus dispatcher.
///
/// `now` is the host cycle counter; every timing decision a device makes is
/// relative to it, so the dispatcher must pass a monotonic value.
pub trait SiDevice: Send {
    /// Exchanges one poll's worth of bytes with the device. Returns the length
    /// of the reply (0 while the device is still busy). Only as much of the
    /// reply as fits is copied into `buffer`.
    fn run_buffer(&mut self, buffer: &mut [u8], now: u64) -> usize;

    /// Cycles the dispatcher should wait before polling again.
    fn transfer_interval(&self) -> u64;

    /// Controller-style input words. Devices without a controller report
    /// `None`.
    fn get_data(&mut self) -> Option<(u32, u32)> {
        None
    }

    fn send_command(&mut self, _command: u32, _poll: u8) {}

    fn do_state(&mut self, cursor: &mut dyn StateCursor) -> Result<(), StateError>;
}
