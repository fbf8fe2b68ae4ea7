//! Save-state cursor.
//!
//! One `do_state` routine per component serves saving, loading and sizing:
//! the cursor either copies field bytes out, overwrites them from the stream,
//! or only counts them. Scalars are little-endian, booleans one byte.

use crate::error::StateError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorMode {
    Read,
    Write,
    Measure,
}

pub trait StateCursor {
    fn mode(&self) -> CursorMode;

    /// In read mode `bytes` is overwritten from the stream; otherwise it is
    /// appended (or counted) and left untouched.
    fn do_bytes(&mut self, bytes: &mut [u8]) -> Result<(), StateError>;

    fn do_u8(&mut self, value: &mut u8) -> Result<(), StateError> {
        let mut buf = [*value];
        self.do_bytes(&mut buf)?;
        *value = buf[0];
        Ok(())
    }

    fn do_u32(&mut self, value: &mut u32) -> Result<(), StateError> {
        let mut buf = value.to_le_bytes();
        self.do_bytes(&mut buf)?;
        *value = u32::from_le_bytes(buf);
        Ok(())
    }

    fn do_u64(&mut self, value: &mut u64) -> Result<(), StateError> {
        let mut buf = value.to_le_bytes();
        self.do_bytes(&mut buf)?;
        *value = u64::from_le_bytes(buf);
        Ok(())
    }

    fn do_bool(&mut self, value: &mut bool) -> Result<(), StateError> {
        let mut buf = [u8::from(*value)];
        self.do_bytes(&mut buf)?;
        *value = buf[0] != 0;
        Ok(())
    }
}

/// In-memory [`StateCursor`] over a byte buffer.
pub enum ByteCursor<'a> {
    Reader { data: &'a [u8], pos: usize },
    Writer { out: &'a mut Vec<u8> },
    Measure { len: usize },
}

impl<'a> ByteCursor<'a> {
    pub fn reader(data: &'a [u8]) -> Self {
        Self::Reader { data, pos: 0 }
    }

    pub fn writer(out: &'a mut Vec<u8>) -> Self {
        Self::Writer { out }
    }

    pub fn measure() -> Self {
        Self::Measure { len: 0 }
    }

    /// Bytes consumed (read), produced (write) or counted (measure) so far.
    pub fn position(&self) -> usize {
        match self {
            Self::Reader { pos, .. } => *pos,
            Self::Writer { out } => out.len(),
            Self::Measure { len } => *len,
        }
    }
}

impl StateCursor for ByteCursor<'_> {
    fn mode(&self) -> CursorMode {
        match self {
            Self::Reader { .. } => CursorMode::Read,
            Self::Writer { .. } => CursorMode::Write,
            Self::Measure { .. } => CursorMode::Measure,
        }
    }

    fn do_bytes(&mut self, bytes: &mut [u8]) -> Result<(), StateError> {
        match self {
            Self::Reader { data, pos } => {
                let available = data.len().saturating_sub(*pos);
                if bytes.len() > available {
                    return Err(StateError::Truncated {
                        offset: *pos,
                        needed: bytes.len(),
                        available,
                    });
                }
                bytes.copy_from_slice(&data[*pos..*pos + bytes.len()]);
                *pos += bytes.len();
            }
            Self::Writer { out } => out.extend_from_slice(bytes),
            Self::Measure { len } => *len += bytes.len(),
        }
        Ok(())
    }
}
