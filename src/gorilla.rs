//! Gorilla-style compression for streams of (timestamp, value) pairs.
//!
//! Timestamps are stored as delta-of-delta with prefix-coded bit widths,
//! values as the XOR against the previous value with a reusable
//! leading/trailing-zero window. The stream carries no point count and no
//! checksum; both live in the disk partition metadata.

use crate::bitstream::{BitReader, BitWriter};
use crate::{DataPoint, Result, TidemarkError};
use std::io::{self, Read, Write};

/// Encoder for a single series stream.
pub struct GorillaEncoder<W: Write> {
    writer: W,
    buf: BitWriter,

    /// Number of points encoded into the current stream.
    num_points: u64,

    // Timestamp state.
    t: i64,
    t_delta: u64,

    // Value state.
    v: f64,
    leading: u8,
    trailing: u8,
}

impl<W: Write> GorillaEncoder<W> {
    /// Creates a new encoder writing to `writer` on flush.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: BitWriter::with_capacity(4096),
            num_points: 0,
            t: 0,
            t_delta: 0,
            v: 0.0,
            leading: 0,
            trailing: 0,
        }
    }

    /// Encodes a data point. Timestamps must be non-decreasing within a stream.
    pub fn encode_point(&mut self, point: &DataPoint) -> Result<()> {
        match self.num_points {
            0 => {
                // First point: full timestamp, value through the XOR path
                // against the zeroed initial state.
                self.write_varint(point.timestamp);
                self.write_value_delta(point.value);
                self.t = point.timestamp;
            }
            1 => {
                let delta = self.timestamp_delta(point.timestamp)?;
                self.write_uvarint(delta);
                self.write_value_delta(point.value);
                self.t_delta = delta;
                self.t = point.timestamp;
            }
            _ => {
                let delta = self.timestamp_delta(point.timestamp)?;
                let dod = delta as i64 - self.t_delta as i64;

                if dod == 0 {
                    self.buf.write_bit(false);
                } else if fits_bits(dod, 7) {
                    self.buf.write_bits(0b10, 2);
                    self.buf.write_bits(dod as u64, 7);
                } else if fits_bits(dod, 9) {
                    self.buf.write_bits(0b110, 3);
                    self.buf.write_bits(dod as u64, 9);
                } else if fits_bits(dod, 12) {
                    self.buf.write_bits(0b1110, 4);
                    self.buf.write_bits(dod as u64, 12);
                } else {
                    self.buf.write_bits(0b1111, 4);
                    self.buf.write_bits(dod as u64, 32);
                }

                self.write_value_delta(point.value);
                self.t_delta = delta;
                self.t = point.timestamp;
            }
        }

        self.v = point.value;
        self.num_points += 1;
        Ok(())
    }

    fn timestamp_delta(&self, timestamp: i64) -> Result<u64> {
        match timestamp.checked_sub(self.t) {
            Some(delta) if delta >= 0 => Ok(delta as u64),
            _ => Err(TidemarkError::Compression(format!(
                "timestamps must be non-decreasing: {} after {}",
                timestamp, self.t
            ))),
        }
    }

    fn write_value_delta(&mut self, value: f64) {
        let xor = value.to_bits() ^ self.v.to_bits();
        if xor == 0 {
            self.buf.write_bit(false);
            return;
        }
        self.buf.write_bit(true);

        // Leading-zero count is stored in 5 bits.
        let leading = (xor.leading_zeros() as u8).min(31);
        let trailing = xor.trailing_zeros() as u8;

        if leading >= self.leading && trailing >= self.trailing {
            // The previous window still covers every meaningful bit.
            self.buf.write_bit(false);
            let width = 64 - self.leading - self.trailing;
            self.buf.write_bits(xor >> self.trailing, width);
        } else {
            self.leading = leading;
            self.trailing = trailing;

            self.buf.write_bit(true);
            self.buf.write_bits(leading as u64, 5);
            let width = 64 - leading - trailing;
            // A 64-bit window is encoded as length 0.
            self.buf.write_bits((width % 64) as u64, 6);
            self.buf.write_bits(xor >> trailing, width);
        }
    }

    /// Flushes pending bits, zero-padded to a byte boundary, and resets the
    /// encoder for a new stream.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.write_all(self.buf.as_bytes())?;
        self.writer.flush()?;

        self.buf.clear();
        self.num_points = 0;
        self.t = 0;
        self.t_delta = 0;
        self.v = 0.0;
        self.leading = 0;
        self.trailing = 0;
        Ok(())
    }

    fn write_varint(&mut self, value: i64) {
        let mut buf = [0u8; 10];
        let len = encode_varint(value, &mut buf);
        for byte in &buf[..len] {
            self.buf.write_byte(*byte);
        }
    }

    fn write_uvarint(&mut self, value: u64) {
        let mut buf = [0u8; 10];
        let len = encode_uvarint(value, &mut buf);
        for byte in &buf[..len] {
            self.buf.write_byte(*byte);
        }
    }
}

/// `bitRange` predicate: does `x` fit in `nbits` two's-complement bits with
/// the asymmetric range `[-(2^(nbits-1))+1, 2^(nbits-1)]`.
fn fits_bits(x: i64, nbits: u8) -> bool {
    -((1i64 << (nbits - 1)) - 1) <= x && x <= (1i64 << (nbits - 1))
}

/// Decoder over an encoded series stream.
pub struct GorillaDecoder<'a> {
    reader: BitReader<'a>,
    num_read: u64,

    // Timestamp state.
    t: i64,
    t_delta: u64,

    // Value state.
    v: f64,
    leading: u8,
    trailing: u8,
}

impl<'a> GorillaDecoder<'a> {
    /// Creates a decoder borrowing the encoded bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            num_read: 0,
            t: 0,
            t_delta: 0,
            v: 0.0,
            leading: 0,
            trailing: 0,
        }
    }

    /// Decodes the next data point. The caller must know how many points the
    /// stream holds; reading past the end fails with `DataCorruption`.
    pub fn decode_point(&mut self) -> Result<DataPoint> {
        match self.num_read {
            0 => {
                self.t = self.read_varint()?;
                self.read_value()?;
            }
            1 => {
                self.t_delta = self.read_uvarint()?;
                self.t += self.t_delta as i64;
                self.read_value()?;
            }
            _ => {
                let mut prefix = 0u8;
                for _ in 0..4 {
                    prefix <<= 1;
                    if !self.read_bit()? {
                        break;
                    }
                    prefix |= 1;
                }

                let dod = match prefix {
                    0b0000 => 0,
                    0b0010 => self.read_signed_bits(7)?,
                    0b0110 => self.read_signed_bits(9)?,
                    0b1110 => self.read_signed_bits(12)?,
                    0b1111 => self.read_signed_bits(32)?,
                    _ => {
                        return Err(TidemarkError::DataCorruption(format!(
                            "unknown timestamp prefix: {prefix:#06b}"
                        )));
                    }
                };

                self.t_delta = (self.t_delta as i64 + dod) as u64;
                self.t += self.t_delta as i64;
                self.read_value()?;
            }
        }

        self.num_read += 1;
        Ok(DataPoint::new(self.t, self.v))
    }

    fn read_bit(&mut self) -> Result<bool> {
        self.reader.read_bit().map_err(eof_corruption)
    }

    fn read_bits(&mut self, nbits: u8) -> Result<u64> {
        self.reader.read_bits(nbits).map_err(eof_corruption)
    }

    fn read_signed_bits(&mut self, nbits: u8) -> Result<i64> {
        let bits = self.read_bits(nbits)?;
        // Asymmetric range: the all-zeros-but-sign pattern is the positive max.
        if bits > (1 << (nbits - 1)) {
            Ok(bits as i64 - (1i64 << nbits))
        } else {
            Ok(bits as i64)
        }
    }

    fn read_value(&mut self) -> Result<()> {
        if !self.read_bit()? {
            // Value unchanged.
            return Ok(());
        }

        if self.read_bit()? {
            let leading = self.read_bits(5)? as u8;
            let mut width = self.read_bits(6)? as u8;
            if width == 0 {
                width = 64;
            }
            self.trailing = 64u8.checked_sub(leading + width).ok_or_else(|| {
                TidemarkError::DataCorruption(format!(
                    "invalid XOR window: leading {leading}, width {width}"
                ))
            })?;
            self.leading = leading;
        }

        let width = 64 - self.leading - self.trailing;
        let bits = self.read_bits(width)?;
        self.v = f64::from_bits(self.v.to_bits() ^ (bits << self.trailing));
        Ok(())
    }

    fn read_varint(&mut self) -> Result<i64> {
        let uvalue = self.read_uvarint()?;
        Ok(zigzag_decode(uvalue))
    }

    fn read_uvarint(&mut self) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;

        for i in 0..10 {
            let byte = self.read_bits(8)? as u8;
            if byte & 0x80 == 0 {
                // The tenth byte may only carry the final bit of a u64.
                if i == 9 && byte > 1 {
                    return Err(uvarint_overflow());
                }
                return Ok(result | (byte as u64) << shift);
            }
            result |= ((byte & 0x7F) as u64) << shift;
            shift += 7;
        }

        Err(uvarint_overflow())
    }
}

fn eof_corruption(err: io::Error) -> TidemarkError {
    TidemarkError::DataCorruption(format!("truncated series stream: {err}"))
}

fn uvarint_overflow() -> TidemarkError {
    TidemarkError::DataCorruption("uvarint overflows 64 bits".to_string())
}

/// Encodes a signed integer as a zigzag varint, returning the byte count.
pub(crate) fn encode_varint(value: i64, buf: &mut [u8]) -> usize {
    encode_uvarint(((value << 1) ^ (value >> 63)) as u64, buf)
}

/// Encodes an unsigned integer as a varint, returning the byte count.
pub(crate) fn encode_uvarint(mut value: u64, buf: &mut [u8]) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

pub(crate) fn zigzag_decode(uvalue: u64) -> i64 {
    ((uvalue >> 1) as i64) ^ -((uvalue & 1) as i64)
}

/// Reads a varint-encoded unsigned integer from a byte reader.
pub(crate) fn read_uvarint_from<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;

    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;

        if shift >= 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "uvarint overflows 64 bits",
            ));
        }
        result |= ((byte[0] & 0x7F) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Reads a zigzag varint-encoded signed integer from a byte reader.
pub(crate) fn read_varint_from<R: Read>(reader: &mut R) -> io::Result<i64> {
    Ok(zigzag_decode(read_uvarint_from(reader)?))
}
