//! Bit-level I/O shared with the SCP-ECG reader, plus the EN 1064 default
//! Huffman table for difference-coded sample streams.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitsError {
    #[error("bit stream exhausted")]
    OutOfData,
    #[error("invalid Huffman code")]
    InvalidCode,
    #[error("value {0} outside encodable range")]
    ValueOutOfRange(i64),
}

// ── Bit reader / writer ───────────────────────────────────────────────────

/// MSB-first reader over a byte slice.
pub struct BitReader<'a> {
    source: &'a [u8],
    position: usize,
    bit_buffer: u32,
    bits_in_buffer: i32,
}

impl<'a> BitReader<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Self { source, position: 0, bit_buffer: 0, bits_in_buffer: 0 }
    }

    pub fn read_bits(&mut self, count: u8) -> Result<u32, BitsError> {
        if count == 0 {
            return Ok(0);
        }
        let count = count as i32;
        while self.bits_in_buffer < count {
            if self.position >= self.source.len() {
                return Err(BitsError::OutOfData);
            }
            self.bit_buffer = (self.bit_buffer << 8) | self.source[self.position] as u32;
            self.position += 1;
            self.bits_in_buffer += 8;
        }
        let shift = self.bits_in_buffer - count;
        let value = (self.bit_buffer >> shift) & ((1u32 << count) - 1);
        self.bits_in_buffer = shift;
        if shift > 0 {
            self.bit_buffer &= (1 << shift) - 1;
        } else {
            self.bit_buffer = 0;
        }
        Ok(value)
    }

    pub fn read_bit(&mut self) -> Result<u32, BitsError> {
        self.read_bits(1)
    }
}

/// MSB-first writer into a growable buffer.
pub struct BitWriter {
    out: Vec<u8>,
    bit_buffer: u32,
    bits_in_buffer: i32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self { out: Vec::new(), bit_buffer: 0, bits_in_buffer: 0 }
    }

    pub fn write_bits(&mut self, value: u32, length: u8) {
        if length == 0 {
            return;
        }
        let length = length as i32;
        self.bit_buffer = (self.bit_buffer << length) | (value & ((1u32 << length) - 1));
        self.bits_in_buffer += length;
        while self.bits_in_buffer >= 8 {
            let shift = self.bits_in_buffer - 8;
            self.out.push((self.bit_buffer >> shift) as u8);
            self.bits_in_buffer = shift;
            if shift > 0 {
                self.bit_buffer &= (1 << shift) - 1;
            } else {
                self.bit_buffer = 0;
            }
        }
    }

    /// Pad the final partial byte with zero bits and return the stream.
    pub fn finish(mut self) -> Vec<u8> {
        if self.bits_in_buffer > 0 {
            let pad = 8 - self.bits_in_buffer;
            self.write_bits(0, pad as u8);
        }
        self.out
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

// ── SCP default Huffman table ─────────────────────────────────────────────
//
// EN 1064 table #0: small differences get unary-prefixed codes, values
// beyond ±8 escape to 8- or 16-bit literals behind the two longest codes.

/// Longest prefix length in the default table.
const MAX_PREFIX: u8 = 10;

/// Prefix value (10 ones, then 0 / 1) selecting the 8- or 16-bit escape.
const ESCAPE_8: u32 = 0b1111111110;
const ESCAPE_16: u32 = 0b1111111111;

/// Encode one difference value with the default table.
fn encode_value(w: &mut BitWriter, v: i32) -> Result<(), BitsError> {
    match v {
        0 => w.write_bits(0b0, 1),
        1..=8 | -8..=-1 => {
            let magnitude = v.unsigned_abs();
            // `magnitude` ones, a zero, then the sign bit (1 = negative).
            let prefix_len = magnitude as u8 + 1;
            w.write_bits((1u32 << magnitude) - 1, prefix_len - 1);
            w.write_bits(0, 1);
            w.write_bits((v < 0) as u32, 1);
        }
        -128..=127 => {
            w.write_bits(ESCAPE_8, MAX_PREFIX);
            w.write_bits((v as i8) as u8 as u32, 8);
        }
        -32768..=32767 => {
            w.write_bits(ESCAPE_16, MAX_PREFIX);
            w.write_bits((v as i16) as u16 as u32, 16);
        }
        _ => return Err(BitsError::ValueOutOfRange(v as i64)),
    }
    Ok(())
}

fn decode_value(r: &mut BitReader) -> Result<i32, BitsError> {
    // Count leading ones up to the escape prefix length.
    let mut ones: u8 = 0;
    while ones < MAX_PREFIX {
        if r.read_bit()? == 0 {
            break;
        }
        ones += 1;
    }
    match ones {
        0 => Ok(0),
        1..=8 => {
            let negative = r.read_bit()? == 1;
            let magnitude = ones as i32;
            Ok(if negative { -magnitude } else { magnitude })
        }
        9 => {
            // Nine ones then the terminating zero already consumed: the
            // 8-bit escape.
            Ok(r.read_bits(8)? as u8 as i8 as i32)
        }
        _ => {
            // Ten ones: the 16-bit escape.
            Ok(r.read_bits(16)? as u16 as i16 as i32)
        }
    }
}

/// Huffman-encode a difference stream with the SCP default table.
pub fn scp_encode(values: &[i32]) -> Result<Vec<u8>, BitsError> {
    let mut w = BitWriter::new();
    for &v in values {
        encode_value(&mut w, v)?;
    }
    Ok(w.finish())
}

/// Decode exactly `count` values from an SCP default-table stream.
pub fn scp_decode(bytes: &[u8], count: usize) -> Result<Vec<i32>, BitsError> {
    let mut r = BitReader::new(bytes);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(decode_value(&mut r)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_writer_reader_round_trip() {
        let mut w = BitWriter::new();
        w.write_bits(0b101, 3);
        w.write_bits(0b0110_1001, 8);
        w.write_bits(0b1, 1);
        let bytes = w.finish();
        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read_bits(3).unwrap(), 0b101);
        assert_eq!(r.read_bits(8).unwrap(), 0b0110_1001);
        assert_eq!(r.read_bits(1).unwrap(), 0b1);
    }

    #[test]
    fn reader_reports_exhaustion() {
        let mut r = BitReader::new(&[0xFF]);
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert_eq!(r.read_bits(1), Err(BitsError::OutOfData));
    }

    #[test]
    fn small_values_round_trip() {
        let values: Vec<i32> = (-8..=8).collect();
        let encoded = scp_encode(&values).unwrap();
        assert_eq!(scp_decode(&encoded, values.len()).unwrap(), values);
    }

    #[test]
    fn escape_values_round_trip() {
        let values = vec![0, 9, -9, 127, -128, 128, -129, 32767, -32768, 0];
        let encoded = scp_encode(&values).unwrap();
        assert_eq!(scp_decode(&encoded, values.len()).unwrap(), values);
    }

    #[test]
    fn realistic_difference_stream_round_trips_exactly() {
        // Second differences of an ECG-like waveform: mostly tiny, with
        // QRS excursions pushing into both escape ranges.
        let mut values = Vec::new();
        for i in 0..2000i32 {
            let v = match i % 200 {
                40 => 350,
                41 => -700,
                42 => 360,
                _ => ((i as f64 / 7.0).sin() * 4.0) as i32,
            };
            values.push(v);
        }
        let encoded = scp_encode(&values).unwrap();
        assert_eq!(scp_decode(&encoded, values.len()).unwrap(), values);
    }

    #[test]
    fn zero_runs_compress_to_one_bit_each() {
        let values = vec![0i32; 80];
        let encoded = scp_encode(&values).unwrap();
        assert_eq!(encoded.len(), 10);
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        assert_eq!(scp_encode(&[40_000]), Err(BitsError::ValueOutOfRange(40_000)));
    }
}
