//! Golomb-Rice delta decoding
//!
//! Compressed list updates carry sorted 32-bit integers (4 byte hash
//! prefixes or removal indices) as a first value followed by Rice coded
//! deltas. Bits are consumed least significant first within each byte.

use crate::{HashError, HashPrefix, Result};

/// Reads single bits, LSB first, from a byte slice
pub struct BitReader<'a> {
    buf: &'a [u8],
    mask: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, mask: 0x01 }
    }

    /// Read up to 32 bits, the first bit read becoming the lowest bit of the result
    pub fn read_bits(&mut self, num_bits: u32) -> Result<u32> {
        if num_bits > 32 {
            return Err(HashError::InvalidFormat(
                "Cannot read more than 32 bits".to_string(),
            ));
        }

        let mut result = 0u32;
        for i in 0..num_bits {
            let byte = *self.buf.first().ok_or_else(|| {
                HashError::InvalidFormat("Unexpected end of rice data".to_string())
            })?;

            if byte & self.mask != 0 {
                result |= 1u32 << i;
            }

            self.mask = self.mask.wrapping_shl(1);
            if self.mask == 0 {
                self.buf = &self.buf[1..];
                self.mask = 0x01;
            }
        }

        Ok(result)
    }

    /// Number of unread bits
    pub fn bits_remaining(&self) -> usize {
        let consumed = self.mask.trailing_zeros() as usize;
        (8 * self.buf.len()).saturating_sub(consumed)
    }
}

/// Decoder for a single Rice parameter `k`.
///
/// Each value is `(q << k) + r`: the quotient `q` in unary (ones closed by
/// a zero) followed by the remainder `r` as a k-bit integer.
pub struct RiceDecoder {
    k: u32,
}

impl RiceDecoder {
    pub fn new(k: u32) -> Self {
        Self { k }
    }

    pub fn read_value(&self, bit_reader: &mut BitReader) -> Result<u32> {
        let mut quotient = 0u32;
        while bit_reader.read_bits(1)? == 1 {
            quotient = quotient.wrapping_add(1);
        }

        let remainder = bit_reader.read_bits(self.k)?;
        Ok(quotient.wrapping_shl(self.k).wrapping_add(remainder))
    }
}

/// Decode `num_entries` Rice coded deltas following `first_value`.
///
/// Returns `num_entries + 1` values. Sums wrap at 32 bits.
pub fn decode_rice_integers(
    rice_parameter: i32,
    first_value: i64,
    num_entries: i32,
    encoded_data: &[u8],
) -> Result<Vec<u32>> {
    if !(0..=32).contains(&rice_parameter) {
        return Err(HashError::InvalidFormat(format!(
            "Invalid rice parameter: {rice_parameter}"
        )));
    }
    if num_entries < 0 {
        return Err(HashError::InvalidFormat(format!(
            "Invalid num_entries: {num_entries}"
        )));
    }

    // Every delta takes at least one unary stop bit plus k remainder bits.
    let max_entries = 8 * encoded_data.len() / (rice_parameter as usize + 1);
    if num_entries as usize > max_entries {
        return Err(HashError::InvalidFormat(format!(
            "num_entries {num_entries} exceeds the {max_entries} entries {} bytes can hold",
            encoded_data.len()
        )));
    }

    let mut values = Vec::with_capacity(num_entries as usize + 1);
    let mut current = first_value as u32;
    values.push(current);

    if num_entries == 0 {
        return Ok(values);
    }

    let mut bit_reader = BitReader::new(encoded_data);
    let decoder = RiceDecoder::new(rice_parameter as u32);
    for _ in 0..num_entries {
        current = current.wrapping_add(decoder.read_value(&mut bit_reader)?);
        values.push(current);
    }

    // Up to 7 bits of padding may remain in the final byte.
    if bit_reader.bits_remaining() >= 8 {
        return Err(HashError::InvalidFormat(
            "Unconsumed rice encoded data".to_string(),
        ));
    }

    Ok(values)
}

/// Decode Rice coded 4 byte hash prefixes.
///
/// Each decoded integer becomes a prefix in little-endian byte order.
pub fn decode_rice_hashes(
    rice_parameter: i32,
    first_value: i64,
    num_entries: i32,
    encoded_data: &[u8],
) -> Result<Vec<HashPrefix>> {
    decode_rice_integers(rice_parameter, first_value, num_entries, encoded_data)?
        .into_iter()
        .map(|value| HashPrefix::new(value.to_le_bytes().to_vec()))
        .collect()
}
