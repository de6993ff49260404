// SPDX-License-Identifier: MPL-2.0

use crate::mqtt_serde::parser::ParseError;

/// Largest value representable by a Variable Byte Integer (MQTT 5.0: 1.5.5).
pub const VBI_MAX: u32 = 268_435_455;

pub struct TwoByteInteger;

impl TwoByteInteger {
    pub fn encode(val: u16) -> [u8; 2] {
        val.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<(u16, usize), ParseError> {
        if bytes.len() < 2 {
            return Err(ParseError::BufferTooShort);
        }
        Ok((u16::from_be_bytes([bytes[0], bytes[1]]), 2))
    }
}

pub struct FourByteInteger;

impl FourByteInteger {
    pub fn encode(val: u32) -> [u8; 4] {
        val.to_be_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<(u32, usize), ParseError> {
        if bytes.len() < 4 {
            return Err(ParseError::BufferTooShort);
        }
        Ok((
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            4,
        ))
    }
}

pub struct VariableByteInteger;

impl VariableByteInteger {
    /// Encodes 7 bits per byte, least significant group first, using the top
    /// bit as a continuation flag. Negative values and values above
    /// [`VBI_MAX`] are rejected.
    pub fn encode<T>(val: T) -> Result<Vec<u8>, ParseError>
    where
        T: TryInto<u32>,
    {
        let mut num: u32 = val
            .try_into()
            .map_err(|_| ParseError::InvalidVariableByteInteger)?;
        if num > VBI_MAX {
            return Err(ParseError::InvalidVariableByteInteger);
        }

        let mut bytes = Vec::with_capacity(4);
        loop {
            let mut byte = (num % 128) as u8;
            num /= 128;
            if num > 0 {
                byte |= 0x80;
            }
            bytes.push(byte);
            if num == 0 {
                break;
            }
        }
        Ok(bytes)
    }

    /// Number of bytes `encode` produces for `val`.
    pub fn encoded_len(val: u32) -> usize {
        match val {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            _ => 4,
        }
    }

    pub fn decode(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
        if buffer.is_empty() {
            return Err(ParseError::BufferTooShort);
        }

        let mut multiplier: usize = 1;
        let mut value: usize = 0;
        let mut i: usize = 0;

        loop {
            let byte = *buffer.get(i).ok_or(ParseError::More(
                1,
                "vbi: not enough bytes for remaining length".to_string(),
            ))?;

            if byte & 0x80 != 0 && i == 3 {
                // a fifth byte would be needed
                return Err(ParseError::ParseError(
                    "invalid remaining length, MSB is 1".to_string(),
                ));
            }

            value += (byte & 0x7F) as usize * multiplier;
            multiplier *= 128;
            i += 1;

            if byte & 0x80 == 0 {
                break;
            }
        }

        Ok((value, i))
    }
}

pub struct BinaryData;

impl BinaryData {
    pub fn encode(data: &[u8]) -> Result<Vec<u8>, ParseError> {
        if data.len() > u16::MAX as usize {
            return Err(ParseError::StringTooLong);
        }
        let mut bytes = Vec::with_capacity(2 + data.len());
        bytes.extend_from_slice(&(data.len() as u16).to_be_bytes());
        bytes.extend_from_slice(data);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
        let (len, _) = TwoByteInteger::decode(bytes)?;
        let end = 2 + len as usize;
        if bytes.len() < end {
            return Err(ParseError::BufferTooShort);
        }
        Ok((bytes[2..end].to_vec(), end))
    }
}

/// MQTT UTF-8 encoded string (MQTT 5.0: 1.5.4).
///
/// Both directions reject U+0000 and the C0/C1 control ranges. Rust strings
/// cannot hold unpaired surrogates, so those are caught either by
/// [`Utf8String::from_utf16`] for UTF-16 sources or by the UTF-8 validation
/// in [`Utf8String::decode`] for wire data.
pub struct Utf8String;

impl Utf8String {
    pub fn encode(s: &str) -> Result<Vec<u8>, ParseError> {
        if s.len() > u16::MAX as usize {
            return Err(ParseError::StringTooLong);
        }
        Self::validate(s)?;
        BinaryData::encode(s.as_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<(String, usize), ParseError> {
        let (data, len) = BinaryData::decode(bytes)?;
        let s = String::from_utf8(data).map_err(ParseError::FromUtf8Error)?;
        Self::validate(&s)?;
        Ok((s, len))
    }

    /// Converts UTF-16 code units into a string suitable for encoding.
    pub fn from_utf16(units: &[u16]) -> Result<String, ParseError> {
        let mut out = String::with_capacity(units.len());
        for decoded in char::decode_utf16(units.iter().copied()) {
            match decoded {
                Ok(ch) => out.push(ch),
                Err(e) => {
                    return Err(ParseError::ParseError(format!(
                        "unpaired surrogate U+{:04X}",
                        e.unpaired_surrogate()
                    )))
                }
            }
        }
        Self::validate(&out)?;
        Ok(out)
    }

    pub fn validate(s: &str) -> Result<(), ParseError> {
        for ch in s.chars() {
            let code_point = ch as u32;
            match code_point {
                0x0000 => {
                    return Err(ParseError::ParseError(
                        "UTF-8 string contains null character (U+0000)".to_string(),
                    ))
                }
                0x0001..=0x001F | 0x007F..=0x009F => {
                    return Err(ParseError::ParseError(format!(
                        "UTF-8 string contains control character (U+{:04X})",
                        code_point
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

pub struct Utf8StringPair;

impl Utf8StringPair {
    pub fn encode(key: &str, value: &str) -> Result<Vec<u8>, ParseError> {
        let mut bytes = Utf8String::encode(key)?;
        bytes.extend(Utf8String::encode(value)?);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<((String, String), usize), ParseError> {
        let (key, key_len) = Utf8String::decode(bytes)?;
        let (value, value_len) = Utf8String::decode(&bytes[key_len..])?;
        Ok(((key, value), key_len + value_len))
    }
}
