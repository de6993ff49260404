use super::control_packet::MqttPacket;
use crate::mqtt_serde::base_data::{
    BinaryData, FourByteInteger, TwoByteInteger, Utf8String, VariableByteInteger,
};
use std::error::Error;
use std::fmt;
use std::io::Error as IoError;

pub type ParserResult = Result<ParseOk, ParseError>;

// First byte of Fixed header
pub const FIXED_HDR_LEN: usize = 1;

#[derive(Debug)]
pub enum ParseError {
    More(usize, String), // not enough data for processing, hint for how many more bytes are needed
    IoError(IoError),
    ParseError(String),
    IncompleteProperty,
    FromUtf8Error(std::string::FromUtf8Error),
    StringTooLong,
    BufferTooShort,
    InvalidLength,
    InvalidPropertyId,
    InvalidPacketType,
    UnSuppProtoVsn,
    InvalidVariableByteInteger,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::More(hint, msg) => write!(f, "More data needed ({} bytes): {}", hint, msg),
            ParseError::IoError(e) => write!(f, "IO Error: {}", e),
            ParseError::ParseError(msg) => write!(f, "Parse Error: {}", msg),
            ParseError::IncompleteProperty => write!(f, "Incomplete Property"),
            ParseError::FromUtf8Error(e) => write!(f, "From UTF-8 Error: {}", e),
            ParseError::StringTooLong => write!(f, "String Too Long"),
            ParseError::BufferTooShort => write!(f, "Buffer Too Short"),
            ParseError::InvalidLength => write!(f, "Invalid Length"),
            ParseError::InvalidPropertyId => write!(f, "Invalid Property ID"),
            ParseError::InvalidPacketType => write!(f, "Invalid Packet Type"),
            ParseError::UnSuppProtoVsn => write!(f, "Unsupported Protocol Version"),
            ParseError::InvalidVariableByteInteger => write!(f, "Invalid Variable Byte Integer"),
        }
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ParseError::IoError(e) => Some(e),
            ParseError::FromUtf8Error(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for ParseError {
    fn from(e: IoError) -> Self {
        ParseError::IoError(e)
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseOk {
    Continue(usize, usize),    // (hint, consumed)
    Packet(MqttPacket, usize), // (packet, consumed)
}

pub fn packet_type(buffer: &[u8]) -> Result<u8, ParseError> {
    if buffer.is_empty() {
        return Err(ParseError::BufferTooShort);
    }
    Ok(buffer[0] >> 4)
}

pub fn parse_remaining_length(buffer: &[u8]) -> Result<(usize, usize), ParseError> {
    VariableByteInteger::decode(buffer)
}

/// Locates one complete packet at the start of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the offset of the
/// body (after the fixed header) and the total packet length.
pub fn frame(buffer: &[u8]) -> Result<Option<(usize, usize)>, ParseError> {
    if buffer.len() < FIXED_HDR_LEN + 1 {
        return Ok(None);
    }
    let (remaining, vbi_len) = match parse_remaining_length(&buffer[FIXED_HDR_LEN..]) {
        Ok(v) => v,
        Err(ParseError::More(_, _)) | Err(ParseError::BufferTooShort) => return Ok(None),
        Err(e) => return Err(e),
    };
    let body_start = FIXED_HDR_LEN + vbi_len;
    let total = body_start + remaining;
    if buffer.len() < total {
        return Ok(None);
    }
    Ok(Some((body_start, total)))
}

/// Sequential reader over a packet body.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ParseError> {
        let b = *self.buf.get(self.pos).ok_or(ParseError::BufferTooShort)?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ParseError> {
        let (v, n) = TwoByteInteger::decode(self.rest())?;
        self.pos += n;
        Ok(v)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ParseError> {
        let (v, n) = FourByteInteger::decode(self.rest())?;
        self.pos += n;
        Ok(v)
    }

    pub(crate) fn vbi(&mut self) -> Result<usize, ParseError> {
        let (v, n) = VariableByteInteger::decode(self.rest())?;
        self.pos += n;
        Ok(v)
    }

    pub(crate) fn utf8(&mut self) -> Result<String, ParseError> {
        let (s, n) = Utf8String::decode(self.rest())?;
        self.pos += n;
        Ok(s)
    }

    pub(crate) fn binary(&mut self) -> Result<Vec<u8>, ParseError> {
        let (b, n) = BinaryData::decode(self.rest())?;
        self.pos += n;
        Ok(b)
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < len {
            return Err(ParseError::BufferTooShort);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn take_rest(&mut self) -> &'a [u8] {
        let slice = self.rest();
        self.pos = self.buf.len();
        slice
    }
}

pub mod stream;
