use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::parser::{ParseError, ParseOk};
use bytes::{Buf, BytesMut};

const READ_CHUNK: usize = 4096;

/// A stateful parser for a stream of MQTT data.
/// It internally buffers data from a stream and yields complete packets.
#[derive(Debug)]
pub struct MqttParser {
    buffer: BytesMut,
    // 4 means MQTT v3.1.1, 5 means MQTT v5.0
    mqtt_version: u8,
}

impl Default for MqttParser {
    fn default() -> Self {
        Self::new(16384, 4)
    }
}

impl MqttParser {
    pub fn new(buffer_size: usize, mqtt_version: u8) -> Self {
        MqttParser {
            buffer: BytesMut::with_capacity(buffer_size),
            mqtt_version,
        }
    }

    pub fn mqtt_version(&self) -> u8 {
        self.mqtt_version
    }

    /// Appends new data from the stream to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempts to parse a single MQTT packet from the internal buffer.
    ///
    /// - If a full packet is available, it returns the packet together with
    ///   its encoded length, and those bytes are removed from the buffer.
    /// - If the buffer does not contain a full packet, it returns `Ok(None)`.
    /// - If the data in the buffer is malformed, it returns `Err(ParseError)`.
    pub fn next_packet(&mut self) -> Result<Option<(MqttPacket, usize)>, ParseError> {
        match MqttPacket::from_bytes_with_version(&self.buffer, self.mqtt_version)? {
            ParseOk::Packet(packet, consumed) => {
                self.buffer.advance(consumed);
                Ok(Some((packet, consumed)))
            }
            ParseOk::Continue(_, _) => Ok(None),
        }
    }
}

/// Blocking packet reader over any `std::io::Read`.
pub struct MqttStream<T> {
    parser: MqttParser,
    stream: T,
}

impl<T> MqttStream<T>
where
    T: std::io::Read,
{
    pub fn new(stream: T, buffer_size: usize, mqtt_version: u8) -> Self {
        MqttStream {
            parser: MqttParser::new(buffer_size, mqtt_version),
            stream,
        }
    }

    pub fn mut_stream(&mut self) -> &mut T {
        &mut self.stream
    }

    /// Reads until one packet is complete. `Ok(None)` signals end of stream.
    pub fn read_packet(&mut self) -> Result<Option<(MqttPacket, usize)>, ParseError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(found) = self.parser.next_packet()? {
                return Ok(Some(found));
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.parser.feed(&chunk[..n]);
        }
    }
}

impl<T> Iterator for MqttStream<T>
where
    T: std::io::Read,
{
    type Item = Result<MqttPacket, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_packet() {
            Ok(Some((packet, _))) => Some(Ok(packet)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
