//! AWS event-stream frame decoder (CodeWhisperer/Kiro upstream).
//!
//! Frame layout: total_len(4) + header_len(4) + prelude_crc32(4) + headers
//! + payload + message_crc32(4), CRCs over the preceding bytes (ISO-HDLC).
//! The decoder recovers from corruption by skipping one byte on prelude
//! errors or a whole advertised frame on data errors, and stops hard after
//! five consecutive failures.

use std::collections::HashMap;

const PRELUDE_SIZE: usize = 12;
const MIN_MESSAGE_SIZE: usize = PRELUDE_SIZE + 4;
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;
const MAX_ERRORS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Ready,
    Parsing,
    Recovering,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorCode {
    Incomplete,
    MessageTooSmall,
    MessageTooLarge,
    PreludeCrcMismatch,
    MessageCrcMismatch,
    HeaderParseFailed,
    InvalidHeaderType,
    BufferOverflow,
    TooManyErrors,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct EventStreamError {
    code: ErrorCode,
    message: String,
}

impl EventStreamError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.code, ErrorCode::TooManyErrors | ErrorCode::BufferOverflow)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
    String(String),
    Uuid([u8; 16]),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub headers: HashMap<String, HeaderValue>,
    pub payload: Vec<u8>,
}

impl Frame {
    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.as_str())
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header_str(":message-type")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header_str(":exception-type")
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn need(buf: &[u8], offset: usize, len: usize) -> Result<(), EventStreamError> {
    if buf.len() < offset + len {
        return Err(EventStreamError::new(
            ErrorCode::Incomplete,
            format!("need {} bytes, got {}", offset + len, buf.len()),
        ));
    }
    Ok(())
}

fn parse_headers(data: &[u8]) -> Result<HashMap<String, HeaderValue>, EventStreamError> {
    let mut headers = HashMap::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let name_len = data[offset] as usize;
        offset += 1;
        if name_len == 0 {
            return Err(EventStreamError::new(
                ErrorCode::HeaderParseFailed,
                "header name length cannot be 0",
            ));
        }
        need(data, offset, name_len)?;
        let name = String::from_utf8_lossy(&data[offset..offset + name_len]).to_string();
        offset += name_len;

        need(data, offset, 1)?;
        let value_type = data[offset];
        offset += 1;

        // Value types follow the AWS event-stream spec (0-9).
        let value = match value_type {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => {
                need(data, offset, 1)?;
                let v = data[offset] as i8 as i64;
                offset += 1;
                HeaderValue::Int(v)
            }
            3 => {
                need(data, offset, 2)?;
                let v = i16::from_be_bytes([data[offset], data[offset + 1]]) as i64;
                offset += 2;
                HeaderValue::Int(v)
            }
            4 => {
                need(data, offset, 4)?;
                let v = i32::from_be_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ]) as i64;
                offset += 4;
                HeaderValue::Int(v)
            }
            5 | 8 => {
                need(data, offset, 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data[offset..offset + 8]);
                offset += 8;
                HeaderValue::Int(i64::from_be_bytes(raw))
            }
            6 => {
                need(data, offset, 2)?;
                let len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
                offset += 2;
                need(data, offset, len)?;
                let v = data[offset..offset + len].to_vec();
                offset += len;
                HeaderValue::Bytes(v)
            }
            7 => {
                need(data, offset, 2)?;
                let len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
                offset += 2;
                need(data, offset, len)?;
                let v = String::from_utf8_lossy(&data[offset..offset + len]).to_string();
                offset += len;
                HeaderValue::String(v)
            }
            9 => {
                need(data, offset, 16)?;
                let mut raw = [0u8; 16];
                raw.copy_from_slice(&data[offset..offset + 16]);
                offset += 16;
                HeaderValue::Uuid(raw)
            }
            other => {
                return Err(EventStreamError::new(
                    ErrorCode::InvalidHeaderType,
                    format!("type={other}"),
                ))
            }
        };
        headers.insert(name, value);
    }

    Ok(headers)
}

/// Parse one frame off the front of `buffer`. `Ok(None)` means more bytes
/// are needed.
fn parse_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>, EventStreamError> {
    if buffer.len() < PRELUDE_SIZE {
        return Ok(None);
    }

    let total_length = read_u32(buffer, 0) as usize;
    let header_length = read_u32(buffer, 4) as usize;
    let prelude_crc = read_u32(buffer, 8);

    if total_length < MIN_MESSAGE_SIZE {
        return Err(EventStreamError::new(
            ErrorCode::MessageTooSmall,
            format!("total_length={total_length}, min={MIN_MESSAGE_SIZE}"),
        ));
    }
    if total_length > MAX_MESSAGE_SIZE {
        return Err(EventStreamError::new(
            ErrorCode::MessageTooLarge,
            format!("total_length={total_length}, max={MAX_MESSAGE_SIZE}"),
        ));
    }
    if buffer.len() < total_length {
        return Ok(None);
    }

    let actual_prelude_crc = crc32fast::hash(&buffer[0..8]);
    if actual_prelude_crc != prelude_crc {
        return Err(EventStreamError::new(
            ErrorCode::PreludeCrcMismatch,
            format!("expected={prelude_crc:#010x}, actual={actual_prelude_crc:#010x}"),
        ));
    }

    let message_crc = read_u32(buffer, total_length - 4);
    let actual_message_crc = crc32fast::hash(&buffer[0..total_length - 4]);
    if actual_message_crc != message_crc {
        return Err(EventStreamError::new(
            ErrorCode::MessageCrcMismatch,
            format!("expected={message_crc:#010x}, actual={actual_message_crc:#010x}"),
        ));
    }

    let headers_end = PRELUDE_SIZE + header_length;
    if headers_end > total_length - 4 {
        return Err(EventStreamError::new(
            ErrorCode::HeaderParseFailed,
            "header length exceeds message boundary",
        ));
    }

    let headers = parse_headers(&buffer[PRELUDE_SIZE..headers_end])?;
    let payload = buffer[headers_end..total_length - 4].to_vec();
    Ok(Some((Frame { headers, payload }, total_length)))
}

pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    state: DecoderState,
    frames_decoded: u64,
    error_count: u32,
    bytes_skipped: u64,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            state: DecoderState::Ready,
            frames_decoded: 0,
            error_count: 0,
            bytes_skipped: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_skipped(&self) -> u64 {
        self.bytes_skipped
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<(), EventStreamError> {
        if self.state == DecoderState::Stopped {
            return Err(EventStreamError::new(ErrorCode::TooManyErrors, "decoder is stopped"));
        }
        if data.is_empty() {
            return Ok(());
        }
        if self.buffer.len() + data.len() > MAX_BUFFER_SIZE {
            return Err(EventStreamError::new(
                ErrorCode::BufferOverflow,
                format!("size={}, max={MAX_BUFFER_SIZE}", self.buffer.len() + data.len()),
            ));
        }
        self.buffer.extend_from_slice(data);
        if self.state == DecoderState::Recovering {
            self.state = DecoderState::Ready;
        }
        Ok(())
    }

    /// Decode the next complete frame. `Ok(None)` means more input is
    /// needed; errors leave the decoder in a recovering state unless the
    /// consecutive-error cap is hit.
    pub fn decode(&mut self) -> Result<Option<Frame>, EventStreamError> {
        if self.state == DecoderState::Stopped {
            return Err(EventStreamError::new(ErrorCode::TooManyErrors, "decoder is stopped"));
        }
        if self.buffer.is_empty() {
            self.state = DecoderState::Ready;
            return Ok(None);
        }

        self.state = DecoderState::Parsing;
        match parse_frame(&self.buffer) {
            Ok(None) => {
                self.state = DecoderState::Ready;
                Ok(None)
            }
            Ok(Some((frame, consumed))) => {
                self.buffer.drain(..consumed);
                self.state = DecoderState::Ready;
                self.frames_decoded += 1;
                self.error_count = 0;
                Ok(Some(frame))
            }
            Err(e) => {
                self.error_count += 1;
                if self.error_count >= MAX_ERRORS {
                    self.state = DecoderState::Stopped;
                    return Err(EventStreamError::new(
                        ErrorCode::TooManyErrors,
                        format!("count={}, last={e}", self.error_count),
                    ));
                }
                self.recover(&e);
                self.state = DecoderState::Recovering;
                Err(e)
            }
        }
    }

    /// Drain every currently decodable frame, swallowing recoverable
    /// errors (the caller keeps feeding).
    pub fn decode_available(&mut self) -> Result<Vec<Frame>, EventStreamError> {
        let mut frames = Vec::new();
        loop {
            match self.decode() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(frames),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => continue,
            }
        }
    }

    fn recover(&mut self, error: &EventStreamError) {
        if self.buffer.is_empty() {
            return;
        }

        match error.code {
            // Misaligned boundary: resync one byte at a time.
            ErrorCode::PreludeCrcMismatch | ErrorCode::MessageTooSmall | ErrorCode::MessageTooLarge => {
                self.buffer.drain(..1);
                self.bytes_skipped += 1;
            }
            // Corrupt frame body: skip the advertised frame when it fits.
            ErrorCode::MessageCrcMismatch | ErrorCode::HeaderParseFailed | ErrorCode::InvalidHeaderType => {
                if self.buffer.len() >= 4 {
                    let total_length = read_u32(&self.buffer, 0) as usize;
                    if (MIN_MESSAGE_SIZE..=self.buffer.len()).contains(&total_length) {
                        self.buffer.drain(..total_length);
                        self.bytes_skipped += total_length as u64;
                        return;
                    }
                }
                self.buffer.drain(..1);
                self.bytes_skipped += 1;
            }
            _ => {
                self.buffer.drain(..1);
                self.bytes_skipped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(7u8);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = Vec::new();
        for (name, value) in headers {
            header_bytes.extend_from_slice(&encode_string_header(name, value));
        }
        let total_len = PRELUDE_SIZE + header_bytes.len() + payload.len() + 4;

        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        let prelude_crc = crc32fast::hash(&out[0..8]);
        out.extend_from_slice(&prelude_crc.to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);
        let message_crc = crc32fast::hash(&out);
        out.extend_from_slice(&message_crc.to_be_bytes());
        out
    }

    #[test]
    fn decodes_a_simple_event_frame() {
        let frame_bytes = encode_frame(
            &[(":message-type", "event"), (":event-type", "assistantResponseEvent")],
            br#"{"content":"hi"}"#,
        );
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&frame_bytes).unwrap();
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.message_type(), Some("event"));
        assert_eq!(frame.event_type(), Some("assistantResponseEvent"));
        assert_eq!(frame.payload, br#"{"content":"hi"}"#);
        assert_eq!(decoder.frames_decoded(), 1);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame_bytes = encode_frame(&[(":message-type", "event")], b"payload");
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&frame_bytes[..10]).unwrap();
        assert!(decoder.decode().unwrap().is_none());
        decoder.feed(&frame_bytes[10..]).unwrap();
        assert!(decoder.decode().unwrap().is_some());
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut bytes = encode_frame(&[(":event-type", "a")], b"1");
        bytes.extend_from_slice(&encode_frame(&[(":event-type", "b")], b"2"));
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&bytes).unwrap();
        let frames = decoder.decode_available().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event_type(), Some("a"));
        assert_eq!(frames[1].event_type(), Some("b"));
    }

    #[test]
    fn recovers_from_leading_garbage_by_skipping_bytes() {
        let mut bytes = vec![0xAB, 0xCD];
        bytes.extend_from_slice(&encode_frame(&[(":event-type", "ok")], b"x"));
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&bytes).unwrap();

        let frames = decoder.decode_available().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("ok"));
        assert!(decoder.bytes_skipped() >= 2);
    }

    #[test]
    fn corrupted_message_crc_skips_the_frame() {
        let mut bad = encode_frame(&[(":event-type", "bad")], b"payload");
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        bad.extend_from_slice(&encode_frame(&[(":event-type", "good")], b"y"));

        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&bad).unwrap();
        let frames = decoder.decode_available().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), Some("good"));
    }

    #[test]
    fn stops_after_five_consecutive_errors() {
        // All-garbage input with prelude-looking sizes triggers repeated
        // prelude errors until the decoder gives up.
        let mut garbage = Vec::new();
        for _ in 0..64 {
            garbage.extend_from_slice(&[0xFF; 16]);
        }
        let mut decoder = EventStreamDecoder::new();
        decoder.feed(&garbage).unwrap();

        let result = decoder.decode_available();
        assert!(result.is_err());
        assert_eq!(decoder.state(), DecoderState::Stopped);
        assert!(decoder.decode().is_err());
    }
}
