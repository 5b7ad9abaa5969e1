//! AWS event-stream 二进制帧解码
//!
//! 帧格式：
//! ```text
//! | total_len u32 | headers_len u32 | prelude_crc u32 | headers | payload | message_crc u32 |
//! ```
//! 两个 CRC 均为 CRC-32/ISO-HDLC，prelude_crc 覆盖前 8 字节，message_crc 覆盖除自身外的整帧。

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BytesMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use serde_json::Value;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;
/// 单帧上限 16 MiB
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EventStreamError {
    #[error("event-stream frame length {0} out of range")]
    InvalidLength(usize),

    #[error("event-stream prelude CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    PreludeCrc { expected: u32, actual: u32 },

    #[error("event-stream message CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    MessageCrc { expected: u32, actual: u32 },

    #[error("event-stream header: {0}")]
    Header(String),

    #[error("event-stream payload: {0}")]
    Payload(String),
}

/// 解码后的单帧
#[derive(Debug, Clone)]
pub struct EventStreamMessage {
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl EventStreamMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// 缺省按 `event` 处理
    pub fn message_type(&self) -> &str {
        self.header(":message-type").unwrap_or("event")
    }
}

/// 增量解码器：`push` 网络字节，`next_message` 取出完整帧
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// 未消费的字节数（流结束时非零说明帧被截断）
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_message(&mut self) -> Option<Result<EventStreamMessage, EventStreamError>> {
        if self.buffer.len() < PRELUDE_LEN {
            return None;
        }

        let total_len = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len)
            || headers_len > total_len - MIN_FRAME_LEN
        {
            // 长度不可信，无法重新同步，丢弃全部缓冲
            self.buffer.clear();
            return Some(Err(EventStreamError::InvalidLength(total_len)));
        }

        let expected = read_u32(&self.buffer[8..12]);
        let actual = CRC32.checksum(&self.buffer[0..8]);
        if expected != actual {
            self.buffer.clear();
            return Some(Err(EventStreamError::PreludeCrc { expected, actual }));
        }

        if self.buffer.len() < total_len {
            return None;
        }

        let frame = self.buffer.split_to(total_len);
        let expected = read_u32(&frame[total_len - 4..]);
        let actual = CRC32.checksum(&frame[..total_len - 4]);
        if expected != actual {
            return Some(Err(EventStreamError::MessageCrc { expected, actual }));
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let headers = match parse_headers(&frame[PRELUDE_LEN..headers_end]) {
            Ok(headers) => headers,
            Err(e) => return Some(Err(e)),
        };
        let payload = frame[headers_end..total_len - 4].to_vec();
        Some(Ok(EventStreamMessage { headers, payload }))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = bytes;
    buf.get_u32()
}

/// 只保留 string 类型的 header，其余类型按长度跳过
fn parse_headers(mut bytes: &[u8]) -> Result<HashMap<String, String>, EventStreamError> {
    fn take<'a>(bytes: &mut &'a [u8], n: usize, what: &str) -> Result<&'a [u8], EventStreamError> {
        if bytes.len() < n {
            return Err(EventStreamError::Header(format!("{what} truncated")));
        }
        let (head, tail) = bytes.split_at(n);
        *bytes = tail;
        Ok(head)
    }

    let mut out = HashMap::new();
    while !bytes.is_empty() {
        let name_len = take(&mut bytes, 1, "name length")?[0] as usize;
        let name = std::str::from_utf8(take(&mut bytes, name_len, "name")?)
            .map_err(|e| EventStreamError::Header(format!("bad header name: {e}")))?
            .to_string();
        let value_type = take(&mut bytes, 1, "value type")?[0];

        match value_type {
            // bool true / false
            0 | 1 => {}
            2 => {
                take(&mut bytes, 1, "byte")?;
            }
            3 => {
                take(&mut bytes, 2, "short")?;
            }
            4 => {
                take(&mut bytes, 4, "int")?;
            }
            5 | 8 => {
                take(&mut bytes, 8, "long")?;
            }
            6 | 7 => {
                let len_bytes = take(&mut bytes, 2, "value length")?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                let value = take(&mut bytes, len, "value")?;
                if value_type == 7 {
                    let value = std::str::from_utf8(value)
                        .map_err(|e| EventStreamError::Header(format!("bad header value: {e}")))?;
                    out.insert(name, value.to_string());
                }
            }
            9 => {
                take(&mut bytes, 16, "uuid")?;
            }
            other => {
                return Err(EventStreamError::Header(format!(
                    "unsupported header type {other}"
                )));
            }
        }
    }
    Ok(out)
}

/// Bedrock 响应流中的业务事件
#[derive(Debug, Clone, PartialEq)]
pub enum BedrockFrame {
    /// `chunk` 事件，内容为 base64 解码后的 Anthropic JSON 事件
    Chunk(Value),
    /// `exception` / `error` 帧，流到此结束
    Exception {
        exception_type: String,
        message: String,
    },
}

/// 把解码后的帧解释为 Bedrock 事件；不认识的事件类型返回 `None`
pub fn interpret(message: &EventStreamMessage) -> Result<Option<BedrockFrame>, EventStreamError> {
    match message.message_type() {
        "event" => {
            if message.header(":event-type").is_some_and(|t| t != "chunk") {
                return Ok(None);
            }
            let outer: Value = serde_json::from_slice(&message.payload)
                .map_err(|e| EventStreamError::Payload(format!("invalid chunk json: {e}")))?;
            let encoded = outer
                .get("bytes")
                .and_then(Value::as_str)
                .ok_or_else(|| EventStreamError::Payload("chunk missing bytes".to_string()))?;
            let decoded = BASE64
                .decode(encoded)
                .map_err(|e| EventStreamError::Payload(format!("base64 decode failed: {e}")))?;
            let inner: Value = serde_json::from_slice(&decoded)
                .map_err(|e| EventStreamError::Payload(format!("invalid event json: {e}")))?;
            Ok(Some(BedrockFrame::Chunk(inner)))
        }
        "exception" => {
            let exception_type = message
                .header(":exception-type")
                .unwrap_or("UnknownException")
                .to_string();
            let text = serde_json::from_slice::<Value>(&message.payload)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .or_else(|| v.get("Message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&message.payload).into_owned());
            Ok(Some(BedrockFrame::Exception {
                exception_type,
                message: text,
            }))
        }
        "error" => Ok(Some(BedrockFrame::Exception {
            exception_type: message
                .header(":error-code")
                .unwrap_or("InternalError")
                .to_string(),
            message: message.header(":error-message").unwrap_or_default().to_string(),
        })),
        other => Err(EventStreamError::Payload(format!(
            "unexpected message type {other}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// 构造带正确 CRC 的帧（只写 string header）
    pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = Vec::new();
        for (name, value) in headers {
            header_bytes.push(name.len() as u8);
            header_bytes.extend_from_slice(name.as_bytes());
            header_bytes.push(7u8);
            header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
            header_bytes.extend_from_slice(value.as_bytes());
        }

        let total_len = PRELUDE_LEN + header_bytes.len() + payload.len() + 4;
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        let prelude_crc = CRC32.checksum(&out);
        out.extend_from_slice(&prelude_crc.to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);
        let message_crc = CRC32.checksum(&out);
        out.extend_from_slice(&message_crc.to_be_bytes());
        out
    }

    /// Bedrock `chunk` 事件帧
    pub fn chunk_frame(event: &Value) -> Vec<u8> {
        let inner = serde_json::to_vec(event).unwrap();
        let outer = serde_json::json!({ "bytes": BASE64.encode(inner) });
        encode_frame(
            &[
                (":message-type", "event"),
                (":event-type", "chunk"),
                (":content-type", "application/json"),
            ],
            outer.to_string().as_bytes(),
        )
    }

    pub fn exception_frame(exception_type: &str, message: &str) -> Vec<u8> {
        let payload = serde_json::json!({ "message": message });
        encode_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", exception_type),
            ],
            payload.to_string().as_bytes(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_chunk_split_across_pushes() {
        let event = json!({"type": "message_stop"});
        let frame = chunk_frame(&event);
        let mut decoder = EventStreamDecoder::new();

        let (a, b) = frame.split_at(7);
        decoder.push(a);
        assert!(decoder.next_message().is_none());
        decoder.push(b);

        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(message.message_type(), "event");
        assert_eq!(
            interpret(&message).unwrap(),
            Some(BedrockFrame::Chunk(event))
        );
        assert!(decoder.next_message().is_none());
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut bytes = chunk_frame(&json!({"type": "ping"}));
        bytes.extend(chunk_frame(&json!({"type": "message_stop"})));
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&bytes);

        let mut types = Vec::new();
        while let Some(message) = decoder.next_message() {
            if let Some(BedrockFrame::Chunk(v)) = interpret(&message.unwrap()).unwrap() {
                types.push(v["type"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(types, vec!["ping", "message_stop"]);
    }

    #[test]
    fn test_message_crc_mismatch_consumes_frame() {
        let mut frame = chunk_frame(&json!({"type": "ping"}));
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        frame.extend(chunk_frame(&json!({"type": "message_stop"})));

        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);
        assert!(matches!(
            decoder.next_message(),
            Some(Err(EventStreamError::MessageCrc { .. }))
        ));
        // 后续帧仍可解码
        assert!(decoder.next_message().unwrap().is_ok());
    }

    #[test]
    fn test_prelude_crc_mismatch() {
        let mut frame = chunk_frame(&json!({"type": "ping"}));
        frame[9] ^= 0x01;
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);
        assert!(matches!(
            decoder.next_message(),
            Some(Err(EventStreamError::PreludeCrc { .. }))
        ));
        assert!(decoder.next_message().is_none());
    }

    #[test]
    fn test_invalid_total_len_is_consumed() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&15u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);

        assert!(matches!(
            decoder.next_message(),
            Some(Err(EventStreamError::InvalidLength(15)))
        ));
        assert!(decoder.next_message().is_none());
    }

    #[test]
    fn test_exception_frame() {
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&exception_frame("throttlingException", "Too many requests"));
        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(
            interpret(&message).unwrap(),
            Some(BedrockFrame::Exception {
                exception_type: "throttlingException".to_string(),
                message: "Too many requests".to_string(),
            })
        );
    }

    #[test]
    fn test_non_chunk_event_ignored() {
        let frame = encode_frame(
            &[(":message-type", "event"), (":event-type", "initial-response")],
            b"{}",
        );
        let mut decoder = EventStreamDecoder::new();
        decoder.push(&frame);
        let message = decoder.next_message().unwrap().unwrap();
        assert_eq!(interpret(&message).unwrap(), None);
    }

    #[test]
    fn test_skips_non_string_headers() {
        let mut headers = Vec::new();
        headers.push(4u8);
        headers.extend_from_slice(b"flag");
        headers.push(0u8);
        headers.push(2u8);
        headers.extend_from_slice(b"id");
        headers.push(4u8);
        headers.extend_from_slice(&7u32.to_be_bytes());
        let parsed = parse_headers(&headers).unwrap();
        assert!(parsed.is_empty());

        assert!(parse_headers(&[5, b'a']).is_err());
    }
}
