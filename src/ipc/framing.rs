//! Length-prefixed message framing for the xaprun wire protocol.
//!
//! # Wire Format
//!
//! Every message is a decimal byte count, a single space, then exactly that
//! many bytes of frame body. Spaces between messages are ignored.
//!
//! ```text
//! request:   <length> <id> <method><target> <payload>
//! response:  <length> <id> <tag><rest>
//! ```
//!
//! `<length>` counts the bytes following the space after it. `<method>` is
//! one of `G`, `P`, `U`, `D`. Response tags are `S` (plain text), `J` (JSON
//! document) and `E` (server error document); anything else decodes to a
//! failure.
//!
//! Decoding is incremental: bytes are pushed into a [`FrameDecoder`] as they
//! arrive and complete frame bodies are pulled out one at a time.

use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::ipc::error::IpcError;
use crate::ipc::response::{FailureCode, Response};

/// Maximum frame size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Longest length prefix accepted before the delimiting space.
///
/// `usize::MAX` has 20 decimal digits; anything longer can never be valid.
const MAX_LENGTH_DIGITS: usize = 20;

/// Request method, encoded on the wire as a single character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Wire code for this method.
    pub fn code(&self) -> u8 {
        match self {
            Method::Get => b'G',
            Method::Post => b'P',
            Method::Put => b'U',
            Method::Delete => b'D',
        }
    }

    /// Parse a wire code; returns `None` for anything but `G`, `P`, `U`, `D`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'G' => Some(Method::Get),
            b'P' => Some(Method::Post),
            b'U' => Some(Method::Put),
            b'D' => Some(Method::Delete),
            _ => None,
        }
    }

    /// Parse a method from a code or verb name, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "G" | "GET" => Some(Method::Get),
            "P" | "POST" => Some(Method::Post),
            "U" | "PUT" => Some(Method::Put),
            "D" | "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Encode a request into its complete wire representation.
///
/// The caller is responsible for ensuring `target` contains no space; the
/// connection checks this before calling.
pub fn encode_request(id: &str, method: Method, target: &str, payload: &[u8]) -> Vec<u8> {
    let body_len = id.len() + 2 + target.len() + 1 + payload.len();
    let prefix = body_len.to_string();

    let mut frame = Vec::with_capacity(prefix.len() + 1 + body_len);
    frame.extend_from_slice(prefix.as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(id.as_bytes());
    frame.push(b' ');
    frame.push(method.code());
    frame.extend_from_slice(target.as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(payload);
    frame
}

/// Incremental decoder over a growing read buffer.
///
/// Holds unconsumed bytes plus the length of the frame currently being read,
/// if its prefix has already been parsed. `None` means the decoder is between
/// messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    expected_len: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Length of the frame being assembled, if its prefix has been read.
    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    /// Pull the next complete frame body out of the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed; nothing is consumed in
    /// that case except leading spaces and an already parsed length prefix.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Protocol` if the length prefix is not a decimal
    /// number, runs on too long, or announces a frame above
    /// [`MAX_FRAME_SIZE`]. The stream is desynchronized after this.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        let len = match self.expected_len {
            Some(len) => len,
            None => {
                // Ignore spaces between messages
                let skip = self.buffer.iter().take_while(|&&b| b == b' ').count();
                if skip > 0 {
                    self.buffer.drain(..skip);
                }

                let Some(space) = self.buffer.iter().position(|&b| b == b' ') else {
                    if self.buffer.len() > MAX_LENGTH_DIGITS {
                        return Err(IpcError::Protocol(format!(
                            "Length prefix exceeds {} bytes without a delimiter",
                            MAX_LENGTH_DIGITS
                        )));
                    }
                    return Ok(None);
                };

                let len = parse_length(&self.buffer[..space])?;
                if len > MAX_FRAME_SIZE {
                    return Err(IpcError::Protocol(format!(
                        "Frame size {} exceeds maximum {} bytes",
                        len, MAX_FRAME_SIZE
                    )));
                }
                self.buffer.drain(..=space);
                self.expected_len = Some(len);
                len
            }
        };

        if self.buffer.len() < len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..len).collect();
        self.expected_len = None;
        Ok(Some(frame))
    }
}

fn parse_length(prefix: &[u8]) -> Result<usize, IpcError> {
    let invalid = || {
        IpcError::Protocol(format!(
            "Invalid value read: {:?}",
            String::from_utf8_lossy(prefix)
        ))
    };
    if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)
}

/// Split a response frame body into its request id and decoded response.
///
/// Only a missing id is an error; every problem with the tag or the rest of
/// the body is reported as a `Response::Failure` so it can still reach the
/// callback waiting on that id.
pub fn decode_response(frame: &[u8]) -> Result<(String, Response), IpcError> {
    let space = frame.iter().position(|&b| b == b' ').ok_or_else(|| {
        IpcError::Protocol("Invalid response message - no message id".to_string())
    })?;
    let id = String::from_utf8_lossy(&frame[..space]).into_owned();
    let body = &frame[space + 1..];
    debug!("Decoded response frame for id {} ({} bytes)", id, body.len());
    Ok((id, decode_body(body)))
}

fn decode_body(body: &[u8]) -> Response {
    let Some((&tag, rest)) = body.split_first() else {
        return Response::failure(FailureCode::EmptyResponse, "Empty response");
    };

    match tag {
        b'S' => match std::str::from_utf8(rest) {
            Ok(text) => Response::Text(text.to_string()),
            Err(e) => Response::failure(
                FailureCode::Malformed,
                format!("Unable to parse response: {}", e),
            ),
        },
        b'J' => match serde_json::from_slice::<Value>(rest) {
            Ok(doc) => Response::Document(doc),
            Err(e) => Response::failure(
                FailureCode::Malformed,
                format!("Unable to parse response: {}", e),
            ),
        },
        b'E' => match serde_json::from_slice::<Value>(rest) {
            Ok(doc) => {
                let message = doc
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("Unspecified error in server");
                Response::failure(FailureCode::Server, message)
            }
            Err(e) => Response::failure(
                FailureCode::Malformed,
                format!("Unable to parse error response: {}", e),
            ),
        },
        other => Response::failure(
            FailureCode::UnknownTag,
            format!("Unknown response type code ({:?})", other as char),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn response_frame(id: &str, tag_and_rest: &str) -> Vec<u8> {
        let body = format!("{} {}", id, tag_and_rest);
        format!("{} {}", body.len(), body).into_bytes()
    }

    #[test]
    fn test_encode_request_version() {
        let frame = encode_request("0", Method::Get, "version", b"");
        assert_eq!(frame, b"11 0 Gversion ".to_vec());
    }

    #[test]
    fn test_encode_request_length_counts_body_bytes() {
        let frame = encode_request(
            "12",
            Method::Put,
            "db/test1/docs",
            r#"{"text":"héllo"}"#.as_bytes(),
        );
        let text = String::from_utf8(frame.clone()).unwrap();
        let (len, body) = text.split_once(' ').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), body.len());
        assert!(body.starts_with("12 Udb/test1/docs {"));
    }

    #[test]
    fn test_method_codes() {
        for method in [Method::Get, Method::Post, Method::Put, Method::Delete] {
            assert_eq!(Method::from_code(method.code()), Some(method));
        }
        assert_eq!(Method::from_code(b'X'), None);
        assert_eq!(Method::parse("delete"), Some(Method::Delete));
        assert_eq!(Method::parse("U"), Some(Method::Put));
        assert_eq!(Method::parse("PATCH"), None);
    }

    #[test]
    fn test_decode_plain_text_response() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&response_frame("0", "S0.1"));

        let frame = decoder.next_frame().unwrap().expect("complete frame");
        let (id, response) = decode_response(&frame).unwrap();
        assert_eq!(id, "0");
        assert_eq!(response, Response::Text("0.1".to_string()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_document_response() {
        let frame = decode_response(br#"3 J{"ok":1,"docid":"a1"}"#).unwrap();
        assert_eq!(
            frame,
            (
                "3".to_string(),
                Response::Document(json!({"ok": 1, "docid": "a1"}))
            )
        );
    }

    #[test]
    fn test_decode_server_error_response() {
        let (_, response) = decode_response(br#"4 E{"ok":0,"msg":"Not found"}"#).unwrap();
        assert_eq!(
            response,
            Response::failure(FailureCode::Server, "Not found")
        );
    }

    #[test]
    fn test_decode_inner_failures_are_not_fatal() {
        let (_, unknown) = decode_response(b"1 Xwhatever").unwrap();
        assert_eq!(unknown.as_failure().unwrap().code, FailureCode::UnknownTag);
        assert!(unknown.as_failure().unwrap().message.contains("'X'"));

        let (_, empty) = decode_response(b"2 ").unwrap();
        assert_eq!(empty.as_failure().unwrap().code, FailureCode::EmptyResponse);

        let (_, bad_json) = decode_response(b"3 J{not json").unwrap();
        assert_eq!(bad_json.as_failure().unwrap().code, FailureCode::Malformed);

        let (_, empty_text) = decode_response(b"4 S").unwrap();
        assert_eq!(empty_text, Response::Text(String::new()));
    }

    #[test]
    fn test_decode_response_without_id_is_fatal() {
        let err = decode_response(b"17").unwrap_err();
        assert!(matches!(err, IpcError::Protocol(_)));
    }

    #[test]
    fn test_need_more_bytes_without_consuming() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"12");
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 2);
        assert_eq!(decoder.expected_len(), None);

        decoder.push(b" 0 S");
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.expected_len(), Some(12));
        assert_eq!(decoder.buffered(), 3);

        decoder.push(b"123456789");
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(b"0 S123456789".to_vec())
        );
        assert_eq!(decoder.expected_len(), None);
    }

    #[test]
    fn test_leading_spaces_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"   6 0 S0.1 6 1 S0.2");
        assert_eq!(decoder.next_frame().unwrap(), Some(b"0 S0.1".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), Some(b"1 S0.2".to_vec()));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn test_non_numeric_length_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"abc 0 S0.1");
        let err = decoder.next_frame().unwrap_err();
        assert!(err.to_string().contains("Invalid value read"));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(format!("{} 0 S", MAX_FRAME_SIZE + 1).as_bytes());
        let err = decoder.next_frame().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_runaway_length_prefix_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"123456789012345678901234");
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_split_at_every_boundary_matches_whole() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&response_frame("0", "S0.1"));
        stream.extend_from_slice(b" ");
        stream.extend_from_slice(&response_frame("1", r#"J{"ok":1,"docid":"x y"}"#));
        stream.extend_from_slice(&response_frame("2", "Q"));

        let mut whole = FrameDecoder::new();
        whole.push(&stream);
        let mut expected = Vec::new();
        while let Some(frame) = whole.next_frame().unwrap() {
            expected.push(decode_response(&frame).unwrap());
        }
        assert_eq!(expected.len(), 3);

        for split in 0..=stream.len() {
            let mut decoder = FrameDecoder::new();
            let mut got = Vec::new();
            for chunk in [&stream[..split], &stream[split..]] {
                decoder.push(chunk);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    got.push(decode_response(&frame).unwrap());
                }
            }
            assert_eq!(got, expected, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let stream = response_frame("7", r#"J{"text":"hello world"}"#);
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &stream {
            decoder.push(std::slice::from_ref(byte));
            if let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1);
        let (id, response) = decode_response(&frames[0]).unwrap();
        assert_eq!(id, "7");
        assert_eq!(response, Response::Document(json!({"text": "hello world"})));
    }
}
