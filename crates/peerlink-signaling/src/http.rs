//! HTTP/1.0 framing for the signaling server.
//!
//! The server speaks a narrow dialect: every response carries a
//! `Content-Length`, the peer id a response concerns travels in `Pragma`,
//! and `Connection: close` means the server is done with the socket.
//!
//! ```text
//! HTTP/1.0 200 Added\r\n
//! Pragma: 3\r\n
//! Content-Length: 18\r\n
//! \r\n
//! alice,7,1\nbob,8,1\n
//! ```

use bytes::{Buf, Bytes, BytesMut};
use peerlink_core::{FrameError, PeerId};

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Body the remote end sends to say it is hanging up.
pub const HANG_UP: &[u8] = b"BYE";

// ── Responses ─────────────────────────────────────────────────────────────────

/// A complete response taken off a [`ResponseBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    /// Raw `Pragma` value.
    pub pragma: Option<String>,
    /// The server sent `Connection: close`; the socket must be treated as
    /// closed even if no close event follows.
    pub connection_close: bool,
    pub body: Bytes,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// The peer id carried in `Pragma`.
    pub fn peer_id(&self) -> Result<PeerId, FrameError> {
        self.pragma
            .as_deref()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| FrameError::InvalidPragma { value: self.pragma.clone() })
    }

    pub fn is_hang_up(&self) -> bool {
        self.body.as_ref() == HANG_UP
    }
}

/// Accumulates bytes from one socket until a full response has arrived.
///
/// Bytes are only removed once a complete response is taken; anything that
/// follows it stays buffered.
#[derive(Debug)]
pub struct ResponseBuffer {
    buf: BytesMut,
    limit: usize,
    /// Bytes already searched for the header terminator.
    scanned: usize,
}

impl ResponseBuffer {
    /// `limit` bounds a single response (headers plus body).
    pub fn new(limit: usize) -> Self {
        Self { buf: BytesMut::new(), limit, scanned: 0 }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Take the next complete response, or `Ok(None)` while more bytes are
    /// needed.
    pub fn try_take(&mut self) -> Result<Option<Response>, FrameError> {
        // A terminator can straddle the previous scan boundary.
        let from = self.scanned.saturating_sub(HEADER_END.len() - 1);
        let Some(eoh) = find(&self.buf[from..], HEADER_END).map(|at| from + at) else {
            self.scanned = self.buf.len();
            if self.buf.len() > self.limit {
                return Err(FrameError::TooLarge { limit: self.limit });
            }
            return Ok(None);
        };
        self.scanned = eoh;

        let head = parse_head(&self.buf[..eoh])?;
        let content_length = head.content_length.ok_or(FrameError::MissingContentLength)?;
        let total = content_length
            .checked_add(eoh + HEADER_END.len())
            .filter(|total| *total <= self.limit)
            .ok_or(FrameError::TooLarge { limit: self.limit })?;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total);
        self.scanned = 0;
        frame.advance(eoh + HEADER_END.len());
        Ok(Some(Response {
            status: head.status,
            pragma: head.pragma,
            connection_close: head.connection_close,
            body: frame.freeze(),
        }))
    }
}

struct Head {
    status: u16,
    content_length: Option<usize>,
    pragma: Option<String>,
    connection_close: bool,
}

fn parse_head(raw: &[u8]) -> Result<Head, FrameError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| FrameError::MalformedStatus { line: status_line.to_owned() })?;

    let mut head = Head { status, content_length: None, pragma: None, connection_close: false };
    for line in lines {
        let Some((name, value)) = line.split_once(':') else { continue };
        let (name, value) = (name.trim(), value.trim());
        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .parse()
                .map_err(|_| FrameError::InvalidContentLength { value: value.to_owned() })?;
            head.content_length = Some(length);
        } else if name.eq_ignore_ascii_case("pragma") {
            head.pragma = Some(value.to_owned());
        } else if name.eq_ignore_ascii_case("connection") {
            head.connection_close = value.eq_ignore_ascii_case("close");
        }
    }
    Ok(head)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ── Requests ──────────────────────────────────────────────────────────────────

pub fn sign_in_request(client_name: &str) -> Bytes {
    Bytes::from(format!("GET /sign_in?{} HTTP/1.0\r\n\r\n", client_name))
}

pub fn wait_request(self_id: PeerId) -> Bytes {
    Bytes::from(format!("GET /wait?peer_id={} HTTP/1.0\r\n\r\n", self_id))
}

pub fn sign_out_request(self_id: PeerId) -> Bytes {
    Bytes::from(format!("GET /sign_out?peer_id={} HTTP/1.0\r\n\r\n", self_id))
}

pub fn message_request(from: PeerId, to: PeerId, payload: &[u8]) -> Bytes {
    let head = format!(
        "POST /message?peer_id={}&to={} HTTP/1.0\r\n\
         Content-Length: {}\r\n\
         Content-Type: text/plain\r\n\
         \r\n",
        from,
        to,
        payload.len()
    );
    let mut request = BytesMut::with_capacity(head.len() + payload.len());
    request.extend_from_slice(head.as_bytes());
    request.extend_from_slice(payload);
    request.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGN_IN: &[u8] =
        b"HTTP/1.0 200 Added\r\nPragma: 3\r\nContent-Length: 18\r\n\r\nalice,7,1\nbob,8,1\n";

    #[test]
    fn parses_complete_response() {
        let mut buf = ResponseBuffer::new(1024);
        buf.extend(SIGN_IN);
        let resp = buf.try_take().unwrap().expect("complete");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.peer_id(), Ok(PeerId(3)));
        assert!(!resp.connection_close);
        assert_eq!(resp.body.as_ref(), b"alice,7,1\nbob,8,1\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn split_delivery_reassembles_identically() {
        let mut whole = ResponseBuffer::new(1024);
        whole.extend(SIGN_IN);
        let expected = whole.try_take().unwrap().expect("complete");

        for cut in 0..=SIGN_IN.len() {
            let mut buf = ResponseBuffer::new(1024);
            buf.extend(&SIGN_IN[..cut]);
            let early = buf.try_take().unwrap();
            if cut < SIGN_IN.len() {
                assert!(early.is_none(), "complete after only {} bytes", cut);
                buf.extend(&SIGN_IN[cut..]);
                assert_eq!(buf.try_take().unwrap().as_ref(), Some(&expected), "cut at {}", cut);
            } else {
                assert_eq!(early.as_ref(), Some(&expected));
            }
        }
    }

    #[test]
    fn keeps_bytes_after_response() {
        let mut buf = ResponseBuffer::new(1024);
        buf.extend(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nhiHTTP/1.0");
        let resp = buf.try_take().unwrap().expect("complete");
        assert_eq!(resp.body.as_ref(), b"hi");
        assert_eq!(buf.len(), b"HTTP/1.0".len());
        assert_eq!(buf.try_take().unwrap(), None);
    }

    #[test]
    fn detects_connection_close_case_insensitively() {
        let mut buf = ResponseBuffer::new(1024);
        buf.extend(b"HTTP/1.0 200 OK\r\ncontent-length: 3\r\nCONNECTION: Close\r\nPragma: 8\r\n\r\nBYE");
        let resp = buf.try_take().unwrap().expect("complete");
        assert!(resp.connection_close);
        assert!(resp.is_hang_up());
        assert_eq!(resp.peer_id(), Ok(PeerId(8)));
    }

    #[test]
    fn missing_content_length_is_an_error() {
        let mut buf = ResponseBuffer::new(1024);
        buf.extend(b"HTTP/1.0 200 OK\r\nPragma: 1\r\n\r\n");
        assert_eq!(buf.try_take(), Err(FrameError::MissingContentLength));
    }

    #[test]
    fn unterminated_header_is_bounded() {
        let mut buf = ResponseBuffer::new(16);
        buf.extend(b"HTTP/1.0 200 OK\r\n");
        assert_eq!(buf.try_take(), Err(FrameError::TooLarge { limit: 16 }));
    }

    #[test]
    fn oversized_content_length_is_bounded() {
        let mut buf = ResponseBuffer::new(1024);
        buf.extend(b"HTTP/1.0 200 OK\r\nPragma: 3\r\nContent-Length: 18446744073709551615\r\n\r\n");
        assert_eq!(buf.try_take(), Err(FrameError::TooLarge { limit: 1024 }));

        let mut buf = ResponseBuffer::new(1024);
        buf.extend(b"HTTP/1.0 200 OK\r\nContent-Length: 2048\r\n\r\n");
        assert_eq!(buf.try_take(), Err(FrameError::TooLarge { limit: 1024 }));
    }

    #[test]
    fn terminator_split_across_byte_deliveries() {
        let mut buf = ResponseBuffer::new(1024);
        for byte in SIGN_IN.iter().take(SIGN_IN.len() - 1) {
            buf.extend(std::slice::from_ref(byte));
            assert_eq!(buf.try_take(), Ok(None));
        }
        buf.extend(&SIGN_IN[SIGN_IN.len() - 1..]);
        let resp = buf.try_take().unwrap().expect("complete");
        assert_eq!(resp.peer_id(), Ok(PeerId(3)));

        // The scan restarts for the next response on the same buffer.
        buf.extend(SIGN_IN);
        assert!(buf.try_take().unwrap().is_some());
    }

    #[test]
    fn non_numeric_status_is_malformed() {
        let mut buf = ResponseBuffer::new(1024);
        buf.extend(b"garbage\r\nContent-Length: 0\r\n\r\n");
        assert!(matches!(buf.try_take(), Err(FrameError::MalformedStatus { .. })));
    }

    #[test]
    fn builds_relay_request() {
        let req = message_request(PeerId(3), PeerId(8), b"offer");
        assert_eq!(
            req.as_ref(),
            &b"POST /message?peer_id=3&to=8 HTTP/1.0\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\r\noffer"[..]
        );
        assert_eq!(sign_in_request("alice").as_ref(), b"GET /sign_in?alice HTTP/1.0\r\n\r\n");
        assert_eq!(wait_request(PeerId(3)).as_ref(), b"GET /wait?peer_id=3 HTTP/1.0\r\n\r\n");
    }
}
