use std::collections::VecDeque;
use std::io;

use crate::error::Error;
use crate::msgs::codec::Reader;
use crate::msgs::message::{MessageError, OpaqueMessage};

/// Accumulates transport bytes and cuts them into records.
///
/// Also performs the first-flight sniffing a server needs: plaintext HTTP
/// verbs sent to a TLS port, and SSLv2-format ClientHellos, neither of which
/// survive `OpaqueMessage::read`.
pub struct MessageDeframer {
    pub frames: VecDeque<OpaqueMessage>,
    /// Set once the stream is unparseable; all further reads fail.
    pub desynced: bool,
    buf: Vec<u8>,
    /// Cleared after the first record: the sniffing rules apply only to the
    /// very start of a connection.
    first_bytes: bool,
}

/// HTTP verbs that indicate a plaintext client talking to a TLS port.
const HTTP_VERBS: [&[u8]; 4] = [b"GET ", b"POST ", b"HEAD ", b"PUT "];
const HTTPS_PROXY_VERB: &[u8] = b"CONNE";

impl Default for MessageDeframer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDeframer {
    pub fn new() -> MessageDeframer {
        MessageDeframer {
            frames: VecDeque::new(),
            desynced: false,
            buf: Vec::new(),
            first_bytes: true,
        }
    }

    /// Read some bytes from `rd` and cut any complete records.
    pub fn read(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let used = rd.read(&mut chunk)?;
        self.extend(&chunk[..used]);
        Ok(used)
    }

    /// Feed bytes directly; used by datagram-less tests and the DTLS path.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.deframe();
    }

    pub fn has_pending(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Classify an unparseable first flight.
    pub fn non_tls_intro(&self) -> Option<Error> {
        if !self.first_bytes {
            return None;
        }

        if HTTP_VERBS
            .iter()
            .any(|verb| self.buf.starts_with(verb))
        {
            return Some(Error::HttpRequest);
        }
        if self.buf.starts_with(HTTPS_PROXY_VERB) {
            return Some(Error::HttpsProxyRequest);
        }
        None
    }

    /// An SSLv2-format ClientHello: high bit set on the length, internal
    /// msg_type 1, version major 3. Only meaningful for a server's first
    /// record.
    pub fn looks_like_v2_client_hello(&self) -> bool {
        self.first_bytes
            && self.buf.len() >= 4
            && self.buf[0] & 0x80 != 0
            && self.buf[2] == 1
            && self.buf[3] == 3
    }

    /// Extract the complete V2ClientHello body if fully buffered:
    /// returns the bytes after the 2-byte length header.
    pub fn take_v2_client_hello(&mut self) -> Option<Vec<u8>> {
        if !self.looks_like_v2_client_hello() {
            return None;
        }

        let len = (((self.buf[0] & 0x7f) as usize) << 8) | self.buf[1] as usize;
        if self.buf.len() < 2 + len {
            return None;
        }

        let body = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        self.first_bytes = false;
        Some(body)
    }

    fn deframe(&mut self) {
        if self.desynced {
            return;
        }

        loop {
            if self.looks_like_v2_client_hello() {
                // Left buffered for take_v2_client_hello.
                return;
            }

            let mut r = Reader::init(&self.buf);
            match OpaqueMessage::read(&mut r) {
                Ok(m) => {
                    let used = r.used();
                    self.frames.push_back(m);
                    self.buf.drain(..used);
                    self.first_bytes = false;
                }
                Err(MessageError::TooShortForHeader) | Err(MessageError::TooShortForLength) => {
                    return;
                }
                Err(_) => {
                    self.desynced = true;
                    return;
                }
            }

            if self.buf.is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::enums::ContentType;

    #[test]
    fn cuts_multiple_records() {
        let mut d = MessageDeframer::new();
        let mut bytes = vec![22, 3, 3, 0, 1, 0xab];
        bytes.extend_from_slice(&[23, 3, 3, 0, 2, 1, 2]);
        d.extend(&bytes);
        assert_eq!(d.frames.len(), 2);
        assert_eq!(d.frames[0].typ, ContentType::Handshake);
        assert_eq!(d.frames[1].typ, ContentType::ApplicationData);
    }

    #[test]
    fn partial_record_waits() {
        let mut d = MessageDeframer::new();
        d.extend(&[22, 3, 3, 0, 5, 1]);
        assert!(!d.has_pending());
        d.extend(&[2, 3, 4, 5]);
        assert_eq!(d.frames.len(), 1);
        assert_eq!(d.frames[0].payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn http_get_detected() {
        let mut d = MessageDeframer::new();
        d.extend(b"GET / HTTP/1.1\r\n");
        assert!(d.desynced);
        assert_eq!(d.non_tls_intro(), Some(Error::HttpRequest));
    }

    #[test]
    fn connect_detected_as_proxy() {
        let mut d = MessageDeframer::new();
        d.extend(b"CONNECT example.com:443 HTTP/1.1\r\n");
        assert!(d.desynced);
        assert_eq!(d.non_tls_intro(), Some(Error::HttpsProxyRequest));
    }

    #[test]
    fn http_after_first_record_is_just_garbage() {
        let mut d = MessageDeframer::new();
        d.extend(&[22, 3, 3, 0, 1, 0xab]);
        d.extend(b"GET / HTTP/1.1\r\n");
        assert!(d.desynced);
        assert_eq!(d.non_tls_intro(), None);
    }

    #[test]
    fn v2_client_hello_recognised() {
        let mut d = MessageDeframer::new();
        // length 0x0009, msg_type 1, version 3.1, then 6 bytes of body
        d.extend(&[0x80, 0x09, 0x01, 0x03, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(d.looks_like_v2_client_hello());
        let body = d.take_v2_client_hello().unwrap();
        assert_eq!(body.len(), 9);
        assert_eq!(body[0], 1);
    }

    #[test]
    fn v2_client_hello_waits_for_full_body() {
        let mut d = MessageDeframer::new();
        d.extend(&[0x80, 0x20, 0x01, 0x03, 0x01]);
        assert!(d.looks_like_v2_client_hello());
        assert!(d.take_v2_client_hello().is_none());
        assert!(!d.desynced);
    }
}
