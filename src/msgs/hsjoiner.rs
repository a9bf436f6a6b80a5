use crate::error::Error;
use crate::msgs::codec::{u24, Codec, Reader};
use crate::msgs::enums::HandshakeType;

/// Default ceiling on a buffered handshake message, server side.
pub const DEFAULT_MAX_HANDSHAKE_MESSAGE_LEN: usize = 16 * 1024;

/// Ceiling a client may configure while expecting a certificate chain.
pub const MAX_CLIENT_HANDSHAKE_MESSAGE_LEN: usize = 64 * 1024;

/// A complete handshake message cut from the stream: type plus raw body,
/// with the exact header+body bytes the transcript must cover.
#[derive(Clone, Debug)]
pub struct JoinedMessage {
    pub typ: HandshakeType,
    pub body: Vec<u8>,
    pub transcript_bytes: Vec<u8>,
}

/// Reassembles the handshake byte stream from record bodies.
///
/// Handshake messages may be split across records, and several may share
/// one record; this accumulates bytes until a whole `msg_type || u24 len ||
/// body` unit is present.
pub struct HandshakeJoiner {
    buf: Vec<u8>,
    max_message_len: usize,
}

impl Default for HandshakeJoiner {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeJoiner {
    pub fn new() -> HandshakeJoiner {
        HandshakeJoiner {
            buf: Vec::new(),
            max_message_len: DEFAULT_MAX_HANDSHAKE_MESSAGE_LEN,
        }
    }

    pub fn set_max_message_len(&mut self, max: usize) {
        self.max_message_len = max.min(MAX_CLIENT_HANDSHAKE_MESSAGE_LEN);
    }

    /// Add the body of a handshake-typed record.
    pub fn take_record_body(&mut self, body: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(body);

        // Cheap early check: a declared length beyond our ceiling can be
        // rejected before the rest of the body arrives.
        if self.buf.len() >= 4 {
            let declared = usize::from(u24(u32::from_be_bytes([
                0,
                self.buf[1],
                self.buf[2],
                self.buf[3],
            ])));
            if declared > self.max_message_len {
                return Err(Error::RecordOverflow);
            }
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop one complete message, or `None` if more bytes are needed.
    pub fn get_message(&mut self) -> Option<JoinedMessage> {
        if self.buf.len() < 4 {
            return None;
        }

        let mut r = Reader::init(&self.buf);
        let typ = HandshakeType::read(&mut r)?;
        let len = usize::from(u24::read(&mut r)?);

        if r.left() < len {
            return None;
        }

        let body = r.take(len)?.to_vec();
        let used = r.used();
        let transcript_bytes = self.buf[..used].to_vec();
        self.buf.drain(..used);

        Some(JoinedMessage {
            typ,
            body,
            transcript_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(typ: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![typ];
        u24(body.len() as u32).encode(&mut out);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn split_message_reassembles() {
        let mut j = HandshakeJoiner::new();
        let encoded = msg(1, &[0xaa; 10]);
        j.take_record_body(&encoded[..6]).unwrap();
        assert!(j.get_message().is_none());
        j.take_record_body(&encoded[6..]).unwrap();
        let m = j.get_message().unwrap();
        assert_eq!(m.typ, HandshakeType::ClientHello);
        assert_eq!(m.body, vec![0xaa; 10]);
        assert_eq!(m.transcript_bytes, encoded);
        assert!(j.is_empty());
    }

    #[test]
    fn two_messages_in_one_record() {
        let mut j = HandshakeJoiner::new();
        let mut rec = msg(2, &[1]);
        rec.extend_from_slice(&msg(11, &[2, 3]));
        j.take_record_body(&rec).unwrap();
        assert_eq!(j.get_message().unwrap().typ, HandshakeType::ServerHello);
        assert_eq!(j.get_message().unwrap().typ, HandshakeType::Certificate);
        assert!(j.get_message().is_none());
    }

    #[test]
    fn oversized_message_rejected_early() {
        let mut j = HandshakeJoiner::new();
        // declared length 64k, server default ceiling is 16k
        let header = [11u8, 0x01, 0x00, 0x00];
        assert_eq!(
            j.take_record_body(&header),
            Err(Error::RecordOverflow)
        );
    }

    #[test]
    fn client_ceiling_is_capped() {
        let mut j = HandshakeJoiner::new();
        j.set_max_message_len(1 << 30);
        let header = [11u8, 0x01, 0x00, 0x00]; // 64 KiB exactly
        assert_eq!(j.take_record_body(&header), Ok(()));
    }
}
