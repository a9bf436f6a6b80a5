use crate::error::Error;
use crate::msgs::alert::AlertMessagePayload;
use crate::msgs::base::Payload;
use crate::msgs::ccs::ChangeCipherSpecPayload;
use crate::msgs::codec::{put_u16, Codec, Reader};
use crate::msgs::enums::{AlertDescription, AlertLevel, ContentType, ProtocolVersion};

/// Maximum TLS plaintext fragment.
pub const MAX_PLAINTEXT: usize = 16384;

/// Maximum record body we accept off the wire: plaintext plus AEAD expansion.
pub const MAX_WIRE_BODY: usize = MAX_PLAINTEXT + 256;

pub const TLS_HEADER_LEN: usize = 5;

#[derive(Debug, PartialEq)]
pub enum MessageError {
    TooShortForHeader,
    TooShortForLength,
    IllegalLength,
    IllegalContentType,
    IllegalProtocolVersion,
}

/// A TLS record as it appears on the wire; body possibly encrypted.
#[derive(Clone, Debug)]
pub struct OpaqueMessage {
    pub typ: ContentType,
    pub version: ProtocolVersion,
    pub payload: Vec<u8>,
}

impl OpaqueMessage {
    /// Parse the record at the front of `r`, leaving the rest untouched.
    pub fn read(r: &mut Reader) -> Result<OpaqueMessage, MessageError> {
        let typ = ContentType::read(r).ok_or(MessageError::TooShortForHeader)?;
        let version = ProtocolVersion::read(r).ok_or(MessageError::TooShortForHeader)?;
        let len = u16::read(r).ok_or(MessageError::TooShortForHeader)? as usize;

        if let ContentType::Unknown(_) = typ {
            return Err(MessageError::IllegalContentType);
        }

        // Reject obvious non-TLS before trying to buffer a bogus length.
        match version {
            ProtocolVersion::Unknown(v) if (v >> 8) != 0x03 => {
                return Err(MessageError::IllegalProtocolVersion);
            }
            _ => {}
        }

        if len > MAX_WIRE_BODY {
            return Err(MessageError::IllegalLength);
        }

        let body = r.take(len).ok_or(MessageError::TooShortForLength)?;

        Ok(OpaqueMessage {
            typ,
            version,
            payload: body.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(TLS_HEADER_LEN + self.payload.len());
        self.typ.encode(&mut buf);
        self.version.encode(&mut buf);
        put_u16(self.payload.len() as u16, &mut buf);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// The 5-byte header as currently encoded; used as TLS 1.3 AAD.
    pub fn header(&self) -> [u8; TLS_HEADER_LEN] {
        let mut hdr = [0u8; TLS_HEADER_LEN];
        hdr[0] = self.typ.get_u8();
        hdr[1..3].copy_from_slice(&self.version.get_u16().to_be_bytes());
        hdr[3..5].copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        hdr
    }

    /// Treat this record's body as already-plaintext.
    pub fn into_plain(self) -> PlainMessage {
        PlainMessage {
            typ: self.typ,
            version: self.version,
            payload: Payload(self.payload),
        }
    }
}

/// A record whose body is plaintext.
#[derive(Clone, Debug)]
pub struct PlainMessage {
    pub typ: ContentType,
    pub version: ProtocolVersion,
    pub payload: Payload,
}

impl PlainMessage {
    pub fn handshake(version: ProtocolVersion, encoded: Vec<u8>) -> PlainMessage {
        PlainMessage {
            typ: ContentType::Handshake,
            version,
            payload: Payload(encoded),
        }
    }

    pub fn alert(
        version: ProtocolVersion,
        level: AlertLevel,
        description: AlertDescription,
    ) -> PlainMessage {
        PlainMessage {
            typ: ContentType::Alert,
            version,
            payload: Payload(AlertMessagePayload { level, description }.get_encoding()),
        }
    }

    pub fn change_cipher_spec(version: ProtocolVersion) -> PlainMessage {
        PlainMessage {
            typ: ContentType::ChangeCipherSpec,
            version,
            payload: Payload(ChangeCipherSpecPayload.get_encoding()),
        }
    }

    pub fn application_data(version: ProtocolVersion, data: &[u8]) -> PlainMessage {
        PlainMessage {
            typ: ContentType::ApplicationData,
            version,
            payload: Payload(data.to_vec()),
        }
    }

    pub fn into_unencrypted_opaque(self) -> OpaqueMessage {
        OpaqueMessage {
            typ: self.typ,
            version: self.version,
            payload: self.payload.0,
        }
    }
}

/// Decode an alert body, tolerating nothing but exactly two bytes.
pub fn decode_alert(body: &[u8]) -> Result<AlertMessagePayload, Error> {
    AlertMessagePayload::read_bytes(body).ok_or(Error::DecodeError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_roundtrip() {
        let m = OpaqueMessage {
            typ: ContentType::Handshake,
            version: ProtocolVersion::TLSv1_2,
            payload: vec![1, 2, 3],
        };
        let enc = m.encode();
        assert_eq!(enc, vec![22, 3, 3, 0, 3, 1, 2, 3]);

        let got = OpaqueMessage::read(&mut Reader::init(&enc)).unwrap();
        assert_eq!(got.typ, ContentType::Handshake);
        assert_eq!(got.payload, vec![1, 2, 3]);
    }

    #[test]
    fn oversized_record_rejected() {
        let mut enc = vec![23, 3, 3];
        put_u16((MAX_WIRE_BODY + 1) as u16, &mut enc);
        enc.resize(enc.len() + MAX_WIRE_BODY + 1, 0);
        assert_eq!(
            OpaqueMessage::read(&mut Reader::init(&enc)),
            Err(MessageError::IllegalLength)
        );
    }

    #[test]
    fn unknown_content_type_rejected() {
        let enc = vec![99, 3, 3, 0, 0];
        assert_eq!(
            OpaqueMessage::read(&mut Reader::init(&enc)),
            Err(MessageError::IllegalContentType)
        );
    }

    #[test]
    fn truncated_body_reports_need_more() {
        let enc = vec![22, 3, 3, 0, 5, 1, 2];
        assert_eq!(
            OpaqueMessage::read(&mut Reader::init(&enc)),
            Err(MessageError::TooShortForLength)
        );
    }
}

impl PartialEq for OpaqueMessage {
    fn eq(&self, other: &Self) -> bool {
        self.typ == other.typ && self.version == other.version && self.payload == other.payload
    }
}
