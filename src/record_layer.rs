use crate::cipher::{make_tls12_aad, unwrap_tls13_inner, wrap_tls13_inner, AeadContext, Direction};
use crate::error::Error;
use crate::msgs::base::Payload;
use crate::msgs::enums::{ContentType, ProtocolVersion};
use crate::msgs::message::{OpaqueMessage, PlainMessage, MAX_PLAINTEXT};

/// Hard ceiling on TLS record sequence numbers; reaching it forces a
/// key change or connection close rather than nonce reuse.
const MAX_TLS_SEQ: u64 = u64::MAX - 1;

/// Per-connection record protection state for stream transports.
///
/// Owns the two AEAD contexts and their sequence numbers; the key schedule
/// drives transitions through `install_read_key`/`install_write_key`, which
/// atomically replace the context and rewind the matching sequence.
pub struct RecordLayer {
    read_ctx: AeadContext,
    write_ctx: AeadContext,
    read_seq: u64,
    write_seq: u64,
    /// True once the negotiated version frames records the TLS 1.3 way.
    tls13_framing: bool,
}

impl RecordLayer {
    pub fn new() -> RecordLayer {
        RecordLayer {
            read_ctx: AeadContext::null(Direction::Open),
            write_ctx: AeadContext::null(Direction::Seal),
            read_seq: 0,
            write_seq: 0,
            tls13_framing: false,
        }
    }

    pub fn set_tls13_framing(&mut self) {
        self.tls13_framing = true;
    }

    pub fn is_tls13_framing(&self) -> bool {
        self.tls13_framing
    }

    pub fn read_is_null(&self) -> bool {
        self.read_ctx.is_null()
    }

    pub fn write_is_null(&self) -> bool {
        self.write_ctx.is_null()
    }

    pub fn install_read_key(&mut self, aead: AeadContext) {
        self.read_ctx = aead;
        self.read_seq = 0;
    }

    pub fn install_write_key(&mut self, aead: AeadContext) {
        self.write_ctx = aead;
        self.write_seq = 0;
    }

    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    pub fn read_seq(&self) -> u64 {
        self.read_seq
    }

    /// Restore sequence numbers from a handoff blob.
    pub fn restore_seqs(&mut self, read_seq: u64, write_seq: u64) {
        self.read_seq = read_seq;
        self.write_seq = write_seq;
    }

    /// Protect one outgoing record.
    pub fn encrypt_outgoing(&mut self, plain: PlainMessage) -> Result<OpaqueMessage, Error> {
        if self.write_seq >= MAX_TLS_SEQ {
            return Err(Error::SeqOverflow);
        }

        let seq = self.write_seq;

        let out = if self.write_ctx.is_null() {
            plain.into_unencrypted_opaque()
        } else if self.tls13_framing {
            let inner = wrap_tls13_inner(&plain.payload.0, plain.typ);
            let total_len = inner.len() + self.write_ctx.overhead();
            let aad = [
                ContentType::ApplicationData.get_u8(),
                0x03,
                0x03,
                (total_len >> 8) as u8,
                total_len as u8,
            ];
            let body = self.write_ctx.seal(seq, &aad, &inner)?;

            OpaqueMessage {
                typ: ContentType::ApplicationData,
                version: ProtocolVersion::TLSv1_2,
                payload: body,
            }
        } else {
            let aad = make_tls12_aad(seq, plain.typ, plain.version, plain.payload.len());
            let body = self.write_ctx.seal(seq, &aad, &plain.payload.0)?;

            OpaqueMessage {
                typ: plain.typ,
                version: plain.version,
                payload: body,
            }
        };

        self.write_seq += 1;
        Ok(out)
    }

    /// Open one incoming record. On error nothing advances, so a TLS caller
    /// can alert and a DTLS caller can drop.
    pub fn decrypt_incoming(&mut self, msg: OpaqueMessage) -> Result<PlainMessage, Error> {
        if self.read_ctx.is_null() {
            self.read_seq += 1;
            return Ok(msg.into_plain());
        }

        let seq = self.read_seq;

        let plain = if self.tls13_framing {
            // CCS records remain plaintext even after key install, for
            // middlebox compatibility.
            if msg.typ == ContentType::ChangeCipherSpec {
                return Ok(msg.into_plain());
            }

            if msg.typ != ContentType::ApplicationData {
                return Err(Error::UnexpectedRecord(msg.typ));
            }

            let aad = msg.header();
            let inner = self.read_ctx.open(seq, &aad, &msg.payload)?;
            if inner.len() > MAX_PLAINTEXT + 1 {
                return Err(Error::RecordOverflow);
            }
            let (typ, body) = unwrap_tls13_inner(inner)?;

            PlainMessage {
                typ,
                version: ProtocolVersion::TLSv1_3,
                payload: Payload(body),
            }
        } else {
            let plain_len = msg
                .payload
                .len()
                .checked_sub(self.read_ctx.overhead())
                .ok_or(Error::AeadAuth)?;
            let aad = make_tls12_aad(seq, msg.typ, msg.version, plain_len);
            let body = self.read_ctx.open(seq, &aad, &msg.payload)?;

            PlainMessage {
                typ: msg.typ,
                version: msg.version,
                payload: Payload(body),
            }
        };

        if plain.payload.len() > MAX_PLAINTEXT {
            return Err(Error::RecordOverflow);
        }

        self.read_seq += 1;
        Ok(plain)
    }
}

impl Default for RecordLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherForm;
    use crate::suites::TLS13_AES_128_GCM_SHA256;

    fn keyed_pair() -> (RecordLayer, RecordLayer) {
        let key = [5u8; 16];
        let iv = [6u8; 12];
        let mut a = RecordLayer::new();
        let mut b = RecordLayer::new();
        a.set_tls13_framing();
        b.set_tls13_framing();
        a.install_write_key(
            AeadContext::new(
                &TLS13_AES_128_GCM_SHA256,
                CipherForm::XorNonce,
                Direction::Seal,
                &key,
                &iv,
            )
            .unwrap(),
        );
        b.install_read_key(
            AeadContext::new(
                &TLS13_AES_128_GCM_SHA256,
                CipherForm::XorNonce,
                Direction::Open,
                &key,
                &iv,
            )
            .unwrap(),
        );
        (a, b)
    }

    #[test]
    fn tls13_seal_open_roundtrip() {
        let (mut tx, mut rx) = keyed_pair();
        let plain = PlainMessage::application_data(ProtocolVersion::TLSv1_3, b"GET / HTTP/1.1\r\n\r\n");
        let wire = tx.encrypt_outgoing(plain).unwrap();

        assert_eq!(wire.typ, ContentType::ApplicationData);
        // ciphertext = plaintext + inner type byte + tag
        assert_eq!(wire.payload.len(), 18 + 1 + 16);

        let got = rx.decrypt_incoming(wire).unwrap();
        assert_eq!(got.typ, ContentType::ApplicationData);
        assert_eq!(got.payload.0, b"GET / HTTP/1.1\r\n\r\n".to_vec());
    }

    #[test]
    fn sequences_advance_and_differ() {
        let (mut tx, mut rx) = keyed_pair();
        for i in 0..3u8 {
            let wire = tx
                .encrypt_outgoing(PlainMessage::application_data(
                    ProtocolVersion::TLSv1_3,
                    &[i],
                ))
                .unwrap();
            let got = rx.decrypt_incoming(wire).unwrap();
            assert_eq!(got.payload.0, vec![i]);
        }
        assert_eq!(tx.write_seq(), 3);
        assert_eq!(rx.read_seq(), 3);
    }

    #[test]
    fn key_install_rewinds_sequence() {
        let (mut tx, _) = keyed_pair();
        tx.encrypt_outgoing(PlainMessage::application_data(
            ProtocolVersion::TLSv1_3,
            b"x",
        ))
        .unwrap();
        assert_eq!(tx.write_seq(), 1);
        tx.install_write_key(AeadContext::null(Direction::Seal));
        assert_eq!(tx.write_seq(), 0);
    }

    #[test]
    fn reordered_record_fails_cleanly() {
        let (mut tx, mut rx) = keyed_pair();
        let first = tx
            .encrypt_outgoing(PlainMessage::application_data(
                ProtocolVersion::TLSv1_3,
                b"one",
            ))
            .unwrap();
        let second = tx
            .encrypt_outgoing(PlainMessage::application_data(
                ProtocolVersion::TLSv1_3,
                b"two",
            ))
            .unwrap();

        assert!(rx.decrypt_incoming(second).is_err());
        // stream transport: a bad record does not advance the sequence
        assert_eq!(rx.read_seq(), 0);
        assert!(rx.decrypt_incoming(first).is_ok());
    }
}
