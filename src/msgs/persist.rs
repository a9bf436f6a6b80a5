use crate::msgs::base::{PayloadU16, PayloadU24, PayloadU8};
use crate::msgs::codec::{self, put_u16, Codec, Reader};
use crate::msgs::enums::{CipherSuite, ProtocolVersion};
use crate::msgs::handshake::SessionID;
use crate::util::Zeroized;

/// Format version written at the front of every serialized session.
const SESSION_FORMAT_VERSION: u16 = 1;

/// Context tags for the optional trailing fields. Unknown tags are skipped
/// on read; absent tags take the field defaults.
mod tag {
    pub const TIME: u8 = 1;
    pub const TIMEOUT: u8 = 2;
    pub const PEER_CERT: u8 = 3;
    pub const SID_CTX: u8 = 4;
    pub const VERIFY_RESULT: u8 = 5;
    pub const HOSTNAME: u8 = 6;
    pub const PSK_IDENTITY_HINT: u8 = 7;
    pub const PSK_IDENTITY: u8 = 8;
    pub const TICKET_LIFETIME: u8 = 9;
    pub const TICKET: u8 = 10;
    pub const PEER_SHA256: u8 = 13;
    pub const ORIGINAL_HANDSHAKE_HASH: u8 = 14;
    pub const SCT_LIST: u8 = 15;
    pub const OCSP_RESPONSE: u8 = 16;
    pub const TICKET_AGE_ADD: u8 = 17;
    pub const ALPN: u8 = 18;
    pub const MAX_EARLY_DATA: u8 = 19;
}

/// Everything durable about one negotiated session; the unit the cache
/// stores and tickets carry. Immutable once the producing handshake
/// completes.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionValue {
    pub version: ProtocolVersion,
    pub cipher_suite: CipherSuite,
    pub session_id: SessionID,
    /// Master secret (TLS ≤1.2) or resumption PSK (TLS 1.3).
    pub master_secret: Zeroized,

    pub time_issued: u64,
    pub timeout_secs: u32,
    pub peer_cert_chain: Vec<PayloadU24>,
    pub session_id_context: Vec<u8>,
    pub verify_result: u32,
    pub hostname: Vec<u8>,
    pub psk_identity_hint: Vec<u8>,
    pub psk_identity: Vec<u8>,
    pub ticket_lifetime: u32,
    pub ticket: Vec<u8>,
    pub peer_sha256: Vec<u8>,
    pub original_handshake_hash: Vec<u8>,
    pub sct_list: Vec<u8>,
    pub ocsp_response: Vec<u8>,
    pub ticket_age_add: u32,
    pub alpn: Vec<u8>,
    pub max_early_data: u32,
}

impl SessionValue {
    pub fn new(
        version: ProtocolVersion,
        cipher_suite: CipherSuite,
        session_id: SessionID,
        master_secret: Zeroized,
        time_issued: u64,
    ) -> SessionValue {
        SessionValue {
            version,
            cipher_suite,
            session_id,
            master_secret,
            time_issued,
            timeout_secs: 7200,
            peer_cert_chain: Vec::new(),
            session_id_context: Vec::new(),
            verify_result: 0,
            hostname: Vec::new(),
            psk_identity_hint: Vec::new(),
            psk_identity: Vec::new(),
            ticket_lifetime: 0,
            ticket: Vec::new(),
            peer_sha256: Vec::new(),
            original_handshake_hash: Vec::new(),
            sct_list: Vec::new(),
            ocsp_response: Vec::new(),
            ticket_age_add: 0,
            alpn: Vec::new(),
            max_early_data: 0,
        }
    }

    pub fn has_expired(&self, now: u64) -> bool {
        now >= self.time_issued.saturating_add(u64::from(self.timeout_secs))
    }
}

fn encode_field(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    put_u16(value.len() as u16, out);
    out.extend_from_slice(value);
}

fn encode_field_u32(out: &mut Vec<u8>, tag: u8, value: u32) {
    if value != 0 {
        encode_field(out, tag, &value.to_be_bytes());
    }
}

fn decode_u32(value: &[u8]) -> Option<u32> {
    if value.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

impl Codec for SessionValue {
    fn encode(&self, bytes: &mut Vec<u8>) {
        SESSION_FORMAT_VERSION.encode(bytes);
        self.version.encode(bytes);
        self.cipher_suite.encode(bytes);
        self.session_id.encode(bytes);
        PayloadU16::new(self.master_secret.to_vec()).encode(bytes);

        if self.time_issued != 0 {
            encode_field(bytes, tag::TIME, &self.time_issued.to_be_bytes());
        }
        encode_field_u32(bytes, tag::TIMEOUT, self.timeout_secs);
        if !self.peer_cert_chain.is_empty() {
            let mut chain = Vec::new();
            codec::encode_vec_u24(&mut chain, &self.peer_cert_chain);
            encode_field(bytes, tag::PEER_CERT, &chain);
        }
        if !self.session_id_context.is_empty() {
            encode_field(bytes, tag::SID_CTX, &self.session_id_context);
        }
        encode_field_u32(bytes, tag::VERIFY_RESULT, self.verify_result);
        if !self.hostname.is_empty() {
            encode_field(bytes, tag::HOSTNAME, &self.hostname);
        }
        if !self.psk_identity_hint.is_empty() {
            encode_field(bytes, tag::PSK_IDENTITY_HINT, &self.psk_identity_hint);
        }
        if !self.psk_identity.is_empty() {
            encode_field(bytes, tag::PSK_IDENTITY, &self.psk_identity);
        }
        encode_field_u32(bytes, tag::TICKET_LIFETIME, self.ticket_lifetime);
        if !self.ticket.is_empty() {
            encode_field(bytes, tag::TICKET, &self.ticket);
        }
        if !self.peer_sha256.is_empty() {
            encode_field(bytes, tag::PEER_SHA256, &self.peer_sha256);
        }
        if !self.original_handshake_hash.is_empty() {
            encode_field(
                bytes,
                tag::ORIGINAL_HANDSHAKE_HASH,
                &self.original_handshake_hash,
            );
        }
        if !self.sct_list.is_empty() {
            encode_field(bytes, tag::SCT_LIST, &self.sct_list);
        }
        if !self.ocsp_response.is_empty() {
            encode_field(bytes, tag::OCSP_RESPONSE, &self.ocsp_response);
        }
        encode_field_u32(bytes, tag::TICKET_AGE_ADD, self.ticket_age_add);
        if !self.alpn.is_empty() {
            encode_field(bytes, tag::ALPN, &self.alpn);
        }
        encode_field_u32(bytes, tag::MAX_EARLY_DATA, self.max_early_data);
    }

    fn read(r: &mut Reader) -> Option<SessionValue> {
        let format = u16::read(r)?;
        if format != SESSION_FORMAT_VERSION {
            return None;
        }

        let version = ProtocolVersion::read(r)?;
        let cipher_suite = CipherSuite::read(r)?;
        let session_id = SessionID::read(r)?;
        let master_secret = Zeroized::new(PayloadU16::read(r)?.0);

        let mut out = SessionValue::new(version, cipher_suite, session_id, master_secret, 0);
        out.timeout_secs = 0;

        while r.any_left() {
            let field_tag = u8::read(r)?;
            let len = u16::read(r)? as usize;
            let value = r.take(len)?;

            match field_tag {
                tag::TIME => {
                    if value.len() != 8 {
                        return None;
                    }
                    out.time_issued = u64::from_be_bytes(value.try_into().ok()?);
                }
                tag::TIMEOUT => out.timeout_secs = decode_u32(value)?,
                tag::PEER_CERT => {
                    let mut sub = Reader::init(value);
                    out.peer_cert_chain = codec::read_vec_u24(&mut sub, 0xff_ffff)?;
                    if sub.any_left() {
                        return None;
                    }
                }
                tag::SID_CTX => out.session_id_context = value.to_vec(),
                tag::VERIFY_RESULT => out.verify_result = decode_u32(value)?,
                tag::HOSTNAME => out.hostname = value.to_vec(),
                tag::PSK_IDENTITY_HINT => out.psk_identity_hint = value.to_vec(),
                tag::PSK_IDENTITY => out.psk_identity = value.to_vec(),
                tag::TICKET_LIFETIME => out.ticket_lifetime = decode_u32(value)?,
                tag::TICKET => out.ticket = value.to_vec(),
                tag::PEER_SHA256 => out.peer_sha256 = value.to_vec(),
                tag::ORIGINAL_HANDSHAKE_HASH => out.original_handshake_hash = value.to_vec(),
                tag::SCT_LIST => out.sct_list = value.to_vec(),
                tag::OCSP_RESPONSE => out.ocsp_response = value.to_vec(),
                tag::TICKET_AGE_ADD => out.ticket_age_add = decode_u32(value)?,
                tag::ALPN => out.alpn = value.to_vec(),
                tag::MAX_EARLY_DATA => out.max_early_data = decode_u32(value)?,
                _ => {} // forward compatibility: skip
            }
        }

        Some(out)
    }
}

/// A reduced view a client keeps per ticket for TLS 1.3 resumption offers.
#[derive(Clone, Debug)]
pub struct Tls13ClientTicket {
    pub ticket: Vec<u8>,
    pub psk: Zeroized,
    pub age_add: u32,
    pub lifetime: u32,
    pub issued_at: u64,
    pub max_early_data: u32,
}

impl Tls13ClientTicket {
    pub fn obfuscated_age(&self, now_millis: u64, issued_at_millis: u64) -> u32 {
        let age = now_millis.saturating_sub(issued_at_millis) as u32;
        age.wrapping_add(self.age_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> SessionValue {
        let mut sv = SessionValue::new(
            ProtocolVersion::TLSv1_2,
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            SessionID::new(&[7; 32]),
            Zeroized::from_slice(&[0x55; 48]),
            1_700_000_000,
        );
        sv.timeout_secs = 300;
        sv.peer_cert_chain = vec![PayloadU24::new(vec![1, 2, 3]), PayloadU24::new(vec![4])];
        sv.session_id_context = vec![9];
        sv.verify_result = 0;
        sv.hostname = b"example.com".to_vec();
        sv.psk_identity_hint = b"hint".to_vec();
        sv.psk_identity = b"identity".to_vec();
        sv.ticket_lifetime = 7200;
        sv.ticket = vec![0xaa; 64];
        sv.peer_sha256 = vec![0xbb; 32];
        sv.original_handshake_hash = vec![0xcc; 32];
        sv.sct_list = vec![0xdd; 8];
        sv.ocsp_response = vec![0xee; 16];
        sv.ticket_age_add = 0x01020304;
        sv.alpn = b"h2".to_vec();
        sv.max_early_data = 16384;
        sv
    }

    #[test]
    fn full_roundtrip() {
        let sv = populated();
        let enc = sv.get_encoding();
        let got = SessionValue::read_bytes(&enc).expect("decode");
        assert_eq!(got, sv);
    }

    #[test]
    fn minimal_roundtrip_uses_defaults() {
        let sv = SessionValue::new(
            ProtocolVersion::TLSv1_3,
            CipherSuite::TLS13_AES_128_GCM_SHA256,
            SessionID::empty(),
            Zeroized::from_slice(&[1; 32]),
            0,
        );
        let got = SessionValue::read_bytes(&sv.get_encoding()).expect("decode");
        assert!(got.hostname.is_empty());
        assert_eq!(got.ticket_age_add, 0);
        assert_eq!(got.max_early_data, 0);
    }

    #[test]
    fn unknown_trailing_tags_ignored() {
        let sv = populated();
        let mut enc = sv.get_encoding();
        // append tag 200 with a 3-byte body
        enc.push(200);
        enc.extend_from_slice(&[0, 3, 1, 2, 3]);
        let got = SessionValue::read_bytes(&enc).expect("decode");
        assert_eq!(got, sv);
    }

    #[test]
    fn truncated_field_rejected() {
        let sv = populated();
        let enc = sv.get_encoding();
        assert!(SessionValue::read_bytes(&enc[..enc.len() - 1]).is_none());
    }

    #[test]
    fn wrong_format_version_rejected() {
        let sv = populated();
        let mut enc = sv.get_encoding();
        enc[0] = 0xff;
        assert!(SessionValue::read_bytes(&enc).is_none());
    }

    #[test]
    fn expiry_uses_issue_time_plus_timeout() {
        let sv = populated();
        assert!(!sv.has_expired(1_700_000_000 + 299));
        assert!(sv.has_expired(1_700_000_000 + 300));
    }
}
