/// DTLS wire formats: the classic 13-byte record header, the DTLS 1.3
/// unified header with its truncated sequence numbers, and the fragmented
/// handshake-message header.
use crate::msgs::codec::{put_u16, put_u48, read_u48, u24, Codec, Reader};
use crate::msgs::enums::{ContentType, HandshakeType, ProtocolVersion};

/// DTLS plaintext limit per record.
pub const MAX_DTLS_PLAINTEXT: usize = 16384;

/// DTLS 1.3 adds one inner content-type byte.
pub const MAX_DTLS13_INNER_PLAINTEXT: usize = MAX_DTLS_PLAINTEXT + 1;

/// Sequence numbers are 48-bit on the wire; this is the hard ceiling.
pub const MAX_DTLS_SEQ: u64 = (1 << 48) - 1;

pub const CLASSIC_HEADER_LEN: usize = 13;

/// Fixed bits of the DTLS 1.3 unified first byte: 0b001CSLEE.
const UNIFIED_FIXED_BITS: u8 = 0b0010_0000;
const UNIFIED_FIXED_MASK: u8 = 0b1110_0000;
const UNIFIED_BIT_CID: u8 = 0b0001_0000;
const UNIFIED_BIT_SEQ16: u8 = 0b0000_1000;
const UNIFIED_BIT_LENGTH: u8 = 0b0000_0100;
const UNIFIED_EPOCH_MASK: u8 = 0b0000_0011;

/// A record parsed from a datagram, normalized across header forms.
#[derive(Clone, Debug, PartialEq)]
pub struct DtlsRecord {
    pub typ: ContentType,
    pub version: ProtocolVersion,
    pub epoch: u16,
    pub seq: u64,
    /// The exact on-wire header bytes; the AEAD's associated data.
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    /// True when this record used the DTLS 1.3 unified header.
    pub unified: bool,
}

/// Parse a classic-header record from the front of `r`.
pub fn read_classic_record(r: &mut Reader) -> Option<DtlsRecord> {
    let start_left = r.left();
    let typ = ContentType::read(r)?;
    let version = ProtocolVersion::read(r)?;
    let epoch = u16::read(r)?;
    let seq = read_u48(r)?;
    let len = u16::read(r)? as usize;
    if len > MAX_DTLS_PLAINTEXT + 256 {
        return None;
    }
    let body = r.take(len)?.to_vec();

    let mut header = Vec::with_capacity(CLASSIC_HEADER_LEN);
    typ.encode(&mut header);
    version.encode(&mut header);
    put_u16(epoch, &mut header);
    put_u48(seq, &mut header);
    put_u16(len as u16, &mut header);
    debug_assert_eq!(start_left - r.left(), CLASSIC_HEADER_LEN + len);

    Some(DtlsRecord {
        typ,
        version,
        epoch,
        seq,
        header,
        body,
        unified: false,
    })
}

pub fn encode_classic_record(
    typ: ContentType,
    version: ProtocolVersion,
    epoch: u16,
    seq: u64,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(CLASSIC_HEADER_LEN + body.len());
    typ.encode(&mut out);
    version.encode(&mut out);
    put_u16(epoch, &mut out);
    put_u48(seq, &mut out);
    put_u16(body.len() as u16, &mut out);
    out.extend_from_slice(body);
    out
}

/// Whether the byte begins a DTLS 1.3 unified header.
pub fn is_unified_header(first: u8) -> bool {
    first & UNIFIED_FIXED_MASK == UNIFIED_FIXED_BITS
}

/// Reconstruct a full sequence number from its truncated wire form.
///
/// The wire value replaces the low bits of the highest sequence seen; if
/// the result does not exceed what we have seen, it belongs to the next
/// wrap of the truncated space.
pub fn reconstruct_sequence(wire_seq: u64, mask: u64, max_seen: u64) -> u64 {
    let mut seq = (wire_seq & mask) | (max_seen & !mask);
    if seq <= max_seen {
        seq = seq.wrapping_add(mask + 1);
    }
    seq & MAX_DTLS_SEQ
}

/// Reconstruct an epoch from its low two bits: the largest epoch not above
/// `current` whose low bits match.
pub fn reconstruct_epoch(wire_bits: u8, current: u16) -> Option<u16> {
    let bits = (wire_bits & UNIFIED_EPOCH_MASK) as u16;
    let mut candidate = (current & !0x3) | bits;
    if candidate > current {
        candidate = candidate.checked_sub(4)?;
    }
    Some(candidate)
}

/// Parse a unified-header record from the front of `r`.
///
/// `current_epoch` and `max_seen_seq` drive the implicit reconstruction.
/// Returns `None` for malformed headers and for connection IDs, which we
/// never negotiate.
pub fn read_unified_record(
    r: &mut Reader,
    current_epoch: u16,
    max_seen_seq: u64,
) -> Option<DtlsRecord> {
    let first = u8::read(r)?;
    debug_assert!(is_unified_header(first));

    if first & UNIFIED_BIT_CID != 0 {
        // Connection ID present but not negotiated.
        return None;
    }

    let mut header = vec![first];

    let (wire_seq, mask) = if first & UNIFIED_BIT_SEQ16 != 0 {
        let hi = u8::read(r)?;
        let lo = u8::read(r)?;
        header.push(hi);
        header.push(lo);
        (u64::from(hi) << 8 | u64::from(lo), 0xffffu64)
    } else {
        let b = u8::read(r)?;
        header.push(b);
        (u64::from(b), 0xffu64)
    };

    let body = if first & UNIFIED_BIT_LENGTH != 0 {
        let len = u16::read(r)? as usize;
        header.extend_from_slice(&(len as u16).to_be_bytes());
        if len > MAX_DTLS13_INNER_PLAINTEXT + 256 {
            return None;
        }
        r.take(len)?.to_vec()
    } else {
        r.rest().to_vec()
    };

    let epoch = reconstruct_epoch(first, current_epoch)?;
    let seq = reconstruct_sequence(wire_seq, mask, max_seen_seq);

    Some(DtlsRecord {
        typ: ContentType::ApplicationData,
        version: ProtocolVersion::DTLSv1_3,
        epoch,
        seq,
        header,
        body,
        unified: true,
    })
}

/// Emit a unified header for an outgoing encrypted record. We always use the
/// 16-bit sequence and explicit length forms.
pub fn encode_unified_record(epoch: u16, seq: u64, body: &[u8]) -> Vec<u8> {
    let first = UNIFIED_FIXED_BITS
        | UNIFIED_BIT_SEQ16
        | UNIFIED_BIT_LENGTH
        | (epoch as u8 & UNIFIED_EPOCH_MASK);

    let mut out = Vec::with_capacity(5 + body.len());
    out.push(first);
    out.extend_from_slice(&((seq & 0xffff) as u16).to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// The header prefix of an outgoing unified record, for use as AAD.
pub fn unified_header_of(record: &[u8]) -> &[u8] {
    &record[..5]
}

/// DTLS handshake-message header: the TLS form plus reassembly fields.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DtlsHandshakeHeader {
    pub typ: HandshakeType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

pub const DTLS_HANDSHAKE_HEADER_LEN: usize = 12;

impl Codec for DtlsHandshakeHeader {
    fn encode(&self, bytes: &mut Vec<u8>) {
        self.typ.encode(bytes);
        u24(self.length).encode(bytes);
        put_u16(self.message_seq, bytes);
        u24(self.fragment_offset).encode(bytes);
        u24(self.fragment_length).encode(bytes);
    }

    fn read(r: &mut Reader) -> Option<DtlsHandshakeHeader> {
        let hdr = DtlsHandshakeHeader {
            typ: HandshakeType::read(r)?,
            length: u24::read(r)?.0,
            message_seq: u16::read(r)?,
            fragment_offset: u24::read(r)?.0,
            fragment_length: u24::read(r)?.0,
        };

        if hdr
            .fragment_offset
            .checked_add(hdr.fragment_length)
            .map_or(true, |end| end > hdr.length)
        {
            return None;
        }

        Some(hdr)
    }
}

/// Encode a whole handshake message in DTLS form (unfragmented), which is
/// also the form the transcript hashes.
pub fn encode_dtls_handshake_message(typ: HandshakeType, message_seq: u16, body: &[u8]) -> Vec<u8> {
    let hdr = DtlsHandshakeHeader {
        typ,
        length: body.len() as u32,
        message_seq,
        fragment_offset: 0,
        fragment_length: body.len() as u32,
    };

    let mut out = Vec::with_capacity(DTLS_HANDSHAKE_HEADER_LEN + body.len());
    hdr.encode(&mut out);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_roundtrip() {
        let enc = encode_classic_record(
            ContentType::Handshake,
            ProtocolVersion::DTLSv1_2,
            1,
            0x0000_1234_5678,
            &[9, 9, 9],
        );
        let rec = read_classic_record(&mut Reader::init(&enc)).unwrap();
        assert_eq!(rec.typ, ContentType::Handshake);
        assert_eq!(rec.epoch, 1);
        assert_eq!(rec.seq, 0x0000_1234_5678);
        assert_eq!(rec.body, vec![9, 9, 9]);
        assert_eq!(rec.header, enc[..13].to_vec());
    }

    #[test]
    fn sequence_reconstruction_forward() {
        // max_seen 0x1234, 8-bit wire seq 0x56 -> 0x1256
        assert_eq!(reconstruct_sequence(0x56, 0xff, 0x1234), 0x1256);
    }

    #[test]
    fn sequence_reconstruction_wraps() {
        // wire value below the low bits of max_seen belongs to the next window
        assert_eq!(reconstruct_sequence(0x10, 0xff, 0x1234), 0x1310);
        // equal also wraps: a replay of max_seen itself is the replay
        // window's business, not reconstruction's
        assert_eq!(reconstruct_sequence(0x34, 0xff, 0x1234), 0x1334);
    }

    #[test]
    fn sequence_reconstruction_16bit() {
        assert_eq!(reconstruct_sequence(0x0001, 0xffff, 0x2_ffff), 0x3_0001);
        assert_eq!(reconstruct_sequence(0xfffe, 0xffff, 0x2_ffff), 0x2_fffe + 0x1_0000);
    }

    #[test]
    fn epoch_reconstruction() {
        assert_eq!(reconstruct_epoch(0b01, 3), Some(1));
        assert_eq!(reconstruct_epoch(0b11, 3), Some(3));
        assert_eq!(reconstruct_epoch(0b00, 3), Some(0));
        // current 5 (0b101): bits 0b11 -> 3
        assert_eq!(reconstruct_epoch(0b11, 5), Some(3));
        // bits above current with no prior wrap
        assert_eq!(reconstruct_epoch(0b10, 1), None);
    }

    #[test]
    fn unified_roundtrip() {
        let enc = encode_unified_record(3, 0x1_000a, b"ciphertext");
        assert!(is_unified_header(enc[0]));
        let rec = read_unified_record(&mut Reader::init(&enc), 3, 0x1_0005).unwrap();
        assert_eq!(rec.epoch, 3);
        assert_eq!(rec.seq, 0x1_000a);
        assert_eq!(rec.body, b"ciphertext".to_vec());
        assert_eq!(rec.header, enc[..5].to_vec());
    }

    #[test]
    fn unified_rejects_connection_id() {
        let mut enc = encode_unified_record(3, 1, b"x");
        enc[0] |= UNIFIED_BIT_CID;
        assert!(read_unified_record(&mut Reader::init(&enc), 3, 0).is_none());
    }

    #[test]
    fn dtls_handshake_header_bounds() {
        let mut enc = Vec::new();
        DtlsHandshakeHeader {
            typ: HandshakeType::ClientHello,
            length: 10,
            message_seq: 0,
            fragment_offset: 8,
            fragment_length: 4,
        }
        .encode(&mut enc);
        // offset 8 + len 4 > length 10
        assert!(DtlsHandshakeHeader::read_bytes(&enc).is_none());
    }
}
