//! The datagram record layer: header parsing for both DTLS generations,
//! epoch and sequence bookkeeping, replay rejection, flight retransmission
//! and handshake-message reassembly.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::cipher::{make_tls12_aad, unwrap_tls13_inner, wrap_tls13_inner, AeadContext};
use crate::error::Error;
use crate::msgs::codec::{Codec, Reader};
use crate::msgs::dtls::{
    encode_classic_record, encode_dtls_handshake_message, encode_unified_record,
    is_unified_header, read_classic_record, read_unified_record, DtlsHandshakeHeader, DtlsRecord,
    DTLS_HANDSHAKE_HEADER_LEN, MAX_DTLS_SEQ,
};
use crate::msgs::enums::{ContentType, HandshakeType, ProtocolVersion};

pub mod replay;

use replay::ReplayWindow;

/// Initial retransmit timeout; doubles per expiry.
pub const INITIAL_RTO: Duration = Duration::from_secs(1);
/// Cap on the doubled timeout (RFC 6347 §4.2.4.1).
pub const MAX_RTO: Duration = Duration::from_secs(60);
/// Give up after this many retransmissions of one flight.
pub const MAX_RETRANSMITS: u32 = 7;

/// Outcome of a timer poll.
#[derive(Debug, PartialEq)]
pub enum TimeoutOutcome {
    /// Timer not armed or not yet expired; nothing changed.
    NoWork,
    /// The flight was retransmitted; datagrams are queued.
    Retransmitted,
    /// Retransmission budget exhausted.
    Abandoned,
}

/// One plaintext record held for possible retransmission. Epoch is pinned
/// per record so a flight spanning a key change replays correctly.
#[derive(Clone, Debug)]
pub struct FlightRecord {
    pub typ: ContentType,
    pub plaintext: Vec<u8>,
    pub epoch: u16,
}

struct WriteEpochState {
    epoch: u16,
    ctx: AeadContext,
    next_seq: u64,
}

/// A partially reassembled incoming handshake message.
struct PartialMessage {
    typ: HandshakeType,
    length: usize,
    buf: Vec<u8>,
    /// Sorted, disjoint received [start, end) ranges.
    ranges: Vec<(usize, usize)>,
}

impl PartialMessage {
    fn new(typ: HandshakeType, length: usize) -> PartialMessage {
        PartialMessage {
            typ,
            length,
            buf: vec![0u8; length],
            ranges: Vec::new(),
        }
    }

    fn add_fragment(&mut self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        if end > self.length {
            return;
        }
        self.buf[offset..end].copy_from_slice(data);

        self.ranges.push((offset, end));
        self.ranges.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.ranges.len());
        for &(start, stop) in self.ranges.iter() {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(stop),
                _ => merged.push((start, stop)),
            }
        }
        self.ranges = merged;
    }

    fn complete(&self) -> bool {
        self.ranges == [(0, self.length)] || (self.length == 0 && self.ranges.is_empty())
    }
}

/// A complete handshake message delivered by the reassembler, with the
/// bytes the transcript must cover (the 12-byte DTLS header, unfragmented
/// form, plus body).
#[derive(Clone, Debug)]
pub struct DtlsJoinedMessage {
    pub typ: HandshakeType,
    pub message_seq: u16,
    pub body: Vec<u8>,
    pub transcript_bytes: Vec<u8>,
}

/// Reassembles handshake messages from record fragments and delivers them
/// in message-sequence order.
pub struct HandshakeReassembler {
    next_deliver_seq: u16,
    partial: BTreeMap<u16, PartialMessage>,
    max_message_len: usize,
}

impl HandshakeReassembler {
    pub fn new(max_message_len: usize) -> HandshakeReassembler {
        HandshakeReassembler {
            next_deliver_seq: 0,
            partial: BTreeMap::new(),
            max_message_len,
        }
    }

    pub fn next_deliver_seq(&self) -> u16 {
        self.next_deliver_seq
    }

    /// Feed the body of one handshake-typed record.
    pub fn take_record_body(&mut self, body: &[u8]) -> Result<(), Error> {
        let mut r = Reader::init(body);
        while r.any_left() {
            let hdr = DtlsHandshakeHeader::read(&mut r).ok_or(Error::DecodeError)?;
            if hdr.length as usize > self.max_message_len {
                return Err(Error::RecordOverflow);
            }
            let frag = r
                .take(hdr.fragment_length as usize)
                .ok_or(Error::DecodeError)?;

            // Old retransmits arrive below the delivery sequence; ignore.
            if hdr.message_seq < self.next_deliver_seq {
                trace!("ignoring retransmitted handshake msg_seq {}", hdr.message_seq);
                continue;
            }

            let entry = self
                .partial
                .entry(hdr.message_seq)
                .or_insert_with(|| PartialMessage::new(hdr.typ, hdr.length as usize));
            if entry.typ != hdr.typ || entry.length != hdr.length as usize {
                return Err(Error::DecodeError);
            }
            entry.add_fragment(hdr.fragment_offset as usize, frag);
        }
        Ok(())
    }

    /// Pop the next in-order complete message.
    pub fn get_message(&mut self) -> Option<DtlsJoinedMessage> {
        let seq = self.next_deliver_seq;
        let ready = self.partial.get(&seq).map_or(false, PartialMessage::complete);
        if !ready {
            return None;
        }

        let msg = self.partial.remove(&seq).unwrap();
        self.next_deliver_seq = self.next_deliver_seq.wrapping_add(1);

        let transcript_bytes = encode_dtls_handshake_message(msg.typ, seq, &msg.buf);
        Some(DtlsJoinedMessage {
            typ: msg.typ,
            message_seq: seq,
            body: msg.buf,
            transcript_bytes,
        })
    }
}

/// A record decrypted and accepted from a datagram.
#[derive(Debug)]
pub struct AcceptedRecord {
    pub typ: ContentType,
    pub epoch: u16,
    pub seq: u64,
    pub body: Vec<u8>,
}

/// The datagram record layer for one connection.
pub struct DtlsRecordLayer {
    version: ProtocolVersion,
    read_ctx: AeadContext,
    read_epoch: u16,
    replay: ReplayWindow,
    /// Write contexts per epoch still in retransmission scope; the last
    /// entry is current.
    write_states: Vec<WriteEpochState>,
    /// Payload budget per outgoing record.
    mtu: usize,

    // retransmission state
    flight: Vec<FlightRecord>,
    flight_expiry: Option<Instant>,
    current_rto: Duration,
    retransmit_count: u32,
    queued_datagrams: Vec<Vec<u8>>,
}

impl DtlsRecordLayer {
    pub fn new(version: ProtocolVersion, mtu: usize) -> DtlsRecordLayer {
        debug_assert!(version.is_dtls());
        DtlsRecordLayer {
            version,
            read_ctx: AeadContext::null(crate::cipher::Direction::Open),
            read_epoch: 0,
            replay: ReplayWindow::new(),
            write_states: vec![WriteEpochState {
                epoch: 0,
                ctx: AeadContext::null(crate::cipher::Direction::Seal),
                next_seq: 0,
            }],
            mtu,
            flight: Vec::new(),
            flight_expiry: None,
            current_rto: INITIAL_RTO,
            retransmit_count: 0,
            queued_datagrams: Vec::new(),
        }
    }

    pub fn is_tls13(&self) -> bool {
        self.version == ProtocolVersion::DTLSv1_3
    }

    pub fn read_epoch(&self) -> u16 {
        self.read_epoch
    }

    pub fn write_epoch(&self) -> u16 {
        self.write_states.last().map(|ws| ws.epoch).unwrap_or(0)
    }

    /// Install the read key for the next epoch; the replay window restarts.
    pub fn install_read_key(&mut self, epoch: u16, aead: AeadContext) {
        debug!("dtls: read key installed for epoch {}", epoch);
        self.read_ctx = aead;
        self.read_epoch = epoch;
        self.replay.reset();
    }

    /// Install the write key for the next epoch. Prior epochs stay sealable
    /// until the flight they carry is released.
    pub fn install_write_key(&mut self, epoch: u16, aead: AeadContext) {
        debug!("dtls: write key installed for epoch {}", epoch);
        self.write_states.push(WriteEpochState {
            epoch,
            ctx: aead,
            next_seq: 0,
        });
    }

    fn write_state_mut(&mut self, epoch: u16) -> Result<&mut WriteEpochState, Error> {
        self.write_states
            .iter_mut()
            .find(|ws| ws.epoch == epoch)
            .ok_or(Error::InternalError("write epoch retired"))
    }

    /// Seal one record under the given epoch and return its wire bytes.
    fn seal_record(&mut self, typ: ContentType, plaintext: &[u8], epoch: u16) -> Result<Vec<u8>, Error> {
        let version = self.version;
        let tls13 = self.is_tls13();
        let ws = self.write_state_mut(epoch)?;

        if ws.next_seq > MAX_DTLS_SEQ {
            return Err(Error::SeqOverflow);
        }
        let seq = ws.next_seq;
        ws.next_seq += 1;

        if ws.ctx.is_null() {
            // Plaintext records use the classic header in every DTLS version.
            let wire_version = if version == ProtocolVersion::DTLSv1_3 {
                ProtocolVersion::DTLSv1_2
            } else {
                version
            };
            return Ok(encode_classic_record(typ, wire_version, epoch, seq, plaintext));
        }

        if tls13 {
            let inner = wrap_tls13_inner(plaintext, typ);
            // Seal against the final header; lengths are known up front.
            let body_len = inner.len() + ws.ctx.overhead();
            let shell = encode_unified_record(epoch, seq, &vec![0u8; body_len]);
            let aad = &shell[..5];
            // The AEAD nonce mixes the full 48-bit sequence with the epoch
            // in the high bits per RFC 9147 §4.2.2's record number.
            let record_number = (u64::from(epoch) << 48) | seq;
            let body = ws.ctx.seal(record_number, aad, &inner)?;
            let mut out = shell[..5].to_vec();
            out.extend_from_slice(&body);
            Ok(out)
        } else {
            let aad = {
                let mut aad = [0u8; 13];
                let epoch_seq = (u64::from(epoch) << 48) | seq;
                aad[..8].copy_from_slice(&epoch_seq.to_be_bytes());
                aad[8] = typ.get_u8();
                aad[9..11].copy_from_slice(&version.get_u16().to_be_bytes());
                aad[11..13].copy_from_slice(&(plaintext.len() as u16).to_be_bytes());
                aad
            };
            let epoch_seq = (u64::from(epoch) << 48) | seq;
            let body = ws.ctx.seal(epoch_seq, &aad, plaintext)?;
            Ok(encode_classic_record(typ, version, epoch, seq, &body))
        }
    }

    /// Send one record immediately, outside any flight (application data,
    /// alerts).
    pub fn write_record(&mut self, typ: ContentType, plaintext: &[u8]) -> Result<(), Error> {
        let epoch = self.write_epoch();
        let wire = self.seal_record(typ, plaintext, epoch)?;
        self.queued_datagrams.push(wire);
        Ok(())
    }

    /// Add a record to the current outgoing flight.
    pub fn queue_flight_record(&mut self, typ: ContentType, plaintext: Vec<u8>) {
        let epoch = self.write_epoch();
        self.flight.push(FlightRecord {
            typ,
            plaintext,
            epoch,
        });
    }

    /// Transmit the current flight and arm the retransmit timer.
    pub fn send_flight(&mut self, now: Instant) -> Result<(), Error> {
        let records = self.flight.clone();
        for rec in &records {
            let wire = self.seal_record(rec.typ, &rec.plaintext, rec.epoch)?;
            self.queued_datagrams.push(wire);
        }
        self.current_rto = INITIAL_RTO;
        self.retransmit_count = 0;
        self.flight_expiry = Some(now + self.current_rto);
        Ok(())
    }

    /// The peer's next flight arrived: the held flight is acknowledged.
    /// Retires write epochs older than the current one.
    pub fn release_flight(&mut self) {
        self.flight.clear();
        self.flight_expiry = None;
        self.current_rto = INITIAL_RTO;
        self.retransmit_count = 0;
        if self.write_states.len() > 1 {
            let keep = self.write_states.len() - 1;
            self.write_states.drain(..keep);
        }
    }

    pub fn flight_pending(&self) -> bool {
        !self.flight.is_empty()
    }

    /// Idempotent timer poll: retransmits the flight with a doubled,
    /// capped timeout if expired, and reports `NoWork` otherwise.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<TimeoutOutcome, Error> {
        let expiry = match self.flight_expiry {
            None => return Ok(TimeoutOutcome::NoWork),
            Some(expiry) => expiry,
        };
        if now < expiry {
            return Ok(TimeoutOutcome::NoWork);
        }

        if self.retransmit_count >= MAX_RETRANSMITS {
            self.flight_expiry = None;
            return Ok(TimeoutOutcome::Abandoned);
        }

        self.retransmit_count += 1;
        self.current_rto = (self.current_rto * 2).min(MAX_RTO);
        self.flight_expiry = Some(now + self.current_rto);

        debug!(
            "dtls: retransmit #{} of {} records",
            self.retransmit_count,
            self.flight.len()
        );
        let records = self.flight.clone();
        for rec in &records {
            let wire = self.seal_record(rec.typ, &rec.plaintext, rec.epoch)?;
            self.queued_datagrams.push(wire);
        }
        Ok(TimeoutOutcome::Retransmitted)
    }

    /// When the armed timer will fire, if any.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.flight_expiry
    }

    /// Take everything queued for the transport.
    pub fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.queued_datagrams)
    }

    /// Process one datagram: every well-formed, fresh, authentic record is
    /// returned; everything else is dropped without error.
    pub fn read_datagram(&mut self, datagram: &[u8]) -> Vec<AcceptedRecord> {
        let mut out = Vec::new();
        let mut r = Reader::init(datagram);

        while r.any_left() {
            let record = if is_unified_header(datagram[datagram.len() - r.left()]) {
                if !self.is_tls13() {
                    trace!("dtls: unified header outside DTLS 1.3, dropping datagram rest");
                    return out;
                }
                match read_unified_record(&mut r, self.read_epoch, self.replay.max_seq()) {
                    Some(rec) => rec,
                    None => return out,
                }
            } else {
                match read_classic_record(&mut r) {
                    Some(rec) => rec,
                    None => return out,
                }
            };

            if let Some(accepted) = self.process_record(record) {
                out.push(accepted);
            }
        }
        out
    }

    fn process_record(&mut self, record: DtlsRecord) -> Option<AcceptedRecord> {
        if record.epoch != self.read_epoch {
            trace!(
                "dtls: dropping record for epoch {} (current {})",
                record.epoch,
                self.read_epoch
            );
            return None;
        }

        if !self.replay.is_fresh(record.seq) {
            trace!("dtls: dropping replayed seq {}", record.seq);
            return None;
        }

        let (typ, body) = if self.read_ctx.is_null() {
            if record.unified {
                return None;
            }
            (record.typ, record.body)
        } else {
            let record_number = (u64::from(record.epoch) << 48) | record.seq;
            if record.unified {
                let inner = match self.read_ctx.open(record_number, &record.header, &record.body) {
                    Ok(inner) => inner,
                    Err(_) => {
                        trace!("dtls: AEAD failure, dropping record silently");
                        return None;
                    }
                };
                match unwrap_tls13_inner(inner) {
                    Ok((typ, body)) => (typ, body),
                    Err(_) => return None,
                }
            } else {
                let plain_len = record.body.len().checked_sub(self.read_ctx.overhead())?;
                let aad = {
                    let mut aad = make_tls12_aad(0, record.typ, record.version, plain_len);
                    let epoch_seq = (u64::from(record.epoch) << 48) | record.seq;
                    aad[..8].copy_from_slice(&epoch_seq.to_be_bytes());
                    aad
                };
                match self.read_ctx.open(record_number, &aad, &record.body) {
                    Ok(body) => (record.typ, body),
                    Err(_) => {
                        trace!("dtls: AEAD failure, dropping record silently");
                        return None;
                    }
                }
            }
        };

        // Only now is the record proven authentic.
        self.replay.mark(record.seq);

        Some(AcceptedRecord {
            typ,
            epoch: record.epoch,
            seq: record.seq,
            body,
        })
    }

    /// Fragment one handshake message into flight records within the MTU.
    pub fn queue_handshake_message(&mut self, typ: HandshakeType, message_seq: u16, body: &[u8]) {
        let budget = self.mtu.saturating_sub(DTLS_HANDSHAKE_HEADER_LEN).max(64);

        if body.len() <= budget {
            let encoded = encode_dtls_handshake_message(typ, message_seq, body);
            self.queue_flight_record(ContentType::Handshake, encoded);
            return;
        }

        let mut offset = 0usize;
        while offset < body.len() {
            let take = (body.len() - offset).min(budget);
            let hdr = DtlsHandshakeHeader {
                typ,
                length: body.len() as u32,
                message_seq,
                fragment_offset: offset as u32,
                fragment_length: take as u32,
            };
            let mut rec = Vec::with_capacity(DTLS_HANDSHAKE_HEADER_LEN + take);
            hdr.encode(&mut rec);
            rec.extend_from_slice(&body[offset..offset + take]);
            self.queue_flight_record(ContentType::Handshake, rec);
            offset += take;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherForm, Direction};
    use crate::suites::TLS13_AES_128_GCM_SHA256;

    fn layer(version: ProtocolVersion) -> DtlsRecordLayer {
        DtlsRecordLayer::new(version, 1200)
    }

    fn keyed_13_pair() -> (DtlsRecordLayer, DtlsRecordLayer) {
        let key = [3u8; 16];
        let iv = [4u8; 12];
        let mut tx = layer(ProtocolVersion::DTLSv1_3);
        let mut rx = layer(ProtocolVersion::DTLSv1_3);
        tx.install_write_key(
            3,
            AeadContext::new(
                &TLS13_AES_128_GCM_SHA256,
                CipherForm::XorNonce,
                Direction::Seal,
                &key,
                &iv,
            )
            .unwrap(),
        );
        rx.install_read_key(
            3,
            AeadContext::new(
                &TLS13_AES_128_GCM_SHA256,
                CipherForm::XorNonce,
                Direction::Open,
                &key,
                &iv,
            )
            .unwrap(),
        );
        (tx, rx)
    }

    #[test]
    fn plaintext_record_roundtrip() {
        let mut tx = layer(ProtocolVersion::DTLSv1_2);
        let mut rx = layer(ProtocolVersion::DTLSv1_2);
        tx.write_record(ContentType::Handshake, b"hello").unwrap();
        let datagrams = tx.take_datagrams();
        assert_eq!(datagrams.len(), 1);
        let recs = rx.read_datagram(&datagrams[0]);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].body, b"hello".to_vec());
        assert_eq!(recs[0].epoch, 0);
    }

    #[test]
    fn dtls13_encrypted_roundtrip_and_replay() {
        let (mut tx, mut rx) = keyed_13_pair();
        tx.write_record(ContentType::ApplicationData, b"datum")
            .unwrap();
        let wire = tx.take_datagrams().remove(0);

        let first = rx.read_datagram(&wire);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].typ, ContentType::ApplicationData);
        assert_eq!(first[0].body, b"datum".to_vec());

        // exact replay: silently dropped
        let second = rx.read_datagram(&wire);
        assert!(second.is_empty());

        // next record still accepted
        tx.write_record(ContentType::ApplicationData, b"datum2")
            .unwrap();
        let wire2 = tx.take_datagrams().remove(0);
        let third = rx.read_datagram(&wire2);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].body, b"datum2".to_vec());
    }

    #[test]
    fn wrong_epoch_dropped_silently() {
        let (mut tx, mut rx) = keyed_13_pair();
        rx.install_read_key(
            // rx moves on to epoch 4 with a different key
            4,
            AeadContext::null(Direction::Open),
        );
        tx.write_record(ContentType::ApplicationData, b"old epoch")
            .unwrap();
        let wire = tx.take_datagrams().remove(0);
        assert!(rx.read_datagram(&wire).is_empty());
    }

    #[test]
    fn corrupt_record_dropped_and_window_untouched() {
        let (mut tx, mut rx) = keyed_13_pair();
        tx.write_record(ContentType::ApplicationData, b"payload")
            .unwrap();
        let mut wire = tx.take_datagrams().remove(0);
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(rx.read_datagram(&wire).is_empty());
        assert!(!rx.replay.seen_any());
    }

    #[test]
    fn timeout_is_idempotent_before_expiry() {
        let mut tx = layer(ProtocolVersion::DTLSv1_2);
        let now = Instant::now();
        assert_eq!(tx.handle_timeout(now).unwrap(), TimeoutOutcome::NoWork);

        tx.queue_flight_record(ContentType::Handshake, b"m".to_vec());
        tx.send_flight(now).unwrap();
        tx.take_datagrams();
        assert_eq!(tx.handle_timeout(now).unwrap(), TimeoutOutcome::NoWork);
        assert!(tx.take_datagrams().is_empty());
    }

    #[test]
    fn timeout_retransmits_whole_flight_with_doubled_timer() {
        let mut tx = layer(ProtocolVersion::DTLSv1_2);
        let now = Instant::now();
        tx.queue_flight_record(ContentType::Handshake, b"one".to_vec());
        tx.queue_flight_record(ContentType::ChangeCipherSpec, vec![1]);
        tx.queue_flight_record(ContentType::Handshake, b"fin".to_vec());
        tx.send_flight(now).unwrap();
        assert_eq!(tx.take_datagrams().len(), 3);

        let later = now + INITIAL_RTO + Duration::from_millis(1);
        assert_eq!(
            tx.handle_timeout(later).unwrap(),
            TimeoutOutcome::Retransmitted
        );
        assert_eq!(tx.take_datagrams().len(), 3);
        // timer doubled
        let expiry = tx.next_timeout().unwrap();
        assert!(expiry >= later + INITIAL_RTO * 2 - Duration::from_millis(2));
    }

    #[test]
    fn release_flight_disarms_timer() {
        let mut tx = layer(ProtocolVersion::DTLSv1_2);
        let now = Instant::now();
        tx.queue_flight_record(ContentType::Handshake, b"m".to_vec());
        tx.send_flight(now).unwrap();
        tx.release_flight();
        assert_eq!(
            tx.handle_timeout(now + Duration::from_secs(120)).unwrap(),
            TimeoutOutcome::NoWork
        );
    }

    #[test]
    fn reassembler_handles_fragments_out_of_order() {
        let mut reasm = HandshakeReassembler::new(1 << 16);
        let body = vec![0x5au8; 100];

        let frag = |offset: usize, len: usize| {
            let hdr = DtlsHandshakeHeader {
                typ: HandshakeType::Certificate,
                length: 100,
                message_seq: 0,
                fragment_offset: offset as u32,
                fragment_length: len as u32,
            };
            let mut rec = Vec::new();
            hdr.encode(&mut rec);
            rec.extend_from_slice(&body[offset..offset + len]);
            rec
        };

        reasm.take_record_body(&frag(60, 40)).unwrap();
        assert!(reasm.get_message().is_none());
        reasm.take_record_body(&frag(0, 60)).unwrap();
        let msg = reasm.get_message().unwrap();
        assert_eq!(msg.typ, HandshakeType::Certificate);
        assert_eq!(msg.body, body);
        assert_eq!(
            msg.transcript_bytes,
            encode_dtls_handshake_message(HandshakeType::Certificate, 0, &body)
        );
    }

    #[test]
    fn reassembler_delivers_in_message_seq_order() {
        let mut reasm = HandshakeReassembler::new(1 << 16);
        let msg = |seq: u16, typ: HandshakeType, body: &[u8]| {
            encode_dtls_handshake_message(typ, seq, body)
        };

        reasm
            .take_record_body(&msg(1, HandshakeType::ServerHello, b"sh"))
            .unwrap();
        assert!(reasm.get_message().is_none());
        reasm
            .take_record_body(&msg(0, HandshakeType::HelloVerifyRequest, b"hvr"))
            .unwrap();
        assert_eq!(
            reasm.get_message().unwrap().typ,
            HandshakeType::HelloVerifyRequest
        );
        assert_eq!(reasm.get_message().unwrap().typ, HandshakeType::ServerHello);
    }

    #[test]
    fn oversized_message_rejected() {
        let mut reasm = HandshakeReassembler::new(64);
        let rec = encode_dtls_handshake_message(HandshakeType::Certificate, 0, &[0u8; 65]);
        assert_eq!(reasm.take_record_body(&rec), Err(Error::RecordOverflow));
    }

    #[test]
    fn large_message_fragments_within_mtu() {
        let mut tx = layer(ProtocolVersion::DTLSv1_2);
        let body = vec![7u8; 3000];
        tx.queue_handshake_message(HandshakeType::Certificate, 2, &body);
        assert!(tx.flight.len() >= 3);

        let mut reasm = HandshakeReassembler::new(1 << 16);
        // deliver the first two messages out of order to exercise reassembly
        reasm.next_deliver_seq = 2;
        for rec in tx.flight.iter().rev() {
            reasm.take_record_body(&rec.plaintext).unwrap();
        }
        let got = reasm.get_message().unwrap();
        assert_eq!(got.body, body);
    }
}
