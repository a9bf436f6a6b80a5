use std::io;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::cipher::{AeadContext, CipherForm, Direction};
use crate::dtls::{DtlsRecordLayer, HandshakeReassembler, TimeoutOutcome};
use crate::error::Error;
use crate::key_schedule::KeySchedule;
use crate::msgs::alert::AlertMessagePayload;
use crate::msgs::base::Payload;
use crate::msgs::ccs::ChangeCipherSpecPayload;
use crate::msgs::codec::Codec;
use crate::msgs::deframer::MessageDeframer;
use crate::msgs::dtls::encode_dtls_handshake_message;
use crate::msgs::enums::{
    AlertDescription, AlertLevel, ContentType, HandshakeType, ProtocolVersion,
};
use crate::msgs::fragmenter::MessageFragmenter;
use crate::msgs::hsjoiner::{HandshakeJoiner, JoinedMessage};
use crate::msgs::message::{decode_alert, PlainMessage, MAX_PLAINTEXT};
use crate::record_layer::RecordLayer;
use crate::suites::SupportedCipherSuite;

/// What the handshake driver needs before its next step can run.
///
/// `Ok` means run immediately; everything else suspends the loop until the
/// caller satisfies the condition (more input, drained output, a finished
/// asynchronous capability).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Wait {
    Ok,
    ReadMessage,
    ReadChangeCipherSpec,
    Flush,
    X509Lookup,
    ChannelIdLookup,
    PrivateKeyOperation,
    CertificateVerify,
    PendingTicket,
    EarlyDataRejected,
    EarlyReturn,
}

/// How many empty application-data records we tolerate in a row before
/// deciding the peer is abusive.
const MAX_EMPTY_APPDATA_RECORDS: u32 = 32;

/// Warning alerts tolerated per connection in TLS ≤1.2.
const MAX_WARNING_ALERTS: u32 = 4;

/// The transport personality of a connection.
pub(crate) enum Transport {
    Stream {
        deframer: MessageDeframer,
        record_layer: RecordLayer,
        joiner: HandshakeJoiner,
        /// Coalescing buffer of encoded handshake messages awaiting
        /// fragmentation into records.
        hs_run: Vec<u8>,
    },
    Datagram {
        layer: DtlsRecordLayer,
        reassembler: HandshakeReassembler,
        next_send_msg_seq: u16,
    },
}

/// State shared by client and server connections: record protection,
/// plaintext queues, alert and shutdown discipline, and the plumbing the
/// per-version handshake drivers call into.
pub(crate) struct ConnectionCore {
    pub transport: Transport,
    pub is_client: bool,
    pub negotiated_version: Option<ProtocolVersion>,
    pub suite: Option<&'static SupportedCipherSuite>,
    pub key_schedule: Option<KeySchedule>,
    pub alpn_protocol: Option<Vec<u8>>,

    fragmenter: MessageFragmenter,
    /// Encrypted bytes (or datagrams) waiting for the transport.
    sendable_tls: Vec<u8>,
    sendable_datagrams: Vec<Vec<u8>>,
    /// Decrypted application data waiting for the caller.
    received_plaintext: Vec<u8>,
    /// Application data written before the handshake finished.
    buffered_plaintext: Vec<u8>,

    error: Option<Error>,
    read_shutdown: bool,
    write_shutdown: bool,
    quiet_shutdown: bool,
    sent_close_notify: bool,

    /// TLS 1.3 tolerates exactly one middlebox-compat CCS.
    ccs_received: u32,
    empty_appdata_records: u32,
    warning_alerts: u32,

    /// Set while the handshake permits early application data out
    /// (False Start, 0-RTT).
    pub early_traffic_ok: bool,
    pub handshake_done: bool,

    /// TLS 1.3 secrets that outlive the handshake: application traffic
    /// secrets (for KeyUpdate) and the resumption master (for tickets).
    pub tls13_read_secret: Option<crate::util::Zeroized>,
    pub tls13_write_secret: Option<crate::util::Zeroized>,
    pub resumption_master: Option<crate::util::Zeroized>,
}

impl ConnectionCore {
    pub fn new_stream(is_client: bool, max_fragment: usize, quiet_shutdown: bool) -> ConnectionCore {
        ConnectionCore {
            transport: Transport::Stream {
                deframer: MessageDeframer::new(),
                record_layer: RecordLayer::new(),
                joiner: HandshakeJoiner::new(),
                hs_run: Vec::new(),
            },
            is_client,
            negotiated_version: None,
            suite: None,
            key_schedule: None,
            alpn_protocol: None,
            fragmenter: MessageFragmenter::new(max_fragment),
            sendable_tls: Vec::new(),
            sendable_datagrams: Vec::new(),
            received_plaintext: Vec::new(),
            buffered_plaintext: Vec::new(),
            error: None,
            read_shutdown: false,
            write_shutdown: false,
            quiet_shutdown,
            sent_close_notify: false,
            ccs_received: 0,
            empty_appdata_records: 0,
            warning_alerts: 0,
            early_traffic_ok: false,
            handshake_done: false,
            tls13_read_secret: None,
            tls13_write_secret: None,
            resumption_master: None,
        }
    }

    pub fn new_datagram(
        is_client: bool,
        version: ProtocolVersion,
        mtu: usize,
        quiet_shutdown: bool,
        max_message_len: usize,
    ) -> ConnectionCore {
        ConnectionCore {
            transport: Transport::Datagram {
                layer: DtlsRecordLayer::new(version, mtu),
                reassembler: HandshakeReassembler::new(max_message_len),
                next_send_msg_seq: 0,
            },
            is_client,
            negotiated_version: None,
            suite: None,
            key_schedule: None,
            alpn_protocol: None,
            fragmenter: MessageFragmenter::new(MAX_PLAINTEXT),
            sendable_tls: Vec::new(),
            sendable_datagrams: Vec::new(),
            received_plaintext: Vec::new(),
            buffered_plaintext: Vec::new(),
            error: None,
            read_shutdown: false,
            write_shutdown: false,
            quiet_shutdown,
            sent_close_notify: false,
            ccs_received: 0,
            empty_appdata_records: 0,
            warning_alerts: 0,
            early_traffic_ok: false,
            handshake_done: false,
            tls13_read_secret: None,
            tls13_write_secret: None,
            resumption_master: None,
        }
    }

    pub fn is_dtls(&self) -> bool {
        matches!(self.transport, Transport::Datagram { .. })
    }

    /// The record-layer protocol version to stamp on plaintext records.
    pub fn wire_version(&self) -> ProtocolVersion {
        match (&self.transport, self.negotiated_version) {
            (Transport::Datagram { .. }, Some(ProtocolVersion::DTLSv1_0)) => {
                ProtocolVersion::DTLSv1_0
            }
            (Transport::Datagram { .. }, _) => ProtocolVersion::DTLSv1_2,
            (Transport::Stream { .. }, Some(ProtocolVersion::TLSv1_0)) => {
                ProtocolVersion::TLSv1_0
            }
            // TLS 1.3 records carry the 1.2 legacy version.
            (Transport::Stream { .. }, _) => ProtocolVersion::TLSv1_2,
        }
    }

    // ---- error latch and shutdown ----

    pub fn latched_error(&self) -> Option<Error> {
        self.error.clone()
    }

    /// Latch a fatal error: emit its alert (once), shut down writes, and
    /// hand the error back for propagation.
    pub fn fatal(&mut self, err: Error) -> Error {
        if let Some(existing) = &self.error {
            return existing.clone();
        }

        if let Some(desc) = err.to_alert() {
            self.send_alert(AlertLevel::Fatal, desc);
        }
        warn!("connection failed: {}", err);
        self.error = Some(err.clone());
        self.write_shutdown = true;
        err
    }

    pub fn read_closed(&self) -> bool {
        self.read_shutdown
    }

    pub fn write_closed(&self) -> bool {
        self.write_shutdown
    }

    pub fn send_close_notify(&mut self) {
        if self.sent_close_notify || self.write_shutdown {
            return;
        }
        if !self.quiet_shutdown {
            self.send_alert(AlertLevel::Warning, AlertDescription::CloseNotify);
        }
        self.sent_close_notify = true;
        self.write_shutdown = true;
    }

    fn send_alert(&mut self, level: AlertLevel, desc: AlertDescription) {
        if self.write_shutdown {
            return;
        }
        let m = PlainMessage::alert(self.wire_version(), level, desc);
        // Best effort: a failing record layer cannot be reported anyway.
        let _ = self.send_plain_msg(m);
    }

    // ---- outgoing records ----

    /// Fragment, protect and queue one message.
    pub fn send_plain_msg(&mut self, msg: PlainMessage) -> Result<(), Error> {
        match &mut self.transport {
            Transport::Stream { record_layer, .. } => {
                let mut fragments = Vec::new();
                // The null cipher does not coalesce, and alert/CCS bodies are
                // small; fragmentation applies uniformly.
                self.fragmenter.fragment(msg, &mut fragments);
                for frag in fragments {
                    let wire = record_layer.encrypt_outgoing(frag)?;
                    self.sendable_tls.extend_from_slice(&wire.encode());
                }
                Ok(())
            }
            Transport::Datagram { layer, .. } => {
                layer.write_record(msg.typ, &msg.payload.0)?;
                self.sendable_datagrams.append(&mut layer.take_datagrams());
                Ok(())
            }
        }
    }

    /// Queue one handshake message and return the bytes the transcript
    /// must cover for it.
    pub fn send_hs_message(&mut self, typ: HandshakeType, body: Vec<u8>) -> Vec<u8> {
        match &mut self.transport {
            Transport::Stream { hs_run, .. } => {
                let mut encoded = Vec::with_capacity(4 + body.len());
                typ.encode(&mut encoded);
                crate::msgs::codec::u24(body.len() as u32).encode(&mut encoded);
                encoded.extend_from_slice(&body);
                hs_run.extend_from_slice(&encoded);
                encoded
            }
            Transport::Datagram {
                layer,
                next_send_msg_seq,
                ..
            } => {
                let msg_seq = *next_send_msg_seq;
                *next_send_msg_seq = next_send_msg_seq.wrapping_add(1);
                layer.queue_handshake_message(typ, msg_seq, &body);
                encode_dtls_handshake_message(typ, msg_seq, &body)
            }
        }
    }

    /// The message sequence the next outgoing DTLS handshake message will
    /// carry; zero on stream transports.
    pub fn peek_next_hs_msg_seq(&self) -> u16 {
        match &self.transport {
            Transport::Stream { .. } => 0,
            Transport::Datagram {
                next_send_msg_seq, ..
            } => *next_send_msg_seq,
        }
    }

    /// Queue a ChangeCipherSpec record inside the current flight.
    pub fn send_ccs(&mut self) -> Result<(), Error> {
        let version = self.wire_version();
        match &mut self.transport {
            Transport::Stream { .. } => {
                self.flush_hs_run()?;
                self.send_plain_msg(PlainMessage::change_cipher_spec(version))
            }
            Transport::Datagram { layer, .. } => {
                layer.queue_flight_record(
                    ContentType::ChangeCipherSpec,
                    ChangeCipherSpecPayload.get_encoding(),
                );
                Ok(())
            }
        }
    }

    /// Push the coalesced handshake run (TLS) or the assembled flight
    /// (DTLS) out to the record layer.
    pub fn flush_hs_run(&mut self) -> Result<(), Error> {
        let version = self.wire_version();
        match &mut self.transport {
            Transport::Stream {
                record_layer,
                hs_run,
                ..
            } => {
                if hs_run.is_empty() {
                    return Ok(());
                }
                let run = std::mem::take(hs_run);
                let mut fragments = Vec::new();
                self.fragmenter
                    .fragment_handshake_run(version, run, &mut fragments);
                for frag in fragments {
                    let wire = record_layer.encrypt_outgoing(frag)?;
                    self.sendable_tls.extend_from_slice(&wire.encode());
                }
                Ok(())
            }
            Transport::Datagram { layer, .. } => {
                if layer.flight_pending() {
                    layer.send_flight(Instant::now())?;
                    self.sendable_datagrams.append(&mut layer.take_datagrams());
                }
                Ok(())
            }
        }
    }

    /// The peer's reply arrived: release the retransmission flight.
    pub fn peer_flight_arrived(&mut self) {
        if let Transport::Datagram { layer, .. } = &mut self.transport {
            layer.release_flight();
        }
    }

    // ---- key transitions ----

    pub fn start_encryption_write(
        &mut self,
        suite: &'static SupportedCipherSuite,
        form: CipherForm,
        key: &[u8],
        iv: &[u8],
    ) -> Result<(), Error> {
        let aead = AeadContext::new(suite, form, Direction::Seal, key, iv)?;
        match &mut self.transport {
            Transport::Stream { record_layer, .. } => {
                record_layer.install_write_key(aead);
            }
            Transport::Datagram { layer, .. } => {
                let epoch = layer.write_epoch() + 1;
                layer.install_write_key(epoch, aead);
            }
        }
        Ok(())
    }

    pub fn start_encryption_read(
        &mut self,
        suite: &'static SupportedCipherSuite,
        form: CipherForm,
        key: &[u8],
        iv: &[u8],
    ) -> Result<(), Error> {
        let aead = AeadContext::new(suite, form, Direction::Open, key, iv)?;
        match &mut self.transport {
            Transport::Stream { record_layer, .. } => {
                record_layer.install_read_key(aead);
            }
            Transport::Datagram { layer, .. } => {
                let epoch = layer.read_epoch() + 1;
                layer.install_read_key(epoch, aead);
            }
        }
        Ok(())
    }

    pub fn set_tls13_framing(&mut self) {
        if let Transport::Stream { record_layer, .. } = &mut self.transport {
            record_layer.set_tls13_framing();
        }
    }

    /// Derive and install TLS 1.3 traffic keys from a traffic secret.
    pub fn install_tls13_write_secret(&mut self, secret: &[u8]) -> Result<(), Error> {
        let suite = self.suite.ok_or(Error::InternalError("no suite"))?;
        let ks = self
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let (key, iv) = ks.derive_traffic_keys(secret, suite.enc_key_len, suite.fixed_iv_len);
        self.start_encryption_write(suite, CipherForm::XorNonce, &key, &iv)
    }

    pub fn install_tls13_read_secret(&mut self, secret: &[u8]) -> Result<(), Error> {
        self.install_tls13_read_secret_at(secret, None)
    }

    /// As above, but pinning the DTLS epoch (stream transports ignore it).
    pub fn install_tls13_write_secret_at(
        &mut self,
        secret: &[u8],
        epoch: Option<u16>,
    ) -> Result<(), Error> {
        let suite = self.suite.ok_or(Error::InternalError("no suite"))?;
        let ks = self
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let (key, iv) = ks.derive_traffic_keys(secret, suite.enc_key_len, suite.fixed_iv_len);
        self.start_encryption_write_at(suite, CipherForm::XorNonce, &key, &iv, epoch)
    }

    pub fn install_tls13_read_secret_at(
        &mut self,
        secret: &[u8],
        epoch: Option<u16>,
    ) -> Result<(), Error> {
        let suite = self.suite.ok_or(Error::InternalError("no suite"))?;
        let ks = self
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let (key, iv) = ks.derive_traffic_keys(secret, suite.enc_key_len, suite.fixed_iv_len);
        self.start_encryption_read_at(suite, CipherForm::XorNonce, &key, &iv, epoch)
    }

    pub fn start_encryption_write_at(
        &mut self,
        suite: &'static SupportedCipherSuite,
        form: CipherForm,
        key: &[u8],
        iv: &[u8],
        epoch: Option<u16>,
    ) -> Result<(), Error> {
        let aead = AeadContext::new(suite, form, Direction::Seal, key, iv)?;
        match &mut self.transport {
            Transport::Stream { record_layer, .. } => {
                record_layer.install_write_key(aead);
            }
            Transport::Datagram { layer, .. } => {
                let epoch = epoch.unwrap_or(layer.write_epoch() + 1);
                layer.install_write_key(epoch, aead);
            }
        }
        Ok(())
    }

    pub fn start_encryption_read_at(
        &mut self,
        suite: &'static SupportedCipherSuite,
        form: CipherForm,
        key: &[u8],
        iv: &[u8],
        epoch: Option<u16>,
    ) -> Result<(), Error> {
        let aead = AeadContext::new(suite, form, Direction::Open, key, iv)?;
        match &mut self.transport {
            Transport::Stream { record_layer, .. } => {
                record_layer.install_read_key(aead);
            }
            Transport::Datagram { layer, .. } => {
                let epoch = epoch.unwrap_or(layer.read_epoch() + 1);
                layer.install_read_key(epoch, aead);
            }
        }
        Ok(())
    }

    // ---- post-handshake key update (TLS 1.3) ----

    /// Handle a peer KeyUpdate: advance our read secret, and answer when
    /// an update of our own was requested.
    pub fn handle_key_update(
        &mut self,
        request: crate::msgs::enums::KeyUpdateRequest,
    ) -> Result<(), Error> {
        let tls13 = self
            .negotiated_version
            .map_or(false, |v| v.is_tls13_family());
        if !tls13 || !self.handshake_done {
            return Err(Error::UnexpectedMessage {
                expect_types: vec![],
                got_type: HandshakeType::KeyUpdate,
            });
        }

        let ks = self
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let read_secret = self
            .tls13_read_secret
            .take()
            .ok_or(Error::InternalError("no read traffic secret"))?;
        let next_read = ks.next_traffic_secret(&read_secret);
        self.install_tls13_read_secret(&next_read)?;
        self.tls13_read_secret = Some(next_read);
        debug!("read traffic key updated");

        if request == crate::msgs::enums::KeyUpdateRequest::UpdateRequested {
            self.send_key_update(crate::msgs::enums::KeyUpdateRequest::UpdateNotRequested)?;
        }
        Ok(())
    }

    /// Emit a KeyUpdate and advance our write secret.
    pub fn send_key_update(
        &mut self,
        request: crate::msgs::enums::KeyUpdateRequest,
    ) -> Result<(), Error> {
        let mut body = Vec::new();
        request.encode(&mut body);
        self.send_hs_message(HandshakeType::KeyUpdate, body);
        self.flush_hs_run()?;

        let ks = self
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let write_secret = self
            .tls13_write_secret
            .take()
            .ok_or(Error::InternalError("no write traffic secret"))?;
        let next_write = ks.next_traffic_secret(&write_secret);
        self.install_tls13_write_secret(&next_write)?;
        self.tls13_write_secret = Some(next_write);
        debug!("write traffic key updated");
        Ok(())
    }

    // ---- incoming records ----

    /// Read transport bytes (stream transports).
    pub fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Stream { deframer, .. } => deframer.read(rd),
            Transport::Datagram { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram connection: use read_datagram",
            )),
        }
    }

    /// Feed one datagram (datagram transports).
    pub fn read_datagram_bytes(&mut self, datagram: &[u8]) -> Result<Vec<PlainMessage>, Error> {
        let version = self
            .negotiated_version
            .unwrap_or(ProtocolVersion::DTLSv1_2);
        match &mut self.transport {
            Transport::Datagram { layer, .. } => {
                let accepted = layer.read_datagram(datagram);
                Ok(accepted
                    .into_iter()
                    .map(|rec| PlainMessage {
                        typ: rec.typ,
                        version,
                        payload: Payload(rec.body),
                    })
                    .collect())
            }
            Transport::Stream { .. } => Err(Error::InternalError("stream connection")),
        }
    }

    /// Write queued transport bytes (stream transports).
    pub fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        let n = wr.write(&self.sendable_tls)?;
        self.sendable_tls.drain(..n);
        Ok(n)
    }

    /// Take queued datagrams (datagram transports).
    pub fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sendable_datagrams)
    }

    pub fn wants_write(&self) -> bool {
        !self.sendable_tls.is_empty() || !self.sendable_datagrams.is_empty()
    }

    pub fn output_drained(&self) -> bool {
        !self.wants_write()
    }

    /// Pull the next decrypted record off the stream transport.
    /// `Ok(None)` means more input is needed.
    pub fn next_stream_record(&mut self) -> Result<Option<PlainMessage>, Error> {
        let is_client = self.is_client;
        let handshaking = !self.handshake_done;
        match &mut self.transport {
            Transport::Stream {
                deframer,
                record_layer,
                ..
            } => {
                if let Some(opaque) = deframer.frames.pop_front() {
                    // Application data reaching a client whose read side is
                    // still the null cipher is the signature of a middlebox
                    // replaying our own bytes or injecting plaintext.
                    if is_client
                        && handshaking
                        && record_layer.read_is_null()
                        && opaque.typ == ContentType::ApplicationData
                    {
                        return Err(Error::MiddleboxInterference);
                    }
                    let plain = record_layer.decrypt_incoming(opaque)?;
                    return Ok(Some(plain));
                }

                if deframer.desynced {
                    if let Some(err) = deframer.non_tls_intro() {
                        return Err(err);
                    }
                    return Err(Error::DecodeError);
                }
                Ok(None)
            }
            Transport::Datagram { .. } => Err(Error::InternalError("stream read on datagram")),
        }
    }

    /// Route one decrypted record. Handshake bytes land in the joiner;
    /// alerts and application data are handled here.
    pub fn route_plaintext(&mut self, msg: PlainMessage) -> Result<RecordRouting, Error> {
        if msg.payload.len() > MAX_PLAINTEXT {
            return Err(Error::RecordOverflow);
        }

        match msg.typ {
            ContentType::Handshake => {
                if msg.payload.is_empty() {
                    return Err(Error::DecodeError);
                }
                match &mut self.transport {
                    Transport::Stream { joiner, .. } => {
                        joiner.take_record_body(&msg.payload.0)?;
                    }
                    Transport::Datagram { reassembler, .. } => {
                        reassembler.take_record_body(&msg.payload.0)?;
                    }
                }
                Ok(RecordRouting::Handshake)
            }
            ContentType::Alert => {
                self.process_alert(&msg.payload.0)?;
                Ok(RecordRouting::Consumed)
            }
            ContentType::ChangeCipherSpec => {
                ChangeCipherSpecPayload::read_bytes(&msg.payload.0).ok_or(Error::DecodeError)?;
                Ok(RecordRouting::ChangeCipherSpec)
            }
            ContentType::ApplicationData => {
                if self.read_shutdown {
                    return Err(Error::UnexpectedRecord(ContentType::ApplicationData));
                }

                if msg.payload.is_empty() {
                    self.empty_appdata_records += 1;
                    if self.empty_appdata_records > MAX_EMPTY_APPDATA_RECORDS {
                        return Err(Error::UnexpectedRecord(ContentType::ApplicationData));
                    }
                    return Ok(RecordRouting::Consumed);
                }
                self.empty_appdata_records = 0;
                self.received_plaintext.extend_from_slice(&msg.payload.0);
                Ok(RecordRouting::ApplicationData)
            }
            ContentType::Heartbeat | ContentType::Unknown(_) => {
                Err(Error::UnexpectedRecord(msg.typ))
            }
        }
    }

    /// Account for one received CCS record; TLS 1.3 accepts it exactly once.
    pub fn note_ccs_received(&mut self) -> Result<(), Error> {
        self.ccs_received += 1;
        let tls13 = self
            .negotiated_version
            .map_or(false, |v| v.is_tls13_family());
        if tls13 && self.ccs_received > 1 {
            return Err(Error::UnexpectedRecord(ContentType::ChangeCipherSpec));
        }
        Ok(())
    }

    fn process_alert(&mut self, body: &[u8]) -> Result<(), Error> {
        let alert: AlertMessagePayload = decode_alert(body)?;
        trace!("received alert {:?}", alert);

        if alert.description == AlertDescription::CloseNotify {
            self.read_shutdown = true;
            return Ok(());
        }

        if alert.level == AlertLevel::Warning {
            if alert.description == AlertDescription::UserCanceled {
                return Ok(());
            }

            let tls13 = self
                .negotiated_version
                .map_or(false, |v| v.is_tls13_family());
            if tls13 {
                // RFC 8446: everything else at warning level is an error.
                return Err(self.fatal(Error::AlertReceived(alert.description)));
            }

            self.warning_alerts += 1;
            if self.warning_alerts > MAX_WARNING_ALERTS {
                return Err(self.fatal(Error::UnexpectedRecord(ContentType::Alert)));
            }
            warn!("ignoring warning alert {:?}", alert.description);
            return Ok(());
        }

        // Fatal alerts latch without a reply alert of ours.
        self.error = Some(Error::AlertReceived(alert.description));
        self.write_shutdown = true;
        self.read_shutdown = true;
        Err(Error::AlertReceived(alert.description))
    }

    // ---- handshake message intake ----

    pub fn next_hs_message(&mut self) -> Result<Option<JoinedMessage>, Error> {
        match &mut self.transport {
            Transport::Stream { joiner, .. } => Ok(joiner.get_message()),
            Transport::Datagram { reassembler, .. } => {
                Ok(reassembler.get_message().map(|m| JoinedMessage {
                    typ: m.typ,
                    body: m.body,
                    transcript_bytes: m.transcript_bytes,
                }))
            }
        }
    }

    pub fn hs_buffer_empty(&self) -> bool {
        match &self.transport {
            Transport::Stream { joiner, .. } => joiner.is_empty(),
            Transport::Datagram { .. } => true,
        }
    }

    pub fn set_max_handshake_message_len(&mut self, max: usize) {
        if let Transport::Stream { joiner, .. } = &mut self.transport {
            joiner.set_max_message_len(max);
        }
    }

    // ---- plaintext I/O ----

    /// Application data out. Before completion, data is buffered unless the
    /// handshake has opened an early-traffic window.
    pub fn write_plaintext(&mut self, data: &[u8]) -> Result<usize, Error> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.write_shutdown || self.sent_close_notify {
            return Err(Error::Closed);
        }

        if !self.handshake_done && !self.early_traffic_ok {
            self.buffered_plaintext.extend_from_slice(data);
            return Ok(data.len());
        }

        let version = self.wire_version();
        let mut remaining = data;
        while !remaining.is_empty() {
            let take = remaining.len().min(self.fragmenter.max_fragment());
            self.send_plain_msg(PlainMessage::application_data(version, &remaining[..take]))?;
            remaining = &remaining[take..];
        }
        Ok(data.len())
    }

    /// Flush plaintext the caller wrote mid-handshake.
    pub fn flush_buffered_plaintext(&mut self) -> Result<(), Error> {
        if self.buffered_plaintext.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buffered_plaintext);
        let version = self.wire_version();
        let mut remaining = &data[..];
        while !remaining.is_empty() {
            let take = remaining.len().min(self.fragmenter.max_fragment());
            self.send_plain_msg(PlainMessage::application_data(version, &remaining[..take]))?;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.received_plaintext.is_empty() {
            if self.read_shutdown {
                return Ok(0);
            }
            if let Some(err) = &self.error {
                return Err(err.clone());
            }
            return Err(Error::WantRead);
        }

        let n = buf.len().min(self.received_plaintext.len());
        buf[..n].copy_from_slice(&self.received_plaintext[..n]);
        self.received_plaintext.drain(..n);
        Ok(n)
    }

    pub fn has_received_plaintext(&self) -> bool {
        !self.received_plaintext.is_empty()
    }

    // ---- DTLS timer ----

    pub fn handle_timeout(&mut self, now: Instant) -> Result<TimeoutOutcome, Error> {
        match &mut self.transport {
            Transport::Datagram { layer, .. } => {
                let outcome = layer.handle_timeout(now)?;
                if outcome == TimeoutOutcome::Retransmitted {
                    self.sendable_datagrams.append(&mut layer.take_datagrams());
                }
                Ok(outcome)
            }
            Transport::Stream { .. } => Ok(TimeoutOutcome::NoWork),
        }
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        match &self.transport {
            Transport::Datagram { layer, .. } => layer.next_timeout(),
            Transport::Stream { .. } => None,
        }
    }

    /// Direct access for the deframer-level first-flight checks the server
    /// needs (HTTP sniffing, V2ClientHello).
    pub fn stream_deframer_mut(&mut self) -> Option<&mut MessageDeframer> {
        match &mut self.transport {
            Transport::Stream { deframer, .. } => Some(deframer),
            Transport::Datagram { .. } => None,
        }
    }

    pub fn stream_record_layer_mut(&mut self) -> Option<&mut RecordLayer> {
        match &mut self.transport {
            Transport::Stream { record_layer, .. } => Some(record_layer),
            Transport::Datagram { .. } => None,
        }
    }

    /// Drop any partially received handshake bytes; used when a fatal
    /// error destroys the handshake.
    pub fn discard_partial_handshake(&mut self) {
        match &mut self.transport {
            Transport::Stream { joiner, .. } => {
                *joiner = HandshakeJoiner::new();
            }
            Transport::Datagram { .. } => {}
        }
        debug!("discarded partial handshake input");
    }
}

/// Where `route_plaintext` sent a record.
#[derive(Debug, PartialEq)]
pub enum RecordRouting {
    Handshake,
    ChangeCipherSpec,
    ApplicationData,
    Consumed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_core() -> ConnectionCore {
        ConnectionCore::new_stream(true, MAX_PLAINTEXT, false)
    }

    #[test]
    fn error_latches() {
        let mut core = stream_core();
        let first = core.fatal(Error::DecodeError);
        assert_eq!(first, Error::DecodeError);
        let second = core.fatal(Error::RecordOverflow);
        assert_eq!(second, Error::DecodeError);
        assert!(core.write_closed());
    }

    #[test]
    fn close_notify_sets_read_shutdown() {
        let mut core = stream_core();
        core.process_alert(&[1, 0]).unwrap();
        assert!(core.read_closed());
        // data after close_notify is rejected
        let msg = PlainMessage::application_data(ProtocolVersion::TLSv1_2, b"late");
        assert!(matches!(
            core.route_plaintext(msg),
            Err(Error::UnexpectedRecord(ContentType::ApplicationData))
        ));
    }

    #[test]
    fn user_canceled_is_ignored() {
        let mut core = stream_core();
        assert!(core.process_alert(&[1, 90]).is_ok());
        assert!(!core.read_closed());
    }

    #[test]
    fn tls13_warning_alerts_upgraded_to_fatal() {
        let mut core = stream_core();
        core.negotiated_version = Some(ProtocolVersion::TLSv1_3);
        let got = core.process_alert(&[1, 112]);
        assert_eq!(
            got,
            Err(Error::AlertReceived(AlertDescription::UnrecognisedName))
        );
    }

    #[test]
    fn fatal_alert_latches_without_reply() {
        let mut core = stream_core();
        let got = core.process_alert(&[2, 40]);
        assert_eq!(
            got,
            Err(Error::AlertReceived(AlertDescription::HandshakeFailure))
        );
        // no alert queued in response
        assert!(!core.wants_write());
    }

    #[test]
    fn empty_appdata_quota() {
        let mut core = stream_core();
        let empty = || PlainMessage::application_data(ProtocolVersion::TLSv1_2, b"");
        for _ in 0..MAX_EMPTY_APPDATA_RECORDS {
            assert_eq!(core.route_plaintext(empty()).unwrap(), RecordRouting::Consumed);
        }
        assert!(core.route_plaintext(empty()).is_err());
    }

    #[test]
    fn second_ccs_in_tls13_rejected() {
        let mut core = stream_core();
        core.negotiated_version = Some(ProtocolVersion::TLSv1_3);
        assert!(core.note_ccs_received().is_ok());
        assert_eq!(
            core.note_ccs_received(),
            Err(Error::UnexpectedRecord(ContentType::ChangeCipherSpec))
        );
    }

    #[test]
    fn plaintext_written_early_is_buffered_then_flushed() {
        let mut core = stream_core();
        assert_eq!(core.write_plaintext(b"early").unwrap(), 5);
        assert!(!core.wants_write());

        core.handshake_done = true;
        core.flush_buffered_plaintext().unwrap();
        assert!(core.wants_write());
    }

    #[test]
    fn quiet_shutdown_skips_close_notify() {
        let mut core = ConnectionCore::new_stream(true, MAX_PLAINTEXT, true);
        core.send_close_notify();
        assert!(!core.wants_write());
        assert!(core.write_closed());
    }
}
