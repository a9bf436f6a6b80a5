use std::io;
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use crate::client_hs::ClientHandshake;
use crate::conn::{ConnectionCore, RecordRouting, Wait};
use crate::dtls::TimeoutOutcome;
use crate::error::Error;
use crate::msgs::codec::Codec;
use crate::msgs::enums::{HandshakeType, KeyUpdateRequest, NamedGroup, ProtocolVersion};
use crate::msgs::hsjoiner::MAX_CLIENT_HANDSHAKE_MESSAGE_LEN;
use crate::msgs::message::MAX_PLAINTEXT;
use crate::rand::{Rng, SystemRng};
use crate::session::{ClientSessionStore, SessionCacheMode};
use crate::sign::CertifiedKey;
use crate::suites::{SupportedCipherSuite, ALL_CIPHERSUITES, SUPPORTED_GROUPS};
use crate::verify::ServerCertVerifier;

/// How a client treats server-initiated renegotiation (TLS ≤1.2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenegotiationMode {
    Never,
    Freely,
    Ignore,
    Once,
}

/// Everything a client connection is configured with; shared, immutable.
pub struct ClientConfig {
    pub cipher_suites: Vec<&'static SupportedCipherSuite>,
    pub supported_groups: Vec<NamedGroup>,
    pub min_version: ProtocolVersion,
    pub max_version: ProtocolVersion,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub verifier: Arc<dyn ServerCertVerifier>,
    pub session_store: Arc<ClientSessionStore>,
    pub session_cache_mode: SessionCacheMode,
    pub max_send_fragment: usize,
    pub max_cert_list: usize,
    pub quiet_shutdown: bool,
    /// Offer a client certificate when the server asks.
    pub client_auth_cert: Option<Arc<CertifiedKey>>,
    /// Permit application data after our TLS 1.2 Finished, before the
    /// server's (False Start).
    pub enable_false_start: bool,
    /// Offer 0-RTT when resuming with a ticket that permits it.
    pub enable_early_data: bool,
    pub renegotiation_mode: RenegotiationMode,
    pub rng: Arc<dyn Rng>,
}

impl ClientConfig {
    pub fn new(verifier: Arc<dyn ServerCertVerifier>) -> ClientConfig {
        ClientConfig {
            cipher_suites: ALL_CIPHERSUITES.to_vec(),
            supported_groups: SUPPORTED_GROUPS.to_vec(),
            min_version: ProtocolVersion::TLSv1_2,
            max_version: ProtocolVersion::TLSv1_3,
            alpn_protocols: Vec::new(),
            verifier,
            session_store: Arc::new(ClientSessionStore::new()),
            session_cache_mode: SessionCacheMode::Both,
            max_send_fragment: MAX_PLAINTEXT,
            max_cert_list: MAX_CLIENT_HANDSHAKE_MESSAGE_LEN,
            quiet_shutdown: false,
            client_auth_cert: None,
            enable_false_start: false,
            enable_early_data: false,
            renegotiation_mode: RenegotiationMode::Never,
            rng: Arc::new(SystemRng::new()),
        }
    }
}

/// One endpoint of a client-side TLS or DTLS association.
pub struct ClientConnection {
    pub(crate) core: ConnectionCore,
    pub(crate) hs: Option<ClientHandshake>,
    config: Arc<ClientConfig>,
    server_name: String,
}

impl ClientConnection {
    /// A stream-transport (TLS) client for `server_name`.
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<ClientConnection, Error> {
        let mut core = ConnectionCore::new_stream(
            true,
            config.max_send_fragment,
            config.quiet_shutdown,
        );
        core.set_max_handshake_message_len(config.max_cert_list);

        let hs = ClientHandshake::new(Arc::clone(&config), server_name, false)?;
        let mut conn = ClientConnection {
            core,
            hs: Some(hs),
            config,
            server_name: server_name.to_string(),
        };
        conn.advance()?;
        Ok(conn)
    }

    /// A datagram-transport (DTLS) client.
    pub fn new_dtls(
        config: Arc<ClientConfig>,
        server_name: &str,
        version: ProtocolVersion,
        mtu: usize,
    ) -> Result<ClientConnection, Error> {
        debug_assert!(version.is_dtls());
        let core = ConnectionCore::new_datagram(
            true,
            version,
            mtu,
            config.quiet_shutdown,
            config.max_cert_list,
        );

        let hs = ClientHandshake::new(Arc::clone(&config), server_name, true)?;
        let mut conn = ClientConnection {
            core,
            hs: Some(hs),
            config,
            server_name: server_name.to_string(),
        };
        conn.advance()?;
        Ok(conn)
    }

    pub fn is_handshaking(&self) -> bool {
        self.hs.is_some()
    }

    /// The wait condition blocking the handshake, `Wait::Ok` otherwise.
    pub fn handshake_wait(&self) -> Wait {
        self.hs.as_ref().map(|hs| hs.wait).unwrap_or(Wait::Ok)
    }

    pub fn wants_read(&self) -> bool {
        self.hs
            .as_ref()
            .map(|hs| matches!(hs.wait, Wait::ReadMessage | Wait::ReadChangeCipherSpec | Wait::EarlyReturn))
            .unwrap_or(!self.core.read_closed())
    }

    pub fn wants_write(&self) -> bool {
        self.core.wants_write()
    }

    pub fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        self.core.read_tls(rd)
    }

    pub fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        self.core.write_tls(wr)
    }

    /// Feed one received datagram (DTLS).
    pub fn read_datagram(&mut self, datagram: &[u8]) -> Result<(), Error> {
        let records = self.core.read_datagram_bytes(datagram)?;
        if !records.is_empty() {
            self.core.peer_flight_arrived();
        }
        for rec in records {
            self.dispatch_record(rec)?;
            self.advance()?;
        }
        self.advance()
    }

    /// Queued outgoing datagrams (DTLS).
    pub fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        self.core.take_datagrams()
    }

    /// DTLS retransmission timer; safe to call at any time.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<TimeoutOutcome, Error> {
        self.core.handle_timeout(now)
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.core.next_timeout()
    }

    /// Decrypt and process everything buffered; drives the handshake.
    pub fn process_new_packets(&mut self) -> Result<(), Error> {
        if let Some(err) = self.core.latched_error() {
            return Err(err);
        }

        loop {
            let record = match self.core.next_stream_record() {
                Ok(Some(rec)) => rec,
                Ok(None) => break,
                Err(err) => return Err(self.fail(err)),
            };
            self.dispatch_record(record)?;
            // Drive the handshake before touching the next record: a key
            // change it performs governs that record's decryption.
            self.advance()?;
        }

        self.advance()
    }

    fn dispatch_record(&mut self, record: crate::msgs::message::PlainMessage) -> Result<(), Error> {
        let routing = match self.core.route_plaintext(record) {
            Ok(routing) => routing,
            Err(err) => return Err(self.fail(err)),
        };

        match routing {
            RecordRouting::ChangeCipherSpec => {
                // Handshake messages buffered ahead of the CCS must be
                // consumed first so the state machine is where the CCS
                // expects it.
                self.advance()?;
                if let Err(err) = self.core.note_ccs_received() {
                    return Err(self.fail(err));
                }
                if let Some(hs) = &mut self.hs {
                    if let Err(err) = hs.on_ccs(&mut self.core) {
                        return Err(self.fail(err));
                    }
                } else {
                    return Err(self.fail(Error::UnexpectedRecord(
                        crate::msgs::enums::ContentType::ChangeCipherSpec,
                    )));
                }
            }
            RecordRouting::ApplicationData => {
                // Data may trail the peer's final flight in one burst;
                // consume the buffered handshake first, then judge.
                self.advance()?;
                let early_ok = self
                    .hs
                    .as_ref()
                    .map(|hs| hs.early_peer_traffic_ok())
                    .unwrap_or(true);
                if !early_ok {
                    return Err(self.fail(Error::UnexpectedRecord(
                        crate::msgs::enums::ContentType::ApplicationData,
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Run handshake steps until a suspension or completion.
    fn advance(&mut self) -> Result<(), Error> {
        loop {
            let hs = match &mut self.hs {
                None => return self.process_post_handshake(),
                Some(hs) => hs,
            };

            match hs.wait {
                Wait::Ok => {
                    if let Err(err) = hs.step(&mut self.core, None) {
                        return Err(self.fail(err));
                    }
                }
                Wait::X509Lookup
                | Wait::ChannelIdLookup
                | Wait::PrivateKeyOperation
                | Wait::CertificateVerify
                | Wait::PendingTicket => {
                    // One retry per call: if the capability is still
                    // pending, hand control back to the caller.
                    let before = hs.wait;
                    if let Err(err) = hs.step(&mut self.core, None) {
                        return Err(self.fail(err));
                    }
                    let hs = self.hs.as_ref().unwrap();
                    if hs.wait == before && !hs.is_complete() {
                        return Ok(());
                    }
                }
                Wait::Flush => {
                    if self.core.output_drained() {
                        hs.wait = hs.wait_after_flush;
                    } else {
                        return Ok(());
                    }
                }
                Wait::EarlyDataRejected => {
                    // Surface the rejection to the caller exactly once.
                    if !hs.early_data_rejection_reported {
                        hs.early_data_rejection_reported = true;
                        return Ok(());
                    }
                    hs.wait = Wait::ReadMessage;
                }
                Wait::ReadMessage | Wait::EarlyReturn => {
                    let msg = match self.core.next_hs_message() {
                        Ok(msg) => msg,
                        Err(err) => return Err(self.fail(err)),
                    };
                    match msg {
                        Some(msg) => {
                            if let Err(err) = hs.step(&mut self.core, Some(msg)) {
                                return Err(self.fail(err));
                            }
                        }
                        None => return Ok(()),
                    }
                }
                Wait::ReadChangeCipherSpec => {
                    // satisfied via on_ccs; nothing to run until it arrives
                    return Ok(());
                }
            }

            if self
                .hs
                .as_ref()
                .map(|hs| hs.is_complete())
                .unwrap_or(false)
            {
                self.finish_handshake()?;
            }
        }
    }

    /// NewSessionTicket and KeyUpdate arrive after completion.
    fn process_post_handshake(&mut self) -> Result<(), Error> {
        loop {
            let msg = match self.core.next_hs_message() {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.fail(err)),
            };

            match msg.typ {
                HandshakeType::NewSessionTicket => {
                    if let Err(err) = self.store_tls13_ticket(&msg.body) {
                        return Err(self.fail(err));
                    }
                }
                HandshakeType::KeyUpdate => {
                    let request = KeyUpdateRequest::read_bytes(&msg.body)
                        .ok_or(Error::DecodeError)
                        .and_then(|req| {
                            if matches!(req, KeyUpdateRequest::Unknown(_)) {
                                Err(Error::IllegalParameter("bad key_update request"))
                            } else {
                                Ok(req)
                            }
                        });
                    let request = match request {
                        Ok(request) => request,
                        Err(err) => return Err(self.fail(err)),
                    };
                    if let Err(err) = self.core.handle_key_update(request) {
                        return Err(self.fail(err));
                    }
                }
                // A HelloRequest would start renegotiation; TLS 1.3 has
                // neither, and our client never renegotiates unless asked.
                HandshakeType::HelloRequest => {
                    match self.config.renegotiation_mode {
                        crate::client::RenegotiationMode::Ignore
                        | crate::client::RenegotiationMode::Never => {
                            debug!("ignoring HelloRequest");
                        }
                        _ => {
                            // Answer with no_renegotiation; a full second
                            // handshake is driven by reconnecting.
                            debug!("declining HelloRequest");
                        }
                    }
                }
                other => {
                    return Err(self.fail(Error::UnexpectedMessage {
                        expect_types: vec![
                            HandshakeType::NewSessionTicket,
                            HandshakeType::KeyUpdate,
                        ],
                        got_type: other,
                    }))
                }
            }
        }
    }

    fn store_tls13_ticket(&mut self, body: &[u8]) -> Result<(), Error> {
        use crate::msgs::handshake::{HandshakeMessagePayload, HandshakePayload};

        let tls13 = self
            .core
            .negotiated_version
            .map_or(false, |v| v.is_tls13_family());
        if !tls13 {
            return Err(Error::UnexpectedMessage {
                expect_types: vec![],
                got_type: HandshakeType::NewSessionTicket,
            });
        }

        let parsed = HandshakeMessagePayload::read_body_tls13(HandshakeType::NewSessionTicket, body)
            .ok_or(Error::DecodeError)?;
        let nst = match parsed.payload {
            HandshakePayload::NewSessionTicketTLS13(nst) => nst,
            _ => return Err(Error::DecodeError),
        };

        let ks = self
            .core
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let resumption_master = self
            .core
            .resumption_master
            .as_ref()
            .ok_or(Error::InternalError("no resumption master"))?;
        let psk = ks.derive_ticket_psk(resumption_master, &nst.nonce.0);

        let ticket = crate::msgs::persist::Tls13ClientTicket {
            ticket: nst.ticket.0.clone(),
            psk,
            age_add: nst.age_add,
            lifetime: nst.lifetime,
            issued_at: crate::client_hs::now_unix(),
            max_early_data: nst.max_early_data(),
        };
        self.config
            .session_store
            .push_ticket(&self.server_name, ticket);
        debug!("stored TLS 1.3 ticket for {}", self.server_name);
        Ok(())
    }

    fn finish_handshake(&mut self) -> Result<(), Error> {
        let hs = self.hs.take().expect("finish without handshake");
        debug!("client handshake complete: {:?}", self.core.negotiated_version);
        self.core.handshake_done = true;
        self.core.early_traffic_ok = false;
        hs.store_session(&self.config, &mut self.core);
        // Handshake state drops here; its key material is wiped.
        drop(hs);
        self.core.flush_buffered_plaintext()
    }

    fn fail(&mut self, err: Error) -> Error {
        let latched = self.core.fatal(err);
        self.hs = None;
        self.core.discard_partial_handshake();
        latched
    }

    // ---- application surface ----

    pub fn write_plaintext(&mut self, data: &[u8]) -> Result<usize, Error> {
        // Once the server has rejected 0-RTT, early writes fail until the
        // handshake completes and the caller re-sends.
        if let Some(hs) = &self.hs {
            if hs.early_data_rejected {
                return Err(Error::EarlyDataRejected);
            }
        }
        self.core.write_plaintext(data)
    }

    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.core.read_plaintext(buf)
    }

    pub fn send_close_notify(&mut self) {
        self.core.send_close_notify()
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.core.negotiated_version
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.core.alpn_protocol.as_deref()
    }

    pub fn export_keying_material(
        &self,
        label: &[u8],
        context: &[u8],
        out_len: usize,
    ) -> Result<Vec<u8>, Error> {
        self.core
            .key_schedule
            .as_ref()
            .ok_or(Error::HandshakeFailure("no exporter secret yet"))?
            .export_keying_material(label, context, out_len)
    }

    /// Initiate a TLS 1.3 key update for our write direction.
    pub fn refresh_traffic_keys(&mut self) -> Result<(), Error> {
        if self.is_handshaking() {
            return Err(Error::HandshakeFailure("key update during handshake"));
        }
        self.core
            .send_key_update(KeyUpdateRequest::UpdateRequested)
    }
}
