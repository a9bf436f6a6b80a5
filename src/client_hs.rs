use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};

use crate::cipher::CipherForm;
use crate::client::ClientConfig;
use crate::conn::{ConnectionCore, Wait};
use crate::error::Error;
use crate::hash_hs::HandshakeHash;
use crate::key_schedule::KeySchedule;
use crate::msgs::base::{Payload, PayloadU8};
use crate::msgs::codec::Codec;
use crate::msgs::enums::{
    CipherSuite, Compression, ContentType, ECPointFormat, HandshakeType, NamedGroup,
    PSKKeyExchangeMode, ProtocolVersion, SignatureScheme,
};
use crate::msgs::handshake::{
    ClientExtension, ClientHelloPayload, DigitallySignedStruct, HandshakeMessagePayload,
    HandshakePayload, PresharedKeyOffer, PskIdentity, Random, SessionID, DOWNGRADE_SENTINEL_TLS12,
};
use crate::msgs::hsjoiner::JoinedMessage;
use crate::msgs::persist::{SessionValue, Tls13ClientTicket};
use crate::prf::SessionSecrets;
use crate::session::Session;
use crate::suites::{KeyExchange, SupportedCipherSuite};
use crate::util::{constant_time_eq, Zeroized};
use crate::verify::verify_signed_struct;

/// Signature schemes we offer and accept.
pub static SUPPORTED_SIG_SCHEMES: [SignatureScheme; 7] = [
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ED25519,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ClientState {
    EmitClientHello,
    AwaitServerHello,
    // TLS 1.3
    AwaitEncryptedExtensions,
    AwaitCertOrCertReq,
    AwaitCertificate13,
    AwaitCertificateVerify13,
    AwaitFinished13,
    EmitClientFlight13,
    EmitCertVerify13,
    EmitFinished13,
    // TLS 1.2
    AwaitCertificate12,
    AwaitServerKx12,
    AwaitCertReqOrDone12,
    EmitClientCertAndKx12,
    EmitCertVerify12,
    EmitFinished12,
    AwaitTicket12,
    AwaitCcs12,
    AwaitFinished12,
    Complete,
}

/// A PSK we are offering for TLS 1.3 resumption.
pub(crate) struct OfferedPsk {
    pub ticket: Tls13ClientTicket,
    pub suite: &'static SupportedCipherSuite,
}

/// Ephemeral client handshake state; exists between `new` and completion.
pub struct ClientHandshake {
    pub wait: Wait,
    /// Where the driver goes once a `Flush` wait drains.
    pub(crate) wait_after_flush: Wait,
    pub(crate) state: ClientState,
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) server_name: String,
    pub(crate) dtls: bool,

    pub(crate) transcript: HandshakeHash,
    pub(crate) client_random: [u8; 32],
    pub(crate) server_random: [u8; 32],
    pub(crate) session_id: SessionID,
    pub(crate) kx: Option<KeyExchange>,
    pub(crate) offered_share_group: Option<NamedGroup>,
    pub(crate) hrr_seen: bool,
    pub(crate) suite: Option<&'static SupportedCipherSuite>,
    pub(crate) server_cert_chain: Vec<Vec<u8>>,
    dtls_cookie: Option<Vec<u8>>,
    pub(crate) hrr_cookie: Option<Vec<u8>>,

    // TLS 1.2 specifics
    pub(crate) secrets12: Option<SessionSecrets>,
    resume_session: Option<Session>,
    pub(crate) doing_resume: bool,
    using_ems: bool,
    expect_ticket12: bool,
    received_ticket12: Option<Vec<u8>>,
    cert_request12: Option<Vec<SignatureScheme>>,
    sent_client_cert: bool,
    server_kx_peer_pubkey: Option<Vec<u8>>,
    /// Finished verify_data, ours then peer's, for renegotiation_info.
    pub(crate) our_verify_data: Vec<u8>,
    pub(crate) peer_verify_data: Vec<u8>,

    // TLS 1.3 specifics
    pub(crate) offered_psk: Option<OfferedPsk>,
    pub(crate) psk_accepted: bool,
    pub(crate) early_data_offered: bool,
    pub(crate) early_data_accepted: bool,
    pub(crate) early_data_rejected: bool,
    pub(crate) early_data_rejection_reported: bool,
    pub(crate) sent_client_cert13: bool,
    pub(crate) hs_client_secret: Zeroized,
    pub(crate) hs_server_secret: Zeroized,
    pub(crate) ap_client_secret: Zeroized,
    pub(crate) ap_server_secret: Zeroized,
    pub(crate) resumption_master: Zeroized,
    pub(crate) cert_request13: Option<(Vec<u8>, Vec<SignatureScheme>)>,
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ClientHandshake {
    pub fn new(
        config: Arc<ClientConfig>,
        server_name: &str,
        dtls: bool,
    ) -> Result<ClientHandshake, Error> {
        let mut client_random = [0u8; 32];
        config.rng.fill(&mut client_random)?;

        Ok(ClientHandshake {
            wait: Wait::Ok,
            wait_after_flush: Wait::ReadMessage,
            state: ClientState::EmitClientHello,
            config,
            server_name: server_name.to_string(),
            dtls,
            transcript: HandshakeHash::new(),
            client_random,
            server_random: [0u8; 32],
            session_id: SessionID::empty(),
            kx: None,
            offered_share_group: None,
            hrr_seen: false,
            suite: None,
            server_cert_chain: Vec::new(),
            dtls_cookie: None,
            hrr_cookie: None,
            secrets12: None,
            resume_session: None,
            doing_resume: false,
            using_ems: false,
            expect_ticket12: false,
            received_ticket12: None,
            cert_request12: None,
            sent_client_cert: false,
            server_kx_peer_pubkey: None,
            our_verify_data: Vec::new(),
            peer_verify_data: Vec::new(),
            offered_psk: None,
            psk_accepted: false,
            early_data_offered: false,
            early_data_accepted: false,
            early_data_rejected: false,
            early_data_rejection_reported: false,
            sent_client_cert13: false,
            hs_client_secret: Zeroized::empty(),
            hs_server_secret: Zeroized::empty(),
            ap_client_secret: Zeroized::empty(),
            ap_server_secret: Zeroized::empty(),
            resumption_master: Zeroized::empty(),
            cert_request13: None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.state == ClientState::Complete
    }

    /// Whether application data from the peer is legal mid-handshake.
    pub fn early_peer_traffic_ok(&self) -> bool {
        false
    }

    fn offers_tls13(&self) -> bool {
        self.config.max_version.is_tls13_family() || self.config.max_version == ProtocolVersion::TLSv1_3
    }

    fn unexpected(&self, got: HandshakeType, expect: &[HandshakeType]) -> Error {
        Error::UnexpectedMessage {
            expect_types: expect.to_vec(),
            got_type: got,
        }
    }

    /// Run one substate. `input` carries a complete handshake message when
    /// the current wait was `ReadMessage`.
    pub fn step(
        &mut self,
        core: &mut ConnectionCore,
        input: Option<JoinedMessage>,
    ) -> Result<(), Error> {
        match self.state {
            ClientState::EmitClientHello => self.emit_client_hello(core),
            ClientState::AwaitServerHello => self.process_server_hello(core, input.unwrap()),
            ClientState::AwaitEncryptedExtensions => {
                self.process_encrypted_extensions(core, input.unwrap())
            }
            ClientState::AwaitCertOrCertReq => self.process_cert_or_cert_req(core, input.unwrap()),
            ClientState::AwaitCertificate13 => self.process_certificate13(core, input.unwrap()),
            ClientState::AwaitCertificateVerify13 => {
                self.process_certificate_verify13(core, input.unwrap())
            }
            ClientState::AwaitFinished13 => self.process_server_finished13(core, input.unwrap()),
            ClientState::EmitClientFlight13 => self.emit_client_flight13(core),
            ClientState::EmitCertVerify13 => self.emit_cert_verify13(core),
            ClientState::EmitFinished13 => self.emit_finished13(core),
            ClientState::AwaitCertificate12 => self.process_certificate12(core, input.unwrap()),
            ClientState::AwaitServerKx12 => self.process_server_kx12(core, input.unwrap()),
            ClientState::AwaitCertReqOrDone12 => {
                self.process_cert_req_or_done12(core, input.unwrap())
            }
            ClientState::EmitClientCertAndKx12 => self.emit_client_cert_and_kx12(core),
            ClientState::EmitCertVerify12 => self.emit_cert_verify12(core),
            ClientState::EmitFinished12 => self.emit_finished12(core),
            ClientState::AwaitTicket12 => self.process_ticket12(core, input.unwrap()),
            ClientState::AwaitCcs12 => Err(Error::InternalError("step during CCS wait")),
            ClientState::AwaitFinished12 => self.process_server_finished12(core, input.unwrap()),
            ClientState::Complete => Ok(()),
        }
    }

    /// A ChangeCipherSpec record arrived.
    pub fn on_ccs(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let tls13 = core
            .negotiated_version
            .map_or(self.offers_tls13(), |v| v.is_tls13_family());

        if tls13 {
            // Middlebox-compatibility CCS; uniqueness enforced by the core.
            return Ok(());
        }

        if self.state != ClientState::AwaitCcs12 {
            return Err(Error::UnexpectedRecord(ContentType::ChangeCipherSpec));
        }
        if !core.hs_buffer_empty() {
            warn!("CCS interleaved with fragmented handshake message");
            return Err(Error::UnexpectedRecord(ContentType::ChangeCipherSpec));
        }

        // Peer starts encrypting: install the read half of the key block.
        self.start_encryption12_read(core)?;
        self.state = ClientState::AwaitFinished12;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    // ---- ClientHello ----

    fn emit_client_hello(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let legacy_version = if self.dtls {
            ProtocolVersion::DTLSv1_2
        } else {
            ProtocolVersion::TLSv1_2
        };

        // Resumption lookups, by transport-appropriate mechanism.
        self.prepare_resumption(core);

        let mut exts = vec![
            ClientExtension::make_sni(&self.server_name),
            ClientExtension::NamedGroups(self.config.supported_groups.clone()),
            ClientExtension::ECPointFormats(vec![ECPointFormat::Uncompressed]),
            ClientExtension::SignatureAlgorithms(SUPPORTED_SIG_SCHEMES.to_vec()),
            ClientExtension::ExtendedMasterSecretRequest,
            ClientExtension::RenegotiationInfo(PayloadU8::new(self.our_verify_data.clone())),
        ];

        if !self.config.alpn_protocols.is_empty() {
            exts.push(ClientExtension::Protocols(
                crate::msgs::handshake::protocol_names(&self.config.alpn_protocols),
            ));
        }

        // TLS 1.2 ticket: offer a stored one, else signal support.
        if !self.offers_tls13() || self.config.min_version == ProtocolVersion::TLSv1_2 {
            match self
                .resume_session
                .as_ref()
                .filter(|s| !s.ticket.is_empty())
            {
                Some(session) => exts.push(ClientExtension::SessionTicketOffer(Payload(
                    session.ticket.clone(),
                ))),
                None => exts.push(ClientExtension::SessionTicketRequest),
            }
        }

        if let Some(cookie) = &self.hrr_cookie {
            exts.push(ClientExtension::Cookie(
                crate::msgs::base::PayloadU16::new(cookie.clone()),
            ));
        }

        if self.offers_tls13() {
            let versions = if self.dtls {
                vec![ProtocolVersion::DTLSv1_3, ProtocolVersion::DTLSv1_2]
            } else {
                vec![ProtocolVersion::TLSv1_3, ProtocolVersion::TLSv1_2]
            };
            exts.push(ClientExtension::SupportedVersions(versions));

            let group = self
                .offered_share_group
                .unwrap_or(self.config.supported_groups[0]);
            let kx = KeyExchange::start_ecdhe(group)?;
            exts.push(ClientExtension::KeyShare(vec![
                crate::msgs::handshake::KeyShareEntry::new(group, &kx.pubkey),
            ]));
            self.offered_share_group = Some(group);
            self.kx = Some(kx);

            if self.offered_psk.is_some() {
                exts.push(ClientExtension::PresharedKeyModes(vec![
                    PSKKeyExchangeMode::PSK_DHE_KE,
                ]));
                if self.early_data_offered {
                    exts.push(ClientExtension::EarlyData);
                }
            }
        }

        let mut hello = ClientHelloPayload {
            client_version: legacy_version,
            random: Random(self.client_random),
            session_id: self.session_id.clone(),
            cookie: if self.dtls {
                Some(PayloadU8::new(
                    self.dtls_cookie.clone().unwrap_or_default(),
                ))
            } else {
                None
            },
            cipher_suites: self.offered_cipher_suites(),
            compression_methods: vec![Compression::Null],
            extensions: exts,
        };

        // The PSK offer must come last so the binder can cover everything
        // before it.
        if let Some(psk) = &self.offered_psk {
            let now_ms = now_unix().saturating_mul(1000);
            let obfuscated_age = psk
                .ticket
                .obfuscated_age(now_ms, psk.ticket.issued_at.saturating_mul(1000));
            let binder_len = psk.suite.hash_algorithm.output_len;
            hello
                .extensions
                .push(ClientExtension::PresharedKey(PresharedKeyOffer {
                    identities: vec![PskIdentity::new(psk.ticket.ticket.clone(), obfuscated_age)],
                    binders: vec![PayloadU8::new(vec![0u8; binder_len])],
                }));
        }

        let mut body = Vec::new();
        hello.encode_body(&mut body, self.dtls);

        let psk_suite = self.offered_psk.as_ref().map(|psk| psk.suite);
        if let Some(suite) = psk_suite {
            let msg_seq = core.peek_next_hs_msg_seq();
            self.fill_psk_binder(&mut body, suite, msg_seq)?;
        }

        let transcript = core.send_hs_message(HandshakeType::ClientHello, body);
        self.transcript.add(&transcript);

        debug!(
            "sent ClientHello (resume={}, early_data={})",
            self.offered_psk.is_some() || self.resume_session.is_some(),
            self.early_data_offered
        );

        // The hello leaves under the null cipher before any 0-RTT key
        // exists.
        core.flush_hs_run()?;
        if self.early_data_offered {
            self.start_early_data_write(core)?;
            core.flush_buffered_plaintext()?;
        }

        self.state = ClientState::AwaitServerHello;
        self.wait = Wait::Flush;
        self.wait_after_flush = Wait::ReadMessage;
        Ok(())
    }

    fn offered_cipher_suites(&self) -> Vec<CipherSuite> {
        self.config
            .cipher_suites
            .iter()
            .filter(|scs| {
                scs.usable_for_version(self.config.max_version)
                    || scs.usable_for_version(self.config.min_version)
            })
            .map(|scs| scs.suite)
            .collect()
    }

    fn prepare_resumption(&mut self, _core: &mut ConnectionCore) {
        if !self.config.session_cache_mode.caches_client() {
            return;
        }
        if self.hrr_seen || self.resume_session.is_some() || self.offered_psk.is_some() {
            return;
        }

        // TLS 1.3 ticket takes precedence; else a TLS 1.2 session.
        if self.offers_tls13() {
            if let Some(ticket) = self.config.session_store.take_ticket(&self.server_name) {
                // The PSK's length reveals the hash of the issuing suite;
                // bind the offer to a suite with the same hash.
                let suite = self
                    .config
                    .cipher_suites
                    .iter()
                    .copied()
                    .find(|scs| {
                        scs.usable_for_version(ProtocolVersion::TLSv1_3)
                            && scs.hash_algorithm.output_len == ticket.psk.len()
                    });
                if let Some(suite) = suite {
                    self.early_data_offered =
                        self.config.enable_early_data && ticket.max_early_data > 0;
                    self.offered_psk = Some(OfferedPsk { ticket, suite });
                    return;
                }
            }
        }

        if let Some(session) = self.config.session_store.get_session(&self.server_name) {
            if session.has_expired(now_unix()) {
                self.config.session_store.forget_session(&self.server_name);
                return;
            }
            if !session.version.is_tls13_family() {
                self.session_id = session.session_id.clone();
                self.resume_session = Some(session);
            }
        }
    }

    fn fill_psk_binder(
        &mut self,
        encoded_hello: &mut [u8],
        suite: &'static SupportedCipherSuite,
        msg_seq: u16,
    ) -> Result<(), Error> {
        let psk = self.offered_psk.as_ref().unwrap();
        let hash_len = suite.hash_algorithm.output_len;
        // binders list: u16 length + (u8 len + binder) per entry
        let binders_len = 2 + 1 + hash_len;
        let truncated_len = encoded_hello.len() - binders_len;

        let mut ks = KeySchedule::new(suite.hkdf_algorithm);
        ks.input_secret(&psk.ticket.psk);

        // Transcript for the binder: everything up to the binders list.
        // After an HRR this includes the message_hash replacement and HRR.
        let mut binder_transcript = self.transcript.clone_for_binder(suite.hash_algorithm);
        let header = {
            // the 4- or 12-byte header the transcript form carries
            let mut hdr = Vec::new();
            HandshakeType::ClientHello.encode(&mut hdr);
            crate::msgs::codec::u24(encoded_hello.len() as u32).encode(&mut hdr);
            hdr
        };
        if self.dtls {
            // DTLS transcript uses the 12-byte header
            let full = crate::msgs::dtls::encode_dtls_handshake_message(
                HandshakeType::ClientHello,
                msg_seq,
                encoded_hello,
            );
            binder_transcript.add(&full[..12 + truncated_len]);
        } else {
            binder_transcript.add(&header);
            binder_transcript.add(&encoded_hello[..truncated_len]);
        }
        let truncated_hash = binder_transcript.get_current_hash();

        let empty_hash = ring::digest::digest(suite.hash_algorithm, b"");
        let binder_base = ks.derive(
            crate::key_schedule::SecretKind::ResumptionPskBinderKey,
            empty_hash.as_ref(),
        );
        let binder = ks.sign_psk_binder(&binder_base, &truncated_hash);

        let dest = encoded_hello.len() - hash_len;
        encoded_hello[dest..].copy_from_slice(&binder);
        Ok(())
    }

    // ---- ServerHello and dispatch by version ----

    fn process_server_hello(
        &mut self,
        core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        core.peer_flight_arrived();

        match msg.typ {
            HandshakeType::ServerHello => {}
            HandshakeType::HelloVerifyRequest if self.dtls => {
                return self.process_hello_verify_request(core, msg);
            }
            other => {
                return Err(self.unexpected(
                    other,
                    &[HandshakeType::ServerHello],
                ))
            }
        }

        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
            .ok_or(Error::DecodeError)?;

        match parsed.payload {
            HandshakePayload::HelloRetryRequest(hrr) => {
                self.process_hello_retry_request(core, hrr, &msg.transcript_bytes)
            }
            HandshakePayload::ServerHello(sh) => {
                let version = self.determine_version(&sh)?;
                core.negotiated_version = Some(version);

                let suite = crate::suites::lookup_suite(sh.cipher_suite)
                    .filter(|scs| self.offered_cipher_suites().contains(&scs.suite))
                    .ok_or(Error::HandshakeFailure("server chose unoffered suite"))?;
                if !suite.usable_for_version(version) {
                    return Err(Error::IllegalParameter("suite illegal for version"));
                }
                self.suite = Some(suite);
                core.suite = Some(suite);
                self.server_random.copy_from_slice(&sh.random.0);

                self.check_downgrade_sentinel(version)?;

                self.transcript.request_buffer_if(
                    !version.is_tls13_family() && self.config.client_auth_cert.is_some(),
                );
                self.transcript.start_hash(suite.hash_algorithm);
                self.transcript.add(&msg.transcript_bytes);

                // ALPN selection binds early, from ServerHello in ≤1.2.
                if let Some(proto) = sh.get_alpn_protocol() {
                    if !self.config.alpn_protocols.iter().any(|p| p == proto) {
                        return Err(Error::NoApplicationProtocol);
                    }
                    core.alpn_protocol = Some(proto.to_vec());
                }

                if version.is_tls13_family() {
                    self.process_server_hello13(core, &sh)
                } else {
                    self.process_server_hello12(core, &sh)
                }
            }
            _ => Err(Error::DecodeError),
        }
    }

    fn determine_version(
        &self,
        sh: &crate::msgs::handshake::ServerHelloPayload,
    ) -> Result<ProtocolVersion, Error> {
        if let Some(version) = sh.get_supported_versions() {
            let acceptable = if self.dtls {
                version == ProtocolVersion::DTLSv1_3
            } else {
                version == ProtocolVersion::TLSv1_3
            };
            if !acceptable || !self.offers_tls13() {
                return Err(Error::ProtocolVersion);
            }
            return Ok(version);
        }

        let version = sh.legacy_version;
        let acceptable = if self.dtls {
            matches!(
                version,
                ProtocolVersion::DTLSv1_0 | ProtocolVersion::DTLSv1_2
            )
        } else {
            matches!(version, ProtocolVersion::TLSv1_0 | ProtocolVersion::TLSv1_2)
        };
        if !acceptable {
            return Err(Error::ProtocolVersion);
        }
        // Honor configured floor.
        if !self.dtls && version.get_u16() < self.config.min_version.get_u16() {
            return Err(Error::ProtocolVersion);
        }
        Ok(version)
    }

    fn check_downgrade_sentinel(&self, negotiated: ProtocolVersion) -> Result<(), Error> {
        if !self.offers_tls13() || negotiated.is_tls13_family() {
            return Ok(());
        }
        if constant_time_eq(&self.server_random[24..], &DOWNGRADE_SENTINEL_TLS12) {
            return Err(Error::InappropriateFallback);
        }
        Ok(())
    }

    fn process_hello_verify_request(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
            .ok_or(Error::DecodeError)?;
        let hvr = match parsed.payload {
            HandshakePayload::HelloVerifyRequest(hvr) => hvr,
            _ => return Err(Error::DecodeError),
        };

        if self.dtls_cookie.is_some() {
            // One verification round only.
            return Err(Error::UnexpectedMessage {
                expect_types: vec![HandshakeType::ServerHello],
                got_type: HandshakeType::HelloVerifyRequest,
            });
        }

        debug!("received HelloVerifyRequest, echoing cookie");
        self.dtls_cookie = Some(hvr.cookie.0.clone());
        // Neither the first hello nor the verify request enters the
        // transcript (RFC 6347 §4.2.1).
        self.transcript = HandshakeHash::new();
        self.state = ClientState::EmitClientHello;
        self.wait = Wait::Ok;
        Ok(())
    }

    // ---- TLS 1.2 body ----

    fn process_server_hello12(
        &mut self,
        core: &mut ConnectionCore,
        sh: &crate::msgs::handshake::ServerHelloPayload,
    ) -> Result<(), Error> {
        let suite = self.suite.unwrap();

        if sh.compression_method != Compression::Null {
            return Err(Error::IllegalParameter("server chose compression"));
        }

        self.using_ems = sh
            .find_extension(crate::msgs::enums::ExtensionType::ExtendedMasterSecret)
            .is_some();
        self.expect_ticket12 = sh
            .find_extension(crate::msgs::enums::ExtensionType::SessionTicket)
            .is_some();

        // Renegotiation guardrail: an initial handshake must see an empty
        // renegotiation_info if present at all.
        if let Some(info) = sh.get_renegotiation_info() {
            let mut expect = self.peer_verify_data.clone();
            expect.extend_from_slice(&self.our_verify_data);
            if !constant_time_eq(&info.0, &expect) {
                return Err(Error::HandshakeFailure("renegotiation_info mismatch"));
            }
        }

        // Resumption decision: the server echoes our session id to resume.
        if let Some(resume) = self.resume_session.clone() {
            if !sh.session_id.is_empty() && sh.session_id == resume.session_id {
                if resume.cipher_suite != suite.suite {
                    return Err(Error::SessionMismatch);
                }
                if resume.version != ProtocolVersion::TLSv1_2
                    && resume.version != core.negotiated_version.unwrap()
                {
                    return Err(Error::SessionMismatch);
                }

                debug!("resuming TLS 1.2 session by id");
                self.doing_resume = true;
                self.secrets12 = Some(SessionSecrets::new_resume(
                    suite.hash_algorithm,
                    &resume.master_secret,
                    self.client_random,
                    self.server_random,
                ));
                self.session_id = sh.session_id.clone();
                self.state = ClientState::AwaitCcs12;
                self.wait = Wait::ReadChangeCipherSpec;
                return Ok(());
            }
        }

        self.session_id = sh.session_id.clone();
        self.state = ClientState::AwaitCertificate12;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    fn process_certificate12(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::Certificate {
            return Err(self.unexpected(msg.typ, &[HandshakeType::Certificate]));
        }
        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
            .ok_or(Error::DecodeError)?;
        let chain = match parsed.payload {
            HandshakePayload::Certificate(chain) => chain,
            _ => return Err(Error::DecodeError),
        };
        if chain.is_empty() {
            return Err(Error::BadCertificate);
        }

        self.transcript.add(&msg.transcript_bytes);
        self.server_cert_chain = chain.into_iter().map(|cert| cert.0).collect();
        self.state = ClientState::AwaitServerKx12;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    /// The key the server signs with must match the negotiated suite: an
    /// ECDSA-only suite rejects an RSA leaf, and vice versa.
    fn check_kx_sig_scheme(&self, scheme: SignatureScheme) -> Result<(), Error> {
        use crate::suites::SignatureAlgorithm;

        let matches = match self.suite.unwrap().sign {
            SignatureAlgorithm::ECDSA => matches!(
                scheme,
                SignatureScheme::ECDSA_NISTP256_SHA256
                    | SignatureScheme::ECDSA_NISTP384_SHA384
                    | SignatureScheme::ED25519
            ),
            SignatureAlgorithm::RSA => matches!(
                scheme,
                SignatureScheme::RSA_PSS_SHA256
                    | SignatureScheme::RSA_PSS_SHA384
                    | SignatureScheme::RSA_PSS_SHA512
                    | SignatureScheme::RSA_PKCS1_SHA256
                    | SignatureScheme::RSA_PKCS1_SHA384
                    | SignatureScheme::RSA_PKCS1_SHA512
            ),
            SignatureAlgorithm::Anonymous => true,
        };

        if matches {
            Ok(())
        } else {
            Err(Error::UnsupportedCertificate)
        }
    }

    fn verify_server_cert(&self) -> Result<Option<()>, Error> {
        let (end_entity, intermediates) = match self.server_cert_chain.split_first() {
            Some((ee, rest)) => (ee, rest.to_vec()),
            None => return Err(Error::BadCertificate),
        };
        match self.config.verifier.verify_server_cert(
            end_entity,
            &intermediates,
            &self.server_name,
            SystemTime::now(),
        )? {
            Some(_) => Ok(Some(())),
            None => Ok(None),
        }
    }

    fn process_server_kx12(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::ServerKeyExchange {
            return Err(self.unexpected(msg.typ, &[HandshakeType::ServerKeyExchange]));
        }
        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
            .ok_or(Error::DecodeError)?;
        let skx = match parsed.payload {
            HandshakePayload::ServerKeyExchange(skx) => skx,
            _ => return Err(Error::DecodeError),
        };

        if !self.config.supported_groups.contains(&skx.params.group) {
            return Err(Error::IllegalParameter("server chose unoffered group"));
        }
        self.check_kx_sig_scheme(skx.dss.scheme)?;

        // signature covers client_random || server_random || params
        let mut message = Vec::new();
        message.extend_from_slice(&self.client_random);
        message.extend_from_slice(&self.server_random);
        skx.params.encode(&mut message);

        verify_signed_struct(&message, &self.server_cert_chain[0], &skx.dss)?;
        trace!("ServerKeyExchange signature verified");

        self.transcript.add(&msg.transcript_bytes);
        // Our ephemeral must live on the server's curve; any share built
        // for the TLS 1.3 key_share offer is for the wrong purpose.
        self.kx = Some(KeyExchange::start_ecdhe(skx.params.group)?);
        self.server_kx_peer_pubkey = Some(skx.params.public.0.clone());
        self.state = ClientState::AwaitCertReqOrDone12;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    fn process_cert_req_or_done12(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        match msg.typ {
            HandshakeType::CertificateRequest => {
                let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
                    .ok_or(Error::DecodeError)?;
                let req = match parsed.payload {
                    HandshakePayload::CertificateRequest(req) => req,
                    _ => return Err(Error::DecodeError),
                };
                self.transcript.add(&msg.transcript_bytes);
                self.cert_request12 = Some(req.sigschemes);
                self.wait = Wait::ReadMessage;
                Ok(())
            }
            HandshakeType::ServerHelloDone => {
                if !msg.body.is_empty() {
                    return Err(Error::DecodeError);
                }
                self.transcript.add(&msg.transcript_bytes);
                self.state = ClientState::EmitClientCertAndKx12;
                self.wait = Wait::Ok;
                Ok(())
            }
            other => Err(self.unexpected(
                other,
                &[
                    HandshakeType::CertificateRequest,
                    HandshakeType::ServerHelloDone,
                ],
            )),
        }
    }

    /// First part of the second flight: Certificate (if requested) and
    /// ClientKeyExchange. Chain validation may suspend; nothing mutates
    /// before that point, so the substate retries cleanly.
    fn emit_client_cert_and_kx12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        match self.verify_server_cert()? {
            Some(()) => {}
            None => {
                self.wait = Wait::CertificateVerify;
                return Ok(());
            }
        }

        let suite = self.suite.unwrap();

        if self.cert_request12.is_some() {
            let chain: Vec<Vec<u8>> = self
                .config
                .client_auth_cert
                .as_ref()
                .map(|ck| ck.cert_chain.clone())
                .unwrap_or_default();
            self.sent_client_cert = !chain.is_empty();

            let mut body = Vec::new();
            crate::msgs::codec::encode_vec_u24(
                &mut body,
                &chain
                    .iter()
                    .map(|cert| crate::msgs::base::PayloadU24::new(cert.clone()))
                    .collect::<Vec<_>>(),
            );
            let tx = core.send_hs_message(HandshakeType::Certificate, body);
            self.transcript.add(&tx);
        }

        let kx = self
            .kx
            .take()
            .ok_or(Error::InternalError("missing key exchange"))?;
        let our_pub = kx.pubkey.clone();
        let peer_pub = self
            .server_kx_peer_pubkey
            .as_ref()
            .ok_or(Error::InternalError("no server key share"))?;
        let shared = kx.complete(peer_pub)?;

        let mut ckx_body = Vec::new();
        PayloadU8::new(our_pub).encode(&mut ckx_body);
        let tx = core.send_hs_message(HandshakeType::ClientKeyExchange, ckx_body);
        self.transcript.add(&tx);

        // Master secret; EMS binds the session hash through ClientKeyExchange.
        let secrets = if self.using_ems {
            let session_hash = self.transcript.get_current_hash();
            SessionSecrets::new_ems(
                suite.hash_algorithm,
                &shared.shared_secret,
                &session_hash,
                self.client_random,
                self.server_random,
            )
        } else {
            SessionSecrets::new(
                suite.hash_algorithm,
                &shared.shared_secret,
                self.client_random,
                self.server_random,
            )
        };
        self.secrets12 = Some(secrets);

        self.state = ClientState::EmitCertVerify12;
        self.wait = Wait::Ok;
        Ok(())
    }

    /// CertificateVerify over the message concatenation so far. The
    /// signing capability may suspend; the transcript is untouched until
    /// the signature exists, so re-entry recomputes identically.
    fn emit_cert_verify12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        if self.sent_client_cert {
            let certified = self
                .config
                .client_auth_cert
                .clone()
                .ok_or(Error::InternalError("cert sent without key"))?;
            let schemes = self.cert_request12.clone().unwrap_or_default();
            let scheme = certified
                .key
                .choose_scheme(&first_in_both_list(&schemes))
                .ok_or(Error::HandshakeFailure("no usable client sig scheme"))?;

            let to_sign = self.transcript.peek_handshake_buf();
            let sig = match certified.key.sign(scheme, &to_sign)? {
                Some(sig) => sig,
                None => {
                    self.wait = Wait::PrivateKeyOperation;
                    return Ok(());
                }
            };

            let mut cv_body = Vec::new();
            DigitallySignedStruct::new(scheme, sig).encode(&mut cv_body);
            let tx = core.send_hs_message(HandshakeType::CertificateVerify, cv_body);
            self.transcript.add(&tx);
        }
        self.transcript.abandon_buffer();

        self.state = ClientState::EmitFinished12;
        self.wait = Wait::Ok;
        Ok(())
    }

    fn emit_finished12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        core.send_ccs()?;
        self.start_encryption12_write(core)?;

        let verify_data = self
            .secrets12
            .as_ref()
            .unwrap()
            .client_verify_data(&self.transcript.get_current_hash());
        self.our_verify_data = verify_data.clone();
        let mut fin_body = Vec::new();
        Payload::new(verify_data).encode(&mut fin_body);
        let tx = core.send_hs_message(HandshakeType::Finished, fin_body);
        self.transcript.add(&tx);
        core.flush_hs_run()?;

        self.state = if self.expect_ticket12 {
            ClientState::AwaitTicket12
        } else {
            ClientState::AwaitCcs12
        };

        // False Start: forward-secret AEAD suite plus negotiated ALPN.
        if self.config.enable_false_start && core.alpn_protocol.is_some() && !self.doing_resume {
            debug!("False Start window open");
            core.early_traffic_ok = true;
            self.wait = Wait::EarlyReturn;
            return Ok(());
        }

        self.wait = Wait::Flush;
        self.wait_after_flush = if self.state == ClientState::AwaitTicket12 {
            Wait::ReadMessage
        } else {
            Wait::ReadChangeCipherSpec
        };
        Ok(())
    }

    fn process_ticket12(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::NewSessionTicket {
            return Err(self.unexpected(msg.typ, &[HandshakeType::NewSessionTicket]));
        }
        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
            .ok_or(Error::DecodeError)?;
        let nst = match parsed.payload {
            HandshakePayload::NewSessionTicket(nst) => nst,
            _ => return Err(Error::DecodeError),
        };

        self.transcript.add(&msg.transcript_bytes);
        self.received_ticket12 = Some(nst.ticket.0);
        self.state = ClientState::AwaitCcs12;
        self.wait = Wait::ReadChangeCipherSpec;
        Ok(())
    }

    fn process_server_finished12(
        &mut self,
        core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::Finished {
            return Err(self.unexpected(msg.typ, &[HandshakeType::Finished]));
        }

        let expected = self
            .secrets12
            .as_ref()
            .unwrap()
            .server_verify_data(&self.transcript.get_current_hash());
        if !constant_time_eq(&expected, &msg.body) {
            return Err(Error::DecryptError);
        }
        self.peer_verify_data = msg.body.clone();
        self.transcript.add(&msg.transcript_bytes);

        if self.doing_resume {
            // Our CCS and Finished answer the server's.
            if let Some(()) = self.verify_server_cert_for_resume()? {
                core.send_ccs()?;
                self.start_encryption12_write(core)?;
                let verify_data = self
                    .secrets12
                    .as_ref()
                    .unwrap()
                    .client_verify_data(&self.transcript.get_current_hash());
                self.our_verify_data = verify_data.clone();
                let mut fin_body = Vec::new();
                Payload::new(verify_data).encode(&mut fin_body);
                let tx = core.send_hs_message(HandshakeType::Finished, fin_body);
                self.transcript.add(&tx);
                core.flush_hs_run()?;
            }
        }

        core.early_traffic_ok = false;
        self.state = ClientState::Complete;
        self.wait = Wait::Ok;
        Ok(())
    }

    fn verify_server_cert_for_resume(&self) -> Result<Option<()>, Error> {
        // The resumed session's chain was validated when first established.
        Ok(Some(()))
    }

    // ---- TLS 1.2 record keys ----

    fn key_block_parts(&self) -> (usize, usize) {
        let suite = self.suite.unwrap();
        (suite.enc_key_len, suite.fixed_iv_len)
    }

    pub(crate) fn start_encryption12_write(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let suite = self.suite.unwrap();
        let (key_len, iv_len) = self.key_block_parts();
        let block = self
            .secrets12
            .as_ref()
            .unwrap()
            .make_key_block(2 * key_len + 2 * iv_len);

        let client_key = &block[..key_len];
        let client_iv = &block[2 * key_len..2 * key_len + iv_len];
        let form = if suite.explicit_nonce_len > 0 {
            CipherForm::Tls12ExplicitNonce
        } else {
            CipherForm::XorNonce
        };
        core.start_encryption_write(suite, form, client_key, client_iv)
    }

    pub(crate) fn start_encryption12_read(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let suite = self.suite.unwrap();
        let (key_len, iv_len) = self.key_block_parts();
        let block = self
            .secrets12
            .as_ref()
            .unwrap()
            .make_key_block(2 * key_len + 2 * iv_len);

        let server_key = &block[key_len..2 * key_len];
        let server_iv = &block[2 * key_len + iv_len..];
        let form = if suite.explicit_nonce_len > 0 {
            CipherForm::Tls12ExplicitNonce
        } else {
            CipherForm::XorNonce
        };
        core.start_encryption_read(suite, form, server_key, server_iv)
    }

    // ---- session persistence on completion ----

    pub(crate) fn store_session(&self, config: &ClientConfig, core: &mut ConnectionCore) {
        if !config.session_cache_mode.caches_client() {
            return;
        }
        let version = match core.negotiated_version {
            Some(v) => v,
            None => return,
        };
        if version.is_tls13_family() {
            // TLS 1.3 resumption state arrives via NewSessionTicket,
            // handled post-handshake.
            return;
        }
        if self.doing_resume {
            return;
        }

        let suite = match self.suite {
            Some(suite) => suite,
            None => return,
        };
        let secrets = match &self.secrets12 {
            Some(secrets) => secrets,
            None => return,
        };

        let mut value = SessionValue::new(
            version,
            suite.suite,
            self.session_id.clone(),
            Zeroized::new(secrets.get_master_secret()),
            now_unix(),
        );
        value.hostname = self.server_name.as_bytes().to_vec();
        value.alpn = core.alpn_protocol.clone().unwrap_or_default();
        value.peer_cert_chain = self
            .server_cert_chain
            .iter()
            .map(|c| crate::msgs::base::PayloadU24::new(c.clone()))
            .collect();
        if let Some(ticket) = &self.received_ticket12 {
            value.ticket = ticket.clone();
        }

        if !value.session_id.is_empty() || !value.ticket.is_empty() {
            config
                .session_store
                .put_session(&self.server_name, Arc::new(value));
            debug!("TLS 1.2 session stored for {}", self.server_name);
        }
    }
}

fn first_in_both_list(schemes: &[SignatureScheme]) -> Vec<SignatureScheme> {
    SUPPORTED_SIG_SCHEMES
        .iter()
        .copied()
        .filter(|scheme| schemes.contains(scheme))
        .collect()
}

