use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info, warn};

use crate::cipher::CipherForm;
use crate::conn::{ConnectionCore, Wait};
use crate::error::Error;
use crate::hash_hs::HandshakeHash;
use crate::msgs::base::{Payload, PayloadU8};
use crate::msgs::codec::Codec;
use crate::msgs::enums::{
    ClientCertificateType, Compression, ContentType, ExtensionType, HandshakeType, NamedGroup,
    ProtocolVersion, SignatureScheme,
};
use crate::msgs::handshake::{
    CertificateRequestPayload, ClientHelloPayload, DigitallySignedStruct, ECDHEServerKeyExchange,
    HandshakeMessagePayload, HandshakePayload, HelloVerifyRequestPayload,
    NewSessionTicketPayload, Random, ServerECDHParams, ServerExtension, ServerHelloPayload,
    SessionID,
};
use crate::msgs::hsjoiner::JoinedMessage;
use crate::msgs::persist::SessionValue;
use crate::prf::SessionSecrets;
use crate::server::{ServerConfig, VerifyMode};
use crate::session::Session;
use crate::sign::{CertResolution, CertifiedKey};
use crate::suites::{KeyExchange, SupportedCipherSuite};
use crate::util::{constant_time_eq, first_in_both, Zeroized};
use crate::verify::verify_signed_struct;

use crate::client_hs::{now_unix, SUPPORTED_SIG_SCHEMES};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ServerState {
    AwaitClientHello,
    // TLS 1.3
    EmitServerHello13,
    EmitEncryptedExts13,
    EmitCertificate13,
    EmitCertVerify13,
    EmitFinished13,
    AwaitEoed13,
    AwaitClientCert13,
    AwaitClientCertVerify13,
    AwaitClientFinished13,
    EmitTickets13,
    // TLS 1.2
    EmitServerFlight12,
    EmitServerKx12,
    EmitServerDone12,
    EmitResume12,
    AwaitClientCert12,
    AwaitClientKx12,
    AwaitCertVerify12,
    AwaitCcs12,
    AwaitFinished12,
    EmitFinished12,
    Complete,
}

/// Ephemeral server handshake state.
pub struct ServerHandshake {
    pub wait: Wait,
    /// Where the driver goes once a `Flush` wait drains.
    pub(crate) wait_after_flush: Wait,
    pub(crate) state: ServerState,
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) dtls: bool,

    pub(crate) transcript: HandshakeHash,
    pub(crate) client_random: [u8; 32],
    pub(crate) server_random: [u8; 32],
    pub(crate) session_id: SessionID,
    pub(crate) suite: Option<&'static SupportedCipherSuite>,
    pub(crate) sni: Option<String>,
    pub(crate) certified_key: Option<Arc<CertifiedKey>>,
    pub(crate) sigschemes_ext: Vec<SignatureScheme>,
    pub(crate) kx: Option<KeyExchange>,
    pub(crate) doing_client_auth: bool,
    pub(crate) client_cert_chain: Vec<Vec<u8>>,

    // DTLS cookie exchange
    dtls_cookie: Option<Vec<u8>>,

    /// Client signaled secure renegotiation (extension or SCSV).
    pub(crate) client_sent_reneg_info: bool,

    /// Stopped after ClientHello processing so the owner can hand the
    /// connection to another process.
    pub(crate) paused_for_handoff: bool,
    /// The negotiated key-exchange group, kept for handoff.
    pub(crate) kx_group: Option<NamedGroup>,

    // TLS 1.2
    pub(crate) secrets12: Option<SessionSecrets>,
    pub(crate) doing_resume: bool,
    pub(crate) using_ems: bool,
    pub(crate) send_ticket12: bool,
    pub(crate) resume_value: Option<Session>,
    chosen_sigscheme: Option<SignatureScheme>,
    pub(crate) our_verify_data: Vec<u8>,
    pub(crate) peer_verify_data: Vec<u8>,

    // TLS 1.3
    pub(crate) hrr_sent: bool,
    pub(crate) hrr_group: Option<NamedGroup>,
    pub(crate) hrr_cookie: Option<Vec<u8>>,
    pub(crate) client_share: Option<(NamedGroup, Vec<u8>)>,
    pub(crate) psk: Option<Zeroized>,
    pub(crate) psk_accepted: bool,
    pub(crate) early_data_accepted: bool,
    pub(crate) reading_early_data: bool,
    pub(crate) hs_client_secret: Zeroized,
    pub(crate) hs_server_secret: Zeroized,
    pub(crate) ap_client_secret: Zeroized,
    pub(crate) ap_server_secret: Zeroized,
    pub(crate) resumption_master: Zeroized,
    /// Ticket issuance intermediates kept across `pending_ticket` retries.
    pub(crate) pending_ticket_nonce: Option<(Vec<u8>, u32, Zeroized)>,
}

impl ServerHandshake {
    pub fn new(config: Arc<ServerConfig>, dtls: bool) -> Result<ServerHandshake, Error> {
        let mut server_random = [0u8; 32];
        config.rng.fill(&mut server_random)?;

        Ok(ServerHandshake {
            wait: Wait::ReadMessage,
            wait_after_flush: Wait::ReadMessage,
            state: ServerState::AwaitClientHello,
            config,
            dtls,
            transcript: HandshakeHash::new(),
            client_random: [0u8; 32],
            server_random,
            session_id: SessionID::empty(),
            suite: None,
            sni: None,
            certified_key: None,
            sigschemes_ext: Vec::new(),
            kx: None,
            doing_client_auth: false,
            client_cert_chain: Vec::new(),
            dtls_cookie: None,
            client_sent_reneg_info: false,
            paused_for_handoff: false,
            kx_group: None,
            secrets12: None,
            doing_resume: false,
            using_ems: false,
            send_ticket12: false,
            resume_value: None,
            chosen_sigscheme: None,
            our_verify_data: Vec::new(),
            peer_verify_data: Vec::new(),
            hrr_sent: false,
            hrr_group: None,
            hrr_cookie: None,
            client_share: None,
            psk: None,
            psk_accepted: false,
            early_data_accepted: false,
            reading_early_data: false,
            hs_client_secret: Zeroized::empty(),
            hs_server_secret: Zeroized::empty(),
            ap_client_secret: Zeroized::empty(),
            ap_server_secret: Zeroized::empty(),
            resumption_master: Zeroized::empty(),
            pending_ticket_nonce: None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.state == ServerState::Complete
    }

    pub fn reading_early_data(&self) -> bool {
        self.reading_early_data
    }

    fn unexpected(&self, got: HandshakeType, expect: &[HandshakeType]) -> Error {
        Error::UnexpectedMessage {
            expect_types: expect.to_vec(),
            got_type: got,
        }
    }

    pub fn step(
        &mut self,
        core: &mut ConnectionCore,
        input: Option<JoinedMessage>,
    ) -> Result<(), Error> {
        match self.state {
            ServerState::AwaitClientHello => self.process_client_hello(core, input.unwrap()),
            ServerState::EmitServerHello13 => self.emit_server_hello13(core),
            ServerState::EmitEncryptedExts13 => self.emit_encrypted_exts13(core),
            ServerState::EmitCertificate13 => self.emit_certificate13(core),
            ServerState::EmitCertVerify13 => self.emit_cert_verify13(core),
            ServerState::EmitFinished13 => self.emit_finished13(core),
            ServerState::AwaitEoed13 => self.process_eoed13(core, input.unwrap()),
            ServerState::AwaitClientCert13 => self.process_client_cert13(core, input.unwrap()),
            ServerState::AwaitClientCertVerify13 => {
                self.process_client_cert_verify13(core, input.unwrap())
            }
            ServerState::AwaitClientFinished13 => {
                self.process_client_finished13(core, input.unwrap())
            }
            ServerState::EmitTickets13 => self.emit_tickets13(core),
            ServerState::EmitServerFlight12 => self.emit_server_flight12(core),
            ServerState::EmitServerKx12 => self.emit_server_kx12(core),
            ServerState::EmitServerDone12 => self.emit_server_done12(core),
            ServerState::EmitResume12 => self.emit_resume12(core),
            ServerState::AwaitClientCert12 => self.process_client_cert12(core, input.unwrap()),
            ServerState::AwaitClientKx12 => self.process_client_kx12(core, input.unwrap()),
            ServerState::AwaitCertVerify12 => self.process_cert_verify12(core, input.unwrap()),
            ServerState::AwaitCcs12 => Err(Error::InternalError("step during CCS wait")),
            ServerState::AwaitFinished12 => self.process_client_finished12(core, input.unwrap()),
            ServerState::EmitFinished12 => self.emit_finished12(core),
            ServerState::Complete => Ok(()),
        }
    }

    pub fn on_ccs(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let tls13 = core
            .negotiated_version
            .map_or(false, |v| v.is_tls13_family());
        if tls13 {
            return Ok(());
        }

        if self.state != ServerState::AwaitCcs12 {
            return Err(Error::UnexpectedRecord(ContentType::ChangeCipherSpec));
        }
        if !core.hs_buffer_empty() {
            warn!("CCS interleaved with fragmented handshake message");
            return Err(Error::UnexpectedRecord(ContentType::ChangeCipherSpec));
        }

        self.start_encryption12_read(core)?;
        self.state = ServerState::AwaitFinished12;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    // ---- ClientHello ----

    fn process_client_hello(
        &mut self,
        core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::ClientHello {
            return Err(self.unexpected(msg.typ, &[HandshakeType::ClientHello]));
        }

        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, self.dtls)
            .ok_or(Error::DecodeError)?;
        let hello = match parsed.payload {
            HandshakePayload::ClientHello(hello) => hello,
            _ => return Err(Error::DecodeError),
        };

        if !hello.compression_methods.contains(&Compression::Null) {
            return Err(Error::IllegalParameter("no null compression offered"));
        }
        if hello.get_psk().is_some() && !hello.psk_is_last_extension() {
            return Err(Error::IllegalParameter("pre_shared_key not last"));
        }

        self.client_random.copy_from_slice(&hello.random.0);
        self.client_sent_reneg_info = hello.get_renegotiation_info().is_some()
            || hello
                .cipher_suites
                .contains(&crate::msgs::enums::CipherSuite::TLS_EMPTY_RENEGOTIATION_INFO_SCSV);
        self.sni = hello
            .get_sni_hostname()
            .and_then(|sni| std::str::from_utf8(sni).ok().map(str::to_string));
        self.sigschemes_ext = hello
            .get_sigalgs_extension()
            .map(|schemes| schemes.to_vec())
            .unwrap_or_else(|| {
                vec![
                    SignatureScheme::RSA_PKCS1_SHA256,
                    SignatureScheme::ECDSA_NISTP256_SHA256,
                ]
            });

        let version = self.negotiate_version(&hello)?;
        core.negotiated_version = Some(version);
        debug!("negotiated {:?}", version);

        // DTLS ≤1.2 cookie exchange precedes any commitment.
        if self.dtls && !version.is_tls13_family() && !self.verify_dtls_cookie(&hello)? {
            return self.emit_hello_verify_request(core);
        }

        // ALPN: our preference over their offer.
        if let Some(their_protocols) = hello.get_alpn_extension() {
            let theirs: Vec<Vec<u8>> = their_protocols
                .iter()
                .map(|proto| proto.0 .0.clone())
                .collect();
            if theirs.iter().any(|proto| proto.is_empty()) {
                return Err(Error::IllegalParameter("empty ALPN protocol"));
            }
            if !self.config.alpn_protocols.is_empty() {
                match first_in_both(&self.config.alpn_protocols, &theirs) {
                    Some(chosen) => {
                        info!("chose ALPN protocol {:?}", chosen);
                        core.alpn_protocol = Some(chosen);
                    }
                    None => return Err(Error::NoApplicationProtocol),
                }
            }
        }

        // Suite selection; certificate key type narrows it below once the
        // resolver answers.
        let client_suites = &hello.cipher_suites;
        let ours = crate::suites::reduce_given_version(&self.config.cipher_suites, version);
        let suite = if self.config.prefer_server_cipher_order {
            crate::suites::choose_ciphersuite_preferring_server(client_suites, &ours)
        } else {
            crate::suites::choose_ciphersuite_preferring_client(client_suites, &ours)
        }
        .ok_or(Error::HandshakeFailure("no shared cipher suite"))?;
        info!("decided upon suite {:?}", suite.suite);
        self.suite = Some(suite);
        core.suite = Some(suite);

        // The transcript buffer also feeds TLS 1.2 client CertificateVerify
        // and handoff serialization.
        self.transcript.request_buffer();
        if version.is_tls13_family() {
            self.process_client_hello13(core, &hello, &msg.transcript_bytes)
        } else {
            self.transcript.start_hash(suite.hash_algorithm);
            self.transcript.add(&msg.transcript_bytes);
            self.process_client_hello12(core, &hello)
        }
    }

    fn negotiate_version(&self, hello: &ClientHelloPayload) -> Result<ProtocolVersion, Error> {
        if let Some(versions) = hello.get_versions_extension() {
            let wanted = if self.dtls {
                ProtocolVersion::DTLSv1_3
            } else {
                ProtocolVersion::TLSv1_3
            };
            if versions.contains(&wanted) && self.config.max_version.get_u16() >= ProtocolVersion::TLSv1_3.get_u16() {
                return Ok(wanted);
            }
        }

        // Legacy negotiation: min(client_version, our max ≤1.2), checked
        // against our floor. DTLS values descend with newer versions.
        let (their, newer_is_smaller) = if self.dtls {
            (hello.client_version, true)
        } else {
            (hello.client_version, false)
        };

        let acceptable_12 = if newer_is_smaller {
            their.get_u16() <= ProtocolVersion::DTLSv1_2.get_u16()
        } else {
            their.get_u16() >= ProtocolVersion::TLSv1_2.get_u16()
        };

        let floor_is_12 = self.config.min_version.get_u16() >= ProtocolVersion::TLSv1_2.get_u16();

        if acceptable_12 {
            Ok(if self.dtls {
                ProtocolVersion::DTLSv1_2
            } else {
                ProtocolVersion::TLSv1_2
            })
        } else if floor_is_12 {
            Err(Error::ProtocolVersion)
        } else {
            // Pre-1.2 offers are acceptable only if configuration reaches
            // that low; we do not implement the legacy ciphers, so refuse.
            Err(Error::ProtocolVersion)
        }
    }

    fn verify_dtls_cookie(&mut self, hello: &ClientHelloPayload) -> Result<bool, Error> {
        let offered = hello
            .cookie
            .as_ref()
            .map(|cookie| cookie.0.clone())
            .unwrap_or_default();

        match &self.dtls_cookie {
            None => Ok(false),
            Some(expected) => Ok(constant_time_eq(expected, &offered)),
        }
    }

    fn emit_hello_verify_request(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let mut cookie = vec![0u8; 20];
        self.config.rng.fill(&mut cookie)?;
        self.dtls_cookie = Some(cookie.clone());

        let hvr = HelloVerifyRequestPayload {
            server_version: ProtocolVersion::DTLSv1_0,
            cookie: PayloadU8::new(cookie),
        };
        let mut body = Vec::new();
        hvr.encode(&mut body);
        core.send_hs_message(HandshakeType::HelloVerifyRequest, body);
        core.flush_hs_run()?;

        // The verified hello restarts the transcript (RFC 6347 §4.2.1).
        self.transcript = HandshakeHash::new();
        debug!("sent HelloVerifyRequest");
        self.state = ServerState::AwaitClientHello;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    // ---- cert resolution (shared) ----

    /// Resolve our certificate, suspending on `x509_lookup` while the
    /// resolver works.
    pub(crate) fn resolve_certificate(&mut self) -> Result<bool, Error> {
        if self.certified_key.is_some() {
            return Ok(true);
        }
        match self
            .config
            .cert_resolver
            .resolve(self.sni.as_deref(), &self.sigschemes_ext)
        {
            CertResolution::Found(ck) => {
                self.certified_key = Some(ck);
                Ok(true)
            }
            CertResolution::Pending => Ok(false),
            CertResolution::NotFound => Err(Error::AccessDenied),
        }
    }

    // ---- TLS 1.2 ----

    fn process_client_hello12(
        &mut self,
        core: &mut ConnectionCore,
        hello: &ClientHelloPayload,
    ) -> Result<(), Error> {
        let suite = self.suite.unwrap();

        let groups: Vec<NamedGroup> = hello
            .get_namedgroups_extension()
            .map(|groups| groups.to_vec())
            .unwrap_or_default();
        let chosen_group = first_in_both(&self.config.supported_groups, &groups)
            .ok_or(Error::HandshakeFailure("no shared key-exchange group"))?;

        self.using_ems = hello
            .find_extension(ExtensionType::ExtendedMasterSecret)
            .is_some();

        // Tickets: decrypting one is the preferred resumption path; a
        // failed decrypt is just a miss.
        let mut ticket_received = false;
        if self.config.ticketer.enabled() {
            if let Some(crate::msgs::handshake::ClientExtension::SessionTicketOffer(ticket)) =
                hello.get_ticket_extension()
            {
                ticket_received = true;
                info!("ticket received");
                if let Some(plain) = self.config.ticketer.decrypt(&ticket.0) {
                    if let Some(value) = SessionValue::read_bytes(&plain) {
                        return self.start_resumption12(core, hello, value);
                    }
                }
                info!("ticket didn't decrypt");
            }

            if hello.get_ticket_extension().is_some() {
                self.send_ticket12 = true;
            }
        }

        // Session-id resumption only matters when no ticket was offered.
        if !hello.session_id.is_empty()
            && !ticket_received
            && self.config.session_cache_mode.caches_server()
        {
            if let Some(session) = self.config.session_cache.get(&hello.session_id) {
                return self.start_resumption12(core, hello, (*session).clone());
            }
        }

        // Fresh session id for cacheability.
        if self.config.session_cache_mode.caches_server() {
            let mut id = [0u8; 32];
            self.config.rng.fill(&mut id)?;
            self.session_id = SessionID::new(&id);
        }

        self.kx = Some(KeyExchange::start_ecdhe(chosen_group)?);
        self.kx_group = Some(chosen_group);
        let _ = suite;
        self.state = ServerState::EmitServerFlight12;
        self.wait = Wait::Ok;
        self.paused_for_handoff = self.config.handoff_enabled;
        Ok(())
    }

    fn start_resumption12(
        &mut self,
        core: &mut ConnectionCore,
        hello: &ClientHelloPayload,
        value: SessionValue,
    ) -> Result<(), Error> {
        let suite = self.suite.unwrap();

        if value.cipher_suite != suite.suite {
            return Err(Error::SessionMismatch);
        }
        if value.version != core.negotiated_version.unwrap() {
            return Err(Error::SessionMismatch);
        }
        if value.has_expired(now_unix()) {
            debug!("stored session expired; full handshake");
            self.session_id = SessionID::empty();
            return self.continue_full_handshake12(core, hello);
        }

        info!("resuming session");
        self.doing_resume = true;
        self.session_id = hello.session_id.clone();
        self.secrets12 = Some(SessionSecrets::new_resume(
            suite.hash_algorithm,
            &value.master_secret,
            self.client_random,
            self.server_random,
        ));
        self.resume_value = Some(Arc::new(value));
        self.state = ServerState::EmitResume12;
        self.wait = Wait::Ok;
        self.paused_for_handoff = self.config.handoff_enabled;
        Ok(())
    }

    fn continue_full_handshake12(
        &mut self,
        _core: &mut ConnectionCore,
        hello: &ClientHelloPayload,
    ) -> Result<(), Error> {
        let groups: Vec<NamedGroup> = hello
            .get_namedgroups_extension()
            .map(|groups| groups.to_vec())
            .unwrap_or_default();
        let chosen_group = first_in_both(&self.config.supported_groups, &groups)
            .ok_or(Error::HandshakeFailure("no shared key-exchange group"))?;
        self.kx = Some(KeyExchange::start_ecdhe(chosen_group)?);
        self.kx_group = Some(chosen_group);
        self.state = ServerState::EmitServerFlight12;
        self.wait = Wait::Ok;
        self.paused_for_handoff = self.config.handoff_enabled;
        Ok(())
    }

    fn server_hello_extensions12(&mut self, core: &ConnectionCore) -> Vec<ServerExtension> {
        let mut exts = Vec::new();

        if self.sni.is_some() {
            exts.push(ServerExtension::ServerNameAck);
        }
        if let Some(proto) = &core.alpn_protocol {
            exts.push(ServerExtension::make_alpn(proto));
        }
        if self.using_ems {
            exts.push(ServerExtension::ExtendedMasterSecretAck);
        }
        if self.client_sent_reneg_info {
            // Secure renegotiation: echo both verify_datas (empty on the
            // initial handshake).
            let mut data = self.peer_verify_data.clone();
            data.extend_from_slice(&self.our_verify_data);
            exts.push(ServerExtension::RenegotiationInfo(PayloadU8::new(data)));
        }
        if self.send_ticket12 {
            exts.push(ServerExtension::SessionTicketAck);
        }

        exts
    }

    fn emit_server_hello12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let suite = self.suite.unwrap();
        let exts = self.server_hello_extensions12(core);

        let sh = ServerHelloPayload {
            legacy_version: core.negotiated_version.unwrap(),
            random: Random(self.server_random),
            session_id: self.session_id.clone(),
            cipher_suite: suite.suite,
            compression_method: Compression::Null,
            extensions: exts,
        };
        let mut body = Vec::new();
        sh.encode_body(&mut body);
        let tx = core.send_hs_message(HandshakeType::ServerHello, body);
        self.transcript.add(&tx);
        Ok(())
    }

    fn emit_server_flight12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        // Certificate lookup may suspend before anything is emitted.
        if !self.resolve_certificate()? {
            self.wait = Wait::X509Lookup;
            return Ok(());
        }

        // Narrow the chosen suite by the certificate's key type.
        let sigalg = self.certified_key.as_ref().unwrap().key.algorithm();
        if !self.suite.unwrap().usable_for_sigalg(sigalg) {
            let ours = crate::suites::reduce_given_sigalg(&self.config.cipher_suites, sigalg);
            let version = core.negotiated_version.unwrap();
            let replacement = ours
                .iter()
                .copied()
                .find(|scs| scs.usable_for_version(version))
                .ok_or(Error::HandshakeFailure("no suite usable with certificate"))?;
            self.suite = Some(replacement);
            core.suite = Some(replacement);
        }

        self.emit_server_hello12(core)?;

        // Certificate
        let chain = self.certified_key.as_ref().unwrap().cert_chain.clone();
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

        self.state = ServerState::EmitServerKx12;
        self.wait = Wait::Ok;
        Ok(())
    }

    /// ServerKeyExchange: ECDHE params signed over both randoms. The
    /// signature may suspend; nothing else mutates until it exists.
    fn emit_server_kx12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let certified = self.certified_key.clone().unwrap();
        let kx = self
            .kx
            .as_ref()
            .ok_or(Error::InternalError("missing key exchange"))?;
        let params = ServerECDHParams::new(kx.group, &kx.pubkey);

        let scheme = match self.chosen_sigscheme {
            Some(scheme) => scheme,
            None => {
                let usable: Vec<SignatureScheme> = SUPPORTED_SIG_SCHEMES
                    .iter()
                    .copied()
                    .filter(|scheme| self.sigschemes_ext.contains(scheme))
                    .collect();
                let scheme = certified
                    .key
                    .choose_scheme(&usable)
                    .ok_or(Error::HandshakeFailure("no shared signature scheme"))?;
                self.chosen_sigscheme = Some(scheme);
                scheme
            }
        };

        let mut message = Vec::new();
        message.extend_from_slice(&self.client_random);
        message.extend_from_slice(&self.server_random);
        params.encode(&mut message);

        let sig = match certified.key.sign(scheme, &message)? {
            Some(sig) => sig,
            None => {
                self.wait = Wait::PrivateKeyOperation;
                return Ok(());
            }
        };

        let skx = ECDHEServerKeyExchange {
            params,
            dss: DigitallySignedStruct::new(scheme, sig),
        };
        let mut body = Vec::new();
        skx.encode(&mut body);
        let tx = core.send_hs_message(HandshakeType::ServerKeyExchange, body);
        self.transcript.add(&tx);

        self.state = ServerState::EmitServerDone12;
        self.wait = Wait::Ok;
        Ok(())
    }

    fn emit_server_done12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        if self.config.verify_mode != VerifyMode::None
            && self.config.client_cert_verifier.offer_client_auth()
        {
            let req = CertificateRequestPayload {
                certtypes: vec![
                    ClientCertificateType::RSASign,
                    ClientCertificateType::ECDSASign,
                ],
                sigschemes: SUPPORTED_SIG_SCHEMES.to_vec(),
                canames: Vec::new(),
            };
            let mut body = Vec::new();
            req.encode(&mut body);
            let tx = core.send_hs_message(HandshakeType::CertificateRequest, body);
            self.transcript.add(&tx);
            self.doing_client_auth = true;
        }

        let tx = core.send_hs_message(HandshakeType::ServerHelloDone, Vec::new());
        self.transcript.add(&tx);
        core.flush_hs_run()?;

        self.state = if self.doing_client_auth {
            ServerState::AwaitClientCert12
        } else {
            ServerState::AwaitClientKx12
        };
        self.wait = Wait::Flush;
        self.wait_after_flush = Wait::ReadMessage;
        Ok(())
    }

    fn emit_resume12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        self.emit_server_hello12(core)?;
        self.emit_ticket12(core)?;
        core.send_ccs()?;
        self.start_encryption12_write(core)?;
        self.emit_finished12_msg(core)?;
        core.flush_hs_run()?;

        self.state = ServerState::AwaitCcs12;
        self.wait = Wait::Flush;
        self.wait_after_flush = Wait::ReadChangeCipherSpec;
        Ok(())
    }

    fn process_client_cert12(
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

        self.transcript.add(&msg.transcript_bytes);

        if chain.is_empty() {
            if self.config.verify_mode == VerifyMode::FailIfNoPeerCert {
                return Err(Error::AccessDenied);
            }
            info!("client auth requested but no certificate supplied");
            self.doing_client_auth = false;
            self.state = ServerState::AwaitClientKx12;
            self.wait = Wait::ReadMessage;
            return Ok(());
        }

        self.client_cert_chain = chain.into_iter().map(|cert| cert.0).collect();
        self.state = ServerState::AwaitClientKx12;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    fn process_client_kx12(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::ClientKeyExchange {
            return Err(self.unexpected(msg.typ, &[HandshakeType::ClientKeyExchange]));
        }
        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
            .ok_or(Error::DecodeError)?;
        let ckx = match parsed.payload {
            HandshakePayload::ClientKeyExchange(ckx) => ckx,
            _ => return Err(Error::DecodeError),
        };

        self.transcript.add(&msg.transcript_bytes);

        let suite = self.suite.unwrap();
        let kx = self
            .kx
            .take()
            .ok_or(Error::InternalError("missing key exchange"))?;
        let shared = kx.complete(&ckx.0)?;

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

        self.state = if self.doing_client_auth {
            ServerState::AwaitCertVerify12
        } else {
            ServerState::AwaitCcs12
        };
        self.wait = if self.doing_client_auth {
            Wait::ReadMessage
        } else {
            Wait::ReadChangeCipherSpec
        };
        Ok(())
    }

    fn process_cert_verify12(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::CertificateVerify {
            return Err(self.unexpected(msg.typ, &[HandshakeType::CertificateVerify]));
        }

        // Asynchronous chain validation; transcript untouched until done.
        match self.config.client_cert_verifier.verify_client_cert(
            &self.client_cert_chain[0],
            &self.client_cert_chain[1..].to_vec(),
            SystemTime::now(),
        )? {
            Some(_) => {}
            None => {
                self.wait = Wait::CertificateVerify;
                return Ok(());
            }
        }

        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
            .ok_or(Error::DecodeError)?;
        let dss = match parsed.payload {
            HandshakePayload::CertificateVerify(dss) => dss,
            _ => return Err(Error::DecodeError),
        };

        let handshake_msgs = self.transcript.peek_handshake_buf();
        verify_signed_struct(&handshake_msgs, &self.client_cert_chain[0], &dss)?;
        debug!("client CertificateVerify OK");

        self.transcript.add(&msg.transcript_bytes);
        self.state = ServerState::AwaitCcs12;
        self.wait = Wait::ReadChangeCipherSpec;
        Ok(())
    }

    fn process_client_finished12(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::Finished {
            return Err(self.unexpected(msg.typ, &[HandshakeType::Finished]));
        }

        let expected = self
            .secrets12
            .as_ref()
            .unwrap()
            .client_verify_data(&self.transcript.get_current_hash());
        if !constant_time_eq(&expected, &msg.body) {
            return Err(Error::DecryptError);
        }
        self.peer_verify_data = msg.body.clone();
        self.transcript.add(&msg.transcript_bytes);

        if self.doing_resume {
            // Resumption: our Finished already went out; done.
            self.state = ServerState::Complete;
            self.wait = Wait::Ok;
            return Ok(());
        }

        self.state = ServerState::EmitFinished12;
        self.wait = Wait::Ok;
        Ok(())
    }

    fn emit_finished12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        self.emit_ticket12(core)?;
        core.send_ccs()?;
        self.start_encryption12_write(core)?;
        self.emit_finished12_msg(core)?;
        core.flush_hs_run()?;

        self.state = ServerState::Complete;
        self.wait = Wait::Ok;
        Ok(())
    }

    fn emit_ticket12(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        if !self.send_ticket12 || self.doing_resume {
            return Ok(());
        }

        // Failure to mint a ticket is unreportable; send an empty one.
        let value = self.session_value12(core);
        let ticket = self
            .config
            .ticketer
            .encrypt(&value.get_encoding())?
            .unwrap_or_default();
        let nst = NewSessionTicketPayload::new(self.config.ticketer.lifetime(), ticket);
        let mut body = Vec::new();
        nst.encode(&mut body);
        let tx = core.send_hs_message(HandshakeType::NewSessionTicket, body);
        self.transcript.add(&tx);
        Ok(())
    }

    fn emit_finished12_msg(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let verify_data = self
            .secrets12
            .as_ref()
            .unwrap()
            .server_verify_data(&self.transcript.get_current_hash());
        self.our_verify_data = verify_data.clone();
        let mut body = Vec::new();
        Payload::new(verify_data).encode(&mut body);
        let tx = core.send_hs_message(HandshakeType::Finished, body);
        self.transcript.add(&tx);
        Ok(())
    }

    fn session_value12(&self, core: &ConnectionCore) -> SessionValue {
        let suite = self.suite.unwrap();
        let mut value = SessionValue::new(
            core.negotiated_version.unwrap(),
            suite.suite,
            self.session_id.clone(),
            Zeroized::new(self.secrets12.as_ref().unwrap().get_master_secret()),
            now_unix(),
        );
        value.timeout_secs = self.config.session_timeout;
        if let Some(sni) = &self.sni {
            value.hostname = sni.as_bytes().to_vec();
        }
        value.alpn = core.alpn_protocol.clone().unwrap_or_default();
        value.peer_cert_chain = self
            .client_cert_chain
            .iter()
            .map(|cert| crate::msgs::base::PayloadU24::new(cert.clone()))
            .collect();
        value
    }

    pub(crate) fn start_encryption12_write(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let suite = self.suite.unwrap();
        let key_len = suite.enc_key_len;
        let iv_len = suite.fixed_iv_len;
        let block = self
            .secrets12
            .as_ref()
            .unwrap()
            .make_key_block(2 * key_len + 2 * iv_len);

        // Server writes with the server halves.
        let server_key = &block[key_len..2 * key_len];
        let server_iv = &block[2 * key_len + iv_len..];
        let form = if suite.explicit_nonce_len > 0 {
            CipherForm::Tls12ExplicitNonce
        } else {
            CipherForm::XorNonce
        };
        core.start_encryption_write(suite, form, server_key, server_iv)
    }

    pub(crate) fn start_encryption12_read(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let suite = self.suite.unwrap();
        let key_len = suite.enc_key_len;
        let iv_len = suite.fixed_iv_len;
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
        core.start_encryption_read(suite, form, client_key, client_iv)
    }

    // ---- session persistence on completion ----

    pub(crate) fn store_session(&self, config: &ServerConfig, core: &mut ConnectionCore) {
        let version = match core.negotiated_version {
            Some(version) => version,
            None => return,
        };
        if version.is_tls13_family() {
            // TLS 1.3 sessions travel only in tickets, minted in
            // EmitTickets13.
            return;
        }
        if self.doing_resume || !config.session_cache_mode.caches_server() {
            return;
        }
        if self.session_id.is_empty() || self.secrets12.is_none() {
            return;
        }

        let value = self.session_value12(core);
        config
            .session_cache
            .put(&self.session_id, Arc::new(value));
        info!("session saved");
    }
}
