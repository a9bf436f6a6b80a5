//! TLS 1.3 / DTLS 1.3 server substates: ClientHello processing (including
//! HelloRetryRequest and PSK/0-RTT acceptance) through ticket issuance.

use std::time::SystemTime;

use log::{debug, info, trace};

use crate::client_hs::{now_unix, SUPPORTED_SIG_SCHEMES};
use crate::client_tls13::{
    tls13_scheme_acceptable, EPOCH_APPLICATION, EPOCH_EARLY, EPOCH_HANDSHAKE,
};
use crate::conn::{ConnectionCore, Wait};
use crate::error::Error;
use crate::key_schedule::{KeySchedule, SecretKind};
use crate::msgs::base::{Payload, PayloadU8, PayloadU16};
use crate::msgs::codec::Codec;
use crate::msgs::enums::{
    ExtensionType, HandshakeType, PSKKeyExchangeMode, ProtocolVersion, SignatureScheme,
};
use crate::msgs::enums::Compression;
use crate::msgs::handshake::{
    CertReqExtension, CertificatePayloadTLS13, CertificateRequestPayloadTLS13, ClientHelloPayload,
    DigitallySignedStruct, HandshakeMessagePayload, HandshakePayload, HelloRetryExtension,
    HelloRetryRequest, KeyShareEntry, NewSessionTicketExtension, NewSessionTicketPayloadTLS13,
    Random, ServerExtension, ServerHelloPayload, SessionID,
};
use crate::msgs::hsjoiner::JoinedMessage;
use crate::msgs::persist::SessionValue;
use crate::server::VerifyMode;
use crate::server_hs::{ServerHandshake, ServerState};
use crate::suites::KeyExchange;
use crate::util::constant_time_eq;
use crate::verify::{construct_tls13_verify_message, verify_signed_struct};

impl ServerHandshake {
    pub(crate) fn process_client_hello13(
        &mut self,
        core: &mut ConnectionCore,
        hello: &ClientHelloPayload,
        transcript_bytes: &[u8],
    ) -> Result<(), Error> {
        let suite = self.suite.unwrap();
        self.session_id = hello.session_id.clone();
        core.set_tls13_framing();

        self.transcript.start_hash(suite.hash_algorithm);

        if self.hrr_sent {
            // The retried hello must echo our cookie and carry the share
            // we demanded.
            if let Some(expected) = &self.hrr_cookie {
                let offered = match hello.find_extension(ExtensionType::Cookie) {
                    Some(crate::msgs::handshake::ClientExtension::Cookie(cookie)) => {
                        cookie.0.clone()
                    }
                    _ => return Err(Error::MissingExtension("cookie after HRR")),
                };
                if !constant_time_eq(expected, &offered) {
                    return Err(Error::IllegalParameter("cookie mismatch after HRR"));
                }
            }
        }

        let shares = hello
            .get_keyshare_extension()
            .ok_or(Error::MissingExtension("key_share"))?;
        hello
            .get_sigalgs_extension()
            .ok_or(Error::MissingExtension("signature_algorithms"))?;

        let chosen = self
            .config
            .supported_groups
            .iter()
            .find_map(|group| {
                shares
                    .iter()
                    .find(|share| share.group == *group)
                    .map(|share| (*group, share.payload.0.clone()))
            });

        let (group, client_share) = match chosen {
            Some(found) => found,
            None => {
                return self.emit_hello_retry_request(core, hello, transcript_bytes);
            }
        };

        if self.hrr_sent {
            // We demanded exactly one group; anything else is a protocol
            // violation.
            let demanded = self.hrr_group.ok_or(Error::InternalError("HRR without group"))?;
            if group != demanded {
                return Err(Error::IllegalParameter("share does not match HRR"));
            }
        }

        // PSK resumption, with binder proof over the truncated hello;
        // checked against the transcript state before this hello.
        if let Some(offer) = hello.get_psk() {
            let modes = hello.get_psk_modes().unwrap_or(&[]);
            if modes.contains(&PSKKeyExchangeMode::PSK_DHE_KE) && !offer.identities.is_empty() {
                self.try_accept_psk(core, hello, offer, transcript_bytes)?;
            }
        }

        self.transcript.add(transcript_bytes);
        self.client_share = Some((group, client_share));

        if self.early_data_accepted {
            let psk = self
                .psk
                .clone()
                .ok_or(Error::InternalError("early data without PSK"))?;
            self.install_early_read_key(core, &psk)?;
        }

        self.kx = Some(KeyExchange::start_ecdhe(group)?);
        self.state = ServerState::EmitServerHello13;
        self.wait = Wait::Ok;
        Ok(())
    }

    fn emit_hello_retry_request(
        &mut self,
        core: &mut ConnectionCore,
        hello: &ClientHelloPayload,
        transcript_bytes: &[u8],
    ) -> Result<(), Error> {
        if self.hrr_sent {
            return Err(Error::IllegalParameter("no usable share after HRR"));
        }

        let groups = hello
            .get_namedgroups_extension()
            .ok_or(Error::MissingExtension("supported_groups"))?;
        let retry_group = crate::util::first_in_both(&self.config.supported_groups, groups)
            .ok_or(Error::HandshakeFailure("no shared key-exchange group"))?;

        // ClientHello1 enters the transcript, then collapses to its hash.
        self.transcript.add(transcript_bytes);
        self.transcript.rollup_for_hrr();

        let mut cookie = vec![0u8; 32];
        self.config.rng.fill(&mut cookie)?;
        self.hrr_cookie = Some(cookie.clone());

        let wanted_version = if self.dtls {
            ProtocolVersion::DTLSv1_3
        } else {
            ProtocolVersion::TLSv1_3
        };

        let hrr = HelloRetryRequest {
            legacy_version: ProtocolVersion::TLSv1_2,
            session_id: hello.session_id.clone(),
            cipher_suite: self.suite.unwrap().suite,
            extensions: vec![
                HelloRetryExtension::SupportedVersions(wanted_version),
                HelloRetryExtension::KeyShare(retry_group),
                HelloRetryExtension::Cookie(PayloadU16::new(cookie)),
            ],
        };

        let msg = HandshakeMessagePayload {
            typ: HandshakeType::ServerHello,
            payload: HandshakePayload::HelloRetryRequest(hrr),
        };
        let mut body = msg.get_tls_encoding();
        body.drain(..4); // send_hs_message re-frames the body

        let tx = core.send_hs_message(HandshakeType::ServerHello, body);
        self.transcript.add(&tx);
        core.flush_hs_run()?;

        debug!("sent HelloRetryRequest for group {:?}", retry_group);
        self.hrr_sent = true;
        self.hrr_group = Some(retry_group);
        self.state = ServerState::AwaitClientHello;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    fn try_accept_psk(
        &mut self,
        core: &mut ConnectionCore,
        hello: &ClientHelloPayload,
        offer: &crate::msgs::handshake::PresharedKeyOffer,
        transcript_bytes: &[u8],
    ) -> Result<(), Error> {
        let suite = self.suite.unwrap();

        // Only the first identity is considered.
        let identity = &offer.identities[0];
        let plain = match self.config.ticketer.decrypt(&identity.identity.0) {
            Some(plain) => plain,
            None => {
                trace!("offered PSK ticket didn't decrypt; full handshake");
                return Ok(());
            }
        };
        let value = match SessionValue::read_bytes(&plain) {
            Some(value) => value,
            None => return Ok(()),
        };

        if !value.version.is_tls13_family() {
            return Ok(());
        }
        // Resumption requires the same hash; a different suite with the
        // same hash is permitted.
        let resumed_suite = match crate::suites::lookup_suite(value.cipher_suite) {
            Some(scs) => scs,
            None => return Ok(()),
        };
        if resumed_suite.hash_algorithm != suite.hash_algorithm {
            debug!("resumption refused: hash mismatch");
            return Ok(());
        }
        if value.has_expired(now_unix()) {
            debug!("resumption refused: expired");
            return Ok(());
        }

        // Binder check: a bad binder is fatal, not a miss.
        if offer.binders.len() != offer.identities.len() {
            return Err(Error::DecodeError);
        }
        let binder = &offer.binders[0].0;
        let binders_tail: usize =
            2 + offer.binders.iter().map(|b| 1 + b.0.len()).sum::<usize>();
        if binders_tail >= transcript_bytes.len() {
            return Err(Error::DecodeError);
        }

        // The rolling transcript does not yet include this hello; the
        // binder covers everything before it plus the truncated hello.
        let mut binder_transcript = self.transcript.clone_for_binder(suite.hash_algorithm);
        binder_transcript.add(&transcript_bytes[..transcript_bytes.len() - binders_tail]);
        let truncated_hash = binder_transcript.get_current_hash();

        let mut ks = KeySchedule::new(suite.hkdf_algorithm);
        ks.input_secret(&value.master_secret);
        let empty_hash = ring::digest::digest(suite.hash_algorithm, b"");
        let binder_base = ks.derive(SecretKind::ResumptionPskBinderKey, empty_hash.as_ref());
        let expected = ks.sign_psk_binder(&binder_base, &truncated_hash);

        if !constant_time_eq(&expected, binder) {
            return Err(Error::DecryptError);
        }

        info!("TLS 1.3 resumption accepted");
        self.psk = Some(value.master_secret.clone());
        self.psk_accepted = true;

        // 0-RTT gates: ticket permits it, configuration permits it, no
        // HRR, same ALPN, and no client auth in play.
        let alpn_matches = value.alpn == core.alpn_protocol.clone().unwrap_or_default();
        if self.config.early_data_enabled
            && hello.early_data_requested()
            && !self.hrr_sent
            && value.max_early_data > 0
            && alpn_matches
            && self.config.verify_mode == VerifyMode::None
        {
            info!("0-RTT accepted");
            self.early_data_accepted = true;
        }

        Ok(())
    }

    fn install_early_read_key(
        &mut self,
        core: &mut ConnectionCore,
        psk: &[u8],
    ) -> Result<(), Error> {
        let suite = self.suite.unwrap();
        let mut ks = KeySchedule::new(suite.hkdf_algorithm);
        ks.input_secret(psk);
        let ch_hash = self.transcript.get_current_hash();
        let early_secret = ks.derive(SecretKind::ClientEarlyTrafficSecret, &ch_hash);

        let (key, iv) =
            ks.derive_traffic_keys(&early_secret, suite.enc_key_len, suite.fixed_iv_len);
        core.start_encryption_read_at(
            suite,
            crate::cipher::CipherForm::XorNonce,
            &key,
            &iv,
            self.dtls_epoch(EPOCH_EARLY),
        )?;
        self.reading_early_data = true;
        Ok(())
    }

    pub(crate) fn emit_server_hello13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        if !self.psk_accepted && !self.resolve_certificate()? {
            self.wait = Wait::X509Lookup;
            return Ok(());
        }

        let suite = self.suite.unwrap();
        let (group, peer_share) = self
            .client_share
            .clone()
            .ok_or(Error::InternalError("no client share"))?;

        let kx = self
            .kx
            .take()
            .ok_or(Error::InternalError("missing key exchange"))?;
        let our_pub = kx.pubkey.clone();
        let shared = kx.complete(&peer_share)?;

        let mut exts = vec![
            ServerExtension::SupportedVersions(if self.dtls {
                ProtocolVersion::DTLSv1_3
            } else {
                ProtocolVersion::TLSv1_3
            }),
            ServerExtension::KeyShare(KeyShareEntry::new(group, &our_pub)),
        ];
        if self.psk_accepted {
            exts.push(ServerExtension::PresharedKey(0));
        }

        let sh = ServerHelloPayload {
            legacy_version: ProtocolVersion::TLSv1_2,
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

        if !core.is_dtls() {
            core.send_ccs()?;
        }

        // Key schedule through the handshake secrets.
        let mut ks = KeySchedule::new(suite.hkdf_algorithm);
        match &self.psk {
            Some(psk) if self.psk_accepted => ks.input_secret(psk),
            _ => ks.input_empty(),
        }
        ks.input_secret(&shared.shared_secret);

        let hs_hash = self.transcript.get_current_hash();
        self.hs_client_secret = ks.derive(SecretKind::ClientHandshakeTrafficSecret, &hs_hash);
        self.hs_server_secret = ks.derive(SecretKind::ServerHandshakeTrafficSecret, &hs_hash);
        core.key_schedule = Some(ks);

        let hs_server = self.hs_server_secret.to_vec();
        core.install_tls13_write_secret_at(&hs_server, self.dtls_epoch(EPOCH_HANDSHAKE))?;

        if !self.early_data_accepted {
            let hs_client = self.hs_client_secret.to_vec();
            core.install_tls13_read_secret_at(&hs_client, self.dtls_epoch(EPOCH_HANDSHAKE))?;
        }
        // With 0-RTT in flight the read side stays on the early key until
        // EndOfEarlyData.

        self.state = ServerState::EmitEncryptedExts13;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn emit_encrypted_exts13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let mut exts = Vec::new();
        if self.sni.is_some() {
            exts.push(ServerExtension::ServerNameAck);
        }
        if let Some(proto) = core.alpn_protocol.clone() {
            exts.push(ServerExtension::make_alpn(&proto));
        }
        if self.early_data_accepted {
            exts.push(ServerExtension::EarlyData);
        }

        let mut body = Vec::new();
        crate::msgs::codec::encode_vec_u16(&mut body, &exts);
        let tx = core.send_hs_message(HandshakeType::EncryptedExtensions, body);
        self.transcript.add(&tx);

        self.state = if self.psk_accepted {
            ServerState::EmitFinished13
        } else {
            ServerState::EmitCertificate13
        };
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn emit_certificate13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        if self.config.verify_mode != VerifyMode::None
            && self.config.client_cert_verifier.offer_client_auth()
        {
            let req = CertificateRequestPayloadTLS13 {
                context: PayloadU8::empty(),
                extensions: vec![CertReqExtension::SignatureAlgorithms(
                    SUPPORTED_SIG_SCHEMES
                        .iter()
                        .copied()
                        .filter(|scheme| tls13_scheme_acceptable(*scheme))
                        .collect(),
                )],
            };
            let mut body = Vec::new();
            req.encode(&mut body);
            let tx = core.send_hs_message(HandshakeType::CertificateRequest, body);
            self.transcript.add(&tx);
            self.doing_client_auth = true;
        }

        let chain = self.certified_key.as_ref().unwrap().cert_chain.clone();
        let payload = CertificatePayloadTLS13::new(&chain);
        let mut body = Vec::new();
        payload.encode(&mut body);
        let tx = core.send_hs_message(HandshakeType::Certificate, body);
        self.transcript.add(&tx);

        self.state = ServerState::EmitCertVerify13;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn emit_cert_verify13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let certified = self.certified_key.clone().unwrap();
        let usable: Vec<SignatureScheme> = SUPPORTED_SIG_SCHEMES
            .iter()
            .copied()
            .filter(|scheme| {
                self.sigschemes_ext.contains(scheme) && tls13_scheme_acceptable(*scheme)
            })
            .collect();
        let scheme = certified
            .key
            .choose_scheme(&usable)
            .ok_or(Error::HandshakeFailure("no shared signature scheme"))?;

        let handshake_hash = self.transcript.get_current_hash();
        let message = construct_tls13_verify_message(&handshake_hash, true);
        let sig = match certified.key.sign(scheme, &message)? {
            Some(sig) => sig,
            None => {
                self.wait = Wait::PrivateKeyOperation;
                return Ok(());
            }
        };

        let mut body = Vec::new();
        DigitallySignedStruct::new(scheme, sig).encode(&mut body);
        let tx = core.send_hs_message(HandshakeType::CertificateVerify, body);
        self.transcript.add(&tx);

        self.state = ServerState::EmitFinished13;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn emit_finished13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let ks = core
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let handshake_hash = self.transcript.get_current_hash();
        let verify_data = ks.sign_verify_data(&self.hs_server_secret, &handshake_hash);

        let mut body = Vec::new();
        Payload::new(verify_data).encode(&mut body);
        let tx = core.send_hs_message(HandshakeType::Finished, body);
        self.transcript.add(&tx);
        core.flush_hs_run()?;

        // Application traffic tree, snapshotted at our Finished.
        let ks = core.key_schedule.as_mut().unwrap();
        ks.input_empty();
        let fin_hash = self.transcript.get_current_hash();
        self.ap_client_secret = ks.derive(SecretKind::ClientApplicationTrafficSecret, &fin_hash);
        self.ap_server_secret = ks.derive(SecretKind::ServerApplicationTrafficSecret, &fin_hash);
        let exporter = ks.derive(SecretKind::ExporterMasterSecret, &fin_hash);
        ks.remember_exporter_secret(exporter);

        let ap_server = self.ap_server_secret.to_vec();
        core.install_tls13_write_secret_at(&ap_server, self.dtls_epoch(EPOCH_APPLICATION))?;
        core.tls13_write_secret = Some(self.ap_server_secret.clone());

        self.state = if self.early_data_accepted {
            ServerState::AwaitEoed13
        } else if self.doing_client_auth {
            ServerState::AwaitClientCert13
        } else {
            ServerState::AwaitClientFinished13
        };
        self.wait = Wait::Flush;
        self.wait_after_flush = Wait::ReadMessage;
        Ok(())
    }

    pub(crate) fn process_eoed13(
        &mut self,
        core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::EndOfEarlyData {
            return Err(Error::UnexpectedMessage {
                expect_types: vec![HandshakeType::EndOfEarlyData],
                got_type: msg.typ,
            });
        }
        if !msg.body.is_empty() {
            return Err(Error::DecodeError);
        }

        self.transcript.add(&msg.transcript_bytes);
        self.reading_early_data = false;

        let hs_client = self.hs_client_secret.to_vec();
        core.install_tls13_read_secret_at(&hs_client, self.dtls_epoch(EPOCH_HANDSHAKE))?;

        self.state = ServerState::AwaitClientFinished13;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    pub(crate) fn process_client_cert13(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::Certificate {
            return Err(Error::UnexpectedMessage {
                expect_types: vec![HandshakeType::Certificate],
                got_type: msg.typ,
            });
        }
        let parsed = HandshakeMessagePayload::read_body_tls13(msg.typ, &msg.body)
            .ok_or(Error::DecodeError)?;
        let certs = match parsed.payload {
            HandshakePayload::CertificateTLS13(certs) => certs,
            _ => return Err(Error::DecodeError),
        };
        if !certs.context.is_empty() {
            return Err(Error::IllegalParameter("certificate context not empty"));
        }

        self.transcript.add(&msg.transcript_bytes);

        if certs.entries.is_empty() {
            if self.config.verify_mode == VerifyMode::FailIfNoPeerCert {
                return Err(Error::AccessDenied);
            }
            info!("client auth requested but no certificate supplied");
            self.doing_client_auth = false;
            self.state = ServerState::AwaitClientFinished13;
            self.wait = Wait::ReadMessage;
            return Ok(());
        }

        self.client_cert_chain = certs.into_chain();
        self.state = ServerState::AwaitClientCertVerify13;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    pub(crate) fn process_client_cert_verify13(
        &mut self,
        _core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::CertificateVerify {
            return Err(Error::UnexpectedMessage {
                expect_types: vec![HandshakeType::CertificateVerify],
                got_type: msg.typ,
            });
        }

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
        if !tls13_scheme_acceptable(dss.scheme) {
            return Err(Error::IllegalParameter("legacy scheme in CertificateVerify"));
        }

        let handshake_hash = self.transcript.get_current_hash();
        let message = construct_tls13_verify_message(&handshake_hash, false);
        verify_signed_struct(&message, &self.client_cert_chain[0], &dss)?;
        debug!("client CertificateVerify OK");

        self.transcript.add(&msg.transcript_bytes);
        self.state = ServerState::AwaitClientFinished13;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    pub(crate) fn process_client_finished13(
        &mut self,
        core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::Finished {
            return Err(Error::UnexpectedMessage {
                expect_types: vec![HandshakeType::Finished],
                got_type: msg.typ,
            });
        }

        let ks = core
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let handshake_hash = self.transcript.get_current_hash();
        let expected = ks.sign_verify_data(&self.hs_client_secret, &handshake_hash);
        if !constant_time_eq(&expected, &msg.body) {
            return Err(Error::DecryptError);
        }
        self.transcript.add(&msg.transcript_bytes);

        let final_hash = self.transcript.get_current_hash();
        let ks = core.key_schedule.as_ref().unwrap();
        self.resumption_master = ks.derive(SecretKind::ResumptionMasterSecret, &final_hash);
        core.resumption_master = Some(self.resumption_master.clone());

        let ap_client = self.ap_client_secret.to_vec();
        core.install_tls13_read_secret_at(&ap_client, self.dtls_epoch(EPOCH_APPLICATION))?;
        core.tls13_read_secret = Some(self.ap_client_secret.clone());

        self.state = ServerState::EmitTickets13;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn emit_tickets13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        if !self.config.ticketer.enabled() {
            self.state = ServerState::Complete;
            self.wait = Wait::Ok;
            return Ok(());
        }

        let suite = self.suite.unwrap();
        let ks = core
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;

        // Nonce and age_add survive `pending_ticket` retries so the
        // minted ticket stays stable.
        if self.pending_ticket_nonce.is_none() {
            let nonce = vec![0u8, 0];
            let mut age_add_bytes = [0u8; 4];
            self.config.rng.fill(&mut age_add_bytes)?;
            let age_add = u32::from_be_bytes(age_add_bytes);
            let psk = ks.derive_ticket_psk(&self.resumption_master, &nonce);
            self.pending_ticket_nonce = Some((nonce, age_add, psk));
        }
        let (nonce, age_add, psk) = self.pending_ticket_nonce.clone().unwrap();

        let mut value = SessionValue::new(
            core.negotiated_version.unwrap(),
            suite.suite,
            SessionID::empty(),
            psk,
            now_unix(),
        );
        value.timeout_secs = self.config.session_timeout;
        value.ticket_age_add = age_add;
        value.alpn = core.alpn_protocol.clone().unwrap_or_default();
        if self.config.early_data_enabled {
            value.max_early_data = self.config.max_early_data;
        }
        if let Some(sni) = &self.sni {
            value.hostname = sni.as_bytes().to_vec();
        }

        let ticket = match self.config.ticketer.encrypt(&value.get_encoding())? {
            Some(ticket) => ticket,
            None => {
                self.wait = Wait::PendingTicket;
                return Ok(());
            }
        };

        let mut nst =
            NewSessionTicketPayloadTLS13::new(self.config.session_timeout, age_add, nonce, ticket);
        if self.config.early_data_enabled {
            nst.exts
                .push(NewSessionTicketExtension::EarlyData(self.config.max_early_data));
        }
        let mut body = Vec::new();
        nst.encode(&mut body);
        let tx = core.send_hs_message(HandshakeType::NewSessionTicket, body);
        self.transcript.add(&tx);
        core.flush_hs_run()?;
        debug!("issued TLS 1.3 session ticket");

        self.state = ServerState::Complete;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn dtls_epoch(&self, epoch: u16) -> Option<u16> {
        if self.dtls {
            Some(epoch)
        } else {
            None
        }
    }
}
