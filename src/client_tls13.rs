//! TLS 1.3 / DTLS 1.3 client substates: ServerHello through the second
//! flight, plus HelloRetryRequest and 0-RTT handling.

use log::{debug, trace};

use crate::client_hs::{ClientHandshake, ClientState, SUPPORTED_SIG_SCHEMES};
use crate::conn::{ConnectionCore, Wait};
use crate::error::Error;
use crate::key_schedule::{KeySchedule, SecretKind};
use crate::msgs::base::{Payload, PayloadU8};
use crate::msgs::codec::Codec;
use crate::msgs::enums::{ExtensionType, HandshakeType, ProtocolVersion, SignatureScheme};
use crate::msgs::handshake::{
    CertificatePayloadTLS13, DigitallySignedStruct, HandshakeMessagePayload, HandshakePayload,
    HelloRetryRequest, ServerExtension, ServerHelloPayload,
};
use crate::msgs::hsjoiner::JoinedMessage;
use crate::util::constant_time_eq;
use crate::verify::{construct_tls13_verify_message, verify_signed_struct};

/// DTLS 1.3 fixed epochs (RFC 9147 §6.1).
pub(crate) const EPOCH_EARLY: u16 = 1;
pub(crate) const EPOCH_HANDSHAKE: u16 = 2;
pub(crate) const EPOCH_APPLICATION: u16 = 3;

impl ClientHandshake {
    pub(crate) fn process_hello_retry_request(
        &mut self,
        core: &mut ConnectionCore,
        hrr: HelloRetryRequest,
        transcript_bytes: &[u8],
    ) -> Result<(), Error> {
        if self.hrr_seen {
            return Err(Error::IllegalParameter("second HelloRetryRequest"));
        }
        self.hrr_seen = true;

        match hrr.get_supported_versions() {
            Some(v) if v.is_tls13_family() => {}
            _ => return Err(Error::MissingExtension("supported_versions in HRR")),
        }

        let suite = crate::suites::lookup_suite(hrr.cipher_suite)
            .filter(|scs| scs.usable_for_version(ProtocolVersion::TLSv1_3))
            .filter(|scs| self.config.cipher_suites.contains(scs))
            .ok_or(Error::HandshakeFailure("HRR chose unoffered suite"))?;
        self.suite = Some(suite);
        core.suite = Some(suite);

        // The retry group must be one we support and not the one we already
        // sent a share for.
        let group = hrr
            .get_requested_key_share_group()
            .ok_or(Error::MissingExtension("key_share in HRR"))?;
        if Some(group) == self.offered_share_group {
            return Err(Error::IllegalParameter("HRR named the group already sent"));
        }
        if !self.config.supported_groups.contains(&group) {
            return Err(Error::IllegalParameter("HRR named unsupported group"));
        }

        // ClientHello1 is replaced in the transcript by its message_hash.
        self.transcript.start_hash(suite.hash_algorithm);
        self.transcript.rollup_for_hrr();
        self.transcript.add(transcript_bytes);

        self.hrr_cookie = hrr.get_cookie().map(|cookie| cookie.0.clone());

        // 0-RTT cannot survive a retry.
        if self.early_data_offered {
            self.early_data_offered = false;
            self.early_data_accepted = false;
            self.note_early_data_rejected(core);
        }

        debug!("HelloRetryRequest: retrying with group {:?}", group);
        self.offered_share_group = Some(group);
        self.kx = None;
        self.state = ClientState::EmitClientHello;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn process_server_hello13(
        &mut self,
        core: &mut ConnectionCore,
        sh: &ServerHelloPayload,
    ) -> Result<(), Error> {
        let suite = self.suite.unwrap();
        core.set_tls13_framing();

        // Validate the PSK answer against what we offered.
        let psk_accepted = match sh.get_psk_index() {
            None => false,
            Some(0) if self.offered_psk.is_some() => true,
            Some(_) => return Err(Error::IllegalParameter("bad pre_shared_key index")),
        };
        self.psk_accepted = psk_accepted;

        let mut ks = KeySchedule::new(suite.hkdf_algorithm);
        if psk_accepted {
            let offered = self.offered_psk.as_ref().unwrap();
            // The binder bound this PSK to a hash; the server may not
            // switch hashes underneath it.
            if offered.suite.hash_algorithm != suite.hash_algorithm {
                return Err(Error::IllegalParameter("PSK accepted under wrong hash"));
            }
            ks.input_secret(&offered.ticket.psk);
            debug!("TLS 1.3 resumption accepted");
        } else {
            ks.input_empty();
        }

        let share = sh
            .get_key_share()
            .ok_or(Error::MissingExtension("key_share in ServerHello"))?;
        if Some(share.group) != self.offered_share_group {
            return Err(Error::IllegalParameter("key_share group not offered"));
        }
        let kx = self
            .kx
            .take()
            .ok_or(Error::InternalError("missing key exchange"))?;
        let shared = kx.complete(&share.payload.0)?;
        ks.input_secret(&shared.shared_secret);

        let hs_hash = self.transcript.get_current_hash();
        self.hs_client_secret = ks.derive(SecretKind::ClientHandshakeTrafficSecret, &hs_hash);
        self.hs_server_secret = ks.derive(SecretKind::ServerHandshakeTrafficSecret, &hs_hash);
        core.key_schedule = Some(ks);

        // Middlebox-compatibility CCS precedes our first protected record.
        if !core.is_dtls() {
            core.send_ccs()?;
        }

        let hs_server = self.hs_server_secret.to_vec();
        core.install_tls13_read_secret_at(&hs_server, self.dtls_epoch(EPOCH_HANDSHAKE))?;

        if !(self.early_data_offered || self.early_data_accepted) {
            let hs_client = self.hs_client_secret.to_vec();
            core.install_tls13_write_secret_at(&hs_client, self.dtls_epoch(EPOCH_HANDSHAKE))?;
        }
        // With early data in flight, the write key stays at the early
        // traffic secret until EncryptedExtensions resolves acceptance.

        self.state = ClientState::AwaitEncryptedExtensions;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    pub(crate) fn process_encrypted_extensions(
        &mut self,
        core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        if msg.typ != HandshakeType::EncryptedExtensions {
            return Err(Error::UnexpectedMessage {
                expect_types: vec![HandshakeType::EncryptedExtensions],
                got_type: msg.typ,
            });
        }
        let parsed = HandshakeMessagePayload::read_body(msg.typ, &msg.body, false)
            .ok_or(Error::DecodeError)?;
        let exts = match parsed.payload {
            HandshakePayload::EncryptedExtensions(exts) => exts,
            _ => return Err(Error::DecodeError),
        };

        for ext in &exts {
            match ext {
                ServerExtension::Protocols(protos) => {
                    if protos.len() != 1 {
                        return Err(Error::DecodeError);
                    }
                    let chosen = &protos[0].0 .0;
                    if !self.config.alpn_protocols.iter().any(|p| p == chosen) {
                        return Err(Error::NoApplicationProtocol);
                    }
                    core.alpn_protocol = Some(chosen.clone());
                }
                ServerExtension::EarlyData => {
                    if !self.early_data_offered {
                        return Err(Error::IllegalParameter("unsolicited early_data ack"));
                    }
                    self.early_data_accepted = true;
                }
                ServerExtension::ServerNameAck => {}
                ServerExtension::Unknown(unk)
                    if unk.typ == ExtensionType::EllipticCurves =>
                {
                    // supported_groups is informational in EE
                }
                ServerExtension::Unknown(_) => {}
                other => {
                    trace!("unexpected extension in EE: {:?}", other.get_type());
                    return Err(Error::IllegalParameter("extension illegal in EE"));
                }
            }
        }

        self.transcript.add(&msg.transcript_bytes);

        if self.early_data_offered && !self.early_data_accepted {
            // Server discarded our 0-RTT; stop writing under the early key
            // and surface the rejection.
            self.note_early_data_rejected(core);
            let hs_client = self.hs_client_secret.to_vec();
            core.install_tls13_write_secret_at(&hs_client, self.dtls_epoch(EPOCH_HANDSHAKE))?;
            self.early_data_offered = false;
        }

        self.state = if self.psk_accepted {
            ClientState::AwaitFinished13
        } else {
            ClientState::AwaitCertOrCertReq
        };
        self.wait = if self.early_data_rejection_pending() {
            Wait::EarlyDataRejected
        } else {
            Wait::ReadMessage
        };
        Ok(())
    }

    pub(crate) fn process_cert_or_cert_req(
        &mut self,
        core: &mut ConnectionCore,
        msg: JoinedMessage,
    ) -> Result<(), Error> {
        match msg.typ {
            HandshakeType::CertificateRequest => {
                let parsed = HandshakeMessagePayload::read_body_tls13(msg.typ, &msg.body)
                    .ok_or(Error::DecodeError)?;
                let req = match parsed.payload {
                    HandshakePayload::CertificateRequestTLS13(req) => req,
                    _ => return Err(Error::DecodeError),
                };
                let schemes = req
                    .get_sigalgs_extension()
                    .ok_or(Error::MissingExtension("signature_algorithms in CR"))?
                    .to_vec();
                self.cert_request13 = Some((req.context.0.clone(), schemes));
                self.transcript.add(&msg.transcript_bytes);
                self.state = ClientState::AwaitCertificate13;
                self.wait = Wait::ReadMessage;
                Ok(())
            }
            HandshakeType::Certificate => self.process_certificate13(core, msg),
            other => Err(Error::UnexpectedMessage {
                expect_types: vec![
                    HandshakeType::CertificateRequest,
                    HandshakeType::Certificate,
                ],
                got_type: other,
            }),
        }
    }

    pub(crate) fn process_certificate13(
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
        if certs.entries.is_empty() {
            return Err(Error::BadCertificate);
        }

        self.server_cert_chain = certs.into_chain();
        self.transcript.add(&msg.transcript_bytes);
        self.state = ClientState::AwaitCertificateVerify13;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    pub(crate) fn process_certificate_verify13(
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

        // Asynchronous chain validation may suspend here; the transcript
        // has not moved, so re-entry is safe.
        match self.verify_server_cert_async()? {
            Some(()) => {}
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

        // Signed content: transcript through the Certificate message.
        let handshake_hash = self.transcript.get_current_hash();
        let message = construct_tls13_verify_message(&handshake_hash, true);
        verify_signed_struct(&message, &self.server_cert_chain[0], &dss)?;
        trace!("server CertificateVerify OK");

        self.transcript.add(&msg.transcript_bytes);
        self.state = ClientState::AwaitFinished13;
        self.wait = Wait::ReadMessage;
        Ok(())
    }

    pub(crate) fn process_server_finished13(
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
        let expected = ks.sign_verify_data(&self.hs_server_secret, &handshake_hash);
        if !constant_time_eq(&expected, &msg.body) {
            return Err(Error::DecryptError);
        }
        self.transcript.add(&msg.transcript_bytes);

        // Master secret and the application-traffic tree, snapshotted at
        // the server Finished.
        let ks = core.key_schedule.as_mut().unwrap();
        ks.input_empty();
        let fin_hash = self.transcript.get_current_hash();
        self.ap_client_secret = ks.derive(SecretKind::ClientApplicationTrafficSecret, &fin_hash);
        self.ap_server_secret = ks.derive(SecretKind::ServerApplicationTrafficSecret, &fin_hash);
        let exporter = ks.derive(SecretKind::ExporterMasterSecret, &fin_hash);
        ks.remember_exporter_secret(exporter);

        let ap_server = self.ap_server_secret.to_vec();
        core.install_tls13_read_secret_at(&ap_server, self.dtls_epoch(EPOCH_APPLICATION))?;

        self.state = ClientState::EmitClientFlight13;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn emit_client_flight13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        // End of early data, still under the early traffic key.
        if self.early_data_accepted {
            let tx = core.send_hs_message(HandshakeType::EndOfEarlyData, Vec::new());
            self.transcript.add(&tx);
            core.flush_hs_run()?;
            core.early_traffic_ok = false;
            self.early_data_accepted = false;

            let hs_client = self.hs_client_secret.to_vec();
            core.install_tls13_write_secret_at(&hs_client, self.dtls_epoch(EPOCH_HANDSHAKE))?;
        }

        // Client certificate, when requested.
        if let Some((context, _schemes)) = &self.cert_request13 {
            let chain: Vec<Vec<u8>> = self
                .config
                .client_auth_cert
                .as_ref()
                .map(|ck| ck.cert_chain.clone())
                .unwrap_or_default();
            self.sent_client_cert13 = !chain.is_empty();

            let mut payload = CertificatePayloadTLS13::new(&chain);
            payload.context = PayloadU8::new(context.clone());
            let mut body = Vec::new();
            payload.encode(&mut body);
            let tx = core.send_hs_message(HandshakeType::Certificate, body);
            self.transcript.add(&tx);
        }

        self.state = ClientState::EmitCertVerify13;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn emit_cert_verify13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        if self.sent_client_cert13 {
            let certified = self
                .config
                .client_auth_cert
                .clone()
                .ok_or(Error::InternalError("cert sent without key"))?;
            let schemes = self
                .cert_request13
                .as_ref()
                .map(|(_, schemes)| schemes.clone())
                .unwrap_or_default();
            let usable: Vec<SignatureScheme> = SUPPORTED_SIG_SCHEMES
                .iter()
                .copied()
                .filter(|s| schemes.contains(s) && tls13_scheme_acceptable(*s))
                .collect();
            let scheme = certified
                .key
                .choose_scheme(&usable)
                .ok_or(Error::HandshakeFailure("no usable client sig scheme"))?;

            let handshake_hash = self.transcript.get_current_hash();
            let message = construct_tls13_verify_message(&handshake_hash, false);
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
        }

        self.state = ClientState::EmitFinished13;
        self.wait = Wait::Ok;
        Ok(())
    }

    pub(crate) fn emit_finished13(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let ks = core
            .key_schedule
            .as_ref()
            .ok_or(Error::InternalError("no key schedule"))?;
        let handshake_hash = self.transcript.get_current_hash();
        let verify_data = ks.sign_verify_data(&self.hs_client_secret, &handshake_hash);

        let mut body = Vec::new();
        Payload::new(verify_data).encode(&mut body);
        let tx = core.send_hs_message(HandshakeType::Finished, body);
        self.transcript.add(&tx);
        core.flush_hs_run()?;

        let ap_client = self.ap_client_secret.to_vec();
        core.install_tls13_write_secret_at(&ap_client, self.dtls_epoch(EPOCH_APPLICATION))?;

        // Resumption master covers the client Finished too.
        let ks = core.key_schedule.as_ref().unwrap();
        let final_hash = self.transcript.get_current_hash();
        self.resumption_master = ks.derive(SecretKind::ResumptionMasterSecret, &final_hash);
        core.resumption_master = Some(self.resumption_master.clone());
        core.tls13_read_secret = Some(self.ap_server_secret.clone());
        core.tls13_write_secret = Some(self.ap_client_secret.clone());

        debug!("TLS 1.3 client flight complete");
        self.state = ClientState::Complete;
        self.wait = Wait::Ok;
        Ok(())
    }

    // ---- 0-RTT plumbing ----

    pub(crate) fn start_early_data_write(&mut self, core: &mut ConnectionCore) -> Result<(), Error> {
        let psk = self
            .offered_psk
            .as_ref()
            .ok_or(Error::InternalError("early data without PSK"))?;
        let suite = psk.suite;
        core.suite = Some(suite);

        let mut ks = KeySchedule::new(suite.hkdf_algorithm);
        ks.input_secret(&psk.ticket.psk);
        let ch_hash = self.transcript.get_current_hash_with(suite.hash_algorithm);
        let early_secret = ks.derive(SecretKind::ClientEarlyTrafficSecret, &ch_hash);

        let (key, iv) = ks.derive_traffic_keys(&early_secret, suite.enc_key_len, suite.fixed_iv_len);
        core.set_tls13_framing();
        core.start_encryption_write_at(
            suite,
            crate::cipher::CipherForm::XorNonce,
            &key,
            &iv,
            self.dtls_epoch(EPOCH_EARLY),
        )?;
        core.early_traffic_ok = true;
        debug!("0-RTT write key installed");
        Ok(())
    }

    fn note_early_data_rejected(&mut self, core: &mut ConnectionCore) {
        core.early_traffic_ok = false;
        self.early_data_rejected = true;
    }

    pub(crate) fn early_data_rejection_pending(&self) -> bool {
        self.early_data_rejected && !self.early_data_rejection_reported
    }

    fn verify_server_cert_async(&self) -> Result<Option<()>, Error> {
        let (end_entity, intermediates) = match self.server_cert_chain.split_first() {
            Some((ee, rest)) => (ee, rest.to_vec()),
            None => return Err(Error::BadCertificate),
        };
        match self.config.verifier.verify_server_cert(
            end_entity,
            &intermediates,
            &self.server_name,
            std::time::SystemTime::now(),
        )? {
            Some(_) => Ok(Some(())),
            None => Ok(None),
        }
    }

    fn dtls_epoch(&self, epoch: u16) -> Option<u16> {
        if self.dtls {
            Some(epoch)
        } else {
            None
        }
    }
}

/// TLS 1.3 forbids PKCS#1 and bare-hash schemes in CertificateVerify.
pub(crate) fn tls13_scheme_acceptable(scheme: SignatureScheme) -> bool {
    !matches!(
        scheme,
        SignatureScheme::RSA_PKCS1_SHA256
            | SignatureScheme::RSA_PKCS1_SHA384
            | SignatureScheme::RSA_PKCS1_SHA512
    )
}
