use std::io;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::conn::{ConnectionCore, RecordRouting, Wait};
use crate::dtls::TimeoutOutcome;
use crate::error::Error;
use crate::msgs::codec::Codec;
use crate::msgs::enums::{
    CipherSuite, Compression, ContentType, HandshakeType, KeyUpdateRequest, NamedGroup,
    ProtocolVersion,
};
use crate::msgs::handshake::{ClientHelloPayload, Random, SessionID};
use crate::msgs::hsjoiner::JoinedMessage;
use crate::msgs::message::MAX_PLAINTEXT;
use crate::rand::{Rng, SystemRng};
use crate::server_hs::ServerHandshake;
use crate::session::{ServerSessionCache, SessionCacheMode};
use crate::sign::ResolvesServerCert;
use crate::suites::{SupportedCipherSuite, ALL_CIPHERSUITES, SUPPORTED_GROUPS};
use crate::ticketer::{NoTickets, ProducesTickets};
use crate::verify::{ClientCertVerifier, NoClientAuth};

/// How hard the server insists on a client certificate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerifyMode {
    None,
    Peer,
    FailIfNoPeerCert,
    Once,
}

pub struct ServerConfig {
    pub cipher_suites: Vec<&'static SupportedCipherSuite>,
    pub supported_groups: Vec<NamedGroup>,
    pub min_version: ProtocolVersion,
    pub max_version: ProtocolVersion,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub prefer_server_cipher_order: bool,
    pub cert_resolver: Arc<dyn ResolvesServerCert>,
    pub client_cert_verifier: Arc<dyn ClientCertVerifier>,
    pub verify_mode: VerifyMode,
    pub session_cache: Arc<ServerSessionCache>,
    pub session_cache_mode: SessionCacheMode,
    /// Lifetime in seconds for cached sessions and issued tickets.
    pub session_timeout: u32,
    pub ticketer: Arc<dyn ProducesTickets>,
    /// Accept 0-RTT on resumption, up to this many bytes (0 disables).
    pub early_data_enabled: bool,
    pub max_early_data: u32,
    pub max_send_fragment: usize,
    pub max_cert_list: usize,
    pub quiet_shutdown: bool,
    /// Pause TLS ≤1.2 handshakes after the ClientHello so the connection
    /// can be serialized to another process (`handoff`).
    pub handoff_enabled: bool,
    pub rng: Arc<dyn Rng>,
}

impl ServerConfig {
    pub fn new(cert_resolver: Arc<dyn ResolvesServerCert>) -> ServerConfig {
        ServerConfig {
            cipher_suites: ALL_CIPHERSUITES.to_vec(),
            supported_groups: SUPPORTED_GROUPS.to_vec(),
            min_version: ProtocolVersion::TLSv1_2,
            max_version: ProtocolVersion::TLSv1_3,
            alpn_protocols: Vec::new(),
            prefer_server_cipher_order: false,
            cert_resolver,
            client_cert_verifier: Arc::new(NoClientAuth),
            verify_mode: VerifyMode::None,
            session_cache: Arc::new(ServerSessionCache::new(256)),
            session_cache_mode: SessionCacheMode::Both,
            session_timeout: 7200,
            ticketer: Arc::new(NoTickets),
            early_data_enabled: false,
            max_early_data: 16384,
            max_send_fragment: MAX_PLAINTEXT,
            max_cert_list: 64 * 1024,
            quiet_shutdown: false,
            handoff_enabled: false,
            rng: Arc::new(SystemRng::new()),
        }
    }
}

/// One endpoint of a server-side TLS or DTLS association.
pub struct ServerConnection {
    pub(crate) core: ConnectionCore,
    pub(crate) hs: Option<ServerHandshake>,
    pub(crate) config: Arc<ServerConfig>,
}

impl ServerConnection {
    pub fn new(config: Arc<ServerConfig>) -> Result<ServerConnection, Error> {
        let mut core = ConnectionCore::new_stream(
            false,
            config.max_send_fragment,
            config.quiet_shutdown,
        );
        core.set_max_handshake_message_len(config.max_cert_list);

        let hs = ServerHandshake::new(Arc::clone(&config), false)?;
        Ok(ServerConnection {
            core,
            hs: Some(hs),
            config,
        })
    }

    pub fn new_dtls(
        config: Arc<ServerConfig>,
        version: ProtocolVersion,
        mtu: usize,
    ) -> Result<ServerConnection, Error> {
        debug_assert!(version.is_dtls());
        let core = ConnectionCore::new_datagram(
            false,
            version,
            mtu,
            config.quiet_shutdown,
            config.max_cert_list,
        );

        let hs = ServerHandshake::new(Arc::clone(&config), true)?;
        Ok(ServerConnection {
            core,
            hs: Some(hs),
            config,
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.hs.is_some()
    }

    pub fn handshake_wait(&self) -> Wait {
        self.hs.as_ref().map(|hs| hs.wait).unwrap_or(Wait::Ok)
    }

    pub fn wants_read(&self) -> bool {
        !self.core.read_closed()
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

    pub fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        self.core.take_datagrams()
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<TimeoutOutcome, Error> {
        self.core.handle_timeout(now)
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.core.next_timeout()
    }

    pub fn process_new_packets(&mut self) -> Result<(), Error> {
        if let Some(err) = self.core.latched_error() {
            return Err(err);
        }

        // The very first bytes may be an SSLv2-format hello, which the
        // deframer cannot cut into records.
        self.maybe_take_v2_client_hello()?;

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

    fn maybe_take_v2_client_hello(&mut self) -> Result<(), Error> {
        if self.hs.is_none() {
            return Ok(());
        }
        let v2_body = match self.core.stream_deframer_mut() {
            Some(deframer) => deframer.take_v2_client_hello(),
            None => None,
        };
        let v2_body = match v2_body {
            Some(body) => body,
            None => return Ok(()),
        };

        debug!("synthesizing ClientHello from V2ClientHello");
        let synthesized = match synthesize_v2_client_hello(&v2_body) {
            Some(hello) => hello,
            None => return Err(self.fail(Error::DecodeError)),
        };

        let hs = self.hs.as_mut().unwrap();
        if let Err(err) = hs.step(&mut self.core, Some(synthesized)) {
            return Err(self.fail(err));
        }
        Ok(())
    }

    fn dispatch_record(&mut self, record: crate::msgs::message::PlainMessage) -> Result<(), Error> {
        let routing = match self.core.route_plaintext(record) {
            Ok(routing) => routing,
            Err(err) => return Err(self.fail(err)),
        };

        match routing {
            RecordRouting::ChangeCipherSpec => {
                // Consume any handshake messages buffered ahead of the CCS
                // before judging it.
                self.advance()?;
                if let Err(err) = self.core.note_ccs_received() {
                    return Err(self.fail(err));
                }
                if let Some(hs) = &mut self.hs {
                    if let Err(err) = hs.on_ccs(&mut self.core) {
                        return Err(self.fail(err));
                    }
                } else {
                    return Err(
                        self.fail(Error::UnexpectedRecord(ContentType::ChangeCipherSpec))
                    );
                }
            }
            RecordRouting::ApplicationData => {
                // The peer may legally append data right behind its final
                // flight (False Start, post-Finished traffic); consume the
                // buffered handshake first, then judge.
                self.advance()?;
                let early_ok = self
                    .hs
                    .as_ref()
                    .map(|hs| hs.reading_early_data())
                    .unwrap_or(true);
                if !early_ok {
                    return Err(
                        self.fail(Error::UnexpectedRecord(ContentType::ApplicationData))
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<(), Error> {
        loop {
            let hs = match &mut self.hs {
                None => return self.process_post_handshake(),
                Some(hs) => hs,
            };

            if hs.paused_for_handoff {
                return Ok(());
            }

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
                Wait::ReadMessage | Wait::EarlyReturn | Wait::EarlyDataRejected => {
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
                Wait::ReadChangeCipherSpec => return Ok(()),
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

    fn finish_handshake(&mut self) -> Result<(), Error> {
        let hs = self.hs.take().expect("finish without handshake");
        debug!("server handshake complete: {:?}", self.core.negotiated_version);
        self.core.handshake_done = true;
        self.core.early_traffic_ok = false;
        hs.store_session(&self.config, &mut self.core);
        drop(hs);
        self.core.flush_buffered_plaintext()
    }

    fn process_post_handshake(&mut self) -> Result<(), Error> {
        loop {
            let msg = match self.core.next_hs_message() {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(err) => return Err(self.fail(err)),
            };

            match msg.typ {
                HandshakeType::KeyUpdate => {
                    let request = match KeyUpdateRequest::read_bytes(&msg.body) {
                        Some(req) if !matches!(req, KeyUpdateRequest::Unknown(_)) => req,
                        _ => return Err(self.fail(Error::DecodeError)),
                    };
                    if let Err(err) = self.core.handle_key_update(request) {
                        return Err(self.fail(err));
                    }
                }
                // A second ClientHello is renegotiation, which we refuse.
                HandshakeType::ClientHello => {
                    warn!("client attempted renegotiation");
                    return Err(self.fail(Error::UnexpectedMessage {
                        expect_types: vec![HandshakeType::KeyUpdate],
                        got_type: HandshakeType::ClientHello,
                    }));
                }
                other => {
                    return Err(self.fail(Error::UnexpectedMessage {
                        expect_types: vec![HandshakeType::KeyUpdate],
                        got_type: other,
                    }))
                }
            }
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        let latched = self.core.fatal(err);
        self.hs = None;
        self.core.discard_partial_handshake();
        latched
    }

    // ---- application surface ----

    pub fn write_plaintext(&mut self, data: &[u8]) -> Result<usize, Error> {
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

    /// The SNI the client sent, once the ClientHello has been read.
    pub fn sni_hostname(&self) -> Option<&str> {
        self.hs.as_ref().and_then(|hs| hs.sni.as_deref())
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

    pub fn refresh_traffic_keys(&mut self) -> Result<(), Error> {
        if self.is_handshaking() {
            return Err(Error::HandshakeFailure("key update during handshake"));
        }
        self.core
            .send_key_update(KeyUpdateRequest::UpdateRequested)
    }
}

/// Rebuild an equivalent TLS ClientHello from an SSLv2-format hello body
/// (everything after the 2-byte V2 length header).
fn synthesize_v2_client_hello(body: &[u8]) -> Option<JoinedMessage> {
    use crate::msgs::codec::Reader;

    let mut r = Reader::init(body);
    let msg_type = u8::read(&mut r)?;
    if msg_type != 1 {
        return None;
    }
    let version = ProtocolVersion::read(&mut r)?;
    let cipher_spec_len = u16::read(&mut r)? as usize;
    let session_id_len = u16::read(&mut r)? as usize;
    let challenge_len = u16::read(&mut r)? as usize;

    if cipher_spec_len % 3 != 0 || session_id_len > 32 || challenge_len > 32 {
        return None;
    }

    let cipher_specs = r.take(cipher_spec_len)?;
    let session_id = r.take(session_id_len)?;
    let challenge = r.take(challenge_len)?;
    if r.any_left() {
        return None;
    }

    // V2 cipher specs are three bytes; only specs with a zero top byte
    // correspond to TLS suites.
    let cipher_suites: Vec<CipherSuite> = cipher_specs
        .chunks(3)
        .filter(|spec| spec[0] == 0)
        .map(|spec| {
            CipherSuite::read_bytes(&[spec[1], spec[2]]).unwrap_or(CipherSuite::Unknown(0))
        })
        .collect();

    // Challenge becomes the right-aligned tail of the 32-byte random.
    let mut random = [0u8; 32];
    random[32 - challenge.len()..].copy_from_slice(challenge);

    let hello = ClientHelloPayload {
        client_version: version,
        random: Random(random),
        session_id: SessionID::new(session_id),
        cookie: None,
        cipher_suites,
        compression_methods: vec![Compression::Null],
        extensions: Vec::new(),
    };

    let mut hello_body = Vec::new();
    hello.encode_body(&mut hello_body, false);

    let mut transcript_bytes = Vec::with_capacity(4 + hello_body.len());
    HandshakeType::ClientHello.encode(&mut transcript_bytes);
    crate::msgs::codec::u24(hello_body.len() as u32).encode(&mut transcript_bytes);
    transcript_bytes.extend_from_slice(&hello_body);

    Some(JoinedMessage {
        typ: HandshakeType::ClientHello,
        body: hello_body,
        transcript_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_hello_synthesis() {
        // msg_type 1, version 3.1, 6 bytes of specs, no session id,
        // 16-byte challenge
        let mut body = vec![1u8, 3, 1];
        body.extend_from_slice(&6u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&16u16.to_be_bytes());
        body.extend_from_slice(&[0x00, 0x00, 0x9c]); // TLS_RSA_WITH_AES_128_GCM_SHA256
        body.extend_from_slice(&[0x07, 0x00, 0xc0]); // SSLv2-only spec, dropped
        body.extend_from_slice(&[0xabu8; 16]);

        let msg = synthesize_v2_client_hello(&body).expect("synthesize");
        assert_eq!(msg.typ, HandshakeType::ClientHello);

        let parsed = crate::msgs::handshake::HandshakeMessagePayload::read_body(
            HandshakeType::ClientHello,
            &msg.body,
            false,
        )
        .expect("parse");
        match parsed.payload {
            crate::msgs::handshake::HandshakePayload::ClientHello(ch) => {
                assert_eq!(
                    ch.cipher_suites,
                    vec![CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256]
                );
                assert_eq!(&ch.random.0[..16], &[0u8; 16]);
                assert_eq!(&ch.random.0[16..], &[0xabu8; 16]);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn v2_hello_with_trailing_bytes_rejected() {
        let mut body = vec![1u8, 3, 1];
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.push(0xff);
        assert!(synthesize_v2_client_hello(&body).is_none());
    }
}
