//! Mid-handshake transfer of a server connection between processes.
//!
//! After the ClientHello has been processed (and before the server flight
//! leaves), a connection configured with `handoff_enabled` pauses; the
//! owner serializes it with [`ServerConnection::handoff`] and a helper
//! process rebuilds it with [`ServerConnection::handback`], which resumes
//! the handshake where it stopped.
//!
//! The format is a fixed prelude followed by length-prefixed tagged
//! records; unknown trailing tags are ignored on import so the format can
//! grow.

use std::sync::Arc;

use log::debug;

use crate::conn::{ConnectionCore, Wait};
use crate::error::Error;
use crate::hash_hs::HandshakeHash;
use crate::msgs::codec::{put_u16, Codec, Reader};
use crate::msgs::enums::{CipherSuite, NamedGroup, ProtocolVersion, SignatureScheme};
use crate::msgs::handshake::SessionID;
use crate::msgs::persist::SessionValue;
use crate::server::{ServerConfig, ServerConnection};
use crate::server_hs::{ServerHandshake, ServerState};
use crate::suites::KeyExchange;

const HANDOFF_FORMAT_VERSION: u16 = 1;

mod tag {
    pub const READ_SEQ: u8 = 1;
    pub const WRITE_SEQ: u8 = 2;
    pub const SERVER_RANDOM: u8 = 3;
    pub const CLIENT_RANDOM: u8 = 4;
    pub const READ_IV: u8 = 5;
    pub const WRITE_IV: u8 = 6;
    pub const FLAGS: u8 = 7;
    pub const SESSION: u8 = 8;
    pub const ALPN: u8 = 9;
    pub const SNI: u8 = 10;
    pub const CHANNEL_ID: u8 = 11;
    pub const TRANSCRIPT: u8 = 12;
    pub const SESSION_ID: u8 = 13;
    pub const SUITE: u8 = 14;
    pub const GROUP: u8 = 15;
    pub const SIGSCHEMES: u8 = 16;
    pub const MAX_FRAGMENT: u8 = 17;
}

const FLAG_SESSION_REUSED: u8 = 1 << 0;
const FLAG_CLIENT_AUTH: u8 = 1 << 1;
const FLAG_SEND_TICKET: u8 = 1 << 2;
const FLAG_USING_EMS: u8 = 1 << 3;
const FLAG_RENEG_INFO: u8 = 1 << 4;

fn put_field(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    put_u16(value.len() as u16, out);
    out.extend_from_slice(value);
}

impl ServerConnection {
    /// Whether the connection is paused at the handoff point.
    pub fn can_handoff(&self) -> bool {
        self.hs
            .as_ref()
            .map(|hs| hs.paused_for_handoff)
            .unwrap_or(false)
    }

    /// Serialize the paused handshake for another process. The connection
    /// is dead afterwards; only the returned bytes carry it forward.
    pub fn handoff(mut self) -> Result<Vec<u8>, Error> {
        let hs = self
            .hs
            .take()
            .ok_or(Error::HandshakeFailure("no handshake in progress"))?;
        if !hs.paused_for_handoff {
            return Err(Error::HandshakeFailure("not at a handoff point"));
        }

        let version = self
            .core
            .negotiated_version
            .ok_or(Error::InternalError("no negotiated version"))?;
        let suite = hs.suite.ok_or(Error::InternalError("no suite"))?;

        let mut out = Vec::new();
        HANDOFF_FORMAT_VERSION.encode(&mut out);
        version.encode(&mut out);

        let (read_seq, write_seq) = self
            .core
            .stream_record_layer_mut()
            .map(|rl| (rl.read_seq(), rl.write_seq()))
            .unwrap_or((0, 0));
        put_field(&mut out, tag::READ_SEQ, &read_seq.to_be_bytes());
        put_field(&mut out, tag::WRITE_SEQ, &write_seq.to_be_bytes());
        put_field(&mut out, tag::SERVER_RANDOM, &hs.server_random);
        put_field(&mut out, tag::CLIENT_RANDOM, &hs.client_random);
        // Record IVs travel for forward compatibility with key-active
        // handoff points; at the ClientHello point both are empty.
        put_field(&mut out, tag::READ_IV, &[]);
        put_field(&mut out, tag::WRITE_IV, &[]);

        let mut flags = 0u8;
        if hs.doing_resume {
            flags |= FLAG_SESSION_REUSED;
        }
        if hs.doing_client_auth {
            flags |= FLAG_CLIENT_AUTH;
        }
        if hs.send_ticket12 {
            flags |= FLAG_SEND_TICKET;
        }
        if hs.using_ems {
            flags |= FLAG_USING_EMS;
        }
        if hs.client_sent_reneg_info {
            flags |= FLAG_RENEG_INFO;
        }
        put_field(&mut out, tag::FLAGS, &[flags]);

        if let Some(session) = &hs.resume_value {
            put_field(&mut out, tag::SESSION, &session.get_encoding());
        }
        if let Some(alpn) = &self.core.alpn_protocol {
            put_field(&mut out, tag::ALPN, alpn);
        }
        if let Some(sni) = &hs.sni {
            put_field(&mut out, tag::SNI, sni.as_bytes());
        }
        // Channel ID is not implemented; the field stays fixed-width for
        // format stability.
        put_field(&mut out, tag::CHANNEL_ID, &[0u8; 64]);
        put_field(&mut out, tag::TRANSCRIPT, &hs.transcript.peek_handshake_buf());
        put_field(&mut out, tag::SESSION_ID, &hs.session_id.get_encoding());
        put_field(&mut out, tag::SUITE, &suite.suite.get_u16().to_be_bytes());
        if let Some(group) = hs.kx_group {
            put_field(&mut out, tag::GROUP, &group.get_u16().to_be_bytes());
        }
        let mut schemes = Vec::new();
        for scheme in &hs.sigschemes_ext {
            scheme.encode(&mut schemes);
        }
        put_field(&mut out, tag::SIGSCHEMES, &schemes);
        put_field(
            &mut out,
            tag::MAX_FRAGMENT,
            &(self.config.max_send_fragment as u16).to_be_bytes(),
        );

        debug!("handoff serialized ({} bytes)", out.len());
        Ok(out)
    }

    /// Rebuild a paused connection in this process and let it resume.
    pub fn handback(config: Arc<ServerConfig>, bytes: &[u8]) -> Result<ServerConnection, Error> {
        let mut r = Reader::init(bytes);
        let format = u16::read(&mut r).ok_or(Error::DecodeError)?;
        if format != HANDOFF_FORMAT_VERSION {
            return Err(Error::DecodeError);
        }
        let version = ProtocolVersion::read(&mut r).ok_or(Error::DecodeError)?;

        let mut read_seq = 0u64;
        let mut write_seq = 0u64;
        let mut server_random = [0u8; 32];
        let mut client_random = [0u8; 32];
        let mut flags = 0u8;
        let mut session: Option<SessionValue> = None;
        let mut alpn: Option<Vec<u8>> = None;
        let mut sni: Option<String> = None;
        let mut transcript_buf: Vec<u8> = Vec::new();
        let mut session_id = SessionID::empty();
        let mut suite_id: Option<CipherSuite> = None;
        let mut group: Option<NamedGroup> = None;
        let mut sigschemes: Vec<SignatureScheme> = Vec::new();

        while r.any_left() {
            let field_tag = u8::read(&mut r).ok_or(Error::DecodeError)?;
            let len = u16::read(&mut r).ok_or(Error::DecodeError)? as usize;
            let value = r.take(len).ok_or(Error::DecodeError)?;

            match field_tag {
                tag::READ_SEQ => {
                    read_seq = u64::from_be_bytes(value.try_into().map_err(|_| Error::DecodeError)?)
                }
                tag::WRITE_SEQ => {
                    write_seq =
                        u64::from_be_bytes(value.try_into().map_err(|_| Error::DecodeError)?)
                }
                tag::SERVER_RANDOM => {
                    server_random
                        .copy_from_slice(value.get(..32).ok_or(Error::DecodeError)?);
                }
                tag::CLIENT_RANDOM => {
                    client_random
                        .copy_from_slice(value.get(..32).ok_or(Error::DecodeError)?);
                }
                tag::READ_IV | tag::WRITE_IV => {} // empty at this point
                tag::FLAGS => flags = *value.first().ok_or(Error::DecodeError)?,
                tag::SESSION => {
                    session = Some(SessionValue::read_bytes(value).ok_or(Error::DecodeError)?)
                }
                tag::ALPN => alpn = Some(value.to_vec()),
                tag::SNI => {
                    sni = Some(
                        String::from_utf8(value.to_vec()).map_err(|_| Error::DecodeError)?,
                    )
                }
                tag::CHANNEL_ID => {} // unused: never valid
                tag::TRANSCRIPT => transcript_buf = value.to_vec(),
                tag::SESSION_ID => {
                    session_id = SessionID::read_bytes(value).ok_or(Error::DecodeError)?
                }
                tag::SUITE => {
                    suite_id = Some(
                        CipherSuite::read_bytes(value).ok_or(Error::DecodeError)?,
                    )
                }
                tag::GROUP => {
                    group = Some(NamedGroup::read_bytes(value).ok_or(Error::DecodeError)?)
                }
                tag::SIGSCHEMES => {
                    let mut sub = Reader::init(value);
                    while sub.any_left() {
                        sigschemes
                            .push(SignatureScheme::read(&mut sub).ok_or(Error::DecodeError)?);
                    }
                }
                tag::MAX_FRAGMENT => {}
                _ => {} // forward compatibility
            }
        }

        let suite = suite_id
            .and_then(crate::suites::lookup_suite)
            .ok_or(Error::DecodeError)?;

        let mut core = ConnectionCore::new_stream(
            false,
            config.max_send_fragment,
            config.quiet_shutdown,
        );
        core.set_max_handshake_message_len(config.max_cert_list);
        core.negotiated_version = Some(version);
        core.suite = Some(suite);
        core.alpn_protocol = alpn;
        if let Some(rl) = core.stream_record_layer_mut() {
            rl.restore_seqs(read_seq, write_seq);
        }

        let mut hs = ServerHandshake::new(Arc::clone(&config), false)?;
        hs.server_random = server_random;
        hs.client_random = client_random;
        hs.session_id = session_id;
        hs.suite = Some(suite);
        hs.sni = sni;
        hs.sigschemes_ext = sigschemes;
        hs.doing_client_auth = flags & FLAG_CLIENT_AUTH != 0;
        hs.send_ticket12 = flags & FLAG_SEND_TICKET != 0;
        hs.using_ems = flags & FLAG_USING_EMS != 0;
        hs.client_sent_reneg_info = flags & FLAG_RENEG_INFO != 0;
        hs.doing_resume = flags & FLAG_SESSION_REUSED != 0;

        // Rebuild the transcript from the serialized message buffer.
        let mut transcript = HandshakeHash::new();
        transcript.request_buffer();
        transcript.add(&transcript_buf);
        transcript.start_hash(suite.hash_algorithm);
        hs.transcript = transcript;

        if hs.doing_resume {
            let value = session.ok_or(Error::DecodeError)?;
            hs.secrets12 = Some(crate::prf::SessionSecrets::new_resume(
                suite.hash_algorithm,
                &value.master_secret,
                client_random,
                server_random,
            ));
            hs.resume_value = Some(Arc::new(value));
            hs.state = ServerState::EmitResume12;
        } else {
            let group = group.ok_or(Error::DecodeError)?;
            hs.kx_group = Some(group);
            hs.kx = Some(KeyExchange::start_ecdhe(group)?);
            hs.state = ServerState::EmitServerFlight12;
        }
        hs.wait = Wait::Ok;
        hs.paused_for_handoff = false;

        debug!("handback complete; resuming handshake");
        let mut conn = ServerConnection {
            core,
            hs: Some(hs),
            config,
        };
        conn.process_new_packets()?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rand::Rng;

    struct NullRng;

    impl Rng for NullRng {
        fn fill(&self, buf: &mut [u8]) -> Result<(), Error> {
            for b in buf.iter_mut() {
                *b = 0x42;
            }
            Ok(())
        }
    }

    #[test]
    fn handoff_refused_when_not_paused() {
        let resolver = Arc::new(crate::sign::FailsToResolve);
        let mut config = ServerConfig::new(resolver);
        config.rng = Arc::new(NullRng);
        let conn = ServerConnection::new(Arc::new(config)).unwrap();
        assert!(!conn.can_handoff());
        assert!(conn.handoff().is_err());
    }

    #[test]
    fn handback_rejects_garbage() {
        let resolver = Arc::new(crate::sign::FailsToResolve);
        let config = Arc::new(ServerConfig::new(resolver));
        assert!(ServerConnection::handback(config.clone(), &[1, 2, 3]).is_err());
        assert!(ServerConnection::handback(config, &[]).is_err());
    }
}
