//! Black-box protocol tests: both endpoints are this library, talking
//! through in-memory buffers.

use std::io;
use std::sync::Arc;

use petrel::internal::{DangerousAcceptAnyServerCert, DeferredSigningKey};
use petrel::{
    AeadTicketer, AlwaysResolvesChain, CertifiedKey, ClientConfig, ClientConnection, ContentType,
    EcdsaSigningKey, Error, NamedGroup, ProtocolVersion, ServerConfig, ServerConnection,
    SigningKey, Wait,
};

const CERT_DER: &[u8] = include_bytes!("testdata/ecdsa-p256.der");
const KEY_PK8: &[u8] = include_bytes!("testdata/ecdsa-p256.pk8");

fn server_key() -> Arc<dyn SigningKey> {
    Arc::new(EcdsaSigningKey::new_p256(KEY_PK8).expect("test key parses"))
}

fn server_config() -> ServerConfig {
    let certified = CertifiedKey::new(vec![CERT_DER.to_vec()], server_key());
    ServerConfig::new(Arc::new(AlwaysResolvesChain::new(certified)))
}

fn client_config() -> ClientConfig {
    ClientConfig::new(Arc::new(DangerousAcceptAnyServerCert))
}

/// Move all pending bytes client -> server; returns how many moved.
fn transfer_c2s(client: &mut ClientConnection, server: &mut ServerConnection) -> usize {
    let mut buf = Vec::new();
    while client.wants_write() {
        client.write_tls(&mut buf).unwrap();
    }
    let total = buf.len();
    let mut cursor = io::Cursor::new(buf);
    while (cursor.position() as usize) < total {
        server.read_tls(&mut cursor).unwrap();
    }
    total
}

fn transfer_s2c(server: &mut ServerConnection, client: &mut ClientConnection) -> usize {
    let mut buf = Vec::new();
    while server.wants_write() {
        server.write_tls(&mut buf).unwrap();
    }
    let total = buf.len();
    let mut cursor = io::Cursor::new(buf);
    while (cursor.position() as usize) < total {
        client.read_tls(&mut cursor).unwrap();
    }
    total
}

/// Drive both sides to completion; returns (c2s bytes, s2c bytes).
fn do_handshake(
    client: &mut ClientConnection,
    server: &mut ServerConnection,
) -> Result<(usize, usize), Error> {
    let mut c2s = 0;
    let mut s2c = 0;
    for _ in 0..20 {
        c2s += transfer_c2s(client, server);
        server.process_new_packets()?;
        s2c += transfer_s2c(server, client);
        client.process_new_packets()?;

        if !client.is_handshaking()
            && !server.is_handshaking()
            && !client.wants_write()
            && !server.wants_write()
        {
            return Ok((c2s, s2c));
        }
    }
    panic!("handshake did not converge");
}

fn roundtrip_appdata(client: &mut ClientConnection, server: &mut ServerConnection) {
    client.write_plaintext(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    transfer_c2s(client, server);
    server.process_new_packets().unwrap();
    let mut buf = [0u8; 128];
    let n = server.read_plaintext(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n");

    server.write_plaintext(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
    transfer_s2c(server, client);
    client.process_new_packets().unwrap();
    let n = client.read_plaintext(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"HTTP/1.1 200 OK\r\n\r\n");
}

#[test_log::test]
fn tls13_full_handshake() {
    let mut client = ClientConnection::new(Arc::new(client_config()), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(server_config())).unwrap();

    do_handshake(&mut client, &mut server).unwrap();
    assert_eq!(client.negotiated_version(), Some(ProtocolVersion::TLSv1_3));
    assert_eq!(server.negotiated_version(), Some(ProtocolVersion::TLSv1_3));

    roundtrip_appdata(&mut client, &mut server);
}

#[test_log::test]
fn tls13_alpn_negotiation() {
    let mut cc = client_config();
    cc.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let mut sc = server_config();
    sc.alpn_protocols = vec![b"http/1.1".to_vec()];

    let mut client = ClientConnection::new(Arc::new(cc), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(sc)).unwrap();
    do_handshake(&mut client, &mut server).unwrap();

    assert_eq!(client.alpn_protocol(), Some(&b"http/1.1"[..]));
    assert_eq!(server.alpn_protocol(), Some(&b"http/1.1"[..]));
}

#[test_log::test]
fn tls13_hello_retry_request() {
    // Client leads with a P-256 share; server only does X25519.
    let mut cc = client_config();
    cc.supported_groups = vec![NamedGroup::secp256r1, NamedGroup::X25519];
    let mut sc = server_config();
    sc.supported_groups = vec![NamedGroup::X25519];

    let mut client = ClientConnection::new(Arc::new(cc), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(sc)).unwrap();
    do_handshake(&mut client, &mut server).unwrap();

    assert_eq!(client.negotiated_version(), Some(ProtocolVersion::TLSv1_3));
    roundtrip_appdata(&mut client, &mut server);
}

#[test_log::test]
fn tls13_exporters_agree() {
    let mut client = ClientConnection::new(Arc::new(client_config()), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(server_config())).unwrap();
    do_handshake(&mut client, &mut server).unwrap();

    let c = client
        .export_keying_material(b"EXPORTER-test", b"context", 32)
        .unwrap();
    let s = server
        .export_keying_material(b"EXPORTER-test", b"context", 32)
        .unwrap();
    assert_eq!(c, s);

    let other = client
        .export_keying_material(b"EXPORTER-test", b"other", 32)
        .unwrap();
    assert_ne!(c, other);
}

#[test_log::test]
fn tls13_key_update() {
    let mut client = ClientConnection::new(Arc::new(client_config()), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(server_config())).unwrap();
    do_handshake(&mut client, &mut server).unwrap();

    client.refresh_traffic_keys().unwrap();
    transfer_c2s(&mut client, &mut server);
    server.process_new_packets().unwrap();
    // server answered the update_requested with its own KeyUpdate
    transfer_s2c(&mut server, &mut client);
    client.process_new_packets().unwrap();

    roundtrip_appdata(&mut client, &mut server);
}

#[test_log::test]
fn tls13_resumption_via_ticket() {
    let mut sc = server_config();
    sc.ticketer = Arc::new(AeadTicketer::new(7200).unwrap());
    let sc = Arc::new(sc);
    let cc = Arc::new(client_config());

    let mut client = ClientConnection::new(Arc::clone(&cc), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::clone(&sc)).unwrap();
    let (_, s2c_full) = do_handshake(&mut client, &mut server).unwrap();
    roundtrip_appdata(&mut client, &mut server);

    // Second connection offers the stored ticket as a PSK; the server skips
    // its certificate, which shows up as a much smaller flight.
    let mut client2 = ClientConnection::new(Arc::clone(&cc), "testserver").unwrap();
    let mut server2 = ServerConnection::new(sc).unwrap();
    let (_, s2c_resumed) = do_handshake(&mut client2, &mut server2).unwrap();

    assert!(
        s2c_resumed < s2c_full - CERT_DER.len() / 2,
        "resumed flight ({}) not smaller than full ({})",
        s2c_resumed,
        s2c_full
    );
    roundtrip_appdata(&mut client2, &mut server2);
}

#[test_log::test]
fn tls12_handshake_and_session_id_resumption() {
    let mut sc = server_config();
    sc.max_version = ProtocolVersion::TLSv1_2;
    let sc = Arc::new(sc);
    let mut cc = client_config();
    cc.max_version = ProtocolVersion::TLSv1_2;
    let cc = Arc::new(cc);

    let mut client = ClientConnection::new(Arc::clone(&cc), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::clone(&sc)).unwrap();
    let (_, s2c_full) = do_handshake(&mut client, &mut server).unwrap();
    assert_eq!(client.negotiated_version(), Some(ProtocolVersion::TLSv1_2));
    roundtrip_appdata(&mut client, &mut server);
    assert_eq!(sc.session_cache.len(), 1);

    // Resumption by session id: the certificate flight disappears.
    let mut client2 = ClientConnection::new(Arc::clone(&cc), "testserver").unwrap();
    let mut server2 = ServerConnection::new(Arc::clone(&sc)).unwrap();
    let (_, s2c_resumed) = do_handshake(&mut client2, &mut server2).unwrap();

    assert!(
        s2c_resumed < s2c_full - CERT_DER.len() / 2,
        "resumed flight ({}) not smaller than full ({})",
        s2c_resumed,
        s2c_full
    );
    roundtrip_appdata(&mut client2, &mut server2);
    // no duplicate cache entry
    assert_eq!(sc.session_cache.len(), 1);
}

#[test_log::test]
fn tls12_false_start() {
    let mut sc = server_config();
    sc.max_version = ProtocolVersion::TLSv1_2;
    sc.alpn_protocols = vec![b"h2".to_vec()];
    let mut cc = client_config();
    cc.max_version = ProtocolVersion::TLSv1_2;
    cc.alpn_protocols = vec![b"h2".to_vec()];
    cc.enable_false_start = true;

    let mut client = ClientConnection::new(Arc::new(cc), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(sc)).unwrap();

    // Run until the client has sent its Finished but not yet seen the
    // server's.
    transfer_c2s(&mut client, &mut server);
    server.process_new_packets().unwrap();
    transfer_s2c(&mut server, &mut client);
    client.process_new_packets().unwrap();

    assert!(client.is_handshaking());
    assert_eq!(client.handshake_wait(), Wait::EarlyReturn);

    // False Start: write before the handshake completes.
    client.write_plaintext(b"early request").unwrap();
    transfer_c2s(&mut client, &mut server);
    server.process_new_packets().unwrap();

    let mut buf = [0u8; 64];
    let n = server.read_plaintext(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"early request");

    // Finish the handshake.
    do_handshake(&mut client, &mut server).unwrap();
    roundtrip_appdata(&mut client, &mut server);
}

#[test_log::test]
fn deferred_server_signature_suspends_and_recovers() {
    let deferred: Arc<dyn SigningKey> = Arc::new(DeferredSigningKey::new(server_key(), 2));
    let certified = CertifiedKey::new(vec![CERT_DER.to_vec()], deferred);
    let sc = ServerConfig::new(Arc::new(AlwaysResolvesChain::new(certified)));

    let mut client = ClientConnection::new(Arc::new(client_config()), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(sc)).unwrap();

    transfer_c2s(&mut client, &mut server);
    server.process_new_packets().unwrap();
    // The signing capability deferred; the server is suspended on it.
    assert_eq!(server.handshake_wait(), Wait::PrivateKeyOperation);

    do_handshake(&mut client, &mut server).unwrap();
    roundtrip_appdata(&mut client, &mut server);
}

#[test_log::test]
fn close_notify_discipline() {
    let mut client = ClientConnection::new(Arc::new(client_config()), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(server_config())).unwrap();
    do_handshake(&mut client, &mut server).unwrap();

    server.send_close_notify();
    transfer_s2c(&mut server, &mut client);
    client.process_new_packets().unwrap();

    let mut buf = [0u8; 16];
    // clean EOF
    assert_eq!(client.read_plaintext(&mut buf).unwrap(), 0);
    // writing after we send our own close fails
    client.send_close_notify();
    assert!(client.write_plaintext(b"x").is_err());
}

#[test_log::test]
fn low_version_client_hello_rejected() {
    use petrel::msgs::enums::{Compression, HandshakeType};
    use petrel::msgs::handshake::{
        ClientHelloPayload, HandshakeMessagePayload, HandshakePayload, Random, SessionID,
    };

    let hello = ClientHelloPayload {
        client_version: ProtocolVersion::TLSv1_0,
        random: Random([0x11; 32]),
        session_id: SessionID::empty(),
        cookie: None,
        cipher_suites: vec![petrel::CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256],
        compression_methods: vec![Compression::Null],
        extensions: Vec::new(),
    };
    let msg = HandshakeMessagePayload {
        typ: HandshakeType::ClientHello,
        payload: HandshakePayload::ClientHello(hello),
    };
    let mut record = vec![22, 3, 1];
    let body = msg.get_tls_encoding();
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(&body);

    let sc = Arc::new(server_config());
    let mut server = ServerConnection::new(Arc::clone(&sc)).unwrap();
    let mut cursor = io::Cursor::new(record);
    server.read_tls(&mut cursor).unwrap();

    assert_eq!(server.process_new_packets(), Err(Error::ProtocolVersion));
    // a protocol_version alert went out, and nothing was cached
    assert!(server.wants_write());
    assert!(sc.session_cache.is_empty());
}

#[test_log::test]
fn http_request_to_tls_server() {
    let mut server = ServerConnection::new(Arc::new(server_config())).unwrap();
    let mut cursor = io::Cursor::new(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
    server.read_tls(&mut cursor).unwrap();

    assert_eq!(server.process_new_packets(), Err(Error::HttpRequest));
    // no alert is sent to a peer that isn't speaking TLS
    assert!(!server.wants_write());
}

#[test_log::test]
fn second_ccs_mid_flight_rejected() {
    let mut client = ClientConnection::new(Arc::new(client_config()), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::new(server_config())).unwrap();

    transfer_c2s(&mut client, &mut server);
    server.process_new_packets().unwrap();

    // Capture the server flight and inject one extra CCS after it; the
    // server's own compatibility CCS is the one legal occurrence.
    let mut flight = Vec::new();
    while server.wants_write() {
        server.write_tls(&mut flight).unwrap();
    }
    flight.extend_from_slice(&[20, 3, 3, 0, 1, 1]);

    let total = flight.len();
    let mut cursor = io::Cursor::new(flight);
    while (cursor.position() as usize) < total {
        client.read_tls(&mut cursor).unwrap();
    }

    assert_eq!(
        client.process_new_packets(),
        Err(Error::UnexpectedRecord(ContentType::ChangeCipherSpec))
    );
}

#[test_log::test]
fn middlebox_plaintext_appdata_detected() {
    let mut client = ClientConnection::new(Arc::new(client_config()), "testserver").unwrap();

    // Plaintext application data while the client still runs the null
    // cipher: the classic middlebox signature.
    let mut cursor = io::Cursor::new(vec![23, 3, 3, 0, 3, 1, 2, 3]);
    client.read_tls(&mut cursor).unwrap();
    assert_eq!(
        client.process_new_packets(),
        Err(Error::MiddleboxInterference)
    );
}

#[test_log::test]
fn handoff_and_handback() {
    let mut sc = server_config();
    sc.max_version = ProtocolVersion::TLSv1_2;
    sc.handoff_enabled = true;
    let sc = Arc::new(sc);
    let mut cc = client_config();
    cc.max_version = ProtocolVersion::TLSv1_2;

    let mut client = ClientConnection::new(Arc::new(cc), "testserver").unwrap();
    let mut server = ServerConnection::new(Arc::clone(&sc)).unwrap();

    transfer_c2s(&mut client, &mut server);
    server.process_new_packets().unwrap();
    assert!(server.can_handoff());

    let blob = server.handoff().unwrap();

    // The "helper process": same config, rebuilt connection.
    let mut helper = ServerConnection::handback(Arc::clone(&sc), &blob).unwrap();
    assert!(helper.is_handshaking());

    do_handshake(&mut client, &mut helper).unwrap();
    assert_eq!(client.negotiated_version(), Some(ProtocolVersion::TLSv1_2));
    roundtrip_appdata(&mut client, &mut helper);
}
