//! Datagram-transport protocol tests: DTLS 1.2 handshakes over lossy
//! in-memory "networks", retransmission, and timer discipline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use petrel::internal::DangerousAcceptAnyServerCert;
use petrel::{
    AlwaysResolvesChain, CertifiedKey, ClientConfig, ClientConnection, EcdsaSigningKey, Error,
    ProtocolVersion, ServerConfig, ServerConnection, SigningKey, TimeoutOutcome,
};

const CERT_DER: &[u8] = include_bytes!("testdata/ecdsa-p256.der");
const KEY_PK8: &[u8] = include_bytes!("testdata/ecdsa-p256.pk8");

const MTU: usize = 1400;

fn server_config() -> ServerConfig {
    let key: Arc<dyn SigningKey> = Arc::new(EcdsaSigningKey::new_p256(KEY_PK8).unwrap());
    let certified = CertifiedKey::new(vec![CERT_DER.to_vec()], key);
    let mut config = ServerConfig::new(Arc::new(AlwaysResolvesChain::new(certified)));
    config.max_version = ProtocolVersion::TLSv1_2;
    config
}

fn client_config() -> ClientConfig {
    let mut config = ClientConfig::new(Arc::new(DangerousAcceptAnyServerCert));
    config.max_version = ProtocolVersion::TLSv1_2;
    config
}

fn dtls_pair() -> (ClientConnection, ServerConnection) {
    let client = ClientConnection::new_dtls(
        Arc::new(client_config()),
        "testserver",
        ProtocolVersion::DTLSv1_2,
        MTU,
    )
    .unwrap();
    let server =
        ServerConnection::new_dtls(Arc::new(server_config()), ProtocolVersion::DTLSv1_2, MTU)
            .unwrap();
    (client, server)
}

/// Deliver every queued datagram in both directions, applying `drop_c2s`
/// to client->server datagrams (true = lose it).
fn exchange(
    client: &mut ClientConnection,
    server: &mut ServerConnection,
    drop_c2s: &mut dyn FnMut(usize) -> bool,
) -> Result<(), Error> {
    let mut idx = 0;
    for datagram in client.take_datagrams() {
        let lose = drop_c2s(idx);
        idx += 1;
        if !lose {
            server.read_datagram(&datagram)?;
        }
    }
    for datagram in server.take_datagrams() {
        client.read_datagram(&datagram)?;
    }
    Ok(())
}

fn run_to_completion(
    client: &mut ClientConnection,
    server: &mut ServerConnection,
) -> Result<(), Error> {
    let mut keep_all = |_| false;
    for _ in 0..30 {
        exchange(client, server, &mut keep_all)?;
        if !client.is_handshaking() && !server.is_handshaking() {
            // drain any trailing flights
            exchange(client, server, &mut keep_all)?;
            return Ok(());
        }
    }
    panic!("DTLS handshake did not converge");
}

#[test_log::test]
fn dtls12_handshake_with_cookie_exchange() {
    let (mut client, mut server) = dtls_pair();
    run_to_completion(&mut client, &mut server).unwrap();

    assert_eq!(client.negotiated_version(), Some(ProtocolVersion::DTLSv1_2));
    assert_eq!(server.negotiated_version(), Some(ProtocolVersion::DTLSv1_2));

    // application data both ways
    client.write_plaintext(b"ping").unwrap();
    for datagram in client.take_datagrams() {
        server.read_datagram(&datagram).unwrap();
    }
    let mut buf = [0u8; 32];
    let n = server.read_plaintext(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    server.write_plaintext(b"pong").unwrap();
    for datagram in server.take_datagrams() {
        client.read_datagram(&datagram).unwrap();
    }
    let n = client.read_plaintext(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[test_log::test]
fn dtls12_timeout_is_idempotent_before_expiry() {
    let (mut client, _server) = dtls_pair();

    // The first flight is queued; the timer is armed only once it has been
    // sent, and polling early does no work.
    let _ = client.take_datagrams();
    assert_eq!(
        client.handle_timeout(Instant::now()).unwrap(),
        TimeoutOutcome::NoWork
    );
    assert_eq!(
        client.handle_timeout(Instant::now()).unwrap(),
        TimeoutOutcome::NoWork
    );
}

#[test_log::test]
fn dtls12_lost_finished_recovers_by_retransmission() {
    let (mut client, mut server) = dtls_pair();

    // Run the handshake, losing the final datagram of the client's second
    // flight (its Finished) on first transmission.
    let mut c2s_flights = 0usize;
    let mut lost_once = false;

    for _round in 0..30 {
        let datagrams = client.take_datagrams();
        let count = datagrams.len();
        for (idx, datagram) in datagrams.into_iter().enumerate() {
            // The client's second flight is the one sent while it is
            // awaiting the server's CCS: it ends with Finished.
            let is_final_flight_end = count >= 3 && idx == count - 1;
            if is_final_flight_end && !lost_once {
                lost_once = true;
                c2s_flights += 1;
                continue; // dropped by the network
            }
            server.read_datagram(&datagram).unwrap();
        }
        for datagram in server.take_datagrams() {
            client.read_datagram(&datagram).unwrap();
        }

        if lost_once && client.is_handshaking() && client.take_datagrams().is_empty() {
            // Nothing in flight: the loss is only recoverable via the
            // retransmission timer.
            let expiry = client.next_timeout().expect("timer armed");
            assert_eq!(
                client.handle_timeout(expiry - Duration::from_millis(10)).unwrap(),
                TimeoutOutcome::NoWork
            );
            assert_eq!(
                client
                    .handle_timeout(expiry + Duration::from_millis(10))
                    .unwrap(),
                TimeoutOutcome::Retransmitted
            );
        }

        if !client.is_handshaking() && !server.is_handshaking() {
            break;
        }
    }

    assert!(lost_once, "test never exercised the loss");
    assert!(!client.is_handshaking());
    assert!(!server.is_handshaking());
    let _ = c2s_flights;

    // Exactly one session cached despite the retransmission.
    client.write_plaintext(b"after loss").unwrap();
    for datagram in client.take_datagrams() {
        server.read_datagram(&datagram).unwrap();
    }
    let mut buf = [0u8; 32];
    let n = server.read_plaintext(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"after loss");
}

#[test_log::test]
fn dtls12_duplicate_datagram_ignored() {
    let (mut client, mut server) = dtls_pair();

    // First client flight, delivered twice: the replay window and the
    // handshake reassembler absorb the duplicates silently.
    let datagrams = client.take_datagrams();
    for datagram in &datagrams {
        server.read_datagram(datagram).unwrap();
    }
    for datagram in &datagrams {
        server.read_datagram(datagram).unwrap();
    }

    run_to_completion(&mut client, &mut server).unwrap();
}
