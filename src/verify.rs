use std::time::SystemTime;

use crate::error::Error;
use crate::msgs::enums::SignatureScheme;
use crate::msgs::handshake::DigitallySignedStruct;

/// Context strings mixed into the TLS 1.3 CertificateVerify content
/// (RFC 8446 §4.4.3).
const TLS13_SERVER_VERIFY_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify\x00";
const TLS13_CLIENT_VERIFY_CONTEXT: &[u8] = b"TLS 1.3, client CertificateVerify\x00";

/// Build the octet string a TLS 1.3 CertificateVerify signs:
/// 64 spaces, the context string, then the transcript hash.
pub fn construct_tls13_verify_message(handshake_hash: &[u8], is_server: bool) -> Vec<u8> {
    let context = if is_server {
        TLS13_SERVER_VERIFY_CONTEXT
    } else {
        TLS13_CLIENT_VERIFY_CONTEXT
    };

    let mut message = Vec::with_capacity(64 + context.len() + handshake_hash.len());
    message.resize(64, 0x20);
    message.extend_from_slice(context);
    message.extend_from_slice(handshake_hash);
    message
}

/// Marker that a chain passed validation.
pub struct ServerCertVerified(());

impl ServerCertVerified {
    pub fn assertion() -> ServerCertVerified {
        ServerCertVerified(())
    }
}

pub struct ClientCertVerified(());

impl ClientCertVerified {
    pub fn assertion() -> ClientCertVerified {
        ClientCertVerified(())
    }
}

/// Chain validation capability for the client side.
///
/// `Ok(None)` means the validation is running elsewhere; the handshake
/// suspends on `certificate_verify` and retries.
pub trait ServerCertVerifier: Send + Sync {
    fn verify_server_cert(
        &self,
        end_entity: &[u8],
        intermediates: &[Vec<u8>],
        server_name: &str,
        now: SystemTime,
    ) -> Result<Option<ServerCertVerified>, Error>;
}

pub trait ClientCertVerifier: Send + Sync {
    fn offer_client_auth(&self) -> bool;

    fn verify_client_cert(
        &self,
        end_entity: &[u8],
        intermediates: &[Vec<u8>],
        now: SystemTime,
    ) -> Result<Option<ClientCertVerified>, Error>;
}

/// An anchor stored by value, convertible to webpki's borrowed form.
#[derive(Clone, Debug)]
pub struct OwnedTrustAnchor {
    subject: Vec<u8>,
    spki: Vec<u8>,
    name_constraints: Option<Vec<u8>>,
}

impl OwnedTrustAnchor {
    fn to_trust_anchor(&self) -> webpki::TrustAnchor {
        webpki::TrustAnchor {
            subject: &self.subject,
            spki: &self.spki,
            name_constraints: self.name_constraints.as_deref(),
        }
    }
}

/// The set of roots a webpki-backed verifier trusts.
#[derive(Clone, Debug, Default)]
pub struct RootCertStore {
    pub roots: Vec<OwnedTrustAnchor>,
}

impl RootCertStore {
    pub fn empty() -> RootCertStore {
        RootCertStore { roots: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn add(&mut self, der: &[u8]) -> Result<(), Error> {
        let anchor =
            webpki::TrustAnchor::try_from_cert_der(der).map_err(|_| Error::BadCertificate)?;
        self.roots.push(OwnedTrustAnchor {
            subject: anchor.subject.to_vec(),
            spki: anchor.spki.to_vec(),
            name_constraints: anchor.name_constraints.map(|nc| nc.to_vec()),
        });
        Ok(())
    }
}

static SUPPORTED_SIG_ALGS: &[&webpki::SignatureAlgorithm] = &[
    &webpki::ECDSA_P256_SHA256,
    &webpki::ECDSA_P256_SHA384,
    &webpki::ECDSA_P384_SHA256,
    &webpki::ECDSA_P384_SHA384,
    &webpki::ED25519,
    &webpki::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
    &webpki::RSA_PSS_2048_8192_SHA384_LEGACY_KEY,
    &webpki::RSA_PKCS1_2048_8192_SHA256,
    &webpki::RSA_PKCS1_2048_8192_SHA384,
];

fn map_webpki_error(err: webpki::Error) -> Error {
    use webpki::Error::*;
    match err {
        CertExpired | CertNotValidYet => Error::CertificateExpired,
        UnknownIssuer | CaUsedAsEndEntity | EndEntityUsedAsCa => Error::CertificateUnknown,
        BadDer | BadDerTime => Error::BadCertificate,
        InvalidCertValidity => Error::BadCertificate,
        UnsupportedSignatureAlgorithm | UnsupportedSignatureAlgorithmForPublicKey => {
            Error::UnsupportedCertificate
        }
        InvalidSignatureForPublicKey => Error::BadCertificate,
        CertNotValidForName => Error::CertificateUnknown,
        _ => Error::CertificateUnknown,
    }
}

fn webpki_time(now: SystemTime) -> Result<webpki::Time, Error> {
    webpki::Time::try_from(now).map_err(|_| Error::InternalError("time conversion"))
}

/// The stock verifier: full chain build plus hostname check via webpki.
pub struct WebPkiServerVerifier {
    roots: RootCertStore,
}

impl WebPkiServerVerifier {
    pub fn new(roots: RootCertStore) -> WebPkiServerVerifier {
        WebPkiServerVerifier { roots }
    }
}

impl ServerCertVerifier for WebPkiServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &[u8],
        intermediates: &[Vec<u8>],
        server_name: &str,
        now: SystemTime,
    ) -> Result<Option<ServerCertVerified>, Error> {
        let cert =
            webpki::EndEntityCert::try_from(end_entity).map_err(|_| Error::BadCertificate)?;

        let anchors: Vec<webpki::TrustAnchor> = self
            .roots
            .roots
            .iter()
            .map(OwnedTrustAnchor::to_trust_anchor)
            .collect();
        let intermediates: Vec<&[u8]> = intermediates.iter().map(|der| der.as_slice()).collect();

        cert.verify_is_valid_tls_server_cert(
            SUPPORTED_SIG_ALGS,
            &webpki::TlsServerTrustAnchors(&anchors),
            &intermediates,
            webpki_time(now)?,
        )
        .map_err(map_webpki_error)?;

        let dns_name = webpki::DnsNameRef::try_from_ascii_str(server_name)
            .map_err(|_| Error::IllegalParameter("bad server name"))?;
        cert.verify_is_valid_for_dns_name(dns_name)
            .map_err(map_webpki_error)?;

        Ok(Some(ServerCertVerified::assertion()))
    }
}

/// Accepts any client certificate chaining to the configured roots.
pub struct AllowAnyAuthenticatedClient {
    roots: RootCertStore,
}

impl AllowAnyAuthenticatedClient {
    pub fn new(roots: RootCertStore) -> AllowAnyAuthenticatedClient {
        AllowAnyAuthenticatedClient { roots }
    }
}

impl ClientCertVerifier for AllowAnyAuthenticatedClient {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        end_entity: &[u8],
        intermediates: &[Vec<u8>],
        now: SystemTime,
    ) -> Result<Option<ClientCertVerified>, Error> {
        let cert =
            webpki::EndEntityCert::try_from(end_entity).map_err(|_| Error::BadCertificate)?;

        let anchors: Vec<webpki::TrustAnchor> = self
            .roots
            .roots
            .iter()
            .map(OwnedTrustAnchor::to_trust_anchor)
            .collect();
        let intermediates: Vec<&[u8]> = intermediates.iter().map(|der| der.as_slice()).collect();

        cert.verify_is_valid_tls_client_cert(
            SUPPORTED_SIG_ALGS,
            &webpki::TlsClientTrustAnchors(&anchors),
            &intermediates,
            webpki_time(now)?,
        )
        .map_err(map_webpki_error)?;

        Ok(Some(ClientCertVerified::assertion()))
    }
}

pub struct NoClientAuth;

impl ClientCertVerifier for NoClientAuth {
    fn offer_client_auth(&self) -> bool {
        false
    }

    fn verify_client_cert(
        &self,
        _end_entity: &[u8],
        _intermediates: &[Vec<u8>],
        _now: SystemTime,
    ) -> Result<Option<ClientCertVerified>, Error> {
        Err(Error::AccessDenied)
    }
}

/// A verifier that skips chain building entirely. Intended for tests and
/// closed deployments that pin certificates at a higher layer.
#[doc(hidden)]
pub struct DangerousAcceptAnyServerCert;

impl ServerCertVerifier for DangerousAcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &[u8],
        _intermediates: &[Vec<u8>],
        _server_name: &str,
        _now: SystemTime,
    ) -> Result<Option<ServerCertVerified>, Error> {
        Ok(Some(ServerCertVerified::assertion()))
    }
}

fn scheme_to_webpki(scheme: SignatureScheme) -> Option<&'static webpki::SignatureAlgorithm> {
    match scheme {
        SignatureScheme::ECDSA_NISTP256_SHA256 => Some(&webpki::ECDSA_P256_SHA256),
        SignatureScheme::ECDSA_NISTP384_SHA384 => Some(&webpki::ECDSA_P384_SHA384),
        SignatureScheme::ED25519 => Some(&webpki::ED25519),
        SignatureScheme::RSA_PSS_SHA256 => Some(&webpki::RSA_PSS_2048_8192_SHA256_LEGACY_KEY),
        SignatureScheme::RSA_PSS_SHA384 => Some(&webpki::RSA_PSS_2048_8192_SHA384_LEGACY_KEY),
        SignatureScheme::RSA_PKCS1_SHA256 => Some(&webpki::RSA_PKCS1_2048_8192_SHA256),
        SignatureScheme::RSA_PKCS1_SHA384 => Some(&webpki::RSA_PKCS1_2048_8192_SHA384),
        _ => None,
    }
}

/// Verify a handshake signature (ServerKeyExchange params or a
/// CertificateVerify body) against the peer's end-entity certificate.
pub fn verify_signed_struct(
    message: &[u8],
    cert_der: &[u8],
    dss: &DigitallySignedStruct,
) -> Result<(), Error> {
    let alg = scheme_to_webpki(dss.scheme)
        .ok_or(Error::HandshakeFailure("peer signed with unsupported scheme"))?;
    let cert = webpki::EndEntityCert::try_from(cert_der).map_err(|_| Error::BadCertificate)?;

    cert.verify_signature(alg, message, &dss.sig.0)
        .map_err(|_| Error::DecryptError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls13_verify_message_layout() {
        let hash = [0xabu8; 32];
        let msg = construct_tls13_verify_message(&hash, true);
        assert_eq!(&msg[..64], &[0x20u8; 64][..]);
        assert_eq!(&msg[64..64 + 34], b"TLS 1.3, server CertificateVerify\x00");
        assert_eq!(&msg[64 + 34..], &hash[..]);

        let client_msg = construct_tls13_verify_message(&hash, false);
        assert_ne!(msg, client_msg);
    }

    #[test]
    fn bogus_anchor_rejected() {
        let mut store = RootCertStore::empty();
        assert_eq!(store.add(&[0x30, 0x03, 0x02, 0x01, 0x00]), Err(Error::BadCertificate));
        assert!(store.is_empty());
    }

    #[test]
    fn unsupported_scheme_fails_signature_check() {
        let dss = DigitallySignedStruct::new(SignatureScheme::Unknown(0x1234), vec![0; 64]);
        assert!(matches!(
            verify_signed_struct(b"msg", b"notacert", &dss),
            Err(Error::HandshakeFailure(_))
        ));
    }
}
