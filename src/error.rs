use std::error::Error as StdError;
use std::fmt;

use crate::msgs::enums::{AlertDescription, ContentType, HandshakeType};

/// The reasons a connection operation can fail, as a closed set.
///
/// Fatal variants latch on the connection: once one has been returned,
/// every later operation on the same connection returns the same value.
/// `WantRead`/`WantWrite`/`NeedMore` are suspensions, not failures.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// The connection is closed and the operation cannot proceed.
    Closed,

    /// More input bytes are required before progress can be made.
    WantRead,

    /// Pending output must be drained before progress can be made.
    WantWrite,

    /// A record or message is incomplete; feed more data.
    NeedMore,

    /// A handshake message arrived that the state machine did not expect.
    UnexpectedMessage {
        expect_types: Vec<HandshakeType>,
        got_type: HandshakeType,
    },

    /// A record of an illegal or out-of-place content type arrived.
    UnexpectedRecord(ContentType),

    /// Malformed wire data: bad length fields, trailing bytes, truncation.
    DecodeError,

    /// A record exceeded the permitted length.
    RecordOverflow,

    /// A required extension was absent.
    MissingExtension(&'static str),

    /// A field carried a value that is illegal in context.
    IllegalParameter(&'static str),

    /// No acceptable set of parameters could be negotiated.
    HandshakeFailure(&'static str),

    /// The peer's certificate was malformed or otherwise unusable.
    BadCertificate,

    /// The peer's certificate type is unsupported for the negotiated suite.
    UnsupportedCertificate,

    /// The peer's certificate is outside its validity period.
    CertificateExpired,

    /// The peer's certificate failed validation for an unspecified reason.
    CertificateUnknown,

    /// The peer's certificate has been revoked.
    CertificateRevoked,

    /// The peer is not authorized for the attempted operation.
    AccessDenied,

    /// A cryptographic check over handshake data failed.
    DecryptError,

    /// No mutually acceptable protocol version exists.
    ProtocolVersion,

    /// The peer fell back to an older version despite supporting a newer one.
    InappropriateFallback,

    /// The peer canceled the handshake with a `user_canceled` alert.
    UserCanceled,

    /// ALPN was offered but no protocol overlapped.
    NoApplicationProtocol,

    /// An internal invariant was violated, or a capability misbehaved.
    InternalError(&'static str),

    /// The next record sequence number would exceed the AEAD's limit.
    SeqOverflow,

    /// AEAD authentication failed on an incoming record.
    AeadAuth,

    /// A resumed session did not match the negotiated parameters.
    SessionMismatch,

    /// Plaintext application data appeared where only a TLS 1.3 encrypted
    /// record is acceptable; usually a meddling middlebox.
    MiddleboxInterference,

    /// The first bytes from the peer were an HTTP request, not TLS.
    HttpRequest,

    /// The first bytes from the peer were an HTTPS proxy request, not TLS.
    HttpsProxyRequest,

    /// 0-RTT data was rejected by the server; the caller must re-send.
    EarlyDataRejected,

    /// The peer sent a fatal alert with the contained description.
    AlertReceived(AlertDescription),
}

impl Error {
    /// The alert we send the peer when failing with this error, if any.
    ///
    /// Suspensions and errors caused by non-TLS peers (HTTP requests) or by
    /// alerts we *received* produce no alert of our own.
    pub fn to_alert(&self) -> Option<AlertDescription> {
        match self {
            Error::UnexpectedMessage { .. } => Some(AlertDescription::UnexpectedMessage),
            Error::UnexpectedRecord(_) => Some(AlertDescription::UnexpectedMessage),
            Error::DecodeError => Some(AlertDescription::DecodeError),
            Error::RecordOverflow => Some(AlertDescription::RecordOverflow),
            Error::MissingExtension(_) => Some(AlertDescription::MissingExtension),
            Error::IllegalParameter(_) => Some(AlertDescription::IllegalParameter),
            Error::HandshakeFailure(_) => Some(AlertDescription::HandshakeFailure),
            Error::BadCertificate => Some(AlertDescription::BadCertificate),
            Error::UnsupportedCertificate => Some(AlertDescription::UnsupportedCertificate),
            Error::CertificateExpired => Some(AlertDescription::CertificateExpired),
            Error::CertificateUnknown => Some(AlertDescription::CertificateUnknown),
            Error::CertificateRevoked => Some(AlertDescription::CertificateRevoked),
            Error::AccessDenied => Some(AlertDescription::AccessDenied),
            Error::DecryptError | Error::AeadAuth => Some(AlertDescription::DecryptError),
            Error::ProtocolVersion => Some(AlertDescription::ProtocolVersion),
            Error::InappropriateFallback => Some(AlertDescription::InappropriateFallback),
            Error::NoApplicationProtocol => Some(AlertDescription::NoApplicationProtocol),
            Error::SessionMismatch => Some(AlertDescription::IllegalParameter),
            Error::MiddleboxInterference => Some(AlertDescription::UnexpectedMessage),
            Error::InternalError(_) | Error::SeqOverflow => {
                Some(AlertDescription::InternalError)
            }
            Error::Closed
            | Error::WantRead
            | Error::WantWrite
            | Error::NeedMore
            | Error::UserCanceled
            | Error::HttpRequest
            | Error::HttpsProxyRequest
            | Error::EarlyDataRejected
            | Error::AlertReceived(_) => None,
        }
    }

    /// Whether this value is a suspension rather than a terminal failure.
    pub fn is_suspension(&self) -> bool {
        matches!(self, Error::WantRead | Error::WantWrite | Error::NeedMore)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnexpectedMessage {
                expect_types,
                got_type,
            } => write!(
                f,
                "unexpected handshake message: got {:?}, expected one of {:?}",
                got_type, expect_types
            ),
            Error::UnexpectedRecord(typ) => write!(f, "unexpected record of type {:?}", typ),
            Error::MissingExtension(which) => write!(f, "peer omitted extension: {}", which),
            Error::IllegalParameter(what) => write!(f, "illegal parameter: {}", what),
            Error::HandshakeFailure(why) => write!(f, "handshake failure: {}", why),
            Error::InternalError(what) => write!(f, "internal error: {}", what),
            Error::AlertReceived(alert) => write!(f, "peer sent fatal alert: {:?}", alert),
            other => write!(f, "{:?}", other),
        }
    }
}

impl StdError for Error {}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::msgs::enums::AlertDescription;

    #[test]
    fn aead_failures_map_to_decrypt_error_alert() {
        assert_eq!(
            Error::AeadAuth.to_alert(),
            Some(AlertDescription::DecryptError)
        );
        assert_eq!(
            Error::DecryptError.to_alert(),
            Some(AlertDescription::DecryptError)
        );
    }

    #[test]
    fn http_detection_emits_no_alert() {
        assert_eq!(Error::HttpRequest.to_alert(), None);
        assert_eq!(Error::HttpsProxyRequest.to_alert(), None);
    }

    #[test]
    fn suspensions_are_not_fatal() {
        assert!(Error::WantRead.is_suspension());
        assert!(Error::NeedMore.is_suspension());
        assert!(!Error::DecodeError.is_suspension());
    }
}
