use std::sync::Arc;

use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, RsaKeyPair};

use crate::error::Error;
use crate::msgs::enums::SignatureScheme;
use crate::suites::SignatureAlgorithm;
use crate::util::first_in_both;

/// A private key that can produce handshake signatures.
///
/// `sign` may return `Ok(None)` to indicate the operation is running
/// elsewhere; the state machine suspends on `private_key_operation` and
/// retries the same step later.
pub trait SigningKey: Send + Sync {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme>;
    fn algorithm(&self) -> SignatureAlgorithm;
    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Option<Vec<u8>>, Error>;
}

/// A certificate chain plus the key that proves it.
pub struct CertifiedKey {
    pub cert_chain: Vec<Vec<u8>>,
    pub key: Arc<dyn SigningKey>,
}

impl CertifiedKey {
    pub fn new(cert_chain: Vec<Vec<u8>>, key: Arc<dyn SigningKey>) -> CertifiedKey {
        CertifiedKey { cert_chain, key }
    }

    pub fn end_entity_cert(&self) -> Result<&[u8], Error> {
        self.cert_chain
            .first()
            .map(|c| c.as_slice())
            .ok_or(Error::InternalError("empty certificate chain"))
    }
}

/// How the server finds a certificate for a ClientHello.
pub enum CertResolution {
    Found(Arc<CertifiedKey>),
    /// Lookup running elsewhere; suspend on `x509_lookup`.
    Pending,
    NotFound,
}

pub trait ResolvesServerCert: Send + Sync {
    fn resolve(&self, sni: Option<&str>, sigschemes: &[SignatureScheme]) -> CertResolution;
}

/// Serves one chain for every query.
pub struct AlwaysResolvesChain(Arc<CertifiedKey>);

impl AlwaysResolvesChain {
    pub fn new(certified_key: CertifiedKey) -> AlwaysResolvesChain {
        AlwaysResolvesChain(Arc::new(certified_key))
    }
}

impl ResolvesServerCert for AlwaysResolvesChain {
    fn resolve(&self, _sni: Option<&str>, _sigschemes: &[SignatureScheme]) -> CertResolution {
        CertResolution::Found(Arc::clone(&self.0))
    }
}

pub struct FailsToResolve;

impl ResolvesServerCert for FailsToResolve {
    fn resolve(&self, _sni: Option<&str>, _sigschemes: &[SignatureScheme]) -> CertResolution {
        CertResolution::NotFound
    }
}

/// ECDSA P-256/P-384 keys from PKCS#8.
pub struct EcdsaSigningKey {
    key: EcdsaKeyPair,
    scheme: SignatureScheme,
    rng: SystemRandom,
}

impl EcdsaSigningKey {
    pub fn new_p256(pkcs8: &[u8]) -> Result<EcdsaSigningKey, Error> {
        EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8)
            .map(|key| EcdsaSigningKey {
                key,
                scheme: SignatureScheme::ECDSA_NISTP256_SHA256,
                rng: SystemRandom::new(),
            })
            .map_err(|_| Error::BadCertificate)
    }

    pub fn new_p384(pkcs8: &[u8]) -> Result<EcdsaSigningKey, Error> {
        EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P384_SHA384_ASN1_SIGNING, pkcs8)
            .map(|key| EcdsaSigningKey {
                key,
                scheme: SignatureScheme::ECDSA_NISTP384_SHA384,
                rng: SystemRandom::new(),
            })
            .map_err(|_| Error::BadCertificate)
    }
}

impl SigningKey for EcdsaSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        offered.contains(&self.scheme).then(|| self.scheme)
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::ECDSA
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if scheme != self.scheme {
            return Err(Error::InternalError("scheme mismatch with key"));
        }
        self.key
            .sign(&self.rng, message)
            .map(|sig| Some(sig.as_ref().to_vec()))
            .map_err(|_| Error::InternalError("signing failure"))
    }
}

/// RSA keys from DER or PKCS#8, usable for PSS and PKCS#1 schemes.
pub struct RsaSigningKey {
    key: RsaKeyPair,
    rng: SystemRandom,
}

static RSA_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
];

impl RsaSigningKey {
    pub fn new(der: &[u8]) -> Result<RsaSigningKey, Error> {
        RsaKeyPair::from_der(der)
            .or_else(|_| RsaKeyPair::from_pkcs8(der))
            .map(|key| RsaSigningKey {
                key,
                rng: SystemRandom::new(),
            })
            .map_err(|_| Error::BadCertificate)
    }
}

impl SigningKey for RsaSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        first_in_both(RSA_SCHEMES, offered)
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::RSA
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let padding: &'static dyn signature::RsaEncoding = match scheme {
            SignatureScheme::RSA_PSS_SHA256 => &signature::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384 => &signature::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256 => &signature::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384 => &signature::RSA_PKCS1_SHA384,
            _ => return Err(Error::InternalError("scheme mismatch with key")),
        };

        let mut sig = vec![0u8; self.key.public_modulus_len()];
        self.key
            .sign(padding, &self.rng, message, &mut sig)
            .map_err(|_| Error::InternalError("signing failure"))?;
        Ok(Some(sig))
    }
}

/// Ed25519 keys from PKCS#8.
pub struct Ed25519SigningKey {
    key: Ed25519KeyPair,
}

impl Ed25519SigningKey {
    pub fn new(pkcs8: &[u8]) -> Result<Ed25519SigningKey, Error> {
        Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8)
            .map(|key| Ed25519SigningKey { key })
            .map_err(|_| Error::BadCertificate)
    }
}

impl SigningKey for Ed25519SigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        offered
            .contains(&SignatureScheme::ED25519)
            .then(|| SignatureScheme::ED25519)
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::ECDSA
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if scheme != SignatureScheme::ED25519 {
            return Err(Error::InternalError("scheme mismatch with key"));
        }
        Ok(Some(self.key.sign(message).as_ref().to_vec()))
    }
}

/// A wrapper that reports pending once before delegating, for exercising
/// the `private_key_operation` suspension in tests.
#[doc(hidden)]
pub struct DeferredSigningKey {
    inner: Arc<dyn SigningKey>,
    remaining_deferrals: std::sync::Mutex<u32>,
}

impl DeferredSigningKey {
    pub fn new(inner: Arc<dyn SigningKey>, deferrals: u32) -> DeferredSigningKey {
        DeferredSigningKey {
            inner,
            remaining_deferrals: std::sync::Mutex::new(deferrals),
        }
    }
}

impl SigningKey for DeferredSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        self.inner.choose_scheme(offered)
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.inner.algorithm()
    }

    fn sign(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let mut remaining = self.remaining_deferrals.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(None);
        }
        drop(remaining);
        self.inner.sign(scheme, message)
    }
}
