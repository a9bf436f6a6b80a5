use ring::{agreement, digest, hkdf};

use crate::error::Error;
use crate::msgs::enums::{CipherSuite, NamedGroup, ProtocolVersion, SignatureScheme};
use crate::util::{first_in_both, Zeroized};

/// How a TLS 1.2 suite authenticates its key exchange.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SignatureAlgorithm {
    RSA,
    ECDSA,
    /// TLS 1.3 suites are signature-agnostic.
    Anonymous,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum BulkAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

/// A cipher suite we implement, with the parameters the record layer and
/// key schedule need.
pub struct SupportedCipherSuite {
    pub suite: CipherSuite,
    /// TLSv1_2 or TLSv1_3; DTLS variants share these.
    pub version: ProtocolVersion,
    pub sign: SignatureAlgorithm,
    pub bulk: BulkAlgorithm,
    pub hash_algorithm: &'static digest::Algorithm,
    pub hkdf_algorithm: hkdf::Algorithm,
    pub enc_key_len: usize,
    pub fixed_iv_len: usize,
    /// TLS 1.2 GCM carries an 8-byte explicit nonce per record.
    pub explicit_nonce_len: usize,
}

impl PartialEq for SupportedCipherSuite {
    fn eq(&self, other: &SupportedCipherSuite) -> bool {
        self.suite == other.suite
    }
}

impl std::fmt::Debug for SupportedCipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SupportedCipherSuite({:?})", self.suite)
    }
}

impl SupportedCipherSuite {
    pub fn get_hash(&self) -> &'static digest::Algorithm {
        self.hash_algorithm
    }

    pub fn get_aead_alg(&self) -> &'static ring::aead::Algorithm {
        match self.bulk {
            BulkAlgorithm::Aes128Gcm => &ring::aead::AES_128_GCM,
            BulkAlgorithm::Aes256Gcm => &ring::aead::AES_256_GCM,
            BulkAlgorithm::Chacha20Poly1305 => &ring::aead::CHACHA20_POLY1305,
        }
    }

    pub fn usable_for_version(&self, version: ProtocolVersion) -> bool {
        match version {
            ProtocolVersion::TLSv1_3 | ProtocolVersion::DTLSv1_3 => {
                self.version == ProtocolVersion::TLSv1_3
            }
            _ => self.version == ProtocolVersion::TLSv1_2,
        }
    }

    pub fn usable_for_sigalg(&self, sigalg: SignatureAlgorithm) -> bool {
        self.sign == SignatureAlgorithm::Anonymous || self.sign == sigalg
    }

    /// Resolve a signature scheme for a TLS 1.2 suite against the peer's
    /// offer, by our preference.
    pub fn resolve_sig_scheme(&self, offered: &[SignatureScheme]) -> Option<SignatureScheme> {
        let ours: &[SignatureScheme] = match self.sign {
            SignatureAlgorithm::ECDSA => &[
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
            ],
            SignatureAlgorithm::RSA => &[
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
            ],
            SignatureAlgorithm::Anonymous => return None,
        };

        first_in_both(ours, offered)
    }
}

pub static TLS13_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
    suite: CipherSuite::TLS13_AES_128_GCM_SHA256,
    version: ProtocolVersion::TLSv1_3,
    sign: SignatureAlgorithm::Anonymous,
    bulk: BulkAlgorithm::Aes128Gcm,
    hash_algorithm: &digest::SHA256,
    hkdf_algorithm: hkdf::HKDF_SHA256,
    enc_key_len: 16,
    fixed_iv_len: 12,
    explicit_nonce_len: 0,
};

pub static TLS13_AES_256_GCM_SHA384: SupportedCipherSuite = SupportedCipherSuite {
    suite: CipherSuite::TLS13_AES_256_GCM_SHA384,
    version: ProtocolVersion::TLSv1_3,
    sign: SignatureAlgorithm::Anonymous,
    bulk: BulkAlgorithm::Aes256Gcm,
    hash_algorithm: &digest::SHA384,
    hkdf_algorithm: hkdf::HKDF_SHA384,
    enc_key_len: 32,
    fixed_iv_len: 12,
    explicit_nonce_len: 0,
};

pub static TLS13_CHACHA20_POLY1305_SHA256: SupportedCipherSuite = SupportedCipherSuite {
    suite: CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    version: ProtocolVersion::TLSv1_3,
    sign: SignatureAlgorithm::Anonymous,
    bulk: BulkAlgorithm::Chacha20Poly1305,
    hash_algorithm: &digest::SHA256,
    hkdf_algorithm: hkdf::HKDF_SHA256,
    enc_key_len: 32,
    fixed_iv_len: 12,
    explicit_nonce_len: 0,
};

pub static TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
    suite: CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    version: ProtocolVersion::TLSv1_2,
    sign: SignatureAlgorithm::ECDSA,
    bulk: BulkAlgorithm::Aes128Gcm,
    hash_algorithm: &digest::SHA256,
    hkdf_algorithm: hkdf::HKDF_SHA256,
    enc_key_len: 16,
    fixed_iv_len: 4,
    explicit_nonce_len: 8,
};

pub static TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256: SupportedCipherSuite = SupportedCipherSuite {
    suite: CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    version: ProtocolVersion::TLSv1_2,
    sign: SignatureAlgorithm::RSA,
    bulk: BulkAlgorithm::Aes128Gcm,
    hash_algorithm: &digest::SHA256,
    hkdf_algorithm: hkdf::HKDF_SHA256,
    enc_key_len: 16,
    fixed_iv_len: 4,
    explicit_nonce_len: 8,
};

pub static TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384: SupportedCipherSuite = SupportedCipherSuite {
    suite: CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    version: ProtocolVersion::TLSv1_2,
    sign: SignatureAlgorithm::RSA,
    bulk: BulkAlgorithm::Aes256Gcm,
    hash_algorithm: &digest::SHA384,
    hkdf_algorithm: hkdf::HKDF_SHA384,
    enc_key_len: 32,
    fixed_iv_len: 4,
    explicit_nonce_len: 8,
};

pub static TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256: SupportedCipherSuite =
    SupportedCipherSuite {
        suite: CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        version: ProtocolVersion::TLSv1_2,
        sign: SignatureAlgorithm::ECDSA,
        bulk: BulkAlgorithm::Chacha20Poly1305,
        hash_algorithm: &digest::SHA256,
        hkdf_algorithm: hkdf::HKDF_SHA256,
        enc_key_len: 32,
        fixed_iv_len: 12,
        explicit_nonce_len: 0,
    };

pub static TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256: SupportedCipherSuite =
    SupportedCipherSuite {
        suite: CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        version: ProtocolVersion::TLSv1_2,
        sign: SignatureAlgorithm::RSA,
        bulk: BulkAlgorithm::Chacha20Poly1305,
        hash_algorithm: &digest::SHA256,
        hkdf_algorithm: hkdf::HKDF_SHA256,
        enc_key_len: 32,
        fixed_iv_len: 12,
        explicit_nonce_len: 0,
    };

/// All suites, strongest versions first: the default preference order.
pub static ALL_CIPHERSUITES: [&SupportedCipherSuite; 7] = [
    &TLS13_AES_128_GCM_SHA256,
    &TLS13_AES_256_GCM_SHA384,
    &TLS13_CHACHA20_POLY1305_SHA256,
    &TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    &TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    &TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    &TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

pub fn lookup_suite(suite: CipherSuite) -> Option<&'static SupportedCipherSuite> {
    ALL_CIPHERSUITES.iter().copied().find(|scs| scs.suite == suite)
}

/// First suite in the client's order that we also support.
pub fn choose_ciphersuite_preferring_client(
    client_suites: &[CipherSuite],
    ours: &[&'static SupportedCipherSuite],
) -> Option<&'static SupportedCipherSuite> {
    client_suites
        .iter()
        .find_map(|offered| ours.iter().copied().find(|scs| scs.suite == *offered))
}

/// First of our suites the client also offers.
pub fn choose_ciphersuite_preferring_server(
    client_suites: &[CipherSuite],
    ours: &[&'static SupportedCipherSuite],
) -> Option<&'static SupportedCipherSuite> {
    ours.iter()
        .copied()
        .find(|scs| client_suites.contains(&scs.suite))
}

/// Drop suites our certificate key cannot authenticate.
pub fn reduce_given_sigalg(
    all: &[&'static SupportedCipherSuite],
    sigalg: SignatureAlgorithm,
) -> Vec<&'static SupportedCipherSuite> {
    all.iter()
        .copied()
        .filter(|scs| scs.usable_for_sigalg(sigalg))
        .collect()
}

pub fn reduce_given_version(
    all: &[&'static SupportedCipherSuite],
    version: ProtocolVersion,
) -> Vec<&'static SupportedCipherSuite> {
    all.iter()
        .copied()
        .filter(|scs| scs.usable_for_version(version))
        .collect()
}

/// Key-share groups we can do, in preference order.
pub static SUPPORTED_GROUPS: [NamedGroup; 3] =
    [NamedGroup::X25519, NamedGroup::secp256r1, NamedGroup::secp384r1];

fn agreement_algorithm(group: NamedGroup) -> Option<&'static agreement::Algorithm> {
    match group {
        NamedGroup::X25519 => Some(&agreement::X25519),
        NamedGroup::secp256r1 => Some(&agreement::ECDH_P256),
        NamedGroup::secp384r1 => Some(&agreement::ECDH_P384),
        _ => None,
    }
}

/// An in-flight ECDHE exchange: our ephemeral scalar and public share.
pub struct KeyExchange {
    pub group: NamedGroup,
    alg: &'static agreement::Algorithm,
    privkey: agreement::EphemeralPrivateKey,
    pub pubkey: Vec<u8>,
}

pub struct KeyExchangeResult {
    pub shared_secret: Zeroized,
}

impl KeyExchange {
    pub fn supported_group(group: NamedGroup) -> bool {
        agreement_algorithm(group).is_some()
    }

    pub fn start_ecdhe(group: NamedGroup) -> Result<KeyExchange, Error> {
        let alg = agreement_algorithm(group)
            .ok_or(Error::HandshakeFailure("unsupported key-share group"))?;
        let rng = ring::rand::SystemRandom::new();
        let privkey = agreement::EphemeralPrivateKey::generate(alg, &rng)
            .map_err(|_| Error::InternalError("keygen failure"))?;
        let pubkey = privkey
            .compute_public_key()
            .map_err(|_| Error::InternalError("pubkey computation failure"))?
            .as_ref()
            .to_vec();

        Ok(KeyExchange {
            group,
            alg,
            privkey,
            pubkey,
        })
    }

    /// Consume our scalar against the peer's share.
    pub fn complete(self, peer_pubkey: &[u8]) -> Result<KeyExchangeResult, Error> {
        let peer = agreement::UnparsedPublicKey::new(self.alg, peer_pubkey);
        agreement::agree_ephemeral(self.privkey, &peer, Error::DecryptError, |shared| {
            Ok(KeyExchangeResult {
                shared_secret: Zeroized::from_slice(shared),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_choice_prefers_client_order() {
        let client = [
            CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
            CipherSuite::TLS13_AES_128_GCM_SHA256,
        ];
        let chosen = choose_ciphersuite_preferring_client(&client, &ALL_CIPHERSUITES).unwrap();
        assert_eq!(chosen.suite, CipherSuite::TLS13_CHACHA20_POLY1305_SHA256);
    }

    #[test]
    fn suite_choice_prefers_server_order() {
        let client = [
            CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
            CipherSuite::TLS13_AES_128_GCM_SHA256,
        ];
        let chosen = choose_ciphersuite_preferring_server(&client, &ALL_CIPHERSUITES).unwrap();
        assert_eq!(chosen.suite, CipherSuite::TLS13_AES_128_GCM_SHA256);
    }

    #[test]
    fn ecdsa_suites_rejected_for_rsa_key() {
        let reduced = reduce_given_sigalg(&ALL_CIPHERSUITES, SignatureAlgorithm::RSA);
        assert!(reduced
            .iter()
            .all(|scs| scs.sign != SignatureAlgorithm::ECDSA));
        // TLS 1.3 suites survive any key type
        assert!(reduced.contains(&&TLS13_AES_128_GCM_SHA256));
    }

    #[test]
    fn ecdhe_x25519_agrees() {
        let a = KeyExchange::start_ecdhe(NamedGroup::X25519).unwrap();
        let b = KeyExchange::start_ecdhe(NamedGroup::X25519).unwrap();
        let a_pub = a.pubkey.clone();
        let b_pub = b.pubkey.clone();
        let sa = a.complete(&b_pub).unwrap();
        let sb = b.complete(&a_pub).unwrap();
        assert_eq!(&*sa.shared_secret, &*sb.shared_secret);
        assert_eq!(sa.shared_secret.len(), 32);
    }
}
