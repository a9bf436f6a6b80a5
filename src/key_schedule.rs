use ring::{digest, hkdf, hmac};

use crate::error::Error;
use crate::util::Zeroized;

/// The labeled secrets of the TLS 1.3 derivation tree (RFC 8446 §7.1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SecretKind {
    ResumptionPskBinderKey,
    ExternalPskBinderKey,
    ClientEarlyTrafficSecret,
    ClientHandshakeTrafficSecret,
    ServerHandshakeTrafficSecret,
    ClientApplicationTrafficSecret,
    ServerApplicationTrafficSecret,
    ExporterMasterSecret,
    ResumptionMasterSecret,
}

impl SecretKind {
    fn to_bytes(self) -> &'static [u8] {
        match self {
            SecretKind::ResumptionPskBinderKey => b"res binder",
            SecretKind::ExternalPskBinderKey => b"ext binder",
            SecretKind::ClientEarlyTrafficSecret => b"c e traffic",
            SecretKind::ClientHandshakeTrafficSecret => b"c hs traffic",
            SecretKind::ServerHandshakeTrafficSecret => b"s hs traffic",
            SecretKind::ClientApplicationTrafficSecret => b"c ap traffic",
            SecretKind::ServerApplicationTrafficSecret => b"s ap traffic",
            SecretKind::ExporterMasterSecret => b"exp master",
            SecretKind::ResumptionMasterSecret => b"res master",
        }
    }
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// `HKDF-Expand-Label(secret, label, context, out_len)`.
///
/// The info string is `u16 out_len || u8 label_len || "tls13 " label ||
/// u8 context_len || context`.
pub fn hkdf_expand_label(secret: &hkdf::Prk, label: &[u8], context: &[u8], out_len: usize) -> Zeroized {
    const LABEL_PREFIX: &[u8] = b"tls13 ";

    let out_len_bytes = (out_len as u16).to_be_bytes();
    let label_len = [(LABEL_PREFIX.len() + label.len()) as u8];
    let context_len = [context.len() as u8];

    let info: [&[u8]; 6] = [
        &out_len_bytes,
        &label_len,
        LABEL_PREFIX,
        label,
        &context_len,
        context,
    ];

    let mut out = vec![0u8; out_len];
    secret
        .expand(&info, OkmLen(out_len))
        .and_then(|okm| okm.fill(&mut out))
        .expect("expand-label output length unsupportable");
    Zeroized::new(out)
}

fn hmac_algorithm(hash: &'static digest::Algorithm) -> hmac::Algorithm {
    if hash == &digest::SHA384 {
        hmac::HMAC_SHA384
    } else {
        hmac::HMAC_SHA256
    }
}

fn digest_algorithm(hkdf_alg: hkdf::Algorithm) -> &'static digest::Algorithm {
    if hkdf_alg == hkdf::HKDF_SHA384 {
        &digest::SHA384
    } else {
        &digest::SHA256
    }
}

/// Where the key schedule currently stands in the extract chain.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Fresh,
    Early,
    Handshake,
    Master,
}

/// The HKDF secret tree. Owns the current extract state and the traffic
/// secrets needed for later derivations (finished keys, key update,
/// exporters, resumption).
pub struct KeySchedule {
    algorithm: hkdf::Algorithm,
    hash: &'static digest::Algorithm,
    current: Option<hkdf::Prk>,
    stage: Stage,
    pub current_client_traffic_secret: Zeroized,
    pub current_server_traffic_secret: Zeroized,
    current_exporter_secret: Zeroized,
}

impl KeySchedule {
    pub fn new(algorithm: hkdf::Algorithm) -> KeySchedule {
        KeySchedule {
            algorithm,
            hash: digest_algorithm(algorithm),
            current: None,
            stage: Stage::Fresh,
            current_client_traffic_secret: Zeroized::empty(),
            current_server_traffic_secret: Zeroized::empty(),
            current_exporter_secret: Zeroized::empty(),
        }
    }

    pub fn hash_len(&self) -> usize {
        self.hash.output_len
    }

    fn empty_hash(&self) -> Vec<u8> {
        digest::digest(self.hash, b"").as_ref().to_vec()
    }

    fn zeroes(&self) -> Vec<u8> {
        vec![0u8; self.hash_len()]
    }

    fn advance_stage(&mut self) {
        self.stage = match self.stage {
            Stage::Fresh => Stage::Early,
            Stage::Early => Stage::Handshake,
            Stage::Handshake => Stage::Master,
            Stage::Master => Stage::Master,
        };
    }

    /// `HKDF-Extract` with a zero IKM: advances past a stage with no input
    /// (no PSK for the early secret, no further input for the master).
    pub fn input_empty(&mut self) {
        let zeroes = self.zeroes();
        self.input_secret(&zeroes);
    }

    /// `HKDF-Extract(salt = Derive-Secret(., "derived", ""), IKM = secret)`.
    pub fn input_secret(&mut self, secret: &[u8]) {
        let salt: Zeroized = match &self.current {
            None => Zeroized::new(self.zeroes()),
            Some(prk) => hkdf_expand_label(prk, b"derived", &self.empty_hash(), self.hash_len()),
        };

        self.current = Some(hkdf::Salt::new(self.algorithm, &salt).extract(secret));
        self.advance_stage();
    }

    /// Derive one of the labeled secrets against a transcript snapshot.
    pub fn derive(&self, kind: SecretKind, hs_hash: &[u8]) -> Zeroized {
        debug_assert_eq!(hs_hash.len(), self.hash_len());
        debug_assert!(match kind {
            SecretKind::ResumptionPskBinderKey
            | SecretKind::ExternalPskBinderKey
            | SecretKind::ClientEarlyTrafficSecret => self.stage == Stage::Early,
            SecretKind::ClientHandshakeTrafficSecret
            | SecretKind::ServerHandshakeTrafficSecret => self.stage == Stage::Handshake,
            _ => self.stage == Stage::Master,
        });

        let current = self
            .current
            .as_ref()
            .expect("derive before any extract");
        hkdf_expand_label(current, kind.to_bytes(), hs_hash, self.hash_len())
    }

    pub fn remember_exporter_secret(&mut self, secret: Zeroized) {
        self.current_exporter_secret = secret;
    }

    fn prk_of(&self, secret: &[u8]) -> hkdf::Prk {
        hkdf::Prk::new_less_safe(self.algorithm, secret)
    }

    /// The Finished MAC for the side owning `base_secret`, over `hs_hash`.
    pub fn sign_verify_data(&self, base_secret: &[u8], hs_hash: &[u8]) -> Vec<u8> {
        let finished_key =
            hkdf_expand_label(&self.prk_of(base_secret), b"finished", &[], self.hash_len());
        let key = hmac::Key::new(hmac_algorithm(self.hash), &finished_key);
        hmac::sign(&key, hs_hash).as_ref().to_vec()
    }

    /// A PSK binder value, computed like a Finished over the truncated
    /// ClientHello transcript.
    pub fn sign_psk_binder(&self, binder_base: &[u8], truncated_hash: &[u8]) -> Vec<u8> {
        self.sign_verify_data(binder_base, truncated_hash)
    }

    /// Per-record keying material from a traffic secret.
    pub fn derive_traffic_keys(&self, secret: &[u8], key_len: usize, iv_len: usize) -> (Zeroized, Zeroized) {
        let prk = self.prk_of(secret);
        let key = hkdf_expand_label(&prk, b"key", &[], key_len);
        let iv = hkdf_expand_label(&prk, b"iv", &[], iv_len);
        (key, iv)
    }

    /// `application_traffic_secret_N+1` (RFC 8446 §7.2).
    pub fn next_traffic_secret(&self, secret: &[u8]) -> Zeroized {
        hkdf_expand_label(&self.prk_of(secret), b"traffic upd", &[], self.hash_len())
    }

    /// A resumption PSK from the resumption master secret and ticket nonce.
    pub fn derive_ticket_psk(&self, resumption_master: &[u8], nonce: &[u8]) -> Zeroized {
        hkdf_expand_label(
            &self.prk_of(resumption_master),
            b"resumption",
            nonce,
            self.hash_len(),
        )
    }

    /// RFC 8446 §7.5 exporter.
    pub fn export_keying_material(
        &self,
        label: &[u8],
        context: &[u8],
        out_len: usize,
    ) -> Result<Vec<u8>, Error> {
        if self.current_exporter_secret.is_empty() {
            return Err(Error::HandshakeFailure("no exporter secret yet"));
        }

        let base = hkdf_expand_label(
            &self.prk_of(&self.current_exporter_secret),
            label,
            &self.empty_hash(),
            self.hash_len(),
        );
        let context_hash = digest::digest(self.hash, context);
        Ok(hkdf_expand_label(
            &self.prk_of(&base),
            b"exporter",
            context_hash.as_ref(),
            out_len,
        )
        .into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// RFC 8448 §3: Derive-Secret(Early Secret, "derived", "") with no PSK.
    #[test]
    fn derived_salt_matches_rfc8448() {
        let mut ks = KeySchedule::new(hkdf::HKDF_SHA256);
        ks.input_empty();
        let derived = hkdf_expand_label(
            ks.current.as_ref().unwrap(),
            b"derived",
            &ks.empty_hash(),
            32,
        );
        assert_eq!(
            &*derived,
            &hex::decode("6f2615a108c702c5678f54fc9dbab69716c076189c48250cebeac3576c3611ba")
                .unwrap()[..],
        );
    }

    #[test]
    fn both_sides_derive_equal_traffic_keys() {
        let transcript = [0x42u8; 32];
        let shared = [7u8; 32];

        let make = || {
            let mut ks = KeySchedule::new(hkdf::HKDF_SHA256);
            ks.input_empty();
            ks.input_secret(&shared);
            ks.derive(SecretKind::ClientHandshakeTrafficSecret, &transcript)
        };

        let client_view = make();
        let server_view = make();
        assert_eq!(&*client_view, &*server_view);

        let ks = KeySchedule::new(hkdf::HKDF_SHA256);
        let (k1, iv1) = ks.derive_traffic_keys(&client_view, 16, 12);
        let (k2, iv2) = ks.derive_traffic_keys(&server_view, 16, 12);
        assert_eq!(&*k1, &*k2);
        assert_eq!(&*iv1, &*iv2);
        assert_eq!(k1.len(), 16);
        assert_eq!(iv1.len(), 12);
    }

    #[test]
    fn traffic_update_changes_secret() {
        let ks = KeySchedule::new(hkdf::HKDF_SHA256);
        let s0 = [9u8; 32];
        let s1 = ks.next_traffic_secret(&s0);
        assert_ne!(&*s1, &s0[..]);
        assert_eq!(s1.len(), 32);
        // deterministic
        assert_eq!(&*ks.next_traffic_secret(&s0), &*s1);
    }

    #[test]
    fn exporter_requires_secret() {
        let ks = KeySchedule::new(hkdf::HKDF_SHA256);
        assert!(ks.export_keying_material(b"label", b"ctx", 32).is_err());

        let mut ks = KeySchedule::new(hkdf::HKDF_SHA256);
        ks.remember_exporter_secret(Zeroized::from_slice(&[1u8; 32]));
        let a = ks.export_keying_material(b"label", b"ctx", 32).unwrap();
        let b = ks.export_keying_material(b"label", b"ctx", 32).unwrap();
        assert_eq!(a, b);
        let c = ks.export_keying_material(b"label", b"other", 32).unwrap();
        assert_ne!(a, c);
    }
}
