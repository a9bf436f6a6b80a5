use ring::{digest, hmac};

use crate::util::Zeroized;

/// The TLS 1.2 pseudo-random function (RFC 5246 §5): P_hash over a single
/// negotiated hash.
pub fn prf(out: &mut [u8], hash: &'static digest::Algorithm, secret: &[u8], label: &[u8], seed: &[u8]) {
    let alg = if hash == &digest::SHA384 {
        hmac::HMAC_SHA384
    } else {
        hmac::HMAC_SHA256
    };
    let key = hmac::Key::new(alg, secret);

    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    // A(1) = HMAC(secret, A(0)); A(0) = seed
    let mut current_a = hmac::sign(&key, &label_seed);

    let mut offs = 0;
    while offs < out.len() {
        // P_hash output block: HMAC(secret, A(i) || label || seed)
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(current_a.as_ref());
        ctx.update(&label_seed);
        let block = ctx.sign();

        let take = (out.len() - offs).min(block.as_ref().len());
        out[offs..offs + take].copy_from_slice(&block.as_ref()[..take]);
        offs += take;

        current_a = hmac::sign(&key, current_a.as_ref());
    }
}

/// The TLS 1.2 connection secrets: the master secret and everything the
/// record layer derives from it.
pub struct SessionSecrets {
    pub hash: &'static digest::Algorithm,
    pub master_secret: Zeroized,
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
}

impl SessionSecrets {
    /// Derive the master secret from an ECDHE premaster.
    pub fn new(
        hash: &'static digest::Algorithm,
        premaster: &[u8],
        client_random: [u8; 32],
        server_random: [u8; 32],
    ) -> SessionSecrets {
        let mut randoms = [0u8; 64];
        randoms[..32].copy_from_slice(&client_random);
        randoms[32..].copy_from_slice(&server_random);

        let mut master_secret = vec![0u8; 48];
        prf(
            &mut master_secret,
            hash,
            premaster,
            b"master secret",
            &randoms,
        );

        SessionSecrets {
            hash,
            master_secret: Zeroized::new(master_secret),
            client_random,
            server_random,
        }
    }

    /// Extended master secret (RFC 7627): bound to the session hash instead
    /// of the randoms.
    pub fn new_ems(
        hash: &'static digest::Algorithm,
        premaster: &[u8],
        session_hash: &[u8],
        client_random: [u8; 32],
        server_random: [u8; 32],
    ) -> SessionSecrets {
        let mut master_secret = vec![0u8; 48];
        prf(
            &mut master_secret,
            hash,
            premaster,
            b"extended master secret",
            session_hash,
        );

        SessionSecrets {
            hash,
            master_secret: Zeroized::new(master_secret),
            client_random,
            server_random,
        }
    }

    /// Rebuild secrets from a stored master secret on resumption.
    pub fn new_resume(
        hash: &'static digest::Algorithm,
        master_secret: &[u8],
        client_random: [u8; 32],
        server_random: [u8; 32],
    ) -> SessionSecrets {
        SessionSecrets {
            hash,
            master_secret: Zeroized::from_slice(master_secret),
            client_random,
            server_random,
        }
    }

    /// The key block: server random then client random as seed (RFC 5246 §6.3).
    pub fn make_key_block(&self, len: usize) -> Zeroized {
        let mut seed = [0u8; 64];
        seed[..32].copy_from_slice(&self.server_random);
        seed[32..].copy_from_slice(&self.client_random);

        let mut out = vec![0u8; len];
        prf(
            &mut out,
            self.hash,
            &self.master_secret,
            b"key expansion",
            &seed,
        );
        Zeroized::new(out)
    }

    pub fn client_verify_data(&self, handshake_hash: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        prf(
            &mut out,
            self.hash,
            &self.master_secret,
            b"client finished",
            handshake_hash,
        );
        out
    }

    pub fn server_verify_data(&self, handshake_hash: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 12];
        prf(
            &mut out,
            self.hash,
            &self.master_secret,
            b"server finished",
            handshake_hash,
        );
        out
    }

    pub fn get_master_secret(&self) -> Vec<u8> {
        self.master_secret.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::digest::SHA256;

    #[test]
    fn prf_is_deterministic_and_label_sensitive() {
        let mut a = [0u8; 48];
        let mut b = [0u8; 48];
        prf(&mut a, &SHA256, b"secret", b"label one", b"seed");
        prf(&mut b, &SHA256, b"secret", b"label one", b"seed");
        assert_eq!(a, b);

        prf(&mut b, &SHA256, b"secret", b"label two", b"seed");
        assert_ne!(a, b);
    }

    #[test]
    fn prf_fills_odd_lengths() {
        // an output that is not a multiple of the hash size exercises the
        // final partial block
        let mut out = [0u8; 77];
        prf(&mut out, &SHA256, b"secret", b"label", b"seed");
        assert!(out.iter().any(|&b| b != 0));
    }

    #[test]
    fn both_sides_agree_on_key_block() {
        let client = SessionSecrets::new(&SHA256, b"premaster", [1; 32], [2; 32]);
        let server = SessionSecrets::new(&SHA256, b"premaster", [1; 32], [2; 32]);
        assert_eq!(&*client.make_key_block(40), &*server.make_key_block(40));
        assert_eq!(
            client.client_verify_data(&[3; 32]),
            server.client_verify_data(&[3; 32])
        );
    }

    #[test]
    fn resumed_secrets_match_original() {
        let original = SessionSecrets::new(&SHA256, b"premaster", [1; 32], [2; 32]);
        let resumed =
            SessionSecrets::new_resume(&SHA256, &original.get_master_secret(), [5; 32], [6; 32]);
        assert_eq!(
            original.get_master_secret(),
            resumed.get_master_secret()
        );
        // key block differs because the randoms differ
        assert_ne!(&*original.make_key_block(40), &*resumed.make_key_block(40));
    }
}
