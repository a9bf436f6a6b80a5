use std::sync::Mutex;

use ring::aead;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::Error;

/// Produces and opens the opaque tickets a server hands out.
///
/// `encrypt` may return `Ok(None)` when the ticket is being produced
/// elsewhere; the handshake suspends on `pending_ticket` and retries.
/// `decrypt` returning `None` is a cache miss, never an error.
pub trait ProducesTickets: Send + Sync {
    fn enabled(&self) -> bool;
    fn lifetime(&self) -> u32;
    fn encrypt(&self, plain: &[u8]) -> Result<Option<Vec<u8>>, Error>;
    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>>;
}

/// Refuses to make tickets.
pub struct NoTickets;

impl ProducesTickets for NoTickets {
    fn enabled(&self) -> bool {
        false
    }

    fn lifetime(&self) -> u32 {
        0
    }

    fn encrypt(&self, _plain: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(None)
    }

    fn decrypt(&self, _cipher: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

pub const KEY_NAME_LEN: usize = 16;
const NONCE_LEN: usize = 12;

struct TicketKey {
    name: [u8; KEY_NAME_LEN],
    key: aead::LessSafeKey,
}

impl TicketKey {
    fn generate(rng: &SystemRandom) -> Result<TicketKey, Error> {
        let mut name = [0u8; KEY_NAME_LEN];
        rng.fill(&mut name)
            .map_err(|_| Error::InternalError("rng failure"))?;

        let mut key_bytes = [0u8; 32];
        rng.fill(&mut key_bytes)
            .map_err(|_| Error::InternalError("rng failure"))?;
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
            .map_err(|_| Error::InternalError("ticket key setup"))?;

        Ok(TicketKey {
            name,
            key: aead::LessSafeKey::new(unbound),
        })
    }
}

/// AEAD ticketer: `key_name(16) || nonce(12) || ciphertext+tag`, with the
/// key name and nonce authenticated as associated data. Holds the current
/// key plus the previous one so rotation does not orphan live tickets.
pub struct AeadTicketer {
    keys: Mutex<(TicketKey, Option<TicketKey>)>,
    lifetime: u32,
    rng: SystemRandom,
}

impl AeadTicketer {
    pub fn new(lifetime: u32) -> Result<AeadTicketer, Error> {
        let rng = SystemRandom::new();
        let current = TicketKey::generate(&rng)?;
        Ok(AeadTicketer {
            keys: Mutex::new((current, None)),
            lifetime,
            rng,
        })
    }

    /// Atomically install a fresh key; the old current key stays valid for
    /// decryption until the next rotation.
    pub fn rotate(&self) -> Result<(), Error> {
        let fresh = TicketKey::generate(&self.rng)?;
        let mut keys = self.keys.lock().unwrap();
        let old_current = std::mem::replace(&mut keys.0, fresh);
        keys.1 = Some(old_current);
        Ok(())
    }
}

impl ProducesTickets for AeadTicketer {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        self.lifetime
    }

    fn encrypt(&self, plain: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::InternalError("rng failure"))?;

        let keys = self.keys.lock().unwrap();
        let current = &keys.0;

        let mut aad = Vec::with_capacity(KEY_NAME_LEN + NONCE_LEN);
        aad.extend_from_slice(&current.name);
        aad.extend_from_slice(&nonce_bytes);

        let mut body = plain.to_vec();
        current
            .key
            .seal_in_place_append_tag(
                aead::Nonce::assume_unique_for_key(nonce_bytes),
                aead::Aad::from(&aad),
                &mut body,
            )
            .map_err(|_| Error::InternalError("ticket seal"))?;

        let mut out = Vec::with_capacity(KEY_NAME_LEN + NONCE_LEN + body.len());
        out.extend_from_slice(&current.name);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&body);
        Ok(Some(out))
    }

    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>> {
        if cipher.len() < KEY_NAME_LEN + NONCE_LEN {
            return None;
        }

        let (name, rest) = cipher.split_at(KEY_NAME_LEN);
        let (nonce_bytes, body) = rest.split_at(NONCE_LEN);

        let keys = self.keys.lock().unwrap();
        let key = if crate::util::constant_time_eq(name, &keys.0.name) {
            &keys.0.key
        } else {
            match &keys.1 {
                Some(prev) if crate::util::constant_time_eq(name, &prev.name) => &prev.key,
                _ => return None,
            }
        };

        let mut aad = Vec::with_capacity(KEY_NAME_LEN + NONCE_LEN);
        aad.extend_from_slice(name);
        aad.extend_from_slice(nonce_bytes);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let mut buf = body.to_vec();
        let plain_len = key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(&aad),
                &mut buf,
            )
            .ok()?
            .len();
        buf.truncate(plain_len);
        Some(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let t = AeadTicketer::new(7200).unwrap();
        let ticket = t.encrypt(b"session state").unwrap().unwrap();
        assert_eq!(t.decrypt(&ticket), Some(b"session state".to_vec()));
        assert!(ticket.len() >= KEY_NAME_LEN + NONCE_LEN + 13 + 16);
    }

    #[test]
    fn tampering_is_a_miss_not_an_error() {
        let t = AeadTicketer::new(7200).unwrap();
        let mut ticket = t.encrypt(b"state").unwrap().unwrap();
        let last = ticket.len() - 1;
        ticket[last] ^= 1;
        assert_eq!(t.decrypt(&ticket), None);
    }

    #[test]
    fn unknown_key_name_is_a_miss() {
        let t = AeadTicketer::new(7200).unwrap();
        let mut ticket = t.encrypt(b"state").unwrap().unwrap();
        ticket[0] ^= 0xff;
        assert_eq!(t.decrypt(&ticket), None);
    }

    #[test]
    fn rotation_keeps_previous_key_alive() {
        let t = AeadTicketer::new(7200).unwrap();
        let old = t.encrypt(b"old").unwrap().unwrap();
        t.rotate().unwrap();
        assert_eq!(t.decrypt(&old), Some(b"old".to_vec()));

        let new = t.encrypt(b"new").unwrap().unwrap();
        t.rotate().unwrap();
        // two rotations later the oldest key is gone
        assert_eq!(t.decrypt(&old), None);
        assert_eq!(t.decrypt(&new), Some(b"new".to_vec()));
    }
}
