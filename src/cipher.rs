use ring::aead;

use crate::error::Error;
use crate::msgs::codec::Codec;
use crate::msgs::enums::{ContentType, ProtocolVersion};
use crate::suites::SupportedCipherSuite;
use crate::util::Zeroized;

/// Which way this context points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Direction {
    Seal,
    Open,
}

/// How records are protected under this context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CipherForm {
    /// Pre-handshake: authenticates nothing, copies bytes.
    Null,
    /// TLS 1.2 AES-GCM: 4-byte implicit IV plus 8-byte explicit nonce
    /// carried per record.
    Tls12ExplicitNonce,
    /// TLS 1.2 ChaCha20-Poly1305 and all TLS 1.3 / DTLS 1.3 suites:
    /// 12-byte IV XORed with the sequence number.
    XorNonce,
}

/// Directional record protection state. Replaced wholesale on key change;
/// never rekeyed in place.
pub struct AeadContext {
    key: Option<aead::LessSafeKey>,
    fixed_iv: Zeroized,
    form: CipherForm,
    direction: Direction,
    tag_len: usize,
}

/// XOR the big-endian sequence number into the tail of a 12-byte IV.
fn xor_nonce(iv: &[u8], seq: u64) -> [u8; aead::NONCE_LEN] {
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[..].copy_from_slice(iv);
    for (nb, sb) in nonce[4..].iter_mut().zip(seq.to_be_bytes().iter()) {
        *nb ^= sb;
    }
    nonce
}

impl AeadContext {
    pub fn null(direction: Direction) -> AeadContext {
        AeadContext {
            key: None,
            fixed_iv: Zeroized::empty(),
            form: CipherForm::Null,
            direction,
            tag_len: 0,
        }
    }

    pub fn new(
        suite: &SupportedCipherSuite,
        form: CipherForm,
        direction: Direction,
        key: &[u8],
        iv: &[u8],
    ) -> Result<AeadContext, Error> {
        debug_assert_eq!(key.len(), suite.enc_key_len);
        let unbound = aead::UnboundKey::new(suite.get_aead_alg(), key)
            .map_err(|_| Error::InternalError("bad AEAD key length"))?;

        Ok(AeadContext {
            key: Some(aead::LessSafeKey::new(unbound)),
            fixed_iv: Zeroized::from_slice(iv),
            form,
            direction,
            tag_len: suite.get_aead_alg().tag_len(),
        })
    }

    pub fn is_null(&self) -> bool {
        self.form == CipherForm::Null
    }

    /// Bytes of AEAD expansion `seal` adds to a plaintext.
    pub fn overhead(&self) -> usize {
        match self.form {
            CipherForm::Null => 0,
            CipherForm::Tls12ExplicitNonce => 8 + self.tag_len,
            CipherForm::XorNonce => self.tag_len,
        }
    }

    /// Protect one record body. `seq` is the record sequence number; `aad`
    /// the version-specific associated data.
    pub fn seal(&self, seq: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        debug_assert_eq!(self.direction, Direction::Seal);

        let key = match &self.key {
            None => return Ok(plaintext.to_vec()),
            Some(key) => key,
        };

        match self.form {
            CipherForm::Null => unreachable!(),
            CipherForm::Tls12ExplicitNonce => {
                let explicit = seq.to_be_bytes();
                let mut nonce_bytes = [0u8; aead::NONCE_LEN];
                nonce_bytes[..4].copy_from_slice(&self.fixed_iv);
                nonce_bytes[4..].copy_from_slice(&explicit);
                let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

                let mut buf = plaintext.to_vec();
                let tag = key
                    .seal_in_place_separate_tag(nonce, aead::Aad::from(aad), &mut buf)
                    .map_err(|_| Error::InternalError("seal failure"))?;

                let mut out = Vec::with_capacity(8 + buf.len() + self.tag_len);
                out.extend_from_slice(&explicit);
                out.append(&mut buf);
                out.extend_from_slice(tag.as_ref());
                Ok(out)
            }
            CipherForm::XorNonce => {
                let nonce =
                    aead::Nonce::assume_unique_for_key(xor_nonce(&self.fixed_iv, seq));
                let mut buf = plaintext.to_vec();
                key.seal_in_place_append_tag(nonce, aead::Aad::from(aad), &mut buf)
                    .map_err(|_| Error::InternalError("seal failure"))?;
                Ok(buf)
            }
        }
    }

    /// Open one record body. On failure the context is untouched and the
    /// caller decides between alerting (TLS) and dropping (DTLS).
    pub fn open(&self, seq: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        debug_assert_eq!(self.direction, Direction::Open);

        let key = match &self.key {
            None => return Ok(ciphertext.to_vec()),
            Some(key) => key,
        };

        match self.form {
            CipherForm::Null => unreachable!(),
            CipherForm::Tls12ExplicitNonce => {
                if ciphertext.len() < 8 + self.tag_len {
                    return Err(Error::AeadAuth);
                }

                let mut nonce_bytes = [0u8; aead::NONCE_LEN];
                nonce_bytes[..4].copy_from_slice(&self.fixed_iv);
                nonce_bytes[4..].copy_from_slice(&ciphertext[..8]);
                let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

                let mut buf = ciphertext[8..].to_vec();
                let plain_len = key
                    .open_in_place(nonce, aead::Aad::from(aad), &mut buf)
                    .map_err(|_| Error::AeadAuth)?
                    .len();
                buf.truncate(plain_len);
                Ok(buf)
            }
            CipherForm::XorNonce => {
                if ciphertext.len() < self.tag_len {
                    return Err(Error::AeadAuth);
                }

                let nonce =
                    aead::Nonce::assume_unique_for_key(xor_nonce(&self.fixed_iv, seq));
                let mut buf = ciphertext.to_vec();
                let plain_len = key
                    .open_in_place(nonce, aead::Aad::from(aad), &mut buf)
                    .map_err(|_| Error::AeadAuth)?
                    .len();
                buf.truncate(plain_len);
                Ok(buf)
            }
        }
    }
}

/// TLS ≤1.2 associated data: `seq(8) || type || version || plaintext_len(2)`.
pub fn make_tls12_aad(
    seq: u64,
    typ: ContentType,
    version: ProtocolVersion,
    len: usize,
) -> [u8; 13] {
    let mut out = [0u8; 13];
    out[..8].copy_from_slice(&seq.to_be_bytes());
    out[8] = typ.get_u8();
    out[9..11].copy_from_slice(&version.get_u16().to_be_bytes());
    out[11..13].copy_from_slice(&(len as u16).to_be_bytes());
    out
}

/// TLS 1.3 inner plaintext: `content || type || zero padding`.
pub fn wrap_tls13_inner(plaintext: &[u8], typ: ContentType) -> Vec<u8> {
    let mut inner = Vec::with_capacity(plaintext.len() + 1);
    inner.extend_from_slice(plaintext);
    inner.push(typ.get_u8());
    inner
}

/// Strip TLS 1.3 padding and recover the true content type. The scan always
/// covers the whole buffer; timing must not depend on padding length.
pub fn unwrap_tls13_inner(mut inner: Vec<u8>) -> Result<(ContentType, Vec<u8>), Error> {
    let mut boundary = 0usize;
    let mut any_nonzero = 0usize;
    for (idx, b) in inner.iter().enumerate() {
        let nonzero = (*b != 0) as usize;
        boundary = boundary * (1 - nonzero) + idx * nonzero;
        any_nonzero |= nonzero;
    }

    // all-zero plaintext carries no content type byte
    if any_nonzero == 0 {
        return Err(Error::DecodeError);
    }

    let typ = ContentType::read_bytes(&[inner[boundary]]).ok_or(Error::DecodeError)?;
    inner.truncate(boundary);
    Ok((typ, inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suites::TLS13_AES_128_GCM_SHA256;

    fn pair() -> (AeadContext, AeadContext) {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 12];
        let seal = AeadContext::new(
            &TLS13_AES_128_GCM_SHA256,
            CipherForm::XorNonce,
            Direction::Seal,
            &key,
            &iv,
        )
        .unwrap();
        let open = AeadContext::new(
            &TLS13_AES_128_GCM_SHA256,
            CipherForm::XorNonce,
            Direction::Open,
            &key,
            &iv,
        )
        .unwrap();
        (seal, open)
    }

    #[test]
    fn null_cipher_copies() {
        let seal = AeadContext::null(Direction::Seal);
        let open = AeadContext::null(Direction::Open);
        assert_eq!(seal.seal(0, b"", b"hello").unwrap(), b"hello".to_vec());
        assert_eq!(open.open(0, b"", b"hello").unwrap(), b"hello".to_vec());
        assert_eq!(seal.overhead(), 0);
    }

    #[test]
    fn xor_nonce_roundtrip_and_length() {
        let (seal, open) = pair();
        let aad = [23u8, 3, 3, 0, 21];
        let ct = seal.seal(7, &aad, b"plain").unwrap();
        assert_eq!(ct.len(), 5 + 16);
        assert_eq!(open.open(7, &aad, &ct).unwrap(), b"plain".to_vec());
    }

    #[test]
    fn wrong_seq_fails_auth_and_leaves_context_usable() {
        let (seal, open) = pair();
        let aad = [23u8, 3, 3, 0, 21];
        let ct = seal.seal(7, &aad, b"plain").unwrap();
        assert_eq!(open.open(8, &aad, &ct), Err(Error::AeadAuth));
        // same context still opens the correct sequence
        assert_eq!(open.open(7, &aad, &ct).unwrap(), b"plain".to_vec());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (seal, open) = pair();
        let aad = [23u8, 3, 3, 0, 21];
        let mut ct = seal.seal(1, &aad, b"plain").unwrap();
        ct[0] ^= 1;
        assert_eq!(open.open(1, &aad, &ct), Err(Error::AeadAuth));
    }

    #[test]
    fn inner_plaintext_padding_stripped() {
        let mut inner = wrap_tls13_inner(b"data", ContentType::Handshake);
        inner.extend_from_slice(&[0, 0, 0]);
        let (typ, body) = unwrap_tls13_inner(inner).unwrap();
        assert_eq!(typ, ContentType::Handshake);
        assert_eq!(body, b"data".to_vec());
    }

    #[test]
    fn all_zero_inner_plaintext_rejected() {
        assert_eq!(
            unwrap_tls13_inner(vec![0; 16]),
            Err(Error::DecodeError)
        );
    }

    #[test]
    fn tls12_aad_layout() {
        let aad = make_tls12_aad(3, ContentType::ApplicationData, ProtocolVersion::TLSv1_2, 5);
        assert_eq!(&aad[..8], &3u64.to_be_bytes());
        assert_eq!(&aad[8..], &[23, 3, 3, 0, 5]);
    }
}
