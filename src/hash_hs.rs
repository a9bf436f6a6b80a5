use ring::digest;

use crate::msgs::handshake::HandshakeMessagePayload;

/// The rolling transcript hash over all handshake messages.
///
/// Until the cipher suite fixes the hash algorithm, raw message bytes are
/// buffered so the hash can be initialized retroactively. The buffer is
/// also retained (when requested) for TLS 1.2 CertificateVerify, which
/// signs the message concatenation rather than a digest.
pub struct HandshakeHash {
    ctx: Option<digest::Context>,
    buffer: Vec<u8>,
    keep_buffer: bool,
}

impl HandshakeHash {
    pub fn new() -> HandshakeHash {
        HandshakeHash {
            ctx: None,
            buffer: Vec::new(),
            keep_buffer: false,
        }
    }

    /// Keep the raw message buffer alive past `start_hash`, for flows that
    /// need the full message concatenation.
    pub fn request_buffer(&mut self) {
        self.keep_buffer = true;
    }

    /// Fix the hash algorithm, replaying everything seen so far.
    /// Idempotent for the same algorithm; a suite change mid-handshake is a
    /// state-machine bug.
    pub fn start_hash(&mut self, alg: &'static digest::Algorithm) {
        if let Some(ref ctx) = self.ctx {
            debug_assert!(ctx.algorithm() == alg);
            return;
        }

        let mut ctx = digest::Context::new(alg);
        ctx.update(&self.buffer);
        self.ctx = Some(ctx);

        if !self.keep_buffer {
            self.buffer = Vec::new();
        }
    }

    pub fn algorithm_started(&self) -> bool {
        self.ctx.is_some()
    }

    /// Append one handshake message's transcript bytes.
    pub fn add(&mut self, bytes: &[u8]) {
        if let Some(ref mut ctx) = self.ctx {
            ctx.update(bytes);
        }
        if self.ctx.is_none() || self.keep_buffer {
            self.buffer.extend_from_slice(bytes);
        }
    }

    /// The digest over everything added so far; does not disturb the
    /// rolling state.
    pub fn get_current_hash(&self) -> Vec<u8> {
        let ctx = self
            .ctx
            .as_ref()
            .expect("transcript hash queried before suite selection");
        ctx.clone().finish().as_ref().to_vec()
    }

    /// The digest under `alg`, usable before `start_hash` fixed the
    /// algorithm (hashes the buffered bytes directly).
    pub fn get_current_hash_with(&self, alg: &'static digest::Algorithm) -> Vec<u8> {
        match &self.ctx {
            Some(ctx) => {
                debug_assert!(ctx.algorithm() == alg);
                ctx.clone().finish().as_ref().to_vec()
            }
            None => digest::digest(alg, &self.buffer).as_ref().to_vec(),
        }
    }

    /// Replace the transcript so far with `message_hash(transcript)`,
    /// as required after a HelloRetryRequest.
    pub fn rollup_for_hrr(&mut self) {
        let alg = self
            .ctx
            .as_ref()
            .expect("HRR rollup before suite selection")
            .algorithm();
        let hash = self.get_current_hash();

        let synthetic = HandshakeMessagePayload::build_message_hash(&hash).get_tls_encoding();

        let mut ctx = digest::Context::new(alg);
        ctx.update(&synthetic);
        self.ctx = Some(ctx);
        if self.keep_buffer {
            self.buffer = synthetic;
        }
    }

    /// Take the raw message concatenation; valid only if `request_buffer`
    /// was called before `start_hash`.
    pub fn take_handshake_buf(&mut self) -> Vec<u8> {
        debug_assert!(self.keep_buffer);
        std::mem::take(&mut self.buffer)
    }

    /// Borrow the raw message concatenation without consuming it.
    pub fn peek_handshake_buf(&self) -> Vec<u8> {
        debug_assert!(self.keep_buffer);
        self.buffer.clone()
    }

    pub fn request_buffer_if(&mut self, wanted: bool) {
        if wanted {
            self.request_buffer();
        }
    }

    /// An independent transcript with the same history, bound to `alg`.
    /// Used for PSK binders, which hash a truncated continuation.
    pub fn clone_for_binder(&self, alg: &'static digest::Algorithm) -> HandshakeHash {
        let mut out = HandshakeHash::new();
        match &self.ctx {
            Some(ctx) => {
                debug_assert!(ctx.algorithm() == alg);
                out.ctx = Some(ctx.clone());
            }
            None => {
                out.buffer = self.buffer.clone();
                out.start_hash(alg);
            }
        }
        out
    }

    /// Stop retaining raw messages once client auth is off the table.
    pub fn abandon_buffer(&mut self) {
        self.keep_buffer = false;
        if self.ctx.is_some() {
            self.buffer = Vec::new();
        }
    }
}

impl Default for HandshakeHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::digest::SHA256;

    #[test]
    fn late_binding_matches_direct_hashing() {
        let mut late = HandshakeHash::new();
        late.add(b"hello ");
        late.add(b"world");
        late.start_hash(&SHA256);

        let mut early = HandshakeHash::new();
        early.start_hash(&SHA256);
        early.add(b"hello ");
        early.add(b"world");

        assert_eq!(late.get_current_hash(), early.get_current_hash());
    }

    #[test]
    fn snapshot_does_not_disturb_rolling_state() {
        let mut hh = HandshakeHash::new();
        hh.start_hash(&SHA256);
        hh.add(b"one");
        let snap1 = hh.get_current_hash();
        let snap1_again = hh.get_current_hash();
        assert_eq!(snap1, snap1_again);

        hh.add(b"two");
        assert_ne!(hh.get_current_hash(), snap1);
    }

    #[test]
    fn hrr_rollup_replaces_history() {
        let mut hh = HandshakeHash::new();
        hh.start_hash(&SHA256);
        hh.add(b"client hello one");
        let ch1_hash = hh.get_current_hash();
        hh.rollup_for_hrr();

        // equivalent: message_hash message containing ch1_hash
        let mut expect = HandshakeHash::new();
        expect.start_hash(&SHA256);
        expect.add(
            &HandshakeMessagePayload::build_message_hash(&ch1_hash).get_tls_encoding(),
        );

        assert_eq!(hh.get_current_hash(), expect.get_current_hash());
    }

    #[test]
    fn buffer_retention_for_tls12_certverify() {
        let mut hh = HandshakeHash::new();
        hh.request_buffer();
        hh.add(b"m1");
        hh.start_hash(&SHA256);
        hh.add(b"m2");
        assert_eq!(hh.take_handshake_buf(), b"m1m2".to_vec());
    }
}
