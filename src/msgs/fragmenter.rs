use crate::msgs::base::Payload;
use crate::msgs::enums::{ContentType, ProtocolVersion};
use crate::msgs::message::{PlainMessage, MAX_PLAINTEXT};

/// Splits outgoing plaintext into records no larger than the configured
/// fragment size, and coalesces consecutive handshake bytes into as few
/// records as possible.
pub struct MessageFragmenter {
    max_frag: usize,
}

impl MessageFragmenter {
    pub fn new(max_frag: usize) -> MessageFragmenter {
        debug_assert!(max_frag >= 32 && max_frag <= MAX_PLAINTEXT);
        MessageFragmenter { max_frag }
    }

    pub fn set_max_fragment(&mut self, max_frag: usize) {
        debug_assert!(max_frag >= 32 && max_frag <= MAX_PLAINTEXT);
        self.max_frag = max_frag;
    }

    pub fn max_fragment(&self) -> usize {
        self.max_frag
    }

    /// Fragment one message, preserving order. Zero-length payloads produce
    /// a single empty record.
    pub fn fragment(&self, msg: PlainMessage, out: &mut Vec<PlainMessage>) {
        let typ = msg.typ;
        let version = msg.version;
        let payload = msg.payload.0;

        if payload.is_empty() {
            out.push(PlainMessage {
                typ,
                version,
                payload: Payload::empty(),
            });
            return;
        }

        for chunk in payload.chunks(self.max_frag) {
            out.push(PlainMessage {
                typ,
                version,
                payload: Payload::from_slice(chunk),
            });
        }
    }

    /// Coalesce a run of already-encoded handshake messages into minimal
    /// records. The caller guarantees `encoded` is a concatenation of whole
    /// handshake messages; record boundaries need not respect message
    /// boundaries.
    pub fn fragment_handshake_run(
        &self,
        version: ProtocolVersion,
        encoded: Vec<u8>,
        out: &mut Vec<PlainMessage>,
    ) {
        self.fragment(
            PlainMessage {
                typ: ContentType::Handshake,
                version,
                payload: Payload(encoded),
            },
            out,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::enums::ContentType;

    fn plain(len: usize) -> PlainMessage {
        PlainMessage {
            typ: ContentType::ApplicationData,
            version: ProtocolVersion::TLSv1_2,
            payload: Payload(vec![0xaa; len]),
        }
    }

    #[test]
    fn under_limit_passes_through() {
        let frag = MessageFragmenter::new(1024);
        let mut out = Vec::new();
        frag.fragment(plain(1024), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.len(), 1024);
    }

    #[test]
    fn over_limit_splits_preserving_order_and_size() {
        let frag = MessageFragmenter::new(1024);
        let mut out = Vec::new();
        frag.fragment(plain(3000), &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].payload.len(), 1024);
        assert_eq!(out[1].payload.len(), 1024);
        assert_eq!(out[2].payload.len(), 952);
    }

    #[test]
    fn empty_payload_emits_one_empty_record() {
        let frag = MessageFragmenter::new(1024);
        let mut out = Vec::new();
        frag.fragment(plain(0), &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].payload.is_empty());
    }

    #[test]
    fn handshake_run_coalesces() {
        let frag = MessageFragmenter::new(MAX_PLAINTEXT);
        let mut out = Vec::new();
        // two small "messages" back to back end up in one record
        let mut run = vec![1, 0, 0, 1, 0xff];
        run.extend_from_slice(&[2, 0, 0, 1, 0xee]);
        frag.fragment_handshake_run(ProtocolVersion::TLSv1_2, run.clone(), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.0, run);
    }
}
