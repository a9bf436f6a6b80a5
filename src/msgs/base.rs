use crate::msgs::codec::{u24, Codec, Reader};

/// An opaque run of bytes filling the rest of its container.
#[derive(Clone, Eq, PartialEq)]
pub struct Payload(pub Vec<u8>);

impl Codec for Payload {
    fn encode(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.0);
    }

    fn read(r: &mut Reader) -> Option<Payload> {
        Some(Payload(r.rest().to_vec()))
    }
}

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Payload {
        Payload(bytes)
    }

    pub fn empty() -> Payload {
        Payload(Vec::new())
    }

    pub fn from_slice(bytes: &[u8]) -> Payload {
        Payload(bytes.to_vec())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

macro_rules! length_prefixed_payload {
    ($name:ident, $lenty:ty, $max:expr, $read_len:expr, $write_len:expr) => {
        /// An opaque run of bytes behind an explicit length prefix.
        #[derive(Clone, Eq, PartialEq)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            pub fn new(bytes: Vec<u8>) -> $name {
                $name(bytes)
            }

            pub fn empty() -> $name {
                $name(Vec::new())
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Codec for $name {
            fn encode(&self, bytes: &mut Vec<u8>) {
                debug_assert!(self.0.len() <= $max);
                let write: fn(usize, &mut Vec<u8>) = $write_len;
                write(self.0.len(), bytes);
                bytes.extend_from_slice(&self.0);
            }

            fn read(r: &mut Reader) -> Option<$name> {
                let read: fn(&mut Reader) -> Option<usize> = $read_len;
                let len = read(r)?;
                let body = r.take(len)?;
                Some($name(body.to_vec()))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({} bytes)"), self.0.len())
            }
        }
    };
}

length_prefixed_payload!(
    PayloadU8,
    u8,
    0xff,
    |r| u8::read(r).map(|v| v as usize),
    |len, out| out.push(len as u8)
);

length_prefixed_payload!(
    PayloadU16,
    u16,
    0xffff,
    |r| u16::read(r).map(|v| v as usize),
    |len, out| crate::msgs::codec::put_u16(len as u16, out)
);

length_prefixed_payload!(
    PayloadU24,
    u24,
    0xff_ffff,
    |r| u24::read(r).map(usize::from),
    |len, out| u24(len as u32).encode(out)
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_u16_roundtrip() {
        let p = PayloadU16::new(vec![1, 2, 3]);
        let enc = p.get_encoding();
        assert_eq!(enc, vec![0, 3, 1, 2, 3]);
        assert_eq!(PayloadU16::read_bytes(&enc), Some(p));
    }

    #[test]
    fn payload_u8_rejects_truncation() {
        assert!(PayloadU8::read_bytes(&[5, 1, 2]).is_none());
    }

    #[test]
    fn payload_u24_roundtrip() {
        let p = PayloadU24::new(vec![9; 300]);
        let enc = p.get_encoding();
        assert_eq!(&enc[..3], &[0, 1, 44]);
        assert_eq!(PayloadU24::read_bytes(&enc), Some(p));
    }
}
