#![allow(clippy::upper_case_acronyms)]
/// Enumerations of on-wire protocol values.
///
/// Every enum keeps unknown discriminants rather than failing the parse;
/// legality of an unknown value is a question for the state machine, not
/// the codec.
use crate::msgs::codec::{put_u16, Codec, Reader};

macro_rules! enum_builder {
    (
        $(#[$comment:meta])*
        @U8
        EnumName: $name:ident;
        EnumVal { $( $var:ident => $val:expr ),* }
    ) => {
        $(#[$comment])*
        #[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
        pub enum $name {
            $( $var ),*
            ,Unknown(u8)
        }

        impl $name {
            pub fn get_u8(&self) -> u8 {
                match *self {
                    $( $name::$var => $val),*
                    ,$name::Unknown(x) => x,
                }
            }
        }

        impl Codec for $name {
            fn encode(&self, bytes: &mut Vec<u8>) {
                bytes.push(self.get_u8());
            }

            fn read(r: &mut Reader) -> Option<Self> {
                u8::read(r).map(|x| match x {
                    $( $val => $name::$var),*
                    , x => $name::Unknown(x),
                })
            }
        }
    };
    (
        $(#[$comment:meta])*
        @U16
        EnumName: $name:ident;
        EnumVal { $( $var:ident => $val:expr ),* }
    ) => {
        $(#[$comment])*
        #[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
        pub enum $name {
            $( $var ),*
            ,Unknown(u16)
        }

        impl $name {
            pub fn get_u16(&self) -> u16 {
                match *self {
                    $( $name::$var => $val),*
                    ,$name::Unknown(x) => x,
                }
            }
        }

        impl Codec for $name {
            fn encode(&self, bytes: &mut Vec<u8>) {
                put_u16(self.get_u16(), bytes);
            }

            fn read(r: &mut Reader) -> Option<Self> {
                u16::read(r).map(|x| match x {
                    $( $val => $name::$var),*
                    , x => $name::Unknown(x),
                })
            }
        }
    };
}

enum_builder! {
    /// Record-layer content types.
    @U8
    EnumName: ContentType;
    EnumVal {
        ChangeCipherSpec => 20,
        Alert => 21,
        Handshake => 22,
        ApplicationData => 23,
        Heartbeat => 24
    }
}

enum_builder! {
    @U16
    EnumName: ProtocolVersion;
    EnumVal {
        SSLv2 => 0x0002,
        SSLv3 => 0x0300,
        TLSv1_0 => 0x0301,
        TLSv1_1 => 0x0302,
        TLSv1_2 => 0x0303,
        TLSv1_3 => 0x0304,
        DTLSv1_0 => 0xfeff,
        DTLSv1_2 => 0xfefd,
        DTLSv1_3 => 0xfefc
    }
}

impl ProtocolVersion {
    pub fn is_dtls(&self) -> bool {
        matches!(
            self,
            ProtocolVersion::DTLSv1_0 | ProtocolVersion::DTLSv1_2 | ProtocolVersion::DTLSv1_3
        )
    }

    pub fn is_tls13_family(&self) -> bool {
        matches!(
            self,
            ProtocolVersion::TLSv1_3 | ProtocolVersion::DTLSv1_3
        )
    }
}

enum_builder! {
    @U8
    EnumName: HandshakeType;
    EnumVal {
        HelloRequest => 0,
        ClientHello => 1,
        ServerHello => 2,
        HelloVerifyRequest => 3,
        NewSessionTicket => 4,
        EndOfEarlyData => 5,
        EncryptedExtensions => 8,
        Certificate => 11,
        ServerKeyExchange => 12,
        CertificateRequest => 13,
        ServerHelloDone => 14,
        CertificateVerify => 15,
        ClientKeyExchange => 16,
        Finished => 20,
        CertificateStatus => 22,
        KeyUpdate => 24,
        MessageHash => 254
    }
}

enum_builder! {
    @U8
    EnumName: AlertLevel;
    EnumVal {
        Warning => 1,
        Fatal => 2
    }
}

enum_builder! {
    @U8
    EnumName: AlertDescription;
    EnumVal {
        CloseNotify => 0,
        UnexpectedMessage => 10,
        BadRecordMac => 20,
        DecryptionFailed => 21,
        RecordOverflow => 22,
        DecompressionFailure => 30,
        HandshakeFailure => 40,
        NoCertificate => 41,
        BadCertificate => 42,
        UnsupportedCertificate => 43,
        CertificateRevoked => 44,
        CertificateExpired => 45,
        CertificateUnknown => 46,
        IllegalParameter => 47,
        UnknownCA => 48,
        AccessDenied => 49,
        DecodeError => 50,
        DecryptError => 51,
        ExportRestriction => 60,
        ProtocolVersion => 70,
        InsufficientSecurity => 71,
        InternalError => 80,
        InappropriateFallback => 86,
        UserCanceled => 90,
        NoRenegotiation => 100,
        MissingExtension => 109,
        UnsupportedExtension => 110,
        UnrecognisedName => 112,
        BadCertificateStatusResponse => 113,
        UnknownPSKIdentity => 115,
        CertificateRequired => 116,
        NoApplicationProtocol => 120
    }
}

enum_builder! {
    @U16
    EnumName: CipherSuite;
    EnumVal {
        TLS_RSA_WITH_AES_128_GCM_SHA256 => 0x009c,
        TLS_RSA_WITH_AES_256_GCM_SHA384 => 0x009d,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => 0xc02b,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => 0xc02c,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => 0xc02f,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => 0xc030,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => 0xcca8,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => 0xcca9,
        TLS13_AES_128_GCM_SHA256 => 0x1301,
        TLS13_AES_256_GCM_SHA384 => 0x1302,
        TLS13_CHACHA20_POLY1305_SHA256 => 0x1303,
        TLS_EMPTY_RENEGOTIATION_INFO_SCSV => 0x00ff
    }
}

enum_builder! {
    @U8
    EnumName: Compression;
    EnumVal {
        Null => 0,
        Deflate => 1
    }
}

enum_builder! {
    @U16
    EnumName: NamedGroup;
    EnumVal {
        secp256r1 => 0x0017,
        secp384r1 => 0x0018,
        secp521r1 => 0x0019,
        X25519 => 0x001d,
        X448 => 0x001e
    }
}

enum_builder! {
    @U16
    EnumName: SignatureScheme;
    EnumVal {
        RSA_PKCS1_SHA256 => 0x0401,
        RSA_PKCS1_SHA384 => 0x0501,
        RSA_PKCS1_SHA512 => 0x0601,
        ECDSA_NISTP256_SHA256 => 0x0403,
        ECDSA_NISTP384_SHA384 => 0x0503,
        RSA_PSS_SHA256 => 0x0804,
        RSA_PSS_SHA384 => 0x0805,
        RSA_PSS_SHA512 => 0x0806,
        ED25519 => 0x0807
    }
}

enum_builder! {
    @U16
    EnumName: ExtensionType;
    EnumVal {
        ServerName => 0,
        StatusRequest => 5,
        EllipticCurves => 10,
        ECPointFormats => 11,
        SignatureAlgorithms => 13,
        ALProtocolNegotiation => 16,
        SCT => 18,
        ExtendedMasterSecret => 23,
        SessionTicket => 35,
        PreSharedKey => 41,
        EarlyData => 42,
        SupportedVersions => 43,
        Cookie => 44,
        PSKKeyExchangeModes => 45,
        CertificateAuthorities => 47,
        SignatureAlgorithmsCert => 50,
        KeyShare => 51,
        RenegotiationInfo => 0xff01
    }
}

enum_builder! {
    @U8
    EnumName: ECPointFormat;
    EnumVal {
        Uncompressed => 0
    }
}

enum_builder! {
    @U8
    EnumName: PSKKeyExchangeMode;
    EnumVal {
        PSK_KE => 0,
        PSK_DHE_KE => 1
    }
}

enum_builder! {
    @U8
    EnumName: KeyUpdateRequest;
    EnumVal {
        UpdateNotRequested => 0,
        UpdateRequested => 1
    }
}

enum_builder! {
    @U8
    EnumName: ClientCertificateType;
    EnumVal {
        RSASign => 1,
        ECDSASign => 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::codec::{Codec, Reader};

    #[test]
    fn unknown_values_survive_roundtrip() {
        let ct = ContentType::read_bytes(&[99]).unwrap();
        assert_eq!(ct, ContentType::Unknown(99));
        assert_eq!(ct.get_encoding(), vec![99]);

        let cs = CipherSuite::read(&mut Reader::init(&[0x13, 0x99])).unwrap();
        assert_eq!(cs, CipherSuite::Unknown(0x1399));
    }

    #[test]
    fn known_values_map() {
        assert_eq!(ContentType::read_bytes(&[22]), Some(ContentType::Handshake));
        assert_eq!(ProtocolVersion::TLSv1_3.get_u16(), 0x0304);
        assert_eq!(ProtocolVersion::DTLSv1_2.get_u16(), 0xfefd);
        assert!(ProtocolVersion::DTLSv1_3.is_dtls());
        assert!(!ProtocolVersion::TLSv1_2.is_dtls());
    }
}
