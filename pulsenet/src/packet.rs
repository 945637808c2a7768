//! Wire format: header layout, connect-packet subtypes, and encode/decode/sign/verify.
//!
//! All integers are big-endian, matching the reference implementation's network byte order.
//! Encoding happens into a caller-supplied buffer (no shared scratch state); decoding borrows
//! the incoming datagram slice and copies out only what it needs to keep.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::crypto;
use crate::error::{ErrorKind, NetworkError, NetworkResult};

/// 4(protocol) + 4(id|flags) + 4(seq) + 4(rseq) + 4(ack)
pub const MIN_HEADER_SIZE: usize = 20;
pub const MAX_DATAGRAM_SIZE: usize = 8192;

const FLAG_CONNECT: u32 = 0x8000_0000;
const FLAG_PING: u32 = 0x4000_0000;
const FLAG_NO_REC_CHK: u32 = 0x2000_0000;
const FLAG_RESENDING: u32 = 0x1000_0000;
const ID_MASK: u32 = 0x0FFF_FFFF;

pub const MAX_CONNECTION_ID: u32 = ID_MASK;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct PacketFlags {
    pub connect: bool,
    pub ping: bool,
    pub no_rec_chk: bool,
    pub resending: bool,
}

impl PacketFlags {
    #[inline]
    pub fn heartbeat() -> PacketFlags {
        PacketFlags::default()
    }

    /// The wire marker this lineage uses for "please disconnect me": connect and ping both set.
    #[inline]
    pub fn request_disconnect() -> PacketFlags {
        PacketFlags {
            connect: true,
            ping: true,
            ..Default::default()
        }
    }

    #[inline]
    pub fn connect_packet() -> PacketFlags {
        PacketFlags {
            connect: true,
            ..Default::default()
        }
    }

    #[inline]
    fn encode(self, connection_id: u32) -> u32 {
        let mut bits = connection_id & ID_MASK;
        if self.connect {
            bits |= FLAG_CONNECT;
        }
        if self.ping {
            bits |= FLAG_PING;
        }
        if self.no_rec_chk {
            bits |= FLAG_NO_REC_CHK;
        }
        if self.resending {
            bits |= FLAG_RESENDING;
        }
        bits
    }

    #[inline]
    fn decode(field: u32) -> (PacketFlags, u32) {
        let flags = PacketFlags {
            connect: field & FLAG_CONNECT != 0,
            ping: field & FLAG_PING != 0,
            no_rec_chk: field & FLAG_NO_REC_CHK != 0,
            resending: field & FLAG_RESENDING != 0,
        };
        (flags, field & ID_MASK)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Header {
    pub protocol_id: u32,
    pub connection_id: u32,
    pub flags: PacketFlags,
    pub seq: u32,
    pub rseq: u32,
    pub ack: u32,
}

impl Header {
    #[inline]
    pub fn write<W: Write>(&self, mut stream: W) -> io::Result<()> {
        stream.write_u32::<BigEndian>(self.protocol_id)?;
        stream.write_u32::<BigEndian>(self.flags.encode(self.connection_id))?;
        stream.write_u32::<BigEndian>(self.seq)?;
        stream.write_u32::<BigEndian>(self.rseq)?;
        stream.write_u32::<BigEndian>(self.ack)
    }

    #[inline]
    pub fn read<R: Read>(mut stream: R) -> io::Result<Header> {
        let protocol_id = stream.read_u32::<BigEndian>()?;
        let id_field = stream.read_u32::<BigEndian>()?;
        let seq = stream.read_u32::<BigEndian>()?;
        let rseq = stream.read_u32::<BigEndian>()?;
        let ack = stream.read_u32::<BigEndian>()?;
        let (flags, connection_id) = PacketFlags::decode(id_field);

        Ok(Header {
            protocol_id,
            connection_id,
            flags,
            seq,
            rseq,
            ack,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectSubtype {
    /// Bare connect header, no authentication attempted by either side.
    NoAuth = 0,
    /// Client -> server: client's public key plus a verification message to sign.
    ClientAuth = 1,
    /// Server -> client: server's public key plus a detached signature over that message.
    ServerAuth = 2,
}

impl ConnectSubtype {
    fn from_u32(value: u32) -> Option<ConnectSubtype> {
        match value {
            0 => Some(ConnectSubtype::NoAuth),
            1 => Some(ConnectSubtype::ClientAuth),
            2 => Some(ConnectSubtype::ServerAuth),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum ConnectBody {
    NoAuth,
    ClientAuth {
        client_pk: [u8; crypto::PUBLIC_KEY_SIZE],
        verify_message: Vec<u8>,
    },
    ServerAuth {
        server_pk: [u8; crypto::PUBLIC_KEY_SIZE],
        signature: [u8; crypto::SIGNATURE_SIZE],
    },
}

#[derive(Clone, Debug)]
pub struct ConnectPacket {
    pub header: Header,
    pub body: ConnectBody,
}

#[derive(Clone, Debug)]
pub struct DataPacket {
    pub header: Header,
    pub signature: Option<[u8; crypto::SIGNATURE_SIZE]>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug)]
pub enum Packet {
    Connect(ConnectPacket),
    Data(DataPacket),
}

/// Encodes a connect packet (type 0/1/2) into a fresh buffer.
pub fn encode_connect(packet: &ConnectPacket) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(MIN_HEADER_SIZE + 4 + 32 + 68);
    packet.header.write(&mut buf)?;

    match &packet.body {
        ConnectBody::NoAuth => {
            buf.write_u32::<BigEndian>(ConnectSubtype::NoAuth as u32)?;
        }
        ConnectBody::ClientAuth { client_pk, verify_message } => {
            buf.write_u32::<BigEndian>(ConnectSubtype::ClientAuth as u32)?;
            buf.write_all(client_pk)?;
            buf.write_u32::<BigEndian>(verify_message.len() as u32)?;
            buf.write_all(verify_message)?;
        }
        ConnectBody::ServerAuth { server_pk, signature } => {
            buf.write_u32::<BigEndian>(ConnectSubtype::ServerAuth as u32)?;
            buf.write_all(server_pk)?;
            buf.write_all(signature)?;
        }
    }

    Ok(buf)
}

/// Encodes a non-connect (data/heartbeat) packet, signing the header in place when `signing_key`
/// is supplied.
pub fn encode_data(
    header: &Header,
    payload: &[u8],
    signing_key: Option<&crypto::KeyPair>,
) -> NetworkResult<Vec<u8>> {
    if MIN_HEADER_SIZE + 1 + payload.len() > MAX_DATAGRAM_SIZE {
        return Err(NetworkError::Fatal(ErrorKind::PayloadTooLarge));
    }

    let mut header_bytes = [0u8; MIN_HEADER_SIZE];
    header.write(&mut header_bytes[..])?;

    let mut buf = Vec::with_capacity(MIN_HEADER_SIZE + 1 + crypto::SIGNATURE_SIZE + payload.len());
    buf.extend_from_slice(&header_bytes);

    match signing_key {
        Some(key) => {
            buf.write_u8(1)?;
            buf.extend_from_slice(&key.sign(&header_bytes));
        }
        None => buf.write_u8(0)?,
    }

    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Classifies and decodes an incoming datagram. Rejects anything that doesn't belong to this
/// protocol id outright; deeper validation (signatures, identity, sequence staleness) is the
/// caller's responsibility since it needs per-connection state this module doesn't have.
pub fn decode(datagram: &[u8], expected_protocol_id: u32) -> NetworkResult<Packet> {
    if datagram.len() < MIN_HEADER_SIZE {
        return Err(NetworkError::Fatal(ErrorKind::PacketTooShort));
    }

    let mut cursor = Cursor::new(datagram);
    let header = Header::read(&mut cursor)?;

    if header.protocol_id != expected_protocol_id {
        return Err(NetworkError::Fatal(ErrorKind::ProtocolMismatch));
    }

    if header.flags.connect {
        decode_connect_body(header, &datagram[MIN_HEADER_SIZE..]).map(Packet::Connect)
    } else {
        decode_data_body(header, &datagram[MIN_HEADER_SIZE..]).map(Packet::Data)
    }
}

fn decode_connect_body(header: Header, rest: &[u8]) -> NetworkResult<ConnectPacket> {
    if rest.len() < 4 {
        return Err(NetworkError::Fatal(ErrorKind::PacketTooShort));
    }

    let mut cursor = Cursor::new(rest);
    let subtype_raw = cursor.read_u32::<BigEndian>()?;
    let subtype = ConnectSubtype::from_u32(subtype_raw)
        .ok_or(NetworkError::Fatal(ErrorKind::BadConnectSubtype))?;

    let body = match subtype {
        ConnectSubtype::NoAuth => {
            if cursor.position() as usize != rest.len() {
                return Err(NetworkError::Fatal(ErrorKind::BadConnectSize));
            }
            ConnectBody::NoAuth
        }
        ConnectSubtype::ClientAuth => {
            let mut client_pk = [0u8; crypto::PUBLIC_KEY_SIZE];
            cursor.read_exact(&mut client_pk)?;
            let msg_len = cursor.read_u32::<BigEndian>()? as usize;
            let mut verify_message = vec![0u8; msg_len];
            cursor.read_exact(&mut verify_message)?;
            if cursor.position() as usize != rest.len() {
                return Err(NetworkError::Fatal(ErrorKind::BadConnectSize));
            }
            ConnectBody::ClientAuth { client_pk, verify_message }
        }
        ConnectSubtype::ServerAuth => {
            let mut server_pk = [0u8; crypto::PUBLIC_KEY_SIZE];
            cursor.read_exact(&mut server_pk)?;
            let mut signature = [0u8; crypto::SIGNATURE_SIZE];
            cursor.read_exact(&mut signature)?;
            if cursor.position() as usize != rest.len() {
                return Err(NetworkError::Fatal(ErrorKind::BadConnectSize));
            }
            ConnectBody::ServerAuth { server_pk, signature }
        }
    };

    Ok(ConnectPacket { header, body })
}

fn decode_data_body(header: Header, rest: &[u8]) -> NetworkResult<DataPacket> {
    if rest.is_empty() {
        return Err(NetworkError::Fatal(ErrorKind::PacketTooShort));
    }

    let mut cursor = Cursor::new(rest);
    let signed_flag = cursor.read_u8()?;

    let signature = if signed_flag != 0 {
        let mut sig = [0u8; crypto::SIGNATURE_SIZE];
        cursor.read_exact(&mut sig)?;
        Some(sig)
    } else {
        None
    };

    let mut payload = Vec::new();
    cursor.read_to_end(&mut payload)?;

    Ok(DataPacket { header, signature, payload })
}

/// Verifies a signed data packet's signature against the 20-byte header bytes that were signed.
pub fn verify_data_signature(packet: &DataPacket, peer_pk: &[u8; crypto::PUBLIC_KEY_SIZE]) -> NetworkResult<()> {
    let signature = packet.signature.as_ref().ok_or(NetworkError::Fatal(ErrorKind::SignatureInvalid))?;

    let mut header_bytes = [0u8; MIN_HEADER_SIZE];
    packet.header.write(&mut header_bytes[..])?;

    if crypto::verify(peer_pk, &header_bytes, signature) {
        Ok(())
    } else {
        Err(NetworkError::Fatal(ErrorKind::SignatureInvalid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            protocol_id: 0x50f0_4948,
            connection_id: 42,
            flags: PacketFlags::default(),
            seq: 7,
            rseq: 6,
            ack: 0xFFFF_FFFF,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        assert_eq!(buf.len(), MIN_HEADER_SIZE);

        let decoded = Header::read(&buf[..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn flags_survive_round_trip_alongside_connection_id() {
        let mut header = sample_header();
        header.flags = PacketFlags::request_disconnect();
        header.connection_id = MAX_CONNECTION_ID;

        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        let decoded = Header::read(&buf[..]).unwrap();

        assert_eq!(decoded.connection_id, MAX_CONNECTION_ID);
        assert!(decoded.flags.connect);
        assert!(decoded.flags.ping);
        assert!(!decoded.flags.no_rec_chk);
    }

    #[test]
    fn decode_rejects_wrong_protocol_id() {
        let header = sample_header();
        let encoded = encode_data(&header, b"", None).unwrap();

        let err = decode(&encoded, header.protocol_id.wrapping_add(1)).unwrap_err();
        assert_eq!(err, NetworkError::Fatal(ErrorKind::ProtocolMismatch));
    }

    #[test]
    fn decode_rejects_short_packet() {
        let err = decode(&[1, 2, 3], 1).unwrap_err();
        assert_eq!(err, NetworkError::Fatal(ErrorKind::PacketTooShort));
    }

    #[test]
    fn data_packet_round_trips_with_payload() {
        let mut header = sample_header();
        header.flags = PacketFlags::default();
        let payload = b"hello pulsenet";

        let encoded = encode_data(&header, payload, None).unwrap();
        match decode(&encoded, header.protocol_id).unwrap() {
            Packet::Data(data) => {
                assert_eq!(data.header, header);
                assert_eq!(data.signature, None);
                assert_eq!(data.payload, payload);
            }
            Packet::Connect(_) => panic!("expected a data packet"),
        }
    }

    #[test]
    fn signed_data_packet_verifies() {
        let keys = crypto::KeyPair::generate(&mut rand::rngs::OsRng);
        let mut header = sample_header();
        header.flags = PacketFlags::default();

        let encoded = encode_data(&header, b"payload", Some(&keys)).unwrap();
        match decode(&encoded, header.protocol_id).unwrap() {
            Packet::Data(data) => {
                assert!(verify_data_signature(&data, &keys.public_key()).is_ok());
            }
            Packet::Connect(_) => panic!("expected a data packet"),
        }
    }

    #[test]
    fn unsigned_data_packet_fails_verification() {
        let keys = crypto::KeyPair::generate(&mut rand::rngs::OsRng);
        let header = sample_header();

        let encoded = encode_data(&header, b"payload", None).unwrap();
        match decode(&encoded, header.protocol_id).unwrap() {
            Packet::Data(data) => {
                let err = verify_data_signature(&data, &keys.public_key()).unwrap_err();
                assert_eq!(err, NetworkError::Fatal(ErrorKind::SignatureInvalid));
            }
            Packet::Connect(_) => panic!("expected a data packet"),
        }
    }

    #[test]
    fn signature_from_wrong_key_is_rejected() {
        let keys = crypto::KeyPair::generate(&mut rand::rngs::OsRng);
        let other = crypto::KeyPair::generate(&mut rand::rngs::OsRng);
        let header = sample_header();

        let encoded = encode_data(&header, b"payload", Some(&keys)).unwrap();
        match decode(&encoded, header.protocol_id).unwrap() {
            Packet::Data(data) => {
                let err = verify_data_signature(&data, &other.public_key()).unwrap_err();
                assert_eq!(err, NetworkError::Fatal(ErrorKind::SignatureInvalid));
            }
            Packet::Connect(_) => panic!("expected a data packet"),
        }
    }

    #[test]
    fn connect_no_auth_round_trips() {
        let mut header = sample_header();
        header.flags = PacketFlags::connect_packet();
        let packet = ConnectPacket { header, body: ConnectBody::NoAuth };

        let encoded = encode_connect(&packet).unwrap();
        match decode(&encoded, header.protocol_id).unwrap() {
            Packet::Connect(decoded) => {
                assert_eq!(decoded.header, header);
                assert!(matches!(decoded.body, ConnectBody::NoAuth));
            }
            Packet::Data(_) => panic!("expected a connect packet"),
        }
    }

    #[test]
    fn connect_client_auth_round_trips() {
        let mut header = sample_header();
        header.flags = PacketFlags::connect_packet();
        let packet = ConnectPacket {
            header,
            body: ConnectBody::ClientAuth {
                client_pk: [7u8; crypto::PUBLIC_KEY_SIZE],
                verify_message: b"2026-07-26T00:00:00Z".to_vec(),
            },
        };

        let encoded = encode_connect(&packet).unwrap();
        match decode(&encoded, header.protocol_id).unwrap() {
            Packet::Connect(decoded) => match decoded.body {
                ConnectBody::ClientAuth { client_pk, verify_message } => {
                    assert_eq!(client_pk, [7u8; crypto::PUBLIC_KEY_SIZE]);
                    assert_eq!(verify_message, b"2026-07-26T00:00:00Z");
                }
                _ => panic!("expected ClientAuth"),
            },
            Packet::Data(_) => panic!("expected a connect packet"),
        }
    }

    #[test]
    fn decode_rejects_bad_connect_subtype() {
        let mut header = sample_header();
        header.flags = PacketFlags::connect_packet();
        let mut buf = Vec::new();
        header.write(&mut buf).unwrap();
        buf.write_u32::<BigEndian>(99).unwrap();

        let err = decode(&buf, header.protocol_id).unwrap_err();
        assert_eq!(err, NetworkError::Fatal(ErrorKind::BadConnectSubtype));
    }

    #[test]
    fn payload_over_max_datagram_size_is_rejected() {
        let header = sample_header();
        let oversized = vec![0u8; MAX_DATAGRAM_SIZE];

        let err = encode_data(&header, &oversized, None).unwrap_err();
        assert_eq!(err, NetworkError::Fatal(ErrorKind::PayloadTooLarge));
    }
}
