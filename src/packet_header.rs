use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// serialized length of the packet header, checksum byte included
pub const HEADER_LEN: usize = 4;
/// the payload length field is 12 bits wide
pub const MAX_PAYLOAD_LEN: u16 = 0x0FFF;

const SEQ_NUM_MASK: u8 = 0x07;
const ACK_NUM_MASK: u8 = 0x07;
const ACK_NUM_POS: u8 = 3;
const DATA_INTEGRITY_POS: u8 = 6;
const RELIABLE_POS: u8 = 7;
const PACKET_TYPE_MASK: u8 = 0x0F;
const PAYLOAD_LEN_OFFSET: u8 = 4;

/// Packet type tag carried in the header. The numeric values are fixed by the
///  Three-Wire UART specification; `Reset` repurposes the reserved tag 5 for
///  the reset frame sent while establishing the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Ack = 0,
    HciCommand = 1,
    AclData = 2,
    SyncData = 3,
    HciEvent = 4,
    Reset = 5,
    VendorSpecific = 14,
    LinkControl = 15,
}

/// The four-byte packet header: sequence and acknowledgement numbers (3 bits
///  each, modulo 8), a data-integrity flag announcing a trailing CRC16, a
///  reliability flag requesting acknowledgement, the packet type tag, a
///  12 bit payload length, and an 8 bit header checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub seq_num: u8,
    pub ack_num: u8,
    pub data_integrity: bool,
    pub reliable: bool,
    pub packet_type: PacketType,
    pub payload_len: u16,
}

impl PacketHeader {
    pub fn for_payload(
        payload: &[u8],
        seq_num: u8,
        ack_num: u8,
        data_integrity: bool,
        reliable: bool,
        packet_type: PacketType,
    ) -> PacketHeader {
        let payload_len: u16 = payload
            .len()
            .try_into()
            .ok()
            .filter(|&len| len <= MAX_PAYLOAD_LEN)
            .expect("this is a bug: payload must fit the 12 bit length field");

        PacketHeader {
            seq_num,
            ack_num,
            data_integrity,
            reliable,
            packet_type,
            payload_len,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let b0 = (self.seq_num & SEQ_NUM_MASK)
            | ((self.ack_num & ACK_NUM_MASK) << ACK_NUM_POS)
            | ((self.data_integrity as u8) << DATA_INTEGRITY_POS)
            | ((self.reliable as u8) << RELIABLE_POS);
        let b1 = (u8::from(self.packet_type) & PACKET_TYPE_MASK)
            | (((self.payload_len & 0x000F) as u8) << PAYLOAD_LEN_OFFSET);
        let b2 = ((self.payload_len & 0x0FF0) >> PAYLOAD_LEN_OFFSET) as u8;

        buf.put_u8(b0);
        buf.put_u8(b1);
        buf.put_u8(b2);
        buf.put_u8(header_checksum(b0, b1, b2));
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<PacketHeader> {
        if buf.len() < HEADER_LEN {
            bail!("packet is shorter than the header: {} bytes", buf.len());
        }

        let seq_num = buf[0] & SEQ_NUM_MASK;
        let ack_num = (buf[0] >> ACK_NUM_POS) & ACK_NUM_MASK;
        let data_integrity = (buf[0] >> DATA_INTEGRITY_POS) & 0x01 != 0;
        let reliable = (buf[0] >> RELIABLE_POS) & 0x01 != 0;
        let raw_type = buf[1] & PACKET_TYPE_MASK;
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown packet type {}", raw_type))?;
        let payload_len =
            ((buf[1] >> PAYLOAD_LEN_OFFSET) & 0x0F) as u16 | ((buf[2] as u16) << PAYLOAD_LEN_OFFSET);

        if buf[3] != header_checksum(buf[0], buf[1], buf[2]) {
            bail!("header checksum mismatch");
        }

        Ok(PacketHeader {
            seq_num,
            ack_num,
            data_integrity,
            reliable,
            packet_type,
            payload_len,
        })
    }
}

/// Two's complement of the sum of the first three header bytes - the header
///  is self-contained and checkable before the payload length is trusted.
fn header_checksum(b0: u8, b1: u8, b2: u8) -> u8 {
    let sum = (b0 as u16 + b1 as u16 + b2 as u16) & 0xFF;
    (!(sum as u8)).wrapping_add(1)
}

fn crc16(buf: &[u8]) -> u16 {
    let hasher = Crc::<u16>::new(&crc::CRC_16_IBM_3740);
    let mut digest = hasher.digest();
    digest.update(buf);
    digest.finalize()
}

/// A fully decoded packet: validated header plus the bare payload, with the
///  data-integrity CRC already checked and stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

/// Serializes header and payload, appending the CRC16 over both when the
///  header announces data integrity. The CRC is transmitted low byte first.
pub fn encode_packet(header: &PacketHeader, payload: &[u8]) -> BytesMut {
    debug_assert_eq!(header.payload_len as usize, payload.len());

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + 2);
    header.ser(&mut buf);
    buf.put_slice(payload);

    if header.data_integrity {
        let crc = crc16(&buf);
        buf.put_u16_le(crc);
    }

    buf
}

/// Parses and validates a complete packet: header checksum, consistency of
///  the stated payload length with the actual packet size, and the CRC16 when
///  the data-integrity flag is set.
pub fn decode_packet(packet: &[u8]) -> anyhow::Result<DecodedPacket> {
    let header = PacketHeader::deser(packet)?;

    let body_len = HEADER_LEN + header.payload_len as usize;
    let expected_len = body_len + if header.data_integrity { 2 } else { 0 };
    if packet.len() != expected_len {
        bail!(
            "packet length {} does not match the header's announced length {}",
            packet.len(),
            expected_len
        );
    }

    if header.data_integrity {
        let stored = packet[body_len] as u16 | ((packet[body_len + 1] as u16) << 8);
        if stored != crc16(&packet[..body_len]) {
            bail!("packet CRC mismatch");
        }
    }

    Ok(DecodedPacket {
        header,
        payload: packet[HEADER_LEN..body_len].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::sync(
        PacketHeader { seq_num: 0, ack_num: 0, data_integrity: false, reliable: false, packet_type: PacketType::LinkControl, payload_len: 2 },
        vec![0x00, 0x2F, 0x00, 0xD1]
    )]
    #[case::ack(
        PacketHeader { seq_num: 0, ack_num: 5, data_integrity: false, reliable: false, packet_type: PacketType::Ack, payload_len: 0 },
        vec![0x28, 0x00, 0x00, 0xD8]
    )]
    #[case::reliable_vendor(
        PacketHeader { seq_num: 2, ack_num: 3, data_integrity: true, reliable: true, packet_type: PacketType::VendorSpecific, payload_len: 6 },
        vec![0xDA, 0x6E, 0x00, 0xB8]
    )]
    fn test_header_ser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(&buf[..], &expected[..]);

        let deser = PacketHeader::deser(&buf).unwrap();
        assert_eq!(deser, header);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::one(1)]
    #[case::nibble_boundary(16)]
    #[case::long(300)]
    #[case::max(MAX_PAYLOAD_LEN as usize)]
    fn test_header_payload_len_roundtrip(#[case] len: usize) {
        let header = PacketHeader {
            seq_num: 7,
            ack_num: 1,
            data_integrity: false,
            reliable: true,
            packet_type: PacketType::VendorSpecific,
            payload_len: len as u16,
        };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(PacketHeader::deser(&buf).unwrap(), header);
    }

    #[rstest]
    #[case::truncated(vec![0x00, 0x2F, 0x00])]
    #[case::bad_checksum(vec![0x00, 0x2F, 0x00, 0xD2])]
    #[case::unknown_packet_type(vec![0x00, 0x07, 0x00, 0xF9])]
    fn test_header_deser_invalid(#[case] buf: Vec<u8>) {
        assert!(PacketHeader::deser(&buf).is_err());
    }

    #[rstest]
    #[case::without_crc(false)]
    #[case::with_crc(true)]
    fn test_packet_roundtrip(#[case] data_integrity: bool) {
        let payload = vec![0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        let header = PacketHeader::for_payload(
            &payload,
            3,
            4,
            data_integrity,
            true,
            PacketType::VendorSpecific,
        );

        let encoded = encode_packet(&header, &payload);
        assert_eq!(
            encoded.len(),
            HEADER_LEN + payload.len() + if data_integrity { 2 } else { 0 }
        );

        let decoded = decode_packet(&encoded).unwrap();
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.payload, payload);
    }

    #[rstest]
    fn test_packet_crc_mismatch() {
        let payload = vec![0x01, 0x02, 0x03];
        let header =
            PacketHeader::for_payload(&payload, 0, 0, true, true, PacketType::VendorSpecific);

        let mut encoded = encode_packet(&header, &payload).to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        assert!(decode_packet(&encoded).is_err());
    }

    #[rstest]
    #[case::payload_too_short(2)]
    #[case::payload_too_long(4)]
    fn test_packet_length_mismatch(#[case] actual_len: u16) {
        let payload = vec![0x01, 0x02, 0x03];
        let mut header =
            PacketHeader::for_payload(&payload, 0, 0, false, false, PacketType::VendorSpecific);
        header.payload_len = actual_len;

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf.extend_from_slice(&payload);

        assert!(decode_packet(&buf).is_err());
    }
}
