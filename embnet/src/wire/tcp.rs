//! TCP sequence numbers and segment header layout.
use core::{fmt, ops};

use byteorder::{ByteOrder, NetworkEndian};

use super::ipv4::{Address, Protocol};
use super::{checksum, Error, Result};

/// A TCP sequence number.
///
/// Sequence numbers are 32-bit counters in modular arithmetic. The signed
/// inner representation makes the wrapping comparisons direct: `a < b` holds
/// exactly when the wrapping difference `a - b` is negative, which is valid
/// whenever the two numbers are within half the sequence space of each
/// other.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct SeqNumber(pub i32);

impl SeqNumber {
    /// The wrapping comparison `self < other`.
    pub fn lt(self, other: SeqNumber) -> bool {
        self.0.wrapping_sub(other.0) < 0
    }

    /// The wrapping comparison `self <= other`.
    pub fn le(self, other: SeqNumber) -> bool {
        self.0.wrapping_sub(other.0) <= 0
    }

    /// The wrapping comparison `self > other`.
    pub fn gt(self, other: SeqNumber) -> bool {
        self.0.wrapping_sub(other.0) > 0
    }

    /// The wrapping comparison `self >= other`.
    pub fn ge(self, other: SeqNumber) -> bool {
        self.0.wrapping_sub(other.0) >= 0
    }

    /// Whether `self` lies in `[begin, end)` in wrapping order.
    pub fn within(self, begin: SeqNumber, end: SeqNumber) -> bool {
        self.ge(begin) && self.lt(end)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        debug_assert!(rhs <= i32::max_value() as usize);
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub for SeqNumber {
    type Output = usize;

    /// The wrapping distance from `rhs` up to `self`.
    ///
    /// # Panics
    ///
    /// Panics when `self` is before `rhs`.
    fn sub(self, rhs: SeqNumber) -> usize {
        let result = self.0.wrapping_sub(rhs.0);
        assert!(result >= 0, "sequence distance taken backwards");
        result as usize
    }
}

/// The control flags of a segment.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Flags(u8);

impl Flags {
    /// No flags set.
    pub const EMPTY: Flags = Flags(0);
    /// The sender has finished sending.
    pub const FIN: Flags = Flags(0x01);
    /// Synchronize sequence numbers.
    pub const SYN: Flags = Flags(0x02);
    /// Reset the connection.
    pub const RST: Flags = Flags(0x04);
    /// Push buffered data to the application.
    pub const PSH: Flags = Flags(0x08);
    /// The acknowledgment number is significant.
    pub const ACK: Flags = Flags(0x10);

    /// Whether all flags of `other` are set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag of `other` is set in `self`.
    pub fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    /// The amount of sequence space the flags occupy.
    ///
    /// SYN and FIN each consume one sequence number.
    pub fn sequence_len(self) -> usize {
        usize::from(self.contains(Flags::SYN)) + usize::from(self.contains(Flags::FIN))
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &(flag, name) in &[
            (Flags::SYN, "SYN"), (Flags::FIN, "FIN"), (Flags::RST, "RST"),
            (Flags::PSH, "PSH"), (Flags::ACK, "ACK"),
        ] {
            if self.contains(flag) {
                write!(f, "{} ", name)?;
            }
        }
        Ok(())
    }
}

byte_wrapper! {
    /// A byte sequence that forms a TCP segment.
    #[derive(Debug, PartialEq, Eq)]
    pub struct Packet([u8]);
}

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WIN_SIZE: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const OPT_END: u8 = 0;
    pub const OPT_NOP: u8 = 1;
    pub const OPT_MSS: u8 = 2;
}

/// The length of a TCP header without options.
pub const HEADER_LEN: usize = field::URGENT.end;

impl Packet {
    /// Interpret a byte slice as a segment without validity checks.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Interpret a mutable byte slice as a segment without validity checks.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Interpret a byte slice as a segment, checking structural validity.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let packet = Self::new_unchecked(data);
        let header_len = packet.header_len();
        if header_len < HEADER_LEN || header_len > data.len() {
            return Err(Error::Malformed);
        }
        Ok(packet)
    }

    /// Like [`new_checked`], for a mutable slice.
    ///
    /// [`new_checked`]: #method.new_checked
    pub fn new_checked_mut(data: &mut [u8]) -> Result<&mut Self> {
        Self::new_checked(&data[..])?;
        Ok(Self::new_unchecked_mut(data))
    }

    /// Return the source port field.
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the sequence number field.
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::SEQ_NUM]))
    }

    /// Return the acknowledgment number field.
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::ACK_NUM]))
    }

    /// Return the control flags.
    pub fn flags(&self) -> Flags {
        Flags((NetworkEndian::read_u16(&self.0[field::FLAGS]) & 0x3f) as u8)
    }

    /// Return the header length in bytes, as given by the data offset.
    pub fn header_len(&self) -> usize {
        usize::from(self.0[field::FLAGS.start] >> 4) * 4
    }

    /// Return the window size field.
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::WIN_SIZE])
    }

    /// The maximum segment size option, if present.
    pub fn max_seg_size(&self) -> Option<u16> {
        let mut options = &self.0[HEADER_LEN..self.header_len()];
        while let Some(&kind) = options.first() {
            match kind {
                field::OPT_END => break,
                field::OPT_NOP => options = &options[1..],
                _ => {
                    let len = usize::from(*options.get(1)?);
                    if len < 2 || len > options.len() {
                        break;
                    }
                    if kind == field::OPT_MSS && len == 4 {
                        return Some(NetworkEndian::read_u16(&options[2..4]));
                    }
                    options = &options[len..];
                },
            }
        }
        None
    }

    /// Verify the segment checksum over a contiguous payload.
    pub fn verify_checksum(&self, src_addr: Address, dst_addr: Address) -> bool {
        let pseudo = checksum::pseudo_header(
            src_addr, dst_addr, Protocol::Tcp, self.0.len() as u32);
        checksum::combine(&[pseudo, checksum::data(&self.0)]) == !0
    }

    /// Set the source port field.
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SRC_PORT], value)
    }

    /// Set the destination port field.
    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::DST_PORT], value)
    }

    /// Set the sequence number field.
    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.0[field::SEQ_NUM], value.0)
    }

    /// Set the acknowledgment number field.
    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.0[field::ACK_NUM], value.0)
    }

    /// Set the control flags, preserving the data offset.
    pub fn set_flags(&mut self, value: Flags) {
        let raw = NetworkEndian::read_u16(&self.0[field::FLAGS]) & !0x3f;
        NetworkEndian::write_u16(&mut self.0[field::FLAGS], raw | u16::from(value.0))
    }

    /// Set the data offset from a header length in bytes.
    pub fn set_header_len(&mut self, value: usize) {
        debug_assert!(value % 4 == 0 && value >= HEADER_LEN);
        self.0[field::FLAGS.start] =
            (self.0[field::FLAGS.start] & 0x0f) | ((value / 4) as u8) << 4;
    }

    /// Set the window size field.
    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::WIN_SIZE], value)
    }

    /// Set the urgent pointer field.
    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::URGENT], value)
    }

    /// Write a maximum segment size option directly after the fixed header.
    ///
    /// The data offset must already account for the four option bytes.
    pub fn set_max_seg_size(&mut self, value: u16) {
        let options = &mut self.0[HEADER_LEN..HEADER_LEN + 4];
        options[0] = field::OPT_MSS;
        options[1] = 4;
        NetworkEndian::write_u16(&mut options[2..4], value);
    }

    /// Set the checksum field to a precomputed value.
    ///
    /// Used when the payload is not contiguous with the header and the sum
    /// was accumulated over the pieces.
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Compute and fill in the checksum over a contiguous payload.
    pub fn fill_checksum(&mut self, src_addr: Address, dst_addr: Address) {
        self.set_checksum(0);
        let pseudo = checksum::pseudo_header(
            src_addr, dst_addr, Protocol::Tcp, self.0.len() as u32);
        let sum = !checksum::combine(&[pseudo, checksum::data(&self.0)]);
        self.set_checksum(sum);
    }

    /// The partial checksum over the header and any contiguous payload.
    ///
    /// The checksum field itself must currently be zero.
    pub fn partial_checksum(&self) -> u16 {
        debug_assert_eq!(NetworkEndian::read_u16(&self.0[field::CHECKSUM]), 0);
        checksum::data(&self.0)
    }

    /// Return the payload following the header and options.
    pub fn payload(&self) -> &[u8] {
        &self.0[self.header_len()..]
    }

    /// Return the payload following the header and options, mutably.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.0[header_len..]
    }
}

/// A high-level representation of a TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    /// The port of the sender.
    pub src_port: u16,
    /// The port of the recipient.
    pub dst_port: u16,
    /// The sequence number of the first payload byte.
    pub seq_number: SeqNumber,
    /// The acknowledgment number, when the ACK flag is set.
    pub ack_number: Option<SeqNumber>,
    /// The control flags, with ACK implied by `ack_number`.
    pub flags: Flags,
    /// The advertised receive window.
    pub window_len: u16,
    /// The maximum segment size option, sent on SYN segments.
    pub max_seg_size: Option<u16>,
}

impl Repr {
    /// The header length needed to emit this representation.
    pub fn header_len(&self) -> usize {
        HEADER_LEN + if self.max_seg_size.is_some() { 4 } else { 0 }
    }

    /// Parse a structurally valid segment into its representation.
    pub fn parse(packet: &Packet) -> Result<Repr> {
        let flags = packet.flags();
        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq_number: packet.seq_number(),
            ack_number: if flags.contains(Flags::ACK) {
                Some(packet.ack_number())
            } else {
                None
            },
            flags,
            window_len: packet.window_len(),
            max_seg_size: packet.max_seg_size(),
        })
    }

    /// Emit the representation into a segment header.
    ///
    /// The checksum is not filled in; it depends on the payload.
    pub fn emit(&self, packet: &mut Packet) {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_header_len(self.header_len());
        let mut flags = self.flags;
        if self.ack_number.is_some() {
            flags |= Flags::ACK;
        }
        packet.set_flags(flags);
        packet.set_window_len(self.window_len);
        packet.set_checksum(0);
        packet.set_urgent_at(0);
        if let Some(mss) = self.max_seg_size {
            packet.set_max_seg_size(mss);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SYN_BYTES: [u8; 24] = [
        0x30, 0x39, 0x00, 0x50,
        0x00, 0x00, 0x00, 0x64,
        0x00, 0x00, 0x00, 0x00,
        0x60, 0x02, 0x10, 0x00,
        0x00, 0x00, 0x00, 0x00,
        0x02, 0x04, 0x02, 0x18,
    ];

    fn syn_repr() -> Repr {
        Repr {
            src_port: 12345,
            dst_port: 80,
            seq_number: SeqNumber(100),
            ack_number: None,
            flags: Flags::SYN,
            window_len: 4096,
            max_seg_size: Some(536),
        }
    }

    #[test]
    fn parse_syn_with_mss() {
        let packet = Packet::new_checked(&SYN_BYTES[..]).unwrap();
        assert_eq!(packet.header_len(), 24);
        assert_eq!(Repr::parse(packet).unwrap(), syn_repr());
    }

    #[test]
    fn emit_syn_with_mss() {
        let mut bytes = [0u8; 24];
        syn_repr().emit(Packet::new_unchecked_mut(&mut bytes[..]));
        assert_eq!(bytes, SYN_BYTES);
    }

    #[test]
    fn mss_after_nop_padding() {
        let mut bytes = SYN_BYTES;
        // Replace the MSS option with NOP NOP MSS truncated: NOPs only.
        bytes[20..24].copy_from_slice(&[1, 1, 1, 1]);
        let packet = Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.max_seg_size(), None);
    }

    #[test]
    fn parse_data_segment_without_ack() {
        // A bare data segment carries no control flags other than PSH and
        // no acknowledgment; it still parses.
        let mut bytes = [0u8; 25];
        Repr {
            src_port: 1, dst_port: 2,
            seq_number: SeqNumber(7), ack_number: None,
            flags: Flags::PSH, window_len: 64,
            max_seg_size: None,
        }.emit(Packet::new_unchecked_mut(&mut bytes[..20]));
        bytes[20..].copy_from_slice(b"abcde");

        let packet = Packet::new_checked(&bytes[..]).unwrap();
        let repr = Repr::parse(packet).unwrap();
        assert_eq!(repr.flags, Flags::PSH);
        assert_eq!(repr.ack_number, None);
        assert_eq!(repr.seq_number, SeqNumber(7));
    }

    #[test]
    fn checksum_round_trip() {
        let src = Address([10, 0, 0, 1]);
        let dst = Address([10, 0, 0, 2]);
        let mut bytes = [0u8; 23];
        Repr {
            src_port: 1, dst_port: 2,
            seq_number: SeqNumber(7), ack_number: Some(SeqNumber(9)),
            flags: Flags::PSH, window_len: 64,
            max_seg_size: None,
        }.emit(Packet::new_unchecked_mut(&mut bytes[..20]));
        bytes[20..].copy_from_slice(b"abc");
        let packet = Packet::new_unchecked_mut(&mut bytes[..]);
        packet.fill_checksum(src, dst);
        assert!(packet.verify_checksum(src, dst));
        assert_eq!(packet.payload(), b"abc");
    }

    #[test]
    fn sequence_arithmetic() {
        let near_wrap = SeqNumber(i32::max_value());
        let wrapped = near_wrap + 100;
        assert!(near_wrap.lt(wrapped));
        assert_eq!(wrapped - near_wrap, 100);
        assert!(SeqNumber(100).within(SeqNumber(100), SeqNumber(200)));
        assert!(!SeqNumber(200).within(SeqNumber(100), SeqNumber(200)));
    }

    #[test]
    fn flag_sequence_space() {
        assert_eq!(Flags::SYN.sequence_len(), 1);
        assert_eq!((Flags::FIN | Flags::ACK | Flags::PSH).sequence_len(), 1);
        assert_eq!((Flags::SYN | Flags::FIN).sequence_len(), 2);
        assert_eq!(Flags::ACK.sequence_len(), 0);
    }
}
