//! ICMPv4 message layout, limited to echo and destination unreachable.
use byteorder::{ByteOrder, NetworkEndian};

use super::{checksum, Error, Result};

enum_with_unknown! {
    /// The type of an ICMPv4 message.
    pub enum Message(u8) {
        EchoReply = 0,
        DstUnreachable = 3,
        EchoRequest = 8,
    }
}

/// Destination unreachable code: the transport protocol is not handled.
pub const UNREACH_PROTOCOL: u8 = 2;
/// Destination unreachable code: no listener on the destination port.
pub const UNREACH_PORT: u8 = 3;

byte_wrapper! {
    /// A byte sequence that forms an ICMPv4 message.
    #[derive(Debug, PartialEq, Eq)]
    pub struct Packet([u8]);
}

mod field {
    use crate::wire::field::*;

    pub const TYPE: usize = 0;
    pub const CODE: usize = 1;
    pub const CHECKSUM: Field = 2..4;
    /// Echo identifier, or unused in destination unreachable.
    pub const IDENT: Field = 4..6;
    /// Echo sequence number, or unused in destination unreachable.
    pub const SEQ_NO: Field = 6..8;
    pub const DATA: FieldFrom = 8..;
}

/// The length of the fixed part of a message.
pub const HEADER_LEN: usize = field::DATA.start;

impl Packet {
    /// Interpret a byte slice as a message without length checks.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Interpret a mutable byte slice as a message without length checks.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Interpret a byte slice as a message, checking length and checksum.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let packet = Self::new_unchecked(data);
        if !packet.verify_checksum() {
            return Err(Error::Malformed);
        }
        Ok(packet)
    }

    /// Return the message type field.
    pub fn msg_type(&self) -> Message {
        self.0[field::TYPE].into()
    }

    /// Return the message code field.
    pub fn msg_code(&self) -> u8 {
        self.0[field::CODE]
    }

    /// Return the echo identifier field.
    pub fn echo_ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::IDENT])
    }

    /// Return the echo sequence number field.
    pub fn echo_seq_no(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SEQ_NO])
    }

    /// Return the data following the fixed header.
    pub fn data(&self) -> &[u8] {
        &self.0[field::DATA]
    }

    /// Verify the message checksum, computed over the whole message.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0) == !0
    }

    /// Set the message type field.
    pub fn set_msg_type(&mut self, value: Message) {
        self.0[field::TYPE] = value.into()
    }

    /// Set the message code field.
    pub fn set_msg_code(&mut self, value: u8) {
        self.0[field::CODE] = value
    }

    /// Set the echo identifier field.
    pub fn set_echo_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::IDENT], value)
    }

    /// Set the echo sequence number field.
    pub fn set_echo_seq_no(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::SEQ_NO], value)
    }

    /// Return the data following the fixed header, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0[field::DATA]
    }

    /// Compute and fill in the message checksum.
    pub fn fill_checksum(&mut self) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], 0);
        let sum = !checksum::data(&self.0);
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], sum);
    }
}
