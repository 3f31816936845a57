//! The address resolution protocol for IPv4 over Ethernet.
use byteorder::{ByteOrder, NetworkEndian};

use super::ethernet::Address as EthernetAddress;
use super::ipv4::Address as Ipv4Address;
use super::{Error, Result};

enum_with_unknown! {
    /// The operation field of an ARP packet.
    pub enum Operation(u16) {
        Request = 1,
        Reply = 2,
    }
}

byte_wrapper! {
    /// A byte sequence that forms an ARP packet.
    #[derive(Debug, PartialEq, Eq)]
    pub struct Packet([u8]);
}

mod field {
    use crate::wire::field::*;

    pub const HTYPE: Field = 0..2;
    pub const PTYPE: Field = 2..4;
    pub const HLEN: usize = 4;
    pub const PLEN: usize = 5;
    pub const OPER: Field = 6..8;
    pub const SHA: Field = 8..14;
    pub const SPA: Field = 14..18;
    pub const THA: Field = 18..24;
    pub const TPA: Field = 24..28;
}

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;

/// The length of an Ethernet/IPv4 ARP packet.
pub const PACKET_LEN: usize = field::TPA.end;

impl Packet {
    /// Interpret a byte slice as a packet without length checks.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Interpret a mutable byte slice as a packet without length checks.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Interpret a byte slice as a packet, checking the length.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        if data.len() < PACKET_LEN {
            return Err(Error::Truncated);
        }
        Ok(Self::new_unchecked(data))
    }

    /// Like [`new_checked`], for a mutable slice.
    ///
    /// [`new_checked`]: #method.new_checked
    pub fn new_checked_mut(data: &mut [u8]) -> Result<&mut Self> {
        Self::new_checked(&data[..])?;
        Ok(Self::new_unchecked_mut(data))
    }

    fn hardware_type(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::HTYPE])
    }

    fn protocol_type(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::PTYPE])
    }

    /// Return the operation field.
    pub fn operation(&self) -> Operation {
        NetworkEndian::read_u16(&self.0[field::OPER]).into()
    }

    /// Return the source hardware address field.
    pub fn source_hardware_addr(&self) -> EthernetAddress {
        EthernetAddress::from_bytes(&self.0[field::SHA])
    }

    /// Return the source protocol address field.
    pub fn source_protocol_addr(&self) -> Ipv4Address {
        Ipv4Address::from_bytes(&self.0[field::SPA])
    }

    /// Return the target hardware address field.
    pub fn target_hardware_addr(&self) -> EthernetAddress {
        EthernetAddress::from_bytes(&self.0[field::THA])
    }

    /// Return the target protocol address field.
    pub fn target_protocol_addr(&self) -> Ipv4Address {
        Ipv4Address::from_bytes(&self.0[field::TPA])
    }

    /// Set the operation field.
    pub fn set_operation(&mut self, value: Operation) {
        NetworkEndian::write_u16(&mut self.0[field::OPER], value.into())
    }

    /// Set the source hardware address field.
    pub fn set_source_hardware_addr(&mut self, value: EthernetAddress) {
        self.0[field::SHA].copy_from_slice(value.as_bytes())
    }

    /// Set the source protocol address field.
    pub fn set_source_protocol_addr(&mut self, value: Ipv4Address) {
        self.0[field::SPA].copy_from_slice(value.as_bytes())
    }

    /// Set the target hardware address field.
    pub fn set_target_hardware_addr(&mut self, value: EthernetAddress) {
        self.0[field::THA].copy_from_slice(value.as_bytes())
    }

    /// Set the target protocol address field.
    pub fn set_target_protocol_addr(&mut self, value: Ipv4Address) {
        self.0[field::TPA].copy_from_slice(value.as_bytes())
    }
}

/// A high-level representation of an Ethernet/IPv4 ARP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    /// Whether this is a request or a reply.
    pub operation: Operation,
    /// The Ethernet address of the sender.
    pub source_hardware_addr: EthernetAddress,
    /// The IPv4 address of the sender.
    pub source_protocol_addr: Ipv4Address,
    /// The Ethernet address of the target, ignored in requests.
    pub target_hardware_addr: EthernetAddress,
    /// The IPv4 address being resolved or answered for.
    pub target_protocol_addr: Ipv4Address,
}

impl Repr {
    /// Parse a packet into its representation.
    ///
    /// Packets for other hardware or protocol address spaces are rejected as
    /// malformed since this stack only speaks Ethernet and IPv4.
    pub fn parse(packet: &Packet) -> Result<Repr> {
        if packet.hardware_type() != HTYPE_ETHERNET
            || packet.protocol_type() != PTYPE_IPV4
            || packet.0[field::HLEN] != 6
            || packet.0[field::PLEN] != 4
        {
            return Err(Error::Malformed);
        }

        Ok(Repr {
            operation: packet.operation(),
            source_hardware_addr: packet.source_hardware_addr(),
            source_protocol_addr: packet.source_protocol_addr(),
            target_hardware_addr: packet.target_hardware_addr(),
            target_protocol_addr: packet.target_protocol_addr(),
        })
    }

    /// Emit the representation into a packet.
    pub fn emit(&self, packet: &mut Packet) {
        NetworkEndian::write_u16(&mut packet.0[field::HTYPE], HTYPE_ETHERNET);
        NetworkEndian::write_u16(&mut packet.0[field::PTYPE], PTYPE_IPV4);
        packet.0[field::HLEN] = 6;
        packet.0[field::PLEN] = 4;
        packet.set_operation(self.operation);
        packet.set_source_hardware_addr(self.source_hardware_addr);
        packet.set_source_protocol_addr(self.source_protocol_addr);
        packet.set_target_hardware_addr(self.target_hardware_addr);
        packet.set_target_protocol_addr(self.target_protocol_addr);
    }
}
