//! IPv4 addresses and header layout.
use core::fmt;

use byteorder::{ByteOrder, NetworkEndian};

use super::{checksum, Error, Result};

enum_with_unknown! {
    /// The protocol carried in an IPv4 payload.
    pub enum Protocol(u8) {
        Icmp = 1,
        Tcp = 6,
        Udp = 17,
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Unknown(id) => write!(f, "0x{:02x}", id),
        }
    }
}

/// A four-octet IPv4 address.
#[derive(Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct Address(pub [u8; 4]);

impl Address {
    /// The unspecified address.
    pub const UNSPECIFIED: Address = Address([0; 4]);

    /// The limited broadcast address.
    pub const BROADCAST: Address = Address([255; 4]);

    /// Construct an address from a sequence of octets.
    ///
    /// # Panics
    ///
    /// The function panics if `data` is not four octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Access the octets of the address.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Query whether the address is the unspecified address.
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    /// Query whether the address is the limited broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Query whether the address is a multicast address.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    /// Query whether the address is a unicast address.
    pub fn is_unicast(&self) -> bool {
        !(self.is_broadcast() || self.is_multicast() || self.is_unspecified())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

/// An IPv4 address preceded by a network prefix length.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct Cidr {
    address: Address,
    prefix: u8,
}

impl Cidr {
    /// Create a network block from an address and prefix length.
    ///
    /// # Panics
    ///
    /// The function panics if the prefix length is larger than 32.
    pub fn new(address: Address, prefix: u8) -> Cidr {
        assert!(prefix <= 32);
        Cidr { address, prefix }
    }

    /// The interface address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The network prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The network mask as an address.
    pub fn netmask(&self) -> Address {
        let mask = match self.prefix {
            0 => 0,
            bits => !0u32 << (32 - u32::from(bits)),
        };
        Address(mask.to_be_bytes())
    }

    /// The directed broadcast address of the subnet, if any.
    ///
    /// A host route (`/32`) has no broadcast address.
    pub fn broadcast(&self) -> Option<Address> {
        if self.prefix >= 31 {
            return None;
        }
        let mask = NetworkEndian::read_u32(self.netmask().as_bytes());
        let net = NetworkEndian::read_u32(self.address.as_bytes()) & mask;
        Some(Address((net | !mask).to_be_bytes()))
    }

    /// Query whether the subnet contains the given address.
    pub fn contains(&self, addr: Address) -> bool {
        let mask = NetworkEndian::read_u32(self.netmask().as_bytes());
        let this = NetworkEndian::read_u32(self.address.as_bytes());
        let other = NetworkEndian::read_u32(addr.as_bytes());
        (this ^ other) & mask == 0
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

byte_wrapper! {
    /// A byte sequence that forms an IPv4 packet.
    #[derive(Debug, PartialEq, Eq)]
    pub struct Packet([u8]);
}

mod field {
    use crate::wire::field::*;

    pub const VER_IHL: usize = 0;
    pub const DSCP_ECN: usize = 1;
    pub const LENGTH: Field = 2..4;
    pub const IDENT: Field = 4..6;
    pub const FLG_OFF: Field = 6..8;
    pub const TTL: usize = 8;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: Field = 10..12;
    pub const SRC_ADDR: Field = 12..16;
    pub const DST_ADDR: Field = 16..20;
}

/// The length of an IPv4 header without options.
pub const HEADER_LEN: usize = field::DST_ADDR.end;

impl Packet {
    /// Interpret a byte slice as a packet without validity checks.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Interpret a mutable byte slice as a packet without validity checks.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Interpret a byte slice as a packet, checking structural validity.
    ///
    /// Verifies the version, that the buffer covers the claimed total length
    /// and that the total length covers the header. The checksum is not
    /// verified here.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let packet = Self::new_unchecked(data);
        if packet.version() != 4 {
            return Err(Error::Malformed);
        }
        let header_len = packet.header_len();
        let total_len = packet.total_len() as usize;
        if header_len < HEADER_LEN || total_len < header_len {
            return Err(Error::Malformed);
        }
        if data.len() < total_len {
            return Err(Error::Truncated);
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

    /// Return the version field.
    pub fn version(&self) -> u8 {
        self.0[field::VER_IHL] >> 4
    }

    /// Return the header length in bytes.
    pub fn header_len(&self) -> usize {
        usize::from(self.0[field::VER_IHL] & 0x0f) * 4
    }

    /// Return the total length field.
    pub fn total_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the identification field.
    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::IDENT])
    }

    /// Query whether the more-fragments flag is set.
    pub fn more_fragments(&self) -> bool {
        self.0[field::FLG_OFF.start] & 0x20 != 0
    }

    /// Return the fragment offset in bytes.
    pub fn frag_offset(&self) -> u16 {
        (NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & 0x1fff) << 3
    }

    /// Return the time-to-live field.
    pub fn hop_limit(&self) -> u8 {
        self.0[field::TTL]
    }

    /// Return the protocol field.
    pub fn protocol(&self) -> Protocol {
        self.0[field::PROTOCOL].into()
    }

    /// Return the source address field.
    pub fn src_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::SRC_ADDR])
    }

    /// Return the destination address field.
    pub fn dst_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::DST_ADDR])
    }

    /// Verify the header checksum.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0[..self.header_len()]) == !0
    }

    /// Set the version and header length fields.
    pub fn set_version_and_len(&mut self, header_len: usize) {
        self.0[field::VER_IHL] = 0x40 | (header_len / 4) as u8;
    }

    /// Set the total length field.
    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::LENGTH], value)
    }

    /// Set the identification field.
    pub fn set_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::IDENT], value)
    }

    /// Set the time-to-live field.
    pub fn set_hop_limit(&mut self, value: u8) {
        self.0[field::TTL] = value
    }

    /// Set the protocol field.
    pub fn set_protocol(&mut self, value: Protocol) {
        self.0[field::PROTOCOL] = value.into()
    }

    /// Set the source address field.
    pub fn set_src_addr(&mut self, value: Address) {
        self.0[field::SRC_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Set the destination address field.
    pub fn set_dst_addr(&mut self, value: Address) {
        self.0[field::DST_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], 0);
        let sum = !checksum::data(&self.0[..self.header_len()]);
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], sum);
    }

    /// Return the payload following the header.
    pub fn payload(&self) -> &[u8] {
        let range = self.header_len()..self.total_len() as usize;
        &self.0[range]
    }

    /// Return the payload following the header, mutably.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let range = self.header_len()..self.total_len() as usize;
        &mut self.0[range]
    }
}

/// A high-level representation of an IPv4 header without options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    /// The sender of the packet.
    pub src_addr: Address,
    /// The recipient of the packet.
    pub dst_addr: Address,
    /// The protocol of the payload.
    pub protocol: Protocol,
    /// The length of the payload in bytes.
    pub payload_len: usize,
    /// The remaining hop count.
    pub hop_limit: u8,
}

impl Repr {
    /// Parse a structurally valid packet into its representation.
    ///
    /// Fragments are rejected as malformed; reassembly is not supported and
    /// a fragment must never be delivered as a whole datagram.
    pub fn parse(packet: &Packet) -> Result<Repr> {
        if !packet.verify_checksum() {
            return Err(Error::Malformed);
        }
        if packet.more_fragments() || packet.frag_offset() != 0 {
            return Err(Error::Malformed);
        }

        Ok(Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            protocol: packet.protocol(),
            payload_len: packet.total_len() as usize - packet.header_len(),
            hop_limit: packet.hop_limit(),
        })
    }

    /// Emit the representation as an optionless header.
    pub fn emit(&self, packet: &mut Packet, ident: u16) {
        packet.set_version_and_len(HEADER_LEN);
        packet.0[field::DSCP_ECN] = 0;
        packet.set_total_len((HEADER_LEN + self.payload_len) as u16);
        packet.set_ident(ident);
        NetworkEndian::write_u16(&mut packet.0[field::FLG_OFF], 0);
        packet.set_hop_limit(self.hop_limit);
        packet.set_protocol(self.protocol);
        packet.set_src_addr(self.src_addr);
        packet.set_dst_addr(self.dst_addr);
        packet.fill_checksum();
    }
}
