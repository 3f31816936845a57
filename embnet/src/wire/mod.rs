//! Low-level packet access and construction.
//!
//! The `wire` module deals with the packet *representation*: zero-copy
//! wrappers over byte slices that parse and emit the exact on-wire layout of
//! each protocol header. Each protocol gets a `Packet` wrapper with field
//! accessors and a high-level `Repr` that holds the parsed, validated
//! meaning of a header. Parsing never allocates; emitting writes into a
//! caller-provided buffer.

pub mod arp;
pub mod ethernet;
pub mod icmpv4;
pub mod ipv4;
pub mod tcp;

pub use self::arp::{Operation as ArpOperation, Packet as ArpPacket, Repr as ArpRepr};
pub use self::ethernet::{Address as EthernetAddress, EtherType, Frame as EthernetFrame,
    Repr as EthernetRepr};
pub use self::icmpv4::{Message as Icmpv4Message, Packet as Icmpv4Packet};
pub use self::ipv4::{Address as Ipv4Address, Cidr as Ipv4Cidr, Packet as Ipv4Packet,
    Protocol as IpProtocol, Repr as Ipv4Repr};
pub use self::tcp::{Flags as TcpFlags, Packet as TcpPacket, Repr as TcpRepr, SeqNumber};

/// The result type of parsing operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The error type of parsing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The buffer is too short to contain the claimed structure.
    Truncated,
    /// A header field violates the protocol, including a bad checksum.
    Malformed,
}

pub(crate) mod field {
    //! Field slices into a packet buffer.
    pub type Field = core::ops::Range<usize>;
    pub type FieldFrom = core::ops::RangeFrom<usize>;
}

pub mod checksum {
    //! The internet checksum, RFC 1071.
    //!
    //! All functions return partial one's complement sums in host
    //! representation; a header verifies when the combined sum over all of
    //! its parts, checksum field included, equals `!0`.
    use byteorder::{ByteOrder, NetworkEndian};

    use super::ipv4::Address;
    use super::ipv4::Protocol;

    fn fold(mut accum: u32) -> u16 {
        while accum >> 16 != 0 {
            accum = (accum & 0xffff) + (accum >> 16);
        }
        accum as u16
    }

    /// Compute the partial sum over a byte slice.
    ///
    /// An odd trailing byte is taken as the high octet of a final word, as if
    /// the data were zero-padded.
    pub fn data(data: &[u8]) -> u16 {
        let mut accum = Accumulator::default();
        accum.push(data);
        accum.finish()
    }

    /// Combine partial sums into one.
    pub fn combine(sums: &[u16]) -> u16 {
        let accum = sums.iter().map(|&word| u32::from(word)).sum();
        fold(accum)
    }

    /// The partial sum of the IPv4 pseudo header used by TCP and UDP.
    pub fn pseudo_header(src_addr: Address, dst_addr: Address, protocol: Protocol, length: u32)
        -> u16
    {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(src_addr.as_bytes());
        bytes[4..8].copy_from_slice(dst_addr.as_bytes());
        bytes[9] = protocol.into();
        NetworkEndian::write_u16(&mut bytes[10..12], length as u16);
        data(&bytes)
    }

    /// A running partial sum over discontiguous data.
    ///
    /// Packet payload lives in chains of segments whose lengths need not be
    /// even. The accumulator carries an odd trailing octet across `push`
    /// calls so that word boundaries fall where they would in the contiguous
    /// datagram.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Accumulator {
        sum: u32,
        /// High octet of a word split across two pushes.
        pending: Option<u8>,
    }

    impl Accumulator {
        /// Fold more bytes into the sum.
        pub fn push(&mut self, mut data: &[u8]) {
            if let Some(high) = self.pending.take() {
                match data.split_first() {
                    Some((&low, rest)) => {
                        self.sum += u32::from(u16::from_be_bytes([high, low]));
                        data = rest;
                    },
                    None => {
                        self.pending = Some(high);
                        return;
                    },
                }
            }

            let mut words = data.chunks_exact(2);
            for word in &mut words {
                self.sum += u32::from(NetworkEndian::read_u16(word));
            }
            if let &[last] = words.remainder() {
                self.pending = Some(last);
            }
        }

        /// Fold a previously computed partial sum into this one.
        ///
        /// Only valid while the accumulator is word aligned.
        pub fn push_sum(&mut self, sum: u16) {
            debug_assert!(self.pending.is_none(), "partial sum on an odd boundary");
            self.sum += u32::from(sum);
        }

        /// The folded partial sum.
        pub fn finish(self) -> u16 {
            let mut accum = self.sum;
            if let Some(high) = self.pending {
                accum += u32::from(u16::from_be_bytes([high, 0]));
            }
            fold(accum)
        }
    }

}
