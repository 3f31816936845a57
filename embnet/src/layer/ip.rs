//! IPv4 routing and dispatch.
//!
//! The [`Router`] owns the configured interfaces, each with its own address
//! resolution cache, and a bounded egress queue of link frames awaiting the
//! device driver. Outbound packets get their IP header prepended here and
//! are resolved to a next-hop Ethernet address; inbound packets are
//! validated, then either handled in place (ICMP echo, ARP), forwarded, or
//! handed up to the transport layer.
//!
//! [`Router`]: struct.Router.html
use crate::config::{ArpConfig, Config};
use crate::managed::{List, Partial, Slice};
use crate::pbuf::{Buffers, Kind, Layer, PbufId};
use crate::wire::{
    self, ArpOperation, ArpPacket, ArpRepr, EtherType, EthernetAddress,
    Icmpv4Message, Icmpv4Packet, IpProtocol, Ipv4Address, Ipv4Cidr, Ipv4Packet, Ipv4Repr,
};

use super::arp::{Cache, Resolve};
use super::{Error, Result};

/// Hop limit of locally originated packets.
const DEFAULT_TTL: u8 = 64;

/// Upper bound on ARP retransmissions gathered in one aging tick.
const RETRY_BATCH: usize = 8;

/// One configured network interface.
#[derive(Debug)]
pub struct Interface<'a> {
    addr: Ipv4Cidr,
    gateway: Option<Ipv4Address>,
    hwaddr: EthernetAddress,
    mtu: usize,
    up: bool,
    link_up: bool,
    arp: Cache<'a>,
}

impl<'a> Interface<'a> {
    /// Create an interface with an owned resolution cache.
    #[cfg(feature = "std")]
    pub fn new(addr: Ipv4Cidr, hwaddr: EthernetAddress, mtu: usize, arp: &ArpConfig) -> Self {
        Self::with_cache(addr, hwaddr, mtu, Cache::new(arp))
    }

    /// Create an interface around a caller-provided resolution cache.
    pub fn with_cache(addr: Ipv4Cidr, hwaddr: EthernetAddress, mtu: usize, arp: Cache<'a>)
        -> Self
    {
        Interface {
            addr,
            gateway: None,
            hwaddr,
            mtu,
            up: true,
            link_up: true,
            arp,
        }
    }

    /// Set the default gateway for off-link destinations.
    pub fn with_gateway(mut self, gateway: Ipv4Address) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// The configured address and subnet.
    pub fn addr(&self) -> Ipv4Cidr {
        self.addr
    }

    /// The hardware address.
    pub fn hwaddr(&self) -> EthernetAddress {
        self.hwaddr
    }

    /// The maximum transmission unit, in IP packet bytes.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Administratively enable or disable the interface.
    pub fn set_up(&mut self, up: bool) {
        self.up = up;
    }

    /// Record a link state change reported by the driver.
    pub fn set_link_up(&mut self, link_up: bool) {
        self.link_up = link_up;
    }

    fn usable(&self) -> bool {
        self.up && self.link_up
    }

    /// Whether `addr` is addressed to this interface.
    fn accepts(&self, addr: Ipv4Address) -> bool {
        addr == self.addr.address()
            || addr.is_broadcast()
            || self.addr.broadcast() == Some(addr)
            || addr.is_multicast()
    }
}

/// A frame ready for the link driver.
#[derive(Debug, Clone, Copy)]
pub struct Egress {
    /// The network-layer packet; the Ethernet header is not part of it.
    pub packet: PbufId,
    /// Index of the interface to transmit on.
    pub iface: usize,
    /// Destination hardware address.
    pub dst: EthernetAddress,
    /// Protocol for the Ethernet header.
    pub ethertype: EtherType,
}

/// Event counters of the router.
///
/// Malformed or undeliverable packets never surface as errors on the poll
/// path; these counters are the only trace they leave.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Received packets dropped for length or checksum violations.
    pub rx_malformed: u32,
    /// Received packets dropped for other reasons, such as an exhausted
    /// transport queue.
    pub rx_dropped: u32,
    /// Outbound frames dropped because the egress queue was full.
    pub tx_dropped: u32,
    /// Packets passed through to another interface.
    pub forwarded: u32,
    /// Packets that matched no route or no next hop.
    pub unreachable: u32,
}

/// An inbound packet to be delivered above the IP layer.
#[derive(Debug, Clone, Copy)]
pub enum Deliver {
    /// A TCP segment; the packet payload starts at the TCP header.
    Tcp {
        /// The segment, owned by the receiver.
        packet: PbufId,
        /// Source address of the enclosing datagram.
        src: Ipv4Address,
        /// Destination address of the enclosing datagram.
        dst: Ipv4Address,
        /// Interface the datagram arrived on.
        iface: usize,
    },
}

/// The routing and dispatch engine.
#[derive(Debug)]
pub struct Router<'a> {
    ifaces: List<'a, Option<Interface<'a>>>,
    egress: List<'a, Option<Egress>>,
    default_iface: Option<usize>,
    ident: u16,
    /// Event counters; cleared only by the owner.
    pub stats: Stats,
}

impl<'a> Router<'a> {
    /// Interfaces a router constructed with [`new`] can hold.
    ///
    /// [`new`]: #method.new
    #[cfg(feature = "std")]
    pub const DEFAULT_IFACES: usize = 4;

    /// Create a router with owned storage.
    #[cfg(feature = "std")]
    pub fn new(config: &Config) -> Self {
        let mut ifaces = Vec::new();
        ifaces.resize_with(Self::DEFAULT_IFACES, || None);
        let mut egress = Vec::new();
        egress.resize_with(config.egress_depth, || None);
        Self::with_storage(ifaces, egress)
    }

    /// Create a router over caller-provided storage.
    pub fn with_storage<I, E>(ifaces: I, egress: E) -> Self
        where
            I: Into<Slice<'a, Option<Interface<'a>>>>,
            E: Into<Slice<'a, Option<Egress>>>,
    {
        Router {
            ifaces: Partial::new(ifaces.into()),
            egress: Partial::new(egress.into()),
            default_iface: None,
            ident: 1,
            stats: Stats::default(),
        }
    }

    /// Register an interface, returning its index.
    ///
    /// The first interface becomes the default route until
    /// [`set_default`] says otherwise.
    ///
    /// [`set_default`]: #method.set_default
    pub fn add(&mut self, iface: Interface<'a>) -> Result<usize> {
        let index = self.ifaces.len();
        let slot = self.ifaces.push().ok_or(Error::Exhausted)?;
        *slot = Some(iface);
        if self.default_iface.is_none() {
            self.default_iface = Some(index);
        }
        Ok(index)
    }

    /// Choose the interface serving unroutable destinations.
    pub fn set_default(&mut self, index: usize) {
        debug_assert!(index < self.ifaces.len());
        self.default_iface = Some(index);
    }

    /// Access a registered interface.
    pub fn iface(&self, index: usize) -> Option<&Interface<'a>> {
        self.ifaces.get(index)?.as_ref()
    }

    /// Access a registered interface mutably.
    pub fn iface_mut(&mut self, index: usize) -> Option<&mut Interface<'a>> {
        self.ifaces.get_mut(index)?.as_mut()
    }

    /// Select the outbound interface for a destination.
    ///
    /// The interface a forwarded packet arrived on is preferred when it
    /// matches; otherwise the subnets of all usable interfaces are scanned
    /// and the configured default interface serves what remains.
    pub fn route(&self, dst: Ipv4Address, arrived: Option<usize>) -> Option<usize> {
        if let Some(index) = arrived {
            if let Some(iface) = self.iface(index) {
                if iface.usable() && iface.addr.contains(dst) {
                    return Some(index);
                }
            }
        }

        for (index, slot) in self.ifaces.iter().enumerate() {
            if let Some(iface) = slot {
                if iface.usable() && iface.addr.contains(dst) {
                    return Some(index);
                }
            }
        }

        self.default_iface
            .filter(|&index| self.iface(index).map_or(false, Interface::usable))
    }

    /// Send an IP payload to a destination address.
    ///
    /// The packet must carry transport headroom; the IP header is prepended
    /// here. On success the router owns the packet, whether it went to the
    /// egress queue or is waiting on address resolution. On error it stays
    /// with the caller.
    pub fn output(
        &mut self,
        bufs: &mut Buffers,
        packet: PbufId,
        src: Option<Ipv4Address>,
        dst: Ipv4Address,
        protocol: IpProtocol,
    ) -> Result<()> {
        let index = self.route(dst, None).ok_or(Error::Unreachable)?;
        let iface = self.ifaces[index].as_ref().expect("routed to a registered interface");

        let payload_len = bufs.tot_len(packet);
        if payload_len + wire::ipv4::HEADER_LEN > iface.mtu {
            // Fragmentation is a non-goal; oversize datagrams fail loudly.
            self.stats.unreachable += 1;
            return Err(Error::Unreachable);
        }

        let repr = Ipv4Repr {
            src_addr: src.unwrap_or_else(|| iface.addr.address()),
            dst_addr: dst,
            protocol,
            payload_len,
            hop_limit: DEFAULT_TTL,
        };
        bufs.header(packet, wire::ipv4::HEADER_LEN as i32)?;
        let ident = self.ident;
        self.ident = self.ident.wrapping_add(1);
        {
            let bytes = bufs.payload_mut(packet);
            let header = Ipv4Packet::new_unchecked_mut(&mut bytes[..wire::ipv4::HEADER_LEN]);
            repr.emit(header, ident);
        }

        self.transmit(bufs, index, packet, dst);
        Ok(())
    }

    /// Process a received IP packet.
    ///
    /// Malformed packets are dropped here with a counter increment and
    /// nothing else; they never become errors on the poll path. Locally
    /// addressed TCP is returned for the transport layer, ICMP echo is
    /// answered in place, anything else either elicits a protocol
    /// unreachable or is forwarded.
    pub fn input(&mut self, bufs: &mut Buffers, index: usize, packet: PbufId)
        -> Option<Deliver>
    {
        let repr = {
            let bytes = bufs.payload(packet);
            let parsed = Ipv4Packet::new_checked(bytes)
                .and_then(|header| Ipv4Repr::parse(header).map(|repr| (repr, header.total_len())));
            match parsed {
                Ok((repr, total_len)) => {
                    // Frames shorter than the Ethernet minimum arrive padded.
                    bufs.truncate(packet, total_len as usize);
                    repr
                },
                Err(_) => {
                    net_debug!("ip: dropping malformed packet");
                    self.stats.rx_malformed += 1;
                    bufs.free(packet);
                    return None;
                },
            }
        };

        let local = self.iface(index).map_or(false, |iface| iface.accepts(repr.dst_addr));
        if !local {
            self.forward(bufs, index, packet, repr);
            return None;
        }

        // Strip the IP header; the payload now starts at the transport
        // header. Header length was validated by the parse above.
        let header_len = (bufs.tot_len(packet) - repr.payload_len) as i32;
        bufs.header(packet, -header_len).expect("validated header length");

        match repr.protocol {
            IpProtocol::Tcp => Some(Deliver::Tcp {
                packet,
                src: repr.src_addr,
                dst: repr.dst_addr,
                iface: index,
            }),
            IpProtocol::Icmp => {
                self.process_icmp(bufs, index, packet, repr);
                None
            },
            _ => {
                let directed = self.iface(index)
                    .and_then(|iface| iface.addr.broadcast()) == Some(repr.dst_addr);
                let broadcast = directed || !repr.dst_addr.is_unicast();
                if !broadcast {
                    self.send_unreachable(bufs, packet, repr, wire::icmpv4::UNREACH_PROTOCOL);
                }
                bufs.free(packet);
                None
            },
        }
    }

    /// Process a received ARP packet.
    pub fn process_arp(&mut self, bufs: &mut Buffers, index: usize, frame: &[u8]) {
        let repr = match ArpPacket::new_checked(frame).and_then(ArpRepr::parse) {
            Ok(repr) => repr,
            Err(_) => {
                self.stats.rx_malformed += 1;
                return;
            },
        };

        let (own_addr, own_hwaddr) = match self.iface(index) {
            Some(iface) if iface.usable() => (iface.addr.address(), iface.hwaddr),
            _ => return,
        };
        if repr.target_protocol_addr != own_addr
            || !repr.source_hardware_addr.is_unicast()
        {
            return;
        }

        let iface = self.ifaces[index].as_mut().expect("interface checked above");
        let flushed = iface.arp.learn(repr.source_protocol_addr, repr.source_hardware_addr);
        if let Some(packet) = flushed {
            self.push_egress(bufs, Egress {
                packet,
                iface: index,
                dst: repr.source_hardware_addr,
                ethertype: EtherType::Ipv4,
            });
        }

        if repr.operation == ArpOperation::Request {
            let reply = ArpRepr {
                operation: ArpOperation::Reply,
                source_hardware_addr: own_hwaddr,
                source_protocol_addr: own_addr,
                target_hardware_addr: repr.source_hardware_addr,
                target_protocol_addr: repr.source_protocol_addr,
            };
            self.send_arp(bufs, index, reply, repr.source_hardware_addr);
        }
    }

    /// Take the next frame destined for the link driver.
    pub fn next_egress(&mut self) -> Option<Egress> {
        self.egress.remove_at(0).and_then(Option::take)
    }

    /// Run one aging tick over every interface's resolution cache.
    pub fn tick(&mut self, bufs: &mut Buffers) {
        for index in 0..self.ifaces.len() {
            let mut retries = [None; RETRY_BATCH];
            if let Some(iface) = self.ifaces[index].as_mut() {
                let mut count = 0;
                iface.arp.tick(bufs, |addr| {
                    if count < retries.len() {
                        retries[count] = Some(addr);
                        count += 1;
                    }
                });
            }
            for addr in retries.iter().filter_map(|&addr| addr) {
                self.send_arp_request(bufs, index, addr);
            }
        }
    }

    /// Resolve the next hop and queue an IP packet for the link.
    fn transmit(&mut self, bufs: &mut Buffers, index: usize, packet: PbufId, dst: Ipv4Address) {
        let iface = self.ifaces[index].as_mut().expect("transmit on a registered interface");

        let hop = if dst.is_broadcast() || iface.addr.broadcast() == Some(dst) {
            Some(EthernetAddress::BROADCAST)
        } else if dst.is_multicast() {
            Some(multicast_hwaddr(dst))
        } else {
            None
        };
        if let Some(hwaddr) = hop {
            self.push_egress(bufs, Egress {
                packet,
                iface: index,
                dst: hwaddr,
                ethertype: EtherType::Ipv4,
            });
            return;
        }

        let next_hop = if iface.addr.contains(dst) {
            dst
        } else {
            match iface.gateway {
                Some(gateway) => gateway,
                None => {
                    net_debug!("ip: no gateway towards {}", dst);
                    self.stats.unreachable += 1;
                    bufs.free(packet);
                    return;
                },
            }
        };

        match iface.arp.resolve(bufs, next_hop, Some(packet)) {
            Resolve::Stable(hwaddr) => {
                self.push_egress(bufs, Egress {
                    packet,
                    iface: index,
                    dst: hwaddr,
                    ethertype: EtherType::Ipv4,
                });
            },
            Resolve::Pending => {
                self.send_arp_request(bufs, index, next_hop);
            },
        }
    }

    fn forward(&mut self, bufs: &mut Buffers, arrived: usize, packet: PbufId, repr: Ipv4Repr) {
        if repr.hop_limit <= 1 {
            self.stats.rx_dropped += 1;
            bufs.free(packet);
            return;
        }
        let index = match self.route(repr.dst_addr, Some(arrived)) {
            Some(index) => index,
            None => {
                self.stats.unreachable += 1;
                bufs.free(packet);
                return;
            },
        };

        {
            let bytes = bufs.payload_mut(packet);
            let header = Ipv4Packet::new_unchecked_mut(bytes);
            header.set_hop_limit(repr.hop_limit - 1);
            header.fill_checksum();
        }
        self.stats.forwarded += 1;
        self.transmit(bufs, index, packet, repr.dst_addr);
    }

    fn process_icmp(&mut self, bufs: &mut Buffers, index: usize, packet: PbufId, repr: Ipv4Repr) {
        let reply = {
            let bytes = bufs.payload(packet);
            match Icmpv4Packet::new_checked(bytes) {
                Ok(icmp) if icmp.msg_type() == Icmpv4Message::EchoRequest
                    && repr.dst_addr.is_unicast() =>
                {
                    Some((icmp.echo_ident(), icmp.echo_seq_no(), icmp.data().len()))
                },
                Ok(_) => None,
                Err(_) => {
                    self.stats.rx_malformed += 1;
                    None
                },
            }
        };

        let (ident, seq_no, data_len) = match reply {
            Some(parts) => parts,
            None => {
                bufs.free(packet);
                return;
            },
        };

        let len = wire::icmpv4::HEADER_LEN + data_len;
        let echo = match bufs.alloc(Layer::Transport, len, Kind::Pool) {
            Ok(echo) => echo,
            Err(_) => {
                self.stats.rx_dropped += 1;
                bufs.free(packet);
                return;
            },
        };
        {
            // Copy the request data, then overwrite the header fields.
            let mut scratch = [0u8; wire::icmpv4::HEADER_LEN];
            let mut offset = 0;
            loop {
                let copied = bufs.copy_partial(packet, &mut scratch, offset);
                if copied == 0 {
                    break;
                }
                bufs.fill(echo, offset, &scratch[..copied]);
                offset += copied;
            }

            let bytes = bufs.payload_mut(echo);
            let message = Icmpv4Packet::new_unchecked_mut(&mut bytes[..len]);
            message.set_msg_type(Icmpv4Message::EchoReply);
            message.set_msg_code(0);
            message.set_echo_ident(ident);
            message.set_echo_seq_no(seq_no);
            message.fill_checksum();
        }
        bufs.free(packet);

        let src = self.iface(index).map(|iface| iface.addr.address());
        if self.output(bufs, echo, src, repr.src_addr, IpProtocol::Icmp).is_err() {
            bufs.free(echo);
            self.stats.tx_dropped += 1;
        }
    }

    /// Send an ICMP destination unreachable quoting the offending datagram.
    fn send_unreachable(&mut self, bufs: &mut Buffers, packet: PbufId, repr: Ipv4Repr, code: u8) {
        // The quoted part is the IP header plus eight payload bytes.
        let quote_len = wire::ipv4::HEADER_LEN + 8.min(repr.payload_len);
        let len = wire::icmpv4::HEADER_LEN + quote_len;
        let notice = match bufs.alloc(Layer::Transport, len, Kind::Pool) {
            Ok(notice) => notice,
            Err(_) => return,
        };

        {
            // Reconstruct the quoted header; the original was stripped from
            // the packet but is fully described by its representation.
            let bytes = bufs.payload_mut(notice);
            let message = Icmpv4Packet::new_unchecked_mut(&mut bytes[..len]);
            message.set_msg_type(Icmpv4Message::DstUnreachable);
            message.set_msg_code(code);
            message.set_echo_ident(0);
            message.set_echo_seq_no(0);
        }
        {
            let mut quoted = [0u8; wire::ipv4::HEADER_LEN + 8];
            let quoted = &mut quoted[..quote_len];
            {
                let header = Ipv4Packet::new_unchecked_mut(
                    &mut quoted[..wire::ipv4::HEADER_LEN]);
                repr.emit(header, 0);
            }
            bufs.copy_partial(packet, &mut quoted[wire::ipv4::HEADER_LEN..], 0);
            bufs.fill(notice, wire::icmpv4::HEADER_LEN, quoted);
        }
        {
            let bytes = bufs.payload_mut(notice);
            Icmpv4Packet::new_unchecked_mut(&mut bytes[..len]).fill_checksum();
        }

        if self.output(bufs, notice, None, repr.src_addr, IpProtocol::Icmp).is_err() {
            bufs.free(notice);
            self.stats.tx_dropped += 1;
        }
    }

    fn send_arp_request(&mut self, bufs: &mut Buffers, index: usize, addr: Ipv4Address) {
        let (own_addr, own_hwaddr) = match self.iface(index) {
            Some(iface) => (iface.addr.address(), iface.hwaddr),
            None => return,
        };
        let request = ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: own_hwaddr,
            source_protocol_addr: own_addr,
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: addr,
        };
        self.send_arp(bufs, index, request, EthernetAddress::BROADCAST);
    }

    fn send_arp(&mut self, bufs: &mut Buffers, index: usize, repr: ArpRepr,
        dst: EthernetAddress)
    {
        let packet = match bufs.alloc(Layer::Raw, wire::arp::PACKET_LEN, Kind::Pool) {
            Ok(packet) => packet,
            Err(_) => {
                self.stats.tx_dropped += 1;
                return;
            },
        };
        {
            let bytes = bufs.payload_mut(packet);
            repr.emit(ArpPacket::new_unchecked_mut(&mut bytes[..wire::arp::PACKET_LEN]));
        }
        self.push_egress(bufs, Egress {
            packet,
            iface: index,
            dst,
            ethertype: EtherType::Arp,
        });
    }

    /// Queue a frame for the driver, dropping it when the queue is full.
    ///
    /// Committed frames are not refused back to the sender; a full queue
    /// behaves like loss on the wire, which the transports already absorb.
    fn push_egress(&mut self, bufs: &mut Buffers, entry: Egress) {
        match self.egress.push() {
            Some(slot) => *slot = Some(entry),
            None => {
                net_debug!("ip: egress queue full");
                self.stats.tx_dropped += 1;
                bufs.free(entry.packet);
            },
        }
    }
}

/// The Ethernet address an IPv4 multicast group maps to.
fn multicast_hwaddr(addr: Ipv4Address) -> EthernetAddress {
    let ip = addr.0;
    EthernetAddress([0x01, 0x00, 0x5e, ip[1] & 0x7f, ip[2], ip[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_HW: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 1]);
    const PEER_HW: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 2]);

    fn local() -> Ipv4Address { Ipv4Address([192, 168, 1, 1]) }
    fn peer() -> Ipv4Address { Ipv4Address([192, 168, 1, 2]) }
    fn far() -> Ipv4Address { Ipv4Address([8, 8, 8, 8]) }

    fn setup() -> (Router<'static>, Buffers<'static>) {
        let config = Config::default();
        let mut router = Router::new(&config);
        let iface = Interface::new(
            Ipv4Cidr::new(local(), 24), LOCAL_HW, 1500, &config.arp,
        ).with_gateway(peer());
        router.add(iface).unwrap();
        (router, Buffers::new(&config))
    }

    fn transport_packet(bufs: &mut Buffers, len: usize) -> PbufId {
        let packet = bufs.alloc(Layer::Transport, len, Kind::Pool).unwrap();
        let fill = [0xabu8; 64];
        let mut offset = 0;
        while offset < len {
            offset += bufs.fill(packet, offset, &fill[..fill.len().min(len - offset)]);
        }
        packet
    }

    /// Complete resolution of the peer so output goes straight to egress.
    fn learn_peer(router: &mut Router, bufs: &mut Buffers) {
        let mut frame = [0u8; wire::arp::PACKET_LEN];
        ArpRepr {
            operation: ArpOperation::Reply,
            source_hardware_addr: PEER_HW,
            source_protocol_addr: peer(),
            target_hardware_addr: LOCAL_HW,
            target_protocol_addr: local(),
        }.emit(ArpPacket::new_unchecked_mut(&mut frame[..]));
        router.process_arp(bufs, 0, &frame);
    }

    #[test]
    fn routes_on_link_and_default() {
        let (router, _) = setup();
        assert_eq!(router.route(peer(), None), Some(0));
        // Off-link falls back to the default interface.
        assert_eq!(router.route(far(), None), Some(0));
    }

    #[test]
    fn no_route_when_down() {
        let (mut router, _) = setup();
        router.iface_mut(0).unwrap().set_up(false);
        assert_eq!(router.route(peer(), None), None);
    }

    #[test]
    fn output_emits_valid_header() {
        let (mut router, mut bufs) = setup();
        learn_peer(&mut router, &mut bufs);

        let packet = transport_packet(&mut bufs, 32);
        router.output(&mut bufs, packet, None, peer(), IpProtocol::Udp).unwrap();

        let egress = router.next_egress().unwrap();
        assert_eq!(egress.dst, PEER_HW);
        assert_eq!(egress.ethertype, EtherType::Ipv4);

        let mut frame = [0u8; 64];
        let len = bufs.copy_partial(egress.packet, &mut frame, 0);
        let header = Ipv4Packet::new_checked(&frame[..len]).unwrap();
        assert!(header.verify_checksum());
        let repr = Ipv4Repr::parse(header).unwrap();
        assert_eq!(repr.src_addr, local());
        assert_eq!(repr.dst_addr, peer());
        assert_eq!(repr.protocol, IpProtocol::Udp);
        assert_eq!(repr.payload_len, 32);
        bufs.free(egress.packet);
    }

    #[test]
    fn unresolved_next_hop_queues_and_requests() {
        let (mut router, mut bufs) = setup();
        let packet = transport_packet(&mut bufs, 16);
        router.output(&mut bufs, packet, None, peer(), IpProtocol::Udp).unwrap();

        // The data waits on the ARP entry; only the request leaves.
        let egress = router.next_egress().unwrap();
        assert_eq!(egress.ethertype, EtherType::Arp);
        assert_eq!(egress.dst, EthernetAddress::BROADCAST);
        bufs.free(egress.packet);
        assert!(router.next_egress().is_none());
        assert!(bufs.is_live(packet));

        // The reply releases the queued packet.
        learn_peer(&mut router, &mut bufs);
        let egress = router.next_egress().unwrap();
        assert_eq!(egress.packet, packet);
        assert_eq!(egress.dst, PEER_HW);
        bufs.free(egress.packet);
    }

    #[test]
    fn off_link_uses_gateway() {
        let (mut router, mut bufs) = setup();
        learn_peer(&mut router, &mut bufs);

        let packet = transport_packet(&mut bufs, 16);
        router.output(&mut bufs, packet, None, far(), IpProtocol::Udp).unwrap();

        // Resolved via the gateway's hardware address, not the destination's.
        let egress = router.next_egress().unwrap();
        assert_eq!(egress.dst, PEER_HW);
        let mut frame = [0u8; 64];
        let len = bufs.copy_partial(egress.packet, &mut frame, 0);
        let header = Ipv4Packet::new_checked(&frame[..len]).unwrap();
        assert_eq!(header.dst_addr(), far());
        bufs.free(egress.packet);
    }

    #[test]
    fn oversize_is_unreachable() {
        let (mut router, mut bufs) = setup();
        learn_peer(&mut router, &mut bufs);
        let packet = transport_packet(&mut bufs, 2000);
        assert_eq!(
            router.output(&mut bufs, packet, None, peer(), IpProtocol::Udp),
            Err(Error::Unreachable));
        // The caller keeps the packet on error.
        assert!(bufs.is_live(packet));
        bufs.free(packet);
    }

    #[test]
    fn malformed_input_is_counted_not_surfaced() {
        let (mut router, mut bufs) = setup();

        let mut bytes = [0u8; 40];
        {
            let header = Ipv4Packet::new_unchecked_mut(&mut bytes[..]);
            Ipv4Repr {
                src_addr: peer(), dst_addr: local(),
                protocol: IpProtocol::Tcp, payload_len: 20, hop_limit: 64,
            }.emit(header, 7);
        }
        bytes[10] ^= 0xff; // corrupt the checksum

        let packet = bufs.alloc(Layer::Ethernet, bytes.len(), Kind::Pool).unwrap();
        bufs.fill(packet, 0, &bytes);
        assert!(router.input(&mut bufs, 0, packet).is_none());
        assert_eq!(router.stats.rx_malformed, 1);
        assert!(!bufs.is_live(packet));
    }

    #[test]
    fn echo_request_is_answered() {
        let (mut router, mut bufs) = setup();
        learn_peer(&mut router, &mut bufs);

        let mut bytes = [0u8; wire::ipv4::HEADER_LEN + 12];
        {
            let message = Icmpv4Packet::new_unchecked_mut(
                &mut bytes[wire::ipv4::HEADER_LEN..]);
            message.set_msg_type(Icmpv4Message::EchoRequest);
            message.set_msg_code(0);
            message.set_echo_ident(0x77);
            message.set_echo_seq_no(3);
            message.data_mut().copy_from_slice(&[1, 2, 3, 4]);
            message.fill_checksum();
        }
        {
            let header = Ipv4Packet::new_unchecked_mut(&mut bytes[..]);
            Ipv4Repr {
                src_addr: peer(), dst_addr: local(),
                protocol: IpProtocol::Icmp, payload_len: 12, hop_limit: 64,
            }.emit(header, 9);
        }

        let packet = bufs.alloc(Layer::Ethernet, bytes.len(), Kind::Pool).unwrap();
        bufs.fill(packet, 0, &bytes);
        assert!(router.input(&mut bufs, 0, packet).is_none());

        let egress = router.next_egress().unwrap();
        let mut frame = [0u8; 64];
        let len = bufs.copy_partial(egress.packet, &mut frame, 0);
        let header = Ipv4Packet::new_checked(&frame[..len]).unwrap();
        assert_eq!(header.dst_addr(), peer());
        let reply = Icmpv4Packet::new_checked(header.payload()).unwrap();
        assert_eq!(reply.msg_type(), Icmpv4Message::EchoReply);
        assert_eq!(reply.echo_ident(), 0x77);
        assert_eq!(reply.echo_seq_no(), 3);
        assert_eq!(reply.data(), &[1, 2, 3, 4]);
        bufs.free(egress.packet);
    }

    #[test]
    fn unknown_protocol_elicits_unreachable_unless_broadcast() {
        let (mut router, mut bufs) = setup();
        learn_peer(&mut router, &mut bufs);

        let mut deliver = |router: &mut Router<'static>, bufs: &mut Buffers<'static>,
            dst: Ipv4Address|
        {
            let mut bytes = [0u8; wire::ipv4::HEADER_LEN + 8];
            let header = Ipv4Packet::new_unchecked_mut(&mut bytes[..]);
            Ipv4Repr {
                src_addr: peer(), dst_addr: dst,
                protocol: IpProtocol::Unknown(200), payload_len: 8, hop_limit: 64,
            }.emit(header, 1);
            let packet = bufs.alloc(Layer::Ethernet, bytes.len(), Kind::Pool).unwrap();
            bufs.fill(packet, 0, &bytes);
            assert!(router.input(bufs, 0, packet).is_none());
        };

        deliver(&mut router, &mut bufs, local());
        let egress = router.next_egress().expect("protocol unreachable sent");
        let mut frame = [0u8; 64];
        let len = bufs.copy_partial(egress.packet, &mut frame, 0);
        let header = Ipv4Packet::new_checked(&frame[..len]).unwrap();
        let notice = Icmpv4Packet::new_checked(header.payload()).unwrap();
        assert_eq!(notice.msg_type(), Icmpv4Message::DstUnreachable);
        assert_eq!(notice.msg_code(), wire::icmpv4::UNREACH_PROTOCOL);
        bufs.free(egress.packet);

        // Never in response to a broadcast.
        deliver(&mut router, &mut bufs, Ipv4Address::BROADCAST);
        assert!(router.next_egress().is_none());
    }

    #[test]
    fn tcp_is_delivered_with_header_stripped() {
        let (mut router, mut bufs) = setup();

        let mut bytes = [0u8; wire::ipv4::HEADER_LEN + 20];
        {
            let header = Ipv4Packet::new_unchecked_mut(&mut bytes[..]);
            Ipv4Repr {
                src_addr: peer(), dst_addr: local(),
                protocol: IpProtocol::Tcp, payload_len: 20, hop_limit: 64,
            }.emit(header, 2);
        }
        bytes[wire::ipv4::HEADER_LEN] = 0xaa;

        // Deliberately longer than the datagram, like a padded frame.
        let packet = bufs.alloc(Layer::Ethernet, 60, Kind::Pool).unwrap();
        bufs.fill(packet, 0, &bytes);
        match router.input(&mut bufs, 0, packet) {
            Some(Deliver::Tcp { packet, src, dst, iface }) => {
                assert_eq!(src, peer());
                assert_eq!(dst, local());
                assert_eq!(iface, 0);
                // Padding trimmed, IP header stripped.
                assert_eq!(bufs.tot_len(packet), 20);
                assert_eq!(bufs.payload(packet)[0], 0xaa);
                bufs.free(packet);
            },
            other => panic!("expected TCP delivery, got {:?}", other),
        }
    }
}
