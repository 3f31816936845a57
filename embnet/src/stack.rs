//! The top-level stack context and the link-driver boundary.
//!
//! A [`Stack`] ties the allocators, the router and the TCP engine into one
//! single-threaded context. The driver side is the [`Device`] trait: the
//! polling loop pulls complete frames out of the device, runs them through
//! the layers, and pushes queued egress frames back into it. Timers are
//! driven separately through [`tick`] with a monotonic timestamp.
//!
//! [`Stack`]: struct.Stack.html
//! [`Device`]: trait.Device.html
//! [`tick`]: struct.Stack.html#method.tick
use crate::config::Config;
use crate::layer::ip::{Interface, Router};
use crate::layer::tcp::{Engine, PcbId, State};
use crate::layer::Result;
use crate::managed::Slice;
use crate::pbuf::{Buffers, Kind, Layer};
use crate::time::{Duration, Instant};
use crate::wire::{self, EtherType, EthernetFrame, EthernetRepr, Ipv4Address};

/// The link driver boundary.
///
/// Implementations wrap the hardware (or a test harness) that moves
/// complete Ethernet frames. Neither call may block: a driver with nothing
/// received returns `None`, one that cannot take a frame returns
/// [`Error::Exhausted`] and the stack treats the frame as lost.
///
/// [`Error::Exhausted`]: ../layer/enum.Error.html#variant.Exhausted
pub trait Device {
    /// Hand one complete frame to the hardware.
    fn transmit(&mut self, frame: &[u8]) -> Result<()>;

    /// Pull the next received frame, if any.
    ///
    /// The returned slice only needs to stay valid until the next call into
    /// the device; the stack copies what it keeps.
    fn receive(&mut self) -> Option<&[u8]>;
}

/// The interval of the delayed-acknowledgment timer.
const FAST_INTERVAL: Duration = Duration::from_millis(250);
/// The interval of the TCP retransmission and state timer.
const SLOW_INTERVAL: Duration = Duration::from_millis(500);
/// The interval of ARP cache aging.
const ARP_INTERVAL: Duration = Duration::from_secs(5);

/// Flattening room for one egress frame: header plus the largest payload
/// an interface may carry.
const SCRATCH_LEN: usize = wire::ethernet::HEADER_LEN + 1586;

/// One stack instance: allocators, router and TCP engine under a single
/// logical owner.
#[derive(Debug)]
pub struct Stack<'a> {
    bufs: Buffers<'a>,
    router: Router<'a>,
    tcp: Engine<'a>,
    scratch: Slice<'a, u8>,
    last_fast: Option<Instant>,
    last_slow: Option<Instant>,
    last_arp: Option<Instant>,
}

impl<'a> Stack<'a> {
    /// Create a stack with owned storage per the configuration.
    #[cfg(feature = "std")]
    pub fn new(config: &Config) -> Self {
        Self::with_storage(
            Buffers::new(config),
            Router::new(config),
            Engine::new(&config.tcp),
            vec![0u8; SCRATCH_LEN],
        )
    }

    /// Create a stack over caller-provided components and scratch storage.
    ///
    /// The scratch slice must hold one Ethernet header plus the largest MTU
    /// among the registered interfaces.
    pub fn with_storage<S>(
        bufs: Buffers<'a>,
        router: Router<'a>,
        tcp: Engine<'a>,
        scratch: S,
    ) -> Self
        where S: Into<Slice<'a, u8>>
    {
        Stack {
            bufs,
            router,
            tcp,
            scratch: scratch.into(),
            last_fast: None,
            last_slow: None,
            last_arp: None,
        }
    }

    /// Register an interface; the first one becomes the default route.
    pub fn add_iface(&mut self, iface: Interface<'a>) -> Result<usize> {
        self.router.add(iface)
    }

    /// Access a registered interface.
    pub fn iface(&self, index: usize) -> Option<&Interface<'a>> {
        self.router.iface(index)
    }

    /// Access a registered interface mutably.
    pub fn iface_mut(&mut self, index: usize) -> Option<&mut Interface<'a>> {
        self.router.iface_mut(index)
    }

    /// Open a connection to `remote:port`.
    pub fn connect(&mut self, remote: Ipv4Address, port: u16) -> Result<PcbId> {
        self.tcp.connect(&mut self.bufs, &mut self.router, remote, port)
    }

    /// Open a passive connection accepting peers on `port`.
    pub fn listen(&mut self, port: u16) -> Result<PcbId> {
        self.tcp.listen(port)
    }

    /// Take one established connection off a listener's backlog.
    pub fn accept(&mut self, listener: PcbId) -> Option<PcbId> {
        self.tcp.accept(listener)
    }

    /// The state of a connection.
    pub fn state(&self, id: PcbId) -> State {
        self.tcp.state(id)
    }

    /// Enqueue data on a connection; all-or-nothing.
    pub fn write(&mut self, id: PcbId, data: &[u8]) -> Result<usize> {
        let written = self.tcp.write(&mut self.bufs, id, data)?;
        self.tcp.output(&mut self.bufs, &mut self.router, id)?;
        Ok(written)
    }

    /// Pull received in-order data from a connection.
    pub fn read(&mut self, id: PcbId, dst: &mut [u8]) -> Result<usize> {
        self.tcp.read(&mut self.bufs, id, dst)
    }

    /// Close the sending direction and start teardown.
    pub fn close(&mut self, id: PcbId) -> Result<()> {
        self.tcp.close(&mut self.bufs, &mut self.router, id)
    }

    /// Tear a connection down immediately, resetting the peer.
    pub fn abort(&mut self, id: PcbId) {
        self.tcp.abort(&mut self.bufs, &mut self.router, id)
    }

    /// Exchange frames with the device on behalf of one interface.
    ///
    /// Drains the device receive side through the layers, then flushes the
    /// router's egress queue back into the device. Returns whether any
    /// frame moved in either direction.
    pub fn poll<D: Device>(&mut self, device: &mut D, iface: usize) -> bool {
        let mut activity = false;

        let own_hwaddr = match self.router.iface(iface) {
            Some(entry) => entry.hwaddr(),
            None => return false,
        };
        while let Some(frame) = device.receive() {
            activity = true;
            self.receive_frame(iface, own_hwaddr, frame);
        }

        while let Some(egress) = self.router.next_egress() {
            activity = true;
            let src = match self.router.iface(egress.iface) {
                Some(entry) => entry.hwaddr(),
                None => {
                    self.bufs.free(egress.packet);
                    continue;
                },
            };

            let total = self.bufs.tot_len(egress.packet);
            let frame_len = wire::ethernet::HEADER_LEN + total;
            if frame_len > self.scratch.len() {
                self.router.stats.tx_dropped += 1;
                self.bufs.free(egress.packet);
                continue;
            }
            {
                let scratch = &mut self.scratch[..frame_len];
                EthernetRepr {
                    src_addr: src,
                    dst_addr: egress.dst,
                    ethertype: egress.ethertype,
                }.emit(EthernetFrame::new_unchecked_mut(
                    &mut scratch[..wire::ethernet::HEADER_LEN]));
                self.bufs.copy_partial(egress.packet,
                    &mut scratch[wire::ethernet::HEADER_LEN..], 0);
            }
            self.bufs.free(egress.packet);

            // A refusing driver drops the frame; loss the peers absorb.
            if device.transmit(&self.scratch[..frame_len]).is_err() {
                net_debug!("stack: driver refused a frame");
                self.router.stats.tx_dropped += 1;
            }
        }
        activity
    }

    /// Run every timer that has come due at `now`.
    pub fn tick(&mut self, now: Instant) {
        if due(&mut self.last_fast, now, FAST_INTERVAL) {
            self.tcp.fast_tick(&mut self.bufs, &mut self.router);
        }
        if due(&mut self.last_slow, now, SLOW_INTERVAL) {
            self.tcp.slow_tick(&mut self.bufs, &mut self.router);
        }
        if due(&mut self.last_arp, now, ARP_INTERVAL) {
            self.router.tick(&mut self.bufs);
        }
    }

    /// Run one received frame through the layers.
    fn receive_frame(&mut self, iface: usize, own_hwaddr: wire::EthernetAddress,
        frame: &[u8])
    {
        let parsed = match EthernetFrame::new_checked(frame) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.router.stats.rx_malformed += 1;
                return;
            },
        };
        let dst = parsed.dst_addr();
        if dst != own_hwaddr && !dst.is_broadcast() && !dst.is_multicast() {
            return;
        }

        match parsed.ethertype() {
            EtherType::Arp => {
                self.router.process_arp(&mut self.bufs, iface, parsed.payload());
            },
            EtherType::Ipv4 => {
                let payload = parsed.payload();
                let packet = match self.bufs.alloc(Layer::Raw, payload.len(), Kind::Pool) {
                    Ok(packet) => packet,
                    Err(_) => {
                        net_debug!("stack: no buffer for a received frame");
                        self.router.stats.rx_dropped += 1;
                        return;
                    },
                };
                self.bufs.fill(packet, 0, payload);
                if let Some(deliver) = self.router.input(&mut self.bufs, iface, packet) {
                    self.tcp.input(&mut self.bufs, &mut self.router, deliver);
                }
            },
            EtherType::Unknown(_) => {},
        }
    }
}

fn due(last: &mut Option<Instant>, now: Instant, interval: Duration) -> bool {
    match *last {
        Some(at) if now < at + interval => false,
        _ => {
            *last = Some(now);
            true
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::wire::tcp::Flags;
    use crate::wire::{ArpOperation, ArpPacket, ArpRepr, EthernetAddress,
        Ipv4Cidr, Ipv4Packet, TcpPacket};

    const LOCAL_HW: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 1]);
    const PEER_HW: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 2]);

    fn local() -> Ipv4Address { Ipv4Address([192, 168, 1, 1]) }
    fn peer() -> Ipv4Address { Ipv4Address([192, 168, 1, 2]) }

    struct TestDevice {
        rx: Vec<Vec<u8>>,
        tx: Vec<Vec<u8>>,
        hold: Vec<u8>,
    }

    impl TestDevice {
        fn new() -> TestDevice {
            TestDevice { rx: Vec::new(), tx: Vec::new(), hold: Vec::new() }
        }
    }

    impl Device for TestDevice {
        fn transmit(&mut self, frame: &[u8]) -> Result<()> {
            self.tx.push(frame.to_vec());
            Ok(())
        }

        fn receive(&mut self) -> Option<&[u8]> {
            if self.rx.is_empty() {
                return None;
            }
            self.hold = self.rx.remove(0);
            Some(&self.hold)
        }
    }

    fn setup() -> Stack<'static> {
        let config = Config::default();
        let mut stack = Stack::new(&config);
        stack.add_iface(Interface::new(
            Ipv4Cidr::new(local(), 24), LOCAL_HW, 1500, &config.arp,
        )).unwrap();
        stack
    }

    fn arp_reply_frame() -> Vec<u8> {
        let mut frame = vec![0u8; wire::ethernet::HEADER_LEN + wire::arp::PACKET_LEN];
        EthernetRepr {
            src_addr: PEER_HW,
            dst_addr: LOCAL_HW,
            ethertype: EtherType::Arp,
        }.emit(EthernetFrame::new_unchecked_mut(&mut frame[..wire::ethernet::HEADER_LEN]));
        ArpRepr {
            operation: ArpOperation::Reply,
            source_hardware_addr: PEER_HW,
            source_protocol_addr: peer(),
            target_hardware_addr: LOCAL_HW,
            target_protocol_addr: local(),
        }.emit(ArpPacket::new_unchecked_mut(&mut frame[wire::ethernet::HEADER_LEN..]));
        frame
    }

    #[test]
    fn poll_answers_arp_requests() {
        let mut stack = setup();
        let mut device = TestDevice::new();

        let mut frame = vec![0u8; wire::ethernet::HEADER_LEN + wire::arp::PACKET_LEN];
        EthernetRepr {
            src_addr: PEER_HW,
            dst_addr: EthernetAddress::BROADCAST,
            ethertype: EtherType::Arp,
        }.emit(EthernetFrame::new_unchecked_mut(&mut frame[..wire::ethernet::HEADER_LEN]));
        ArpRepr {
            operation: ArpOperation::Request,
            source_hardware_addr: PEER_HW,
            source_protocol_addr: peer(),
            target_hardware_addr: EthernetAddress([0; 6]),
            target_protocol_addr: local(),
        }.emit(ArpPacket::new_unchecked_mut(&mut frame[wire::ethernet::HEADER_LEN..]));
        device.rx.push(frame);

        assert!(stack.poll(&mut device, 0));

        assert_eq!(device.tx.len(), 1);
        let reply = EthernetFrame::new_checked(&device.tx[0]).unwrap();
        assert_eq!(reply.dst_addr(), PEER_HW);
        assert_eq!(reply.src_addr(), LOCAL_HW);
        assert_eq!(reply.ethertype(), EtherType::Arp);
        let repr = ArpRepr::parse(ArpPacket::new_checked(reply.payload()).unwrap()).unwrap();
        assert_eq!(repr.operation, ArpOperation::Reply);
        assert_eq!(repr.source_protocol_addr, local());
    }

    #[test]
    fn connect_resolves_then_sends_the_syn() {
        let mut stack = setup();
        let mut device = TestDevice::new();

        stack.connect(peer(), 80).unwrap();

        // First poll: the SYN waits on resolution, only the request leaves.
        stack.poll(&mut device, 0);
        assert_eq!(device.tx.len(), 1);
        let request = EthernetFrame::new_checked(&device.tx[0]).unwrap();
        assert_eq!(request.ethertype(), EtherType::Arp);
        assert_eq!(request.dst_addr(), EthernetAddress::BROADCAST);

        // The reply releases it.
        device.rx.push(arp_reply_frame());
        stack.poll(&mut device, 0);
        assert_eq!(device.tx.len(), 2);
        let frame = EthernetFrame::new_checked(&device.tx[1]).unwrap();
        assert_eq!(frame.ethertype(), EtherType::Ipv4);
        assert_eq!(frame.dst_addr(), PEER_HW);
        let header = Ipv4Packet::new_checked(frame.payload()).unwrap();
        let segment = TcpPacket::new_checked(header.payload()).unwrap();
        assert!(segment.flags().contains(Flags::SYN));
    }

    #[test]
    fn tick_retransmits_an_unanswered_syn() {
        let mut stack = setup();
        let mut device = TestDevice::new();

        stack.connect(peer(), 80).unwrap();
        device.rx.push(arp_reply_frame());
        stack.poll(&mut device, 0);
        let sent = device.tx.len();
        let first = {
            let frame = EthernetFrame::new_checked(&device.tx[sent - 1]).unwrap();
            let header = Ipv4Packet::new_checked(frame.payload()).unwrap();
            TcpPacket::new_checked(header.payload()).unwrap().seq_number()
        };

        // Three slow-timer periods without an answer hit the initial
        // retransmission timeout.
        for ticks in 0..3i64 {
            stack.tick(Instant::from_millis(ticks * 500));
            stack.poll(&mut device, 0);
        }

        assert_eq!(device.tx.len(), sent + 1);
        let frame = EthernetFrame::new_checked(&device.tx[sent]).unwrap();
        let header = Ipv4Packet::new_checked(frame.payload()).unwrap();
        let segment = TcpPacket::new_checked(header.payload()).unwrap();
        assert!(segment.flags().contains(Flags::SYN));
        assert_eq!(segment.seq_number(), first);
    }
}
