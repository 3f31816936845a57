use super::*;

use crate::config::Config;
use crate::layer::ip::Deliver;
use crate::layer::ip::Interface;
use crate::pbuf::{Kind, Layer};
use crate::wire::{self, ArpOperation, ArpPacket, ArpRepr, EthernetAddress, Ipv4Cidr,
    Ipv4Packet, Ipv4Repr, TcpPacket, TcpRepr};

const LOCAL_HW: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 1]);
const PEER_HW: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0, 2]);

fn local() -> Ipv4Address { Ipv4Address([192, 168, 1, 1]) }
fn peer() -> Ipv4Address { Ipv4Address([192, 168, 1, 2]) }

const MSS: u16 = 536;
const PEER_WND: u16 = 8192;

fn setup() -> (Engine<'static>, Router<'static>, Buffers<'static>) {
    let config = Config::default();
    let mut router = Router::new(&config);
    router.add(Interface::new(
        Ipv4Cidr::new(local(), 24), LOCAL_HW, 1500, &config.arp,
    )).unwrap();
    let mut bufs = Buffers::new(&config);

    // Resolve the peer up front so segments go straight to egress.
    let mut frame = [0u8; wire::arp::PACKET_LEN];
    ArpRepr {
        operation: ArpOperation::Reply,
        source_hardware_addr: PEER_HW,
        source_protocol_addr: peer(),
        target_hardware_addr: LOCAL_HW,
        target_protocol_addr: local(),
    }.emit(ArpPacket::new_unchecked_mut(&mut frame[..]));
    router.process_arp(&mut bufs, 0, &frame);

    (Engine::new(&config.tcp), router, bufs)
}

/// Pop the next egress frame and parse it as a TCP segment.
fn pop_segment(router: &mut Router, bufs: &mut Buffers) -> Option<(TcpRepr, Vec<u8>)> {
    let egress = router.next_egress()?;
    let mut frame = [0u8; 1600];
    let len = bufs.copy_partial(egress.packet, &mut frame, 0);
    bufs.free(egress.packet);

    let header = Ipv4Packet::new_checked(&frame[..len]).unwrap();
    assert!(header.verify_checksum());
    Ipv4Repr::parse(header).unwrap();
    let segment = TcpPacket::new_checked(header.payload()).unwrap();
    assert!(segment.verify_checksum(local(), peer()));
    let repr = TcpRepr::parse(segment).unwrap();
    Some((repr, segment.payload().to_vec()))
}

/// Feed a segment from the peer into the engine.
fn inject(
    engine: &mut Engine,
    router: &mut Router,
    bufs: &mut Buffers,
    repr: TcpRepr,
    data: &[u8],
) {
    let header_len = repr.header_len();
    let len = header_len + data.len();
    let packet = bufs.alloc(Layer::Transport, len, Kind::Pool).unwrap();
    {
        let bytes = bufs.payload_mut(packet);
        repr.emit(TcpPacket::new_unchecked_mut(&mut bytes[..header_len]));
        bytes[header_len..len].copy_from_slice(data);
        TcpPacket::new_unchecked_mut(&mut bytes[..len])
            .fill_checksum(peer(), local());
    }
    engine.input(bufs, router, Deliver::Tcp {
        packet, src: peer(), dst: local(), iface: 0,
    });
}

fn segment_to(port: u16, seq: SeqNumber, ack: Option<SeqNumber>, flags: Flags) -> TcpRepr {
    TcpRepr {
        src_port: 80,
        dst_port: port,
        seq_number: seq,
        ack_number: ack,
        flags,
        window_len: PEER_WND,
        max_seg_size: None,
    }
}

/// Drive the active-open handshake to completion.
///
/// Returns the connection, our first data sequence number, the port the
/// peer sees us on, and the peer's next sequence number.
fn established() -> (Engine<'static>, Router<'static>, Buffers<'static>,
    PcbId, SeqNumber, u16, SeqNumber)
{
    let (mut engine, mut router, mut bufs) = setup();
    let id = engine.connect(&mut bufs, &mut router, peer(), 80).unwrap();

    let (syn, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert!(syn.flags.contains(Flags::SYN));
    assert_eq!(syn.max_seg_size, Some(MSS));
    assert_eq!(syn.ack_number, None);
    let iss = syn.seq_number;
    let port = syn.src_port;

    let peer_iss = SeqNumber(9000);
    inject(&mut engine, &mut router, &mut bufs, TcpRepr {
        max_seg_size: Some(1460),
        ..segment_to(port, peer_iss, Some(iss + 1), Flags::SYN)
    }, &[]);
    assert_eq!(engine.state(id), State::Established);

    let (ack, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(ack.ack_number, Some(peer_iss + 1));
    assert!(router.next_egress().is_none());

    (engine, router, bufs, id, iss + 1, port, peer_iss + 1)
}

#[test]
fn handshake_completes() {
    let (engine, _, _, id, _, _, _) = established();
    assert_eq!(engine.state(id), State::Established);
}

#[test]
fn passive_open_accepts_connection() {
    let (mut engine, mut router, mut bufs) = setup();
    let listener = engine.listen(80).unwrap();
    assert_eq!(engine.state(listener), State::Listen);

    let peer_iss = SeqNumber(400);
    inject(&mut engine, &mut router, &mut bufs, TcpRepr {
        src_port: 1234,
        dst_port: 80,
        seq_number: peer_iss,
        ack_number: None,
        flags: Flags::SYN,
        window_len: PEER_WND,
        max_seg_size: Some(1460),
    }, &[]);

    let (synack, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert!(synack.flags.contains(Flags::SYN));
    assert_eq!(synack.ack_number, Some(peer_iss + 1));
    assert_eq!(synack.max_seg_size, Some(MSS));

    // Nothing to accept before the handshake finishes.
    assert_eq!(engine.accept(listener), None);

    inject(&mut engine, &mut router, &mut bufs, TcpRepr {
        src_port: 1234,
        dst_port: 80,
        seq_number: peer_iss + 1,
        ack_number: Some(synack.seq_number + 1),
        flags: Flags::EMPTY,
        window_len: PEER_WND,
        max_seg_size: None,
    }, &[]);

    let child = engine.accept(listener).expect("connection is established");
    assert_eq!(engine.state(child), State::Established);
    // The backlog was drained.
    assert_eq!(engine.accept(listener), None);
}

#[test]
fn write_segments_at_mss_with_push() {
    let (mut engine, mut router, mut bufs, id, snd, _, rcv) = established();
    // Room for both segments right away.
    engine.pcb_at(id.0).cwnd = 4 * u32::from(MSS);

    let data = [0x5au8; 1000];
    assert_eq!(engine.write(&mut bufs, id, &data), Ok(1000));
    engine.output(&mut bufs, &mut router, id).unwrap();

    let (first, body) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(first.seq_number, snd);
    assert_eq!(body.len(), usize::from(MSS));
    assert!(!first.flags.contains(Flags::PSH));
    assert_eq!(first.ack_number, Some(rcv));

    let (second, body) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(second.seq_number, snd + usize::from(MSS));
    assert_eq!(body.len(), 1000 - usize::from(MSS));
    // The last segment of the write carries PSH.
    assert!(second.flags.contains(Flags::PSH));

    assert!(router.next_egress().is_none());
}

#[test]
fn small_writes_merge_into_one_segment() {
    let (mut engine, mut router, mut bufs, id, snd, _, _) = established();

    assert_eq!(engine.write(&mut bufs, id, &[1u8; 100]), Ok(100));
    assert_eq!(engine.write(&mut bufs, id, &[2u8; 100]), Ok(100));
    let unsent = engine.pcb_at(id.0).unsent;
    assert_eq!(engine.segs.count(unsent), 1);

    engine.output(&mut bufs, &mut router, id).unwrap();
    let (repr, body) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(repr.seq_number, snd);
    assert_eq!(body.len(), 200);
    assert_eq!(&body[..100], &[1u8; 100][..]);
    assert_eq!(&body[100..], &[2u8; 100][..]);
    assert!(repr.flags.contains(Flags::PSH));
}

#[test]
fn nagle_withholds_short_segment_in_flight() {
    let (mut engine, mut router, mut bufs, id, _, port, rcv) = established();

    engine.write(&mut bufs, id, &[1u8; 10]).unwrap();
    engine.output(&mut bufs, &mut router, id).unwrap();
    let (first, _) = pop_segment(&mut router, &mut bufs).unwrap();

    // A second short segment waits for the acknowledgment.
    engine.write(&mut bufs, id, &[2u8; 10]).unwrap();
    engine.output(&mut bufs, &mut router, id).unwrap();
    assert!(router.next_egress().is_none());

    // Memory pressure overrides the withholding.
    engine.pcb_at(id.0).nagle_memerr = true;
    engine.output(&mut bufs, &mut router, id).unwrap();
    let (second, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(second.seq_number, first.seq_number + 10);

    // Silence the retransmission state for leak-free teardown.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(second.seq_number + 10), Flags::EMPTY), &[]);
}

#[test]
fn in_order_data_is_readable() {
    let (mut engine, mut router, mut bufs, id, _, port, rcv) = established();

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, None, Flags::PSH), b"hello");

    let mut dst = [0u8; 16];
    assert_eq!(engine.read(&mut bufs, id, &mut dst), Ok(5));
    assert_eq!(&dst[..5], b"hello");
    // Drained; the next read finds nothing.
    assert_eq!(engine.read(&mut bufs, id, &mut dst), Ok(0));
}

#[test]
fn every_second_segment_is_acked_immediately() {
    let (mut engine, mut router, mut bufs, _, _, port, rcv) = established();

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, None, Flags::PSH), b"aaaa");
    // The first in-order arrival only starts the delayed-ack clock.
    assert!(router.next_egress().is_none());

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv + 4, None, Flags::PSH), b"bbbb");
    let (ack, body) = pop_segment(&mut router, &mut bufs).unwrap();
    assert!(body.is_empty());
    assert_eq!(ack.ack_number, Some(rcv + 8));
}

#[test]
fn delayed_ack_flushes_on_fast_tick() {
    let (mut engine, mut router, mut bufs, _, _, port, rcv) = established();

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, None, Flags::PSH), b"aaaa");
    assert!(router.next_egress().is_none());

    engine.fast_tick(&mut bufs, &mut router);
    let (ack, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(ack.ack_number, Some(rcv + 4));
    // Nothing pending afterwards.
    engine.fast_tick(&mut bufs, &mut router);
    assert!(router.next_egress().is_none());
}

#[test]
fn out_of_order_data_waits_for_the_gap() {
    let (mut engine, mut router, mut bufs, id, _, port, rcv) = established();

    // The far half arrives first and is answered with a duplicate ack.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv + 5, None, Flags::PSH), b"world");
    let (dup, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(dup.ack_number, Some(rcv));

    let mut dst = [0u8; 16];
    assert_eq!(engine.read(&mut bufs, id, &mut dst), Ok(0));

    // The gap fills and both halves become readable at once.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, None, Flags::PSH), b"hello");
    assert_eq!(engine.read(&mut bufs, id, &mut dst), Ok(10));
    assert_eq!(&dst[..10], b"helloworld");
}

#[test]
fn slow_start_doubles_per_round_trip() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();
    assert_eq!(engine.pcb_at(id.0).cwnd, u32::from(MSS));

    let data = [0u8; 4 * 536];
    engine.write(&mut bufs, id, &data).unwrap();
    engine.output(&mut bufs, &mut router, id).unwrap();

    // One congestion window of one segment is in flight.
    assert!(pop_segment(&mut router, &mut bufs).is_some());
    assert!(router.next_egress().is_none());

    // Its ack grows the window by one segment: two go out.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd + 536), Flags::EMPTY), &[]);
    assert_eq!(engine.pcb_at(id.0).cwnd, 2 * u32::from(MSS));
    assert!(pop_segment(&mut router, &mut bufs).is_some());
    assert!(pop_segment(&mut router, &mut bufs).is_some());
    assert!(router.next_egress().is_none());

    // One more segment of window per acknowledgment: 1, 2, 4 in flight
    // over the round trips.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd + 2 * 536), Flags::EMPTY), &[]);
    assert_eq!(engine.pcb_at(id.0).cwnd, 3 * u32::from(MSS));
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd + 3 * 536), Flags::EMPTY), &[]);
    assert_eq!(engine.pcb_at(id.0).cwnd, 4 * u32::from(MSS));
}

#[test]
fn fast_retransmit_on_third_duplicate_ack() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();

    engine.write(&mut bufs, id, &[0u8; 536]).unwrap();
    engine.output(&mut bufs, &mut router, id).unwrap();
    let (first, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(first.seq_number, snd);
    let cwnd = engine.pcb_at(id.0).cwnd;

    for _ in 0..2 {
        inject(&mut engine, &mut router, &mut bufs,
            segment_to(port, rcv, Some(snd), Flags::EMPTY), &[]);
        assert!(router.next_egress().is_none());
    }
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd), Flags::EMPTY), &[]);

    // The third duplicate resends the oldest segment and enters recovery.
    let (rexmit, body) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(rexmit.seq_number, snd);
    assert_eq!(body.len(), 536);

    let mss = u32::from(MSS);
    let expect_ssthresh = (cwnd.max(u32::from(PEER_WND)) / 2).max(2 * mss);
    let pcb = engine.pcb_at(id.0);
    assert_eq!(pcb.ssthresh, expect_ssthresh);
    assert_eq!(pcb.cwnd, expect_ssthresh + 3 * mss);
    assert!(pcb.infr);
    assert_eq!(pcb.nrtx, 1);
    assert_eq!(pcb.dupacks, 3);

    // A further duplicate inflates the window by one segment.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd), Flags::EMPTY), &[]);
    assert_eq!(engine.pcb_at(id.0).cwnd, expect_ssthresh + 4 * mss);

    // The recovering ack deflates to the slow-start threshold and then
    // grows the window by one congestion-avoidance step.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd + 536), Flags::EMPTY), &[]);
    let pcb = engine.pcb_at(id.0);
    assert!(!pcb.infr);
    assert_eq!(pcb.cwnd, expect_ssthresh + mss * mss / expect_ssthresh);
    assert_eq!(pcb.nrtx, 0);
}

#[test]
fn fast_retransmit_resends_a_short_segment() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();
    engine.pcb_at(id.0).cwnd = 2 * u32::from(MSS);

    // A short segment followed by a full one, both in flight.
    engine.write(&mut bufs, id, &[1u8; 300]).unwrap();
    engine.output(&mut bufs, &mut router, id).unwrap();
    engine.write(&mut bufs, id, &[2u8; 536]).unwrap();
    engine.output(&mut bufs, &mut router, id).unwrap();
    let (first, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(first.seq_number, snd);
    let (second, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(second.seq_number, snd + 300);

    for _ in 0..2 {
        inject(&mut engine, &mut router, &mut bufs,
            segment_to(port, rcv, Some(snd), Flags::EMPTY), &[]);
        assert!(router.next_egress().is_none());
    }
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd), Flags::EMPTY), &[]);

    // Recovery resends the short segment even though the full one is
    // still unacknowledged; it is not withheld for coalescing.
    let (rexmit, body) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(rexmit.seq_number, snd);
    assert_eq!(body.len(), 300);
    assert!(engine.pcb_at(id.0).infr);

    // Silence the retransmission state for leak-free teardown.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd + 836), Flags::EMPTY), &[]);
    assert!(!engine.pcb_at(id.0).infr);
}

#[test]
fn timeout_requeues_all_in_flight_in_order() {
    let (mut engine, mut router, mut bufs, id, snd, _, _) = established();
    engine.pcb_at(id.0).cwnd = 4 * u32::from(MSS);

    engine.write(&mut bufs, id, &[0u8; 1000]).unwrap();
    engine.output(&mut bufs, &mut router, id).unwrap();
    let (first, _) = pop_segment(&mut router, &mut bufs).unwrap();
    let (second, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(first.seq_number, snd);
    assert_eq!(second.seq_number, snd + 536);
    let wnd = engine.pcb_at(id.0).snd_wnd;
    let cwnd = engine.pcb_at(id.0).cwnd;

    // No acknowledgment arrives; run the slow timer into the timeout.
    let rto = engine.pcb_at(id.0).rto;
    for _ in 0..rto {
        engine.slow_tick(&mut bufs, &mut router);
    }

    let mss = u32::from(MSS);
    {
        let pcb = engine.pcb_at(id.0);
        // The counter moves by exactly one for the whole timeout.
        assert_eq!(pcb.nrtx, 1);
        assert_eq!(pcb.ssthresh, (cwnd.min(u32::from(wnd)) / 2).max(2 * mss));
        assert_eq!(pcb.cwnd, mss);
        assert_eq!(pcb.rttest, None);
    }

    // With the window back to one segment only the first is resent; the
    // second waits at the front of the unsent queue, order preserved.
    let (rexmit, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(rexmit.seq_number, snd);
    assert!(router.next_egress().is_none());
    let unsent = engine.pcb_at(id.0).unsent.expect("second segment requeued");
    assert_eq!(engine.segs.get(unsent).seq, snd + 536);
}

#[test]
fn connection_times_out_after_retransmission_limit() {
    let (mut engine, mut router, mut bufs, id, _, _, _) = established();

    engine.write(&mut bufs, id, &[0u8; 100]).unwrap();
    engine.output(&mut bufs, &mut router, id).unwrap();
    while let Some((_, _)) = pop_segment(&mut router, &mut bufs) {}

    // Exhaust every retransmission; the connection dies silently.
    for _ in 0..10_000 {
        if engine.state(id) == State::Closed {
            break;
        }
        engine.slow_tick(&mut bufs, &mut router);
        while let Some((_, _)) = pop_segment(&mut router, &mut bufs) {}
    }
    assert_eq!(engine.state(id), State::Closed);
    assert!(engine.pcb_at(id.0).reset);

    let mut dst = [0u8; 8];
    assert_eq!(engine.read(&mut bufs, id, &mut dst), Err(Error::Closed));
}

#[test]
fn close_handshake_reaches_time_wait() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();

    engine.close(&mut bufs, &mut router, id).unwrap();
    assert_eq!(engine.state(id), State::FinWait1);
    let (fin, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert!(fin.flags.contains(Flags::FIN));
    assert_eq!(fin.seq_number, snd);

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd + 1), Flags::EMPTY), &[]);
    assert_eq!(engine.state(id), State::FinWait2);

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd + 1), Flags::FIN), &[]);
    assert_eq!(engine.state(id), State::TimeWait);
    let (ack, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(ack.ack_number, Some(rcv + 1));

    // Two segment lifetimes later the slot is reclaimed.
    for _ in 0..240 {
        engine.slow_tick(&mut bufs, &mut router);
    }
    assert_eq!(engine.state(id), State::Closed);
}

#[test]
fn simultaneous_close_passes_through_closing() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();

    engine.close(&mut bufs, &mut router, id).unwrap();
    pop_segment(&mut router, &mut bufs).unwrap();

    // The peer's FIN crosses ours on the wire.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd), Flags::FIN), &[]);
    assert_eq!(engine.state(id), State::Closing);

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv + 1, Some(snd + 1), Flags::EMPTY), &[]);
    assert_eq!(engine.state(id), State::TimeWait);
}

#[test]
fn passive_close_finishes_in_last_ack() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd), Flags::FIN), &[]);
    assert_eq!(engine.state(id), State::CloseWait);

    let mut dst = [0u8; 8];
    assert_eq!(engine.read(&mut bufs, id, &mut dst), Err(Error::Closed));

    engine.close(&mut bufs, &mut router, id).unwrap();
    assert_eq!(engine.state(id), State::LastAck);
    // The final ack releases the slot.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv + 1, Some(snd + 1), Flags::EMPTY), &[]);
    assert_eq!(engine.state(id), State::Closed);
}

#[test]
fn close_wait_reacks_a_retransmitted_fin() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd), Flags::FIN), &[]);
    assert_eq!(engine.state(id), State::CloseWait);
    let (ack, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(ack.ack_number, Some(rcv + 1));

    // The ack was lost and the peer sends its FIN again; the duplicate
    // is acknowledged once more.
    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, Some(snd), Flags::FIN), &[]);
    let (again, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert_eq!(again.ack_number, Some(rcv + 1));
    assert_eq!(engine.state(id), State::CloseWait);
}

#[test]
fn peer_reset_surfaces_on_read() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();
    let _ = snd;

    inject(&mut engine, &mut router, &mut bufs,
        segment_to(port, rcv, None, Flags::RST), &[]);
    assert_eq!(engine.state(id), State::Closed);

    let mut dst = [0u8; 8];
    assert_eq!(engine.read(&mut bufs, id, &mut dst), Err(Error::Closed));
    assert_eq!(engine.write(&mut bufs, id, b"x"), Err(Error::Closed));
}

#[test]
fn segment_without_context_is_reset() {
    let (mut engine, mut router, mut bufs) = setup();

    inject(&mut engine, &mut router, &mut bufs, TcpRepr {
        src_port: 5555,
        dst_port: 7777,
        seq_number: SeqNumber(100),
        ack_number: None,
        flags: Flags::SYN,
        window_len: PEER_WND,
        max_seg_size: None,
    }, &[]);

    let (rst, _) = pop_segment(&mut router, &mut bufs).unwrap();
    assert!(rst.flags.contains(Flags::RST));
    // The reset acknowledges the sequence space of the offending SYN.
    assert_eq!(rst.ack_number, Some(SeqNumber(101)));
}

#[test]
fn write_is_all_or_nothing_on_budget() {
    let (mut engine, _router, mut bufs, id, _, _, _) = established();
    let budget = usize::from(engine.config.snd_buf);

    let data = vec![0u8; budget + 1];
    assert_eq!(engine.write(&mut bufs, id, &data), Err(Error::Exhausted));
    // Nothing was enqueued by the failed write.
    assert!(engine.pcb_at(id.0).unsent.is_none());
    assert_eq!(engine.pcb_at(id.0).queuelen, 0);

    assert_eq!(engine.write(&mut bufs, id, &data[..budget]), Ok(budget));
}

#[test]
fn window_update_follows_newer_segments_only() {
    let (mut engine, mut router, mut bufs, id, snd, port, rcv) = established();

    inject(&mut engine, &mut router, &mut bufs, TcpRepr {
        window_len: 16384,
        ..segment_to(port, rcv, Some(snd), Flags::EMPTY)
    }, &[]);
    assert_eq!(engine.pcb_at(id.0).snd_wnd, 16384);

    // An older segment must not shrink the window back.
    inject(&mut engine, &mut router, &mut bufs, TcpRepr {
        window_len: 1024,
        ..segment_to(port, SeqNumber(rcv.0 - 1), Some(snd), Flags::EMPTY)
    }, &[]);
    assert_eq!(engine.pcb_at(id.0).snd_wnd, 16384);
}
