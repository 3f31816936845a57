//! Inbound segment processing: demux, acceptance, acknowledgment.
use crate::pbuf::{Buffers, PbufId};
use crate::wire::tcp::Flags;
use crate::wire::{self, SeqNumber, TcpPacket, TcpRepr};

use super::super::ip::{Deliver, Router};
use super::segment::Segment;
use super::{Engine, State};

impl<'a> Engine<'a> {
    /// Process one segment handed up by the router.
    ///
    /// The packet starts at the TCP header and is owned by this call: it is
    /// freed, or its payload is threaded into a receive queue.
    pub fn input(&mut self, bufs: &mut Buffers, router: &mut Router, delivery: Deliver) {
        let Deliver::Tcp { packet, src, dst, .. } = delivery;

        let parsed = {
            let bytes = bufs.payload(packet);
            TcpPacket::new_checked(bytes).and_then(|segment| {
                if !segment.verify_checksum(src, dst) {
                    return Err(wire::Error::Malformed);
                }
                TcpRepr::parse(segment).map(|repr| (repr, segment.header_len()))
            })
        };
        let (repr, header_len) = match parsed {
            Ok(parsed) => parsed,
            Err(_) => {
                net_debug!("tcp: rx malformed segment from {}", src);
                router.stats.rx_malformed += 1;
                bufs.free(packet);
                return;
            },
        };

        // An exact four-tuple match wins over everything.
        let active = self.pcbs.iter().position(|slot| {
            slot.0.as_ref().map_or(false, |pcb| {
                pcb.state.active()
                    && pcb.local_addr == dst && pcb.local_port == repr.dst_port
                    && pcb.remote_addr == src && pcb.remote_port == repr.src_port
            })
        });
        if let Some(index) = active {
            self.process(bufs, router, index as u16, repr, header_len, packet);
            return;
        }

        // TIME_WAIT: acknowledge stray retransmissions, accept nothing.
        let waiting = self.pcbs.iter().position(|slot| {
            slot.0.as_ref().map_or(false, |pcb| {
                pcb.state == State::TimeWait
                    && pcb.local_addr == dst && pcb.local_port == repr.dst_port
                    && pcb.remote_addr == src && pcb.remote_port == repr.src_port
            })
        });
        if let Some(index) = waiting {
            if !repr.flags.contains(Flags::RST) {
                self.send_empty_ack_at(bufs, router, index as u16);
            }
            bufs.free(packet);
            return;
        }

        // A SYN may open a connection on a listening port.
        let listening = self.pcbs.iter().any(|slot| {
            slot.0.as_ref().map_or(false, |pcb| {
                pcb.state == State::Listen && pcb.local_port == repr.dst_port
            })
        });
        if listening {
            self.process_listen(bufs, router, &repr, src, dst);
            bufs.free(packet);
            return;
        }

        // No context at all: answer with a reset, except to a reset.
        if !repr.flags.contains(Flags::RST) {
            let (seq, ack) = match repr.ack_number {
                Some(ack) => (ack, None),
                None => {
                    let len = bufs.tot_len(packet) - header_len
                        + repr.flags.sequence_len();
                    (SeqNumber(0), Some(repr.seq_number + len))
                },
            };
            self.send_reset(bufs, router, dst, repr.dst_port,
                src, repr.src_port, seq, ack);
        }
        bufs.free(packet);
    }

    /// A SYN arrived for a listening port: set up the passive side of the
    /// handshake in a fresh slot.
    fn process_listen(
        &mut self,
        bufs: &mut Buffers,
        router: &mut Router,
        repr: &TcpRepr,
        src: wire::Ipv4Address,
        dst: wire::Ipv4Address,
    ) {
        if repr.flags.contains(Flags::RST) {
            return;
        }
        if let Some(ack) = repr.ack_number {
            // An ACK on a listening port answers to nothing we sent.
            self.send_reset(bufs, router, dst, repr.dst_port,
                src, repr.src_port, ack, None);
            return;
        }
        if !repr.flags.contains(Flags::SYN) {
            return;
        }

        let index = match self.alloc_pcb() {
            Ok(index) => index,
            Err(_) => {
                net_debug!("tcp: no slot for connection from {}:{}", src, repr.src_port);
                router.stats.rx_dropped += 1;
                return;
            },
        };
        let iss = self.next_iss();
        let config_mss = self.config.mss;
        {
            let pcb = self.pcb_at(index);
            pcb.state = State::SynRcvd;
            pcb.local_addr = dst;
            pcb.local_port = repr.dst_port;
            pcb.remote_addr = src;
            pcb.remote_port = repr.src_port;
            pcb.rcv_nxt = repr.seq_number + 1;
            pcb.lastack = iss;
            pcb.snd_nxt = iss;
            pcb.mss = repr.max_seg_size.unwrap_or(536).min(config_mss);
            pcb.cwnd = u32::from(pcb.mss);
            pcb.snd_wnd = repr.window_len;
            pcb.snd_wl1 = repr.seq_number;
            pcb.snd_wl2 = iss;
        }

        // The queued SYN picks up the ACK flag at transmission.
        if self.enqueue_flags(index, Flags::SYN, iss).is_err() {
            self.release(bufs, index);
            return;
        }
        self.output_at(bufs, router, index);
    }

    /// Run a segment through the state machine of a matched connection.
    fn process(
        &mut self,
        bufs: &mut Buffers,
        router: &mut Router,
        index: u16,
        repr: TcpRepr,
        header_len: usize,
        packet: PbufId,
    ) {
        let payload_len = bufs.tot_len(packet) - header_len;

        if self.pcb_at(index).state == State::SynSent {
            self.process_synsent(bufs, router, index, &repr, packet);
            return;
        }

        let seq = repr.seq_number;

        // A reset is honored when it falls into the receive window.
        if repr.flags.contains(Flags::RST) {
            let (rcv_nxt, rcv_wnd) = {
                let pcb = self.pcb_at(index);
                (pcb.rcv_nxt, pcb.rcv_wnd)
            };
            if seq == rcv_nxt || seq.within(rcv_nxt, rcv_nxt + usize::from(rcv_wnd)) {
                net_debug!("tcp: connection reset by peer");
                self.kill(bufs, index);
            }
            bufs.free(packet);
            return;
        }

        // A repeated SYN means our SYN+ACK was lost; acknowledge again.
        if repr.flags.contains(Flags::SYN) {
            if seq + 1 == self.pcb_at(index).rcv_nxt {
                self.pcb_at(index).ack_now = true;
                bufs.free(packet);
                self.output_at(bufs, router, index);
            } else {
                bufs.free(packet);
            }
            return;
        }

        if repr.ack_number.is_some() {
            {
                let pcb = self.pcb_at(index);
                if pcb.state == State::SynRcvd {
                    let ack = repr.ack_number.unwrap_or(pcb.lastack);
                    if ack.within(pcb.lastack + 1, pcb.snd_nxt + 1) {
                        pcb.state = State::Established;
                    } else {
                        let ctx = (pcb.local_addr, pcb.local_port,
                            pcb.remote_addr, pcb.remote_port);
                        self.send_reset(bufs, router, ctx.0, ctx.1, ctx.2, ctx.3,
                            ack, None);
                        bufs.free(packet);
                        return;
                    }
                }
            }
            if self.process_ack(bufs, index, &repr, payload_len) {
                // The slot is gone; the final ACK of our FIN arrived.
                bufs.free(packet);
                return;
            }
        }

        let state = self.pcb_at(index).state;
        let fin = repr.flags.contains(Flags::FIN);
        let mut consumed = false;
        // After the peer closed, duplicates of its data or FIN still reach
        // this path so they are acknowledged again.
        if (payload_len > 0 || fin)
            && matches!(state, State::Established | State::FinWait1 | State::FinWait2
                | State::CloseWait | State::Closing | State::LastAck)
        {
            // Only payload bytes enter the queues.
            bufs.header(packet, -(header_len as i32))
                .expect("header bytes are present");
            consumed = self.receive_data(bufs, index, seq, fin, packet);
        }
        if !consumed {
            bufs.free(packet);
        }

        self.output_at(bufs, router, index);
    }

    /// The active side of the handshake: wait for the SYN+ACK.
    fn process_synsent(
        &mut self,
        bufs: &mut Buffers,
        router: &mut Router,
        index: u16,
        repr: &TcpRepr,
        packet: PbufId,
    ) {
        let ack_ok = repr.ack_number.map_or(false, |ack| {
            let pcb = self.pcb_at(index);
            ack.within(pcb.lastack + 1, pcb.snd_nxt + 1)
        });

        if repr.flags.contains(Flags::RST) {
            if ack_ok {
                net_debug!("tcp: connection refused");
                self.kill(bufs, index);
            }
            bufs.free(packet);
            return;
        }

        if repr.flags.contains(Flags::SYN) && ack_ok {
            let ack = match repr.ack_number {
                Some(ack) => ack,
                None => {
                    bufs.free(packet);
                    return;
                },
            };
            let config_mss = self.config.mss;
            {
                let pcb = self.pcb_at(index);
                pcb.state = State::Established;
                pcb.accepted = true;
                pcb.rcv_nxt = repr.seq_number + 1;
                pcb.lastack = ack;
                pcb.mss = repr.max_seg_size.unwrap_or(536).min(config_mss);
                pcb.cwnd = u32::from(pcb.mss);
                pcb.snd_wnd = repr.window_len;
                pcb.snd_wl1 = repr.seq_number;
                pcb.snd_wl2 = ack;
                pcb.ack_now = true;
                pcb.rtime = -1;
                pcb.rttest = None;
                pcb.nrtx = 0;
            }
            // The SYN leaves the retransmission queue.
            let mut unacked = self.pcb_at(index).unacked.take();
            while let Some(front) = self.segs.pop_front(&mut unacked) {
                self.segs.free(bufs, front);
                self.pcb_at(index).queuelen -= 1;
            }
            bufs.free(packet);
            self.output_at(bufs, router, index);
            return;
        }

        // An ACK for something we did not send.
        if let Some(ack) = repr.ack_number {
            if !ack_ok {
                let ctx = {
                    let pcb = self.pcb_at(index);
                    (pcb.local_addr, pcb.local_port, pcb.remote_addr, pcb.remote_port)
                };
                self.send_reset(bufs, router, ctx.0, ctx.1, ctx.2, ctx.3, ack, None);
            }
        }
        bufs.free(packet);
    }

    /// Fold an acknowledgment into the send state.
    ///
    /// Returns true when the slot was released because the final ACK of our
    /// FIN arrived in `LAST_ACK`.
    fn process_ack(
        &mut self,
        bufs: &mut Buffers,
        index: u16,
        repr: &TcpRepr,
        payload_len: usize,
    ) -> bool {
        let ack = match repr.ack_number {
            Some(ack) => ack,
            None => return false,
        };
        let seq = repr.seq_number;
        let now = self.timer;

        let (lastack, snd_nxt, old_wnd) = {
            let pcb = self.pcb_at(index);
            (pcb.lastack, pcb.snd_nxt, pcb.snd_wnd)
        };
        let wnd_unchanged = repr.window_len == old_wnd;

        // Window update rule: newer segment, or same segment with a newer
        // or equal ack carrying a larger window.
        {
            let pcb = self.pcb_at(index);
            if pcb.snd_wl1.lt(seq)
                || (pcb.snd_wl1 == seq && pcb.snd_wl2.lt(ack))
                || (pcb.snd_wl2 == ack && repr.window_len > pcb.snd_wnd)
            {
                pcb.snd_wnd = repr.window_len;
                pcb.snd_wl1 = seq;
                pcb.snd_wl2 = ack;
            }
        }

        if ack.within(lastack + 1, snd_nxt + 1) {
            {
                let pcb = self.pcb_at(index);
                if pcb.infr {
                    pcb.cwnd = pcb.ssthresh;
                    pcb.infr = false;
                }
                pcb.nrtx = 0;
                pcb.dupacks = 0;
                pcb.lastack = ack;
                let mss = u32::from(pcb.mss);
                if pcb.cwnd < pcb.ssthresh {
                    pcb.cwnd = pcb.cwnd.saturating_add(mss);
                } else {
                    pcb.cwnd = pcb.cwnd.saturating_add(mss * mss / pcb.cwnd);
                }
            }

            // Reap fully acknowledged segments; `unsent` too, it may hold
            // requeued retransmissions overtaken by the ack.
            self.reap_acked(bufs, index, ack, true);
            self.reap_acked(bufs, index, ack, false);

            {
                let pcb = self.pcb_at(index);
                pcb.rtime = if pcb.unacked.is_none() { -1 } else { 0 };
                if let Some(start) = pcb.rttest {
                    if pcb.rtseq.lt(ack) {
                        let mut m = now.wrapping_sub(start) as i16;
                        m -= pcb.sa >> 3;
                        pcb.sa += m;
                        if m < 0 {
                            m = -m;
                        }
                        m -= pcb.sv >> 2;
                        pcb.sv += m;
                        pcb.rto = (pcb.sa >> 3) + pcb.sv;
                        pcb.rttest = None;
                    }
                }
            }

            // Everything sent is acknowledged: our FIN, if any, is through.
            let transition = {
                let pcb = self.pcb_at(index);
                if pcb.unacked.is_none() && pcb.unsent.is_none() {
                    Some(pcb.state)
                } else {
                    None
                }
            };
            match transition {
                Some(State::FinWait1) => self.pcb_at(index).state = State::FinWait2,
                Some(State::Closing) => {
                    let pcb = self.pcb_at(index);
                    pcb.state = State::TimeWait;
                    pcb.tw_since = now;
                },
                Some(State::LastAck) => {
                    self.release(bufs, index);
                    return true;
                },
                _ => {},
            }
            false
        } else if ack.le(lastack) {
            let dup = payload_len == 0 && ack == lastack && wnd_unchanged
                && self.pcb_at(index).unacked.is_some();
            if dup {
                self.process_dupack(index);
            }
            false
        } else {
            // Ahead of everything sent; tell the peer where we are.
            self.pcb_at(index).ack_now = true;
            false
        }
    }

    /// Count a duplicate acknowledgment; the third triggers fast
    /// retransmit, further ones inflate the window during recovery.
    fn process_dupack(&mut self, index: u16) {
        let start_recovery = {
            let pcb = self.pcb_at(index);
            pcb.dupacks = pcb.dupacks.saturating_add(1);
            let mss = u32::from(pcb.mss);
            if pcb.dupacks > 3 && pcb.infr {
                pcb.cwnd = pcb.cwnd.saturating_add(mss);
            }
            pcb.dupacks == 3 && !pcb.infr
        };
        if !start_recovery {
            return;
        }

        {
            let pcb = self.pcb_at(index);
            let mss = u32::from(pcb.mss);
            pcb.ssthresh = (pcb.cwnd.max(u32::from(pcb.snd_wnd)) / 2).max(2 * mss);
            pcb.cwnd = pcb.ssthresh + 3 * mss;
            pcb.infr = true;
            pcb.nrtx = pcb.nrtx.saturating_add(1);
            // The retransmission invalidates the running RTT sample.
            pcb.rttest = None;
        }
        // The oldest outstanding segment goes out again first.
        let mut unacked = self.pcb_at(index).unacked;
        let mut unsent = self.pcb_at(index).unsent;
        if let Some(front) = self.segs.pop_front(&mut unacked) {
            self.segs.push_front(&mut unsent, front);
        }
        let pcb = self.pcb_at(index);
        pcb.unacked = unacked;
        pcb.unsent = unsent;
    }

    /// Drop queue segments entirely covered by `ack`, refunding the send
    /// buffer budget.
    fn reap_acked(&mut self, bufs: &mut Buffers, index: u16, ack: SeqNumber, unacked: bool) {
        let mut head = {
            let pcb = self.pcb_at(index);
            if unacked { pcb.unacked } else { pcb.unsent }
        };
        loop {
            let front = match head {
                Some(front) => front,
                None => break,
            };
            let (end, len) = {
                let segment = self.segs.get(front);
                (segment.end(), segment.len)
            };
            if !end.le(ack) {
                break;
            }
            self.segs.pop_front(&mut head);
            self.segs.free(bufs, front);
            let pcb = self.pcb_at(index);
            pcb.queuelen -= 1;
            pcb.snd_buf += len;
        }
        let pcb = self.pcb_at(index);
        if unacked {
            pcb.unacked = head;
        } else {
            pcb.unsent = head;
        }
    }

    /// Fit arriving payload into the receive window, in order or aside.
    ///
    /// Returns true when the packet was threaded into a queue and must not
    /// be freed by the caller.
    fn receive_data(
        &mut self,
        bufs: &mut Buffers,
        index: u16,
        seq: SeqNumber,
        fin: bool,
        packet: PbufId,
    ) -> bool {
        let mut seq = seq;
        let mut fin = fin;
        let mut len = bufs.tot_len(packet);
        let (rcv_nxt, rcv_wnd) = {
            let pcb = self.pcb_at(index);
            (pcb.rcv_nxt, pcb.rcv_wnd)
        };
        let wnd_end = rcv_nxt + usize::from(rcv_wnd);

        let end = seq + len + usize::from(fin);
        if end.le(rcv_nxt) || seq.ge(wnd_end) {
            // A duplicate in its entirety, or past the window.
            self.pcb_at(index).ack_now = true;
            return false;
        }

        // Trim the part before the window.
        if seq.lt(rcv_nxt) {
            let strip = (rcv_nxt - seq).min(len);
            if strip > 0 {
                bufs.header(packet, -(strip as i32))
                    .expect("trim stays within the payload");
                len -= strip;
            }
            seq = rcv_nxt;
        }
        // And the part after it; a FIN beyond the window does not count.
        let space = wnd_end - seq;
        if len + usize::from(fin) > space {
            fin = false;
            if len > space {
                bufs.truncate(packet, space);
                len = space;
            }
        }

        if seq == rcv_nxt {
            self.accept_in_order(bufs, index, len, fin, packet)
        } else {
            // Out of order: park it and duplicate-ack right away.
            self.pcb_at(index).ack_now = true;
            self.store_out_of_order(index, seq, len, fin, packet)
        }
    }

    /// Append in-order payload to the receive queue and advance the window.
    fn accept_in_order(
        &mut self,
        bufs: &mut Buffers,
        index: u16,
        len: usize,
        fin: bool,
        packet: PbufId,
    ) -> bool {
        let mut consumed = false;
        {
            let pcb = self.pcb_at(index);
            if len > 0 {
                match pcb.rcv_queue {
                    None => pcb.rcv_queue = Some(packet),
                    Some(head) => {
                        bufs.chain(head, packet);
                        bufs.free(packet);
                    },
                }
                consumed = true;
                pcb.rcv_nxt += len;
                pcb.rcv_wnd -= len as u16;
            }
            // Every second in-order arrival is acknowledged immediately;
            // the first waits for the next timer or piggyback.
            if pcb.ack_delay {
                pcb.ack_now = true;
            } else {
                pcb.ack_delay = true;
            }
        }

        self.drain_out_of_order(bufs, index);
        if fin {
            self.receive_fin(index);
        }
        consumed
    }

    /// Move reassembly-queue segments that became contiguous into the
    /// receive queue.
    fn drain_out_of_order(&mut self, bufs: &mut Buffers, index: u16) {
        loop {
            let (head, rcv_nxt) = {
                let pcb = self.pcb_at(index);
                (pcb.ooseq, pcb.rcv_nxt)
            };
            let front = match head {
                Some(front) => front,
                None => break,
            };
            let (seg_seq, seg_len, seg_flags, end) = {
                let segment = self.segs.get(front);
                (segment.seq, usize::from(segment.len), segment.flags, segment.end())
            };
            if seg_seq.gt(rcv_nxt) {
                break;
            }

            let mut head = head;
            self.segs.pop_front(&mut head);
            self.pcb_at(index).ooseq = head;
            if end.le(rcv_nxt) {
                // Fully duplicated by what arrived in order meanwhile.
                self.segs.free(bufs, front);
                continue;
            }

            let payload = self.segs.take_payload(front);
            let fin = seg_flags.contains(Flags::FIN);
            self.segs.free(bufs, front);

            if let Some(payload) = payload {
                let strip = rcv_nxt - seg_seq;
                let mut len = seg_len;
                if strip > 0 {
                    bufs.header(payload, -(strip as i32))
                        .expect("trim stays within the payload");
                    len -= strip;
                }
                let pcb = self.pcb_at(index);
                if len > 0 {
                    match pcb.rcv_queue {
                        None => pcb.rcv_queue = Some(payload),
                        Some(head) => {
                            bufs.chain(head, payload);
                            bufs.free(payload);
                        },
                    }
                    pcb.rcv_nxt += len;
                    pcb.rcv_wnd = pcb.rcv_wnd.saturating_sub(len as u16);
                } else {
                    bufs.free(payload);
                }
            }
            if fin {
                self.receive_fin(index);
            }
        }
    }

    /// Keep an out-of-order arrival for later; one copy per sequence start
    /// is enough.
    fn store_out_of_order(
        &mut self,
        index: u16,
        seq: SeqNumber,
        len: usize,
        fin: bool,
        packet: PbufId,
    ) -> bool {
        let exists = {
            let mut cursor = self.pcb_at(index).ooseq;
            let mut found = false;
            while let Some(at) = cursor {
                let segment = self.segs.get(at);
                if segment.seq == seq {
                    found = true;
                    break;
                }
                cursor = segment.next;
            }
            found
        };
        if exists {
            return false;
        }

        let payload = if len > 0 { Some(packet) } else { None };
        let slot = self.segs.alloc(Segment {
            seq,
            len: len as u16,
            flags: if fin { Flags::FIN } else { Flags::EMPTY },
            payload,
            next: None,
        });
        match slot {
            Some(slot) => {
                let mut head = self.pcb_at(index).ooseq;
                self.segs.insert_ordered(&mut head, slot);
                self.pcb_at(index).ooseq = head;
                payload.is_some()
            },
            None => false,
        }
    }

    /// The peer finished sending.
    fn receive_fin(&mut self, index: u16) {
        let now = self.timer;
        let pcb = self.pcb_at(index);
        if pcb.peer_closed {
            return;
        }
        pcb.rcv_nxt += 1;
        pcb.peer_closed = true;
        pcb.ack_now = true;
        match pcb.state {
            State::Established => pcb.state = State::CloseWait,
            State::FinWait1 => pcb.state = State::Closing,
            State::FinWait2 => {
                pcb.state = State::TimeWait;
                pcb.tw_since = now;
            },
            _ => {},
        }
    }

    /// Terminate the connection locally: queues are dropped and the user
    /// sees the connection as closed. The slot lingers until the user
    /// closes unless they already did.
    pub(crate) fn kill(&mut self, bufs: &mut Buffers, index: u16) {
        if self.pcb_at(index).user_closed {
            self.release(bufs, index);
            return;
        }
        let (mut unsent, mut unacked, mut ooseq) = {
            let pcb = self.pcb_at(index);
            (pcb.unsent.take(), pcb.unacked.take(), pcb.ooseq.take())
        };
        self.segs.free_all(bufs, &mut unsent);
        self.segs.free_all(bufs, &mut unacked);
        self.segs.free_all(bufs, &mut ooseq);
        let pcb = self.pcb_at(index);
        if let Some(head) = pcb.rcv_queue.take() {
            bufs.free(head);
        }
        pcb.state = State::Closed;
        pcb.reset = true;
        pcb.queuelen = 0;
    }
}
