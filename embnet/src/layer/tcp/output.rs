//! Segment transmission: header construction, Nagle, the send window.
use crate::pbuf::{Buffers, Kind, Layer, PbufId};
use crate::wire::tcp::Flags;
use crate::wire::{checksum, IpProtocol, Ipv4Address, SeqNumber, TcpPacket, TcpRepr};

use super::super::ip::Router;
use super::super::Result;
use super::{Engine, PcbId, State};

impl<'a> Engine<'a> {
    /// Transmit a bare acknowledgment carrying the current receive state.
    pub fn send_empty_ack(&mut self, bufs: &mut Buffers, router: &mut Router, id: PcbId)
        -> Result<()>
    {
        self.checked_pcb(id)?;
        self.send_empty_ack_at(bufs, router, id.0);
        Ok(())
    }

    /// Send every unsent segment the window and Nagle policy allow.
    pub(crate) fn output_at(&mut self, bufs: &mut Buffers, router: &mut Router, index: u16) {
        // Nagle looks at the state on entry: with nothing in flight, after
        // a failed enqueue, or during fast recovery even a short segment
        // goes out.
        let nagle_free = {
            let pcb = self.pcb_at(index);
            pcb.nagle_memerr || pcb.unacked.is_none() || pcb.infr
        };
        loop {
            let (head, wnd, lastack, mss) = {
                let pcb = self.pcb_at(index);
                let head = match pcb.unsent {
                    Some(head) => head,
                    None => break,
                };
                (head, pcb.usable_wnd() as usize, pcb.lastack, usize::from(pcb.mss))
            };
            let (seq, len, flags, more_queued) = {
                let segment = self.segs.get(head);
                (segment.seq, usize::from(segment.len), segment.flags,
                    segment.next.is_some())
            };

            let in_flight = if seq.ge(lastack) { seq - lastack } else { 0 };
            if in_flight + len > wnd {
                break;
            }
            // Nagle: a short final segment waits while earlier data is in
            // flight, unless memory pressure or a control flag overrides.
            let exempt = flags.intersects(Flags::SYN | Flags::FIN | Flags::RST);
            if len < mss && !exempt && !more_queued && !nagle_free {
                break;
            }

            if self.transmit_segment(bufs, router, index, head).is_err() {
                break;
            }

            let mut unsent = self.pcb_at(index).unsent;
            let popped = self.segs.pop_front(&mut unsent);
            debug_assert_eq!(popped, Some(head));
            self.pcb_at(index).unsent = unsent;

            let end = self.segs.get(head).end();
            let seq_len = self.segs.get(head).seq_len();
            let now = self.timer;
            if seq_len > 0 {
                let mut unacked = self.pcb_at(index).unacked;
                // In order even when a retransmission jumped the queue.
                self.segs.insert_ordered(&mut unacked, head);
                let pcb = self.pcb_at(index);
                pcb.unacked = unacked;
                if pcb.snd_nxt.lt(end) {
                    pcb.snd_nxt = end;
                }
                if pcb.rtime < 0 {
                    pcb.rtime = 0;
                }
                // One RTT sample at a time, and none during retransmission
                // rounds whose echoes would be ambiguous.
                if pcb.rttest.is_none() && pcb.nrtx == 0 {
                    pcb.rttest = Some(now);
                    pcb.rtseq = seq;
                }
            } else {
                self.segs.free(bufs, head);
                self.pcb_at(index).queuelen -= 1;
            }
        }

        let pcb = self.pcb_at(index);
        pcb.nagle_memerr = false;
        if pcb.ack_now {
            self.send_empty_ack_at(bufs, router, index);
        }
    }

    /// Build the wire form of a queued segment and hand it to the router.
    ///
    /// The payload chain is shared, not copied: the header buffer links to
    /// it, and the queue keeps its own reference for retransmission.
    fn transmit_segment(
        &mut self,
        bufs: &mut Buffers,
        router: &mut Router,
        index: u16,
        segment: u16,
    ) -> Result<()> {
        let (local, local_port, remote, remote_port, rcv_nxt, rcv_wnd, state, mss) = {
            let pcb = self.pcb_at(index);
            (pcb.local_addr, pcb.local_port, pcb.remote_addr, pcb.remote_port,
                pcb.rcv_nxt, pcb.rcv_wnd, pcb.state, pcb.mss)
        };
        let (seq, flags, payload) = {
            let segment = self.segs.get(segment);
            (segment.seq, segment.flags, segment.payload)
        };

        // The opening SYN is the only segment sent without an
        // acknowledgment; there is nothing to acknowledge yet.
        let opening = flags.contains(Flags::SYN) && state == State::SynSent;
        let repr = TcpRepr {
            src_port: local_port,
            dst_port: remote_port,
            seq_number: seq,
            ack_number: if opening { None } else { Some(rcv_nxt) },
            flags,
            window_len: rcv_wnd,
            max_seg_size: if flags.contains(Flags::SYN) { Some(mss) } else { None },
        };

        net_trace!("tcp: tx seq={} flags={} len={}", seq,
            flags, payload.map_or(0, |p| bufs.tot_len(p)));
        let header = self.emit_segment(bufs, local, remote, repr, payload)?;
        match router.output(bufs, header, Some(local), remote, IpProtocol::Tcp) {
            Ok(()) => {
                let pcb = self.pcb_at(index);
                pcb.ack_delay = false;
                pcb.ack_now = false;
                Ok(())
            },
            Err(error) => {
                bufs.free(header);
                Err(error)
            },
        }
    }

    pub(crate) fn send_empty_ack_at(&mut self, bufs: &mut Buffers, router: &mut Router,
        index: u16)
    {
        let (local, local_port, remote, remote_port, rcv_nxt, rcv_wnd, snd_nxt) = {
            let pcb = self.pcb_at(index);
            (pcb.local_addr, pcb.local_port, pcb.remote_addr, pcb.remote_port,
                pcb.rcv_nxt, pcb.rcv_wnd, pcb.snd_nxt)
        };
        let repr = TcpRepr {
            src_port: local_port,
            dst_port: remote_port,
            seq_number: snd_nxt,
            ack_number: Some(rcv_nxt),
            flags: Flags::EMPTY,
            window_len: rcv_wnd,
            max_seg_size: None,
        };

        let sent = self.emit_segment(bufs, local, remote, repr, None)
            .and_then(|header| {
                router.output(bufs, header, Some(local), remote, IpProtocol::Tcp)
                    .map_err(|error| {
                        bufs.free(header);
                        error
                    })
            });
        if sent.is_ok() {
            let pcb = self.pcb_at(index);
            pcb.ack_delay = false;
            pcb.ack_now = false;
        }
    }

    /// Send a reset for a connection context, existing or not.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_reset(
        &mut self,
        bufs: &mut Buffers,
        router: &mut Router,
        local: Ipv4Address,
        local_port: u16,
        remote: Ipv4Address,
        remote_port: u16,
        seq: SeqNumber,
        ack: Option<SeqNumber>,
    ) {
        let repr = TcpRepr {
            src_port: local_port,
            dst_port: remote_port,
            seq_number: seq,
            ack_number: ack,
            flags: Flags::RST,
            window_len: 0,
            max_seg_size: None,
        };
        net_trace!("tcp: tx rst seq={} to {}:{}", seq, remote, remote_port);
        if let Ok(header) = self.emit_segment(bufs, local, remote, repr, None) {
            if router.output(bufs, header, Some(local), remote, IpProtocol::Tcp).is_err() {
                bufs.free(header);
            }
        }
    }

    /// Materialize a header buffer, chain the payload and checksum the
    /// whole, returning the head of the wire chain.
    fn emit_segment(
        &mut self,
        bufs: &mut Buffers,
        local: Ipv4Address,
        remote: Ipv4Address,
        repr: TcpRepr,
        payload: Option<PbufId>,
    ) -> Result<PbufId> {
        let header_len = repr.header_len();
        let header = bufs.alloc(Layer::Ip, header_len, Kind::Pool)?;
        {
            let bytes = bufs.payload_mut(header);
            repr.emit(TcpPacket::new_unchecked_mut(&mut bytes[..header_len]));
        }
        if let Some(payload) = payload {
            bufs.chain(header, payload);
        }

        let total = bufs.tot_len(header);
        let mut acc = checksum::Accumulator::default();
        acc.push_sum(checksum::pseudo_header(
            local, remote, IpProtocol::Tcp, total as u32));
        let mut cursor = Some(header);
        while let Some(id) = cursor {
            acc.push(bufs.payload(id));
            cursor = bufs.next(id);
        }
        let sum = !acc.finish();
        {
            let bytes = bufs.payload_mut(header);
            TcpPacket::new_unchecked_mut(&mut bytes[..header_len]).set_checksum(sum);
        }
        Ok(header)
    }
}
