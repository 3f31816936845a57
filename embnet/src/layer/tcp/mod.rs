//! The TCP engine: segmentation, retransmission, congestion control.
//!
//! Connections are slots in a fixed table, identified by [`PcbId`]. Outbound
//! data is cut into segments backed by heap packet buffers and queued on
//! `unsent`; transmission moves them to `unacked` where they stay, payload
//! shared with any frame still in flight, until acknowledged. Inbound
//! segments are validated, matched to a connection, and folded into its
//! receive state; out-of-order arrivals wait in a reassembly queue.
//!
//! Nothing here transmits directly: segments become IP packets through the
//! [`Router`] and leave through its egress queue on the next poll.
//!
//! [`PcbId`]: struct.PcbId.html
//! [`Router`]: ../ip/struct.Router.html
mod input;
mod output;
mod segment;
mod timer;

#[cfg(test)]
mod tests;

pub use self::segment::Slot as SegmentSlot;

use crate::config::TcpConfig;
use crate::managed::Slice;
use crate::pbuf::{Buffers, PbufId};
use crate::wire::tcp::Flags;
use crate::wire::{Ipv4Address, SeqNumber};

use self::segment::{Segment, Slab};
use super::ip::Router;
use super::{Error, Result};

/// The TCP connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl State {
    /// Whether the user may still enqueue data in this state.
    fn writable(self) -> bool {
        matches!(self,
            State::SynSent | State::SynRcvd | State::Established | State::CloseWait)
    }

    /// Whether the connection takes part in segment exchange.
    fn active(self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::TimeWait)
    }
}

/// Handle of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcbId(pub(crate) u16);

/// The per-connection protocol control block.
#[derive(Debug)]
pub(crate) struct Pcb {
    pub(crate) state: State,
    pub(crate) local_addr: Ipv4Address,
    pub(crate) local_port: u16,
    pub(crate) remote_addr: Ipv4Address,
    pub(crate) remote_port: u16,

    /// Oldest byte in flight; everything before is acknowledged.
    pub(crate) lastack: SeqNumber,
    /// Next sequence number to put on the wire.
    pub(crate) snd_nxt: SeqNumber,
    /// Next sequence number to buffer; the enqueue position.
    pub(crate) snd_lbb: SeqNumber,
    pub(crate) snd_wnd: u16,
    pub(crate) snd_wl1: SeqNumber,
    pub(crate) snd_wl2: SeqNumber,
    /// Remaining send-buffer budget in bytes.
    pub(crate) snd_buf: u16,
    /// Segments across `unsent` and `unacked`.
    pub(crate) queuelen: u16,
    pub(crate) cwnd: u32,
    pub(crate) ssthresh: u32,
    pub(crate) mss: u16,
    pub(crate) dupacks: u8,

    pub(crate) rcv_nxt: SeqNumber,
    pub(crate) rcv_wnd: u16,

    /// Retransmission timer in slow ticks, `-1` while stopped.
    pub(crate) rtime: i16,
    pub(crate) rto: i16,
    pub(crate) nrtx: u8,
    /// Slow tick at which the running RTT sample started.
    pub(crate) rttest: Option<u32>,
    pub(crate) rtseq: SeqNumber,
    /// Scaled smoothed RTT estimate.
    pub(crate) sa: i16,
    /// Scaled RTT variance estimate.
    pub(crate) sv: i16,
    /// Slow tick at which TIME_WAIT was entered.
    pub(crate) tw_since: u32,

    pub(crate) ack_delay: bool,
    pub(crate) ack_now: bool,
    /// In fast recovery.
    pub(crate) infr: bool,
    /// A recent enqueue failed on memory; the next output skips Nagle.
    pub(crate) nagle_memerr: bool,
    /// The peer's FIN has been received.
    pub(crate) peer_closed: bool,
    /// The connection was reset by the peer or timed out.
    pub(crate) reset: bool,
    /// The user has closed; the slot is reclaimed once the state machine
    /// finishes.
    pub(crate) user_closed: bool,
    /// A listen child handed to the user through `accept`.
    pub(crate) accepted: bool,

    pub(crate) unsent: Option<u16>,
    pub(crate) unacked: Option<u16>,
    pub(crate) ooseq: Option<u16>,
    /// In-order received data awaiting `read`.
    pub(crate) rcv_queue: Option<PbufId>,
}

impl Pcb {
    fn new(config: &TcpConfig) -> Pcb {
        Pcb {
            state: State::Closed,
            local_addr: Ipv4Address::UNSPECIFIED,
            local_port: 0,
            remote_addr: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            lastack: SeqNumber(0),
            snd_nxt: SeqNumber(0),
            snd_lbb: SeqNumber(0),
            snd_wnd: config.mss,
            snd_wl1: SeqNumber(0),
            snd_wl2: SeqNumber(0),
            snd_buf: config.snd_buf,
            queuelen: 0,
            cwnd: u32::from(config.mss),
            ssthresh: u32::from(config.mss) * 10,
            mss: config.mss,
            dupacks: 0,
            rcv_nxt: SeqNumber(0),
            rcv_wnd: config.rcv_wnd,
            rtime: -1,
            rto: config.rto_init,
            nrtx: 0,
            rttest: None,
            rtseq: SeqNumber(0),
            sa: 0,
            sv: config.rto_init,
            tw_since: 0,
            ack_delay: false,
            ack_now: false,
            infr: false,
            nagle_memerr: false,
            peer_closed: false,
            reset: false,
            user_closed: false,
            accepted: false,
            unsent: None,
            unacked: None,
            ooseq: None,
            rcv_queue: None,
        }
    }

    /// The usable send window: the lesser of what the peer advertised and
    /// what congestion control currently permits.
    fn usable_wnd(&self) -> u32 {
        u32::from(self.snd_wnd).min(self.cwnd)
    }
}

/// Storage for one connection slot.
#[derive(Debug)]
pub struct PcbSlot(pub(crate) Option<Pcb>);

impl Default for PcbSlot {
    fn default() -> PcbSlot {
        PcbSlot(None)
    }
}

/// The TCP engine.
#[derive(Debug)]
pub struct Engine<'a> {
    pcbs: Slice<'a, PcbSlot>,
    segs: Slab<'a>,
    config: TcpConfig,
    /// Slow ticks since construction; the clock of all TCP timing.
    timer: u32,
    iss: SeqNumber,
    next_port: u16,
}

impl<'a> Engine<'a> {
    /// Create an engine with owned storage.
    #[cfg(feature = "std")]
    pub fn new(config: &TcpConfig) -> Self {
        let mut pcbs = Vec::new();
        pcbs.resize_with(config.pcbs, PcbSlot::default);
        let mut segs = Vec::new();
        segs.resize_with(config.segments, SegmentSlot::default);
        Self::with_storage(pcbs, segs, config)
    }

    /// Create an engine over caller-provided slot storage.
    pub fn with_storage<P, S>(pcbs: P, segs: S, config: &TcpConfig) -> Self
        where
            P: Into<Slice<'a, PcbSlot>>,
            S: Into<Slice<'a, SegmentSlot>>,
    {
        Engine {
            pcbs: pcbs.into(),
            segs: Slab::new(segs),
            config: *config,
            timer: 0,
            iss: SeqNumber(6510),
            next_port: 49152,
        }
    }

    /// The state of a connection; `Closed` for a released slot.
    pub fn state(&self, id: PcbId) -> State {
        self.pcbs.get(id.0 as usize)
            .and_then(|slot| slot.0.as_ref())
            .map_or(State::Closed, |pcb| pcb.state)
    }

    /// Open a connection to `remote:port`.
    ///
    /// The SYN is queued and goes out with the router's next egress drain;
    /// the connection is writable immediately, data waits for the
    /// handshake.
    pub fn connect(
        &mut self,
        bufs: &mut Buffers,
        router: &mut Router,
        remote: Ipv4Address,
        port: u16,
    ) -> Result<PcbId> {
        if port == 0 {
            return Err(Error::Illegal);
        }
        let iface = router.route(remote, None).ok_or(Error::Unreachable)?;
        let local_addr = router.iface(iface)
            .map(|iface| iface.addr().address())
            .ok_or(Error::Unreachable)?;

        let index = self.alloc_pcb()?;
        let local_port = self.ephemeral_port();
        let iss = self.next_iss();

        let pcb = self.pcb_at(index);
        pcb.state = State::SynSent;
        pcb.local_addr = local_addr;
        pcb.local_port = local_port;
        pcb.remote_addr = remote;
        pcb.remote_port = port;
        pcb.lastack = iss;
        pcb.snd_nxt = iss;
        pcb.snd_lbb = iss + 1;
        pcb.snd_wl1 = iss;
        pcb.snd_wl2 = iss;
        pcb.rtseq = iss;

        if let Err(error) = self.enqueue_flags(index, Flags::SYN, iss) {
            self.release(bufs, index);
            return Err(error);
        }
        self.output_at(bufs, router, index);
        Ok(PcbId(index))
    }

    /// Open a passive connection accepting peers on `port`.
    pub fn listen(&mut self, port: u16) -> Result<PcbId> {
        if port == 0 {
            return Err(Error::Illegal);
        }
        let clash = self.pcbs.iter().any(|slot| {
            slot.0.as_ref().map_or(false, |pcb| {
                pcb.state == State::Listen && pcb.local_port == port
            })
        });
        if clash {
            return Err(Error::Illegal);
        }

        let index = self.alloc_pcb()?;
        let pcb = self.pcb_at(index);
        pcb.state = State::Listen;
        pcb.local_port = port;
        Ok(PcbId(index))
    }

    /// Take one established connection off a listener's backlog.
    pub fn accept(&mut self, listener: PcbId) -> Option<PcbId> {
        let port = match self.pcbs.get(listener.0 as usize)?.0.as_ref() {
            Some(pcb) if pcb.state == State::Listen => pcb.local_port,
            _ => return None,
        };

        for (index, slot) in self.pcbs.iter_mut().enumerate() {
            if let Some(pcb) = slot.0.as_mut() {
                if !pcb.accepted && pcb.local_port == port
                    && matches!(pcb.state, State::Established | State::CloseWait)
                {
                    pcb.accepted = true;
                    return Some(PcbId(index as u16));
                }
            }
        }
        None
    }

    /// Enqueue data for transmission.
    ///
    /// The data is copied into segments of at most MSS bytes appended to
    /// the `unsent` queue; a small write is merged into the queue's tail
    /// segment when it fits, amortizing header overhead. Nothing is
    /// transmitted here. All-or-nothing: on error no byte was enqueued.
    pub fn write(&mut self, bufs: &mut Buffers, id: PcbId, data: &[u8]) -> Result<usize> {
        use crate::pbuf::{Kind, Layer};

        if data.is_empty() {
            return Err(Error::Illegal);
        }
        let mss = usize::from(self.config.mss);
        let max_queued = self.config.snd_queuelen;

        let pcb = self.checked_pcb(id)?;
        if !pcb.state.writable() {
            return Err(Error::Closed);
        }
        if data.len() > usize::from(pcb.snd_buf) {
            return Err(Error::Exhausted);
        }

        let index = id.0;
        let queuelen = self.pcb_at(index).queuelen;
        let snd_lbb = self.pcb_at(index).snd_lbb;

        // A small write starts by topping up the tail segment while that
        // stays within one MSS. The bytes are chained onto the tail's
        // payload, so no new header is ever emitted for them. The chain
        // splice happens only after the whole write is known to fit.
        let unsent = self.pcb_at(index).unsent;
        let merge = match self.segs.back(unsent) {
            Some(tail) => {
                let segment = self.segs.get(tail);
                let room = mss.saturating_sub(usize::from(segment.len));
                if segment.payload.is_some()
                    && !segment.flags.intersects(Flags::SYN | Flags::FIN)
                {
                    Some((tail, room.min(data.len())))
                } else {
                    None
                }
            },
            None => None,
        };
        let (merge, remaining) = match merge {
            Some((tail, take)) if take > 0 => {
                match bufs.alloc(Layer::Raw, take, Kind::Ram) {
                    Ok(extra) => {
                        bufs.fill(extra, 0, &data[..take]);
                        (Some((tail, extra, take)), &data[take..])
                    },
                    Err(_) => {
                        self.pcb_at(index).nagle_memerr = true;
                        return Err(Error::Exhausted);
                    },
                }
            },
            _ => (None, data),
        };

        // Cut the rest into fresh segments, collected aside so a failure
        // unwinds without having touched the connection.
        let mut staged: Option<u16> = None;
        let mut staged_count = 0u16;
        let mut seq = snd_lbb + merge.map_or(0, |(_, _, take)| take);
        let mut remaining = remaining;
        let mut failed = false;
        while !remaining.is_empty() {
            let take = remaining.len().min(mss);
            if queuelen + staged_count >= max_queued {
                failed = true;
                break;
            }
            let payload = match bufs.alloc(Layer::Raw, take, Kind::Ram) {
                Ok(payload) => payload,
                Err(_) => {
                    failed = true;
                    break;
                },
            };
            bufs.fill(payload, 0, &remaining[..take]);

            let flags = if remaining.len() == take { Flags::PSH } else { Flags::EMPTY };
            let slot = self.segs.alloc(Segment {
                seq,
                len: take as u16,
                flags,
                payload: Some(payload),
                next: None,
            });
            let slot = match slot {
                Some(slot) => slot,
                None => {
                    bufs.free(payload);
                    failed = true;
                    break;
                },
            };
            self.segs.push_back(&mut staged, slot);
            staged_count += 1;
            seq = seq + take;
            remaining = &remaining[take..];
        }

        if failed {
            self.segs.free_all(bufs, &mut staged);
            if let Some((_, extra, _)) = merge {
                bufs.free(extra);
            }
            self.pcb_at(index).nagle_memerr = true;
            return Err(Error::Exhausted);
        }

        // Commit: splice the merged bytes, append the staged segments and
        // charge the budget in one step.
        if let Some((tail, extra, take)) = merge {
            let head = self.segs.get(tail).payload.expect("merge tail has a payload");
            bufs.chain(head, extra);
            bufs.free(extra);
            let segment = self.segs.get_mut(tail);
            segment.len += take as u16;
            if staged.is_none() {
                segment.flags |= Flags::PSH;
            }
        }
        let mut unsent = self.pcb_at(index).unsent;
        self.segs.append(&mut unsent, staged);
        let pcb = self.pcb_at(index);
        pcb.unsent = unsent;
        pcb.snd_lbb = snd_lbb + data.len();
        pcb.snd_buf -= data.len() as u16;
        pcb.queuelen += staged_count;
        Ok(data.len())
    }

    /// Pull received in-order data into `dst`.
    ///
    /// Returns `Ok(0)` when no data is pending, and [`Error::Closed`] once
    /// the peer has finished sending and the queue is drained.
    ///
    /// [`Error::Closed`]: ../enum.Error.html#variant.Closed
    pub fn read(&mut self, bufs: &mut Buffers, id: PcbId, dst: &mut [u8]) -> Result<usize> {
        let max_wnd = self.config.rcv_wnd;
        let mss = self.config.mss;
        let pcb = self.checked_pcb(id)?;
        if pcb.reset {
            return Err(Error::Closed);
        }
        let head = match pcb.rcv_queue {
            Some(head) => head,
            None if pcb.peer_closed => return Err(Error::Closed),
            None => return Ok(0),
        };

        let taken = bufs.copy_partial(head, dst, 0);
        let mut cursor = Some(head);
        let mut consumed = taken;
        while consumed > 0 {
            let segment = cursor.expect("consumed bytes came from the queue");
            let len = bufs.len(segment);
            if consumed >= len {
                cursor = bufs.dechain(segment);
                consumed -= len;
            } else {
                bufs.header(segment, -(consumed as i32))
                    .expect("hiding payload bytes can not fail");
                consumed = 0;
            }
        }

        let pcb = self.pcb_at(id.0);
        pcb.rcv_queue = cursor;
        // The queue never holds more than a window of data, so this fits.
        let reopened = taken as u16;
        pcb.rcv_wnd = pcb.rcv_wnd.saturating_add(reopened).min(max_wnd);
        // A window update is worth a segment of its own once a full MSS
        // reopened; smaller changes ride along with the next ACK.
        if reopened >= mss {
            pcb.ack_now = true;
        }
        Ok(taken)
    }

    /// Close the sending direction and start connection teardown.
    ///
    /// Data already queued is still delivered and retransmitted; the FIN
    /// takes its place at the end of the stream. The slot is reclaimed once
    /// the state machine reaches its terminal state.
    pub fn close(&mut self, bufs: &mut Buffers, router: &mut Router, id: PcbId) -> Result<()> {
        let index = id.0;
        let state = match self.pcbs.get(index as usize).and_then(|slot| slot.0.as_ref()) {
            Some(pcb) => pcb.state,
            None => return Ok(()),
        };

        match state {
            State::Closed | State::Listen | State::SynSent => {
                self.release(bufs, index);
                Ok(())
            },
            State::SynRcvd | State::Established => {
                let seq = self.pcb_at(index).snd_lbb;
                self.enqueue_flags(index, Flags::FIN, seq)?;
                let pcb = self.pcb_at(index);
                pcb.state = State::FinWait1;
                pcb.user_closed = true;
                self.output_at(bufs, router, index);
                Ok(())
            },
            State::CloseWait => {
                let seq = self.pcb_at(index).snd_lbb;
                self.enqueue_flags(index, Flags::FIN, seq)?;
                let pcb = self.pcb_at(index);
                pcb.state = State::LastAck;
                pcb.user_closed = true;
                self.output_at(bufs, router, index);
                Ok(())
            },
            _ => {
                self.pcb_at(index).user_closed = true;
                Ok(())
            },
        }
    }

    /// Tear the connection down immediately.
    ///
    /// A reset is sent to the peer; all queued segments and received data
    /// are discarded without further network activity.
    pub fn abort(&mut self, bufs: &mut Buffers, router: &mut Router, id: PcbId) {
        let index = id.0;
        let reset = match self.pcbs.get(index as usize).and_then(|slot| slot.0.as_ref()) {
            Some(pcb) if pcb.state.active() => Some((
                pcb.local_addr, pcb.local_port,
                pcb.remote_addr, pcb.remote_port,
                pcb.snd_nxt, pcb.rcv_nxt,
            )),
            Some(_) => None,
            None => return,
        };

        if let Some((local, lport, remote, rport, seq, ack)) = reset {
            self.send_reset(bufs, router, local, lport, remote, rport, seq, Some(ack));
        }
        self.release(bufs, index);
    }

    /// Run the user-visible send path: everything the window allows.
    pub fn output(&mut self, bufs: &mut Buffers, router: &mut Router, id: PcbId) -> Result<()> {
        self.checked_pcb(id)?;
        self.output_at(bufs, router, id.0);
        Ok(())
    }

    fn alloc_pcb(&mut self) -> Result<u16> {
        let index = self.pcbs.iter().position(|slot| slot.0.is_none())
            .ok_or(Error::Exhausted)?;
        self.pcbs[index].0 = Some(Pcb::new(&self.config));
        Ok(index as u16)
    }

    /// Free every resource of a slot and empty it.
    fn release(&mut self, bufs: &mut Buffers, index: u16) {
        let pcb = match self.pcbs[index as usize].0.take() {
            Some(pcb) => pcb,
            None => return,
        };
        let mut queue = pcb.unsent;
        self.segs.free_all(bufs, &mut queue);
        let mut queue = pcb.unacked;
        self.segs.free_all(bufs, &mut queue);
        let mut queue = pcb.ooseq;
        self.segs.free_all(bufs, &mut queue);
        if let Some(head) = pcb.rcv_queue {
            bufs.free(head);
        }
    }

    fn pcb_at(&mut self, index: u16) -> &mut Pcb {
        self.pcbs[index as usize].0.as_mut().expect("connection slot is live")
    }

    /// Look up a user handle, translating a dead slot to `Closed`.
    fn checked_pcb(&mut self, id: PcbId) -> Result<&mut Pcb> {
        self.pcbs.get_mut(id.0 as usize)
            .and_then(|slot| slot.0.as_mut())
            .ok_or(Error::Closed)
    }

    /// Queue a bare control segment (SYN, FIN) at `seq`.
    fn enqueue_flags(&mut self, index: u16, flags: Flags, seq: SeqNumber) -> Result<()> {
        let max_queued = self.config.snd_queuelen;
        {
            let pcb = self.pcb_at(index);
            if pcb.queuelen >= max_queued {
                pcb.nagle_memerr = true;
                return Err(Error::Exhausted);
            }
        }
        let slot = self.segs.alloc(Segment {
            seq,
            len: 0,
            flags,
            payload: None,
            next: None,
        });
        let slot = match slot {
            Some(slot) => slot,
            None => {
                self.pcb_at(index).nagle_memerr = true;
                return Err(Error::Exhausted);
            },
        };

        let pcb = self.pcb_at(index);
        let mut unsent = pcb.unsent;
        self.segs.push_back(&mut unsent, slot);
        let pcb = self.pcb_at(index);
        pcb.unsent = unsent;
        pcb.queuelen += 1;
        pcb.snd_lbb = seq + flags.sequence_len();
        Ok(())
    }

    fn ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_port;
            self.next_port = if self.next_port == u16::max_value() {
                49152
            } else {
                self.next_port + 1
            };
            let used = self.pcbs.iter().any(|slot| {
                slot.0.as_ref().map_or(false, |pcb| pcb.local_port == port)
            });
            if !used {
                return port;
            }
        }
    }

    fn next_iss(&mut self) -> SeqNumber {
        self.iss = self.iss + 64400 + self.timer as usize;
        self.iss
    }
}
