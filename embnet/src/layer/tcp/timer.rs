//! The two TCP cadences: retransmission and connection reaping on the
//! slow tick, delayed acknowledgments on the fast tick.
use crate::pbuf::Buffers;

use super::super::ip::Router;
use super::{Engine, State};

/// Slow ticks a connection lingers in TIME_WAIT, two maximum segment
/// lifetimes.
const TIME_WAIT_TICKS: u32 = 240;

impl<'a> Engine<'a> {
    /// Advance the slow clock: retransmission timeouts, handshake and
    /// TIME_WAIT expiry.
    pub fn slow_tick(&mut self, bufs: &mut Buffers, router: &mut Router) {
        self.timer = self.timer.wrapping_add(1);
        let now = self.timer;

        for index in 0..self.pcbs.len() as u16 {
            let (state, tw_since, has_unacked, rtime, rto) = {
                let pcb = match self.pcbs[index as usize].0.as_ref() {
                    Some(pcb) => pcb,
                    None => continue,
                };
                (pcb.state, pcb.tw_since, pcb.unacked.is_some(), pcb.rtime, pcb.rto)
            };

            match state {
                State::Closed | State::Listen => continue,
                State::TimeWait => {
                    if now.wrapping_sub(tw_since) >= TIME_WAIT_TICKS {
                        self.release(bufs, index);
                    }
                    continue;
                },
                _ => {},
            }

            if !has_unacked || rtime < 0 {
                continue;
            }
            let rtime = rtime + 1;
            self.pcb_at(index).rtime = rtime;
            if rtime < rto {
                continue;
            }

            let limit = match state {
                State::SynSent | State::SynRcvd => self.config.max_syn_rtx,
                _ => self.config.max_rtx,
            };
            let give_up = self.pcb_at(index).nrtx >= limit;
            if give_up {
                net_debug!("tcp: connection timed out after retransmissions");
                self.kill(bufs, index);
                continue;
            }

            self.retransmit_timeout(bufs, router, index);
        }
    }

    /// Advance the fast clock: flush pending acknowledgments.
    pub fn fast_tick(&mut self, bufs: &mut Buffers, router: &mut Router) {
        for index in 0..self.pcbs.len() as u16 {
            let pending = self.pcbs[index as usize].0.as_ref().map_or(false, |pcb| {
                pcb.state.active() && (pcb.ack_now || pcb.ack_delay)
            });
            if pending {
                self.send_empty_ack_at(bufs, router, index);
            }
        }
    }

    /// The timer expired on the oldest outstanding segment: back off and
    /// resend everything in flight.
    fn retransmit_timeout(&mut self, bufs: &mut Buffers, router: &mut Router, index: u16) {
        {
            let pcb = self.pcb_at(index);
            let mss = u32::from(pcb.mss);
            pcb.nrtx = pcb.nrtx.saturating_add(1);
            // The retransmission invalidates the running RTT sample.
            pcb.rttest = None;
            // Exponential backoff, capped; a lost retransmission must not
            // shift the timeout out of all proportion.
            let shift = u32::from(pcb.nrtx.min(6));
            let base = i32::from((pcb.sa >> 3) + pcb.sv).max(1);
            pcb.rto = (base << shift).min(i32::from(i16::max_value())) as i16;

            pcb.ssthresh = (pcb.cwnd.min(u32::from(pcb.snd_wnd)) / 2).max(2 * mss);
            pcb.cwnd = mss;
            pcb.rtime = 0;
            net_trace!("tcp: rto, backoff to {} ticks", pcb.rto);
        }

        // Everything in flight goes back to the front of the unsent queue,
        // in sequence order, to be sent again.
        let mut unacked = self.pcb_at(index).unacked.take();
        let mut unsent = self.pcb_at(index).unsent;
        self.segs.prepend_all(&mut unacked, &mut unsent);
        self.pcb_at(index).unsent = unsent;

        self.output_at(bufs, router, index);
    }
}
