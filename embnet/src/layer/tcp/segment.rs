//! The shared segment slab and its intrusive queues.
//!
//! Segments of every connection live in one fixed slab; the `unsent`,
//! `unacked` and out-of-order queues are singly linked lists threaded
//! through the slab by slot index. A queue is represented by its head index
//! stored in the connection.
use crate::managed::Slice;
use crate::pbuf::{Buffers, PbufId};
use crate::wire::tcp::Flags;
use crate::wire::SeqNumber;

/// A queued TCP segment.
///
/// The payload chain holds data bytes only; protocol headers are built into
/// a separate buffer at transmission time so the payload can be shared
/// between this queue and frames in flight.
#[derive(Debug)]
pub(crate) struct Segment {
    /// Sequence number of the first payload byte.
    pub(crate) seq: SeqNumber,
    /// Payload bytes; SYN and FIN occupy sequence space beyond this.
    pub(crate) len: u16,
    /// Flags to emit with the segment.
    pub(crate) flags: Flags,
    /// The payload chain, absent for bare control segments.
    pub(crate) payload: Option<PbufId>,
    /// Next segment in whatever queue holds this one.
    pub(crate) next: Option<u16>,
}

impl Segment {
    /// The sequence space the segment occupies, flags included.
    pub(crate) fn seq_len(&self) -> usize {
        usize::from(self.len) + self.flags.sequence_len()
    }

    /// The sequence number directly after this segment.
    pub(crate) fn end(&self) -> SeqNumber {
        self.seq + self.seq_len()
    }
}

/// Storage for one segment.
#[derive(Debug, Default)]
pub struct Slot(Option<Segment>);

/// The slab of segment slots shared by all connections.
#[derive(Debug)]
pub(crate) struct Slab<'a> {
    slots: Slice<'a, Slot>,
}

impl<'a> Slab<'a> {
    pub(crate) fn new<T>(slots: T) -> Self
        where T: Into<Slice<'a, Slot>>
    {
        Slab { slots: slots.into() }
    }

    /// Place a segment into a free slot.
    pub(crate) fn alloc(&mut self, segment: Segment) -> Option<u16> {
        let index = self.slots.iter().position(|slot| slot.0.is_none())?;
        self.slots[index].0 = Some(segment);
        Some(index as u16)
    }

    /// Release a slot, freeing its payload chain.
    pub(crate) fn free(&mut self, bufs: &mut Buffers, index: u16) {
        let segment = self.slots[index as usize].0.take();
        debug_assert!(segment.is_some(), "tcp: freeing an empty segment slot");
        if let Some(Segment { payload: Some(payload), .. }) = segment {
            bufs.free(payload);
        }
    }

    /// Move the payload chain out of a segment, leaving it bare.
    pub(crate) fn take_payload(&mut self, index: u16) -> Option<PbufId> {
        self.get_mut(index).payload.take()
    }

    pub(crate) fn get(&self, index: u16) -> &Segment {
        self.slots[index as usize].0.as_ref().expect("segment index is live")
    }

    pub(crate) fn get_mut(&mut self, index: u16) -> &mut Segment {
        self.slots[index as usize].0.as_mut().expect("segment index is live")
    }

    /// Append a segment to the back of a queue.
    pub(crate) fn push_back(&mut self, head: &mut Option<u16>, index: u16) {
        debug_assert!(self.get(index).next.is_none());
        match self.back(*head) {
            None => *head = Some(index),
            Some(last) => self.get_mut(last).next = Some(index),
        }
    }

    /// Put a segment at the front of a queue.
    pub(crate) fn push_front(&mut self, head: &mut Option<u16>, index: u16) {
        self.get_mut(index).next = *head;
        *head = Some(index);
    }

    /// Detach the first segment of a queue.
    pub(crate) fn pop_front(&mut self, head: &mut Option<u16>) -> Option<u16> {
        let index = head.take()?;
        *head = self.get_mut(index).next.take();
        Some(index)
    }

    /// Insert a segment keeping the queue in ascending sequence order.
    pub(crate) fn insert_ordered(&mut self, head: &mut Option<u16>, index: u16) {
        let seq = self.get(index).seq;
        let mut prev: Option<u16> = None;
        let mut cursor = *head;
        while let Some(at) = cursor {
            if seq.lt(self.get(at).seq) {
                break;
            }
            prev = Some(at);
            cursor = self.get(at).next;
        }

        self.get_mut(index).next = cursor;
        match prev {
            None => *head = Some(index),
            Some(prev) => self.get_mut(prev).next = Some(index),
        }
    }

    /// Attach an entire queue, in order, to the back of another.
    pub(crate) fn append(&mut self, head: &mut Option<u16>, queue: Option<u16>) {
        let queue = match queue {
            None => return,
            Some(queue) => queue,
        };
        match self.back(*head) {
            None => *head = Some(queue),
            Some(last) => self.get_mut(last).next = Some(queue),
        }
    }

    /// Move an entire queue, in order, to the front of another.
    pub(crate) fn prepend_all(&mut self, from: &mut Option<u16>, to: &mut Option<u16>) {
        let moved = match from.take() {
            None => return,
            Some(moved) => moved,
        };

        let mut last = moved;
        while let Some(next) = self.get(last).next {
            last = next;
        }
        self.get_mut(last).next = *to;
        *to = Some(moved);
    }

    /// The number of segments in a queue.
    pub(crate) fn count(&self, head: Option<u16>) -> usize {
        let mut count = 0;
        let mut cursor = head;
        while let Some(at) = cursor {
            count += 1;
            cursor = self.get(at).next;
        }
        count
    }

    /// The last segment of a queue.
    pub(crate) fn back(&self, head: Option<u16>) -> Option<u16> {
        let mut cursor = head?;
        while let Some(next) = self.get(cursor).next {
            cursor = next;
        }
        Some(cursor)
    }

    /// Release every segment of a queue.
    pub(crate) fn free_all(&mut self, bufs: &mut Buffers, head: &mut Option<u16>) {
        while let Some(index) = self.pop_front(head) {
            self.free(bufs, index);
        }
    }
}
