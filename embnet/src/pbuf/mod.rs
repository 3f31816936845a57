//! Reference-counted, chainable packet buffers.
//!
//! A packet is a singly linked chain of buffer segments. Each segment owns (or
//! references) a contiguous payload region and counts its holders; a chain can
//! therefore sit on a send queue and a retransmission queue at the same time
//! and is reclaimed segment by segment as the counts reach zero.
//!
//! Segments are descriptor slots in a fixed slab, addressed by [`PbufId`]
//! indices rather than pointers. Payload storage comes from the [`mem`]
//! allocators: `Ram` segments hold a heap block, `Pool` segments one or more
//! pool blocks, and `Ref` segments point into a read-only region registered by
//! the caller and own nothing.
//!
//! Allocation takes a [`Layer`] so that enough header room is reserved in
//! front of the payload for every protocol below; lower layers then claim
//! their headers with [`header`], which only slides the payload offset within
//! the reserved margin and never reallocates.
//!
//! [`PbufId`]: struct.PbufId.html
//! [`mem`]: ../mem/index.html
//! [`Layer`]: enum.Layer.html
//! [`header`]: struct.Buffers.html#method.header
use crate::config::Config;
use crate::managed::Slice;
use crate::mem::{self, Block, Heap, Pool};

pub use crate::mem::Error;

/// The result type of buffer operations.
pub type Result<T> = core::result::Result<T, Error>;

/// A handle to one buffer segment.
///
/// Handles stay valid while at least one reference to the segment is held.
/// Operations on a stale handle are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PbufId(pub(crate) u16);

/// Where the payload of a segment lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// One contiguous block from the heap.
    Ram,
    /// One or more blocks from the pool allocator.
    Pool,
    /// A region of the registered read-only storage; not owned.
    Ref,
}

/// The protocol layer an allocation is made for.
///
/// Determines how much header room is reserved in front of the payload so
/// that every lower layer can prepend its header without reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// No headroom; the buffer holds a complete frame.
    Raw,
    /// Room for an Ethernet header.
    Ethernet,
    /// Room for IP and Ethernet headers.
    Ip,
    /// Room for TCP, IP and Ethernet headers.
    Transport,
}

impl Layer {
    /// Octets reserved in front of the payload.
    pub fn reserve(self) -> usize {
        match self {
            Layer::Raw => 0,
            Layer::Ethernet => 14,
            Layer::Ip => 34,
            Layer::Transport => 54,
        }
    }
}

/// Backing storage for one descriptor.
///
/// Only needed to set aside storage for [`Buffers::with_storage`]; the
/// default value is an empty slot.
///
/// [`Buffers::with_storage`]: struct.Buffers.html#method.with_storage
#[derive(Debug, Default, Clone, Copy)]
pub struct Slot(Option<Desc>);

#[derive(Debug, Clone, Copy)]
struct Desc {
    kind: Kind,
    block: Option<Block>,
    /// Payload start within the block (or the read-only region for `Ref`).
    off: u32,
    /// Payload bytes in this segment.
    len: u16,
    /// Payload bytes in this segment and all following ones.
    tot_len: u16,
    refs: u16,
    next: Option<PbufId>,
}

/// The buffer slab plus its backing allocators.
///
/// This is the single owner of all packet storage in a stack instance. It is
/// passed by mutable borrow into every layer, preserving the single-writer
/// model without hidden globals.
#[derive(Debug)]
pub struct Buffers<'a> {
    slots: Slice<'a, Slot>,
    heap: Heap<'a>,
    pool: Pool<'a>,
    rom: Slice<'a, u8>,
}

impl<'a> Buffers<'a> {
    /// Create buffers with owned storage per the configuration.
    #[cfg(feature = "std")]
    pub fn new(config: &Config) -> Self {
        Buffers {
            slots: vec![Slot::default(); config.pbuf_slots].into(),
            heap: Heap::new(config.heap_size),
            pool: Pool::new(&config.classes, config.pool_spill),
            rom: Slice::empty(),
        }
    }

    /// Create buffers over caller-provided storage.
    pub fn with_storage(
        slots: Slice<'a, Slot>,
        heap: Heap<'a>,
        pool: Pool<'a>,
    ) -> Self {
        Buffers {
            slots,
            heap,
            pool,
            rom: Slice::empty(),
        }
    }

    /// Register the read-only region that `Ref` segments index into.
    pub fn set_rom<T>(&mut self, rom: T)
        where T: Into<Slice<'a, u8>>
    {
        self.rom = rom.into();
    }

    /// Allocate a segment (or chain) with `len` payload bytes.
    ///
    /// `Ram` allocations are always a single contiguous segment. `Pool`
    /// allocations become a chain when no single class can hold the request.
    /// For `Ref` segments use [`alloc_ref`].
    ///
    /// [`alloc_ref`]: #method.alloc_ref
    pub fn alloc(&mut self, layer: Layer, len: usize, kind: Kind) -> Result<PbufId> {
        let reserve = layer.reserve();
        if len + reserve > u16::max_value() as usize {
            return Err(Error::BadSize);
        }

        match kind {
            Kind::Ram => {
                let block = self.heap.alloc(reserve + len)?;
                self.bind(Desc {
                    kind: Kind::Ram,
                    block: Some(block),
                    off: reserve as u32,
                    len: len as u16,
                    tot_len: len as u16,
                    refs: 1,
                    next: None,
                }).map_err(|err| {
                    self.heap.free(block);
                    err
                })
            }
            Kind::Pool => self.alloc_pool_chain(reserve, len),
            Kind::Ref => Err(Error::BadSize),
        }
    }

    /// Allocate a `Ref` segment describing part of the registered region.
    pub fn alloc_ref(&mut self, offset: usize, len: usize) -> Result<PbufId> {
        if offset + len > self.rom.len() || len > u16::max_value() as usize {
            return Err(Error::BadSize);
        }
        self.bind(Desc {
            kind: Kind::Ref,
            block: None,
            off: offset as u32,
            len: len as u16,
            tot_len: len as u16,
            refs: 1,
            next: None,
        })
    }

    /// Add one reference to a segment.
    pub fn incref(&mut self, p: PbufId) {
        let desc = self.desc_mut(p);
        debug_assert!(desc.refs > 0);
        desc.refs += 1;
    }

    /// Drop one reference from the head of a chain.
    ///
    /// A segment is released once its own count reaches zero; the walk then
    /// continues to the successor, which loses the reference the released
    /// segment held on it. Returns the number of segments released. Calling
    /// this on an already released handle is rejected and returns zero.
    pub fn free(&mut self, p: PbufId) -> usize {
        let mut freed = 0;
        let mut cursor = Some(p);
        while let Some(id) = cursor {
            let desc = match self.slots[id.0 as usize].0 {
                Some(desc) => desc,
                None => break,
            };
            debug_assert!(desc.refs > 0);
            if desc.refs > 1 {
                self.slots[id.0 as usize].0 = Some(Desc { refs: desc.refs - 1, ..desc });
                break;
            }

            self.slots[id.0 as usize].0 = None;
            match (desc.kind, desc.block) {
                (Kind::Ram, Some(block)) => self.heap.free(block),
                (Kind::Pool, Some(block)) => self.pool.free(block),
                (Kind::Ref, _) => (),
                _ => debug_assert!(false, "pbuf: owned segment without block"),
            }
            freed += 1;
            cursor = desc.next;
        }
        freed
    }

    /// Claim or return header room at the front of this segment.
    ///
    /// A positive `delta` moves the payload start backward into the reserved
    /// margin, exposing `delta` octets for a header to be prepended; a
    /// negative one hides octets again. Fails without effect when the margin
    /// is insufficient. `Ref` segments have no margin.
    pub fn header(&mut self, p: PbufId, delta: i32) -> Result<()> {
        let desc = self.desc_mut(p);
        if desc.kind == Kind::Ref && delta > 0 {
            return Err(Error::BadSize);
        }
        let off = desc.off as i64 - i64::from(delta);
        let len = i64::from(desc.len) + i64::from(delta);
        if off < 0 || len < 0 || len > i64::from(u16::max_value()) {
            return Err(Error::BadSize);
        }
        desc.off = off as u32;
        desc.len = len as u16;
        desc.tot_len = (i64::from(desc.tot_len) + i64::from(delta)) as u16;
        Ok(())
    }

    /// Append `tail` to the chain headed by `head`.
    ///
    /// The chain takes one reference on `tail`; every segment of `head`'s
    /// chain accounts for the appended bytes in its `tot_len`.
    pub fn chain(&mut self, head: PbufId, tail: PbufId) {
        debug_assert!(head != tail);
        let added = self.desc(tail).tot_len;
        self.incref(tail);

        let mut cursor = head;
        loop {
            let desc = self.desc_mut(cursor);
            desc.tot_len += added;
            match desc.next {
                Some(next) => cursor = next,
                None => {
                    desc.next = Some(tail);
                    break;
                }
            }
        }
    }

    /// Shrink the chain to hold at most `len` payload bytes.
    ///
    /// Segments past the cut are unreferenced; the last surviving segment
    /// keeps its storage and only shortens its visible payload. Growing is
    /// not possible.
    pub fn truncate(&mut self, p: PbufId, len: usize) {
        if len >= self.tot_len(p) {
            return;
        }

        let mut remaining = len;
        let mut cursor = p;
        loop {
            let desc = self.desc_mut(cursor);
            desc.tot_len = remaining as u16;
            if usize::from(desc.len) >= remaining {
                desc.len = remaining as u16;
                let tail = desc.next.take();
                if let Some(tail) = tail {
                    self.free(tail);
                }
                break;
            }
            remaining -= usize::from(desc.len);
            match desc.next {
                Some(next) => cursor = next,
                None => {
                    debug_assert!(false, "pbuf: chain shorter than tot_len");
                    break;
                }
            }
        }
    }

    /// Detach the first segment from its chain and release it.
    ///
    /// The rest of the chain is returned; its reference, previously held by
    /// the detached head, now belongs to the caller.
    pub fn dechain(&mut self, p: PbufId) -> Option<PbufId> {
        let rest = self.desc_mut(p).next.take();
        if rest.is_some() {
            let len = self.desc(p).len;
            self.desc_mut(p).tot_len = len;
        }
        self.free(p);
        rest
    }

    /// Copy the payload of `src` into the storage of `dst`.
    ///
    /// The destination chain must have room for all of the source's bytes;
    /// segment boundaries of the two chains are independent.
    pub fn copy(&mut self, dst: PbufId, src: PbufId) -> Result<()> {
        if self.desc(dst).tot_len < self.desc(src).tot_len {
            return Err(Error::BadSize);
        }

        let mut from = Some(src);
        let mut offset = 0;
        while let Some(id) = from {
            let (len, next) = {
                let desc = self.desc(id);
                (desc.len as usize, desc.next)
            };
            let mut scratch = [0u8; 64];
            let mut done = 0;
            while done < len {
                let step = scratch.len().min(len - done);
                let source = &self.segment_bytes(id)[done..done + step];
                scratch[..step].copy_from_slice(source);
                self.fill(dst, offset + done, &scratch[..step]);
                done += step;
            }
            offset += len;
            from = next;
        }
        Ok(())
    }

    /// Copy up to `dst.len()` payload bytes starting at `offset` into `dst`.
    ///
    /// Returns the number of bytes copied, which is short only when the chain
    /// ends early.
    pub fn copy_partial(&self, p: PbufId, dst: &mut [u8], offset: usize) -> usize {
        let mut skip = offset;
        let mut copied = 0;
        let mut cursor = Some(p);
        while let Some(id) = cursor {
            let desc = self.desc(id);
            let bytes = self.segment_bytes(id);
            if skip < bytes.len() {
                let take = (bytes.len() - skip).min(dst.len() - copied);
                dst[copied..copied + take].copy_from_slice(&bytes[skip..skip + take]);
                copied += take;
                skip = 0;
                if copied == dst.len() {
                    break;
                }
            } else {
                skip -= bytes.len();
            }
            cursor = desc.next;
        }
        copied
    }

    /// Write `data` into the chain's payload starting at `offset`.
    ///
    /// Returns the number of bytes written; writing into a `Ref` segment is
    /// skipped (its storage is read-only).
    pub fn fill(&mut self, p: PbufId, offset: usize, data: &[u8]) -> usize {
        let mut skip = offset;
        let mut written = 0;
        let mut cursor = Some(p);
        while let Some(id) = cursor {
            let (len, next, writable) = {
                let desc = self.desc(id);
                (desc.len as usize, desc.next, desc.kind != Kind::Ref)
            };
            if skip < len {
                let take = (len - skip).min(data.len() - written);
                if writable {
                    let bytes = self.segment_bytes_mut(id);
                    bytes[skip..skip + take].copy_from_slice(&data[written..written + take]);
                }
                written += take;
                skip = 0;
                if written == data.len() {
                    break;
                }
            } else {
                skip -= len;
            }
            cursor = next;
        }
        written
    }

    /// Payload bytes of this segment only.
    pub fn payload(&self, p: PbufId) -> &[u8] {
        self.segment_bytes(p)
    }

    /// Mutable payload bytes of this segment only.
    ///
    /// # Panics
    ///
    /// Panics for `Ref` segments, whose storage is read-only.
    pub fn payload_mut(&mut self, p: PbufId) -> &mut [u8] {
        self.segment_bytes_mut(p)
    }

    /// Payload bytes in this segment.
    pub fn len(&self, p: PbufId) -> usize {
        self.desc(p).len as usize
    }

    /// Payload bytes in this segment and all following ones.
    pub fn tot_len(&self, p: PbufId) -> usize {
        self.desc(p).tot_len as usize
    }

    /// The storage kind of this segment.
    pub fn kind(&self, p: PbufId) -> Kind {
        self.desc(p).kind
    }

    /// Current reference count of this segment.
    pub fn refs(&self, p: PbufId) -> usize {
        self.desc(p).refs as usize
    }

    /// The next segment of the chain, if any.
    pub fn next(&self, p: PbufId) -> Option<PbufId> {
        self.desc(p).next
    }

    /// Whether the handle refers to a live segment.
    pub fn is_live(&self, p: PbufId) -> bool {
        self.slots.get(p.0 as usize).map_or(false, |slot| slot.0.is_some())
    }

    /// Check the length invariant along a chain.
    pub(crate) fn chain_consistent(&self, p: PbufId) -> bool {
        let mut cursor = Some(p);
        while let Some(id) = cursor {
            let desc = self.desc(id);
            let tail = desc.next.map_or(0, |next| self.desc(next).tot_len);
            if desc.tot_len != desc.len + tail {
                return false;
            }
            cursor = desc.next;
        }
        true
    }

    fn alloc_pool_chain(&mut self, reserve: usize, len: usize) -> Result<PbufId> {
        let cap = self.pool.max_size();
        if cap <= reserve {
            return Err(Error::BadSize);
        }

        // Common case first: everything fits one block of a single class.
        if reserve + len <= cap {
            let block = self.pool.alloc(reserve + len)?;
            return self.bind(Desc {
                kind: Kind::Pool,
                block: Some(block),
                off: reserve as u32,
                len: len as u16,
                tot_len: len as u16,
                refs: 1,
                next: None,
            }).map_err(|err| {
                self.pool.free(block);
                err
            });
        }

        let mut head: Option<PbufId> = None;
        let mut tail: Option<PbufId> = None;
        let mut produced = 0;
        while produced < len || head.is_none() {
            let room = if head.is_none() { cap - reserve } else { cap };
            let seg_len = room.min(len - produced);
            let request = if head.is_none() { reserve + seg_len } else { seg_len };

            let allocated = self.pool.alloc(request)
                .and_then(|block| {
                    self.bind(Desc {
                        kind: Kind::Pool,
                        block: Some(block),
                        off: if head.is_none() { reserve as u32 } else { 0 },
                        len: seg_len as u16,
                        tot_len: (len - produced) as u16,
                        refs: 1,
                        next: None,
                    }).map_err(|err| {
                        self.pool.free(block);
                        err
                    })
                });

            let id = match allocated {
                Ok(id) => id,
                Err(err) => {
                    if let Some(head) = head {
                        self.free(head);
                    }
                    return Err(err);
                }
            };

            if let Some(tail) = tail {
                self.desc_mut(tail).next = Some(id);
            }
            head.get_or_insert(id);
            tail = Some(id);
            produced += seg_len;
        }
        Ok(head.expect("Loop ran at least once"))
    }

    fn bind(&mut self, desc: Desc) -> Result<PbufId> {
        let slot = self.slots.iter().position(|slot| slot.0.is_none());
        match slot {
            Some(index) => {
                self.slots[index].0 = Some(desc);
                Ok(PbufId(index as u16))
            }
            None => {
                net_debug!("pbuf: descriptor slab exhausted");
                Err(Error::Exhausted)
            }
        }
    }

    fn desc(&self, p: PbufId) -> &Desc {
        self.slots[p.0 as usize].0
            .as_ref()
            .expect("Stale pbuf handle")
    }

    fn desc_mut(&mut self, p: PbufId) -> &mut Desc {
        self.slots[p.0 as usize].0
            .as_mut()
            .expect("Stale pbuf handle")
    }

    fn segment_bytes(&self, p: PbufId) -> &[u8] {
        let desc = self.desc(p);
        let start = desc.off as usize;
        let end = start + desc.len as usize;
        match (desc.kind, desc.block) {
            (Kind::Ram, Some(block)) => &self.heap.bytes(block)[start..end],
            (Kind::Pool, Some(block)) => &self.pool.bytes(block)[start..end],
            (Kind::Ref, _) => &self.rom[start..end],
            _ => unreachable!("owned segment without block"),
        }
    }

    fn segment_bytes_mut(&mut self, p: PbufId) -> &mut [u8] {
        let desc = *self.desc(p);
        let start = desc.off as usize;
        let end = start + desc.len as usize;
        match (desc.kind, desc.block) {
            (Kind::Ram, Some(block)) => &mut self.heap.bytes_mut(block)[start..end],
            (Kind::Pool, Some(block)) => &mut self.pool.bytes_mut(block)[start..end],
            (Kind::Ref, _) => panic!("write into read-only pbuf"),
            _ => unreachable!("owned segment without block"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers() -> Buffers<'static> {
        Buffers::new(&Config::default())
    }

    #[test]
    fn tot_len_invariant_after_chain() {
        let mut bufs = buffers();
        let head = bufs.alloc(Layer::Transport, 100, Kind::Ram).unwrap();
        let mid = bufs.alloc(Layer::Raw, 40, Kind::Ram).unwrap();
        let tail = bufs.alloc(Layer::Raw, 60, Kind::Pool).unwrap();

        bufs.chain(mid, tail);
        bufs.chain(head, mid);

        assert_eq!(bufs.tot_len(head), 200);
        assert_eq!(bufs.tot_len(mid), 100);
        assert!(bufs.chain_consistent(head));

        // Chaining added a reference that the local handle still holds.
        assert_eq!(bufs.refs(mid), 2);
        assert_eq!(bufs.refs(tail), 2);
        bufs.free(mid);
        bufs.free(tail);

        assert_eq!(bufs.free(head), 3);
    }

    #[test]
    fn shared_tail_survives_head_free() {
        let mut bufs = buffers();
        let head = bufs.alloc(Layer::Raw, 32, Kind::Ram).unwrap();
        let tail = bufs.alloc(Layer::Raw, 32, Kind::Ram).unwrap();
        bufs.chain(head, tail);

        // A second queue holds the tail.
        bufs.incref(tail);
        bufs.free(tail);

        // Only the head is released; the tail's own count is still held.
        assert_eq!(bufs.free(head), 1);
        assert!(bufs.is_live(tail));
        assert_eq!(bufs.refs(tail), 1);
        assert_eq!(bufs.free(tail), 1);
        assert!(!bufs.is_live(tail));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut bufs = buffers();
        let p = bufs.alloc(Layer::Raw, 16, Kind::Ram).unwrap();
        assert_eq!(bufs.free(p), 1);
        // The handle is dead now; a repeated free releases nothing.
        assert_eq!(bufs.free(p), 0);
    }

    #[test]
    fn header_slides_within_margin() {
        let mut bufs = buffers();
        let p = bufs.alloc(Layer::Ip, 20, Kind::Ram).unwrap();
        assert_eq!(bufs.len(p), 20);

        // Claim room for an IP header, then an Ethernet header.
        bufs.header(p, 20).unwrap();
        bufs.header(p, 14).unwrap();
        assert_eq!(bufs.len(p), 54);

        // The margin is exhausted.
        assert_eq!(bufs.header(p, 1), Err(Error::BadSize));

        // Give the headers back.
        bufs.header(p, -34).unwrap();
        assert_eq!(bufs.len(p), 20);
        bufs.free(p);
    }

    #[test]
    fn copy_between_chains() {
        let mut bufs = buffers();
        let src = bufs.alloc(Layer::Raw, 96, Kind::Ram).unwrap();
        let pattern: Vec<u8> = (0..96u8).collect();
        bufs.fill(src, 0, &pattern);

        // Destination with different segmentation.
        let dst_head = bufs.alloc(Layer::Raw, 40, Kind::Ram).unwrap();
        let dst_tail = bufs.alloc(Layer::Raw, 56, Kind::Ram).unwrap();
        bufs.chain(dst_head, dst_tail);
        bufs.free(dst_tail);

        bufs.copy(dst_head, src).unwrap();
        let mut readback = [0u8; 96];
        assert_eq!(bufs.copy_partial(dst_head, &mut readback, 0), 96);
        assert_eq!(&readback[..], &pattern[..]);
        assert!(bufs.chain_consistent(dst_head));

        bufs.free(src);
        bufs.free(dst_head);
    }

    #[test]
    fn copy_partial_with_offset() {
        let mut bufs = buffers();
        let head = bufs.alloc(Layer::Raw, 10, Kind::Ram).unwrap();
        let tail = bufs.alloc(Layer::Raw, 10, Kind::Ram).unwrap();
        bufs.fill(head, 0, &[1; 10]);
        bufs.fill(tail, 0, &[2; 10]);
        bufs.chain(head, tail);
        bufs.free(tail);

        let mut out = [0u8; 8];
        assert_eq!(bufs.copy_partial(head, &mut out, 6), 8);
        assert_eq!(out, [1, 1, 1, 1, 2, 2, 2, 2]);

        // Short read past the end of the chain.
        let mut out = [0u8; 8];
        assert_eq!(bufs.copy_partial(head, &mut out, 16), 4);
        bufs.free(head);
    }

    #[test]
    fn ref_segments_own_nothing() {
        let mut bufs = buffers();
        bufs.set_rom(b"canned response".to_vec());

        let p = bufs.alloc_ref(7, 8).unwrap();
        assert_eq!(bufs.payload(p), b"response");
        assert_eq!(bufs.kind(p), Kind::Ref);

        // No header margin exists in front of read-only storage.
        assert_eq!(bufs.header(p, 14), Err(Error::BadSize));
        assert_eq!(bufs.free(p), 1);

        assert_eq!(bufs.alloc_ref(10, 20), Err(Error::BadSize));
    }

    #[test]
    fn pool_chain_allocation() {
        let mut bufs = buffers();
        // Larger than the largest class: must come out as a chain.
        let p = bufs.alloc(Layer::Ethernet, 2000, Kind::Pool).unwrap();
        assert_eq!(bufs.tot_len(p), 2000);
        assert!(bufs.next(p).is_some());
        assert!(bufs.chain_consistent(p));
        assert!(bufs.free(p) >= 2);
    }
}
