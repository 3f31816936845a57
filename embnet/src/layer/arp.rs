//! The address resolution cache of one interface.
//!
//! Maps IPv4 addresses to Ethernet addresses. An entry moves from pending to
//! stable when a reply arrives and back to empty when it ages out. While an
//! address is pending, one packet chain may wait in the entry; periodic
//! aging retransmits the request until a configured number of ticks has
//! passed, then drops the entry together with its queued packet.
use crate::config::ArpConfig;
use crate::managed::Slice;
use crate::pbuf::{Buffers, PbufId};
use crate::wire::{EthernetAddress, Ipv4Address};

#[derive(Debug)]
enum State {
    /// A request is outstanding; at most one packet waits for the answer.
    Pending { queued: Option<PbufId> },
    /// The mapping is known.
    Stable { haddr: EthernetAddress },
}

#[derive(Debug)]
struct Entry {
    addr: Ipv4Address,
    /// Ticks since the entry was created or last refreshed.
    age: u8,
    state: State,
}

/// Storage for one cache entry.
#[derive(Debug, Default)]
pub struct Slot(Option<Entry>);

/// The answer to a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// The mapping is known; deliver to this address now.
    Stable(EthernetAddress),
    /// The address is being resolved; a request should be (re)sent. A packet
    /// passed in has been queued on the entry, replacing any earlier one.
    Pending,
}

/// The resolution cache.
#[derive(Debug)]
pub struct Cache<'a> {
    slots: Slice<'a, Slot>,
    max_age_stable: u8,
    max_age_pending: u8,
    /// Most recently resolved slot, checked before the full scan.
    last_hit: usize,
}

impl<'a> Cache<'a> {
    /// Create a cache with owned entry storage.
    #[cfg(feature = "std")]
    pub fn new(config: &ArpConfig) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(config.entries, Slot::default);
        Self::with_storage(slots, config)
    }

    /// Create a cache over caller-provided entry storage.
    pub fn with_storage<T>(slots: T, config: &ArpConfig) -> Self
        where T: Into<Slice<'a, Slot>>
    {
        Cache {
            slots: slots.into(),
            max_age_stable: config.max_age_stable,
            max_age_pending: config.max_age_pending,
            last_hit: 0,
        }
    }

    /// Look up a stable mapping without touching entry state.
    pub fn lookup(&mut self, addr: Ipv4Address) -> Option<EthernetAddress> {
        if let Some(Entry { addr: hit, state: State::Stable { haddr }, .. })
            = &self.slots[self.last_hit].0
        {
            if *hit == addr {
                return Some(*haddr);
            }
        }

        let index = self.find(addr)?;
        match self.slots[index].0 {
            Some(Entry { state: State::Stable { haddr }, .. }) => {
                self.last_hit = index;
                Some(haddr)
            },
            _ => None,
        }
    }

    /// Resolve an address, queueing `packet` until the answer is known.
    ///
    /// On [`Resolve::Pending`] the entry takes ownership of the packet; an
    /// earlier queued packet is replaced and freed. On [`Resolve::Stable`]
    /// the packet stays with the caller for immediate delivery.
    ///
    /// [`Resolve::Pending`]: enum.Resolve.html#variant.Pending
    /// [`Resolve::Stable`]: enum.Resolve.html#variant.Stable
    pub fn resolve(&mut self, bufs: &mut Buffers, addr: Ipv4Address, packet: Option<PbufId>)
        -> Resolve
    {
        if let Some(index) = self.find(addr) {
            let entry = self.slots[index].0.as_mut().expect("found entry is filled");
            match &mut entry.state {
                State::Stable { haddr } => {
                    let haddr = *haddr;
                    self.last_hit = index;
                    return Resolve::Stable(haddr);
                },
                State::Pending { queued } => {
                    if let Some(packet) = packet {
                        if let Some(old) = queued.replace(packet) {
                            net_debug!("arp: replacing packet queued for {}", addr);
                            bufs.free(old);
                        }
                    }
                    return Resolve::Pending;
                },
            }
        }

        let index = self.vacate(bufs);
        self.slots[index].0 = Some(Entry {
            addr,
            age: 0,
            state: State::Pending { queued: packet },
        });
        Resolve::Pending
    }

    /// Record a mapping learned from a received ARP packet.
    ///
    /// An existing entry is refreshed in place; otherwise only an empty slot
    /// is used, so unsolicited traffic can not evict entries in use. When
    /// the entry was pending, its queued packet is handed back for delivery.
    pub fn learn(&mut self, addr: Ipv4Address, haddr: EthernetAddress) -> Option<PbufId> {
        let index = match self.find(addr) {
            Some(index) => index,
            None => {
                if let Some(index) = self.slots.iter().position(|slot| slot.0.is_none()) {
                    self.slots[index].0 = Some(Entry {
                        addr,
                        age: 0,
                        state: State::Stable { haddr },
                    });
                }
                return None;
            },
        };

        let entry = self.slots[index].0.as_mut().expect("found entry is filled");
        entry.age = 0;
        let queued = match &mut entry.state {
            State::Pending { queued } => queued.take(),
            State::Stable { .. } => None,
        };
        entry.state = State::Stable { haddr };
        queued
    }

    /// Advance every entry's age by one tick.
    ///
    /// Expired entries are dropped, freeing any queued packet. For each
    /// address still pending, `retry` is invoked so the caller retransmits
    /// the request.
    pub fn tick<F>(&mut self, bufs: &mut Buffers, mut retry: F)
        where F: FnMut(Ipv4Address)
    {
        for slot in self.slots.iter_mut() {
            let expired = match &mut slot.0 {
                None => false,
                Some(entry) => {
                    entry.age = entry.age.saturating_add(1);
                    match &entry.state {
                        State::Stable { .. } => entry.age >= self.max_age_stable,
                        State::Pending { .. } => {
                            if entry.age >= self.max_age_pending {
                                true
                            } else {
                                retry(entry.addr);
                                false
                            }
                        },
                    }
                },
            };

            if expired {
                let entry = slot.0.take().expect("expired entry is filled");
                net_debug!("arp: entry for {} expired", entry.addr);
                if let State::Pending { queued: Some(packet) } = entry.state {
                    bufs.free(packet);
                }
            }
        }
    }

    /// Drop every entry, freeing queued packets.
    pub fn flush(&mut self, bufs: &mut Buffers) {
        for slot in self.slots.iter_mut() {
            if let Some(Entry { state: State::Pending { queued: Some(packet) }, .. })
                = slot.0.take()
            {
                bufs.free(packet);
            }
        }
    }

    fn find(&self, addr: Ipv4Address) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.0.as_ref().map_or(false, |entry| entry.addr == addr)
        })
    }

    /// Pick the slot for a new entry, evicting if the table is full.
    ///
    /// Preference order: an empty slot, the oldest stable entry, the oldest
    /// pending entry without a queued packet, the oldest pending entry with
    /// one. A freshly resolving address must never displace a pending entry
    /// while an expendable stable mapping remains.
    fn vacate(&mut self, bufs: &mut Buffers) -> usize {
        let mut empty = None;
        let mut stable = None;
        let mut pending = None;
        let mut pending_queued = None;

        for (index, slot) in self.slots.iter().enumerate() {
            let entry = match &slot.0 {
                None => {
                    empty = empty.or(Some(index));
                    continue;
                },
                Some(entry) => entry,
            };
            let candidate = match &entry.state {
                State::Stable { .. } => &mut stable,
                State::Pending { queued: None } => &mut pending,
                State::Pending { queued: Some(_) } => &mut pending_queued,
            };
            match candidate {
                Some((_, age)) if *age >= entry.age => (),
                _ => *candidate = Some((index, entry.age)),
            }
        }

        let index = empty
            .or(stable.map(|(index, _)| index))
            .or(pending.map(|(index, _)| index))
            .or(pending_queued.map(|(index, _)| index))
            .expect("cache has at least one slot");

        if let Some(Entry { state: State::Pending { queued: Some(packet) }, .. })
            = self.slots[index].0.take()
        {
            bufs.free(packet);
        }
        index
    }
}
