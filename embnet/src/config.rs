//! Build/init-time configuration.
//!
//! Everything here is fixed when the stack is constructed, consistent with the
//! embedded target: arena sizes, pool size classes, queue depths and protocol
//! constants are not runtime-negotiable. The values are plain data so a port
//! can keep one `const` configuration per board.

/// One fixed-size class of the pool allocator.
///
/// A class with `count == 0` is ignored, which allows configurations to be
/// written as fixed-length arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolClass {
    /// Payload bytes of every block in this class.
    pub size: u16,
    /// Number of blocks carved out for this class.
    pub count: u16,
}

impl PoolClass {
    /// A disabled class, usable as array filler.
    pub const EMPTY: PoolClass = PoolClass { size: 0, count: 0 };
}

/// Configuration of the ARP cache of one interface.
#[derive(Debug, Clone, Copy)]
pub struct ArpConfig {
    /// Number of cache entries.
    pub entries: usize,
    /// Ticks until a stable entry expires.
    pub max_age_stable: u8,
    /// Ticks until a pending entry gives up; one request is retransmitted per
    /// tick while pending.
    pub max_age_pending: u8,
}

/// Configuration of the TCP engine.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    /// Number of connection slots.
    pub pcbs: usize,
    /// Number of segment slots shared by all connections.
    pub segments: usize,
    /// Maximum segment size, the largest payload per segment.
    pub mss: u16,
    /// Send-buffer budget per connection, in bytes.
    pub snd_buf: u16,
    /// Maximum segments on `unsent` plus `unacked` per connection.
    pub snd_queuelen: u16,
    /// Receive window advertised per connection, in bytes.
    pub rcv_wnd: u16,
    /// Initial retransmission timeout, in slow-timer ticks.
    pub rto_init: i16,
    /// Data retransmission attempts before the connection is aborted.
    pub max_rtx: u8,
    /// SYN retransmission attempts before the connection is aborted.
    pub max_syn_rtx: u8,
}

/// Top-level configuration consumed by [`Stack::new`].
///
/// [`Stack::new`]: ../stack/struct.Stack.html#method.new
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Bytes of the best-fit heap arena backing `Ram` packet buffers.
    pub heap_size: usize,
    /// Size classes of the pool allocator backing `Pool` packet buffers.
    pub classes: [PoolClass; 8],
    /// Whether a pool allocation may spill into progressively larger classes
    /// when the minimal fitting class is exhausted.
    pub pool_spill: bool,
    /// Number of packet buffer descriptors.
    pub pbuf_slots: usize,
    /// Depth of the egress frame queue between router and link driver.
    pub egress_depth: usize,
    /// ARP cache parameters, applied to every interface.
    pub arp: ArpConfig,
    /// TCP engine parameters.
    pub tcp: TcpConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            heap_size: 16 * 1024,
            classes: [
                PoolClass { size: 64, count: 16 },
                PoolClass { size: 128, count: 8 },
                PoolClass { size: 256, count: 8 },
                PoolClass { size: 512, count: 4 },
                PoolClass { size: 1536, count: 4 },
                PoolClass::EMPTY,
                PoolClass::EMPTY,
                PoolClass::EMPTY,
            ],
            pool_spill: false,
            pbuf_slots: 64,
            egress_depth: 8,
            arp: ArpConfig::default(),
            tcp: TcpConfig::default(),
        }
    }
}

impl Default for ArpConfig {
    fn default() -> ArpConfig {
        ArpConfig {
            entries: 8,
            // With the customary 5 s aging tick this expires stable mappings
            // after 20 minutes and abandons unanswered requests after 20 s.
            max_age_stable: 240,
            max_age_pending: 4,
        }
    }
}

impl Default for TcpConfig {
    fn default() -> TcpConfig {
        TcpConfig {
            pcbs: 8,
            segments: 32,
            mss: 536,
            snd_buf: 4096,
            snd_queuelen: 16,
            rcv_wnd: 4096,
            rto_init: 3,
            max_rtx: 12,
            max_syn_rtx: 6,
        }
    }
}
