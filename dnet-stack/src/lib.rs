#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)]

//! The DECnet routing node core: point-to-point and broadcast circuit
//! state machines, adjacency management, the routing decision/update/
//! forwarding processes, and the MOP maintenance engine.
//!
//! Everything is sans-I/O.  Frames, datalink status changes and clock
//! ticks enter through [`node::Node::post`]; transmissions, NSP
//! deliveries and MOP responses come back out as [`work::Action`]s.
//! The `io` feature adds an async binding over `dnet-nal` ports.

use core::fmt::{self, Display};

use dnet_wire::{NodeAddr, NodeType};

pub mod adjacency;
pub mod db;
pub mod events;
pub mod lan;
pub mod mop;
pub mod node;
pub mod ptp;
pub mod route;
pub mod work;

#[cfg(feature = "io")]
pub mod io;

/// Wire-format ceiling on intra-area node ids.
pub const MAX_NODES: u16 = 1023;
/// Wire-format ceiling on areas.
pub const MAX_AREA: u8 = 63;
/// Hops value meaning "unreachable".
pub const INF_HOPS: u8 = 31;
/// Cost value meaning "unreachable".
pub const INF_COST: u16 = 1023;
/// Visit field ceiling (6 bits on the wire).
pub const MAX_VISIT: u8 = 63;

/// Listen-timer multiple for point-to-point hellos.
pub const T3MULT: u16 = 2;
/// Listen-timer multiple for broadcast hellos.
pub const BCT3MULT: u16 = 3;
/// Hold-off before acting on a designated-router election win, in
/// seconds.
pub const DRDELAY: u32 = 5;
/// Minimum interval between triggered hellos and between triggered
/// routing updates, in seconds.
pub const T2: u32 = 1;

/// Largest routing-layer payload carried through the stack.
pub const MTU: usize = 1500;
/// Broadcast datalink payload ceiling advertised in hellos.
pub const ETHMTU: u16 = 1498;

pub const MAX_CIRCUITS: usize = 4;
/// Adjacency arena capacity, all circuits together.
pub const MAX_ADJACENCIES: usize = 64;
/// Router columns kept per routing table (self excluded).
pub const MAX_ROUTER_ADJ: usize = 16;

pub(crate) const TIMER_SLOTS: usize = 256;
pub(crate) const WHEEL_BUCKETS: usize = 4096;

pub type Wheel = dnet_timer::TimerWheel<work::TimerOwner, TIMER_SLOTS, WHEEL_BUCKETS>;

/// Identifies a circuit within its node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct CircuitId(pub u8);

/// Identifies an adjacency slot within the node arena.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct AdjId(pub u8);

/// The DECnet phase this node runs.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum Phase {
    Phase2,
    Phase3,
    Phase4,
}

impl Phase {
    pub const fn number(self) -> u8 {
        match self {
            Self::Phase2 => 2,
            Self::Phase3 => 3,
            Self::Phase4 => 4,
        }
    }
}

/// Phase II intercept operating mode.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub enum InterceptMode {
    /// Neither request nor offer intercept.
    None,
    /// This node is a Phase II router offering intercept.
    P2,
    /// This node is a Phase III/IV router offering intercept to
    /// Phase II neighbors.
    #[default]
    P4,
}

/// Per-node configuration.  Parsing config files is the embedder's
/// business; this is the already-digested form.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub id: NodeAddr,
    pub name: heapless::String<6>,
    pub ntype: NodeType,
    pub phase: Phase,
    pub maxnodes: u16,
    pub maxarea: u8,
    pub maxhops: u8,
    pub maxcost: u16,
    pub maxvisits: u8,
    pub amaxhops: u8,
    pub amaxcost: u16,
    /// Point-to-point routing update interval, seconds.
    pub t1: u16,
    /// Broadcast routing update interval, seconds.
    pub bct1: u16,
    pub intercept: InterceptMode,
}

impl NodeConfig {
    pub fn new(id: NodeAddr, ntype: NodeType) -> Self {
        Self {
            id,
            name: heapless::String::new(),
            ntype,
            phase: Phase::Phase4,
            maxnodes: MAX_NODES,
            maxarea: MAX_AREA,
            maxhops: 16,
            maxcost: 128,
            maxvisits: 32,
            amaxhops: 16,
            amaxcost: 128,
            t1: 600,
            bct1: 10,
            intercept: InterceptMode::default(),
        }
    }

    pub const fn home_area(&self) -> u8 {
        self.id.area()
    }

    /// This node's DECnet station address.
    pub const fn station(&self) -> dnet_wire::EthAddr {
        dnet_wire::EthAddr::from_node(self.id)
    }

    pub const fn tid(&self) -> u16 {
        self.id.tid()
    }

    pub(crate) fn clamped_maxnodes(&self) -> u16 {
        self.maxnodes.min(MAX_NODES)
    }

    pub(crate) fn clamped_maxarea(&self) -> u8 {
        self.maxarea.min(MAX_AREA)
    }
}

/// Per-circuit configuration.
#[derive(Clone, Debug)]
pub struct CircuitConfig {
    pub cost: u16,
    /// Hello interval, seconds.  Defaults per medium at attach time.
    pub t3: u16,
    /// Routing update interval override, seconds.
    pub t1: Option<u16>,
    /// Designated-router priority (LAN routers).
    pub priority: u8,
    /// Maximum router adjacencies admitted (LAN routers).
    pub nr: u8,
    /// Request verification from the neighbor (point-to-point).
    pub verify: bool,
    /// Run MOP services on this circuit (LAN).
    pub mop: bool,
    /// Accept console-carrier reservations carrying this verification.
    pub console_verification: Option<[u8; 8]>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            cost: 4,
            t3: 0,
            t1: None,
            priority: 64,
            nr: MAX_ROUTER_ADJ as u8,
            verify: false,
            mop: true,
            console_verification: None,
        }
    }
}

/// Stack-level failures surfaced to the embedder.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Error {
    /// The work queue or an internal table is full.
    QueueFull,
    /// No such circuit.
    NoCircuit,
    /// Operation not valid for this circuit or node type.
    InvalidOperation,
    /// Timer subsystem failure.
    Timer(dnet_timer::Error),
    /// Frame codec failure.
    Wire(dnet_wire::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "Queue full"),
            Self::NoCircuit => write!(f, "No such circuit"),
            Self::InvalidOperation => write!(f, "Invalid operation"),
            Self::Timer(e) => write!(f, "Timer error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<dnet_timer::Error> for Error {
    fn from(e: dnet_timer::Error) -> Self {
        Self::Timer(e)
    }
}

impl From<dnet_wire::Error> for Error {
    fn from(e: dnet_wire::Error) -> Self {
        Self::Wire(e)
    }
}

/// Mutable node services handed down to component handlers during a
/// dispatch: the pieces of the node every component may touch, split
/// out so a circuit or routing borrow stays disjoint.
pub(crate) struct Ctx<'a> {
    pub cfg: &'a NodeConfig,
    /// Seconds since node start; the dispatch clock.
    pub now: u64,
    pub timers: &'a mut Wheel,
    pub actions: &'a mut work::ActionQueue,
    pub queue: &'a mut work::WorkQueue,
    pub events: &'a mut events::EventLog,
    pub db: &'a mut db::NodeDb,
    pub counters: &'a mut ExecCounters,
    pub circ_counters: &'a mut [CircuitCounters; MAX_CIRCUITS],
}

impl Ctx<'_> {
    pub fn circ_counter(&mut self, id: CircuitId) -> &mut CircuitCounters {
        &mut self.circ_counters[id.0 as usize % MAX_CIRCUITS]
    }

    /// Arm a timer, treating wheel overflow as a programming error at
    /// the call site (all protocol delays fit the wheel span).
    pub fn start_timer(&mut self, id: dnet_timer::TimerId, secs: u32) {
        let secs = secs.min(WHEEL_BUCKETS as u32 - 1);
        // Cannot fail: delay clamped, id held by a live component
        let _ = self.timers.start(id, secs);
    }
}

/// Executor (whole-node) counters kept by the routing layer.
#[derive(Copy, Clone, Default, Debug)]
pub struct ExecCounters {
    pub aged_loss: u32,
    pub unreach_loss: u32,
    pub node_oor_loss: u32,
    pub oversized_loss: u32,
    pub fmt_errors: u32,
    pub partial_update_loss: u32,
    pub ver_rejects: u32,
}

/// Per-circuit counters, a subset of the architected set.
#[derive(Copy, Clone, Default, Debug)]
pub struct CircuitCounters {
    pub term_recv: u32,
    pub orig_sent: u32,
    pub trans_recv: u32,
    pub trans_sent: u32,
    pub cir_down: u32,
    pub adj_down: u32,
    pub init_fail: u32,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub pkts_recv: u64,
    pub pkts_sent: u64,
}
