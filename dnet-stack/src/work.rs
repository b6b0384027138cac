//! Work items entering the node and actions leaving it.
//!
//! Every producer (datalink receive path, timer wheel, embedder API)
//! posts `Work`; the single dispatch loop consumes it.  Components
//! never perform I/O: they push `Action`s, which the embedder (or the
//! `io` module) drains after each dispatch.

use dnet_wire::{mop::Counters, EthAddr, NodeAddr};

use crate::{AdjId, CircuitId, MTU};

/// A received or outgoing routing-layer payload.
pub type FrameBuf = heapless::Vec<u8, MTU>;

/// Console-carrier data chunk.
pub type ConsoleBuf = heapless::Vec<u8, 512>;

/// Which port of a circuit's datalink a frame belongs to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Port {
    Routing,
    MopConsole,
    MopLoop,
}

/// Identifies the component a timeout belongs to.  Carried as the
/// timer wheel datum; a timeout whose owner no longer matches live
/// state is ignored by the handler.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TimerOwner {
    /// Point-to-point state machine timer (init/listen/hold-off).
    CircuitState(CircuitId),
    /// Periodic hello (both circuit kinds).
    Hello(CircuitId),
    /// Designated-router election hold-off.
    DrDelay(CircuitId),
    /// Adjacency listen timer.
    Adjacency(AdjId),
    /// Previous-hop cache entry expiry.
    PrevHop(CircuitId, NodeAddr),
    /// Routing update process, level 1 or 2.
    Update(CircuitId, UpdateLevel),
    /// Periodic SysId transmission.
    SysId(CircuitId),
    /// Console carrier client retransmit/poll timer.
    CarrierClient(CircuitId),
    /// Console carrier server reservation timer.
    CarrierServer(CircuitId),
}

impl Default for TimerOwner {
    fn default() -> Self {
        Self::CircuitState(CircuitId(u8::MAX))
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UpdateLevel {
    L1,
    L2,
}

/// One unit of work for the node dispatch loop.
#[derive(Clone, Debug)]
pub enum Work {
    /// A frame arrived on a circuit port.
    Received {
        circuit: CircuitId,
        port: Port,
        src: EthAddr,
        frame: FrameBuf,
    },
    /// Datalink status change on a point-to-point circuit.
    DlStatus { circuit: CircuitId, up: bool },
    /// A timer fired.
    Timeout { owner: TimerOwner },
    /// Stop the node.
    Shutdown,
}

/// Result of a MOP request/response exchange, correlated by receipt.
#[derive(Clone, Debug)]
pub enum MopResponse {
    Counters(Counters),
    SysId {
        src: EthAddr,
        carrier: bool,
        carrier_reserved: bool,
        console_user: Option<EthAddr>,
    },
    LoopReply {
        src: EthAddr,
    },
    /// The exchange timed out or was superseded.
    Failed,
}

/// Console-carrier client session outcome.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConsoleStatus {
    Ok,
    NoCarrierSupport,
    Reserved,
    NoReply,
    Released,
}

/// An effect the node wants performed.
#[derive(Clone, Debug)]
pub enum Action {
    /// Transmit `frame` on a circuit port.  `dest` is the station or
    /// multicast address for LAN ports, `None` for point-to-point.
    Send {
        circuit: CircuitId,
        port: Port,
        dest: Option<EthAddr>,
        frame: FrameBuf,
    },
    /// Deliver a terminating data packet up to NSP.
    Deliver {
        src: NodeAddr,
        rts: bool,
        data: FrameBuf,
    },
    /// Terminal output from the console-carrier client session.
    ConsoleOutput { circuit: CircuitId, data: ConsoleBuf },
    /// The console-carrier client session changed state.
    ConsoleSession {
        circuit: CircuitId,
        status: ConsoleStatus,
    },
    /// Keyboard input for the console-carrier server backend.
    ConsoleServerInput { circuit: CircuitId, data: ConsoleBuf },
    /// A MOP exchange completed (or failed).
    MopResponse {
        circuit: CircuitId,
        receipt: u16,
        response: MopResponse,
    },
    /// Bring a point-to-point datalink up; completion comes back as
    /// `Work::DlStatus`.
    OpenLink { circuit: CircuitId },
    /// Take a point-to-point datalink down.
    CloseLink { circuit: CircuitId },
    /// The node finished its stop sequence.
    Stopped,
}

pub type ActionQueue = heapless::Deque<Action, 32>;
pub(crate) type WorkQueue = heapless::Deque<Work, 64>;

/// Push an action, dropping the oldest when the embedder has let the
/// queue back up.  Protocol state must never wedge on a slow drain.
pub(crate) fn push_action(queue: &mut ActionQueue, action: Action) {
    if queue.is_full() {
        queue.pop_front();
        log::warn!("action queue overflow, oldest dropped");
    }
    // Cannot fail: space was just ensured
    let _ = queue.push_back(action);
}

/// Build a `FrameBuf` from an encoded slice, dropping oversized
/// frames at the source.
pub(crate) fn frame(data: &[u8]) -> Option<FrameBuf> {
    FrameBuf::from_slice(data).ok()
}
