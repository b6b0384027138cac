//! Event records in the architected (class, type) numbering, kept in
//! a bounded ring and mirrored to the `log` facade.
//!
//! Formatting for operators and shipping to remote sinks are the
//! embedder's concern; the stack only constructs and stores the
//! records.

use core::fmt::{self, Display};

use dnet_wire::{EthAddr, NodeAddr};

use crate::CircuitId;

/// Standard event codes, as (class, type) pairs.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EventCode {
    EventsLost,
    NodeState,
    AgedDrop,
    UnreachDrop,
    OorDrop,
    SizeDrop,
    FmtErr,
    RoutUpdLoss,
    VerRej,
    CircFault,
    CircDown,
    CircUp,
    ReachChg,
    AdjUp,
    AdjRej,
    AreaChg,
    AdjDown,
}

impl EventCode {
    /// The (class, type) pair from the network management
    /// architecture.
    pub const fn code(self) -> (u16, u16) {
        match self {
            Self::EventsLost => (0, 0),
            Self::NodeState => (2, 0),
            Self::AgedDrop => (4, 0),
            Self::UnreachDrop => (4, 1),
            Self::OorDrop => (4, 2),
            Self::SizeDrop => (4, 3),
            Self::FmtErr => (4, 4),
            Self::RoutUpdLoss => (4, 5),
            Self::VerRej => (4, 6),
            Self::CircFault => (4, 7),
            Self::CircDown => (4, 8),
            Self::CircUp => (4, 10),
            Self::ReachChg => (4, 14),
            Self::AdjUp => (4, 15),
            Self::AdjRej => (4, 16),
            Self::AreaChg => (4, 17),
            Self::AdjDown => (4, 18),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::EventsLost => "Event records lost",
            Self::NodeState => "Local node state change",
            Self::AgedDrop => "Aged packet loss",
            Self::UnreachDrop => "Node unreachable packet loss",
            Self::OorDrop => "Node out-of-range packet loss",
            Self::SizeDrop => "Oversized packet loss",
            Self::FmtErr => "Packet format error",
            Self::RoutUpdLoss => "Partial routing update loss",
            Self::VerRej => "Verification reject",
            Self::CircFault => "Circuit down, circuit fault",
            Self::CircDown => "Circuit down",
            Self::CircUp => "Circuit up",
            Self::ReachChg => "Node reachability change",
            Self::AdjUp => "Adjacency up",
            Self::AdjRej => "Adjacency rejected",
            Self::AreaChg => "Area reachability change",
            Self::AdjDown => "Adjacency down",
        }
    }
}

/// Reason parameter carried by several event types.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Reason {
    ListenerTimeout,
    ListenerInvalidData,
    Dropped,
    AddressChange,
    DataErrors,
    VerificationRequired,
    VerificationFailed,
    OperatorCommand,
    Restart,
    Timeout,
    DatalinkDown,
    UnexpectedPacket,
}

impl Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ListenerTimeout => "listener_timeout",
            Self::ListenerInvalidData => "listener_invalid_data",
            Self::Dropped => "dropped",
            Self::AddressChange => "address_change",
            Self::DataErrors => "data_errors",
            Self::VerificationRequired => "verification_required",
            Self::VerificationFailed => "verification_failed",
            Self::OperatorCommand => "operator_command",
            Self::Restart => "restart",
            Self::Timeout => "timeout",
            Self::DatalinkDown => "datalink_down",
            Self::UnexpectedPacket => "unexpected_packet",
        };
        write!(f, "{}", s)
    }
}

/// One logged event.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub code: EventCode,
    pub circuit: Option<CircuitId>,
    pub node: Option<NodeAddr>,
    pub area: Option<u8>,
    pub adjacent_node: Option<NodeAddr>,
    pub adjacent_mac: Option<EthAddr>,
    pub reason: Option<Reason>,
    pub reachable: Option<bool>,
    pub highest_address: Option<u16>,
    /// Leading bytes of the offending packet, for format errors.
    pub packet_header: Option<([u8; 6], u8)>,
}

impl Event {
    pub fn new(code: EventCode) -> Self {
        Self {
            code,
            circuit: None,
            node: None,
            area: None,
            adjacent_node: None,
            adjacent_mac: None,
            reason: None,
            reachable: None,
            highest_address: None,
            packet_header: None,
        }
    }

    pub fn circuit(mut self, circuit: CircuitId) -> Self {
        self.circuit = Some(circuit);
        self
    }

    pub fn node(mut self, node: NodeAddr) -> Self {
        self.node = Some(node);
        self
    }

    pub fn area(mut self, area: u8) -> Self {
        self.area = Some(area);
        self
    }

    pub fn adjacency(mut self, node: NodeAddr) -> Self {
        self.adjacent_node = Some(node);
        self
    }

    pub fn reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn reachable(mut self, reachable: bool) -> Self {
        self.reachable = Some(reachable);
        self
    }

    pub fn highest_address(mut self, id: u16) -> Self {
        self.highest_address = Some(id);
        self
    }

    pub fn packet(mut self, buf: &[u8]) -> Self {
        let mut hdr = [0u8; 6];
        let len = buf.len().min(6);
        hdr[..len].copy_from_slice(&buf[..len]);
        self.packet_header = Some((hdr, len as u8));
        self
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, typ) = self.code.code();
        write!(f, "Event {}.{} {}", class, typ, self.code.name())?;
        if let Some(c) = self.circuit {
            write!(f, ", circuit {}", c.0)?;
        }
        if let Some(n) = self.adjacent_node {
            write!(f, ", adjacent node {}", n)?;
        }
        if let Some(n) = self.node {
            write!(f, ", node {}", n)?;
        }
        if let Some(a) = self.area {
            write!(f, ", area {}", a)?;
        }
        if let Some(r) = self.reason {
            write!(f, ", reason {}", r)?;
        }
        if let Some(up) = self.reachable {
            write!(f, ", {}", if up { "reachable" } else { "unreachable" })?;
        }
        if let Some(h) = self.highest_address {
            write!(f, ", highest address {}", h)?;
        }
        Ok(())
    }
}

/// Bounded ring of recent events.  Overflow discards the oldest and
/// is itself recorded in `lost`.
pub struct EventLog {
    ring: heapless::Deque<Event, 32>,
    pub lost: u32,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            ring: heapless::Deque::new(),
            lost: 0,
        }
    }

    pub fn log(&mut self, event: Event) {
        log::info!("{}", event);
        if self.ring.is_full() {
            self.ring.pop_front();
            self.lost += 1;
        }
        // Cannot fail: space was just ensured
        let _ = self.ring.push_back(event);
    }

    /// Drain the oldest pending record.
    pub fn pop(&mut self) -> Option<Event> {
        self.ring.pop_front()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ring_overflow_counts_lost() {
        let mut log = EventLog::new();
        for _ in 0..40 {
            log.log(Event::new(EventCode::AdjUp).circuit(CircuitId(0)));
        }
        assert_eq!(log.len(), 32);
        assert_eq!(log.lost, 8);
    }

    #[test]
    fn display_carries_reason() {
        let e = Event::new(EventCode::AdjDown)
            .circuit(CircuitId(1))
            .adjacency(NodeAddr::new(1, 3))
            .reason(Reason::ListenerTimeout);
        let mut buf = heapless::String::<128>::new();
        core::fmt::write(&mut buf, format_args!("{}", e)).unwrap();
        assert!(buf.contains("4.18"));
        assert!(buf.contains("listener_timeout"));
        assert!(buf.contains("1.3"));
    }
}
