//! Adjacencies: one record per directly reachable neighbor, owned by
//! its circuit, stored in a node-wide slot arena so routing can hold
//! stable ids instead of references.

use dnet_wire::{EthAddr, NodeAddr, NodeType, Version};
use dnet_timer::TimerId;

use crate::db::NodeName;
use crate::work::TimerOwner;
use crate::{AdjId, CircuitId, Ctx, Wheel, MAX_ADJACENCIES};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AdjState {
    /// Heard from, not yet two-way.
    Init,
    /// Fully up; data may flow.
    Up,
}

/// One neighbor on one circuit.
#[derive(Clone, Debug)]
pub struct Adjacency {
    pub circuit: CircuitId,
    pub nodeid: NodeAddr,
    pub ntype: NodeType,
    /// The neighbor's DECnet phase (2, 3 or 4).
    pub rphase: u8,
    pub blksize: u16,
    pub prio: u8,
    pub tiver: Version,
    /// Listen timeout, seconds.
    pub t4: u32,
    pub state: AdjState,
    pub timer: TimerId,
    /// The neighbor's station address (HIORD-mapped for LAN
    /// adjacencies).
    pub macid: EthAddr,
    /// Phase II neighbor requested intercept service.
    pub rint: bool,
    /// Phase II neighbor's announced name.
    pub rnodename: NodeName,
}

impl Adjacency {
    /// Start (or restart) the listen timer.  Phase II neighbors are
    /// not required to send periodic traffic, so they get none.
    pub(crate) fn alive(&self, ctx: &mut Ctx<'_>) {
        if self.ntype != NodeType::Phase2 {
            ctx.start_timer(self.timer, self.t4);
        }
    }

    pub(crate) fn stop_timer(&self, ctx: &mut Ctx<'_>) {
        ctx.timers.stop(self.timer);
    }

    pub fn is_router(&self) -> bool {
        self.ntype.is_router()
    }
}

/// The adjacency arena.  `(circuit, nodeid)` is unique by
/// construction: `insert` refuses a duplicate.
pub struct AdjTable {
    slots: [Option<Adjacency>; MAX_ADJACENCIES],
}

impl Default for AdjTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Create an adjacency, allocating its listen timer.  Returns
    /// `None` when the arena or the timer wheel is exhausted, or when
    /// the (circuit, neighbor) pair already exists.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        timers: &mut Wheel,
        circuit: CircuitId,
        nodeid: NodeAddr,
        ntype: NodeType,
        rphase: u8,
        blksize: u16,
        prio: u8,
        tiver: Version,
        t4: u32,
    ) -> Option<AdjId> {
        if self.find(circuit, nodeid).is_some() {
            return None;
        }
        let index = self.slots.iter().position(|s| s.is_none())?;
        let id = AdjId(index as u8);
        let timer = timers.alloc(TimerOwner::Adjacency(id)).ok()?;

        self.slots[index] = Some(Adjacency {
            circuit,
            nodeid,
            ntype,
            rphase,
            blksize,
            prio,
            tiver,
            t4,
            state: AdjState::Init,
            timer,
            macid: EthAddr::from_node(nodeid),
            rint: false,
            rnodename: NodeName::new(),
        });

        Some(id)
    }

    /// Drop an adjacency and release its timer.
    pub fn remove(&mut self, timers: &mut Wheel, id: AdjId) -> Option<Adjacency> {
        let adj = self.slots.get_mut(id.0 as usize)?.take()?;
        timers.free(adj.timer);
        Some(adj)
    }

    pub fn get(&self, id: AdjId) -> Option<&Adjacency> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: AdjId) -> Option<&mut Adjacency> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn find(&self, circuit: CircuitId, nodeid: NodeAddr) -> Option<AdjId> {
        self.iter()
            .find_map(|(id, a)| (a.circuit == circuit && a.nodeid == nodeid).then_some(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (AdjId, &Adjacency)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|a| (AdjId(i as u8), a)))
    }

    /// All adjacencies on one circuit.
    pub fn on_circuit(&self, circuit: CircuitId) -> impl Iterator<Item = (AdjId, &Adjacency)> {
        self.iter().filter(move |(_, a)| a.circuit == circuit)
    }

    /// Router adjacencies on one circuit, the candidates for DR
    /// election and E-list membership.
    pub fn routers_on(&self, circuit: CircuitId) -> impl Iterator<Item = (AdjId, &Adjacency)> {
        self.on_circuit(circuit).filter(|(_, a)| a.is_router())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> (AdjTable, Wheel) {
        (AdjTable::new(), Wheel::new())
    }

    #[test]
    fn insert_find_remove() {
        let (mut t, mut w) = table();
        let a = t
            .insert(
                &mut w,
                CircuitId(0),
                NodeAddr::new(1, 3),
                NodeType::L1Router,
                4,
                1498,
                64,
                Version::PH4,
                30,
            )
            .unwrap();
        assert_eq!(t.find(CircuitId(0), NodeAddr::new(1, 3)), Some(a));
        assert_eq!(t.find(CircuitId(1), NodeAddr::new(1, 3)), None);

        // Duplicate (circuit, neighbor) is refused
        assert!(t
            .insert(
                &mut w,
                CircuitId(0),
                NodeAddr::new(1, 3),
                NodeType::L1Router,
                4,
                1498,
                64,
                Version::PH4,
                30,
            )
            .is_none());

        let adj = t.remove(&mut w, a).unwrap();
        assert_eq!(adj.nodeid, NodeAddr::new(1, 3));
        assert!(t.get(a).is_none());
    }

    #[test]
    fn circuit_filtering() {
        let (mut t, mut w) = table();
        for (i, ntype) in [
            NodeType::L1Router,
            NodeType::Endnode,
            NodeType::L2Router,
        ]
        .iter()
        .enumerate()
        {
            t.insert(
                &mut w,
                CircuitId(0),
                NodeAddr::new(1, 10 + i as u16),
                *ntype,
                4,
                1498,
                64,
                Version::PH4,
                30,
            )
            .unwrap();
        }
        t.insert(
            &mut w,
            CircuitId(1),
            NodeAddr::new(1, 20),
            NodeType::Endnode,
            4,
            1498,
            0,
            Version::PH4,
            30,
        )
        .unwrap();

        assert_eq!(t.on_circuit(CircuitId(0)).count(), 3);
        assert_eq!(t.routers_on(CircuitId(0)).count(), 2);
        assert_eq!(t.on_circuit(CircuitId(1)).count(), 1);
    }
}
