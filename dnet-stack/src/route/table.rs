//! Routing matrix and decision process.
//!
//! One column per router adjacency plus the self column and (level 1
//! only) the synthetic endnodes column.  The decision process folds
//! the columns into minhops/mincost/output-adjacency rows and reports
//! which destinations changed.

use dnet_wire::NodeAddr;

use crate::adjacency::AdjTable;
use crate::{AdjId, INF_COST, INF_HOPS, MAX_ROUTER_ADJ};

/// Output adjacency of a destination row.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Oadj {
    Unreachable,
    /// The destination is this node (or the attached-flag row).
    Local,
    Adj(AdjId),
}

impl Oadj {
    pub const fn is_reachable(self) -> bool {
        !matches!(self, Self::Unreachable)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum ColKey {
    SelfCol,
    Adj(AdjId),
}

pub(crate) struct Column<const N: usize> {
    pub key: ColKey,
    pub hops: [u8; N],
    pub cost: [u16; N],
}

impl<const N: usize> Column<N> {
    fn new(key: ColKey) -> Self {
        Self {
            key,
            hops: [INF_HOPS; N],
            cost: [INF_COST; N],
        }
    }
}

/// The synthetic endnodes column: per-destination adjacency pointers
/// for neighbors that do not send routing updates.
pub(crate) struct EndnodeColumn<const N: usize> {
    pub hops: [u8; N],
    pub cost: [u16; N],
    pub adj: [Option<AdjId>; N],
}

impl<const N: usize> EndnodeColumn<N> {
    fn new() -> Self {
        Self {
            hops: [INF_HOPS; N],
            cost: [INF_COST; N],
            adj: [None; N],
        }
    }
}

/// What the decision process observed for one destination.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RowChange {
    pub id: u16,
    /// minhops/mincost changed: advertise via SRM.
    pub advertise: bool,
    /// Output adjacency crossed between reachable and unreachable.
    pub reach_change: Option<bool>,
    pub new_oadj: Oadj,
}

/// One routing matrix (level 1 over node ids, or level 2 over areas).
pub(crate) struct RouteTable<const N: usize> {
    columns: heapless::Vec<Column<N>, { MAX_ROUTER_ADJ + 1 }>,
    pub endnodes: Option<EndnodeColumn<N>>,
    pub minhops: [u8; N],
    pub mincost: [u16; N],
    pub oadj: [Oadj; N],
    maxhops: u8,
    maxcost: u16,
}

impl<const N: usize> RouteTable<N> {
    pub fn new(endnodes: bool, maxhops: u8, maxcost: u16) -> Self {
        Self {
            columns: heapless::Vec::new(),
            endnodes: endnodes.then(EndnodeColumn::new),
            minhops: [INF_HOPS; N],
            mincost: [INF_COST; N],
            oadj: [Oadj::Unreachable; N],
            maxhops,
            maxcost,
        }
    }

    pub fn add_self_column(&mut self) -> &mut Column<N> {
        if self.column_mut(ColKey::SelfCol).is_none() {
            let _ = self.columns.push(Column::new(ColKey::SelfCol));
        }
        // Just ensured present
        self.column_mut(ColKey::SelfCol).unwrap()
    }

    pub fn add_adj_column(&mut self, adj: AdjId) -> bool {
        if self.column_mut(ColKey::Adj(adj)).is_some() {
            return true;
        }
        self.columns.push(Column::new(ColKey::Adj(adj))).is_ok()
    }

    pub fn remove_adj_column(&mut self, adj: AdjId) {
        if let Some(pos) = self
            .columns
            .iter()
            .position(|c| c.key == ColKey::Adj(adj))
        {
            self.columns.swap_remove(pos);
        }
    }

    pub fn column_mut(&mut self, key: ColKey) -> Option<&mut Column<N>> {
        self.columns.iter_mut().find(|c| c.key == key)
    }

    pub fn self_column(&mut self) -> Option<&mut Column<N>> {
        self.column_mut(ColKey::SelfCol)
    }

    pub fn has_column(&self, adj: AdjId) -> bool {
        self.columns.iter().any(|c| c.key == ColKey::Adj(adj))
    }

    /// The decision process over `start..=end`: recompute each row
    /// from the columns, apply the result, and report changes through
    /// `observe`.
    ///
    /// Ties on cost go to the higher neighbor node id.
    pub fn route(
        &mut self,
        start: u16,
        end: u16,
        self_id: NodeAddr,
        adjs: &AdjTable,
        mut observe: impl FnMut(RowChange),
    ) {
        let end = end.min(N as u16 - 1);
        for i in start..=end {
            let i = i as usize;
            let mut besth = INF_HOPS;
            let mut bestc = INF_COST;
            let mut besta = Oadj::Unreachable;
            let mut bestid = NodeAddr::from_raw(0);

            let mut consider = |hops: u8, cost: u16, cand: Oadj, candid: NodeAddr| {
                if cost < bestc
                    || (cost == bestc
                        && (!besta.is_reachable() || candid.raw() > bestid.raw()))
                {
                    besth = hops;
                    bestc = cost;
                    besta = cand;
                    bestid = candid;
                }
            };

            for col in &self.columns {
                let (cand, candid) = match col.key {
                    ColKey::SelfCol => (Oadj::Local, self_id),
                    ColKey::Adj(a) => match adjs.get(a) {
                        Some(adj) => (Oadj::Adj(a), adj.nodeid),
                        None => continue,
                    },
                };
                consider(col.hops[i], col.cost[i], cand, candid);
            }
            if let Some(endn) = &self.endnodes {
                if let Some(a) = endn.adj[i] {
                    if let Some(adj) = adjs.get(a) {
                        consider(endn.hops[i], endn.cost[i], Oadj::Adj(a), adj.nodeid);
                    }
                }
            }

            if bestc > self.maxcost || besth > self.maxhops {
                besth = INF_HOPS;
                bestc = INF_COST;
                besta = Oadj::Unreachable;
            }

            let advertise = self.minhops[i] != besth || self.mincost[i] != bestc;
            self.minhops[i] = besth;
            self.mincost[i] = bestc;

            let mut reach_change = None;
            if besta != self.oadj[i] {
                // A change between two live routes is not a
                // reachability event
                if !besta.is_reachable() || !self.oadj[i].is_reachable() {
                    reach_change = Some(besta.is_reachable());
                }
                self.oadj[i] = besta;
            }

            if advertise || reach_change.is_some() {
                observe(RowChange {
                    id: i as u16,
                    advertise,
                    reach_change,
                    new_oadj: besta,
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Wheel;
    use dnet_wire::{NodeType, Version};

    fn adj(
        t: &mut AdjTable,
        w: &mut Wheel,
        circuit: u8,
        id: NodeAddr,
        ntype: NodeType,
    ) -> AdjId {
        t.insert(
            w,
            crate::CircuitId(circuit),
            id,
            ntype,
            4,
            1498,
            64,
            Version::PH4,
            30,
        )
        .unwrap()
    }

    #[test]
    fn decision_prefers_cheapest_then_highest_id() {
        let mut adjs = AdjTable::new();
        let mut w = Wheel::new();
        let self_id = NodeAddr::new(1, 1);
        let a = adj(&mut adjs, &mut w, 0, NodeAddr::new(1, 2), NodeType::L1Router);
        let b = adj(&mut adjs, &mut w, 1, NodeAddr::new(1, 3), NodeType::L1Router);

        let mut t: RouteTable<32> = RouteTable::new(true, 16, 128);
        t.add_self_column();
        t.add_adj_column(a);
        t.add_adj_column(b);

        // Both neighbors reach node 5 at equal cost; higher node id
        // (1.3) must win
        t.column_mut(ColKey::Adj(a)).unwrap().hops[5] = 2;
        t.column_mut(ColKey::Adj(a)).unwrap().cost[5] = 10;
        t.column_mut(ColKey::Adj(b)).unwrap().hops[5] = 3;
        t.column_mut(ColKey::Adj(b)).unwrap().cost[5] = 10;

        t.route(5, 5, self_id, &adjs, |_| ());
        assert_eq!(t.oadj[5], Oadj::Adj(b));
        assert_eq!(t.minhops[5], 3);
        assert_eq!(t.mincost[5], 10);

        // Cheaper route wins regardless of id
        t.column_mut(ColKey::Adj(a)).unwrap().cost[5] = 9;
        t.route(5, 5, self_id, &adjs, |_| ());
        assert_eq!(t.oadj[5], Oadj::Adj(a));
    }

    #[test]
    fn limits_make_unreachable() {
        let mut adjs = AdjTable::new();
        let mut w = Wheel::new();
        let a = adj(&mut adjs, &mut w, 0, NodeAddr::new(1, 2), NodeType::L1Router);

        let mut t: RouteTable<32> = RouteTable::new(false, 4, 50);
        t.add_adj_column(a);
        t.column_mut(ColKey::Adj(a)).unwrap().hops[7] = 5; // over maxhops
        t.column_mut(ColKey::Adj(a)).unwrap().cost[7] = 10;

        let mut changes = heapless::Vec::<RowChange, 4>::new();
        t.route(7, 7, NodeAddr::new(1, 1), &adjs, |c| {
            changes.push(c).unwrap()
        });
        assert_eq!(t.oadj[7], Oadj::Unreachable);
        assert_eq!(t.minhops[7], INF_HOPS);
        assert!(changes.is_empty()); // was INF, stays INF

        t.column_mut(ColKey::Adj(a)).unwrap().hops[7] = 2;
        t.route(7, 7, NodeAddr::new(1, 1), &adjs, |c| {
            changes.push(c).unwrap()
        });
        assert_eq!(t.oadj[7], Oadj::Adj(a));
        assert_eq!(changes.len(), 1);
        assert!(changes[0].advertise);
        assert_eq!(changes[0].reach_change, Some(true));
    }

    #[test]
    fn invariant_oadj_iff_reachable() {
        let mut adjs = AdjTable::new();
        let mut w = Wheel::new();
        let a = adj(&mut adjs, &mut w, 0, NodeAddr::new(1, 2), NodeType::L1Router);

        let mut t: RouteTable<64> = RouteTable::new(false, 16, 128);
        t.add_adj_column(a);
        for i in [3u16, 9, 40] {
            t.column_mut(ColKey::Adj(a)).unwrap().hops[i as usize] = 1;
            t.column_mut(ColKey::Adj(a)).unwrap().cost[i as usize] = 4;
        }
        t.route(0, 63, NodeAddr::new(1, 1), &adjs, |_| ());

        for i in 0..64 {
            let reachable = t.minhops[i] <= 16 && t.mincost[i] <= 128;
            assert_eq!(t.oadj[i].is_reachable(), reachable, "row {}", i);
            assert_eq!(t.minhops[i] == INF_HOPS, !reachable, "row {}", i);
        }
    }
}
