//! The routing control layer: reachability databases, the decision
//! and update processes, and the forwarding engine.
//!
//! One `Routing` instance per node.  Router nodes keep the level 1
//! matrix (and level 2 on area routers); endnode and Phase II nodes
//! route by their single circuit or adjacency set alone.

pub mod intercept;
pub(crate) mod table;
pub(crate) mod update;

use dnet_wire::addr::ALL_ROUTERS;
use dnet_wire::route::{LongData, RoutingUpdate, ShortData, UpdateKind};
use dnet_wire::{NodeAddr, NodeType};

use crate::adjacency::AdjTable;
use crate::events::{Event, EventCode};
use crate::work::{self, Action, Port, UpdateLevel};
use crate::{AdjId, CircuitId, Ctx, InterceptMode, Phase, Wheel, MAX_CIRCUITS, MAX_VISIT};

pub(crate) use table::Oadj;
use table::{ColKey, RouteTable};
use update::UpdateProc;

type L1Table = RouteTable<1024>;
type L2Table = RouteTable<64>;

/// A data packet in flight through the node, header fields unpacked,
/// payload borrowed from the receive buffer.
#[derive(Copy, Clone, Debug)]
pub struct DataPkt<'a> {
    pub rqr: bool,
    pub rts: bool,
    pub ie: bool,
    pub dstnode: NodeAddr,
    pub srcnode: NodeAddr,
    pub visit: u8,
    pub payload: &'a [u8],
}

impl<'a> DataPkt<'a> {
    pub fn from_short(p: &ShortData<'a>) -> Self {
        Self {
            rqr: p.rqr,
            rts: p.rts,
            ie: false,
            dstnode: p.dst,
            srcnode: p.src,
            visit: p.visit,
            payload: p.payload,
        }
    }

    pub fn from_long(p: &LongData<'a>) -> Self {
        Self {
            rqr: p.rqr,
            rts: p.rts,
            ie: p.ie,
            dstnode: p.dst,
            srcnode: p.src,
            visit: p.visit,
            payload: p.payload,
        }
    }

    fn short(&self) -> ShortData<'a> {
        ShortData {
            rqr: self.rqr,
            rts: self.rts,
            dst: self.dstnode,
            src: self.srcnode,
            visit: self.visit & MAX_VISIT,
            payload: self.payload,
        }
    }

    fn long(&self) -> LongData<'a> {
        LongData {
            rqr: self.rqr,
            rts: self.rts,
            ie: self.ie,
            dst: self.dstnode,
            src: self.srcnode,
            visit: self.visit & MAX_VISIT,
            payload: self.payload,
        }
    }
}

/// Where a packet came from, for counters and drop events.
#[derive(Copy, Clone, Debug)]
pub struct RxMeta {
    pub circuit: CircuitId,
    pub adj: Option<AdjId>,
    pub src_node: Option<NodeAddr>,
}

/// Routing's view of a circuit: the few parameters the control layer
/// needs without borrowing the circuit state machines.
#[derive(Copy, Clone, Debug)]
pub(crate) struct CircInfo {
    pub id: CircuitId,
    pub cost: u16,
    pub lan: bool,
    pub minrouterblk: u16,
}

enum Lookup {
    Route(Oadj),
    OutOfRange,
}

pub struct Routing {
    pub attached: bool,
    pub intercept: InterceptMode,
    circs: heapless::Vec<CircInfo, MAX_CIRCUITS>,
    updates: heapless::Vec<UpdateProc, { MAX_CIRCUITS * 2 }>,
    l1: Option<L1Table>,
    l2: Option<L2Table>,
}

impl Routing {
    pub fn new(ntype: NodeType, maxhops: u8, maxcost: u16, amaxhops: u8, amaxcost: u16,
               intercept: InterceptMode) -> Self {
        let router = ntype.is_router();
        Self {
            attached: false,
            intercept,
            circs: heapless::Vec::new(),
            updates: heapless::Vec::new(),
            l1: router.then(|| L1Table::new(true, maxhops, maxcost)),
            l2: (ntype == NodeType::L2Router).then(|| L2Table::new(false, amaxhops, amaxcost)),
        }
    }

    /// Make a circuit known to the routing layer and create its
    /// update processes.
    pub(crate) fn register_circuit(
        &mut self,
        timers: &mut Wheel,
        id: CircuitId,
        cost: u16,
        lan: bool,
        t1: u32,
    ) {
        let _ = self.circs.push(CircInfo {
            id,
            cost,
            lan,
            minrouterblk: crate::ETHMTU,
        });
        if self.l1.is_some() {
            if let Some(p) = UpdateProc::new(timers, id, UpdateLevel::L1, t1) {
                let _ = self.updates.push(p);
            }
        }
        if self.l2.is_some() {
            if let Some(p) = UpdateProc::new(timers, id, UpdateLevel::L2, t1) {
                let _ = self.updates.push(p);
            }
        }
    }

    pub(crate) fn circ_info(&self, id: CircuitId) -> Option<&CircInfo> {
        self.circs.iter().find(|c| c.id == id)
    }

    pub(crate) fn set_minrouterblk(&mut self, id: CircuitId, blk: u16) {
        if let Some(c) = self.circs.iter_mut().find(|c| c.id == id) {
            c.minrouterblk = blk;
        }
    }

    /// Node startup: install the self column (the routing
    /// architecture's column zero) and compute the initial tables.
    pub(crate) fn start(&mut self, ctx: &mut Ctx<'_>, adjs: &AdjTable) {
        let tid = ctx.cfg.tid() as usize;
        let area = ctx.cfg.home_area() as usize;
        if let Some(l1) = &mut self.l1 {
            let col = l1.add_self_column();
            col.hops[tid] = 0;
            col.cost[tid] = 0;
        }
        if let Some(l2) = &mut self.l2 {
            let col = l2.add_self_column();
            col.hops[area] = 0;
            col.cost[area] = 0;
        }
        self.run_route(ctx, adjs, 0, ctx.cfg.clamped_maxnodes());
        self.run_aroute(ctx, adjs, 1, ctx.cfg.clamped_maxarea() as u16);
    }

    /// Node shutdown: quiesce the update processes.
    pub(crate) fn stop(&mut self, ctx: &mut Ctx<'_>) {
        for u in self.updates.iter_mut() {
            ctx.timers.stop(u.timer);
        }
    }

    /// An adjacency reached the Up state.
    pub(crate) fn adj_up(&mut self, ctx: &mut Ctx<'_>, adjs: &AdjTable, aid: AdjId) {
        let Some(adj) = adjs.get(aid) else { return };
        let in_area = adj.nodeid.area() == ctx.cfg.home_area();
        let ntype = adj.ntype;
        let cost = self.circ_info(adj.circuit).map(|c| c.cost).unwrap_or(1);
        let maxnodes = ctx.cfg.clamped_maxnodes();
        let maxarea = ctx.cfg.clamped_maxarea() as u16;

        if ntype == NodeType::L2Router {
            if let Some(l2) = &mut self.l2 {
                l2.add_adj_column(aid);
            }
        }

        if ntype.is_router() && in_area {
            if self.l1.is_some() {
                if let Some(l1) = &mut self.l1 {
                    l1.add_adj_column(aid);
                }
                self.setsrm(ctx, 0, maxnodes);
                self.run_route(ctx, adjs, 0, maxnodes);
            }
        } else if !ntype.is_router() {
            let tid = adj.nodeid.tid();
            let mut present = false;
            if let Some(endn) = self.l1.as_mut().and_then(|t| t.endnodes.as_mut()) {
                if endn.hops[tid as usize] != crate::INF_HOPS && endn.adj[tid as usize] != Some(aid)
                {
                    log::debug!("possible duplicate endnode {}", adj.nodeid);
                }
                endn.hops[tid as usize] = 1;
                endn.cost[tid as usize] = cost;
                endn.adj[tid as usize] = Some(aid);
                present = true;
            }
            if present {
                self.run_route(ctx, adjs, tid, tid);
            }
        }

        if ntype == NodeType::L2Router && self.l2.is_some() {
            self.setasrm(ctx, 1, maxarea);
            self.run_aroute(ctx, adjs, 1, maxarea);
        }
    }

    /// An adjacency went down.  Must run while the record is still in
    /// the table.
    pub(crate) fn adj_down(&mut self, ctx: &mut Ctx<'_>, adjs: &AdjTable, aid: AdjId) {
        let Some(adj) = adjs.get(aid) else { return };
        let ntype = adj.ntype;
        let tid = adj.nodeid.tid();
        let maxnodes = ctx.cfg.clamped_maxnodes();
        let maxarea = ctx.cfg.clamped_maxarea() as u16;

        if ntype.is_router() {
            if let Some(l1) = &mut self.l1 {
                l1.remove_adj_column(aid);
            }
            self.run_route(ctx, adjs, 0, maxnodes);
            if ntype == NodeType::L2Router {
                if let Some(l2) = &mut self.l2 {
                    l2.remove_adj_column(aid);
                }
                self.run_aroute(ctx, adjs, 1, maxarea);
            }
        } else {
            let mut present = false;
            if let Some(endn) = self.l1.as_mut().and_then(|t| t.endnodes.as_mut()) {
                endn.hops[tid as usize] = crate::INF_HOPS;
                endn.cost[tid as usize] = crate::INF_COST;
                endn.adj[tid as usize] = None;
                present = true;
            }
            if present {
                self.run_route(ctx, adjs, tid, tid);
            }
        }
    }

    /// Flag level-1 destinations on every circuit's update process.
    pub(crate) fn setsrm(&mut self, ctx: &mut Ctx<'_>, start: u16, end: u16) {
        for u in self
            .updates
            .iter_mut()
            .filter(|u| u.level == UpdateLevel::L1)
        {
            u.setsrm(ctx, start, end);
        }
    }

    pub(crate) fn setasrm(&mut self, ctx: &mut Ctx<'_>, start: u16, end: u16) {
        for u in self
            .updates
            .iter_mut()
            .filter(|u| u.level == UpdateLevel::L2)
        {
            u.setsrm(ctx, start, end);
        }
    }

    fn run_route(&mut self, ctx: &mut Ctx<'_>, adjs: &AdjTable, start: u16, end: u16) {
        let Routing { l1, updates, .. } = self;
        let Some(l1) = l1 else { return };
        let home = ctx.cfg.home_area();
        let self_id = ctx.cfg.id;
        let end = end.min(ctx.cfg.clamped_maxnodes());

        l1.route(start, end, self_id, adjs, |chg| {
            if chg.advertise {
                for u in updates.iter_mut().filter(|u| u.level == UpdateLevel::L1) {
                    u.setsrm(ctx, chg.id, chg.id);
                }
            }
            if let Some(up) = chg.reach_change {
                // Nearest-L2 transitions (row zero) and routes via
                // self are not reported
                if chg.id != 0 && chg.new_oadj != Oadj::Local {
                    ctx.events.log(
                        Event::new(EventCode::ReachChg)
                            .node(NodeAddr::new(home, chg.id))
                            .reachable(up),
                    );
                }
            }
        });
    }

    fn run_aroute(&mut self, ctx: &mut Ctx<'_>, adjs: &AdjTable, start: u16, end: u16) {
        {
            let Routing { l2, updates, .. } = self;
            let Some(l2) = l2 else { return };
            let self_id = ctx.cfg.id;
            let end = end.min(ctx.cfg.clamped_maxarea() as u16);

            l2.route(start.max(1), end, self_id, adjs, |chg| {
                if chg.advertise {
                    for u in updates.iter_mut().filter(|u| u.level == UpdateLevel::L2) {
                        u.setsrm(ctx, chg.id, chg.id);
                    }
                }
                if let Some(up) = chg.reach_change {
                    if chg.new_oadj != Oadj::Local {
                        ctx.events.log(
                            Event::new(EventCode::AreaChg)
                                .area(chg.id as u8)
                                .reachable(up),
                        );
                    }
                }
            });
        }
        self.recompute_attached(ctx, adjs);
    }

    /// The attached flag: this area router can reach some area other
    /// than its own.  Attachment puts the nearest-L2 row (id zero)
    /// into the self column.
    fn recompute_attached(&mut self, ctx: &mut Ctx<'_>, adjs: &AdjTable) {
        let Some(l2) = &self.l2 else { return };
        let home = ctx.cfg.home_area() as usize;
        let attached = l2
            .oadj
            .iter()
            .enumerate()
            .any(|(i, o)| i != home && o.is_reachable());

        if attached != self.attached {
            log::debug!("attached state changed to {}", attached);
            self.attached = attached;
            if let Some(l1) = &mut self.l1 {
                if let Some(col) = l1.self_column() {
                    if attached {
                        col.hops[0] = 0;
                        col.cost[0] = 0;
                    } else {
                        col.hops[0] = crate::INF_HOPS;
                        col.cost[0] = crate::INF_COST;
                    }
                }
            }
            self.setsrm(ctx, 0, 0);
            self.run_route(ctx, adjs, 0, 0);
        }
    }

    /// Process a received routing update from an Up adjacency.
    pub(crate) fn routing_msg(
        &mut self,
        ctx: &mut Ctx<'_>,
        adjs: &AdjTable,
        aid: AdjId,
        update: &RoutingUpdate<'_>,
    ) {
        let Some(adj) = adjs.get(aid) else { return };
        let cost = self.circ_info(adj.circuit).map(|c| c.cost).unwrap_or(1);
        let circuit = adj.circuit;
        let nodeid = adj.nodeid;

        let (level, maxid) = match update.kind {
            UpdateKind::Level1 | UpdateKind::Phase3 => {
                if nodeid.area() != ctx.cfg.home_area() {
                    return;
                }
                (UpdateLevel::L1, ctx.cfg.clamped_maxnodes())
            }
            UpdateKind::Level2 => {
                if adj.ntype != NodeType::L2Router {
                    return;
                }
                (UpdateLevel::L2, ctx.cfg.clamped_maxarea() as u16)
            }
        };

        let mut maxreach = 0u16;
        let mut lo = u16::MAX;
        let mut hi = 0u16;
        {
            let mut col = match level {
                UpdateLevel::L1 => {
                    match self.l1.as_mut().and_then(|t| t.column_mut(ColKey::Adj(aid))) {
                        Some(c) => Col::L1Ref(c),
                        None => return,
                    }
                }
                UpdateLevel::L2 => {
                    match self.l2.as_mut().and_then(|t| t.column_mut(ColKey::Adj(aid))) {
                        Some(c) => Col::L2Ref(c),
                        None => return,
                    }
                }
            };

            for e in update.entries() {
                let hops = e.hops.saturating_add(1);
                let new_cost = e.cost + cost;
                if e.id > maxid {
                    if e.hops < crate::INF_HOPS {
                        maxreach = maxreach.max(e.id);
                    }
                    continue;
                }
                if col.get(e.id) != (hops, new_cost) {
                    col.set(e.id, hops, new_cost);
                    lo = lo.min(e.id);
                    hi = hi.max(e.id);
                }
            }
        }

        if lo <= hi {
            match level {
                UpdateLevel::L1 => self.run_route(ctx, adjs, lo, hi),
                UpdateLevel::L2 => self.run_aroute(ctx, adjs, lo, hi),
            }
        }

        if maxreach > 0 {
            ctx.counters.partial_update_loss += 1;
            ctx.events.log(
                Event::new(EventCode::RoutUpdLoss)
                    .circuit(circuit)
                    .adjacency(nodeid)
                    .highest_address(maxreach),
            );
        }
    }

    /// The output adjacency for a destination.
    fn findoadj(&self, ctx: &Ctx<'_>, dest: NodeAddr) -> Lookup {
        let home = ctx.cfg.home_area();
        let mut tid = dest.tid();

        if dest.area() != home && dest.area() != 0 {
            if self.attached {
                if let Some(l2) = &self.l2 {
                    return match l2.oadj.get(dest.area() as usize) {
                        Some(o) => Lookup::Route(*o),
                        None => Lookup::Route(Oadj::Unreachable),
                    };
                }
            }
            if ctx.cfg.phase != Phase::Phase4 {
                return Lookup::Route(Oadj::Unreachable);
            }
            // Out of area on an L1 router: toward the nearest L2
            tid = 0;
        }

        match &self.l1 {
            Some(l1) if tid <= ctx.cfg.clamped_maxnodes() => {
                Lookup::Route(l1.oadj[tid as usize])
            }
            Some(_) => Lookup::OutOfRange,
            None => Lookup::Route(Oadj::Unreachable),
        }
    }

    /// The forwarding engine: pick the output adjacency, enforce the
    /// visit budget, return to sender when requested, account and
    /// report drops.
    pub(crate) fn forward(
        &mut self,
        ctx: &mut Ctx<'_>,
        adjs: &AdjTable,
        mut pkt: DataPkt<'_>,
        src: Option<RxMeta>,
    ) {
        let mut orig = src.is_none();
        loop {
            let lookup = self.findoadj(ctx, pkt.dstnode);
            let mut aged = false;
            let mut oor = false;

            match lookup {
                Lookup::Route(Oadj::Local) => {
                    if let Some(meta) = &src {
                        ctx.circ_counter(meta.circuit).term_recv += 1;
                    }
                    if let Some(data) = work::frame(pkt.payload) {
                        work::push_action(
                            ctx.actions,
                            Action::Deliver {
                                src: pkt.srcnode,
                                rts: pkt.rts,
                                data,
                            },
                        );
                    }
                    return;
                }
                Lookup::Route(Oadj::Adj(aid)) => {
                    if let Some(out) = adjs.get(aid) {
                        let mut limit = ctx.cfg.maxvisits;
                        if !orig {
                            if let Some(meta) = &src {
                                if meta.circuit != out.circuit {
                                    pkt.ie = false;
                                }
                            }
                            if pkt.rts {
                                limit = (limit.saturating_mul(2)).min(MAX_VISIT);
                            }
                        }
                        if pkt.visit < limit {
                            if orig {
                                ctx.circ_counter(out.circuit).orig_sent += 1;
                            } else {
                                if let Some(meta) = &src {
                                    ctx.circ_counter(meta.circuit).trans_recv += 1;
                                }
                                ctx.circ_counter(out.circuit).trans_sent += 1;
                                pkt.visit += 1;
                            }
                            self.adj_send(ctx, adjs, aid, &pkt);
                            return;
                        }
                        aged = true;
                    }
                }
                Lookup::Route(Oadj::Unreachable) => (),
                Lookup::OutOfRange => oor = true,
            }

            // Could not forward: return to sender once if requested,
            // otherwise drop and account.  A returned packet counts
            // against the loss counters but is not reported dropped.
            if pkt.rqr && !pkt.rts {
                if src.is_some() {
                    if aged {
                        ctx.counters.aged_loss += 1;
                    } else if oor {
                        ctx.counters.node_oor_loss += 1;
                    } else {
                        ctx.counters.unreach_loss += 1;
                    }
                }
                core::mem::swap(&mut pkt.dstnode, &mut pkt.srcnode);
                pkt.rts = true;
                pkt.rqr = false;
                pkt.ie = false;
                orig = false;
                continue;
            }

            if orig {
                return;
            }
            let Some(meta) = &src else { return };
            let code = if aged {
                ctx.counters.aged_loss += 1;
                EventCode::AgedDrop
            } else if oor {
                ctx.counters.node_oor_loss += 1;
                EventCode::OorDrop
            } else {
                ctx.counters.unreach_loss += 1;
                EventCode::UnreachDrop
            };
            let mut ev = Event::new(code).circuit(meta.circuit).packet(pkt.payload);
            if let Some(n) = meta.src_node {
                ev = ev.adjacency(n);
            }
            ctx.events.log(ev);
            return;
        }
    }

    /// Transmit a data packet on an adjacency, shaping the header to
    /// the neighbor: long format on LANs, short on point-to-point,
    /// truncated addresses for Phase III, intercept handling for
    /// Phase II.
    pub(crate) fn adj_send(
        &mut self,
        ctx: &mut Ctx<'_>,
        adjs: &AdjTable,
        aid: AdjId,
        pkt: &DataPkt<'_>,
    ) {
        let Some(adj) = adjs.get(aid) else { return };
        let Some(info) = self.circ_info(adj.circuit) else {
            return;
        };
        let lan = info.lan;
        let circuit = adj.circuit;

        let frame = if adj.ntype == NodeType::Phase2 {
            match intercept::send(self.intercept, ctx, adj, pkt) {
                intercept::P2Tx::Send(f) => Some(f),
                intercept::P2Tx::Unreachable => {
                    log::trace!("{} not deliverable to phase 2 neighbor", pkt.dstnode);
                    None
                }
                intercept::P2Tx::Drop => None,
            }
        } else if lan {
            let mut buf = [0u8; crate::MTU];
            pkt.long().encode(&mut buf).ok().and_then(work::frame)
        } else {
            let mut p = pkt.short();
            if adj.rphase < 4 {
                // The neighbor knows 8-bit addresses only
                p.dst = p.dst.phase3();
                p.src = p.src.phase3();
            }
            let mut buf = [0u8; crate::MTU];
            p.encode(&mut buf).ok().and_then(work::frame)
        };

        if let Some(frame) = frame {
            work::push_action(
                ctx.actions,
                Action::Send {
                    circuit,
                    port: Port::Routing,
                    dest: lan.then_some(adj.macid),
                    frame,
                },
            );
        }
    }

    /// Originating entry for router nodes (and the Phase II
    /// adjacency-match case).
    pub(crate) fn originate(
        &mut self,
        ctx: &mut Ctx<'_>,
        adjs: &AdjTable,
        dest: NodeAddr,
        payload: &[u8],
        rqr: bool,
    ) {
        let pkt = DataPkt {
            rqr,
            rts: false,
            ie: true,
            dstnode: dest,
            srcnode: ctx.cfg.id,
            visit: 0,
            payload,
        };
        if self.l1.is_some() {
            self.forward(ctx, adjs, pkt, None);
        } else {
            // Phase II: destination must be an Up adjacency
            let found = adjs.iter().find(|(_, a)| {
                a.nodeid == dest && matches!(a.state, crate::adjacency::AdjState::Up)
            });
            match found {
                Some((aid, adj)) => {
                    ctx.circ_counter(adj.circuit).orig_sent += 1;
                    self.adj_send(ctx, adjs, aid, &pkt);
                }
                None => log::trace!("{} unreachable", dest),
            }
        }
    }

    /// A routing update process timer fired.
    pub(crate) fn update_timeout(
        &mut self,
        ctx: &mut Ctx<'_>,
        adjs: &AdjTable,
        circuit: CircuitId,
        level: UpdateLevel,
    ) {
        let Some(info) = self.circ_info(circuit).copied() else {
            return;
        };
        let neighbor = adjs.on_circuit(circuit).next();

        let kind = if info.lan {
            match level {
                UpdateLevel::L1 => Some(UpdateKind::Level1),
                UpdateLevel::L2 => Some(UpdateKind::Level2),
            }
        } else {
            match neighbor {
                None => None,
                Some((_, n)) if !n.ntype.is_router() => None,
                Some((_, n)) => match level {
                    UpdateLevel::L2 => {
                        (n.ntype == NodeType::L2Router).then_some(UpdateKind::Level2)
                    }
                    UpdateLevel::L1 => {
                        if n.ntype == NodeType::L2Router
                            && n.nodeid.area() != ctx.cfg.home_area()
                        {
                            // No level 1 data leaves the area
                            None
                        } else if ctx.cfg.phase == Phase::Phase3 || n.rphase == 3 {
                            Some(UpdateKind::Phase3)
                        } else {
                            Some(UpdateKind::Level1)
                        }
                    }
                },
            }
        };

        let dest = info.lan.then_some(ALL_ROUTERS);
        let Routing { l1, l2, updates, .. } = self;
        let Some(proc) = updates
            .iter_mut()
            .find(|u| u.circuit == circuit && u.level == level)
        else {
            return;
        };

        match level {
            UpdateLevel::L1 => {
                let Some(t) = l1 else { return };
                let high = match kind {
                    Some(UpdateKind::Phase3) => ctx.cfg.clamped_maxnodes().min(255),
                    _ => ctx.cfg.clamped_maxnodes(),
                };
                proc.expired(ctx, kind, 0, high, &t.minhops, &t.mincost,
                    info.minrouterblk, dest);
            }
            UpdateLevel::L2 => {
                let Some(t) = l2 else { return };
                proc.expired(ctx, kind, 1, ctx.cfg.clamped_maxarea() as u16, &t.minhops,
                    &t.mincost, info.minrouterblk, dest);
            }
        }
    }

    pub(crate) fn is_router(&self) -> bool {
        self.l1.is_some()
    }

    /// Endnode and Phase II receive path: terminating traffic goes up
    /// to NSP, everything else is silently dropped.
    pub(crate) fn local_rx(&mut self, ctx: &mut Ctx<'_>, pkt: DataPkt<'_>, src: Option<RxMeta>) {
        if pkt.dstnode != ctx.cfg.id {
            log::trace!("dropping transit packet for {}", pkt.dstnode);
            return;
        }
        if let Some(meta) = &src {
            ctx.circ_counter(meta.circuit).term_recv += 1;
        }
        if let Some(data) = work::frame(pkt.payload) {
            // Phase II links never carry a meaningful RTS flag
            let rts = pkt.rts && ctx.cfg.ntype != NodeType::Phase2;
            work::push_action(
                ctx.actions,
                Action::Deliver {
                    src: pkt.srcnode,
                    rts,
                    data,
                },
            );
        }
    }

    /// Whether a destination currently resolves to an output; a
    /// status surface for embedders and tests.
    pub fn reachable(&self, maxnodes: u16, dest: NodeAddr) -> bool {
        match &self.l1 {
            Some(l1) if dest.tid() <= maxnodes => l1.oadj[dest.tid() as usize].is_reachable(),
            _ => false,
        }
    }

    /// The advertised (hops, cost) row for a destination id.
    pub fn route_to(&self, id: u16) -> Option<(u8, u16)> {
        let l1 = self.l1.as_ref()?;
        let row = l1.oadj.get(id as usize)?;
        row.is_reachable()
            .then(|| (l1.minhops[id as usize], l1.mincost[id as usize]))
    }
}

/// A polymorphic mutable reference to an L1 or L2 column row set.
enum Col<'a> {
    L1Ref(&'a mut table::Column<1024>),
    L2Ref(&'a mut table::Column<64>),
}

impl Col<'_> {
    fn get(&self, id: u16) -> (u8, u16) {
        match self {
            Self::L1Ref(c) => (c.hops[id as usize], c.cost[id as usize]),
            Self::L2Ref(c) => (c.hops[id as usize], c.cost[id as usize]),
        }
    }

    fn set(&mut self, id: u16, hops: u8, cost: u16) {
        match self {
            Self::L1Ref(c) => {
                c.hops[id as usize] = hops;
                c.cost[id as usize] = cost;
            }
            Self::L2Ref(c) => {
                c.hops[id as usize] = hops;
                c.cost[id as usize] = cost;
            }
        }
    }
}
