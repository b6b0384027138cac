//! Broadcast (LAN) circuits, endnode and router flavours.
//!
//! Endnodes track one designated router and keep the previous-hop
//! cache.  Routers run the E-list hello protocol, admit at most NR
//! router adjacencies, and elect the designated router with a
//! DRDELAY hold-off.

use dnet_timer::TimerId;
use dnet_wire::addr::{ALL_ENDNODES, ALL_ROUTERS};
use dnet_wire::route::{
    strip_padding, EndnodeHello, RSent, RSlist, RoutePacket, RouterHello, TESTDATA_FILL,
};
use dnet_wire::{EthAddr, NodeAddr, NodeType, Version};

use crate::adjacency::{AdjState, AdjTable};
use crate::events::{Event, EventCode, Reason};
use crate::route::{DataPkt, Routing, RxMeta};
use crate::work::{self, Action, Port, TimerOwner};
use crate::{AdjId, CircuitConfig, CircuitId, Ctx, BCT3MULT, DRDELAY, ETHMTU, T2};

/// Previous-hop cache TTL, seconds.
const CACHE_TIME: u32 = 60;

struct PrevHop {
    mac: EthAddr,
    timer: TimerId,
}

pub struct LanCircuit {
    pub cfg: CircuitConfig,
    /// Hello interval, seconds.
    pub t3: u32,
    pub hello_timer: TimerId,
    pub dr_timer: TimerId,
    /// Local node acts as a router on this circuit.
    pub router: bool,
    pub isdr: bool,
    /// The designated router adjacency (for routers: the best remote
    /// candidate; None while we are it ourselves).
    pub dr: Option<AdjId>,
    lasthello: u64,
    holdoff: bool,
    prevhops: heapless::FnvIndexMap<NodeAddr, PrevHop, 32>,
}

impl LanCircuit {
    pub(crate) fn new(
        cfg: CircuitConfig,
        hello_timer: TimerId,
        dr_timer: TimerId,
        router: bool,
    ) -> Self {
        let t3 = if cfg.t3 == 0 { 10 } else { cfg.t3 } as u32;
        Self {
            cfg,
            t3,
            hello_timer,
            dr_timer,
            router,
            isdr: false,
            dr: None,
            lasthello: 0,
            holdoff: false,
            prevhops: heapless::FnvIndexMap::new(),
        }
    }

    pub fn prevhop(&self, id: NodeAddr) -> Option<EthAddr> {
        self.prevhops.get(&id).map(|p| p.mac)
    }
}

pub(crate) fn start(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &AdjTable,
) {
    send_hello(cid, lan, ctx, adjs, false);
}

pub(crate) fn stop(cid: CircuitId, lan: &mut LanCircuit, ctx: &mut Ctx<'_>, adjs: &AdjTable) {
    ctx.timers.stop(lan.dr_timer);
    ctx.timers.stop(lan.hello_timer);
    if lan.router {
        // Two empty hellos let the peers fast-fail us; the driver
        // paces them ~100 ms apart
        send_hello(cid, lan, ctx, adjs, true);
        send_hello(cid, lan, ctx, adjs, true);
    }
}

fn send_hello(cid: CircuitId, lan: &mut LanCircuit, ctx: &mut Ctx<'_>, adjs: &AdjTable, empty: bool) {
    lan.lasthello = ctx.now;
    lan.holdoff = false;
    let mut buf = [0u8; 512];

    if lan.router {
        let mut routers: heapless::Vec<RSent, 33> = heapless::Vec::new();
        if !empty {
            for (_, a) in adjs.routers_on(cid) {
                let _ = routers.push(RSent {
                    router: a.nodeid,
                    prio: a.prio,
                    twoway: a.state == AdjState::Up,
                });
            }
        }
        let hello = RouterHello {
            tiver: Version::PH4,
            id: ctx.cfg.id,
            ntype: ctx.cfg.ntype,
            blksize: ETHMTU,
            prio: lan.cfg.priority,
            timer: lan.t3 as u16,
            elist: RSlist::EMPTY,
        };
        if let Ok(encoded) = hello.encode(&routers, &mut buf) {
            if let Some(frame) = work::frame(encoded) {
                work::push_action(
                    ctx.actions,
                    Action::Send {
                        circuit: cid,
                        port: Port::Routing,
                        dest: Some(ALL_ROUTERS),
                        frame: frame.clone(),
                    },
                );
                if lan.isdr {
                    work::push_action(
                        ctx.actions,
                        Action::Send {
                            circuit: cid,
                            port: Port::Routing,
                            dest: Some(ALL_ENDNODES),
                            frame,
                        },
                    );
                }
            }
        }
    } else {
        let neighbor = lan
            .dr
            .and_then(|aid| adjs.get(aid))
            .map(|a| a.macid)
            .unwrap_or(EthAddr::NULL);
        let hello = EndnodeHello {
            tiver: Version::PH4,
            id: ctx.cfg.id,
            blksize: ETHMTU,
            neighbor,
            timer: lan.t3 as u16,
            testdata: &[TESTDATA_FILL; 50],
        };
        if let Ok(encoded) = hello.encode(&mut buf) {
            if let Some(frame) = work::frame(encoded) {
                work::push_action(
                    ctx.actions,
                    Action::Send {
                        circuit: cid,
                        port: Port::Routing,
                        dest: Some(ALL_ROUTERS),
                        frame,
                    },
                );
            }
        }
    }
    ctx.start_timer(lan.hello_timer, lan.t3);
}

/// Something changed in what our hello advertises: send a fresh one
/// now, rate-limited to one per T2.
fn new_hello(cid: CircuitId, lan: &mut LanCircuit, ctx: &mut Ctx<'_>, adjs: &AdjTable) {
    let since = ctx.now.saturating_sub(lan.lasthello);
    if since < T2 as u64 {
        if !lan.holdoff {
            lan.holdoff = true;
            ctx.start_timer(lan.hello_timer, (T2 as u64 - since) as u32);
        }
    } else {
        send_hello(cid, lan, ctx, adjs, false);
    }
}

pub(crate) fn hello_timeout(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
) {
    if lan.router {
        calc_dr(cid, lan, ctx, adjs);
    }
    send_hello(cid, lan, ctx, adjs, false);
}

/// DR election hold-off expired: if we still win, become DR.
pub(crate) fn dr_timeout(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
) {
    lan.isdr = true;
    if best_dr(cid, lan, ctx, adjs).is_none() {
        log::debug!("designated router on circuit {} is self", cid.0);
        lan.dr = None;
        new_hello(cid, lan, ctx, adjs);
    } else {
        calc_dr(cid, lan, ctx, adjs);
    }
}

/// The best remote DR candidate, or None when this node wins.
fn best_dr(
    cid: CircuitId,
    lan: &LanCircuit,
    ctx: &Ctx<'_>,
    adjs: &AdjTable,
) -> Option<AdjId> {
    let best = adjs
        .routers_on(cid)
        .filter(|(_, a)| a.nodeid.area() == ctx.cfg.home_area())
        .max_by_key(|(_, a)| (a.prio, a.nodeid));
    match best {
        Some((aid, a)) if (a.prio, a.nodeid) > (lan.cfg.priority, ctx.cfg.id) => Some(aid),
        _ => None,
    }
}

fn calc_dr(cid: CircuitId, lan: &mut LanCircuit, ctx: &mut Ctx<'_>, adjs: &AdjTable) {
    match best_dr(cid, lan, ctx, adjs) {
        None => {
            // We win, but hold off for DRDELAY to avoid churn
            if !lan.isdr && !ctx.timers.is_armed(lan.dr_timer) {
                log::debug!(
                    "designated router on circuit {} will be self, {} second delay",
                    cid.0,
                    DRDELAY
                );
                ctx.start_timer(lan.dr_timer, DRDELAY);
            }
        }
        Some(best) => {
            if lan.isdr {
                lan.isdr = false;
                new_hello(cid, lan, ctx, adjs);
            }
            if lan.dr != Some(best) {
                ctx.timers.stop(lan.dr_timer);
                lan.dr = Some(best);
                if let Some(a) = adjs.get(best) {
                    log::debug!("designated router on circuit {} is {}", cid.0, a.nodeid);
                }
            }
        }
    }
}

fn recompute_minrouterblk(cid: CircuitId, ctx: &Ctx<'_>, adjs: &AdjTable) -> u16 {
    let _ = ctx;
    adjs.routers_on(cid)
        .map(|(_, a)| a.blksize)
        .fold(ETHMTU, |m, b| m.min(b))
}

/// Take an adjacency down and out of the table.
#[allow(clippy::too_many_arguments)]
fn deladj(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    aid: AdjId,
    code: EventCode,
    reason: Option<Reason>,
) {
    let Some(adj) = adjs.get(aid) else { return };
    let was_router = adj.is_router();
    let nodeid = adj.nodeid;

    if adj.state == AdjState::Up {
        let mut ev = Event::new(code).circuit(cid).adjacency(nodeid);
        if let Some(r) = reason {
            ev = ev.reason(r);
        }
        ctx.events.log(ev);
        routing.adj_down(ctx, adjs, aid);
        ctx.circ_counter(cid).adj_down += 1;
        if let Some(info) = ctx.db.nodeinfo(nodeid) {
            info.adj_down += 1;
        }
    }
    adjs.remove(ctx.timers, aid);
    if lan.dr == Some(aid) {
        lan.dr = None;
    }
    if was_router && lan.router {
        calc_dr(cid, lan, ctx, adjs);
        new_hello(cid, lan, ctx, adjs);
        let blk = recompute_minrouterblk(cid, ctx, adjs);
        routing.set_minrouterblk(cid, blk);
    }
}

/// Adjacency listen timer fired.
pub(crate) fn adj_timeout(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    aid: AdjId,
) {
    if lan.router {
        deladj(
            cid,
            lan,
            ctx,
            adjs,
            routing,
            aid,
            EventCode::AdjDown,
            Some(Reason::ListenerTimeout),
        );
    } else {
        // The endnode's only adjacency is its designated router
        deladj(
            cid,
            lan,
            ctx,
            adjs,
            routing,
            aid,
            EventCode::AdjDown,
            Some(Reason::ListenerTimeout),
        );
        lan.dr = None;
    }
}

/// Previous-hop cache entry expired.
pub(crate) fn prevhop_expire(lan: &mut LanCircuit, ctx: &mut Ctx<'_>, id: NodeAddr) {
    if let Some(entry) = lan.prevhops.remove(&id) {
        ctx.timers.free(entry.timer);
    }
}

fn prevhop_refresh(cid: CircuitId, lan: &mut LanCircuit, ctx: &mut Ctx<'_>, id: NodeAddr, mac: EthAddr) {
    if let Some(entry) = lan.prevhops.get_mut(&id) {
        entry.mac = mac;
        let timer = entry.timer;
        ctx.start_timer(timer, CACHE_TIME);
        return;
    }
    if lan.prevhops.len() == lan.prevhops.capacity() {
        return;
    }
    if let Ok(timer) = ctx.timers.alloc(TimerOwner::PrevHop(cid, id)) {
        ctx.start_timer(timer, CACHE_TIME);
        let _ = lan.prevhops.insert(id, PrevHop { mac, timer });
    }
}

/// A frame arrived on the routing port.
#[allow(clippy::too_many_arguments)]
pub(crate) fn receive(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    src_mac: EthAddr,
    raw: &[u8],
) {
    if src_mac == EthAddr::from_node(ctx.cfg.id) {
        return;
    }
    let buf = match strip_padding(raw) {
        Ok(b) => b,
        Err(_) => {
            log::debug!("bad padding on circuit {}", cid.0);
            return;
        }
    };
    let pkt = match RoutePacket::decode(buf) {
        Ok(p) => p,
        Err(e) => {
            log::debug!("undecodable packet on circuit {}: {}", cid.0, e);
            ctx.counters.fmt_errors += 1;
            ctx.events
                .log(Event::new(EventCode::FmtErr).circuit(cid).packet(buf));
            return;
        }
    };

    match pkt {
        RoutePacket::RouterHello(hello) => {
            if lan.router {
                router_hello_rx(cid, lan, ctx, adjs, routing, &hello);
            } else {
                endnode_dr_rx(cid, lan, ctx, adjs, routing, &hello);
            }
        }
        RoutePacket::EndnodeHello(hello) => {
            if lan.router {
                endnode_hello_rx(cid, lan, ctx, adjs, routing, &hello);
            } else {
                log::debug!("endnode hello from {} received by endnode", hello.id);
            }
        }
        RoutePacket::LongData(p) => {
            data_rx(cid, lan, ctx, adjs, routing, src_mac, DataPkt::from_long(&p))
        }
        RoutePacket::ShortData(p) => {
            // Unexpected on a LAN but accepted, as the architecture
            // allows
            data_rx(cid, lan, ctx, adjs, routing, src_mac, DataPkt::from_short(&p))
        }
        RoutePacket::Routing(update) => {
            if !lan.router {
                return;
            }
            let Some(id) = src_mac.node_addr() else { return };
            let Some(aid) = adjs.find(cid, id) else {
                log::trace!("routing update without adjacency from {}", id);
                return;
            };
            if adjs.get(aid).map(|a| a.state) == Some(AdjState::Up) {
                if let Some(adj) = adjs.get(aid) {
                    adj.alive(ctx);
                }
                routing.routing_msg(ctx, adjs, aid, &update);
            }
        }
        _ => log::trace!("unexpected packet class on circuit {}", cid.0),
    }
}

fn data_rx(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    src_mac: EthAddr,
    pkt: DataPkt<'_>,
) {
    if !lan.router {
        // Remember where this source's traffic enters the LAN
        if pkt.dstnode == ctx.cfg.id {
            prevhop_refresh(cid, lan, ctx, pkt.srcnode, src_mac);
        }
        routing.local_rx(
            ctx,
            pkt,
            Some(RxMeta {
                circuit: cid,
                adj: None,
                src_node: Some(pkt.srcnode),
            }),
        );
        return;
    }

    let src_node = src_mac.node_addr();
    let adj = src_node.and_then(|id| adjs.find(cid, id));
    let meta = RxMeta {
        circuit: cid,
        adj,
        src_node,
    };
    routing.forward(ctx, adjs, pkt, Some(meta));
}

/// Endnode: track the designated router announced by router hellos.
fn endnode_dr_rx(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    hello: &RouterHello<'_>,
) {
    if hello.id.area() != ctx.cfg.home_area() {
        return;
    }
    if let Some(aid) = lan.dr {
        let same = adjs.get(aid).map(|a| a.nodeid) == Some(hello.id);
        if same {
            if let Some(a) = adjs.get(aid) {
                a.alive(ctx);
            }
            return;
        }
        deladj(
            cid,
            lan,
            ctx,
            adjs,
            routing,
            aid,
            EventCode::AdjDown,
            Some(Reason::AddressChange),
        );
    }
    let aid = adjs.insert(
        ctx.timers,
        cid,
        hello.id,
        hello.ntype,
        4,
        hello.blksize,
        hello.prio,
        hello.tiver,
        hello.timer as u32 * BCT3MULT as u32,
    );
    if let Some(aid) = aid {
        if let Some(a) = adjs.get_mut(aid) {
            a.state = AdjState::Up;
        }
        if let Some(a) = adjs.get(aid) {
            a.alive(ctx);
        }
        lan.dr = Some(aid);
        ctx.events.log(
            Event::new(EventCode::AdjUp)
                .circuit(cid)
                .adjacency(hello.id),
        );
        routing.adj_up(ctx, adjs, aid);
    }
}

/// Router: an endnode announced itself.
fn endnode_hello_rx(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    hello: &EndnodeHello<'_>,
) {
    if hello.id.area() != ctx.cfg.home_area() {
        return;
    }
    let existing = adjs.find(cid, hello.id);
    if !hello.testdata_ok() {
        if let Some(aid) = existing {
            deladj(
                cid,
                lan,
                ctx,
                adjs,
                routing,
                aid,
                EventCode::AdjDown,
                Some(Reason::ListenerInvalidData),
            );
        }
        return;
    }
    match existing {
        None => {
            let aid = adjs.insert(
                ctx.timers,
                cid,
                hello.id,
                NodeType::Endnode,
                4,
                hello.blksize,
                0,
                hello.tiver,
                hello.timer as u32 * BCT3MULT as u32,
            );
            if let Some(aid) = aid {
                if let Some(a) = adjs.get_mut(aid) {
                    a.state = AdjState::Up;
                }
                if let Some(a) = adjs.get(aid) {
                    a.alive(ctx);
                }
                ctx.events.log(
                    Event::new(EventCode::AdjUp)
                        .circuit(cid)
                        .adjacency(hello.id),
                );
                routing.adj_up(ctx, adjs, aid);
            }
        }
        Some(aid) => {
            let ntype = adjs.get(aid).map(|a| a.ntype);
            if ntype == Some(NodeType::Endnode) {
                if let Some(a) = adjs.get(aid) {
                    a.alive(ctx);
                }
            } else {
                // It used to be a router; no better reason code
                deladj(
                    cid,
                    lan,
                    ctx,
                    adjs,
                    routing,
                    aid,
                    EventCode::AdjDown,
                    Some(Reason::AddressChange),
                );
            }
        }
    }
}

/// Router: process a router hello with its E-list.
fn router_hello_rx(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    hello: &RouterHello<'_>,
) {
    let id = hello.id;
    if id.area() != ctx.cfg.home_area()
        && !(ctx.cfg.ntype == NodeType::L2Router && hello.ntype == NodeType::L2Router)
    {
        return;
    }

    let mut hellochange = false;
    let existing = adjs.find(cid, id);
    let aid = match existing {
        Some(aid) => {
            if let Some(a) = adjs.get(aid) {
                a.alive(ctx);
            }
            aid
        }
        None => {
            let Some(aid) = adjs.insert(
                ctx.timers,
                cid,
                id,
                hello.ntype,
                4,
                hello.blksize,
                hello.prio,
                hello.tiver,
                hello.timer as u32 * BCT3MULT as u32,
            ) else {
                return;
            };
            if let Some(a) = adjs.get(aid) {
                a.alive(ctx);
            }
            log::trace!("new router adjacency {} on circuit {}", id, cid.0);

            // Admission: the router table holds NR entries; the
            // lowest (priority, id) loses, possibly the newcomer
            let count = adjs.routers_on(cid).count();
            if count > lan.cfg.nr as usize {
                let victim = adjs
                    .routers_on(cid)
                    .min_by_key(|(_, a)| (a.prio, a.nodeid))
                    .map(|(v, a)| (v, a.nodeid, a.state));
                if let Some((victim, vnode, vstate)) = victim {
                    if vstate != AdjState::Up {
                        ctx.events.log(
                            Event::new(EventCode::AdjRej)
                                .circuit(cid)
                                .adjacency(vnode),
                        );
                    }
                    deladj(
                        cid,
                        lan,
                        ctx,
                        adjs,
                        routing,
                        victim,
                        EventCode::AdjRej,
                        None,
                    );
                    if victim == aid {
                        return;
                    }
                }
            }
            let blk = recompute_minrouterblk(cid, ctx, adjs);
            routing.set_minrouterblk(cid, blk);
            hellochange = true;
            aid
        }
    };

    // A changed type or priority invalidates everything we knew
    let (ntype, prio, state) = match adjs.get(aid) {
        Some(a) => (a.ntype, a.prio, a.state),
        None => return,
    };
    if ntype == NodeType::Endnode || ntype != hello.ntype || prio != hello.prio {
        deladj(
            cid,
            lan,
            ctx,
            adjs,
            routing,
            aid,
            EventCode::AdjDown,
            Some(Reason::AddressChange),
        );
        return;
    }

    // Scan the E-list for our own entry: presence means the neighbor
    // hears us, which is what makes the adjacency two-way
    let selfent = hello.elist.iter().find(|e| e.router == ctx.cfg.id);
    match selfent {
        Some(ent) => {
            if ent.prio != lan.cfg.priority {
                log::warn!(
                    "node {} advertises our priority as {} rather than {}",
                    id,
                    ent.prio,
                    lan.cfg.priority
                );
                deladj(
                    cid,
                    lan,
                    ctx,
                    adjs,
                    routing,
                    aid,
                    EventCode::AdjDown,
                    Some(Reason::DataErrors),
                );
                return;
            }
            if state == AdjState::Init {
                if let Some(a) = adjs.get_mut(aid) {
                    a.state = AdjState::Up;
                }
                ctx.events
                    .log(Event::new(EventCode::AdjUp).circuit(cid).adjacency(id));
                routing.adj_up(ctx, adjs, aid);
                hellochange = true;
            }
        }
        None => {
            if state == AdjState::Up {
                ctx.events.log(
                    Event::new(EventCode::AdjDown)
                        .circuit(cid)
                        .adjacency(id)
                        .reason(Reason::Dropped),
                );
                routing.adj_down(ctx, adjs, aid);
                ctx.circ_counter(cid).adj_down += 1;
                if let Some(a) = adjs.get_mut(aid) {
                    a.state = AdjState::Init;
                }
                hellochange = true;
            }
        }
    }

    calc_dr(cid, lan, ctx, adjs);
    if hellochange {
        new_hello(cid, lan, ctx, adjs);
    }
}

/// Originate a packet from an endnode: previous-hop cache first, then
/// the designated router, then the HIORD-guessed station address.
#[allow(clippy::too_many_arguments)]
pub(crate) fn endnode_send(
    cid: CircuitId,
    lan: &mut LanCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &AdjTable,
    dest: NodeAddr,
    payload: &[u8],
    rqr: bool,
    tryhard: bool,
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

    if tryhard {
        prevhop_expire(lan, ctx, dest);
    }
    let mac = lan
        .prevhop(dest)
        .or_else(|| lan.dr.and_then(|aid| adjs.get(aid)).map(|a| a.macid))
        .unwrap_or(EthAddr::from_node(dest));

    let mut buf = [0u8; crate::MTU];
    let long = dnet_wire::route::LongData {
        rqr: pkt.rqr,
        rts: pkt.rts,
        ie: pkt.ie,
        dst: pkt.dstnode,
        src: pkt.srcnode,
        visit: pkt.visit,
        payload: pkt.payload,
    };
    if let Ok(encoded) = long.encode(&mut buf) {
        if let Some(frame) = work::frame(encoded) {
            ctx.circ_counter(cid).orig_sent += 1;
            work::push_action(
                ctx.actions,
                Action::Send {
                    circuit: cid,
                    port: Port::Routing,
                    dest: Some(mac),
                    frame,
                },
            );
        }
    }
}
