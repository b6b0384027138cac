//! The point-to-point circuit state machine.
//!
//! Mirrors the architected initialization sequence (datalink start,
//! routing init, optional verification, running) with Phase II and
//! Phase III backward compatibility, remote-restart handling, and an
//! exponential reconnect hold-off.  The state is an enum tag; each
//! state has one handler per input class.

use dnet_timer::TimerId;
use dnet_wire::route::{
    NodeInit, NodeVerify, PtpHello, PtpInit, PtpInit3, PtpVerify, RoutePacket, TESTDATA_FILL,
};
use dnet_wire::{NodeAddr, NodeType, Version};

use crate::adjacency::{AdjState, AdjTable};
use crate::events::{Event, EventCode, Reason};
use crate::route::intercept::{self, P2Packet};
use crate::route::{DataPkt, Routing, RxMeta};
use crate::work::{self, Action, Port, Work, WorkQueue};
use crate::{CircuitConfig, CircuitId, Ctx, Phase, T3MULT};

/// Reconnect hold-off bounds, seconds.
const HOLDOFF_MIN: u32 = 2;
const HOLDOFF_MAX: u32 = 120;
/// How long a stopping circuit waits for the datalink to close
/// before halting anyway, seconds.
const SHUTDOWN_DRAIN: u32 = 5;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PtpState {
    /// Off; nothing runs.
    Halted,
    /// Waiting for the datalink to come up.
    DataLinkStart,
    /// Init sent; waiting for the peer's.
    RoutingInit,
    /// Waiting for the peer's verification message.
    Verify,
    /// Adjacency up; data flows.
    Running,
    /// Holding off before the next datalink start attempt.
    Reconnect,
    /// Stopped by the operator; draining until the datalink reports
    /// down.
    Shutdown,
}

pub struct PtpCircuit {
    pub cfg: CircuitConfig,
    pub state: PtpState,
    /// Hello interval, seconds.
    pub hellotime: u32,
    /// Listen timeout, seconds.
    pub t4: u32,
    pub state_timer: TimerId,
    pub hello_timer: TimerId,
    backoff: u32,
    /// Whether the datalink detects remote restarts itself.
    pub start_works: bool,
    pub adj: Option<crate::AdjId>,
    /// Neighbor parameters learned from its init.
    pub rphase: u8,
    pub ntype: NodeType,
    pub nodeid: NodeAddr,
    pub blksize: u16,
    pub tiver: Option<Version>,
    /// Phase II neighbor requested intercept service.
    rint: bool,
    /// Phase II neighbor's announced name.
    rnodename: crate::db::NodeName,
}

impl PtpCircuit {
    pub(crate) fn new(cfg: CircuitConfig, state_timer: TimerId, hello_timer: TimerId) -> Self {
        let hellotime = if cfg.t3 == 0 { 60 } else { cfg.t3 } as u32;
        Self {
            cfg,
            state: PtpState::Halted,
            hellotime,
            t4: hellotime * 3,
            state_timer,
            hello_timer,
            backoff: HOLDOFF_MIN,
            start_works: true,
            adj: None,
            rphase: 0,
            ntype: NodeType::Endnode,
            nodeid: NodeAddr::from_raw(0),
            blksize: 0,
            tiver: None,
            rint: false,
            rnodename: crate::db::NodeName::new(),
        }
    }
}

pub(crate) fn start(cid: CircuitId, ptp: &mut PtpCircuit, ctx: &mut Ctx<'_>) {
    ptp.ntype = NodeType::Endnode;
    ptp.nodeid = NodeAddr::from_raw(0);
    ptp.tiver = None;
    ptp.t4 = ptp.hellotime * 3;
    work::push_action(ctx.actions, Action::OpenLink { circuit: cid });
    ctx.start_timer(ptp.state_timer, ptp.t4);
    ptp.state = PtpState::DataLinkStart;
}

pub(crate) fn stop(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
) {
    if ptp.state == PtpState::Halted {
        return;
    }
    if ptp.state == PtpState::Running {
        down(cid, ptp, ctx, adjs, routing, Reason::OperatorCommand);
    }
    ctx.timers.stop(ptp.hello_timer);
    work::push_action(ctx.actions, Action::CloseLink { circuit: cid });
    // Drain until the datalink reports down; a deaf datalink gets
    // timed out
    ctx.start_timer(ptp.state_timer, SHUTDOWN_DRAIN);
    ptp.state = PtpState::Shutdown;
}

/// Tear down and hold off before trying the datalink again.  The
/// hold-off doubles on every restart and is reset when Running is
/// reached (not when Verify is reached).
fn restart(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    reason: Reason,
) {
    log::trace!("circuit {} restart: {}", cid.0, reason);
    if ptp.state == PtpState::Running {
        down(cid, ptp, ctx, adjs, routing, reason);
    }
    work::push_action(ctx.actions, Action::CloseLink { circuit: cid });
    ctx.timers.stop(ptp.hello_timer);
    ptp.state = PtpState::Reconnect;
    ctx.start_timer(ptp.state_timer, ptp.backoff);
    ptp.backoff = (ptp.backoff * 2).min(HOLDOFF_MAX);
}

fn down(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    reason: Reason,
) {
    if let Some(aid) = ptp.adj.take() {
        if let Some(adj) = adjs.get(aid) {
            let nodeid = adj.nodeid;
            routing.adj_down(ctx, adjs, aid);
            if let Some(adj) = adjs.remove(ctx.timers, aid) {
                adj.stop_timer(ctx);
            }
            ctx.circ_counter(cid).adj_down += 1;
            ctx.circ_counter(cid).cir_down += 1;
            if let Some(info) = ctx.db.nodeinfo(nodeid) {
                info.adj_down += 1;
            }
            ctx.events.log(
                Event::new(EventCode::CircDown)
                    .circuit(cid)
                    .adjacency(nodeid)
                    .reason(reason),
            );
        }
    }
}

/// Adjacency up: everything needed to enter Running.
fn up(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
) {
    let aid = adjs.insert(
        ctx.timers,
        cid,
        ptp.nodeid,
        ptp.ntype,
        ptp.rphase,
        ptp.blksize,
        0,
        ptp.tiver.unwrap_or(Version::PH4),
        ptp.t4,
    );
    let Some(aid) = aid else {
        restart(cid, ptp, ctx, adjs, routing, Reason::Restart);
        return;
    };
    if let Some(adj) = adjs.get_mut(aid) {
        adj.state = AdjState::Up;
        adj.rint = ptp.rint;
        adj.rnodename = ptp.rnodename.clone();
    }
    if let Some(adj) = adjs.get(aid) {
        adj.alive(ctx);
    }
    ptp.adj = Some(aid);
    routing.set_minrouterblk(cid, ptp.blksize);
    routing.adj_up(ctx, adjs, aid);
    ctx.events.log(
        Event::new(EventCode::CircUp)
            .circuit(cid)
            .adjacency(ptp.nodeid),
    );
    ctx.start_timer(ptp.hello_timer, ptp.hellotime);
    if ptp.rphase > 2 {
        ctx.start_timer(ptp.state_timer, ptp.t4);
    } else {
        ctx.timers.stop(ptp.state_timer);
    }
    ptp.backoff = HOLDOFF_MIN;
    ptp.state = PtpState::Running;
}

fn fmterr(cid: CircuitId, ctx: &mut Ctx<'_>, buf: &[u8]) {
    ctx.counters.fmt_errors += 1;
    ctx.events
        .log(Event::new(EventCode::FmtErr).circuit(cid).packet(buf));
}

/// Send our initialization message, picked by the local phase.
fn send_init(cid: CircuitId, ptp: &PtpCircuit, ctx: &mut Ctx<'_>) {
    let mut buf = [0u8; 128];
    let encoded = match ctx.cfg.phase {
        Phase::Phase4 => PtpInit {
            srcnode: ctx.cfg.id,
            ntype: ctx.cfg.ntype,
            verif: ptp.cfg.verify,
            blo: false,
            blksize: crate::MTU as u16,
            tiver: Version::PH4,
            timer: ptp.hellotime as u16,
        }
        .encode(&mut buf),
        Phase::Phase3 => PtpInit3 {
            srcnode: NodeAddr::from_raw(ctx.cfg.tid()),
            ntype: phase3_ntype(ctx.cfg.ntype),
            verif: ptp.cfg.verify,
            blo: false,
            blksize: crate::MTU as u16,
            tiver: Version::PH3,
        }
        .encode(&mut buf),
        Phase::Phase2 => node_init(ctx, ptp).encode(&mut buf),
    };
    if let Ok(encoded) = encoded {
        send(cid, ctx, encoded);
    }
}

fn node_init<'a>(ctx: &Ctx<'a>, ptp: &PtpCircuit) -> NodeInit<'a> {
    NodeInit {
        srcnode: NodeAddr::from_raw(ctx.cfg.tid()),
        nodename: ctx.cfg.name.as_str(),
        int: match ctx.cfg.intercept {
            crate::InterceptMode::None => 0,
            _ => 7,
        },
        verif: ptp.cfg.verify,
        rint: 0,
        blksize: crate::MTU as u16,
        nspsize: crate::MTU as u16,
        maxlnks: 32,
        routver: Version::PH2,
        commver: Version::NSP_PH2,
        sysver: "dnet",
    }
}

fn send(cid: CircuitId, ctx: &mut Ctx<'_>, encoded: &[u8]) {
    if let Some(frame) = work::frame(encoded) {
        work::push_action(
            ctx.actions,
            Action::Send {
                circuit: cid,
                port: Port::Routing,
                dest: None,
                frame,
            },
        );
    }
}

const fn phase3_ntype(ntype: NodeType) -> NodeType {
    match ntype {
        // Phase III has no area routers
        NodeType::L2Router => NodeType::L1Router,
        other => other,
    }
}

/// Send the verification message the peer requested.
fn send_verification(cid: CircuitId, ptp: &PtpCircuit, ctx: &mut Ctx<'_>) {
    let mut verif = [0u8; 64];
    let v = ctx.db.outbound_verification(ptp.nodeid);
    let len = v.len().min(64);
    verif[..len].copy_from_slice(&v[..len]);

    let mut buf = [0u8; 80];
    let encoded = if ptp.rphase == 2 {
        let mut password = [0u8; 8];
        let n = len.min(8);
        password[..n].copy_from_slice(&verif[..n]);
        NodeVerify { password }.encode(&mut buf)
    } else {
        let srcnode = if ptp.rphase == 4 {
            ctx.cfg.id
        } else {
            NodeAddr::from_raw(ctx.cfg.tid())
        };
        PtpVerify {
            srcnode,
            fcnval: &verif[..len],
        }
        .encode(&mut buf)
    };
    if let Ok(encoded) = encoded {
        send(cid, ctx, encoded);
    }
}

/// Validate a received verification value against the database, when
/// an expectation is configured.
fn verification_ok(ctx: &Ctx<'_>, nodeid: NodeAddr, value: &[u8]) -> bool {
    match ctx.db.inbound_verification(nodeid) {
        Some(expected) => expected == value,
        None => true,
    }
}

pub(crate) fn dl_status(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    link_up: bool,
) {
    match ptp.state {
        PtpState::DataLinkStart if link_up => {
            send_init(cid, ptp, ctx);
            ptp.state = PtpState::RoutingInit;
        }
        PtpState::DataLinkStart => {
            restart(cid, ptp, ctx, adjs, routing, Reason::DatalinkDown)
        }
        PtpState::RoutingInit | PtpState::Verify => {
            ctx.circ_counter(cid).init_fail += 1;
            restart(cid, ptp, ctx, adjs, routing, Reason::DatalinkDown);
        }
        PtpState::Running => restart(cid, ptp, ctx, adjs, routing, Reason::DatalinkDown),
        PtpState::Shutdown => {
            if !link_up {
                ctx.timers.stop(ptp.state_timer);
                ptp.state = PtpState::Halted;
            }
        }
        PtpState::Halted | PtpState::Reconnect => (),
    }
}

/// The state timer: init timeout, listen timeout, or reconnect
/// hold-off depending on the state.
pub(crate) fn timeout(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
) {
    match ptp.state {
        PtpState::DataLinkStart | PtpState::Running => {
            restart(cid, ptp, ctx, adjs, routing, Reason::Timeout)
        }
        PtpState::RoutingInit | PtpState::Verify => {
            ctx.circ_counter(cid).init_fail += 1;
            restart(cid, ptp, ctx, adjs, routing, Reason::Timeout);
        }
        PtpState::Reconnect => {
            // Hold-off over; try the datalink again
            ptp.t4 = ptp.hellotime * 3;
            ptp.tiver = None;
            work::push_action(ctx.actions, Action::OpenLink { circuit: cid });
            ctx.start_timer(ptp.state_timer, ptp.t4);
            ptp.state = PtpState::DataLinkStart;
        }
        PtpState::Shutdown => {
            // The datalink never confirmed the close; halt anyway
            ptp.state = PtpState::Halted;
        }
        PtpState::Halted => (),
    }
}

pub(crate) fn hello_timeout(cid: CircuitId, ptp: &mut PtpCircuit, ctx: &mut Ctx<'_>) {
    if ptp.state != PtpState::Running {
        return;
    }
    let mut buf = [0u8; 160];
    if ctx.cfg.phase == Phase::Phase2 {
        // NOP message is the Phase II keepalive
        buf[0] = 0x08;
        buf[1..11].fill(TESTDATA_FILL);
        send(cid, ctx, &buf[..11]);
    } else {
        let hello = PtpHello {
            srcnode: if ptp.rphase == 4 || ctx.cfg.phase == Phase::Phase4 {
                ctx.cfg.id
            } else {
                NodeAddr::from_raw(ctx.cfg.tid())
            },
            testdata: &[TESTDATA_FILL; 128],
        };
        if let Ok(encoded) = hello.encode(&mut buf) {
            send(cid, ctx, encoded);
        }
    }
    ctx.start_timer(ptp.hello_timer, ptp.hellotime);
}

/// A frame arrived from the datalink.
#[allow(clippy::too_many_arguments)]
pub(crate) fn receive(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    raw: &[u8],
) {
    if raw.is_empty() {
        dl_status(cid, ptp, ctx, adjs, routing, false);
        return;
    }
    let buf = if ctx.cfg.phase == Phase::Phase4 {
        match dnet_wire::route::strip_padding(raw) {
            Ok(b) => b,
            Err(_) => {
                fmterr(cid, ctx, raw);
                dl_status(cid, ptp, ctx, adjs, routing, false);
                return;
            }
        }
    } else {
        raw
    };

    let pkt = match RoutePacket::decode(buf) {
        Ok(p) => p,
        Err(_) => {
            fmterr(cid, ctx, buf);
            if matches!(ptp.state, PtpState::RoutingInit | PtpState::Verify) {
                ctx.circ_counter(cid).init_fail += 1;
                restart(cid, ptp, ctx, adjs, routing, Reason::UnexpectedPacket);
            }
            return;
        }
    };

    match ptp.state {
        PtpState::RoutingInit => ri_packet(cid, ptp, ctx, adjs, routing, buf, pkt),
        PtpState::Verify => rv_packet(cid, ptp, ctx, adjs, routing, buf, pkt),
        PtpState::Running => ru_packet(cid, ptp, ctx, adjs, routing, buf, pkt),
        _ => (),
    }
}

fn ri_packet(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    buf: &[u8],
    pkt: RoutePacket<'_>,
) {
    match pkt {
        RoutePacket::NodeInit(init) => {
            if ctx.cfg.phase != Phase::Phase2 {
                // Meet the Phase II neighbor on its own terms
                let mut obuf = [0u8; 128];
                if let Ok(encoded) = node_init(ctx, ptp).encode(&mut obuf) {
                    send(cid, ctx, encoded);
                }
            }
            ptp.rphase = 2;
            ptp.ntype = NodeType::Phase2;
            ptp.blksize = init.blksize;
            ptp.nodeid = init.srcnode;
            ptp.tiver = Some(init.routver);
            ptp.rint = init.rint != 0;
            ptp.rnodename.clear();
            let _ = ptp.rnodename.push_str(init.nodename);
            ctx.db.set_name(init.srcnode, init.nodename);
            if init.verif {
                send_verification(cid, ptp, ctx);
            }
            if ptp.cfg.verify {
                ptp.state = PtpState::Verify;
                return;
            }
            up(cid, ptp, ctx, adjs, routing);
        }
        RoutePacket::PtpInit(init) => {
            if ctx.cfg.phase < Phase::Phase4 {
                log::trace!("ignoring phase 4 init");
                return;
            }
            ptp.t4 = init.timer as u32 * T3MULT as u32;
            ptp.rphase = 4;
            if !matches!(
                init.ntype,
                NodeType::Endnode | NodeType::L1Router | NodeType::L2Router
            ) || init.blo
            {
                ctx.circ_counter(cid).init_fail += 1;
                restart(cid, ptp, ctx, adjs, routing, Reason::UnexpectedPacket);
                return;
            }
            ptp.nodeid = init.srcnode;
            ptp.ntype = init.ntype;
            ptp.blksize = init.blksize;
            ptp.tiver = Some(init.tiver);
            if init.verif {
                send_verification(cid, ptp, ctx);
            }
            if ptp.cfg.verify {
                ptp.state = PtpState::Verify;
                ctx.start_timer(ptp.state_timer, ptp.t4);
                return;
            }
            up(cid, ptp, ctx, adjs, routing);
        }
        RoutePacket::PtpInit3(init) => {
            if ctx.cfg.phase < Phase::Phase3 {
                log::trace!("ignoring phase 3 init");
                return;
            }
            ptp.t4 = ptp.hellotime * T3MULT as u32;
            ptp.rphase = 3;
            if !matches!(init.ntype, NodeType::Endnode | NodeType::L1Router) {
                fmterr(cid, ctx, buf);
                ctx.circ_counter(cid).init_fail += 1;
                restart(cid, ptp, ctx, adjs, routing, Reason::UnexpectedPacket);
                return;
            }
            if ctx.cfg.phase == Phase::Phase4 {
                // We already sent a Phase IV init; add the Phase III
                // form the neighbor understands
                let mut obuf = [0u8; 96];
                let init3 = PtpInit3 {
                    srcnode: NodeAddr::from_raw(ctx.cfg.tid()),
                    ntype: phase3_ntype(ctx.cfg.ntype),
                    verif: ptp.cfg.verify,
                    blo: false,
                    blksize: crate::MTU as u16,
                    tiver: Version::PH3,
                };
                if let Ok(encoded) = init3.encode(&mut obuf) {
                    send(cid, ctx, encoded);
                }
            }
            ptp.nodeid = init.srcnode.in_area(ctx.cfg.home_area());
            ptp.ntype = init.ntype;
            ptp.blksize = init.blksize;
            ptp.tiver = Some(init.tiver);
            if init.verif {
                send_verification(cid, ptp, ctx);
            }
            if ptp.cfg.verify {
                ptp.state = PtpState::Verify;
                ctx.start_timer(ptp.state_timer, ptp.t4);
                return;
            }
            up(cid, ptp, ctx, adjs, routing);
        }
        RoutePacket::InitTooNew { major } => {
            log::trace!("ignoring init with version {}", major);
        }
        _ => {
            fmterr(cid, ctx, buf);
            ctx.circ_counter(cid).init_fail += 1;
            restart(cid, ptp, ctx, adjs, routing, Reason::UnexpectedPacket);
        }
    }
}

fn rv_packet(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    buf: &[u8],
    pkt: RoutePacket<'_>,
) {
    match pkt {
        RoutePacket::PtpVerify(v) if ptp.rphase > 2 => {
            if !verification_ok(ctx, ptp.nodeid, v.fcnval) {
                ctx.counters.ver_rejects += 1;
                ctx.events.log(
                    Event::new(EventCode::VerRej)
                        .circuit(cid)
                        .adjacency(ptp.nodeid),
                );
                ctx.circ_counter(cid).init_fail += 1;
                restart(cid, ptp, ctx, adjs, routing, Reason::VerificationFailed);
                return;
            }
            up(cid, ptp, ctx, adjs, routing);
        }
        RoutePacket::NodeVerify(v) if ptp.rphase == 2 => {
            if !verification_ok(ctx, ptp.nodeid, &v.password) {
                ctx.counters.ver_rejects += 1;
                ctx.events.log(
                    Event::new(EventCode::VerRej)
                        .circuit(cid)
                        .adjacency(ptp.nodeid),
                );
                ctx.circ_counter(cid).init_fail += 1;
                restart(cid, ptp, ctx, adjs, routing, Reason::VerificationFailed);
                return;
            }
            up(cid, ptp, ctx, adjs, routing);
        }
        _ => {
            fmterr(cid, ctx, buf);
            ctx.circ_counter(cid).init_fail += 1;
            restart(cid, ptp, ctx, adjs, routing, Reason::UnexpectedPacket);
        }
    }
}

fn ru_packet(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    buf: &[u8],
    pkt: RoutePacket<'_>,
) {
    // Any traffic from a Phase III/IV neighbor resets the listen
    // timers
    if ptp.rphase > 2 {
        ctx.start_timer(ptp.state_timer, ptp.t4);
        if let Some(adj) = ptp.adj.and_then(|aid| adjs.get(aid)) {
            adj.alive(ctx);
        }
    }
    let Some(aid) = ptp.adj else { return };
    let meta = RxMeta {
        circuit: cid,
        adj: Some(aid),
        src_node: Some(ptp.nodeid),
    };

    if ptp.rphase == 2 {
        match pkt {
            RoutePacket::Phase2Data(payload) => {
                p2_receive(cid, ctx, adjs, routing, aid, P2Packet::Bare(payload));
            }
            RoutePacket::RouteHdr(hdr) => {
                p2_receive(cid, ctx, adjs, routing, aid, P2Packet::Routed(hdr));
            }
            RoutePacket::Nop => (),
            RoutePacket::NodeInit(_) => {
                init_in_running(cid, ptp, ctx, adjs, routing, buf);
            }
            _ => {
                fmterr(cid, ctx, buf);
                restart(cid, ptp, ctx, adjs, routing, Reason::UnexpectedPacket);
            }
        }
        return;
    }

    match pkt {
        RoutePacket::ShortData(mut p) => {
            if ptp.rphase < 4 && ctx.cfg.phase == Phase::Phase4 {
                p.src = p.src.in_area(ctx.cfg.home_area());
                p.dst = p.dst.in_area(ctx.cfg.home_area());
            }
            routing.forward(ctx, adjs, DataPkt::from_short(&p), Some(meta));
        }
        RoutePacket::LongData(p) => {
            routing.forward(ctx, adjs, DataPkt::from_long(&p), Some(meta));
        }
        RoutePacket::Routing(mut update) => {
            if ptp.rphase < 4 && ctx.cfg.phase == Phase::Phase4 {
                update.srcnode = update.srcnode.in_area(ctx.cfg.home_area());
            }
            routing.routing_msg(ctx, adjs, aid, &update);
        }
        RoutePacket::PtpHello(hello) => {
            if !hello.testdata_ok() {
                fmterr(cid, ctx, buf);
                restart(cid, ptp, ctx, adjs, routing, Reason::ListenerInvalidData);
            }
        }
        RoutePacket::Nop => (),
        RoutePacket::PtpInit(_) | RoutePacket::PtpInit3(_) | RoutePacket::NodeInit(_) => {
            fmterr(cid, ctx, buf);
            init_in_running(cid, ptp, ctx, adjs, routing, buf);
        }
        _ => {
            fmterr(cid, ctx, buf);
            restart(cid, ptp, ctx, adjs, routing, Reason::UnexpectedPacket);
        }
    }
}

/// An init in Running means the remote restarted.  On datalinks that
/// do not signal remote restarts, declare the circuit down and replay
/// the init through a fresh DataLinkStart pass instead of waiting out
/// the normal restart sequence.
fn init_in_running(
    cid: CircuitId,
    ptp: &mut PtpCircuit,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    buf: &[u8],
) {
    if ptp.start_works {
        restart(cid, ptp, ctx, adjs, routing, Reason::Restart);
        return;
    }
    down(cid, ptp, ctx, adjs, routing, Reason::Restart);
    log::trace!("circuit {} init workaround engaged", cid.0);
    ptp.t4 = ptp.hellotime * 3;
    ptp.tiver = None;
    ctx.start_timer(ptp.state_timer, ptp.t4);
    ctx.timers.stop(ptp.hello_timer);
    replay(cid, ctx.queue, buf);
    ptp.state = PtpState::DataLinkStart;
}

fn replay(cid: CircuitId, queue: &mut WorkQueue, buf: &[u8]) {
    let _ = queue.push_back(Work::DlStatus {
        circuit: cid,
        up: true,
    });
    if let Some(frame) = work::frame(buf) {
        let _ = queue.push_back(Work::Received {
            circuit: cid,
            port: Port::Routing,
            src: dnet_wire::EthAddr::NULL,
            frame,
        });
    }
}

fn p2_receive(
    cid: CircuitId,
    ctx: &mut Ctx<'_>,
    adjs: &mut AdjTable,
    routing: &mut Routing,
    aid: crate::AdjId,
    pkt: P2Packet<'_>,
) {
    let Some(adj) = adjs.get(aid) else { return };
    match intercept::recv(routing.intercept, ctx, adj, pkt) {
        intercept::P2Rx::Forward {
            dst,
            src,
            visit,
            payload,
        } => {
            let data = DataPkt {
                rqr: true,
                rts: false,
                ie: false,
                dstnode: dst,
                srcnode: src,
                visit,
                payload,
            };
            let meta = RxMeta {
                circuit: cid,
                adj: Some(aid),
                src_node: Some(src),
            };
            if routing.is_router() {
                routing.forward(ctx, adjs, data, Some(meta));
            } else {
                routing.local_rx(ctx, data, Some(meta));
            }
        }
        intercept::P2Rx::Bounce(frame) => {
            work::push_action(
                ctx.actions,
                Action::Send {
                    circuit: cid,
                    port: Port::Routing,
                    dest: None,
                    frame,
                },
            );
        }
        intercept::P2Rx::Drop => (),
    }
}
