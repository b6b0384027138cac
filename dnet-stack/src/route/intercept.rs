//! Phase II "intercept": non-neighbor reachability for Phase II
//! nodes, provided by Phase III/IV routers that add and strip route
//! headers carrying node names.

use dnet_wire::route::RouteHdr;
use dnet_wire::NodeAddr;

use crate::adjacency::Adjacency;
use crate::route::DataPkt;
use crate::work::FrameBuf;
use crate::{Ctx, InterceptMode};

/// NSP Disconnect Confirm message flag byte.
const DISCCONF_MSGFLG: u8 = 0x48;
/// NSP disconnect reason: destination unreachable.
const UNREACH: u16 = 39;

/// What arrived from a Phase II neighbor, after circuit-level
/// classification.
#[derive(Copy, Clone, Debug)]
pub enum P2Packet<'a> {
    /// Bare NSP payload, no routing header.
    Bare(&'a [u8]),
    /// Payload with a Phase II route header.
    Routed(RouteHdr<'a>),
}

/// Outcome of receiving a Phase II packet.
pub enum P2Rx<'a> {
    /// Hand to the forwarding engine wrapped as a Phase IV packet.
    Forward {
        dst: NodeAddr,
        src: NodeAddr,
        visit: u8,
        payload: &'a [u8],
    },
    /// Reflect this reply back to the neighbor.
    Bounce(FrameBuf),
    Drop,
}

/// Receive-side intercept: wrap a Phase II packet so the Phase IV
/// forwarding engine can carry it, or synthesize an unreachable
/// bounce.
pub(crate) fn recv<'a>(
    mode: InterceptMode,
    ctx: &mut Ctx<'_>,
    adj: &Adjacency,
    pkt: P2Packet<'a>,
) -> P2Rx<'a> {
    let full = !matches!(mode, InterceptMode::None) && adj.rint;
    match pkt {
        P2Packet::Bare(payload) => P2Rx::Forward {
            dst: ctx.cfg.id,
            src: adj.nodeid,
            visit: if full { 1 } else { 0 },
            payload,
        },
        P2Packet::Routed(hdr) => {
            // Empty names default to the obvious parties
            let srcname = if hdr.srcnode.is_empty() {
                adj.rnodename.as_str()
            } else {
                hdr.srcnode
            };
            let dstname = if hdr.dstnode.is_empty() {
                ctx.cfg.name.as_str()
            } else {
                hdr.dstnode
            };

            if srcname != adj.rnodename.as_str() {
                return bounce(ctx, adj, hdr.payload, srcname, dstname, false);
            }
            let dst = if full {
                match lookup(ctx, dstname) {
                    Some(dst) => dst,
                    None => return bounce(ctx, adj, hdr.payload, srcname, dstname, false),
                }
            } else if dstname == ctx.cfg.name.as_str() {
                ctx.cfg.id
            } else {
                return bounce(ctx, adj, hdr.payload, srcname, dstname, false);
            };

            P2Rx::Forward {
                dst,
                src: adj.nodeid,
                visit: if full { 1 } else { 0 },
                payload: hdr.payload,
            }
        }
    }
}

fn lookup(ctx: &Ctx<'_>, name: &str) -> Option<NodeAddr> {
    if name == ctx.cfg.name.as_str() {
        Some(ctx.cfg.id)
    } else {
        ctx.db.by_name(name)
    }
}

/// What send-side intercept produced.
pub enum P2Tx {
    /// Deliverable; transmit this frame on the adjacency.
    Send(FrameBuf),
    /// Not deliverable to this neighbor; treat as unreachable.
    Unreachable,
    Drop,
}

/// Send-side intercept: strip the Phase IV header, prefix a route
/// header when the packet originated elsewhere and the neighbor asked
/// for intercept, and turn returned-to-sender packets into NSP
/// Disconnect Confirms.
pub(crate) fn send(
    mode: InterceptMode,
    ctx: &mut Ctx<'_>,
    adj: &Adjacency,
    pkt: &DataPkt<'_>,
) -> P2Tx {
    if pkt.rts {
        let src = name_of(ctx, pkt.srcnode);
        let dst = name_of(ctx, pkt.dstnode);
        return match make_dc(ctx, adj, pkt.payload, &src, &dst, true) {
            Some(frame) => P2Tx::Send(frame),
            None => P2Tx::Drop,
        };
    }
    if pkt.dstnode != adj.nodeid {
        return P2Tx::Unreachable;
    }
    if pkt.srcnode == ctx.cfg.id {
        // Neighbor traffic from this node travels bare
        return match FrameBuf::from_slice(pkt.payload) {
            Ok(f) => P2Tx::Send(f),
            Err(_) => P2Tx::Drop,
        };
    }
    if matches!(mode, InterceptMode::None) || !adj.rint {
        return P2Tx::Unreachable;
    }

    let src = name_of(ctx, pkt.srcnode);
    let dst = name_of(ctx, pkt.dstnode);
    let hdr = RouteHdr {
        dstnode: &dst,
        srcnode: &src,
        payload: pkt.payload,
    };
    let mut buf = [0u8; crate::MTU];
    match hdr.encode(&mut buf) {
        Ok(encoded) => match FrameBuf::from_slice(encoded) {
            Ok(f) => P2Tx::Send(f),
            Err(_) => P2Tx::Drop,
        },
        Err(_) => P2Tx::Drop,
    }
}

fn name_of(ctx: &Ctx<'_>, addr: NodeAddr) -> heapless::String<6> {
    let mut s = heapless::String::new();
    if let Some(name) = ctx.db.name_of(addr) {
        let _ = s.push_str(name);
    }
    s
}

fn bounce<'a>(
    ctx: &mut Ctx<'_>,
    adj: &Adjacency,
    nsp: &[u8],
    srcname: &str,
    dstname: &str,
    rts: bool,
) -> P2Rx<'a> {
    log::trace!(
        "intercept bounce for {} -> {} on {:?}",
        srcname,
        dstname,
        adj.circuit
    );
    match make_dc(ctx, adj, nsp, srcname, dstname, rts) {
        Some(frame) => P2Rx::Bounce(frame),
        None => P2Rx::Drop,
    }
}

/// Build a Disconnect Confirm (reason: unreachable) answering `nsp`,
/// wrapped in a route header when the neighbor requested intercept.
/// Replying to a Disconnect Confirm makes no sense; those yield None.
fn make_dc(
    _ctx: &mut Ctx<'_>,
    adj: &Adjacency,
    nsp: &[u8],
    srcname: &str,
    dstname: &str,
    rts: bool,
) -> Option<FrameBuf> {
    if nsp.len() < 5 || nsp[0] == DISCCONF_MSGFLG {
        return None;
    }
    // NSP messages lead with msgflg, destination link address,
    // source link address; the reply swaps the link addresses
    let dstaddr = u16::from_le_bytes([nsp[1], nsp[2]]);
    let srcaddr = u16::from_le_bytes([nsp[3], nsp[4]]);

    let mut dc = [0u8; 7];
    dc[0] = DISCCONF_MSGFLG;
    dc[1..3].copy_from_slice(&srcaddr.to_le_bytes());
    dc[3..5].copy_from_slice(&dstaddr.to_le_bytes());
    dc[5..7].copy_from_slice(&UNREACH.to_le_bytes());

    if adj.rint {
        // The reply route header goes back toward the origin; for a
        // returned packet the addresses already point that way
        let (d, s) = if rts {
            (dstname, srcname)
        } else {
            (srcname, dstname)
        };
        let hdr = RouteHdr {
            dstnode: d,
            srcnode: s,
            payload: &dc,
        };
        let mut buf = [0u8; 64];
        let encoded = hdr.encode(&mut buf).ok()?;
        FrameBuf::from_slice(encoded).ok()
    } else {
        FrameBuf::from_slice(&dc).ok()
    }
}
