//! The Ethernet loopback protocol: skip-count frames with forward
//! chains and a receipt-correlated reply.

use dnet_wire::addr::LOOP_MC;
use dnet_wire::mop::{build_loop, LoopBody, LoopSkip};
use dnet_wire::EthAddr;

use super::{MopCircuit, Requester};
use crate::work::{self, Action, MopResponse, Port};
use crate::{Ctx, Error};

/// Pattern carried in loop data; anything echoes, this is
/// recognizable in captures.
const LOOP_DATA: &[u8] = b"dnet loop ";

/// A frame arrived on the loop port.
pub(crate) fn receive(mop: &mut MopCircuit, ctx: &mut Ctx<'_>, src: EthAddr, frame: &[u8]) {
    let Ok(skip) = LoopSkip::decode(frame) else {
        return;
    };
    let Ok(body) = skip.body() else {
        return;
    };
    match LoopBody::decode(body) {
        Ok(LoopBody::Fwd { dest }) => {
            if dest.is_multicast() {
                return;
            }
            // Peel our hop off by bumping the skip count past the
            // forward header
            let bumped = LoopSkip {
                skip: skip.skip + 8,
                payload: skip.payload,
            };
            let mut buf = [0u8; crate::MTU];
            if let Ok(encoded) = bumped.encode(&mut buf) {
                if let Some(out) = work::frame(encoded) {
                    work::push_action(
                        ctx.actions,
                        Action::Send {
                            circuit: mop.circuit,
                            port: Port::MopLoop,
                            dest: Some(dest),
                            frame: out,
                        },
                    );
                }
            }
        }
        Ok(LoopBody::Reply { receipt, .. }) => {
            if let Some(Requester::Api) = mop.requests.remove(&receipt) {
                work::push_action(
                    ctx.actions,
                    Action::MopResponse {
                        circuit: mop.circuit,
                        receipt,
                        response: MopResponse::LoopReply { src },
                    },
                );
            }
        }
        Err(_) => (),
    }
}

/// Launch a loop exchange.  `dests` is the hop list (at most three
/// forwarders); the frame travels to `dests[0]` first, through the
/// rest, and lands back here as a reply.  An empty list multicasts to
/// the loopback assistance address.
pub(crate) fn start(
    mop: &MopCircuit,
    ctx: &mut Ctx<'_>,
    dests: &[EthAddr],
    our_mac: EthAddr,
    receipt: u16,
) -> Result<(), Error> {
    if dests.len() > 3 {
        return Err(Error::InvalidOperation);
    }
    let first = dests.first().copied().unwrap_or(LOOP_MC);
    if first != LOOP_MC && dests.iter().any(|d| d.is_multicast()) {
        return Err(Error::InvalidOperation);
    }

    // Remaining hops forward toward us; we are always the last hop
    let mut chain: heapless::Vec<EthAddr, 4> = heapless::Vec::new();
    for d in dests.iter().skip(1) {
        let _ = chain.push(*d);
    }
    let _ = chain.push(our_mac);

    let mut data = [0u8; 96];
    for (i, b) in data.iter_mut().enumerate() {
        *b = LOOP_DATA[i % LOOP_DATA.len()];
    }

    let mut buf = [0u8; crate::MTU];
    let encoded = build_loop(&chain, receipt, &data, &mut buf).map_err(Error::Wire)?;
    if let Some(frame) = work::frame(encoded) {
        work::push_action(
            ctx.actions,
            Action::Send {
                circuit: mop.circuit,
                port: Port::MopLoop,
                dest: Some(first),
                frame,
            },
        );
    }
    Ok(())
}
