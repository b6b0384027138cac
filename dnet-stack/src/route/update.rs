//! The routing update process: one instance per circuit per level.
//!
//! Keeps the SRM ("send routing message") bitmap, schedules triggered
//! updates behind the T2 hold-off, sends complete updates every T1,
//! and segments messages to the neighbor block size with the small-gap
//! rule (up to two unflagged entries ride along rather than opening a
//! new segment).

use dnet_timer::TimerId;
use dnet_wire::route::{UpdateBuilder, UpdateKind};
use dnet_wire::NodeAddr;

use crate::work::{self, Action, FrameBuf, Port, TimerOwner, UpdateLevel};
use crate::{CircuitId, Ctx, Wheel, T2};

/// SRM bitmap sized for the level 1 id space; level 2 uses a prefix.
const SRM_BYTES: usize = 128;

pub(crate) struct UpdateProc {
    pub circuit: CircuitId,
    pub level: UpdateLevel,
    pub t1: u32,
    pub timer: TimerId,
    srm: [u8; SRM_BYTES],
    anysrm: bool,
    holdoff: bool,
    lastupdate: u64,
    lastfull: u64,
    startpos: usize,
}

impl UpdateProc {
    pub fn new(
        timers: &mut Wheel,
        circuit: CircuitId,
        level: UpdateLevel,
        t1: u32,
    ) -> Option<Self> {
        let timer = timers.alloc(TimerOwner::Update(circuit, level)).ok()?;
        // First complete update after one T1 period
        let _ = timers.start(timer, t1);

        Some(Self {
            circuit,
            level,
            t1,
            timer,
            srm: [0; SRM_BYTES],
            anysrm: false,
            holdoff: false,
            lastupdate: 0,
            lastfull: 0,
            startpos: 0,
        })
    }

    /// Flag `start..=end` for advertisement and schedule a triggered
    /// update no earlier than T2 after the previous transmission.
    pub fn setsrm(&mut self, ctx: &mut Ctx<'_>, start: u16, end: u16) {
        for i in start..=end.min(SRM_BYTES as u16 * 8 - 1) {
            self.srm[(i / 8) as usize] |= 1 << (i % 8);
        }
        self.anysrm = true;
        if !self.holdoff {
            let since = ctx.now.saturating_sub(self.lastupdate);
            let delta = (T2 as u64).saturating_sub(since) as u32;
            self.holdoff = true;
            ctx.start_timer(self.timer, delta);
        }
    }

    fn srm_bit(&self, i: u16) -> bool {
        self.srm[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    fn clear_srm(&mut self, i: u16) {
        self.srm[(i / 8) as usize] &= !(1 << (i % 8));
    }

    /// Timer expiry: emit an update batch and rearm.
    ///
    /// `kind` is the wire format for this neighbor, `lowid`/`highid`
    /// the id range, `minhops`/`mincost` the advertised rows,
    /// `blksize` the neighbor block-size limit, and `dest` the LAN
    /// multicast (None on point-to-point).  Passing `kind = None`
    /// skips this cycle (no eligible neighbor).
    #[allow(clippy::too_many_arguments)]
    pub fn expired(
        &mut self,
        ctx: &mut Ctx<'_>,
        kind: Option<UpdateKind>,
        lowid: u16,
        highid: u16,
        minhops: &[u8],
        mincost: &[u16],
        blksize: u16,
        dest: Option<dnet_wire::EthAddr>,
    ) {
        self.holdoff = false;
        let Some(kind) = kind else {
            return;
        };

        let complete = !self.anysrm;
        let srcnode = ctx.cfg.id;
        let mut frames: heapless::Vec<FrameBuf, 8> = heapless::Vec::new();
        let highid = highid.min(minhops.len() as u16 - 1);

        if matches!(kind, UpdateKind::Phase3) {
            // Unsegmented, always complete from id 1
            let mut buf = [0u8; crate::MTU];
            if let Ok(mut b) = UpdateBuilder::new(kind, srcnode, &mut buf) {
                for i in 1..=highid {
                    self.clear_srm(i);
                    if b.entry(minhops[i as usize], mincost[i as usize]).is_err() {
                        break;
                    }
                }
                if let Ok(encoded) = b.finish() {
                    if let Some(f) = work::frame(encoded) {
                        let _ = frames.push(f);
                    }
                }
            }
        } else {
            self.build_segmented(kind, srcnode, lowid, highid, complete, minhops, mincost,
                blksize, &mut frames);
        }

        // Rotate the batch so a tight block size cannot starve the
        // high destinations
        if !frames.is_empty() {
            self.startpos = (self.startpos + 1) % frames.len();
            for idx in 0..frames.len() {
                let f = frames[(idx + self.startpos) % frames.len()].clone();
                work::push_action(
                    ctx.actions,
                    Action::Send {
                        circuit: self.circuit,
                        port: Port::Routing,
                        dest,
                        frame: f,
                    },
                );
            }
        }

        self.lastupdate = ctx.now;
        let delta = if self.anysrm {
            (self.lastupdate - self.lastfull).min(self.t1 as u64) as u32
        } else {
            self.lastfull = self.lastupdate;
            self.t1
        };
        ctx.start_timer(self.timer, delta);
        self.anysrm = false;
    }

    #[allow(clippy::too_many_arguments)]
    fn build_segmented(
        &mut self,
        kind: UpdateKind,
        srcnode: NodeAddr,
        lowid: u16,
        highid: u16,
        complete: bool,
        minhops: &[u8],
        mincost: &[u16],
        blksize: u16,
        frames: &mut heapless::Vec<FrameBuf, 8>,
    ) {
        let mut ids: heapless::Vec<u16, 1024> = heapless::Vec::new();
        for i in lowid..=highid {
            if complete || self.srm_bit(i) {
                self.clear_srm(i);
                if ids.push(i).is_err() {
                    break;
                }
            }
        }

        let mtu = (blksize as usize).saturating_sub(16).min(crate::MTU - 2);
        let mut pos = 0;
        while pos < ids.len() {
            let mut buf = [0u8; crate::MTU];
            let Ok(mut b) = UpdateBuilder::new(kind, srcnode, &mut buf) else {
                return;
            };
            let mut in_segment = false;
            let mut previd: i32 = i32::MIN;
            let frame_start = pos;

            while pos < ids.len() && b.len() <= mtu {
                let i = ids[pos];
                let gap = i as i32 - previd;
                if in_segment && gap <= 3 {
                    // Small gap: ride the unflagged entries along
                    // instead of opening a new segment
                    for j in (previd + 1) as u16..i {
                        if b.entry(minhops[j as usize], mincost[j as usize]).is_err() {
                            break;
                        }
                    }
                } else if b.start_segment(i).is_err() {
                    break;
                } else {
                    in_segment = true;
                }
                if b.entry(minhops[i as usize], mincost[i as usize]).is_err() {
                    break;
                }
                previd = i as i32;
                pos += 1;
            }

            if pos == frame_start {
                // Could not place a single entry; give up rather than
                // spin
                return;
            }
            if let Ok(encoded) = b.finish() {
                if let Some(f) = work::frame(encoded) {
                    if frames.push(f).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
