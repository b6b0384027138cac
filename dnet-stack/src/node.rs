//! The node: owner of the work queue, the timer wheel, the node
//! database and every protocol component.  One logical thread
//! dispatches everything; producers (datalink receive paths, the
//! clock, the embedder API) post work and drain actions.

use dnet_wire::{EthAddr, NodeAddr, NodeType};

use rand_core::RngCore;

use crate::adjacency::AdjTable;
use crate::db::NodeDb;
use crate::events::{Event, EventCode, EventLog, Reason};
use crate::lan::{self, LanCircuit};
use crate::mop::{self, MopCircuit};
use crate::ptp::{self, PtpCircuit, PtpState};
use crate::route::{DataPkt, Routing};
use crate::work::{
    self, Action, ActionQueue, Port, TimerOwner, Work, WorkQueue,
};
use crate::{
    CircuitConfig, CircuitId, CircuitCounters, Ctx, Error, ExecCounters, NodeConfig, Phase,
    Wheel, MAX_CIRCUITS,
};

pub enum CircuitKind {
    Ptp(PtpCircuit),
    Lan(LanCircuit),
}

pub struct Circuit {
    pub id: CircuitId,
    pub name: heapless::String<16>,
    pub kind: CircuitKind,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum NodeState {
    Off,
    On,
}

pub struct Node<R: RngCore> {
    pub cfg: NodeConfig,
    state: NodeState,
    now: u64,
    timers: Wheel,
    queue: WorkQueue,
    actions: ActionQueue,
    events: EventLog,
    db: NodeDb,
    counters: ExecCounters,
    circ_counters: [CircuitCounters; MAX_CIRCUITS],
    circuits: heapless::Vec<Circuit, MAX_CIRCUITS>,
    adjacencies: AdjTable,
    routing: Routing,
    mop: heapless::Vec<MopCircuit, MAX_CIRCUITS>,
    rng: R,
}

macro_rules! split {
    ($self:ident) => {{
        let Node {
            cfg,
            now,
            timers,
            queue,
            actions,
            events,
            db,
            counters,
            circ_counters,
            circuits,
            adjacencies,
            routing,
            mop,
            rng,
            ..
        } = $self;
        (
            Ctx {
                cfg,
                now: *now,
                timers,
                actions,
                queue,
                events,
                db,
                counters,
                circ_counters,
            },
            circuits,
            adjacencies,
            routing,
            mop,
            rng,
        )
    }};
}

impl<R: RngCore> Node<R> {
    pub fn new(cfg: NodeConfig, rng: R) -> Self {
        let ntype = cfg.ntype;
        let routing = Routing::new(
            ntype,
            cfg.maxhops,
            cfg.maxcost,
            cfg.amaxhops,
            cfg.amaxcost,
            cfg.intercept,
        );
        Self {
            cfg,
            state: NodeState::Off,
            now: 0,
            timers: Wheel::new(),
            queue: WorkQueue::new(),
            actions: ActionQueue::new(),
            events: EventLog::new(),
            db: NodeDb::new(),
            counters: ExecCounters::default(),
            circ_counters: [CircuitCounters::default(); MAX_CIRCUITS],
            circuits: heapless::Vec::new(),
            adjacencies: AdjTable::new(),
            routing,
            mop: heapless::Vec::new(),
            rng,
        }
    }

    fn next_id(&self) -> Result<CircuitId, Error> {
        if self.circuits.is_full() {
            Err(Error::QueueFull)
        } else {
            Ok(CircuitId(self.circuits.len() as u8))
        }
    }

    /// Attach a point-to-point circuit.
    pub fn attach_ptp(&mut self, name: &str, cfg: CircuitConfig) -> Result<CircuitId, Error> {
        let id = self.next_id()?;
        let state_timer = self.timers.alloc(TimerOwner::CircuitState(id))?;
        let hello_timer = self.timers.alloc(TimerOwner::Hello(id))?;
        let t1 = cfg.t1.unwrap_or(self.cfg.t1) as u32;
        let cost = cfg.cost;
        let ptp = PtpCircuit::new(cfg, state_timer, hello_timer);

        let mut cname = heapless::String::new();
        let _ = cname.push_str(name);
        let _ = self.circuits.push(Circuit {
            id,
            name: cname,
            kind: CircuitKind::Ptp(ptp),
        });
        self.routing
            .register_circuit(&mut self.timers, id, cost, false, t1);
        Ok(id)
    }

    /// Attach a broadcast circuit.  Runs MOP services unless disabled
    /// in the circuit config.
    pub fn attach_lan(&mut self, name: &str, cfg: CircuitConfig) -> Result<CircuitId, Error> {
        if self.cfg.phase != Phase::Phase4 {
            return Err(Error::InvalidOperation);
        }
        let id = self.next_id()?;
        let hello_timer = self.timers.alloc(TimerOwner::Hello(id))?;
        let dr_timer = self.timers.alloc(TimerOwner::DrDelay(id))?;
        let t1 = cfg.t1.unwrap_or(self.cfg.bct1) as u32;
        let cost = cfg.cost;
        let use_mop = cfg.mop;
        let console = cfg.console_verification;
        let lan = LanCircuit::new(cfg, hello_timer, dr_timer, self.cfg.ntype.is_router());

        let mut cname = heapless::String::new();
        let _ = cname.push_str(name);
        let _ = self.circuits.push(Circuit {
            id,
            name: cname,
            kind: CircuitKind::Lan(lan),
        });
        self.routing
            .register_circuit(&mut self.timers, id, cost, true, t1);
        if use_mop {
            if let Some(m) = MopCircuit::new(&mut self.timers, id, console) {
                let _ = self.mop.push(m);
            }
        }
        Ok(id)
    }

    /// Bring the node up, components in order: datalinks (circuits),
    /// then MOP, then routing.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.cfg.ntype == NodeType::Endnode && self.circuits.len() != 1 {
            return Err(Error::InvalidOperation);
        }
        self.state = NodeState::On;
        let (mut ctx, circuits, adjs, routing, mop, rng) = split!(self);
        for c in circuits.iter_mut() {
            match &mut c.kind {
                CircuitKind::Ptp(p) => ptp::start(c.id, p, &mut ctx),
                CircuitKind::Lan(l) => lan::start(c.id, l, &mut ctx, adjs),
            }
        }
        for m in mop.iter_mut() {
            mop::start(m, &mut ctx, &mut *rng);
        }
        routing.start(&mut ctx, adjs);
        ctx.events.log(
            Event::new(EventCode::NodeState).reason(Reason::OperatorCommand),
        );
        Ok(())
    }

    /// Stop the node, reversing the start order: routing, then MOP,
    /// then the circuits in reverse attach order.
    pub fn stop(&mut self) {
        let (mut ctx, circuits, adjs, routing, mop, _rng) = split!(self);
        routing.stop(&mut ctx);
        for m in mop.iter_mut() {
            mop::stop(m, &mut ctx);
        }
        for c in circuits.iter_mut().rev() {
            match &mut c.kind {
                CircuitKind::Ptp(p) => ptp::stop(c.id, p, &mut ctx, adjs, routing),
                CircuitKind::Lan(l) => lan::stop(c.id, l, &mut ctx, adjs),
            }
        }
        ctx.events.log(
            Event::new(EventCode::NodeState).reason(Reason::OperatorCommand),
        );
        work::push_action(ctx.actions, Action::Stopped);
        self.state = NodeState::Off;
    }

    /// Post a work item; producers call this, the dispatch loop
    /// drains it.
    pub fn post(&mut self, work: Work) -> Result<(), Error> {
        self.queue.push_back(work).map_err(|_| Error::QueueFull)
    }

    /// Dispatch queued work until the queue is empty.
    pub fn run_pending(&mut self) {
        while let Some(work) = self.queue.pop_front() {
            self.dispatch(work);
        }
    }

    /// Advance the clock one second: deliver timer expirations
    /// through the work queue, then dispatch.
    pub fn tick(&mut self) {
        self.now += 1;
        let Node { timers, queue, .. } = self;
        timers.tick(|owner| {
            let _ = queue.push_back(Work::Timeout { owner });
        });
        self.run_pending();
    }

    /// Next pending outbound action, if any.
    pub fn poll_action(&mut self) -> Option<Action> {
        let action = self.actions.pop_front();
        if let Some(Action::Send { circuit, frame, .. }) = &action {
            let c = &mut self.circ_counters[circuit.0 as usize % MAX_CIRCUITS];
            c.pkts_sent += 1;
            c.bytes_sent += frame.len() as u64;
        }
        action
    }

    /// Next pending event record, if any.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop()
    }

    pub fn counters(&self) -> &ExecCounters {
        &self.counters
    }

    pub fn circuit_counters(&self, id: CircuitId) -> &CircuitCounters {
        &self.circ_counters[id.0 as usize % MAX_CIRCUITS]
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    pub fn nodedb(&mut self) -> &mut NodeDb {
        &mut self.db
    }

    /// Mark a point-to-point datalink as unable to detect remote
    /// restarts, enabling the init-replay workaround.
    pub fn set_start_works(&mut self, id: CircuitId, start_works: bool) {
        if let Some(c) = self.circuits.iter_mut().find(|c| c.id == id) {
            if let CircuitKind::Ptp(p) = &mut c.kind {
                p.start_works = start_works;
            }
        }
    }

    /// Record the adapter hardware address a MOP circuit announces.
    pub fn set_mop_hwaddr(&mut self, id: CircuitId, hwaddr: EthAddr) {
        if let Some(m) = self.mop.iter_mut().find(|m| m.circuit == id) {
            m.hwaddr = hwaddr;
        }
    }

    /// Originate an NSP payload toward `dest`.  `rqr` requests return
    /// to sender; `tryhard` bypasses the endnode previous-hop cache
    /// (used for retransmissions).
    pub fn nsp_send(&mut self, dest: NodeAddr, data: &[u8], rqr: bool, tryhard: bool) {
        if self.state != NodeState::On {
            return;
        }
        let (mut ctx, circuits, adjs, routing, _mop, _rng) = split!(self);

        if dest == ctx.cfg.id {
            // Addressed to self: straight back up
            if let Some(frame) = work::frame(data) {
                work::push_action(
                    ctx.actions,
                    Action::Deliver {
                        src: dest,
                        rts: false,
                        data: frame,
                    },
                );
            }
            return;
        }

        if routing.is_router() || ctx.cfg.ntype == NodeType::Phase2 {
            routing.originate(&mut ctx, adjs, dest, data, rqr);
            return;
        }

        // Endnode: one circuit carries everything
        let Some(c) = circuits.first_mut() else { return };
        match &mut c.kind {
            CircuitKind::Lan(l) => {
                lan::endnode_send(c.id, l, &mut ctx, adjs, dest, data, rqr, tryhard)
            }
            CircuitKind::Ptp(p) => {
                if p.state != PtpState::Running {
                    return;
                }
                if !p.ntype.is_router() && dest != p.nodeid {
                    log::debug!("sending to {} but neighbor is {}", dest, p.nodeid);
                    return;
                }
                if let Some(aid) = p.adj {
                    let pkt = DataPkt {
                        rqr,
                        rts: false,
                        ie: false,
                        dstnode: dest,
                        srcnode: ctx.cfg.id,
                        visit: 0,
                        payload: data,
                    };
                    ctx.circ_counter(c.id).orig_sent += 1;
                    routing.adj_send(&mut ctx, adjs, aid, &pkt);
                }
            }
        }
    }

    fn dispatch(&mut self, work: Work) {
        match work {
            Work::Received {
                circuit,
                port,
                src,
                frame,
            } => {
                {
                    let c = &mut self.circ_counters[circuit.0 as usize % MAX_CIRCUITS];
                    c.pkts_recv += 1;
                    c.bytes_recv += frame.len() as u64;
                }
                match port {
                    Port::Routing => self.rx_routing(circuit, src, &frame),
                    Port::MopConsole => self.rx_mop(circuit, src, &frame, false),
                    Port::MopLoop => self.rx_mop(circuit, src, &frame, true),
                }
            }
            Work::DlStatus { circuit, up } => {
                let (mut ctx, circuits, adjs, routing, _mop, _rng) = split!(self);
                if let Some(c) = circuits.iter_mut().find(|c| c.id == circuit) {
                    if let CircuitKind::Ptp(p) = &mut c.kind {
                        ptp::dl_status(circuit, p, &mut ctx, adjs, routing, up);
                    }
                }
            }
            Work::Timeout { owner } => self.timeout(owner),
            Work::Shutdown => self.stop(),
        }
    }

    fn rx_routing(&mut self, circuit: CircuitId, src: EthAddr, frame: &[u8]) {
        let (mut ctx, circuits, adjs, routing, _mop, _rng) = split!(self);
        let Some(c) = circuits.iter_mut().find(|c| c.id == circuit) else {
            return;
        };
        match &mut c.kind {
            CircuitKind::Ptp(p) => ptp::receive(circuit, p, &mut ctx, adjs, routing, frame),
            CircuitKind::Lan(l) => {
                lan::receive(circuit, l, &mut ctx, adjs, routing, src, frame)
            }
        }
    }

    fn rx_mop(&mut self, circuit: CircuitId, src: EthAddr, frame: &[u8], looped: bool) {
        let (mut ctx, _circuits, _adjs, _routing, mop, rng) = split!(self);
        let Some(m) = mop.iter_mut().find(|m| m.circuit == circuit) else {
            return;
        };
        if looped {
            mop::looper::receive(m, &mut ctx, src, frame);
        } else {
            mop::receive(m, &mut ctx, rng, src, frame);
        }
    }

    fn timeout(&mut self, owner: TimerOwner) {
        let (mut ctx, circuits, adjs, routing, mop, rng) = split!(self);
        match owner {
            TimerOwner::CircuitState(cid) => {
                if let Some(c) = circuits.iter_mut().find(|c| c.id == cid) {
                    if let CircuitKind::Ptp(p) = &mut c.kind {
                        ptp::timeout(cid, p, &mut ctx, adjs, routing);
                    }
                }
            }
            TimerOwner::Hello(cid) => {
                if let Some(c) = circuits.iter_mut().find(|c| c.id == cid) {
                    match &mut c.kind {
                        CircuitKind::Ptp(p) => ptp::hello_timeout(cid, p, &mut ctx),
                        CircuitKind::Lan(l) => lan::hello_timeout(cid, l, &mut ctx, adjs),
                    }
                }
            }
            TimerOwner::DrDelay(cid) => {
                if let Some(c) = circuits.iter_mut().find(|c| c.id == cid) {
                    if let CircuitKind::Lan(l) = &mut c.kind {
                        lan::dr_timeout(cid, l, &mut ctx, adjs);
                    }
                }
            }
            TimerOwner::Adjacency(aid) => {
                let Some(adj) = adjs.get(aid) else { return };
                let cid = adj.circuit;
                if let Some(c) = circuits.iter_mut().find(|c| c.id == cid) {
                    match &mut c.kind {
                        CircuitKind::Lan(l) => {
                            lan::adj_timeout(cid, l, &mut ctx, adjs, routing, aid)
                        }
                        CircuitKind::Ptp(p) => {
                            // Listen timeout on the single neighbor
                            ptp::timeout(cid, p, &mut ctx, adjs, routing)
                        }
                    }
                }
            }
            TimerOwner::PrevHop(cid, id) => {
                if let Some(c) = circuits.iter_mut().find(|c| c.id == cid) {
                    if let CircuitKind::Lan(l) = &mut c.kind {
                        lan::prevhop_expire(l, &mut ctx, id);
                    }
                }
            }
            TimerOwner::Update(cid, level) => {
                routing.update_timeout(&mut ctx, adjs, cid, level);
            }
            TimerOwner::SysId(cid) => {
                if let Some(m) = mop.iter_mut().find(|m| m.circuit == cid) {
                    mop::sysid_timeout(m, &mut ctx, rng);
                }
            }
            TimerOwner::CarrierClient(cid) => {
                if let Some(m) = mop.iter_mut().find(|m| m.circuit == cid) {
                    mop::client_timeout(m, &mut ctx, rng);
                }
            }
            TimerOwner::CarrierServer(cid) => {
                if let Some(m) = mop.iter_mut().find(|m| m.circuit == cid) {
                    mop::server_timeout(m, &mut ctx);
                }
            }
        }
    }

    // ---- MOP API ----

    fn with_mop<T>(
        &mut self,
        circuit: CircuitId,
        f: impl FnOnce(&mut MopCircuit, &mut Ctx<'_>, &mut dyn RngCore) -> T,
    ) -> Result<T, Error> {
        let (mut ctx, _circuits, _adjs, _routing, mop, rng) = split!(self);
        let m = mop
            .iter_mut()
            .find(|m| m.circuit == circuit)
            .ok_or(Error::NoCircuit)?;
        Ok(f(m, &mut ctx, rng))
    }

    /// Ask `dest` for its SysId; the reply surfaces as an action.
    pub fn mop_request_id(&mut self, circuit: CircuitId, dest: EthAddr) -> Result<u16, Error> {
        self.with_mop(circuit, |m, ctx, rng| mop::request_id(m, ctx, rng, dest))?
    }

    /// Ask `dest` for its datalink counters.
    pub fn mop_request_counters(
        &mut self,
        circuit: CircuitId,
        dest: EthAddr,
    ) -> Result<u16, Error> {
        self.with_mop(circuit, |m, ctx, rng| {
            mop::request_counters(m, ctx, rng, dest)
        })?
    }

    /// Launch a loop exchange through up to three forwarders.
    pub fn mop_loop(&mut self, circuit: CircuitId, dests: &[EthAddr]) -> Result<u16, Error> {
        let station = self.cfg.station();
        self.with_mop(circuit, |m, ctx, rng| {
            mop::loop_start(m, ctx, rng, dests, station)
        })?
    }

    /// Abandon a pending exchange (the embedder's timeout policy).
    pub fn mop_cancel(&mut self, circuit: CircuitId, receipt: u16) {
        let _ = self.with_mop(circuit, |m, _ctx, _rng| m.cancel_request(receipt));
    }

    /// Open a console-carrier session.
    pub fn mop_console_connect(
        &mut self,
        circuit: CircuitId,
        dest: EthAddr,
        verification: [u8; 8],
    ) -> Result<(), Error> {
        self.with_mop(circuit, |m, ctx, rng| {
            mop::console_connect(m, ctx, rng, dest, verification)
        })?
    }

    /// Queue console keyboard input.
    pub fn mop_console_input(&mut self, circuit: CircuitId, data: &[u8]) -> Result<(), Error> {
        self.with_mop(circuit, |m, ctx, _rng| mop::console_input(m, ctx, data))
    }

    /// Close the console-carrier session.
    pub fn mop_console_close(&mut self, circuit: CircuitId) -> Result<(), Error> {
        self.with_mop(circuit, |m, ctx, _rng| mop::console_close(m, ctx))
    }

    /// Feed backend terminal output to the console-carrier server.
    pub fn mop_console_server_output(
        &mut self,
        circuit: CircuitId,
        data: &[u8],
    ) -> Result<(), Error> {
        self.with_mop(circuit, |m, _ctx, _rng| {
            mop::console_server_output(m, data)
        })
    }

    /// Stations heard from via SysId on a circuit.
    pub fn mop_heard(
        &self,
        circuit: CircuitId,
    ) -> impl Iterator<Item = (&EthAddr, &mop::SysIdRecord)> {
        self.mop
            .iter()
            .filter(move |m| m.circuit == circuit)
            .flat_map(|m| m.heard.iter())
    }

    /// For property checks: every Up adjacency to a periodic-hello
    /// neighbor must have its listen timer armed.
    pub fn check_adjacency_timers(&self) -> bool {
        self.adjacencies.iter().all(|(_, a)| {
            a.state != crate::adjacency::AdjState::Up
                || a.ntype == NodeType::Phase2
                || self.timers.is_armed(a.timer)
        })
    }

    /// The adjacency table, for status surfaces and tests.
    pub fn adjacencies(&self) -> &AdjTable {
        &self.adjacencies
    }

    /// Direct access to a circuit, for status surfaces and tests.
    pub fn circuit(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adjacency::AdjState;
    use crate::work::MopResponse;
    use dnet_wire::mop::{Counters, MopPacket, RequestCounters, SysId, SysIdFunctions};
    use dnet_wire::route::{
        EndnodeHello, LongData, PtpInit, RSent, RSlist, RoutePacket, RouterHello, ShortData,
        UpdateBuilder, UpdateKind, TESTDATA_FILL,
    };
    use dnet_wire::Version;

    struct TestRng(u64);

    impl RngCore for TestRng {
        fn next_u32(&mut self) -> u32 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0 as u32
        }

        fn next_u64(&mut self) -> u64 {
            ((self.next_u32() as u64) << 32) | self.next_u32() as u64
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for b in dest {
                *b = self.next_u32() as u8;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    fn node(id: NodeAddr, ntype: NodeType) -> Node<TestRng> {
        Node::new(NodeConfig::new(id, ntype), TestRng(0x1234_5678_9abc_def1))
    }

    fn rx(n: &mut Node<TestRng>, cid: CircuitId, port: Port, src: EthAddr, bytes: &[u8]) {
        n.post(Work::Received {
            circuit: cid,
            port,
            src,
            frame: work::frame(bytes).unwrap(),
        })
        .unwrap();
        n.run_pending();
    }

    fn sends(n: &mut Node<TestRng>) -> heapless::Vec<(CircuitId, Port, Option<EthAddr>, work::FrameBuf), 16>
    {
        let mut out = heapless::Vec::new();
        while let Some(a) = n.poll_action() {
            if let Action::Send {
                circuit,
                port,
                dest,
                frame,
            } = a
            {
                let _ = out.push((circuit, port, dest, frame));
            }
        }
        out
    }

    fn events(n: &mut Node<TestRng>) -> heapless::Vec<Event, 32> {
        let mut out = heapless::Vec::new();
        while let Some(e) = n.poll_event() {
            let _ = out.push(e);
        }
        out
    }

    fn peer_init(src: NodeAddr, ntype: NodeType) -> [u8; 12] {
        let init = PtpInit {
            srcnode: src,
            ntype,
            verif: false,
            blo: false,
            blksize: 528,
            tiver: Version::PH4,
            timer: 10,
        };
        let mut buf = [0u8; 12];
        init.encode(&mut buf).unwrap();
        buf
    }

    /// Attach and bring up a point-to-point circuit with a Phase IV
    /// router neighbor.
    fn ptp_up(n: &mut Node<TestRng>, neighbor: NodeAddr) -> CircuitId {
        let mut cfg = CircuitConfig::default();
        cfg.t3 = 10;
        let cid = n.attach_ptp("ptp-0", cfg).unwrap();
        n.start().unwrap();
        n.post(Work::DlStatus {
            circuit: cid,
            up: true,
        })
        .unwrap();
        n.run_pending();
        rx(
            n,
            cid,
            Port::Routing,
            EthAddr::NULL,
            &peer_init(neighbor, NodeType::L1Router),
        );
        cid
    }

    fn ptp_state(n: &Node<TestRng>, cid: CircuitId) -> PtpState {
        match &n.circuit(cid).unwrap().kind {
            CircuitKind::Ptp(p) => p.state,
            _ => panic!("not a ptp circuit"),
        }
    }

    #[test]
    fn ptp_phase4_bringup() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let mut cfg = CircuitConfig::default();
        cfg.t3 = 10;
        let cid = n.attach_ptp("ptp-0", cfg).unwrap();
        n.start().unwrap();

        // Datalink open requested; nothing sent yet
        assert!(matches!(n.poll_action(), Some(Action::OpenLink { .. })));
        assert_eq!(ptp_state(&n, cid), PtpState::DataLinkStart);

        n.post(Work::DlStatus {
            circuit: cid,
            up: true,
        })
        .unwrap();
        n.run_pending();
        assert_eq!(ptp_state(&n, cid), PtpState::RoutingInit);

        let out = sends(&mut n);
        assert_eq!(out.len(), 1);
        let frame = &out[0].3;
        assert_eq!(frame[0], 0x01);
        assert_eq!(&frame[1..3], &[0x02, 0x04]); // 1.2
        match RoutePacket::decode(frame).unwrap() {
            RoutePacket::PtpInit(i) => {
                assert_eq!(i.srcnode, NodeAddr::new(1, 2));
                assert_eq!(i.ntype, NodeType::L1Router);
                assert!(!i.verif);
                assert_eq!(i.timer, 10);
                assert_eq!(i.tiver, Version::PH4);
            }
            other => panic!("wrong init: {:?}", other),
        }

        // The peer's equivalent init brings the adjacency up
        rx(
            &mut n,
            cid,
            Port::Routing,
            EthAddr::NULL,
            &peer_init(NodeAddr::new(1, 3), NodeType::L1Router),
        );
        assert_eq!(ptp_state(&n, cid), PtpState::Running);
        let (_, adj) = n
            .adjacencies()
            .find(cid, NodeAddr::new(1, 3))
            .and_then(|aid| n.adjacencies().get(aid).map(|a| (aid, a)))
            .unwrap();
        assert_eq!(adj.ntype, NodeType::L1Router);
        assert_eq!(adj.state, AdjState::Up);
        assert!(n.check_adjacency_timers());
        let evs = events(&mut n);
        assert!(evs.iter().any(|e| e.code == EventCode::CircUp));

        // The first hello goes out after T3, 128 bytes of 0xAA
        drop(sends(&mut n));
        for _ in 0..10 {
            n.tick();
        }
        let out = sends(&mut n);
        let hello = out.iter().map(|s| &s.3).find(|f| f[0] == 0x05).unwrap();
        assert_eq!(&hello[1..3], &[0x02, 0x04]);
        assert_eq!(hello[3], 0x80);
        assert!(hello[4..132].iter().all(|b| *b == TESTDATA_FILL));
    }

    #[test]
    fn triggered_update_advertises_self() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = ptp_up(&mut n, NodeAddr::new(1, 3));
        drop(sends(&mut n));

        // The adjacency flagged everything; the T2 hold-off expires
        // on the next tick
        n.tick();
        let out = sends(&mut n);
        let updates: heapless::Vec<_, 16> = out
            .iter()
            .filter(|(c, _, _, f)| *c == cid && f[0] & 0x8f == 0x07)
            .collect();
        assert!(!updates.is_empty());

        let mut found_self = false;
        for (_, _, _, f) in &updates {
            let update = match RoutePacket::decode(f).unwrap() {
                RoutePacket::Routing(u) => u,
                other => panic!("wrong class: {:?}", other),
            };
            assert_eq!(update.kind, UpdateKind::Level1);
            assert_eq!(update.srcnode, NodeAddr::new(1, 2));
            for e in update.entries() {
                if e.id == 2 {
                    assert_eq!((e.hops, e.cost), (0, 0));
                    found_self = true;
                }
            }
        }
        assert!(found_self, "self row not advertised");
    }

    #[test]
    fn forward_increments_visit() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = ptp_up(&mut n, NodeAddr::new(1, 3));
        drop(sends(&mut n));

        // Neighbor advertises node 1.7
        let mut buf = [0u8; 64];
        let mut b = UpdateBuilder::new(UpdateKind::Level1, NodeAddr::new(1, 3), &mut buf).unwrap();
        b.start_segment(3).unwrap();
        b.entry(0, 0).unwrap(); // itself
        b.start_segment(7).unwrap();
        b.entry(1, 2).unwrap();
        let update = b.finish().unwrap();
        let update = work::frame(update).unwrap();
        rx(&mut n, cid, Port::Routing, EthAddr::NULL, &update);
        assert!(n.routing().reachable(1023, NodeAddr::new(1, 7)));

        // Transit packet to 1.7 leaves with visit + 1
        let data = ShortData {
            rqr: false,
            rts: false,
            dst: NodeAddr::new(1, 7),
            src: NodeAddr::new(1, 9),
            visit: 5,
            payload: b"transit",
        };
        let mut dbuf = [0u8; 32];
        let encoded = data.encode(&mut dbuf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        drop(sends(&mut n));
        rx(&mut n, cid, Port::Routing, EthAddr::NULL, &encoded);
        let out = sends(&mut n);
        let fwd = out.iter().find(|(_, _, _, f)| f[0] & 0x07 == 0x02).unwrap();
        let pkt = ShortData::decode(&fwd.3).unwrap();
        assert_eq!(pkt.visit, 6);
        assert_eq!(pkt.dst, NodeAddr::new(1, 7));
    }

    #[test]
    fn unreachable_returns_to_sender() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = ptp_up(&mut n, NodeAddr::new(1, 3));

        // Make the sender reachable so the bounce can route back
        let mut buf = [0u8; 64];
        let mut b = UpdateBuilder::new(UpdateKind::Level1, NodeAddr::new(1, 3), &mut buf).unwrap();
        b.start_segment(3).unwrap();
        b.entry(0, 0).unwrap();
        let update = b.finish().unwrap();
        let update = work::frame(update).unwrap();
        rx(&mut n, cid, Port::Routing, EthAddr::NULL, &update);
        drop(sends(&mut n));
        drop(events(&mut n));

        // Data for an unknown in-area id, return requested
        let data = ShortData {
            rqr: true,
            rts: false,
            dst: NodeAddr::new(1, 40),
            src: NodeAddr::new(1, 3),
            visit: 0,
            payload: b"\x60\x01\x00\x02\x00hello",
        };
        let mut dbuf = [0u8; 32];
        let encoded = data.encode(&mut dbuf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::Routing, EthAddr::NULL, &encoded);

        let out = sends(&mut n);
        assert_eq!(out.len(), 1);
        let pkt = ShortData::decode(&out[0].3).unwrap();
        assert!(pkt.rts);
        assert!(!pkt.rqr);
        assert_eq!(pkt.dst, NodeAddr::new(1, 3));
        assert_eq!(pkt.src, NodeAddr::new(1, 40));
        assert_eq!(n.counters().unreach_loss, 1);
        // Returned, not dropped: no drop event
        assert!(!events(&mut n)
            .iter()
            .any(|e| e.code == EventCode::UnreachDrop));
    }

    #[test]
    fn aged_drop_fires_at_visit_limit() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = ptp_up(&mut n, NodeAddr::new(1, 3));

        let mut buf = [0u8; 64];
        let mut b = UpdateBuilder::new(UpdateKind::Level1, NodeAddr::new(1, 3), &mut buf).unwrap();
        b.start_segment(7).unwrap();
        b.entry(1, 2).unwrap();
        let update = b.finish().unwrap();
        let update = work::frame(update).unwrap();
        rx(&mut n, cid, Port::Routing, EthAddr::NULL, &update);
        drop(sends(&mut n));
        drop(events(&mut n));

        let data = ShortData {
            rqr: false,
            rts: false,
            dst: NodeAddr::new(1, 7),
            src: NodeAddr::new(1, 9),
            visit: 32, // == default maxvisits
            payload: b"old",
        };
        let mut dbuf = [0u8; 16];
        let encoded = data.encode(&mut dbuf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::Routing, EthAddr::NULL, &encoded);

        assert!(sends(&mut n).is_empty());
        assert_eq!(n.counters().aged_loss, 1);
        assert!(events(&mut n).iter().any(|e| e.code == EventCode::AgedDrop));
    }

    fn router_hello(src: NodeAddr, prio: u8, listing: &[RSent]) -> work::FrameBuf {
        let hello = RouterHello {
            tiver: Version::PH4,
            id: src,
            ntype: NodeType::L1Router,
            blksize: 1498,
            prio,
            timer: 10,
            elist: RSlist::EMPTY,
        };
        let mut buf = [0u8; 256];
        let encoded = hello.encode(listing, &mut buf).unwrap();
        work::frame(encoded).unwrap()
    }

    #[test]
    fn lan_two_way_and_dr_election() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.start().unwrap();
        drop(sends(&mut n));
        drop(events(&mut n));

        let peer = NodeAddr::new(1, 3);
        let peer_mac = EthAddr::from_node(peer);

        // One-way hello: adjacency stays Init, no adjacency-up
        rx(
            &mut n,
            cid,
            Port::Routing,
            peer_mac,
            &router_hello(peer, 64, &[]),
        );
        let aid = n.adjacencies().find(cid, peer).unwrap();
        assert_eq!(n.adjacencies().get(aid).unwrap().state, AdjState::Init);
        assert!(!events(&mut n).iter().any(|e| e.code == EventCode::AdjUp));

        // The peer lists us: two-way, adjacency up, and the higher id
        // becomes DR
        let listing = [RSent {
            router: NodeAddr::new(1, 2),
            prio: 64,
            twoway: false,
        }];
        rx(
            &mut n,
            cid,
            Port::Routing,
            peer_mac,
            &router_hello(peer, 64, &listing),
        );
        assert_eq!(n.adjacencies().get(aid).unwrap().state, AdjState::Up);
        assert!(events(&mut n).iter().any(|e| e.code == EventCode::AdjUp));
        match &n.circuit(cid).unwrap().kind {
            CircuitKind::Lan(l) => {
                assert_eq!(l.dr, Some(aid));
                assert!(!l.isdr);
            }
            _ => unreachable!(),
        }

        // Our next hello lists the peer as two-way
        for _ in 0..2 {
            n.tick();
        }
        let out = sends(&mut n);
        let hello = out
            .iter()
            .find(|(_, _, _, f)| f[0] & 0x8f == 0x0b)
            .map(|(_, _, _, f)| RouterHello::decode(f).unwrap())
            .unwrap();
        let ent = hello.elist.iter().find(|e| e.router == peer).unwrap();
        assert!(ent.twoway);
    }

    #[test]
    fn dr_self_election_after_delay() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.start().unwrap();

        // Alone on the wire: the hello timeout runs the election, the
        // DRDELAY hold-off expires, and we claim the role
        for _ in 0..16 {
            n.tick();
        }
        match &n.circuit(cid).unwrap().kind {
            CircuitKind::Lan(l) => assert!(l.isdr),
            _ => unreachable!(),
        }

        // The DR's hellos also go to the endnodes
        drop(sends(&mut n));
        for _ in 0..10 {
            n.tick();
        }
        let out = sends(&mut n);
        assert!(out
            .iter()
            .any(|(_, _, d, f)| f[0] & 0x8f == 0x0b
                && *d == Some(dnet_wire::addr::ALL_ENDNODES)));
    }

    #[test]
    fn elist_wrong_priority_drops_adjacency() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.start().unwrap();

        let peer = NodeAddr::new(1, 3);
        let peer_mac = EthAddr::from_node(peer);
        let ours = [RSent {
            router: NodeAddr::new(1, 2),
            prio: 64,
            twoway: true,
        }];
        rx(
            &mut n,
            cid,
            Port::Routing,
            peer_mac,
            &router_hello(peer, 64, &ours),
        );
        assert!(n.adjacencies().find(cid, peer).is_some());
        drop(events(&mut n));

        // The neighbor now claims we run priority 32
        let wrong = [RSent {
            router: NodeAddr::new(1, 2),
            prio: 32,
            twoway: true,
        }];
        rx(
            &mut n,
            cid,
            Port::Routing,
            peer_mac,
            &router_hello(peer, 64, &wrong),
        );
        assert!(n.adjacencies().find(cid, peer).is_none());
        let evs = events(&mut n);
        assert!(evs
            .iter()
            .any(|e| e.code == EventCode::AdjDown
                && e.reason == Some(Reason::DataErrors)));
    }

    #[test]
    fn endnode_prevhop_cache() {
        let mut n = node(NodeAddr::new(1, 5), NodeType::Endnode);
        let cid = n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.start().unwrap();

        // A router appears and becomes our DR
        let dr = NodeAddr::new(1, 2);
        let dr_mac = EthAddr::from_node(dr);
        rx(
            &mut n,
            cid,
            Port::Routing,
            dr_mac,
            &router_hello(dr, 64, &[]),
        );
        drop(sends(&mut n));

        // Data from 2.1 arrives relayed through a different router
        let relay_mac = EthAddr::from_node(NodeAddr::new(1, 3));
        let data = LongData {
            rqr: false,
            rts: false,
            ie: false,
            dst: NodeAddr::new(1, 5),
            src: NodeAddr::new(2, 1),
            visit: 2,
            payload: b"nsp data",
        };
        let mut buf = [0u8; 64];
        let encoded = data.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::Routing, relay_mac, &encoded);

        let mut delivered = false;
        while let Some(a) = n.poll_action() {
            if let Action::Deliver { src, data, .. } = a {
                assert_eq!(src, NodeAddr::new(2, 1));
                assert_eq!(&data[..], b"nsp data");
                delivered = true;
            }
        }
        assert!(delivered);

        // Replies go straight to the cached previous hop
        n.nsp_send(NodeAddr::new(2, 1), b"reply", false, false);
        let out = sends(&mut n);
        assert_eq!(out.last().unwrap().2, Some(relay_mac));

        // After the 60 s TTL the cache entry is gone and the DR
        // carries the traffic.  The DR keeps announcing itself so its
        // own listen timer stays fresh.
        for i in 0..61 {
            if i % 20 == 0 {
                rx(
                    &mut n,
                    cid,
                    Port::Routing,
                    dr_mac,
                    &router_hello(dr, 64, &[]),
                );
            }
            n.tick();
        }
        drop(sends(&mut n));
        n.nsp_send(NodeAddr::new(2, 1), b"reply", false, false);
        let out = sends(&mut n);
        assert_eq!(out.last().unwrap().2, Some(dr_mac));
    }

    #[test]
    fn endnode_hello_carries_dr() {
        let mut n = node(NodeAddr::new(1, 5), NodeType::Endnode);
        let cid = n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.start().unwrap();

        let out = sends(&mut n);
        let hello = EndnodeHello::decode(&out[0].3).unwrap();
        assert!(hello.neighbor.is_null());
        assert!(hello.testdata_ok());

        let dr = NodeAddr::new(1, 2);
        rx(
            &mut n,
            cid,
            Port::Routing,
            EthAddr::from_node(dr),
            &router_hello(dr, 64, &[]),
        );
        for _ in 0..10 {
            n.tick();
        }
        let out = sends(&mut n);
        let hello = out
            .iter()
            .find(|(_, _, _, f)| f[0] & 0x8f == 0x0d)
            .map(|(_, _, _, f)| EndnodeHello::decode(f).unwrap())
            .unwrap();
        assert_eq!(hello.neighbor, EthAddr::from_node(dr));
    }

    #[test]
    fn mop_sysid_collect_and_counters() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.start().unwrap();
        drop(sends(&mut n));

        let peer_mac = EthAddr::new([0xAA, 0x00, 0x04, 0x00, 0x04, 0x04]);
        let mut functions = SysIdFunctions::default();
        functions.set(SysIdFunctions::LOOP, true);
        functions.set(SysIdFunctions::COUNTERS, true);
        let id = SysId {
            receipt: 0,
            version: Some(SysId::DEF_VERSION),
            functions,
            hwaddr: Some(EthAddr::new([2, 0, 0, 0, 0, 9])),
            ..Default::default()
        };
        let mut buf = [0u8; 128];
        let encoded = id.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::MopConsole, peer_mac, &encoded);

        let heard: heapless::Vec<_, 4> = n.mop_heard(cid).collect();
        assert_eq!(heard.len(), 1);
        assert_eq!(*heard[0].0, peer_mac);
        assert!(heard[0].1.functions.has(SysIdFunctions::COUNTERS));
        drop(heard);

        // Counters exchange correlates on the receipt
        let receipt = n.mop_request_counters(cid, peer_mac).unwrap();
        let out = sends(&mut n);
        let req = RequestCounters::decode(&out[0].3).unwrap();
        assert_eq!(req.receipt, receipt);
        assert_eq!(out[0].1, Port::MopConsole);

        let reply = Counters {
            receipt,
            time_since_zeroed: 5,
            pkts_recv: 100,
            ..Default::default()
        };
        let mut buf = [0u8; 128];
        let encoded = reply.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::MopConsole, peer_mac, &encoded);

        let mut got = false;
        while let Some(a) = n.poll_action() {
            if let Action::MopResponse {
                receipt: r,
                response: MopResponse::Counters(c),
                ..
            } = a
            {
                assert_eq!(r, receipt);
                assert_eq!(c.pkts_recv, 100);
                got = true;
            }
        }
        assert!(got);
    }

    #[test]
    fn mop_request_id_is_served() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.set_mop_hwaddr(cid, EthAddr::new([2, 0, 0, 0, 0, 1]));
        n.start().unwrap();

        let peer_mac = EthAddr::new([0xAA, 0x00, 0x04, 0x00, 0x04, 0x04]);
        let req = dnet_wire::mop::RequestId { receipt: 0x0777 };
        let mut buf = [0u8; 8];
        let encoded = req.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::MopConsole, peer_mac, &encoded);

        let out = sends(&mut n);
        let reply = out.iter().find(|(_, p, d, _)| {
            *p == Port::MopConsole && *d == Some(peer_mac)
        });
        let (_, _, _, frame) = reply.unwrap();
        match MopPacket::decode(frame).unwrap() {
            MopPacket::SysId(id) => {
                assert_eq!(id.receipt, 0x0777);
                assert!(id.functions.has(SysIdFunctions::LOOP));
                assert_eq!(id.hwaddr, Some(EthAddr::new([2, 0, 0, 0, 0, 1])));
            }
            other => panic!("wrong reply: {:?}", other),
        }
    }

    #[test]
    fn restart_workaround_replays_init() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = ptp_up(&mut n, NodeAddr::new(1, 3));
        n.set_start_works(cid, false);
        drop(sends(&mut n));
        drop(events(&mut n));

        // The remote restarted: its init arrives in Running.  With no
        // start detection the circuit re-enters DataLinkStart and the
        // replay completes the handshake without a reconnect pause.
        rx(
            &mut n,
            cid,
            Port::Routing,
            EthAddr::NULL,
            &peer_init(NodeAddr::new(1, 3), NodeType::L1Router),
        );
        assert_eq!(ptp_state(&n, cid), PtpState::Running);
        assert!(n.adjacencies().find(cid, NodeAddr::new(1, 3)).is_some());

        let evs = events(&mut n);
        assert!(evs.iter().any(|e| e.code == EventCode::CircDown));
        assert!(evs.iter().any(|e| e.code == EventCode::CircUp));
    }

    #[test]
    fn ptp_stop_drains_through_shutdown() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = ptp_up(&mut n, NodeAddr::new(1, 3));
        drop(sends(&mut n));

        n.stop();
        assert_eq!(ptp_state(&n, cid), PtpState::Shutdown);
        assert!(n.adjacencies().find(cid, NodeAddr::new(1, 3)).is_none());

        let mut closed = false;
        let mut stopped = false;
        while let Some(a) = n.poll_action() {
            match a {
                Action::CloseLink { circuit } => closed = circuit == cid,
                Action::Stopped => stopped = true,
                _ => (),
            }
        }
        assert!(closed && stopped);

        // The datalink confirms the close and the circuit halts
        n.post(Work::DlStatus {
            circuit: cid,
            up: false,
        })
        .unwrap();
        n.run_pending();
        assert_eq!(ptp_state(&n, cid), PtpState::Halted);
    }

    #[test]
    fn ptp_stop_drain_times_out() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = ptp_up(&mut n, NodeAddr::new(1, 3));

        // A datalink that never confirms the close cannot wedge the
        // shutdown
        n.stop();
        assert_eq!(ptp_state(&n, cid), PtpState::Shutdown);
        for _ in 0..6 {
            n.tick();
        }
        assert_eq!(ptp_state(&n, cid), PtpState::Halted);
    }

    #[test]
    fn console_carrier_handshake() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let mut cfg = CircuitConfig::default();
        cfg.console_verification = Some(*b"secret!!");
        let cid = n.attach_lan("lan-0", cfg).unwrap();
        n.start().unwrap();
        drop(sends(&mut n));

        let client_mac = EthAddr::new([0xAA, 0x00, 0x04, 0x00, 0x09, 0x04]);

        // Wrong verification is ignored
        let bad = dnet_wire::mop::ConsoleRequest {
            verification: *b"wrong!!!",
        };
        let mut buf = [0u8; 16];
        let encoded = bad.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::MopConsole, client_mac, &encoded);

        let good = dnet_wire::mop::ConsoleRequest {
            verification: *b"secret!!",
        };
        let mut buf = [0u8; 16];
        let encoded = good.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::MopConsole, client_mac, &encoded);

        // Reservation taken: a directed RequestId now reports the
        // console user
        let req = dnet_wire::mop::RequestId { receipt: 9 };
        let mut buf = [0u8; 8];
        let encoded = req.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::MopConsole, client_mac, &encoded);
        let out = sends(&mut n);
        let id = out
            .iter()
            .find_map(|(_, _, _, f)| match MopPacket::decode(f) {
                Ok(MopPacket::SysId(id)) => Some(id),
                _ => None,
            })
            .unwrap();
        assert!(id.functions.has(SysIdFunctions::CARRIER_RESERVED));
        assert_eq!(id.console_user, Some(client_mac));

        // A command carries input to the backend and polls output
        n.mop_console_server_output(cid, b"login: ").unwrap();
        let cmd = dnet_wire::mop::ConsoleCommand {
            seq: true,
            brk: false,
            payload: b"root\r",
        };
        let mut buf = [0u8; 32];
        let encoded = cmd.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::MopConsole, client_mac, &encoded);

        let mut input = None;
        let mut resp = None;
        while let Some(a) = n.poll_action() {
            match a {
                Action::ConsoleServerInput { data, .. } => input = Some(data),
                Action::Send { frame, .. } => {
                    if let Ok(MopPacket::ConsoleResponse(r)) = MopPacket::decode(&frame) {
                        resp = Some((r.seq, work::frame(r.payload).unwrap()));
                    }
                }
                _ => (),
            }
        }
        assert_eq!(input.unwrap().as_slice(), b"root\r");
        let (seq, payload) = resp.unwrap();
        assert!(seq);
        assert_eq!(payload.as_slice(), b"login: ");

        // The reservation lapses after 15 s without polls
        for _ in 0..16 {
            n.tick();
        }
        let req = dnet_wire::mop::RequestId { receipt: 10 };
        let mut buf = [0u8; 8];
        let encoded = req.encode(&mut buf).unwrap();
        let encoded = work::frame(encoded).unwrap();
        rx(&mut n, cid, Port::MopConsole, client_mac, &encoded);
        let out = sends(&mut n);
        let id = out
            .iter()
            .find_map(|(_, _, _, f)| match MopPacket::decode(f) {
                Ok(MopPacket::SysId(id)) => Some(id),
                _ => None,
            })
            .unwrap();
        assert!(!id.functions.has(SysIdFunctions::CARRIER_RESERVED));
    }

    #[test]
    fn loop_forward_and_reply() {
        let mut n = node(NodeAddr::new(1, 2), NodeType::L1Router);
        let cid = n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.start().unwrap();
        drop(sends(&mut n));

        let peer_mac = EthAddr::from_node(NodeAddr::new(1, 3));
        let receipt = n.mop_loop(cid, &[peer_mac]).unwrap();
        let out = sends(&mut n);
        assert_eq!(out[0].1, Port::MopLoop);
        assert_eq!(out[0].2, Some(peer_mac));

        // The peer's reply comes back correlated on the receipt
        let mut buf = [0u8; 256];
        let frame = dnet_wire::mop::build_loop(&[], receipt, b"echo", &mut buf).unwrap();
        let frame = work::frame(frame).unwrap();
        rx(&mut n, cid, Port::MopLoop, peer_mac, &frame);

        let mut got = false;
        while let Some(a) = n.poll_action() {
            if let Action::MopResponse {
                receipt: r,
                response: MopResponse::LoopReply { src },
                ..
            } = a
            {
                assert_eq!(r, receipt);
                assert_eq!(src, peer_mac);
                got = true;
            }
        }
        assert!(got);

        // And we forward other stations' loop chains
        let fwd_target = EthAddr::from_node(NodeAddr::new(1, 9));
        let mut buf = [0u8; 256];
        let frame =
            dnet_wire::mop::build_loop(&[fwd_target], 77, b"assist", &mut buf).unwrap();
        let frame = work::frame(frame).unwrap();
        rx(&mut n, cid, Port::MopLoop, peer_mac, &frame);
        let out = sends(&mut n);
        let relayed = out.iter().find(|(_, p, _, _)| *p == Port::MopLoop).unwrap();
        assert_eq!(relayed.2, Some(fwd_target));
        let skip = dnet_wire::mop::LoopSkip::decode(&relayed.3).unwrap();
        assert_eq!(skip.skip, 8);
    }

    #[test]
    fn endnode_requires_single_circuit() {
        let mut n = node(NodeAddr::new(1, 5), NodeType::Endnode);
        n.attach_lan("lan-0", CircuitConfig::default()).unwrap();
        n.attach_ptp("ptp-0", CircuitConfig::default()).unwrap();
        assert!(matches!(n.start(), Err(Error::InvalidOperation)));
    }
}
