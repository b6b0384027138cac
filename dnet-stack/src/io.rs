//! Async binding: drives a sans-I/O [`Node`] from `dnet-nal` ports.
//!
//! One driver future per circuit plus a clock future share the node
//! behind a blocking mutex; each dispatch distributes the resulting
//! actions to per-circuit outbound channels (transmissions, link
//! control) and to an upcall channel the embedder reads (NSP
//! deliveries, MOP responses, console traffic).

use core::cell::RefCell;
use core::future::pending;

use embassy_futures::select::{select, select4, Either, Either4};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Ticker, Timer};

use rand_core::RngCore;

use dnet_nal::{mcast, LanPort, PtpLink};
use dnet_wire::EthAddr;

use crate::node::Node;
use crate::work::{Action, Port, Work};
use crate::{CircuitId, MAX_CIRCUITS, MTU};

/// Actions the embedder consumes: everything that is not a
/// transmission or link control.
pub type Upcalls<M> = Channel<M, Action, 8>;

type TxQueue<M> = Channel<M, Action, 8>;

/// A node shared between the circuit drivers and the clock.
pub struct SharedNode<M: RawMutex, R: RngCore> {
    node: Mutex<M, RefCell<Node<R>>>,
    tx: [TxQueue<M>; MAX_CIRCUITS],
}

impl<M: RawMutex, R: RngCore> SharedNode<M, R> {
    pub fn new(node: Node<R>) -> Self {
        Self {
            node: Mutex::new(RefCell::new(node)),
            tx: [const { Channel::new() }; MAX_CIRCUITS],
        }
    }

    /// Run a closure against the node (API calls, status reads).
    /// Follow up with [`Self::flush`] if the call can produce
    /// actions.
    pub fn with<T>(&self, f: impl FnOnce(&mut Node<R>) -> T) -> T {
        self.node.lock(|n| f(&mut n.borrow_mut()))
    }

    /// Distribute whatever actions the node has pending, e.g. after
    /// an API call made through [`Self::with`].
    pub async fn flush(&self, upcalls: &Upcalls<M>) {
        let mut actions: heapless::Vec<Action, 16> = heapless::Vec::new();
        self.with(|node| {
            node.run_pending();
            while let Some(action) = node.poll_action() {
                if actions.push(action).is_err() {
                    break;
                }
            }
        });
        self.distribute(actions, upcalls).await;
    }

    /// Post one work item, dispatch, and distribute the fallout.
    pub async fn dispatch(&self, work: Work, upcalls: &Upcalls<M>) {
        let mut actions: heapless::Vec<Action, 16> = heapless::Vec::new();
        self.with(|node| {
            let _ = node.post(work);
            node.run_pending();
            while let Some(action) = node.poll_action() {
                if actions.push(action).is_err() {
                    break;
                }
            }
        });
        self.distribute(actions, upcalls).await;
    }

    /// Hand each pending action to its consumer.  Outbound queues are
    /// never awaited on: a wedged driver loses frames rather than
    /// deadlocking the rest of the node.
    pub async fn distribute<const N: usize>(
        &self,
        actions: heapless::Vec<Action, N>,
        upcalls: &Upcalls<M>,
    ) {
        for action in actions {
            let circuit = match &action {
                Action::Send { circuit, .. }
                | Action::OpenLink { circuit }
                | Action::CloseLink { circuit } => Some(*circuit),
                _ => None,
            };
            match circuit {
                Some(c) => {
                    if self.tx[c.0 as usize % MAX_CIRCUITS]
                        .try_send(action)
                        .is_err()
                    {
                        log::warn!("outbound queue overflow on circuit {}", c.0);
                    }
                }
                None => upcalls.send(action).await,
            }
        }
    }

    /// Advance the node clock once a second, forever.
    pub async fn run_clock(&self, upcalls: &Upcalls<M>) -> ! {
        let mut ticker = Ticker::every(Duration::from_secs(1));
        loop {
            ticker.next().await;
            let mut actions: heapless::Vec<Action, 16> = heapless::Vec::new();
            self.with(|node| {
                node.tick();
                while let Some(action) = node.poll_action() {
                    if actions.push(action).is_err() {
                        break;
                    }
                }
            });
            self.distribute(actions, upcalls).await;
        }
    }

    /// Drive one broadcast circuit from its three ports.
    pub async fn run_lan_circuit<P: LanPort>(
        &self,
        circuit: CircuitId,
        mut routing: P,
        mut console: P,
        mut loopback: P,
        upcalls: &Upcalls<M>,
    ) -> Result<(), P::Error> {
        routing.add_multicast(mcast::ALL_ROUTERS).await?;
        routing.add_multicast(mcast::ALL_ENDNODES).await?;
        console.add_multicast(mcast::CONSOLE_MC).await?;
        loopback.add_multicast(mcast::LOOP_MC).await?;
        self.with(|node| node.set_mop_hwaddr(circuit, routing.hwaddr()));

        let outbound = &self.tx[circuit.0 as usize % MAX_CIRCUITS];
        let mut rbuf = [0u8; MTU];
        let mut cbuf = [0u8; MTU];
        let mut lbuf = [0u8; MTU];
        loop {
            let result = select4(
                routing.receive(&mut rbuf),
                console.receive(&mut cbuf),
                loopback.receive(&mut lbuf),
                outbound.receive(),
            )
            .await;
            match result {
                Either4::First(r) => {
                    let (len, src) = r?;
                    self.rx(circuit, Port::Routing, src, &rbuf[..len], upcalls)
                        .await;
                }
                Either4::Second(r) => {
                    let (len, src) = r?;
                    self.rx(circuit, Port::MopConsole, src, &cbuf[..len], upcalls)
                        .await;
                }
                Either4::Third(r) => {
                    let (len, src) = r?;
                    self.rx(circuit, Port::MopLoop, src, &lbuf[..len], upcalls)
                        .await;
                }
                Either4::Fourth(action) => {
                    if let Action::Send { port, dest, frame, .. } = action {
                        let dest = dest.unwrap_or(mcast::ALL_ROUTERS);
                        match port {
                            Port::Routing => routing.send(dest, &frame).await?,
                            Port::MopConsole => console.send(dest, &frame).await?,
                            Port::MopLoop => loopback.send(dest, &frame).await?,
                        }
                    }
                }
            }
        }
    }

    async fn rx(
        &self,
        circuit: CircuitId,
        port: Port,
        src: EthAddr,
        buf: &[u8],
        upcalls: &Upcalls<M>,
    ) {
        if let Some(frame) = crate::work::frame(buf) {
            self.dispatch(
                Work::Received {
                    circuit,
                    port,
                    src,
                    frame,
                },
                upcalls,
            )
            .await;
        }
    }

    /// Drive one point-to-point circuit from its link.
    pub async fn run_ptp_circuit<L: PtpLink>(
        &self,
        circuit: CircuitId,
        mut link: L,
        upcalls: &Upcalls<M>,
    ) -> Result<(), L::Error> {
        self.with(|node| node.set_start_works(circuit, link.start_works()));

        let outbound = &self.tx[circuit.0 as usize % MAX_CIRCUITS];
        let mut buf = [0u8; MTU];
        let mut open = false;
        loop {
            let receive = async {
                if open {
                    link.receive(&mut buf).await
                } else {
                    pending().await
                }
            };
            let result = select(receive, outbound.receive()).await;
            match result {
                Either::First(Ok(len)) => {
                    let data = heapless::Vec::<u8, MTU>::from_slice(&buf[..len]).ok();
                    if let Some(frame) = data {
                        self.dispatch(
                            Work::Received {
                                circuit,
                                port: Port::Routing,
                                src: EthAddr::NULL,
                                frame,
                            },
                            upcalls,
                        )
                        .await;
                    }
                }
                Either::First(Err(_)) => {
                    open = false;
                    let _ = link.close().await;
                    self.dispatch(Work::DlStatus { circuit, up: false }, upcalls)
                        .await;
                }
                Either::Second(action) => match action {
                    Action::Send { frame, .. } => {
                        if open {
                            if link.send(&frame).await.is_err() {
                                open = false;
                                let _ = link.close().await;
                                self.dispatch(Work::DlStatus { circuit, up: false }, upcalls)
                                    .await;
                            }
                        }
                    }
                    Action::OpenLink { .. } => {
                        match link.open().await {
                            Ok(()) => {
                                open = true;
                                self.dispatch(Work::DlStatus { circuit, up: true }, upcalls)
                                    .await;
                            }
                            Err(_) => {
                                // Back off briefly; the state machine
                                // will ask again
                                Timer::after(Duration::from_millis(500)).await;
                                self.dispatch(Work::DlStatus { circuit, up: false }, upcalls)
                                    .await;
                            }
                        }
                    }
                    Action::CloseLink { .. } => {
                        if open {
                            let _ = link.close().await;
                        }
                        open = false;
                        // Confirm the close; a stopping circuit
                        // drains on this
                        self.dispatch(Work::DlStatus { circuit, up: false }, upcalls)
                            .await;
                    }
                    _ => (),
                },
            }
        }
    }
}
