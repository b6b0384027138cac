//! The MOP engine, one instance per MOP-capable (broadcast) circuit:
//! SysId broadcast and collection, remote counter service, the
//! console carrier, and the loopback protocol.
//!
//! All the console-protocol handlers share the circuit's console
//! port; received frames are dispatched here on the header code.

pub mod carrier;
pub mod looper;

use dnet_timer::TimerId;
use dnet_wire::addr::CONSOLE_MC;
use dnet_wire::mop::{
    Counters, MopPacket, RequestCounters, RequestId, SoftwareId, SysId, SysIdFunctions,
};
use dnet_wire::EthAddr;

use rand_core::RngCore;

use carrier::{CarrierClient, CarrierServer};

use crate::work::{self, Action, MopResponse, Port, TimerOwner};
use crate::{CircuitId, Ctx, Error, Wheel};

/// Who is waiting on a receipt-correlated exchange.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Requester {
    /// The embedder, through the node API.
    Api,
    /// The console carrier client state machine.
    Client,
}

/// Last-heard SysId state for one station.
#[derive(Clone, Default, Debug)]
pub struct SysIdRecord {
    pub functions: SysIdFunctions,
    pub hwaddr: Option<EthAddr>,
    pub device: Option<u8>,
    pub processor: Option<u8>,
    pub datalink: Option<u8>,
    pub console_user: Option<EthAddr>,
    pub reservation_timer: Option<u16>,
    pub software: heapless::String<16>,
}

impl SysIdRecord {
    fn from_sysid(id: &SysId<'_>) -> Self {
        let mut software = heapless::String::new();
        if let Some(SoftwareId::Name(name)) = id.software {
            let _ = software.push_str(name);
        }
        Self {
            functions: id.functions,
            hwaddr: id.hwaddr,
            device: id.device,
            processor: id.processor,
            datalink: id.datalink,
            console_user: id.console_user,
            reservation_timer: id.reservation_timer,
            software,
        }
    }
}

pub struct MopCircuit {
    pub circuit: CircuitId,
    /// Console-carrier reservation verification; None disables the
    /// server.
    verification: Option<[u8; 8]>,
    receipt: u16,
    requests: heapless::FnvIndexMap<u16, Requester, 16>,
    /// Stations heard from, kept indefinitely.
    pub heard: heapless::FnvIndexMap<EthAddr, SysIdRecord, 16>,
    sysid_timer: TimerId,
    pub server: Option<CarrierServer>,
    pub client: Option<CarrierClient>,
    /// The adapter hardware address, as reported in SysId.
    pub hwaddr: EthAddr,
}

/// The periodic SysId interval: uniformly 8 to 12 minutes.
fn sysid_interval(rng: &mut dyn RngCore) -> u32 {
    8 * 60 + rng.next_u32() % (4 * 60 + 1)
}

impl MopCircuit {
    pub(crate) fn new(
        timers: &mut Wheel,
        circuit: CircuitId,
        verification: Option<[u8; 8]>,
    ) -> Option<Self> {
        let sysid_timer = timers.alloc(TimerOwner::SysId(circuit)).ok()?;

        Some(Self {
            circuit,
            verification,
            receipt: 0,
            requests: heapless::FnvIndexMap::new(),
            heard: heapless::FnvIndexMap::new(),
            sysid_timer,
            server: None,
            client: None,
            hwaddr: EthAddr::NULL,
        })
    }

    /// Receipt numbers are 1..=0xffff; zero marks unsolicited
    /// messages.
    fn next_receipt(&mut self, rng: &mut dyn RngCore) -> u16 {
        if self.receipt == 0 {
            self.receipt = (rng.next_u32() % 0xffff + 1) as u16;
        }
        let ret = self.receipt;
        self.receipt = if ret == 0xffff { 1 } else { ret + 1 };
        ret
    }

    /// Open a receipt-correlated exchange.
    fn open_request(&mut self, rng: &mut dyn RngCore, who: Requester) -> Result<u16, Error> {
        let receipt = self.next_receipt(rng);
        self.requests
            .insert(receipt, who)
            .map_err(|_| Error::QueueFull)?;
        Ok(receipt)
    }

    pub(crate) fn cancel_request(&mut self, receipt: u16) {
        self.requests.remove(&receipt);
    }
}

fn send(mop: &MopCircuit, ctx: &mut Ctx<'_>, port: Port, dest: EthAddr, encoded: &[u8]) {
    if let Some(frame) = work::frame(encoded) {
        work::push_action(
            ctx.actions,
            Action::Send {
                circuit: mop.circuit,
                port,
                dest: Some(dest),
                frame,
            },
        );
    }
}

/// Our SysId announcement.
fn send_id(mop: &MopCircuit, ctx: &mut Ctx<'_>, dest: EthAddr, receipt: u16) {
    let mut functions = SysIdFunctions::default();
    functions.set(SysIdFunctions::LOOP, true);
    functions.set(SysIdFunctions::COUNTERS, true);
    if mop.verification.is_some() {
        functions.set(SysIdFunctions::CARRIER, true);
    }

    let mut id = SysId {
        receipt,
        version: Some(SysId::DEF_VERSION),
        functions,
        console_user: None,
        reservation_timer: None,
        console_cmd_size: None,
        console_resp_size: None,
        hwaddr: Some(mop.hwaddr),
        device: Some(9),
        software: Some(SoftwareId::Name("dnet")),
        processor: Some(2),
        datalink: Some(1),
    };
    if mop.verification.is_some() {
        id.reservation_timer = Some(CarrierServer::RESERVATION_TIMER as u16);
        id.console_cmd_size = Some(CarrierServer::MSGSIZE as u16);
        id.console_resp_size = Some(CarrierServer::MSGSIZE as u16);
        if let Some(server) = &mop.server {
            id.functions.set(SysIdFunctions::CARRIER_RESERVED, true);
            id.console_user = Some(server.remote);
        }
    }

    let mut buf = [0u8; 256];
    if let Ok(encoded) = id.encode(&mut buf) {
        send(mop, ctx, Port::MopConsole, dest, encoded);
    }
}

/// Our datalink counters, for RequestCounters service.
fn send_counters(mop: &MopCircuit, ctx: &mut Ctx<'_>, dest: EthAddr, receipt: u16) {
    let c = *ctx.circ_counter(mop.circuit);
    let reply = Counters {
        receipt,
        time_since_zeroed: ctx.now.min(u16::MAX as u64) as u16,
        bytes_recv: c.bytes_recv.min(u32::MAX as u64) as u32,
        bytes_sent: c.bytes_sent.min(u32::MAX as u64) as u32,
        pkts_recv: c.pkts_recv.min(u32::MAX as u64) as u32,
        pkts_sent: c.pkts_sent.min(u32::MAX as u64) as u32,
        ..Default::default()
    };
    let mut buf = [0u8; 128];
    if let Ok(encoded) = reply.encode(&mut buf) {
        send(mop, ctx, Port::MopConsole, dest, encoded);
    }
}

/// Start MOP service on the circuit: schedule the first SysId
/// announcement, staggered across the network.
pub(crate) fn start(mop: &mut MopCircuit, ctx: &mut Ctx<'_>, rng: &mut dyn RngCore) {
    let timer = mop.sysid_timer;
    ctx.start_timer(timer, (sysid_interval(rng) / 30).max(1));
}

/// Stop MOP service: no more announcements, and any console session
/// ends.
pub(crate) fn stop(mop: &mut MopCircuit, ctx: &mut Ctx<'_>) {
    ctx.timers.stop(mop.sysid_timer);
    if let Some(server) = mop.server.take() {
        server.release(ctx);
    }
    drop_client(mop, ctx);
}

pub(crate) fn sysid_timeout(mop: &mut MopCircuit, ctx: &mut Ctx<'_>, rng: &mut dyn RngCore) {
    log::trace!("periodic sysid on circuit {}", mop.circuit.0);
    send_id(mop, ctx, CONSOLE_MC, 0);
    let timer = mop.sysid_timer;
    ctx.start_timer(timer, sysid_interval(rng));
}

/// A frame arrived on the console port.
pub(crate) fn receive(
    mop: &mut MopCircuit,
    ctx: &mut Ctx<'_>,
    rng: &mut dyn RngCore,
    src: EthAddr,
    frame: &[u8],
) {
    let pkt = match MopPacket::decode(frame) {
        Ok(p) => p,
        Err(e) => {
            log::debug!("undecodable MOP packet on circuit {}: {}", mop.circuit.0, e);
            return;
        }
    };

    match pkt {
        MopPacket::SysId(id) => {
            let record = SysIdRecord::from_sysid(&id);
            if mop.heard.contains_key(&src) || mop.heard.len() < mop.heard.capacity() {
                let _ = mop.heard.insert(src, record);
            }
            deliver_sysid(mop, ctx, src, &id);
        }
        MopPacket::RequestId(req) => send_id(mop, ctx, src, req.receipt),
        MopPacket::RequestCounters(req) => send_counters(mop, ctx, src, req.receipt),
        MopPacket::Counters(counters) => {
            if let Some(Requester::Api) = mop.requests.remove(&counters.receipt) {
                work::push_action(
                    ctx.actions,
                    Action::MopResponse {
                        circuit: mop.circuit,
                        receipt: counters.receipt,
                        response: MopResponse::Counters(counters),
                    },
                );
            }
        }
        MopPacket::ConsoleRequest(req) => {
            if mop.server.is_none() {
                match mop.verification {
                    Some(v) if v == req.verification => {
                        mop.server = CarrierServer::new(ctx, mop.circuit, src);
                        if mop.server.is_some() {
                            log::debug!(
                                "console carrier reserved by {} on circuit {}",
                                src,
                                mop.circuit.0
                            );
                        }
                    }
                    _ => log::debug!("console request ignored, wrong verification from {}", src),
                }
            }
        }
        MopPacket::ConsoleRelease(_) => {
            if mop.server.as_ref().map(|s| s.remote) == Some(src) {
                if let Some(server) = mop.server.take() {
                    server.release(ctx);
                }
            }
        }
        MopPacket::ConsoleCommand(cmd) => {
            if let Some(server) = &mut mop.server {
                if server.remote == src {
                    carrier::server_command(server, ctx, mop.circuit, &cmd);
                }
            }
        }
        MopPacket::ConsoleResponse(resp) => {
            client_event(mop, ctx, rng, |client, ctx, req| {
                carrier::client_response(client, ctx, req, src, &resp)
            });
        }
    }
}

fn deliver_sysid(mop: &mut MopCircuit, ctx: &mut Ctx<'_>, src: EthAddr, id: &SysId<'_>) {
    if id.receipt == 0 {
        return;
    }
    match mop.requests.remove(&id.receipt) {
        Some(Requester::Api) => {
            work::push_action(
                ctx.actions,
                Action::MopResponse {
                    circuit: mop.circuit,
                    receipt: id.receipt,
                    response: MopResponse::SysId {
                        src,
                        carrier: id.functions.has(SysIdFunctions::CARRIER),
                        carrier_reserved: id.functions.has(SysIdFunctions::CARRIER_RESERVED),
                        console_user: id.console_user,
                    },
                },
            );
        }
        Some(Requester::Client) => {
            let receipt = id.receipt;
            let circuit = mop.circuit;
            let mut gone = false;
            if let Some(client) = &mut mop.client {
                let mut req = ClientIo {
                    circuit,
                    requests: &mut mop.requests,
                    next: &mut mop.receipt,
                };
                gone = carrier::client_sysid(client, ctx, &mut req, src, id, receipt);
            }
            if gone {
                drop_client(mop, ctx);
            }
        }
        None => (),
    }
}

/// Console client helpers need to open follow-up exchanges while the
/// client is mutably borrowed; this hands them the request table
/// without the rest of the circuit.
pub(crate) struct ClientIo<'a> {
    pub circuit: CircuitId,
    requests: &'a mut heapless::FnvIndexMap<u16, Requester, 16>,
    next: &'a mut u16,
}

impl ClientIo<'_> {
    /// Allocate a receipt for a client exchange.  The caller already
    /// seeded the generator.
    pub(crate) fn open(&mut self) -> Option<u16> {
        if *self.next == 0 {
            *self.next = 1;
        }
        let receipt = *self.next;
        *self.next = if receipt == 0xffff { 1 } else { receipt + 1 };
        self.requests.insert(receipt, Requester::Client).ok()?;
        Some(receipt)
    }

    pub(crate) fn cancel(&mut self, receipt: u16) {
        self.requests.remove(&receipt);
    }
}

fn client_event(
    mop: &mut MopCircuit,
    ctx: &mut Ctx<'_>,
    _rng: &mut dyn RngCore,
    f: impl FnOnce(&mut CarrierClient, &mut Ctx<'_>, &mut ClientIo<'_>) -> bool,
) {
    let circuit = mop.circuit;
    let mut gone = false;
    if let Some(client) = &mut mop.client {
        let mut req = ClientIo {
            circuit,
            requests: &mut mop.requests,
            next: &mut mop.receipt,
        };
        gone = f(client, ctx, &mut req);
    }
    if gone {
        drop_client(mop, ctx);
    }
}

fn drop_client(mop: &mut MopCircuit, ctx: &mut Ctx<'_>) {
    if let Some(client) = mop.client.take() {
        client.release_timer(ctx);
    }
}

/// Client poll/retransmit timer.
pub(crate) fn client_timeout(mop: &mut MopCircuit, ctx: &mut Ctx<'_>, rng: &mut dyn RngCore) {
    client_event(mop, ctx, rng, carrier::client_timeout);
}

/// Server reservation timer.
pub(crate) fn server_timeout(mop: &mut MopCircuit, ctx: &mut Ctx<'_>) {
    if let Some(server) = mop.server.take() {
        log::debug!(
            "console reservation for {} on circuit {} expired",
            server.remote,
            mop.circuit.0
        );
        server.release(ctx);
    }
}

// ---- node API surface ----

/// Ask a station for its SysId.  The reply arrives as
/// `Action::MopResponse`.
pub(crate) fn request_id(
    mop: &mut MopCircuit,
    ctx: &mut Ctx<'_>,
    rng: &mut dyn RngCore,
    dest: EthAddr,
) -> Result<u16, Error> {
    let receipt = mop.open_request(rng, Requester::Api)?;
    let mut buf = [0u8; 8];
    if let Ok(encoded) = (RequestId { receipt }).encode(&mut buf) {
        send(mop, ctx, Port::MopConsole, dest, encoded);
    }
    Ok(receipt)
}

/// Ask a station for its datalink counters.
pub(crate) fn request_counters(
    mop: &mut MopCircuit,
    ctx: &mut Ctx<'_>,
    rng: &mut dyn RngCore,
    dest: EthAddr,
) -> Result<u16, Error> {
    let receipt = mop.open_request(rng, Requester::Api)?;
    let mut buf = [0u8; 8];
    if let Ok(encoded) = (RequestCounters { receipt }).encode(&mut buf) {
        send(mop, ctx, Port::MopConsole, dest, encoded);
    }
    Ok(receipt)
}

/// Start a loop exchange; see [`looper::start`].
pub(crate) fn loop_start(
    mop: &mut MopCircuit,
    ctx: &mut Ctx<'_>,
    rng: &mut dyn RngCore,
    dests: &[EthAddr],
    our_mac: EthAddr,
) -> Result<u16, Error> {
    let receipt = mop.open_request(rng, Requester::Api)?;
    looper::start(mop, ctx, dests, our_mac, receipt)?;
    Ok(receipt)
}

/// Open a console carrier session toward `dest`.
pub(crate) fn console_connect(
    mop: &mut MopCircuit,
    ctx: &mut Ctx<'_>,
    rng: &mut dyn RngCore,
    dest: EthAddr,
    verification: [u8; 8],
) -> Result<(), Error> {
    if mop.client.is_some() {
        return Err(Error::InvalidOperation);
    }
    // Seed the generator before the borrow split below
    let _ = mop.next_receipt(rng);
    let circuit = mop.circuit;
    let timer = ctx
        .timers
        .alloc(TimerOwner::CarrierClient(circuit))
        .map_err(Error::Timer)?;
    let mut req = ClientIo {
        circuit,
        requests: &mut mop.requests,
        next: &mut mop.receipt,
    };
    match CarrierClient::new(ctx, &mut req, dest, verification, timer) {
        Some(client) => {
            mop.client = Some(client);
            Ok(())
        }
        None => {
            ctx.timers.free(timer);
            Err(Error::QueueFull)
        }
    }
}

/// Queue keyboard input for the console session.
pub(crate) fn console_input(mop: &mut MopCircuit, ctx: &mut Ctx<'_>, data: &[u8]) {
    let circuit = mop.circuit;
    let mut gone = false;
    if let Some(client) = &mut mop.client {
        let mut req = ClientIo {
            circuit,
            requests: &mut mop.requests,
            next: &mut mop.receipt,
        };
        gone = carrier::client_input(client, ctx, &mut req, data);
    }
    if gone {
        drop_client(mop, ctx);
    }
}

/// Close the console session.
pub(crate) fn console_close(mop: &mut MopCircuit, ctx: &mut Ctx<'_>) {
    let circuit = mop.circuit;
    let mut gone = false;
    if let Some(client) = &mut mop.client {
        let mut req = ClientIo {
            circuit,
            requests: &mut mop.requests,
            next: &mut mop.receipt,
        };
        gone = carrier::client_close(client, ctx, &mut req);
    }
    if gone {
        drop_client(mop, ctx);
    }
}

/// Backend terminal output for the console server.
pub(crate) fn console_server_output(mop: &mut MopCircuit, data: &[u8]) {
    if let Some(server) = &mut mop.server {
        server.push_output(data);
    }
}
