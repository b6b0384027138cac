//! The console carrier: a polled, sequence-checked byte relay between
//! a client (this node's API) and a server fronting a terminal
//! backend on the remote station.

use dnet_timer::TimerId;
use dnet_wire::mop::{
    ConsoleCommand, ConsoleRelease, ConsoleRequest, ConsoleResponse, RequestId, SysId,
    SysIdFunctions,
};
use dnet_wire::EthAddr;

use super::ClientIo;
use crate::work::{self, Action, ConsoleBuf, ConsoleStatus, Port, TimerOwner};
use crate::{CircuitId, Ctx};

const RETRIES: u8 = 5;
/// Poll/retransmit interval, seconds.
const POLL_TIME: u32 = 1;
/// Close the session when the API stops reading/writing, seconds.
const API_TIMEOUT: u64 = 120;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum ClientState {
    /// Probing the target with RequestId.
    IdReq,
    /// Reservation sent; confirming with another RequestId.
    Reserve,
    /// Session running; console data flows in ConsoleCommand /
    /// ConsoleResponse pairs.
    Active,
    /// Release sent; confirming it took.
    Release,
}

pub struct CarrierClient {
    pub dest: EthAddr,
    verification: [u8; 8],
    state: ClientState,
    timer: TimerId,
    retries: u8,
    seq: bool,
    cmdsize: u16,
    pending_receipt: u16,
    pending_input: heapless::Deque<u8, 1024>,
    /// The outstanding command payload, kept for retransmission.
    poll: Option<ConsoleBuf>,
    last_api: u64,
}

fn send_frame(ctx: &mut Ctx<'_>, circuit: CircuitId, dest: EthAddr, encoded: &[u8]) {
    if let Some(frame) = work::frame(encoded) {
        work::push_action(
            ctx.actions,
            Action::Send {
                circuit,
                port: Port::MopConsole,
                dest: Some(dest),
                frame,
            },
        );
    }
}

fn session(ctx: &mut Ctx<'_>, circuit: CircuitId, status: ConsoleStatus) {
    work::push_action(ctx.actions, Action::ConsoleSession { circuit, status });
}

impl CarrierClient {
    pub(crate) fn new(
        ctx: &mut Ctx<'_>,
        req: &mut ClientIo<'_>,
        dest: EthAddr,
        verification: [u8; 8],
        timer: TimerId,
    ) -> Option<Self> {
        let mut client = Self {
            dest,
            verification,
            state: ClientState::IdReq,
            timer,
            retries: RETRIES,
            seq: false,
            cmdsize: 512,
            pending_receipt: 0,
            pending_input: heapless::Deque::new(),
            poll: None,
            last_api: ctx.now,
        };
        client.send_request_id(ctx, req)?;
        ctx.start_timer(timer, POLL_TIME);
        Some(client)
    }

    pub(crate) fn release_timer(&self, ctx: &mut Ctx<'_>) {
        ctx.timers.free(self.timer);
    }

    fn send_request_id(&mut self, ctx: &mut Ctx<'_>, req: &mut ClientIo<'_>) -> Option<()> {
        req.cancel(self.pending_receipt);
        let receipt = req.open()?;
        self.pending_receipt = receipt;
        let mut buf = [0u8; 8];
        if let Ok(encoded) = (RequestId { receipt }).encode(&mut buf) {
            send_frame(ctx, req.circuit, self.dest, encoded);
        }
        Some(())
    }

    fn send_reservation(&self, ctx: &mut Ctx<'_>, circuit: CircuitId) {
        let mut buf = [0u8; 16];
        if let Ok(encoded) = (ConsoleRequest {
            verification: self.verification,
        })
        .encode(&mut buf)
        {
            send_frame(ctx, circuit, self.dest, encoded);
        }
    }

    fn send_release_frames(&mut self, ctx: &mut Ctx<'_>, req: &mut ClientIo<'_>) {
        let mut buf = [0u8; 4];
        if let Ok(encoded) = ConsoleRelease.encode(&mut buf) {
            send_frame(ctx, req.circuit, self.dest, encoded);
        }
        let _ = self.send_request_id(ctx, req);
        self.retries = RETRIES;
        ctx.start_timer(self.timer, POLL_TIME);
        self.state = ClientState::Release;
    }

    /// Send a new poll, or retransmit the outstanding one.
    fn send_poll(&mut self, ctx: &mut Ctx<'_>, circuit: CircuitId) {
        if self.poll.is_none() {
            self.retries = RETRIES;
            self.seq = !self.seq;
            let mut payload = ConsoleBuf::new();
            while payload.len() < self.cmdsize as usize {
                match self.pending_input.pop_front() {
                    Some(b) => {
                        let _ = payload.push(b);
                    }
                    None => break,
                }
            }
            self.poll = Some(payload);
        }
        if let Some(payload) = &self.poll {
            let cmd = ConsoleCommand {
                seq: self.seq,
                brk: false,
                payload: payload.as_slice(),
            };
            let mut buf = [0u8; 600];
            if let Ok(encoded) = cmd.encode(&mut buf) {
                send_frame(ctx, circuit, self.dest, encoded);
            }
        }
        ctx.start_timer(self.timer, POLL_TIME);
    }
}

/// A SysId correlated to one of the client's exchanges arrived.
/// Returns true when the session is over and the client should be
/// dropped.
pub(crate) fn client_sysid(
    client: &mut CarrierClient,
    ctx: &mut Ctx<'_>,
    req: &mut ClientIo<'_>,
    src: EthAddr,
    id: &SysId<'_>,
    receipt: u16,
) -> bool {
    if src != client.dest {
        return false;
    }
    let reserved = id.functions.has(SysIdFunctions::CARRIER_RESERVED);

    match client.state {
        ClientState::IdReq => {
            ctx.timers.stop(client.timer);
            if id.functions.has(SysIdFunctions::CARRIER) && !reserved {
                client.cmdsize = id.console_cmd_size.unwrap_or(512).min(512);
                client.send_reservation(ctx, req.circuit);
                client.retries = RETRIES;
                let _ = client.send_request_id(ctx, req);
                ctx.start_timer(client.timer, POLL_TIME);
                client.state = ClientState::Reserve;
                false
            } else if !id.functions.has(SysIdFunctions::CARRIER) {
                session(ctx, req.circuit, ConsoleStatus::NoCarrierSupport);
                true
            } else {
                session(ctx, req.circuit, ConsoleStatus::Reserved);
                true
            }
        }
        ClientState::Reserve => {
            if !reserved {
                return false;
            }
            if id.console_user == Some(ctx.cfg.station()) {
                client.seq = false;
                client.poll = None;
                while client.pending_input.pop_front().is_some() {}
                client.send_poll(ctx, req.circuit);
                session(ctx, req.circuit, ConsoleStatus::Ok);
                false
            } else {
                // Someone else won the reservation race
                session(ctx, req.circuit, ConsoleStatus::Reserved);
                true
            }
        }
        ClientState::Release => {
            if receipt == client.pending_receipt
                && !(reserved && id.console_user == Some(ctx.cfg.station()))
            {
                session(ctx, req.circuit, ConsoleStatus::Released);
                true
            } else {
                false
            }
        }
        ClientState::Active => false,
    }
}

/// A console response arrived from the server.
pub(crate) fn client_response(
    client: &mut CarrierClient,
    ctx: &mut Ctx<'_>,
    req: &mut ClientIo<'_>,
    src: EthAddr,
    resp: &ConsoleResponse<'_>,
) -> bool {
    if client.state != ClientState::Active || src != client.dest {
        return false;
    }
    if resp.seq == client.seq {
        client.retries = RETRIES;
        if !resp.payload.is_empty() {
            let mut data = ConsoleBuf::new();
            let _ = data.extend_from_slice(&resp.payload[..resp.payload.len().min(512)]);
            work::push_action(
                ctx.actions,
                Action::ConsoleOutput {
                    circuit: req.circuit,
                    data,
                },
            );
        }
        client.poll = None;
        if !client.pending_input.is_empty() {
            client.send_poll(ctx, req.circuit);
        }
        false
    } else {
        // Out of sequence: same handling as a lost response
        stall(client, ctx, req)
    }
}

fn stall(client: &mut CarrierClient, ctx: &mut Ctx<'_>, req: &mut ClientIo<'_>) -> bool {
    client.retries = client.retries.saturating_sub(1);
    if ctx.now.saturating_sub(client.last_api) > API_TIMEOUT {
        log::debug!("closing console client for {}: api timeout", client.dest);
        client.send_release_frames(ctx, req);
        return false;
    }
    if client.retries > 0 {
        client.send_poll(ctx, req.circuit);
        false
    } else {
        session(ctx, req.circuit, ConsoleStatus::NoReply);
        true
    }
}

pub(crate) fn client_timeout(
    client: &mut CarrierClient,
    ctx: &mut Ctx<'_>,
    req: &mut ClientIo<'_>,
) -> bool {
    match client.state {
        ClientState::Active => stall(client, ctx, req),
        ClientState::IdReq | ClientState::Reserve | ClientState::Release => {
            client.retries = client.retries.saturating_sub(1);
            if client.retries == 0 {
                let status = if client.state == ClientState::Release {
                    ConsoleStatus::Released
                } else {
                    ConsoleStatus::NoReply
                };
                session(ctx, req.circuit, status);
                return true;
            }
            if client.state == ClientState::Reserve {
                client.send_reservation(ctx, req.circuit);
            }
            if client.state == ClientState::Release {
                let mut buf = [0u8; 4];
                if let Ok(encoded) = ConsoleRelease.encode(&mut buf) {
                    send_frame(ctx, req.circuit, client.dest, encoded);
                }
            }
            let _ = client.send_request_id(ctx, req);
            ctx.start_timer(client.timer, POLL_TIME);
            false
        }
    }
}

/// Keyboard input from the API.
pub(crate) fn client_input(
    client: &mut CarrierClient,
    ctx: &mut Ctx<'_>,
    req: &mut ClientIo<'_>,
    data: &[u8],
) -> bool {
    client.last_api = ctx.now;
    if client.state != ClientState::Active {
        return false;
    }
    for b in data {
        if client.pending_input.push_back(*b).is_err() {
            break;
        }
    }
    if client.poll.is_none() {
        client.send_poll(ctx, req.circuit);
    }
    false
}

pub(crate) fn client_close(
    client: &mut CarrierClient,
    ctx: &mut Ctx<'_>,
    req: &mut ClientIo<'_>,
) -> bool {
    match client.state {
        ClientState::Active => {
            client.send_release_frames(ctx, req);
            false
        }
        ClientState::Release => false,
        _ => {
            req.cancel(client.pending_receipt);
            session(ctx, req.circuit, ConsoleStatus::Released);
            true
        }
    }
}

/// The server side: relays between ConsoleCommand/ConsoleResponse
/// frames and a terminal backend the embedder owns (a pty running a
/// login process, typically).
pub struct CarrierServer {
    pub remote: EthAddr,
    seq: bool,
    timer: TimerId,
    response: Option<ConsoleBuf>,
    pending_output: heapless::Deque<u8, 1024>,
}

impl CarrierServer {
    /// Reservation lifetime without client polls, seconds.
    pub const RESERVATION_TIMER: u32 = 15;
    /// Largest console data chunk per frame.
    pub const MSGSIZE: usize = 512;

    pub(crate) fn new(ctx: &mut Ctx<'_>, circuit: CircuitId, remote: EthAddr) -> Option<Self> {
        let timer = ctx.timers.alloc(TimerOwner::CarrierServer(circuit)).ok()?;
        ctx.start_timer(timer, Self::RESERVATION_TIMER);
        Some(Self {
            remote,
            seq: false,
            timer,
            response: None,
            pending_output: heapless::Deque::new(),
        })
    }

    pub(crate) fn release(&self, ctx: &mut Ctx<'_>) {
        ctx.timers.free(self.timer);
    }

    /// Backend output waiting to be polled.
    pub(crate) fn push_output(&mut self, data: &[u8]) {
        for b in data {
            if self.pending_output.push_back(*b).is_err() {
                break;
            }
        }
    }
}

pub(crate) fn server_command(
    server: &mut CarrierServer,
    ctx: &mut Ctx<'_>,
    circuit: CircuitId,
    cmd: &ConsoleCommand<'_>,
) {
    let timer = server.timer;
    ctx.start_timer(timer, CarrierServer::RESERVATION_TIMER);

    if cmd.seq == server.seq {
        // Retransmitted poll: repeat the previous response
        if let Some(payload) = &server.response {
            let resp = ConsoleResponse {
                seq: server.seq,
                cmd_lost: false,
                resp_lost: false,
                payload: payload.as_slice(),
            };
            let mut buf = [0u8; 600];
            if let Ok(encoded) = resp.encode(&mut buf) {
                send_frame(ctx, circuit, server.remote, encoded);
            }
        }
        return;
    }

    if !cmd.payload.is_empty() {
        let mut data = ConsoleBuf::new();
        let _ = data.extend_from_slice(&cmd.payload[..cmd.payload.len().min(512)]);
        work::push_action(ctx.actions, Action::ConsoleServerInput { circuit, data });
    }

    server.seq = cmd.seq;
    let mut payload = ConsoleBuf::new();
    while payload.len() < CarrierServer::MSGSIZE {
        match server.pending_output.pop_front() {
            Some(b) => {
                let _ = payload.push(b);
            }
            None => break,
        }
    }
    let resp = ConsoleResponse {
        seq: server.seq,
        cmd_lost: false,
        resp_lost: false,
        payload: payload.as_slice(),
    };
    let mut buf = [0u8; 600];
    if let Ok(encoded) = resp.encode(&mut buf) {
        send_frame(ctx, circuit, server.remote, encoded);
    }
    server.response = Some(payload);
}
