//! MOP (Maintenance Operations Protocol) frames: the console-protocol
//! family (SysId, RequestId, counters, console carrier) and the
//! loopback protocol, which rides its own ethertype.

use num_enum::TryFromPrimitive;

use crate::addr::{EthAddr, Version};
use crate::bytes::{BytesIn, BytesOut};
use crate::Error;

/// Message codes carried in the MOP console-protocol header byte.
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum MopCode {
    RequestId = 5,
    SysId = 7,
    RequestCounters = 9,
    Counters = 11,
    ConsoleRequest = 13,
    ConsoleRelease = 15,
    ConsoleCommand = 17,
    ConsoleResponse = 19,
}

/// The services bitmap advertised in a SysId message.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct SysIdFunctions(pub u16);

impl SysIdFunctions {
    pub const LOOP: u16 = 1 << 0;
    pub const DUMP: u16 = 1 << 1;
    pub const PRIMARY_LOADER: u16 = 1 << 2;
    pub const SECONDARY_LOADER: u16 = 1 << 3;
    pub const BOOT: u16 = 1 << 4;
    pub const CARRIER: u16 = 1 << 5;
    pub const COUNTERS: u16 = 1 << 6;
    pub const CARRIER_RESERVED: u16 = 1 << 7;

    pub const fn has(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u16, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

/// The "software" SysId field: either a name or one of the two
/// special single-byte values.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SoftwareId<'a> {
    Standard,
    Maintenance,
    Name(&'a str),
}

/// System identification message, sent periodically, on request, and
/// as the status probe of the console carrier protocol.  All fields
/// other than the receipt are TLV-encoded; unknown tags are skipped.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct SysId<'a> {
    pub receipt: u16,
    pub version: Option<Version>,
    pub functions: SysIdFunctions,
    pub console_user: Option<EthAddr>,
    pub reservation_timer: Option<u16>,
    pub console_cmd_size: Option<u16>,
    pub console_resp_size: Option<u16>,
    pub hwaddr: Option<EthAddr>,
    pub device: Option<u8>,
    pub software: Option<SoftwareId<'a>>,
    pub processor: Option<u8>,
    pub datalink: Option<u8>,
}

impl<'a> SysId<'a> {
    pub const DEF_VERSION: Version = Version(3, 0, 0);

    const TAG_VERSION: u16 = 1;
    const TAG_FUNCTIONS: u16 = 2;
    const TAG_CONSOLE_USER: u16 = 3;
    const TAG_RESERVATION_TIMER: u16 = 4;
    const TAG_CONSOLE_CMD_SIZE: u16 = 5;
    const TAG_CONSOLE_RESP_SIZE: u16 = 6;
    const TAG_HWADDR: u16 = 7;
    const TAG_TIME: u16 = 8;
    const TAG_DEVICE: u16 = 100;
    const TAG_SOFTWARE: u16 = 200;
    const TAG_PROCESSOR: u16 = 300;
    const TAG_DATALINK: u16 = 400;

    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != MopCode::SysId as u8 {
            return Err(Error::WrongValue);
        }
        bytes.byte()?;

        let mut id = Self {
            receipt: bytes.u16_le()?,
            ..Default::default()
        };

        while !bytes.is_empty() {
            let tag = bytes.u16_le()?;
            let len = bytes.byte()? as usize;
            let value = bytes.slice(len)?;
            let mut v = BytesIn::new(value);
            match tag {
                Self::TAG_VERSION => id.version = Some(Version::decode(&mut v)?),
                Self::TAG_FUNCTIONS => id.functions = SysIdFunctions(v.u16_le()?),
                Self::TAG_CONSOLE_USER => id.console_user = Some(EthAddr::new(v.arr::<6>()?)),
                Self::TAG_RESERVATION_TIMER => id.reservation_timer = Some(v.u16_le()?),
                Self::TAG_CONSOLE_CMD_SIZE => id.console_cmd_size = Some(v.u16_le()?),
                Self::TAG_CONSOLE_RESP_SIZE => id.console_resp_size = Some(v.u16_le()?),
                Self::TAG_HWADDR => id.hwaddr = Some(EthAddr::new(v.arr::<6>()?)),
                Self::TAG_TIME => (),
                Self::TAG_DEVICE => id.device = Some(v.byte()?),
                Self::TAG_SOFTWARE => {
                    id.software = Some(match value.first().copied() {
                        Some(0xff) => SoftwareId::Standard,
                        Some(0xfe) => SoftwareId::Maintenance,
                        _ => SoftwareId::Name(v.image_str(16)?),
                    })
                }
                Self::TAG_PROCESSOR => id.processor = Some(v.byte()?),
                Self::TAG_DATALINK => id.datalink = Some(v.byte()?),
                // Wild tag: keep walking
                _ => (),
            }
        }

        Ok(id)
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(MopCode::SysId as u8)?
            .byte(0)?
            .u16_le(self.receipt)?;

        if let Some(version) = self.version {
            out.u16_le(Self::TAG_VERSION)?.byte(3)?;
            version.encode(&mut out)?;
        }
        out.u16_le(Self::TAG_FUNCTIONS)?
            .byte(2)?
            .u16_le(self.functions.0)?;
        if let Some(user) = self.console_user {
            out.u16_le(Self::TAG_CONSOLE_USER)?.byte(6)?.push(&user.0)?;
        }
        if let Some(timer) = self.reservation_timer {
            out.u16_le(Self::TAG_RESERVATION_TIMER)?
                .byte(2)?
                .u16_le(timer)?;
        }
        if let Some(size) = self.console_cmd_size {
            out.u16_le(Self::TAG_CONSOLE_CMD_SIZE)?
                .byte(2)?
                .u16_le(size)?;
        }
        if let Some(size) = self.console_resp_size {
            out.u16_le(Self::TAG_CONSOLE_RESP_SIZE)?
                .byte(2)?
                .u16_le(size)?;
        }
        if let Some(hwaddr) = self.hwaddr {
            out.u16_le(Self::TAG_HWADDR)?.byte(6)?.push(&hwaddr.0)?;
        }
        if let Some(device) = self.device {
            out.u16_le(Self::TAG_DEVICE)?.byte(1)?.byte(device)?;
        }
        if let Some(software) = self.software {
            match software {
                SoftwareId::Standard => out.u16_le(Self::TAG_SOFTWARE)?.byte(1)?.byte(0xff)?,
                SoftwareId::Maintenance => {
                    out.u16_le(Self::TAG_SOFTWARE)?.byte(1)?.byte(0xfe)?
                }
                SoftwareId::Name(name) => {
                    if name.len() > 16 {
                        return Err(Error::FormatError);
                    }
                    out.u16_le(Self::TAG_SOFTWARE)?
                        .byte(name.len() as u8 + 1)?
                        .image(name.as_bytes())?
                }
            };
        }
        if let Some(processor) = self.processor {
            out.u16_le(Self::TAG_PROCESSOR)?.byte(1)?.byte(processor)?;
        }
        if let Some(datalink) = self.datalink {
            out.u16_le(Self::TAG_DATALINK)?.byte(1)?.byte(datalink)?;
        }

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Request for a SysId reply.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RequestId {
    pub receipt: u16,
}

impl RequestId {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != MopCode::RequestId as u8 {
            return Err(Error::WrongValue);
        }
        bytes.byte()?;

        Ok(Self {
            receipt: bytes.u16_le()?,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(MopCode::RequestId as u8)?
            .byte(0)?
            .u16_le(self.receipt)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Request for a Counters reply.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RequestCounters {
    pub receipt: u16,
}

impl RequestCounters {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != MopCode::RequestCounters as u8 {
            return Err(Error::WrongValue);
        }

        Ok(Self {
            receipt: bytes.u16_le()?,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(MopCode::RequestCounters as u8)?
            .u16_le(self.receipt)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Datalink counters block.  The wide counters saturate on encode;
/// most of the error counters never tick here but are carried so
/// replies from other systems decode fully.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct Counters {
    pub receipt: u16,
    pub time_since_zeroed: u16,
    pub bytes_recv: u32,
    pub bytes_sent: u32,
    pub pkts_recv: u32,
    pub pkts_sent: u32,
    pub mcbytes_recv: u32,
    pub mcpkts_recv: u32,
    pub pkts_deferred: u32,
    pub pkts_1_collision: u32,
    pub pkts_mult_collision: u32,
    pub send_fail: u16,
    pub send_reasons: u16,
    pub recv_fail: u16,
    pub recv_reasons: u16,
    pub unk_dest: u16,
    pub data_overrun: u16,
    pub no_sys_buf: u16,
    pub no_user_buf: u16,
}

impl Counters {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != MopCode::Counters as u8 {
            return Err(Error::WrongValue);
        }

        Ok(Self {
            receipt: bytes.u16_le()?,
            time_since_zeroed: bytes.u16_le()?,
            bytes_recv: bytes.u32_le()?,
            bytes_sent: bytes.u32_le()?,
            pkts_recv: bytes.u32_le()?,
            pkts_sent: bytes.u32_le()?,
            mcbytes_recv: bytes.u32_le()?,
            mcpkts_recv: bytes.u32_le()?,
            pkts_deferred: bytes.u32_le()?,
            pkts_1_collision: bytes.u32_le()?,
            pkts_mult_collision: bytes.u32_le()?,
            send_fail: bytes.u16_le()?,
            send_reasons: bytes.u16_le()?,
            recv_fail: bytes.u16_le()?,
            recv_reasons: bytes.u16_le()?,
            unk_dest: bytes.u16_le()?,
            data_overrun: bytes.u16_le()?,
            no_sys_buf: bytes.u16_le()?,
            no_user_buf: bytes.u16_le()?,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(MopCode::Counters as u8)?
            .u16_le(self.receipt)?
            .u16_le(self.time_since_zeroed)?
            .u32_le(self.bytes_recv)?
            .u32_le(self.bytes_sent)?
            .u32_le(self.pkts_recv)?
            .u32_le(self.pkts_sent)?
            .u32_le(self.mcbytes_recv)?
            .u32_le(self.mcpkts_recv)?
            .u32_le(self.pkts_deferred)?
            .u32_le(self.pkts_1_collision)?
            .u32_le(self.pkts_mult_collision)?
            .u16_le(self.send_fail)?
            .u16_le(self.send_reasons)?
            .u16_le(self.recv_fail)?
            .u16_le(self.recv_reasons)?
            .u16_le(self.unk_dest)?
            .u16_le(self.data_overrun)?
            .u16_le(self.no_sys_buf)?
            .u16_le(self.no_user_buf)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Console carrier reservation request.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ConsoleRequest {
    pub verification: [u8; 8],
}

impl ConsoleRequest {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != MopCode::ConsoleRequest as u8 {
            return Err(Error::WrongValue);
        }

        Ok(Self {
            verification: bytes.arr::<8>()?,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(MopCode::ConsoleRequest as u8)?
            .push(&self.verification)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Console carrier release.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ConsoleRelease;

impl ConsoleRelease {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != MopCode::ConsoleRelease as u8 {
            return Err(Error::WrongValue);
        }

        Ok(Self)
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(MopCode::ConsoleRelease as u8)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Console carrier poll from the client, carrying keyboard input.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ConsoleCommand<'a> {
    pub seq: bool,
    pub brk: bool,
    pub payload: &'a [u8],
}

impl<'a> ConsoleCommand<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != MopCode::ConsoleCommand as u8 {
            return Err(Error::WrongValue);
        }
        let flags = bytes.byte()?;

        Ok(Self {
            seq: flags & 0x01 != 0,
            brk: flags & 0x02 != 0,
            payload: bytes.remaining(),
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(MopCode::ConsoleCommand as u8)?
            .byte((self.seq as u8) | ((self.brk as u8) << 1))?
            .push(self.payload)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Console carrier response from the server, carrying terminal output.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ConsoleResponse<'a> {
    pub seq: bool,
    pub cmd_lost: bool,
    pub resp_lost: bool,
    pub payload: &'a [u8],
}

impl<'a> ConsoleResponse<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != MopCode::ConsoleResponse as u8 {
            return Err(Error::WrongValue);
        }
        let flags = bytes.byte()?;

        Ok(Self {
            seq: flags & 0x01 != 0,
            cmd_lost: flags & 0x02 != 0,
            resp_lost: flags & 0x04 != 0,
            payload: bytes.remaining(),
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(MopCode::ConsoleResponse as u8)?
            .byte(
                (self.seq as u8) | ((self.cmd_lost as u8) << 1) | ((self.resp_lost as u8) << 2),
            )?
            .push(self.payload)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Any MOP console-protocol frame, selected by the code byte.
#[derive(Copy, Clone, Debug)]
pub enum MopPacket<'a> {
    RequestId(RequestId),
    SysId(SysId<'a>),
    RequestCounters(RequestCounters),
    Counters(Counters),
    ConsoleRequest(ConsoleRequest),
    ConsoleRelease(ConsoleRelease),
    ConsoleCommand(ConsoleCommand<'a>),
    ConsoleResponse(ConsoleResponse<'a>),
}

impl<'a> MopPacket<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let code = *buf.first().ok_or(Error::MissingData)?;
        let code = MopCode::try_from(code).map_err(|_| Error::InvalidTag)?;

        Ok(match code {
            MopCode::RequestId => Self::RequestId(RequestId::decode(buf)?),
            MopCode::SysId => Self::SysId(SysId::decode(buf)?),
            MopCode::RequestCounters => Self::RequestCounters(RequestCounters::decode(buf)?),
            MopCode::Counters => Self::Counters(Counters::decode(buf)?),
            MopCode::ConsoleRequest => Self::ConsoleRequest(ConsoleRequest::decode(buf)?),
            MopCode::ConsoleRelease => Self::ConsoleRelease(ConsoleRelease::decode(buf)?),
            MopCode::ConsoleCommand => Self::ConsoleCommand(ConsoleCommand::decode(buf)?),
            MopCode::ConsoleResponse => Self::ConsoleResponse(ConsoleResponse::decode(buf)?),
        })
    }
}

/// Function codes inside a loop frame.
pub const LOOP_FWD: u16 = 2;
pub const LOOP_REPLY: u16 = 1;

/// The outer header of every loop frame: a byte count to skip, which
/// grows as forwarders peel off their forward headers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LoopSkip<'a> {
    pub skip: u16,
    /// Everything after the skip word, untouched.
    pub payload: &'a [u8],
}

impl<'a> LoopSkip<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        let skip = bytes.u16_le()?;

        Ok(Self {
            skip,
            payload: bytes.remaining(),
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.u16_le(self.skip)?.push(self.payload)?;

        let len = out.len();
        Ok(&buf[..len])
    }

    /// The active body of the frame after honoring the skip count, or
    /// an error for odd or out-of-range skips.
    pub fn body(&self) -> Result<&'a [u8], Error> {
        let skip = self.skip as usize;
        if self.skip % 2 != 0 || skip + 2 > self.payload.len() {
            return Err(Error::FormatError);
        }
        Ok(&self.payload[skip..])
    }
}

/// A loop body: either a forward request or the final reply.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LoopBody<'a> {
    Fwd { dest: EthAddr },
    Reply { receipt: u16, data: &'a [u8] },
}

impl<'a> LoopBody<'a> {
    pub fn decode(body: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(body);
        match bytes.u16_le()? {
            LOOP_FWD => Ok(Self::Fwd {
                dest: EthAddr::new(bytes.arr::<6>()?),
            }),
            LOOP_REPLY => Ok(Self::Reply {
                receipt: bytes.u16_le()?,
                data: bytes.remaining(),
            }),
            _ => Err(Error::InvalidTag),
        }
    }
}

/// Build a loop frame: skip 0, a forward header per assistant hop,
/// and a trailing reply carrying the receipt.
pub fn build_loop<'o>(
    forwarders: &[EthAddr],
    receipt: u16,
    data: &[u8],
    buf: &'o mut [u8],
) -> Result<&'o [u8], Error> {
    let mut out = BytesOut::new(buf);
    out.u16_le(0)?;
    for dest in forwarders {
        out.u16_le(LOOP_FWD)?.push(&dest.0)?;
    }
    out.u16_le(LOOP_REPLY)?.u16_le(receipt)?.push(data)?;

    let len = out.len();
    Ok(&buf[..len])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addr::NodeAddr;

    #[test]
    fn sysid_round_trip() {
        let mut functions = SysIdFunctions::default();
        functions.set(SysIdFunctions::LOOP, true);
        functions.set(SysIdFunctions::COUNTERS, true);
        functions.set(SysIdFunctions::CARRIER, true);

        let id = SysId {
            receipt: 0,
            version: Some(SysId::DEF_VERSION),
            functions,
            console_user: None,
            reservation_timer: Some(15),
            console_cmd_size: Some(512),
            console_resp_size: Some(512),
            hwaddr: Some(EthAddr::new([2, 0, 0, 0, 0, 1])),
            device: Some(9),
            software: Some(SoftwareId::Name("dnet")),
            processor: Some(2),
            datalink: Some(1),
        };

        let mut buf = [0u8; 128];
        let encoded = id.encode(&mut buf).unwrap();
        assert_eq!(encoded[0], 7);

        let back = SysId::decode(encoded).unwrap();
        assert_eq!(back, id);
        assert!(back.functions.has(SysIdFunctions::CARRIER));
        assert!(!back.functions.has(SysIdFunctions::CARRIER_RESERVED));
    }

    #[test]
    fn sysid_wild_tag() {
        // receipt 1, one unknown tag (999) and a known hwaddr after it
        let mut buf = [0u8; 64];
        let frame = {
            let mut out = BytesOut::new(&mut buf);
            out.byte(7)
                .unwrap()
                .byte(0)
                .unwrap()
                .u16_le(1)
                .unwrap()
                .u16_le(999)
                .unwrap()
                .byte(3)
                .unwrap()
                .push(&[1, 2, 3])
                .unwrap()
                .u16_le(7)
                .unwrap()
                .byte(6)
                .unwrap()
                .push(&[2, 0, 0, 0, 0, 7])
                .unwrap();
            out.finish()
        };
        let id = SysId::decode(frame).unwrap();
        assert_eq!(id.receipt, 1);
        assert_eq!(id.hwaddr, Some(EthAddr::new([2, 0, 0, 0, 0, 7])));
    }

    #[test]
    fn request_and_counters() {
        let req = RequestCounters { receipt: 0x1234 };
        let mut buf = [0u8; 8];
        let encoded = req.encode(&mut buf).unwrap();
        assert_eq!(encoded, &[9, 0x34, 0x12]);

        let reply = Counters {
            receipt: 0x1234,
            time_since_zeroed: 60,
            bytes_recv: 1000,
            pkts_recv: 10,
            ..Default::default()
        };
        let mut buf = [0u8; 64];
        let encoded = reply.encode(&mut buf).unwrap();
        let back = Counters::decode(encoded).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn console_command_seq() {
        let cmd = ConsoleCommand {
            seq: true,
            brk: false,
            payload: b"ls\r",
        };
        let mut buf = [0u8; 16];
        let encoded = cmd.encode(&mut buf).unwrap();
        assert_eq!(encoded, &[17, 1, b'l', b's', b'\r']);

        match MopPacket::decode(encoded).unwrap() {
            MopPacket::ConsoleCommand(c) => assert_eq!(c, cmd),
            other => panic!("wrong class: {:?}", other),
        }
    }

    #[test]
    fn loop_chain() {
        let fwd = EthAddr::from_node(NodeAddr::new(1, 3));
        let mut buf = [0u8; 128];
        let frame = build_loop(&[fwd], 42, b"loop data", &mut buf).unwrap();

        // First hop sees a forward request
        let skip = LoopSkip::decode(frame).unwrap();
        assert_eq!(skip.skip, 0);
        match LoopBody::decode(skip.body().unwrap()).unwrap() {
            LoopBody::Fwd { dest } => assert_eq!(dest, fwd),
            other => panic!("wrong body: {:?}", other),
        }

        // The forwarder bumps the skip count past the Fwd header
        let bumped = LoopSkip {
            skip: skip.skip + 8,
            payload: skip.payload,
        };
        let mut buf2 = [0u8; 128];
        let relayed = bumped.encode(&mut buf2).unwrap();

        let skip = LoopSkip::decode(relayed).unwrap();
        match LoopBody::decode(skip.body().unwrap()).unwrap() {
            LoopBody::Reply { receipt, data } => {
                assert_eq!(receipt, 42);
                assert_eq!(data, b"loop data");
            }
            other => panic!("wrong body: {:?}", other),
        }
    }

    #[test]
    fn loop_bad_skip() {
        let frame = [3u8, 0, 1, 0, 0, 0];
        let skip = LoopSkip::decode(&frame).unwrap();
        assert!(skip.body().is_err());
    }
}
