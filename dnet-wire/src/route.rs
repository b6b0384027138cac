//! Routing-layer frames: data packet headers, point-to-point control
//! messages, LAN hellos and routing updates, plus the Phase II
//! compatibility formats.
//!
//! Frames decode from a full routing-layer buffer (flags byte first)
//! and encode into a caller buffer.  The leading byte, masked per
//! class, selects the concrete type; `RoutePacket::decode` performs
//! that dispatch.

use crate::addr::{EthAddr, NodeAddr, NodeType, Version, HIORD};
use crate::bytes::{BytesIn, BytesOut};
use crate::Error;

/// Fill byte for hello test data.
pub const TESTDATA_FILL: u8 = 0xAA;

const SHORT_FLAGS: u8 = 0x02;
const LONG_FLAGS: u8 = 0x06;
const DATA_MASK: u8 = 0xc7;

const CTL_MASK: u8 = 0x8f;
const PTP_INIT_FLAGS: u8 = 0x01;
const PTP_VERIFY_FLAGS: u8 = 0x03;
const PTP_HELLO_FLAGS: u8 = 0x05;
const L1_ROUTING_FLAGS: u8 = 0x07;
const L2_ROUTING_FLAGS: u8 = 0x09;
const ROUTER_HELLO_FLAGS: u8 = 0x0b;
const ENDNODE_HELLO_FLAGS: u8 = 0x0d;
const ENDNODE_HELLO_PRIME_FLAGS: u8 = 0x0f;

const P2_START_FLAGS: u8 = 0x58;
const P2_NOP_FLAGS: u8 = 0x08;
const P2_ROUTEHDR_MASK: u8 = 0xf3;
const P2_ROUTEHDR_FLAGS: u8 = 0x42;

/// Skip a leading pad byte (bit 7 set, low 7 bits the total pad
/// length).  A second pad header is an error.
pub fn strip_padding(buf: &[u8]) -> Result<&[u8], Error> {
    if buf.is_empty() {
        return Err(Error::MissingData);
    }
    if buf[0] & 0x80 == 0 {
        return Ok(buf);
    }
    let pad = (buf[0] & 0x7f) as usize;
    if pad == 0 || pad > buf.len() {
        return Err(Error::MissingData);
    }
    let rest = &buf[pad..];
    match rest.first() {
        None => Err(Error::MissingData),
        Some(b) if b & 0x80 != 0 => Err(Error::FormatError),
        _ => Ok(rest),
    }
}

/// Short-format data packet header, used on point-to-point circuits.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ShortData<'a> {
    pub rqr: bool,
    pub rts: bool,
    pub dst: NodeAddr,
    pub src: NodeAddr,
    pub visit: u8,
    pub payload: &'a [u8],
}

impl<'a> ShortData<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        let flags = bytes.byte()?;
        if flags & DATA_MASK != SHORT_FLAGS {
            return Err(Error::WrongValue);
        }

        Ok(Self {
            rqr: flags & 0x08 != 0,
            rts: flags & 0x10 != 0,
            dst: bytes.u16_le()?.into(),
            src: bytes.u16_le()?.into(),
            visit: bytes.byte()? & 0x3f,
            payload: bytes.remaining(),
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);

        out.byte(SHORT_FLAGS | ((self.rqr as u8) << 3) | ((self.rts as u8) << 4))?
            .u16_le(self.dst.raw())?
            .u16_le(self.src.raw())?
            .byte(self.visit & 0x3f)?
            .push(self.payload)?;

        let len = out.len();
        Ok(&buf[..len])
    }

    /// Rewrap into the long format for transmission on a LAN.
    pub fn to_long(&self) -> LongData<'a> {
        LongData {
            rqr: self.rqr,
            rts: self.rts,
            ie: false,
            dst: self.dst,
            src: self.src,
            visit: self.visit,
            payload: self.payload,
        }
    }
}

/// Long-format data packet header, required on broadcast circuits.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct LongData<'a> {
    pub rqr: bool,
    pub rts: bool,
    /// "Intra-Ethernet": the packet has not left its arrival LAN.
    pub ie: bool,
    pub dst: NodeAddr,
    pub src: NodeAddr,
    pub visit: u8,
    pub payload: &'a [u8],
}

impl<'a> LongData<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        let flags = bytes.byte()?;
        if flags & DATA_MASK != LONG_FLAGS {
            return Err(Error::WrongValue);
        }

        bytes.arr::<2>()?; // d-area, d-subarea
        if bytes.arr::<4>()? != HIORD {
            return Err(Error::WrongValue);
        }
        let dst = bytes.u16_le()?.into();
        bytes.arr::<2>()?; // s-area, s-subarea
        if bytes.arr::<4>()? != HIORD {
            return Err(Error::WrongValue);
        }
        let src = bytes.u16_le()?.into();
        bytes.byte()?;
        let visit = bytes.byte()?;
        bytes.arr::<2>()?; // s-class, pt

        Ok(Self {
            rqr: flags & 0x08 != 0,
            rts: flags & 0x10 != 0,
            ie: flags & 0x20 != 0,
            dst,
            src,
            visit,
            payload: bytes.remaining(),
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);

        out.byte(
            LONG_FLAGS
                | ((self.rqr as u8) << 3)
                | ((self.rts as u8) << 4)
                | ((self.ie as u8) << 5),
        )?
        .zeroes(2)?
        .push(&HIORD)?
        .u16_le(self.dst.raw())?
        .zeroes(2)?
        .push(&HIORD)?
        .u16_le(self.src.raw())?
        .byte(0)?
        .byte(self.visit)?
        .zeroes(2)?
        .push(self.payload)?;

        let len = out.len();
        Ok(&buf[..len])
    }

    pub fn to_short(&self) -> ShortData<'a> {
        ShortData {
            rqr: self.rqr,
            rts: self.rts,
            dst: self.dst,
            src: self.src,
            visit: self.visit & 0x3f,
            payload: self.payload,
        }
    }
}

/// Phase IV point-to-point initialization message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PtpInit {
    pub srcnode: NodeAddr,
    pub ntype: NodeType,
    pub verif: bool,
    pub blo: bool,
    pub blksize: u16,
    pub tiver: Version,
    pub timer: u16,
}

impl PtpInit {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? & CTL_MASK != PTP_INIT_FLAGS {
            return Err(Error::WrongValue);
        }
        let srcnode: NodeAddr = bytes.u16_le()?.into();
        if srcnode.is_nil() {
            return Err(Error::FormatError);
        }
        let info = bytes.byte()?;
        let blksize = bytes.u16_le()?;
        let tiver = Version::decode(&mut bytes)?;
        let timer = bytes.u16_le()?;
        bytes.image(64)?;

        Ok(Self {
            srcnode,
            // The 2-bit field cannot produce an out-of-range value
            ntype: NodeType::try_from(info & 0x03).map_err(|_| Error::FormatError)?,
            verif: info & 0x04 != 0,
            blo: info & 0x08 != 0,
            blksize,
            tiver,
            timer,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);

        out.byte(PTP_INIT_FLAGS)?
            .u16_le(self.srcnode.raw())?
            .byte((self.ntype as u8) | ((self.verif as u8) << 2) | ((self.blo as u8) << 3))?
            .u16_le(self.blksize)?;
        self.tiver.encode(&mut out)?;
        out.u16_le(self.timer)?.byte(0)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Phase III point-to-point initialization message: like the Phase IV
/// one but without the hello timer field, and with an 8-bit source.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PtpInit3 {
    pub srcnode: NodeAddr,
    pub ntype: NodeType,
    pub verif: bool,
    pub blo: bool,
    pub blksize: u16,
    pub tiver: Version,
}

impl PtpInit3 {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? & CTL_MASK != PTP_INIT_FLAGS {
            return Err(Error::WrongValue);
        }
        let raw = bytes.u16_le()?;
        if raw == 0 || raw > 255 {
            return Err(Error::FormatError);
        }
        let info = bytes.byte()?;
        let blksize = bytes.u16_le()?;
        let tiver = Version::decode(&mut bytes)?;
        bytes.image(64)?;

        Ok(Self {
            srcnode: raw.into(),
            ntype: NodeType::try_from(info & 0x03).map_err(|_| Error::FormatError)?,
            verif: info & 0x04 != 0,
            blo: info & 0x08 != 0,
            blksize,
            tiver,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);

        out.byte(PTP_INIT_FLAGS)?
            .u16_le(self.srcnode.raw() & 0xff)?
            .byte((self.ntype as u8) | ((self.verif as u8) << 2) | ((self.blo as u8) << 3))?
            .u16_le(self.blksize)?;
        self.tiver.encode(&mut out)?;
        out.byte(0)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Point-to-point verification message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PtpVerify<'a> {
    pub srcnode: NodeAddr,
    pub fcnval: &'a [u8],
}

impl<'a> PtpVerify<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? & CTL_MASK != PTP_VERIFY_FLAGS {
            return Err(Error::WrongValue);
        }

        Ok(Self {
            srcnode: bytes.u16_le()?.into(),
            fcnval: bytes.image(64)?,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);

        out.byte(PTP_VERIFY_FLAGS)?
            .u16_le(self.srcnode.raw())?
            .image(self.fcnval)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Point-to-point hello message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PtpHello<'a> {
    pub srcnode: NodeAddr,
    pub testdata: &'a [u8],
}

impl<'a> PtpHello<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? & CTL_MASK != PTP_HELLO_FLAGS {
            return Err(Error::WrongValue);
        }

        Ok(Self {
            srcnode: bytes.u16_le()?.into(),
            testdata: bytes.image(128)?,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);

        out.byte(PTP_HELLO_FLAGS)?
            .u16_le(self.srcnode.raw())?
            .image(self.testdata)?;

        let len = out.len();
        Ok(&buf[..len])
    }

    pub fn testdata_ok(&self) -> bool {
        testdata_ok(self.testdata)
    }
}

/// Test data must be a (possibly empty) run of the 0xAA fill pattern.
pub fn testdata_ok(data: &[u8]) -> bool {
    data.iter().all(|b| *b == TESTDATA_FILL)
}

/// One router listed in a router hello E-list.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RSent {
    pub router: NodeAddr,
    pub prio: u8,
    pub twoway: bool,
}

impl RSent {
    pub const WIRE_LEN: usize = 7;

    fn decode(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        if bytes.arr::<4>()? != HIORD {
            return Err(Error::WrongValue);
        }
        let router = bytes.u16_le()?.into();
        let info = bytes.byte()?;

        Ok(Self {
            router,
            prio: info & 0x7f,
            twoway: info & 0x80 != 0,
        })
    }

    fn encode(&self, out: &mut BytesOut<'_>) -> Result<(), Error> {
        out.push(&HIORD)?
            .u16_le(self.router.raw())?
            .byte((self.prio & 0x7f) | ((self.twoway as u8) << 7))?;
        Ok(())
    }
}

/// The router list carried in a router hello, kept in wire form and
/// walked lazily.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RSlist<'a>(&'a [u8]);

impl<'a> RSlist<'a> {
    pub const EMPTY: RSlist<'static> = RSlist(&[]);

    pub fn iter(&self) -> impl Iterator<Item = RSent> + 'a {
        let mut bytes = BytesIn::new(self.0);
        core::iter::from_fn(move || {
            if bytes.is_empty() {
                None
            } else {
                // Validated at frame decode
                RSent::decode(&mut bytes).ok()
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Router hello, multicast to all routers (and all endnodes when the
/// sender is the designated router).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RouterHello<'a> {
    pub tiver: Version,
    pub id: NodeAddr,
    pub ntype: NodeType,
    pub blksize: u16,
    pub prio: u8,
    pub timer: u16,
    pub elist: RSlist<'a>,
}

impl<'a> RouterHello<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? & CTL_MASK != ROUTER_HELLO_FLAGS {
            return Err(Error::WrongValue);
        }
        let tiver = Version::decode(&mut bytes)?;
        if bytes.arr::<4>()? != HIORD {
            return Err(Error::WrongValue);
        }
        let id = bytes.u16_le()?.into();
        let ntype = NodeType::try_from(bytes.byte()? & 0x03).map_err(|_| Error::FormatError)?;
        let blksize = bytes.u16_le()?;
        let prio = bytes.byte()?;
        bytes.byte()?; // area
        let timer = bytes.u16_le()?;
        bytes.byte()?; // mpd

        let elist = bytes.image(244)?;
        let mut inner = BytesIn::new(elist);
        inner.slice(7)?;
        let rslist = inner.image(236)?;
        if rslist.len() % RSent::WIRE_LEN != 0 {
            return Err(Error::FormatError);
        }
        // Validate the entries once so iteration can be infallible
        let list = RSlist(rslist);
        let mut check = BytesIn::new(rslist);
        while !check.is_empty() {
            RSent::decode(&mut check)?;
        }

        Ok(Self {
            tiver,
            id,
            ntype,
            blksize,
            prio,
            timer,
            elist: list,
        })
    }

    /// Encode with the given set of E-list entries.
    pub fn encode<'o>(&self, routers: &[RSent], buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let rslen = routers.len() * RSent::WIRE_LEN;
        if rslen > 236 {
            return Err(Error::FormatError);
        }

        let mut out = BytesOut::new(buf);
        out.byte(ROUTER_HELLO_FLAGS)?;
        self.tiver.encode(&mut out)?;
        out.push(&HIORD)?
            .u16_le(self.id.raw())?
            .byte(self.ntype as u8)?
            .u16_le(self.blksize)?
            .byte(self.prio)?
            .byte(0)?
            .u16_le(self.timer)?
            .byte(0)?
            .byte((7 + 1 + rslen) as u8)?
            .zeroes(7)?
            .byte(rslen as u8)?;
        for r in routers {
            r.encode(&mut out)?;
        }

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Endnode hello, multicast to all routers.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EndnodeHello<'a> {
    pub tiver: Version,
    pub id: NodeAddr,
    pub blksize: u16,
    /// The designated router the sender currently uses, or the null
    /// address.
    pub neighbor: EthAddr,
    pub timer: u16,
    pub testdata: &'a [u8],
}

impl<'a> EndnodeHello<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        let flags = bytes.byte()? & CTL_MASK;
        if flags != ENDNODE_HELLO_FLAGS && flags != ENDNODE_HELLO_PRIME_FLAGS {
            return Err(Error::WrongValue);
        }
        let tiver = Version::decode(&mut bytes)?;
        if bytes.arr::<4>()? != HIORD {
            return Err(Error::WrongValue);
        }
        let id = bytes.u16_le()?.into();
        if bytes.byte()? & 0x03 != NodeType::Endnode as u8 {
            return Err(Error::FormatError);
        }
        let blksize = bytes.u16_le()?;
        bytes.slice(9)?; // area and seed
        let neighbor = EthAddr::new(bytes.arr::<6>()?);
        let timer = bytes.u16_le()?;
        bytes.byte()?;
        let testdata = bytes.image(128)?;

        Ok(Self {
            tiver,
            id,
            blksize,
            neighbor,
            timer,
            testdata,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(ENDNODE_HELLO_FLAGS)?;
        self.tiver.encode(&mut out)?;
        out.push(&HIORD)?
            .u16_le(self.id.raw())?
            .byte(NodeType::Endnode as u8)?
            .u16_le(self.blksize)?
            .zeroes(9)?
            .push(&self.neighbor.0)?
            .u16_le(self.timer)?
            .byte(0)?
            .image(self.testdata)?;

        let len = out.len();
        Ok(&buf[..len])
    }

    pub fn testdata_ok(&self) -> bool {
        testdata_ok(self.testdata)
    }
}

/// Which routing update format a message is in.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum UpdateKind {
    Level1,
    Level2,
    Phase3,
}

/// One advertised destination: raw hops/cost as carried on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RouteEntry {
    pub id: u16,
    pub hops: u8,
    pub cost: u16,
}

impl RouteEntry {
    pub const fn from_word(id: u16, word: u16) -> Self {
        Self {
            id,
            hops: (word >> 10) as u8,
            cost: word & 0x3ff,
        }
    }

    pub const fn to_word(hops: u8, cost: u16) -> u16 {
        ((hops as u16) << 10) | (cost & 0x3ff)
    }
}

/// A received routing update.  The segment data is kept in wire form,
/// validated once at decode, and walked lazily by `entries`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RoutingUpdate<'a> {
    pub srcnode: NodeAddr,
    pub kind: UpdateKind,
    body: &'a [u8],
}

fn ones_carry(mut sum: u32) -> u16 {
    sum = (sum & 0xffff) + (sum >> 16);
    sum = (sum & 0xffff) + (sum >> 16);
    sum as u16
}

/// The checksum residue of an update payload (segments plus trailing
/// checksum word): the last word is complemented and everything is
/// summed ones-complement.  A valid Phase IV payload leaves 0xfffe, a
/// valid Phase III payload 0xffff.
pub fn update_residue(payload: &[u8]) -> u16 {
    let mut sum = 0u32;
    let words = payload.len() / 2;
    for i in 0..words {
        let w = u16::from_le_bytes([payload[2 * i], payload[2 * i + 1]]);
        let w = if i == words - 1 { !w } else { w };
        sum += w as u32;
    }
    ones_carry(sum)
}

impl<'a> RoutingUpdate<'a> {
    const MAX_L1_ID: u16 = 1023;
    const MAX_AREA: u16 = 63;

    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        let flags = bytes.byte()? & CTL_MASK;
        let srcnode: NodeAddr = bytes.u16_le()?.into();
        bytes.byte()?;

        let payload = bytes.remaining();
        if payload.len() < 4 || payload.len() % 2 != 0 {
            return Err(Error::FormatError);
        }

        let kind = match (flags, update_residue(payload)) {
            (L1_ROUTING_FLAGS, 0xfffe) => UpdateKind::Level1,
            (L1_ROUTING_FLAGS, 0xffff) => UpdateKind::Phase3,
            (L2_ROUTING_FLAGS, 0xfffe) => UpdateKind::Level2,
            (L1_ROUTING_FLAGS | L2_ROUTING_FLAGS, _) => return Err(Error::ChecksumError),
            _ => return Err(Error::WrongValue),
        };

        let body = &payload[..payload.len() - 2];
        let update = Self {
            srcnode,
            kind,
            body,
        };
        update.validate()?;

        Ok(update)
    }

    fn validate(&self) -> Result<(), Error> {
        if matches!(self.kind, UpdateKind::Phase3) {
            return Ok(());
        }
        let (maxid, minstart) = match self.kind {
            UpdateKind::Level1 => (Self::MAX_L1_ID, 0),
            _ => (Self::MAX_AREA, 1),
        };
        let mut bytes = BytesIn::new(self.body);
        while !bytes.is_empty() {
            let count = bytes.u16_le()? as u32;
            let startid = bytes.u16_le()? as u32;
            if count == 0 || startid < minstart as u32 || count + startid > maxid as u32 + 1 {
                return Err(Error::FormatError);
            }
            bytes.slice(count as usize * 2)?;
        }
        Ok(())
    }

    /// Walk the advertised entries as raw (id, hops, cost) triples.
    pub fn entries(&self) -> impl Iterator<Item = RouteEntry> + 'a {
        let phase3 = matches!(self.kind, UpdateKind::Phase3);
        let mut bytes = BytesIn::new(self.body);
        let mut id = 0u16;
        let mut left = 0u16;
        if phase3 {
            id = 1;
            left = (self.body.len() / 2) as u16;
        }
        core::iter::from_fn(move || {
            if left == 0 {
                if phase3 || bytes.is_empty() {
                    return None;
                }
                // Validated at frame decode
                left = bytes.u16_le().ok()?;
                id = bytes.u16_le().ok()?;
            }
            let word = bytes.u16_le().ok()?;
            let entry = RouteEntry::from_word(id, word);
            id += 1;
            left -= 1;
            Some(entry)
        })
    }
}

/// Push-style builder for outgoing routing updates.  Segments are
/// opened explicitly for the Phase IV formats; the Phase III format
/// is a single run starting at id 1.
pub struct UpdateBuilder<'a> {
    out: BytesOut<'a>,
    kind: UpdateKind,
    count_at: Option<usize>,
    count: u16,
}

impl<'a> UpdateBuilder<'a> {
    /// Bytes of fixed framing: header plus checksum.
    pub const OVERHEAD: usize = 6;
    /// Bytes added by each segment header.
    pub const SEGMENT_OVERHEAD: usize = 4;

    pub fn new(kind: UpdateKind, srcnode: NodeAddr, buf: &'a mut [u8]) -> Result<Self, Error> {
        let mut out = BytesOut::new(buf);
        let flags = match kind {
            UpdateKind::Level2 => L2_ROUTING_FLAGS,
            _ => L1_ROUTING_FLAGS,
        };
        let src = match kind {
            UpdateKind::Phase3 => srcnode.raw() & 0x3ff,
            _ => srcnode.raw(),
        };
        out.byte(flags)?.u16_le(src)?.byte(0)?;

        Ok(Self {
            out,
            kind,
            count_at: None,
            count: 0,
        })
    }

    /// Current encoded length, checksum word included.
    pub fn len(&self) -> usize {
        self.out.len() + 2
    }

    pub fn is_empty(&self) -> bool {
        self.out.len() <= 4
    }

    pub fn start_segment(&mut self, startid: u16) -> Result<(), Error> {
        debug_assert!(!matches!(self.kind, UpdateKind::Phase3));
        self.close_segment();
        self.count_at = Some(self.out.len());
        self.out.u16_le(0)?.u16_le(startid)?;
        Ok(())
    }

    pub fn entry(&mut self, hops: u8, cost: u16) -> Result<(), Error> {
        if !matches!(self.kind, UpdateKind::Phase3) && self.count_at.is_none() {
            return Err(Error::FormatError);
        }
        self.out.u16_le(RouteEntry::to_word(hops, cost))?;
        self.count += 1;
        Ok(())
    }

    fn close_segment(&mut self) {
        if let Some(at) = self.count_at.take() {
            self.out.patch_u16_le(at, self.count);
        }
        self.count = 0;
    }

    pub fn finish(mut self) -> Result<&'a [u8], Error> {
        self.close_segment();

        let init: u32 = match self.kind {
            UpdateKind::Phase3 => 0,
            _ => 1,
        };
        let mut sum = init;
        for w in self.out.written()[4..].chunks_exact(2) {
            sum += u16::from_le_bytes([w[0], w[1]]) as u32;
        }
        let cksum = ones_carry(sum);
        self.out.u16_le(cksum)?;

        Ok(self.out.finish())
    }
}

/// Phase II node initialization message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct NodeInit<'a> {
    pub srcnode: NodeAddr,
    pub nodename: &'a str,
    /// Intercept functions offered (0 = none, 7 = full intercept).
    pub int: u8,
    pub verif: bool,
    /// Intercept services requested.
    pub rint: u8,
    pub blksize: u16,
    pub nspsize: u16,
    pub maxlnks: u16,
    pub routver: Version,
    pub commver: Version,
    pub sysver: &'a str,
}

impl<'a> NodeInit<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != P2_START_FLAGS {
            return Err(Error::WrongValue);
        }
        if bytes.byte()? != 1 {
            return Err(Error::WrongValue);
        }
        let raw = bytes.ex_le(2)?;
        if raw == 0 || raw > 255 {
            return Err(Error::FormatError);
        }
        let nodename = bytes.image_str(6)?;
        let int = bytes.byte()? & 0x07;
        let req = bytes.byte()?;

        Ok(Self {
            srcnode: raw.into(),
            nodename,
            int,
            verif: req & 0x01 != 0,
            rint: (req >> 1) & 0x03,
            blksize: bytes.u16_le()?,
            nspsize: bytes.u16_le()?,
            maxlnks: bytes.u16_le()?,
            routver: Version::decode(&mut bytes)?,
            commver: Version::decode(&mut bytes)?,
            sysver: bytes.image_str(32)?,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);

        out.byte(P2_START_FLAGS)?.byte(1)?;
        // Node numbers fit in one extensible byte up to 127
        let id = self.srcnode.tid();
        if id > 127 {
            out.byte((id & 0x7f) as u8 | 0x80)?.byte((id >> 7) as u8)?;
        } else {
            out.byte(id as u8)?;
        }
        out.image(self.nodename.as_bytes())?
            .byte(self.int & 0x07)?
            .byte((self.verif as u8) | ((self.rint & 0x03) << 1))?
            .u16_le(self.blksize)?
            .u16_le(self.nspsize)?
            .u16_le(self.maxlnks)?;
        self.routver.encode(&mut out)?;
        self.commver.encode(&mut out)?;
        out.image(self.sysver.as_bytes())?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Phase II node verification message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct NodeVerify {
    pub password: [u8; 8],
}

impl NodeVerify {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? != P2_START_FLAGS {
            return Err(Error::WrongValue);
        }
        if bytes.byte()? != 2 {
            return Err(Error::WrongValue);
        }

        Ok(Self {
            password: bytes.arr::<8>()?,
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(P2_START_FLAGS)?.byte(2)?.push(&self.password)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Phase II routing header, addressing by node name.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RouteHdr<'a> {
    pub dstnode: &'a str,
    pub srcnode: &'a str,
    pub payload: &'a [u8],
}

impl<'a> RouteHdr<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(buf);
        if bytes.byte()? & P2_ROUTEHDR_MASK != P2_ROUTEHDR_FLAGS {
            return Err(Error::WrongValue);
        }

        Ok(Self {
            dstnode: bytes.image_str(6)?,
            srcnode: bytes.image_str(6)?,
            payload: bytes.remaining(),
        })
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut out = BytesOut::new(buf);
        out.byte(0x46)?
            .image(self.dstnode.as_bytes())?
            .image(self.srcnode.as_bytes())?
            .push(self.payload)?;

        let len = out.len();
        Ok(&buf[..len])
    }
}

/// Any routing-layer frame, selected by the masked leading byte.
#[derive(Copy, Clone, Debug)]
pub enum RoutePacket<'a> {
    ShortData(ShortData<'a>),
    LongData(LongData<'a>),
    PtpInit(PtpInit),
    PtpInit3(PtpInit3),
    /// An init whose major version is newer than Phase IV; ignored
    /// rather than treated as an error.
    InitTooNew { major: u8 },
    PtpVerify(PtpVerify<'a>),
    PtpHello(PtpHello<'a>),
    Routing(RoutingUpdate<'a>),
    RouterHello(RouterHello<'a>),
    EndnodeHello(EndnodeHello<'a>),
    NodeInit(NodeInit<'a>),
    NodeVerify(NodeVerify),
    /// Phase II NOP message; absorbed without action.
    Nop,
    RouteHdr(RouteHdr<'a>),
    /// A bare Phase II NSP packet with no routing header at all.
    Phase2Data(&'a [u8]),
}

impl<'a> RoutePacket<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, Error> {
        let hdr = *buf.first().ok_or(Error::MissingData)?;

        if hdr & 0x01 != 0 {
            // Phase III/IV control packet
            return match (hdr >> 1) & 0x07 {
                0 => {
                    // Init; the major version selects the phase
                    let major = *buf.get(6).ok_or(Error::MissingData)?;
                    if major == Version::PH3.0 {
                        Ok(Self::PtpInit3(PtpInit3::decode(buf)?))
                    } else if major == Version::PH4.0 {
                        Ok(Self::PtpInit(PtpInit::decode(buf)?))
                    } else if major < Version::PH3.0 {
                        Err(Error::FormatError)
                    } else {
                        Ok(Self::InitTooNew { major })
                    }
                }
                1 => Ok(Self::PtpVerify(PtpVerify::decode(buf)?)),
                2 => Ok(Self::PtpHello(PtpHello::decode(buf)?)),
                3 | 4 => Ok(Self::Routing(RoutingUpdate::decode(buf)?)),
                5 => Ok(Self::RouterHello(RouterHello::decode(buf)?)),
                6 | 7 => Ok(Self::EndnodeHello(EndnodeHello::decode(buf)?)),
                _ => Err(Error::InvalidTag),
            };
        }

        match hdr & 0x07 {
            2 => Ok(Self::ShortData(ShortData::decode(buf)?)),
            6 => Ok(Self::LongData(LongData::decode(buf)?)),
            _ if hdr == P2_START_FLAGS => {
                match *buf.get(1).ok_or(Error::MissingData)? {
                    1 => Ok(Self::NodeInit(NodeInit::decode(buf)?)),
                    2 => Ok(Self::NodeVerify(NodeVerify::decode(buf)?)),
                    _ => Err(Error::InvalidTag),
                }
            }
            _ if hdr == P2_NOP_FLAGS => Ok(Self::Nop),
            _ if hdr & P2_ROUTEHDR_MASK == P2_ROUTEHDR_FLAGS => {
                Ok(Self::RouteHdr(RouteHdr::decode(buf)?))
            }
            _ if hdr & 0x83 == 0 => Ok(Self::Phase2Data(buf)),
            _ => Err(Error::InvalidTag),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ptp_init_phase4() {
        // Init from node 1.2, L1 router, no verification, block size
        // 528, version 2.0.0, hello timer 10
        let bytes = [
            0x01, 0x02, 0x04, 0x02, 0x10, 0x02, 0x02, 0x00, 0x00, 0x0a, 0x00, 0x00,
        ];
        let init = PtpInit::decode(&bytes).unwrap();
        assert_eq!(init.srcnode, NodeAddr::new(1, 2));
        assert_eq!(init.ntype, NodeType::L1Router);
        assert!(!init.verif);
        assert_eq!(init.blksize, 528);
        assert_eq!(init.tiver, Version::PH4);
        assert_eq!(init.timer, 10);

        let mut buf = [0u8; 64];
        assert_eq!(init.encode(&mut buf).unwrap(), &bytes);

        match RoutePacket::decode(&bytes).unwrap() {
            RoutePacket::PtpInit(i) => assert_eq!(i, init),
            other => panic!("wrong class: {:?}", other),
        }
    }

    #[test]
    fn ptp_init_too_new() {
        let mut bytes = [
            0x01, 0x02, 0x04, 0x02, 0x10, 0x02, 0x05, 0x00, 0x00, 0x0a, 0x00, 0x00,
        ];
        match RoutePacket::decode(&bytes).unwrap() {
            RoutePacket::InitTooNew { major: 5 } => (),
            other => panic!("wrong class: {:?}", other),
        }
        bytes[6] = 0;
        assert!(matches!(
            RoutePacket::decode(&bytes),
            Err(Error::FormatError)
        ));
    }

    #[test]
    fn ptp_hello_testdata() {
        let mut bytes = [TESTDATA_FILL; 132];
        bytes[0] = 0x05;
        bytes[1] = 0x02;
        bytes[2] = 0x04;
        bytes[3] = 0x80;
        let hello = PtpHello::decode(&bytes).unwrap();
        assert_eq!(hello.srcnode, NodeAddr::new(1, 2));
        assert_eq!(hello.testdata.len(), 128);
        assert!(hello.testdata_ok());

        bytes[70] = 0x55;
        let hello = PtpHello::decode(&bytes).unwrap();
        assert!(!hello.testdata_ok());
    }

    #[test]
    fn short_data() {
        let bytes = [0x02, 0x03, 0x04, 0x01, 0x08, 0x11, 0xde, 0xad];
        let pkt = ShortData::decode(&bytes).unwrap();
        assert_eq!(pkt.dst, NodeAddr::new(1, 3));
        assert_eq!(pkt.src, NodeAddr::new(2, 1));
        assert_eq!(pkt.visit, 0x11);
        assert!(!pkt.rqr);
        assert!(!pkt.rts);
        assert_eq!(pkt.payload, &[0xde, 0xad]);

        let mut buf = [0u8; 16];
        assert_eq!(pkt.encode(&mut buf).unwrap(), &bytes);
    }

    #[test]
    fn long_short_round_trip() {
        let pkt = ShortData {
            rqr: true,
            rts: false,
            dst: NodeAddr::new(1, 3),
            src: NodeAddr::new(2, 1),
            visit: 5,
            payload: b"payload",
        };
        let long = pkt.to_long();
        let mut buf = [0u8; 64];
        let encoded = long.encode(&mut buf).unwrap();
        assert_eq!(encoded[0], 0x0e); // long flags + rqr
        let back = LongData::decode(encoded).unwrap();
        assert_eq!(back.to_short(), pkt);
    }

    #[test]
    fn long_data_bad_hiord() {
        let pkt = LongData {
            rqr: false,
            rts: false,
            ie: true,
            dst: NodeAddr::new(1, 3),
            src: NodeAddr::new(2, 1),
            visit: 0,
            payload: b"",
        };
        let mut buf = [0u8; 32];
        let len = pkt.encode(&mut buf).unwrap().len();
        buf[3] = 0x55;
        assert!(matches!(LongData::decode(&buf[..len]), Err(Error::WrongValue)));
    }

    #[test]
    fn l1_update_round_trip() {
        let src = NodeAddr::new(1, 2);
        let mut buf = [0u8; 64];
        let mut b = UpdateBuilder::new(UpdateKind::Level1, src, &mut buf).unwrap();
        b.start_segment(1).unwrap();
        b.entry(1, 2).unwrap();
        b.entry(2, 3).unwrap();
        let encoded = b.finish().unwrap();
        assert_eq!(
            encoded,
            &[
                0x07, 0x02, 0x04, 0x00, 0x02, 0x00, 0x01, 0x00, 0x02, 0x04, 0x03, 0x08, 0x09,
                0x0c
            ]
        );

        let update = RoutingUpdate::decode(encoded).unwrap();
        assert_eq!(update.kind, UpdateKind::Level1);
        assert_eq!(update.srcnode, src);
        let entries: heapless::Vec<RouteEntry, 8> = update.entries().collect();
        assert_eq!(
            &entries[..],
            &[
                RouteEntry {
                    id: 1,
                    hops: 1,
                    cost: 2
                },
                RouteEntry {
                    id: 2,
                    hops: 2,
                    cost: 3
                }
            ]
        );
    }

    #[test]
    fn phase3_update_residue() {
        let src = NodeAddr::new(0, 2);
        let mut buf = [0u8; 64];
        let mut b = UpdateBuilder::new(UpdateKind::Phase3, src, &mut buf).unwrap();
        b.entry(1, 2).unwrap();
        b.entry(2, 3).unwrap();
        b.entry(3, 4).unwrap();
        let encoded = b.finish().unwrap();

        let update = RoutingUpdate::decode(encoded).unwrap();
        assert_eq!(update.kind, UpdateKind::Phase3);
        let entries: heapless::Vec<RouteEntry, 8> = update.entries().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, 1);
        assert_eq!(entries[2].cost, 4);
    }

    #[test]
    fn update_checksum_error() {
        let src = NodeAddr::new(1, 2);
        let mut buf = [0u8; 64];
        let mut b = UpdateBuilder::new(UpdateKind::Level1, src, &mut buf).unwrap();
        b.start_segment(1).unwrap();
        b.entry(1, 2).unwrap();
        let len = b.finish().unwrap().len();
        buf[5] ^= 0x40;
        assert!(matches!(
            RoutingUpdate::decode(&buf[..len]),
            Err(Error::ChecksumError)
        ));
    }

    #[test]
    fn l2_update_bad_segment() {
        // L2 segment with startid 0 must be rejected
        let mut buf = [0u8; 64];
        let mut b = UpdateBuilder::new(UpdateKind::Level2, NodeAddr::new(1, 2), &mut buf).unwrap();
        b.start_segment(0).unwrap();
        b.entry(1, 2).unwrap();
        let encoded = b.finish().unwrap();
        assert!(matches!(
            RoutingUpdate::decode(encoded),
            Err(Error::FormatError)
        ));
    }

    #[test]
    fn router_hello_elist() {
        let hello = RouterHello {
            tiver: Version::PH4,
            id: NodeAddr::new(1, 2),
            ntype: NodeType::L1Router,
            blksize: 1498,
            prio: 64,
            timer: 10,
            elist: RSlist::EMPTY,
        };
        let routers = [
            RSent {
                router: NodeAddr::new(1, 3),
                prio: 64,
                twoway: true,
            },
            RSent {
                router: NodeAddr::new(1, 4),
                prio: 32,
                twoway: false,
            },
        ];
        let mut buf = [0u8; 128];
        let encoded = hello.encode(&routers, &mut buf).unwrap();

        let back = RouterHello::decode(encoded).unwrap();
        assert_eq!(back.id, hello.id);
        assert_eq!(back.prio, 64);
        let ents: heapless::Vec<RSent, 8> = back.elist.iter().collect();
        assert_eq!(&ents[..], &routers);
    }

    #[test]
    fn endnode_hello_round_trip() {
        let hello = EndnodeHello {
            tiver: Version::PH4,
            id: NodeAddr::new(1, 5),
            blksize: 1498,
            neighbor: EthAddr::from_node(NodeAddr::new(1, 2)),
            timer: 10,
            testdata: &[TESTDATA_FILL; 50],
        };
        let mut buf = [0u8; 128];
        let encoded = hello.encode(&mut buf).unwrap();
        let back = EndnodeHello::decode(encoded).unwrap();
        assert_eq!(back.id, hello.id);
        assert_eq!(back.neighbor, hello.neighbor);
        assert!(back.testdata_ok());
    }

    #[test]
    fn padding() {
        let buf = [0x83, 0x00, 0x00, 0x02, 0x03, 0x04, 0x01, 0x08, 0x11];
        assert_eq!(strip_padding(&buf).unwrap()[0], 0x02);

        let double = [0x81, 0x81, 0x02];
        assert!(matches!(strip_padding(&double), Err(Error::FormatError)));
    }

    #[test]
    fn phase2_init_round_trip() {
        let init = NodeInit {
            srcnode: NodeAddr::new(0, 42),
            nodename: "FEP",
            int: 7,
            verif: false,
            rint: 0,
            blksize: 576,
            nspsize: 576,
            maxlnks: 32,
            routver: Version::PH2,
            commver: Version::NSP_PH2,
            sysver: "dnet",
        };
        let mut buf = [0u8; 80];
        let encoded = init.encode(&mut buf).unwrap();
        assert_eq!(encoded[0], 0x58);
        assert_eq!(encoded[1], 1);

        match RoutePacket::decode(encoded).unwrap() {
            RoutePacket::NodeInit(b) => {
                assert_eq!(b.srcnode, init.srcnode);
                assert_eq!(b.nodename, "FEP");
                assert_eq!(b.int, 7);
                assert_eq!(b.blksize, 576);
            }
            other => panic!("wrong class: {:?}", other),
        }
    }

    #[test]
    fn route_hdr() {
        let hdr = RouteHdr {
            dstnode: "HOST",
            srcnode: "FEP",
            payload: b"\x08data",
        };
        let mut buf = [0u8; 64];
        let encoded = hdr.encode(&mut buf).unwrap();
        assert_eq!(encoded[0], 0x46);
        let back = RouteHdr::decode(encoded).unwrap();
        assert_eq!(back.dstnode, "HOST");
        assert_eq!(back.srcnode, "FEP");
        assert_eq!(back.payload, b"\x08data");
    }
}
