//! DECnet addressing: 16-bit node addresses split into area and
//! intra-area id, their Ethernet MAC mapping, and protocol versions.

use core::fmt::{self, Display};

use num_enum::TryFromPrimitive;

use super::Error;

/// The DECnet OUI prefix: every Phase IV station MAC is
/// `AA-00-04-00-nn-nn` with the node address in the low two bytes,
/// little-endian.
pub const HIORD: [u8; 4] = [0xAA, 0x00, 0x04, 0x00];

/// All Phase IV routers multicast.
pub const ALL_ROUTERS: EthAddr = EthAddr::new([0xAB, 0x00, 0x00, 0x03, 0x00, 0x00]);
/// All Phase IV endnodes multicast.
pub const ALL_ENDNODES: EthAddr = EthAddr::new([0xAB, 0x00, 0x00, 0x04, 0x00, 0x00]);
/// All level 2 routers multicast (Phase IV plus).
pub const ALL_L2_ROUTERS: EthAddr = EthAddr::new([0x09, 0x00, 0x2B, 0x02, 0x00, 0x00]);
/// MOP console multicast.
pub const CONSOLE_MC: EthAddr = EthAddr::new([0xAB, 0x00, 0x00, 0x02, 0x00, 0x00]);
/// Loopback assistance multicast.
pub const LOOP_MC: EthAddr = EthAddr::new([0xCF, 0x00, 0x00, 0x00, 0x00, 0x00]);

/// A Phase IV node address: area in the high 6 bits, intra-area id in
/// the low 10.  Phase II/III addresses have area 0 and fit in 8 bits.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Debug)]
pub struct NodeAddr(u16);

impl NodeAddr {
    pub const fn new(area: u8, tid: u16) -> Self {
        Self(((area as u16) << 10) | (tid & 0x3ff))
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn area(self) -> u8 {
        (self.0 >> 10) as u8
    }

    pub const fn tid(self) -> u16 {
        self.0 & 0x3ff
    }

    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// Rewrite a Phase III (8-bit) address into the given home area.
    pub const fn in_area(self, area: u8) -> Self {
        Self::new(area, self.tid())
    }

    /// Truncate to the Phase III form: area stripped.
    pub const fn phase3(self) -> Self {
        Self(self.0 & 0x3ff)
    }
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.area() == 0 {
            write!(f, "{}", self.tid())
        } else {
            write!(f, "{}.{}", self.area(), self.tid())
        }
    }
}

impl From<u16> for NodeAddr {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<NodeAddr> for u16 {
    fn from(addr: NodeAddr) -> Self {
        addr.0
    }
}

/// An Ethernet station or multicast address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Debug)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    pub const NULL: Self = Self([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 1 != 0
    }

    pub const fn is_null(&self) -> bool {
        matches!(self.0, [0, 0, 0, 0, 0, 0])
    }

    /// The Phase IV MAC of a node address: HIORD plus the address in
    /// little-endian order.
    pub const fn from_node(addr: NodeAddr) -> Self {
        let raw = addr.raw().to_le_bytes();
        Self([HIORD[0], HIORD[1], HIORD[2], HIORD[3], raw[0], raw[1]])
    }

    /// The node address embedded in a HIORD-prefixed MAC, if any.
    pub fn node_addr(&self) -> Option<NodeAddr> {
        if self.0[..4] == HIORD {
            Some(NodeAddr::from_raw(u16::from_le_bytes([
                self.0[4], self.0[5],
            ])))
        } else {
            None
        }
    }
}

impl Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<NodeAddr> for EthAddr {
    fn from(addr: NodeAddr) -> Self {
        Self::from_node(addr)
    }
}

/// Node type code as carried in init and hello messages.
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum NodeType {
    /// A Phase II node (no routing layer).
    Phase2 = 0,
    /// A level 2 (area) router.
    L2Router = 1,
    /// A level 1 router.
    L1Router = 2,
    /// An endnode.
    Endnode = 3,
}

impl NodeType {
    pub const fn is_router(self) -> bool {
        matches!(self, Self::L1Router | Self::L2Router)
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phase2 => write!(f, "Phase 2 node"),
            Self::L2Router => write!(f, "Area router"),
            Self::L1Router => write!(f, "L1 router"),
            Self::Endnode => write!(f, "Endnode"),
        }
    }
}

/// A three-byte protocol version triple.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Version(pub u8, pub u8, pub u8);

impl Version {
    /// Phase II routing version.
    pub const PH2: Self = Self(3, 1, 0);
    /// Phase III routing version.
    pub const PH3: Self = Self(1, 3, 0);
    /// Phase IV routing version.
    pub const PH4: Self = Self(2, 0, 0);
    /// Phase II NSP version.
    pub const NSP_PH2: Self = Self(3, 1, 0);

    pub fn decode(bytes: &mut super::bytes::BytesIn<'_>) -> Result<Self, Error> {
        let arr = bytes.arr::<3>()?;
        Ok(Self(arr[0], arr[1], arr[2]))
    }

    pub fn encode(&self, out: &mut super::bytes::BytesOut<'_>) -> Result<(), Error> {
        out.push(&[self.0, self.1, self.2])?;
        Ok(())
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_addr_split() {
        let a = NodeAddr::new(2, 1);
        assert_eq!(a.raw(), 0x0801);
        assert_eq!(a.area(), 2);
        assert_eq!(a.tid(), 1);

        let b = NodeAddr::from_raw(0x0402);
        assert_eq!(b.area(), 1);
        assert_eq!(b.tid(), 2);
    }

    #[test]
    fn mac_mapping() {
        let a = NodeAddr::new(2, 4);
        let mac = EthAddr::from_node(a);
        assert_eq!(mac.0, [0xAA, 0x00, 0x04, 0x00, 0x04, 0x08]);
        assert_eq!(mac.node_addr(), Some(a));

        let other = EthAddr::new([0xAB, 0, 0, 3, 0, 0]);
        assert!(other.is_multicast());
        assert_eq!(other.node_addr(), None);
    }
}
