#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)]

//! Traits for the datalink ports the dnet stack runs on top of.
//!
//! Physical datalinks (Ethernet capture, UDP/TCP encapsulation, DDCMP
//! framing) are external collaborators; the stack only needs the
//! narrow contracts below.  Implementations decide what a "frame" is
//! on their medium and deliver routing-layer payloads.

use embedded_io_async::ErrorType;

use dnet_wire::EthAddr;

/// Ethernet protocol types used by the stack, big-endian as on the
/// wire.
pub mod proto {
    /// MOP dump/load.
    pub const MOP_DL: u16 = 0x6001;
    /// MOP console (remote console / SysId).
    pub const MOP_CONSOLE: u16 = 0x6002;
    /// DECnet Phase IV routing.
    pub const ROUTING: u16 = 0x6003;
    /// Ethernet loopback.
    pub const LOOPBACK: u16 = 0x9000;
}

/// Well-known multicast destinations.
pub mod mcast {
    pub use dnet_wire::addr::{
        ALL_ENDNODES, ALL_L2_ROUTERS, ALL_ROUTERS, CONSOLE_MC, LOOP_MC,
    };
}

/// A broadcast-capable (Ethernet-style) port bound to one protocol
/// type.
pub trait LanPort: ErrorType {
    /// Receive one frame's payload; the result carries the payload
    /// length and the source station address.
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(usize, EthAddr), Self::Error>;

    /// Send a payload to the given station or multicast address.
    async fn send(&mut self, dest: EthAddr, data: &[u8]) -> Result<(), Self::Error>;

    /// Subscribe to a multicast address.
    async fn add_multicast(&mut self, addr: EthAddr) -> Result<(), Self::Error>;

    /// The station address this port transmits from.
    fn macaddr(&self) -> EthAddr;

    /// The underlying adapter's hardware address, where it differs
    /// from the DECnet-style station address.
    fn hwaddr(&self) -> EthAddr {
        self.macaddr()
    }
}

/// A point-to-point link carrying routing-layer packets.
pub trait PtpLink: ErrorType {
    /// Bring the link up.  Completion is signalled by the first
    /// successful `receive` or by the implementation-specific status
    /// stream; the stack treats `open` returning Ok as "datalink up".
    async fn open(&mut self) -> Result<(), Self::Error>;

    /// Take the link down.
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Receive one packet.
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    /// Send one packet.
    async fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Whether this datalink detects a remote restart itself.  When
    /// false, the stack applies the init-in-running workaround.
    fn start_works(&self) -> bool {
        true
    }
}

impl<T> LanPort for &mut T
where
    T: LanPort,
{
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(usize, EthAddr), Self::Error> {
        (**self).receive(buffer).await
    }

    async fn send(&mut self, dest: EthAddr, data: &[u8]) -> Result<(), Self::Error> {
        (**self).send(dest, data).await
    }

    async fn add_multicast(&mut self, addr: EthAddr) -> Result<(), Self::Error> {
        (**self).add_multicast(addr).await
    }

    fn macaddr(&self) -> EthAddr {
        (**self).macaddr()
    }

    fn hwaddr(&self) -> EthAddr {
        (**self).hwaddr()
    }
}

impl<T> PtpLink for &mut T
where
    T: PtpLink,
{
    async fn open(&mut self) -> Result<(), Self::Error> {
        (**self).open().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        (**self).close().await
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        (**self).receive(buffer).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        (**self).send(data).await
    }

    fn start_works(&self) -> bool {
        (**self).start_works()
    }
}
