#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)]

pub use dnet_stack as stack;
pub use dnet_timer as timer;
pub use dnet_wire as wire;
#[cfg(feature = "io")]
pub use dnet_nal as nal;
