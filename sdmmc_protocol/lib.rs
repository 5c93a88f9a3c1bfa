//! SD/MMC command-execution and device bring-up engine.
//!
//! The protocol core is controller-agnostic: every hardware family plugs
//! in behind [`sdmmc_traits::SdmmcHardware`], and the dispatch engine,
//! identification state machine and bus negotiation sequencer are written
//! purely against that trait. A higher-level storage resource manager
//! consumes this crate as a library; there is no wire format here.

pub mod sdmmc;
pub mod sdmmc_os;
pub mod sdmmc_traits;
