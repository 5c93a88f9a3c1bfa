//! Reference hardware back-end for SDHCI-compatible host controllers.
//!
//! The protocol layer drives this crate exclusively through the
//! `SdmmcHardware` trait; nothing here leaks into the engine. The platform
//! layer is responsible for mapping the register window and routing the
//! controller interrupt into the worker queue.

pub mod sdhci_host;

pub use sdhci_host::SdhciHost;
