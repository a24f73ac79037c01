//! SMM rendezvous engine.
//!
//! Every core funnels through [`rendezvous::smi_rendezvous`] on SMI.
//! The arrival counter, sticky BSP election, the two timed arrival
//! windows and the MTRR handshake live in [`rendezvous`]; the shared
//! session state in [`session`]; remote per-core dispatch in
//! [`dispatch`]; the rollover-tolerant window timer in [`timer`].

pub mod dispatch;
pub mod rendezvous;
pub mod session;
pub mod timer;

pub use dispatch::{smm_blocking_startup_this_ap, smm_startup_this_ap, smm_switch_bsp};
pub use rendezvous::smi_rendezvous;
pub use session::{SmmBody, SmmCpuData, SmmProcedure, SmmSync};
