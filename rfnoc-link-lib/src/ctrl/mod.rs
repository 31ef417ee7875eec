//! Control-plane transports: the CHDR control transport that demuxes
//! management and control packets for one endpoint, and the register
//! peek/poke endpoint built on top of it.

mod endpoint;
mod xport;

pub use endpoint::CtrlEndpoint;
pub use xport::ChdrCtrlXport;
