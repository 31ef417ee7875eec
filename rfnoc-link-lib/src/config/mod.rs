mod loader;
mod types;

pub use loader::load_from_path;
pub use types::{CoreConfig, CtrlConfig, LinkConfig, OffloadConfig, StreamConfig};
