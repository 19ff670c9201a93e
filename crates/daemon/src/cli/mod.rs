pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Audit, Bootstrap, Daemon, File, Health, Identity, Init, Keys, Push, Version};
