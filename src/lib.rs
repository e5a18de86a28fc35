pub mod cleaner;
pub mod config;
pub mod error;
pub mod item;
pub mod lock;
pub mod logging;
pub mod marker;
pub mod metadata;
pub mod naming;
pub mod packer;
pub mod remote;
pub mod retry;
pub mod transfer;

pub use error::*;
