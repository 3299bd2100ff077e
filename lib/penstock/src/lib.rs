#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub type CorrelationId = u64;

pub mod encoding;
pub mod hash;
pub mod logging;
pub mod time;
