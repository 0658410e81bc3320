//! A Rust library for reading and writing Kirikiri XP3 archives.
//!
//! For more information, please visit the [GitHub repository](https://github.com/lifegpc/msg-tool).
pub mod ext;
pub mod types;
pub mod utils;
pub mod xp3;

pub use types::Xp3Config;

lazy_static::lazy_static! {
    /// Tally of extracted entries, failures and warnings across the process.
    pub static ref COUNTER: utils::counter::Counter = utils::counter::Counter::new();
}
