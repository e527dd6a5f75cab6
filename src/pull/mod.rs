pub mod activity;
pub mod blocks;
pub mod errors;
pub mod fsutil;
pub mod puller;
pub mod queue;
pub mod types;

pub use errors::PullError;
pub use puller::{PullerHandle, start_puller};
pub use types::{BlockInfo, FileInfo};
