//! Components A and B: the page-table frame pool and generic engine.

pub mod engine;
pub mod frame;
pub mod pool;

pub use engine::PageTable;
pub use frame::{Frame, TableLoc};
pub use pool::FramePool;
