/// Data layer: raw blocks, loading, user flags, and name binding.
///
/// Architecture:
/// ```text
///  .json / .csv
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse file → Vec<Block>
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  Dataset  │  Vec<Block>, channel index
///   └──────────┘
///        │
///        ├──► filter    user block / cycle rejection flags
///        │
///        ▼
///   ┌──────────┐
///   │  context  │  names → symbols → operands for one frame
///   └──────────┘
/// ```

pub mod context;
pub mod filter;
pub mod loader;
pub mod model;

use model::Block;

/// Anything that can supply the raw blocks of a session.
pub trait BlockSource {
    fn load_blocks(&self, session_id: &str) -> anyhow::Result<Vec<Block>>;
}
