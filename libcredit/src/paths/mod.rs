mod path;
mod path_stats;

pub use path::{Path, MIN_CYCLE_LENGTH};
pub use path_stats::{PathNodeState, PathStats};
