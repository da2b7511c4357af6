// Ordinal Kernel
//
// Replicated metadata for a streaming SQL cluster: a totally ordered
// command log, the per-node applier that replays it, and the barrier that
// gives clients read-your-writes on the node they talk to.

pub mod applier;
pub mod barrier;
pub mod config;
pub mod lifecycle;
pub mod log;
pub mod node;
pub mod producer;
pub mod replay;
pub mod rules;
pub mod session;
pub mod state;
