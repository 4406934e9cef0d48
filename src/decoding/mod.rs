//! Decoder heads, decoding algorithms, backtracking and the scheduler driving them.
pub mod backtrack;
pub mod driver;
pub mod head;
pub mod sampling;
pub mod scheduler;

pub use backtrack::{BacktrackError, Backtracker};
pub use driver::{driver_for, Argmax, Beam, BeamVar, HeadDriver, Sample};
pub use head::{pad_batch, DecoderHead, RewrittenInputIds};
pub use scheduler::{Scheduler, SubqueryRunner};
