//! Process-level primitives shared by every loop: time and identity.

pub mod clock;
pub mod ids;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::external_id;
