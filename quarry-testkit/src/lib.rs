//! Test jobs and recording doubles for the quarry job engine.
//!
//! Everything here is deterministic and observable: handlers count their
//! lifecycle callbacks, the wake scheduler records what was filed, and
//! the event recorder drains a subscription into a vector tests can
//! assert on.

pub mod job;
pub mod mock;

pub use job::{PersistentTestHandler, TestBehavior, TestHandler, PERSISTENT_TEST_KIND};
pub use mock::{EventRecorder, RecordingWakeScheduler};
