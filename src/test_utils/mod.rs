//! Helpers shared by unit tests and, through the `test-util` feature, by the
//! integration tests under `tests/`.

pub mod recording_connector;

pub use recording_connector::{Attempt, Fault, RecordingConnector, SentPackage};
