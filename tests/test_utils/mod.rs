pub mod fixtures;

pub use fixtures::{WAIT, base_config, client_with, recording_client};
