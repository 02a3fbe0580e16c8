//! Lane assignment for finished log groups.

use std::fmt;

use crate::config::ClientConfig;
use crate::log_record::LogGroup;

/// Buffer a group travels through on its way to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    Normal,
    HiPri,
    Overflow,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Normal, Lane::HiPri, Lane::Overflow];

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Normal => "normal",
            Lane::HiPri => "hi-pri",
            Lane::Overflow => "overflow",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `group` qualifies for the hi-pri lane.
pub fn is_hipri(group: &LogGroup, config: &ClientConfig) -> bool {
    group.contains_audit()
        || group.weighted_priority() >= config.hipri_logging_level.severity()
}

/// Whether `group` may fall back to the overflow lane.
pub fn overflow_eligible(group: &LogGroup, config: &ClientConfig) -> bool {
    group.weighted_priority() >= config.overflow_channel_logging_level.severity()
}

/// Pick the lane for `group`.
///
/// `normal_saturated` reports whether the normal lane is currently full; it
/// is the only runtime input, everything else comes from the group and the
/// configuration thresholds.
pub fn classify(group: &LogGroup, config: &ClientConfig, normal_saturated: bool) -> Lane {
    if is_hipri(group, config) {
        Lane::HiPri
    } else if normal_saturated && overflow_eligible(group, config) {
        Lane::Overflow
    } else {
        Lane::Normal
    }
}
