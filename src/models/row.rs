use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Local};

use super::channel::Channel;

/// One timestamped snapshot of every channel known so far.
/// Rows are never mutated once they are part of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Seconds since the acquisition buffer was started.
    pub time: f64,

    /// Wall clock time the row was taken.
    pub datetime: DateTime<Local>,

    pub values: BTreeMap<Channel, f64>,
}

impl Row {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values.get(&channel).copied()
    }
}

impl Display for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Row t={:.3}s", self.time)?;
        for (channel, value) in &self.values {
            write!(f, " {}={}", channel, value)?;
        }
        write!(f, ">")
    }
}
