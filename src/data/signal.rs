//! Items produced by the DAQ signal source.

use serde::{Deserialize, Serialize};

/// One hardware trigger edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Sequence number assigned by the signal source, starting at 0.
    pub index: u64,
    /// Seconds since the signal source was created (monotonic clock).
    pub timestamp_s: f64,
}

/// A block of analog samples, interleaved by channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBlock {
    /// Index of the first sample (per channel) since acquisition start.
    pub first_index: u64,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Interleaved values, `channels` per sample instant.
    pub values: Vec<f64>,
}

impl SampleBlock {
    /// Number of sample instants in the block.
    pub fn len(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.values.len() / self.channels as usize
    }

    /// Whether the block carries no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
