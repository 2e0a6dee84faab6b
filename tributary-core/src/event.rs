use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    // the partition the event was read from
    pub partition_id: String,
    // monotonically increasing, per partition, assigned by the broker
    pub sequence_number: i64,
    // broker offset of the event within the partition
    pub offset: u64,
    // time the broker accepted the event, in milliseconds since the epoch
    pub enqueued_time: u64,
    // the actual payload of the event
    pub body: Vec<u8>,
    // user-defined properties
    pub properties: HashMap<String, String>,
}

impl EventData {
    pub fn new(partition_id: impl Into<String>, sequence_number: i64, body: Vec<u8>) -> Self {
        EventData {
            partition_id: partition_id.into(),
            sequence_number,
            offset: sequence_number.max(0) as u64,
            enqueued_time: 0,
            body,
            properties: HashMap::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Where a receive link starts reading a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPosition {
    Earliest,
    Latest,
    Offset { offset: u64, inclusive: bool },
    SequenceNumber { sequence_number: i64, inclusive: bool },
}

impl EventPosition {
    /// Position right after the given sequence number.
    pub fn after_sequence_number(sequence_number: i64) -> Self {
        EventPosition::SequenceNumber {
            sequence_number,
            inclusive: false,
        }
    }

    /// Position right after the given offset, used when resuming from a checkpoint.
    pub fn after_offset(offset: u64) -> Self {
        EventPosition::Offset {
            offset,
            inclusive: false,
        }
    }

    /// Returns true if an event carrying `sequence_number` and `offset` lies at or after this position.
    pub fn admits(&self, sequence_number: i64, offset: u64) -> bool {
        match self {
            EventPosition::Earliest => true,
            EventPosition::Latest => false,
            EventPosition::Offset {
                offset: start,
                inclusive,
            } => {
                if *inclusive {
                    offset >= *start
                } else {
                    offset > *start
                }
            }
            EventPosition::SequenceNumber {
                sequence_number: start,
                inclusive,
            } => {
                if *inclusive {
                    sequence_number >= *start
                } else {
                    sequence_number > *start
                }
            }
        }
    }
}

impl Default for EventPosition {
    fn default() -> Self {
        EventPosition::Earliest
    }
}

impl Display for EventPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EventPosition::Earliest => write!(f, "earliest"),
            EventPosition::Latest => write!(f, "latest"),
            EventPosition::Offset { offset, inclusive } => {
                write!(f, "offset {} {}", if *inclusive { ">=" } else { ">" }, offset)
            }
            EventPosition::SequenceNumber {
                sequence_number,
                inclusive,
            } => write!(
                f,
                "sequence_number {} {}",
                if *inclusive { ">=" } else { ">" },
                sequence_number
            ),
        }
    }
}
