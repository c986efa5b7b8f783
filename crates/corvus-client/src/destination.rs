// Destination addresses. Queues are shared point-to-point; topics get one
// private queue per consumer, named by the consumer's unique tag and bound
// to the topic's exchange.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    physical_name: String,
    is_queue: bool,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            physical_name: name.into(),
            is_queue: true,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            physical_name: name.into(),
            is_queue: false,
        }
    }

    pub fn is_queue(&self) -> bool {
        self.is_queue
    }

    pub fn physical_name(&self) -> &str {
        &self.physical_name
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_queue { "queue" } else { "topic" };
        write!(f, "{kind}:{}", self.physical_name)
    }
}
