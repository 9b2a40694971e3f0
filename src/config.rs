//! Engine configuration.

use crate::status::Error;

/// Exception vector of #PF; left out of the default bitmap.
const PAGE_FAULT_VECTOR: u32 = 14;

/// Configuration of a [`DebuggerEngine`](crate::engine::DebuggerEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of virtual processors under the hypervisor.
    pub core_count: usize,
    /// Maximum number of registered events.
    pub max_events: usize,
    /// Vectors trapped while the exception bitmap resource is on.
    pub exception_mask: u32,
}

impl Config {
    pub const DEFAULT_MAX_EVENTS: usize = 4096;
    pub const DEFAULT_EXCEPTION_MASK: u32 = !(1 << PAGE_FAULT_VECTOR);

    /// Configuration for `core_count` cores with default limits.
    pub fn new(core_count: usize) -> Self {
        Self {
            core_count,
            ..Self::default()
        }
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_exception_mask(mut self, mask: u32) -> Self {
        self.exception_mask = mask;
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.core_count == 0 {
            return Err(Error::InvalidConfig("core_count must be non-zero"));
        }
        if self.max_events == 0 {
            return Err(Error::InvalidConfig("max_events must be non-zero"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core_count: 1,
            max_events: Self::DEFAULT_MAX_EVENTS,
            exception_mask: Self::DEFAULT_EXCEPTION_MASK,
        }
    }
}
