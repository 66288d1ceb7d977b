use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Identifier of one client buffer within a task's output.
///
/// A task exposes one buffer per consuming client; the enclosing manager
/// assigns dense ids starting from zero and routes reads by id. The id is
/// stable for the lifetime of the task and shows up in observability
/// snapshots and transport URLs.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OutputBufferId(pub u32);

impl OutputBufferId {
    /// Creates a buffer ID from a raw u32 value.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the buffer ID as a u32.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for OutputBufferId {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<OutputBufferId> for u32 {
    #[inline]
    fn from(value: OutputBufferId) -> Self {
        value.0
    }
}

impl Display for OutputBufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
