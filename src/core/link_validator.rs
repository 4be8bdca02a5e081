//! Sliding window that spots the first uniquely versioned op in an
//! ascending op stream.
//!
//! Lost commit races leave orphan ops sharing a version with the real one,
//! so a version can only be trusted once the ops on both sides of it are
//! known. The window holds the latest three entries; pushing `None` marks
//! the end of the stream.

use crate::{op::OpRecord, types::Version};

/// Anything carrying an op version.
pub trait Versioned {
    /// Version of the item.
    fn version(&self) -> Option<Version>;
}

impl Versioned for OpRecord {
    fn version(&self) -> Option<Version> {
        Some(self.v)
    }
}

impl<T: Versioned> Versioned for &T {
    fn version(&self) -> Option<Version> {
        (**self).version()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot<T> {
    Empty,
    Item(T),
    End,
}

impl<T: Versioned> Slot<T> {
    fn version(&self) -> Option<Version> {
        match self {
            Self::Item(item) => item.version(),
            Self::Empty | Self::End => None,
        }
    }
}

/// Three-slot window over an ascending op stream.
#[derive(Debug, Clone)]
pub struct OpLinkValidator<T> {
    current: Slot<T>,
    previous: Slot<T>,
    one_before_previous: Slot<T>,
}

impl<T> Default for OpLinkValidator<T> {
    fn default() -> Self {
        Self {
            current: Slot::Empty,
            previous: Slot::Empty,
            one_before_previous: Slot::Empty,
        }
    }
}

impl<T: Versioned> OpLinkValidator<T> {
    /// Creates an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shifts the window by one; `None` marks end of stream.
    pub fn push(&mut self, item: Option<T>) {
        let incoming = match item {
            Some(item) => Slot::Item(item),
            None => Slot::End,
        };
        self.one_before_previous = std::mem::replace(
            &mut self.previous,
            std::mem::replace(&mut self.current, incoming),
        );
    }

    /// The middle entry, if its version differs from both neighbours.
    pub fn op_with_unique_version(&self) -> Option<&T> {
        let Slot::Item(item) = &self.previous else {
            return None;
        };
        let v = item.version()?;
        let unique = Some(v) != self.current.version() && Some(v) != self.one_before_previous.version();
        unique.then_some(item)
    }

    /// True once the end marker has been pushed into the newest slot.
    pub fn is_at_end_of_list(&self) -> bool {
        matches!(self.current, Slot::End)
    }
}
