//! Snapshot change detection.
//!
//! Count first, then positional field comparison. A pure reordering is
//! reported as a change; that only costs one extra render.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    CountChanged { previous: usize, current: usize },
    FieldChanged { index: usize },
}

impl Change {
    pub fn is_changed(&self) -> bool {
        !matches!(self, Change::Unchanged)
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Unchanged => write!(f, "unchanged"),
            Change::CountChanged { previous, current } => {
                write!(f, "count {} -> {}", previous, current)
            }
            Change::FieldChanged { index } => write!(f, "entity #{} changed", index),
        }
    }
}

pub fn detect<E: PartialEq>(previous: &[E], current: &[E]) -> Change {
    if previous.len() != current.len() {
        return Change::CountChanged {
            previous: previous.len(),
            current: current.len(),
        };
    }
    previous
        .iter()
        .zip(current)
        .position(|(old, new)| old != new)
        .map(|index| Change::FieldChanged { index })
        .unwrap_or(Change::Unchanged)
}

pub fn has_changed<E: PartialEq>(previous: &[E], current: &[E]) -> bool {
    detect(previous, current).is_changed()
}

/// Remembers the last snapshot it was shown.
pub struct ChangeDetector<E> {
    previous: Option<Vec<E>>,
}

impl<E: PartialEq + Clone> ChangeDetector<E> {
    pub fn new() -> Self {
        Self { previous: None }
    }

    /// Compare against the remembered snapshot and remember `current`.
    /// The very first observation always counts as a change so listeners
    /// get an initial render.
    pub fn observe(&mut self, current: &[E]) -> Change {
        let change = match &self.previous {
            Some(previous) => detect(previous, current),
            None => Change::CountChanged {
                previous: 0,
                current: current.len(),
            },
        };
        if change.is_changed() {
            self.previous = Some(current.to_vec());
        }
        change
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

impl<E: PartialEq + Clone> Default for ChangeDetector<E> {
    fn default() -> Self {
        Self::new()
    }
}
