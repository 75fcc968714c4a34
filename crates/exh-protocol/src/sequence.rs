use crate::{ExhaustError, StreamId, FIRST_SEQUENCE};

/// Result of offering a sequence number to a [`SequenceGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Next in order; the high-water mark moved.
    Accepted,
    /// At or below the high-water mark; already delivered.
    Duplicate,
}

/// Per-stream high-water mark enforcing gap-free, duplicate-free delivery.
///
/// Sequences at or below the mark are duplicates. Anything other than
/// `mark + 1` above it is a gap and reported as a violation.
#[derive(Debug, Clone)]
pub struct SequenceGuard {
    stream_id: StreamId,
    last: u64,
}

impl SequenceGuard {
    pub fn new(stream_id: StreamId) -> Self {
        Self { stream_id, last: FIRST_SEQUENCE - 1 }
    }

    pub fn check_and_advance(&mut self, sequence: u64) -> Result<Admission, ExhaustError> {
        if sequence <= self.last {
            return Ok(Admission::Duplicate);
        }
        let expected = self.last + 1;
        if sequence != expected {
            return Err(ExhaustError::SequenceViolation {
                stream_id: self.stream_id.clone(),
                expected,
                got: sequence,
            });
        }
        self.last = sequence;
        Ok(Admission::Accepted)
    }

    /// Highest sequence accepted so far (0 before the first).
    pub fn last(&self) -> u64 {
        self.last
    }
}
