use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one candidate within a run: the iteration that produced it and
/// its slot inside that iteration.
///
/// Rendered as `i{iteration}c{local}`, e.g. `i2c5`. Ordering is
/// `(iteration, local)` ascending; this is also the deterministic tie-break
/// order used wherever ranks can tie.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CandidateId {
    pub iteration: u32,
    pub local: u32,
}

impl CandidateId {
    pub fn new(iteration: u32, local: u32) -> Self {
        Self { iteration, local }
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}c{}", self.iteration, self.local)
    }
}
