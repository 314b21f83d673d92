//! Cell identities and their distribution across worker processes.
//!
//! Ids come from a single monotonically increasing counter. Ownership is
//! round-robin: id `i` lives on node `i % num_processes`, so any node can
//! work out where a cell lives without a lookup table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PynnError, Result};

/// Global cell identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub u64);

impl CellId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CellId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Contiguous, inclusive id range handed out for one creation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub first: CellId,
    pub last: CellId,
}

impl IdRange {
    pub fn len(&self) -> usize {
        (self.last.0 - self.first.0 + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, id: CellId) -> bool {
        id >= self.first && id <= self.last
    }

    /// Offset of `id` from the start of the range
    pub fn offset(&self, id: CellId) -> Option<usize> {
        self.contains(id).then(|| (id.0 - self.first.0) as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = CellId> {
        (self.first.0..=self.last.0).map(CellId)
    }
}

/// Id counter plus node metadata, owned by the simulation context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySpace {
    next_id: u64,
    rank: usize,
    num_processes: usize,
}

impl IdentitySpace {
    pub fn new(rank: usize, num_processes: usize) -> Result<Self> {
        if num_processes == 0 {
            return Err(PynnError::InvalidArgument(
                "num_processes must be at least 1".into(),
            ));
        }
        if rank >= num_processes {
            return Err(PynnError::InvalidArgument(format!(
                "rank {} is out of range for {} processes",
                rank, num_processes
            )));
        }
        Ok(Self {
            next_id: 0,
            rank,
            num_processes,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_processes(&self) -> usize {
        self.num_processes
    }

    /// Next id that will be handed out
    pub fn peek(&self) -> CellId {
        CellId(self.next_id)
    }

    /// Reserve `n` consecutive ids
    pub fn allocate(&mut self, n: usize) -> Result<IdRange> {
        if n == 0 {
            return Err(PynnError::InvalidArgument(
                "n must be a positive integer".into(),
            ));
        }
        let first = self.next_id;
        self.next_id += n as u64;
        Ok(IdRange {
            first: CellId(first),
            last: CellId(first + n as u64 - 1),
        })
    }

    /// Node that owns `id`
    pub fn owner(&self, id: CellId) -> usize {
        (id.0 % self.num_processes as u64) as usize
    }

    pub fn is_local(&self, id: CellId) -> bool {
        self.owner(id) == self.rank
    }

    /// Only called on a full simulation reset.
    pub fn reset(&mut self) {
        self.next_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_contiguous_and_monotonic() {
        let mut space = IdentitySpace::new(0, 1).unwrap();
        let a = space.allocate(5).unwrap();
        let b = space.allocate(3).unwrap();

        assert_eq!(a.first, CellId(0));
        assert_eq!(a.last, CellId(4));
        assert_eq!(b.first, CellId(5));
        assert_eq!(b.len(), 3);
        assert_eq!(space.peek(), CellId(8));
    }

    #[test]
    fn test_zero_cells_rejected() {
        let mut space = IdentitySpace::new(0, 1).unwrap();
        assert!(matches!(space.allocate(0), Err(PynnError::InvalidArgument(_))));
        assert_eq!(space.peek(), CellId(0));
    }

    #[test]
    fn test_round_robin_partition() {
        let nodes: Vec<IdentitySpace> = (0..3).map(|r| IdentitySpace::new(r, 3).unwrap()).collect();
        for id in (0..20).map(CellId) {
            let owners: Vec<usize> = nodes
                .iter()
                .filter(|n| n.is_local(id))
                .map(|n| n.rank())
                .collect();
            assert_eq!(owners, vec![(id.0 % 3) as usize]);
        }
    }

    #[test]
    fn test_invalid_rank() {
        assert!(IdentitySpace::new(2, 2).is_err());
        assert!(IdentitySpace::new(0, 0).is_err());
    }

    #[test]
    fn test_reset() {
        let mut space = IdentitySpace::new(0, 1).unwrap();
        space.allocate(10).unwrap();
        space.reset();
        assert_eq!(space.allocate(1).unwrap().first, CellId(0));
    }
}
