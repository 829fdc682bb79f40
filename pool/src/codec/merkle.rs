/// Merkle tree helpers
///
/// Two shapes are needed: the Bitcoin-family branch ("steps") that lets a
/// miner fold its own coinbase hash up to the root, and a plain full-tree
/// root used by the Zcash family. Both work on internal byte order.

use super::sha256d;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleBranch {
    steps: Vec<[u8; 32]>,
}

impl MerkleBranch {
    /// Build the branch for a block whose first leaf (the coinbase) is not yet
    /// known. `hashes` are the remaining leaves in internal byte order.
    pub fn from_hashes(hashes: &[[u8; 32]]) -> Self {
        let mut steps = Vec::new();
        let mut level: Vec<[u8; 32]> = hashes.to_vec();

        while let Some(&first) = level.first() {
            steps.push(first);
            // the level plus the unknown leading node has odd length
            if level.len() % 2 == 0 {
                let last = level[level.len() - 1];
                level.push(last);
            }
            level = level[1..]
                .chunks_exact(2)
                .map(|pair| sha256d(&[pair[0], pair[1]].concat()))
                .collect();
        }

        Self { steps }
    }

    pub fn steps(&self) -> &[[u8; 32]] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Fold a first leaf through the branch, producing the Merkle root.
    pub fn with_first(&self, first: [u8; 32]) -> [u8; 32] {
        self.steps
            .iter()
            .fold(first, |acc, step| sha256d(&[acc, *step].concat()))
    }

    pub fn to_hex(&self) -> Vec<String> {
        self.steps.iter().map(hex::encode).collect()
    }
}

/// Full Merkle root over internal-order leaves, duplicating the last node on
/// odd levels. A single leaf is its own root.
pub fn merkle_root(leaves: &[[u8; 32]]) -> Option<[u8; 32]> {
    let mut level = leaves.to_vec();
    if level.is_empty() {
        return None;
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks_exact(2)
            .map(|pair| sha256d(&[pair[0], pair[1]].concat()))
            .collect();
    }
    Some(level[0])
}
