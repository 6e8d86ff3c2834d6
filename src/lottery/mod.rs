//! Verifiable weighted lottery: commit-reveal secret, Merkle-bound
//! participant set, deterministic Fenwick-tree selection.

pub mod fenwick;
pub mod merkle;
pub mod rng;
pub mod select;

pub use fenwick::Fenwick;
pub use merkle::{MerkleTree, leaf_hash, verify_proof};
pub use rng::SeededRng;
pub use select::{
    ALGORITHM, LotteryOutcome, LotteryProof, lottery_seed, select_winners,
};
