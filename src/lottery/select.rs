//! Winner selection and the public lottery proof.
//!
//! Selection is weighted without replacement: each draw maps a PRNG
//! value onto the live weight line via the Fenwick tree, then zeroes the
//! picked participant. Backups continue from the same PRNG state, so
//! the full ordered outcome is a pure function of (entries, inventory,
//! backup count, seed).

use serde::{Deserialize, Serialize};

use crate::crypto::sha256_hex;
use crate::lottery::fenwick::Fenwick;
use crate::lottery::rng::SeededRng;
use crate::types::{Millis, UserId};

/// Selection algorithm identifier, published in every proof.
pub const ALGORITHM: &str = "weighted-fenwick-v2";

/// Lottery seed: SHA256(secret ‖ "|" ‖ merkleRoot).
///
/// The secret is committed before registration opens and the root is
/// fixed by the registrations, so neither side can grind the outcome.
pub fn lottery_seed(secret: &str, merkle_root_hex: &str) -> String {
    sha256_hex(format!("{secret}|{merkle_root_hex}").as_bytes())
}

/// Ordered winners and backups for one draw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotteryOutcome {
    pub winners: Vec<UserId>,
    pub backups: Vec<UserId>,
}

/// Select `inventory` winners then `backup_count` backups, weighted by
/// entry weight, without replacement.
///
/// `entries` must be in leaf order (sorted by user id) — the same order
/// the Merkle tree committed to. Zero-weight entries are never picked.
pub fn select_winners(
    entries: &[(UserId, u64)],
    inventory: usize,
    backup_count: usize,
    seed_hex: &str,
) -> LotteryOutcome {
    let weights: Vec<u64> = entries.iter().map(|(_, w)| *w).collect();
    let mut tree = Fenwick::from_weights(&weights);
    let mut rng = SeededRng::from_hex_seed(seed_hex);

    let mut draw = |count: usize, tree: &mut Fenwick| -> Vec<UserId> {
        let mut picked = Vec::with_capacity(count);
        for _ in 0..count {
            let total = tree.total();
            if total <= 0 {
                break;
            }
            let target = rng.next_below(total as u64) as i64;
            let Some(idx) = tree.find_index(target) else {
                break;
            };
            picked.push(entries[idx].0.clone());
            tree.update(idx, -(weights[idx] as i64));
        }
        picked
    };

    let winners = draw(inventory, &mut tree);
    let backups = draw(backup_count, &mut tree);

    LotteryOutcome { winners, backups }
}

/// Publicly retrievable proof of one drop's lottery.
///
/// Anyone holding this can check commitment == SHA256(secret),
/// seed == SHA256(secret|root), and replay the selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotteryProof {
    pub commitment: String,
    pub secret: String,
    pub participant_merkle_root: String,
    pub participant_count: usize,
    pub seed: String,
    pub algorithm: String,
    pub timestamp: Millis,
    pub winners: Vec<UserId>,
    pub backup_winners: Vec<UserId>,
}
