//! Fenwick (binary indexed) tree over participant weights.
//!
//! Supports O(log N) point update, prefix sum, and inverse lookup,
//! which makes weighted selection without replacement O(K·log N) with
//! O(N) memory — no expansion of the ticket pool into a flat array.

/// One-indexed internally; the public API is zero-indexed.
#[derive(Debug, Clone)]
pub struct Fenwick {
    tree: Vec<i64>,
    n: usize,
}

impl Fenwick {
    pub fn new(n: usize) -> Self {
        Self {
            tree: vec![0; n + 1],
            n,
        }
    }

    /// Build from initial weights in O(N).
    pub fn from_weights(weights: &[u64]) -> Self {
        let n = weights.len();
        let mut tree = vec![0i64; n + 1];
        for (i, &w) in weights.iter().enumerate() {
            let idx = i + 1;
            tree[idx] += w as i64;
            let parent = idx + (idx & idx.wrapping_neg());
            if parent <= n {
                let carry = tree[idx];
                tree[parent] += carry;
            }
        }
        Self { tree, n }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Add `delta` to the weight at `i`.
    pub fn update(&mut self, i: usize, delta: i64) {
        let mut idx = i + 1;
        while idx <= self.n {
            self.tree[idx] += delta;
            idx += idx & idx.wrapping_neg();
        }
    }

    /// Sum of weights in [0, i].
    pub fn prefix_sum(&self, i: usize) -> i64 {
        let mut idx = (i + 1).min(self.n);
        let mut sum = 0;
        while idx > 0 {
            sum += self.tree[idx];
            idx -= idx & idx.wrapping_neg();
        }
        sum
    }

    /// Sum of all weights.
    pub fn total(&self) -> i64 {
        self.prefix_sum(self.n.saturating_sub(1))
    }

    /// Smallest index whose prefix sum exceeds `target`.
    ///
    /// With weights as bucket widths laid end to end, this maps a draw
    /// in [0, total) to the bucket it falls in. None if target ≥ total.
    pub fn find_index(&self, target: i64) -> Option<usize> {
        if self.n == 0 || target >= self.total() {
            return None;
        }

        let mut pos = 0usize;
        let mut remaining = target;
        let mut bit = self.n.next_power_of_two();
        // next_power_of_two can be > n; the loop guard handles it
        while bit > 0 {
            let next = pos + bit;
            if next <= self.n && self.tree[next] <= remaining {
                remaining -= self.tree[next];
                pos = next;
            }
            bit >>= 1;
        }

        if pos < self.n { Some(pos) } else { None }
    }
}
