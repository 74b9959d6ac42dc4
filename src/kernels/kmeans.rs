//! Lloyd k-means shared by the IVF and PQ strategies and shard rebalancing.
//!
//! Runs at most `MAX_ITERS` iterations, stopping early once the total
//! squared centroid shift drops below `SHIFT_TOLERANCE`. Initialization
//! samples distinct input vectors; empty clusters are reseeded from the
//! input to keep `k` centroids live.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::kernels::distance::l2_sq;

const MAX_ITERS: usize = 20;
const SHIFT_TOLERANCE: f32 = 1e-4;

/// Result of a k-means run: centroids plus the assignment of each input.
#[derive(Debug, Clone)]
pub struct Clustering {
    pub centroids: Vec<Vec<f32>>,
    pub assignments: Vec<usize>,
    /// Sum of squared distances of each vector to its centroid.
    pub inertia: f32,
}

/// Index of the closest centroid by squared Euclidean distance.
pub fn nearest_centroid(v: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = l2_sq(v, c);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

/// Cluster `vectors` into `k` groups with Lloyd's algorithm.
///
/// `k` is clamped to the number of inputs. Returns an empty clustering
/// for empty input.
pub fn kmeans<R: Rng>(vectors: &[Vec<f32>], k: usize, rng: &mut R) -> Clustering {
    if vectors.is_empty() || k == 0 {
        return Clustering {
            centroids: Vec::new(),
            assignments: Vec::new(),
            inertia: 0.0,
        };
    }

    let k = k.min(vectors.len());
    let dim = vectors[0].len();

    let mut indices: Vec<usize> = (0..vectors.len()).collect();
    indices.shuffle(rng);
    let mut centroids: Vec<Vec<f32>> = indices[..k].iter().map(|&i| vectors[i].clone()).collect();

    let mut assignments = vec![0usize; vectors.len()];

    for _ in 0..MAX_ITERS {
        for (i, v) in vectors.iter().enumerate() {
            assignments[i] = nearest_centroid(v, &centroids);
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (v, &a) in vectors.iter().zip(assignments.iter()) {
            counts[a] += 1;
            for (s, x) in sums[a].iter_mut().zip(v.iter()) {
                *s += x;
            }
        }

        let mut shift = 0.0f32;
        for (c, (sum, &count)) in centroids.iter_mut().zip(sums.iter().zip(counts.iter())) {
            if count == 0 {
                // Reseed a dead centroid from a random input.
                let pick = rng.gen_range(0..vectors.len());
                shift += l2_sq(c, &vectors[pick]);
                *c = vectors[pick].clone();
                continue;
            }
            let new: Vec<f32> = sum.iter().map(|s| s / count as f32).collect();
            shift += l2_sq(c, &new);
            *c = new;
        }

        if shift < SHIFT_TOLERANCE {
            break;
        }
    }

    for (i, v) in vectors.iter().enumerate() {
        assignments[i] = nearest_centroid(v, &centroids);
    }

    let inertia = vectors
        .iter()
        .zip(assignments.iter())
        .map(|(v, &a)| l2_sq(v, &centroids[a]))
        .sum();

    Clustering {
        centroids,
        assignments,
        inertia,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_blobs() -> Vec<Vec<f32>> {
        let mut vectors = Vec::new();
        for i in 0..10 {
            let jitter = i as f32 * 0.01;
            vectors.push(vec![0.0 + jitter, 0.0]);
            vectors.push(vec![10.0 + jitter, 10.0]);
        }
        vectors
    }

    #[test]
    fn test_separates_two_blobs() {
        let vectors = two_blobs();
        let mut rng = StdRng::seed_from_u64(7);
        let result = kmeans(&vectors, 2, &mut rng);

        assert_eq!(result.centroids.len(), 2);
        // Every even-index vector (first blob) shares a cluster, odd the other.
        let first = result.assignments[0];
        let second = result.assignments[1];
        assert_ne!(first, second);
        for (i, &a) in result.assignments.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(a, first);
            } else {
                assert_eq!(a, second);
            }
        }
    }

    #[test]
    fn test_k_clamped_to_input_len() {
        let vectors = vec![vec![1.0, 2.0]];
        let mut rng = StdRng::seed_from_u64(1);
        let result = kmeans(&vectors, 5, &mut rng);
        assert_eq!(result.centroids.len(), 1);
        assert!(result.inertia < 1e-6);
    }

    #[test]
    fn test_empty_input() {
        let mut rng = StdRng::seed_from_u64(1);
        let result = kmeans(&[], 3, &mut rng);
        assert!(result.centroids.is_empty());
        assert!(result.assignments.is_empty());
    }

    #[test]
    fn test_nearest_centroid() {
        let centroids = vec![vec![0.0, 0.0], vec![5.0, 5.0]];
        assert_eq!(nearest_centroid(&[1.0, 1.0], &centroids), 0);
        assert_eq!(nearest_centroid(&[4.0, 4.0], &centroids), 1);
    }
}
