//! Contrastive loss + triplet miner (C5).
//!
//! Builds `(query, positive, negative)` triplets from a batch of samples
//! labeled by quality score, computes a margin triplet loss over cosine
//! similarity, and returns gradients w.r.t. every embedding involved,
//! L2-clipped to a configured norm.

use crate::primitives::{cosine_similarity, l2_norm};

/// A trajectory-derived embedding sample, labeled by outcome quality.
#[derive(Debug, Clone)]
pub struct EmbeddingSample {
    pub id: String,
    pub embedding: Vec<f32>,
    pub enhanced_embedding: Option<Vec<f32>>,
    pub quality: f32,
}

/// One mined triplet and the similarity terms it was scored with.
#[derive(Debug, Clone)]
pub struct Triplet {
    pub query: Vec<f32>,
    pub positive: Vec<f32>,
    pub negative: Vec<f32>,
    pub loss: f32,
}

/// Gradients produced for a single triplet.
#[derive(Debug, Clone)]
pub struct TripletGradient {
    pub d_query: Vec<f32>,
    pub d_positive: Vec<f32>,
    pub d_negative: Vec<f32>,
}

/// Outcome of scoring a mined batch of triplets.
#[derive(Debug, Clone, Default)]
pub struct TripletBatchResult {
    pub total_loss: f32,
    pub active_count: usize,
    pub gradients: Vec<TripletGradient>,
    pub triplets: Vec<Triplet>,
}

/// A mined triplet's gradient, attributed back to the index (within the
/// original `samples` slice) of its positive and negative members, so a
/// caller training a network upstream of the embeddings can route the
/// gradient into the right per-sample forward cache.
#[derive(Debug, Clone)]
pub struct IndexedTripletGradient {
    pub positive_index: usize,
    pub negative_index: usize,
    pub gradient: TripletGradient,
}

/// Margin-based triplet contrastive loss over cosine similarity.
pub struct ContrastiveLoss {
    pub margin: f32,
    pub positive_quality_threshold: f32,
    pub negative_quality_threshold: f32,
    pub max_gradient_norm: f32,
}

impl ContrastiveLoss {
    pub fn new(
        margin: f32,
        positive_quality_threshold: f32,
        negative_quality_threshold: f32,
        max_gradient_norm: f32,
    ) -> Self {
        Self {
            margin,
            positive_quality_threshold,
            negative_quality_threshold,
            max_gradient_norm,
        }
    }

    /// The batch query: centroid of `enhanced_embedding` where present,
    /// else `embedding`, averaged over every sample in the batch.
    fn batch_query(samples: &[EmbeddingSample]) -> Vec<f32> {
        let dim = samples[0]
            .enhanced_embedding
            .as_ref()
            .unwrap_or(&samples[0].embedding)
            .len();
        let mut centroid = vec![0.0_f32; dim];
        for s in samples {
            let e = s.enhanced_embedding.as_ref().unwrap_or(&s.embedding);
            for (c, v) in centroid.iter_mut().zip(e.iter()) {
                *c += v;
            }
        }
        let n = samples.len() as f32;
        for c in centroid.iter_mut() {
            *c /= n;
        }
        centroid
    }

    /// Mines `(query, positive, negative)` triplets: every positive paired
    /// with every negative, against the shared batch-centroid query.
    pub fn mine_triplets(&self, samples: &[EmbeddingSample]) -> Vec<Triplet> {
        if samples.is_empty() {
            return Vec::new();
        }
        let query = Self::batch_query(samples);
        let positives: Vec<&Vec<f32>> = samples
            .iter()
            .filter(|s| s.quality >= self.positive_quality_threshold)
            .map(|s| &s.embedding)
            .collect();
        let negatives: Vec<&Vec<f32>> = samples
            .iter()
            .filter(|s| s.quality <= self.negative_quality_threshold)
            .map(|s| &s.embedding)
            .collect();

        let mut triplets = Vec::with_capacity(positives.len() * negatives.len());
        for p in &positives {
            for n in &negatives {
                let sim_qp = cosine_similarity(&query, p);
                let sim_qn = cosine_similarity(&query, n);
                let loss = (self.margin - sim_qp + sim_qn).max(0.0);
                triplets.push(Triplet {
                    query: query.clone(),
                    positive: (*p).clone(),
                    negative: (*n).clone(),
                    loss,
                });
            }
        }
        triplets
    }

    /// Gradient of `max(0, margin - cos(q,p) + cos(q,n))` w.r.t. `q`, `p`,
    /// `n`. Inactive triplets (`loss == 0`) produce a zero gradient.
    fn triplet_gradient(&self, t: &Triplet) -> TripletGradient {
        let dim = t.query.len();
        if t.loss <= 0.0 {
            return TripletGradient {
                d_query: vec![0.0; dim],
                d_positive: vec![0.0; dim],
                d_negative: vec![0.0; dim],
            };
        }
        // d(cos(q,p))/dq with p fixed, both at their actual (un-normalized)
        // norms: cos(q,p) = (q.p)/(|q||p|); d/dq = p/(|q||p|) - (q.p)q/(|q|^3|p|).
        let (d_qp_dq, d_qp_dp) = cosine_gradient(&t.query, &t.positive);
        let (d_qn_dq, d_qn_dn) = cosine_gradient(&t.query, &t.negative);

        // loss = margin - sim(q,p) + sim(q,n)
        let d_query: Vec<f32> = d_qn_dq
            .iter()
            .zip(d_qp_dq.iter())
            .map(|(dqn, dqp)| dqn - dqp)
            .collect();
        let d_positive: Vec<f32> = d_qp_dp.iter().map(|v| -v).collect();
        let d_negative = d_qn_dn;

        TripletGradient {
            d_query,
            d_positive,
            d_negative,
        }
    }

    /// Like `mine_triplets`, but also returns the index (into `samples`)
    /// of each triplet's positive and negative member alongside its
    /// clipped gradient, so the caller can attribute `d_positive`/
    /// `d_negative` back to the originating sample. The shared query
    /// gradient (`d_query`) is the caller's responsibility to spread
    /// across every sample that fed the batch centroid (equally, `1/N`
    /// each), since it is not tied to one sample's index.
    pub fn mine_triplets_indexed(
        &self,
        samples: &[EmbeddingSample],
    ) -> (Vec<f32>, Vec<IndexedTripletGradient>) {
        if samples.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let query = Self::batch_query(samples);
        let positive_indices: Vec<usize> = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.quality >= self.positive_quality_threshold)
            .map(|(i, _)| i)
            .collect();
        let negative_indices: Vec<usize> = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.quality <= self.negative_quality_threshold)
            .map(|(i, _)| i)
            .collect();

        let mut gradients = Vec::with_capacity(positive_indices.len() * negative_indices.len());
        for &pi in &positive_indices {
            for &ni in &negative_indices {
                let p = &samples[pi].embedding;
                let n = &samples[ni].embedding;
                let sim_qp = cosine_similarity(&query, p);
                let sim_qn = cosine_similarity(&query, n);
                let loss = (self.margin - sim_qp + sim_qn).max(0.0);
                let triplet = Triplet {
                    query: query.clone(),
                    positive: p.clone(),
                    negative: n.clone(),
                    loss,
                };
                let grad = self.triplet_gradient(&triplet);
                gradients.push(IndexedTripletGradient {
                    positive_index: pi,
                    negative_index: ni,
                    gradient: grad,
                });
            }
        }
        let mut flat: Vec<TripletGradient> = gradients.iter().map(|g| g.gradient.clone()).collect();
        clip_triplet_gradients(&mut flat, self.max_gradient_norm);
        for (g, clipped) in gradients.iter_mut().zip(flat.into_iter()) {
            g.gradient = clipped;
        }
        (query, gradients)
    }

    /// Mines triplets, scores the active ones, and returns their clipped
    /// gradients. `active_count` is the number of triplets with positive
    /// loss.
    pub fn forward_backward(&self, samples: &[EmbeddingSample]) -> TripletBatchResult {
        let triplets = self.mine_triplets(samples);
        let active: Vec<&Triplet> = triplets.iter().filter(|t| t.loss > 0.0).collect();
        let total_loss: f32 = active.iter().map(|t| t.loss).sum();

        let mut gradients: Vec<TripletGradient> = triplets.iter().map(|t| self.triplet_gradient(t)).collect();
        clip_triplet_gradients(&mut gradients, self.max_gradient_norm);

        TripletBatchResult {
            total_loss,
            active_count: active.len(),
            gradients,
            triplets,
        }
    }
}

/// `(d cos(a,b)/da, d cos(a,b)/db)` for two non-zero vectors.
fn cosine_gradient(a: &[f32], b: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let norm_a = l2_norm(a).max(f32::EPSILON);
    let norm_b = l2_norm(b).max(f32::EPSILON);
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let inv_ab = 1.0 / (norm_a * norm_b);
    let d_a: Vec<f32> = a
        .iter()
        .zip(b.iter())
        .map(|(ai, bi)| bi * inv_ab - dot * ai / (norm_a.powi(3) * norm_b))
        .collect();
    let d_b: Vec<f32> = a
        .iter()
        .zip(b.iter())
        .map(|(ai, bi)| ai * inv_ab - dot * bi / (norm_a * norm_b.powi(3)))
        .collect();
    (d_a, d_b)
}

/// L2-clips the stacked `(d_query, d_positive, d_negative)` gradient of
/// every triplet to `max_norm`, matching spec.md §4.4.
fn clip_triplet_gradients(gradients: &mut [TripletGradient], max_norm: f32) {
    for g in gradients.iter_mut() {
        let stacked_norm_sq: f32 = g
            .d_query
            .iter()
            .chain(g.d_positive.iter())
            .chain(g.d_negative.iter())
            .map(|v| v * v)
            .sum();
        let stacked_norm = stacked_norm_sq.sqrt();
        if stacked_norm > max_norm && stacked_norm > f32::EPSILON {
            let scale = max_norm / stacked_norm;
            for v in g.d_query.iter_mut().chain(g.d_positive.iter_mut()).chain(g.d_negative.iter_mut()) {
                *v *= scale;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, embedding: Vec<f32>, quality: f32) -> EmbeddingSample {
        EmbeddingSample {
            id: id.to_string(),
            embedding,
            enhanced_embedding: None,
            quality,
        }
    }

    #[test]
    fn positive_and_negative_labeling_drives_triplet_count() {
        let loss = ContrastiveLoss::new(0.2, 0.7, 0.3, 5.0);
        let samples = vec![
            sample("p1", vec![1.0, 0.0], 0.9),
            sample("p2", vec![0.9, 0.1], 0.8),
            sample("n1", vec![0.0, 1.0], 0.1),
            sample("mid", vec![0.5, 0.5], 0.5),
        ];
        let triplets = loss.mine_triplets(&samples);
        // 2 positives x 1 negative = 2 triplets; "mid" contributes to neither.
        assert_eq!(triplets.len(), 2);
    }

    #[test]
    fn identical_query_and_positive_yields_zero_active_loss_when_no_negative_gap() {
        let loss = ContrastiveLoss::new(0.0, 0.7, 0.3, 5.0);
        let samples = vec![
            sample("p1", vec![1.0, 0.0], 0.9),
            sample("n1", vec![1.0, 0.0], 0.1),
        ];
        let result = loss.forward_backward(&samples);
        // sim(q,p) == sim(q,n) here (identical vectors), margin 0 => loss <= 0.
        assert_eq!(result.active_count, 0);
        assert_eq!(result.total_loss, 0.0);
    }

    #[test]
    fn gradients_are_clipped_to_max_norm() {
        let loss = ContrastiveLoss::new(2.0, 0.7, 0.3, 0.01);
        let samples = vec![
            sample("p1", vec![1.0, 0.0], 0.9),
            sample("n1", vec![0.0, 1.0], 0.1),
        ];
        let result = loss.forward_backward(&samples);
        assert_eq!(result.active_count, 1);
        let g = &result.gradients[0];
        let norm_sq: f32 = g
            .d_query
            .iter()
            .chain(g.d_positive.iter())
            .chain(g.d_negative.iter())
            .map(|v| v * v)
            .sum();
        assert!(norm_sq.sqrt() <= 0.01 + 1e-4);
    }

    #[test]
    fn indexed_triplets_reference_original_sample_positions() {
        let loss = ContrastiveLoss::new(0.2, 0.7, 0.3, 5.0);
        let samples = vec![
            sample("p1", vec![1.0, 0.0], 0.9),
            sample("n1", vec![0.0, 1.0], 0.1),
        ];
        let (_, indexed) = loss.mine_triplets_indexed(&samples);
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].positive_index, 0);
        assert_eq!(indexed[0].negative_index, 1);
    }

    #[test]
    fn inactive_triplet_has_zero_gradient() {
        let loss = ContrastiveLoss::new(0.0, 0.7, 0.3, 5.0);
        let samples = vec![
            sample("p1", vec![1.0, 0.0], 0.9),
            sample("n1", vec![1.0, 0.0], 0.1),
        ];
        let result = loss.forward_backward(&samples);
        assert!(result.gradients[0].d_query.iter().all(|&v| v == 0.0));
    }
}
