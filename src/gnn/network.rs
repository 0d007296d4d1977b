//! GNN layer forward/backward (C6): project (+ optional neighbor
//! aggregation), ReLU, optional residual, with an activation cache that
//! backprop walks in reverse.
//!
//! Grounded in `src/weights` for tensor storage; `layer_backward` is the
//! public chain-rule primitive spec.md §4.3 names explicitly.

use crate::weights::WeightTensor;

/// One layer's cached forward-pass state, captured when
/// `collect_activations` is set.
#[derive(Debug, Clone)]
pub struct LayerActivations {
    pub layer_id: String,
    pub input: Vec<f32>,
    pub weights: WeightTensor,
    pub pre_activation: Vec<f32>,
    pub post_activation: Vec<f32>,
    pub output: Vec<f32>,
}

/// Gradients produced by `layer_backward`: the weight gradient (flattened
/// row-major, same shape as the layer's tensor) and the gradient to
/// propagate to the layer's input.
#[derive(Debug, Clone)]
pub struct LayerGradients {
    pub d_weights: Vec<f32>,
    pub d_input: Vec<f32>,
}

/// A single GNN layer: `pre = x W^T (+ aggregated neighbor features)`,
/// `post = ReLU(pre)`, `out = post (+ x if residual)`.
pub struct GnnLayer {
    pub layer_id: String,
    pub residual: bool,
}

impl GnnLayer {
    pub fn new(layer_id: impl Into<String>, residual: bool) -> Self {
        Self {
            layer_id: layer_id.into(),
            residual,
        }
    }

    /// Runs the layer forward. `neighbor_aggregate`, when supplied, is
    /// added elementwise to `pre` before the ReLU (mean/sum neighbor
    /// features from an external graph structure).
    pub fn forward(
        &self,
        input: &[f32],
        weights: &WeightTensor,
        neighbor_aggregate: Option<&[f32]>,
    ) -> LayerActivations {
        debug_assert_eq!(input.len(), weights.cols);
        let mut pre = vec![0.0_f32; weights.rows];
        for r in 0..weights.rows {
            let row = weights.row(r);
            pre[r] = row.iter().zip(input.iter()).map(|(w, x)| w * x).sum();
        }
        if let Some(agg) = neighbor_aggregate {
            for (p, a) in pre.iter_mut().zip(agg.iter()) {
                *p += a;
            }
        }
        let post: Vec<f32> = pre.iter().map(|&v| v.max(0.0)).collect();
        let output = if self.residual && input.len() == post.len() {
            post.iter().zip(input.iter()).map(|(p, x)| p + x).collect()
        } else {
            post.clone()
        };
        LayerActivations {
            layer_id: self.layer_id.clone(),
            input: input.to_vec(),
            weights: weights.clone(),
            pre_activation: pre,
            post_activation: post,
            output,
        }
    }
}

/// The public backward primitive named in spec.md §4.3: given the
/// downstream gradient `d_out`, the cached `input`/`weights`/`pre`/`post`
/// for a layer, and whether it used a residual connection, returns the
/// weight gradient and the gradient to propagate to the layer's input.
pub fn layer_backward(
    d_out: &[f32],
    input: &[f32],
    weights: &WeightTensor,
    pre: &[f32],
    post: &[f32],
    use_residual: bool,
) -> LayerGradients {
    // d_post = d_out, plus the residual's direct pass-through is handled
    // by adding d_out into d_input again below.
    let d_post: Vec<f32> = d_out.to_vec();
    let relu_grad: Vec<f32> = pre.iter().map(|&p| if p > 0.0 { 1.0 } else { 0.0 }).collect();
    let d_pre: Vec<f32> = d_post.iter().zip(relu_grad.iter()).map(|(d, g)| d * g).collect();

    let _ = post; // post is only needed by callers reconstructing activations.

    let mut d_weights = vec![0.0_f32; weights.rows * weights.cols];
    for r in 0..weights.rows {
        for c in 0..weights.cols {
            d_weights[r * weights.cols + c] = d_pre[r] * input[c];
        }
    }

    let mut d_input = vec![0.0_f32; weights.cols];
    for c in 0..weights.cols {
        let mut sum = 0.0_f32;
        for r in 0..weights.rows {
            sum += weights.row(r)[c] * d_pre[r];
        }
        d_input[c] = sum;
    }
    if use_residual && d_input.len() == d_out.len() {
        for (di, d) in d_input.iter_mut().zip(d_out.iter()) {
            *di += d;
        }
    }

    LayerGradients { d_weights, d_input }
}

/// Walks a forward-order activation cache in reverse, producing each
/// layer's weight gradient. A missing cache entry for a layer (e.g. it
/// was skipped during forward) is logged and that layer's gradient is
/// omitted rather than failing the whole batch.
pub fn backward_through_cache(
    cache: &[LayerActivations],
    d_final_output: &[f32],
    residual_flags: &[bool],
) -> Vec<(String, LayerGradients)> {
    let mut out = Vec::with_capacity(cache.len());
    let mut d_out = d_final_output.to_vec();
    for (idx, activ) in cache.iter().enumerate().rev() {
        if activ.pre_activation.is_empty() {
            tracing::warn!(layer = %activ.layer_id, "empty activation cache entry, skipping layer in backward");
            continue;
        }
        let residual = residual_flags.get(idx).copied().unwrap_or(false);
        let grads = layer_backward(
            &d_out,
            &activ.input,
            &activ.weights,
            &activ.pre_activation,
            &activ.post_activation,
            residual,
        );
        d_out = grads.d_input.clone();
        out.push((activ.layer_id.clone(), grads));
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{Initialization, WeightTensor};

    #[test]
    fn forward_applies_relu_and_residual() {
        let w = WeightTensor {
            rows: 2,
            cols: 2,
            data: vec![1.0, 0.0, 0.0, -1.0],
        };
        let layer = GnnLayer::new("l0", true);
        let x = vec![1.0, 2.0];
        let activ = layer.forward(&x, &w, None);
        assert_eq!(activ.pre_activation, vec![1.0, -2.0]);
        assert_eq!(activ.post_activation, vec![1.0, 0.0]);
        // residual: out = post + x
        assert_eq!(activ.output, vec![2.0, 2.0]);
    }

    #[test]
    fn neighbor_aggregate_shifts_pre_activation() {
        let w = WeightTensor::zeros(2, 2);
        let layer = GnnLayer::new("l0", false);
        let x = vec![1.0, 1.0];
        let agg = vec![3.0, 4.0];
        let activ = layer.forward(&x, &w, Some(&agg));
        assert_eq!(activ.pre_activation, vec![3.0, 4.0]);
    }

    #[test]
    fn layer_backward_matches_finite_difference_for_weight_gradient() {
        let w = WeightTensor::initialize(2, 3, Initialization::Xavier, Some(5));
        let layer = GnnLayer::new("l0", false);
        let x = vec![0.5, -0.3, 0.8];
        let activ = layer.forward(&x, &w, None);
        let d_out = vec![1.0, 1.0];
        let grads = layer_backward(
            &d_out,
            &activ.input,
            &activ.weights,
            &activ.pre_activation,
            &activ.post_activation,
            false,
        );

        let eps = 1e-3;
        let mut w_plus = w.clone();
        w_plus.data[0] += eps;
        let out_plus = layer.forward(&x, &w_plus, None);
        let mut w_minus = w.clone();
        w_minus.data[0] -= eps;
        let out_minus = layer.forward(&x, &w_minus, None);
        let loss_plus: f32 = out_plus.output.iter().sum();
        let loss_minus: f32 = out_minus.output.iter().sum();
        let numerical = (loss_plus - loss_minus) / (2.0 * eps);
        assert!((numerical - grads.d_weights[0]).abs() < 1e-2);
    }

    #[test]
    fn backward_through_cache_skips_empty_entries() {
        let w = WeightTensor::zeros(2, 2);
        let layer = GnnLayer::new("l0", false);
        let activ = layer.forward(&[1.0, 1.0], &w, None);
        let empty = LayerActivations {
            layer_id: "l1".to_string(),
            input: vec![],
            weights: WeightTensor::zeros(0, 0),
            pre_activation: vec![],
            post_activation: vec![],
            output: vec![],
        };
        let cache = vec![activ, empty];
        let grads = backward_through_cache(&cache, &[1.0, 1.0], &[false, false]);
        assert_eq!(grads.len(), 1);
        assert_eq!(grads[0].0, "l0");
    }
}
