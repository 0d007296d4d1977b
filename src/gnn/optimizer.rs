//! Adam optimizer (C8): per-parameter first/second moment estimates with
//! bias correction, applied per layer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
    step: u64,
}

/// Adam optimizer state, keyed by layer id so every layer tracks its own
/// moment estimates and step counter.
pub struct AdamOptimizer {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    state: HashMap<String, Moments>,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            state: HashMap::new(),
        }
    }

    /// Updates `weights` in place given `gradients` for `layer_id`,
    /// maintaining that layer's own moment estimates and step counter.
    pub fn step(&mut self, layer_id: &str, weights: &mut [f32], gradients: &[f32]) {
        debug_assert_eq!(weights.len(), gradients.len());
        let moments = self
            .state
            .entry(layer_id.to_string())
            .or_insert_with(|| Moments {
                m: vec![0.0; weights.len()],
                v: vec![0.0; weights.len()],
                step: 0,
            });
        if moments.m.len() != weights.len() {
            moments.m = vec![0.0; weights.len()];
            moments.v = vec![0.0; weights.len()];
        }
        moments.step += 1;
        let t = moments.step as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        for i in 0..weights.len() {
            let g = gradients[i];
            moments.m[i] = self.beta1 * moments.m[i] + (1.0 - self.beta1) * g;
            moments.v[i] = self.beta2 * moments.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = moments.m[i] / bias_correction1;
            let v_hat = moments.v[i] / bias_correction2;
            weights[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }

    /// Applies `step` across every layer present in both maps.
    pub fn step_all(
        &mut self,
        weights: &mut HashMap<String, Vec<f32>>,
        gradients: &HashMap<String, Vec<f32>>,
    ) {
        for (layer_id, grad) in gradients {
            if let Some(w) = weights.get_mut(layer_id) {
                self.step(layer_id, w, grad);
            }
        }
    }

    pub fn reset(&mut self) {
        self.state.clear();
    }

    /// Exports the per-layer moment state for checkpointing.
    pub fn export_state(&self) -> OptimizerState {
        OptimizerState {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            layers: self.state.clone(),
        }
    }

    /// Restores a previously exported moment state.
    pub fn import_state(&mut self, state: OptimizerState) {
        self.learning_rate = state.learning_rate;
        self.beta1 = state.beta1;
        self.beta2 = state.beta2;
        self.epsilon = state.epsilon;
        self.state = state.layers;
    }
}

/// Serializable snapshot of an `AdamOptimizer`'s moment state, embedded in
/// trainer checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerState {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    layers: HashMap<String, Moments>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_decrease_toward_zero_on_constant_gradient() {
        // Testable property 10: a constant positive gradient whose sign
        // matches the weight's sign should strictly shrink |w| toward 0.
        let mut opt = AdamOptimizer::new(0.1, 0.9, 0.999, 1e-8);
        let mut w = vec![1.0_f32];
        let grad = vec![1.0_f32];
        let mut prev = w[0].abs();
        for _ in 0..20 {
            opt.step("layer0", &mut w, &grad);
            assert!(w[0].abs() <= prev + 1e-6);
            prev = w[0].abs();
        }
    }

    #[test]
    fn separate_layers_track_independent_moments() {
        let mut opt = AdamOptimizer::new(0.1, 0.9, 0.999, 1e-8);
        let mut a = vec![1.0];
        let mut b = vec![1.0];
        opt.step("a", &mut a, &[1.0]);
        opt.step("b", &mut b, &[2.0]);
        opt.step("a", &mut a, &[1.0]);
        // b only stepped once; a stepped twice, so they diverge.
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn step_all_only_touches_layers_present_in_gradients() {
        let mut opt = AdamOptimizer::new(0.1, 0.9, 0.999, 1e-8);
        let mut weights = HashMap::new();
        weights.insert("a".to_string(), vec![1.0]);
        weights.insert("b".to_string(), vec![1.0]);
        let mut gradients = HashMap::new();
        gradients.insert("a".to_string(), vec![1.0]);
        opt.step_all(&mut weights, &gradients);
        assert_ne!(weights["a"][0], 1.0);
        assert_eq!(weights["b"][0], 1.0);
    }
}
