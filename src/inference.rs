// src/inference.rs
//
// Control policies. The loop only sees the `Policy` trait: a fixed-length
// state vector in, a discrete action code out.

use crate::types::PolicyConfig;
use anyhow::Result;
use tracing::info;

pub trait Policy: Send {
    fn name(&self) -> &str;

    /// Length of the state vector the policy was trained on
    fn input_dim(&self) -> usize;

    fn predict(&mut self, state: &[f32], deterministic: bool) -> Result<i64>;
}

pub fn build_policy(config: &PolicyConfig) -> Result<Box<dyn Policy>> {
    match config {
        PolicyConfig::FixedCycle {
            input_dim,
            switch_every,
        } => Ok(Box::new(FixedCyclePolicy::new(*input_dim, *switch_every))),
        #[cfg(feature = "onnx")]
        PolicyConfig::Onnx {
            model_path,
            input_dim,
        } => Ok(Box::new(onnx::OnnxPolicy::new(model_path, *input_dim)?)),
        #[cfg(not(feature = "onnx"))]
        PolicyConfig::Onnx { model_path, .. } => anyhow::bail!(
            "Policy model {} needs the `onnx` feature",
            model_path
        ),
    }
}

// ============================================================================
// FIXED CYCLE BASELINE
// ============================================================================

/// Ignores the state and switches every `switch_every` decisions, like a
/// fixed-time signal plan.
pub struct FixedCyclePolicy {
    input_dim: usize,
    switch_every: u32,
    calls: u64,
}

impl FixedCyclePolicy {
    pub fn new(input_dim: usize, switch_every: u32) -> Self {
        info!(
            "✓ Fixed-cycle policy (input_dim={}, switch every {} decisions)",
            input_dim, switch_every
        );
        Self {
            input_dim,
            switch_every: switch_every.max(1),
            calls: 0,
        }
    }
}

impl Policy for FixedCyclePolicy {
    fn name(&self) -> &str {
        "fixed_cycle"
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn predict(&mut self, state: &[f32], _deterministic: bool) -> Result<i64> {
        if state.len() != self.input_dim {
            anyhow::bail!(
                "state has {} values, expected {}",
                state.len(),
                self.input_dim
            );
        }
        self.calls += 1;
        Ok(if self.calls % self.switch_every as u64 == 0 {
            1
        } else {
            0
        })
    }
}

// ============================================================================
// ONNX POLICY
// ============================================================================

#[cfg(feature = "onnx")]
mod onnx {
    use super::Policy;
    use anyhow::{Context, Result};
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use tracing::{debug, info};

    /// Exported actor network. Output is either the action itself
    /// (one value) or per-action logits (argmax).
    pub struct OnnxPolicy {
        session: Session,
        input_name: String,
        input_dim: usize,
    }

    impl OnnxPolicy {
        pub fn new(model_path: &str, input_dim: usize) -> Result<Self> {
            info!("Loading policy model: {}", model_path);

            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(1)?
                .commit_from_file(model_path)
                .context("Failed to load policy model")?;

            let input_name = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .context("Policy model has no inputs")?;

            info!("✓ Policy ready (input '{}', dim {})", input_name, input_dim);
            Ok(Self {
                session,
                input_name,
                input_dim,
            })
        }
    }

    impl Policy for OnnxPolicy {
        fn name(&self) -> &str {
            "onnx"
        }

        fn input_dim(&self) -> usize {
            self.input_dim
        }

        fn predict(&mut self, state: &[f32], _deterministic: bool) -> Result<i64> {
            let shape = [1usize, self.input_dim];
            let input_value = ort::value::Tensor::from_array((
                shape,
                state.to_vec().into_boxed_slice(),
            ))?;

            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => input_value])?;
            let output = &outputs[0];

            if let Ok((_, data)) = output.try_extract_tensor::<i64>() {
                return data.first().copied().context("Empty policy output");
            }

            let (_, data) = output.try_extract_tensor::<f32>()?;
            debug!("Policy output: {:?}", data);
            if data.len() == 1 {
                return Ok(data[0].round() as i64);
            }
            let action = data
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i as i64)
                .context("Empty policy output")?;
            Ok(action)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_cycle_switches_every_n() {
        let mut policy = FixedCyclePolicy::new(3, 3);
        let state = [0.0f32; 3];
        let actions: Vec<i64> = (0..6)
            .map(|_| policy.predict(&state, true).unwrap())
            .collect();
        assert_eq!(actions, vec![0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_fixed_cycle_rejects_wrong_length() {
        let mut policy = FixedCyclePolicy::new(4, 2);
        assert!(policy.predict(&[0.0; 3], true).is_err());
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_onnx_requires_feature() {
        let config = PolicyConfig::Onnx {
            model_path: "models/policy.onnx".into(),
            input_dim: 7,
        };
        assert!(build_policy(&config).is_err());
    }
}
