// src/state_vector.rs
//
// Policy input assembly: occupancy counts followed by the simulator's
// phase slice, in the order the policy was trained on.

use crate::errors::Degradation;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub state: Vec<f32>,
    pub mismatch: Option<Degradation>,
}

impl Assembled {
    pub fn is_degraded(&self) -> bool {
        self.mismatch.is_some()
    }
}

/// Concatenate occupancy then phase. On a length mismatch the result is a
/// zero vector of `expected_len` plus a `DimensionMismatch` degradation.
pub fn assemble(occupancy: &[u32], phase: &[f32], expected_len: usize) -> Assembled {
    let got = occupancy.len() + phase.len();
    if got != expected_len {
        return Assembled {
            state: vec![0.0; expected_len],
            mismatch: Some(Degradation::DimensionMismatch {
                expected: expected_len,
                got,
            }),
        };
    }

    let mut state = Vec::with_capacity(expected_len);
    state.extend(occupancy.iter().map(|&c| c as f32));
    state.extend_from_slice(phase);
    Assembled {
        state,
        mismatch: None,
    }
}

/// Wraps `assemble` with transition-only logging.
pub struct StateAssembler {
    expected_len: usize,
    degraded: bool,
    mismatch_episodes: u64,
}

impl StateAssembler {
    pub fn new(expected_len: usize) -> Self {
        Self {
            expected_len,
            degraded: false,
            mismatch_episodes: 0,
        }
    }

    /// Number of times the dimensions went from matching to mismatched.
    pub fn mismatch_episodes(&self) -> u64 {
        self.mismatch_episodes
    }

    pub fn assemble(&mut self, occupancy: &[u32], phase: &[f32], tick: u64) -> Assembled {
        let assembled = assemble(occupancy, phase, self.expected_len);
        match (&assembled.mismatch, self.degraded) {
            (Some(m), false) => {
                warn!(tick, occupancy = occupancy.len(), phase = phase.len(), "⚠️  {}", m);
                self.degraded = true;
                self.mismatch_episodes += 1;
            }
            (None, true) => {
                info!(tick, "✓ State vector dimensions restored");
                self.degraded = false;
            }
            _ => {}
        }
        assembled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupancy_then_phase() {
        let out = assemble(&[1, 2], &[0.0, 1.0, 0.5], 5);
        assert_eq!(out.state, vec![1.0, 2.0, 0.0, 1.0, 0.5]);
        assert!(!out.is_degraded());
    }

    #[test]
    fn test_mismatch_yields_zero_vector() {
        let out = assemble(&[1, 2, 3], &[1.0], 5);
        assert_eq!(out.state, vec![0.0; 5]);
        assert_eq!(
            out.mismatch,
            Some(Degradation::DimensionMismatch {
                expected: 5,
                got: 4
            })
        );
    }

    #[test]
    fn test_length_always_expected() {
        for occ_len in 0..6 {
            for phase_len in 0..6 {
                let occ = vec![1u32; occ_len];
                let phase = vec![0.5f32; phase_len];
                for expected in [0usize, 3, 4, 7] {
                    assert_eq!(assemble(&occ, &phase, expected).state.len(), expected);
                }
            }
        }
    }

    #[test]
    fn test_assembler_tracks_transitions() {
        let mut asm = StateAssembler::new(3);
        assert!(asm.assemble(&[1], &[1.0], 1).is_degraded());
        assert!(asm.degraded);
        assert!(asm.assemble(&[1], &[1.0], 2).is_degraded());
        assert!(!asm.assemble(&[1, 1], &[1.0], 3).is_degraded());
        assert!(!asm.degraded);
        assert_eq!(asm.mismatch_episodes(), 1);

        // A second outage after recovery is a new episode
        asm.assemble(&[1, 1, 1], &[1.0], 4);
        asm.assemble(&[1, 1, 1], &[1.0], 5);
        assert_eq!(asm.mismatch_episodes(), 2);
    }
}
