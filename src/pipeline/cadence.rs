// src/pipeline/cadence.rs
//
// Decision cadence. The policy runs only on decision boundaries
// (`tick % interval == 0`); every other tick reuses the current decision.
// Policy calls are time-bounded and never stall the tick.

use crate::errors::Degradation;
use crate::inference::Policy;
use crate::state_vector::StateAssembler;
use crate::types::{Action, Decision};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceState {
    /// Reusing the last decision
    Holding,
    /// Computing a new one (only observable inside a boundary tick)
    Deciding,
}

#[derive(Debug, Clone)]
pub struct CadenceOutcome {
    pub decision: Decision,
    /// True when this tick was a decision boundary and the policy answered
    pub decided: bool,
    pub boundary: bool,
    pub degradations: Vec<Degradation>,
}

enum PolicyCallError {
    Busy,
    Failed(String),
}

pub struct CadenceController {
    interval_ticks: u64,
    policy: Arc<Mutex<Box<dyn Policy>>>,
    timeout: Duration,
    assembler: StateAssembler,
    current: Decision,
    state: CadenceState,
    policy_degraded: bool,
    policy_outages: u64,
    decisions_made: u64,
}

impl CadenceController {
    pub fn new(policy: Box<dyn Policy>, interval_ticks: u64, timeout: Duration) -> Self {
        let interval_ticks = interval_ticks.max(1);
        let assembler = StateAssembler::new(policy.input_dim());
        Self {
            interval_ticks,
            policy: Arc::new(Mutex::new(policy)),
            timeout,
            assembler,
            current: Decision::initial(interval_ticks),
            state: CadenceState::Holding,
            policy_degraded: false,
            policy_outages: 0,
            decisions_made: 0,
        }
    }

    pub fn interval_ticks(&self) -> u64 {
        self.interval_ticks
    }

    pub fn current(&self) -> Decision {
        self.current
    }

    pub fn state(&self) -> CadenceState {
        self.state
    }

    pub fn decisions_made(&self) -> u64 {
        self.decisions_made
    }

    /// Times the policy went from answering to not answering.
    pub fn policy_outages(&self) -> u64 {
        self.policy_outages
    }

    pub fn state_mismatch_episodes(&self) -> u64 {
        self.assembler.mismatch_episodes()
    }

    pub fn is_boundary(&self, tick: u64) -> bool {
        tick > 0 && tick % self.interval_ticks == 0
    }

    pub async fn on_tick(&mut self, tick: u64, occupancy: &[u32], phase: &[f32]) -> CadenceOutcome {
        if !self.is_boundary(tick) {
            return CadenceOutcome {
                decision: self.current,
                decided: false,
                boundary: false,
                degradations: Vec::new(),
            };
        }

        self.state = CadenceState::Deciding;
        let mut degradations = Vec::new();

        let assembled = self.assembler.assemble(occupancy, phase, tick);
        degradations.extend(assembled.mismatch);

        let decided = match self.call_policy(assembled.state).await {
            Ok(code) => {
                let previous = self.current.action;
                self.current = Decision {
                    action: Action::from_code(code),
                    computed_at: tick,
                    stale_at: tick + self.interval_ticks,
                };
                self.decisions_made += 1;
                if self.policy_degraded {
                    info!(tick, "✓ Policy answering again");
                    self.policy_degraded = false;
                }
                if previous != self.current.action {
                    info!(
                        tick,
                        "🤖 Decision: {} -> {}",
                        previous.as_str(),
                        self.current.action.as_str()
                    );
                } else {
                    debug!(tick, "🤖 Decision: {}", self.current.action.as_str());
                }
                true
            }
            Err(degradation) => {
                // Keep the action but mark it as due for replacement again
                self.current.stale_at = tick + self.interval_ticks;
                if !self.policy_degraded {
                    warn!(
                        tick,
                        kind = degradation.kind(),
                        "⚠️  {} (holding {})",
                        degradation,
                        self.current.action.as_str()
                    );
                    self.policy_degraded = true;
                    self.policy_outages += 1;
                }
                degradations.push(degradation);
                false
            }
        };

        self.state = CadenceState::Holding;
        CadenceOutcome {
            decision: self.current,
            decided,
            boundary: true,
            degradations,
        }
    }

    /// Runs the policy on the blocking pool, bounded by `timeout`. A call
    /// that overruns keeps the policy locked, so the next boundary reports
    /// it busy instead of queueing behind it.
    async fn call_policy(&self, state: Vec<f32>) -> Result<i64, Degradation> {
        let policy = Arc::clone(&self.policy);
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = match policy.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return Err(PolicyCallError::Busy),
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };
            guard
                .predict(&state, true)
                .map_err(|e| PolicyCallError::Failed(e.to_string()))
        });

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(code))) => Ok(code),
            Ok(Ok(Err(PolicyCallError::Busy))) => Err(Degradation::PolicyBusy),
            Ok(Ok(Err(PolicyCallError::Failed(msg)))) => Err(Degradation::PolicyFailed(msg)),
            Ok(Err(join_err)) => Err(Degradation::PolicyFailed(join_err.to_string())),
            Err(_) => Err(Degradation::PolicyTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Switches when the first state value is positive; records every state seen.
    pub struct ThresholdPolicy {
        pub input_dim: usize,
        pub seen: Arc<Mutex<Vec<Vec<f32>>>>,
    }

    impl ThresholdPolicy {
        pub fn new(input_dim: usize) -> (Self, Arc<Mutex<Vec<Vec<f32>>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    input_dim,
                    seen: Arc::clone(&seen),
                },
                seen,
            )
        }
    }

    impl Policy for ThresholdPolicy {
        fn name(&self) -> &str {
            "threshold"
        }

        fn input_dim(&self) -> usize {
            self.input_dim
        }

        fn predict(&mut self, state: &[f32], _deterministic: bool) -> Result<i64> {
            self.seen.lock().unwrap().push(state.to_vec());
            Ok(if state.first().copied().unwrap_or(0.0) > 0.0 {
                1
            } else {
                0
            })
        }
    }

    /// Sleeps before answering SWITCH; counts calls.
    struct SlowPolicy {
        delay: Duration,
        calls: Arc<AtomicU64>,
    }

    impl Policy for SlowPolicy {
        fn name(&self) -> &str {
            "slow"
        }

        fn input_dim(&self) -> usize {
            2
        }

        fn predict(&mut self, _state: &[f32], _deterministic: bool) -> Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(1)
        }
    }

    struct FailingPolicy;

    impl Policy for FailingPolicy {
        fn name(&self) -> &str {
            "failing"
        }

        fn input_dim(&self) -> usize {
            2
        }

        fn predict(&mut self, _state: &[f32], _deterministic: bool) -> Result<i64> {
            anyhow::bail!("model exploded")
        }
    }

    #[tokio::test]
    async fn test_decides_only_on_boundaries() {
        let (policy, seen) = ThresholdPolicy::new(2);
        let mut cadence =
            CadenceController::new(Box::new(policy), 5, Duration::from_millis(500));

        let mut decided_at = Vec::new();
        for tick in 1..=15 {
            let out = cadence.on_tick(tick, &[1], &[0.0]).await;
            if out.decided {
                decided_at.push(tick);
            }
            assert_eq!(cadence.state(), CadenceState::Holding);
        }
        assert_eq!(decided_at, vec![5, 10, 15]);
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(cadence.decisions_made(), 3);
    }

    #[tokio::test]
    async fn test_decision_held_between_boundaries() {
        let (policy, _) = ThresholdPolicy::new(2);
        let mut cadence =
            CadenceController::new(Box::new(policy), 5, Duration::from_millis(500));

        for tick in 1..5 {
            let out = cadence.on_tick(tick, &[1], &[0.0]).await;
            assert_eq!(out.decision, Decision::initial(5));
        }

        let at_five = cadence.on_tick(5, &[1], &[0.0]).await.decision;
        assert_eq!(at_five.action, Action::Switch);
        assert_eq!(at_five.computed_at, 5);
        assert_eq!(at_five.stale_at, 10);

        // Counts drop, but nothing changes until tick 10
        for tick in 6..10 {
            let out = cadence.on_tick(tick, &[0], &[0.0]).await;
            assert_eq!(out.decision, at_five);
        }
        let at_ten = cadence.on_tick(10, &[0], &[0.0]).await.decision;
        assert_eq!(at_ten.action, Action::Keep);
        assert_eq!(at_ten.computed_at, 10);
    }

    #[tokio::test]
    async fn test_timeout_keeps_previous_decision() {
        let calls = Arc::new(AtomicU64::new(0));
        let policy = SlowPolicy {
            delay: Duration::from_millis(300),
            calls: Arc::clone(&calls),
        };
        let mut cadence =
            CadenceController::new(Box::new(policy), 1, Duration::from_millis(50));

        let started = std::time::Instant::now();
        let out = cadence.on_tick(1, &[1], &[0.0]).await;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!out.decided);
        assert_eq!(out.decision.action, Action::Keep);
        assert_eq!(
            out.degradations,
            vec![Degradation::PolicyTimeout { timeout_ms: 50 }]
        );

        // Still running: the next boundary finds it busy
        let out = cadence.on_tick(2, &[1], &[0.0]).await;
        assert_eq!(out.degradations, vec![Degradation::PolicyBusy]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_policy_error_is_degraded() {
        let mut cadence =
            CadenceController::new(Box::new(FailingPolicy), 2, Duration::from_millis(200));
        let out = cadence.on_tick(2, &[3], &[1.0]).await;
        assert!(!out.decided);
        assert!(matches!(
            out.degradations.as_slice(),
            [Degradation::PolicyFailed(msg)] if msg.contains("exploded")
        ));
        assert!(cadence.policy_degraded);

        // Held action and its origin survive; only the boundary moves on
        assert_eq!(
            out.decision,
            Decision {
                action: Action::Keep,
                computed_at: 0,
                stale_at: 4,
            }
        );
        for tick in [3, 4, 5, 6] {
            let out = cadence.on_tick(tick, &[3], &[1.0]).await;
            assert!(out.decision.stale_at > tick);
        }
        assert_eq!(cadence.current().stale_at, 8);
        assert_eq!(cadence.policy_outages(), 1);
    }

    #[tokio::test]
    async fn test_policy_outage_counted_per_episode() {
        let calls = Arc::new(AtomicU64::new(0));
        let policy = SlowPolicy {
            delay: Duration::from_millis(150),
            calls: Arc::clone(&calls),
        };
        let mut cadence =
            CadenceController::new(Box::new(policy), 1, Duration::from_millis(50));

        // Timeout then busy: one outage
        cadence.on_tick(1, &[1], &[0.0]).await;
        cadence.on_tick(2, &[1], &[0.0]).await;
        assert_eq!(cadence.policy_outages(), 1);

        // Once the stalled call finishes, a generous timeout lets it answer
        tokio::time::sleep(Duration::from_millis(200)).await;
        cadence.timeout = Duration::from_millis(1000);
        assert!(cadence.on_tick(3, &[1], &[0.0]).await.decided);
        assert!(!cadence.policy_degraded);

        cadence.timeout = Duration::from_millis(50);
        cadence.on_tick(4, &[1], &[0.0]).await;
        assert_eq!(cadence.policy_outages(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_still_decides_on_zero_vector() {
        let (policy, seen) = ThresholdPolicy::new(3);
        let mut cadence =
            CadenceController::new(Box::new(policy), 1, Duration::from_millis(500));
        let out = cadence.on_tick(1, &[4, 4, 4], &[1.0]).await;
        assert!(out.decided);
        assert_eq!(out.decision.action, Action::Keep);
        assert_eq!(
            out.degradations,
            vec![Degradation::DimensionMismatch {
                expected: 3,
                got: 4
            }]
        );
        assert_eq!(seen.lock().unwrap()[0], vec![0.0; 3]);
        assert_eq!(cadence.state_mismatch_episodes(), 1);
    }
}
