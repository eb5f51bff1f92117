// src/pipeline/stepper.rs
//
// Owns the simulation engine handle. Steps exactly once per tick with the
// current action, resets on episode end, and escalates after too many
// consecutive engine failures. Every engine call runs on the blocking pool
// under a timeout, so a hung engine costs one bounded tick, not the loop.

use crate::errors::FatalError;
use crate::simulation::{KillHandle, SimulationEngine};
use crate::types::Action;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_STEPS: u32 = 5;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type SharedEngine = Arc<Mutex<Box<dyn SimulationEngine>>>;

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Stepped {
        reward: f64,
        terminated: bool,
        truncated: bool,
    },
    /// Engine raised or timed out; the same action is retried next tick
    Failed { consecutive: u32 },
}

pub struct SimulationStepper {
    engine: SharedEngine,
    kill: Option<KillHandle>,
    timeout: Duration,
    occupancy_len: usize,
    latest_observation: Vec<f32>,
    retry_limit: u32,
    backoff: Duration,
    consecutive_failures: u32,
    total_failures: u64,
    needs_reset: bool,
    episodes: u64,
}

/// Runs `op` against the engine on the blocking pool, bounded by `timeout`.
/// A call that overruns keeps the engine locked, so the next call reports
/// it busy instead of queueing behind it.
async fn call_engine<T, F>(engine: &SharedEngine, timeout: Duration, op: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn SimulationEngine>) -> anyhow::Result<T> + Send + 'static,
{
    let engine = Arc::clone(engine);
    let handle = tokio::task::spawn_blocking(move || {
        let mut guard = match engine.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                return Err("engine still busy with a previous call".to_string())
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        op(&mut *guard).map_err(|e| format!("{:#}", e))
    });

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(format!("engine call aborted: {}", join_err)),
        Err(_) => Err(format!("no answer within {}ms", timeout.as_millis())),
    }
}

impl SimulationStepper {
    /// Resets the engine once to obtain the initial observation.
    pub async fn start(
        engine: Box<dyn SimulationEngine>,
        occupancy_len: usize,
        retry_limit: u32,
        backoff: Duration,
        timeout: Duration,
    ) -> Result<Self, FatalError> {
        let kill = engine.kill_handle();
        let engine: SharedEngine = Arc::new(Mutex::new(engine));

        let mut stepper = Self {
            engine,
            kill,
            timeout,
            occupancy_len,
            latest_observation: Vec::new(),
            retry_limit,
            backoff,
            consecutive_failures: 0,
            total_failures: 0,
            needs_reset: false,
            episodes: 1,
        };

        let reset = match call_engine(&stepper.engine, timeout, |engine| engine.reset()).await {
            Ok(reset) => reset,
            Err(e) => {
                stepper.close().await;
                return Err(FatalError::ResetFailed(e));
            }
        };
        if reset.observation.len() < occupancy_len {
            stepper.close().await;
            return Err(FatalError::Config(format!(
                "simulation observation has {} values, fewer than the {} occupancy zones",
                reset.observation.len(),
                occupancy_len
            )));
        }
        info!(
            "✓ Simulation ready (observation {} = {} zones + {} phase)",
            reset.observation.len(),
            occupancy_len,
            reset.observation.len() - occupancy_len
        );

        stepper.latest_observation = reset.observation;
        Ok(stepper)
    }

    /// Trailing slice of the latest observation beyond the occupancy length.
    pub fn phase(&self) -> &[f32] {
        self.latest_observation
            .get(self.occupancy_len..)
            .unwrap_or(&[])
    }

    pub fn phase_len(&self) -> usize {
        self.phase().len()
    }

    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub async fn step(&mut self, action: Action) -> Result<StepOutcome, FatalError> {
        if self.consecutive_failures > 0 {
            let factor = self.consecutive_failures.min(MAX_BACKOFF_STEPS);
            tokio::time::sleep(self.backoff * factor).await;
        }

        if self.needs_reset {
            match call_engine(&self.engine, self.timeout, |engine| engine.reset()).await {
                Ok(reset) => {
                    self.latest_observation = reset.observation;
                    self.needs_reset = false;
                    self.episodes += 1;
                }
                Err(e) => return self.fail(format!("reset: {}", e)),
            }
        }

        let code = action.code();
        let result = match call_engine(&self.engine, self.timeout, move |engine| engine.step(code)).await {
            Ok(result) => result,
            Err(e) => return self.fail(e),
        };

        if self.consecutive_failures > 0 {
            info!(
                failed_ticks = self.consecutive_failures,
                "✓ Simulation engine recovered"
            );
            self.consecutive_failures = 0;
        }
        self.latest_observation = result.observation;

        if result.terminated || result.truncated {
            debug!(
                terminated = result.terminated,
                truncated = result.truncated,
                episode = self.episodes,
                "Episode finished, resetting simulation"
            );
            match call_engine(&self.engine, self.timeout, |engine| engine.reset()).await {
                Ok(reset) => {
                    self.latest_observation = reset.observation;
                    self.episodes += 1;
                }
                Err(e) => {
                    warn!("⚠️  Simulation reset failed, retrying next tick: {}", e);
                    self.needs_reset = true;
                }
            }
        }

        Ok(StepOutcome::Stepped {
            reward: result.reward,
            terminated: result.terminated,
            truncated: result.truncated,
        })
    }

    fn fail(&mut self, message: String) -> Result<StepOutcome, FatalError> {
        self.consecutive_failures += 1;
        self.total_failures += 1;

        if self.consecutive_failures > self.retry_limit {
            error!(
                consecutive = self.consecutive_failures,
                "🚨 Simulation engine failed beyond retry limit: {}", message
            );
            return Err(FatalError::SimulationFailed {
                consecutive: self.consecutive_failures,
                last_error: message,
            });
        }
        if self.consecutive_failures == 1 {
            warn!("⚠️  Simulation step failed, will retry: {}", message);
        }
        Ok(StepOutcome::Failed {
            consecutive: self.consecutive_failures,
        })
    }

    /// Asks the engine to shut down; kills its process if it is wedged.
    pub async fn close(&mut self) {
        let grace = self.timeout.max(CLOSE_GRACE);
        if let Err(e) = call_engine(&self.engine, grace, |engine| engine.close()).await {
            warn!("Simulation engine close failed: {}", e);
            if let Some(kill) = &self.kill {
                warn!("🛑 Killing simulation engine process");
                kill();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::simulation::{BridgeEngine, Reset, StepResult};
    use anyhow::Result;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[derive(Debug, Clone, Copy)]
    pub enum EngineStep {
        Ok,
        Fail,
        Truncate,
    }

    /// Observation is `[0; zones]` followed by `[phase value, episode]`.
    pub struct ScriptedEngine {
        pub zones: usize,
        pub script: VecDeque<EngineStep>,
        pub actions: Arc<Mutex<Vec<i64>>>,
        pub closed: Arc<AtomicBool>,
        pub resets: u32,
        pub phase_value: f32,
    }

    impl ScriptedEngine {
        pub fn new(zones: usize, script: &[EngineStep]) -> (Self, Arc<Mutex<Vec<i64>>>) {
            let actions = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    zones,
                    script: script.iter().copied().collect(),
                    actions: Arc::clone(&actions),
                    closed: Arc::new(AtomicBool::new(false)),
                    resets: 0,
                    phase_value: 0.5,
                },
                actions,
            )
        }

        fn observation(&self) -> Vec<f32> {
            let mut obs = vec![0.0; self.zones];
            obs.push(self.phase_value);
            obs.push(self.resets as f32);
            obs
        }
    }

    impl SimulationEngine for ScriptedEngine {
        fn reset(&mut self) -> Result<Reset> {
            self.resets += 1;
            Ok(Reset {
                observation: self.observation(),
                info: serde_json::Value::Null,
            })
        }

        fn step(&mut self, action: i64) -> Result<StepResult> {
            let step = self.script.pop_front().unwrap_or(EngineStep::Ok);
            if let EngineStep::Fail = step {
                anyhow::bail!("traci connection lost");
            }
            self.actions.lock().unwrap().push(action);
            Ok(StepResult {
                observation: self.observation(),
                reward: 0.0,
                terminated: false,
                truncated: matches!(step, EngineStep::Truncate),
                info: serde_json::Value::Null,
            })
        }

        fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Every step blocks the calling thread far longer than the step timeout.
    pub struct StallingEngine {
        pub stall: Duration,
    }

    impl SimulationEngine for StallingEngine {
        fn reset(&mut self) -> Result<Reset> {
            Ok(Reset {
                observation: vec![0.0, 1.0],
                info: serde_json::Value::Null,
            })
        }

        fn step(&mut self, _action: i64) -> Result<StepResult> {
            std::thread::sleep(self.stall);
            Ok(StepResult::default())
        }
    }

    const STEP_TIMEOUT: Duration = Duration::from_millis(500);

    async fn stepper(
        script: &[EngineStep],
        retry_limit: u32,
    ) -> (SimulationStepper, Arc<Mutex<Vec<i64>>>) {
        let (engine, actions) = ScriptedEngine::new(2, script);
        let stepper =
            SimulationStepper::start(Box::new(engine), 2, retry_limit, Duration::ZERO, STEP_TIMEOUT)
                .await
                .unwrap();
        (stepper, actions)
    }

    #[tokio::test]
    async fn test_phase_is_trailing_slice() {
        let (stepper, _) = stepper(&[], 3).await;
        assert_eq!(stepper.phase(), &[0.5, 1.0]);
        assert_eq!(stepper.phase_len(), 2);
    }

    #[tokio::test]
    async fn test_truncation_resets_and_continues() {
        let (mut stepper, actions) = stepper(&[EngineStep::Ok, EngineStep::Truncate], 3).await;
        stepper.step(Action::Keep).await.unwrap();
        let outcome = stepper.step(Action::Switch).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Stepped { truncated: true, .. }));
        assert_eq!(stepper.episodes(), 2);
        // Next tick starts from the reset observation
        assert_eq!(stepper.phase(), &[0.5, 2.0]);
        stepper.step(Action::Keep).await.unwrap();
        assert_eq!(*actions.lock().unwrap(), vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn test_failure_retries_then_recovers() {
        let (mut stepper, actions) =
            stepper(&[EngineStep::Fail, EngineStep::Fail, EngineStep::Ok], 3).await;
        assert_eq!(
            stepper.step(Action::Switch).await.unwrap(),
            StepOutcome::Failed { consecutive: 1 }
        );
        assert_eq!(
            stepper.step(Action::Switch).await.unwrap(),
            StepOutcome::Failed { consecutive: 2 }
        );
        assert!(matches!(
            stepper.step(Action::Switch).await.unwrap(),
            StepOutcome::Stepped { .. }
        ));
        assert_eq!(stepper.consecutive_failures(), 0);
        assert_eq!(stepper.total_failures(), 2);
        assert_eq!(*actions.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_fatal() {
        let (mut stepper, _) = stepper(&[EngineStep::Fail; 4], 3).await;
        for _ in 0..3 {
            assert!(stepper.step(Action::Keep).await.is_ok());
        }
        match stepper.step(Action::Keep).await {
            Err(FatalError::SimulationFailed { consecutive, last_error }) => {
                assert_eq!(consecutive, 4);
                assert!(last_error.contains("traci"));
            }
            other => panic!("expected fatal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_observation_rejected_at_start() {
        let (engine, _) = ScriptedEngine::new(0, &[]);
        let closed = Arc::clone(&engine.closed);
        // Engine reports 2 values but 5 zones are configured
        let result =
            SimulationStepper::start(Box::new(engine), 5, 3, Duration::ZERO, STEP_TIMEOUT).await;
        assert!(matches!(result, Err(FatalError::Config(_))));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_reaches_engine() {
        let (engine, _) = ScriptedEngine::new(2, &[]);
        let closed = Arc::clone(&engine.closed);
        let mut stepper =
            SimulationStepper::start(Box::new(engine), 2, 3, Duration::ZERO, STEP_TIMEOUT)
                .await
                .unwrap();
        stepper.close().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stalled_step_times_out_as_failure() {
        let engine = StallingEngine {
            stall: Duration::from_millis(400),
        };
        let mut stepper = SimulationStepper::start(
            Box::new(engine),
            1,
            2,
            Duration::ZERO,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let started = Instant::now();
        assert_eq!(
            stepper.step(Action::Keep).await.unwrap(),
            StepOutcome::Failed { consecutive: 1 }
        );
        assert!(started.elapsed() < Duration::from_millis(300));

        // The stalled call still holds the engine
        assert_eq!(
            stepper.step(Action::Keep).await.unwrap(),
            StepOutcome::Failed { consecutive: 2 }
        );
        assert!(matches!(
            stepper.step(Action::Keep).await,
            Err(FatalError::SimulationFailed { consecutive: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_bridge_is_bounded_and_killed_on_close() {
        let command: Vec<String> = [
            "sh",
            "-c",
            r#"read x; echo '{"observation":[0,0,0]}'; read y; exec sleep 30"#,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let engine = BridgeEngine::spawn(&command).unwrap();
        let mut stepper = SimulationStepper::start(
            Box::new(engine),
            1,
            3,
            Duration::ZERO,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert_eq!(stepper.phase_len(), 2);

        let started = Instant::now();
        assert_eq!(
            stepper.step(Action::Switch).await.unwrap(),
            StepOutcome::Failed { consecutive: 1 }
        );
        assert!(started.elapsed() < Duration::from_secs(1));

        stepper.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
