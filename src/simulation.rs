// src/simulation.rs
//
// Simulation engine adapters. The engine is a stateful external process
// advanced one tick at a time; only the stepper holds a handle to it.

use crate::types::SimulationConfig;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reset {
    pub observation: Vec<f32>,
    #[serde(default)]
    pub info: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub observation: Vec<f32>,
    #[serde(default)]
    pub reward: f64,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub info: serde_json::Value,
}

/// Terminates an engine from outside while one of its calls is blocked.
pub type KillHandle = Arc<dyn Fn() + Send + Sync>;

pub trait SimulationEngine: Send {
    fn reset(&mut self) -> Result<Reset>;

    fn step(&mut self, action: i64) -> Result<StepResult>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Only engines backed by a process can be killed.
    fn kill_handle(&self) -> Option<KillHandle> {
        None
    }
}

/// `lanes` is the occupancy vector length; the surrogate mirrors it.
pub fn build_engine(config: &SimulationConfig, lanes: usize) -> Result<Box<dyn SimulationEngine>> {
    match config {
        SimulationConfig::Bridge { command } => Ok(Box::new(BridgeEngine::spawn(command)?)),
        SimulationConfig::Surrogate {
            num_phases,
            min_green_ticks,
            episode_ticks,
            arrival_rate,
            seed,
        } => Ok(Box::new(SurrogateEngine::new(SurrogateParams {
            lanes,
            num_phases: *num_phases,
            min_green_ticks: *min_green_ticks,
            episode_ticks: *episode_ticks,
            arrival_rate: *arrival_rate,
            seed: *seed,
        }))),
    }
}

// ============================================================================
// PROCESS BRIDGE
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BridgeRequest {
    Reset,
    Step { action: i64 },
    Close,
}

/// Talks line-delimited JSON to an external simulator wrapper over
/// stdin/stdout. One request line, one response line.
pub struct BridgeEngine {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

const BRIDGE_EXIT_GRACE: std::time::Duration = std::time::Duration::from_millis(200);

fn kill_child(child: &Mutex<Child>) {
    let mut child = child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Ok(None) = child.try_wait() {
        if let Err(e) = child.kill() {
            warn!("Failed to kill simulation bridge: {}", e);
            return;
        }
        let _ = child.wait();
    }
}

impl BridgeEngine {
    pub fn spawn(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Simulation bridge command is empty")?;
        info!("🌐 Starting simulation bridge: {}", command.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        let stdin = child.stdin.take().context("Bridge stdin unavailable")?;
        let stdout = child.stdout.take().context("Bridge stdout unavailable")?;

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn request<T: for<'de> Deserialize<'de>>(&mut self, req: &BridgeRequest) -> Result<T> {
        let line = serde_json::to_string(req)?;
        writeln!(self.stdin, "{}", line).context("Bridge write failed")?;
        self.stdin.flush()?;

        let mut response = String::new();
        let n = self
            .stdout
            .read_line(&mut response)
            .context("Bridge read failed")?;
        if n == 0 {
            anyhow::bail!("Simulation bridge closed its output");
        }
        serde_json::from_str(response.trim())
            .with_context(|| format!("Bad bridge response: {}", response.trim()))
    }

    fn exited(&self) -> Result<bool> {
        let mut child = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match child.try_wait()? {
            Some(status) => {
                debug!("Bridge exited: {}", status);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl SimulationEngine for BridgeEngine {
    fn reset(&mut self) -> Result<Reset> {
        self.request(&BridgeRequest::Reset)
    }

    fn step(&mut self, action: i64) -> Result<StepResult> {
        self.request(&BridgeRequest::Step { action })
    }

    // Runs on the blocking pool via the stepper, so the grace sleep is fine here.
    fn close(&mut self) -> Result<()> {
        let line = serde_json::to_string(&BridgeRequest::Close)?;
        if writeln!(self.stdin, "{}", line).is_err() {
            debug!("Bridge already gone");
        }
        if !self.exited()? {
            std::thread::sleep(BRIDGE_EXIT_GRACE);
            if !self.exited()? {
                warn!("Simulation bridge did not exit, killing it");
                kill_child(&self.child);
            }
        }
        Ok(())
    }

    fn kill_handle(&self) -> Option<KillHandle> {
        let child = Arc::clone(&self.child);
        Some(Arc::new(move || kill_child(&child)))
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        kill_child(&self.child);
    }
}

// ============================================================================
// SURROGATE ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct SurrogateParams {
    pub lanes: usize,
    pub num_phases: usize,
    pub min_green_ticks: u32,
    pub episode_ticks: u64,
    pub arrival_rate: f64,
    pub seed: u64,
}

/// Tiny single-junction queue model for offline runs. Lanes are split
/// round-robin across phases; the green phase discharges one vehicle per
/// lane per tick. Observation is `[queue per lane.., phase one-hot.., min_green_elapsed]`.
pub struct SurrogateEngine {
    params: SurrogateParams,
    rng: StdRng,
    queues: Vec<u32>,
    phase: usize,
    ticks_in_phase: u32,
    episode_tick: u64,
}

impl SurrogateEngine {
    pub fn new(params: SurrogateParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        let queues = vec![0; params.lanes];
        Self {
            params,
            rng,
            queues,
            phase: 0,
            ticks_in_phase: 0,
            episode_tick: 0,
        }
    }

    pub fn observation_len(&self) -> usize {
        self.params.lanes + self.params.num_phases.max(1) + 1
    }

    fn observation(&self) -> Vec<f32> {
        let phases = self.params.num_phases.max(1);
        let mut obs = Vec::with_capacity(self.observation_len());
        obs.extend(self.queues.iter().map(|&q| q as f32));
        obs.extend((0..phases).map(|p| if p == self.phase { 1.0 } else { 0.0 }));
        obs.push(if self.ticks_in_phase >= self.params.min_green_ticks {
            1.0
        } else {
            0.0
        });
        obs
    }

    fn lane_is_green(&self, lane: usize) -> bool {
        lane % self.params.num_phases.max(1) == self.phase
    }
}

impl SimulationEngine for SurrogateEngine {
    fn reset(&mut self) -> Result<Reset> {
        self.queues.iter_mut().for_each(|q| *q = 0);
        self.phase = 0;
        self.ticks_in_phase = 0;
        self.episode_tick = 0;
        Ok(Reset {
            observation: self.observation(),
            info: serde_json::json!({ "episode_ticks": self.params.episode_ticks }),
        })
    }

    fn step(&mut self, action: i64) -> Result<StepResult> {
        let phases = self.params.num_phases.max(1);
        if action == 1 && self.ticks_in_phase >= self.params.min_green_ticks {
            self.phase = (self.phase + 1) % phases;
            self.ticks_in_phase = 0;
        } else {
            self.ticks_in_phase += 1;
        }

        for lane in 0..self.queues.len() {
            if self.lane_is_green(lane) {
                self.queues[lane] = self.queues[lane].saturating_sub(1);
            }
            if self.rng.gen_bool(self.params.arrival_rate.clamp(0.0, 1.0)) {
                self.queues[lane] += 1;
            }
        }
        self.episode_tick += 1;

        let waiting: u32 = self.queues.iter().sum();
        Ok(StepResult {
            observation: self.observation(),
            reward: -(waiting as f64),
            terminated: false,
            truncated: self.episode_tick >= self.params.episode_ticks,
            info: serde_json::json!({ "step": self.episode_tick, "waiting": waiting }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SurrogateParams {
        SurrogateParams {
            lanes: 4,
            num_phases: 2,
            min_green_ticks: 2,
            episode_ticks: 5,
            arrival_rate: 0.5,
            seed: 3,
        }
    }

    #[test]
    fn test_surrogate_observation_layout() {
        let mut engine = SurrogateEngine::new(params());
        let reset = engine.reset().unwrap();
        assert_eq!(reset.observation.len(), 4 + 2 + 1);
        assert_eq!(&reset.observation[4..], &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_surrogate_respects_min_green() {
        let mut engine = SurrogateEngine::new(params());
        engine.reset().unwrap();
        // Too early to switch
        let obs = engine.step(1).unwrap().observation;
        assert_eq!(&obs[4..6], &[1.0, 0.0]);
        engine.step(0).unwrap();
        let obs = engine.step(1).unwrap().observation;
        assert_eq!(&obs[4..6], &[0.0, 1.0]);
    }

    #[test]
    fn test_surrogate_truncates_episode() {
        let mut engine = SurrogateEngine::new(params());
        engine.reset().unwrap();
        let results: Vec<bool> = (0..5).map(|_| engine.step(0).unwrap().truncated).collect();
        assert_eq!(results, vec![false, false, false, false, true]);
        engine.reset().unwrap();
        assert!(!engine.step(0).unwrap().truncated);
    }

    #[test]
    fn test_bridge_request_wire_format() {
        let step = serde_json::to_string(&BridgeRequest::Step { action: 1 }).unwrap();
        assert_eq!(step, r#"{"cmd":"step","action":1}"#);
        let reset = serde_json::to_string(&BridgeRequest::Reset).unwrap();
        assert_eq!(reset, r#"{"cmd":"reset"}"#);
    }

    #[test]
    fn test_step_result_defaults() {
        let parsed: StepResult = serde_json::from_str(r#"{"observation":[1.0,2.0]}"#).unwrap();
        assert_eq!(parsed.observation, vec![1.0, 2.0]);
        assert!(!parsed.terminated && !parsed.truncated);
    }

    #[test]
    fn test_bridge_rejects_empty_command() {
        assert!(BridgeEngine::spawn(&[]).is_err());
    }

    fn shell(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_kill_handle_unblocks_silent_bridge() {
        let mut engine = BridgeEngine::spawn(&shell("read x; exec sleep 30")).unwrap();
        let kill = engine.kill_handle().unwrap();
        let killer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            kill();
        });

        let started = std::time::Instant::now();
        let err = engine.reset().unwrap_err();
        assert!(format!("{:#}", err).contains("closed its output"));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        killer.join().unwrap();
    }

    #[test]
    fn test_dropping_bridge_reaps_process() {
        let engine = BridgeEngine::spawn(&shell("exec sleep 30")).unwrap();
        let child = Arc::clone(&engine.child);
        drop(engine);
        assert!(child.lock().unwrap().try_wait().unwrap().is_some());
    }
}
