// Simulation time sources

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameTime {
    /// Seconds since the clock started.
    pub elapsed: f32,
    /// Seconds since the previous frame.
    pub delta: f32,
}

pub trait SimulationClock: Send {
    /// Advance to the next frame.
    fn advance(&mut self) -> FrameTime;
}

/// Wall-clock time.
pub struct InstantClock {
    start: Instant,
    last: Instant,
}

impl Default for InstantClock {
    fn default() -> Self {
        Self::new()
    }
}

impl InstantClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
        }
    }
}

impl SimulationClock for InstantClock {
    fn advance(&mut self) -> FrameTime {
        let now = Instant::now();
        let delta = now.duration_since(self.last).as_secs_f32();
        self.last = now;
        FrameTime {
            elapsed: now.duration_since(self.start).as_secs_f32(),
            delta,
        }
    }
}

/// Constant time step, for deterministic runs.
#[derive(Debug, Clone)]
pub struct FixedClock {
    step: f32,
    elapsed: f32,
}

impl FixedClock {
    pub fn new(step: f32) -> Self {
        Self { step, elapsed: 0.0 }
    }
}

impl SimulationClock for FixedClock {
    fn advance(&mut self) -> FrameTime {
        self.elapsed += self.step;
        FrameTime {
            elapsed: self.elapsed,
            delta: self.step,
        }
    }
}
