use serde::{Deserialize, Serialize};
use tracing::debug;

/// Value of a hyperparameter as a function of the training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
    Constant(f32),
    /// Straight line from `start` to `end` over `steps`, then held.
    Linear { start: f32, end: f32, steps: usize },
    /// Geometric interpolation from `start` to `end` over `steps`, then held.
    Exponential { start: f32, end: f32, steps: usize },
    /// Multiplied by `gamma` every `step_size` steps.
    StepDecay { start: f32, gamma: f32, step_size: usize },
}

impl Schedule {
    pub fn value_at(&self, step: usize) -> f32 {
        match *self {
            Schedule::Constant(v) => v,
            Schedule::Linear { start, end, steps } => start + (end - start) * progress(step, steps),
            Schedule::Exponential { start, end, steps } => {
                if start <= 0.0 || end <= 0.0 {
                    return start + (end - start) * progress(step, steps);
                }
                start * (end / start).powf(progress(step, steps))
            }
            Schedule::StepDecay {
                start,
                gamma,
                step_size,
            } => start * gamma.powi((step / step_size.max(1)) as i32),
        }
    }
}

fn progress(step: usize, steps: usize) -> f32 {
    if steps == 0 {
        1.0
    } else {
        (step.min(steps) as f32) / steps as f32
    }
}

/// Stateful wrapper advancing a [`Schedule`] once per call to `step`.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub name: &'static str,
    pub schedule: Schedule,
    current_step: usize,
}

/// Inverse temperature `lambda` handed to routing.
pub type LambdaSchedule = Scheduler;
/// Spread-loss margin.
pub type MarginSchedule = Scheduler;

impl Scheduler {
    pub fn new(name: &'static str, schedule: Schedule) -> Self {
        Self {
            name,
            schedule,
            current_step: 0,
        }
    }

    /// Inverse temperature annealed from 1e-3 to 1e-2.
    pub fn inverse_temperature(steps: usize) -> LambdaSchedule {
        Self::new(
            "lambda",
            Schedule::Exponential {
                start: 1e-3,
                end: 1e-2,
                steps,
            },
        )
    }

    /// Spread-loss margin grown from 0.2 to 0.9.
    pub fn spread_margin(steps: usize) -> MarginSchedule {
        Self::new(
            "spread_margin",
            Schedule::Linear {
                start: 0.2,
                end: 0.9,
                steps,
            },
        )
    }

    pub fn current(&self) -> f32 {
        self.schedule.value_at(self.current_step)
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Returns the value for the current step, then advances.
    pub fn step(&mut self) -> f32 {
        let value = self.current();
        self.current_step += 1;
        debug!(schedule = self.name, step = self.current_step, value, "scheduled value");
        value
    }
}
