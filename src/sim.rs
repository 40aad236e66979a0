//! Ground-truth simulation of the forced mass-spring-damper with a wall.
//!
//! The truth is integrated with explicit Euler at `fine_dt` and downsampled
//! to the filter period. The wall is invisible to the filters' linear model.

use nalgebra::Vector2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use tracing::debug;

use crate::config::{RunConfig, SystemParameters};
use crate::EstimationError;

/// One impact against the wall.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WallContact {
    /// End time of the fine step that hit the wall [s]
    pub time: f64,
    pub velocity_before: f64,
}

/// Aligned coarse-rate sequences; index `k` is time `t_start + k * ts`.
#[derive(Debug, Clone)]
pub struct SimulationData {
    pub times: Vec<f64>,
    pub true_states: Vec<Vector2<f64>>,
    pub measurements: Vec<f64>,
    pub controls: Vec<f64>,
    pub contacts: Vec<WallContact>,
}

impl SimulationData {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Forcing `F(t)`.
pub fn force(sys: &SystemParameters, t: f64) -> f64 {
    sys.force_amplitude * t.sin()
}

/// One Euler step from `state` at time `t`. Returns the next state and
/// whether the wall was hit.
pub fn fine_step(sys: &SystemParameters, state: Vector2<f64>, t: f64) -> (Vector2<f64>, bool) {
    let (z, v) = (state[0], state[1]);
    let accel = (force(sys, t) - sys.stiffness * z - sys.damping * v) / sys.mass;
    let z_next = z + sys.fine_dt * v;
    let v_next = v + sys.fine_dt * accel;

    if z_next >= sys.wall_pos {
        (Vector2::new(sys.wall_pos, -v), true)
    } else {
        (Vector2::new(z_next, v_next), false)
    }
}

/// Fine-step index after which each coarse sample is taken: the first fine
/// step starting at or after `t_start + k * ts`.
pub fn sample_schedule(sys: &SystemParameters, samples: usize) -> Vec<usize> {
    (0..samples)
        .map(|k| {
            let ratio = k as f64 * sys.ts / sys.fine_dt;
            let nearest = ratio.round();
            if (ratio - nearest).abs() < 1e-9 {
                nearest as usize
            } else {
                ratio.ceil() as usize
            }
        })
        .collect()
}

pub fn simulate(cfg: &RunConfig) -> Result<SimulationData, EstimationError> {
    cfg.validate()?;
    let sys = &cfg.system;
    let c = cfg.model.c;
    let n = cfg.steps();
    let schedule = sample_schedule(sys, n);

    let noise = Normal::new(0.0, cfg.model.measurement_noise_var.sqrt())
        .map_err(|e| EstimationError::InvalidConfig(format!("measurement noise: {e}")))?;
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);

    let mut data = SimulationData {
        times: Vec::with_capacity(n),
        true_states: Vec::with_capacity(n),
        measurements: Vec::with_capacity(n),
        controls: Vec::with_capacity(n),
        contacts: Vec::new(),
    };

    let mut state = cfg.initial_true_state();
    let mut next_sample = schedule.iter().copied().enumerate().peekable();
    let mut i = 0usize;
    while next_sample.peek().is_some() {
        let t = sys.t_start + i as f64 * sys.fine_dt;
        let (next, collided) = fine_step(sys, state, t);
        if collided {
            let contact = WallContact {
                time: t + sys.fine_dt,
                velocity_before: state[1],
            };
            debug!(time = contact.time, velocity = contact.velocity_before, "wall contact");
            data.contacts.push(contact);
        }
        state = next;

        while let Some((k, _)) = next_sample.next_if(|&(_, at)| at == i) {
            let t_k = sys.t_start + k as f64 * sys.ts;
            let y = c[0] * state[0] + c[1] * state[1] + noise.sample(&mut rng);
            data.times.push(t_k);
            data.true_states.push(state);
            data.measurements.push(y);
            data.controls.push(force(sys, t_k));
        }
        i += 1;
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_run_has_expected_shape() {
        let data = simulate(&RunConfig::default()).unwrap();
        assert_eq!(data.len(), 250);
        assert_eq!(data.true_states.len(), 250);
        assert_eq!(data.measurements.len(), 250);
        assert_eq!(data.controls.len(), 250);
        assert_eq!(data.times[0], 0.0);
        assert!((data.times[249] - 24.9).abs() < 1e-9);
        assert!(data.controls[0].abs() < 1e-15);
    }

    #[test]
    fn positions_never_pass_the_wall() {
        let cfg = RunConfig::default();
        let data = simulate(&cfg).unwrap();
        assert!(!data.contacts.is_empty());
        assert!(data
            .true_states
            .iter()
            .all(|x| x[0] <= cfg.system.wall_pos));
    }

    #[test]
    fn contact_clamps_and_reverses_velocity() {
        let sys = SystemParameters::default();
        let state = Vector2::new(sys.wall_pos - 1e-4, 1.5);
        let (next, collided) = fine_step(&sys, state, 0.0);
        assert!(collided);
        assert_eq!(next[0], sys.wall_pos);
        assert_eq!(next[1], -1.5);
    }

    #[test]
    fn free_step_follows_euler() {
        let sys = SystemParameters::default();
        let state = Vector2::new(0.5, -0.2);
        let (next, collided) = fine_step(&sys, state, 1.0);
        assert!(!collided);
        let accel = (10.0 * 1.0f64.sin() - 5.0 * 0.5 - 3.0 * -0.2) / 10.0;
        assert!((next[0] - (0.5 - 0.2 * 1e-3)).abs() < 1e-15);
        assert!((next[1] - (-0.2 + accel * 1e-3)).abs() < 1e-15);
    }

    #[test]
    fn recorded_contacts_had_positive_velocity() {
        let data = simulate(&RunConfig::default()).unwrap();
        assert!(data.contacts.iter().all(|c| c.velocity_before >= 0.0));
    }

    #[test]
    fn same_seed_same_measurements() {
        let cfg = RunConfig::default();
        let a = simulate(&cfg).unwrap();
        let b = simulate(&cfg).unwrap();
        assert_eq!(a.measurements, b.measurements);

        let other = RunConfig {
            seed: 7,
            ..RunConfig::default()
        };
        let c = simulate(&other).unwrap();
        assert_ne!(a.measurements, c.measurements);
        assert_eq!(a.true_states, c.true_states);
    }

    #[test]
    fn schedule_matches_whole_substeps() {
        let sys = SystemParameters::default();
        let schedule = sample_schedule(&sys, 250);
        assert!(schedule.iter().enumerate().all(|(k, &i)| i == 100 * k));
    }

    #[test]
    fn uneven_fine_step_keeps_samples_on_time() {
        let mut cfg = RunConfig::default();
        cfg.system.fine_dt = 0.03;
        cfg.system.wall_pos = 100.0;
        let sys = &cfg.system;

        let schedule = sample_schedule(sys, cfg.steps());
        for (k, &i) in schedule.iter().enumerate() {
            let t_k = k as f64 * sys.ts;
            let start = i as f64 * sys.fine_dt;
            assert!(start >= t_k - 1e-9 && start < t_k + sys.fine_dt);
        }
        assert_eq!(schedule[249], 830);

        let data = simulate(&cfg).unwrap();
        assert_eq!(data.len(), 250);
        let mut state = cfg.initial_true_state();
        for i in 0..=schedule[249] {
            state = fine_step(sys, state, i as f64 * sys.fine_dt).0;
        }
        assert_eq!(data.true_states[249], state);
    }

    #[test]
    fn far_wall_is_never_touched() {
        let mut cfg = RunConfig::default();
        cfg.system.wall_pos = 100.0;
        let data = simulate(&cfg).unwrap();
        assert!(data.contacts.is_empty());
    }
}
