use rand::{prelude::Distribution, seq::SliceRandom, Rng};
use simple_error::SimpleError;
use statrs::distribution::{Exp, Poisson};

use crate::{
    error::RfResult,
    gaussian_fit::GaussianParams,
    receptive_field::StimulusGrid,
    session::{Session, SpikeObservation, SpikeRecord, StimulusPresentation},
    types::UnitId,
};

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticUnit {
    pub unit_id: UnitId,
    pub brain_area: String,
    pub rf: GaussianParams,
}

impl SyntheticUnit {
    pub fn rate_at(&self, x_position: f64, y_position: f64) -> f64 {
        self.rf.evaluate(x_position, y_position).max(0.0)
    }

    fn spike_count<R: Rng>(
        &self,
        x_position: f64,
        y_position: f64,
        duration: f64,
        rng: &mut R,
    ) -> RfResult<u64> {
        let expected = self.rate_at(x_position, y_position) * duration;
        if expected <= 0.0 {
            return Ok(0);
        }

        let poisson = Poisson::new(expected).map_err(|error| {
            SimpleError::new(format!(
                "unit {}: invalid expected count {}: {}",
                self.unit_id, expected, error
            ))
        })?;

        let count: f64 = poisson.sample(rng);
        Ok(count as u64)
    }
}

pub fn generate_observations<R: Rng>(
    unit: &SyntheticUnit,
    grid: &StimulusGrid,
    repeats: usize,
    duration: f64,
    rng: &mut R,
) -> RfResult<Vec<SpikeObservation>> {
    let mut observations = Vec::new();

    for _ in 0..repeats {
        for y_position in grid.y_positions() {
            for x_position in grid.x_positions() {
                let count = unit.spike_count(*x_position, *y_position, duration, rng)?;

                for _ in 0..count {
                    observations.push(SpikeObservation {
                        unit_id: unit.unit_id,
                        brain_area: unit.brain_area.clone(),
                        x_position: *x_position,
                        y_position: *y_position,
                        orientation: None,
                    });
                }
            }
        }
    }

    Ok(observations)
}

pub fn generate_session<R: Rng>(
    session_id: &str,
    units: &[SyntheticUnit],
    grid: &StimulusGrid,
    repeats: usize,
    duration: f64,
    rng: &mut R,
) -> RfResult<Session> {
    let mut positions: Vec<(f64, f64)> = (0..repeats)
        .flat_map(|_| {
            grid.y_positions().iter().flat_map(|y_position| {
                grid.x_positions()
                    .iter()
                    .map(move |x_position| (*x_position, *y_position))
            })
        })
        .collect();
    positions.shuffle(rng);

    let mut stimuli = Vec::with_capacity(positions.len());
    let mut spikes = Vec::new();

    for (presentation_idx, (x_position, y_position)) in positions.into_iter().enumerate() {
        let start_time = presentation_idx as f64 * duration;
        let stop_time = start_time + duration;

        for unit in units {
            let count = unit.spike_count(x_position, y_position, duration, rng)?;

            for _ in 0..count {
                spikes.push(SpikeRecord {
                    unit_id: unit.unit_id,
                    brain_area: unit.brain_area.clone(),
                    spike_time: rng.gen_range(start_time..stop_time),
                });
            }
        }

        stimuli.push(StimulusPresentation {
            start_time,
            stop_time,
            x_position: Some(x_position),
            y_position: Some(y_position),
            orientation: None,
        });
    }

    spikes.sort_by(|a, b| a.spike_time.total_cmp(&b.spike_time));

    Ok(Session::new(session_id, spikes, stimuli))
}

// thinning of a homogeneous process at max_rate
pub fn poisson_spike_train<F, R>(
    rate_fn: F,
    max_rate: f64,
    t_start: f64,
    t_stop: f64,
    rng: &mut R,
) -> RfResult<Vec<f64>>
where
    F: Fn(f64) -> f64,
    R: Rng,
{
    if t_stop <= t_start {
        return Err(SimpleError::new("t_stop must be greater than t_start").into());
    }

    let intervals = Exp::new(max_rate).map_err(|error| {
        SimpleError::new(format!("invalid maximum rate {}: {}", max_rate, error))
    })?;

    let mut times = Vec::new();
    let mut t = t_start;

    loop {
        t += intervals.sample(rng);
        if t >= t_stop {
            break;
        }

        let acceptance = rate_fn(t).clamp(0.0, max_rate) / max_rate;
        if rng.gen::<f64>() < acceptance {
            times.push(t);
        }
    }

    Ok(times)
}
