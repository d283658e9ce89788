use std::time::Instant;

use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, SeedableRng};
use rfmap::{
    batch,
    gaussian_fit::GaussianParams,
    receptive_field::StimulusGrid,
    session,
    synthetic::{self, SyntheticUnit},
};

#[path = "../scenario_params.rs"]
mod scenario_params;

fn main() {
    env_logger::init();

    let params = scenario_params::get_scenario_params();
    let positions: Vec<f64> = (0..9).map(|i| -40.0 + 10.0 * i as f64).collect();
    let grid = StimulusGrid::new(&positions, &positions).unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    let center_dist = Uniform::new(-30.0, 30.0);
    let sigma_dist = Uniform::new(8.0, 20.0);
    let amplitude_dist = Uniform::new(10.0, 60.0);

    let units: Vec<SyntheticUnit> = (0..scenario_params::NUM_UNITS)
        .map(|unit_id| SyntheticUnit {
            unit_id: unit_id as u64,
            brain_area: if unit_id % 3 == 0 { "LGD" } else { "VISP" }.to_string(),
            rf: GaussianParams {
                offset: 1.0,
                center_x: center_dist.sample(&mut rng),
                center_y: center_dist.sample(&mut rng),
                sigma_x: sigma_dist.sample(&mut rng),
                sigma_y: sigma_dist.sample(&mut rng),
                amplitude: amplitude_dist.sample(&mut rng),
            },
        })
        .collect();

    let session = synthetic::generate_session(
        "benchmark",
        &units,
        &grid,
        scenario_params::NUM_REPEATS,
        scenario_params::PRESENTATION_DURATION,
        &mut rng,
    )
    .unwrap();

    let observations = session::attribute_to_positions(&session.spikes, &session.stimuli);

    let wall_start = Instant::now();
    let report = batch::run_batch(&observations, &grid, &params).unwrap();
    let wall_time = wall_start.elapsed();

    let fit_throughput = report.rows.len() as f64 / wall_time.as_secs_f64();
    let mean_r_squared =
        report.rows.iter().map(|row| row.r_squared).sum::<f64>() / report.rows.len() as f64;

    eprintln!("Spikes: {}", session.spikes.len());
    eprintln!(
        "Units fitted: {} ({} failed)",
        report.rows.len(),
        report.failures.len()
    );
    eprintln!("Mean R squared: {:.4}", mean_r_squared);
    eprintln!(
        "Fit throughput: {:.3e} units/s ({:.3} ms per unit)",
        fit_throughput,
        1e3 / fit_throughput
    );
}
