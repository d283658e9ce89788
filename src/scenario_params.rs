use rfmap::params::PipelineParams;

pub const NUM_UNITS: usize = 48;
pub const NUM_REPEATS: usize = 10;
pub const PRESENTATION_DURATION: f64 = 0.25;

pub fn get_scenario_params() -> PipelineParams {
    let params_yaml_str = r#"
smoothing_params:
  sigma: 1.0
  truncate: 4.0
fit_params:
  sigma_min: 0.01
  sigma_max: 80.0
  max_iterations: 600
  ftol: 1.0e-10
  xtol: 1.0e-10
  gtol: 1.0e-10
  r_squared_reference: PredictedMean
outline_params:
  scale: 1.0
  num_points: 100
batch_params:
  failure_policy: CollectAndContinue
  group_by_orientation: false
technical_params:
  num_threads: null
  pin_threads: false
"#;

    serde_yaml::from_str(params_yaml_str).unwrap()
}
