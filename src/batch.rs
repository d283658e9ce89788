use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    io::Write,
    sync::{
        atomic::{self, AtomicUsize},
        mpsc::{channel as mpsc_channel, Sender},
        Arc,
    },
    thread,
    time::Instant,
};

use core_affinity::CoreId;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use simple_error::try_with;

use crate::{
    error::{RfError, RfResult},
    gaussian_fit::{fit_gaussian, GaussianFit},
    goodness_of_fit::r_squared,
    outline::Outline,
    params::{self, FailurePolicy, PipelineParams},
    receptive_field::{ReceptiveFieldMap, StimulusGrid},
    session::SpikeObservation,
    types::UnitId,
    util::get_partition_range,
};

// -0.0 and 0.0 compare equal
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Orientation(f64);

impl Orientation {
    pub fn new(degrees: f64) -> Self {
        Self(degrees + 0.0)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl PartialEq for Orientation {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Orientation {}

impl PartialOrd for Orientation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Orientation {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0 + 0.0).total_cmp(&(other.0 + 0.0))
    }
}

impl Hash for Orientation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0 + 0.0).to_bits().hash(state);
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitKey {
    pub brain_area: String,
    pub unit_id: UnitId,
    pub orientation: Option<Orientation>,
}

impl UnitKey {
    pub fn new(brain_area: impl Into<String>, unit_id: UnitId) -> Self {
        Self {
            brain_area: brain_area.into(),
            unit_id,
            orientation: None,
        }
    }

    pub fn with_orientation(mut self, orientation: f64) -> Self {
        self.orientation = Some(Orientation::new(orientation));
        self
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit {} ({})", self.unit_id, self.brain_area)?;

        if let Some(orientation) = self.orientation {
            write!(f, " at orientation {}", orientation)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfStatsRow {
    pub brain_area: String,
    pub unit_id: UnitId,
    pub orientation: Option<f64>,
    pub r_squared: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub rf_area: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub amplitude: f64,
    pub offset: f64,
    pub degenerate: bool,
}

impl RfStatsRow {
    pub fn from_analysis(key: &UnitKey, analysis: &UnitAnalysis) -> Self {
        let params = &analysis.fit.params;

        Self {
            brain_area: key.brain_area.clone(),
            unit_id: key.unit_id,
            orientation: key.orientation.map(|orientation| orientation.value()),
            r_squared: analysis.r_squared,
            sigma_x: params.sigma_x_magnitude(),
            sigma_y: params.sigma_y_magnitude(),
            rf_area: params.area(),
            center_x: params.center_x,
            center_y: params.center_y,
            amplitude: params.amplitude,
            offset: params.offset,
            degenerate: analysis.fit.is_degenerate(),
        }
    }
}

#[derive(Debug)]
pub struct UnitFailure {
    pub key: UnitKey,
    pub error: RfError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub rows: Vec<RfStatsRow>,
    pub failures: Vec<UnitFailure>,
}

impl BatchReport {
    pub fn write_json<W: Write>(&self, writer: W) -> RfResult<()> {
        serde_json::to_writer_pretty(writer, &self.rows)?;
        Ok(())
    }

    pub fn to_json_string(&self) -> RfResult<String> {
        Ok(serde_json::to_string_pretty(&self.rows)?)
    }
}

#[derive(Debug, Clone)]
pub struct UnitAnalysis {
    pub map: ReceptiveFieldMap,
    pub smoothed: ReceptiveFieldMap,
    pub fit: GaussianFit,
    pub r_squared: f64,
    pub outline: Outline,
}

pub fn partition_observations(
    observations: &[SpikeObservation],
    group_by_orientation: bool,
) -> BTreeMap<UnitKey, Vec<&SpikeObservation>> {
    let mut partitions: BTreeMap<UnitKey, Vec<&SpikeObservation>> = BTreeMap::new();

    for obs in observations {
        let key = UnitKey {
            brain_area: obs.brain_area.clone(),
            unit_id: obs.unit_id,
            orientation: if group_by_orientation {
                obs.orientation.map(Orientation::new)
            } else {
                None
            },
        };

        partitions.entry(key).or_default().push(obs);
    }

    partitions
}

pub fn analyze_unit(map: &ReceptiveFieldMap, params: &PipelineParams) -> RfResult<UnitAnalysis> {
    let smoothed = match &params.smoothing_params {
        Some(smoothing_params) => map.smoothed(smoothing_params)?,
        None => map.clone(),
    };

    let fit = fit_gaussian(&smoothed, &params.fit_params)?;
    let r_squared = r_squared(
        smoothed.values(),
        &fit.predict(),
        params.fit_params.r_squared_reference,
    )?;
    let outline = Outline::from_outline_params(&fit.params, &params.outline_params)?;

    Ok(UnitAnalysis {
        map: map.clone(),
        smoothed,
        fit,
        r_squared,
        outline,
    })
}

pub fn run_batch(
    observations: &[SpikeObservation],
    grid: &StimulusGrid,
    params: &PipelineParams,
) -> RfResult<BatchReport> {
    try_with!(
        params::validate_pipeline_params(params),
        "invalid pipeline parameters"
    );

    let partitions = partition_observations(observations, params.batch_params.group_by_orientation);

    let maps = partitions
        .into_iter()
        .map(|(key, unit_observations)| {
            let map = ReceptiveFieldMap::count_spikes(grid, unit_observations)?;
            Ok((key, map))
        })
        .collect::<RfResult<Vec<_>>>()?;

    fit_unit_maps(maps, params)
}

// only optimization failures are subject to the failure policy
pub fn fit_unit_maps(
    maps: Vec<(UnitKey, ReceptiveFieldMap)>,
    params: &PipelineParams,
) -> RfResult<BatchReport> {
    try_with!(
        params::validate_pipeline_params(params),
        "invalid pipeline parameters"
    );

    let num_units = maps.len();
    if num_units == 0 {
        log::info!("no units to fit");
        return Ok(BatchReport::default());
    }

    let num_threads = get_num_threads(params).min(num_units);
    let start = Instant::now();

    log::info!(
        "fitting {} units on {} threads",
        num_units,
        num_threads
    );

    let mut remaining = maps;
    let mut chunks = Vec::with_capacity(num_threads);

    for thread_id in (0..num_threads).rev() {
        let range = get_partition_range(num_threads, thread_id, num_units);
        chunks.push((range.start, remaining.split_off(range.start)));
    }

    let (unit_result_tx, unit_result_rx) = mpsc_channel();
    let first_halt = Arc::new(AtomicUsize::new(usize::MAX));
    let mut join_handles = Vec::with_capacity(num_threads);

    for (thread_id, (first_idx, chunk)) in chunks.into_iter().rev().enumerate() {
        let unit_result_tx = unit_result_tx.clone();
        let first_halt = first_halt.clone();
        let params = params.clone();

        join_handles.push(thread::spawn(move || {
            if params.technical_params.pin_threads {
                let core_id = CoreId { id: thread_id };
                core_affinity::set_for_current(core_id);
            }

            fit_chunk(first_idx, chunk, &params, &first_halt, &unit_result_tx);
        }));
    }

    drop(unit_result_tx);

    for (thread_id, join_handle) in join_handles.into_iter().enumerate() {
        if join_handle.join().is_err() {
            return Err(RfError::Worker(format!(
                "worker thread {} panicked",
                thread_id
            )));
        }
    }

    let mut report = BatchReport::default();

    for (_, key, result) in unit_result_rx
        .into_iter()
        .sorted_by_key(|(unit_idx, _, _)| *unit_idx)
    {
        match result {
            Ok(row) => {
                log::debug!("{}: r_squared {:.4}", key, row.r_squared);
                report.rows.push(row);
            }
            Err(error) if !halts_batch(&error, params.batch_params.failure_policy) => {
                log::warn!("skipping {}: {}", key, error);
                report.failures.push(UnitFailure { key, error });
            }
            Err(error) => {
                return Err(RfError::UnitFailed {
                    key,
                    source: Box::new(error),
                });
            }
        }
    }

    log::info!(
        "fitted {} units ({} failed) in {:.3} s",
        report.rows.len(),
        report.failures.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(report)
}

type UnitResult = (usize, UnitKey, RfResult<RfStatsRow>);

// units past the lowest halting index are skipped, earlier ones always run
fn fit_chunk(
    first_idx: usize,
    chunk: Vec<(UnitKey, ReceptiveFieldMap)>,
    params: &PipelineParams,
    first_halt: &AtomicUsize,
    unit_result_tx: &Sender<UnitResult>,
) {
    for (offset, (key, map)) in chunk.into_iter().enumerate() {
        let unit_idx = first_idx + offset;
        if unit_idx > first_halt.load(atomic::Ordering::Relaxed) {
            return;
        }

        let result = analyze_unit(&map, params)
            .map(|analysis| RfStatsRow::from_analysis(&key, &analysis));

        if let Err(error) = &result {
            if halts_batch(error, params.batch_params.failure_policy) {
                first_halt.fetch_min(unit_idx, atomic::Ordering::Relaxed);
            }
        }

        if unit_result_tx.send((unit_idx, key, result)).is_err() {
            return;
        }
    }
}

fn halts_batch(error: &RfError, failure_policy: FailurePolicy) -> bool {
    !(error.is_optimization_error() && failure_policy == FailurePolicy::CollectAndContinue)
}

fn get_num_threads(params: &PipelineParams) -> usize {
    params
        .technical_params
        .num_threads
        .unwrap_or_else(num_cpus::get)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian_fit::GaussianParams;
    use crate::params::FailurePolicy;
    use crate::types::HashSet;
    use float_cmp::assert_approx_eq;
    use itertools::assert_equal;
    use std::f64::consts::PI;

    fn observation(
        unit_id: UnitId,
        brain_area: &str,
        x_position: f64,
        orientation: Option<f64>,
    ) -> SpikeObservation {
        SpikeObservation {
            unit_id,
            brain_area: brain_area.to_string(),
            x_position,
            y_position: 0.0,
            orientation,
        }
    }

    fn gaussian_map(center_x: f64, center_y: f64) -> ReceptiveFieldMap {
        let positions: Vec<f64> = (0..15).map(|i| i as f64).collect();
        let grid = StimulusGrid::new(&positions, &positions).unwrap();
        let params = GaussianParams {
            offset: 0.5,
            center_x,
            center_y,
            sigma_x: 2.0,
            sigma_y: 1.5,
            amplitude: 30.0,
        };
        ReceptiveFieldMap::from_values(grid.clone(), params.sample_grid(&grid)).unwrap()
    }

    fn malformed_map() -> ReceptiveFieldMap {
        let grid = StimulusGrid::new(&[0.0, 1.0, 2.0], &[0.0]).unwrap();
        ReceptiveFieldMap::from_values(grid, ndarray::array![[1.0, 4.0, 2.0]]).unwrap()
    }

    fn three_unit_maps() -> Vec<(UnitKey, ReceptiveFieldMap)> {
        vec![
            (UnitKey::new("VISP", 1), gaussian_map(5.0, 6.0)),
            (UnitKey::new("VISP", 2), malformed_map()),
            (UnitKey::new("VISP", 3), gaussian_map(9.0, 4.0)),
        ]
    }

    #[test]
    fn orientation_keys() {
        assert_eq!(Orientation::new(-0.0), Orientation::new(0.0));
        assert!(Orientation::new(45.0) < Orientation::new(90.0));

        let unique: HashSet<_> = [0.0, -0.0, 90.0, 90.0]
            .into_iter()
            .map(Orientation::new)
            .collect();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn unit_key_display() {
        assert_eq!(UnitKey::new("VISP", 7).to_string(), "unit 7 (VISP)");
        assert_eq!(
            UnitKey::new("LGD", 3).with_orientation(45.0).to_string(),
            "unit 3 (LGD) at orientation 45"
        );
    }

    #[test]
    fn partitions_in_unit_order() {
        let observations = [
            observation(5, "VISP", 0.0, Some(90.0)),
            observation(2, "VISP", 1.0, Some(0.0)),
            observation(5, "VISP", 2.0, Some(0.0)),
            observation(9, "LGD", 3.0, Some(0.0)),
        ];

        let by_unit = partition_observations(&observations, false);
        assert_equal(
            by_unit.keys().cloned(),
            [
                UnitKey::new("LGD", 9),
                UnitKey::new("VISP", 2),
                UnitKey::new("VISP", 5),
            ],
        );
        assert_eq!(by_unit[&UnitKey::new("VISP", 5)].len(), 2);

        let by_orientation = partition_observations(&observations, true);
        assert_eq!(by_orientation.len(), 4);
        assert_eq!(
            by_orientation[&UnitKey::new("VISP", 5).with_orientation(90.0)][0].x_position,
            0.0
        );
    }

    #[test]
    fn analysis_of_clean_field() {
        let map = gaussian_map(7.0, 6.0);
        let params = PipelineParams {
            smoothing_params: None,
            ..PipelineParams::default()
        };

        let analysis = analyze_unit(&map, &params).unwrap();
        let row = RfStatsRow::from_analysis(&UnitKey::new("VISP", 1), &analysis);

        assert_eq!(analysis.smoothed, map);
        assert!(row.r_squared > 0.999);
        assert!((row.center_x - 7.0).abs() < 0.01);
        assert!((row.center_y - 6.0).abs() < 0.01);
        assert_approx_eq!(f64, row.rf_area, PI * row.sigma_x * row.sigma_y);
        assert!(!row.degenerate);
        assert_eq!(analysis.outline.len(), 100);
    }

    #[test]
    fn smoothing_widens_field() {
        let map = gaussian_map(7.0, 7.0);

        let analysis = analyze_unit(&map, &PipelineParams::default()).unwrap();

        assert!(analysis.fit.params.sigma_x_magnitude() > 2.0);
        assert!(analysis.r_squared > 0.95);
        assert_eq!(analysis.map, map);
    }

    #[test]
    fn collect_and_continue() {
        let report = fit_unit_maps(three_unit_maps(), &PipelineParams::default()).unwrap();

        assert_equal(report.rows.iter().map(|row| row.unit_id), [1, 3]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, UnitKey::new("VISP", 2));
        assert!(report.failures[0].error.is_optimization_error());
    }

    #[test]
    fn halt_on_first_error() {
        let mut params = PipelineParams::default();
        params.batch_params.failure_policy = FailurePolicy::HaltOnFirstError;

        let result = fit_unit_maps(three_unit_maps(), &params);

        match result {
            Err(RfError::UnitFailed { key, source }) => {
                assert_eq!(key, UnitKey::new("VISP", 2));
                assert!(source.is_optimization_error());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn chunk_stops_at_halting_unit() {
        let mut params = PipelineParams::default();
        params.batch_params.failure_policy = FailurePolicy::HaltOnFirstError;
        let chunk = vec![
            (UnitKey::new("VISP", 1), malformed_map()),
            (UnitKey::new("VISP", 2), gaussian_map(5.0, 6.0)),
            (UnitKey::new("VISP", 3), gaussian_map(9.0, 4.0)),
        ];
        let first_halt = AtomicUsize::new(usize::MAX);
        let (tx, rx) = mpsc_channel();

        fit_chunk(10, chunk, &params, &first_halt, &tx);
        drop(tx);

        let results: Vec<_> = rx.into_iter().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, 10);
        assert!(results[0].2.is_err());
        assert_eq!(first_halt.load(atomic::Ordering::Relaxed), 10);
    }

    #[test]
    fn chunk_skips_units_after_earlier_halt() {
        let first_halt = AtomicUsize::new(3);
        let (tx, rx) = mpsc_channel();

        fit_chunk(
            3,
            vec![
                (UnitKey::new("VISP", 4), gaussian_map(5.0, 6.0)),
                (UnitKey::new("VISP", 5), gaussian_map(9.0, 4.0)),
            ],
            &PipelineParams::default(),
            &first_halt,
            &tx,
        );
        drop(tx);

        assert_equal(rx.into_iter().map(|(unit_idx, _, _)| unit_idx), [3]);
    }

    #[test]
    fn collecting_chunk_fits_every_unit() {
        let first_halt = AtomicUsize::new(usize::MAX);
        let (tx, rx) = mpsc_channel();

        fit_chunk(0, three_unit_maps(), &PipelineParams::default(), &first_halt, &tx);
        drop(tx);

        assert_equal(rx.into_iter().map(|(unit_idx, _, _)| unit_idx), 0..3);
        assert_eq!(first_halt.load(atomic::Ordering::Relaxed), usize::MAX);
    }

    #[test]
    fn halt_reports_earliest_unit() {
        let maps: Vec<_> = (0..8)
            .map(|unit_id| {
                let map = if unit_id == 2 || unit_id == 6 {
                    malformed_map()
                } else {
                    gaussian_map(4.0 + unit_id as f64, 7.0)
                };
                (UnitKey::new("VISP", unit_id), map)
            })
            .collect();

        for num_threads in [1, 2, 3, 8] {
            let mut params = PipelineParams::default();
            params.batch_params.failure_policy = FailurePolicy::HaltOnFirstError;
            params.technical_params.num_threads = Some(num_threads);

            match fit_unit_maps(maps.clone(), &params) {
                Err(RfError::UnitFailed { key, .. }) => assert_eq!(key, UnitKey::new("VISP", 2)),
                other => panic!("unexpected result on {} threads: {:?}", num_threads, other),
            }
        }
    }

    #[test]
    fn invalid_params_rejected() {
        let mut params = PipelineParams::default();
        params.technical_params.num_threads = Some(0);

        let result = fit_unit_maps(three_unit_maps(), &params);
        assert!(matches!(result, Err(RfError::InvalidParams(_))));
    }

    #[test]
    fn empty_batch() {
        let report = fit_unit_maps(Vec::new(), &PipelineParams::default()).unwrap();

        assert!(report.rows.is_empty());
        assert!(report.failures.is_empty());
    }

    #[test]
    fn json_table() {
        let report = fit_unit_maps(
            vec![(
                UnitKey::new("VISP", 4).with_orientation(45.0),
                gaussian_map(6.0, 8.0),
            )],
            &PipelineParams::default(),
        )
        .unwrap();

        let mut buffer = Vec::new();
        report.write_json(&mut buffer).unwrap();
        let table: serde_json::Value = serde_json::from_slice(&buffer).unwrap();

        assert_eq!(table[0]["unit_id"], 4);
        assert_eq!(table[0]["brain_area"], "VISP");
        assert_eq!(table[0]["orientation"], 45.0);
        assert_eq!(table[0]["degenerate"], false);
        assert!(table[0]["rf_area"].as_f64().unwrap() > 0.0);
    }
}
