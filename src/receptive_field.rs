use itertools::Itertools;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    error::{RfError, RfResult},
    session::{SpikeObservation, StimulusPresentation},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusGrid {
    x_positions: Vec<f64>,
    y_positions: Vec<f64>,
}

impl StimulusGrid {
    pub fn new(x_positions: &[f64], y_positions: &[f64]) -> RfResult<Self> {
        Ok(Self {
            x_positions: to_axis(x_positions.iter().copied(), "x")?,
            y_positions: to_axis(y_positions.iter().copied(), "y")?,
        })
    }

    pub fn from_observations(observations: &[SpikeObservation]) -> RfResult<Self> {
        Ok(Self {
            x_positions: to_axis(observations.iter().map(|obs| obs.x_position), "x")?,
            y_positions: to_axis(observations.iter().map(|obs| obs.y_position), "y")?,
        })
    }

    pub fn from_stimuli(stimuli: &[StimulusPresentation]) -> RfResult<Self> {
        Ok(Self {
            x_positions: to_axis(stimuli.iter().filter_map(|s| s.x_position), "x")?,
            y_positions: to_axis(stimuli.iter().filter_map(|s| s.y_position), "y")?,
        })
    }

    pub fn x_positions(&self) -> &[f64] {
        &self.x_positions
    }

    pub fn y_positions(&self) -> &[f64] {
        &self.y_positions
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.y_positions.len(), self.x_positions.len())
    }

    pub fn num_cells(&self) -> usize {
        self.x_positions.len() * self.y_positions.len()
    }

    pub fn x_idx(&self, x_position: f64) -> Option<usize> {
        find_position(&self.x_positions, x_position)
    }

    pub fn y_idx(&self, y_position: f64) -> Option<usize> {
        find_position(&self.y_positions, y_position)
    }

    pub fn x_range(&self) -> (f64, f64) {
        axis_range(&self.x_positions)
    }

    pub fn y_range(&self) -> (f64, f64) {
        axis_range(&self.y_positions)
    }
}

fn to_axis(positions: impl Iterator<Item = f64>, axis_name: &str) -> RfResult<Vec<f64>> {
    // adding zero folds -0.0 into 0.0
    let positions: Vec<f64> = positions
        .map(|position| position + 0.0)
        .sorted_by(|a, b| a.total_cmp(b))
        .dedup()
        .collect();

    if positions.is_empty() {
        return Err(RfError::DataShape(format!(
            "no {} positions to build a stimulus grid from",
            axis_name
        )));
    }

    if positions.iter().any(|position| !position.is_finite()) {
        return Err(RfError::DataShape(format!(
            "non-finite {} position in stimulus grid",
            axis_name
        )));
    }

    Ok(positions)
}

fn find_position(axis: &[f64], position: f64) -> Option<usize> {
    let position = position + 0.0;
    axis.binary_search_by(|value| value.total_cmp(&position)).ok()
}

fn axis_range(axis: &[f64]) -> (f64, f64) {
    (axis[0], axis[axis.len() - 1])
}

// indexed (y_idx, x_idx)
#[derive(Debug, Clone, PartialEq)]
pub struct ReceptiveFieldMap {
    grid: StimulusGrid,
    values: Array2<f64>,
}

impl ReceptiveFieldMap {
    pub fn from_values(grid: StimulusGrid, values: Array2<f64>) -> RfResult<Self> {
        if values.dim() != grid.shape() {
            return Err(RfError::DataShape(format!(
                "map of shape {:?} does not match stimulus grid of shape {:?}",
                values.dim(),
                grid.shape()
            )));
        }

        Ok(Self { grid, values })
    }

    pub fn count_spikes<'a>(
        grid: &StimulusGrid,
        observations: impl IntoIterator<Item = &'a SpikeObservation>,
    ) -> RfResult<Self> {
        let mut values = Array2::zeros(grid.shape());

        for obs in observations {
            let (Some(y_idx), Some(x_idx)) = (grid.y_idx(obs.y_position), grid.x_idx(obs.x_position))
            else {
                return Err(RfError::DataShape(format!(
                    "spike of unit {} at position ({}, {}) lies outside the stimulus grid",
                    obs.unit_id, obs.x_position, obs.y_position
                )));
            };

            values[[y_idx, x_idx]] += 1.0;
        }

        Ok(Self {
            grid: grid.clone(),
            values,
        })
    }

    pub fn grid(&self) -> &StimulusGrid {
        &self.grid
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn total(&self) -> f64 {
        self.values.sum()
    }

    pub fn with_values(&self, values: Array2<f64>) -> RfResult<Self> {
        Self::from_values(self.grid.clone(), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::assert_equal;
    use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, SeedableRng};

    fn observation(unit_id: u64, x_position: f64, y_position: f64) -> SpikeObservation {
        SpikeObservation {
            unit_id,
            brain_area: "VISP".to_string(),
            x_position,
            y_position,
            orientation: None,
        }
    }

    #[test]
    fn grid_axes_sorted_and_unique() {
        let observations = [
            observation(1, 10.0, -10.0),
            observation(1, -40.0, 30.0),
            observation(2, 10.0, 0.0),
            observation(2, 0.0, 30.0),
        ];

        let grid = StimulusGrid::from_observations(&observations).unwrap();

        assert_equal(grid.x_positions().iter().copied(), [-40.0, 0.0, 10.0]);
        assert_equal(grid.y_positions().iter().copied(), [-10.0, 0.0, 30.0]);
        assert_eq!(grid.shape(), (3, 3));
        assert_eq!(grid.x_idx(10.0), Some(2));
        assert_eq!(grid.y_idx(5.0), None);
        assert_eq!(grid.x_range(), (-40.0, 10.0));
    }

    #[test]
    fn empty_grid() {
        let result = StimulusGrid::from_observations(&[]);
        assert!(matches!(result, Err(RfError::DataShape(_))));
    }

    #[test]
    fn counts_with_shared_vocabulary() {
        let observations = [
            observation(1, 0.0, 0.0),
            observation(1, 0.0, 0.0),
            observation(1, 20.0, 10.0),
            observation(2, 10.0, 20.0),
        ];

        let grid = StimulusGrid::from_observations(&observations).unwrap();
        let unit_1 = observations.iter().filter(|obs| obs.unit_id == 1);
        let map = ReceptiveFieldMap::count_spikes(&grid, unit_1).unwrap();

        assert_eq!(map.shape(), (3, 3));
        assert_eq!(map.values()[[0, 0]], 2.0);
        assert_eq!(map.values()[[1, 2]], 1.0);
        assert_eq!(map.values()[[2, 1]], 0.0);
        assert_eq!(map.total(), 3.0);
    }

    #[test]
    fn count_sum_matches_rows() {
        let mut rng = StdRng::seed_from_u64(0);
        let position_dist = Uniform::new(0, 9);

        let grid_values: Vec<f64> = (0..9).map(|i| -40.0 + 10.0 * i as f64).collect();
        let grid = StimulusGrid::new(&grid_values, &grid_values).unwrap();

        let observations: Vec<_> = (0..5000)
            .map(|_| {
                observation(
                    7,
                    grid_values[position_dist.sample(&mut rng)],
                    grid_values[position_dist.sample(&mut rng)],
                )
            })
            .collect();

        let map = ReceptiveFieldMap::count_spikes(&grid, &observations).unwrap();

        assert_eq!(map.shape(), (9, 9));
        assert_eq!(map.total(), 5000.0);
        assert!(map
            .values()
            .iter()
            .all(|count| *count >= 0.0 && count.fract() == 0.0));

        let recount = ReceptiveFieldMap::count_spikes(&grid, &observations).unwrap();
        assert_eq!(map, recount);
    }

    #[test]
    fn position_outside_grid() {
        let grid = StimulusGrid::new(&[0.0, 10.0], &[0.0, 10.0]).unwrap();
        let observations = [observation(3, 5.0, 0.0)];

        let result = ReceptiveFieldMap::count_spikes(&grid, &observations);
        assert!(matches!(result, Err(RfError::DataShape(_))));
    }

    #[test]
    fn shape_mismatch() {
        let grid = StimulusGrid::new(&[0.0, 10.0, 20.0], &[0.0, 10.0]).unwrap();

        assert!(ReceptiveFieldMap::from_values(grid.clone(), Array2::zeros((2, 3))).is_ok());

        let result = ReceptiveFieldMap::from_values(grid, Array2::zeros((3, 2)));
        assert!(matches!(result, Err(RfError::DataShape(_))));
    }
}
