use ndarray::{Array2, Axis};

use crate::{error::RfResult, params::SmoothingParams, receptive_field::ReceptiveFieldMap};

pub fn gaussian_kernel(sigma: f64, truncate: f64) -> Vec<f64> {
    let radius = (truncate * sigma + 0.5) as i64;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|offset| (-0.5 * (offset * offset) as f64 / (sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();

    weights.into_iter().map(|weight| weight / total).collect()
}

// mirror boundaries: d c b a | a b c d | d c b a
pub fn gaussian_filter(values: &Array2<f64>, smoothing_params: &SmoothingParams) -> Array2<f64> {
    let kernel = gaussian_kernel(smoothing_params.sigma, smoothing_params.truncate);

    let smoothed_rows = convolve_axis(values, &kernel, Axis(1));
    convolve_axis(&smoothed_rows, &kernel, Axis(0))
}

fn convolve_axis(values: &Array2<f64>, kernel: &[f64], axis: Axis) -> Array2<f64> {
    let mut result = Array2::zeros(values.dim());
    let radius = (kernel.len() / 2) as i64;

    for (input_lane, mut output_lane) in values
        .lanes(axis)
        .into_iter()
        .zip(result.lanes_mut(axis))
    {
        let len = input_lane.len() as i64;

        for i in 0..len {
            output_lane[i as usize] = kernel
                .iter()
                .enumerate()
                .map(|(k, weight)| {
                    let src = reflect_idx(i + k as i64 - radius, len);
                    weight * input_lane[src]
                })
                .sum();
        }
    }

    result
}

fn reflect_idx(idx: i64, len: i64) -> usize {
    let period = 2 * len;
    let wrapped = idx.rem_euclid(period);

    if wrapped < len {
        wrapped as usize
    } else {
        (period - 1 - wrapped) as usize
    }
}

impl ReceptiveFieldMap {
    pub fn smoothed(&self, smoothing_params: &SmoothingParams) -> RfResult<ReceptiveFieldMap> {
        self.with_values(gaussian_filter(self.values(), smoothing_params))
    }
}
