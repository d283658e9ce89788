use ndarray::Array2;
use statrs::statistics::Statistics;

use crate::{
    error::{RfError, RfResult},
    params::RSquaredReference,
};

pub fn r_squared(
    observed: &Array2<f64>,
    predicted: &Array2<f64>,
    reference: RSquaredReference,
) -> RfResult<f64> {
    if observed.dim() != predicted.dim() {
        return Err(RfError::DataShape(format!(
            "observed map of shape {:?} does not match predicted map of shape {:?}",
            observed.dim(),
            predicted.dim()
        )));
    }

    if observed.is_empty() {
        return Err(RfError::DataShape(
            "cannot score an empty map".to_string(),
        ));
    }

    let mean = match reference {
        RSquaredReference::PredictedMean => predicted.iter().mean(),
        RSquaredReference::ObservedMean => observed.iter().mean(),
    };

    let ss_res: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(obs, pred)| (obs - pred).powi(2))
        .sum();
    let ss_tot: f64 = observed.iter().map(|obs| (obs - mean).powi(2)).sum();

    if ss_tot == 0.0 {
        return Ok(0.0);
    }

    Ok((1.0 - ss_res / ss_tot).max(0.0))
}
