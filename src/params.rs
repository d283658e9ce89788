use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use simple_error::SimpleError;

use crate::error::RfResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineParams {
    pub smoothing_params: Option<SmoothingParams>,
    pub fit_params: FitParams,
    pub outline_params: OutlineParams,
    pub batch_params: BatchParams,
    pub technical_params: TechnicalParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmoothingParams {
    pub sigma: f64,
    pub truncate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitParams {
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub max_iterations: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub r_squared_reference: RSquaredReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RSquaredReference {
    PredictedMean,
    ObservedMean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlineParams {
    pub scale: f64,
    pub num_points: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchParams {
    pub failure_policy: FailurePolicy,
    pub group_by_orientation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    HaltOnFirstError,
    CollectAndContinue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalParams {
    pub num_threads: Option<usize>,
    pub pin_threads: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionParams {
    pub brain_area: Option<String>,
    pub tmin: f64,
    pub tmax: f64,
    pub max_duration: Option<f64>,
    pub min_spikes: usize,
}

impl PipelineParams {
    pub fn from_yaml_str(yaml: &str) -> RfResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> RfResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> RfResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        let params = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_yaml_str(&content)?,
        };

        validate_pipeline_params(&params)?;
        Ok(params)
    }
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            smoothing_params: Some(SmoothingParams::default()),
            fit_params: FitParams::default(),
            outline_params: OutlineParams::default(),
            batch_params: BatchParams::default(),
            technical_params: TechnicalParams::default(),
        }
    }
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            truncate: 4.0,
        }
    }
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            sigma_min: 0.01,
            sigma_max: 80.0,
            max_iterations: 600,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            r_squared_reference: RSquaredReference::PredictedMean,
        }
    }
}

impl Default for OutlineParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            num_points: 100,
        }
    }
}

impl Default for BatchParams {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::CollectAndContinue,
            group_by_orientation: false,
        }
    }
}

impl Default for TechnicalParams {
    fn default() -> Self {
        Self {
            num_threads: None,
            pin_threads: false,
        }
    }
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            brain_area: None,
            tmin: -0.1,
            tmax: 0.5,
            max_duration: None,
            min_spikes: 0,
        }
    }
}

pub fn validate_pipeline_params(pipeline_params: &PipelineParams) -> Result<(), SimpleError> {
    if let Some(smoothing_params) = &pipeline_params.smoothing_params {
        validate_smoothing_params(smoothing_params)?;
    }

    validate_fit_params(&pipeline_params.fit_params)?;
    validate_outline_params(&pipeline_params.outline_params)?;
    validate_technical_params(&pipeline_params.technical_params)?;

    Ok(())
}

fn validate_smoothing_params(smoothing_params: &SmoothingParams) -> Result<(), SimpleError> {
    if smoothing_params.sigma <= 0.0 {
        return Err(SimpleError::new(
            "smoothing_params: sigma must be strictly positive",
        ));
    }

    if smoothing_params.truncate <= 0.0 {
        return Err(SimpleError::new(
            "smoothing_params: truncate must be strictly positive",
        ));
    }

    Ok(())
}

fn validate_fit_params(fit_params: &FitParams) -> Result<(), SimpleError> {
    if fit_params.sigma_min <= 0.0 {
        return Err(SimpleError::new("sigma_min must be strictly positive"));
    }

    if fit_params.sigma_max <= fit_params.sigma_min {
        return Err(SimpleError::new(
            "sigma_max must be greater than sigma_min",
        ));
    }

    if fit_params.max_iterations == 0 {
        return Err(SimpleError::new(
            "max_iterations must be strictly positive",
        ));
    }

    if fit_params.ftol < 0.0 || fit_params.xtol < 0.0 || fit_params.gtol < 0.0 {
        return Err(SimpleError::new("tolerances must not be negative"));
    }

    Ok(())
}

fn validate_outline_params(outline_params: &OutlineParams) -> Result<(), SimpleError> {
    if outline_params.scale <= 0.0 {
        return Err(SimpleError::new(
            "outline_params: scale must be strictly positive",
        ));
    }

    if outline_params.num_points < 3 {
        return Err(SimpleError::new(
            "outline_params: num_points must be at least 3",
        ));
    }

    Ok(())
}

fn validate_technical_params(technical_parms: &TechnicalParams) -> Result<(), SimpleError> {
    if let Some(num_threads) = technical_parms.num_threads {
        if num_threads == 0 {
            return Err(SimpleError::new("num_threads must be strictly positive"));
        }

        if technical_parms.pin_threads && num_cpus::get() < num_threads {
            return Err(SimpleError::new(
                "num_threads must not be greater than number of available CPUs when pinning threads",
            ));
        }
    }

    Ok(())
}

pub fn validate_selection_params(selection_params: &SelectionParams) -> Result<(), SimpleError> {
    if selection_params.tmin >= selection_params.tmax {
        return Err(SimpleError::new("tmin must be less than tmax"));
    }

    if let Some(max_duration) = selection_params.max_duration {
        if max_duration <= 0.0 {
            return Err(SimpleError::new("max_duration must be strictly positive"));
        }
    }

    Ok(())
}
