pub mod batch;
pub mod error;
pub mod gaussian_fit;
pub mod goodness_of_fit;
pub mod outline;
pub mod params;
pub mod receptive_field;
pub mod session;
pub mod smoothing;
pub mod spike_train;
pub mod synthetic;
pub mod types;

mod util;
