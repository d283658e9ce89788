use std::f64::consts::PI;

use serde::Serialize;

use crate::{
    error::{RfError, RfResult},
    gaussian_fit::GaussianParams,
    params::OutlineParams,
    util::linspace,
};

// first and last point coincide
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outline {
    points: Vec<(f64, f64)>,
}

impl Outline {
    pub fn from_params(params: &GaussianParams, scale: f64, num_points: usize) -> RfResult<Self> {
        if num_points < 3 {
            return Err(RfError::DataShape(format!(
                "an outline needs at least 3 points, got {}",
                num_points
            )));
        }

        let half_width = scale * params.sigma_x_magnitude();
        let half_height = scale * params.sigma_y_magnitude();

        let points = linspace(0.0, 2.0 * PI, num_points)
            .into_iter()
            .map(|theta| {
                (
                    params.center_x + half_width * theta.cos(),
                    params.center_y + half_height * theta.sin(),
                )
            })
            .collect();

        Ok(Self { points })
    }

    pub fn from_outline_params(
        params: &GaussianParams,
        outline_params: &OutlineParams,
    ) -> RfResult<Self> {
        Self::from_params(params, outline_params.scale, outline_params.num_points)
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.points[..self.points.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn centroid(&self) -> (f64, f64) {
        let vertices = self.vertices();
        let count = vertices.len() as f64;
        let (sum_x, sum_y) = vertices
            .iter()
            .fold((0.0, 0.0), |(sum_x, sum_y), (x, y)| (sum_x + x, sum_y + y));

        (sum_x / count, sum_y / count)
    }

    pub fn bounding_box(&self) -> ((f64, f64), (f64, f64)) {
        self.points.iter().fold(
            (
                (f64::INFINITY, f64::INFINITY),
                (f64::NEG_INFINITY, f64::NEG_INFINITY),
            ),
            |((x_min, y_min), (x_max, y_max)), (x, y)| {
                ((x_min.min(*x), y_min.min(*y)), (x_max.max(*x), y_max.max(*y)))
            },
        )
    }

    pub fn area(&self) -> f64 {
        let twice_area: f64 = self
            .points
            .iter()
            .zip(self.points.iter().skip(1))
            .map(|((x0, y0), (x1, y1))| x0 * y1 - x1 * y0)
            .sum();

        0.5 * twice_area.abs()
    }
}
