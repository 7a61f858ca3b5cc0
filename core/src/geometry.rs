//! Projective model of crop rows in the camera image.
//!
//! A [`RowState`] describes the rows by the pixel location of one particular
//! plant, the spacing of plants and rows at the bottom of the image, the skew of
//! the particular row and the convergence ratio of the rows toward the top of
//! the image. This module turns such a state into the set of pixels where plants
//! are expected to appear.
//!
//! ## Construction
//!
//! Image coordinates have `x` growing to the right and `y` growing downward,
//! with the image covering `[0, width) x [0, height)`.
//!
//! 1. The *bottom plants* lie on the image row `y = position`, spaced by the
//!    inter-row distance to the left and right of the particular plant for as
//!    long as they stay inside the image.
//! 2. Every row crosses the top edge `y = 0`. The particular row crosses at
//!    $x = offset + \tan(skew) \cdot position$, and neighbouring rows cross at
//!    multiples of $convergence \cdot inter\\_row$ from it.
//! 3. Two (bottom, top) pairs define two row lines whose intersection is the
//!    *vanishing point*. Intersections are computed in homogeneous coordinates,
//!    $v = (p_1 \times q_1) \times (p_2 \times q_2)$, so vertical rows need no
//!    special case; parallel rows are reported as [`GeometryError::ParallelRows`].
//! 4. Each row is walked from its bottom plant toward the vanishing point. Under
//!    perspective, the inter-plant distance shrinks linearly with the distance
//!    to the horizon:
//!
//! $$
//! ip(y) = ip_{bottom} \cdot \frac{v_y - y}{v_y - height}
//! $$
//!
//! which is exactly `ip_bottom` on the bottom image edge and reaches zero at the
//! vanishing point. With the vanishing point above the image (`v_y < 0`) the
//! spacing at the top edge is `ip_bottom * v_y / (v_y - height)`, which is less
//! than `ip_bottom`, as expected for rows receding from the camera.

use log::debug;
use nalgebra::{Point2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::GeometryError;
use crate::state::RowState;

/// Relative threshold on `sin(angle)` between two row lines below which the
/// rows are treated as parallel.
const PARALLEL_TOLERANCE: f64 = 1e-12;

/// Rectangular image extent `[0, width) x [0, height)` in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageBounds {
    pub width: f64,
    pub height: f64,
}

impl ImageBounds {
    pub fn new(width: f64, height: f64) -> Self {
        ImageBounds { width, height }
    }
    /// Whether a point lies inside the image.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        !(x < 0.0 || x >= self.width || y < 0.0 || y >= self.height)
    }
}

/// Plants on the bottom row, ordered left to right.
#[derive(Clone, Debug, PartialEq)]
pub struct BottomPlants {
    pub points: Vec<Point2<f64>>,
    pub n_left: usize,
    pub n_right: usize,
}

impl BottomPlants {
    /// The particular plant, sitting between the left and right neighbours.
    pub fn particular(&self) -> Point2<f64> {
        self.points[self.n_left]
    }
}

/// Projection of a row state into expected plant pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RowGeometryModel {
    pub bounds: ImageBounds,
    /// Row walking stops once the projected spacing drops below this value.
    pub min_inter_plant_pixels: f64,
}

impl RowGeometryModel {
    pub fn new(bounds: ImageBounds, min_inter_plant_pixels: f64) -> Self {
        RowGeometryModel {
            bounds,
            min_inter_plant_pixels,
        }
    }

    /// Particular plant plus its in-image horizontal neighbours.
    pub fn bottom_plants(
        &self,
        offset: f64,
        position: f64,
        inter_row: f64,
    ) -> Result<BottomPlants, GeometryError> {
        if !(inter_row > 0.0 && inter_row.is_finite()) {
            return Err(GeometryError::InvalidSpacing(inter_row));
        }

        let mut left = Vec::new();
        let mut x = offset - inter_row;
        while self.bounds.contains(x, position) {
            left.push(Point2::new(x, position));
            x -= inter_row;
        }

        let mut right = Vec::new();
        let mut x = offset + inter_row;
        while self.bounds.contains(x, position) {
            right.push(Point2::new(x, position));
            x += inter_row;
        }

        let n_left = left.len();
        let n_right = right.len();
        let mut points = Vec::with_capacity(n_left + n_right + 1);
        points.extend(left.into_iter().rev());
        points.push(Point2::new(offset, position));
        points.extend(right);
        Ok(BottomPlants {
            points,
            n_left,
            n_right,
        })
    }

    /// Point where the particular row meets the top image edge. It need not lie
    /// inside the image.
    pub fn top_crossing_point(&self, offset: f64, position: f64, skew: f64) -> Point2<f64> {
        Point2::new(offset + skew.tan() * position, 0.0)
    }

    /// Top crossing points of every row, in the same left-to-right order as
    /// [`Self::bottom_plants`].
    pub fn all_top_crossing_points(
        &self,
        top_point: Point2<f64>,
        inter_row: f64,
        convergence: f64,
        n_left: usize,
        n_right: usize,
    ) -> Vec<Point2<f64>> {
        let inter_row_at_top = convergence * inter_row;
        let first = -(n_left as f64);
        (0..n_left + n_right + 1)
            .map(|i| Point2::new(top_point.x + (first + i as f64) * inter_row_at_top, top_point.y))
            .collect()
    }

    /// Intersection of the row through `bottom_a`/`top_a` with the row through
    /// `bottom_b`/`top_b`.
    pub fn vanishing_point(
        &self,
        bottom_a: Point2<f64>,
        top_a: Point2<f64>,
        bottom_b: Point2<f64>,
        top_b: Point2<f64>,
    ) -> Result<Point2<f64>, GeometryError> {
        let line_a = homogeneous(bottom_a).cross(&homogeneous(top_a));
        let line_b = homogeneous(bottom_b).cross(&homogeneous(top_b));
        let normal_a = line_a.xy().norm();
        let normal_b = line_b.xy().norm();
        if normal_a == 0.0 || normal_b == 0.0 {
            // Coincident points do not define a line.
            return Err(GeometryError::ParallelRows);
        }
        let intersection = line_a.cross(&line_b);
        if intersection.z.abs() <= PARALLEL_TOLERANCE * normal_a * normal_b {
            return Err(GeometryError::ParallelRows);
        }
        let point = Point2::new(intersection.x / intersection.z, intersection.y / intersection.z);
        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(GeometryError::ParallelRows);
        }
        Ok(point)
    }

    /// Perspective inter-plant spacing at image row `y`.
    pub fn inter_plant_at(&self, y: f64, vanishing_point: Point2<f64>, inter_plant_at_bottom: f64) -> f64 {
        inter_plant_at_bottom * (vanishing_point.y - y) / (vanishing_point.y - self.bounds.height)
    }

    /// Plants of one row above its bottom plant, walked toward the vanishing
    /// point. The bottom plant itself is not included.
    pub fn row_plants(
        &self,
        bottom_plant: Point2<f64>,
        vanishing_point: Point2<f64>,
        inter_plant_at_bottom: f64,
    ) -> Result<Vec<Point2<f64>>, GeometryError> {
        if vanishing_point.y == self.bounds.height {
            return Err(GeometryError::HorizonAtImageBottom);
        }
        if !(inter_plant_at_bottom > 0.0 && inter_plant_at_bottom.is_finite()) {
            return Err(GeometryError::InvalidSpacing(inter_plant_at_bottom));
        }

        let mut plants = Vec::new();
        let mut current = bottom_plant;
        let mut inter_plant = self.inter_plant_at(current.y, vanishing_point, inter_plant_at_bottom);
        let mut t = step_ratio(current, vanishing_point, inter_plant);
        let mut entered = false;
        while (0.0..=1.0).contains(&t) && inter_plant >= self.min_inter_plant_pixels {
            current = Point2::from(current.coords.lerp(&vanishing_point.coords, t));
            if self.bounds.contains(current.x, current.y) {
                plants.push(current);
                entered = true;
            } else if entered || self.past_image(current, vanishing_point) {
                // A straight walk cannot re-enter the image once it has left it.
                break;
            }
            inter_plant = self.inter_plant_at(current.y, vanishing_point, inter_plant_at_bottom);
            t = step_ratio(current, vanishing_point, inter_plant);
        }
        Ok(plants)
    }

    /// Every expected plant for a row state: the bottom plants followed by the
    /// walked plants of each row, left to right.
    pub fn all_plants(&self, state: &RowState) -> Result<Vec<Point2<f64>>, GeometryError> {
        if !self.bounds.contains(state.offset, state.position) {
            debug!(
                "Particular plant ({:.1}, {:.1}) lies outside the image",
                state.offset, state.position
            );
        }
        let bottom = self.bottom_plants(state.offset, state.position, state.inter_row)?;
        let top_point = self.top_crossing_point(state.offset, state.position, state.skew);
        let top = self.all_top_crossing_points(
            top_point,
            state.inter_row,
            state.convergence,
            bottom.n_left,
            bottom.n_right,
        );
        if bottom.points.len() < 2 {
            return Err(GeometryError::NotEnoughRows {
                found: bottom.points.len(),
            });
        }
        if bottom.points.len() != top.len() {
            return Err(GeometryError::PointCountMismatch {
                bottom: bottom.points.len(),
                top: top.len(),
            });
        }

        let vanishing_point = self.first_vanishing_point(&bottom.points, &top)?;
        let mut plants = bottom.points.clone();
        for bottom_plant in &bottom.points {
            plants.extend(self.row_plants(*bottom_plant, vanishing_point, state.inter_plant)?);
        }
        Ok(plants)
    }

    /// Whether `point` has crossed the top or bottom image edge while moving
    /// toward `vanishing_point`.
    fn past_image(&self, point: Point2<f64>, vanishing_point: Point2<f64>) -> bool {
        (vanishing_point.y <= point.y && point.y < 0.0)
            || (vanishing_point.y >= point.y && point.y >= self.bounds.height)
    }

    /// Vanishing point from the first pair of adjacent rows that intersect.
    fn first_vanishing_point(
        &self,
        bottom: &[Point2<f64>],
        top: &[Point2<f64>],
    ) -> Result<Point2<f64>, GeometryError> {
        let mut last_error = GeometryError::ParallelRows;
        for i in 0..bottom.len() - 1 {
            match self.vanishing_point(bottom[i], top[i], bottom[i + 1], top[i + 1]) {
                Ok(point) => return Ok(point),
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }
}

fn homogeneous(point: Point2<f64>) -> Vector3<f64> {
    Vector3::new(point.x, point.y, 1.0)
}

/// Fraction of the remaining distance to the vanishing point covered by one
/// plant step. Returns NaN when already at the vanishing point, which stops
/// the walk.
fn step_ratio(current: Point2<f64>, vanishing_point: Point2<f64>, inter_plant: f64) -> f64 {
    let distance = nalgebra::distance(&current, &vanishing_point);
    if distance == 0.0 {
        return f64::NAN;
    }
    inter_plant / distance
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn model() -> RowGeometryModel {
        RowGeometryModel::new(ImageBounds::new(500.0, 700.0), 4.0)
    }

    #[test]
    fn bounds_are_half_open() {
        let bounds = ImageBounds::new(500.0, 700.0);
        assert!(bounds.contains(0.0, 0.0));
        assert!(bounds.contains(499.9, 699.9));
        assert!(!bounds.contains(500.0, 10.0));
        assert!(!bounds.contains(10.0, 700.0));
        assert!(!bounds.contains(-0.1, 10.0));
    }

    #[test]
    fn bottom_plants_step_by_inter_row() {
        let bottom = model().bottom_plants(250.0, 660.0, 110.0).unwrap();
        let xs: Vec<f64> = bottom.points.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![30.0, 140.0, 250.0, 360.0, 470.0]);
        assert!(bottom.points.iter().all(|p| p.y == 660.0));
        assert_eq!(bottom.n_left, 2);
        assert_eq!(bottom.n_right, 2);
        assert_eq!(bottom.particular(), Point2::new(250.0, 660.0));
    }

    #[test]
    fn bottom_plants_keep_particular_plant_outside_image() {
        let bottom = model().bottom_plants(-50.0, 100.0, 110.0).unwrap();
        assert_eq!(bottom.n_left, 0);
        assert_eq!(bottom.points[0], Point2::new(-50.0, 100.0));
        // 60, 170, 280, 390; 500 falls on the open right edge.
        assert_eq!(bottom.n_right, 4);
    }

    #[test]
    fn bottom_plants_reject_zero_spacing() {
        assert_eq!(
            model().bottom_plants(250.0, 660.0, 0.0),
            Err(GeometryError::InvalidSpacing(0.0))
        );
    }

    #[test]
    fn top_crossing_point_follows_skew() {
        let m = model();
        let straight = m.top_crossing_point(250.0, 600.0, 0.0);
        assert_eq!(straight, Point2::new(250.0, 0.0));
        let skewed = m.top_crossing_point(250.0, 600.0, std::f64::consts::FRAC_PI_4);
        assert_approx_eq!(skewed.x, 850.0, 1e-9);
        assert_eq!(skewed.y, 0.0);
    }

    #[test]
    fn top_crossing_points_use_converged_spacing() {
        let top = model().all_top_crossing_points(Point2::new(250.0, 0.0), 110.0, 0.5, 2, 1);
        let xs: Vec<f64> = top.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![140.0, 195.0, 250.0, 305.0]);
        assert!(top.iter().all(|p| p.y == 0.0));
    }

    #[test]
    fn vanishing_point_of_converging_rows() {
        let vp = model()
            .vanishing_point(
                Point2::new(100.0, 700.0),
                Point2::new(150.0, 0.0),
                Point2::new(200.0, 700.0),
                Point2::new(300.0, 0.0),
            )
            .unwrap();
        // y = -14x + 2100 and y = -7x + 2100
        assert_approx_eq!(vp.x, 0.0, 1e-6);
        assert_approx_eq!(vp.y, 2100.0, 1e-6);
    }

    #[test]
    fn vanishing_point_handles_vertical_row() {
        let vp = model()
            .vanishing_point(
                Point2::new(250.0, 700.0),
                Point2::new(250.0, 0.0),
                Point2::new(360.0, 700.0),
                Point2::new(305.0, 0.0),
            )
            .unwrap();
        assert_approx_eq!(vp.x, 250.0, 1e-9);
        assert_approx_eq!(vp.y, -700.0, 1e-9);
    }

    #[test]
    fn parallel_rows_have_no_vanishing_point() {
        let result = model().vanishing_point(
            Point2::new(100.0, 700.0),
            Point2::new(150.0, 0.0),
            Point2::new(200.0, 700.0),
            Point2::new(250.0, 0.0),
        );
        assert_eq!(result, Err(GeometryError::ParallelRows));
    }

    #[test]
    fn inter_plant_shrinks_toward_horizon() {
        let m = model();
        let vp = Point2::new(250.0, -500.0);
        assert_approx_eq!(m.inter_plant_at(700.0, vp, 80.0), 80.0, 1e-12);
        assert_approx_eq!(m.inter_plant_at(0.0, vp, 80.0), 80.0 * 500.0 / 1200.0, 1e-12);
        assert_approx_eq!(m.inter_plant_at(-500.0, vp, 80.0), 0.0, 1e-12);
        assert!(m.inter_plant_at(300.0, vp, 80.0) < m.inter_plant_at(600.0, vp, 80.0));
    }

    #[test]
    fn row_plants_walk_up_a_vertical_row() {
        let m = model();
        let vp = Point2::new(250.0, -500.0);
        let plants = m.row_plants(Point2::new(250.0, 700.0), vp, 120.0).unwrap();
        assert!(!plants.is_empty());
        // First step covers exactly one bottom spacing.
        assert_approx_eq!(plants[0].y, 580.0, 1e-9);
        assert!(plants.iter().all(|p| (p.x - 250.0).abs() < 1e-9));
        // Spacing strictly decreases with height.
        let gaps: Vec<f64> = std::iter::once(700.0)
            .chain(plants.iter().map(|p| p.y))
            .collect::<Vec<_>>()
            .windows(2)
            .map(|w| w[0] - w[1])
            .collect();
        assert!(gaps.windows(2).all(|w| w[1] < w[0]));
        assert!(plants.iter().all(|p| m.bounds.contains(p.x, p.y)));
    }

    #[test]
    fn row_plants_stop_at_min_spacing() {
        let m = RowGeometryModel::new(ImageBounds::new(500.0, 700.0), 50.0);
        let vp = Point2::new(250.0, -500.0);
        let plants = m.row_plants(Point2::new(250.0, 700.0), vp, 60.0).unwrap();
        // Spacing 60, 57, 54.15, 51.44 is walked; 48.87 is below the limit.
        assert_eq!(plants.len(), 4);
        let last = plants.last().unwrap();
        assert!(m.inter_plant_at(last.y, vp, 60.0) < 50.0);
    }

    #[test]
    fn row_plants_reject_horizon_on_bottom_edge() {
        let m = model();
        let result = m.row_plants(Point2::new(250.0, 650.0), Point2::new(100.0, 700.0), 80.0);
        assert_eq!(result, Err(GeometryError::HorizonAtImageBottom));
    }

    #[test]
    fn all_plants_contains_bottom_row_and_rows_above() {
        let m = model();
        let state = RowState::new(250.0, 660.0, 80.0, 110.0, 0.0, 0.5);
        let plants = m.all_plants(&state).unwrap();
        assert!(plants.len() > 5);
        let xs: Vec<f64> = plants[..5].iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![30.0, 140.0, 250.0, 360.0, 470.0]);
        // Particular row stays vertical without skew.
        assert!(plants[5..].iter().any(|p| (p.x - 250.0).abs() < 1e-9 && p.y < 660.0));
        assert!(plants[5..].iter().all(|p| m.bounds.contains(p.x, p.y)));
    }

    #[test]
    fn all_plants_needs_two_rows() {
        let m = model();
        let state = RowState::new(250.0, 660.0, 80.0, 600.0, 0.0, 0.5);
        assert_eq!(
            m.all_plants(&state),
            Err(GeometryError::NotEnoughRows { found: 1 })
        );
    }

    #[test]
    fn all_plants_reports_parallel_rows() {
        let m = model();
        let state = RowState::new(250.0, 660.0, 80.0, 110.0, 0.0, 1.0);
        assert_eq!(m.all_plants(&state), Err(GeometryError::ParallelRows));
    }
}
