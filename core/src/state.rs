//! State vectors tracked by the particle filters.
//!
//! The full row-geometry state has six independent fields describing where the
//! tracked ("particular") plant sits in the image and how the crop rows are laid
//! out around it. A one-dimensional variant tracks only the forward position of
//! the particular plant and is used with scalar position measurements.
//!
//! Both are plain `Copy` value types. Particles own their state outright, so
//! propagation and resampling always work on copies.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// Index of the lateral offset (pixels) in a [`RowState`] vector.
pub const OFFSET: usize = 0;
/// Index of the forward position (pixels) in a [`RowState`] vector.
pub const POSITION: usize = 1;
/// Index of the inter-plant spacing at the image bottom (pixels).
pub const INTER_PLANT: usize = 2;
/// Index of the inter-row spacing at the image bottom (pixels).
pub const INTER_ROW: usize = 3;
/// Index of the row skew angle (radians).
pub const SKEW: usize = 4;
/// Index of the top-to-bottom inter-row ratio.
pub const CONVERGENCE: usize = 5;

/// Common interface for states the generic filter can carry.
///
/// The filter core only needs to move between the typed state and a flat
/// vector (for averaging, bounds enforcement and covariance), plus the
/// forward position used by scalar measurements.
pub trait FilterState: Copy + Debug + PartialEq + Send + Sync {
    /// Number of scalar components.
    const DIM: usize;
    /// Human readable component names, in vector order.
    const LABELS: &'static [&'static str];

    fn to_vector(&self) -> DVector<f64>;
    /// Build a state from a vector of length [`Self::DIM`].
    fn from_vector(vector: &DVector<f64>) -> Self;
    /// Forward position of the particular plant.
    fn position(&self) -> f64;
}

/// Six-parameter crop row geometry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RowState {
    /// Horizontal pixel coordinate of the particular plant on its image row.
    pub offset: f64,
    /// Vertical pixel coordinate of the particular plant.
    pub position: f64,
    /// Distance between consecutive plants of a row, measured at the image bottom.
    pub inter_plant: f64,
    /// Distance between neighbouring rows, measured at the image bottom.
    pub inter_row: f64,
    /// Angle of the particular row relative to the image vertical (radians).
    pub skew: f64,
    /// Ratio of inter-row spacing at the image top to the spacing at the bottom.
    pub convergence: f64,
}

impl RowState {
    pub fn new(
        offset: f64,
        position: f64,
        inter_plant: f64,
        inter_row: f64,
        skew: f64,
        convergence: f64,
    ) -> Self {
        RowState {
            offset,
            position,
            inter_plant,
            inter_row,
            skew,
            convergence,
        }
    }
}

impl Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RowState(offset: {:.2}, position: {:.2}, inter_plant: {:.2}, inter_row: {:.2}, skew: {:.4}, convergence: {:.4})",
            self.offset,
            self.position,
            self.inter_plant,
            self.inter_row,
            self.skew,
            self.convergence
        )
    }
}

impl FilterState for RowState {
    const DIM: usize = 6;
    const LABELS: &'static [&'static str] = &[
        "offset",
        "position",
        "inter_plant",
        "inter_row",
        "skew",
        "convergence",
    ];

    fn to_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![
            self.offset,
            self.position,
            self.inter_plant,
            self.inter_row,
            self.skew,
            self.convergence,
        ])
    }
    fn from_vector(vector: &DVector<f64>) -> Self {
        assert_eq!(vector.len(), Self::DIM, "RowState requires a 6-element vector");
        RowState {
            offset: vector[OFFSET],
            position: vector[POSITION],
            inter_plant: vector[INTER_PLANT],
            inter_row: vector[INTER_ROW],
            skew: vector[SKEW],
            convergence: vector[CONVERGENCE],
        }
    }
    fn position(&self) -> f64 {
        self.position
    }
}

/// Position-only state for the scalar measurement variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub position: f64,
}

impl PositionState {
    pub fn new(position: f64) -> Self {
        PositionState { position }
    }
}

impl Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PositionState(position: {:.2})", self.position)
    }
}

impl FilterState for PositionState {
    const DIM: usize = 1;
    const LABELS: &'static [&'static str] = &["position"];

    fn to_vector(&self) -> DVector<f64> {
        DVector::from_element(1, self.position)
    }
    fn from_vector(vector: &DVector<f64>) -> Self {
        assert_eq!(vector.len(), Self::DIM, "PositionState requires a 1-element vector");
        PositionState {
            position: vector[0],
        }
    }
    fn position(&self) -> f64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_state_vector_order_matches_indices() {
        let state = RowState::new(250.0, 660.0, 80.0, 110.0, 0.1, 0.4);
        let vector = state.to_vector();
        assert_eq!(vector.len(), RowState::DIM);
        assert_eq!(vector[OFFSET], 250.0);
        assert_eq!(vector[POSITION], 660.0);
        assert_eq!(vector[INTER_PLANT], 80.0);
        assert_eq!(vector[INTER_ROW], 110.0);
        assert_eq!(vector[SKEW], 0.1);
        assert_eq!(vector[CONVERGENCE], 0.4);
        assert_eq!(RowState::from_vector(&vector), state);
        assert_eq!(RowState::LABELS.len(), RowState::DIM);
    }

    #[test]
    fn position_state_exposes_position() {
        let state = PositionState::new(42.0);
        assert_eq!(state.position(), 42.0);
        assert_eq!(PositionState::from_vector(&state.to_vector()), state);
    }

    #[test]
    #[should_panic(expected = "RowState requires a 6-element vector")]
    fn row_state_rejects_short_vector() {
        let _ = RowState::from_vector(&DVector::from_vec(vec![1.0, 2.0]));
    }
}
