use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::Descriptor;

/// An axis-aligned, closed n-dimensional box.
///
/// `min[d] <= max[d]` for every dimension `d`; a point is a rectangle with
/// `min == max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Rectangle {
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Self {
        debug_assert_eq!(min.len(), max.len(), "corner dimensions differ");
        debug_assert!(
            min.iter().zip(&max).all(|(lo, hi)| lo <= hi),
            "min corner must not exceed max corner"
        );
        Self { min, max }
    }

    /// Two-dimensional rectangle from its corner coordinates.
    pub fn new_2d(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self::new(vec![min_x, min_y], vec![max_x, max_y])
    }

    pub fn point(coords: Vec<f64>) -> Self {
        Self::new(coords.clone(), coords)
    }

    pub fn dimensions(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self) -> &[f64] {
        &self.min
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    pub fn center(&self, dim: usize) -> f64 {
        (self.min[dim] + self.max[dim]) / 2.0
    }

    pub fn area(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Sum of the edge lengths.
    pub fn margin(&self) -> f64 {
        self.min.iter().zip(&self.max).map(|(lo, hi)| hi - lo).sum()
    }

    /// Area increase needed to cover `other` as well.
    pub fn enlargement(&self, other: &Rectangle) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Euclidean distance from `point` to the nearest point of the box,
    /// zero when inside.
    pub fn min_distance(&self, point: &[f64]) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .zip(point)
            .map(|((lo, hi), p)| {
                let d = p - p.clamp(*lo, *hi);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        if !self.overlaps(other) {
            return None;
        }
        let min = self.min.iter().zip(&other.min).map(|(a, b)| a.max(*b)).collect();
        let max = self.max.iter().zip(&other.max).map(|(a, b)| a.min(*b)).collect();
        Some(Rectangle { min, max })
    }
}

impl Descriptor for Rectangle {
    fn overlaps(&self, other: &Self) -> bool {
        (0..self.dimensions())
            .all(|d| self.min[d] <= other.max[d] && other.min[d] <= self.max[d])
    }

    fn contains(&self, other: &Self) -> bool {
        (0..self.dimensions())
            .all(|d| self.min[d] <= other.min[d] && other.max[d] <= self.max[d])
    }

    fn union(&self, other: &Self) -> Self {
        let min = self.min.iter().zip(&other.min).map(|(a, b)| a.min(*b)).collect();
        let max = self.max.iter().zip(&other.max).map(|(a, b)| a.max(*b)).collect();
        Rectangle { min, max }
    }
}

impl Display for Rectangle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rectangle({:?} - {:?})", self.min, self.max)
    }
}
