//! Vector math primitives consumed by the search pipeline.
//!
//! `Vector` is an immutable sequence of f64 with a fixed dimension. Two
//! vectors compare only when their dimensions match; all comparison methods
//! return `None` otherwise instead of panicking, so a bad candidate is a
//! per-item drop rather than a query failure.

use serde::{Deserialize, Serialize};

/// Immutable high-dimensional vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector {
    values: Vec<f64>,
}

impl Vector {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn peek(&self, i: usize) -> Option<f64> {
        self.values.get(i).copied()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Euclidean distance. `None` when dimensions differ.
    pub fn euclidean_distance(&self, other: &Vector) -> Option<f64> {
        if self.dim() != other.dim() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>();
        Some(sum.sqrt())
    }

    /// Cosine similarity. `None` when dimensions differ or either vector has
    /// zero norm.
    pub fn cosine_similarity(&self, other: &Vector) -> Option<f64> {
        if self.dim() != other.dim() {
            return None;
        }
        let na = self.norm();
        let nb = other.norm();
        if na == 0.0 || nb == 0.0 {
            return None;
        }
        let dot = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum::<f64>();
        Some(dot / (na * nb))
    }
}

impl From<Vec<f64>> for Vector {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}

/// Distance metric selection for a query.
///
/// For Euclidean distance, ascending order means "closer first". For cosine
/// similarity, ascending means "less similar first"; callers wanting
/// most-similar-first set ascending = false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Euclidean,
    Cosine,
}

impl Metric {
    /// Score a candidate against the query. `None` means "not comparable"
    /// and the candidate is dropped.
    pub fn eval(&self, query: &Vector, candidate: &Vector) -> Option<f64> {
        match self {
            Metric::Euclidean => query.euclidean_distance(candidate),
            Metric::Cosine => query.cosine_similarity(candidate),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Cosine => "cosine",
        }
    }
}
