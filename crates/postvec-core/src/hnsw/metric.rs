use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::simd::{dot_product, l2_distance_squared, l2_normalize};

/// Similarity space the graph is built in.
///
/// Distances are always "smaller is closer". `Cosine` stores and queries
/// unit-length copies of the vectors so it can reuse the inner product kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    #[serde(rename = "ip")]
    InnerProduct,
    L2,
}

impl Metric {
    /// Distance between two prepared vectors.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine | Metric::InnerProduct => 1.0 - dot_product(a, b),
            Metric::L2 => l2_distance_squared(a, b),
        }
    }

    /// Convert a distance back to a "higher is better" similarity score.
    ///
    /// Not clamped: approximate search and float error can push cosine scores
    /// slightly outside `[-1, 1]`.
    #[inline]
    pub fn similarity(self, distance: f32) -> f32 {
        match self {
            Metric::Cosine | Metric::InnerProduct => 1.0 - distance,
            Metric::L2 => -distance,
        }
    }

    /// Bring a raw vector into the form stored in the graph.
    pub fn prepare(self, vector: &[f32]) -> Vec<f32> {
        let mut out = vector.to_vec();
        if self == Metric::Cosine {
            l2_normalize(&mut out);
        }
        out
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Metric::Cosine => 0,
            Metric::InnerProduct => 1,
            Metric::L2 => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Metric::Cosine),
            1 => Some(Metric::InnerProduct),
            2 => Some(Metric::L2),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::InnerProduct => "ip",
            Metric::L2 => "l2",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "ip" | "inner_product" | "dot" => Ok(Metric::InnerProduct),
            "l2" | "euclidean" => Ok(Metric::L2),
            other => Err(format!("unknown metric '{other}' (expected cosine, ip or l2)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_ignores_magnitude() {
        let a = Metric::Cosine.prepare(&[2.0, 0.0]);
        let b = Metric::Cosine.prepare(&[10.0, 0.0]);
        assert!(Metric::Cosine.distance(&a, &b).abs() < 1e-6);
        assert!((Metric::Cosine.similarity(0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_similarity_orders_like_distance() {
        let near = Metric::L2.similarity(Metric::L2.distance(&[0.0, 0.0], &[0.1, 0.0]));
        let far = Metric::L2.similarity(Metric::L2.distance(&[0.0, 0.0], &[3.0, 0.0]));
        assert!(near > far);
    }

    #[test]
    fn parse_and_code_roundtrip() {
        for metric in [Metric::Cosine, Metric::InnerProduct, Metric::L2] {
            assert_eq!(metric.as_str().parse::<Metric>().unwrap(), metric);
            assert_eq!(Metric::from_code(metric.code()), Some(metric));
        }
        assert!("hamming".parse::<Metric>().is_err());
        assert_eq!(Metric::from_code(9), None);
    }
}
