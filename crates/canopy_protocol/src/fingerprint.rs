//! Request fingerprints used as the deduplication key.
//!
//! A fingerprint is a blake3 digest over the plugin id, the plugin version,
//! the canonical parameter JSON and the canonical AOI geometry. Geometry is
//! canonicalized as follows:
//!
//! - coordinates are quantized to [`COORDINATE_TOLERANCE`] degrees
//! - repeated consecutive vertices and the closing vertex are dropped
//! - exterior rings are counter-clockwise, holes clockwise
//! - each ring starts at its smallest vertex
//! - holes, then polygons, are sorted
//!
//! Two requests whose coordinates round to the same grid cell everywhere are
//! therefore the same request; anything else is a different one.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::aoi::{Geometry, Position, Ring};
use crate::canonical::to_canonical_json;
use crate::defaults::COORDINATE_TOLERANCE;

const SEP: u8 = 0x1f;

/// Malformed request input. Rejected before any computation row exists.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("plugin id must not be empty")]
    EmptyPluginId,

    #[error("parameters must be a JSON object")]
    ParamsNotObject,

    #[error("AOI geometry contains no polygons")]
    EmptyGeometry,

    #[error("AOI coordinate is not a finite number")]
    NonFiniteCoordinate,

    #[error("AOI coordinate ({lon}, {lat}) is outside the WGS84 range")]
    CoordinateOutOfRange { lon: f64, lat: f64 },

    #[error("AOI polygon {polygon} ring {ring} must have at least 3 distinct vertices and a non-zero area")]
    DegenerateRing { polygon: usize, ring: usize },

    #[error("{0}")]
    Invalid(String),
}

/// Hex-encoded 32-byte blake3 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a digest read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type GridPoint = [i64; 2];
type GridRing = Vec<GridPoint>;

/// Geometry after canonicalization, on the integer grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalGeometry(Vec<Vec<GridRing>>);

impl CanonicalGeometry {
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Compute the deduplication fingerprint of a request.
pub fn fingerprint(
    plugin_id: &str,
    plugin_version: &str,
    params: &Value,
    geometry: &Geometry,
) -> Result<Fingerprint, ValidationError> {
    if plugin_id.trim().is_empty() {
        return Err(ValidationError::EmptyPluginId);
    }
    let params = canonical_params(params)?;
    let geometry = canonical_geometry(geometry)?.to_json();
    Ok(Fingerprint(hash_parts(&[
        plugin_id,
        plugin_version,
        params.as_str(),
        geometry.as_str(),
    ])))
}

pub fn canonical_params(params: &Value) -> Result<String, ValidationError> {
    if !params.is_object() {
        return Err(ValidationError::ParamsNotObject);
    }
    Ok(to_canonical_json(params))
}

/// `params` with the numeric normalization of [`canonical_params`] applied,
/// as stored on the computation and sent to workers.
pub fn canonical_params_value(params: &Value) -> Result<Value, ValidationError> {
    let canonical = canonical_params(params)?;
    serde_json::from_str(&canonical).map_err(|err| ValidationError::Invalid(err.to_string()))
}

pub fn canonical_geometry(geometry: &Geometry) -> Result<CanonicalGeometry, ValidationError> {
    let polygons = geometry.polygons();
    if polygons.is_empty() {
        return Err(ValidationError::EmptyGeometry);
    }

    let mut canonical = Vec::with_capacity(polygons.len());
    for (p_idx, rings) in polygons.into_iter().enumerate() {
        if rings.is_empty() {
            return Err(ValidationError::EmptyGeometry);
        }
        let mut out: Vec<GridRing> = Vec::with_capacity(rings.len());
        for (r_idx, ring) in rings.iter().enumerate() {
            for &[lon, lat] in ring {
                check_position(lon, lat)?;
            }
            let grid = canonical_ring(ring, r_idx == 0).ok_or(ValidationError::DegenerateRing {
                polygon: p_idx,
                ring: r_idx,
            })?;
            out.push(grid);
        }
        out[1..].sort();
        canonical.push(out);
    }
    canonical.sort();
    Ok(CanonicalGeometry(canonical))
}

fn check_position(lon: f64, lat: f64) -> Result<(), ValidationError> {
    if !lon.is_finite() || !lat.is_finite() {
        return Err(ValidationError::NonFiniteCoordinate);
    }
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return Err(ValidationError::CoordinateOutOfRange { lon, lat });
    }
    Ok(())
}

fn quantize(position: &Position) -> GridPoint {
    [
        (position[0] / COORDINATE_TOLERANCE).round() as i64,
        (position[1] / COORDINATE_TOLERANCE).round() as i64,
    ]
}

/// Returns `None` for rings that collapse to fewer than 3 vertices or zero area.
fn canonical_ring(ring: &Ring, exterior: bool) -> Option<GridRing> {
    let mut points: GridRing = Vec::with_capacity(ring.len());
    for position in ring {
        let point = quantize(position);
        if points.last() != Some(&point) {
            points.push(point);
        }
    }
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    if points.len() < 3 {
        return None;
    }

    let area = twice_signed_area(&points);
    if area == 0 {
        return None;
    }
    let counter_clockwise = area > 0;
    if counter_clockwise != exterior {
        points.reverse();
    }

    let start = points
        .iter()
        .enumerate()
        .min_by_key(|(_, point)| **point)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    points.rotate_left(start);
    Some(points)
}

fn twice_signed_area(points: &[GridPoint]) -> i128 {
    let n = points.len();
    (0..n)
        .map(|i| {
            let [x1, y1] = points[i];
            let [x2, y2] = points[(i + 1) % n];
            x1 as i128 * y2 as i128 - x2 as i128 * y1 as i128
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn square() -> Geometry {
        Geometry::Polygon(vec![vec![
            [8.0, 49.0],
            [9.0, 49.0],
            [9.0, 50.0],
            [8.0, 50.0],
            [8.0, 49.0],
        ]])
    }

    fn fp(params: Value, geometry: &Geometry) -> Fingerprint {
        fingerprint("heat", "1.0.0", &params, geometry).unwrap()
    }

    #[test]
    fn key_order_does_not_matter() {
        let g = square();
        assert_eq!(fp(json!({"a": 1, "b": 2}), &g), fp(json!({"b": 2, "a": 1}), &g));
    }

    #[test]
    fn numeric_formatting_does_not_matter() {
        let g = square();
        let float: Value = serde_json::from_str(r#"{"x": 1.0}"#).unwrap();
        assert_eq!(fp(json!({"x": 1}), &g), fp(float, &g));
    }

    #[test]
    fn ring_rotation_and_orientation_do_not_matter() {
        let rotated_clockwise = Geometry::Polygon(vec![vec![
            [9.0, 50.0],
            [9.0, 49.0],
            [8.0, 49.0],
            [8.0, 50.0],
            [9.0, 50.0],
        ]]);
        assert_eq!(fp(json!({}), &square()), fp(json!({}), &rotated_clockwise));
    }

    #[test]
    fn polygon_equals_single_member_multipolygon() {
        let multi = square().into_multi();
        assert_eq!(fp(json!({}), &square()), fp(json!({}), &multi));
    }

    #[test]
    fn polygon_order_in_multipolygon_does_not_matter() {
        let a = vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]];
        let b = vec![vec![[5.0, 5.0], [6.0, 5.0], [6.0, 6.0], [5.0, 5.0]]];
        let ab = Geometry::MultiPolygon(vec![a.clone(), b.clone()]);
        let ba = Geometry::MultiPolygon(vec![b, a]);
        assert_eq!(fp(json!({}), &ab), fp(json!({}), &ba));
    }

    #[test]
    fn sub_tolerance_noise_collapses() {
        let noisy = Geometry::Polygon(vec![vec![
            [8.0 + 1e-12, 49.0],
            [9.0, 49.0 - 1e-12],
            [9.0, 50.0],
            [8.0, 50.0],
        ]]);
        assert_eq!(fp(json!({}), &square()), fp(json!({}), &noisy));
    }

    #[test]
    fn divergence_above_tolerance_does_not_collide() {
        let shifted = Geometry::Polygon(vec![vec![
            [8.0, 49.0],
            [9.0, 49.0],
            [9.0, 50.0 + 1e-7],
            [8.0, 50.0],
        ]]);
        assert_ne!(fp(json!({}), &square()), fp(json!({}), &shifted));
    }

    #[test]
    fn plugin_version_is_part_of_identity() {
        let g = square();
        let v1 = fingerprint("heat", "1.0.0", &json!({}), &g).unwrap();
        let v2 = fingerprint("heat", "1.0.1", &json!({}), &g).unwrap();
        assert_ne!(v1, v2);
    }

    #[test]
    fn canonical_params_value_normalizes_numbers() {
        let value = canonical_params_value(&json!({"b": 2.0, "a": [1.5, 3.0]})).unwrap();
        assert_eq!(value, json!({"a": [1.5, 3], "b": 2}));
        assert!(value["b"].is_i64());
    }

    #[test]
    fn params_must_be_object() {
        let err = fingerprint("heat", "1", &json!([1, 2]), &square()).unwrap_err();
        assert_eq!(err, ValidationError::ParamsNotObject);
    }

    #[test]
    fn degenerate_ring_is_rejected() {
        let line = Geometry::Polygon(vec![vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [0.0, 0.0]]]);
        assert!(matches!(
            fingerprint("heat", "1", &json!({}), &line),
            Err(ValidationError::DegenerateRing { polygon: 0, ring: 0 })
        ));
    }

    #[test]
    fn out_of_range_coordinate_is_rejected() {
        let bad = Geometry::Polygon(vec![vec![[0.0, 0.0], [181.0, 0.0], [0.0, 1.0]]]);
        assert!(matches!(
            fingerprint("heat", "1", &json!({}), &bad),
            Err(ValidationError::CoordinateOutOfRange { .. })
        ));
    }

    #[test]
    fn empty_geometry_is_rejected() {
        let empty = Geometry::MultiPolygon(vec![]);
        assert_eq!(
            fingerprint("heat", "1", &json!({}), &empty).unwrap_err(),
            ValidationError::EmptyGeometry
        );
    }

    #[test]
    fn holes_are_clockwise_and_exteriors_counter_clockwise() {
        let with_hole = Geometry::Polygon(vec![
            vec![[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0]],
            vec![[2.0, 2.0], [4.0, 2.0], [4.0, 4.0], [2.0, 4.0]],
        ]);
        let canonical = canonical_geometry(&with_hole).unwrap();
        let rings = &canonical.0[0];
        assert!(twice_signed_area(&rings[0]) > 0);
        assert!(twice_signed_area(&rings[1]) < 0);
    }
}
