//! Area-of-interest geometry, in the GeoJSON shape callers submit.

use serde::{Deserialize, Serialize};

/// `[longitude, latitude]` in WGS84 degrees.
pub type Position = [f64; 2];
pub type Ring = Vec<Position>;

/// Polygonal geometry. A `Polygon` is treated as a one-member `MultiPolygon`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl Geometry {
    /// Polygons as rings (exterior first, then holes).
    pub fn polygons(&self) -> Vec<&[Ring]> {
        match self {
            Geometry::Polygon(rings) => vec![rings.as_slice()],
            Geometry::MultiPolygon(polygons) => polygons.iter().map(|p| p.as_slice()).collect(),
        }
    }

    pub fn into_multi(self) -> Geometry {
        match self {
            Geometry::Polygon(rings) => Geometry::MultiPolygon(vec![rings]),
            multi => multi,
        }
    }
}

/// Area of interest attached to a request.
///
/// `name` and `id` are display labels only and never influence deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aoi {
    pub geometry: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Aoi {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            name: None,
            id: None,
        }
    }

    pub fn with_labels(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self.id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_geojson_polygon() {
        let json = r#"{
            "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]},
            "name": "Heidelberg"
        }"#;
        let aoi: Aoi = serde_json::from_str(json).unwrap();
        assert_eq!(aoi.name.as_deref(), Some("Heidelberg"));
        assert_eq!(aoi.geometry.polygons().len(), 1);
    }

    #[test]
    fn into_multi_wraps_polygon() {
        let polygon = Geometry::Polygon(vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]]);
        match polygon.into_multi() {
            Geometry::MultiPolygon(polys) => assert_eq!(polys.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }
}
