//! GeoJSON geometry decoding, integrity counts and WKT conversion

use geo::{Area, Validation};
use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wkt::ToWkt;

use crate::error::{LoadError, Result};

type Position = Vec<f64>;

/// GeoJSON geometry object, tagged by its `type` member
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum GeoJsonGeometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<GeoJsonGeometry> },
}

fn coord(position: &[f64]) -> std::result::Result<Coord<f64>, String> {
    match position {
        [x, y, ..] => Ok(Coord { x: *x, y: *y }),
        _ => Err(format!("position has {} ordinates", position.len())),
    }
}

fn line(positions: &[Position]) -> std::result::Result<LineString<f64>, String> {
    positions
        .iter()
        .map(|p| coord(p))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(LineString::new)
}

fn polygon(rings: &[Vec<Position>]) -> std::result::Result<Polygon<f64>, String> {
    let mut rings = rings.iter();
    let exterior = match rings.next() {
        Some(ring) => line(ring)?,
        None => LineString::new(Vec::new()),
    };
    let interiors = rings.map(|r| line(r)).collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

impl GeoJsonGeometry {
    fn to_geo(&self) -> std::result::Result<Geometry<f64>, String> {
        Ok(match self {
            GeoJsonGeometry::Point { coordinates } => Geometry::Point(Point(coord(coordinates)?)),
            GeoJsonGeometry::MultiPoint { coordinates } => Geometry::MultiPoint(MultiPoint(
                coordinates
                    .iter()
                    .map(|p| coord(p).map(Point))
                    .collect::<std::result::Result<_, _>>()?,
            )),
            GeoJsonGeometry::LineString { coordinates } => Geometry::LineString(line(coordinates)?),
            GeoJsonGeometry::MultiLineString { coordinates } => {
                Geometry::MultiLineString(MultiLineString(
                    coordinates
                        .iter()
                        .map(|l| line(l))
                        .collect::<std::result::Result<_, _>>()?,
                ))
            }
            GeoJsonGeometry::Polygon { coordinates } => Geometry::Polygon(polygon(coordinates)?),
            GeoJsonGeometry::MultiPolygon { coordinates } => Geometry::MultiPolygon(MultiPolygon(
                coordinates
                    .iter()
                    .map(|p| polygon(p))
                    .collect::<std::result::Result<_, _>>()?,
            )),
            GeoJsonGeometry::GeometryCollection { geometries } => {
                Geometry::GeometryCollection(GeometryCollection(
                    geometries
                        .iter()
                        .map(GeoJsonGeometry::to_geo)
                        .collect::<std::result::Result<_, _>>()?,
                ))
            }
        })
    }
}

/// Decode the raw geometry of feature `index`
///
/// A missing or undecodable geometry cannot be inserted and fails the chunk.
pub fn decode_geometry(index: usize, raw: Option<&Value>) -> Result<Geometry<f64>> {
    let raw = match raw {
        Some(Value::Null) | None => {
            return Err(LoadError::MalformedGeometry {
                index,
                message: "geometry is null".into(),
            })
        }
        Some(value) => value,
    };

    let parsed = GeoJsonGeometry::deserialize(raw).map_err(|e| LoadError::MalformedGeometry {
        index,
        message: e.to_string(),
    })?;

    parsed.to_geo().map_err(|message| LoadError::MalformedGeometry { index, message })
}

/// Canonical well-known text of a geometry
pub fn to_wkt(geometry: &Geometry<f64>) -> String {
    geometry.wkt_string()
}

/// Diagnostic geometry-quality counts for one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCounts {
    pub total: u64,
    pub invalid: u64,
    pub non_polygon: u64,
    /// Zero or NaN area
    pub bad_area: u64,
}

impl IntegrityCounts {
    pub fn observe(&mut self, geometry: &Geometry<f64>) {
        self.total += 1;
        if !geometry.is_valid() {
            self.invalid += 1;
        }
        if !matches!(geometry, Geometry::Polygon(_)) {
            self.non_polygon += 1;
        }
        let area = geometry.unsigned_area();
        if area.is_nan() || area == 0.0 {
            self.bad_area += 1;
        }
    }

    pub fn is_clean(&self) -> bool {
        self.invalid == 0 && self.non_polygon == 0 && self.bad_area == 0
    }
}
