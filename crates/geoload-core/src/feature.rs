//! GeoJSON feature shapes as read from sources and written into chunks

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One feature streamed from a source collection
///
/// The geometry is kept as raw JSON: chunking only copies it through, and
/// the loader decodes it when it needs coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    #[serde(default)]
    pub geometry: Option<Value>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

fn feature_type() -> String {
    "Feature".to_string()
}

/// Metadata injected into every feature of a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProperties {
    pub region: String,
    pub source_file: String,
    pub chunk_number: u32,
}

/// A feature as stored in a chunk file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFeature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    pub geometry: Option<Value>,
    pub properties: ChunkProperties,
}

impl ChunkFeature {
    /// Tag a source feature with its chunk context, dropping source attributes
    pub fn enrich(feature: Feature, properties: ChunkProperties) -> Self {
        Self {
            kind: feature_type(),
            geometry: feature.geometry,
            properties,
        }
    }
}

/// Serialized content of one chunk file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<ChunkFeature>,
}

impl ChunkCollection {
    pub fn new(features: Vec<ChunkFeature>) -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            features,
        }
    }
}
