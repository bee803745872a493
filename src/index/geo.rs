//! # Geo Index
//!
//! Indexes `{lat, long}` objects as 10-character geohashes. A geohash is a
//! base-32 string built from interleaved longitude/latitude range halving;
//! every extra character refines the cell by a factor of 32, and cells
//! sharing a prefix are neighbors, which turns "nearby" into a handful of
//! prefix scans on the tree.
//!
//! `geo:nearby {lat, long, radius}` picks the coarsest precision whose
//! cell still covers the radius, steps a grid over the radius' bounding
//! box to collect the covering cell set, and unions one `like "prefix*"`
//! search per cell. The result over-approximates the disk near its
//! boundary; callers filter by true distance.

use hashbrown::HashSet;

use eyre::Result;

use super::{IndexDefinition, IndexStrategy, IndexType, ProjectedEntry};
use crate::btree::{BinaryBTree, SearchOptions, TreeQuery, TreeSearchResult};
use crate::encoding::IndexKey;
use crate::error::IndexError;
use crate::index::query::QueryValue;
use crate::store::NodeValue;

pub struct GeoIndex;

/// Characters of a stored geohash key.
pub const GEOHASH_PRECISION: usize = 10;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Approximate cell dimensions (longitude width, latitude height) in
/// meters per geohash precision, at the equator.
const CELL_DIMENSIONS: [(f64, f64); 10] = [
    (5_009_400.0, 4_992_600.0),
    (1_252_300.0, 624_100.0),
    (156_500.0, 156_000.0),
    (39_100.0, 19_500.0),
    (4_900.0, 4_900.0),
    (1_200.0, 609.4),
    (152.9, 152.4),
    (38.2, 19.0),
    (4.8, 4.8),
    (1.2, 0.595),
];

pub fn encode_geohash(lat: f64, long: f64, precision: usize) -> String {
    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut even = true;
    let mut bit = 0u8;
    let mut ch = 0usize;
    let mut out = String::with_capacity(precision);

    while out.len() < precision {
        if even {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            if long >= mid {
                ch |= 1 << (4 - bit);
                lon_range.0 = mid;
            } else {
                lon_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                ch |= 1 << (4 - bit);
                lat_range.0 = mid;
            } else {
                lat_range.1 = mid;
            }
        }
        even = !even;
        if bit < 4 {
            bit += 1;
        } else {
            out.push(BASE32[ch] as char);
            bit = 0;
            ch = 0;
        }
    }
    out
}

/// Coarsest precision whose cell still spans the radius in both axes.
fn precision_for_radius(radius_m: f64) -> usize {
    for precision in (1..=GEOHASH_PRECISION).rev() {
        let (lon_m, lat_m) = CELL_DIMENSIONS[precision - 1];
        if lon_m.min(lat_m) >= radius_m {
            return precision;
        }
    }
    1
}

/// Geohash prefixes covering the radius disk around the center. The grid
/// steps one cell at a time over the disk's bounding box, so boundary
/// cells (false positives near the rim) are included by construction.
fn covering_prefixes(lat: f64, long: f64, radius_m: f64, precision: usize) -> Vec<String> {
    let bits = 5 * precision as u32;
    let lon_bits = bits.div_ceil(2);
    let lat_bits = bits / 2;
    let cell_lon_deg = 360.0 / (1u64 << lon_bits) as f64;
    let cell_lat_deg = 180.0 / (1u64 << lat_bits) as f64;

    let dlat_deg = radius_m / 111_320.0;
    let dlon_deg = radius_m / (111_320.0 * lat.to_radians().cos().abs().max(0.01));

    let mut prefixes = Vec::new();
    let mut y = lat - dlat_deg;
    while y <= lat + dlat_deg + cell_lat_deg {
        let mut x = long - dlon_deg;
        while x <= long + dlon_deg + cell_lon_deg {
            let hash = encode_geohash(
                y.clamp(-90.0, 90.0),
                x.clamp(-180.0, 180.0),
                precision,
            );
            if !prefixes.contains(&hash) {
                prefixes.push(hash);
            }
            x += cell_lon_deg;
        }
        y += cell_lat_deg;
    }
    prefixes
}

fn coordinate(value: &NodeValue) -> Option<f64> {
    match value {
        NodeValue::Float(v) => Some(*v),
        NodeValue::Int(v) => Some(*v as f64),
        _ => None,
    }
}

impl IndexStrategy for GeoIndex {
    fn index_type(&self) -> IndexType {
        IndexType::Geo
    }

    fn extra_metadata_keys(&self) -> &'static [&'static str] {
        &[]
    }

    fn valid_operators(&self) -> &'static [&'static str] {
        &["geo:nearby"]
    }

    fn project(
        &self,
        def: &IndexDefinition,
        _child_key: &str,
        value: &NodeValue,
    ) -> Result<Vec<ProjectedEntry>> {
        let Some(location) = value.get(&def.key) else {
            return Ok(Vec::new());
        };
        let (Some(lat), Some(long)) = (
            location.get("lat").and_then(coordinate),
            location.get("long").and_then(coordinate),
        ) else {
            return Ok(Vec::new());
        };
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&long) {
            return Ok(Vec::new());
        }
        Ok(vec![ProjectedEntry {
            key: IndexKey::String(encode_geohash(lat, long, GEOHASH_PRECISION)),
            extra: Vec::new(),
        }])
    }

    fn query(
        &self,
        _def: &IndexDefinition,
        tree: &mut BinaryBTree,
        op: &str,
        value: &QueryValue,
        filter: Option<HashSet<Vec<u8>>>,
    ) -> Result<TreeSearchResult> {
        if op != "geo:nearby" {
            return Err(IndexError::InvalidArgument(format!(
                "operator {:?} is not supported by a geo index",
                op
            ))
            .into());
        }
        let QueryValue::Nearby { lat, long, radius } = value else {
            return Err(IndexError::InvalidArgument(
                "geo:nearby expects { lat, long, radius }".to_string(),
            )
            .into());
        };
        if *radius <= 0.0 {
            return Err(IndexError::InvalidArgument(format!(
                "geo:nearby radius must be positive, got {}",
                radius
            ))
            .into());
        }

        let precision = precision_for_radius(*radius);
        let prefixes = covering_prefixes(*lat, *long, *radius, precision);

        // Cells at one precision are disjoint; concatenation cannot
        // duplicate a record.
        let mut merged = TreeSearchResult::default();
        for prefix in prefixes {
            let result = tree.search(
                &TreeQuery::Like(format!("{}*", prefix)),
                &SearchOptions {
                    filter: filter.clone(),
                },
            )?;
            merged.entries.extend(result.entries);
        }
        merged.entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_geohash() {
        assert_eq!(encode_geohash(57.64911, 10.40744, 11), "u4pruydqqvj");
        assert_eq!(encode_geohash(57.64911, 10.40744, 5), "u4pru");
    }

    #[test]
    fn precision_shrinks_with_radius() {
        assert_eq!(precision_for_radius(500.0), 6);
        assert_eq!(precision_for_radius(100.0), 7);
        assert_eq!(precision_for_radius(10_000.0), 4);
        assert_eq!(precision_for_radius(10_000_000.0), 1);
    }

    #[test]
    fn covering_includes_center_cell() {
        let precision = precision_for_radius(500.0);
        let prefixes = covering_prefixes(52.359, 4.884, 500.0, precision);
        let center = encode_geohash(52.359, 4.884, precision);
        assert!(prefixes.contains(&center));
        assert!(prefixes.len() >= 4, "radius disk should span several cells");
        assert!(prefixes.len() <= 64, "covering set exploded: {}", prefixes.len());
    }

    #[test]
    fn project_requires_coordinates() {
        let def = IndexDefinition {
            path: crate::path::PathInfo::parse("landmarks").unwrap(),
            key: "location".to_string(),
            include_keys: Vec::new(),
            case_sensitive: false,
            locale: "en-us".to_string(),
            index_type: IndexType::Geo,
        };
        let good = NodeValue::object([(
            "location".to_string(),
            NodeValue::object([
                ("lat".to_string(), NodeValue::Float(52.36)),
                ("long".to_string(), NodeValue::Float(4.88)),
            ]),
        )]);
        let entries = GeoIndex.project(&def, "l1", &good).unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].key {
            IndexKey::String(hash) => assert_eq!(hash.len(), GEOHASH_PRECISION),
            other => panic!("expected string geohash, got {}", other),
        }

        let bad = NodeValue::object([(
            "location".to_string(),
            NodeValue::object([("lat".to_string(), NodeValue::Float(52.36))]),
        )]);
        assert!(GeoIndex.project(&def, "l1", &bad).unwrap().is_empty());
    }
}
