//! # Stage A: Enumerate & Spill
//!
//! Walks the primary store along the index path and appends one raw
//! record per projected entry to the build file:
//!
//! ```text
//! record: entry_length u32      bytes after this field
//!         processed    u8       0; stage B flags it 1 in place
//!         key          typed
//!         rp_length    u8, record-pointer bytes
//!         metadata     typed value × metadata_keys.len
//! ```
//!
//! Wildcard levels are enumerated with a per-level fanout cap of
//! `round(500 ^ (0.5 ^ wildcards))` children, so a one-wildcard path
//! visits at most 22 branches per level and a two-wildcard path 5. The
//! record level itself streams unbounded.
//!
//! Records whose path vanished between enumeration and the value fetch
//! are logged and skipped; the build carries on.

use std::path::Path;

use eyre::Result;
use tracing::warn;

use crate::config::ENUM_FANOUT_BASE;
use crate::encoding::{IndexKey, RecordPointer};
use crate::index::{project_record, IndexDefinition};
use crate::io::{BinaryWriter, FileWriter};
use crate::path::PathSegment;
use crate::store::NodeStore;

/// Per-level child cap for wildcard traversal.
pub(crate) fn wildcard_fanout(wildcards: usize) -> usize {
    ENUM_FANOUT_BASE.powf(0.5f64.powi(wildcards as i32)).round() as usize
}

pub(crate) fn write_build_record(
    writer: &mut dyn BinaryWriter,
    key: &IndexKey,
    record_pointer: &[u8],
    metadata: &[IndexKey],
) -> Result<()> {
    let mut body = Vec::with_capacity(64);
    body.push(0u8); // processed flag
    key.encode_to(&mut body);
    body.push(record_pointer.len() as u8);
    body.extend_from_slice(record_pointer);
    for value in metadata {
        value.encode_to(&mut body);
    }
    writer.append(&(body.len() as u32).to_be_bytes())?;
    writer.append(&body)?;
    Ok(())
}

struct Enumeration<'a> {
    store: &'a dyn NodeStore,
    def: &'a IndexDefinition,
    fanout: usize,
    records: u64,
}

impl Enumeration<'_> {
    fn walk(
        &mut self,
        writer: &mut dyn BinaryWriter,
        segment: usize,
        path: String,
        bindings: &mut Vec<String>,
    ) -> Result<()> {
        let segments = self.def.path.segments();
        if segment == segments.len() {
            return self.emit_records(writer, &path, bindings);
        }
        match &segments[segment] {
            PathSegment::Literal(name) => {
                let child = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", path, name)
                };
                self.walk(writer, segment + 1, child, bindings)
            }
            PathSegment::Wildcard => {
                let children = self.store.child_keys(&path, Some(self.fanout))?;
                for key in children {
                    let child = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}/{}", path, key)
                    };
                    bindings.push(key);
                    self.walk(writer, segment + 1, child, bindings)?;
                    bindings.pop();
                }
                Ok(())
            }
        }
    }

    fn emit_records(
        &mut self,
        writer: &mut dyn BinaryWriter,
        collection_path: &str,
        bindings: &[String],
    ) -> Result<()> {
        let children = self.store.child_keys(collection_path, None)?;
        for child_key in children {
            let record_path = format!("{}/{}", collection_path, child_key);
            let Some(value) = self.store.get_value(&record_path)? else {
                warn!(path = %record_path, "record vanished during enumeration, skipping");
                continue;
            };
            let entries = project_record(self.def, &child_key, &value)?;
            if entries.is_empty() {
                continue;
            }
            let record_pointer =
                RecordPointer::new(bindings.iter().cloned(), child_key.clone()).encode()?;
            for (key, metadata) in entries {
                write_build_record(writer, &key, &record_pointer, &metadata)?;
                self.records += 1;
            }
        }
        Ok(())
    }
}

/// Runs stage A, returning the number of records spilled.
pub fn enumerate(store: &dyn NodeStore, def: &IndexDefinition, build_file: &Path) -> Result<u64> {
    let mut writer = FileWriter::create(build_file)?;
    let mut enumeration = Enumeration {
        store,
        def,
        fanout: wildcard_fanout(def.path.wildcard_count()),
        records: 0,
    };
    let mut bindings = Vec::new();
    enumeration.walk(&mut writer, 0, String::new(), &mut bindings)?;
    writer.sync()?;
    Ok(enumeration.records)
}
