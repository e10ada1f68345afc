//! Content-addressed on-disk cache of computed boxes.
//!
//! One file per box, named `{Kind}_{key-hash:016x}_r{seed}.box`, where the
//! key hash covers the whole identity except the seed. Record layout:
//!
//! ```text
//! MAGIC (8) | version u32 | header_len u64 | bincode(RecordHeader)
//!           | zstd(bincode(Vec<ArrayRecord>))
//! ```
//!
//! The header holds the identity and scalars and can be read without
//! decompressing the arrays, so directory queries stay cheap.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use reionize_foundation::redshifts_match;
use reionize_params::InputParameters;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::outputs::{BoxData, Identity};
use crate::registry::OutputKind;
use crate::{Error, Result};

pub const RECORD_MAGIC: &[u8; 8] = b"RZBOX\0\0\x01";

/// Record format version (increment on breaking changes).
pub const RECORD_VERSION: u32 = 1;

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const RECORD_EXTENSION: &str = "box";

/// Uncompressed part of a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordHeader {
    pub identity: Identity,
    pub scalars: IndexMap<String, f64>,
    /// Array names and shapes, in payload order.
    pub fields: Vec<(String, Vec<usize>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArrayRecord {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
}

fn file_prefix(identity: &Identity) -> String {
    format!("{}_{:016x}_r", identity.kind.as_str(), identity.key_hash())
}

/// Where a record for `identity` lives. Requires a known seed.
pub fn record_path(direc: &Path, identity: &Identity) -> Result<PathBuf> {
    let seed = identity.random_seed.ok_or_else(|| {
        Error::Serialization(format!(
            "cannot name a cache record for {} without a random seed",
            identity.kind
        ))
    })?;
    Ok(direc.join(format!(
        "{}{}.{}",
        file_prefix(identity),
        seed,
        RECORD_EXTENSION
    )))
}

/// Existing record for `identity`. An unknown seed matches any seed; the
/// lowest seed wins if several are present.
pub fn find_record(direc: &Path, identity: &Identity) -> Option<PathBuf> {
    if identity.random_seed.is_some() {
        return record_path(direc, identity).ok().filter(|p| p.is_file());
    }
    let prefix = file_prefix(identity);
    let mut found: Vec<(u64, PathBuf)> = fs::read_dir(direc)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let seed = name
                .strip_prefix(&prefix)?
                .strip_suffix(&format!(".{RECORD_EXTENSION}"))?
                .parse::<u64>()
                .ok()?;
            Some((seed, entry.path()))
        })
        .collect();
    found.sort();
    if found.len() > 1 {
        debug!(
            kind = %identity.kind,
            candidates = found.len(),
            "Several seeds cached for one identity, using the lowest"
        );
    }
    found.into_iter().next().map(|(_, p)| p)
}

/// Serialize `data` to `path` (write-then-rename).
pub fn write_record(path: &Path, data: &BoxData) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let arrays: Vec<ArrayRecord> = data
        .arrays()
        .iter()
        .map(|(name, array)| ArrayRecord {
            name: name.clone(),
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        })
        .collect();
    let header = RecordHeader {
        identity: data.identity().clone(),
        scalars: data.scalars().clone(),
        fields: arrays
            .iter()
            .map(|a| (a.name.clone(), a.shape.clone()))
            .collect(),
    };

    let header_bytes =
        bincode::serialize(&header).map_err(|e| Error::Serialization(e.to_string()))?;
    let payload = bincode::serialize(&arrays).map_err(|e| Error::Serialization(e.to_string()))?;
    let compressed = zstd::encode_all(&payload[..], DEFAULT_COMPRESSION_LEVEL)
        .map_err(|e| Error::Compression(e.to_string()))?;

    debug!(
        header_bytes = header_bytes.len(),
        payload_bytes = payload.len(),
        compressed_bytes = compressed.len(),
        "Encoded cache record"
    );

    let tmp = path.with_extension("box.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(RECORD_MAGIC)?;
        file.write_all(&RECORD_VERSION.to_le_bytes())?;
        file.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
        file.write_all(&header_bytes)?;
        file.write_all(&compressed)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_preamble(file: &mut File, path: &Path) -> Result<RecordHeader> {
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != RECORD_MAGIC {
        return Err(Error::Serialization(format!(
            "{} is not a cache record",
            path.display()
        )));
    }
    let mut word = [0u8; 4];
    file.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if version != RECORD_VERSION {
        return Err(Error::Serialization(format!(
            "{}: record version {version}, expected {RECORD_VERSION}",
            path.display()
        )));
    }
    let mut len = [0u8; 8];
    file.read_exact(&mut len)?;
    let mut header_bytes = vec![0u8; u64::from_le_bytes(len) as usize];
    file.read_exact(&mut header_bytes)?;
    bincode::deserialize(&header_bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Header only; arrays are left compressed on disk.
pub fn read_header(path: &Path) -> Result<RecordHeader> {
    let mut file = File::open(path)?;
    read_preamble(&mut file, path)
}

/// Header and every array.
pub fn read_record(path: &Path) -> Result<(RecordHeader, IndexMap<String, ArrayD<f32>>)> {
    let mut file = File::open(path)?;
    let header = read_preamble(&mut file, path)?;
    let mut compressed = Vec::new();
    file.read_to_end(&mut compressed)?;
    let payload =
        zstd::decode_all(&compressed[..]).map_err(|e| Error::Compression(e.to_string()))?;
    let records: Vec<ArrayRecord> =
        bincode::deserialize(&payload).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut arrays = IndexMap::with_capacity(records.len());
    for record in records {
        let array = ArrayD::from_shape_vec(IxDyn(&record.shape), record.data)
            .map_err(|e| Error::Serialization(format!("{}: {e}", record.name)))?;
        arrays.insert(record.name, array);
    }
    Ok((header, arrays))
}

/// Open any record as a fully loaded box.
pub fn readbox(path: &Path) -> Result<BoxData> {
    let (header, arrays) = read_record(path)?;
    let mut data = BoxData::new(header.identity);
    data.fill(arrays, header.scalars, path.to_path_buf());
    Ok(data)
}

/// Partial key for [`query_cache`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct CacheQuery {
    pub kind: Option<OutputKind>,
    pub random_seed: Option<u64>,
    pub redshift: Option<f64>,
    /// Parameters the record must be compatible with.
    pub inputs: Option<InputParameters>,
}

impl CacheQuery {
    fn accepts(&self, identity: &Identity) -> bool {
        if self.kind.is_some_and(|k| k != identity.kind) {
            return false;
        }
        if self.random_seed.is_some() && self.random_seed != identity.random_seed {
            return false;
        }
        if let Some(z) = self.redshift {
            match identity.redshift {
                Some(rz) if redshifts_match(z, rz) => {}
                _ => return false,
            }
        }
        if let Some(inputs) = &self.inputs {
            let reference = Identity::new(identity.kind, inputs, identity.redshift);
            if reference.check_compatible(identity, &["redshift"]).is_err() {
                return false;
            }
        }
        true
    }
}

/// Every record in `direc` matching `query`, as unread boxes.
///
/// Each returned box carries the record's identity; call
/// [`BoxData::read`] to load its arrays. Unreadable files are skipped.
pub fn query_cache(direc: &Path, query: &CacheQuery) -> Result<Vec<(PathBuf, BoxData)>> {
    let mut hits = Vec::new();
    let entries = match fs::read_dir(direc) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hits),
        Err(e) => return Err(e.into()),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == RECORD_EXTENSION))
        .collect();
    paths.sort();

    for path in paths {
        if let Some(kind) = query.kind {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !name.starts_with(&format!("{}_", kind.as_str())) {
                continue;
            }
        }
        match read_header(&path) {
            Ok(header) if query.accepts(&header.identity) => {
                hits.push((path, BoxData::new(header.identity)));
            }
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }
    Ok(hits)
}

/// All cached boxes at one redshift, grouped by kind in pipeline order.
pub fn get_boxes_at_redshift(
    direc: &Path,
    redshift: f64,
    random_seed: Option<u64>,
    inputs: Option<&InputParameters>,
) -> Result<IndexMap<OutputKind, Vec<BoxData>>> {
    let query = CacheQuery {
        kind: None,
        random_seed,
        redshift: Some(redshift),
        inputs: inputs.cloned(),
    };
    let mut grouped: IndexMap<OutputKind, Vec<BoxData>> = IndexMap::new();
    for kind in OutputKind::ALL {
        grouped.insert(kind, Vec::new());
    }
    for (_, data) in query_cache(direc, &query)? {
        grouped.entry(data.kind()).or_default().push(data);
    }
    grouped.retain(|_, boxes| !boxes.is_empty());
    Ok(grouped)
}
