//! Lightcone checkpoint file.
//!
//! A lightcone run writes its arrays to disk as it goes so that an interrupted
//! run can pick up at the last finished node.
//!
//! ```text
//! MAGIC (8) | version u32 | current_index u64 | current_redshift f64
//!           | header_len u64 | bincode(CheckpointHeader)
//!           | quantity arrays   (f32 LE, one line-of-sight slice after another)
//!           | global series     (f64 LE, one value per node)
//!           | mturnover series  (f64 LE, plain then minihalo)
//!           | trailer_len u64 | bincode(CheckpointTrailer)
//! ```
//!
//! The progress block and each filled slice range are rewritten in place
//! after every node. Data is synced before progress, so progress never points
//! past what is on disk. The trailer is only written at creation and when the
//! run finishes.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use ndarray::{ArrayD, Axis, IxDyn};
use reionize_params::{GlobalParams, InputParameters};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coeval::CacheFiles;
use crate::engine::PhotonConsData;
use crate::lightcone::Lightcone;
use crate::lightconer::Geometry;
use crate::{Error, Result};

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"RZLC\0\0\0\x01";

/// Checkpoint format version (increment on breaking changes).
pub const CHECKPOINT_VERSION: u32 = 1;

/// Byte offset of `current_index`.
const PROGRESS_OFFSET: u64 = 12;

// ============================================================================
// Checkpoint Format
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointHeader {
    geometry: Geometry,
    inputs: InputParameters,
    globals: GlobalParams,
    distances: Vec<f64>,
    node_redshifts: Vec<f64>,
    /// Name and full shape of every lightcone array, in body order.
    quantities: Vec<(String, Vec<usize>)>,
    global_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointTrailer {
    photon_nonconservation_data: Option<PhotonConsData>,
    cache_files: CacheFiles,
    /// Arrays computed after the scroll rather than sliced from coevals.
    derived_fields: Vec<String>,
}

/// Where each block of the body starts.
#[derive(Debug, Clone)]
struct Layout {
    /// `(offset, values per slice)` for each quantity, in header order.
    quantities: Vec<(u64, u64)>,
    series_offset: u64,
    n_nodes: u64,
    trailer_offset: u64,
}

impl Layout {
    fn new(header: &CheckpointHeader, body_offset: u64) -> Self {
        let mut offset = body_offset;
        let mut quantities = Vec::with_capacity(header.quantities.len());
        for (_, shape) in &header.quantities {
            let total: usize = shape.iter().product();
            let n_slices = shape.last().copied().unwrap_or(1).max(1);
            quantities.push((offset, (total / n_slices) as u64));
            offset += 4 * total as u64;
        }
        let n_nodes = header.node_redshifts.len() as u64;
        let n_globals = header.global_names.len() as u64;
        let series_offset = offset;
        let trailer_offset = series_offset + 8 * n_nodes * (n_globals + 2);
        Self {
            quantities,
            series_offset,
            n_nodes,
            trailer_offset,
        }
    }

    /// Offset of node `node` in series `series` (globals first, then the two
    /// mturnover series).
    fn series_value(&self, series: u64, node: u64) -> u64 {
        self.series_offset + 8 * (series * self.n_nodes + node)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn progress_bytes(lc: &Lightcone) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&(lc.current_index as u64).to_le_bytes());
    bytes[8..].copy_from_slice(&lc.current_redshift.unwrap_or(f64::NAN).to_le_bytes());
    bytes
}

fn slice_bytes(array: &ArrayD<f32>, slices: Range<usize>, buf: &mut Vec<u8>) {
    let axis = Axis(array.ndim() - 1);
    for i in slices {
        for v in array.index_axis(axis, i) {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

fn header_of(lc: &Lightcone) -> CheckpointHeader {
    CheckpointHeader {
        geometry: lc.geometry,
        inputs: lc.inputs.clone(),
        globals: lc.globals.clone(),
        distances: lc.distances.clone(),
        node_redshifts: lc.node_redshifts.clone(),
        quantities: lc
            .lightcones
            .iter()
            .map(|(name, array)| (name.clone(), array.shape().to_vec()))
            .collect(),
        global_names: lc.global_quantities.keys().cloned().collect(),
    }
}

// ============================================================================
// Writer
// ============================================================================

/// An open checkpoint file being filled node by node.
#[derive(Debug)]
pub struct LightconeCheckpoint {
    path: PathBuf,
    file: File,
    layout: Layout,
}

impl LightconeCheckpoint {
    /// Write the whole of `lc` to `path` (write-then-rename) and keep it open
    /// for updates.
    pub fn create(path: &Path, lc: &Lightcone) -> Result<Self> {
        let layout = write_lightcone(path, lc)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            layout,
        })
    }

    /// Open an existing checkpoint, returning it with the lightcone it holds.
    pub fn open(path: &Path) -> Result<(Self, Lightcone)> {
        let (lc, layout) = read_checkpoint(path)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                layout,
            },
            lc,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Persist the slices filled at node `node` and the new progress marker.
    pub fn record_node(&mut self, lc: &Lightcone, node: usize, slices: Range<usize>) -> Result<()> {
        if lc.lightcones.len() != self.layout.quantities.len()
            || node as u64 >= self.layout.n_nodes
        {
            return Err(Error::Checkpoint(format!(
                "{} does not match the lightcone being filled",
                self.path.display()
            )));
        }

        let mut buf = Vec::new();
        for (i, array) in lc.lightcones.values().enumerate() {
            if slices.is_empty() {
                break;
            }
            let (offset, per_slice) = self.layout.quantities[i];
            buf.clear();
            slice_bytes(array, slices.clone(), &mut buf);
            self.write_at(offset + 4 * per_slice * slices.start as u64, &buf)?;
        }

        let series = lc
            .global_quantities
            .values()
            .chain([&lc.log10_mturnovers, &lc.log10_mturnovers_mini]);
        for (s, values) in series.enumerate() {
            let value = values.get(node).copied().unwrap_or(f64::NAN);
            let offset = self.layout.series_value(s as u64, node as u64);
            self.write_at(offset, &value.to_le_bytes())?;
        }
        self.file.sync_data()?;

        self.write_at(PROGRESS_OFFSET, &progress_bytes(lc))?;
        self.file.sync_data()?;
        debug!(
            path = %self.path.display(),
            node,
            slices = ?slices,
            redshift = ?lc.current_redshift,
            "Checkpoint updated"
        );
        Ok(())
    }

    /// Rewrite the whole file with the finished lightcone, including any
    /// arrays derived after the scroll.
    pub fn finalize(self, lc: &Lightcone) -> Result<PathBuf> {
        drop(self.file);
        write_lightcone(&self.path, lc)?;
        info!(path = %self.path.display(), "Lightcone written");
        Ok(self.path)
    }
}

fn write_lightcone(path: &Path, lc: &Lightcone) -> Result<Layout> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let header = header_of(lc);
    let header_bytes = encode(&header)?;
    let trailer_bytes = encode(&CheckpointTrailer {
        photon_nonconservation_data: lc.photon_nonconservation_data.clone(),
        cache_files: lc.cache_files.clone(),
        derived_fields: lc.derived_fields.clone(),
    })?;

    let body_offset = PROGRESS_OFFSET + 16 + 8 + header_bytes.len() as u64;
    let layout = Layout::new(&header, body_offset);

    let tmp = path.with_extension("lc.tmp");
    {
        let mut file = std::io::BufWriter::new(File::create(&tmp)?);
        file.write_all(CHECKPOINT_MAGIC)?;
        file.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
        file.write_all(&progress_bytes(lc))?;
        file.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
        file.write_all(&header_bytes)?;

        let mut buf = Vec::new();
        for array in lc.lightcones.values() {
            buf.clear();
            let n_slices = array.shape().last().copied().unwrap_or(0);
            slice_bytes(array, 0..n_slices, &mut buf);
            file.write_all(&buf)?;
        }
        let n_nodes = lc.node_redshifts.len();
        for values in lc
            .global_quantities
            .values()
            .chain([&lc.log10_mturnovers, &lc.log10_mturnovers_mini])
        {
            for i in 0..n_nodes {
                let v = values.get(i).copied().unwrap_or(f64::NAN);
                file.write_all(&v.to_le_bytes())?;
            }
        }
        file.write_all(&(trailer_bytes.len() as u64).to_le_bytes())?;
        file.write_all(&trailer_bytes)?;
        file.flush()?;
        file.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(
        path = %path.display(),
        header_bytes = header_bytes.len(),
        trailer_offset = layout.trailer_offset,
        "Encoded lightcone checkpoint"
    );
    Ok(layout)
}

// ============================================================================
// Reader
// ============================================================================

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            return Err(Error::Checkpoint(format!(
                "{} is truncated at byte {}",
                self.path.display(),
                self.pos
            )));
        };
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn decode<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        let len = self.u64()? as usize;
        bincode::deserialize(self.take(len)?).map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn read_checkpoint(path: &Path) -> Result<(Lightcone, Layout)> {
    let bytes = fs::read(path)?;
    let mut r = Reader {
        bytes: &bytes,
        pos: 0,
        path,
    };
    if r.take(8)? != CHECKPOINT_MAGIC {
        return Err(Error::Checkpoint(format!(
            "{} is not a lightcone checkpoint",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(r.array()?);
    if version != CHECKPOINT_VERSION {
        return Err(Error::Checkpoint(format!(
            "{}: checkpoint version {version}, expected {CHECKPOINT_VERSION}",
            path.display()
        )));
    }
    let current_index = r.u64()? as usize;
    let current_redshift = Some(r.f64()?).filter(|z| !z.is_nan());
    let header: CheckpointHeader = r.decode()?;
    let layout = Layout::new(&header, r.pos as u64);

    let mut lightcones = IndexMap::with_capacity(header.quantities.len());
    for (name, shape) in &header.quantities {
        let mut array = ArrayD::<f32>::zeros(IxDyn(shape));
        let axis = Axis(array.ndim() - 1);
        for i in 0..array.len_of(axis) {
            for v in array.index_axis_mut(axis, i).iter_mut() {
                *v = r.f32()?;
            }
        }
        lightcones.insert(name.clone(), array);
    }

    let n_nodes = header.node_redshifts.len();
    let mut series = Vec::with_capacity(header.global_names.len() + 2);
    for _ in 0..header.global_names.len() + 2 {
        let values = (0..n_nodes).map(|_| r.f64()).collect::<Result<Vec<_>>>()?;
        series.push(values);
    }
    let log10_mturnovers_mini = series.pop().unwrap_or_default();
    let log10_mturnovers = series.pop().unwrap_or_default();
    let global_quantities = header.global_names.iter().cloned().zip(series).collect();

    let trailer: CheckpointTrailer = r.decode()?;
    info!(
        path = %path.display(),
        redshift = ?current_redshift,
        index = current_index,
        "Lightcone checkpoint loaded"
    );

    let lc = Lightcone {
        geometry: header.geometry,
        inputs: header.inputs,
        globals: header.globals,
        distances: header.distances,
        node_redshifts: header.node_redshifts,
        lightcones,
        global_quantities,
        log10_mturnovers,
        log10_mturnovers_mini,
        photon_nonconservation_data: trailer.photon_nonconservation_data,
        cache_files: trailer.cache_files,
        derived_fields: trailer.derived_fields,
        current_redshift,
        current_index,
    };
    Ok((lc, layout))
}

/// Read a lightcone from a checkpoint or finished lightcone file.
pub fn read_lightcone(path: &Path) -> Result<Lightcone> {
    read_checkpoint(path).map(|(lc, _)| lc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn create_test_lightcone() -> Lightcone {
        let mut inputs = InputParameters::with_seed(11);
        inputs.user_params.hii_dim = 3;
        let mut lightcones = IndexMap::new();
        lightcones.insert(
            "brightness_temp".to_string(),
            Array3::<f32>::from_shape_fn((3, 3, 5), |(i, j, k)| (i * 100 + j * 10 + k) as f32)
                .into_dyn(),
        );
        let mut global_quantities = IndexMap::new();
        global_quantities.insert("xH_box".to_string(), vec![1.0, 0.9, 0.8, 0.7]);
        Lightcone {
            geometry: Geometry::Rectilinear,
            inputs,
            globals: GlobalParams::default(),
            distances: vec![10.0, 11.0, 12.0, 13.0, 14.0],
            node_redshifts: vec![9.0, 8.5, 8.0, 7.5],
            lightcones,
            global_quantities,
            log10_mturnovers: vec![8.0; 4],
            log10_mturnovers_mini: vec![f64::NAN; 4],
            photon_nonconservation_data: None,
            cache_files: CacheFiles::new(),
            derived_fields: Vec::new(),
            current_redshift: None,
            current_index: 5,
        }
    }

    #[test]
    fn test_checkpoint_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lc.ckpt");
        let lc = create_test_lightcone();

        LightconeCheckpoint::create(&path, &lc).unwrap();
        let loaded = read_lightcone(&path).unwrap();

        assert_eq!(loaded.lightcones["brightness_temp"], lc.lightcones["brightness_temp"]);
        assert_eq!(loaded.global_quantities["xH_box"], lc.global_quantities["xH_box"]);
        assert_eq!(loaded.node_redshifts, lc.node_redshifts);
        assert_eq!(loaded.inputs, lc.inputs);
        assert_eq!(loaded.current_redshift, None);
        assert_eq!(loaded.current_index, 5);
    }

    #[test]
    fn test_record_node_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lc.ckpt");
        let mut lc = create_test_lightcone();
        lc.lightcones["brightness_temp"].fill(0.0);
        let mut ckpt = LightconeCheckpoint::create(&path, &lc).unwrap();

        let full = create_test_lightcone().lightcones["brightness_temp"].clone();
        let axis = Axis(2);
        for i in 3..5 {
            lc.lightcones["brightness_temp"]
                .index_axis_mut(axis, i)
                .assign(&full.index_axis(axis, i));
        }
        lc.global_quantities["xH_box"][1] = 0.42;
        lc.current_redshift = Some(8.5);
        lc.current_index = 3;
        ckpt.record_node(&lc, 1, 3..5).unwrap();

        let (_, loaded) = LightconeCheckpoint::open(&path).unwrap();
        assert_eq!(loaded.current_redshift, Some(8.5));
        assert_eq!(loaded.current_index, 3);
        assert_eq!(loaded.global_quantities["xH_box"][1], 0.42);
        let bt = &loaded.lightcones["brightness_temp"];
        assert_eq!(bt.index_axis(axis, 4), full.index_axis(axis, 4));
        assert!(bt.index_axis(axis, 2).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_finalize_adds_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lc.ckpt");
        let mut lc = create_test_lightcone();
        let ckpt = LightconeCheckpoint::create(&path, &lc).unwrap();

        lc.photon_nonconservation_data = Some(PhotonConsData {
            z_calibration: vec![5.0, 6.0],
            delta_z_photon_cons: vec![0.1, 0.2],
            ..Default::default()
        });
        let rsd = lc.lightcones["brightness_temp"].mapv(|v| v * 0.5);
        lc.lightcones.insert("brightness_temp_with_rsds".into(), rsd);
        lc.derived_fields.push("brightness_temp_with_rsds".into());
        ckpt.finalize(&lc).unwrap();

        let loaded = read_lightcone(&path).unwrap();
        assert_eq!(loaded.derived_fields, vec!["brightness_temp_with_rsds".to_string()]);
        assert!(loaded.lightcones.contains_key("brightness_temp_with_rsds"));
        assert_eq!(loaded.photon_nonconservation_data, lc.photon_nonconservation_data);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, b"definitely not a checkpoint").unwrap();
        assert!(matches!(read_lightcone(&path), Err(Error::Checkpoint(_))));

        let short = dir.path().join("short");
        std::fs::write(&short, &CHECKPOINT_MAGIC[..4]).unwrap();
        assert!(read_lightcone(&short).is_err());
    }
}
