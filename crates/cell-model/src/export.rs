//! Snapshot writers and readers
//!
//! Two formats are produced from a [`HostState`]:
//!
//! - `.cm5_viz`: a render-only snapshot (count, then one 36-byte record per
//!   cell, optionally followed by the id block), optionally zlib compressed.
//! - `.cm5_step`: a restorable snapshot carrying every attribute, always zlib
//!   compressed.
//!
//! All values are little-endian.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::cell::{direction_from_angles, HostState, StateParts};
use crate::constants::{SNAPSHOT_COMPRESSION_LEVEL, VIZ_RECORD_SIZE};
use crate::error::{ModelError, Result};

pub const VIZ_EXTENSION: &str = "cm5_viz";
pub const STEP_EXTENSION: &str = "cm5_step";

const STEP_MAGIC: &[u8; 4] = b"CM5S";
const STEP_VERSION: u32 = 1;
/// Bytes per cell in a step snapshot: position, rotation, size, velocity, color, id
const STEP_CELL_SIZE: usize = 12 + 8 + 8 + 12 + 4 + 8;

/// Options for the viz snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VizOptions {
    /// Append `cell_count` u64 ids after the records
    pub include_ids: bool,
    /// zlib-compress the whole buffer
    pub compress: bool,
}

impl Default for VizOptions {
    fn default() -> Self {
        Self {
            include_ids: true,
            compress: true,
        }
    }
}

/// File name for step `index` with the given extension, e.g. `step-00042.cm5_viz`
pub fn step_file_name(index: u64, extension: &str) -> String {
    format!("step-{index:05}.{extension}")
}

/// Encode the viz snapshot without compression.
pub fn encode_viz_raw(state: &HostState, include_ids: bool) -> Vec<u8> {
    let count = state.cell_count() as usize;
    let id_bytes = if include_ids { count * 8 } else { 0 };
    let mut out = Vec::with_capacity(4 + count * VIZ_RECORD_SIZE + id_bytes);

    put_u32(&mut out, state.cell_count());
    for i in 0..count {
        let position = state.positions()[i];
        let direction = direction_from_angles(state.rotations()[i]);
        let [length, radius] = state.sizes()[i];

        for v in position.into_iter().chain(direction) {
            put_f32(&mut out, v);
        }
        put_f32(&mut out, length);
        put_f32(&mut out, radius);
        put_u32(&mut out, state.colors()[i]);
    }

    if include_ids {
        for &id in state.ids() {
            put_u64(&mut out, id);
        }
    }
    out
}

/// Encode the viz snapshot, applying compression if requested.
pub fn encode_viz(state: &HostState, options: VizOptions) -> std::io::Result<Vec<u8>> {
    let raw = encode_viz_raw(state, options.include_ids);
    if options.compress {
        compress(&raw)
    } else {
        Ok(raw)
    }
}

/// Write a viz snapshot to `path`. State is never touched on failure.
pub fn write_viz_file(state: &HostState, path: &Path, options: VizOptions) -> Result<()> {
    let bytes = encode_viz(state, options).map_err(|e| ModelError::io(path, e))?;
    fs::write(path, &bytes).map_err(|e| ModelError::io(path, e))?;
    log::debug!(
        "Wrote viz snapshot {} ({} cells, {} bytes)",
        path.display(),
        state.cell_count(),
        bytes.len()
    );
    Ok(())
}

/// Encode a restorable step snapshot (compressed).
pub fn encode_step(state: &HostState) -> std::io::Result<Vec<u8>> {
    let count = state.cell_count() as usize;
    let mut out = Vec::with_capacity(24 + count * STEP_CELL_SIZE);

    out.extend_from_slice(STEP_MAGIC);
    put_u32(&mut out, STEP_VERSION);
    put_u32(&mut out, state.capacity());
    put_u32(&mut out, state.cell_count());
    put_u64(&mut out, state.next_id());

    for p in state.positions() {
        p.iter().for_each(|&v| put_f32(&mut out, v));
    }
    for r in state.rotations() {
        r.iter().for_each(|&v| put_f32(&mut out, v));
    }
    for s in state.sizes() {
        s.iter().for_each(|&v| put_f32(&mut out, v));
    }
    for v in state.velocities() {
        v.iter().for_each(|&x| put_f32(&mut out, x));
    }
    for &c in state.colors() {
        put_u32(&mut out, c);
    }
    for &id in state.ids() {
        put_u64(&mut out, id);
    }

    compress(&out)
}

/// Decode a step snapshot produced by [`encode_step`].
///
/// The restored state is sized to its live cells. The saved capacity is only
/// checked against the count; callers copy the result into their own state
/// with [`HostState::replace_with`].
pub fn decode_step(bytes: &[u8]) -> Result<HostState> {
    let mut raw = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut raw)
        .map_err(|e| ModelError::MalformedSnapshot(format!("zlib: {e}")))?;

    let mut reader = Reader::new(&raw);
    if reader.take(4)? != STEP_MAGIC {
        return Err(ModelError::MalformedSnapshot("bad magic".into()));
    }
    let version = reader.u32()?;
    if version != STEP_VERSION {
        return Err(ModelError::MalformedSnapshot(format!(
            "unsupported version {version}"
        )));
    }
    let capacity = reader.u32()?;
    let count = reader.u32()?;
    let next_id = reader.u64()?;
    if count > capacity {
        return Err(ModelError::CapacityExceeded {
            requested: count as u64,
            capacity,
        });
    }

    let n = count as usize;
    if (reader.remaining() as u64) != count as u64 * STEP_CELL_SIZE as u64 {
        return Err(ModelError::MalformedSnapshot(format!(
            "{count} cells declared, {} payload bytes present",
            reader.remaining()
        )));
    }
    let parts = StateParts {
        next_id,
        positions: reader.repeat(n, |r| Ok([r.f32()?, r.f32()?, r.f32()?]))?,
        rotations: reader.repeat(n, |r| Ok([r.f32()?, r.f32()?]))?,
        sizes: reader.repeat(n, |r| Ok([r.f32()?, r.f32()?]))?,
        velocities: reader.repeat(n, |r| Ok([r.f32()?, r.f32()?, r.f32()?]))?,
        colors: reader.repeat(n, Reader::u32)?,
        ids: reader.repeat(n, Reader::u64)?,
    };
    Ok(HostState::from_parts(parts))
}

pub fn write_step_file(state: &HostState, path: &Path) -> Result<()> {
    let bytes = encode_step(state).map_err(|e| ModelError::io(path, e))?;
    fs::write(path, &bytes).map_err(|e| ModelError::io(path, e))?;
    log::debug!("Wrote step snapshot {}", path.display());
    Ok(())
}

impl HostState {
    /// Restore a state saved with [`write_step_file`].
    pub fn read_step_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| ModelError::io(path, e))?;
        decode_step(&bytes)
    }
}

fn compress(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(raw.len() / 2),
        Compression::new(SNAPSHOT_COMPRESSION_LEVEL),
    );
    encoder.write_all(raw)?;
    encoder.finish()
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(ModelError::MalformedSnapshot("unexpected end of data".into()));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn repeat<T>(&mut self, n: usize, mut f: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        (0..n).map(|_| f(self)).collect()
    }
}
