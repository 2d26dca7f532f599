//! Serializes a captured session to disk.
//!
//! Frames are written in the recorded-file layout: for each frame the FLIm
//! sub-frame followed by the OCT sub-frame, little-endian, no header. The
//! OCT half of each written frame is taken from the ring slot given by
//! [`write_pair`], which applies the inter-frame correction to the write
//! order.
//!
//! Data goes to a temporary file in the destination directory first and is
//! persisted without clobbering, so a failed save never leaves a partial
//! destination behind.

use crate::error::{AppResult, PipelineError};
use crate::frame::{encode_samples, Sample};
use crate::status::StatusSink;
use crate::sync::write_pair;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Outcome of a completed save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    /// Finalized recording.
    pub destination: PathBuf,
    /// Frames written.
    pub frames_written: usize,
    /// Bytes in the recording (sidecars excluded).
    pub bytes_written: u64,
    /// Sidecar files created next to the recording.
    pub sidecars: Vec<PathBuf>,
    /// Wall time spent saving.
    pub elapsed: Duration,
}

/// Everything the writer thread needs; owned, so no lock is held while
/// writing.
pub(crate) struct SaveJob<F> {
    pub frames: Vec<F>,
    pub flim_len: usize,
    pub inter_frame_offset: isize,
    pub destination: PathBuf,
    pub temp: NamedTempFile,
    pub snapshot: String,
    pub sidecar_files: Vec<PathBuf>,
}

/// Stage a temporary file next to `destination`.
///
/// Fails with [`PipelineError::DestinationExists`] if the destination is
/// already present.
pub(crate) fn prepare(destination: &Path) -> AppResult<NamedTempFile> {
    if destination.exists() {
        return Err(PipelineError::DestinationExists(destination.to_path_buf()));
    }
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    Ok(NamedTempFile::new_in(dir)?)
}

/// Write `frames` in recorded-file order to `out`; returns bytes written.
pub fn write_frames<T, F, W>(
    frames: &[F],
    flim_len: usize,
    inter_frame_offset: isize,
    out: &mut W,
) -> io::Result<u64>
where
    T: Sample,
    F: AsRef<[T]>,
    W: Write,
{
    let count = frames.len();
    let mut bytes = Vec::new();
    let mut written = 0u64;
    for index in 0..count {
        let (flim_slot, oct_slot) = write_pair(index, inter_frame_offset, count);
        bytes.clear();
        encode_samples(&frames[flim_slot].as_ref()[..flim_len], &mut bytes);
        encode_samples(&frames[oct_slot].as_ref()[flim_len..], &mut bytes);
        out.write_all(&bytes)?;
        written += bytes.len() as u64;
    }
    Ok(written)
}

/// Run a save job to completion.
pub(crate) fn run<T, F>(job: SaveJob<F>, status: &dyn StatusSink) -> AppResult<SaveReport>
where
    T: Sample,
    F: AsRef<[T]>,
{
    let started = Instant::now();
    let SaveJob {
        frames,
        flim_len,
        inter_frame_offset,
        destination,
        mut temp,
        snapshot,
        sidecar_files,
    } = job;

    let bytes_written = {
        let mut out = BufWriter::new(temp.as_file_mut());
        let written = write_frames::<T, _, _>(&frames, flim_len, inter_frame_offset, &mut out)?;
        out.flush()?;
        written
    };
    temp.as_file().sync_all()?;
    let frames_written = frames.len();
    drop(frames);

    temp.persist_noclobber(&destination).map_err(|err| {
        // Dropping `err.file` removes the temporary file
        if err.error.kind() == io::ErrorKind::AlreadyExists {
            PipelineError::DestinationExists(destination.clone())
        } else {
            PipelineError::Io(err.error)
        }
    })?;
    debug!(path = %destination.display(), bytes = bytes_written, "Recording persisted");

    let sidecars = write_sidecars(&destination, &snapshot, &sidecar_files, status);
    let report = SaveReport {
        destination,
        frames_written,
        bytes_written,
        sidecars,
        elapsed: started.elapsed(),
    };
    info!(
        path = %report.destination.display(),
        bytes = report.bytes_written,
        sidecars = report.sidecars.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Recording saved"
    );
    Ok(report)
}

/// Write the configuration snapshot and copy calibration/mask artifacts next
/// to `destination`. Problems are warnings; the recording itself is final.
fn write_sidecars(
    destination: &Path,
    snapshot: &str,
    sidecar_files: &[PathBuf],
    status: &dyn StatusSink,
) -> Vec<PathBuf> {
    let mut created = Vec::new();
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));

    let config_path = destination.with_extension("toml");
    match write_new(&config_path, snapshot.as_bytes()) {
        Ok(()) => created.push(config_path),
        Err(err) => sidecar_warning(status, &config_path, &err),
    }

    for source in sidecar_files {
        let Some(file_name) = source.file_name() else {
            continue;
        };
        let target = dir.join(file_name);
        let copied = fs::read(source).and_then(|bytes| write_new(&target, &bytes));
        match copied {
            Ok(()) => created.push(target),
            Err(err) => sidecar_warning(status, source, &err),
        }
    }
    created
}

fn write_new(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn sidecar_warning(status: &dyn StatusSink, path: &Path, err: &io::Error) {
    warn!(path = %path.display(), error = %err, "Sidecar not written");
    status.warning(
        "recorder",
        format!("sidecar {} not written: {err}", path.display()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{MemorySink, Severity};

    #[test]
    fn test_write_frames_rotates_oct_half() {
        // flim_len 1, oct_len 1; frame k holds [k, 100 + k]
        let frames: Vec<Vec<u16>> = (0..4).map(|k| vec![k, 100 + k]).collect();
        let mut out = Vec::new();
        let written = write_frames::<u16, _, _>(&frames, 1, 1, &mut out).unwrap();
        assert_eq!(written, 16);

        let samples: Vec<u16> = out
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![0, 101, 1, 102, 2, 103, 3, 100]);
    }

    #[test]
    fn test_prepare_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("pullback.data");
        fs::write(&destination, b"keep").unwrap();
        assert!(matches!(
            prepare(&destination),
            Err(PipelineError::DestinationExists(_))
        ));
        assert_eq!(fs::read(&destination).unwrap(), b"keep");
    }

    #[test]
    fn test_missing_sidecar_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("pullback.data");
        let mask = dir.path().join("calibration").join("mask.bin");
        let sink = MemorySink::new();

        let created = write_sidecars(&destination, "a = 1\n", &[mask], &sink);
        assert_eq!(created, vec![dir.path().join("pullback.toml")]);
        assert_eq!(sink.with_severity(Severity::Warning).len(), 1);
    }
}
