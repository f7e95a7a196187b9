use crate::checkpoint;
use crate::model::TensorRecord;
use crate::safetensors;
use crate::storage::{FileStorage, Storage};
use anyhow::anyhow;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Safetensors,
    Checkpoint,
}

impl Format {
    pub const EXTENSIONS: [&'static str; 2] = ["ckpt", "safetensors"];

    /// Picks the format from the file extension. Matching is case-sensitive.
    pub fn from_path(path: &Path) -> Result<Format, ExtractError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("safetensors") => Ok(Format::Safetensors),
            Some("ckpt") => Ok(Format::Checkpoint),
            _ => Err(ExtractError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{}: {cause:#}", path.display())]
    Unreadable {
        path: PathBuf,
        cause: anyhow::Error,
    },
    #[error("{}: not a .ckpt or .safetensors file", path.display())]
    UnsupportedFormat { path: PathBuf },
    #[error("{}: cancelled before it was processed", path.display())]
    Cancelled { path: PathBuf },
}

impl ExtractError {
    pub fn path(&self) -> &Path {
        match self {
            ExtractError::Unreadable { path, .. }
            | ExtractError::UnsupportedFormat { path }
            | ExtractError::Cancelled { path } => path,
        }
    }

    /// The underlying failure, without the path prefix.
    pub fn cause(&self) -> String {
        match self {
            ExtractError::Unreadable { cause, .. } => format!("{cause:#}"),
            ExtractError::UnsupportedFormat { .. } => "not a .ckpt or .safetensors file".into(),
            ExtractError::Cancelled { .. } => "cancelled".into(),
        }
    }
}

/// Lists the tensors of one model file, in the order the file stores them.
pub fn extract(path: &Path, format: Format) -> Result<Vec<TensorRecord>, ExtractError> {
    let mut storage = FileStorage::new(path);
    extract_from(&mut storage, format).map_err(|cause| ExtractError::Unreadable {
        path: path.to_path_buf(),
        cause,
    })
}

pub fn extract_from<S: Storage>(
    storage: &mut S,
    format: Format,
) -> Result<Vec<TensorRecord>, anyhow::Error> {
    let records = match format {
        Format::Safetensors => {
            let len = storage.len()?;
            let header = safetensors::read_header(storage.reader()?, len)?;
            for problem in header.validate_offsets() {
                warn!(file = %storage.display(), "{problem}");
            }
            debug!(
                file = %storage.display(),
                header_bytes = header.header_len,
                metadata = ?header.metadata,
                data = %human_format::Formatter::new()
                    .with_units("B")
                    .format(header.data_len as f64),
                "decoded safetensors header"
            );
            header.records()
        }
        Format::Checkpoint => {
            let root = checkpoint::load(storage.reader()?)?;
            checkpoint::walk(&root)
        }
    };
    debug!(file = %storage.display(), tensors = records.len(), "extracted");
    Ok(records)
}

/// Extracts every path, dispatching on its extension.
pub fn extract_all(
    paths: &[PathBuf],
    jobs: usize,
    cancel: &AtomicBool,
) -> Vec<Result<Vec<TensorRecord>, ExtractError>> {
    for_each_file(paths, jobs, cancel, |path| {
        extract(path, Format::from_path(path)?)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Runs `work` over `paths` on up to `jobs` threads and returns the results
/// in input order. Files not yet started when `cancel` is set come back as
/// [`ExtractError::Cancelled`]; a panic in `work` fails only its own file.
pub fn for_each_file<T, F>(
    paths: &[PathBuf],
    jobs: usize,
    cancel: &AtomicBool,
    work: F,
) -> Vec<Result<T, ExtractError>>
where
    T: Send,
    F: Fn(&Path) -> Result<T, ExtractError> + Sync,
{
    let slots: Vec<Mutex<Option<Result<T, ExtractError>>>> =
        paths.iter().map(|_| Mutex::new(None)).collect();
    let next = AtomicUsize::new(0);
    let workers = jobs.clamp(1, paths.len().max(1));

    let run = || {
        loop {
            let idx = next.fetch_add(1, Ordering::Relaxed);
            let Some(path) = paths.get(idx) else {
                break;
            };
            let result = if cancel.load(Ordering::SeqCst) {
                Err(ExtractError::Cancelled { path: path.clone() })
            } else {
                panic::catch_unwind(AssertUnwindSafe(|| work(path))).unwrap_or_else(|payload| {
                    Err(ExtractError::Unreadable {
                        path: path.clone(),
                        cause: anyhow!("panicked: {}", panic_message(payload.as_ref())),
                    })
                })
            };
            *slots[idx].lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        }
    };
    if workers == 1 {
        run();
    } else {
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(run);
            }
        });
    }

    slots
        .into_iter()
        .zip(paths)
        .map(|(slot, path)| {
            slot.into_inner()
                .unwrap_or_else(PoisonError::into_inner)
                .unwrap_or_else(|| Err(ExtractError::Cancelled { path: path.clone() }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn safetensors_file(dir: &Path, name: &str, header: &str, data_len: usize) -> PathBuf {
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend(header.as_bytes());
        bytes.resize(bytes.len() + data_len, 0);
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn lines(records: &[TensorRecord]) -> Vec<String> {
        records.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn formats_follow_the_extension() {
        assert_eq!(
            Format::from_path(Path::new("a/model.safetensors")).unwrap(),
            Format::Safetensors
        );
        assert_eq!(
            Format::from_path(Path::new("model.ckpt")).unwrap(),
            Format::Checkpoint
        );
        assert!(matches!(
            Format::from_path(Path::new("model.CKPT")),
            Err(ExtractError::UnsupportedFormat { .. })
        ));
        assert!(Format::from_path(Path::new("model")).is_err());
    }

    #[test]
    fn extracts_safetensors_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = safetensors_file(
            dir.path(),
            "m.safetensors",
            r#"{"b":{"dtype":"F32","shape":[2,3],"data_offsets":[0,24]},"a":{"dtype":"I64","shape":[],"data_offsets":[24,32]}}"#,
            32,
        );
        let records = extract(&path, Format::Safetensors).unwrap();
        assert_eq!(lines(&records), ["b: F32 (2, 3)", "a: I64 ()"]);
    }

    #[test]
    fn bad_offsets_still_produce_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = safetensors_file(
            dir.path(),
            "m.safetensors",
            r#"{"w":{"dtype":"F16","shape":[4],"data_offsets":[0,100]}}"#,
            8,
        );
        let records = extract(&path, Format::Safetensors).unwrap();
        assert_eq!(lines(&records), ["w: F16 (4)"]);
    }

    #[test]
    fn extracts_pickled_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.ckpt");
        // pickle.dumps({"state_dict": {"step": 3}}, protocol=2)
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"\x80\x02}q\x00X\n\x00\x00\x00state_dictq\x01}q\x02")
            .unwrap();
        file.write_all(b"X\x04\x00\x00\x00stepq\x03K\x03ss.").unwrap();
        drop(file);

        let records = extract(&path, Format::Checkpoint).unwrap();
        assert_eq!(lines(&records), ["step: unknown ()"]);
    }

    #[test]
    fn failures_carry_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = safetensors_file(dir.path(), "m.safetensors", "{not json", 0);
        let err = extract(&path, Format::Safetensors).unwrap_err();
        assert_eq!(err.path(), path);
        assert!(matches!(err, ExtractError::Unreadable { .. }));
        assert!(err.to_string().starts_with(&path.display().to_string()));
        assert!(err.cause().contains("invalid header"));

        let missing = dir.path().join("gone.ckpt");
        assert!(matches!(
            extract(&missing, Format::Checkpoint),
            Err(ExtractError::Unreadable { .. })
        ));
    }

    #[test]
    fn one_bad_file_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let header = r#"{"w":{"dtype":"BF16","shape":[2],"data_offsets":[0,4]}}"#;
        let paths = vec![
            safetensors_file(dir.path(), "1.safetensors", header, 4),
            safetensors_file(dir.path(), "2.safetensors", "{\"w\":", 0),
            safetensors_file(dir.path(), "3.safetensors", header, 4),
        ];
        for jobs in [1, 3] {
            let results = extract_all(&paths, jobs, &AtomicBool::new(false));
            assert_eq!(results.len(), 3);
            assert_eq!(lines(results[0].as_ref().unwrap()), ["w: BF16 (2)"]);
            assert_eq!(results[1].as_ref().unwrap_err().path(), paths[1]);
            assert_eq!(lines(results[2].as_ref().unwrap()), ["w: BF16 (2)"]);
        }
    }

    #[test]
    fn cancelled_batches_skip_remaining_files() {
        let paths: Vec<PathBuf> = ["a.ckpt", "b.ckpt", "c.ckpt"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let cancel = AtomicBool::new(false);
        let results = for_each_file(&paths, 1, &cancel, |path| {
            cancel.store(true, Ordering::SeqCst);
            Ok(path.to_path_buf())
        });
        assert_eq!(results[0].as_ref().unwrap(), &paths[0]);
        for (result, path) in results[1..].iter().zip(&paths[1..]) {
            match result {
                Err(ExtractError::Cancelled { path: skipped }) => assert_eq!(skipped, path),
                other => panic!("expected cancellation, got {other:?}"),
            }
        }
    }

    #[test]
    fn a_panicking_file_fails_alone() {
        let paths: Vec<PathBuf> = ["a.ckpt", "b.ckpt", "c.ckpt"]
            .iter()
            .map(PathBuf::from)
            .collect();
        for jobs in [1, 2] {
            let results = for_each_file(&paths, jobs, &AtomicBool::new(false), |path| {
                if path == Path::new("b.ckpt") {
                    panic!("attempt to multiply with overflow");
                }
                Ok(path.to_path_buf())
            });
            assert_eq!(results[0].as_ref().unwrap(), &paths[0]);
            match &results[1] {
                Err(err @ ExtractError::Unreadable { path, .. }) => {
                    assert_eq!(path, &paths[1]);
                    assert!(err.cause().contains("multiply with overflow"));
                }
                other => panic!("expected a failure, got {other:?}"),
            }
            assert_eq!(results[2].as_ref().unwrap(), &paths[2]);
        }
    }

    #[test]
    fn unsupported_paths_are_reported_in_place() {
        let results = extract_all(
            &[PathBuf::from("notes.txt")],
            2,
            &AtomicBool::new(false),
        );
        assert!(matches!(
            results[0],
            Err(ExtractError::UnsupportedFormat { .. })
        ));
    }
}
