use crate::extract::Format;
use crate::model::TensorRecord;
use regex::Regex;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const LOG_SUFFIX: &str = ".keys.log";

/// Model files directly inside `dir`, sorted by name. Subdirectories are not
/// searched.
pub fn find_model_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if is_model_file(&path) && entry.file_type()?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn is_model_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| Format::EXTENSIONS.contains(&ext))
}

/// `<model file name>.keys.log`, next to the model or inside `output_dir`.
pub fn log_path(model: &Path, output_dir: Option<&Path>) -> PathBuf {
    let mut name: OsString = model.file_name().map(OsString::from).unwrap_or_default();
    name.push(LOG_SUFFIX);
    match output_dir {
        Some(dir) => dir.join(name),
        None => model.with_file_name(name),
    }
}

/// Writes one line per record, skipping names the filter rejects. Returns
/// the number of lines written.
pub fn write_records<W: Write>(
    out: W,
    records: &[TensorRecord],
    filter: Option<&Regex>,
) -> io::Result<usize> {
    let mut out = BufWriter::new(out);
    let mut written = 0;
    for record in records {
        if filter.is_some_and(|re| !re.is_match(&record.name)) {
            continue;
        }
        writeln!(out, "{record}")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

pub fn write_log(
    path: &Path,
    records: &[TensorRecord],
    filter: Option<&Regex>,
) -> io::Result<usize> {
    write_records(fs::File::create(path)?, records, filter)
}
