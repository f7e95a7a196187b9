use anyhow::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Where a model file's bytes come from.
pub trait Storage {
    type Reader: io::Read + io::Seek;

    fn display(&self) -> String;
    fn len(&mut self) -> Result<u64, Error>;
    fn reader(&mut self) -> Result<&mut Self::Reader, Error>;
}

pub struct FileStorage {
    path: PathBuf,
    reader: Option<io::BufReader<fs::File>>,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileStorage {
            path: path.as_ref().to_path_buf(),
            reader: None,
        }
    }
}

impl Storage for FileStorage {
    type Reader = io::BufReader<fs::File>;

    fn display(&self) -> String {
        self.path.display().to_string()
    }

    fn len(&mut self) -> Result<u64, Error> {
        Ok(self.reader()?.get_ref().metadata()?.len())
    }

    fn reader(&mut self) -> Result<&mut Self::Reader, Error> {
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => io::BufReader::new(fs::File::open(&self.path)?),
        };
        Ok(self.reader.insert(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn reads_through_one_cached_handle() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let mut storage = FileStorage::new(file.path());
        assert_eq!(storage.len().unwrap(), 10);
        let mut head = [0u8; 4];
        storage.reader().unwrap().read_exact(&mut head).unwrap();
        assert_eq!(&head, b"0123");
        let mut rest = String::new();
        storage.reader().unwrap().read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "456789");
        assert_eq!(storage.display(), file.path().display().to_string());
    }

    #[test]
    fn missing_files_fail_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("absent.safetensors"));
        assert!(storage.len().is_err());
        assert!(storage.reader().is_err());
    }
}
