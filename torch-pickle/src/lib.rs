//! Metadata-only reader for PyTorch checkpoints.
//!
//! `torch.save` writes either a zip archive holding `data.pkl` next to the
//! raw storages, or (before torch 1.6) a stream of pickles followed by the
//! storages. Both are read here without touching the storages: tensors come
//! back as [`Tensor`] descriptions carrying dtype, shape and storage location.

use anyhow::{Error, anyhow, bail, ensure};
use std::io::{BufReader, Read, Seek, SeekFrom};
use zip::ZipArchive;

pub mod machine;
pub mod numpy;
pub mod torch;
pub mod value;

pub use machine::{Machine, loads};
pub use torch::{Dtype, Storage, Tensor};
pub use value::{Global, Object, Value};

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// First pickle of a legacy `torch.save` stream.
const LEGACY_MAGIC: i128 = 0x1950a86a20f9469cfc6c;

/// Reads the object stored in a checkpoint, dispatching on the zip magic.
pub fn read_checkpoint<R: Read + Seek>(mut io: R) -> Result<Value, Error> {
    io.seek(SeekFrom::Start(0))?;
    let mut magic = Vec::with_capacity(ZIP_MAGIC.len());
    (&mut io).take(ZIP_MAGIC.len() as u64).read_to_end(&mut magic)?;
    io.seek(SeekFrom::Start(0))?;

    if magic == ZIP_MAGIC {
        read_zip(io)
    } else {
        read_legacy(BufReader::new(io))
    }
}

fn read_zip<R: Read + Seek>(io: R) -> Result<Value, Error> {
    let mut archive = ZipArchive::new(io)?;
    let pickle_name = archive
        .file_names()
        .filter(|name| *name == "data.pkl" || name.ends_with("/data.pkl"))
        .min_by_key(|name| name.len())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("zip archive has no data.pkl; is this a torch checkpoint?"))?;
    let prefix = &pickle_name[..pickle_name.len() - "data.pkl".len()];

    if let Ok(mut member) = archive.by_name(&format!("{prefix}byteorder")) {
        let mut order = String::new();
        member.read_to_string(&mut order)?;
        ensure!(
            order.trim() == "little",
            "unsupported checkpoint byte order {:?}",
            order.trim()
        );
    }

    let mut machine = Machine::new(BufReader::new(archive.by_name(&pickle_name)?));
    machine
        .load()?
        .ok_or_else(|| anyhow!("{pickle_name} is empty"))
}

fn read_legacy<R: Read>(io: BufReader<R>) -> Result<Value, Error> {
    let mut machine = Machine::new(io);
    let Some(first) = machine.load()? else {
        bail!("checkpoint is empty");
    };
    if first.as_i128() != Some(LEGACY_MAGIC) {
        // A bare pickle rather than a torch.save stream.
        return Ok(first);
    }

    let protocol = machine
        .load()?
        .ok_or_else(|| anyhow!("legacy checkpoint ends after its magic number"))?;
    // Decoded values may be cyclic, so only their type is ever printed.
    match protocol.as_i128() {
        Some(1001) => (),
        Some(other) => bail!("unsupported legacy checkpoint protocol {other}"),
        None => bail!(
            "legacy checkpoint protocol is a {}, not an integer",
            protocol.type_name()
        ),
    }
    let _sys_info = machine
        .load()?
        .ok_or_else(|| anyhow!("legacy checkpoint ends after its protocol version"))?;
    machine
        .load()?
        .ok_or_else(|| anyhow!("legacy checkpoint has no object"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn unicode(s: &str) -> Vec<u8> {
        let mut out = vec![b'X'];
        out.extend((s.len() as u32).to_le_bytes());
        out.extend(s.as_bytes());
        out
    }

    fn tensor(storage_class: &str, shape: &[u8]) -> Vec<u8> {
        let numel = shape.iter().map(|&d| d as u32).product::<u32>() as u8;
        let mut out = b"ctorch._utils\n_rebuild_tensor_v2\n((".to_vec();
        out.extend(unicode("storage"));
        out.extend(format!("ctorch\n{storage_class}\n").as_bytes());
        out.extend(unicode("0"));
        out.extend(unicode("cpu"));
        out.extend([b'K', numel, b't', b'Q', b'K', 0, b'(']);
        for &dim in shape {
            out.extend([b'K', dim]);
        }
        out.extend(b"t(");
        for _ in shape {
            out.extend([b'K', 1]);
        }
        out.extend(b"t\x89ccollections\nOrderedDict\n)RtR");
        out
    }

    fn checkpoint_pickle() -> Vec<u8> {
        let mut out = b"\x80\x02}(".to_vec();
        out.extend(unicode("state_dict"));
        out.extend(b"ccollections\nOrderedDict\n)R(");
        out.extend(unicode("w"));
        out.extend(tensor("FloatStorage", &[2, 3]));
        out.extend(unicode("b"));
        out.extend(tensor("HalfStorage", &[3]));
        out.extend(b"u");
        out.extend(unicode("epoch"));
        out.extend(b"K\x03u.");
        out
    }

    fn zip_checkpoint(order: &str) -> Cursor<Vec<u8>> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file("archive/data.pkl", options).unwrap();
        zip.write_all(&checkpoint_pickle()).unwrap();
        zip.start_file("archive/byteorder", options).unwrap();
        zip.write_all(order.as_bytes()).unwrap();
        zip.start_file("archive/data/0", options).unwrap();
        zip.write_all(&[0u8; 24]).unwrap();
        let mut cursor = zip.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    fn state_dict(value: &Value) -> Vec<(Value, Value)> {
        let root = value.dict_items().unwrap();
        let (_, state_dict) = root
            .iter()
            .find(|(k, _)| k.as_str() == Some("state_dict"))
            .unwrap();
        state_dict.dict_items().unwrap()
    }

    #[test]
    fn reads_zip_checkpoints() {
        let value = read_checkpoint(zip_checkpoint("little")).unwrap();
        let tensors = state_dict(&value);
        assert_eq!(tensors.len(), 2);
        let w = tensors[0].1.as_tensor().unwrap();
        assert_eq!(w.dtype, Dtype::F32);
        assert_eq!(w.shape, vec![2, 3]);
        let b = tensors[1].1.as_tensor().unwrap();
        assert_eq!(b.dtype, Dtype::F16);
        assert_eq!(b.shape, vec![3]);
    }

    #[test]
    fn rejects_big_endian_zip_checkpoints() {
        let err = read_checkpoint(zip_checkpoint("big")).unwrap_err();
        assert!(err.to_string().contains("byte order"));
    }

    #[test]
    fn reads_legacy_streams() {
        let mut bytes = legacy_magic();
        bytes.extend(b"\x80\x02M\xe9\x03.");
        bytes.extend(b"\x80\x02}(");
        bytes.extend(unicode("little_endian"));
        bytes.extend(b"\x88u.");
        bytes.extend(checkpoint_pickle());
        bytes.extend(b"\x80\x02]q\x00.");
        let value = read_checkpoint(Cursor::new(bytes)).unwrap();
        assert_eq!(state_dict(&value).len(), 2);
    }

    #[test]
    fn reads_bare_pickles() {
        let value = read_checkpoint(Cursor::new(checkpoint_pickle())).unwrap();
        assert_eq!(state_dict(&value).len(), 2);
    }

    #[test]
    fn reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&checkpoint_pickle()).unwrap();
        let value = read_checkpoint(std::fs::File::open(file.path()).unwrap()).unwrap();
        assert_eq!(value.dict_items().unwrap().len(), 2);
    }

    fn legacy_magic() -> Vec<u8> {
        b"\x80\x02\x8a\x0a\x6c\xfc\x9c\x46\xf9\x20\x6a\xa8\x50\x19.".to_vec()
    }

    #[test]
    fn self_containing_protocol_values_fail_cleanly() {
        // l = []; l.append(l)
        let mut bytes = legacy_magic();
        bytes.extend(b"\x80\x02]q\x00h\x00a.");
        let err = read_checkpoint(Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("list"), "{err}");
    }

    #[test]
    fn unexpected_legacy_protocols_are_rejected() {
        let mut bytes = legacy_magic();
        bytes.extend(b"\x80\x02M\xe8\x03.");
        let err = read_checkpoint(Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("1000"), "{err}");
    }

    #[test]
    fn empty_and_foreign_files_fail() {
        assert!(read_checkpoint(Cursor::new(Vec::new())).is_err());
        assert!(read_checkpoint(Cursor::new(b"not a pickle".to_vec())).is_err());

        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("readme.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"hello").unwrap();
        let mut cursor = zip.finish().unwrap();
        cursor.set_position(0);
        let err = read_checkpoint(cursor).unwrap_err();
        assert!(err.to_string().contains("data.pkl"));
    }
}
