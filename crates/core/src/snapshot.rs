//! Parameter snapshots: `name\n`, the raw native-endian f32 payload, `\n`,
//! repeated. There is no length header; readers know the shape they expect.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{NnError, Result};

const WORD: usize = std::mem::size_of::<f32>();

pub fn write_record<W: Write>(writer: &mut W, name: &str, values: &[f32]) -> Result<()> {
    if name.is_empty() || name.contains('\n') {
        return Err(NnError::Graph(format!("snapshot name {name:?} must be one non-empty line")));
    }
    writer.write_all(name.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.write_all(bytemuck::cast_slice(values))?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Writes every record to `path`, replacing the file.
pub fn save(path: impl AsRef<Path>, records: &[(&str, &[f32])]) -> Result<()> {
    let mut bytes = Vec::new();
    for (name, values) in records {
        write_record(&mut bytes, name, values)?;
    }
    fs::write(path.as_ref(), bytes)?;
    Ok(())
}

pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).map_err(|e| NnError::ResourceNotFound(format!("snapshot {}: {}", path.display(), e)))
}

/// Finds the record called `name` and decodes `elements` floats from it.
///
/// A name line counts only at the start of the stream or right after a
/// newline, and only if its payload is followed by the record separator.
pub fn find_record(bytes: &[u8], name: &str, elements: usize) -> Result<Vec<f32>> {
    let mut needle = name.as_bytes().to_vec();
    needle.push(b'\n');
    let payload_len = elements * WORD;
    let mut truncated = false;

    let mut start = 0;
    while let Some(found) = find(&bytes[start..], &needle) {
        let pos = start + found;
        start = pos + 1;
        if pos > 0 && bytes[pos - 1] != b'\n' {
            continue;
        }
        let body = pos + needle.len();
        let end = body + payload_len;
        if end > bytes.len() {
            truncated = true;
            continue;
        }
        if end < bytes.len() && bytes[end] != b'\n' {
            continue;
        }
        return Ok(bytes[body..end]
            .chunks_exact(WORD)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect());
    }

    if truncated {
        Err(NnError::Range(format!(
            "snapshot record `{name}` holds fewer than {elements} values"
        )))
    } else {
        Err(NnError::ResourceNotFound(format!("snapshot has no record `{name}`")))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_round_trip_by_name() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, "w1", &[1.0, -2.5, 3.25]).unwrap();
        write_record(&mut bytes, "b1", &[0.5]).unwrap();

        assert_eq!(find_record(&bytes, "b1", 1).unwrap(), vec![0.5]);
        assert_eq!(find_record(&bytes, "w1", 3).unwrap(), vec![1.0, -2.5, 3.25]);
    }

    #[test]
    fn name_must_start_a_line() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, "aw1", &[1.0]).unwrap();
        write_record(&mut bytes, "w1", &[2.0]).unwrap();
        assert_eq!(find_record(&bytes, "w1", 1).unwrap(), vec![2.0]);
    }

    #[test]
    fn missing_and_truncated_records() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, "w1", &[1.0, 2.0]).unwrap();
        assert!(matches!(find_record(&bytes, "w2", 2), Err(NnError::ResourceNotFound(_))));
        assert!(matches!(find_record(&bytes, "w1", 8), Err(NnError::Range(_))));
    }

    #[test]
    fn multi_line_names_are_rejected() {
        let mut bytes = Vec::new();
        assert!(write_record(&mut bytes, "a\nb", &[1.0]).is_err());
        assert!(bytes.is_empty());
    }

    #[test]
    fn save_writes_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.snap");
        save(&path, &[("w1", &[1.0, 2.0][..]), ("b1", &[3.0][..])]).unwrap();
        let bytes = read_file(&path).unwrap();
        assert_eq!(bytes.len(), 3 + 8 + 1 + 3 + 4 + 1);
        assert_eq!(find_record(&bytes, "b1", 1).unwrap(), vec![3.0]);
        assert!(matches!(read_file(dir.path().join("none")), Err(NnError::ResourceNotFound(_))));
    }
}
