//! Binary embedding matrix files.
//!
//! Layout: 8-byte magic, row count (u64 LE), dimension (u64 LE), then
//! row-major f32 LE values. Files are written to a temp sibling and renamed
//! into place so readers never observe a partial write.

use super::Embedding;
use crate::error::{Nl2SqlError, Result};
use std::io::Write;
use std::path::Path;

const MAGIC: &[u8; 8] = b"NLEMB001";
const HEADER_LEN: usize = 24;

pub fn f32_vec_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

pub fn write_matrix(path: &Path, rows: &[Embedding]) -> Result<()> {
    let dimension = rows.first().map_or(0, |r| r.len());
    if rows.iter().any(|r| r.len() != dimension) {
        return Err(Nl2SqlError::Cache(format!(
            "Refusing to write ragged matrix to {}",
            path.display()
        )));
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + rows.len() * dimension * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&(dimension as u64).to_le_bytes());
    for row in rows {
        bytes.extend_from_slice(&f32_vec_to_bytes(row));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Nl2SqlError::Cache(format!("Failed to move cache into {}: {}", path.display(), e))
    })
}

pub fn read_matrix(path: &Path) -> Result<Vec<Embedding>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
        return Err(Nl2SqlError::Cache(format!(
            "{} is not an embedding cache file",
            path.display()
        )));
    }
    let rows = read_u64(&bytes, 8) as usize;
    let dimension = read_u64(&bytes, 16) as usize;
    let expected = rows
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(HEADER_LEN));
    if expected != Some(bytes.len()) {
        return Err(Nl2SqlError::Cache(format!(
            "{} is truncated: header says {}x{}, file has {} bytes",
            path.display(),
            rows,
            dimension,
            bytes.len()
        )));
    }
    if dimension == 0 {
        return Ok(vec![Vec::new(); rows]);
    }

    Ok(bytes[HEADER_LEN..]
        .chunks_exact(dimension * 4)
        .map(bytes_to_f32_vec)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.emb");
        let rows = vec![vec![0.1f32, -2.5, f32::MIN_POSITIVE], vec![1.0, 0.0, 3.3e-7]];
        write_matrix(&path, &rows).unwrap();
        assert_eq!(read_matrix(&path).unwrap(), rows);
    }

    #[test]
    fn test_rejects_garbage_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.emb");
        std::fs::write(&path, b"not a matrix at all, clearly").unwrap();
        assert!(matches!(read_matrix(&path), Err(Nl2SqlError::Cache(_))));

        write_matrix(&path, &[vec![1.0, 2.0]]).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read_matrix(&path), Err(Nl2SqlError::Cache(_))));
    }

    #[test]
    fn test_rejects_ragged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.emb");
        assert!(write_matrix(&path, &[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(!path.exists());
    }
}
