//! Chunk arithmetic and file IO.
//!
//! Chunk `i` covers bytes `[i * chunk_size, min((i + 1) * chunk_size, size))`.

use std::io::SeekFrom;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const HASH_BUFFER: usize = 64 * 1024;

/// Number of chunks for a file of `size` bytes. Empty files have none.
pub fn total_chunks(size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// Length in bytes of chunk `index`.
pub fn chunk_len(size: u64, chunk_size: u32, index: u32) -> u64 {
    let start = index as u64 * chunk_size as u64;
    size.saturating_sub(start).min(chunk_size as u64)
}

/// Bytes covered by the first `completed` chunks.
pub fn bytes_for_chunks(size: u64, chunk_size: u32, completed: u32) -> u64 {
    (completed as u64 * chunk_size as u64).min(size)
}

/// SHA-256 of the whole file, hex encoded.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Read chunk `index` from `path`.
pub async fn read_chunk(path: &Path, index: u32, chunk_size: u32) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let len = chunk_len(size, chunk_size, index) as usize;
    file.seek(SeekFrom::Start(index as u64 * chunk_size as u64)).await?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data).await?;
    Ok(data)
}

/// Write `data` as chunk `index` of `path`, creating the file if needed.
pub async fn write_chunk(path: &Path, index: u32, chunk_size: u32, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).write(true).truncate(false).open(path).await?;
    file.seek(SeekFrom::Start(index as u64 * chunk_size as u64)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_chunk_math() {
        assert_eq!(total_chunks(0, 100), 0);
        assert_eq!(total_chunks(1, 100), 1);
        assert_eq!(total_chunks(100, 100), 1);
        assert_eq!(total_chunks(101, 100), 2);
        assert_eq!(chunk_len(250, 100, 2), 50);
        assert_eq!(chunk_len(250, 100, 3), 0);
        assert_eq!(bytes_for_chunks(250, 100, 3), 250);
    }

    #[tokio::test]
    async fn test_write_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.part");
        write_chunk(&path, 1, 4, b"5678").await.unwrap();
        write_chunk(&path, 0, 4, b"1234").await.unwrap();
        write_chunk(&path, 2, 4, b"9").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"123456789");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chunks_reassemble(content in proptest::collection::vec(any::<u8>(), 0..2048), chunk_size in 1u32..300) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let src = dir.path().join("src");
                let dst = dir.path().join("dst");
                std::fs::write(&src, &content).unwrap();
                std::fs::write(&dst, b"").unwrap();

                let total = total_chunks(content.len() as u64, chunk_size);
                let mut joined = Vec::new();
                for i in 0..total {
                    let chunk = read_chunk(&src, i, chunk_size).await.unwrap();
                    write_chunk(&dst, i, chunk_size, &chunk).await.unwrap();
                    joined.extend_from_slice(&chunk);
                }

                assert_eq!(&joined, &content);
                assert_eq!(
                    sha256_file(&src).await.unwrap(),
                    sha256_file(&dst).await.unwrap()
                );
            });
        }
    }
}
