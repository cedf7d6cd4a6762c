use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::crypto::{chunk_aad, encrypt_framed};
use crate::{Error, Result};

/// One encrypted, numbered slice of a file. Part numbers start at 1.
#[derive(Debug)]
pub struct Chunk {
    pub part_number: u32,
    pub plaintext_len: u64,
    pub digest: String,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(part_number: u32, plaintext_len: u64, data: Vec<u8>) -> Self {
        let digest = blake3::hash(&data).to_hex().to_string();
        Self {
            part_number,
            plaintext_len,
            digest,
            data,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Yields the ordered encrypted chunks of one input. `Ok(None)` means exhausted.
pub trait ChunkSource: Send {
    fn set_max_chunk_size(&mut self, bytes: u64);

    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Chunk>>> + Send + 'a>>;

    fn dispose(&mut self) {}
}

pub struct EncryptedFileSource {
    file: Option<tokio::fs::File>,
    file_id: String,
    master_key: [u8; 32],
    max_chunk_size: u64,
    next_part: u32,
}

impl EncryptedFileSource {
    pub async fn open(
        path: &Path,
        file_id: impl Into<String>,
        master_key: [u8; 32],
        initial_chunk_size: u64,
    ) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            file: Some(file),
            file_id: file_id.into(),
            master_key,
            max_chunk_size: initial_chunk_size.max(1),
            next_part: 1,
        })
    }
}

impl ChunkSource for EncryptedFileSource {
    fn set_max_chunk_size(&mut self, bytes: u64) {
        self.max_chunk_size = bytes.max(1);
    }

    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Chunk>>> + Send + 'a>> {
        Box::pin(async move {
            let file = self.file.as_mut().ok_or_else(|| Error::Shutdown {
                message: "chunk source already disposed".to_string(),
            })?;

            let want = usize::try_from(self.max_chunk_size).map_err(|_| Error::InvalidConfig {
                message: format!("chunk size too large: {}", self.max_chunk_size),
            })?;
            let mut buf = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Ok(None);
            }
            buf.truncate(filled);

            let part_number = self.next_part;
            let aad = chunk_aad(&self.file_id, part_number);
            let encrypted = encrypt_framed(&self.master_key, aad.as_bytes(), &buf)?;
            self.next_part += 1;
            Ok(Some(Chunk::new(part_number, filled as u64, encrypted)))
        })
    }

    fn dispose(&mut self) {
        if self.file.take().is_some() {
            debug!(
                event = "source.disposed",
                file_id = %self.file_id,
                parts = self.next_part - 1,
                "source.disposed"
            );
        }
    }
}

/// Serves an in-memory payload as-is, one slice per chunk.
#[derive(Debug, Default)]
pub struct InMemorySource {
    bytes: Vec<u8>,
    offset: usize,
    max_chunk_size: u64,
    next_part: u32,
    requested_sizes: Vec<u64>,
    disposed: bool,
}

impl InMemorySource {
    pub fn new(bytes: Vec<u8>, initial_chunk_size: u64) -> Self {
        Self {
            bytes,
            offset: 0,
            max_chunk_size: initial_chunk_size.max(1),
            next_part: 1,
            requested_sizes: Vec::new(),
            disposed: false,
        }
    }

    /// Chunk sizes in effect for each slice handed out so far.
    pub fn requested_sizes(&self) -> &[u64] {
        &self.requested_sizes
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl ChunkSource for InMemorySource {
    fn set_max_chunk_size(&mut self, bytes: u64) {
        self.max_chunk_size = bytes.max(1);
    }

    fn next_chunk<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Chunk>>> + Send + 'a>> {
        Box::pin(async move {
            if self.disposed {
                return Err(Error::Shutdown {
                    message: "chunk source already disposed".to_string(),
                });
            }
            if self.offset >= self.bytes.len() {
                return Ok(None);
            }
            let take = usize::try_from(self.max_chunk_size)
                .unwrap_or(usize::MAX)
                .min(self.bytes.len() - self.offset);
            let data = self.bytes[self.offset..self.offset + take].to_vec();
            self.offset += take;
            self.requested_sizes.push(self.max_chunk_size);

            let part_number = self.next_part;
            self.next_part += 1;
            Ok(Some(Chunk::new(part_number, take as u64, data)))
        })
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{FRAMING_OVERHEAD_BYTES, decrypt_framed};

    #[tokio::test]
    async fn file_source_follows_chunk_size_changes() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("a.bin");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let key = [9u8; 32];
        let mut source = EncryptedFileSource::open(&path, "f_1", key, 4096)
            .await
            .unwrap();

        let first = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.part_number, 1);
        assert_eq!(first.plaintext_len, 4096);
        assert_eq!(first.len() as usize, 4096 + FRAMING_OVERHEAD_BYTES);

        source.set_max_chunk_size(1000);
        let second = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.part_number, 2);
        assert_eq!(second.plaintext_len, 1000);

        source.set_max_chunk_size(1 << 20);
        let third = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(third.plaintext_len, 10_000 - 4096 - 1000);
        assert!(source.next_chunk().await.unwrap().is_none());

        let aad = chunk_aad("f_1", 2);
        let plain = decrypt_framed(&key, aad.as_bytes(), &second.data).unwrap();
        assert_eq!(plain, &payload[4096..5096]);

        source.dispose();
        assert!(source.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn in_memory_source_numbers_parts() {
        let mut source = InMemorySource::new(vec![1u8; 25], 10);
        let mut parts = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            parts.push((chunk.part_number, chunk.len()));
        }
        assert_eq!(parts, vec![(1, 10), (2, 10), (3, 5)]);
        assert_eq!(source.requested_sizes(), &[10, 10, 10]);
    }
}
