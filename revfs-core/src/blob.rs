//! Content object storage
//!
//! File contents are stored once per distinct content, keyed by the SHA-256
//! of the plain bytes and zstd-compressed on disk:
//!
//! ```text
//! objects/{hash[0..2]}/{hash[2..]}
//! ```
//!
//! Writers stream into a temp file inside a transaction's staging directory;
//! a finished blob only moves into `objects/` when its transaction commits.
//! Readers stream the content back as a sequence of chunks.

use bytes::{Bytes, BytesMut};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::object::{ObjectId, TextRep};

type Decoder = zstd::stream::read::Decoder<'static, BufReader<File>>;
type Encoder = zstd::stream::write::Encoder<'static, BufWriter<File>>;

/// Content-addressed store of compressed file contents
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    level: i32,
    fsync: bool,
}

impl BlobStore {
    /// Open the object directory, creating it when missing
    pub fn open(root: PathBuf, level: i32, fsync: bool) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root, level, fsync })
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.object_path(id).exists()
    }

    /// Start a new content write; the temp file lives in `staging_dir`
    pub fn writer(&self, staging_dir: &Path) -> Result<BlobWriter> {
        fs::create_dir_all(staging_dir)?;
        let tmp_path = staging_dir.join(format!("{}.tmp", uuid::Uuid::new_v4()));
        let file = File::create(&tmp_path)?;
        let encoder = Encoder::new(BufWriter::new(file), self.level)?;
        Ok(BlobWriter {
            encoder: Some(encoder),
            tmp_path,
            staging_dir: staging_dir.to_path_buf(),
            sha256: Sha256::new(),
            sha1: Sha1::new(),
            size: 0,
            fsync: self.fsync,
        })
    }

    /// Move a finished staged blob into the object store
    ///
    /// Content addressing makes this idempotent: an object that is already
    /// present is left alone and the staged copy is dropped. `staged` must
    /// live on the same filesystem as the object directory.
    pub fn import(&self, staged: &Path, id: &ObjectId) -> Result<()> {
        let path = self.object_path(id);
        if path.exists() {
            if staged.exists() {
                fs::remove_file(staged)?;
            }
            return Ok(());
        }
        let parent = path
            .parent()
            .ok_or_else(|| FsError::Corrupt(format!("bad object path for {}", id)))?;
        fs::create_dir_all(parent)?;
        fs::rename(staged, &path)?;
        if self.fsync {
            File::open(parent)?.sync_all()?;
        }
        Ok(())
    }

    /// Write a whole buffer straight into the object store
    pub fn put(&self, data: &[u8], staging_dir: &Path) -> Result<TextRep> {
        let mut writer = self.writer(staging_dir)?;
        writer.write_all(data)?;
        let (rep, staged) = writer.finish()?;
        self.import(&staged, &rep.blob)?;
        Ok(rep)
    }

    fn open_object(&self, id: &ObjectId) -> Result<Decoder> {
        let path = self.object_path(id);
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                FsError::Corrupt(format!("content object {} is missing", id))
            }
            _ => FsError::Io(e),
        })?;
        Ok(Decoder::new(file)?)
    }

    /// Stream the content described by `rep`
    pub fn chunks(&self, rep: Option<&TextRep>, chunk_size: usize) -> Result<ContentChunks> {
        let reader = match rep {
            Some(rep) => Some(VerifyingReader {
                decoder: self.open_object(&rep.blob)?,
                hasher: Sha256::new(),
                expected: rep.blob,
                read: 0,
                expected_size: rep.size,
            }),
            None => None,
        };
        Ok(ContentChunks {
            reader,
            chunk_size: chunk_size.max(1),
        })
    }

    /// Read the full content and check it against its hash
    pub fn verify(&self, rep: &TextRep) -> Result<()> {
        for chunk in self.chunks(Some(rep), 64 * 1024)? {
            chunk?;
        }
        Ok(())
    }
}

/// Streaming writer for new file content
///
/// Dropping a writer without calling [`BlobWriter::finish`] removes its
/// temp file.
pub struct BlobWriter {
    encoder: Option<Encoder>,
    tmp_path: PathBuf,
    staging_dir: PathBuf,
    sha256: Sha256,
    sha1: Sha1,
    size: u64,
    fsync: bool,
}

impl BlobWriter {
    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// SHA-1 of everything written so far, hex encoded
    pub fn sha1_hex(&self) -> String {
        hex::encode(self.sha1.clone().finalize())
    }

    /// Complete the write; returns the text representation and the staged
    /// file holding the compressed content
    pub fn finish(mut self) -> Result<(TextRep, PathBuf)> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| FsError::Io(io::Error::other("content writer already finished")))?;
        let buffered = encoder.finish()?;
        let file = buffered.into_inner().map_err(|e| FsError::Io(e.into_error()))?;
        if self.fsync {
            file.sync_all()?;
        }
        drop(file);

        let blob = ObjectId::from_hasher(std::mem::take(&mut self.sha256));
        let rep = TextRep {
            blob,
            sha1: hex::encode(std::mem::take(&mut self.sha1).finalize()),
            size: self.size,
        };
        let staged = self.staging_dir.join(blob.to_hex());
        fs::rename(&self.tmp_path, &staged)?;
        Ok((rep, staged))
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| io::Error::other("content writer already finished"))?;
        let n = encoder.write(buf)?;
        self.sha256.update(&buf[..n]);
        self.sha1.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.encoder.is_some() {
            self.encoder = None;
            if let Err(e) = fs::remove_file(&self.tmp_path) {
                tracing::warn!("Failed to remove staging file {:?}: {}", self.tmp_path, e);
            }
        }
    }
}

struct VerifyingReader {
    decoder: Decoder,
    hasher: Sha256,
    expected: ObjectId,
    read: u64,
    expected_size: u64,
}

/// Lazy, finite sequence of content chunks
///
/// The content hash is checked once the last byte has been read. Any error
/// ends the sequence.
pub struct ContentChunks {
    reader: Option<VerifyingReader>,
    chunk_size: usize,
}

impl Iterator for ContentChunks {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut buf = BytesMut::zeroed(self.chunk_size);
        let mut filled = 0;
        while filled < buf.len() {
            match reader.decoder.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.reader = None;
                    return Some(Err(FsError::Io(e)));
                }
            }
        }

        if filled == 0 {
            let reader = self.reader.take()?;
            let actual = ObjectId::from_hasher(reader.hasher);
            if actual != reader.expected || reader.read != reader.expected_size {
                return Some(Err(FsError::Corrupt(format!(
                    "content object {} does not match its checksum",
                    reader.expected
                ))));
            }
            return None;
        }

        buf.truncate(filled);
        reader.hasher.update(&buf);
        reader.read += filled as u64;
        Some(Ok(buf.freeze()))
    }
}

/// Handle on one file's content at a fixed node-revision
///
/// Every call to [`FileContents::chunks`] starts a fresh read from the
/// beginning, so a consumer can restart after an error or an early stop.
#[derive(Debug, Clone)]
pub struct FileContents {
    blobs: Arc<BlobStore>,
    rep: Option<TextRep>,
    chunk_size: usize,
}

impl FileContents {
    pub(crate) fn new(blobs: Arc<BlobStore>, rep: Option<TextRep>, chunk_size: usize) -> Self {
        Self {
            blobs,
            rep,
            chunk_size,
        }
    }

    /// Content length in bytes
    pub fn len(&self) -> u64 {
        self.rep.as_ref().map_or(0, |r| r.size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SHA-1 of the content, hex encoded
    pub fn sha1(&self) -> String {
        match &self.rep {
            Some(rep) => rep.sha1.clone(),
            None => hex::encode(Sha1::digest(b"")),
        }
    }

    /// Start streaming the content
    pub fn chunks(&self) -> Result<ContentChunks> {
        self.blobs.chunks(self.rep.as_ref(), self.chunk_size)
    }

    /// Buffer the whole content
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(self.len() as usize);
        for chunk in self.chunks()? {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Stream the content into a writer, returning the byte count
    pub fn copy_to(&self, out: &mut impl Write) -> Result<u64> {
        let mut total = 0;
        for chunk in self.chunks()? {
            let chunk = chunk?;
            out.write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> BlobStore {
        BlobStore::open(tmp.path().join("objects"), 3, false).unwrap()
    }

    #[test]
    fn test_write_import_read() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        let staging = tmp.path().join("txn");

        let mut w = blobs.writer(&staging).unwrap();
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        let (rep, staged) = w.finish().unwrap();
        assert_eq!(rep.size, 11);
        assert_eq!(rep.blob, ObjectId::from_data(b"hello world"));
        assert_eq!(rep.sha1, hex::encode(Sha1::digest(b"hello world")));
        assert!(!blobs.contains(&rep.blob));

        blobs.import(&staged, &rep.blob).unwrap();
        assert!(blobs.contains(&rep.blob));
        assert!(!staged.exists());

        let chunks: Vec<Bytes> = blobs
            .chunks(Some(&rep), 4)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"hello world");
    }

    #[test]
    fn test_import_moves_staged_file() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        let staging = tmp.path().join("txn");

        let mut w = blobs.writer(&staging).unwrap();
        w.write_all(b"same bytes").unwrap();
        let (rep, staged) = w.finish().unwrap();

        blobs.import(&staged, &rep.blob).unwrap();
        assert!(!staged.exists());
        assert!(blobs.contains(&rep.blob));

        // Importing content that is already stored only drops the staged copy
        fs::write(&staged, b"not even zstd").unwrap();
        blobs.import(&staged, &rep.blob).unwrap();
        assert!(!staged.exists());
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
        blobs.verify(&rep).unwrap();
    }

    #[test]
    fn test_dropped_writer_removes_temp_file() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        let staging = tmp.path().join("txn");
        {
            let mut w = blobs.writer(&staging).unwrap();
            w.write_all(b"discarded").unwrap();
        }
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_content() {
        let tmp = TempDir::new().unwrap();
        let blobs = Arc::new(store(&tmp));
        let contents = FileContents::new(blobs, None, 16);
        assert!(contents.is_empty());
        assert_eq!(contents.chunks().unwrap().count(), 0);
        assert_eq!(contents.sha1(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_corrupt_object_detected() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        let rep = blobs.put(b"original", &tmp.path().join("txn")).unwrap();

        // Overwrite with valid zstd data of different content
        let path = blobs.object_path(&rep.blob);
        fs::write(&path, zstd::encode_all(&b"tampered"[..], 3).unwrap()).unwrap();

        let err = blobs.verify(&rep).unwrap_err();
        assert!(matches!(err, FsError::Corrupt(_)));
    }

    #[test]
    fn test_missing_object() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        let rep = TextRep {
            blob: ObjectId::from_data(b"nowhere"),
            sha1: String::new(),
            size: 7,
        };
        assert!(matches!(blobs.chunks(Some(&rep), 8), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn test_contents_restartable() {
        let tmp = TempDir::new().unwrap();
        let blobs = Arc::new(store(&tmp));
        let rep = blobs.put(&vec![7u8; 1000], &tmp.path().join("txn")).unwrap();
        let contents = FileContents::new(blobs, Some(rep), 100);

        let first = contents.chunks().unwrap().next().unwrap().unwrap();
        assert_eq!(first.len(), 100);
        // Abandon the first stream, start over
        assert_eq!(contents.to_bytes().unwrap().len(), 1000);
        let mut sink = Vec::new();
        assert_eq!(contents.copy_to(&mut sink).unwrap(), 1000);
    }
}
