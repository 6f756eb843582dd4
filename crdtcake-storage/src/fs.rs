use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crdtcake_crdt::{get_unix_timestamp_ms, CrdtCodec, CrdtData, CrdtFunction};
use futures::{stream, StreamExt, TryStreamExt};
use itertools::Itertools;
use tokio::sync::Mutex;

use crate::{CrdtStorage, CrdtStream, StorageError, Take, TakeCommit};

const SEGMENT_EXTENSION: &str = "seg";
const TEMP_EXTENSION: &str = "tmp";
const LEN_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;
const RECORD_HEADER_SIZE: usize = LEN_SIZE + CHECKSUM_SIZE;

/// A file backed CRDT storage.
///
/// Every upload is written as a new immutable segment file containing its
/// entries sorted by key. Reads merge all live segments, [FsCrdtStorage::consolidate]
/// folds them back into a single segment.
pub struct FsCrdtStorage<K, S> {
    dir: PathBuf,
    function: Arc<dyn CrdtFunction<S>>,
    codec: Arc<dyn CrdtCodec<K, S>>,
    next_segment_id: AtomicU64,
    // Held while segments are listed and read, or replaced.
    segments_lock: Arc<Mutex<()>>,
    claimed: Arc<ClaimedSegments>,
}

/// Segments read by takes which are neither committed nor dropped yet,
/// along with the number of takes holding each one.
type ClaimedSegments = parking_lot::Mutex<HashMap<PathBuf, usize>>;

impl<K, S> FsCrdtStorage<K, S>
where
    K: Ord + Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    /// Opens the storage in the given directory, creating it if missing.
    ///
    /// Temporary files left behind by an interrupted write are removed.
    pub async fn open(
        dir: impl AsRef<Path>,
        function: impl CrdtFunction<S>,
        codec: impl CrdtCodec<K, S>,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext == TEMP_EXTENSION).unwrap_or(false) {
                warn!(path = %path.display(), "Removing incomplete segment.");
                tokio::fs::remove_file(&path).await?;
            }
        }

        info!(dir = %dir.display(), "File storage is open.");

        Ok(Self {
            dir,
            function: Arc::new(function),
            codec: Arc::new(codec),
            next_segment_id: AtomicU64::new(0),
            segments_lock: Arc::new(Mutex::new(())),
            claimed: Arc::new(ClaimedSegments::default()),
        })
    }

    /// The directory segments are stored in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lists the live segment files, oldest first.
    pub async fn segments(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut segments = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext == SEGMENT_EXTENSION).unwrap_or(false) {
                segments.push(path);
            }
        }

        segments.sort();
        Ok(segments)
    }

    /// Merges every live segment into a single new segment.
    ///
    /// Segments written while the consolidation runs are left untouched, as
    /// are segments held by an uncommitted take.
    /// Returns the number of segments which were replaced.
    pub async fn consolidate(&self) -> Result<usize, StorageError> {
        let _guard = self.segments_lock.lock().await;

        let listed = self.segments().await?;
        let segments = {
            let claimed = self.claimed.lock();
            listed
                .into_iter()
                .filter(|segment| !claimed.contains_key(segment))
                .collect::<Vec<_>>()
        };
        if segments.len() <= 1 {
            return Ok(0);
        }

        let merged = self.read_merged(&segments).await?;
        let new_segment = self.write_segment(&merged).await?;

        for segment in segments.iter() {
            remove_if_exists(segment).await?;
        }

        info!(
            num_segments = segments.len(),
            num_entries = merged.len(),
            segment = %new_segment.display(),
            "Consolidated segments.",
        );

        Ok(segments.len())
    }

    fn next_segment_path(&self) -> PathBuf {
        let segment_id = self.next_segment_id.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{:020}-{:010}-{:08x}.{}",
            get_unix_timestamp_ms(),
            segment_id,
            rand::random::<u32>(),
            SEGMENT_EXTENSION,
        );
        self.dir.join(name)
    }

    async fn write_segment(
        &self,
        entries: &[CrdtData<K, S>],
    ) -> Result<PathBuf, StorageError> {
        let mut buffer = Vec::new();
        for data in entries {
            let record = self.codec.encode(data)?;
            buffer.extend_from_slice(&(record.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&crc32fast::hash(&record).to_le_bytes());
            buffer.extend_from_slice(&record);
        }

        let path = self.next_segment_path();
        let temp_path = path.with_extension(TEMP_EXTENSION);
        tokio::fs::write(&temp_path, &buffer).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!(segment = %path.display(), num_entries = entries.len(), "Wrote segment.");
        Ok(path)
    }

    async fn read_segment(&self, path: &Path) -> Result<Vec<CrdtData<K, S>>, StorageError> {
        let buffer = tokio::fs::read(path).await?;

        let mut entries = Vec::new();
        let mut cursor = 0;
        while cursor < buffer.len() {
            if buffer.len() - cursor < RECORD_HEADER_SIZE {
                return Err(corrupted(path, "truncated record header"));
            }

            let len = read_u32(&buffer[cursor..]) as usize;
            let checksum = read_u32(&buffer[cursor + LEN_SIZE..]);
            cursor += RECORD_HEADER_SIZE;

            if buffer.len() - cursor < len {
                return Err(corrupted(path, "truncated record"));
            }

            let record = &buffer[cursor..cursor + len];
            if crc32fast::hash(record) != checksum {
                return Err(corrupted(path, "checksum mismatch"));
            }

            entries.push(self.codec.decode(record)?);
            cursor += len;
        }

        Ok(entries)
    }

    async fn read_merged(
        &self,
        segments: &[PathBuf],
    ) -> Result<Vec<CrdtData<K, S>>, StorageError> {
        let mut contents = Vec::with_capacity(segments.len());
        for segment in segments {
            contents.push(self.read_segment(segment).await?);
        }

        let merged = contents
            .into_iter()
            .kmerge_by(|a: &CrdtData<K, S>, b: &CrdtData<K, S>| a.key < b.key);
        Ok(coalesce_sorted(merged, self.function.as_ref()))
    }
}

#[async_trait]
impl<K, S> CrdtStorage<K, S> for FsCrdtStorage<K, S>
where
    K: Ord + Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    async fn upload(&self, entries: CrdtStream<K, S>) -> Result<(), StorageError> {
        let mut entries = entries.try_collect::<Vec<_>>().await?;
        if entries.is_empty() {
            return Ok(());
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let entries = coalesce_sorted(entries.into_iter(), self.function.as_ref());

        self.write_segment(&entries).await?;
        Ok(())
    }

    async fn download(&self, timestamp: u64) -> Result<CrdtStream<K, S>, StorageError> {
        let merged = {
            let _guard = self.segments_lock.lock().await;
            let segments = self.segments().await?;
            self.read_merged(&segments).await?
        };

        let function = self.function.clone();
        let entries = merged
            .into_iter()
            .filter_map(move |data| data.extract(timestamp, function.as_ref()))
            .map(Ok);

        Ok(stream::iter(entries).boxed())
    }

    async fn take(&self) -> Result<Take<K, S>, StorageError> {
        let (segments, merged) = {
            let _guard = self.segments_lock.lock().await;
            let segments = self.segments().await?;
            let merged = self.read_merged(&segments).await?;

            let mut claimed = self.claimed.lock();
            for segment in segments.iter() {
                *claimed.entry(segment.clone()).or_default() += 1;
            }

            (segments, merged)
        };

        let commit = FsTakeCommit {
            segments,
            segments_lock: self.segments_lock.clone(),
            claimed: self.claimed.clone(),
        };
        let entries = stream::iter(merged.into_iter().map(Ok)).boxed();
        Ok(Take::new(entries, commit))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let metadata = tokio::fs::metadata(&self.dir).await?;
        if !metadata.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        Ok(())
    }
}

struct FsTakeCommit {
    segments: Vec<PathBuf>,
    segments_lock: Arc<Mutex<()>>,
    claimed: Arc<ClaimedSegments>,
}

#[async_trait]
impl TakeCommit for FsTakeCommit {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let _guard = self.segments_lock.lock().await;
        for segment in self.segments.iter() {
            remove_if_exists(segment).await?;
        }
        debug!(num_segments = self.segments.len(), "Committed take.");
        Ok(())
    }
}

impl Drop for FsTakeCommit {
    fn drop(&mut self) {
        let mut claimed = self.claimed.lock();
        for segment in self.segments.iter() {
            if let Some(count) = claimed.get_mut(segment) {
                *count -= 1;
                if *count == 0 {
                    claimed.remove(segment);
                }
            }
        }
    }
}

fn coalesce_sorted<K, S>(
    entries: impl Iterator<Item = CrdtData<K, S>>,
    function: &dyn CrdtFunction<S>,
) -> Vec<CrdtData<K, S>>
where
    K: Ord,
    S: 'static,
{
    entries
        .coalesce(|a, b| {
            if a.key == b.key {
                Ok(a.merge_with(b, function))
            } else {
                Err((a, b))
            }
        })
        .collect()
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(bytes)
}

fn corrupted(path: &Path, reason: &str) -> StorageError {
    StorageError::Corrupted(format!("{}: {}", path.display(), reason))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crdtcake_crdt::{ignoring_timestamp, CodecError, IgnoringTimestamp};

    use super::*;
    use crate::test_suite::{entries, run_test_suite};

    /// A hand rolled codec for `String` keys and `u32` sets.
    struct SetCodec;

    impl CrdtCodec<String, BTreeSet<u32>> for SetCodec {
        fn encode(&self, data: &CrdtData<String, BTreeSet<u32>>) -> Result<Vec<u8>, CodecError> {
            let mut buf = Vec::new();
            buf.extend_from_slice(&(data.key.len() as u32).to_le_bytes());
            buf.extend_from_slice(data.key.as_bytes());
            buf.extend_from_slice(&data.timestamp.to_le_bytes());
            for value in data.state.iter() {
                buf.extend_from_slice(&value.to_le_bytes());
            }
            Ok(buf)
        }

        fn decode(&self, bytes: &[u8]) -> Result<CrdtData<String, BTreeSet<u32>>, CodecError> {
            let invalid = || CodecError::Decode("invalid set entry".to_string());

            let key_len = read_u32(bytes.get(..4).ok_or_else(invalid)?) as usize;
            let key = bytes.get(4..4 + key_len).ok_or_else(invalid)?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| invalid())?;

            let ts_bytes = bytes.get(4 + key_len..12 + key_len).ok_or_else(invalid)?;
            let mut timestamp = [0; 8];
            timestamp.copy_from_slice(ts_bytes);

            let state = bytes[12 + key_len..]
                .chunks(4)
                .map(|chunk| chunk.try_into().map(u32::from_le_bytes).map_err(|_| invalid()))
                .collect::<Result<_, _>>()?;

            Ok(CrdtData::new(key, u64::from_le_bytes(timestamp), state))
        }
    }

    type Union = IgnoringTimestamp<fn(BTreeSet<u32>, BTreeSet<u32>) -> BTreeSet<u32>>;

    fn union() -> Union {
        fn union_sets(mut a: BTreeSet<u32>, b: BTreeSet<u32>) -> BTreeSet<u32> {
            a.extend(b);
            a
        }
        ignoring_timestamp(union_sets as fn(_, _) -> _)
    }

    async fn open(dir: &Path) -> FsCrdtStorage<String, BTreeSet<u32>> {
        FsCrdtStorage::open(dir, union(), SetCodec)
            .await
            .expect("Open storage")
    }

    #[tokio::test]
    async fn test_fs_storage_suite() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().expect("Create temp dir");
        run_test_suite(open(dir.path()).await).await;
    }

    #[tokio::test]
    async fn test_consolidation() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir()?;
        let storage = open(dir.path()).await;

        storage
            .upload(entries([("1_test_1", 1, vec![1, 2, 3]), ("1_test_2", 1, vec![2, 3, 7])]))
            .await?;
        storage
            .upload(entries([("1_test_2", 2, vec![1, 2, 6]), ("1_test_3", 2, vec![1, 2, 4])]))
            .await?;

        let before = storage.segments().await?;
        assert_eq!(before.len(), 2, "Every upload should write its own segment.");

        let replaced = storage.consolidate().await?;
        assert_eq!(replaced, 2);

        let after = storage.segments().await?;
        assert_eq!(after.len(), 1, "Consolidation should leave a single segment.");
        assert!(!before.contains(&after[0]), "Consolidated segment should be new.");
        assert!(
            after[0] > before[1],
            "Consolidated segment should sort after the segments it replaced."
        );

        let downloaded = storage.download(0).await?.try_collect::<Vec<_>>().await?;
        let expected = vec![
            CrdtData::new("1_test_1".to_string(), 1, BTreeSet::from([1, 2, 3])),
            CrdtData::new("1_test_2".to_string(), 2, BTreeSet::from([1, 2, 3, 6, 7])),
            CrdtData::new("1_test_3".to_string(), 2, BTreeSet::from([1, 2, 4])),
        ];
        assert_eq!(downloaded, expected);

        assert_eq!(storage.consolidate().await?, 0, "A single segment has nothing to do.");
        Ok(())
    }

    async fn keys(storage: &FsCrdtStorage<String, BTreeSet<u32>>) -> anyhow::Result<Vec<String>> {
        let downloaded = storage.download(0).await?.try_collect::<Vec<_>>().await?;
        Ok(downloaded.into_iter().map(|data| data.key).collect())
    }

    #[tokio::test]
    async fn test_consolidation_skips_uncommitted_take() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir()?;
        let storage = open(dir.path()).await;

        storage.upload(entries([("a", 1, vec![1])])).await?;
        storage.upload(entries([("b", 1, vec![2])])).await?;

        let (taken, commit) = storage.take().await?.into_parts();
        assert_eq!(taken.try_collect::<Vec<_>>().await?.len(), 2);

        storage.upload(entries([("c", 2, vec![3])])).await?;
        storage.upload(entries([("d", 2, vec![4])])).await?;

        let replaced = storage.consolidate().await?;
        assert_eq!(replaced, 2, "Only segments written after the take may be folded.");
        assert_eq!(storage.segments().await?.len(), 3);

        commit.commit().await?;
        assert_eq!(keys(&storage).await?, ["c", "d"], "Taken entries must not come back.");
        assert_eq!(storage.segments().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_waits_for_consolidation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = open(dir.path()).await;

        storage.upload(entries([("a", 1, vec![1])])).await?;
        storage.upload(entries([("b", 1, vec![2])])).await?;
        let (_, commit) = storage.take().await?.into_parts();
        storage.upload(entries([("c", 2, vec![3])])).await?;
        storage.upload(entries([("d", 2, vec![4])])).await?;

        let (consolidated, committed) = tokio::join!(storage.consolidate(), commit.commit());
        consolidated?;
        committed?;

        assert_eq!(keys(&storage).await?, ["c", "d"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_take_releases_segments() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = open(dir.path()).await;

        storage.upload(entries([("a", 1, vec![1])])).await?;
        storage.upload(entries([("b", 1, vec![2])])).await?;

        let take = storage.take().await?;
        assert_eq!(storage.consolidate().await?, 0, "Held segments are not folded.");
        drop(take);

        assert_eq!(storage.consolidate().await?, 2);
        assert_eq!(keys(&storage).await?, ["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_segment_is_detected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = open(dir.path()).await;
        storage.upload(entries([("a", 1, vec![1])])).await?;

        let segment = storage.segments().await?.remove(0);
        let mut contents = tokio::fs::read(&segment).await?;
        let last = contents.len() - 1;
        contents[last] ^= 0xFF;
        tokio::fs::write(&segment, contents).await?;

        let result = storage.download(0).await;
        assert!(
            matches!(result, Err(StorageError::Corrupted(_))),
            "Checksum mismatch should surface as corruption."
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_keeps_segments() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let storage = open(dir.path()).await;
            storage.upload(entries([("a", 1, vec![1])])).await?;
        }
        tokio::fs::write(dir.path().join("dangling.tmp"), b"partial").await?;

        let storage = open(dir.path()).await;
        assert!(!dir.path().join("dangling.tmp").exists());

        let downloaded = storage.download(0).await?.try_collect::<Vec<_>>().await?;
        assert_eq!(downloaded.len(), 1);
        Ok(())
    }
}
