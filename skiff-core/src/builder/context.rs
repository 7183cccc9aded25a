//! Build context transport.
//!
//! Two ways of getting the context to the backend:
//! - streamed archive: a blocking producer task packs the context into a tar
//!   stream and feeds it through a bounded channel while the request is in flight
//! - filesystem sync: the backend pulls files from registered directories
//!
//! Both modes apply the caller's [`PathFilter`] with the same rules and never
//! leak host file ownership.

use crate::error::{BuildError, Result};
use crate::sink::BuildSink;
use crate::types::stage::format_bytes;
use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the build file inside the archive and the synced `dockerfile` dir.
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// Size of the chunks handed from the producer to the request body.
const CHUNK_SIZE: usize = 32 * 1024;

/// Chunks buffered between producer and consumer.
const CHANNEL_CAPACITY: usize = 16;

/// Decides which context paths are excluded from transport.
pub trait PathFilter: Send + Sync {
    /// Whether `path` is matched (excluded).
    fn matches(&self, path: &Path) -> bool;

    /// Whether `path` is a directory whose entire contents are matched.
    fn matches_entire_dir(&self, path: &Path) -> bool;
}

/// Filter that matches nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyFilter;

impl PathFilter for EmptyFilter {
    fn matches(&self, _path: &Path) -> bool {
        false
    }

    fn matches_entire_dir(&self, _path: &Path) -> bool {
        false
    }
}

/// Filter that excludes a fixed set of files and directory trees.
#[derive(Debug, Default, Clone)]
pub struct PathSetFilter {
    paths: Vec<PathBuf>,
}

impl PathSetFilter {
    /// Exclude `paths`; relative entries are resolved against `root`.
    pub fn new(root: &Path, paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Self {
        let paths = paths
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    root.join(p)
                }
            })
            .collect();
        Self { paths }
    }
}

impl PathFilter for PathSetFilter {
    fn matches(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| path.starts_with(p))
    }

    fn matches_entire_dir(&self, path: &Path) -> bool {
        self.matches(path)
    }
}

/// What to do with one enumerated context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Include,
    Skip,
    SkipTree,
}

/// A matched file is excluded. A matched directory is only excluded when the
/// filter claims all of it; otherwise children the filter did not target
/// would silently disappear.
fn visit(filter: &dyn PathFilter, path: &Path, is_dir: bool) -> Visit {
    if !filter.matches(path) {
        return Visit::Include;
    }
    if !is_dir {
        return Visit::Skip;
    }
    if filter.matches_entire_dir(path) {
        Visit::SkipTree
    } else {
        Visit::Include
    }
}

/// Tar stream of the build context, produced concurrently by a blocking task.
///
/// Producer failures arrive as an `Err` item on the channel. Dropping the
/// archive closes the channel, which stops the producer at its next write.
pub struct ContextArchive {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl ContextArchive {
    /// Start packing `context` plus the synthetic Dockerfile.
    pub fn spawn(
        context: PathBuf,
        dockerfile: String,
        filter: Arc<dyn PathFilter>,
        sink: Arc<dyn BuildSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::task::spawn_blocking(move || {
            let writer = ChannelWriter::new(tx.clone());
            match write_archive(&context, &dockerfile, filter.as_ref(), writer) {
                Ok(bytes) => {
                    debug!(bytes, context = %context.display(), "Build context archived");
                    sink.log(&format!("Sending build context: {}\n", format_bytes(bytes as i64)));
                }
                Err(e) => {
                    warn!("Failed to archive build context: {}", e);
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        Self { rx }
    }

    /// Chunk stream suitable for an HTTP request body.
    pub fn into_stream(self) -> ReceiverStream<io::Result<Vec<u8>>> {
        ReceiverStream::new(self.rx)
    }

    /// Collect the whole archive, surfacing any producer error.
    pub async fn read_all(mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }
}

/// `Write` adapter that forwards fixed-size chunks into the channel.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
    buf: Vec<u8>,
    written: u64,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Vec<u8>>>) -> Self {
        Self { tx, buf: Vec::with_capacity(CHUNK_SIZE), written: 0 }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.written += chunk.len() as u64;
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "context consumer went away"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// Write the filtered context and the synthetic Dockerfile as a tar stream.
///
/// Returns the number of bytes written.
fn write_archive(
    context: &Path,
    dockerfile: &str,
    filter: &dyn PathFilter,
    writer: ChannelWriter,
) -> io::Result<u64> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let mut walker = WalkDir::new(context).min_depth(1).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(context).map_err(io::Error::other)?;
        let file_type = entry.file_type();

        // The Dockerfile on disk is superseded by the synthetic entry
        if rel == Path::new(DOCKERFILE_NAME) && !file_type.is_dir() {
            continue;
        }

        match visit(filter, path, file_type.is_dir()) {
            Visit::Include => {}
            Visit::Skip => continue,
            Visit::SkipTree => {
                walker.skip_current_dir();
                continue;
            }
        }

        let metadata = entry.metadata()?;
        let mut header = tar::Header::new_gnu();
        header.set_metadata(&metadata);
        header.set_uid(0);
        header.set_gid(0);

        if file_type.is_dir() {
            header.set_size(0);
            builder.append_data(&mut header, rel, io::empty())?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            header.set_size(0);
            builder.append_link(&mut header, rel, &target)?;
        } else if file_type.is_file() {
            let file = File::open(path)?;
            builder.append_data(&mut header, rel, file)?;
        } else {
            debug!(path = %path.display(), "Skipping special file in build context");
        }
    }

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("")?;
    header.set_groupname("")?;
    builder.append_data(&mut header, DOCKERFILE_NAME, dockerfile.as_bytes())?;

    let mut writer = builder.into_inner()?;
    writer.flush()?;
    Ok(writer.written)
}

/// File metadata as presented to a syncing backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Path relative to the synced directory
    pub path: PathBuf,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Modification time (Unix timestamp)
    pub mod_time: i64,
    pub is_dir: bool,
}

impl FileStat {
    fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        let mod_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        #[cfg(unix)]
        let (mode, uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            (metadata.mode(), metadata.uid(), metadata.gid())
        };
        #[cfg(not(unix))]
        let (mode, uid, gid) = (if metadata.is_dir() { 0o755 } else { 0o644 }, 0, 0);

        Self { path, mode, uid, gid, size: metadata.len(), mod_time, is_dir: metadata.is_dir() }
    }
}

/// Per-entry hook: return `false` to exclude the entry (and its subtree).
pub type FileMap = Arc<dyn Fn(&Path, &mut FileStat) -> bool + Send + Sync>;

/// A directory registered for backend-initiated sync.
#[derive(Clone)]
pub struct SyncedDir {
    pub name: String,
    pub dir: PathBuf,
    pub map: FileMap,
}

impl std::fmt::Debug for SyncedDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedDir").field("name", &self.name).field("dir", &self.dir).finish()
    }
}

impl SyncedDir {
    /// Enumerate the entries a backend would receive, in path order.
    pub fn entries(&self) -> io::Result<Vec<FileStat>> {
        let mut entries = Vec::new();
        let mut walker = WalkDir::new(&self.dir).min_depth(1).sort_by_file_name().into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry?;
            let rel = entry.path().strip_prefix(&self.dir).map_err(io::Error::other)?;
            let metadata = entry.metadata()?;
            let mut stat = FileStat::from_metadata(rel.to_path_buf(), &metadata);

            if (self.map)(rel, &mut stat) {
                entries.push(stat);
            } else if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
        }
        Ok(entries)
    }
}

/// Zero host ownership on a synced entry.
fn normalize_ownership(stat: &mut FileStat) {
    stat.uid = 0;
    stat.gid = 0;
}

/// Register the context dir (filtered) and the materialized Dockerfile dir.
pub fn to_synced_dirs(
    context: &Path,
    dockerfile_dir: &Path,
    filter: Arc<dyn PathFilter>,
) -> Vec<SyncedDir> {
    let root = context.to_path_buf();
    let context_map: FileMap = Arc::new(move |path: &Path, stat: &mut FileStat| {
        let abs = if path.is_absolute() { path.to_path_buf() } else { root.join(path) };
        match visit(filter.as_ref(), &abs, stat.is_dir) {
            Visit::Include => {
                normalize_ownership(stat);
                true
            }
            Visit::Skip | Visit::SkipTree => false,
        }
    });

    let dockerfile_map: FileMap = Arc::new(|_: &Path, stat: &mut FileStat| {
        normalize_ownership(stat);
        true
    });

    vec![
        SyncedDir { name: "context".to_string(), dir: context.to_path_buf(), map: context_map },
        SyncedDir {
            name: "dockerfile".to_string(),
            dir: dockerfile_dir.to_path_buf(),
            map: dockerfile_map,
        },
    ]
}

/// Materialize the Dockerfile contents in a fresh temporary directory.
///
/// The directory is removed when the returned handle is dropped.
pub fn write_temp_dockerfile(contents: &str) -> Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("skiff-tempdockerfile-").tempdir().map_err(|e| {
        BuildError::ContextPrepFailed {
            reason: format!("creating temp dockerfile directory: {}", e),
        }
    })?;

    fs::write(dir.path().join(DOCKERFILE_NAME), contents).map_err(|e| {
        BuildError::ContextPrepFailed { reason: format!("creating temp dockerfile: {}", e) }
    })?;

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;
    use std::collections::BTreeMap;
    use std::io::Read;

    /// Filter with explicit answers for both queries.
    struct FixedFilter {
        matched: Vec<PathBuf>,
        entire_dirs: Vec<PathBuf>,
    }

    impl PathFilter for FixedFilter {
        fn matches(&self, path: &Path) -> bool {
            self.matched.iter().any(|p| p == path)
        }

        fn matches_entire_dir(&self, path: &Path) -> bool {
            self.entire_dirs.iter().any(|p| p == path)
        }
    }

    fn make_context() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM on-disk").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), "c").unwrap();
        dir
    }

    fn entry_paths(dir: &SyncedDir) -> Vec<String> {
        dir.entries().unwrap().iter().map(|e| e.path.to_string_lossy().to_string()).collect()
    }

    #[test]
    fn test_synced_dirs_exclude_matched_file_only() {
        let ctx = make_context();
        let df_dir = write_temp_dockerfile("FROM alpine").unwrap();
        let filter = Arc::new(FixedFilter {
            matched: vec![ctx.path().join("a.txt")],
            entire_dirs: vec![],
        });

        let dirs = to_synced_dirs(ctx.path(), df_dir.path(), filter);
        assert_eq!(dirs[0].name, "context");
        assert_eq!(dirs[1].name, "dockerfile");

        let paths = entry_paths(&dirs[0]);
        assert!(!paths.contains(&"a.txt".to_string()));
        assert!(paths.contains(&"b.txt".to_string()));
        assert!(paths.contains(&"sub".to_string()));
        assert!(paths.contains(&"sub/c.txt".to_string()));
    }

    #[test]
    fn test_synced_dirs_keep_partially_matched_dir() {
        let ctx = make_context();
        let df_dir = write_temp_dockerfile("FROM alpine").unwrap();
        let filter = Arc::new(FixedFilter {
            matched: vec![ctx.path().join("sub")],
            entire_dirs: vec![],
        });

        let paths = entry_paths(&to_synced_dirs(ctx.path(), df_dir.path(), filter)[0]);
        assert!(paths.contains(&"sub".to_string()));
        assert!(paths.contains(&"sub/c.txt".to_string()));
    }

    #[test]
    fn test_synced_dirs_prune_entirely_matched_dir() {
        let ctx = make_context();
        let df_dir = write_temp_dockerfile("FROM alpine").unwrap();
        let sub = ctx.path().join("sub");
        let filter = Arc::new(FixedFilter { matched: vec![sub.clone()], entire_dirs: vec![sub] });

        let paths = entry_paths(&to_synced_dirs(ctx.path(), df_dir.path(), filter)[0]);
        assert!(!paths.iter().any(|p| p.starts_with("sub")));
        assert!(paths.contains(&"a.txt".to_string()));
    }

    #[test]
    fn test_synced_entries_have_zero_ownership() {
        let ctx = make_context();
        let df_dir = write_temp_dockerfile("FROM alpine").unwrap();
        let dirs = to_synced_dirs(ctx.path(), df_dir.path(), Arc::new(EmptyFilter));

        for dir in &dirs {
            for entry in dir.entries().unwrap() {
                assert_eq!((entry.uid, entry.gid), (0, 0), "{:?}", entry.path);
            }
        }
        assert_eq!(entry_paths(&dirs[1]), vec!["Dockerfile".to_string()]);
    }

    #[test]
    fn test_temp_dockerfile_removed_on_drop() {
        let dir = write_temp_dockerfile("FROM alpine\n").unwrap();
        let path = dir.path().to_path_buf();
        assert_eq!(fs::read_to_string(path.join(DOCKERFILE_NAME)).unwrap(), "FROM alpine\n");
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn test_path_set_filter() {
        let root = Path::new("/src");
        let filter = PathSetFilter::new(root, ["node_modules", "/src/secret.txt"]);
        assert!(filter.matches(Path::new("/src/node_modules/pkg/index.js")));
        assert!(filter.matches_entire_dir(Path::new("/src/node_modules")));
        assert!(filter.matches(Path::new("/src/secret.txt")));
        assert!(!filter.matches(Path::new("/src/main.rs")));
    }

    #[tokio::test]
    async fn test_archive_injects_dockerfile_and_filters() {
        let ctx = make_context();
        let sink = Arc::new(RecordingSink::new());
        let filter = Arc::new(PathSetFilter::new(ctx.path(), ["a.txt"]));

        let archive = ContextArchive::spawn(
            ctx.path().to_path_buf(),
            "FROM synthetic".to_string(),
            filter,
            sink.clone(),
        );
        let data = archive.read_all().await.unwrap();

        let mut files = BTreeMap::new();
        let mut tar = tar::Archive::new(io::Cursor::new(data));
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            assert_eq!(entry.header().uid().unwrap(), 0);
            assert_eq!(entry.header().gid().unwrap(), 0);
            let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            files.insert(path, contents);
        }

        assert_eq!(files.get("Dockerfile").map(String::as_str), Some("FROM synthetic"));
        assert!(!files.contains_key("a.txt"));
        assert_eq!(files.get("b.txt").map(String::as_str), Some("b"));
        assert_eq!(files.get("sub/c.txt").map(String::as_str), Some("c"));
        assert!(sink.logs().iter().any(|l| l.starts_with("Sending build context")));
    }

    #[tokio::test]
    async fn test_archive_producer_error_reaches_consumer() {
        let missing = std::env::temp_dir().join("skiff-missing-context-dir-for-test");
        let archive = ContextArchive::spawn(
            missing,
            "FROM alpine".to_string(),
            Arc::new(EmptyFilter),
            Arc::new(RecordingSink::new()),
        );
        assert!(archive.read_all().await.is_err());
    }
}
