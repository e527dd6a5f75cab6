use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc, watch};
use walkdir::WalkDir;

use crate::buffers;
use crate::config::{OptionsConfig, RepositoryConfig};
use crate::logging::warn_throttled;
use crate::model::{Model, RepoState};
use crate::pull::activity::ActivityMap;
use crate::pull::blocks::{self, STANDARD_BLOCK_SIZE, block_diff};
use crate::pull::errors::PullError;
use crate::pull::fsutil;
use crate::pull::queue::{BlockQueue, BlockQueueAdd, QueuedBlock};
use crate::pull::types::{BlockInfo, FileInfo};
use crate::versioner::{self, VERSIONS_DIR, Versioner};

const IDLE_PROBE_INTERVAL: Duration = Duration::from_secs(5);
const MAX_FIXUP_PASSES: usize = 100;

/// Outcome of one spawned block request, funneled back to the reconciler.
struct RequestResult {
    peer: String,
    file: FileInfo,
    offset: u64,
    data: std::io::Result<Vec<u8>>,
}

/// Bookkeeping for a file currently being assembled in its temp sibling.
/// The sticky `err` short-circuits every later operation for the file.
struct OpenFile {
    dest: PathBuf,
    temp: PathBuf,
    availability: u64,
    file: Option<tokio::fs::File>,
    err: Option<PullError>,
    outstanding: usize,
    done: bool,
}

/// Handle to a running puller. Dropping it without `stop` leaves the
/// puller running until its tasks notice the closed shutdown channel.
pub struct PullerHandle {
    shutdown: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl PullerHandle {
    /// Signals the puller to stop and waits for it to exit. In-flight
    /// block requests are allowed to finish; their results are discarded.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

/// Spawns the pull engine for one repository. With `read_only` set (or
/// zero slots) only the periodic rescan runs and nothing is fetched.
pub fn start_puller(
    repo: RepositoryConfig,
    options: OptionsConfig,
    model: Arc<dyn Model>,
) -> anyhow::Result<PullerHandle> {
    let versioner = versioner::factory(&repo.versioning.kind, &repo.versioning.params, &repo.directory)?;
    let slots = if repo.read_only { 0 } else { options.pull_slots };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (puller, blocks_rx, results_rx) = Puller::new(repo, options, model, versioner, slots);
    let join = if slots > 0 {
        tracing::debug!(
            repo = %puller.repo.id,
            dir = %puller.repo.directory.display(),
            slots,
            "starting puller"
        );
        tokio::spawn(puller.run(blocks_rx, results_rx, shutdown_rx))
    } else {
        tracing::debug!(
            repo = %puller.repo.id,
            dir = %puller.repo.directory.display(),
            "starting puller (read only)"
        );
        tokio::spawn(puller.run_read_only(shutdown_rx))
    };
    Ok(PullerHandle {
        shutdown: shutdown_tx,
        join,
    })
}

struct Puller {
    repo: RepositoryConfig,
    options: OptionsConfig,
    model: Arc<dyn Model>,
    versioner: Option<Box<dyn Versioner>>,
    queue: Arc<BlockQueue>,
    activity: ActivityMap,
    open_files: HashMap<String, OpenFile>,
    permits: Arc<Semaphore>,
    blocks_tx: mpsc::Sender<QueuedBlock>,
    results_tx: mpsc::Sender<RequestResult>,
}

impl Puller {
    fn new(
        repo: RepositoryConfig,
        options: OptionsConfig,
        model: Arc<dyn Model>,
        versioner: Option<Box<dyn Versioner>>,
        slots: usize,
    ) -> (
        Self,
        mpsc::Receiver<QueuedBlock>,
        mpsc::Receiver<RequestResult>,
    ) {
        let (blocks_tx, blocks_rx) = mpsc::channel(1);
        let (results_tx, results_rx) = mpsc::channel(1);
        let puller = Self {
            repo,
            options,
            model,
            versioner,
            queue: Arc::new(BlockQueue::new()),
            activity: ActivityMap::new(),
            open_files: HashMap::new(),
            permits: Arc::new(Semaphore::new(slots)),
            blocks_tx,
            results_tx,
        };
        (puller, blocks_rx, results_rx)
    }

    /// Read/write mode: drive the pull loop, clean up directories, rescan
    /// on schedule, refill the queue, repeat.
    async fn run(
        mut self,
        mut blocks_rx: mpsc::Receiver<QueuedBlock>,
        mut results_rx: mpsc::Receiver<RequestResult>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.spawn_filler(shutdown.clone());

        let rescan_interval = Duration::from_secs(self.options.rescan_interval_s.max(1));
        let mut last_scan = tokio::time::Instant::now();
        let mut probe = tokio::time::interval(IDLE_PROBE_INTERVAL);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut changed = true;

        loop {
            // Pull as long as blocks are queued or in flight.
            loop {
                tokio::select! {
                    res = results_rx.recv() => {
                        let Some(res) = res else { return };
                        self.model.set_state(&self.repo.id, RepoState::Syncing);
                        changed = true;
                        self.permits.add_permits(1);
                        self.handle_request_result(res).await;
                    }
                    b = blocks_rx.recv() => {
                        let Some(b) = b else { return };
                        self.model.set_state(&self.repo.id, RepoState::Syncing);
                        changed = true;
                        if self.handle_block(b).await {
                            // Fully handled in place, free up the slot.
                            self.permits.add_permits(1);
                        }
                    }
                    _ = probe.tick() => {
                        if self.open_files.is_empty() && self.queue.is_empty() {
                            break;
                        }
                        tracing::debug!(
                            repo = %self.repo.id,
                            open_files = self.open_files.len(),
                            "pull loop idle with open files"
                        );
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            tracing::debug!(repo = %self.repo.id, "puller stopping");
                            return;
                        }
                    }
                }
            }

            if changed {
                self.model.set_state(&self.repo.id, RepoState::Cleaning);
                self.fixup_directories();
                changed = false;
            }

            self.model.set_state(&self.repo.id, RepoState::Idle);

            if last_scan.elapsed() >= rescan_interval {
                tracing::debug!(repo = %self.repo.id, "time for rescan");
                if let Err(source) = self.model.scan_repo(&self.repo.id).await {
                    let err = PullError::Scan {
                        repo: self.repo.id.clone(),
                        source,
                    };
                    tracing::warn!(repo = %self.repo.id, error = %err, "marking repository invalid");
                    self.model.invalidate_repo(&self.repo.id, err.to_string());
                    return;
                }
                last_scan = tokio::time::Instant::now();
            }

            if *shutdown.borrow() {
                tracing::debug!(repo = %self.repo.id, "puller stopping");
                return;
            }

            self.queue_needed_blocks();
        }
    }

    /// Read-only mode: rescan on the configured interval, fetch nothing.
    async fn run_read_only(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.options.rescan_interval_s.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!(repo = %self.repo.id, "time for rescan");
                    if let Err(source) = self.model.scan_repo(&self.repo.id).await {
                        let err = PullError::Scan {
                            repo: self.repo.id.clone(),
                            source,
                        };
                        tracing::warn!(repo = %self.repo.id, error = %err, "marking repository invalid");
                        self.model.invalidate_repo(&self.repo.id, err.to_string());
                        return;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        tracing::debug!(repo = %self.repo.id, "puller stopping");
                        return;
                    }
                }
            }
        }
    }

    /// The filler feeds the dispatcher one queue item per free slot. Its
    /// lifetime is tied to the reconciler through the shutdown watch.
    fn spawn_filler(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = Arc::clone(&self.queue);
        let permits = Arc::clone(&self.permits);
        let blocks_tx = self.blocks_tx.clone();
        let repo_id = self.repo.id.clone();

        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    p = permits.acquire() => match p {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { return; }
                        continue;
                    }
                };
                permit.forget();

                let block = tokio::select! {
                    b = queue.get() => b,
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() { return; }
                        continue;
                    }
                };
                tracing::debug!(
                    repo = %repo_id,
                    name = %block.file.name,
                    offset = block.block.as_ref().map_or(0, |b| b.offset),
                    copy = block.copy.len(),
                    "filler queueing block"
                );
                if blocks_tx.send(block).await.is_err() {
                    return;
                }
            }
        });
    }

    /// Expands every needed file into queue items.
    fn queue_needed_blocks(&self) {
        let mut queued = 0usize;
        for file in self.model.need_files(&self.repo.id) {
            let local = self
                .model
                .current_file(&self.repo.id, &file.name)
                .map(|lf| lf.blocks)
                .unwrap_or_default();
            let (have, need) = block_diff(&local, &file.blocks);
            tracing::debug!(
                repo = %self.repo.id,
                name = %file.name,
                have = have.len(),
                need = need.len(),
                "queueing needed file"
            );
            queued += 1;
            self.queue.put(BlockQueueAdd { file, have, need });
        }
        if queued > 0 {
            tracing::debug!(repo = %self.repo.id, queued, "queued needed files");
        }
    }

    /// Applies one result from a spawned request task.
    async fn handle_request_result(&mut self, res: RequestResult) {
        self.activity.decrease(&res.peer);
        let name = res.file.name.clone();

        let Some(of) = self.open_files.get_mut(&name) else {
            // The file was torn down while the request was in flight.
            if let Ok(data) = res.data {
                buffers::put(data);
            }
            return;
        };

        match res.data {
            Ok(data) => {
                if of.err.is_none() {
                    if let Some(mut file) = of.file.take() {
                        let write = async {
                            file.seek(SeekFrom::Start(res.offset)).await?;
                            file.write_all(&data).await
                        }
                        .await;
                        match write {
                            Ok(()) => of.file = Some(file),
                            Err(source) => {
                                of.err = Some(PullError::Io {
                                    op: "write",
                                    path: of.temp.clone(),
                                    source,
                                });
                            }
                        }
                    }
                }
                buffers::put(data);
            }
            Err(source) => {
                if of.err.is_none() {
                    tracing::debug!(
                        repo = %self.repo.id,
                        name = %name,
                        peer = %res.peer,
                        error = %source,
                        "block request failed"
                    );
                    of.err = Some(PullError::Request {
                        peer: res.peer.clone(),
                        source,
                    });
                }
            }
        }

        of.outstanding = of.outstanding.saturating_sub(1);
        tracing::debug!(
            repo = %self.repo.id,
            name = %name,
            offset = res.offset,
            outstanding = of.outstanding,
            done = of.done,
            "request result applied"
        );

        if of.done && of.outstanding == 0 {
            if of.err.is_some() {
                self.drop_failed_file(&name).await;
            } else {
                self.close_file(&res.file).await;
            }
        }
    }

    /// Fulfills a block item by copying, fetching, or closing out the
    /// file. Returns true when the item was fully handled synchronously,
    /// i.e. the slot can be reused right away.
    async fn handle_block(&mut self, b: QueuedBlock) -> bool {
        if b.file.is_directory() {
            self.handle_directory(&b.file).await;
            return true;
        }
        self.handle_file_block(b).await
    }

    /// Directories only need to exist; deleted ones are left for the
    /// fixup pass, which removes them children-first.
    async fn handle_directory(&self, f: &FileInfo) {
        if !f.is_deleted() {
            let path = self.repo.directory.join(&f.name);
            if tokio::fs::metadata(&path).await.is_err() {
                tracing::debug!(repo = %self.repo.id, name = %f.name, "creating directory");
                if let Err(err) = tokio::fs::create_dir_all(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "creating directory failed");
                }
            }
        } else {
            tracing::debug!(repo = %self.repo.id, name = %f.name, "deferring directory delete to fixup");
        }
        self.model.update_local(&self.repo.id, f.clone());
    }

    async fn handle_file_block(&mut self, b: QueuedBlock) -> bool {
        let name = b.file.name.clone();

        if !self.open_files.contains_key(&name) {
            tracing::debug!(repo = %self.repo.id, name = %name, "opening file");
            let availability = self.model.availability(&self.repo.id, &name);
            let dest = self.repo.directory.join(&name);
            let temp = fsutil::temp_name(&dest);

            if let Some(parent) = dest.parent() {
                if tokio::fs::metadata(parent).await.is_err() {
                    if let Err(err) = tokio::fs::create_dir_all(parent).await {
                        tracing::debug!(
                            path = %parent.display(),
                            error = %err,
                            "creating parent directory failed"
                        );
                    }
                }
            }

            let mut of = OpenFile {
                dest,
                temp,
                availability,
                file: None,
                err: None,
                outstanding: 0,
                done: b.last,
            };
            match tokio::fs::File::create(&of.temp).await {
                Ok(file) => of.file = Some(file),
                Err(source) => {
                    tracing::debug!(
                        repo = %self.repo.id,
                        name = %name,
                        error = %source,
                        "creating temp file failed"
                    );
                    of.err = Some(PullError::Io {
                        op: "create",
                        path: of.temp.clone(),
                        source,
                    });
                }
            }
            self.open_files.insert(name.clone(), of);
        } else if let Some(of) = self.open_files.get_mut(&name) {
            of.done = b.last;
        }

        if self
            .open_files
            .get(&name)
            .is_some_and(|of| of.err.is_some())
        {
            tracing::debug!(repo = %self.repo.id, name = %name, "file has already failed; skipping block");
            if b.last {
                self.drop_failed_file(&name).await;
            }
            return true;
        }

        if !b.copy.is_empty() {
            self.handle_copy_block(&b.file, &b.copy).await;
            return true;
        }
        if let Some(block) = b.block.as_ref().filter(|bl| bl.size > 0) {
            return self.handle_request_block(&b.file, block.clone(), b.last).await;
        }
        self.handle_empty_block(&b.file, b.last).await;
        true
    }

    /// Copies already-present blocks from the current destination file
    /// into the temp at their target offsets.
    async fn handle_copy_block(&mut self, f: &FileInfo, copy: &[BlockInfo]) {
        let repo_id = self.repo.id.clone();
        let Some(of) = self.open_files.get_mut(&f.name) else {
            return;
        };
        tracing::debug!(
            repo = %repo_id,
            name = %f.name,
            blocks = copy.len(),
            "copying blocks from existing file"
        );

        let Some(mut temp) = of.file.take() else {
            return;
        };

        let mut src = match tokio::fs::File::open(&of.dest).await {
            Ok(fd) => fd,
            Err(source) => {
                tracing::debug!(
                    repo = %repo_id,
                    name = %f.name,
                    error = %source,
                    "opening copy source failed"
                );
                of.err = Some(PullError::Io {
                    op: "open",
                    path: of.dest.clone(),
                    source,
                });
                return;
            }
        };

        for c in copy {
            let mut buf = buffers::get(c.size as usize);
            let copied = copy_block(&mut src, &mut temp, c, &mut buf, &of.dest, &of.temp).await;
            buffers::put(buf);
            if let Err(err) = copied {
                tracing::debug!(repo = %repo_id, name = %f.name, error = %err, "block copy failed");
                of.err = Some(err);
                return;
            }
        }

        of.file = Some(temp);
    }

    /// Dispatches one block fetch to the least busy peer advertising the
    /// file. Returns true when no request could be issued.
    async fn handle_request_block(&mut self, f: &FileInfo, block: BlockInfo, last: bool) -> bool {
        let connections = self.model.connections();
        let repo_id = self.repo.id.clone();
        let Some(of) = self.open_files.get_mut(&f.name) else {
            return true;
        };

        let Some(peer) = self.activity.least_busy_peer(of.availability, &connections) else {
            tracing::debug!(repo = %repo_id, name = %f.name, "no connected peer has the file");
            of.err = Some(PullError::NoSourcePeer);
            if of.file.take().is_some() {
                let _ = tokio::fs::remove_file(&of.temp).await;
            }
            if last {
                self.open_files.remove(&f.name);
            }
            return true;
        };

        of.outstanding += 1;
        tracing::debug!(
            repo = %repo_id,
            name = %f.name,
            offset = block.offset,
            size = block.size,
            peer = %peer,
            outstanding = of.outstanding,
            "requesting block"
        );

        let model = Arc::clone(&self.model);
        let results = self.results_tx.clone();
        let file = f.clone();
        tokio::spawn(async move {
            let data = model
                .request_global(&peer, &repo_id, &file.name, block.offset, block.size)
                .await;
            let _ = results
                .send(RequestResult {
                    peer,
                    file,
                    offset: block.offset,
                    data,
                })
                .await;
        });

        false
    }

    /// Closes out a file that has nothing left to fetch: a deletion
    /// tombstone, a metadata-only change, or an empty file.
    async fn handle_empty_block(&mut self, f: &FileInfo, last: bool) {
        let Some(mut of) = self.open_files.remove(&f.name) else {
            return;
        };
        if last {
            of.file.take();
        }

        if f.is_deleted() {
            tracing::debug!(repo = %self.repo.id, name = %f.name, "applying delete tombstone");
            let _ = tokio::fs::remove_file(&of.temp).await;
            let _ = fsutil::make_writable(&of.dest);

            let removed = if let Some(v) = &self.versioner {
                match v.archive(&of.dest) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(
                            path = %of.dest.display(),
                            error = %err,
                            "archiving deleted file failed"
                        );
                        false
                    }
                }
            } else {
                match tokio::fs::remove_file(&of.dest).await {
                    Ok(()) => true,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
                    Err(err) => {
                        tracing::debug!(
                            path = %of.dest.display(),
                            error = %err,
                            "removing deleted file failed"
                        );
                        false
                    }
                }
            };
            if removed {
                self.model.update_local(&self.repo.id, f.clone());
            }
            return;
        }

        tracing::debug!(repo = %self.repo.id, name = %f.name, "no blocks to fetch; finishing file");
        if let Err(err) = fsutil::set_mtime(&of.temp, f.modified) {
            tracing::debug!(path = %of.temp.display(), error = %err, "restoring modification time failed");
            let _ = tokio::fs::remove_file(&of.temp).await;
            return;
        }
        if !self.repo.ignore_perms && f.has_permission_bits() {
            if let Err(err) = fsutil::set_mode(&of.temp, f.mode()) {
                tracing::debug!(path = %of.temp.display(), error = %err, "restoring mode failed");
                let _ = tokio::fs::remove_file(&of.temp).await;
                return;
            }
        }
        match fsutil::rename_overwrite(&of.temp, &of.dest).await {
            Ok(()) => self.model.update_local(&self.repo.id, f.clone()),
            Err(err) => tracing::debug!(
                from = %of.temp.display(),
                to = %of.dest.display(),
                error = %err,
                "renaming assembled file failed"
            ),
        }
    }

    /// Verifies the assembled temp against the target block list, then
    /// moves it into place. Failures leave the file in need; the next
    /// cycle retries it.
    async fn close_file(&mut self, f: &FileInfo) {
        let Some(mut of) = self.open_files.remove(&f.name) else {
            return;
        };
        of.file.take();
        tracing::debug!(repo = %self.repo.id, name = %f.name, "verifying and closing file");

        if let Err(err) = self.finalize_file(&of, f).await {
            tracing::debug!(
                repo = %self.repo.id,
                name = %f.name,
                error = %err,
                "finalize failed; leaving file in need"
            );
        }

        // On success the rename moved the temp away; otherwise this
        // cleans up the partial assembly.
        match tokio::fs::remove_file(&of.temp).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::debug!(path = %of.temp.display(), error = %err, "removing temp failed");
            }
        }
    }

    async fn finalize_file(&self, of: &OpenFile, f: &FileInfo) -> Result<(), PullError> {
        let mut fd = tokio::fs::File::open(&of.temp)
            .await
            .map_err(|source| PullError::Io {
                op: "open",
                path: of.temp.clone(),
                source,
            })?;
        let hashed = blocks::hash_blocks(&mut fd, STANDARD_BLOCK_SIZE)
            .await
            .map_err(|source| PullError::Io {
                op: "read",
                path: of.temp.clone(),
                source,
            })?;
        drop(fd);

        if hashed.len() != f.blocks.len() {
            return Err(PullError::BlockCountMismatch {
                path: of.temp.clone(),
                expected: f.blocks.len(),
                actual: hashed.len(),
            });
        }
        for (i, (hb, tb)) in hashed.iter().zip(f.blocks.iter()).enumerate() {
            if hb.hash != tb.hash {
                return Err(PullError::HashMismatch {
                    path: of.temp.clone(),
                    block: i,
                });
            }
        }

        if let Err(err) = fsutil::set_mtime(&of.temp, f.modified) {
            tracing::debug!(path = %of.temp.display(), error = %err, "restoring modification time failed");
        }
        if !self.repo.ignore_perms && f.has_permission_bits() {
            if let Err(err) = fsutil::set_mode(&of.temp, f.mode()) {
                tracing::debug!(path = %of.temp.display(), error = %err, "restoring mode failed");
            }
        }

        if let Some(v) = &self.versioner {
            v.archive(&of.dest).map_err(|source| PullError::Io {
                op: "archive",
                path: of.dest.clone(),
                source,
            })?;
        }

        tracing::debug!(
            repo = %self.repo.id,
            name = %f.name,
            dest = %of.dest.display(),
            "renaming assembled file into place"
        );
        fsutil::rename_overwrite(&of.temp, &of.dest)
            .await
            .map_err(|source| PullError::Io {
                op: "rename",
                path: of.dest.clone(),
                source,
            })?;
        self.model.update_local(&self.repo.id, f.clone());
        Ok(())
    }

    /// Drops the bookkeeping of a failed file and cleans its temp. The
    /// next reconciliation cycle re-enqueues the file if still needed.
    async fn drop_failed_file(&mut self, name: &str) {
        let Some(of) = self.open_files.remove(name) else {
            return;
        };
        drop(of.file);
        match tokio::fs::remove_file(&of.temp).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::debug!(path = %of.temp.display(), error = %err, "removing temp of failed file");
            }
        }
        tracing::debug!(repo = %self.repo.id, name, "dropped failed file; will retry next cycle");
    }

    /// Restores directory metadata and removes tombstoned directories,
    /// deepest first, repeating until the tree stops changing.
    fn fixup_directories(&self) {
        for pass in 0..MAX_FIXUP_PASSES {
            let mut changed = 0usize;
            let mut delete_dirs: Vec<PathBuf> = Vec::new();

            let walker = WalkDir::new(&self.repo.directory)
                .into_iter()
                .filter_entry(|e| e.file_name() != std::ffi::OsStr::new(VERSIONS_DIR));
            for entry in walker {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_dir() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&self.repo.directory) else {
                    continue;
                };
                if rel.as_os_str().is_empty() {
                    continue;
                }
                let Some(rel_name) = rel.to_str() else {
                    continue;
                };

                let Some(cur) = self.model.current_file(&self.repo.id, rel_name) else {
                    tracing::debug!(name = rel_name, "directory not in model");
                    continue;
                };

                if cur.is_deleted() {
                    // The walk is parents-first; deleting in reverse
                    // order empties subtrees before their parents.
                    delete_dirs.push(entry.path().to_path_buf());
                    continue;
                }

                let Ok(md) = entry.metadata() else { continue };

                if !self.repo.ignore_perms
                    && cur.has_permission_bits()
                    && !fsutil::modes_equal(cur.mode(), fsutil::mode_of(&md))
                {
                    match fsutil::set_mode(entry.path(), cur.mode()) {
                        Ok(()) => changed += 1,
                        Err(err) => tracing::warn!(
                            path = %entry.path().display(),
                            error = %err,
                            "restoring directory mode failed"
                        ),
                    }
                }

                if cur.modified != fsutil::mtime_of(&md) {
                    match fsutil::set_mtime(entry.path(), cur.modified) {
                        Ok(()) => changed += 1,
                        Err(err) => tracing::warn!(
                            path = %entry.path().display(),
                            error = %err,
                            "restoring directory modification time failed"
                        ),
                    }
                }
            }

            let mut deleted = 0usize;
            for dir in delete_dirs.iter().rev() {
                match std::fs::remove_dir(dir) {
                    Ok(()) => deleted += 1,
                    Err(err) => {
                        // Leftover content is expected with a versioner:
                        // the archive keeps part of the subtree alive.
                        if self.versioner.is_none()
                            && warn_throttled("fixup-delete-dir", Duration::from_secs(60))
                        {
                            tracing::warn!(
                                path = %dir.display(),
                                error = %err,
                                "removing deleted directory failed"
                            );
                        }
                    }
                }
            }

            tracing::debug!(repo = %self.repo.id, pass, changed, deleted, "directory fixup pass");
            if changed + deleted == 0 {
                return;
            }
        }
        tracing::warn!(repo = %self.repo.id, "directory fixup did not converge");
    }
}

/// Reads one block from `src` at its offset and writes it at the same
/// offset in `dst`.
async fn copy_block(
    src: &mut tokio::fs::File,
    dst: &mut tokio::fs::File,
    block: &BlockInfo,
    buf: &mut [u8],
    src_path: &std::path::Path,
    dst_path: &std::path::Path,
) -> Result<(), PullError> {
    let read = async {
        src.seek(SeekFrom::Start(block.offset)).await?;
        src.read_exact(buf).await
    }
    .await;
    if let Err(source) = read {
        return Err(PullError::Io {
            op: "read",
            path: src_path.to_path_buf(),
            source,
        });
    }
    let write = async {
        dst.seek(SeekFrom::Start(block.offset)).await?;
        dst.write_all(buf).await
    }
    .await;
    if let Err(source) = write {
        return Err(PullError::Io {
            op: "write",
            path: dst_path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
