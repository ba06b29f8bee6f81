//! Process pool for embedding workers.
//!
//! N child processes (default 1, hard-capped) each run the `worker`
//! subcommand and speak the JSON-lines protocol. The pool owns the pending
//! request map; workers never share memory with the parent. A worker is
//! declared dead when it exits, when a request outlives the task timeout, or
//! when its self-reported resident set crosses the cap; its pending requests
//! are rejected with `WorkerRestart` and a replacement is spawned at the
//! same index after a short cooldown. Concurrent restart triggers for the
//! same index are absorbed by the restart already in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch, Notify};
use uuid::Uuid;

use super::protocol::{RequestBody, ResponseBody, WireRequest, WireResponse};
use super::{CandidateGrid, Embedder, HybridEmbedding, QueryEmbedding};
use crate::config::{Config, MAX_WORKER_RSS};
use crate::error::{Error, Result};
use crate::models::ChunkRecord;

/// Pause before a replacement worker is spawned.
const RESTART_COOLDOWN: Duration = Duration::from_millis(250);
/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(1_500);

/// How worker processes are launched. The default re-executes the current
/// binary with the `worker` subcommand; tests substitute scripted stand-ins.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe().map_err(Error::Io)?,
            args: vec!["worker".to_string()],
        })
    }
}

struct WorkerHandle {
    index: usize,
    generation: u64,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
}

struct Pending {
    tx: oneshot::Sender<Result<ResponseBody>>,
    worker_index: usize,
    generation: u64,
}

struct PoolInner {
    config: Config,
    command: WorkerCommand,
    workers: Mutex<Vec<Option<Arc<WorkerHandle>>>>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    restarts: Mutex<HashMap<usize, watch::Receiver<bool>>>,
    next_worker: AtomicUsize,
    generation: AtomicU64,
    ready: Notify,
    shutting_down: AtomicBool,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn the configured number of workers. A worker that fails to spawn
    /// leaves its slot empty; requests fail with `NoWorker` only when no
    /// slot fills within the startup window.
    pub async fn start(config: Config, command: WorkerCommand) -> Result<Self> {
        let count = config.worker_count.clamp(1, crate::config::WORKER_HARD_CAP);
        let inner = Arc::new(PoolInner {
            config,
            command,
            workers: Mutex::new((0..count).map(|_| None).collect()),
            pending: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
            next_worker: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            ready: Notify::new(),
            shutting_down: AtomicBool::new(false),
        });

        for index in 0..count {
            match spawn_worker(&inner, index) {
                Ok(handle) => {
                    inner.workers.lock()[index] = Some(handle);
                    inner.ready.notify_waiters();
                }
                Err(e) => {
                    tracing::warn!("Worker {index} failed to spawn: {e:#}");
                }
            }
        }

        Ok(Self { inner })
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    pub fn live_workers(&self) -> usize {
        self.inner.workers.lock().iter().flatten().count()
    }

    /// Send one request and await its response.
    async fn request(&self, body: RequestBody) -> Result<ResponseBody> {
        let inner = &self.inner;
        let handle = self.wait_for_worker().await?;

        let request = WireRequest::new(body);
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(
            id,
            Pending {
                tx,
                worker_index: handle.index,
                generation: handle.generation,
            },
        );

        let mut line = serde_json::to_string(&request)
            .map_err(|e| Error::WorkerProtocol(format!("encode request: {e}")))?;
        line.push('\n');

        {
            let mut stdin = handle.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                inner.pending.lock().remove(&id);
                tracing::warn!("Worker {} stdin write failed: {e}", handle.index);
                restart_worker(inner.clone(), handle.index, handle.generation);
                return Err(Error::WorkerRestart {
                    index: handle.index,
                });
            }
        }

        let timeout = Duration::from_millis(inner.config.task_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a verdict; treat as a restart casualty.
            Ok(Err(_)) => Err(Error::WorkerRestart {
                index: handle.index,
            }),
            Err(_) => {
                inner.pending.lock().remove(&id);
                tracing::warn!(
                    "Worker {} task exceeded {} ms, forcing restart",
                    handle.index,
                    inner.config.task_timeout_ms
                );
                restart_worker(inner.clone(), handle.index, handle.generation);
                Err(Error::WorkerTimeout {
                    index: handle.index,
                    timeout_ms: inner.config.task_timeout_ms,
                })
            }
        }
    }

    /// Round-robin among live workers, waiting up to the startup window.
    async fn wait_for_worker(&self) -> Result<Arc<WorkerHandle>> {
        let inner = &self.inner;
        let started = Instant::now();
        let window = Duration::from_millis(inner.config.worker_startup_ms);

        loop {
            if inner.shutting_down.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if let Some(handle) = self.pick() {
                return Ok(handle);
            }
            let elapsed = started.elapsed();
            if elapsed >= window {
                return Err(Error::NoWorker {
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let _ = tokio::time::timeout(window - elapsed, inner.ready.notified()).await;
        }
    }

    fn pick(&self) -> Option<Arc<WorkerHandle>> {
        let workers = self.inner.workers.lock();
        let n = workers.len();
        for _ in 0..n {
            let idx = self.inner.next_worker.fetch_add(1, Ordering::Relaxed) % n;
            if let Some(handle) = &workers[idx] {
                return Some(handle.clone());
            }
        }
        None
    }

    /// Terminate all workers (SIGTERM, then SIGKILL after the grace period)
    /// and reject anything still pending.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let handles: Vec<Arc<WorkerHandle>> = {
            let mut workers = self.inner.workers.lock();
            workers.iter_mut().filter_map(|slot| slot.take()).collect()
        };

        for handle in handles {
            terminate_handle(&handle).await;
        }

        let pending: Vec<Pending> = {
            let mut map = self.inner.pending.lock();
            map.drain().map(|(_, p)| p).collect()
        };
        for p in pending {
            let _ = p.tx.send(Err(Error::Cancelled));
        }
    }
}

#[async_trait::async_trait]
impl Embedder for WorkerPool {
    async fn compute_hybrid(&self, texts: &[String]) -> Result<Vec<HybridEmbedding>> {
        match self
            .request(RequestBody::ComputeHybrid {
                texts: texts.to_vec(),
            })
            .await?
        {
            ResponseBody::Hybrid { embeddings } => Ok(embeddings),
            other => Err(unexpected("hybrid", &other)),
        }
    }

    async fn encode_query(&self, text: &str) -> Result<QueryEmbedding> {
        match self
            .request(RequestBody::EncodeQuery {
                text: text.to_string(),
            })
            .await?
        {
            ResponseBody::Query { embedding } => Ok(embedding),
            other => Err(unexpected("query", &other)),
        }
    }

    async fn rerank(
        &self,
        query: &QueryEmbedding,
        candidates: &[CandidateGrid],
    ) -> Result<Vec<f32>> {
        match self
            .request(RequestBody::Rerank {
                query: query.colbert.clone(),
                query_token_ids: query.token_ids.clone(),
                candidates: candidates.to_vec(),
            })
            .await?
        {
            ResponseBody::Scores { scores } => Ok(scores),
            other => Err(unexpected("scores", &other)),
        }
    }

    async fn process_file(
        &self,
        path: &str,
        content: &str,
        hash: &str,
    ) -> Result<Vec<ChunkRecord>> {
        match self
            .request(RequestBody::ProcessFile {
                path: path.to_string(),
                content: content.to_string(),
                hash: hash.to_string(),
            })
            .await?
        {
            ResponseBody::Chunks { records } => Ok(records),
            other => Err(unexpected("chunks", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &ResponseBody) -> Error {
    let tag = match got {
        ResponseBody::Hybrid { .. } => "hybrid",
        ResponseBody::Query { .. } => "query",
        ResponseBody::Scores { .. } => "scores",
        ResponseBody::Chunks { .. } => "chunks",
    };
    Error::WorkerProtocol(format!("expected {wanted} response, got {tag}"))
}

/// Spawn a worker at `index` and start its response reader.
fn spawn_worker(inner: &Arc<PoolInner>, index: usize) -> Result<Arc<WorkerHandle>> {
    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let mut child = Command::new(&inner.command.program)
        .args(&inner.command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::WorkerProtocol("worker stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::WorkerProtocol("worker stdout unavailable".to_string()))?;

    let handle = Arc::new(WorkerHandle {
        index,
        generation,
        pid: child.id(),
        stdin: tokio::sync::Mutex::new(stdin),
        child: Mutex::new(Some(child)),
    });

    tracing::debug!("Worker {index} spawned (generation {generation}, pid {:?})", handle.pid);

    let reader_inner = inner.clone();
    tokio::spawn(read_responses(reader_inner, index, generation, stdout));

    Ok(handle)
}

/// Per-worker reader: completes pending requests, enforces the memory cap,
/// and triggers a restart when the stream ends.
async fn read_responses(
    inner: Arc<PoolInner>,
    index: usize,
    generation: u64,
    stdout: tokio::process::ChildStdout,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let response: WireResponse = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Worker {index} sent unparseable response: {e}");
                        continue;
                    }
                };

                let over_cap = response
                    .memory_rss
                    .is_some_and(|rss| rss > MAX_WORKER_RSS);

                let pending = {
                    let mut map = inner.pending.lock();
                    // Responses from a worker other than the recorded
                    // dispatcher are ignored (restart races).
                    let ours = map
                        .get(&response.id)
                        .is_some_and(|p| p.worker_index == index && p.generation == generation);
                    if ours {
                        map.remove(&response.id)
                    } else {
                        None
                    }
                };

                if let Some(p) = pending {
                    let result = match (response.ok, response.err) {
                        (Some(body), _) => Ok(body),
                        (None, Some(msg)) => Err(Error::WorkerProtocol(msg)),
                        (None, None) => {
                            Err(Error::WorkerProtocol("response carried no body".to_string()))
                        }
                    };
                    let _ = p.tx.send(result);
                }

                if over_cap {
                    tracing::warn!("Worker {index} resident set over cap, restarting");
                    restart_worker(inner.clone(), index, generation);
                    return;
                }
            }
            Ok(None) | Err(_) => {
                if !inner.shutting_down.load(Ordering::SeqCst) {
                    tracing::warn!("Worker {index} stdout closed, restarting");
                    restart_worker(inner.clone(), index, generation);
                }
                return;
            }
        }
    }
}

/// Kick off a restart of worker `index` unless one is already in flight for
/// it; the existing restart absorbs this trigger.
fn restart_worker(inner: Arc<PoolInner>, index: usize, generation: u64) {
    {
        let mut restarts = inner.restarts.lock();
        if restarts.contains_key(&index) {
            return;
        }
        let (tx, rx) = watch::channel(false);
        restarts.insert(index, rx);
        drop(restarts);

        tokio::spawn(async move {
            perform_restart(&inner, index, generation).await;
            inner.restarts.lock().remove(&index);
            let _ = tx.send(true);
        });
    }
}

async fn perform_restart(inner: &Arc<PoolInner>, index: usize, generation: u64) {
    // Only tear down the incarnation that was observed failing.
    let old = {
        let mut workers = inner.workers.lock();
        let same = workers[index]
            .as_ref()
            .is_some_and(|h| h.generation == generation);
        if same {
            workers[index].take()
        } else {
            None
        }
    };

    // Reject everything routed to the dead incarnation.
    let casualties: Vec<Pending> = {
        let mut map = inner.pending.lock();
        let ids: Vec<Uuid> = map
            .iter()
            .filter(|(_, p)| p.worker_index == index && p.generation == generation)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| map.remove(&id)).collect()
    };
    for p in casualties {
        let _ = p.tx.send(Err(Error::WorkerRestart { index }));
    }

    if let Some(handle) = old {
        terminate_handle(&handle).await;
    }

    if inner.shutting_down.load(Ordering::SeqCst) {
        return;
    }

    tokio::time::sleep(RESTART_COOLDOWN).await;

    match spawn_worker(inner, index) {
        Ok(handle) => {
            inner.workers.lock()[index] = Some(handle);
            inner.ready.notify_waiters();
            tracing::info!("Worker {index} replaced");
        }
        Err(e) => {
            tracing::error!("Worker {index} replacement failed to spawn: {e:#}");
        }
    }
}

/// SIGTERM, grace period, then SIGKILL.
async fn terminate_handle(handle: &WorkerHandle) {
    if let Some(pid) = handle.pid {
        send_sigterm(pid);
    }

    let child = handle.child.lock().take();
    if let Some(mut child) = child {
        match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
