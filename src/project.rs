//! Project root discovery, per-project data directories, and the writer lock.
//!
//! The root is found by walking upward until a `.git` entry or an existing
//! `.osgrep` data directory appears. Git worktrees are honored: a `.git`
//! *file* points at the worktree's private gitdir, whose `commondir` file
//! locates the main repository root.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

use crate::error::{Error, Result};

/// Name of the per-project data directory.
pub const DATA_DIR_NAME: &str = ".osgrep";

/// Per-project filesystem layout.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub data_dir: PathBuf,
}

impl ProjectPaths {
    /// Discover the project root starting at `start` and lay out the data
    /// directory, creating it (and a `.gitignore` entry) on first use.
    pub fn discover(start: &Path) -> Result<Self> {
        let root = find_project_root(start)?;
        let paths = Self {
            data_dir: root.join(DATA_DIR_NAME),
            root,
        };
        paths.ensure()?;
        Ok(paths)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("lancedb")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("lmdb")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("LOCK")
    }

    fn ensure(&self) -> Result<()> {
        let first_time = !self.data_dir.exists();
        fs::create_dir_all(self.store_dir())?;
        fs::create_dir_all(self.meta_dir())?;
        fs::create_dir_all(self.logs_dir())?;
        if first_time {
            add_gitignore_entry(&self.root);
        }
        Ok(())
    }
}

/// Walk upward from `start` looking for `.git` or an existing data dir.
fn find_project_root(start: &Path) -> Result<PathBuf> {
    let start = start
        .canonicalize()
        .map_err(|_| Error::FileVanished(start.to_path_buf()))?;

    let mut dir: &Path = &start;
    loop {
        let git = dir.join(".git");
        if git.is_dir() {
            return Ok(dir.to_path_buf());
        }
        if git.is_file() {
            // Worktree: `.git` is a file `gitdir: <path>`; the gitdir's
            // `commondir` file points back into the main repo's .git.
            if let Some(main_root) = resolve_worktree_root(&git) {
                return Ok(main_root);
            }
            return Ok(dir.to_path_buf());
        }
        if dir.join(DATA_DIR_NAME).is_dir() {
            return Ok(dir.to_path_buf());
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return Ok(start),
        }
    }
}

fn resolve_worktree_root(git_file: &Path) -> Option<PathBuf> {
    let contents = fs::read_to_string(git_file).ok()?;
    let gitdir = contents.strip_prefix("gitdir:")?.trim();
    let mut gitdir = PathBuf::from(gitdir);
    if gitdir.is_relative() {
        gitdir = git_file.parent()?.join(gitdir);
    }

    let commondir_file = gitdir.join("commondir");
    let common = fs::read_to_string(commondir_file).ok()?;
    let mut common_dir = PathBuf::from(common.trim());
    if common_dir.is_relative() {
        common_dir = gitdir.join(common_dir);
    }
    let common_dir = common_dir.canonicalize().ok()?;

    // commondir is the main repo's .git directory; its parent is the root.
    common_dir.parent().map(|p| p.to_path_buf())
}

fn add_gitignore_entry(root: &Path) {
    let gitignore = root.join(".gitignore");
    let entry = format!("{DATA_DIR_NAME}/");

    let existing = fs::read_to_string(&gitignore).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == entry || l.trim() == DATA_DIR_NAME) {
        return;
    }

    let result = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&gitignore)
        .and_then(|mut f| {
            if !existing.is_empty() && !existing.ends_with('\n') {
                writeln!(f)?;
            }
            writeln!(f, "{entry}")
        });
    if let Err(e) = result {
        tracing::warn!("Could not add {entry} to .gitignore: {e}");
    }
}

/// Global (per-user) layout: `~/.osgrep/{models,grammars,servers.json,data}`.
pub fn global_dir() -> PathBuf {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(base).join(DATA_DIR_NAME)
}

pub fn models_dir(model_id: &str) -> PathBuf {
    global_dir().join("models").join(model_id)
}

/// Contents of the `LOCK` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockBody {
    pid: u32,
    start_time_ms: u64,
    host: String,
    #[serde(default = "Utc::now")]
    acquired_at: DateTime<Utc>,
}

/// Exclusive writer lock for a project. Released (file deleted) on drop.
///
/// A lock whose owning process is gone, or whose recorded start time no
/// longer matches the process at that pid, is treated as stale and
/// overwritten. Readers never take this lock.
pub struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    pub fn acquire(paths: &ProjectPaths) -> Result<Self> {
        let path = paths.lock_path();

        if let Ok(data) = fs::read_to_string(&path) {
            if let Ok(body) = serde_json::from_str::<LockBody>(&data) {
                if body.host == hostname() && process_matches(body.pid, body.start_time_ms) {
                    return Err(Error::LockHeld {
                        pid: body.pid,
                        host: body.host,
                    });
                }
                tracing::info!("{}", Error::LockStale { pid: body.pid });
            }
        }

        let body = LockBody {
            pid: std::process::id(),
            start_time_ms: own_start_time_ms(),
            host: hostname(),
            acquired_at: Utc::now(),
        };
        let data = serde_json::to_string(&body).map_err(|e| Error::Other(e.into()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        Ok(Self { path })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

fn process_start_time_ms(pid: u32) -> Option<u64> {
    let refresh =
        RefreshKind::new().with_processes(ProcessRefreshKind::new());
    let sys = System::new_with_specifics(refresh);
    sys.process(Pid::from_u32(pid))
        .map(|p| p.start_time() * 1_000)
}

fn own_start_time_ms() -> u64 {
    process_start_time_ms(std::process::id()).unwrap_or(0)
}

/// True when a live process at `pid` has the recorded start time. Pid reuse
/// after a reboot or crash shows up as a start-time mismatch.
fn process_matches(pid: u32, recorded_start_ms: u64) -> bool {
    match process_start_time_ms(pid) {
        Some(actual) => recorded_start_ms == 0 || actual == recorded_start_ms,
        None => false,
    }
}
