//! Version-control history seen by the protocol.
//!
//! [`GitHistory`] shells out to `git` in the working copy. [`MemoryHistory`] is a small
//! commit graph used to exercise ancestry and staleness rules without a repository.

use crate::core::error::BrainError;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;
use tracing::debug;

pub trait History {
    /// Commit id of `HEAD`, or `None` in a repository without commits.
    fn head(&self) -> Result<Option<String>, BrainError>;
    fn current_branch(&self) -> Result<Option<String>, BrainError>;
    /// Resolve a revision to a commit id; `None` if it does not exist.
    fn resolve(&self, rev: &str) -> Result<Option<String>, BrainError>;
    /// True iff `ancestor` is reachable from (or equal to) `descendant`.
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, BrainError>;
    /// Number of commits reachable from `tip` but not from `from`.
    fn commits_behind(&self, from: &str, tip: &str) -> Result<u64, BrainError>;
    fn stage(&self, paths: &[PathBuf]) -> Result<(), BrainError>;
    /// Repository-relative paths in the index that differ from `HEAD`.
    fn staged_paths(&self) -> Result<Vec<String>, BrainError>;
    fn unmerged_paths(&self) -> Result<Vec<String>, BrainError>;
    /// Commit the index; returns the new commit id.
    fn commit(&self, message: &str) -> Result<String, BrainError>;
    fn fetch_all(&self) -> Result<(), BrainError>;
    fn push(&self, remote: &str, branch: &str) -> Result<(), BrainError>;
    /// Remote-tracking branches whose short name starts with `prefix` (e.g. `origin/dev/`).
    fn remote_branches(&self, prefix: &str) -> Result<Vec<String>, BrainError>;
    /// Files under `dir` in the tree of `rev`.
    fn list_files(&self, rev: &str, dir: &str) -> Result<Vec<String>, BrainError>;
    fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>, BrainError>;
}

pub struct GitHistory {
    repo_root: PathBuf,
}

impl GitHistory {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn output(&self, args: &[&str]) -> Result<std::process::Output, BrainError> {
        debug!(args = ?args, "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(BrainError::IoError)
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    pub fn run(&self, args: &[&str]) -> Result<String, BrainError> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(BrainError::GitError {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run git with `input` on stdin and return trimmed stdout.
    pub fn run_with_input(&self, args: &[&str], input: &str) -> Result<String, BrainError> {
        debug!(args = ?args, "git (stdin)");
        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(BrainError::GitError {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Like [`GitHistory::run`] but hands back a failed exit instead of an error.
    pub fn try_run(&self, args: &[&str]) -> Result<Result<String, String>, BrainError> {
        let output = self.output(args)?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(Ok(stdout))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    fn lines(&self, args: &[&str]) -> Result<Vec<String>, BrainError> {
        Ok(self
            .run(args)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl History for GitHistory {
    fn head(&self) -> Result<Option<String>, BrainError> {
        self.resolve("HEAD")
    }

    fn current_branch(&self) -> Result<Option<String>, BrainError> {
        let branch = self.run(&["branch", "--show-current"])?;
        Ok(if branch.is_empty() { None } else { Some(branch) })
    }

    fn resolve(&self, rev: &str) -> Result<Option<String>, BrainError> {
        let spec = format!("{}^{{commit}}", rev);
        let output = self.output(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if id.is_empty() { None } else { Some(id) })
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, BrainError> {
        // Unknown objects make merge-base exit 128; treat them as "not an ancestor".
        if self.resolve(ancestor)?.is_none() || self.resolve(descendant)?.is_none() {
            return Ok(false);
        }
        let output = self.output(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(BrainError::GitError {
                command: format!("merge-base --is-ancestor {} {}", ancestor, descendant),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn commits_behind(&self, from: &str, tip: &str) -> Result<u64, BrainError> {
        // An unborn `from` (no commits yet) is behind by everything reachable from `tip`.
        let range = match self.resolve(from)? {
            Some(_) => format!("{}..{}", from, tip),
            None => tip.to_string(),
        };
        let count = self.run(&["rev-list", "--count", &range])?;
        count
            .parse::<u64>()
            .map_err(|e| BrainError::ValidationError(format!("rev-list count '{}': {}", count, e)))
    }

    fn stage(&self, paths: &[PathBuf]) -> Result<(), BrainError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(paths.iter().map(|p| p.to_string_lossy().to_string()));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).map(|_| ())
    }

    fn staged_paths(&self) -> Result<Vec<String>, BrainError> {
        if self.head()?.is_none() {
            // No HEAD yet: everything in the index is staged.
            return self.lines(&["ls-files", "--cached"]);
        }
        self.lines(&["diff", "--cached", "--name-only", "--no-renames"])
    }

    fn unmerged_paths(&self) -> Result<Vec<String>, BrainError> {
        self.lines(&["diff", "--name-only", "--diff-filter=U"])
    }

    fn commit(&self, message: &str) -> Result<String, BrainError> {
        self.run(&["commit", "-m", message])?;
        self.head()?.ok_or_else(|| BrainError::GitError {
            command: "commit".to_string(),
            stderr: "HEAD missing after commit".to_string(),
        })
    }

    fn fetch_all(&self) -> Result<(), BrainError> {
        self.run(&["fetch", "--all", "--quiet"]).map(|_| ())
    }

    fn push(&self, remote: &str, branch: &str) -> Result<(), BrainError> {
        self.run(&["push", "-u", remote, branch]).map(|_| ())
    }

    fn remote_branches(&self, prefix: &str) -> Result<Vec<String>, BrainError> {
        let pattern = format!("refs/remotes/{}", prefix);
        Ok(self
            .lines(&["for-each-ref", "--format=%(refname:short)", &pattern])?
            .into_iter()
            .filter(|b| b.starts_with(prefix))
            .collect())
    }

    fn list_files(&self, rev: &str, dir: &str) -> Result<Vec<String>, BrainError> {
        let output = self.output(&["ls-tree", "-r", "--name-only", rev, "--", dir])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>, BrainError> {
        let spec = format!("{}:{}", rev, path);
        let output = self.output(&["show", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()))
    }
}

#[derive(Debug, Default)]
struct Graph {
    parents: HashMap<String, Vec<String>>,
    refs: HashMap<String, String>,
    branch: Option<String>,
    head: Option<String>,
    index: BTreeSet<String>,
    files: HashMap<String, HashMap<String, String>>,
    next_id: u64,
}

impl Graph {
    fn ancestors(&self, from: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(parents) = self.parents.get(&id) {
                queue.extend(parents.iter().cloned());
            }
        }
        seen
    }

    fn resolve(&self, rev: &str) -> Option<String> {
        if rev == "HEAD" {
            return self.head.clone();
        }
        if self.parents.contains_key(rev) {
            return Some(rev.to_string());
        }
        self.refs.get(rev).cloned()
    }
}

/// In-memory commit graph. Clones share state, so a test can keep a handle after boxing.
#[derive(Debug, Clone, Default)]
pub struct MemoryHistory {
    graph: Rc<RefCell<Graph>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        let history = Self::default();
        history.graph.borrow_mut().branch = Some("main".to_string());
        history
    }

    /// Add a commit on top of `parents` without moving `HEAD`.
    pub fn add_commit(&self, parents: &[&str]) -> String {
        let mut g = self.graph.borrow_mut();
        g.next_id += 1;
        let id = format!("c{:04}", g.next_id);
        g.parents
            .insert(id.clone(), parents.iter().map(|p| p.to_string()).collect());
        id
    }

    /// Commit on top of `HEAD` and advance it.
    pub fn advance_head(&self) -> String {
        let head = self.graph.borrow().head.clone();
        let parents: Vec<&str> = head.as_deref().into_iter().collect();
        let id = self.add_commit(&parents);
        self.checkout(&id);
        id
    }

    pub fn checkout(&self, commit: &str) {
        let mut g = self.graph.borrow_mut();
        g.head = Some(commit.to_string());
        if let Some(branch) = g.branch.clone() {
            g.refs.insert(branch, commit.to_string());
        }
    }

    pub fn set_ref(&self, name: &str, commit: &str) {
        self.graph
            .borrow_mut()
            .refs
            .insert(name.to_string(), commit.to_string());
    }

    pub fn set_branch(&self, branch: Option<&str>) {
        self.graph.borrow_mut().branch = branch.map(str::to_string);
    }

    pub fn put_file(&self, rev: &str, path: &str, contents: &str) {
        self.graph
            .borrow_mut()
            .files
            .entry(rev.to_string())
            .or_default()
            .insert(path.to_string(), contents.to_string());
    }

    /// Mark repository-relative paths as staged.
    pub fn stage_paths(&self, paths: &[&str]) {
        let mut g = self.graph.borrow_mut();
        g.index.extend(paths.iter().map(|p| p.to_string()));
    }
}

impl History for MemoryHistory {
    fn head(&self) -> Result<Option<String>, BrainError> {
        Ok(self.graph.borrow().head.clone())
    }

    fn current_branch(&self) -> Result<Option<String>, BrainError> {
        Ok(self.graph.borrow().branch.clone())
    }

    fn resolve(&self, rev: &str) -> Result<Option<String>, BrainError> {
        Ok(self.graph.borrow().resolve(rev))
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, BrainError> {
        let g = self.graph.borrow();
        let (Some(a), Some(d)) = (g.resolve(ancestor), g.resolve(descendant)) else {
            return Ok(false);
        };
        Ok(g.ancestors(&d).contains(&a))
    }

    fn commits_behind(&self, from: &str, tip: &str) -> Result<u64, BrainError> {
        let g = self.graph.borrow();
        let tip = g
            .resolve(tip)
            .ok_or_else(|| BrainError::NotFound(format!("revision {}", tip)))?;
        let reachable = g.resolve(from).map(|f| g.ancestors(&f)).unwrap_or_default();
        Ok(g.ancestors(&tip).difference(&reachable).count() as u64)
    }

    fn stage(&self, paths: &[PathBuf]) -> Result<(), BrainError> {
        let mut g = self.graph.borrow_mut();
        g.index
            .extend(paths.iter().map(|p| p.to_string_lossy().replace('\\', "/")));
        Ok(())
    }

    fn staged_paths(&self) -> Result<Vec<String>, BrainError> {
        Ok(self.graph.borrow().index.iter().cloned().collect())
    }

    fn unmerged_paths(&self) -> Result<Vec<String>, BrainError> {
        Ok(Vec::new())
    }

    fn commit(&self, _message: &str) -> Result<String, BrainError> {
        let id = self.advance_head();
        self.graph.borrow_mut().index.clear();
        Ok(id)
    }

    fn fetch_all(&self) -> Result<(), BrainError> {
        Ok(())
    }

    fn push(&self, _remote: &str, _branch: &str) -> Result<(), BrainError> {
        Ok(())
    }

    fn remote_branches(&self, prefix: &str) -> Result<Vec<String>, BrainError> {
        let g = self.graph.borrow();
        let mut branches: Vec<String> = g
            .refs
            .keys()
            .filter(|r| r.starts_with(prefix))
            .cloned()
            .collect();
        branches.sort();
        Ok(branches)
    }

    fn list_files(&self, rev: &str, dir: &str) -> Result<Vec<String>, BrainError> {
        let g = self.graph.borrow();
        let mut files: Vec<String> = g
            .files
            .get(rev)
            .map(|f| f.keys().filter(|p| p.starts_with(dir)).cloned().collect())
            .unwrap_or_default();
        files.sort();
        Ok(files)
    }

    fn show_file(&self, rev: &str, path: &str) -> Result<Option<String>, BrainError> {
        Ok(self
            .graph
            .borrow()
            .files
            .get(rev)
            .and_then(|f| f.get(path))
            .cloned())
    }
}
