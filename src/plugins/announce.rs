//! Broadcast announcements over one shared ref.
//!
//! Every participant appends to the same file on the same ref, so publishing is a
//! compare-and-swap on the ref's tip. A publisher that loses the race re-reads the tip and
//! tries again a bounded number of times.

use crate::core::error::BrainError;
use crate::core::event::{Event, EventKind};
use crate::core::history::GitHistory;
use crate::core::output::one_line;
use crate::core::workspace::Workspace;
use crate::plugins::identity::Identity;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, info, warn};

const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// The shared ref's tip and the announcement file at that tip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub tip: Option<String>,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted(String),
    /// The ref moved since `base` was read.
    Rejected,
}

pub trait SharedRef {
    fn fetch(&self) -> Result<Snapshot, BrainError>;
    /// Publish `contents` as a new tip whose parent is `base`, iff the ref still points at `base`.
    fn publish(
        &self,
        base: Option<&str>,
        contents: &str,
        message: &str,
    ) -> Result<PublishOutcome, BrainError>;
}

/// The shared ref as a git branch, written with plumbing so the working tree is untouched.
pub struct GitSharedRef {
    git: GitHistory,
    remote: Option<String>,
    branch: String,
    file: String,
}

impl GitSharedRef {
    pub fn new(ws: &Workspace) -> Result<Self, BrainError> {
        let git = GitHistory::new(ws.root());
        let remotes = git.run(&["remote"])?;
        let remote = remotes
            .lines()
            .any(|r| r.trim() == ws.config.remote)
            .then(|| ws.config.remote.clone());
        Ok(Self {
            git,
            remote,
            branch: ws.config.announce_ref.clone(),
            file: ws.config.announce_file.clone(),
        })
    }

    fn tracking_ref(&self) -> String {
        match &self.remote {
            Some(remote) => format!("refs/remotes/{}/{}", remote, self.branch),
            None => format!("refs/heads/{}", self.branch),
        }
    }

    /// Build `file` as the only entry of a fresh tree; returns the root tree id.
    fn write_tree(&self, contents: &str) -> Result<String, BrainError> {
        let blob = self
            .git
            .run_with_input(&["hash-object", "-w", "--stdin"], contents)?;
        let mut components: Vec<&str> = Path::new(&self.file)
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        let file_name = components
            .pop()
            .ok_or_else(|| BrainError::ValidationError("announce_file is empty".to_string()))?;
        let mut tree = self
            .git
            .run_with_input(&["mktree"], &format!("100644 blob {}\t{}\n", blob, file_name))?;
        while let Some(dir) = components.pop() {
            tree = self
                .git
                .run_with_input(&["mktree"], &format!("040000 tree {}\t{}\n", tree, dir))?;
        }
        Ok(tree)
    }
}

fn is_rejection(stderr: &str) -> bool {
    ["[rejected]", "non-fast-forward", "fetch first", "stale info", "cannot lock ref"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

impl SharedRef for GitSharedRef {
    fn fetch(&self) -> Result<Snapshot, BrainError> {
        if let Some(remote) = &self.remote {
            let refspec = format!("+refs/heads/{}:{}", self.branch, self.tracking_ref());
            if let Err(stderr) = self.git.try_run(&["fetch", "--quiet", remote, &refspec])? {
                debug!(%stderr, "announce ref fetch failed; using last known tip");
            }
        }
        let tracking = self.tracking_ref();
        let tip = self
            .git
            .try_run(&["rev-parse", "--verify", "--quiet", &tracking])?
            .ok();
        let contents = match &tip {
            Some(tip) => self
                .git
                .try_run(&["show", &format!("{}:{}", tip, self.file)])?
                .map(|c| format!("{}\n", c))
                .unwrap_or_default(),
            None => String::new(),
        };
        Ok(Snapshot { tip, contents })
    }

    fn publish(
        &self,
        base: Option<&str>,
        contents: &str,
        message: &str,
    ) -> Result<PublishOutcome, BrainError> {
        let tree = self.write_tree(contents)?;
        let mut args = vec!["commit-tree", tree.as_str()];
        if let Some(parent) = base {
            args.extend(["-p", parent]);
        }
        args.extend(["-m", message]);
        let commit = self.git.run(&args)?;

        match &self.remote {
            Some(remote) => {
                let refspec = format!("{}:refs/heads/{}", commit, self.branch);
                match self.git.try_run(&["push", "--quiet", remote, &refspec])? {
                    Ok(_) => {
                        self.git
                            .run(&["update-ref", &self.tracking_ref(), &commit])?;
                        Ok(PublishOutcome::Accepted(commit))
                    }
                    Err(stderr) if is_rejection(&stderr) => Ok(PublishOutcome::Rejected),
                    Err(stderr) => Err(BrainError::GitError {
                        command: format!("push {} {}", remote, refspec),
                        stderr,
                    }),
                }
            }
            None => {
                let old = base.unwrap_or(ZERO_OID);
                match self
                    .git
                    .try_run(&["update-ref", &self.tracking_ref(), &commit, old])?
                {
                    Ok(_) => Ok(PublishOutcome::Accepted(commit)),
                    Err(_) => Ok(PublishOutcome::Rejected),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryRefState {
    tip: Option<String>,
    contents: String,
    publishes: u64,
}

/// Compare-and-swap ref held in memory. Clones share the ref.
#[derive(Debug, Clone, Default)]
pub struct MemorySharedRef {
    state: Rc<RefCell<MemoryRefState>>,
}

impl MemorySharedRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.state.borrow().contents.clone()
    }
}

impl SharedRef for MemorySharedRef {
    fn fetch(&self) -> Result<Snapshot, BrainError> {
        let state = self.state.borrow();
        Ok(Snapshot {
            tip: state.tip.clone(),
            contents: state.contents.clone(),
        })
    }

    fn publish(
        &self,
        base: Option<&str>,
        contents: &str,
        _message: &str,
    ) -> Result<PublishOutcome, BrainError> {
        let mut state = self.state.borrow_mut();
        if state.tip.as_deref() != base {
            return Ok(PublishOutcome::Rejected);
        }
        state.publishes += 1;
        let tip = format!("a{:04}", state.publishes);
        state.tip = Some(tip.clone());
        state.contents = contents.to_string();
        Ok(PublishOutcome::Accepted(tip))
    }
}

/// Publish `body` to every participant.
pub fn announce(
    ws: &Workspace,
    shared: &dyn SharedRef,
    identity: &Identity,
    body: &str,
) -> Result<Event, BrainError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(BrainError::ValidationError(
            "announcement cannot be empty".to_string(),
        ));
    }
    let event = ws.build_event(
        identity,
        EventKind::Announce {
            body: body.to_string(),
            source_branch: ws.history.current_branch()?,
            head_commit: ws.history.head()?,
        },
    )?;
    let line = event.to_line()?;
    let message = format!("announce: {}: {}", identity.short_name, one_line(body, 50));

    let attempts = ws.config.announce_max_attempts;
    for attempt in 1..=attempts {
        let snapshot = shared.fetch()?;
        let mut contents = snapshot.contents;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&line);
        contents.push('\n');
        match shared.publish(snapshot.tip.as_deref(), &contents, &message)? {
            PublishOutcome::Accepted(tip) => {
                info!(%tip, attempt, "announcement published");
                return Ok(event);
            }
            PublishOutcome::Rejected => {
                debug!(attempt, "shared ref moved; retrying announcement");
            }
        }
    }
    Err(BrainError::AnnouncePushExhausted { attempts })
}

/// Announcements on the shared ref, newest first.
pub fn listen(shared: &dyn SharedRef, limit: usize) -> Result<Vec<Event>, BrainError> {
    let snapshot = shared.fetch()?;
    let mut events: Vec<Event> = snapshot
        .contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match Event::from_line(line) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "skipping malformed announcement");
                None
            }
        })
        .filter(|e| matches!(e.kind, EventKind::Announce { .. }))
        .collect();
    events.reverse();
    events.sort_by(|a, b| b.ts.cmp(&a.ts));
    events.truncate(limit);
    Ok(events)
}
