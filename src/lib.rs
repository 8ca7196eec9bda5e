//! Brain: git-native coordination for agents sharing one repository
//!
//! **Brain lets independent participants coordinate through the git history they already
//! share.** There is no server: every piece of coordination state is an append-only event
//! that travels with ordinary commits, merges and pushes.
//!
//! # Protocol
//!
//! - **Identity**: each working copy owns one identity (`alice-red-joy`) and an Ed25519 key
//!   pair. Public keys are committed; private keys never leave the checkout.
//! - **Event log**: `.brain/events/<full_id>.jsonl`, one stream per participant, so merges of
//!   the log never conflict.
//! - **Claims**: exclusive ownership of a phase or task. Claims made on diverged branches are
//!   resolved deterministically after the merge; the loser is notified.
//! - **Read receipts**: proof that a participant caught up with history recently.
//! - **Announcements**: broadcasts on the shared `brain/events` ref, independent of any
//!   working branch.
//! - **Pre-commit gate**: refuses commits from participants without an identity or a fresh
//!   receipt. Docs-only commits pass; bypasses are audited.
//!
//! # Examples
//!
//! ```bash
//! # Create an identity for this checkout
//! brain init --name alice
//!
//! # Catch up and record a read receipt
//! git pull && brain receipt
//!
//! # Claim work
//! brain phase claim 11
//!
//! # Enforce the protocol on every commit
//! brain hook install
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: configuration, errors, events, the event log, history and the workspace
//! - [`plugins`]: the protocol components built on top (keys, identity, claims, receipts,
//!   announcements, gate)

pub mod core;
pub mod plugins;

use core::{
    error::BrainError,
    event::{Event, EventKind},
    event_log::{EventLog, MemoryLog, Replay},
    history::GitHistory,
    output,
    time::{command_envelope, to_iso},
    workspace::Workspace,
};
use plugins::{
    announce::{self, GitSharedRef},
    claims::{self, ClaimStatus, ResourceId},
    gate::{self, AllowReason, Decision},
    identity::{self, Identity},
    receipts::{self, Freshness},
};

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const HOOK_MARKER: &str = "# Installed by brain";

#[derive(Parser, Debug)]
#[clap(
    name = "brain",
    version = env!("CARGO_PKG_VERSION"),
    about = "Git-native coordination for agents sharing one repository"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create this checkout's identity and keys
    Init {
        #[clap(long)]
        name: String,
    },

    /// Show identity, keys, claims and receipt state
    Status {
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },

    /// Inspect and rotate signing keys
    Keys(KeysCli),

    /// Messages and announcements
    #[clap(name = "msg", visible_alias = "m")]
    Msg(MsgCli),

    /// Claim, release and complete phases
    Phase(ClaimCli),

    /// Claim, release and complete tasks
    Task(ClaimCli),

    /// Record that you have read history up to HEAD
    Receipt {
        /// Skip `git fetch --all` before recording.
        #[clap(long)]
        no_fetch: bool,
        #[clap(flatten)]
        commit: CommitArgs,
    },

    /// Fetch all branches and summarise other participants' activity
    Sync,

    /// Record claim conflicts left by a merge and notify the losers
    Reconcile {
        #[clap(flatten)]
        commit: CommitArgs,
    },

    /// Verify event signatures against published keys
    Verify,

    /// Git hook entry points
    Hook(HookCli),
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct CommitArgs {
    /// Stage protocol files without committing.
    #[clap(long)]
    no_commit: bool,
    /// Push the current branch after committing.
    #[clap(long)]
    push: bool,
}

#[derive(clap::Args, Debug)]
struct KeysCli {
    #[clap(subcommand)]
    command: KeysCommand,
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Show this identity's key fingerprint
    Show,
    /// Show the published key of another participant
    Verify { full_id: String },
    /// Generate a new key pair and publish the next public key
    Rotate {
        #[clap(flatten)]
        commit: CommitArgs,
    },
}

#[derive(clap::Args, Debug)]
struct MsgCli {
    #[clap(subcommand)]
    command: MsgCommand,
}

#[derive(Subcommand, Debug)]
enum MsgCommand {
    /// Append a message to the log
    Send {
        #[clap(required = true)]
        text: Vec<String>,
        /// Recipient full_id.
        #[clap(long)]
        to: Option<String>,
        #[clap(flatten)]
        commit: CommitArgs,
    },
    /// Broadcast to every participant via the shared ref
    Announce {
        #[clap(required = true)]
        text: Vec<String>,
    },
    /// Show recent announcements
    Listen {
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show recent events from the local log
    Log {
        #[clap(long, default_value_t = 20)]
        limit: usize,
        /// Only events from this full_id.
        #[clap(long)]
        from: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct ClaimCli {
    #[clap(subcommand)]
    command: ClaimCommand,
}

#[derive(Subcommand, Debug)]
enum ClaimCommand {
    Claim {
        id: String,
        #[clap(flatten)]
        commit: CommitArgs,
    },
    Release {
        id: String,
        #[clap(long, default_value = "released")]
        reason: String,
        #[clap(flatten)]
        commit: CommitArgs,
    },
    Complete {
        id: String,
        /// PR, commit or other reference for the finished work.
        #[clap(long = "ref", default_value = "")]
        reference: String,
        #[clap(flatten)]
        commit: CommitArgs,
    },
    /// List claims
    List {
        /// Include released, completed and rejected claims.
        #[clap(long)]
        all: bool,
    },
}

#[derive(clap::Args, Debug)]
struct HookCli {
    #[clap(subcommand)]
    command: HookCommand,
}

#[derive(Subcommand, Debug)]
enum HookCommand {
    /// Run the pre-commit gate
    PreCommit,
    /// Reconcile claims after a merge
    PostMerge,
    /// Install (or remove) the git hooks
    Install {
        #[clap(long)]
        uninstall: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceKind {
    Phase,
    Task,
}

impl ResourceKind {
    fn resource(self, id: &str) -> Result<ResourceId, BrainError> {
        match self {
            ResourceKind::Phase => id
                .trim()
                .parse::<u32>()
                .map(ResourceId::phase)
                .map_err(|_| BrainError::ValidationError(format!("invalid phase number '{}'", id))),
            ResourceKind::Task => ResourceId::task(id),
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            ResourceKind::Phase => "phase-",
            ResourceKind::Task => "task-",
        }
    }
}

pub fn run() -> Result<(), BrainError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;
    let ws = Workspace::open(&current_dir)?;

    match cli.command {
        Command::Init { name } => run_init(&ws, &name),
        Command::Status { format } => run_status(&ws, &format),
        Command::Keys(keys_cli) => run_keys(&ws, keys_cli.command),
        Command::Msg(msg_cli) => run_msg(&ws, msg_cli.command),
        Command::Phase(claim_cli) => run_claims(&ws, ResourceKind::Phase, claim_cli.command),
        Command::Task(claim_cli) => run_claims(&ws, ResourceKind::Task, claim_cli.command),
        Command::Receipt { no_fetch, commit } => run_receipt(&ws, no_fetch, commit),
        Command::Sync => run_sync(&ws),
        Command::Reconcile { commit } => run_reconcile(&ws, Some(commit)),
        Command::Verify => run_verify(&ws),
        Command::Hook(hook_cli) => match hook_cli.command {
            HookCommand::PreCommit => run_pre_commit(&ws),
            HookCommand::PostMerge => run_reconcile(&ws, None),
            HookCommand::Install { uninstall } => run_hook_install(&ws, uninstall),
        },
    }
}

/// Commit whatever protocol files are staged, then optionally push.
fn finish(ws: &Workspace, message: &str, commit: CommitArgs) -> Result<(), BrainError> {
    if commit.no_commit {
        println!("{} staged (not committed)", "•".cyan());
        return Ok(());
    }
    let id = ws.history.commit(message)?;
    println!("{} committed {}", "✓".green(), short(&id));
    if commit.push {
        let Some(branch) = ws.history.current_branch()? else {
            warn!("detached HEAD; not pushing");
            return Ok(());
        };
        match ws.history.push(&ws.config.remote, &branch) {
            Ok(()) => println!("{} pushed {}/{}", "✓".green(), ws.config.remote, branch),
            Err(e) => eprintln!("{} push failed: {}", "!".yellow(), e),
        }
    }
    Ok(())
}

/// First eight characters of a commit id. Ids read from the log are untrusted text.
fn short(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

fn run_init(ws: &Workspace, name: &str) -> Result<(), BrainError> {
    if let Ok(existing) = identity::current(ws) {
        println!("{} identity already exists: {}", "✓".green(), existing.full_id.bold());
        return Ok(());
    }

    let me = identity::create(ws, name, &mut rand_core::OsRng)?;

    fs::create_dir_all(&ws.paths.brain_dir)?;
    let ignore = ws.paths.brain_dir.join(".gitignore");
    fs::write(&ignore, "self.json\nkeys/private/\n")?;

    let attributes = ws.root().join(".gitattributes");
    let union_rule = format!("{}/events/*.jsonl merge=union", ws.config.brain_dir);
    let existing = fs::read_to_string(&attributes).unwrap_or_default();
    if !existing.lines().any(|l| l.trim() == union_rule) {
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&union_rule);
        content.push('\n');
        fs::write(&attributes, content)?;
    }
    ws.stage(&[ignore, attributes])?;

    println!("{} identity created: {}", "✓".green(), me.full_id.bold());
    println!("  color:   {}", me.color);
    println!("  emotion: {}", me.emotion);
    match &me.public_key_fingerprint {
        Some(fp) => println!("  key:     {} (public key staged)", fp),
        None => println!("  key:     {}", "none (signing disabled)".yellow()),
    }
    println!("  saved:   {}", ws.paths.relative(&ws.paths.self_file));
    Ok(())
}

fn freshness_label(freshness: &Freshness) -> String {
    match freshness {
        Freshness::Fresh(r) => format!("fresh (up to {}, {})", short(&r.up_to_commit), to_iso(&r.ts)),
        Freshness::Missing => "missing".to_string(),
        Freshness::Stale { age, .. } => format!("stale ({}h old)", age.num_hours()),
        Freshness::UnknownCommit(r) => format!("unknown commit {}", short(&r.up_to_commit)),
    }
}

fn run_status(ws: &Workspace, format: &str) -> Result<(), BrainError> {
    let me = identity::current(ws).ok();
    let branch = ws.history.current_branch()?;
    let head = ws.history.head()?;
    let event_count = ws.log.records(Replay::All)?.len();
    let active: Vec<claims::Claim> = claims::list(ws)?
        .into_iter()
        .filter(|c| c.status == ClaimStatus::Active)
        .collect();
    let freshness = match &me {
        Some(me) => Some(receipts::freshness(ws, me, ws.now(), ws.config.receipt_max_age())?),
        None => None,
    };

    if format == "json" {
        let envelope = command_envelope(
            "status",
            "ok",
            serde_json::json!({
                "identity": me,
                "branch": branch,
                "head": head,
                "event_count": event_count,
                "active_claims": active,
                "receipt": freshness.as_ref().map(freshness_label),
            }),
        );
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    println!("{}", "BRAIN STATUS".bold());
    match &me {
        Some(me) => {
            println!("  identity:  {}", me.full_id.bold());
            match &me.public_key_fingerprint {
                Some(fp) if me.has_keys => println!("  keys:      {} {}", "✓".green(), fp),
                _ => println!("  keys:      {}", "not configured".yellow()),
            }
        }
        None => println!("  identity:  {}", "not initialized".red()),
    }
    println!("  branch:    {}", branch.as_deref().unwrap_or("(detached)"));
    println!("  HEAD:      {}", head.as_deref().map(short).unwrap_or("(none)"));
    println!("  events:    {}", event_count);
    if let Some(freshness) = &freshness {
        let label = freshness_label(freshness);
        if freshness.is_fresh() {
            println!("  receipt:   {}", label.green());
        } else {
            println!("  receipt:   {}", label.yellow());
        }
    }
    println!("  claims:    {} active", active.len());
    for claim in &active {
        println!("    {} {} ({})", claim.resource, claim.developer, claim.branch);
    }
    Ok(())
}

fn run_keys(ws: &Workspace, command: KeysCommand) -> Result<(), BrainError> {
    match command {
        KeysCommand::Show => {
            let me = identity::current(ws)?;
            if !me.has_keys {
                println!("{} {} has no keys", "!".yellow(), me.full_id);
                return Ok(());
            }
            let versions = ws.keys.public_keys(&me.full_id)?.len();
            println!("identity:    {}", me.full_id.bold());
            println!(
                "fingerprint: {}",
                me.public_key_fingerprint.as_deref().unwrap_or("N/A")
            );
            println!("published:   {} version(s)", versions);
            if let Some(rotated) = &me.keys_rotated_at {
                println!("rotated at:  {}", to_iso(rotated));
            }
            Ok(())
        }
        KeysCommand::Verify { full_id } => {
            let pem = identity::resolve(ws, &full_id)?;
            println!("{} {}", full_id.bold(), plugins::keys::fingerprint(&pem));
            Ok(())
        }
        KeysCommand::Rotate { commit } => {
            let me = identity::current(ws)?;
            let rotated = identity::rotate_keys(ws, &me)?;
            println!(
                "{} rotated keys for {}: {}",
                "✓".green(),
                rotated.full_id,
                rotated.public_key_fingerprint.as_deref().unwrap_or("")
            );
            finish(ws, &format!("brain: rotate key for {}", me.short_name), commit)
        }
    }
}

fn print_event(event: &Event, me: Option<&Identity>) {
    let marker = if me.is_some_and(|m| m.full_id == event.from) {
        "→"
    } else {
        " "
    };
    let ts = to_iso(&event.ts);
    let detail = match &event.kind {
        EventKind::Message { body, to, .. } => match to {
            Some(to) => format!("@{} {}", to, body),
            None => body.clone(),
        },
        EventKind::Announce {
            body,
            source_branch,
            ..
        } => format!(
            "{} (from {})",
            body,
            source_branch.as_deref().unwrap_or("?")
        ),
        EventKind::ReadReceipt { up_to_commit } => format!("read up to {}", short(up_to_commit)),
        EventKind::Claim {
            resource, branch, ..
        } => format!("claimed {} on {}", resource, branch),
        EventKind::Release { resource, reason } => format!("released {}: {}", resource, reason),
        EventKind::Complete {
            resource,
            reference,
            ..
        } => format!("completed {} {}", resource, reference),
        EventKind::ClaimRejected {
            resource,
            claimant,
            winner,
            ..
        } => format!("{}'s claim on {} lost to {}", claimant, resource, winner),
        EventKind::GateBypass { paths, reason } => format!(
            "bypassed gate for {} path(s){}",
            paths.len(),
            reason.as_deref().map(|r| format!(": {}", r)).unwrap_or_default()
        ),
    };
    println!(
        "{} [{}] {} {}: {}",
        marker,
        &ts[..ts.len().min(19)],
        event.from.bold(),
        event.kind.type_name().dimmed(),
        output::one_line(&detail, 120)
    );
}

fn run_msg(ws: &Workspace, command: MsgCommand) -> Result<(), BrainError> {
    match command {
        MsgCommand::Send { text, to, commit } => {
            let me = identity::current(ws)?;
            let body = text.join(" ");
            if body.trim().is_empty() {
                return Err(BrainError::ValidationError("message cannot be empty".to_string()));
            }
            let event = ws.append(
                &me,
                EventKind::Message {
                    body: body.clone(),
                    to,
                    head_commit: ws.history.head()?,
                },
            )?;
            print_event(&event, Some(&me));
            finish(
                ws,
                &format!("brain: {}: {}", me.short_name, output::one_line(&body, 50)),
                commit,
            )
        }
        MsgCommand::Announce { text } => {
            let me = identity::current(ws)?;
            let shared = GitSharedRef::new(ws)?;
            let event = announce::announce(ws, &shared, &me, &text.join(" "))?;
            println!("{} announced on {}", "✓".green(), ws.config.announce_ref);
            print_event(&event, Some(&me));
            Ok(())
        }
        MsgCommand::Listen { limit } => {
            let me = identity::current(ws).ok();
            let shared = GitSharedRef::new(ws)?;
            let announcements = announce::listen(&shared, limit)?;
            if announcements.is_empty() {
                println!("No announcements yet");
                return Ok(());
            }
            println!("Last {} announcement(s):", announcements.len());
            for event in &announcements {
                print_event(event, me.as_ref());
            }
            Ok(())
        }
        MsgCommand::Log { limit, from } => {
            let me = identity::current(ws).ok();
            let scope = match &from {
                Some(id) => Replay::From(id),
                None => Replay::All,
            };
            let mut events = ws.log.events(scope)?;
            events.sort_by(|a, b| (a.ts, &a.from).cmp(&(b.ts, &b.from)));
            let start = events.len().saturating_sub(limit);
            for event in &events[start..] {
                print_event(event, me.as_ref());
            }
            Ok(())
        }
    }
}

fn run_claims(ws: &Workspace, kind: ResourceKind, command: ClaimCommand) -> Result<(), BrainError> {
    match command {
        ClaimCommand::Claim { id, commit } => {
            let me = identity::current(ws)?;
            let resource = kind.resource(&id)?;
            let claim = claims::claim(ws, &me, &resource)?;
            println!("{} {} claimed by {}", "✓".green(), resource, claim.developer.bold());
            println!("  suggested branch: {}", claim.branch);
            finish(ws, &format!("brain: {} claims {}", me.short_name, resource), commit)
        }
        ClaimCommand::Release {
            id,
            reason,
            commit,
        } => {
            let me = identity::current(ws)?;
            let resource = kind.resource(&id)?;
            claims::release(ws, &me, &resource, &reason)?;
            println!("{} released {}", "✓".green(), resource);
            finish(ws, &format!("brain: {} releases {}", me.short_name, resource), commit)
        }
        ClaimCommand::Complete {
            id,
            reference,
            commit,
        } => {
            let me = identity::current(ws)?;
            let resource = kind.resource(&id)?;
            claims::complete(ws, &me, &resource, &reference)?;
            println!("{} completed {}", "✓".green(), resource);
            finish(ws, &format!("brain: {} completes {}", me.short_name, resource), commit)
        }
        ClaimCommand::List { all } => {
            let listed: Vec<claims::Claim> = claims::list(ws)?
                .into_iter()
                .filter(|c| c.resource.starts_with(kind.prefix()))
                .filter(|c| all || c.status == ClaimStatus::Active)
                .collect();
            if listed.is_empty() {
                println!("No claims");
                return Ok(());
            }
            for claim in &listed {
                let status = match claim.status {
                    ClaimStatus::Active => claim.status.to_string().green(),
                    ClaimStatus::ConflictRejected => claim.status.to_string().red(),
                    _ => claim.status.to_string().dimmed(),
                };
                println!(
                    "{:<16} {:<28} {:<18} {}",
                    claim.resource,
                    claim.developer,
                    status,
                    claim.branch
                );
            }
            Ok(())
        }
    }
}

fn run_receipt(ws: &Workspace, no_fetch: bool, commit: CommitArgs) -> Result<(), BrainError> {
    let me = identity::current(ws)?;
    if !no_fetch && let Err(e) = ws.history.fetch_all() {
        warn!(error = %e, "fetch failed; recording receipt for local HEAD");
    }
    let head = ws.history.head()?.ok_or_else(|| {
        BrainError::ValidationError("repository has no commits to acknowledge".to_string())
    })?;
    let receipt = receipts::post(ws, &me, &head)?;
    println!(
        "{} read receipt up to {} at {}",
        "✓".green(),
        short(&receipt.up_to_commit),
        to_iso(&receipt.ts)
    );
    finish(
        ws,
        &format!("brain: {} read up to {}", me.short_name, short(&head)),
        commit,
    )
}

/// Union of the local log and every participant branch's log, for read-only summaries.
fn union_log(ws: &Workspace, branches: &[String]) -> Result<EventLog, BrainError> {
    let union = EventLog::new(Box::new(MemoryLog::new()));
    union.merge_from(&ws.log)?;
    let events_dir = ws.paths.relative(&ws.paths.events_dir);
    for branch in branches {
        let remote = MemoryLog::new();
        for file in ws.history.list_files(branch, &events_dir)? {
            let Some(stream) = Path::new(&file).file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(content) = ws.history.show_file(branch, &file)? {
                for line in content.lines() {
                    remote.push_raw(stream, line);
                }
            }
        }
        union.merge_from(&EventLog::new(Box::new(remote)))?;
    }
    Ok(union)
}

fn run_sync(ws: &Workspace) -> Result<(), BrainError> {
    if let Err(e) = ws.history.fetch_all() {
        eprintln!("{} fetch failed: {}", "!".yellow(), e);
    }
    let prefix = format!("{}/{}", ws.config.remote, ws.config.participant_branch_prefix);
    let branches = ws.history.remote_branches(&prefix)?;
    if branches.is_empty() {
        println!("No {}* branches found", prefix);
    } else {
        println!("Found {} participant branch(es)", branches.len());
    }

    let union = union_log(ws, &branches)?;
    let mut events = union.events(Replay::All)?;
    events.sort_by(|a, b| (a.ts, &a.from).cmp(&(b.ts, &b.from)));
    let mut by_author: Vec<(&str, Vec<&Event>)> = Vec::new();
    for event in events.iter().rev() {
        match by_author.iter_mut().find(|(a, _)| *a == event.from) {
            Some((_, recent)) => recent.push(event),
            None => by_author.push((event.from.as_str(), vec![event])),
        }
    }
    for (author, recent) in &by_author {
        println!("  {}: {}", author.bold(), output::activity_digest(recent, 3));
    }

    let conflicts = claims::conflicts(&events);
    if conflicts.is_empty() {
        println!("{} no pending claim conflicts", "✓".green());
    } else {
        println!("{} {} pending claim conflict(s):", "!".yellow(), conflicts.len());
        for conflict in &conflicts {
            println!(
                "  {}: {} holds, {} loses (run `brain reconcile` after merging)",
                conflict.loser.resource, conflict.winner.developer, conflict.loser.developer
            );
        }
    }
    Ok(())
}

/// `commit` is `None` when run from the post-merge hook: stage only, never fail the merge.
fn run_reconcile(ws: &Workspace, commit: Option<CommitArgs>) -> Result<(), BrainError> {
    let unmerged = ws.history.unmerged_paths()?;
    if !unmerged.is_empty() {
        return Err(BrainError::MergeConflict(unmerged));
    }
    let me = match identity::current(ws) {
        Ok(me) => me,
        Err(BrainError::MissingIdentity) if commit.is_none() => return Ok(()),
        Err(e) => return Err(e),
    };
    let conflicts = claims::reconcile(ws, &me)?;
    if conflicts.is_empty() {
        if commit.is_some() {
            println!("{} no claim conflicts", "✓".green());
        }
        return Ok(());
    }
    for conflict in &conflicts {
        println!(
            "{} {}: claim by {} rejected in favour of {}",
            "!".yellow(),
            conflict.loser.resource,
            conflict.loser.developer,
            conflict.winner.developer
        );
    }
    match commit {
        Some(commit) => finish(
            ws,
            &format!("brain: record {} claim conflict(s)", conflicts.len()),
            commit,
        ),
        None => {
            println!("Conflict records staged; commit them to notify the other participants.");
            Ok(())
        }
    }
}

fn run_verify(ws: &Workspace) -> Result<(), BrainError> {
    let report = ws.log.verify(&|full_id| ws.public_keys(full_id))?;
    println!(
        "verified: {}  unsigned: {}  invalid: {}",
        report.verified,
        report.unsigned,
        report.invalid.len()
    );
    for (stream, id) in &report.invalid {
        println!("  {} {} {}", "✗".red(), stream, short(id));
    }
    if report.is_clean() {
        Ok(())
    } else {
        Err(BrainError::ValidationError(format!(
            "{} event(s) failed signature verification",
            report.invalid.len()
        )))
    }
}

fn run_pre_commit(ws: &Workspace) -> Result<(), BrainError> {
    let bypass = std::env::var(&ws.config.gate.bypass_env).ok();
    match gate::run_pre_commit(ws, bypass.as_deref())? {
        Decision::Allow(AllowReason::Checked) => {
            println!("{} brain: All checks passed", "✓".green());
            Ok(())
        }
        Decision::Allow(AllowReason::ExemptPaths) => {
            println!("{} brain: docs-only change, checks skipped", "✓".green());
            Ok(())
        }
        Decision::Allow(AllowReason::Bypass) => {
            eprintln!(
                "{} brain: gate bypassed via {} (recorded in the log)",
                "!".yellow(),
                ws.config.gate.bypass_env
            );
            Ok(())
        }
        Decision::Deny(reasons) => {
            eprintln!("{} brain: commit blocked", "✗".red());
            for reason in &reasons {
                eprintln!("  - {}", reason);
            }
            eprintln!(
                "  To bypass (audited): {}=1 git commit ...",
                ws.config.gate.bypass_env
            );
            Err(BrainError::ValidationError(format!(
                "pre-commit gate denied the commit ({} reason(s))",
                reasons.len()
            )))
        }
    }
}

fn hooks_dir(ws: &Workspace) -> Result<PathBuf, BrainError> {
    let git = GitHistory::new(ws.root());
    let dir = git.run(&["rev-parse", "--git-path", "hooks"])?;
    Ok(ws.root().join(dir))
}

fn run_hook_install(ws: &Workspace, uninstall: bool) -> Result<(), BrainError> {
    let hooks_dir = hooks_dir(ws)?;
    fs::create_dir_all(&hooks_dir)?;
    let hooks = [("pre-commit", "pre-commit"), ("post-merge", "post-merge")];

    if uninstall {
        let mut removed = false;
        for (file, _) in hooks {
            let path = hooks_dir.join(file);
            let ours = fs::read_to_string(&path)
                .map(|c| c.contains(HOOK_MARKER))
                .unwrap_or(false);
            if ours {
                fs::remove_file(&path)?;
                println!("{} removed {} hook", "✓".green(), file);
                removed = true;
            }
        }
        if !removed {
            println!("No brain hooks found to remove");
        }
        return Ok(());
    }

    for (file, subcommand) in hooks {
        let path = hooks_dir.join(file);
        if let Ok(existing) = fs::read_to_string(&path)
            && !existing.contains(HOOK_MARKER)
        {
            return Err(BrainError::ValidationError(format!(
                "{} already exists and was not installed by brain",
                path.display()
            )));
        }
        let script = format!(
            "#!/bin/sh\n{}\nexec \"${{BRAIN_BIN:-brain}}\" hook {}\n",
            HOOK_MARKER, subcommand
        );
        fs::write(&path, script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms)?;
        }
        println!("{} installed {} hook", "✓".green(), file);
    }
    Ok(())
}
