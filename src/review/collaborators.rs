//! Seams to the external collaborators of the convergence loop.
//!
//! Real implementations scan or edit files and talk to git; tests use
//! in-memory doubles.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{IndexAddOption, Repository, Signature};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::findings::{Finding, PassReport};
use super::queue::ReviewScope;

/// A content scanner that reports findings for a scope.
#[async_trait]
pub trait AnalysisPass: Send + Sync {
    /// Stable identifier recorded on every finding this pass reports.
    fn id(&self) -> &str;

    async fn scan(&self, scope: &ReviewScope) -> Result<PassReport>;
}

/// Result of asking the fix applier to address one finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    Applied { files: Vec<PathBuf> },
    Failed { reason: String },
}

/// Edits files to address a finding.
#[async_trait]
pub trait FixApplier: Send + Sync {
    async fn apply(&self, finding: &Finding) -> Result<FixOutcome>;
}

/// Records the changes of one loop iteration.
#[async_trait]
pub trait ChangeCommitter: Send + Sync {
    /// Commit `files`; returns the commit id when something was recorded.
    async fn commit(&self, iteration: u32, message: &str, files: &[PathBuf])
    -> Result<Option<String>>;
}

fn split_command(command: &[String]) -> Result<(String, Vec<String>)> {
    match command.split_first() {
        Some((program, args)) if !program.trim().is_empty() => {
            Ok((program.clone(), args.to_vec()))
        }
        _ => bail!("command must name a program"),
    }
}

/// Analysis pass backed by an external command.
///
/// The scope's files are appended to the arguments. The process must exit
/// successfully and print a [`PassReport`] as JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandPass {
    id: String,
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandPass {
    pub fn new(id: impl Into<String>, command: &[String], working_dir: impl Into<PathBuf>) -> Result<Self> {
        let id = id.into();
        let (program, args) =
            split_command(command).with_context(|| format!("Invalid command for pass '{}'", id))?;
        Ok(Self {
            id,
            program,
            args,
            working_dir: working_dir.into(),
        })
    }
}

#[async_trait]
impl AnalysisPass for CommandPass {
    fn id(&self) -> &str {
        &self.id
    }

    async fn scan(&self, scope: &ReviewScope) -> Result<PassReport> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(&scope.files)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run analysis pass '{}'", self.id))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "pass '{}' exited with {}: {}",
                self.id,
                output.status,
                stderr.trim()
            );
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Pass '{}' printed an invalid report", self.id))
    }
}

/// Fix applier backed by an external command.
///
/// The finding is written to stdin as JSON. Exit status 0 means applied, with
/// the touched files printed one per line relative to the working directory;
/// any other status is a failed fix whose reason is taken from stderr.
#[derive(Debug, Clone)]
pub struct CommandFixer {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandFixer {
    pub fn new(command: &[String], working_dir: impl Into<PathBuf>) -> Result<Self> {
        let (program, args) = split_command(command).context("Invalid fixer command")?;
        Ok(Self {
            program,
            args,
            working_dir: working_dir.into(),
        })
    }
}

#[async_trait]
impl FixApplier for CommandFixer {
    async fn apply(&self, finding: &Finding) -> Result<FixOutcome> {
        let payload = serde_json::to_vec(finding)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start fixer '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("Failed to send finding to fixer")?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = match stderr.trim() {
                "" => format!("fixer exited with {}", output.status),
                message => message.to_string(),
            };
            return Ok(FixOutcome::Failed { reason });
        }

        let files = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect();
        Ok(FixOutcome::Applied { files })
    }
}

/// Committer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCommitter;

#[async_trait]
impl ChangeCommitter for NoopCommitter {
    async fn commit(&self, _: u32, _: &str, _: &[PathBuf]) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Commits iteration changes to the git repository at `repo_dir`.
#[derive(Debug, Clone)]
pub struct GitCommitter {
    repo_dir: PathBuf,
    author: String,
    email: String,
}

impl GitCommitter {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            author: "conductor".to_string(),
            email: "conductor@localhost".to_string(),
        }
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author = name.into();
        self.email = email.into();
        self
    }

    fn commit_blocking(
        repo_dir: &Path,
        author: &str,
        email: &str,
        message: &str,
        files: &[PathBuf],
    ) -> Result<Option<String>> {
        let repo = Repository::open(repo_dir).context("Failed to open git repository")?;
        let workdir = repo
            .workdir()
            .context("Cannot commit in a bare repository")?
            .to_path_buf();

        let mut index = repo.index()?;
        if files.is_empty() {
            index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        } else {
            for file in files {
                let relative = relative_to(&workdir, file);
                if workdir.join(&relative).exists() {
                    index.add_path(&relative)?;
                } else {
                    index.remove_path(&relative)?;
                }
            }
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now(author, email)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(Some(commit_id.to_string()))
    }
}

/// `file` relative to the repository workdir, following symlinked prefixes.
fn relative_to(workdir: &Path, file: &Path) -> PathBuf {
    if !file.is_absolute() {
        return file.to_path_buf();
    }
    if let Ok(relative) = file.strip_prefix(workdir) {
        return relative.to_path_buf();
    }
    match (workdir.canonicalize(), file.canonicalize()) {
        (Ok(root), Ok(full)) => full
            .strip_prefix(&root)
            .map(Path::to_path_buf)
            .unwrap_or(full),
        _ => file.to_path_buf(),
    }
}

#[async_trait]
impl ChangeCommitter for GitCommitter {
    async fn commit(
        &self,
        iteration: u32,
        message: &str,
        files: &[PathBuf],
    ) -> Result<Option<String>> {
        let repo_dir = self.repo_dir.clone();
        let author = self.author.clone();
        let email = self.email.clone();
        let message = message.to_string();
        let files = files.to_vec();

        let commit = tokio::task::spawn_blocking(move || {
            Self::commit_blocking(&repo_dir, &author, &email, &message, &files)
        })
        .await
        .context("git commit task panicked")??;

        if let Some(sha) = &commit {
            tracing::info!(iteration, commit = %sha, "Committed review fixes");
        }
        Ok(commit)
    }
}
