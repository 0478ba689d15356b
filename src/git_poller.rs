//! Periodic git status for workspace repositories.
//!
//! Shelling out to git sits behind [`GitStateSource`]; the poller only fans the
//! checks out through the concurrency limiter and reports summaries that
//! changed since the previous poll.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{limiter::run_bounded, records::RepositoryRecord};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSummary {
    pub branch: Option<String>,
    pub upstream: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub changed_files: usize,
}

/// Parse `git status --porcelain=v1 --branch` output.
pub fn parse_porcelain_status(output: &str) -> GitSummary {
    let mut summary = GitSummary::default();
    for line in output.lines() {
        let Some(header) = line.strip_prefix("## ") else {
            if !line.trim().is_empty() {
                summary.changed_files += 1;
            }
            continue;
        };

        let (refs, tracking) = match header.split_once(" [") {
            Some((refs, rest)) => (refs, rest.trim_end_matches(']')),
            None => (header, ""),
        };
        for part in tracking.split(", ") {
            if let Some(n) = part.strip_prefix("ahead ") {
                summary.ahead = n.parse().unwrap_or(0);
            } else if let Some(n) = part.strip_prefix("behind ") {
                summary.behind = n.parse().unwrap_or(0);
            }
        }

        if let Some(branch) = refs.strip_prefix("No commits yet on ") {
            summary.branch = Some(branch.to_string());
        } else if refs.starts_with("HEAD (no branch)") {
            summary.branch = None;
        } else {
            match refs.split_once("...") {
                Some((branch, upstream)) => {
                    summary.branch = Some(branch.to_string());
                    summary.upstream = Some(upstream.to_string());
                }
                None => summary.branch = Some(refs.to_string()),
            }
        }
    }
    summary
}

pub trait GitStateSource: Send + Sync + 'static {
    fn summarize(&self, path: &Path) -> impl Future<Output = Result<GitSummary>> + Send;
}

/// Runs the `git` binary.
#[derive(Debug, Clone, Default)]
pub struct CommandGitSource;

impl GitStateSource for CommandGitSource {
    fn summarize(&self, path: &Path) -> impl Future<Output = Result<GitSummary>> + Send {
        let path = path.to_path_buf();
        async move {
            let output = tokio::process::Command::new("git")
                .arg("-C")
                .arg(&path)
                .args(["status", "--porcelain=v1", "--branch"])
                .output()
                .await
                .with_context(|| format!("failed to run git in {}", path.display()))?;
            if !output.status.success() {
                anyhow::bail!(
                    "git status failed in {}: {}",
                    path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(parse_porcelain_status(&String::from_utf8_lossy(&output.stdout)))
        }
    }
}

pub struct GitStatePoller<S> {
    source: Arc<S>,
    limit: usize,
    last: Mutex<HashMap<String, GitSummary>>,
}

impl<S: GitStateSource> GitStatePoller<S> {
    pub fn new(source: S, limit: usize) -> Self {
        Self {
            source: Arc::new(source),
            limit,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Summarize every live repository with a local checkout and return the
    /// ones whose summary changed. Failed checks keep their previous summary.
    pub async fn poll_once(&self, repositories: &[RepositoryRecord]) -> Vec<(String, GitSummary)> {
        let items: Vec<Option<(String, PathBuf)>> = repositories
            .iter()
            .map(|repo| {
                let path = repo.local_path.as_ref().filter(|_| !repo.is_archived())?;
                Some((repo.repository_id.clone(), PathBuf::from(path)))
            })
            .collect();

        let results = Arc::new(Mutex::new(Vec::new()));
        let source = self.source.clone();
        let collected = results.clone();
        run_bounded(items, self.limit, move |(repository_id, path)| {
            let source = source.clone();
            let collected = collected.clone();
            async move {
                let summary = source.summarize(&path).await?;
                collected.lock().push((repository_id, summary));
                Ok::<(), anyhow::Error>(())
            }
        })
        .await;

        let fresh = std::mem::take(&mut *results.lock());
        let mut last = self.last.lock();
        let mut changed: Vec<(String, GitSummary)> = fresh
            .into_iter()
            .filter(|(repository_id, summary)| last.get(repository_id) != Some(summary))
            .collect();
        for (repository_id, summary) in &changed {
            last.insert(repository_id.clone(), summary.clone());
        }
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use anyhow::Result;

    use super::{parse_porcelain_status, GitStatePoller, GitStateSource, GitSummary};
    use crate::records::RepositoryRecord;

    #[test]
    fn parses_branch_tracking_and_changes() {
        let summary = parse_porcelain_status(
            "## main...origin/main [ahead 2, behind 1]\n M src/lib.rs\n?? notes.md\n",
        );
        assert_eq!(
            summary,
            GitSummary {
                branch: Some("main".into()),
                upstream: Some("origin/main".into()),
                ahead: 2,
                behind: 1,
                changed_files: 2,
            }
        );
    }

    #[test]
    fn parses_unborn_and_detached_heads() {
        assert_eq!(
            parse_porcelain_status("## No commits yet on trunk\n").branch.as_deref(),
            Some("trunk")
        );
        let detached = parse_porcelain_status("## HEAD (no branch)\n");
        assert_eq!(detached.branch, None);
        assert_eq!(parse_porcelain_status("## feature\n").upstream, None);
    }

    struct FakeSource {
        calls: AtomicUsize,
    }

    impl GitStateSource for FakeSource {
        fn summarize(&self, path: &Path) -> impl Future<Output = Result<GitSummary>> + Send {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = path.ends_with("broken");
            async move {
                if failing {
                    anyhow::bail!("not a git repository");
                }
                Ok(GitSummary {
                    branch: Some("main".into()),
                    changed_files: usize::from(call >= 2),
                    ..GitSummary::default()
                })
            }
        }
    }

    fn repo(id: &str, path: Option<&str>, archived: bool) -> RepositoryRecord {
        let mut repo = RepositoryRecord::new(id, id);
        repo.local_path = path.map(str::to_string);
        if archived {
            repo.archived_at = Some("2026-01-01T00:00:00Z".into());
        }
        repo
    }

    #[tokio::test]
    async fn reports_only_changes_and_skips_archived_or_unlinked() {
        let source = FakeSource { calls: AtomicUsize::new(0) };
        let poller = GitStatePoller::new(source, 2);
        let repos = vec![
            repo("r1", Some("/tmp/r1"), false),
            repo("r2", None, false),
            repo("r3", Some("/tmp/r3"), true),
            repo("r4", Some("/tmp/broken"), false),
        ];

        let first = poller.poll_once(&repos).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0, "r1");

        // Third call onward reports a dirty tree for r1.
        let second = poller.poll_once(&repos).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1.changed_files, 1);

        assert!(poller.poll_once(&repos).await.is_empty());
    }
}
