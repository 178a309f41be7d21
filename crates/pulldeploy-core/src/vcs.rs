use std::path::{Path, PathBuf};

use async_trait::async_trait;
use better_command::Cmd;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Commit, CommitHash, Ref};

/// Component A. Wraps the external version-control client: clone, fetch
/// with pruning, list remote refs, commit metadata, merge-base, ancestry
/// test, checkout. Implementations shell out; the trait exists so the
/// orchestrator can be exercised against a fake in tests.
#[async_trait]
pub trait VcsGateway: Send + Sync {
	/// If `path` doesn't exist, clones `url` into it. Otherwise asserts the
	/// existing repo's `origin` remote equals `url`.
	async fn ensure_repo(&self, path: &Path, url: &str, token: Option<&str>) -> Result<()>;

	/// Fetches all branches, pruning deleted refs.
	async fn fetch(&self, path: &Path, token: Option<&str>) -> Result<()>;

	/// Lists remote branches with their tip hash and committer timestamp.
	async fn remote_branches(&self, path: &Path) -> Result<Vec<Ref>>;

	async fn commit(&self, path: &Path, hash: &CommitHash) -> Result<Commit>;

	/// Fails with a transient/fatal error classified as *NoCommonAncestor*
	/// when the two histories are disjoint.
	async fn merge_base(&self, path: &Path, a: &CommitHash, b: &CommitHash) -> Result<CommitHash>;

	async fn is_ancestor(&self, path: &Path, a: &CommitHash, b: &CommitHash) -> Result<bool>;

	async fn checkout_detached(&self, path: &Path, hash: &CommitHash) -> Result<()>;

	/// True iff `merge_base(branch_tip, main_tip) == branch_tip`.
	async fn is_merged_into(
		&self,
		path: &Path,
		branch_tip: &CommitHash,
		main_tip: &CommitHash,
	) -> Result<bool> {
		let base = self.merge_base(path, branch_tip, main_tip).await?;
		Ok(&base == branch_tip)
	}
}

/// Git-backed implementation. `git_binary` is the configured command name
/// (default `"git"`, resolved via `$PATH`).
pub struct GitGateway {
	git_binary: String,
}

impl GitGateway {
	pub fn new(git_binary: impl Into<String>) -> Self {
		Self {
			git_binary: git_binary.into(),
		}
	}

	fn cmd(&self, repo: &Path) -> Cmd {
		let mut cmd = Cmd::new(&self.git_binary);
		cmd.comparg("-C", repo.as_os_str());
		cmd
	}
}

/// Configures `cmd` (a `git` invocation) to authenticate with `token` via an
/// `Authorization: Bearer` header. The token is never interpolated into a
/// URL that would be echoed by `git` in a log line or appear in a child
/// process's `/proc/<pid>/cmdline`; instead it is passed as a secret
/// environment variable and `better-command` scrubs it from any captured
/// output before it is logged. Shared with `reachability.rs` so
/// `git ls-remote` probes against private remotes the same way the rest of
/// the VCS gateway does.
pub(crate) fn apply_token_auth(cmd: &mut Cmd, token: Option<&str>) {
	if let Some(token) = token {
		// Standard git convention: an askpass-less PAT auth via header.
		cmd.secret_env("GIT_PULLDEPLOY_TOKEN", token);
		cmd.comparg(
			"-c",
			format!("http.extraHeader=Authorization: Bearer ${{GIT_PULLDEPLOY_TOKEN}}"),
		);
		cmd.comparg("-c", "credential.helper=");
	}
}

#[async_trait]
impl VcsGateway for GitGateway {
	async fn ensure_repo(&self, path: &Path, url: &str, token: Option<&str>) -> Result<()> {
		if path.join(".git").exists() {
			let mut cmd = self.cmd(path);
			cmd.args(["remote", "get-url", "origin"]);
			let out = cmd.run().await?;
			if out.stdout.trim() != url {
				return Err(Error::fatal(format!(
					"repo at {} has origin {} but config expects {url}",
					path.display(),
					out.stdout.trim()
				)));
			}
			return Ok(());
		}
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| Error::fatal(format!("creating {}: {e}", parent.display())))?;
		}
		let mut cmd = Cmd::new(&self.git_binary);
		apply_token_auth(&mut cmd, token);
		cmd.arg("clone").arg(url).arg(path.as_os_str());
		cmd.run().await?;
		Ok(())
	}

	async fn fetch(&self, path: &Path, token: Option<&str>) -> Result<()> {
		let mut cmd = Cmd::new(&self.git_binary);
		cmd.comparg("-C", path.as_os_str());
		apply_token_auth(&mut cmd, token);
		cmd.args(["fetch", "--prune", "origin"]);
		cmd.run().await?;
		Ok(())
	}

	async fn remote_branches(&self, path: &Path) -> Result<Vec<Ref>> {
		let mut cmd = self.cmd(path);
		cmd.args([
			"for-each-ref",
			"--format=%(refname:short)%09%(objectname)%09%(committerdate:unix)",
			"refs/remotes/origin",
		]);
		let out = cmd.run().await?;
		let mut refs = Vec::new();
		for line in out.stdout.lines() {
			let mut parts = line.splitn(3, '\t');
			let (Some(name), Some(tip), Some(ts)) = (parts.next(), parts.next(), parts.next())
			else {
				continue;
			};
			let Some(name) = name.strip_prefix("origin/") else {
				continue;
			};
			if name == "HEAD" {
				continue;
			}
			let ts: i64 = ts
				.trim()
				.parse()
				.map_err(|e| Error::fatal(format!("bad committerdate from git: {e}")))?;
			refs.push(Ref {
				name: name.to_string(),
				tip: tip.to_string().into(),
				committer_timestamp: ts,
			});
		}
		debug!(count = refs.len(), "listed remote branches");
		Ok(refs)
	}

	async fn commit(&self, path: &Path, hash: &CommitHash) -> Result<Commit> {
		let mut cmd = self.cmd(path);
		cmd.args(["show", "-s", "--format=%H%x09%an%x09%ct%x09%s"])
			.arg(&hash.0);
		let out = cmd.run().await?;
		let line = out.stdout.lines().next().unwrap_or_default();
		let mut parts = line.splitn(4, '\t');
		let (Some(full_hash), Some(author), Some(ts), Some(subject)) =
			(parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(Error::fatal(format!("unparseable `git show` output: {line}")));
		};
		let committer_timestamp = ts
			.parse()
			.map_err(|e| Error::fatal(format!("bad commit timestamp: {e}")))?;
		Ok(Commit {
			hash: full_hash.to_string().into(),
			author: author.to_string(),
			committer_timestamp,
			subject: subject.to_string(),
		})
	}

	async fn merge_base(&self, path: &Path, a: &CommitHash, b: &CommitHash) -> Result<CommitHash> {
		let mut cmd = self.cmd(path);
		cmd.args(["merge-base", a.0.as_str(), b.0.as_str()]);
		let out = cmd.run().await.map_err(|e| {
			Error::fatal(format!(
				"no common ancestor between {a} and {b} (or git error: {e})"
			))
		})?;
		Ok(out.stdout.trim().to_string().into())
	}

	async fn is_ancestor(&self, path: &Path, a: &CommitHash, b: &CommitHash) -> Result<bool> {
		let mut cmd = self.cmd(path);
		cmd.args(["merge-base", "--is-ancestor", a.0.as_str(), b.0.as_str()]);
		Ok(cmd.succeeds().await)
	}

	async fn checkout_detached(&self, path: &Path, hash: &CommitHash) -> Result<()> {
		let mut cmd = self.cmd(path);
		cmd.args(["checkout", "--detach"]).arg(&hash.0);
		cmd.run().await?;
		Ok(())
	}
}

/// Where the local mirror lives under `config_dir`.
pub fn repo_path(config_dir: &Path) -> PathBuf {
	config_dir.join("repo")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn ensure_repo_rejects_origin_mismatch() {
		let dir = tempfile::tempdir().unwrap();
		let repo = dir.path().join("repo");
		std::fs::create_dir_all(repo.join(".git")).unwrap();
		// Not a real git repo, but `git remote get-url` will fail, which is
		// surfaced as an error rather than silently treated as a match.
		let gw = GitGateway::new("git");
		let err = gw.ensure_repo(&repo, "https://example.com/repo.git", None).await;
		assert!(err.is_err());
	}
}
