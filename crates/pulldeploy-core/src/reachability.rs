use std::time::Duration;

use async_trait::async_trait;
use better_command::Cmd;

use crate::vcs::apply_token_auth;

/// Component B. A single bounded-time network check against the configured
/// remote. Any success (non-empty ref list, exit 0) is reachable; any
/// failure or timeout is not. No retries inside the probe — retry policy,
/// if any, belongs to the orchestrator. `token`, when set, authenticates the
/// probe against a private remote the same way the VCS gateway does.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
	async fn reachable(&self, url: &str, timeout: Duration, token: Option<&str>) -> bool;
}

pub struct GitReachabilityProbe {
	git_binary: String,
}

impl GitReachabilityProbe {
	pub fn new(git_binary: impl Into<String>) -> Self {
		Self {
			git_binary: git_binary.into(),
		}
	}
}

#[async_trait]
impl ReachabilityProbe for GitReachabilityProbe {
	async fn reachable(&self, url: &str, timeout: Duration, token: Option<&str>) -> bool {
		let mut cmd = Cmd::new(&self.git_binary);
		apply_token_auth(&mut cmd, token);
		cmd.args(["ls-remote", "--exit-code", url]).timeout(timeout);
		cmd.succeeds().await
	}
}
