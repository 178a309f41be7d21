use std::path::Path;

use async_trait::async_trait;
use better_command::Cmd;
use tracing::{info, warn};

use crate::error::Result;
use crate::settings::DeployMode;
use crate::types::TargetKind;

/// Which phase of the run this invocation represents. Only `Pre` failures
/// are fatal to the run (spec §7); the orchestrator is responsible for
/// deciding that, not the invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
	Pre,
	Success,
	Failed,
}

impl HookStatus {
	fn as_str(self) -> &'static str {
		match self {
			HookStatus::Pre => "pre",
			HookStatus::Success => "success",
			HookStatus::Failed => "failed",
		}
	}
}

/// The documented environment a hook is invoked with, per spec §4.G.
pub struct HookEnv {
	pub status: HookStatus,
	pub deploy_type: TargetKind,
	pub deploy_mode: DeployMode,
	pub commit: String,
	pub commit_message: String,
	pub success_commit: Option<String>,
	pub success_commit_message: Option<String>,
	pub scheduled: bool,
}

impl HookEnv {
	fn apply(&self, cmd: &mut Cmd) {
		cmd.env("DEPLOY_STATUS", self.status.as_str());
		cmd.env("DEPLOY_TYPE", self.deploy_type.to_string());
		cmd.env("DEPLOY_MODE", self.deploy_mode.to_string());
		cmd.env("DEPLOY_COMMIT", &self.commit);
		cmd.env("DEPLOY_COMMIT_MESSAGE", &self.commit_message);
		cmd.env(
			"DEPLOY_SUCCESS_COMMIT",
			self.success_commit.as_deref().unwrap_or(""),
		);
		cmd.env(
			"DEPLOY_SUCCESS_COMMIT_MESSAGE",
			self.success_commit_message.as_deref().unwrap_or(""),
		);
		cmd.env("DEPLOY_SCHEDULED", if self.scheduled { "1" } else { "0" });
	}
}

/// Component G. Runs the optional user script synchronously with the
/// documented environment. The core only specifies the invocation
/// contract; what the script does is out of scope.
#[async_trait]
pub trait HookInvoker: Send + Sync {
	async fn invoke(&self, hook: &Path, env: &HookEnv) -> Result<()>;
}

pub struct ProcessHookInvoker;

#[async_trait]
impl HookInvoker for ProcessHookInvoker {
	async fn invoke(&self, hook: &Path, env: &HookEnv) -> Result<()> {
		let mut cmd = Cmd::new(hook);
		env.apply(&mut cmd);
		info!(hook = %hook.display(), status = env.status.as_str(), "running hook");
		let out = cmd.run().await?;
		if !out.stdout.trim().is_empty() {
			info!(hook = %hook.display(), "{}", out.stdout.trim());
		}
		if !out.stderr.trim().is_empty() {
			warn!(hook = %hook.display(), "{}", out.stderr.trim());
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn env(status: HookStatus) -> HookEnv {
		HookEnv {
			status,
			deploy_type: TargetKind::Main,
			deploy_mode: DeployMode::Switch,
			commit: "abc123".to_string(),
			commit_message: "a commit".to_string(),
			success_commit: None,
			success_commit_message: None,
			scheduled: false,
		}
	}

	#[tokio::test]
	async fn invokes_hook_with_documented_env() {
		let dir = tempfile::tempdir().unwrap();
		let script = dir.path().join("hook.sh");
		std::fs::write(
			&script,
			"#!/bin/sh\nprintenv DEPLOY_STATUS DEPLOY_TYPE DEPLOY_MODE DEPLOY_COMMIT\n",
		)
		.unwrap();
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mut perms = std::fs::metadata(&script).unwrap().permissions();
			perms.set_mode(0o755);
			std::fs::set_permissions(&script, perms).unwrap();
		}
		let invoker = ProcessHookInvoker;
		invoker.invoke(&script, &env(HookStatus::Pre)).await.unwrap();
	}

	#[tokio::test]
	async fn propagates_nonzero_exit() {
		let dir = tempfile::tempdir().unwrap();
		let script = dir.path().join("hook.sh");
		std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mut perms = std::fs::metadata(&script).unwrap().permissions();
			perms.set_mode(0o755);
			std::fs::set_permissions(&script, perms).unwrap();
		}
		let invoker = ProcessHookInvoker;
		assert!(invoker.invoke(&script, &env(HookStatus::Pre)).await.is_err());
	}
}
