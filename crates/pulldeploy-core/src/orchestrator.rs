use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use better_command::Cmd;
use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument as _};

use crate::activation::{ActivationDriver, ActivationResult, ExitKind};
use crate::error::{Error, Result};
use crate::generations::GenerationRegistry;
use crate::hook::{HookEnv, HookInvoker, HookStatus};
use crate::lock::RunLock;
use crate::marker;
use crate::reachability::ReachabilityProbe;
use crate::selector::{select_target, AncestryOracle};
use crate::settings::{DeployMode, Settings};
use crate::types::{CommitHash, Ref, Target, TargetKind};
use crate::vcs::{repo_path, VcsGateway};

/// Triggers a host reboot. A separate seam from [`ActivationDriver`]
/// because scheduling it is the orchestrator's job (it happens *after*
/// hooks run, per spec §4.F), not the activation driver's.
#[async_trait]
pub trait RebootTrigger: Send + Sync {
	async fn reboot(&self) -> Result<()>;
}

pub struct SystemdRebootTrigger;

#[async_trait]
impl RebootTrigger for SystemdRebootTrigger {
	async fn reboot(&self) -> Result<()> {
		let mut cmd = Cmd::new("systemctl");
		cmd.arg("reboot");
		cmd.run().await?;
		Ok(())
	}
}

/// Options that vary per invocation (as opposed to [`Settings`], which is
/// fixed for the lifetime of the process).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
	pub force: bool,
	pub no_magic_rollback: bool,
	pub scheduled: bool,
}

/// Terminal outcome of a `run` invocation, mapping onto the exit codes in
/// spec §6.
#[derive(Debug)]
pub enum RunOutcome {
	/// Nothing to do; no hooks fired.
	UpToDate,
	Succeeded { commit: CommitHash, rebooted: bool },
	Failed(Error),
	Aborted(Error),
	Busy,
}

#[derive(Debug)]
pub struct CheckOutcome {
	pub target: Target,
	pub current: Option<CommitHash>,
	pub up_to_date: bool,
}

/// Component F. Wires A-E and G together into the deploy-mode state
/// machine. Each transition in spec §4.F is modeled as a distinct method
/// taking the previous stage's outcome and returning the next stage's; no
/// step relies on unwinding or exceptions for control flow.
pub struct Orchestrator {
	pub settings: Settings,
	pub hostname: String,
	pub vcs: Box<dyn VcsGateway>,
	pub probe: Box<dyn ReachabilityProbe>,
	pub activation: Box<dyn ActivationDriver>,
	pub registry: Box<dyn GenerationRegistry>,
	pub hook: Box<dyn HookInvoker>,
	pub reboot: Box<dyn RebootTrigger>,
}

/// A plain lookup table built from exactly the ancestry queries the
/// selector needs for this run's candidate set. Populating it is the only
/// I/O the selection step performs; the selector itself stays a pure
/// function over this snapshot.
struct PrefetchedOracle {
	merge_base: HashMap<(CommitHash, CommitHash), CommitHash>,
	is_ancestor: HashMap<(CommitHash, CommitHash), bool>,
}

impl AncestryOracle for PrefetchedOracle {
	fn merge_base(&self, a: &CommitHash, b: &CommitHash) -> Result<CommitHash> {
		self.merge_base
			.get(&(a.clone(), b.clone()))
			.cloned()
			.ok_or_else(|| Error::fatal("merge-base not prefetched for this pair"))
	}

	fn is_ancestor(&self, a: &CommitHash, b: &CommitHash) -> Result<bool> {
		self.is_ancestor
			.get(&(a.clone(), b.clone()))
			.copied()
			.ok_or_else(|| Error::fatal("ancestry not prefetched for this pair"))
	}
}

impl Orchestrator {
	async fn prefetch_oracle(
		&self,
		repo: &std::path::Path,
		refs: &[Ref],
		main: &Ref,
		deployed: Option<&CommitHash>,
	) -> Result<PrefetchedOracle> {
		let mut merge_base = HashMap::new();
		let mut is_ancestor = HashMap::new();

		let base = match deployed {
			Some(deployed) => {
				let b = self.vcs.merge_base(repo, deployed, &main.tip).await?;
				merge_base.insert((deployed.clone(), main.tip.clone()), b.clone());
				Some(b)
			}
			None => None,
		};

		for r in refs {
			if r.name == main.name {
				continue;
			}
			let Some(hosts) = crate::types::parse_testing_hostnames(
				&r.name,
				&self.settings.origin.testing_prefix,
				&self.settings.origin.testing_separator,
			) else {
				continue;
			};
			if !hosts.contains(&self.hostname.as_str()) {
				continue;
			}
			let landed = self.vcs.is_merged_into(repo, &r.tip, &main.tip).await?;
			is_ancestor.insert((r.tip.clone(), main.tip.clone()), landed);
			if let Some(base) = &base {
				if r.tip != *base {
					let behind = self.vcs.is_ancestor(repo, &r.tip, base).await?;
					is_ancestor.insert((r.tip.clone(), base.clone()), behind);
				}
			}
		}

		Ok(PrefetchedOracle {
			merge_base,
			is_ancestor,
		})
	}

	fn deploy_mode_for(&self, kind: TargetKind) -> DeployMode {
		match kind {
			TargetKind::Main => self.settings.deploy_modes.main,
			TargetKind::Testing => self.settings.deploy_modes.testing,
		}
	}

	fn needs_verification(&self, effective_mode: DeployMode, no_magic_rollback: bool) -> bool {
		if no_magic_rollback {
			return false;
		}
		matches!(effective_mode, DeployMode::Test | DeployMode::Switch)
	}

	async fn run_hook(
		&self,
		status: HookStatus,
		target: &Target,
		commit_message: &str,
		mode: DeployMode,
		scheduled: bool,
	) -> Result<()> {
		let Some(hook) = &self.settings.hook else {
			return Ok(());
		};
		let marker = marker::read(&self.settings.config_dir);
		let env = HookEnv {
			status,
			deploy_type: target.kind,
			deploy_mode: mode,
			commit: target.commit.0.clone(),
			commit_message: commit_message.to_string(),
			success_commit: marker.as_ref().map(|m| m.commit.clone()),
			success_commit_message: marker.as_ref().map(|m| m.message.clone()),
			scheduled,
		};
		self.hook.invoke(hook, &env).await
	}

	/// Runs a terminal (`success`/`failed`) hook, logging but swallowing any
	/// error per spec §7 ("errors inside success/failed hooks are logged
	/// and swallowed").
	async fn run_terminal_hook(
		&self,
		status: HookStatus,
		target: &Target,
		commit_message: &str,
		mode: DeployMode,
		scheduled: bool,
	) {
		if let Err(e) = self.run_hook(status, target, commit_message, mode, scheduled).await {
			warn!(%e, status = ?status, "terminal hook failed (ignored)");
		}
	}

	/// Component F entry point: drives Prepare -> Select -> ... -> Done.
	pub async fn run(&self, opts: RunOptions, cancel: &AtomicBool) -> RunOutcome {
		let _lock = match RunLock::acquire(&self.settings.config_dir) {
			Ok(l) => l,
			Err(_) => return RunOutcome::Busy,
		};

		if cancel.load(Ordering::SeqCst) {
			return RunOutcome::Aborted(Error::fatal("cancelled before prepare"));
		}

		let (refs, deployed_commit) = match self.prepare().await {
			Ok(v) => v,
			Err(e) => return RunOutcome::Aborted(e),
		};

		if cancel.load(Ordering::SeqCst) {
			return RunOutcome::Aborted(Error::fatal("cancelled before select"));
		}

		let main = match refs.iter().find(|r| r.name == self.settings.origin.main) {
			Some(r) => r.clone(),
			None => {
				return RunOutcome::Aborted(Error::fatal(format!(
					"main branch {} not found on remote",
					self.settings.origin.main
				)))
			}
		};
		let oracle = match self
			.prefetch_oracle(&repo_path(&self.settings.config_dir), &refs, &main, deployed_commit.as_ref())
			.await
		{
			Ok(o) => o,
			Err(e) => return RunOutcome::Aborted(e),
		};
		let target = match select_target(
			&self.hostname,
			&self.settings.origin.main,
			&self.settings.origin.testing_prefix,
			&self.settings.origin.testing_separator,
			&refs,
			deployed_commit.as_ref(),
			&oracle,
		) {
			Ok(t) => t,
			Err(e) => return RunOutcome::Aborted(e),
		};

		let up_to_date = deployed_commit.as_ref() == Some(&target.commit);
		if up_to_date && !opts.force {
			info!(commit = %target.commit, "already up to date");
			return RunOutcome::UpToDate;
		}

		if cancel.load(Ordering::SeqCst) {
			return RunOutcome::Aborted(Error::fatal("cancelled before checkout"));
		}

		let repo = repo_path(&self.settings.config_dir);
		if let Err(e) = self
			.vcs
			.checkout_detached(&repo, &target.commit)
			.instrument(info_span!("checkout", commit = %target.commit))
			.await
		{
			return RunOutcome::Aborted(e);
		}

		let commit_meta = match self.vcs.commit(&repo, &target.commit).await {
			Ok(c) => c,
			Err(e) => return RunOutcome::Aborted(e),
		};

		let configured_mode = self.deploy_mode_for(target.kind);

		if cancel.load(Ordering::SeqCst) {
			return RunOutcome::Aborted(Error::fatal("cancelled before pre-hook"));
		}

		if let Err(e) = self
			.run_hook(HookStatus::Pre, &target, &commit_meta.subject, configured_mode, opts.scheduled)
			.instrument(info_span!("pre_hook"))
			.await
		{
			return RunOutcome::Aborted(e);
		}

		if cancel.load(Ordering::SeqCst) {
			return RunOutcome::Aborted(Error::fatal("cancelled before activate"));
		}

		// From here on, a cancellation signal is only honored after the
		// current activation/verify/rollback sequence reaches a terminal
		// state, never in the middle of it (spec §5).
		let activation_result = match self
			.activation
			.activate(configured_mode, &repo)
			.instrument(info_span!("activate", mode = %configured_mode))
			.await
		{
			Ok(r) => r,
			Err(e) => return RunOutcome::Aborted(e),
		};

		info!(
			commit = %target.commit,
			branch = %target.ref_name,
			effective_mode = %activation_result.effective_mode,
			"activation attempt finished"
		);

		match activation_result.exit_kind {
			ExitKind::EvalFailed | ExitKind::BuildFailed => {
				let e = Error::EvalOrBuild(format!(
					"{:?} for commit {}",
					activation_result.exit_kind, target.commit
				));
				self.run_terminal_hook(
					HookStatus::Failed,
					&target,
					&commit_meta.subject,
					activation_result.effective_mode,
					opts.scheduled,
				)
				.await;
				RunOutcome::Failed(e)
			}
			ExitKind::ActivateFailed => {
				let rollback_err = self.rollback().await.err();
				self.run_terminal_hook(
					HookStatus::Failed,
					&target,
					&commit_meta.subject,
					activation_result.effective_mode,
					opts.scheduled,
				)
				.await;
				let e = Error::Activate(format!("activation failed for commit {}", target.commit));
				if let Some(rb) = rollback_err {
					warn!(%rb, "rollback after activation failure also failed");
				}
				RunOutcome::Failed(e)
			}
			ExitKind::Ok => {
				if activation_result.effective_mode != DeployMode::Test {
					if let Err(e) = self.registry.record_commit(&target.commit).await {
						warn!(%e, "failed to record generation commit marker");
					}
				}
				if self.needs_verification(activation_result.effective_mode, opts.no_magic_rollback) {
					let timeout = Duration::from_secs(self.settings.magic_rollback_timeout);
					let token = match self.settings.resolve_token() {
						Ok(t) => t,
						Err(e) => {
							warn!(%e, "failed to resolve token for reachability probe; probing unauthenticated");
							None
						}
					};
					let reachable = self
						.probe
						.reachable(&self.settings.origin.url, timeout, token.as_deref())
						.instrument(info_span!("verify"))
						.await;
					if !reachable {
						warn!("reachability probe failed; rolling back");
						let rollback_err = self.rollback().await.err();
						self.run_terminal_hook(
							HookStatus::Failed,
							&target,
							&commit_meta.subject,
							activation_result.effective_mode,
							opts.scheduled,
						)
						.await;
						let e = Error::Activate(format!(
							"unreachable after activating commit {}",
							target.commit
						));
						if let Some(rb) = rollback_err {
							warn!(%rb, "rollback after failed verification also failed");
						}
						return RunOutcome::Failed(e);
					}
				}
				if let Err(e) = marker::write(
					&self.settings.config_dir,
					&target.commit,
					&commit_meta.subject,
					Utc::now(),
				) {
					error!(%e, "failed to persist success marker");
				}
				self.run_terminal_hook(
					HookStatus::Success,
					&target,
					&commit_meta.subject,
					activation_result.effective_mode,
					opts.scheduled,
				)
				.await;

				let rebooted = activation_result.effective_mode == DeployMode::Reboot;
				if rebooted {
					if let Err(e) = self.reboot.reboot().await {
						error!(%e, "failed to schedule reboot");
					}
				}
				RunOutcome::Succeeded {
					commit: target.commit,
					rebooted,
				}
			}
		}
	}

	async fn rollback(&self) -> Result<()> {
		let Some(previous) = self.registry.previous().await? else {
			return Err(Error::RollbackFailure("no previous generation to roll back to".into()));
		};
		self.registry
			.activate(&previous, DeployMode::Switch)
			.await
			.map_err(|e| Error::RollbackFailure(e.to_string()))
	}

	async fn prepare(&self) -> Result<(Vec<Ref>, Option<CommitHash>)> {
		let token = self.settings.resolve_token()?;
		let repo = repo_path(&self.settings.config_dir);
		self.vcs
			.ensure_repo(&repo, &self.settings.origin.url, token.as_deref())
			.await?;
		self.vcs.fetch(&repo, token.as_deref()).await?;
		let refs = self.vcs.remote_branches(&repo).await?;

		let deployed_commit = match self.registry.current().await {
			Ok(gen) => gen.source_commit,
			Err(e) => {
				// Open question (spec §9): when the running system's
				// source commit can't be recovered (first-ever run, or a
				// generation predating this tool), fall back to "no
				// deployed commit". This disables the downgrade-prevention
				// check for testing branches on this one run.
				warn!(%e, "could not determine currently deployed commit; downgrade check disabled for this run");
				None
			}
		};
		Ok((refs, deployed_commit))
	}

	/// Runs `Prepare -> Select` only, for the `check` subcommand. Does not
	/// take the advisory lock or mutate `config_dir` beyond the repo sync
	/// git itself performs; a missing `config_dir` is a hard error, per
	/// spec §4.F / §6.
	pub async fn check(&self) -> Result<CheckOutcome> {
		if !self.settings.config_dir.exists() {
			return Err(Error::fatal(format!(
				"config_dir {} does not exist",
				self.settings.config_dir.display()
			)));
		}
		let (refs, deployed_commit) = self.prepare().await?;
		let main = refs
			.iter()
			.find(|r| r.name == self.settings.origin.main)
			.ok_or_else(|| Error::fatal(format!("main branch {} not found on remote", self.settings.origin.main)))?
			.clone();
		let oracle = self
			.prefetch_oracle(&repo_path(&self.settings.config_dir), &refs, &main, deployed_commit.as_ref())
			.await?;
		let target = select_target(
			&self.hostname,
			&self.settings.origin.main,
			&self.settings.origin.testing_prefix,
			&self.settings.origin.testing_separator,
			&refs,
			deployed_commit.as_ref(),
			&oracle,
		)?;
		let up_to_date = deployed_commit.as_ref() == Some(&target.commit);
		Ok(CheckOutcome {
			target,
			current: deployed_commit,
			up_to_date,
		})
	}
}
