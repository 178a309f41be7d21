use std::path::{Path, PathBuf};

use async_trait::async_trait;
use better_command::Cmd;
use tracing::warn;

use crate::error::{Error, Result};
use crate::settings::DeployMode;
use crate::types::CommitHash;

/// An installed, bootable configuration snapshot. `source_commit` is
/// recovered from a marker file written alongside the generation's entry in
/// the (writable) profile directory; it is `None` when the generation
/// predates this tool, was built in a mode that never registers a
/// generation (`test`), or the marker is otherwise unreadable. Nix store
/// paths are immutable, so this marker can never live inside `store_path`
/// itself — it has to be written into the profile directory, which is the
/// one place associated with a generation that's writable after the fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
	pub number: u64,
	pub store_path: PathBuf,
	pub source_commit: Option<CommitHash>,
}

/// Component D. Enumerates previously built generations; identifies the
/// current and previous one; can activate an arbitrary prior generation.
#[async_trait]
pub trait GenerationRegistry: Send + Sync {
	async fn current(&self) -> Result<Generation>;
	async fn previous(&self) -> Result<Option<Generation>>;
	async fn activate(&self, generation: &Generation, mode: DeployMode) -> Result<()>;

	/// Associates `commit` with whatever generation is current right after
	/// a successful activation that registers one (every mode but `test`,
	/// which never touches the profile pointer). Called by the
	/// orchestrator immediately after a successful activation, before
	/// verification — the new generation exists in the profile directory
	/// either way, even if verification later rolls back to a prior one.
	async fn record_commit(&self, commit: &CommitHash) -> Result<()>;
}

/// Discovers generations by enumerating the profile directory's numbered
/// generation symlinks (`<prefix>-<N>-link`), the way NixOS manages its
/// `system` profile. `profile_dir` and `profile_name` are overridable so
/// tests can point this at a scratch directory instead of `/nix/var/nix`.
pub struct NixGenerationRegistry {
	profile_dir: PathBuf,
	profile_name: String,
	profile_link: PathBuf,
	rebuild_command: String,
}

impl NixGenerationRegistry {
	pub fn new(profile_dir: PathBuf, profile_name: impl Into<String>, rebuild_command: impl Into<String>) -> Self {
		let profile_name = profile_name.into();
		let profile_link = profile_dir.join(&profile_name);
		Self {
			profile_dir,
			profile_name,
			profile_link,
			rebuild_command: rebuild_command.into(),
		}
	}

	fn list(&self) -> Result<Vec<Generation>> {
		let mut out = Vec::new();
		let prefix = format!("{}-", self.profile_name);
		let entries = match std::fs::read_dir(&self.profile_dir) {
			Ok(e) => e,
			Err(e) => return Err(Error::fatal(format!("listing generations: {e}"))),
		};
		for entry in entries {
			let entry = entry.map_err(|e| Error::fatal(format!("reading generation dir entry: {e}")))?;
			let name = entry.file_name();
			let name = name.to_string_lossy();
			let Some(rest) = name.strip_prefix(&prefix) else {
				continue;
			};
			let Some(number_str) = rest.strip_suffix("-link") else {
				continue;
			};
			let Ok(number) = number_str.parse::<u64>() else {
				continue;
			};
			let store_path = std::fs::read_link(entry.path())
				.map_err(|e| Error::fatal(format!("reading generation link {name}: {e}")))?;
			let source_commit = self.read_commit_marker(number);
			out.push(Generation {
				number,
				store_path,
				source_commit,
			});
		}
		out.sort_by_key(|g| g.number);
		Ok(out)
	}

	fn current_number(&self) -> Result<u64> {
		let target = std::fs::read_link(&self.profile_link)
			.map_err(|e| Error::fatal(format!("reading current profile link: {e}")))?;
		let name = target
			.file_name()
			.ok_or_else(|| Error::fatal("current profile link has no file name"))?
			.to_string_lossy()
			.into_owned();
		let prefix = format!("{}-", self.profile_name);
		let number_str = name
			.strip_prefix(&prefix)
			.and_then(|s| s.strip_suffix("-link"))
			.ok_or_else(|| Error::fatal(format!("unparseable current generation link: {name}")))?;
		number_str
			.parse()
			.map_err(|e| Error::fatal(format!("unparseable generation number {number_str}: {e}")))
	}

	/// Sibling file next to `<profile_name>-<N>-link` in the writable
	/// profile directory, not inside the (immutable) store path itself.
	fn commit_marker_path(&self, number: u64) -> PathBuf {
		self.profile_dir
			.join(format!("{}-{}-commit", self.profile_name, number))
	}

	fn read_commit_marker(&self, number: u64) -> Option<CommitHash> {
		std::fs::read_to_string(self.commit_marker_path(number))
			.ok()
			.map(|s| s.trim().to_string().into())
	}
}

#[async_trait]
impl GenerationRegistry for NixGenerationRegistry {
	async fn current(&self) -> Result<Generation> {
		let current_number = self.current_number()?;
		self.list()?
			.into_iter()
			.find(|g| g.number == current_number)
			.ok_or_else(|| Error::fatal("current generation not found in profile directory"))
	}

	async fn previous(&self) -> Result<Option<Generation>> {
		let current_number = self.current_number()?;
		Ok(self
			.list()?
			.into_iter()
			.filter(|g| g.number < current_number)
			.next_back())
	}

	async fn activate(&self, generation: &Generation, mode: DeployMode) -> Result<()> {
		let script = generation.store_path.join("bin/switch-to-configuration");
		let subcommand = match mode {
			DeployMode::Test => "test",
			DeployMode::Switch => "switch",
			DeployMode::Boot | DeployMode::Reboot => "boot",
			DeployMode::RebootOnKernelChange => "switch",
		};
		let mut cmd = Cmd::new(&script);
		cmd.arg(subcommand);
		if let Err(e) = cmd.run().await {
			warn!(%e, generation = generation.number, "rollback activation reported an error");
			return Err(e.into());
		}
		// Keep the rebuild tool's own profile bookkeeping (`system-N-link`
		// pointers) consistent by asking it to re-register this store path
		// as the active profile entry, mirroring what `switch` does when
		// invoked through the normal build path.
		let mut register = Cmd::new(&self.rebuild_command);
		register
			.comparg("--profile", self.profile_link.as_os_str())
			.comparg("--set", generation.store_path.as_os_str());
		let _ = register.run().await;
		Ok(())
	}

	async fn record_commit(&self, commit: &CommitHash) -> Result<()> {
		let number = self.current_number()?;
		std::fs::write(self.commit_marker_path(number), format!("{}\n", commit.0))
			.map_err(|e| Error::fatal(format!("writing generation commit marker: {e}")))?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::os::unix::fs::symlink;

	fn make_generation(dir: &Path, profile_dir: &Path, profile_name: &str, number: u64, current: bool) {
		let store = dir.join(format!("store-{number}"));
		std::fs::create_dir_all(&store).unwrap();
		let link = profile_dir.join(format!("{profile_name}-{number}-link"));
		symlink(&store, &link).unwrap();
		if current {
			let current_link = profile_dir.join(profile_name);
			let _ = std::fs::remove_file(&current_link);
			symlink(&link, &current_link).unwrap();
		}
	}

	#[tokio::test]
	async fn finds_current_and_previous() {
		let dir = tempfile::tempdir().unwrap();
		let profile_dir = dir.path().join("profiles");
		std::fs::create_dir_all(&profile_dir).unwrap();
		make_generation(dir.path(), &profile_dir, "system", 1, false);
		make_generation(dir.path(), &profile_dir, "system", 2, true);

		let registry = NixGenerationRegistry::new(profile_dir, "system", "nixos-rebuild");
		let current = registry.current().await.unwrap();
		assert_eq!(current.number, 2);
		let previous = registry.previous().await.unwrap().unwrap();
		assert_eq!(previous.number, 1);
	}

	#[tokio::test]
	async fn previous_is_none_for_first_generation() {
		let dir = tempfile::tempdir().unwrap();
		let profile_dir = dir.path().join("profiles");
		std::fs::create_dir_all(&profile_dir).unwrap();
		make_generation(dir.path(), &profile_dir, "system", 1, true);

		let registry = NixGenerationRegistry::new(profile_dir, "system", "nixos-rebuild");
		assert!(registry.previous().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn record_commit_is_readable_back_from_current() {
		let dir = tempfile::tempdir().unwrap();
		let profile_dir = dir.path().join("profiles");
		std::fs::create_dir_all(&profile_dir).unwrap();
		make_generation(dir.path(), &profile_dir, "system", 1, true);

		let registry = NixGenerationRegistry::new(profile_dir, "system", "nixos-rebuild");
		assert!(registry.current().await.unwrap().source_commit.is_none());

		let commit: CommitHash = "abc123".into();
		registry.record_commit(&commit).await.unwrap();

		let current = registry.current().await.unwrap();
		assert_eq!(current.source_commit, Some(commit));
	}
}
