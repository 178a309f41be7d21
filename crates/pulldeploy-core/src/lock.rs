use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};

pub fn lock_path(config_dir: &Path) -> PathBuf {
	config_dir.join(".lock")
}

/// Advisory exclusive lock on `config_dir/.lock`, held for the whole run.
/// Dropping it releases the lock (the OS also releases it if the process
/// dies, so a crash never leaves the host permanently un-deployable).
pub struct RunLock {
	_flock: Flock<File>,
}

impl RunLock {
	/// Tries to acquire the lock without blocking. A second invocation
	/// that can't obtain it gets `Error::Busy` immediately — per the
	/// concurrency model, there is no retry within a single invocation.
	pub fn acquire(config_dir: &Path) -> Result<Self> {
		std::fs::create_dir_all(config_dir)
			.map_err(|e| Error::fatal(format!("creating {}: {e}", config_dir.display())))?;
		let file = std::fs::OpenOptions::new()
			.create(true)
			.write(true)
			.open(lock_path(config_dir))
			.map_err(|e| Error::fatal(format!("opening lock file: {e}")))?;
		match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
			Ok(flock) => Ok(RunLock { _flock: flock }),
			Err((_file, _errno)) => Err(Error::Busy),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_acquire_is_busy() {
		let dir = tempfile::tempdir().unwrap();
		let _first = RunLock::acquire(dir.path()).unwrap();
		let second = RunLock::acquire(dir.path());
		assert!(matches!(second, Err(Error::Busy)));
	}

	#[test]
	fn lock_is_released_on_drop() {
		let dir = tempfile::tempdir().unwrap();
		{
			let _first = RunLock::acquire(dir.path()).unwrap();
		}
		let second = RunLock::acquire(dir.path());
		assert!(second.is_ok());
	}
}
