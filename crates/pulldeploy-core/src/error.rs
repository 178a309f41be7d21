use better_command::CommandError;

/// Error kinds per the error-handling design: each one routes to a distinct
/// exit code / state-machine transition, so they are never collapsed into a
/// single opaque variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Network/VCS fetch failure. The run aborts without touching the host;
	/// the next scheduled invocation retries.
	#[error("transient failure: {0}")]
	Transient(String),

	/// Missing config_dir on `check`, malformed config, VCS corruption. Exit
	/// non-zero without touching the system.
	#[error("fatal: {0}")]
	Fatal(String),

	/// Target commit could not be evaluated or built. No activation was
	/// attempted.
	#[error("eval/build failed: {0}")]
	EvalOrBuild(String),

	/// A new generation was built but activation failed, or it failed the
	/// reachability probe. Rollback is attempted.
	#[error("activation failed: {0}")]
	Activate(String),

	/// Best-effort rollback itself failed. Logged; the exit code still
	/// reflects the original failure that triggered the rollback.
	#[error("rollback failed: {0}")]
	RollbackFailure(String),

	/// Could not acquire the advisory lock: another run is in progress.
	#[error("another deployment is already running")]
	Busy,
}

impl Error {
	pub fn fatal(msg: impl Into<String>) -> Self {
		Error::Fatal(msg.into())
	}

	pub fn transient(msg: impl Into<String>) -> Self {
		Error::Transient(msg.into())
	}
}

impl From<CommandError> for Error {
	fn from(e: CommandError) -> Self {
		match &e {
			CommandError::Timeout { .. } => Error::Transient(e.to_string()),
			CommandError::Spawn { .. } => Error::Fatal(e.to_string()),
			CommandError::NonZeroExit { .. } => Error::Transient(e.to_string()),
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
