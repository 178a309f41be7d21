use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Deploy mode as specified for `origin.main`/`origin.testing`, and as
/// resolved to an effective mode after `reboot_on_kernel_change` is decided
/// by the activation driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
	Test,
	Switch,
	Boot,
	Reboot,
	RebootOnKernelChange,
}

impl std::fmt::Display for DeployMode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			DeployMode::Test => "test",
			DeployMode::Switch => "switch",
			DeployMode::Boot => "boot",
			DeployMode::Reboot => "reboot",
			DeployMode::RebootOnKernelChange => "reboot_on_kernel_change",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OriginSettings {
	pub url: String,
	pub main: String,
	#[serde(default = "default_testing_prefix")]
	pub testing_prefix: String,
	#[serde(default = "default_testing_separator")]
	pub testing_separator: String,
	#[serde(default)]
	pub token: Option<String>,
	#[serde(default)]
	pub token_file: Option<PathBuf>,
}

fn default_testing_prefix() -> String {
	"testing/".to_string()
}

fn default_testing_separator() -> String {
	"/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployModes {
	pub main: DeployMode,
	pub testing: DeployMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
	config_dir: PathBuf,
	origin: OriginSettings,
	#[serde(default)]
	hook: Option<PathBuf>,
	deploy_modes: DeployModes,
	#[serde(default = "default_magic_rollback_timeout")]
	magic_rollback_timeout: u64,
	#[serde(default = "default_git_command")]
	git_command: String,
	#[serde(default = "default_rebuild_command")]
	rebuild_command: String,
}

fn default_magic_rollback_timeout() -> u64 {
	30
}

fn default_git_command() -> String {
	"git".to_string()
}

fn default_rebuild_command() -> String {
	"nixos-rebuild".to_string()
}

/// Immutable, validated settings for a single run. Constructed once via
/// [`Settings::load`] or [`Settings::parse`]; never mutated afterward.
#[derive(Debug, Clone)]
pub struct Settings {
	pub config_dir: PathBuf,
	pub origin: OriginSettings,
	pub hook: Option<PathBuf>,
	pub deploy_modes: DeployModes,
	pub magic_rollback_timeout: u64,
	pub git_command: String,
	pub rebuild_command: String,
}

impl Settings {
	/// Reads and parses the TOML file at `path`, then validates it.
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path)
			.map_err(|e| Error::fatal(format!("reading config {}: {e}", path.display())))?;
		Self::parse(&text)
	}

	pub fn parse(text: &str) -> Result<Self> {
		let raw: RawSettings = toml_edit::de::from_str(text)
			.map_err(|e| Error::fatal(format!("parsing config: {e}")))?;
		Self::from_raw(raw)
	}

	fn from_raw(raw: RawSettings) -> Result<Self> {
		if raw.origin.token.is_some() && raw.origin.token_file.is_some() {
			return Err(Error::fatal(
				"origin.token and origin.token_file are mutually exclusive",
			));
		}
		if raw.origin.main.trim().is_empty() {
			return Err(Error::fatal("origin.main must not be empty"));
		}
		if raw.magic_rollback_timeout == 0 {
			return Err(Error::fatal("magic_rollback_timeout must be positive"));
		}
		Ok(Settings {
			config_dir: raw.config_dir,
			origin: raw.origin,
			hook: raw.hook,
			deploy_modes: raw.deploy_modes,
			magic_rollback_timeout: raw.magic_rollback_timeout,
			git_command: raw.git_command,
			rebuild_command: raw.rebuild_command,
		})
	}

	/// Resolves the auth token, reading `token_file` if that's how it was
	/// configured. Read once per run; callers must not log the result.
	pub fn resolve_token(&self) -> Result<Option<String>> {
		if let Some(token) = &self.origin.token {
			return Ok(Some(token.clone()));
		}
		if let Some(path) = &self.origin.token_file {
			let token = std::fs::read_to_string(path)
				.map_err(|e| Error::fatal(format!("reading token_file: {e}")))?;
			return Ok(Some(token.trim().to_string()));
		}
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const VALID: &str = r#"
		config_dir = "/var/lib/pulldeploy"
		[origin]
		url = "https://example.com/repo.git"
		main = "main"
		[deploy_modes]
		main = "switch"
		testing = "test"
	"#;

	#[test]
	fn parses_minimal_config() {
		let s = Settings::parse(VALID).unwrap();
		assert_eq!(s.origin.main, "main");
		assert_eq!(s.origin.testing_prefix, "testing/");
		assert_eq!(s.magic_rollback_timeout, 30);
	}

	#[test]
	fn rejects_both_token_forms() {
		let text = format!(
			"{VALID}\n",
		);
		let mut doc: toml_edit::DocumentMut = text.parse().unwrap();
		doc["origin"]["token"] = toml_edit::value("abc");
		doc["origin"]["token_file"] = toml_edit::value("/etc/token");
		let err = Settings::parse(&doc.to_string()).unwrap_err();
		assert!(matches!(err, Error::Fatal(_)));
	}

	#[test]
	fn rejects_unknown_keys() {
		let text = format!("{VALID}\nbogus = 1\n");
		let err = Settings::parse(&text).unwrap_err();
		assert!(matches!(err, Error::Fatal(_)));
	}

	#[test]
	fn rejects_empty_main() {
		let mut doc: toml_edit::DocumentMut = VALID.parse().unwrap();
		doc["origin"]["main"] = toml_edit::value("");
		let err = Settings::parse(&doc.to_string()).unwrap_err();
		assert!(matches!(err, Error::Fatal(_)));
	}
}
