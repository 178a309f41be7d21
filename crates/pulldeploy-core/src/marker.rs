use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::CommitHash;

/// On-disk record of the last deployment that completed activation *and*
/// passed the reachability probe. Read at hook time to populate
/// `DEPLOY_SUCCESS_COMMIT*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessMarker {
	pub commit: String,
	pub message: String,
	pub timestamp: DateTime<Utc>,
}

pub fn marker_path(config_dir: &Path) -> PathBuf {
	config_dir.join("last_success.json")
}

/// Reads the marker, if present. A missing or unparseable file is not an
/// error — it just means there's no prior success to report (e.g. first
/// run ever).
pub fn read(config_dir: &Path) -> Option<SuccessMarker> {
	let text = std::fs::read_to_string(marker_path(config_dir)).ok()?;
	serde_json::from_str(&text).ok()
}

/// Writes the marker atomically: serialize to a temp file in the same
/// directory, then `rename` over the final path. A crash at any point
/// leaves either the old marker (rename never happened) or the new one
/// (rename is the last syscall) — never a partially written file, since
/// the temp file is only ever observed under its own name.
pub fn write(config_dir: &Path, commit: &CommitHash, message: &str, timestamp: DateTime<Utc>) -> Result<()> {
	let marker = SuccessMarker {
		commit: commit.0.clone(),
		message: message.to_string(),
		timestamp,
	};
	let json = serde_json::to_string_pretty(&marker)
		.map_err(|e| Error::fatal(format!("serializing success marker: {e}")))?;

	let mut tmp = tempfile::Builder::new()
		.prefix(".last_success.json.")
		.tempfile_in(config_dir)
		.map_err(|e| Error::fatal(format!("creating temp marker file: {e}")))?;
	use std::io::Write as _;
	tmp.write_all(json.as_bytes())
		.map_err(|e| Error::fatal(format!("writing temp marker file: {e}")))?;
	tmp.flush()
		.map_err(|e| Error::fatal(format!("flushing temp marker file: {e}")))?;
	tmp.persist(marker_path(config_dir))
		.map_err(|e| Error::fatal(format!("renaming marker file into place: {e}")))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrips() {
		let dir = tempfile::tempdir().unwrap();
		assert!(read(dir.path()).is_none());
		let now = Utc::now();
		write(dir.path(), &"abc123".into(), "a commit", now).unwrap();
		let marker = read(dir.path()).unwrap();
		assert_eq!(marker.commit, "abc123");
		assert_eq!(marker.message, "a commit");
	}

	#[test]
	fn write_never_leaves_a_bare_temp_file_behind() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), &"abc123".into(), "msg", Utc::now()).unwrap();
		let entries: Vec<_> = std::fs::read_dir(dir.path())
			.unwrap()
			.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		assert_eq!(entries, vec!["last_success.json"]);
	}

	#[test]
	fn overwrite_replaces_old_value_wholesale() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), &"first".into(), "m1", Utc::now()).unwrap();
		write(dir.path(), &"second".into(), "m2", Utc::now()).unwrap();
		let marker = read(dir.path()).unwrap();
		assert_eq!(marker.commit, "second");
	}
}
