//! `migrate new`: generates an up/down file pair linked to the most recent
//! existing file of each kind (spec.md 4.C.3, seed scenario S1).
//!
//! Supplements the distilled spec with a per-user `MigrationConfig{author}`
//! persisted at `~/.pg_devops/config.json`, restored from
//! `original_source`'s `migration/config.py` (`_get_user_email`): ambient
//! UX, not excluded by any Non-goal.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::file::{generate_file_id, Header, Kind, MigrationFile};

pub struct NewMigrationOptions<'a> {
	pub version: Option<&'a str>,
	pub author: Option<&'a str>,
	pub skip_verify: bool,
}

/// Creates an up/down pair at `ts`, linking each to the most recent
/// existing file of its kind in `folder` (spec.md 4.C.3). `ts`/`file_id`
/// are caller-supplied so the operation stays deterministic and testable —
/// callers pass `chrono::Utc::now().timestamp()` and
/// `migration::file::generate_file_id()` in production.
pub fn create_migration(
	folder: &Path,
	ts: i64,
	file_id: &str,
	options: &NewMigrationOptions,
) -> Result<(MigrationFile, MigrationFile)> {
	fs::create_dir_all(folder)?;

	let existing_ups = MigrationFile::read_by_kind(folder, Kind::Up)?;
	let existing_downs = MigrationFile::read_by_kind(folder, Kind::Down)?;

	let prev_up = existing_ups.last().map(|f| f.filename());
	let prev_down = existing_downs.last().map(|f| f.filename());

	let up_header = Header {
		prev_file: prev_up,
		author: options.author.map(str::to_string),
		version: options.version.map(str::to_string),
		skip_verify: None,
	};
	let down_header = Header {
		prev_file: prev_down,
		author: options.author.map(str::to_string),
		version: options.version.map(str::to_string),
		skip_verify: if options.skip_verify { Some("no reason provided".to_string()) } else { None },
	};

	let up = MigrationFile::write(folder, ts, file_id, Kind::Up, &up_header, "")?;
	let down = MigrationFile::write(folder, ts, file_id, Kind::Down, &down_header, "")?;
	Ok((up, down))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
	pub author: Option<String>,
}

impl MigrationConfig {
	pub fn default_path() -> Option<PathBuf> {
		dirs_home().map(|home| home.join(".pg_devops").join("config.json"))
	}

	pub fn load(path: &Path) -> Result<MigrationConfig> {
		if !path.exists() {
			return Ok(MigrationConfig::default());
		}
		let text = fs::read_to_string(path)?;
		Ok(serde_json::from_str(&text).unwrap_or_default())
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		let text = serde_json::to_string_pretty(self).expect("MigrationConfig always serializes");
		fs::write(path, text)?;
		Ok(())
	}

	/// Returns `author`, persisting it the first time it's provided
	/// explicitly (mirrors `_get_user_email`'s prompt-and-remember flow).
	pub fn resolve_author(path: &Path, explicit: Option<&str>) -> Result<Option<String>> {
		let mut config = MigrationConfig::load(path)?;
		if let Some(author) = explicit {
			if config.author.as_deref() != Some(author) {
				config.author = Some(author.to_string());
				config.save(path)?;
			}
			return Ok(Some(author.to_string()));
		}
		Ok(config.author.clone())
	}
}

fn dirs_home() -> Option<PathBuf> {
	std::env::var_os("HOME").map(PathBuf::from)
}

pub fn next_file_id_and_ts() -> (i64, String) {
	(chrono::Utc::now().timestamp(), generate_file_id())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;

	#[test]
	fn creates_linked_pair_against_empty_folder() {
		let dir = std::env::temp_dir().join(format!("pg_devops_test_create_{}", generate_file_id()));
		fs::create_dir_all(&dir).unwrap();

		let options = NewMigrationOptions { version: None, author: Some("dev@example.com"), skip_verify: false };
		let (up, down) = create_migration(&dir, 1, "aaaaaaaa", &options).unwrap();
		assert_eq!(up.header.as_ref().unwrap().prev_file, None);
		assert_eq!(down.header.as_ref().unwrap().prev_file, None);

		let options2 = NewMigrationOptions { version: None, author: None, skip_verify: true };
		let (up2, down2) = create_migration(&dir, 2, "bbbbbbbb", &options2).unwrap();
		assert_eq!(up2.header.as_ref().unwrap().prev_file, Some(up.filename()));
		assert_eq!(down2.header.as_ref().unwrap().prev_file, Some(down.filename()));
		assert_eq!(down2.header.as_ref().unwrap().skip_verify, Some("no reason provided".to_string()));

		fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn migration_config_round_trips_through_json() {
		let dir = std::env::temp_dir().join(format!("pg_devops_test_config_{}", generate_file_id()));
		let path = dir.join("config.json");

		let author = MigrationConfig::resolve_author(&path, Some("a@b.com")).unwrap();
		assert_eq!(author, Some("a@b.com".to_string()));

		let remembered = MigrationConfig::resolve_author(&path, None).unwrap();
		assert_eq!(remembered, Some("a@b.com".to_string()));

		fs::remove_dir_all(&dir).ok();
	}
}
