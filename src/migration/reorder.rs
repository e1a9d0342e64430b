//! Reorder & repair operations (spec.md 4.C.6, 8 invariant 2, seed
//! scenarios S2/S3).
//!
//! Grounded on `padmy/migration/reorder.py`'s `reorder_files`, generalized
//! into three named operations per the distilled spec's separation of
//! `repairHeaders`/`reorderByLast`/`reorderByApplied`.

use std::path::{Path, PathBuf};

use crate::error::{PgOpsError, Result};

use super::file::{Header, Kind, MigrationFile};

/// Rewrites any file whose header's `prevFile` disagrees with the actual
/// previous file of its kind. Never renames. Returns the paths modified.
pub fn repair_headers(folder: &Path) -> Result<Vec<PathBuf>> {
	let mut modified = vec![];
	for kind in [Kind::Up, Kind::Down] {
		let mut files = MigrationFile::read_by_kind(folder, kind)?;
		let mut previous_name: Option<String> = None;
		for file in &mut files {
			let expected = previous_name.clone();
			let needs_rewrite = match (&file.header, &expected) {
				(Some(h), Some(exp)) => h.prev_file.as_deref() != Some(exp.as_str()),
				(Some(h), None) => h.prev_file.is_some(),
				(None, Some(_)) => true,
				(None, None) => false,
			};
			if needs_rewrite {
				let mut header = file.header.clone().unwrap_or_default();
				header.prev_file = expected;
				file.rewrite_header(header)?;
				modified.push(file.path.clone());
			}
			previous_name = Some(file.filename());
		}
	}
	Ok(modified)
}

/// Reassigns timestamps for the given fileIds in last-first order,
/// starting at `now` and advancing by one microsecond per id, then repairs
/// headers (spec.md 4.C.6, seed scenario S2).
///
/// `now` is caller-supplied (not `chrono::Utc::now()`) so the operation is
/// deterministic and independently testable.
pub fn reorder_by_last(folder: &Path, ids_last_first: &[String], now: i64) -> Result<Vec<PathBuf>> {
	let mut modified = vec![];
	for kind in [Kind::Up, Kind::Down] {
		let mut files = MigrationFile::read_by_kind(folder, kind)?;
		let mut new_ts: std::collections::HashMap<&str, i64> = std::collections::HashMap::new();
		for (offset, id) in ids_last_first.iter().enumerate() {
			new_ts.insert(id.as_str(), now + offset as i64);
		}
		for id in ids_last_first {
			if !files.iter().any(|f| &f.file_id == id) {
				return Err(PgOpsError::Configuration(format!("fileId {id} not found among {kind} files")));
			}
		}
		for file in &mut files {
			if let Some(&ts) = new_ts.get(file.file_id.as_str()) {
				rename_with_new_ts(file, ts)?;
				modified.push(file.path.clone());
			}
		}
	}
	modified.extend(repair_headers(folder)?);
	modified.sort();
	modified.dedup();
	Ok(modified)
}

/// Partitions existing migrations (of one kind) into `before` (files
/// preceding the first file named in `applied_ids`, left untouched),
/// `commit` (the ids in `applied_ids` present from that point on, in
/// chronological-applied order — i.e. `applied_ids` reversed, since it is
/// given last-applied-first), and `toReorder` (remaining files in that
/// same tail that are not in `applied_ids`, keeping their relative order).
/// New file order is `before ++ commit ++ toReorder`; only `commit` and
/// `toReorder` receive new timestamps (spec.md 4.C.6, seed scenario S3).
fn partition_by_applied(files: &[MigrationFile], applied_ids_last_first: &[String]) -> (Vec<String>, Vec<String>) {
	let first_match = files.iter().position(|f| applied_ids_last_first.contains(&f.file_id));
	let Some(first_match) = first_match else {
		return (files.iter().map(|f| f.file_id.clone()).collect(), vec![]);
	};

	let before: Vec<String> = files[..first_match].iter().map(|f| f.file_id.clone()).collect();
	let tail: Vec<&MigrationFile> = files[first_match..].iter().collect();

	let commit: Vec<String> = applied_ids_last_first
		.iter()
		.rev()
		.filter(|id| tail.iter().any(|f| &f.file_id == *id))
		.cloned()
		.collect();
	let to_reorder: Vec<String> = tail
		.iter()
		.map(|f| f.file_id.clone())
		.filter(|id| !applied_ids_last_first.contains(id))
		.collect();

	let mut moved = commit;
	moved.extend(to_reorder);
	(before, moved)
}

pub fn reorder_by_applied(folder: &Path, applied_ids_last_first: &[String], now: i64) -> Result<Vec<PathBuf>> {
	let ups = MigrationFile::read_by_kind(folder, Kind::Up)?;
	let (_before, moved) = partition_by_applied(&ups, applied_ids_last_first);

	let mut modified = vec![];
	for kind in [Kind::Up, Kind::Down] {
		let mut files = MigrationFile::read_by_kind(folder, kind)?;
		for (offset, id) in moved.iter().enumerate() {
			if let Some(file) = files.iter_mut().find(|f| &f.file_id == id) {
				let ts = now + offset as i64;
				rename_with_new_ts(file, ts)?;
				modified.push(file.path.clone());
			}
		}
	}
	modified.extend(repair_headers(folder)?);
	modified.sort();
	modified.dedup();
	Ok(modified)
}

fn rename_with_new_ts(file: &mut MigrationFile, new_ts: i64) -> Result<()> {
	let folder = file.path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
	let new_path = folder.join(format!("{new_ts}-{}-{}.sql", file.file_id, file.kind));
	std::fs::rename(&file.path, &new_path)?;
	file.path = new_path;
	file.ts = new_ts;
	Ok(())
}

/// Rewrites a header in place without touching the filename — exposed so
/// `reorder`/`repair` callers can pre-seed a header (used by tests and by
/// `create::create_migration`'s chain-linking).
pub fn set_header(file: &mut MigrationFile, header: Header) -> Result<()> {
	file.rewrite_header(header)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partition_by_applied_matches_seed_scenario_s3() {
		let files: Vec<MigrationFile> = ["00", "01", "02", "03", "04"]
			.iter()
			.map(|id| MigrationFile { ts: 1, file_id: id.to_string(), kind: Kind::Up, path: PathBuf::from(format!("1-{id}-up.sql")), header: None })
			.collect();
		let applied = vec!["02".to_string(), "04".to_string()];
		let (before, moved) = partition_by_applied(&files, &applied);
		assert_eq!(before, vec!["00".to_string(), "01".to_string()]);
		assert_eq!(moved, vec!["04".to_string(), "02".to_string(), "03".to_string()]);
		let mut full = before;
		full.extend(moved);
		assert_eq!(full, vec!["00", "01", "04", "02", "03"].iter().map(|s| s.to_string()).collect::<Vec<_>>());
	}

	#[test]
	fn partition_by_applied_is_identity_when_no_match() {
		let files: Vec<MigrationFile> = ["00", "01"]
			.iter()
			.map(|id| MigrationFile { ts: 1, file_id: id.to_string(), kind: Kind::Up, path: PathBuf::from(format!("1-{id}-up.sql")), header: None })
			.collect();
		let (before, moved) = partition_by_applied(&files, &["zz".to_string()]);
		assert_eq!(before, vec!["00".to_string(), "01".to_string()]);
		assert!(moved.is_empty());
	}
}
