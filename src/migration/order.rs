//! Ordering invariant verification (spec.md 4.C.2, 8 invariant 1).
//!
//! Grounded on `padmy/migration/utils.py`'s `verify_migration_files`: walks
//! up and down sequences independently, checking monotone timestamps,
//! header-chain linkage and fileId uniqueness/pairing.

use std::collections::HashSet;

use crate::error::{MigrationErrorKind, PgOpsError, Result};

use super::file::{Kind, MigrationFile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFileError {
	pub kind: MigrationErrorKind,
	pub file_id: String,
	pub message: String,
}

/// Verifies one kind's sequence (already sorted by `(ts, fileId)`):
/// monotone timestamps, header-chain linkage, fileId uniqueness.
///
/// Duplicates are checked first and are always reported even when an
/// order/header violation is also present for the same id — see
/// DESIGN.md "Open Question decisions" #2.
fn verify_sequence(files: &[MigrationFile]) -> Vec<MigrationFileError> {
	let mut errors = vec![];
	let mut seen_ids: HashSet<&str> = HashSet::new();
	let mut previous: Option<&MigrationFile> = None;

	for file in files {
		if !seen_ids.insert(file.file_id.as_str()) {
			errors.push(MigrationFileError {
				kind: MigrationErrorKind::Duplicate,
				file_id: file.file_id.clone(),
				message: format!("fileId {} appears more than once", file.file_id),
			});
			continue;
		}

		if let Some(prev) = previous {
			if file.ts < prev.ts {
				errors.push(MigrationFileError {
					kind: MigrationErrorKind::Order,
					file_id: file.file_id.clone(),
					message: format!(
						"timestamp {} is earlier than previous file's timestamp {}",
						file.ts, prev.ts
					),
				});
			}
			let expected_prev = prev.filename();
			match &file.header {
				Some(header) if header.prev_file.as_deref() == Some(expected_prev.as_str()) => {}
				_ => errors.push(MigrationFileError {
					kind: MigrationErrorKind::Header,
					file_id: file.file_id.clone(),
					message: format!("header prevFile does not point at {expected_prev}"),
				}),
			}
		}
		previous = Some(file);
	}
	errors
}

/// Verifies that every fileId has exactly one up and one down file
/// (spec.md 4.C.2 invariant 4).
fn verify_pairing(ups: &[MigrationFile], downs: &[MigrationFile]) -> Vec<MigrationFileError> {
	let up_ids: HashSet<&str> = ups.iter().map(|f| f.file_id.as_str()).collect();
	let down_ids: HashSet<&str> = downs.iter().map(|f| f.file_id.as_str()).collect();
	let mut errors = vec![];
	for id in up_ids.difference(&down_ids) {
		errors.push(MigrationFileError {
			kind: MigrationErrorKind::Duplicate,
			file_id: id.to_string(),
			message: format!("fileId {id} has an up file but no matching down file"),
		});
	}
	for id in down_ids.difference(&up_ids) {
		errors.push(MigrationFileError {
			kind: MigrationErrorKind::Duplicate,
			file_id: id.to_string(),
			message: format!("fileId {id} has a down file but no matching up file"),
		});
	}
	errors
}

pub fn verify_migration_files(all_files: &[MigrationFile]) -> Vec<MigrationFileError> {
	let ups: Vec<MigrationFile> = all_files.iter().filter(|f| f.kind == Kind::Up).cloned().collect();
	let downs: Vec<MigrationFile> = all_files.iter().filter(|f| f.kind == Kind::Down).cloned().collect();

	let mut errors = verify_sequence(&ups);
	errors.extend(verify_sequence(&downs));
	errors.extend(verify_pairing(&ups, &downs));
	errors
}

/// Duplicates are always fatal (spec.md 4.C.2); raises the first one found
/// as a typed error for callers (e.g. `migrate verify-files` without
/// `--no-raise`) that don't intend to repair in place.
pub fn raise_on_duplicates(errors: &[MigrationFileError]) -> Result<()> {
	if let Some(dup) = errors.iter().find(|e| e.kind == MigrationErrorKind::Duplicate) {
		return Err(PgOpsError::MigrationFile {
			kind: dup.kind,
			file_id: dup.file_id.clone(),
			message: dup.message.clone(),
		});
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::super::file::Header;
	use super::*;
	use std::path::PathBuf;

	fn file(ts: i64, id: &str, kind: Kind, prev_file: Option<&str>) -> MigrationFile {
		MigrationFile {
			ts,
			file_id: id.to_string(),
			kind,
			path: PathBuf::from(format!("{ts}-{id}-{kind}.sql")),
			header: prev_file.map(|p| Header {
				prev_file: Some(p.to_string()),
				author: None,
				version: None,
				skip_verify: None,
			}),
		}
	}

	#[test]
	fn well_formed_chain_has_no_errors() {
		let files = vec![
			file(1, "aaaaaaaa", Kind::Up, None),
			file(1, "aaaaaaaa", Kind::Down, None),
			file(2, "bbbbbbbb", Kind::Up, Some("1-aaaaaaaa-up.sql")),
			file(2, "bbbbbbbb", Kind::Down, Some("1-aaaaaaaa-down.sql")),
		];
		assert!(verify_migration_files(&files).is_empty());
	}

	#[test]
	fn duplicate_file_id_is_reported() {
		let files = vec![
			file(1, "aaaaaaaa", Kind::Up, None),
			file(1, "aaaaaaaa", Kind::Down, None),
			file(2, "aaaaaaaa", Kind::Up, Some("1-aaaaaaaa-up.sql")),
		];
		let errors = verify_migration_files(&files);
		assert!(errors.iter().any(|e| e.kind == MigrationErrorKind::Duplicate));
	}

	#[test]
	fn broken_header_chain_is_reported() {
		let files = vec![
			file(1, "aaaaaaaa", Kind::Up, None),
			file(1, "aaaaaaaa", Kind::Down, None),
			file(2, "bbbbbbbb", Kind::Up, Some("wrong-file.sql")),
			file(2, "bbbbbbbb", Kind::Down, Some("1-aaaaaaaa-down.sql")),
		];
		let errors = verify_migration_files(&files);
		assert!(errors.iter().any(|e| e.kind == MigrationErrorKind::Header && e.file_id == "bbbbbbbb"));
	}

	#[test]
	fn out_of_order_timestamp_is_reported() {
		let files = vec![
			file(2, "aaaaaaaa", Kind::Up, None),
			file(2, "aaaaaaaa", Kind::Down, None),
			file(1, "bbbbbbbb", Kind::Up, Some("2-aaaaaaaa-up.sql")),
			file(1, "bbbbbbbb", Kind::Down, Some("2-aaaaaaaa-down.sql")),
		];
		let errors = verify_migration_files(&files);
		assert!(errors.iter().any(|e| e.kind == MigrationErrorKind::Order));
	}

	#[test]
	fn unpaired_file_id_is_reported() {
		let files = vec![file(1, "aaaaaaaa", Kind::Up, None)];
		let errors = verify_migration_files(&files);
		assert_eq!(errors.len(), 1);
		assert_eq!(errors[0].kind, MigrationErrorKind::Duplicate);
	}
}
