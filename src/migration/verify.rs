//! Round-trip verification: `pg_dump -> apply up -> apply down -> pg_dump`,
//! byte-compared after sanitization (spec.md 4.C.5, 8 invariant 3).
//!
//! Grounded on `padmy/migration/migration.py`'s `migrate_verify`.

use std::fs;
use std::path::Path;

use crate::connection::ConnectionDescriptor;
use crate::error::{PgOpsError, Result};
use crate::process;

use super::file::{Kind, MigrationFile};

pub struct VerifyOptions {
	pub only_last: bool,
	pub skip_down_restore: bool,
}

/// Pairs up (fileId-matched) up/down files in ascending `(ts, fileId)`
/// order (spec.md 4.C.5).
pub fn pair_migrations(folder: &Path) -> Result<Vec<(MigrationFile, MigrationFile)>> {
	let ups = MigrationFile::read_by_kind(folder, Kind::Up)?;
	let downs = MigrationFile::read_by_kind(folder, Kind::Down)?;
	let mut pairs = vec![];
	for up in ups {
		if let Some(down) = downs.iter().find(|d| d.file_id == up.file_id) {
			pairs.push((up, down.clone()));
		}
	}
	pairs.sort_by(|a, b| (a.0.ts, &a.0.file_id).cmp(&(b.0.ts, &b.0.file_id)));
	Ok(pairs)
}

pub fn migrate_verify(
	client: &mut postgres::Client,
	descriptor: &ConnectionDescriptor,
	database: &str,
	migration_folder: &Path,
	dump_dir: &Path,
	options: &VerifyOptions,
) -> Result<()> {
	let mut pairs = pair_migrations(migration_folder)?;
	if options.only_last && pairs.len() > 1 {
		pairs = vec![pairs.pop().unwrap()];
	}

	fs::create_dir_all(dump_dir)?;

	for (up, down) in &pairs {
		let skip = down.header.as_ref().map(|h| h.skip_verify_set()).unwrap_or(false);

		let body_up = up.sql_body()?;
		let body_down = down.sql_body()?;

		if skip {
			client.batch_execute(&body_up)?;
			client.batch_execute(&body_down)?;
			client.batch_execute(&body_up)?;
			continue;
		}

		let before_path = dump_dir.join(format!("{}-before.sql", up.file_id));
		let after_path = dump_dir.join(format!("{}-after.sql", up.file_id));

		process::pg_dump(descriptor, database, &["--schema-only"], &before_path)?;
		client.batch_execute(&body_up)?;
		client.batch_execute(&body_down)?;
		process::pg_dump(descriptor, database, &["--schema-only"], &after_path)?;

		let before_text = process::sanitize_dump(&fs::read_to_string(&before_path)?);
		let after_text = process::sanitize_dump(&fs::read_to_string(&after_path)?);
		if before_text != after_text {
			let diff = unified_diff(&before_text, &after_text);
			return Err(PgOpsError::Migration { migration_id: up.file_id.clone(), diff });
		}

		client.batch_execute(&body_up)?;
	}

	if !options.skip_down_restore {
		for (_, down) in pairs.iter().rev() {
			let body_down = down.sql_body()?;
			client.batch_execute(&body_down)?;
		}
	}

	Ok(())
}

/// Minimal line-based unified diff (no diff crate in `postgres_migrator`'s
/// dependency set; see DESIGN.md).
pub fn unified_diff(before: &str, after: &str) -> String {
	let before_lines: Vec<&str> = before.lines().collect();
	let after_lines: Vec<&str> = after.lines().collect();

	let lcs = longest_common_subsequence(&before_lines, &after_lines);

	let mut output = String::new();
	output.push_str("--- before\n+++ after\n");
	let mut bi = 0;
	let mut ai = 0;
	for &(li, ri) in &lcs {
		while bi < li {
			output.push_str(&format!("-{}\n", before_lines[bi]));
			bi += 1;
		}
		while ai < ri {
			output.push_str(&format!("+{}\n", after_lines[ai]));
			ai += 1;
		}
		output.push_str(&format!(" {}\n", before_lines[li]));
		bi = li + 1;
		ai = ri + 1;
	}
	while bi < before_lines.len() {
		output.push_str(&format!("-{}\n", before_lines[bi]));
		bi += 1;
	}
	while ai < after_lines.len() {
		output.push_str(&format!("+{}\n", after_lines[ai]));
		ai += 1;
	}
	output
}

/// Returns matched index pairs `(before_index, after_index)` for the
/// longest common subsequence of lines, via the standard O(n*m) DP table.
fn longest_common_subsequence(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
	let n = a.len();
	let m = b.len();
	let mut table = vec![vec![0u32; m + 1]; n + 1];
	for i in (0..n).rev() {
		for j in (0..m).rev() {
			table[i][j] = if a[i] == b[j] {
				table[i + 1][j + 1] + 1
			} else {
				table[i + 1][j].max(table[i][j + 1])
			};
		}
	}
	let mut pairs = vec![];
	let (mut i, mut j) = (0, 0);
	while i < n && j < m {
		if a[i] == b[j] {
			pairs.push((i, j));
			i += 1;
			j += 1;
		} else if table[i + 1][j] >= table[i][j + 1] {
			i += 1;
		} else {
			j += 1;
		}
	}
	pairs
}
