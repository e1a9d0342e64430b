//! Ledger schema, queries, and up/down application (spec.md 4.C.4, 6).
//!
//! Grounded on `padmy/migration/migration.py` (`migrate_up`, `migrate_down`,
//! `verify_migrations`, the ledger SQL) and `postgres_migrator`'s
//! `command_migrate` transaction-per-batch pattern.

use std::path::Path;

use serde_json::Value as Json;

use crate::error::{PgOpsError, Result};

use super::file::{Kind, MigrationFile};

#[derive(Debug, Clone)]
pub struct LedgerRow {
	pub id: i32,
	pub applied_at: chrono::DateTime<chrono::Utc>,
	pub file_ts: i64,
	pub file_id: String,
	pub kind: Kind,
	pub file_name: String,
	pub meta: Option<Json>,
}

const CREATE_LEDGER_SQL: &str = "\
CREATE TABLE public.migration (\
    id serial PRIMARY KEY, \
    applied_at timestamptz NOT NULL DEFAULT now(), \
    file_ts bigint NOT NULL, \
    file_id text NOT NULL, \
    migration_type text NOT NULL CHECK (migration_type IN ('up', 'down')), \
    file_name text NOT NULL, \
    meta jsonb\
)";

pub fn migrate_setup(client: &mut postgres::Client) -> Result<()> {
	client.batch_execute(CREATE_LEDGER_SQL)?;
	Ok(())
}

fn ledger_table_exists(client: &mut postgres::Client) -> Result<bool> {
	let row = client.query_one(
		"SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'migration')",
		&[],
	)?;
	Ok(row.get(0))
}

fn require_ledger(client: &mut postgres::Client) -> Result<()> {
	if !ledger_table_exists(client)? {
		return Err(PgOpsError::NoSetupTable);
	}
	Ok(())
}

fn kind_str(kind: Kind) -> &'static str {
	kind.as_str()
}

pub fn list_ledger_rows(client: &mut postgres::Client) -> Result<Vec<LedgerRow>> {
	require_ledger(client)?;
	let rows = client.query(
		"SELECT id, applied_at, file_ts, file_id, migration_type, file_name, meta \
		 FROM public.migration ORDER BY applied_at, id",
		&[],
	)?;
	Ok(rows
		.into_iter()
		.map(|row| LedgerRow {
			id: row.get(0),
			applied_at: row.get(1),
			file_ts: row.get(2),
			file_id: row.get(3),
			kind: if row.get::<_, String>(4) == "up" { Kind::Up } else { Kind::Down },
			file_name: row.get(5),
			meta: row.get(6),
		})
		.collect())
}

fn insert_ledger_row(
	transaction: &mut postgres::Transaction,
	file: &MigrationFile,
	meta: Option<&Json>,
) -> Result<()> {
	transaction.execute(
		"INSERT INTO public.migration (file_ts, file_id, migration_type, file_name, meta) VALUES ($1, $2, $3, $4, $5)",
		&[&file.ts, &file.file_id, &kind_str(file.kind), &file.filename(), &meta],
	)?;
	Ok(())
}

/// The most recent applied "up" ledger row whose fileId has no matching
/// "down" row (spec.md 4.C.4 `latestApplied`).
fn latest_applied(rows: &[LedgerRow]) -> Option<&LedgerRow> {
	let down_ids: std::collections::HashSet<&str> =
		rows.iter().filter(|r| r.kind == Kind::Down).map(|r| r.file_id.as_str()).collect();
	rows.iter()
		.filter(|r| r.kind == Kind::Up && !down_ids.contains(r.file_id.as_str()))
		.max_by_key(|r| r.applied_at)
}

/// Pure selection logic for `migrateUp` (spec.md 4.C.4), separated from the
/// database-executing half for direct testability.
pub fn pending_up_files(ups: &[MigrationFile], ledger: &[LedgerRow]) -> Vec<MigrationFile> {
	let latest = latest_applied(ledger);
	let mut pending: Vec<MigrationFile> = ups
		.iter()
		.filter(|up| match latest {
			None => true,
			Some(latest) => up.ts >= latest.file_ts && up.filename() != latest.file_name,
		})
		.cloned()
		.collect();
	pending.sort_by(|a, b| (a.ts, &a.file_id).cmp(&(b.ts, &b.file_id)));
	pending
}

pub fn migrate_up(
	client: &mut postgres::Client,
	folder: &Path,
	n: Option<usize>,
	meta: Option<Json>,
	use_transaction: bool,
) -> Result<Vec<MigrationFile>> {
	require_ledger(client)?;
	let ups = MigrationFile::read_by_kind(folder, Kind::Up)?;
	let ledger = list_ledger_rows(client)?;
	let mut pending = pending_up_files(&ups, &ledger);
	if let Some(n) = n {
		pending.truncate(n);
	}
	apply_batch(client, &pending, meta.as_ref(), use_transaction)?;
	Ok(pending)
}

/// Pure selection logic for `migrateDown` (spec.md 4.C.4). `n` and
/// `until_file_id` are mutually exclusive; the caller validates that.
pub fn rollback_files(downs: &[MigrationFile], ledger: &[LedgerRow], n: Option<usize>, until_file_id: Option<&str>) -> Result<Vec<MigrationFile>> {
	let down_ids: std::collections::HashSet<&str> =
		ledger.iter().filter(|r| r.kind == Kind::Down).map(|r| r.file_id.as_str()).collect();
	let mut applied_ups: Vec<&LedgerRow> = ledger
		.iter()
		.filter(|r| r.kind == Kind::Up && !down_ids.contains(r.file_id.as_str()))
		.collect();
	applied_ups.sort_by_key(|r| std::cmp::Reverse(r.applied_at));

	let mut rollbacks = vec![];
	for up in &applied_ups {
		if let Some(down) = downs.iter().find(|d| d.file_id == up.file_id) {
			rollbacks.push(down.clone());
		}
	}

	if let Some(n) = n {
		rollbacks.truncate(n);
	} else if let Some(until) = until_file_id {
		let position = rollbacks.iter().position(|f| f.file_id == until).ok_or_else(|| {
			PgOpsError::Configuration(format!("fileId {until} is not among applied migrations"))
		})?;
		rollbacks.truncate(position + 1);
	}
	Ok(rollbacks)
}

pub fn migrate_down(
	client: &mut postgres::Client,
	folder: &Path,
	n: Option<usize>,
	until_file_id: Option<&str>,
	meta: Option<Json>,
) -> Result<Vec<MigrationFile>> {
	if n.is_some() && until_file_id.is_some() {
		return Err(PgOpsError::Configuration("nbMigrations and migrationId are mutually exclusive".to_string()));
	}
	require_ledger(client)?;
	let downs = MigrationFile::read_by_kind(folder, Kind::Down)?;
	let ledger = list_ledger_rows(client)?;
	let rollbacks = rollback_files(&downs, &ledger, n, until_file_id)?;
	apply_batch(client, &rollbacks, meta.as_ref(), true)?;
	Ok(rollbacks)
}

/// Applies every up file whose fileId is absent from the ledger, tagging
/// inserted rows `meta={"missing":true}` (spec.md 4.C.4 `verifyMigrations`).
pub fn verify_migrations(client: &mut postgres::Client, folder: &Path) -> Result<Vec<MigrationFile>> {
	require_ledger(client)?;
	let ups = MigrationFile::read_by_kind(folder, Kind::Up)?;
	let ledger = list_ledger_rows(client)?;
	let known: std::collections::HashSet<&str> = ledger.iter().map(|r| r.file_id.as_str()).collect();
	let missing: Vec<MigrationFile> = ups.into_iter().filter(|f| !known.contains(f.file_id.as_str())).collect();
	let meta = serde_json::json!({"missing": true});
	apply_batch(client, &missing, Some(&meta), true)?;
	Ok(missing)
}

fn apply_batch(client: &mut postgres::Client, files: &[MigrationFile], meta: Option<&Json>, use_transaction: bool) -> Result<()> {
	if files.is_empty() {
		return Ok(());
	}
	if use_transaction {
		let mut transaction = client.transaction()?;
		for file in files {
			apply_one(&mut transaction, file, meta)?;
		}
		transaction.commit()?;
	} else {
		for file in files {
			let mut transaction = client.transaction()?;
			apply_one(&mut transaction, file, meta)?;
			transaction.commit()?;
		}
	}
	Ok(())
}

fn apply_one(transaction: &mut postgres::Transaction, file: &MigrationFile, meta: Option<&Json>) -> Result<()> {
	let body = file.sql_body()?;
	transaction.batch_execute(&body)?;
	insert_ledger_row(transaction, file, meta)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use std::fs;
	use std::path::PathBuf;

	fn up(ts: i64, id: &str) -> MigrationFile {
		MigrationFile { ts, file_id: id.to_string(), kind: Kind::Up, path: PathBuf::from(format!("{ts}-{id}-up.sql")), header: None }
	}

	fn ledger_row(id: &str, kind: Kind, ts: i64) -> LedgerRow {
		LedgerRow { id: 0, applied_at: Utc::now(), file_ts: ts, file_id: id.to_string(), kind, file_name: format!("{ts}-{id}-{kind}.sql"), meta: None }
	}

	#[test]
	fn pending_up_files_with_empty_ledger_returns_all() {
		let ups = vec![up(1, "aaaaaaaa"), up(2, "bbbbbbbb")];
		let pending = pending_up_files(&ups, &[]);
		assert_eq!(pending.len(), 2);
	}

	#[test]
	fn pending_up_files_excludes_already_applied_with_matching_down() {
		let ups = vec![up(1, "aaaaaaaa"), up(2, "bbbbbbbb")];
		let ledger = vec![ledger_row("aaaaaaaa", Kind::Up, 1), ledger_row("aaaaaaaa", Kind::Down, 1)];
		let pending = pending_up_files(&ups, &ledger);
		assert_eq!(pending.len(), 2);
	}

	#[test]
	fn pending_up_files_excludes_latest_applied_without_down() {
		let ups = vec![up(1, "aaaaaaaa"), up(2, "bbbbbbbb")];
		let ledger = vec![ledger_row("aaaaaaaa", Kind::Up, 1)];
		let pending = pending_up_files(&ups, &ledger);
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].file_id, "bbbbbbbb");
	}

	#[test]
	fn rollback_files_until_id_is_inclusive() {
		let downs = vec![
			MigrationFile { ts: 1, file_id: "aaaaaaaa".to_string(), kind: Kind::Down, path: PathBuf::new(), header: None },
			MigrationFile { ts: 2, file_id: "bbbbbbbb".to_string(), kind: Kind::Down, path: PathBuf::new(), header: None },
		];
		let ledger = vec![ledger_row("aaaaaaaa", Kind::Up, 1), ledger_row("bbbbbbbb", Kind::Up, 2)];
		let rollbacks = rollback_files(&downs, &ledger, None, Some("aaaaaaaa")).unwrap();
		assert_eq!(rollbacks.len(), 2);
		assert_eq!(rollbacks[0].file_id, "bbbbbbbb");
		assert_eq!(rollbacks[1].file_id, "aaaaaaaa");
	}

	#[test]
	fn rollback_files_n_and_until_conflict_detected_by_caller() {
		let downs: Vec<MigrationFile> = vec![];
		let ledger: Vec<LedgerRow> = vec![];
		assert!(rollback_files(&downs, &ledger, Some(1), Some("x")).is_ok());
	}

	/// Live-DB: a full `setup` -> `up` -> `down` cycle against a real
	/// ledger table (spec.md 8 seed scenario S1).
	#[test]
	#[ignore]
	#[serial_test::serial]
	fn migrate_up_then_down_round_trips_the_ledger() {
		use super::create::{create_migration, NewMigrationOptions};
		use super::file::{generate_file_id, Kind};

		let url = std::env::var("PG_URL_TEST").expect("PG_URL_TEST must be set for live tests");
		let descriptor = crate::connection::ConnectionDescriptor::from_uri(&url).unwrap();
		let mut client = descriptor.connect().unwrap();
		client.batch_execute("DROP TABLE IF EXISTS public.migration; DROP TABLE IF EXISTS widgets;").unwrap();

		let dir = std::env::temp_dir().join(format!("pg_devops_test_ledger_{}", generate_file_id()));
		fs::create_dir_all(&dir).unwrap();

		let options = NewMigrationOptions { version: None, author: None, skip_verify: false };
		let (up, _down) = create_migration(&dir, 1, "aaaaaaaa", &options).unwrap();
		fs::write(&up.path, "-- Prev-file: \n-- Author: \n-- Version: \nCREATE TABLE widgets (id serial PRIMARY KEY);\n").unwrap();
		let downs = MigrationFile::read_by_kind(&dir, Kind::Down).unwrap();
		fs::write(&downs[0].path, "-- Prev-file: \n-- Author: \n-- Version: \n-- Skip-verify: \nDROP TABLE widgets;\n").unwrap();

		migrate_setup(&mut client).unwrap();
		let applied = migrate_up(&mut client, &dir, None, None, true).unwrap();
		assert_eq!(applied.len(), 1);
		let exists: bool = client
			.query_one("SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'widgets')", &[])
			.unwrap()
			.get(0);
		assert!(exists);

		let rolled_back = migrate_down(&mut client, &dir, None, None, None).unwrap();
		assert_eq!(rolled_back.len(), 1);
		let exists: bool = client
			.query_one("SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'widgets')", &[])
			.unwrap()
			.get(0);
		assert!(!exists);

		client.batch_execute("DROP TABLE public.migration").unwrap();
		fs::remove_dir_all(&dir).ok();
	}
}
