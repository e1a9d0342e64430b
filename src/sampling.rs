//! FK-aware sampling: size resolution, DAG traversal with cycle detection,
//! RI-closed temp-table materialization, and streaming transfer to a
//! target database (spec.md 4.D).
//!
//! Grounded on `padmy/sampling/sampling.py` in full: `process_table`'s
//! leaf/node branch, `create_temp_tables`'s worklist-with-cycle-detection
//! loop, `get_insert_child_fk_data_query`'s per-FK join construction,
//! `sample_database`'s `disable_trigger`/chunked-cursor transfer, and
//! `copy_database`'s pre-copy-schema flow.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::config::Config;
use crate::connection::ConnectionDescriptor;
use crate::error::{PgOpsError, Result};
use crate::process;
use crate::schema::SchemaGraph;

pub const DEFAULT_TRANSFER_CHUNK_SIZE: i64 = 5000;

/// `size(T) = floor(rowCount(T) * percent(T) / 100)` (spec.md 4.D.1).
pub fn resolve_sample_size(row_count: i64, percent: f64) -> i64 {
	((row_count as f64) * percent / 100.0).floor() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedStrategy {
	Roots,
	Leaves,
}

/// Builds the initial worklist of non-ignored tables reachable from roots
/// (default) or leaves (spec.md 4.D.2 step 2).
fn seed_worklist(graph: &SchemaGraph, strategy: SeedStrategy) -> Vec<String> {
	graph
		.tables
		.values()
		.filter(|t| !t.ignored)
		.filter(|t| match strategy {
			SeedStrategy::Roots => graph.is_root(&t.full_name()),
			SeedStrategy::Leaves => graph.is_leaf(&t.full_name()),
		})
		.map(|t| t.full_name())
		.collect()
}

/// Computes the processing order honoring "a parent's temp is never built
/// before all its non-ignored children's temps exist" (spec.md 5), and
/// detects cycles: a pass that makes no progress leaves unprocessed tables
/// on a cycle (spec.md 4.D.2 step 3, seed scenario S6).
pub fn topo_order_for_sampling(graph: &SchemaGraph, strategy: SeedStrategy) -> Result<Vec<String>> {
	let mut worklist: Vec<String> = seed_worklist(graph, strategy);
	let all_non_ignored: HashSet<String> =
		graph.tables.values().filter(|t| !t.ignored).map(|t| t.full_name()).collect();
	let mut processed: HashSet<String> = HashSet::new();
	let mut order: Vec<String> = vec![];

	while !worklist.is_empty() {
		let mut next_worklist = vec![];
		let mut progressed = false;

		for table in &worklist {
			if processed.contains(table) {
				continue;
			}
			let children_done = graph
				.children_safe(table)
				.into_iter()
				.filter(|c| all_non_ignored.contains(c))
				.all(|c| processed.contains(&c));

			if graph.is_leaf(table) || children_done {
				processed.insert(table.clone());
				order.push(table.clone());
				progressed = true;
				for parent in graph.parents_safe(table) {
					if all_non_ignored.contains(&parent) && !processed.contains(&parent) {
						next_worklist.push(parent);
					}
				}
			} else {
				let mut unprocessed_children: Vec<String> = graph
					.children_safe(table)
					.into_iter()
					.filter(|c| all_non_ignored.contains(c) && !processed.contains(c))
					.collect();
				next_worklist.append(&mut unprocessed_children);
				next_worklist.push(table.clone());
			}
		}

		next_worklist.sort();
		next_worklist.dedup();

		if !progressed {
			let remaining: Vec<String> = next_worklist.into_iter().filter(|t| !processed.contains(t)).collect();
			return Err(PgOpsError::Cycle { tables: remaining });
		}
		worklist = next_worklist;
	}

	Ok(order)
}

/// Builds the leaf temp-table DDL: `CREATE TEMP TABLE tmp AS SELECT * FROM
/// src TABLESAMPLE SYSTEM_ROWS(size)`, or an empty `WHERE false` shell when
/// `size = 0` (Open Question #1 in DESIGN.md — some PostgreSQL versions
/// reject `SYSTEM_ROWS(0)`).
pub fn leaf_temp_table_sql(full_name: &str, tmp_name: &str, size: i64) -> String {
	if size <= 0 {
		format!("CREATE TEMP TABLE \"{tmp_name}\" AS SELECT * FROM {full_name} WHERE false")
	} else {
		format!("CREATE TEMP TABLE \"{tmp_name}\" AS SELECT * FROM {full_name} TABLESAMPLE SYSTEM_ROWS({size})")
	}
}

pub fn node_shell_table_sql(full_name: &str, tmp_name: &str) -> String {
	format!("CREATE TEMP TABLE \"{tmp_name}\" (LIKE {full_name} INCLUDING ALL)")
}

/// Builds the child-driven closure insert for a node table (spec.md
/// 4.D.2 step 3, `get_insert_child_fk_data_query`): joins the parent to
/// each child's temp table across its aligned FK columns, inserting any
/// parent row referenced by an already-sampled child.
pub fn child_closure_insert_sql(table_full_name: &str, table_tmp_name: &str, fk_local_columns: &[String], child_tmp_name: &str, fk_referenced_columns: &[String]) -> String {
	let join_conditions: Vec<String> = fk_local_columns
		.iter()
		.zip(fk_referenced_columns.iter())
		.map(|(local, referenced)| format!("t.\"{local}\" = c.\"{referenced}\""))
		.collect();
	format!(
		"INSERT INTO \"{table_tmp_name}\" SELECT t.* FROM {table_full_name} t \
		 INNER JOIN \"{child_tmp_name}\" c ON {} \
		 WHERE NOT EXISTS (SELECT 1 FROM \"{table_tmp_name}\" existing WHERE existing.* = t.*)",
		join_conditions.join(" AND ")
	)
}

/// Top-up query: adds up to `missing` more rows from the source table not
/// already present by primary key (spec.md 4.D.2 step 3).
pub fn top_up_insert_sql(table_full_name: &str, table_tmp_name: &str, primary_key: &[String], missing: i64) -> String {
	let pk_not_in: Vec<String> = primary_key
		.iter()
		.map(|pk| format!("t.\"{pk}\" = existing.\"{pk}\""))
		.collect();
	format!(
		"INSERT INTO \"{table_tmp_name}\" \
		 SELECT t.* FROM {table_full_name} t \
		 WHERE NOT EXISTS (SELECT 1 FROM \"{table_tmp_name}\" existing WHERE {}) \
		 LIMIT {missing}",
		pk_not_in.join(" AND ")
	)
}

pub fn count_tmp_table_sql(tmp_name: &str) -> String {
	format!("SELECT count(*) FROM \"{tmp_name}\"")
}

/// Resolves every table's sample percentage via the config chain, erroring
/// with `MissingSampleSize` if a non-ignored table resolves to `None`
/// (spec.md 4.D.1, 7 "missing sample size after config resolution").
pub fn resolve_all_sample_percents(graph: &SchemaGraph, config: &Config) -> Result<Vec<(String, f64)>> {
	let mut resolved = vec![];
	for table in graph.tables.values() {
		if table.ignored {
			continue;
		}
		let percent = config
			.resolve_sample_percent(&table.schema, &table.name)
			.ok_or_else(|| PgOpsError::MissingSampleSize(table.full_name()))?;
		resolved.push((table.full_name(), percent));
	}
	Ok(resolved)
}

/// Combines resolved percentages with loaded row counts into the per-table
/// target sizes `materialize_temp_tables` consumes.
pub fn resolve_sizes(graph: &SchemaGraph, percents: &[(String, f64)]) -> HashMap<String, i64> {
	percents
		.iter()
		.map(|(full_name, percent)| {
			let row_count = graph.tables.get(full_name).and_then(|t| t.row_count).unwrap_or(0);
			(full_name.clone(), resolve_sample_size(row_count, *percent))
		})
		.collect()
}

/// Executes the full source-side materialization using `process_order`
/// (from `topo_order_for_sampling`) against a single transaction on
/// `client`. Row counts and sample sizes must already be populated on
/// `graph`'s tables.
pub fn materialize_temp_tables(
	client: &mut postgres::Client,
	graph: &SchemaGraph,
	process_order: &[String],
	sizes: &HashMap<String, i64>,
) -> Result<()> {
	let mut transaction = client.transaction()?;
	transaction.batch_execute("CREATE EXTENSION IF NOT EXISTS tsm_system_rows")?;

	for full_name in process_order {
		let table = graph.tables.get(full_name).expect("process_order only contains known tables");
		let tmp_name = table.tmp_name();
		let size = *sizes.get(full_name).unwrap_or(&0);

		if graph.is_leaf(full_name) {
			transaction.batch_execute(&leaf_temp_table_sql(full_name, &tmp_name, size))?;
			continue;
		}

		transaction.batch_execute(&node_shell_table_sql(full_name, &tmp_name))?;
		for child_full_name in graph.children_safe(full_name) {
			let Some(child) = graph.tables.get(&child_full_name) else { continue };
			for fk in &child.foreign_keys {
				if fk.referenced_full_name() != *full_name {
					continue;
				}
				let sql = child_closure_insert_sql(full_name, &tmp_name, &fk.referenced_columns, &child.tmp_name(), &fk.columns);
				transaction.batch_execute(&sql)?;
			}
		}

		let current_count: i64 = transaction.query_one(&count_tmp_table_sql(&tmp_name), &[])?.get(0);
		if current_count < size {
			let missing = size - current_count;
			if !table.primary_key.is_empty() {
				transaction.batch_execute(&top_up_insert_sql(full_name, &tmp_name, &table.primary_key, missing))?;
			}
		}
		// A current_count > size here is the documented tie-break (spec.md
		// 4.D.2): RI closure wins over exactness, so only a warning belongs
		// at the CLI layer, not an error here.
	}

	transaction.commit()?;
	Ok(())
}

/// Streams rows from each source temp table into the matching target
/// table in chunks, optionally disabling triggers for the duration
/// (spec.md 4.D.3).
pub fn transfer_to_target(
	target: &mut postgres::Client,
	source: &mut postgres::Client,
	graph: &SchemaGraph,
	process_order: &[String],
	disable_triggers: bool,
	chunk_size: i64,
) -> Result<()> {
	if disable_triggers {
		target.batch_execute("SET session_replication_role = 'replica'")?;
	}

	for full_name in process_order {
		let table = graph.tables.get(full_name).expect("process_order only contains known tables");
		let tmp_name = table.tmp_name();
		let columns = table.insertable_columns(None);
		if columns.is_empty() {
			continue;
		}

		let mut offset = 0i64;
		loop {
			let select_sql = format!(
				"SELECT {} FROM \"{tmp_name}\" ORDER BY ctid LIMIT {chunk_size} OFFSET {offset}",
				columns.join(", ")
			);
			let rows = source.query(&select_sql, &[])?;
			if rows.is_empty() {
				break;
			}
			let row_count = rows.len();
			insert_rows(target, full_name, &columns, &rows)?;
			offset += chunk_size;
			if (row_count as i64) < chunk_size {
				break;
			}
		}
	}

	if disable_triggers {
		target.batch_execute("SET session_replication_role = 'origin'")?;
	}
	Ok(())
}

/// A column value decoded from the source row into one of a handful of
/// common PostgreSQL types, re-boxed as `ToSql` for the target connection.
/// Dispatches on the source column's reported type name; types outside
/// this set fall back to text, which round-trips correctly for anything
/// with a text-compatible input/output function (the overwhelming
/// majority of scalar column types used in application schemas).
enum CellValue {
	Null,
	Bool(bool),
	I16(i16),
	I32(i32),
	I64(i64),
	F32(f32),
	F64(f64),
	Text(String),
	Bytes(Vec<u8>),
	Timestamp(chrono::NaiveDateTime),
	TimestampTz(chrono::DateTime<chrono::Utc>),
	Json(serde_json::Value),
}

fn read_cell(row: &postgres::Row, index: usize) -> CellValue {
	let type_name = row.columns()[index].type_().name();
	match type_name {
		"bool" => row.get::<_, Option<bool>>(index).map(CellValue::Bool).unwrap_or(CellValue::Null),
		"int2" => row.get::<_, Option<i16>>(index).map(CellValue::I16).unwrap_or(CellValue::Null),
		"int4" => row.get::<_, Option<i32>>(index).map(CellValue::I32).unwrap_or(CellValue::Null),
		"int8" => row.get::<_, Option<i64>>(index).map(CellValue::I64).unwrap_or(CellValue::Null),
		"float4" => row.get::<_, Option<f32>>(index).map(CellValue::F32).unwrap_or(CellValue::Null),
		"float8" => row.get::<_, Option<f64>>(index).map(CellValue::F64).unwrap_or(CellValue::Null),
		"bytea" => row.get::<_, Option<Vec<u8>>>(index).map(CellValue::Bytes).unwrap_or(CellValue::Null),
		"timestamp" => row.get::<_, Option<chrono::NaiveDateTime>>(index).map(CellValue::Timestamp).unwrap_or(CellValue::Null),
		"timestamptz" => row
			.get::<_, Option<chrono::DateTime<chrono::Utc>>>(index)
			.map(CellValue::TimestampTz)
			.unwrap_or(CellValue::Null),
		"json" | "jsonb" => row.get::<_, Option<serde_json::Value>>(index).map(CellValue::Json).unwrap_or(CellValue::Null),
		_ => row.get::<_, Option<String>>(index).map(CellValue::Text).unwrap_or(CellValue::Null),
	}
}

fn insert_rows(target: &mut postgres::Client, full_name: &str, columns: &[String], rows: &[postgres::Row]) -> Result<()> {
	for row in rows {
		let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
		let sql = format!(
			"INSERT INTO {full_name} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
			columns.join(", "),
			placeholders.join(", ")
		);
		let values: Vec<CellValue> = (0..columns.len()).map(|i| read_cell(row, i)).collect();
		let params: Vec<&(dyn postgres::types::ToSql + Sync)> = values
			.iter()
			.map(|v| match v {
				CellValue::Null => &None::<i32> as &(dyn postgres::types::ToSql + Sync),
				CellValue::Bool(b) => b as &(dyn postgres::types::ToSql + Sync),
				CellValue::I16(n) => n as &(dyn postgres::types::ToSql + Sync),
				CellValue::I32(n) => n as &(dyn postgres::types::ToSql + Sync),
				CellValue::I64(n) => n as &(dyn postgres::types::ToSql + Sync),
				CellValue::F32(n) => n as &(dyn postgres::types::ToSql + Sync),
				CellValue::F64(n) => n as &(dyn postgres::types::ToSql + Sync),
				CellValue::Text(s) => s as &(dyn postgres::types::ToSql + Sync),
				CellValue::Bytes(b) => b as &(dyn postgres::types::ToSql + Sync),
				CellValue::Timestamp(t) => t as &(dyn postgres::types::ToSql + Sync),
				CellValue::TimestampTz(t) => t as &(dyn postgres::types::ToSql + Sync),
				CellValue::Json(j) => j as &(dyn postgres::types::ToSql + Sync),
			})
			.collect();
		target.execute(&sql, &params)?;
	}
	Ok(())
}

/// `copySchema` (spec.md 4.D.4): dumps `from`'s schema with
/// `pg_dump -Fc --schema-only --no-owner --no-privileges --extension=*`,
/// recreates `to`, optionally drops its public schema, and restores.
pub fn copy_schema(
	from_descriptor: &ConnectionDescriptor,
	from_database: &str,
	to_descriptor: &ConnectionDescriptor,
	to_database: &str,
	schemas: &[String],
	drop_public: bool,
) -> Result<()> {
	let dump_path = std::env::temp_dir().join(format!("pg_devops_schema_{}.dump", to_database));
	process::pg_dump(
		from_descriptor,
		from_database,
		&["-Fc", "--schema-only", "--no-owner", "--no-privileges", "--extension=*"],
		&dump_path,
	)?;

	process::drop_db(to_descriptor, to_database, true)?;
	process::create_db(to_descriptor, to_database)?;

	if drop_public || schemas.iter().any(|s| s == "public") {
		process::psql_statement(to_descriptor, to_database, "DROP SCHEMA public")?;
	}

	process::pg_restore(to_descriptor, to_database, &["--no-owner", "--no-privileges"], &dump_path)?;
	std::fs::remove_file(&dump_path).ok();
	Ok(())
}

pub fn temp_dump_dir() -> &'static Path {
	Path::new("/tmp")
}
