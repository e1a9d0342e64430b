//! Schema introspection: tables, columns, primary/foreign keys, and the
//! parent/child graph they form (spec.md 4.B, 3).
//!
//! Grounded on `padmy/db.py`: same queries (including the composite-FK
//! `UNNEST(... WITH ORDINALITY)` join), translated to the `postgres` sync
//! driver's typed row access.

use std::collections::{HashMap, HashSet};
use std::thread;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
	pub name: String,
	pub is_generated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fk {
	pub name: String,
	pub columns: Vec<String>,
	pub referenced_schema: String,
	pub referenced_table: String,
	pub referenced_columns: Vec<String>,
}

impl Fk {
	pub fn referenced_full_name(&self) -> String {
		format!("{}.{}", self.referenced_schema, self.referenced_table)
	}
}

#[derive(Debug, Clone)]
pub struct Table {
	pub schema: String,
	pub name: String,
	pub columns: Vec<Column>,
	pub primary_key: Vec<String>,
	pub foreign_keys: Vec<Fk>,
	pub row_count: Option<i64>,
	pub sample_size_percent: Option<f64>,
	pub ignored: bool,
}

impl Table {
	pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Table {
		Table {
			schema: schema.into(),
			name: name.into(),
			columns: vec![],
			primary_key: vec![],
			foreign_keys: vec![],
			row_count: None,
			sample_size_percent: None,
			ignored: false,
		}
	}

	pub fn full_name(&self) -> String {
		format!("{}.{}", self.schema, self.name)
	}

	pub fn tmp_name(&self) -> String {
		format!("_{}_{}_tmp", self.schema, self.name)
	}

	/// Non-generated column names, quoted, comma-joined, optionally
	/// qualified by an alias — mirrors `Table.get_values` in `padmy/db.py`.
	pub fn insertable_columns(&self, alias: Option<&str>) -> Vec<String> {
		let mut names: Vec<&str> = self
			.columns
			.iter()
			.filter(|c| !c.is_generated)
			.map(|c| c.name.as_str())
			.collect();
		names.sort_unstable();
		names
			.into_iter()
			.map(|name| match alias {
				Some(a) => format!("{a}.\"{name}\""),
				None => format!("\"{name}\""),
			})
			.collect()
	}

	pub fn values_clause(&self, alias: Option<&str>) -> String {
		self.insertable_columns(alias).join(", ")
	}
}

/// A directed graph over tables with edge `parent -> child` when `child`
/// holds a foreign key into `parent` (spec.md 3 `SchemaGraph`).
#[derive(Debug, Default)]
pub struct SchemaGraph {
	pub tables: HashMap<String, Table>,
	parents: HashMap<String, HashSet<String>>,
	children: HashMap<String, HashSet<String>>,
}

impl SchemaGraph {
	pub fn new() -> SchemaGraph {
		SchemaGraph::default()
	}

	pub fn insert_table(&mut self, table: Table) {
		let name = table.full_name();
		self.parents.entry(name.clone()).or_default();
		self.children.entry(name.clone()).or_default();
		self.tables.insert(name, table);
	}

	/// Registers a foreign key on `referencing` pointing at `referenced`,
	/// wiring up both the table's own `foreign_keys` list and the graph's
	/// parent/child adjacency (spec.md 4.B "Graph assembly").
	pub fn add_foreign_key(&mut self, referencing: &str, fk: Fk) {
		let referenced = fk.referenced_full_name();
		if let Some(table) = self.tables.get_mut(referencing) {
			table.foreign_keys.push(fk);
		}
		self.parents.entry(referencing.to_string()).or_default().insert(referenced.clone());
		self.children.entry(referenced).or_default().insert(referencing.to_string());
	}

	/// Parents ignoring self-references and `ignored` tables (spec.md 9
	/// `parents_safe`).
	pub fn parents_safe(&self, full_name: &str) -> Vec<String> {
		self.parents
			.get(full_name)
			.into_iter()
			.flatten()
			.filter(|p| *p != full_name)
			.filter(|p| !self.tables.get(*p).map(|t| t.ignored).unwrap_or(false))
			.cloned()
			.collect()
	}

	/// Children ignoring self-references and `ignored` tables (spec.md 9
	/// `children_safe`).
	pub fn children_safe(&self, full_name: &str) -> Vec<String> {
		self.children
			.get(full_name)
			.into_iter()
			.flatten()
			.filter(|c| *c != full_name)
			.filter(|c| !self.tables.get(*c).map(|t| t.ignored).unwrap_or(false))
			.cloned()
			.collect()
	}

	pub fn is_root(&self, full_name: &str) -> bool {
		self.parents_safe(full_name).is_empty()
	}

	pub fn is_leaf(&self, full_name: &str) -> bool {
		self.children_safe(full_name).is_empty()
	}
}

pub fn list_tables(client: &mut postgres::Client, schemas: &[String]) -> Result<Vec<Table>> {
	let rows = client.query(
		"SELECT table_schema, table_name FROM information_schema.tables \
		 WHERE table_schema = ANY($1::text[]) AND table_type = 'BASE TABLE' \
		 ORDER BY table_schema, table_name",
		&[&schemas],
	)?;
	Ok(rows
		.into_iter()
		.map(|row| Table::new(row.get::<_, String>(0), row.get::<_, String>(1)))
		.collect())
}

pub fn list_columns(client: &mut postgres::Client, full_names: &[String]) -> Result<HashMap<String, Vec<Column>>> {
	let rows = client.query(
		"SELECT table_schema || '.' || table_name AS full_name, column_name, \
		 COALESCE(generation_expression IS NOT NULL OR identity_generation = 'ALWAYS', false) AS is_generated \
		 FROM information_schema.columns \
		 WHERE table_schema || '.' || table_name = ANY($1::text[])",
		&[&full_names],
	)?;
	let mut columns: HashMap<String, Vec<Column>> = HashMap::new();
	for row in rows {
		let full_name: String = row.get(0);
		let name: String = row.get(1);
		let is_generated: bool = row.get(2);
		columns.entry(full_name).or_default().push(Column { name, is_generated });
	}
	Ok(columns)
}

const FK_QUERY: &str = "
SELECT c.conname                                         AS constraint_name,
       sch.nspname                                       AS schema_name,
       tbl.relname                                       AS table_name,
       ARRAY_AGG(col.attname ORDER BY u.attposition)     AS column_names,
       f_sch.nspname                                     AS foreign_schema_name,
       f_tbl.relname                                     AS foreign_table_name,
       ARRAY_AGG(f_col.attname ORDER BY f_u.attposition) AS foreign_column_names
FROM pg_constraint c
         LEFT JOIN LATERAL UNNEST(c.conkey) WITH ORDINALITY AS u(attnum, attposition) ON TRUE
         LEFT JOIN LATERAL UNNEST(c.confkey) WITH ORDINALITY AS f_u(attnum, attposition)
                   ON f_u.attposition = u.attposition
         JOIN pg_class tbl ON tbl.oid = c.conrelid
         JOIN pg_namespace sch ON sch.oid = tbl.relnamespace
         LEFT JOIN pg_attribute col ON (col.attrelid = tbl.oid AND col.attnum = u.attnum)
         LEFT JOIN pg_class f_tbl ON f_tbl.oid = c.confrelid
         LEFT JOIN pg_namespace f_sch ON f_sch.oid = f_tbl.relnamespace
         LEFT JOIN pg_attribute f_col ON (f_col.attrelid = f_tbl.oid AND f_col.attnum = f_u.attnum)
WHERE c.contype = 'f'
    AND sch.nspname = ANY($1::text[])
    AND f_sch.nspname = ANY($1::text[])
GROUP BY constraint_name, schema_name, table_name, f_sch.nspname, f_tbl.relname
ORDER BY schema_name, table_name, constraint_name";

pub fn list_foreign_keys(client: &mut postgres::Client, schemas: &[String]) -> Result<Vec<(String, Fk)>> {
	let rows = client.query(FK_QUERY, &[&schemas])?;
	Ok(rows
		.into_iter()
		.map(|row| {
			let schema: String = row.get("schema_name");
			let table: String = row.get("table_name");
			let fk = Fk {
				name: row.get("constraint_name"),
				columns: row.get("column_names"),
				referenced_schema: row.get("foreign_schema_name"),
				referenced_table: row.get("foreign_table_name"),
				referenced_columns: row.get("foreign_column_names"),
			};
			(format!("{schema}.{table}"), fk)
		})
		.collect())
}

pub fn list_primary_keys(client: &mut postgres::Client, schemas: &[String]) -> Result<HashMap<String, Vec<String>>> {
	let rows = client.query(
		"SELECT tc.table_schema, tc.table_name, c.column_name \
		 FROM information_schema.table_constraints tc \
		 JOIN information_schema.constraint_column_usage ccu USING (constraint_schema, constraint_name) \
		 JOIN information_schema.columns c ON c.table_schema = tc.constraint_schema \
		   AND tc.table_name = c.table_name AND ccu.column_name = c.column_name \
		 WHERE constraint_type = 'PRIMARY KEY' AND tc.table_schema = ANY($1::text[])",
		&[&schemas],
	)?;
	let mut pks: HashMap<String, Vec<String>> = HashMap::new();
	for row in rows {
		let schema: String = row.get(0);
		let table: String = row.get(1);
		let column: String = row.get(2);
		pks.entry(format!("{schema}.{table}")).or_default().push(column);
	}
	Ok(pks)
}

pub fn list_column_types(
	client: &mut postgres::Client,
	schema: &str,
	table: &str,
	columns: &[String],
) -> Result<HashMap<String, String>> {
	let rows = client.query(
		"SELECT column_name, data_type FROM information_schema.columns \
		 WHERE table_schema = $1 AND table_name = $2 AND column_name = ANY($3::text[])",
		&[&schema, &table, &columns],
	)?;
	Ok(rows.into_iter().map(|row| (row.get(0), row.get(1))).collect())
}

/// Loads tables, columns, primary keys and foreign keys for `schemas` into
/// a `SchemaGraph`, then (optionally) loads per-table row counts
/// concurrently, one thread per pooled connection (spec.md 4.B, 5).
pub fn load_schema_graph(
	client: &mut postgres::Client,
	schemas: &[String],
	connect_for_counts: Option<&(dyn Fn() -> Result<postgres::Client> + Sync)>,
) -> Result<SchemaGraph> {
	let tables = list_tables(client, schemas)?;
	let full_names: Vec<String> = tables.iter().map(|t| t.full_name()).collect();
	let mut columns = list_columns(client, &full_names)?;
	let mut pks = list_primary_keys(client, schemas)?;
	let fks = list_foreign_keys(client, schemas)?;

	let mut graph = SchemaGraph::new();
	for mut table in tables {
		let full_name = table.full_name();
		table.columns = columns.remove(&full_name).unwrap_or_default();
		table.primary_key = pks.remove(&full_name).unwrap_or_default();
		graph.insert_table(table);
	}
	for (referencing, fk) in fks {
		graph.add_foreign_key(&referencing, fk);
	}

	if let Some(connect) = connect_for_counts {
		load_row_counts(&mut graph, connect)?;
	}

	Ok(graph)
}

fn load_row_counts(
	graph: &mut SchemaGraph,
	connect: &(dyn Fn() -> Result<postgres::Client> + Sync),
) -> Result<()> {
	let names: Vec<String> = graph.tables.keys().cloned().collect();
	let counts: Vec<Result<(String, i64)>> = thread::scope(|scope| {
		let handles: Vec<_> = names
			.into_iter()
			.map(|full_name| {
				scope.spawn(move || -> Result<(String, i64)> {
					let mut conn = connect()?;
					let count: i64 = conn.query_one(&format!("SELECT count(*) FROM {full_name}"), &[])?.get(0);
					Ok((full_name, count))
				})
			})
			.collect();
		handles.into_iter().map(|h| h.join().expect("count thread panicked")).collect()
	});
	for result in counts {
		let (full_name, count) = result?;
		if let Some(table) = graph.tables.get_mut(&full_name) {
			table.row_count = Some(count);
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn make_graph() -> SchemaGraph {
		let mut graph = SchemaGraph::new();
		graph.insert_table(Table::new("public", "a"));
		graph.insert_table(Table::new("public", "b"));
		graph.insert_table(Table::new("public", "c"));
		graph.add_foreign_key(
			"public.b",
			Fk {
				name: "b_a_fk".to_string(),
				columns: vec!["a_id".to_string()],
				referenced_schema: "public".to_string(),
				referenced_table: "a".to_string(),
				referenced_columns: vec!["id".to_string()],
			},
		);
		graph
	}

	#[test]
	fn parent_child_symmetry_holds() {
		let graph = make_graph();
		assert!(graph.children_safe("public.a").contains(&"public.b".to_string()));
		assert!(graph.parents_safe("public.b").contains(&"public.a".to_string()));
	}

	#[test]
	fn root_and_leaf_detection() {
		let graph = make_graph();
		assert!(graph.is_root("public.a"));
		assert!(!graph.is_leaf("public.a"));
		assert!(graph.is_leaf("public.b"));
		assert!(graph.is_root("public.c"));
		assert!(graph.is_leaf("public.c"));
	}

	#[test]
	fn self_reference_excluded_from_safe_sets() {
		let mut graph = SchemaGraph::new();
		graph.insert_table(Table::new("public", "tree"));
		graph.add_foreign_key(
			"public.tree",
			Fk {
				name: "tree_parent_fk".to_string(),
				columns: vec!["parent_id".to_string()],
				referenced_schema: "public".to_string(),
				referenced_table: "tree".to_string(),
				referenced_columns: vec!["id".to_string()],
			},
		);
		assert!(graph.is_root("public.tree"));
		assert!(graph.is_leaf("public.tree"));
	}

	#[test]
	fn ignored_tables_excluded_from_safe_sets() {
		let mut graph = make_graph();
		graph.tables.get_mut("public.b").unwrap().ignored = true;
		assert!(graph.children_safe("public.a").is_empty());
	}

	/// Live-DB: loads a small real FK graph and checks root/leaf/row-count
	/// wiring end to end (spec.md 8 seed scenario S5 setup).
	#[test]
	#[ignore]
	#[serial_test::serial]
	fn loads_live_schema_graph_with_row_counts() {
		let url = std::env::var("PG_URL_TEST").expect("PG_URL_TEST must be set for live tests");
		let descriptor = crate::connection::ConnectionDescriptor::from_uri(&url).unwrap();
		let mut client = descriptor.connect().unwrap();

		client
			.batch_execute(
				"DROP TABLE IF EXISTS child, parent CASCADE; \
				 CREATE TABLE parent (id serial PRIMARY KEY); \
				 CREATE TABLE child (id serial PRIMARY KEY, parent_id int REFERENCES parent(id)); \
				 INSERT INTO parent DEFAULT VALUES; \
				 INSERT INTO child (parent_id) SELECT id FROM parent;",
			)
			.unwrap();

		let schemas = vec!["public".to_string()];
		let connect = || descriptor.connect();
		let graph = load_schema_graph(&mut client, &schemas, Some(&connect)).unwrap();

		assert!(graph.is_root("public.parent"));
		assert!(graph.is_leaf("public.child"));
		assert_eq!(graph.tables["public.parent"].row_count, Some(1));
		assert_eq!(graph.tables["public.child"].row_count, Some(1));

		client.batch_execute("DROP TABLE child, parent").unwrap();
	}

	#[test]
	fn insertable_columns_excludes_generated_and_sorts() {
		let mut table = Table::new("public", "t");
		table.columns = vec![
			Column { name: "z".to_string(), is_generated: false },
			Column { name: "gen".to_string(), is_generated: true },
			Column { name: "a".to_string(), is_generated: false },
		];
		assert_eq!(table.values_clause(None), "\"a\", \"z\"");
		assert_eq!(table.values_clause(Some("t")), "t.\"a\", t.\"z\"");
	}
}
