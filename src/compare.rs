//! Schema comparison: dump two databases, sanitize, byte-compare, diff
//! (spec.md 4.F).
//!
//! Grounded on `padmy/compare.py`'s `compare_databases`.

use std::fs;
use std::path::Path;

use crate::connection::ConnectionDescriptor;
use crate::error::Result;
use crate::migration::unified_diff;
use crate::process;

pub struct CompareOptions {
	pub no_privileges: bool,
}

/// Dumps both databases' schemas, sanitizes `\restrict` directives, and
/// byte-compares them. Returns `None` when equal, or a unified diff when
/// they differ (spec.md 4.F).
pub fn compare_databases(
	left_descriptor: &ConnectionDescriptor,
	left_database: &str,
	right_descriptor: &ConnectionDescriptor,
	right_database: &str,
	dump_dir: &Path,
	options: &CompareOptions,
) -> Result<Option<String>> {
	fs::create_dir_all(dump_dir)?;

	let mut extra_args = vec!["-E", "utf8", "--schema-only"];
	if options.no_privileges {
		extra_args.push("--no-privileges");
	}

	let left_path = dump_dir.join(format!("{left_database}.sql"));
	let right_path = dump_dir.join(format!("{right_database}.sql"));

	process::pg_dump(left_descriptor, left_database, &extra_args, &left_path)?;
	process::pg_dump(right_descriptor, right_database, &extra_args, &right_path)?;

	let left_text = process::sanitize_dump(&fs::read_to_string(&left_path)?);
	let right_text = process::sanitize_dump(&fs::read_to_string(&right_path)?);

	if left_text == right_text {
		Ok(None)
	} else {
		Ok(Some(unified_diff(&left_text, &right_text)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sanitized_identical_dumps_compare_equal() {
		let left = process::sanitize_dump("SET x;\n\\restrict abc\nCREATE TABLE t ();\n");
		let right = process::sanitize_dump("SET x;\n\\restrict def\nCREATE TABLE t ();\n");
		assert_eq!(left, right);
	}

	/// Live-DB: two databases with the same table compare equal, and
	/// adding a column to one side produces a non-empty diff.
	#[test]
	#[ignore]
	#[serial_test::serial]
	fn compare_databases_detects_schema_drift() {
		let left_url = std::env::var("PG_URL_TEST").expect("PG_URL_TEST must be set for live tests");
		let right_url =
			std::env::var("PG_URL_TEST_TARGET").expect("PG_URL_TEST_TARGET must be set for live transfer tests");
		let left_descriptor = ConnectionDescriptor::from_uri(&left_url).unwrap();
		let right_descriptor = ConnectionDescriptor::from_uri(&right_url).unwrap();
		let left_database = left_descriptor.database.clone().expect("PG_URL_TEST must include a database");
		let right_database = right_descriptor.database.clone().expect("PG_URL_TEST_TARGET must include a database");
		let mut left = left_descriptor.connect().unwrap();
		let mut right = right_descriptor.connect().unwrap();

		left.batch_execute("DROP TABLE IF EXISTS widgets; CREATE TABLE widgets (id serial PRIMARY KEY);").unwrap();
		right.batch_execute("DROP TABLE IF EXISTS widgets; CREATE TABLE widgets (id serial PRIMARY KEY);").unwrap();

		let dump_dir = std::env::temp_dir().join("pg_devops_test_compare_equal");
		let options = CompareOptions { no_privileges: true };
		let diff = compare_databases(&left_descriptor, &left_database, &right_descriptor, &right_database, &dump_dir, &options)
			.unwrap();
		assert!(diff.is_none());

		right.batch_execute("ALTER TABLE widgets ADD COLUMN extra int;").unwrap();
		let diff = compare_databases(&left_descriptor, &left_database, &right_descriptor, &right_database, &dump_dir, &options)
			.unwrap();
		assert!(diff.is_some());
		assert!(diff.unwrap().contains("extra"));

		left.batch_execute("DROP TABLE widgets").unwrap();
		right.batch_execute("DROP TABLE widgets").unwrap();
		fs::remove_dir_all(&dump_dir).ok();
	}
}
