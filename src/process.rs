//! Thin wrappers over `pg_dump`/`pg_restore`/`createdb`/`dropdb`/`psql`,
//! the stderr error parser, and dump sanitization (spec.md 4.A).
//!
//! Generalizes `postgres_migrator`'s `apply_sql_files`/`TempDb` shell-outs,
//! which only ever ran `psql`-equivalent statements through the `postgres`
//! crate itself; here we actually spawn the PostgreSQL CLI tools, matching
//! `padmy/utils.py`'s `dump_db`/`restore_db`/`create_db`/`drop_db`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, OnceLock};

use regex::Regex;

use crate::connection::ConnectionDescriptor;
use crate::error::{ErrorBlock, PgOpsError, Result};

/// Process-wide, write-once cache of resolved absolute command paths
/// (spec.md 5: "the command-path cache is process-wide, write-once per
/// command").
fn command_path_cache() -> &'static Mutex<HashMap<&'static str, PathBuf>> {
	static CACHE: OnceLock<Mutex<HashMap<&'static str, PathBuf>>> = OnceLock::new();
	CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn resolve_command(cmd: &'static str) -> Result<PathBuf> {
	let mut cache = command_path_cache().lock().unwrap();
	if let Some(path) = cache.get(cmd) {
		return Ok(path.clone());
	}
	let output = Command::new("which")
		.arg(cmd)
		.output()
		.map_err(|_| PgOpsError::Configuration(format!("unable to resolve command {cmd:?} on PATH")))?;
	if !output.status.success() {
		return Err(PgOpsError::Configuration(format!("{cmd} not found on PATH")));
	}
	let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
	cache.insert(cmd, path.clone());
	Ok(path)
}

/// Scans stderr lines for `ERROR:`/`FATAL:` blocks (spec.md 4.A). A line
/// starting with one of those prefixes opens a block; continuation lines
/// are appended; a `NOTICE:` line closes the current block. `E ` prefixes
/// and runs of whitespace are collapsed.
pub fn parse_error_blocks(stderr: &str) -> Vec<ErrorBlock> {
	let collapse_ws = Regex::new(r"\s+").unwrap();
	let mut blocks = vec![];
	let mut current: Option<Vec<String>> = None;

	let clean = |line: &str| -> String {
		let line = line.strip_prefix("E ").unwrap_or(line);
		collapse_ws.replace_all(line.trim(), " ").to_string()
	};

	for raw_line in stderr.lines() {
		let line = clean(raw_line);
		if line.starts_with("ERROR:") || line.starts_with("FATAL:") {
			if let Some(block) = current.take() {
				blocks.push(ErrorBlock { lines: block });
			}
			current = Some(vec![line]);
		} else if line.starts_with("NOTICE:") {
			if let Some(block) = current.take() {
				blocks.push(ErrorBlock { lines: block });
			}
		} else if let Some(block) = current.as_mut() {
			if !line.is_empty() {
				block.push(line);
			}
		}
	}
	if let Some(block) = current.take() {
		blocks.push(ErrorBlock { lines: block });
	}
	blocks
}

fn has_error_markers(stderr: &str) -> bool {
	stderr.lines().any(|l| {
		let l = l.trim_start();
		l.starts_with("ERROR:") || l.starts_with("FATAL:") || l.starts_with("E ERROR:") || l.starts_with("E FATAL:")
	})
}

fn run_checked(cmd_name: &'static str, mut command: Command) -> Result<Vec<u8>> {
	let output = command
		.output()
		.map_err(|e| PgOpsError::Configuration(format!("failed to spawn {cmd_name}: {e}")))?;
	let stderr = String::from_utf8_lossy(&output.stderr).to_string();
	if has_error_markers(&stderr) {
		return Err(PgOpsError::ExternalTool {
			cmd: cmd_name.to_string(),
			blocks: parse_error_blocks(&stderr),
		});
	}
	Ok(output.stdout)
}

fn base_command(cmd_name: &'static str, descriptor: &ConnectionDescriptor) -> Result<Command> {
	let path = resolve_command(cmd_name)?;
	let mut command = Command::new(path);
	command.arg("-U").arg(&descriptor.user);
	command.arg("-h").arg(&descriptor.host);
	command.arg("-p").arg(descriptor.port.to_string());
	for (key, value) in descriptor.to_env() {
		command.env(key, value);
	}
	Ok(command)
}

pub fn pg_dump(descriptor: &ConnectionDescriptor, database: &str, extra_args: &[&str], out_path: &Path) -> Result<()> {
	let mut command = base_command("pg_dump", descriptor)?;
	command.args(extra_args).arg("-f").arg(out_path).arg(database);
	run_checked("pg_dump", command)?;
	Ok(())
}

pub fn pg_restore(descriptor: &ConnectionDescriptor, database: &str, extra_args: &[&str], dump_path: &Path) -> Result<()> {
	let mut command = base_command("pg_restore", descriptor)?;
	command.args(extra_args).arg("-d").arg(database).arg(dump_path);
	run_checked("pg_restore", command)?;
	Ok(())
}

pub fn create_db(descriptor: &ConnectionDescriptor, database: &str) -> Result<()> {
	let mut command = base_command("createdb", descriptor)?;
	command.arg(database);
	run_checked("createdb", command)?;
	Ok(())
}

pub fn drop_db(descriptor: &ConnectionDescriptor, database: &str, if_exists: bool) -> Result<()> {
	let mut command = base_command("dropdb", descriptor)?;
	if if_exists {
		command.arg("--if-exists");
	}
	command.arg(database);
	run_checked("dropdb", command)?;
	Ok(())
}

pub fn psql_file(descriptor: &ConnectionDescriptor, database: &str, sql_file: &Path) -> Result<()> {
	let mut command = base_command("psql", descriptor)?;
	command.arg("-d").arg(database).arg("-v").arg("ON_ERROR_STOP=1").arg("-f").arg(sql_file);
	run_checked("psql", command)?;
	Ok(())
}

pub fn psql_statement(descriptor: &ConnectionDescriptor, database: &str, statement: &str) -> Result<()> {
	let mut command = base_command("psql", descriptor)?;
	command.arg("-d").arg(database).arg("-v").arg("ON_ERROR_STOP=1").arg("-c").arg(statement);
	run_checked("psql", command)?;
	Ok(())
}

/// Strips `\restrict`/`\unrestrict` directives (PostgreSQL 17.6+) from a
/// dump file's text before byte-comparison, matching
/// `padmy.utils.remove_restrict_clauses`.
pub fn sanitize_dump(text: &str) -> String {
	text.lines()
		.filter(|line| !line.starts_with("\\restrict") && !line.starts_with("\\unrestrict"))
		.collect::<Vec<_>>()
		.join("\n")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_single_error_block() {
		let stderr = "some noise\nERROR:  relation \"foo\" does not exist\nLINE 1: select * from foo\nNOTICE: done\n";
		let blocks = parse_error_blocks(stderr);
		assert_eq!(blocks.len(), 1);
		assert!(blocks[0].lines[0].contains("relation \"foo\" does not exist"));
		assert!(blocks[0].lines[1].contains("LINE 1"));
	}

	#[test]
	fn parses_multiple_blocks_separated_by_notice() {
		let stderr = "ERROR: first\ndetail one\nNOTICE: ignore\nFATAL: second\ndetail two\n";
		let blocks = parse_error_blocks(stderr);
		assert_eq!(blocks.len(), 2);
		assert!(blocks[0].lines[0].contains("first"));
		assert!(blocks[1].lines[0].contains("second"));
	}

	#[test]
	fn collapses_e_prefix_and_whitespace() {
		let stderr = "E ERROR:   too   many   spaces\n";
		let blocks = parse_error_blocks(stderr);
		assert_eq!(blocks[0].lines[0], "ERROR: too many spaces");
	}

	#[test]
	fn no_blocks_when_no_markers() {
		assert!(parse_error_blocks("just some ordinary stdout mirrored to stderr\n").is_empty());
	}

	#[test]
	fn sanitize_strips_restrict_directives() {
		let dump = "SET x;\n\\restrict abcdef\nCREATE TABLE foo ();\n\\unrestrict abcdef\n";
		let sanitized = sanitize_dump(dump);
		assert!(!sanitized.contains("restrict"));
		assert!(sanitized.contains("CREATE TABLE foo"));
	}
}
