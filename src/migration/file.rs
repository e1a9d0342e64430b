//! Migration filename/header parsing and serialization (spec.md 4.C.1, 6).
//!
//! Grounded on `padmy/migration/utils.py`'s `Header`/`MigrationFile`/
//! `parse_filename`, translated to `postgres_migrator`'s `MigrationFile`
//! filename-parsing shape (`src/main.rs`'s version/`fileId`-style regex
//! capture groups).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

use crate::error::{PgOpsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	Up,
	Down,
}

impl Kind {
	pub fn as_str(&self) -> &'static str {
		match self {
			Kind::Up => "up",
			Kind::Down => "down",
		}
	}
}

impl std::fmt::Display for Kind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

fn filename_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"^([0-9]+)-([0-9a-f]{8})-(up|down)\.sql$").unwrap())
}

const PREV_FILE_PREFIX: &str = "-- Prev-file:";
const AUTHOR_PREFIX: &str = "-- Author:";
const VERSION_PREFIX: &str = "-- Version:";
const SKIP_VERIFY_PREFIX: &str = "-- Skip-verify:";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
	pub prev_file: Option<String>,
	pub author: Option<String>,
	pub version: Option<String>,
	pub skip_verify: Option<String>,
}

impl Header {
	pub fn is_empty(&self) -> bool {
		self.prev_file.is_none() && self.author.is_none() && self.version.is_none() && self.skip_verify.is_none()
	}

	pub fn skip_verify_set(&self) -> bool {
		self.skip_verify.is_some()
	}

	/// Parses the leading `-- <prefix>:` lines of a file body. Lines not
	/// matching a known prefix end the header (spec.md 6: header lines are
	/// strictly leading).
	pub fn parse(body: &str) -> Header {
		let mut header = Header::default();
		for line in body.lines() {
			let trimmed = line.trim_end();
			if let Some(rest) = trimmed.strip_prefix(PREV_FILE_PREFIX) {
				header.prev_file = non_empty(rest);
			} else if let Some(rest) = trimmed.strip_prefix(AUTHOR_PREFIX) {
				header.author = non_empty(rest);
			} else if let Some(rest) = trimmed.strip_prefix(VERSION_PREFIX) {
				header.version = non_empty(rest);
			} else if let Some(rest) = trimmed.strip_prefix(SKIP_VERIFY_PREFIX) {
				header.skip_verify = non_empty(rest);
			} else {
				break;
			}
		}
		if header.is_empty() {
			Header::default()
		} else {
			header
		}
	}

	/// Serializes recognized fields as leading header lines. Omitted fields
	/// are written with an empty value rather than omitted, so re-parsing
	/// and re-serializing is idempotent (spec.md 8 invariant 6).
	pub fn render(&self, kind: Kind) -> String {
		let mut lines = vec![
			format!("{PREV_FILE_PREFIX} {}", self.prev_file.as_deref().unwrap_or("")),
			format!("{AUTHOR_PREFIX} {}", self.author.as_deref().unwrap_or("")),
			format!("{VERSION_PREFIX} {}", self.version.as_deref().unwrap_or("")),
		];
		if kind == Kind::Down {
			lines.push(format!("{SKIP_VERIFY_PREFIX} {}", self.skip_verify.as_deref().unwrap_or("")));
		}
		lines.join("\n")
	}

	/// Strips the leading header lines from a file body, returning the
	/// remainder unchanged.
	pub fn strip_from_body(body: &str) -> &str {
		let mut rest = body;
		loop {
			let trimmed = rest.trim_start_matches(['\n', '\r']);
			let line_end = trimmed.find('\n').map(|i| i + 1).unwrap_or(trimmed.len());
			let (line, remainder) = trimmed.split_at(line_end);
			let line_trimmed = line.trim_end();
			if line_trimmed.starts_with(PREV_FILE_PREFIX)
				|| line_trimmed.starts_with(AUTHOR_PREFIX)
				|| line_trimmed.starts_with(VERSION_PREFIX)
				|| line_trimmed.starts_with(SKIP_VERIFY_PREFIX)
			{
				rest = remainder;
			} else {
				return rest;
			}
		}
	}
}

fn non_empty(s: &str) -> Option<String> {
	let trimmed = s.trim();
	if trimmed.is_empty() {
		None
	} else {
		Some(trimmed.to_string())
	}
}

#[derive(Debug, Clone)]
pub struct MigrationFile {
	pub ts: i64,
	pub file_id: String,
	pub kind: Kind,
	pub path: PathBuf,
	pub header: Option<Header>,
}

impl MigrationFile {
	pub fn filename(&self) -> String {
		format!("{}-{}-{}.sql", self.ts, self.file_id, self.kind)
	}

	pub fn parse_filename(path: &Path) -> Result<(i64, String, Kind)> {
		let name = path
			.file_name()
			.and_then(|n| n.to_str())
			.ok_or_else(|| PgOpsError::FileNotFound(path.to_path_buf()))?;
		let caps = filename_re()
			.captures(name)
			.ok_or_else(|| PgOpsError::Configuration(format!("not a migration filename: {name}")))?;
		let ts: i64 = caps[1]
			.parse()
			.map_err(|_| PgOpsError::Configuration(format!("invalid timestamp in filename: {name}")))?;
		let file_id = caps[2].to_string();
		let kind = if &caps[3] == "up" { Kind::Up } else { Kind::Down };
		Ok((ts, file_id, kind))
	}

	pub fn read(path: &Path) -> Result<MigrationFile> {
		let (ts, file_id, kind) = Self::parse_filename(path)?;
		let body = fs::read_to_string(path)?;
		let header = Header::parse(&body);
		let header = if header.is_empty() { None } else { Some(header) };
		Ok(MigrationFile { ts, file_id, kind, path: path.to_path_buf(), header })
	}

	pub fn sql_body(&self) -> Result<String> {
		let body = fs::read_to_string(&self.path)?;
		Ok(Header::strip_from_body(&body).to_string())
	}

	pub fn write(folder: &Path, ts: i64, file_id: &str, kind: Kind, header: &Header, sql_body: &str) -> Result<MigrationFile> {
		let filename = format!("{ts}-{file_id}-{kind}.sql");
		let path = folder.join(&filename);
		let contents = format!("{}\n{}", header.render(kind), sql_body);
		fs::write(&path, contents)?;
		let header = if header.is_empty() { None } else { Some(header.clone()) };
		Ok(MigrationFile { ts, file_id: file_id.to_string(), kind, path, header })
	}

	pub fn rewrite_header(&mut self, header: Header) -> Result<()> {
		let body = self.sql_body()?;
		let contents = format!("{}\n{}", header.render(self.kind), body);
		fs::write(&self.path, contents)?;
		self.header = if header.is_empty() { None } else { Some(header) };
		Ok(())
	}

	/// Reads every `*.sql` migration file directly inside `folder` (not
	/// recursive — one flat directory per spec.md 6), sorted by
	/// `(ts, fileId)`.
	pub fn read_all(folder: &Path) -> Result<Vec<MigrationFile>> {
		let mut files = vec![];
		if !folder.exists() {
			return Ok(files);
		}
		for entry in fs::read_dir(folder)? {
			let entry = entry?;
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some("sql") {
				continue;
			}
			if Self::parse_filename(&path).is_ok() {
				files.push(MigrationFile::read(&path)?);
			}
		}
		files.sort_by(|a, b| (a.ts, &a.file_id).cmp(&(b.ts, &b.file_id)));
		Ok(files)
	}

	pub fn read_by_kind(folder: &Path, kind: Kind) -> Result<Vec<MigrationFile>> {
		Ok(Self::read_all(folder)?.into_iter().filter(|f| f.kind == kind).collect())
	}
}

pub fn generate_file_id() -> String {
	let mut rng = rand::thread_rng();
	(0..8).map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap()).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_round_trip_preserves_fields() {
		let header = Header {
			prev_file: Some("1-aaaaaaaa-up.sql".to_string()),
			author: Some("dev@example.com".to_string()),
			version: Some("1.2.0".to_string()),
			skip_verify: None,
		};
		let rendered = header.render(Kind::Up);
		let body = format!("{rendered}\nSELECT 1;\n");
		let reparsed = Header::parse(&body);
		assert_eq!(reparsed.prev_file, header.prev_file);
		assert_eq!(reparsed.author, header.author);
		assert_eq!(reparsed.version, header.version);
	}

	#[test]
	fn strip_from_body_removes_only_header_lines() {
		let body = "-- Prev-file: x\n-- Author: a\nSELECT 1;\n-- not a header comment\n";
		let stripped = Header::strip_from_body(body);
		assert_eq!(stripped, "SELECT 1;\n-- not a header comment\n");
	}

	#[test]
	fn parse_filename_extracts_ts_id_kind() {
		let (ts, id, kind) = MigrationFile::parse_filename(Path::new("1700000000-deadbeef-up.sql")).unwrap();
		assert_eq!(ts, 1700000000);
		assert_eq!(id, "deadbeef");
		assert_eq!(kind, Kind::Up);
	}

	#[test]
	fn parse_filename_rejects_non_matching_names() {
		assert!(MigrationFile::parse_filename(Path::new("not-a-migration.sql")).is_err());
	}

	#[test]
	fn generated_file_id_is_eight_lowercase_hex_chars() {
		let id = generate_file_id();
		assert_eq!(id.len(), 8);
		assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
	}
}
