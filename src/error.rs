use std::path::PathBuf;

/// Kind of failure during file-ordering verification (spec.md 4.C.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationErrorKind {
	Order,
	Header,
	Duplicate,
}

impl std::fmt::Display for MigrationErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			MigrationErrorKind::Order => "order",
			MigrationErrorKind::Header => "header",
			MigrationErrorKind::Duplicate => "duplicate",
		};
		write!(f, "{s}")
	}
}

/// A single `ERROR:`/`FATAL:` block scraped from a child process's stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBlock {
	pub lines: Vec<String>,
}

impl std::fmt::Display for ErrorBlock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.lines.join("\n"))
	}
}

#[derive(thiserror::Error, Debug)]
pub enum PgOpsError {
	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("{cmd} failed:\n{}", .blocks.iter().map(|b| b.to_string()).collect::<Vec<_>>().join("\n\n"))]
	ExternalTool { cmd: String, blocks: Vec<ErrorBlock> },

	#[error("difference found for migration {migration_id}")]
	Migration { migration_id: String, diff: String },

	#[error("{kind} error for migration {file_id}: {message}")]
	MigrationFile {
		kind: MigrationErrorKind,
		file_id: String,
		message: String,
	},

	#[error("table \"public.migration\" does not exist, did you forget to run `migrate setup`?")]
	NoSetupTable,

	#[error("cyclic foreign keys detected among: {}", .tables.join(", "))]
	Cycle { tables: Vec<String> },

	#[error("no sample size resolved for table {0}")]
	MissingSampleSize(String),

	#[error("required file not found: {0}")]
	FileNotFound(PathBuf),

	#[error("database error: {0}")]
	Database(#[from] postgres::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PgOpsError>;
