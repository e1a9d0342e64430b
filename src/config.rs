//! YAML config file: per-table/per-schema/global sample percentages and
//! anonymization field declarations (spec.md 3 supplement, 9 "Config
//! resolution").
//!
//! Grounded on `padmy/config.py`'s `Config`/`ConfigSchema`/`ConfigTable`/
//! `AnoFields` dataclasses, re-expressed as `serde`-deserialized structs.
//! `FieldType` is a closed enum per the REDESIGN FLAG in spec.md 9 rather
//! than the original's stringly-typed dispatch.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{PgOpsError, Result};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum FieldType {
	Email { domain: Option<String> },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AnoFields {
	pub column: String,
	#[serde(flatten)]
	pub field_type: FieldType,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct ConfigTable {
	pub schema: String,
	pub table: String,
	#[serde(default)]
	pub sample: Option<f64>,
	#[serde(default)]
	pub fields: Vec<AnoFields>,
	#[serde(default)]
	pub ignore: bool,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct ConfigSchema {
	pub schema: String,
	#[serde(default)]
	pub sample: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Config {
	#[serde(default)]
	pub sample: Option<f64>,
	#[serde(default)]
	pub schemas: Vec<ConfigSchema>,
	#[serde(default)]
	pub tables: Vec<ConfigTable>,
}

impl Config {
	pub fn load(path: &Path) -> Result<Config> {
		let text = fs::read_to_string(path).map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				PgOpsError::FileNotFound(path.to_path_buf())
			} else {
				PgOpsError::Io(e)
			}
		})?;
		Config::parse(&text)
	}

	pub fn parse(text: &str) -> Result<Config> {
		serde_yaml::from_str(text).map_err(|e| PgOpsError::Configuration(format!("invalid config: {e}")))
	}

	pub fn table(&self, schema: &str, table: &str) -> Option<&ConfigTable> {
		self.tables.iter().find(|t| t.schema == schema && t.table == table)
	}

	pub fn schema(&self, schema: &str) -> Option<&ConfigSchema> {
		self.schemas.iter().find(|s| s.schema == schema)
	}

	/// Per-table -> per-schema -> global default chain (spec.md 4.D.1, 9
	/// "Config resolution"). A table explicitly `ignore`d resolves to `None`
	/// regardless of any percent set above it.
	pub fn resolve_sample_percent(&self, schema: &str, table: &str) -> Option<f64> {
		if let Some(config_table) = self.table(schema, table) {
			if config_table.ignore {
				return None;
			}
		}
		resolve_chain(
			self.table(schema, table).and_then(|t| t.sample),
			self.schema(schema).and_then(|s| s.sample),
			self.sample,
		)
	}

	pub fn fields_for(&self, schema: &str, table: &str) -> &[AnoFields] {
		self.table(schema, table).map(|t| t.fields.as_slice()).unwrap_or(&[])
	}
}

/// First-non-null chain over a three-tuple (spec.md 9), expressed as a pure
/// function independent of `Config` for direct testability.
pub fn resolve_chain(table: Option<f64>, schema: Option<f64>, global: Option<f64>) -> Option<f64> {
	table.or(schema).or(global)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_chain_prefers_most_specific() {
		assert_eq!(resolve_chain(Some(10.0), Some(20.0), Some(30.0)), Some(10.0));
		assert_eq!(resolve_chain(None, Some(20.0), Some(30.0)), Some(20.0));
		assert_eq!(resolve_chain(None, None, Some(30.0)), Some(30.0));
		assert_eq!(resolve_chain(None, None, None), None);
	}

	#[test]
	fn parses_minimal_yaml() {
		let yaml = "sample: 10\nschemas:\n  - schema: public\n    sample: 25\ntables:\n  - schema: public\n    table: users\n    sample: 100\n    fields:\n      - column: email\n        type: EMAIL\n        domain: example.com\n";
		let config = Config::parse(yaml).unwrap();
		assert_eq!(config.sample, Some(10.0));
		assert_eq!(config.resolve_sample_percent("public", "users"), Some(100.0));
		assert_eq!(config.resolve_sample_percent("public", "other"), Some(25.0));
		assert_eq!(config.resolve_sample_percent("other_schema", "t"), Some(10.0));
		let fields = config.fields_for("public", "users");
		assert_eq!(fields.len(), 1);
		assert_eq!(fields[0].column, "email");
		assert_eq!(fields[0].field_type, FieldType::Email { domain: Some("example.com".to_string()) });
	}

	#[test]
	fn ignored_table_resolves_to_none() {
		let yaml = "sample: 50\ntables:\n  - schema: public\n    table: secrets\n    ignore: true\n";
		let config = Config::parse(yaml).unwrap();
		assert_eq!(config.resolve_sample_percent("public", "secrets"), None);
	}

	#[test]
	fn missing_file_reports_file_not_found() {
		let err = Config::load(Path::new("/nonexistent/pg_devops.yaml")).unwrap_err();
		assert!(matches!(err, PgOpsError::FileNotFound(_)));
	}
}
