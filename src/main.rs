mod anonymize;
mod cli;
mod compare;
mod config;
mod connection;
mod error;
mod migration;
mod process;
mod sampling;
mod schema;

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use cli::{Args, Command, MigrateAction, RawArgs};
use config::Config;
use connection::ConnectionDescriptor;
use migration::MigrationFile;

fn main() -> Result<()> {
	let args = Args::from_raw_args(RawArgs::parse())?;

	match &args.command {
		Command::Migrate { action } => command_migrate(&args, action),
		Command::Anonymize { chunk_size } => command_anonymize(&args, *chunk_size),
		Command::Sample { copy_schema_first, drop_public, disable_triggers, chunk_size } => {
			command_sample(&args, *copy_schema_first, *drop_public, *disable_triggers, *chunk_size)
		}
		Command::CopyDb { drop_public } => command_copy_db(&args, *drop_public),
		Command::Analyze => command_analyze(&args),
		Command::Compare { no_privileges } | Command::SchemaDiff { no_privileges } => command_compare(&args, *no_privileges),
		Command::Dump { out, no_privileges } => command_dump(&args, out, *no_privileges),
	}
}

fn load_config(args: &Args) -> Result<Config> {
	match &args.config {
		Some(path) => Ok(Config::load(path)?),
		None => Ok(Config::default()),
	}
}

fn connect(descriptor: &ConnectionDescriptor, database: &str) -> Result<postgres::Client> {
	let mut with_db = descriptor.clone();
	with_db.database = Some(database.to_string());
	Ok(with_db.connect().context("failed to connect to database")?)
}

fn command_migrate(args: &Args, action: &MigrateAction) -> Result<()> {
	match action {
		MigrateAction::New { version, author, skip_verify } => {
			let config_path = migration::MigrationConfig::default_path()
				.ok_or_else(|| anyhow!("unable to resolve home directory for migration author config"))?;
			let author = migration::MigrationConfig::resolve_author(&config_path, author.as_deref())?;
			let (ts, file_id) = migration::create::next_file_id_and_ts();
			let options = migration::NewMigrationOptions { version: version.as_deref(), author: author.as_deref(), skip_verify: *skip_verify };
			let (up, down) = migration::create_migration(&args.migration_dir, ts, &file_id, &options)?;
			println!("created {}", up.filename());
			println!("created {}", down.filename());
			Ok(())
		}
		MigrateAction::NewSql { name } => {
			std::fs::create_dir_all(&args.sql_dir)?;
			let path = args.sql_dir.join(name);
			std::fs::write(&path, "")?;
			println!("created {}", path.display());
			Ok(())
		}
		MigrateAction::ApplySql { name } => {
			let descriptor = args.require_descriptor()?;
			let database = args.require_database()?;
			let path = args.sql_dir.join(name);
			process::psql_file(descriptor, database, &path)?;
			Ok(())
		}
		MigrateAction::Setup => {
			let descriptor = args.require_descriptor()?;
			let database = args.require_database()?;
			let mut client = connect(descriptor, database)?;
			migration::migrate_setup(&mut client)?;
			println!("created public.migration ledger table");
			Ok(())
		}
		MigrateAction::Up { n, no_transaction } => {
			let descriptor = args.require_descriptor()?;
			let database = args.require_database()?;
			let mut client = connect(descriptor, database)?;
			let applied = migration::migrate_up(&mut client, &args.migration_dir, *n, None, !*no_transaction)?;
			for file in &applied {
				println!("applied {}", file.filename());
			}
			Ok(())
		}
		MigrateAction::Down { n, until_file_id } => {
			let descriptor = args.require_descriptor()?;
			let database = args.require_database()?;
			let mut client = connect(descriptor, database)?;
			let rolled_back = migration::migrate_down(&mut client, &args.migration_dir, *n, until_file_id.as_deref(), None)?;
			for file in &rolled_back {
				println!("rolled back {}", file.filename());
			}
			Ok(())
		}
		MigrateAction::Verify { only_last, skip_down_restore } => {
			let descriptor = args.require_descriptor()?;
			let database = args.require_database()?;
			let mut client = connect(descriptor, database)?;
			let options = migration::VerifyOptions { only_last: *only_last, skip_down_restore: *skip_down_restore };
			migration::migrate_verify(&mut client, descriptor, database, &args.migration_dir, &args.dump_dir, &options)?;
			println!("round-trip verification passed");
			Ok(())
		}
		MigrateAction::VerifyFiles { no_raise } => {
			let files = MigrationFile::read_all(&args.migration_dir)?;
			let errors = migration::verify_migration_files(&files);
			for error in &errors {
				eprintln!("{}: {} ({})", error.kind, error.message, error.file_id);
			}
			if !errors.is_empty() && !*no_raise {
				migration::raise_on_duplicates(&errors)?;
				return Err(anyhow!("{} migration file ordering error(s) found", errors.len()));
			}
			Ok(())
		}
		MigrateAction::VerifyMigrations => {
			let descriptor = args.require_descriptor()?;
			let database = args.require_database()?;
			let mut client = connect(descriptor, database)?;
			let applied = migration::verify_migrations(&mut client, &args.migration_dir)?;
			for file in &applied {
				println!("applied missing migration {}", file.filename());
			}
			Ok(())
		}
		MigrateAction::ReorderFiles { last, applied } => {
			if !last.is_empty() && !applied.is_empty() {
				return Err(anyhow!("--last and --applied are mutually exclusive"));
			}
			let now = chrono::Utc::now().timestamp();
			let modified = if !last.is_empty() {
				migration::reorder_by_last(&args.migration_dir, last, now)?
			} else if !applied.is_empty() {
				migration::reorder_by_applied(&args.migration_dir, applied, now)?
			} else {
				migration::repair_headers(&args.migration_dir)?
			};
			for path in &modified {
				println!("rewrote {}", path.display());
			}
			Ok(())
		}
	}
}

fn command_anonymize(args: &Args, chunk_size: i64) -> Result<()> {
	let descriptor = args.require_descriptor()?;
	let database = args.require_database()?;
	let config = load_config(args)?;

	let mut client = connect(descriptor, database)?;
	let graph = schema::load_schema_graph(&mut client, &args.schemas, None)?;

	let targets: Vec<anonymize::AnonymizeTarget> = graph
		.tables
		.values()
		.filter(|t| !config.fields_for(&t.schema, &t.name).is_empty())
		.map(|t| anonymize::AnonymizeTarget { schema: t.schema.clone(), table: t.name.clone(), fields: config.fields_for(&t.schema, &t.name).to_vec() })
		.collect();

	let primary_keys: HashMap<String, Vec<String>> = graph.tables.values().map(|t| (t.full_name(), t.primary_key.clone())).collect();

	let descriptor_owned = descriptor.clone();
	let database_owned = database.to_string();
	let results = anonymize::anonymize_database(move || connect(&descriptor_owned, &database_owned).map_err(to_pg_ops_error), &targets, &primary_keys, chunk_size)?;
	for (full_name, updated) in results {
		println!("anonymized {updated} row(s) in {full_name}");
	}
	Ok(())
}

fn to_pg_ops_error(e: anyhow::Error) -> error::PgOpsError {
	error::PgOpsError::Configuration(e.to_string())
}

fn command_sample(args: &Args, copy_schema_first: bool, drop_public: bool, disable_triggers: bool, chunk_size: i64) -> Result<()> {
	let source_descriptor = args.require_descriptor()?;
	let target_descriptor = args.require_descriptor_to()?;
	let source_database = args.require_database()?;
	let target_database = args.require_database_to()?;
	let config = load_config(args)?;

	if copy_schema_first {
		sampling::copy_schema(source_descriptor, source_database, target_descriptor, target_database, &args.schemas, drop_public)?;
	}

	let mut source_client = connect(source_descriptor, source_database)?;
	let counter = {
		let descriptor = source_descriptor.clone();
		let database = source_database.to_string();
		move || connect(&descriptor, &database).map_err(to_pg_ops_error)
	};
	let mut graph = schema::load_schema_graph(&mut source_client, &args.schemas, Some(&counter))?;

	let percents = sampling::resolve_all_sample_percents(&graph, &config)?;
	for table in graph.tables.values_mut() {
		if let Some((_, percent)) = percents.iter().find(|(name, _)| name == &table.full_name()) {
			table.sample_size_percent = Some(*percent);
		}
		if config.table(&table.schema, &table.name).map(|t| t.ignore).unwrap_or(false) {
			table.ignored = true;
		}
	}
	let sizes = sampling::resolve_sizes(&graph, &percents);

	let process_order = sampling::topo_order_for_sampling(&graph, sampling::SeedStrategy::Roots)?;
	sampling::materialize_temp_tables(&mut source_client, &graph, &process_order, &sizes)?;

	let mut target_client = connect(target_descriptor, target_database)?;
	sampling::transfer_to_target(&mut target_client, &mut source_client, &graph, &process_order, disable_triggers, chunk_size)?;

	println!("sampled {} table(s) into {target_database}", process_order.len());
	Ok(())
}

fn command_copy_db(args: &Args, drop_public: bool) -> Result<()> {
	let source_descriptor = args.require_descriptor()?;
	let target_descriptor = args.require_descriptor_to()?;
	let source_database = args.require_database()?;
	let target_database = args.require_database_to()?;
	sampling::copy_schema(source_descriptor, source_database, target_descriptor, target_database, &args.schemas, drop_public)?;
	println!("copied schema from {source_database} to {target_database}");
	Ok(())
}

fn command_analyze(args: &Args) -> Result<()> {
	let descriptor = args.require_descriptor()?;
	let database = args.require_database()?;
	let mut client = connect(descriptor, database)?;
	let graph = schema::load_schema_graph(&mut client, &args.schemas, None)?;

	let mut names: Vec<&String> = graph.tables.keys().collect();
	names.sort();
	for full_name in names {
		let table = &graph.tables[full_name];
		println!(
			"{full_name}: {} column(s), {} fk(s), root={}, leaf={}",
			table.columns.len(),
			table.foreign_keys.len(),
			graph.is_root(full_name),
			graph.is_leaf(full_name),
		);
	}
	Ok(())
}

fn command_compare(args: &Args, no_privileges: bool) -> Result<()> {
	let left_descriptor = args.require_descriptor()?;
	let right_descriptor = args.require_descriptor_to()?;
	let left_database = args.require_database()?;
	let right_database = args.require_database_to()?;
	let options = compare::CompareOptions { no_privileges };
	match compare::compare_databases(left_descriptor, left_database, right_descriptor, right_database, &args.dump_dir, &options)? {
		None => {
			println!("schemas are identical");
			Ok(())
		}
		Some(diff) => {
			println!("{diff}");
			Err(anyhow!("schemas differ"))
		}
	}
}

fn command_dump(args: &Args, out: &std::path::Path, no_privileges: bool) -> Result<()> {
	let descriptor = args.require_descriptor()?;
	let database = args.require_database()?;
	let mut extra_args = vec!["--schema-only"];
	if no_privileges {
		extra_args.push("--no-privileges");
	}
	process::pg_dump(descriptor, database, &extra_args, out)?;
	println!("dumped {database} to {}", out.display());
	Ok(())
}
