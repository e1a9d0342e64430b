//! Migration engine (spec.md 4.C): file model, ordering invariants, ledger
//! application, round-trip verification, and reorder/repair.

pub mod create;
pub mod file;
pub mod ledger;
pub mod order;
pub mod reorder;
pub mod verify;

pub use create::{create_migration, MigrationConfig, NewMigrationOptions};
pub use file::{generate_file_id, Header, Kind, MigrationFile};
pub use ledger::{migrate_down, migrate_setup, migrate_up, verify_migrations, LedgerRow};
pub use order::{raise_on_duplicates, verify_migration_files, MigrationFileError};
pub use reorder::{reorder_by_applied, reorder_by_last, repair_headers};
pub use verify::{migrate_verify, unified_diff, VerifyOptions};
