//! Table layout and schema migrations

use redb::{Database, MultimapTableDefinition, ReadableTable, TableDefinition, WriteTransaction};
use tracing::info;

use crate::error::{PersonaError, PersonaResult};

/// Persona rows keyed by persona identifier text
pub(crate) const PERSONAS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("personas");

/// Profile rows keyed by profile identifier text
pub(crate) const PROFILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("profiles");

/// `"yes"` / `"no"` -> persona key
pub(crate) const PERSONAS_BY_PRIVATE_KEY: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("personas.hasPrivateKey");

/// network -> profile key
pub(crate) const PROFILES_BY_NETWORK: MultimapTableDefinition<&str, &str> =
    MultimapTableDefinition::new("profiles.network");

const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const SCHEMA_VERSION_KEY: &str = "schema_version";

type Migration = fn(&WriteTransaction) -> PersonaResult<()>;

/// Step `i` upgrades a store at version `i` to version `i + 1`.
const MIGRATIONS: &[Migration] = &[create_initial_tables];

/// Schema version written by this build
pub const SCHEMA_VERSION: u64 = MIGRATIONS.len() as u64;

fn create_initial_tables(txn: &WriteTransaction) -> PersonaResult<()> {
    txn.open_table(PERSONAS_TABLE)?;
    txn.open_table(PROFILES_TABLE)?;
    txn.open_multimap_table(PERSONAS_BY_PRIVATE_KEY)?;
    txn.open_multimap_table(PROFILES_BY_NETWORK)?;
    Ok(())
}

/// Bring the store up to [`SCHEMA_VERSION`]. Returns the version found
/// before migrating.
pub(crate) fn migrate(db: &Database) -> PersonaResult<u64> {
    let write_txn = db.begin_write()?;

    let stored = {
        let meta = write_txn.open_table(META_TABLE)?;
        let version = meta.get(SCHEMA_VERSION_KEY)?.map(|v| v.value());
        version.unwrap_or(0)
    };

    if stored > SCHEMA_VERSION {
        write_txn.abort()?;
        return Err(PersonaError::SchemaTooNew {
            found: stored,
            supported: SCHEMA_VERSION,
        });
    }

    for (step, migration) in MIGRATIONS.iter().enumerate().skip(stored as usize) {
        migration(&write_txn)?;
        info!(from = step, to = step + 1, "Migrated persona database schema");
    }

    {
        let mut meta = write_txn.open_table(META_TABLE)?;
        meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
    }
    write_txn.commit()?;

    Ok(stored)
}

#[cfg(test)]
pub(crate) fn force_schema_version(db: &Database, version: u64) -> PersonaResult<()> {
    let write_txn = db.begin_write()?;
    {
        let mut meta = write_txn.open_table(META_TABLE)?;
        meta.insert(SCHEMA_VERSION_KEY, version)?;
    }
    write_txn.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_database_migrates_from_zero() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("test.redb")).unwrap();

        assert_eq!(migrate(&db).unwrap(), 0);
        // Second run is a no-op
        assert_eq!(migrate(&db).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = TempDir::new().unwrap();
        let db = Database::create(dir.path().join("test.redb")).unwrap();
        force_schema_version(&db, SCHEMA_VERSION + 1).unwrap();

        match migrate(&db) {
            Err(PersonaError::SchemaTooNew { found, supported }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected SchemaTooNew, got {:?}", other),
        }
    }
}
