use std::path::Path;

use mewc_index_core::store::AssetStore;
use redb::Database;
use redb::Error as RedbError;
use redb::TableDefinition;

const CURRENT_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> = TableDefinition::new("asset_current");
const UNDO_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> = TableDefinition::new("asset_undo");

/// All fourteen asset-family tables live in one `redb::Database`, rows keyed
/// by `prefix ++ key` so every family's rows stay contiguous under a
/// range scan on its own prefix.
pub struct RedbAssetStore {
    db: Database,
}

fn prefixed(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

fn undo_key(prefix: &[u8], height: u32) -> Vec<u8> {
    prefixed(prefix, &height.to_be_bytes())
}

impl RedbAssetStore {
    pub fn open(data_dir: &Path) -> Result<Self, RedbError> {
        std::fs::create_dir_all(data_dir).expect("failed to create data dir");
        let db = Database::create(data_dir.join("asset.redb"))?;
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(CURRENT_TABLE)?;
            write_txn.open_table(UNDO_TABLE)?;
        }
        write_txn.commit()?;
        Ok(RedbAssetStore { db })
    }
}

impl AssetStore for RedbAssetStore {
    type Error = RedbError;

    fn get(&self, table_prefix: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CURRENT_TABLE)?;
        Ok(table.get(prefixed(table_prefix, key).as_slice())?.map(|v| v.value().to_vec()))
    }

    fn put(&self, table_prefix: &[u8], key: &[u8], value: &[u8]) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CURRENT_TABLE)?;
            table.insert(prefixed(table_prefix, key).as_slice(), value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, table_prefix: &[u8], key: &[u8]) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CURRENT_TABLE)?;
            table.remove(prefixed(table_prefix, key).as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_undo(&self, table_prefix: &[u8], height: u32) -> Result<Option<Vec<u8>>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(UNDO_TABLE)?;
        Ok(table.get(undo_key(table_prefix, height).as_slice())?.map(|v| v.value().to_vec()))
    }

    fn put_undo(&self, table_prefix: &[u8], height: u32, payload: &[u8]) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UNDO_TABLE)?;
            table.insert(undo_key(table_prefix, height).as_slice(), payload)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_undo(&self, table_prefix: &[u8], height: u32) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UNDO_TABLE)?;
            table.remove(undo_key(table_prefix, height).as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_keep_families_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbAssetStore::open(dir.path()).unwrap();
        store.put(b"Tc", &[1, 2], b"a").unwrap();
        store.put(b"Fc", &[1, 2], b"b").unwrap();
        assert_eq!(store.get(b"Tc", &[1, 2]).unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.get(b"Fc", &[1, 2]).unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn round_trips_undo_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbAssetStore::open(dir.path()).unwrap();
        store.put_undo(b"M", 5, &[9, 9]).unwrap();
        assert_eq!(store.get_undo(b"M", 5).unwrap(), Some(vec![9, 9]));
        store.delete_undo(b"M", 5).unwrap();
        assert!(store.get_undo(b"M", 5).unwrap().is_none());
    }
}
