use std::path::Path;

use mewc_index_core::store::SuidStore;
use redb::Database;
use redb::Error as RedbError;
use redb::TableDefinition;

const ASSET_TO_ID: TableDefinition<'static, &'static [u8], u32> = TableDefinition::new("asset_to_id");
const ID_TO_ASSET: TableDefinition<'static, u32, &'static [u8]> = TableDefinition::new("id_to_asset");
const H160_TO_ID: TableDefinition<'static, &'static [u8], u32> = TableDefinition::new("h160_to_id");
const ID_TO_H160: TableDefinition<'static, u32, &'static [u8]> = TableDefinition::new("id_to_h160");

/// The bidirectional asset-name/h160 ↔ small-unique-id interning tables, one
/// `redb::Database` with a table per direction per kind.
pub struct RedbSuidStore {
    db: Database,
}

impl RedbSuidStore {
    pub fn open(data_dir: &Path) -> Result<Self, RedbError> {
        std::fs::create_dir_all(data_dir).expect("failed to create data dir");
        let db = Database::create(data_dir.join("suid.redb"))?;
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(ASSET_TO_ID)?;
            write_txn.open_table(ID_TO_ASSET)?;
            write_txn.open_table(H160_TO_ID)?;
            write_txn.open_table(ID_TO_H160)?;
        }
        write_txn.commit()?;
        Ok(RedbSuidStore { db })
    }
}

impl SuidStore for RedbSuidStore {
    type Error = RedbError;

    fn asset_to_id(&self, name: &[u8]) -> Result<Option<u32>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ASSET_TO_ID)?;
        Ok(table.get(name)?.map(|v| v.value()))
    }

    fn id_to_asset(&self, id: u32) -> Result<Option<Vec<u8>>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ID_TO_ASSET)?;
        Ok(table.get(id)?.map(|v| v.value().to_vec()))
    }

    fn put_asset_id(&self, name: &[u8], id: u32) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut asset_to_id = write_txn.open_table(ASSET_TO_ID)?;
            asset_to_id.insert(name, id)?;
            let mut id_to_asset = write_txn.open_table(ID_TO_ASSET)?;
            id_to_asset.insert(id, name)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_asset_id(&self, name: &[u8], id: u32) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut asset_to_id = write_txn.open_table(ASSET_TO_ID)?;
            asset_to_id.remove(name)?;
            let mut id_to_asset = write_txn.open_table(ID_TO_ASSET)?;
            id_to_asset.remove(id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn h160_to_id(&self, h160: &[u8; 20]) -> Result<Option<u32>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(H160_TO_ID)?;
        Ok(table.get(h160.as_slice())?.map(|v| v.value()))
    }

    fn id_to_h160(&self, id: u32) -> Result<Option<[u8; 20]>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ID_TO_H160)?;
        Ok(table.get(id)?.map(|v| v.value().try_into().expect("infallible: always stored as 20 bytes")))
    }

    fn put_h160_id(&self, h160: &[u8; 20], id: u32) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut h160_to_id = write_txn.open_table(H160_TO_ID)?;
            h160_to_id.insert(h160.as_slice(), id)?;
            let mut id_to_h160 = write_txn.open_table(ID_TO_H160)?;
            id_to_h160.insert(id, h160.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_h160_id(&self, h160: &[u8; 20], id: u32) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut h160_to_id = write_txn.open_table(H160_TO_ID)?;
            h160_to_id.remove(h160.as_slice())?;
            let mut id_to_h160 = write_txn.open_table(ID_TO_H160)?;
            id_to_h160.remove(id)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_asset_id_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbSuidStore::open(dir.path()).unwrap();
        store.put_asset_id(b"MEWCCOIN", 42).unwrap();
        assert_eq!(store.asset_to_id(b"MEWCCOIN").unwrap(), Some(42));
        assert_eq!(store.id_to_asset(42).unwrap(), Some(b"MEWCCOIN".to_vec()));
        store.delete_asset_id(b"MEWCCOIN", 42).unwrap();
        assert!(store.asset_to_id(b"MEWCCOIN").unwrap().is_none());
        assert!(store.id_to_asset(42).unwrap().is_none());
    }

    #[test]
    fn round_trips_h160_id_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbSuidStore::open(dir.path()).unwrap();
        let h160 = [9u8; 20];
        store.put_h160_id(&h160, 7).unwrap();
        assert_eq!(store.h160_to_id(&h160).unwrap(), Some(7));
        assert_eq!(store.id_to_h160(7).unwrap(), Some(h160));
        store.delete_h160_id(&h160, 7).unwrap();
        assert!(store.h160_to_id(&h160).unwrap().is_none());
        assert!(store.id_to_h160(7).unwrap().is_none());
    }
}
