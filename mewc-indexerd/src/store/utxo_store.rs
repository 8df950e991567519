use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use mewc_index_core::advance::decode_utxo_value;
use mewc_index_core::advance::encode_utxo_value;
use mewc_index_core::state::UtxoKey;
use mewc_index_core::state::UtxoValue;
use mewc_index_core::store::UtxoStore;
use redb::Database;
use redb::Error as RedbError;
use redb::TableDefinition;
use spin::Mutex;

const UTXO_TABLE: TableDefinition<'static, &'static [u8], &'static [u8]> = TableDefinition::new("utxo");
const UNDO_TABLE: TableDefinition<'static, u32, &'static [u8]> = TableDefinition::new("utxo_undo");

const UTXO_CACHE_CAPACITY: usize = 100_000;

fn encode_key(key: &UtxoKey) -> [u8; 36] {
    let mut out = [0u8; 36];
    out[0..32].copy_from_slice(&key.tx_hash);
    out[32..36].copy_from_slice(&key.vout.to_le_bytes());
    out
}

pub struct RedbUtxoStore {
    db: Database,
    cache: Mutex<LruCache<UtxoKey, UtxoValue>>,
}

impl RedbUtxoStore {
    pub fn open(data_dir: &Path) -> Result<Self, RedbError> {
        std::fs::create_dir_all(data_dir).expect("failed to create data dir");
        let db = Database::create(data_dir.join("utxo.redb"))?;
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(UTXO_TABLE)?;
            write_txn.open_table(UNDO_TABLE)?;
        }
        write_txn.commit()?;

        Ok(RedbUtxoStore {
            db,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(UTXO_CACHE_CAPACITY).unwrap())),
        })
    }
}

impl UtxoStore for RedbUtxoStore {
    type Error = RedbError;

    fn get_utxo(&self, key: &UtxoKey) -> Result<Option<UtxoValue>, Self::Error> {
        if let Some(value) = self.cache.lock().get(key) {
            return Ok(Some(*value));
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(UTXO_TABLE)?;
        let encoded = encode_key(key);
        match table.get(encoded.as_slice())? {
            Some(bytes) => {
                let value = decode_utxo_value(bytes.value()).expect("infallible: came from encode_utxo_value");
                self.cache.lock().put(*key, value);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_utxo(&self, key: &UtxoKey, value: &UtxoValue) -> Result<(), Self::Error> {
        let encoded_key = encode_key(key);
        let encoded_value = encode_utxo_value(value);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UTXO_TABLE)?;
            table.insert(encoded_key.as_slice(), encoded_value.as_slice())?;
        }
        write_txn.commit()?;
        self.cache.lock().put(*key, *value);
        Ok(())
    }

    fn delete_utxo(&self, key: &UtxoKey) -> Result<(), Self::Error> {
        let encoded = encode_key(key);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UTXO_TABLE)?;
            table.remove(encoded.as_slice())?;
        }
        write_txn.commit()?;
        self.cache.lock().pop(key);
        Ok(())
    }

    fn get_utxo_undo(&self, height: u32) -> Result<Option<Vec<u8>>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(UNDO_TABLE)?;
        Ok(table.get(height)?.map(|v| v.value().to_vec()))
    }

    fn put_utxo_undo(&self, height: u32, payload: &[u8]) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UNDO_TABLE)?;
            table.insert(height, payload)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_utxo_undo(&self, height: u32) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UNDO_TABLE)?;
            table.remove(height)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_utxo() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbUtxoStore::open(dir.path()).unwrap();
        let key = UtxoKey { tx_hash: [7u8; 32], vout: 2 };
        let value = UtxoValue { hash_x: [1u8; 11], tx_num: 9, value: 100, asset_id: 0xFFFF_FFFF };

        assert!(store.get_utxo(&key).unwrap().is_none());
        store.put_utxo(&key, &value).unwrap();
        assert_eq!(store.get_utxo(&key).unwrap(), Some(value));
        store.delete_utxo(&key).unwrap();
        assert!(store.get_utxo(&key).unwrap().is_none());
    }

    #[test]
    fn round_trips_undo_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbUtxoStore::open(dir.path()).unwrap();
        assert!(store.get_utxo_undo(10).unwrap().is_none());
        store.put_utxo_undo(10, &[1, 2, 3]).unwrap();
        assert_eq!(store.get_utxo_undo(10).unwrap(), Some(vec![1, 2, 3]));
        store.delete_utxo_undo(10).unwrap();
        assert!(store.get_utxo_undo(10).unwrap().is_none());
    }
}
