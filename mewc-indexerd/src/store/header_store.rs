use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use mewc_index_core::state::HashX;
use mewc_index_core::store::HeaderStore;
use redb::Database;
use redb::Error as RedbError;
use redb::TableDefinition;
use spin::Mutex;

const HEADERS_TABLE: TableDefinition<'static, u32, &'static [u8]> = TableDefinition::new("headers");
const HISTORY_TABLE: TableDefinition<'static, u64, &'static [u8]> = TableDefinition::new("history");
const META_TABLE: TableDefinition<'static, &'static str, u64> = TableDefinition::new("header_meta");

const HEADER_CACHE_CAPACITY: usize = 4_000;
const MAX_HEIGHT_KEY: &str = "max_height";
const NEXT_HISTORY_SEQ_KEY: &str = "next_history_seq";

/// Encodes one transaction's history-index record: hash ∥ hashX count ∥ hashXs.
fn encode_history_record(tx_hash: &[u8; 32], hashxs: &[HashX]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 2 + hashxs.len() * 11);
    out.extend_from_slice(tx_hash);
    out.extend_from_slice(&(hashxs.len() as u16).to_le_bytes());
    for hashx in hashxs {
        out.extend_from_slice(hashx);
    }
    out
}

/// The file-system header store and history index, backed by `redb` rather
/// than raw flat files (the teacher's own chain store does the same for its
/// header table). Header records are keyed directly by height; the history
/// index is append-only and keyed by a monotonic sequence number, since a
/// single flush batch may span several blocks and no longer carries a
/// per-height tx-count boundary by the time it reaches this store.
///
/// `truncate_to` rolls back the header table to the given height. The
/// history index is left untouched across a reorg: it is a supplementary
/// lookup aid, not a source of truth, and the UTXO/asset stores are what
/// `ReorgDriver` actually restores via undo.
pub struct FileHeaderStore {
    db: Database,
    header_cache: Mutex<LruCache<u32, Vec<u8>>>,
}

impl FileHeaderStore {
    pub fn open(data_dir: &Path) -> Result<Self, RedbError> {
        std::fs::create_dir_all(data_dir).expect("failed to create data dir");
        let db = Database::create(data_dir.join("headers.redb"))?;
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(HEADERS_TABLE)?;
            write_txn.open_table(HISTORY_TABLE)?;
            write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(FileHeaderStore {
            db,
            header_cache: Mutex::new(LruCache::new(NonZeroUsize::new(HEADER_CACHE_CAPACITY).unwrap())),
        })
    }

    fn meta_get(&self, key: &str) -> Result<Option<u64>, RedbError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value()))
    }

    fn meta_put(&self, key: &str, value: u64) -> Result<(), RedbError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl HeaderStore for FileHeaderStore {
    type Error = RedbError;

    fn append_header(&self, height: u32, header: &[u8]) -> Result<(), Self::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HEADERS_TABLE)?;
            table.insert(height, header)?;
        }
        write_txn.commit()?;
        self.header_cache.lock().put(height, header.to_vec());

        let should_advance = match self.meta_get(MAX_HEIGHT_KEY)? {
            Some(max_height) => height as u64 >= max_height,
            None => true,
        };
        if should_advance {
            self.meta_put(MAX_HEIGHT_KEY, height as u64)?;
        }
        Ok(())
    }

    fn header_at(&self, height: u32) -> Result<Option<Vec<u8>>, Self::Error> {
        if let Some(header) = self.header_cache.lock().get(&height) {
            return Ok(Some(header.clone()));
        }

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HEADERS_TABLE)?;
        match table.get(height)? {
            Some(bytes) => {
                let header = bytes.value().to_vec();
                self.header_cache.lock().put(height, header.clone());
                Ok(Some(header))
            }
            None => Ok(None),
        }
    }

    fn append_history(&self, tx_hashes: &[[u8; 32]], tx_hashxs: &[Vec<HashX>]) -> Result<(), Self::Error> {
        let mut next_seq = self.meta_get(NEXT_HISTORY_SEQ_KEY)?.unwrap_or(0);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HISTORY_TABLE)?;
            for (tx_hash, hashxs) in tx_hashes.iter().zip(tx_hashxs.iter()) {
                let record = encode_history_record(tx_hash, hashxs);
                table.insert(next_seq, record.as_slice())?;
                next_seq += 1;
            }
        }
        write_txn.commit()?;
        self.meta_put(NEXT_HISTORY_SEQ_KEY, next_seq)?;
        Ok(())
    }

    fn truncate_to(&self, height: u32) -> Result<(), Self::Error> {
        let max_height = match self.meta_get(MAX_HEIGHT_KEY)? {
            Some(h) => h,
            None => return Ok(()),
        };

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HEADERS_TABLE)?;
            let mut h = max_height;
            while h > height as u64 {
                table.remove(h as u32)?;
                h -= 1;
            }
        }
        write_txn.commit()?;

        let mut cache = self.header_cache.lock();
        let mut h = max_height;
        while h > height as u64 {
            cache.pop(&(h as u32));
            h -= 1;
        }
        drop(cache);

        self.meta_put(MAX_HEIGHT_KEY, height as u64)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHeaderStore::open(dir.path()).unwrap();
        store.append_header(10, &[1u8; 80]).unwrap();
        assert_eq!(store.header_at(10).unwrap(), Some(vec![1u8; 80]));
        assert!(store.header_at(11).unwrap().is_none());
    }

    #[test]
    fn truncate_to_drops_headers_above_height() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHeaderStore::open(dir.path()).unwrap();
        for h in 1..=5u32 {
            store.append_header(h, &[h as u8; 80]).unwrap();
        }
        store.truncate_to(2).unwrap();
        assert!(store.header_at(3).unwrap().is_none());
        assert!(store.header_at(5).unwrap().is_none());
        assert_eq!(store.header_at(2).unwrap(), Some(vec![2u8; 80]));
    }

    #[test]
    fn appends_history_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHeaderStore::open(dir.path()).unwrap();
        let hashes = vec![[1u8; 32], [2u8; 32]];
        let hashxs = vec![vec![[3u8; 11]], vec![]];
        store.append_history(&hashes, &hashxs).unwrap();
        assert_eq!(store.meta_get(NEXT_HISTORY_SEQ_KEY).unwrap(), Some(2));
    }
}
