use std::path::Path;

use mewc_index_core::state::IndexerState;
use mewc_index_core::store::StateStore;
use redb::Database;
use redb::Error as RedbError;
use redb::TableDefinition;

const STATE_TABLE: TableDefinition<'static, &'static str, &'static [u8]> = TableDefinition::new("state");
const STATE_KEY: &str = "state";
const STATE_LEN: usize = 4 + 32 + 8 + 8 + 8 + 4 + 4 + 1;

fn encode_state(state: &IndexerState) -> [u8; STATE_LEN] {
    let mut out = [0u8; STATE_LEN];
    out[0..4].copy_from_slice(&state.height.to_le_bytes());
    out[4..36].copy_from_slice(&state.tip);
    out[36..44].copy_from_slice(&state.chain_size.to_le_bytes());
    out[44..52].copy_from_slice(&state.utxo_count.to_le_bytes());
    out[52..60].copy_from_slice(&state.tx_count.to_le_bytes());
    out[60..64].copy_from_slice(&state.asset_count.to_le_bytes());
    out[64..68].copy_from_slice(&state.h160_count.to_le_bytes());
    out[68] = u8::from(state.first_sync);
    out
}

fn decode_state(bytes: &[u8]) -> IndexerState {
    assert_eq!(bytes.len(), STATE_LEN, "malformed indexer state record");
    IndexerState {
        height: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        tip: bytes[4..36].try_into().unwrap(),
        chain_size: u64::from_le_bytes(bytes[36..44].try_into().unwrap()),
        utxo_count: u64::from_le_bytes(bytes[44..52].try_into().unwrap()),
        tx_count: u64::from_le_bytes(bytes[52..60].try_into().unwrap()),
        asset_count: u32::from_le_bytes(bytes[60..64].try_into().unwrap()),
        h160_count: u32::from_le_bytes(bytes[64..68].try_into().unwrap()),
        first_sync: bytes[68] != 0,
    }
}

/// The single persisted `IndexerState` row, one small `redb::Database`.
pub struct RedbStateStore {
    db: Database,
}

impl RedbStateStore {
    pub fn open(data_dir: &Path) -> Result<Self, RedbError> {
        std::fs::create_dir_all(data_dir).expect("failed to create data dir");
        let db = Database::create(data_dir.join("state.redb"))?;
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(STATE_TABLE)?;
        }
        write_txn.commit()?;
        Ok(RedbStateStore { db })
    }
}

impl StateStore for RedbStateStore {
    type Error = RedbError;

    fn get_state(&self) -> Result<Option<IndexerState>, Self::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(STATE_TABLE)?;
        Ok(table.get(STATE_KEY)?.map(|v| decode_state(v.value())))
    }

    fn put_state(&self, state: &IndexerState) -> Result<(), Self::Error> {
        let encoded = encode_state(state);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(STATE_TABLE)?;
            table.insert(STATE_KEY, encoded.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_indexer_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStateStore::open(dir.path()).unwrap();
        assert!(store.get_state().unwrap().is_none());

        let state = IndexerState {
            height: 123,
            tip: [9u8; 32],
            chain_size: 456_789,
            utxo_count: 10,
            tx_count: 20,
            asset_count: 3,
            h160_count: 4,
            first_sync: false,
        };
        store.put_state(&state).unwrap();
        assert_eq!(store.get_state().unwrap(), Some(state));
    }
}
