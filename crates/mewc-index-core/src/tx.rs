//! Transaction deserializer: wire-format parsing, witness-aware hashing, and
//! the auxiliary-proof-of-work header variant.

use mewc_index_common::DeserializeError;
use mewc_index_common::BASIC_HEADER_LEN;
use mewc_index_common::MINUS_1;
use mewc_index_common::ZERO;
use sha2::Digest;
use sha2::Sha256;

use crate::codec::Cursor;

/// A single transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_hash: [u8; 32],
    pub prev_idx: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    /// An input is generation/coinbase-like iff its previous hash is all
    /// zero and previous index is the sentinel `MINUS_1`.
    pub fn is_generation(&self) -> bool {
        self.prev_idx == MINUS_1 && self.prev_hash == ZERO
    }
}

/// A single transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: i64,
    pub pk_script: Vec<u8>,
}

/// One witness item stack, one per input, only present when the tx carries
/// the `0001` marker+flag.
pub type Witness = Vec<Vec<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
    pub witness: Option<Witness>,
}

impl Tx {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_generation()
    }
}

fn read_input(cur: &mut Cursor<'_>) -> Result<TxInput, DeserializeError> {
    let prev_hash = cur.read_array::<32>()?;
    let prev_idx = cur.read_u32_le()?;
    let script = cur.read_varbytes()?.to_vec();
    let sequence = cur.read_u32_le()?;
    Ok(TxInput {
        prev_hash,
        prev_idx,
        script,
        sequence,
    })
}

fn read_output(cur: &mut Cursor<'_>) -> Result<TxOutput, DeserializeError> {
    let value = cur.read_i64_le()?;
    let pk_script = cur.read_varbytes()?.to_vec();
    Ok(TxOutput { value, pk_script })
}

fn read_many<T>(
    cur: &mut Cursor<'_>,
    reader: impl Fn(&mut Cursor<'_>) -> Result<T, DeserializeError>,
) -> Result<Vec<T>, DeserializeError> {
    let count = cur.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DeserializeError::MalformedVarint)?;
    let mut items = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        items.push(reader(cur)?);
    }
    Ok(items)
}

fn read_witness(cur: &mut Cursor<'_>, input_len: usize) -> Result<Witness, DeserializeError> {
    let mut ret = Vec::with_capacity(input_len);
    for _ in 0..input_len {
        let wit_for_in = cur.read_varint()?;
        let wit_for_in =
            usize::try_from(wit_for_in).map_err(|_| DeserializeError::MalformedVarint)?;
        let mut app_val = Vec::with_capacity(wit_for_in);
        for _ in 0..wit_for_in {
            app_val.push(cur.read_varbytes()?.to_vec());
        }
        ret.push(app_val);
    }
    Ok(ret)
}

/// Deserialize one transaction starting at the cursor's current position.
/// Returns the transaction plus, when a witness marker was present, the
/// canonical (witness-excluding) double-SHA256 hash — the caller must
/// compute the hash itself over the raw byte range when `None` comes back,
/// since the absence of a marker means nothing was excluded.
pub fn read_tx(cur: &mut Cursor<'_>) -> Result<(Tx, Option<[u8; 32]>), DeserializeError> {
    let start = cur.pos();
    let version = cur.read_i32_le()?;
    let mut original = cur.slice_from(start).to_vec();

    let has_witness = cur.peek(2).map(|b| b == [0x00, 0x01]).unwrap_or(false);
    if has_witness {
        let _marker_flag = cur.read_u16_le()?;
    }

    let io_start = cur.pos();
    let inputs = read_many(cur, read_input)?;
    let outputs = read_many(cur, read_output)?;
    original.extend_from_slice(cur.slice_from(io_start));

    let witness = if has_witness {
        Some(read_witness(cur, inputs.len())?)
    } else {
        None
    };

    let lock_start = cur.pos();
    let locktime = cur.read_u32_le()?;
    original.extend_from_slice(cur.slice_from(lock_start));

    let hash = has_witness.then(|| double_sha256(&original));

    Ok((
        Tx {
            version,
            inputs,
            outputs,
            locktime,
            witness,
        },
        hash,
    ))
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Auxiliary-proof-of-work-aware header reader. Returns ONLY the basic
/// 80-byte header to consumers, skipping (but not persisting) the auxpow
/// blob when present.
pub struct AuxPowDeserializer;

const VERSION_AUXPOW: i32 = 1 << 8;

impl AuxPowDeserializer {
    /// Read the basic header at the cursor, advancing past any auxpow blob
    /// that follows. `static_header_size` is the coin's configured
    /// pre-activation header length (normally 80).
    ///
    /// If the version word's auxpow bit is set but the auxpow blob itself
    /// fails to parse, this falls back to treating the block as direct-mined
    /// (an 80-byte header, no blob) rather than erroring — the fallback
    /// never leaves the cursor in a partially-advanced state: on failure the
    /// cursor is restored to just past the basic header.
    pub fn read_header(
        cur: &mut Cursor<'_>,
        static_header_size: usize,
    ) -> Result<Vec<u8>, DeserializeError> {
        let start = cur.pos();
        let version = i32::from_le_bytes(
            cur.peek(4)
                .ok_or(DeserializeError::Truncated {
                    needed: 4,
                    remaining: cur.remaining(),
                })?
                .try_into()
                .unwrap(),
        );

        if version & VERSION_AUXPOW != 0 {
            let basic_header = cur.read_bytes(static_header_size)?.to_vec();
            let after_basic = cur.pos();

            match Self::read_auxpow_blob(cur) {
                Ok(()) => Ok(basic_header),
                Err(_) => {
                    // Direct-mined variant: no auxpow blob follows. Restore
                    // the cursor to just past the basic header and return it
                    // unchanged, the fallback rule for this variant.
                    cur.set_pos(after_basic);
                    Ok(basic_header)
                }
            }
        } else {
            cur.set_pos(start);
            Ok(cur.read_bytes(static_header_size)?.to_vec())
        }
    }

    /// Skip over one CAuxPow blob: a transaction, 32-byte parent hash, a
    /// varint-counted merkle branch, an int32 index, a varint-counted chain
    /// merkle branch, an int32 chain index, and an 80-byte parent header.
    fn read_auxpow_blob(cur: &mut Cursor<'_>) -> Result<(), DeserializeError> {
        let _coinbase_tx = read_tx(cur)?;
        cur.read_bytes(32)?; // parent block hash

        let merkle_size = cur.read_varint()?;
        let merkle_size =
            usize::try_from(merkle_size).map_err(|_| DeserializeError::MalformedVarint)?;
        cur.read_bytes(32 * merkle_size)?; // merkle branch
        cur.read_bytes(4)?; // index

        let chain_merkle_size = cur.read_varint()?;
        let chain_merkle_size =
            usize::try_from(chain_merkle_size).map_err(|_| DeserializeError::MalformedVarint)?;
        cur.read_bytes(32 * chain_merkle_size)?; // chain merkle branch
        cur.read_bytes(4)?; // chain index

        cur.read_bytes(BASIC_HEADER_LEN)?; // parent block header
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1i32.to_le_bytes()); // version
        buf.push(1); // 1 input
        buf.extend_from_slice(&ZERO);
        buf.extend_from_slice(&MINUS_1.to_le_bytes());
        crate::codec::write_varbytes(&mut buf, b"coinbase script");
        buf.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // sequence
        buf.push(1); // 1 output
        buf.extend_from_slice(&5_000_000_000i64.to_le_bytes());
        crate::codec::write_varbytes(&mut buf, b"\x76\xa9");
        buf.extend_from_slice(&0u32.to_le_bytes()); // locktime
        buf
    }

    #[test]
    fn parses_coinbase_without_witness() {
        let bytes = coinbase_bytes();
        let mut cur = Cursor::new(&bytes);
        let (tx, hash) = read_tx(&mut cur).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs[0].value, 5_000_000_000);
        assert!(hash.is_none(), "no witness marker means caller hashes the raw bytes");
        assert_eq!(cur.pos(), bytes.len());
    }

    #[test]
    fn witness_marker_excludes_witness_from_hash() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2i32.to_le_bytes());
        buf.extend_from_slice(&[0x00, 0x01]); // marker + flag
        buf.push(1); // 1 input
        buf.extend_from_slice(&[0xAAu8; 32]);
        buf.extend_from_slice(&0u32.to_le_bytes());
        crate::codec::write_varbytes(&mut buf, b"");
        buf.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        buf.push(1); // 1 output
        buf.extend_from_slice(&1000i64.to_le_bytes());
        crate::codec::write_varbytes(&mut buf, b"\xa9");
        buf.push(1); // 1 witness stack item count for the single input
        crate::codec::write_varbytes(&mut buf, b"sig");
        buf.extend_from_slice(&0u32.to_le_bytes());

        let mut cur = Cursor::new(&buf);
        let (tx, hash) = read_tx(&mut cur).unwrap();
        assert!(tx.witness.is_some());
        assert!(hash.is_some());
        assert_eq!(cur.pos(), buf.len());
    }

    #[test]
    fn auxpow_falls_back_to_direct_mined_header() {
        let mut buf = vec![0u8; 80];
        buf[0..4].copy_from_slice(&(VERSION_AUXPOW | 1).to_le_bytes());
        // No valid auxpow blob follows: parsing the embedded coinbase tx
        // will run past the end of the buffer and fail, triggering fallback.
        let mut cur = Cursor::new(&buf);
        let header = AuxPowDeserializer::read_header(&mut cur, 80).unwrap();
        assert_eq!(header.len(), 80);
        assert_eq!(cur.pos(), 80);
    }

    #[test]
    fn non_auxpow_header_reads_static_length() {
        let buf = vec![0u8; 80];
        let mut cur = Cursor::new(&buf);
        let header = AuxPowDeserializer::read_header(&mut cur, 80).unwrap();
        assert_eq!(header.len(), 80);
    }
}
