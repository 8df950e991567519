//! Asset script recognizer: pattern-matches output scripts against
//! the asset grammar and extracts the operations the advance engine needs.
//!
//! Scripts are walked byte-by-byte rather than through `bitcoin::Script`'s
//! instruction iterator: `OP_MEWC_ASSET` and its companion opcodes are
//! chain-specific and unknown to that iterator, and a malformed push must
//! degrade to "hash the output as-is", never to a hard error.

use mewc_index_common::consts::ASSET_MAGIC;
use mewc_index_common::consts::DIVISIONS_UNCHANGED;
use mewc_index_common::consts::OWNERSHIP_ASSET_SUPPLY;

use crate::codec::Cursor;

/// The chain-specific opcode marking the start of an asset payload.
pub const OP_MEWC_ASSET: u8 = 0xc0;
/// `OP_RESERVED`, used as a spacer byte inside the null-asset verifier and
/// freeze templates.
pub const OP_RESERVED: u8 = 0x50;

/// A parsed script instruction: either a single-byte opcode or a push of
/// `n` literal bytes (direct push, `OP_PUSHDATA1/2/4`).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Instr<'a> {
    Op(u8),
    Push(&'a [u8]),
}

/// Walk `script` into instructions, stopping (returning what was parsed so
/// far) on the first malformed push rather than erroring — a malformed
/// script is a normal, expected input here.
fn walk(script: &[u8]) -> Vec<Instr<'_>> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < script.len() {
        let op = script[i];
        match op {
            0x01..=0x4b => {
                let len = op as usize;
                if i + 1 + len > script.len() {
                    break;
                }
                out.push(Instr::Push(&script[i + 1..i + 1 + len]));
                i += 1 + len;
            }
            0x4c => {
                if i + 2 > script.len() {
                    break;
                }
                let len = script[i + 1] as usize;
                if i + 2 + len > script.len() {
                    break;
                }
                out.push(Instr::Push(&script[i + 2..i + 2 + len]));
                i += 2 + len;
            }
            0x4d => {
                if i + 3 > script.len() {
                    break;
                }
                let len = u16::from_le_bytes([script[i + 1], script[i + 2]]) as usize;
                if i + 3 + len > script.len() {
                    break;
                }
                out.push(Instr::Push(&script[i + 3..i + 3 + len]));
                i += 3 + len;
            }
            0x4e => {
                if i + 5 > script.len() {
                    break;
                }
                let len =
                    u32::from_le_bytes(script[i + 1..i + 5].try_into().unwrap()) as usize;
                if i + 5 + len > script.len() {
                    break;
                }
                out.push(Instr::Push(&script[i + 5..i + 5 + len]));
                i += 5 + len;
            }
            _ => {
                out.push(Instr::Op(op));
                i += 1;
            }
        }
    }
    out
}

/// Byte offset of the first `OP_MEWC_ASSET` opcode in `script`, respecting
/// push lengths so a literal `0xc0` inside push data is never mistaken for
/// the opcode. `None` if the walk never encounters it.
fn find_op_mewc_asset(script: &[u8]) -> Option<usize> {
    let mut i = 0usize;
    while i < script.len() {
        let op = script[i];
        if op == OP_MEWC_ASSET {
            return Some(i);
        }
        match op {
            0x01..=0x4b => {
                let len = op as usize;
                if i + 1 + len > script.len() {
                    return None;
                }
                i += 1 + len;
            }
            0x4c => {
                if i + 2 > script.len() {
                    return None;
                }
                let len = script[i + 1] as usize;
                i += 2 + len;
            }
            0x4d => {
                if i + 3 > script.len() {
                    return None;
                }
                let len = u16::from_le_bytes([script[i + 1], script[i + 2]]) as usize;
                i += 3 + len;
            }
            0x4e => {
                if i + 5 > script.len() {
                    return None;
                }
                let len = u32::from_le_bytes(script[i + 1..i + 5].try_into().unwrap()) as usize;
                i += 5 + len;
            }
            _ => i += 1,
        }
    }
    None
}

/// The asset blob's script-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetScriptType {
    Ownership,
    Issuance,
    Reissuance,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceBlob {
    pub name: Vec<u8>,
    pub supply: u64,
    pub divisions: u8,
    pub reissuable: bool,
    pub associated_data: Option<[u8; 34]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReissuanceBlob {
    pub name: Vec<u8>,
    pub supply_delta: u64,
    /// `DIVISIONS_UNCHANGED` (0xff) means "inherit the prior value".
    pub divisions: u8,
    /// The freshly-read reissuable byte off the wire; the asset becomes
    /// permanently non-reissuable once a reissuance writes `false` here.
    pub reissuable: bool,
    /// `None` means "inherit the prior associated data".
    pub associated_data: Option<[u8; 34]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBlob {
    pub name: Vec<u8>,
    pub amount: u64,
    pub broadcast: Option<BroadcastPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPayload {
    pub data_hash: [u8; 34],
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipBlob {
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetBlob {
    Ownership(OwnershipBlob),
    Issuance(IssuanceBlob),
    Reissuance(ReissuanceBlob),
    Transfer(TransferBlob),
}

impl AssetBlob {
    pub fn name(&self) -> &[u8] {
        match self {
            AssetBlob::Ownership(b) => &b.name,
            AssetBlob::Issuance(b) => &b.name,
            AssetBlob::Reissuance(b) => &b.name,
            AssetBlob::Transfer(b) => &b.name,
        }
    }
}

/// Result of recognizing a single output script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognized {
    /// Output 0 null-asset tag: tags `h160` with qualifier `name`.
    NullAssetTag {
        h160: [u8; 20],
        name: Vec<u8>,
        flag: u8,
    },
    /// Output 0 null-asset verifier-string assignment (not yet committed;
    /// the advance engine commits it only once a restricted-asset output in
    /// the same transaction is also seen).
    NullAssetVerifier { verifier_string: Vec<u8> },
    /// Output 0 null-asset global freeze toggle.
    NullAssetFreeze { name: Vec<u8>, flag: u8 },
    /// A normal value-bearing asset output.
    AssetOutput {
        /// The non-asset script prefix the hashX is computed over.
        prefix: Vec<u8>,
        blob: AssetBlob,
    },
    /// No `OP_MEWC_ASSET` opcode found; this is an ordinary native-coin
    /// output. The caller hashes the whole script.
    NoAsset,
    /// `OP_MEWC_ASSET` was found but the blob after it didn't parse even
    /// after the iterative rescan; hashed as-is with `NULL_U32` asset id
    /// (an asset-creation output followed by its transfer output).
    Malformed,
}

/// Parse one output's script per the asset-opcode grammar. `output_index` gates the
/// null-asset templates, which are only recognized at vout 0.
pub fn recognize(script: &[u8], output_index: u32) -> Recognized {
    if output_index == 0 {
        if let Some(r) = try_null_asset_templates(script) {
            return r;
        }
    }

    let Some(op_ptr) = find_op_mewc_asset(script) else {
        return Recognized::NoAsset;
    };

    if let Some(blob) = try_parse_asset_blob(&script[op_ptr + 1..]) {
        return Recognized::AssetOutput {
            prefix: script[..op_ptr].to_vec(),
            blob,
        };
    }

    // Iterative fallback: an intervening opcode was likely mis-parsed as
    // data. Rescan forward for the next `rvn` magic occurrence and retry.
    if let Some(rescanned) = try_parse_asset_iterative(&script[op_ptr..]) {
        return Recognized::AssetOutput {
            prefix: script[..op_ptr].to_vec(),
            blob: rescanned,
        };
    }

    Recognized::Malformed
}

fn try_null_asset_templates(script: &[u8]) -> Option<Recognized> {
    let instrs = walk(script);
    match instrs.as_slice() {
        [Instr::Op(a), Instr::Push(h160), Instr::Push(payload)]
            if *a == OP_MEWC_ASSET && h160.len() == 20 =>
        {
            let (name, flag) = split_name_and_flag(payload)?;
            let mut h160_arr = [0u8; 20];
            h160_arr.copy_from_slice(h160);
            Some(Recognized::NullAssetTag {
                h160: h160_arr,
                name,
                flag,
            })
        }
        [Instr::Op(a), Instr::Op(b), Instr::Push(payload)]
            if *a == OP_MEWC_ASSET && *b == OP_RESERVED =>
        {
            Some(Recognized::NullAssetVerifier {
                verifier_string: payload.to_vec(),
            })
        }
        [Instr::Op(a), Instr::Op(b), Instr::Op(c), Instr::Push(payload)]
            if *a == OP_MEWC_ASSET && *b == OP_RESERVED && *c == OP_RESERVED =>
        {
            let (name, flag) = split_name_and_flag(payload)?;
            Some(Recognized::NullAssetFreeze { name, flag })
        }
        _ => None,
    }
}

fn split_name_and_flag(payload: &[u8]) -> Option<(Vec<u8>, u8)> {
    let mut cur = Cursor::new(payload);
    let name = cur.read_varbytes().ok()?.to_vec();
    let flag = cur.read_bytes(1).ok()?[0];
    Some((name, flag))
}

/// Parse the bytes immediately after `OP_MEWC_ASSET` as a single push
/// containing the asset blob.
fn try_parse_asset_blob(after_opcode: &[u8]) -> Option<AssetBlob> {
    let mut cur = Cursor::new(after_opcode);
    let push = cur.read_varbytes().ok()?;
    parse_blob_bytes(push)
}

fn parse_blob_bytes(blob: &[u8]) -> Option<AssetBlob> {
    let mut cur = Cursor::new(blob);
    let magic = cur.read_bytes(3).ok()?;
    if magic != ASSET_MAGIC {
        return None;
    }
    let script_type = cur.read_bytes(1).ok()?[0];
    let name = cur.read_varbytes().ok()?.to_vec();

    match script_type {
        b'o' => Some(AssetBlob::Ownership(OwnershipBlob { name })),
        b'q' => {
            let supply = cur.read_u64_le().ok()?;
            let divisions = cur.read_bytes(1).ok()?[0];
            let reissuable = cur.read_bytes(1).ok()?[0] != 0;
            let has_data = cur.read_bytes(1).ok()?[0] != 0;
            let associated_data = if has_data {
                Some(cur.read_array::<34>().ok()?)
            } else {
                None
            };
            Some(AssetBlob::Issuance(IssuanceBlob {
                name,
                supply,
                divisions,
                reissuable,
                associated_data,
            }))
        }
        b'r' => {
            let supply_delta = cur.read_u64_le().ok()?;
            let divisions = cur.read_bytes(1).ok()?[0];
            let reissuable = cur.read_bytes(1).ok()?[0] != 0;
            let associated_data = if cur.is_finished() {
                None
            } else {
                Some(cur.read_array::<34>().ok()?)
            };
            Some(AssetBlob::Reissuance(ReissuanceBlob {
                name,
                supply_delta,
                divisions,
                reissuable,
                associated_data,
            }))
        }
        b't' => {
            let amount = cur.read_u64_le().ok()?;
            let broadcast = if cur.is_finished() {
                None
            } else {
                let data_hash = cur.read_array::<34>().ok()?;
                let timestamp = if cur.is_finished() {
                    None
                } else {
                    Some(cur.read_u64_le().ok()?)
                };
                Some(BroadcastPayload {
                    data_hash,
                    timestamp,
                })
            };
            Some(AssetBlob::Transfer(TransferBlob {
                name,
                amount,
                broadcast,
            }))
        }
        _ => None,
    }
}

/// Scan forward byte-by-byte inside `from_op_mewc_asset` for the next `rvn`
/// magic occurrence and retry the blob parse from there. Mirrors
/// `try_parse_asset_iterative` in the reference implementation: it recovers
/// from the common case where an opcode between `OP_MEWC_ASSET` and the
/// real blob was mis-walked as push data.
fn try_parse_asset_iterative(from_op_mewc_asset: &[u8]) -> Option<AssetBlob> {
    let haystack = &from_op_mewc_asset[1.min(from_op_mewc_asset.len())..];
    for start in 0..haystack.len().saturating_sub(ASSET_MAGIC.len()) {
        if &haystack[start..start + ASSET_MAGIC.len()] == ASSET_MAGIC {
            if let Some(blob) = parse_blob_bytes(&haystack[start..]) {
                return Some(blob);
            }
        }
    }
    None
}

/// Transfer-broadcast eligibility: only for names containing `!` or `~`,
/// and only when the output's own hashX also saw this asset id among its
/// transaction's inputs.
pub fn is_broadcast_eligible_name(name: &[u8]) -> bool {
    name.contains(&b'!') || name.contains(&b'~')
}

/// Fixed ownership-token record: supply is always 100,000,000 base units,
/// zero divisions, not reissuable, no associated data.
pub fn ownership_supply() -> u64 {
    OWNERSHIP_ASSET_SUPPLY
}

pub fn divisions_is_unchanged(divisions: u8) -> bool {
    divisions == DIVISIONS_UNCHANGED
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(out: &mut Vec<u8>, data: &[u8]) {
        assert!(data.len() < 0x4c);
        out.push(data.len() as u8);
        out.extend_from_slice(data);
    }

    #[test]
    fn recognizes_ownership_asset_output() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&ASSET_MAGIC);
        blob.push(b'o');
        crate::codec::write_varbytes(&mut blob, b"FOO");

        let mut script = Vec::new();
        push(&mut script, b"\x76\xa9"); // pretend prefix
        script.push(OP_MEWC_ASSET);
        push(&mut script, &blob);

        match recognize(&script, 1) {
            Recognized::AssetOutput { blob, .. } => match blob {
                AssetBlob::Ownership(o) => assert_eq!(o.name, b"FOO"),
                _ => panic!("wrong blob variant"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn recognizes_null_asset_tag_template() {
        let h160 = [0x11u8; 20];
        let mut payload = Vec::new();
        crate::codec::write_varbytes(&mut payload, b"#QUAL");
        payload.push(1); // flag = set

        let mut script = Vec::new();
        script.push(OP_MEWC_ASSET);
        push(&mut script, &h160);
        push(&mut script, &payload);

        match recognize(&script, 0) {
            Recognized::NullAssetTag { h160: got, name, flag } => {
                assert_eq!(got, h160);
                assert_eq!(name, b"#QUAL");
                assert_eq!(flag, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_push_length_falls_back_to_no_asset() {
        // Claims 0x4c (PUSHDATA1) with a length byte pointing past the end.
        let script = vec![0x4c, 0xff, 0x01, 0x02];
        assert_eq!(recognize(&script, 1), Recognized::NoAsset);
    }

    #[test]
    fn asset_opcode_with_garbage_blob_is_malformed_not_fatal() {
        let mut script = Vec::new();
        script.push(OP_MEWC_ASSET);
        push(&mut script, b"not an asset blob at all");
        assert_eq!(recognize(&script, 1), Recognized::Malformed);
    }

    #[test]
    fn script_without_asset_opcode_is_no_asset() {
        let script = vec![0x76, 0xa9, 0x88, 0xac];
        assert_eq!(recognize(&script, 1), Recognized::NoAsset);
    }

    fn blob(script_type: u8, name: &[u8], fields: &[u8]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&ASSET_MAGIC);
        blob.push(script_type);
        crate::codec::write_varbytes(&mut blob, name);
        blob.extend_from_slice(fields);
        blob
    }

    fn asset_script(b: &[u8]) -> Vec<u8> {
        let mut script = Vec::new();
        script.push(OP_MEWC_ASSET);
        push(&mut script, b);
        script
    }

    #[test]
    fn recognizes_issuance_with_associated_data() {
        let mut fields = Vec::new();
        fields.extend_from_slice(&1000u64.to_le_bytes());
        fields.push(4); // divisions
        fields.push(1); // reissuable
        fields.push(1); // has associated data
        fields.extend_from_slice(&[0x42u8; 34]);
        let script = asset_script(&blob(b'q', b"FOO", &fields));

        match recognize(&script, 1) {
            Recognized::AssetOutput { blob: AssetBlob::Issuance(i), .. } => {
                assert_eq!(i.name, b"FOO");
                assert_eq!(i.supply, 1000);
                assert_eq!(i.divisions, 4);
                assert!(i.reissuable);
                assert_eq!(i.associated_data, Some([0x42u8; 34]));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // Reissuance blob has no flag byte: `reissuable` is a plain value read
    // straight off the wire, and the ipfs hash is only present when the
    // blob isn't exhausted after it.
    #[test]
    fn recognizes_reissuance_without_associated_data() {
        let mut fields = Vec::new();
        fields.extend_from_slice(&500u64.to_le_bytes());
        fields.push(DIVISIONS_UNCHANGED);
        fields.push(1); // reissuable
        let script = asset_script(&blob(b'r', b"FOO", &fields));

        match recognize(&script, 1) {
            Recognized::AssetOutput { blob: AssetBlob::Reissuance(r), .. } => {
                assert_eq!(r.supply_delta, 500);
                assert_eq!(r.divisions, DIVISIONS_UNCHANGED);
                assert!(r.reissuable);
                assert_eq!(r.associated_data, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn recognizes_reissuance_that_finalizes_and_sets_ipfs() {
        let mut fields = Vec::new();
        fields.extend_from_slice(&0u64.to_le_bytes());
        fields.push(DIVISIONS_UNCHANGED);
        fields.push(0); // reissuable = false, finalizes the asset
        fields.extend_from_slice(&[0x99u8; 34]);
        let script = asset_script(&blob(b'r', b"FOO", &fields));

        match recognize(&script, 1) {
            Recognized::AssetOutput { blob: AssetBlob::Reissuance(r), .. } => {
                assert!(!r.reissuable);
                assert_eq!(r.associated_data, Some([0x99u8; 34]));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // The common transfer shape: amount only, blob ends right there. No
    // flag bytes gate this; presence is purely `is_finished()`.
    #[test]
    fn recognizes_plain_transfer_with_no_broadcast() {
        let fields = 250u64.to_le_bytes();
        let script = asset_script(&blob(b't', b"FOO", &fields));

        match recognize(&script, 1) {
            Recognized::AssetOutput { blob: AssetBlob::Transfer(t), .. } => {
                assert_eq!(t.amount, 250);
                assert_eq!(t.broadcast, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn recognizes_transfer_with_broadcast_and_timestamp() {
        let mut fields = Vec::new();
        fields.extend_from_slice(&250u64.to_le_bytes());
        fields.extend_from_slice(&[0x11u8; 34]);
        fields.extend_from_slice(&1_700_000_000u64.to_le_bytes());
        let script = asset_script(&blob(b't', b"FOO!", &fields));

        match recognize(&script, 1) {
            Recognized::AssetOutput { blob: AssetBlob::Transfer(t), .. } => {
                assert_eq!(t.amount, 250);
                let broadcast = t.broadcast.expect("broadcast payload present");
                assert_eq!(broadcast.data_hash, [0x11u8; 34]);
                assert_eq!(broadcast.timestamp, Some(1_700_000_000));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn recognizes_transfer_with_broadcast_but_no_timestamp() {
        let mut fields = Vec::new();
        fields.extend_from_slice(&250u64.to_le_bytes());
        fields.extend_from_slice(&[0x22u8; 34]);
        let script = asset_script(&blob(b't', b"FOO!", &fields));

        match recognize(&script, 1) {
            Recognized::AssetOutput { blob: AssetBlob::Transfer(t), .. } => {
                let broadcast = t.broadcast.expect("broadcast payload present");
                assert_eq!(broadcast.data_hash, [0x22u8; 34]);
                assert_eq!(broadcast.timestamp, None);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
