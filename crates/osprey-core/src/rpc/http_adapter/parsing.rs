//! Field-level validation of node JSON into the DTOs in [`crate::rpc::types`].

use crate::error::CoreError;
use crate::rpc::types::{Block, RawTransaction, TxOutput};
use crate::types::{Amount, BlockHeight};

pub(super) fn parse_str_required(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<String, CoreError> {
    value
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| CoreError::InvalidData(format!("missing {field}")))
}

pub(super) fn parse_str_optional(value: Option<&serde_json::Value>) -> Option<String> {
    value.and_then(serde_json::Value::as_str).map(str::to_owned)
}

pub(super) fn parse_u64_required(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<u64, CoreError> {
    value
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| CoreError::InvalidData(format!("missing {field}")))
}

pub(super) fn parse_u32_required(
    value: Option<&serde_json::Value>,
    field: &str,
) -> Result<u32, CoreError> {
    let n = parse_u64_required(value, field)?;
    u32::try_from(n).map_err(|_| CoreError::InvalidData(format!("{field} out of range: {n}")))
}

pub(super) fn parse_u64_optional(value: Option<&serde_json::Value>) -> Option<u64> {
    value.and_then(serde_json::Value::as_u64)
}

/// Optional signed height; nodes report `-1` for "not in a block".
pub(super) fn parse_height_optional(value: Option<&serde_json::Value>) -> Option<BlockHeight> {
    value
        .and_then(serde_json::Value::as_i64)
        .filter(|h| *h >= 0)
        .map(|h| BlockHeight(h as u64))
}

/// Parse a monetary amount from a JSON value without ever touching `f64`.
///
/// Numbers go through their textual representation into the exact-decimal
/// parser; strings are parsed directly.
pub(super) fn parse_amount(value: &serde_json::Value) -> Result<Amount, CoreError> {
    match value {
        serde_json::Value::Number(n) => n.to_string().parse(),
        serde_json::Value::String(s) => s.parse(),
        _ => Err(CoreError::InvalidData(format!(
            "expected numeric amount, got: {value}"
        ))),
    }
}

/// Extract destination addresses from a `scriptPubKey` object. Newer nodes
/// report a single `address`, older ones and multisig report `addresses`.
/// Non-address scripts yield an empty list.
fn parse_script_addresses(spk: Option<&serde_json::Value>) -> Vec<String> {
    let Some(spk) = spk else {
        return Vec::new();
    };
    if let Some(addr) = spk.get("address").and_then(serde_json::Value::as_str) {
        return vec![addr.to_owned()];
    }
    spk.get("addresses")
        .and_then(serde_json::Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

pub(super) fn parse_outputs(vout: &[serde_json::Value]) -> Result<Vec<TxOutput>, CoreError> {
    vout.iter()
        .map(|output| {
            let value = parse_amount(
                output
                    .get("value")
                    .ok_or_else(|| CoreError::InvalidData("missing value in vout".into()))?,
            )?;
            let n = parse_u32_required(output.get("n"), "vout.n")?;
            let addresses = parse_script_addresses(output.get("scriptPubKey"));
            Ok(TxOutput {
                value,
                n,
                addresses,
            })
        })
        .collect()
}

/// Parse a verbose `getrawtransaction` / `decoderawtransaction` result.
/// Block height is taken from the response when the node reports it
/// (Zcash-family `height`); otherwise the caller resolves it from the
/// block hash.
pub(super) fn parse_raw_transaction(
    raw: &serde_json::Value,
) -> Result<RawTransaction, CoreError> {
    let txid = parse_str_required(raw.get("txid"), "txid")?;
    let block_hash = parse_str_optional(raw.get("blockhash"));
    let block_height =
        parse_height_optional(raw.get("height")).or_else(|| parse_height_optional(raw.get("blockheight")));
    let confirmations = raw
        .get("confirmations")
        .and_then(serde_json::Value::as_i64)
        .filter(|c| *c >= 0)
        .map(|c| c as u64);

    let vout = raw
        .get("vout")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| CoreError::InvalidData("missing vout array".into()))?;
    let outputs = parse_outputs(vout)?;

    Ok(RawTransaction {
        txid,
        block_hash,
        block_height,
        confirmations,
        outputs,
    })
}

/// Parse a `getblock` verbosity-2 result, stamping block context onto each
/// contained transaction.
pub(super) fn parse_block(raw: &serde_json::Value) -> Result<Block, CoreError> {
    let hash = parse_str_required(raw.get("hash"), "block.hash")?;
    let height = BlockHeight(parse_u64_required(raw.get("height"), "block.height")?);
    let time = parse_u64_optional(raw.get("time"));
    let confirmations = raw
        .get("confirmations")
        .and_then(serde_json::Value::as_i64)
        .filter(|c| *c >= 0)
        .map(|c| c as u64);

    let tx = raw
        .get("tx")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| CoreError::InvalidData("missing tx array in block".into()))?;

    let transactions = tx
        .iter()
        .map(|entry| {
            let mut parsed = parse_raw_transaction(entry)?;
            parsed.block_hash.get_or_insert_with(|| hash.clone());
            parsed.block_height.get_or_insert(height);
            if parsed.confirmations.is_none() {
                parsed.confirmations = confirmations;
            }
            Ok(parsed)
        })
        .collect::<Result<Vec<_>, CoreError>>()?;

    Ok(Block {
        hash,
        height,
        time,
        transactions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_amount_integer() {
        let val = serde_json::json!(1);
        assert_eq!(
            parse_amount(&val).expect("should parse"),
            Amount::from_base_units(Amount::COIN)
        );
    }

    #[test]
    fn parse_amount_fractional_number_is_exact() {
        let val = serde_json::json!(0.00001);
        assert_eq!(
            parse_amount(&val).expect("should parse"),
            Amount::from_base_units(1_000)
        );
    }

    #[test]
    fn parse_amount_string() {
        let val = serde_json::json!("0.5");
        assert_eq!(
            parse_amount(&val).expect("should parse"),
            Amount::from_base_units(50_000_000)
        );
    }

    #[test]
    fn parse_amount_rejects_bool() {
        assert!(parse_amount(&serde_json::json!(true)).is_err());
    }

    #[test]
    fn script_addresses_single_and_plural() {
        let single = serde_json::json!({"address": "bc1qaddr"});
        assert_eq!(parse_script_addresses(Some(&single)), vec!["bc1qaddr"]);

        let plural = serde_json::json!({"addresses": ["t1abc", "t1def"]});
        assert_eq!(parse_script_addresses(Some(&plural)), vec!["t1abc", "t1def"]);

        let opret = serde_json::json!({"type": "nulldata"});
        assert!(parse_script_addresses(Some(&opret)).is_empty());
    }

    #[test]
    fn parse_raw_transaction_mempool_shape() {
        let raw = serde_json::json!({
            "txid": "aa".repeat(32),
            "vout": [
                {"value": 0.25, "n": 0, "scriptPubKey": {"address": "bc1qpay"}},
            ],
        });
        let tx = parse_raw_transaction(&raw).expect("must parse");
        assert!(tx.block_hash.is_none());
        assert!(tx.confirmations.is_none());
        assert_eq!(tx.outputs[0].addresses, vec!["bc1qpay"]);
    }

    #[test]
    fn parse_raw_transaction_zcash_height_minus_one_is_none() {
        let raw = serde_json::json!({
            "txid": "bb".repeat(32),
            "height": -1,
            "vout": [],
        });
        let tx = parse_raw_transaction(&raw).expect("must parse");
        assert!(tx.block_height.is_none());
    }

    #[test]
    fn parse_block_stamps_context_onto_transactions() {
        let raw = serde_json::json!({
            "hash": "cc".repeat(32),
            "height": 120,
            "time": 1_700_000_000,
            "confirmations": 3,
            "tx": [
                {"txid": "dd".repeat(32), "vout": []},
            ],
        });
        let block = parse_block(&raw).expect("must parse");
        assert_eq!(block.height, BlockHeight(120));
        let tx = &block.transactions[0];
        assert_eq!(tx.block_hash.as_deref(), Some(block.hash.as_str()));
        assert_eq!(tx.block_height, Some(BlockHeight(120)));
        assert_eq!(tx.confirmations, Some(3));
    }
}
