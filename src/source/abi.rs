//! Minimal ABI codec for the market contract's events and its one view call.
//!
//! Only static types appear in these events, so every argument occupies one
//! 32-byte word. Indexed arguments arrive in `topics[1..]`, the rest in `data`;
//! the contract declares indexed arguments first, so topics followed by data
//! words yields the arguments in declaration order.

use crate::error::{AppError, Result};
use crate::types::EventKind;

pub type Word = [u8; 32];

/// keccak256("DTFCreated(uint256,address,uint256,bool,address,address)")
pub const TOPIC_MARKET_CREATED: &str =
    "0x4ae700afaed50ad675516244132e60887c6c7a8e638a80ad3e9fa3e3aca51463";
/// keccak256("SharesPurchased(uint256,bool,uint256)")
pub const TOPIC_SHARES_PURCHASED: &str =
    "0x5998e6c3dce1b887c23c4c8b0924a97adda19a8064ef7eb61dc162682eda1138";
/// keccak256("DTFSettled(uint256,bool)")
pub const TOPIC_MARKET_SETTLED: &str =
    "0xe2ff5ba6cf8380e2dd9ac8a6307bcf165a729d3d68cc4d5f5ab41556afb7415d";
/// keccak256("TokensWithdrawn(uint256,address,uint256)")
pub const TOPIC_TOKENS_WITHDRAWN: &str =
    "0x3f5fbaf86658fdadee77f1d46e7f8a72424ad9839eda6a1dc6eb0a4228e4226e";

/// First four bytes of keccak256("getSharePrices(uint256)").
pub const GET_SHARE_PRICES_SELECTOR: &str = "0x27ce8c51";

pub fn topic_for(kind: EventKind) -> &'static str {
    match kind {
        EventKind::MarketCreated => TOPIC_MARKET_CREATED,
        EventKind::SharesPurchased => TOPIC_SHARES_PURCHASED,
        EventKind::MarketSettled => TOPIC_MARKET_SETTLED,
        EventKind::TokensWithdrawn => TOPIC_TOKENS_WITHDRAWN,
    }
}

pub fn kind_for_topic(topic: &str) -> Option<EventKind> {
    EventKind::ALL
        .into_iter()
        .find(|k| topic_for(*k).eq_ignore_ascii_case(topic))
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(strip_0x(s)).map_err(|e| AppError::Decode(format!("bad hex {s:?}: {e}")))
}

/// Splits ABI-encoded bytes into 32-byte words.
pub fn words(bytes: &[u8]) -> Result<Vec<Word>> {
    if bytes.len() % 32 != 0 {
        return Err(AppError::Decode(format!(
            "data length {} is not a multiple of 32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(32)
        .map(|c| {
            let mut w = [0u8; 32];
            w.copy_from_slice(c);
            w
        })
        .collect())
}

/// Argument words of a log: indexed topics first, then data.
pub fn log_words(topics: &[String], data: &str) -> Result<Vec<Word>> {
    let mut out = Vec::new();
    for topic in topics.iter().skip(1) {
        out.extend(words(&decode_hex(topic)?)?);
    }
    out.extend(words(&decode_hex(data)?)?);
    Ok(out)
}

pub fn word_to_u128(w: &Word) -> Result<u128> {
    if w[..16].iter().any(|b| *b != 0) {
        return Err(AppError::Decode(format!(
            "uint256 0x{} does not fit in 128 bits",
            hex::encode(w)
        )));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&w[16..]);
    Ok(u128::from_be_bytes(buf))
}

/// Market ids and similar small uints; rejects anything that will not fit a
/// SQLite INTEGER.
pub fn word_to_i64(w: &Word) -> Result<i64> {
    let v = word_to_u128(w)?;
    i64::try_from(v).map_err(|_| AppError::Decode(format!("uint256 {v} does not fit in i64")))
}

pub fn word_to_bool(w: &Word) -> Result<bool> {
    match word_to_u128(w)? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(AppError::Decode(format!("bool word holds {v}"))),
    }
}

/// Lower-cased, 0x-prefixed.
pub fn word_to_address(w: &Word) -> Result<String> {
    if w[..12].iter().any(|b| *b != 0) {
        return Err(AppError::Decode(format!(
            "address word has dirty high bytes: 0x{}",
            hex::encode(w)
        )));
    }
    Ok(format!("0x{}", hex::encode(&w[12..])))
}

pub fn uint_word(v: u128) -> Word {
    let mut w = [0u8; 32];
    w[16..].copy_from_slice(&v.to_be_bytes());
    w
}

pub fn bool_word(v: bool) -> Word {
    uint_word(u128::from(v))
}

pub fn address_word(addr: &str) -> Result<Word> {
    let bytes = decode_hex(addr)?;
    if bytes.len() != 20 {
        return Err(AppError::Decode(format!("address {addr} is not 20 bytes")));
    }
    let mut w = [0u8; 32];
    w[12..].copy_from_slice(&bytes);
    Ok(w)
}

pub fn encode_words(ws: &[Word]) -> String {
    let mut out = String::with_capacity(2 + ws.len() * 64);
    out.push_str("0x");
    for w in ws {
        out.push_str(&hex::encode(w));
    }
    out
}

/// Calldata for `getSharePrices(uint256 dtfId)`.
pub fn share_prices_calldata(market_id: i64) -> String {
    let arg = encode_words(&[uint_word(market_id as u128)]);
    format!("{GET_SHARE_PRICES_SELECTOR}{}", &arg[2..])
}

/// Decodes the `(uint256 yesPrice, uint256 noPrice)` return value.
pub fn decode_share_prices(ret: &str) -> Result<(u128, u128)> {
    let ws = words(&decode_hex(ret)?)?;
    match ws.as_slice() {
        [yes, no, ..] => Ok((word_to_u128(yes)?, word_to_u128(no)?)),
        _ => Err(AppError::Decode(format!(
            "getSharePrices returned {} words, expected 2",
            ws.len()
        ))),
    }
}
