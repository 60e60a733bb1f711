//! Minimal Solidity ABI encoding for the calls the bots make.
//!
//! Only static 32-byte words and one-dimensional dynamic arrays of static
//! elements are supported. That covers `balanceOf(address)`, the
//! zero-argument views and `distributeDividendsAdjusted(address[],uint256[])`.

use sha3::{Digest, Keccak256};

use crate::address::Address;
use crate::ledger::LedgerError;

/// Size of one ABI word.
pub const WORD: usize = 32;

/// Keccak-256 of `data`.
#[must_use]
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 4-byte function selector for a canonical signature such as `balanceOf(address)`.
#[must_use]
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Event topic for a canonical event signature.
#[must_use]
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

/// Left-pads an address into a word.
#[must_use]
pub fn encode_address(address: &Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(address.as_bytes());
    word
}

/// Big-endian `uint256` word for a `u128` value.
#[must_use]
pub fn encode_u128(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn encode_len(len: usize) -> [u8; WORD] {
    encode_u128(len as u128)
}

/// Encodes a call with static arguments only.
#[must_use]
pub fn encode_call(selector: [u8; 4], args: &[[u8; WORD]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + args.len() * WORD);
    out.extend_from_slice(&selector);
    for arg in args {
        out.extend_from_slice(arg);
    }
    out
}

/// Encodes `f(address[],uint256[])`.
pub fn encode_address_amount_arrays(
    selector: [u8; 4],
    addresses: &[Address],
    amounts: &[u128],
) -> Result<Vec<u8>, LedgerError> {
    if addresses.len() != amounts.len() {
        return Err(LedgerError::InvalidRequest(format!(
            "addresses ({}) and amounts ({}) differ in length",
            addresses.len(),
            amounts.len()
        )));
    }

    let n = addresses.len();
    // Two head words, then [len, items...] for each array.
    let first_offset = 2 * WORD;
    let second_offset = first_offset + (1 + n) * WORD;

    let mut out = Vec::with_capacity(4 + (2 + 2 * (1 + n)) * WORD);
    out.extend_from_slice(&selector);
    out.extend_from_slice(&encode_len(first_offset));
    out.extend_from_slice(&encode_len(second_offset));

    out.extend_from_slice(&encode_len(n));
    for address in addresses {
        out.extend_from_slice(&encode_address(address));
    }

    out.extend_from_slice(&encode_len(n));
    for amount in amounts {
        out.extend_from_slice(&encode_u128(*amount));
    }

    Ok(out)
}

/// Decodes a `0x`-prefixed hex string into bytes.
pub fn decode_hex(data: &str) -> Result<Vec<u8>, LedgerError> {
    let body = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(body).map_err(|e| LedgerError::Decode(format!("invalid hex '{}': {}", data, e)))
}

/// Decodes the first word of `data` as a `uint256` that must fit in `u128`.
pub fn decode_u128(data: &[u8]) -> Result<u128, LedgerError> {
    if data.len() < WORD {
        return Err(LedgerError::Decode(format!(
            "expected at least {} bytes, got {}",
            WORD,
            data.len()
        )));
    }
    if data[..16].iter().any(|b| *b != 0) {
        return Err(LedgerError::Decode("uint256 value exceeds u128".to_string()));
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&data[16..WORD]);
    Ok(u128::from_be_bytes(buf))
}

/// Decodes the first word of `data` as a `bool`.
pub fn decode_bool(data: &[u8]) -> Result<bool, LedgerError> {
    match decode_u128(data)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(LedgerError::Decode(format!("invalid bool word: {}", other))),
    }
}

/// Extracts the address held in an indexed topic word.
pub fn decode_topic_address(topic: &[u8]) -> Result<Address, LedgerError> {
    if topic.len() != WORD {
        return Err(LedgerError::Decode(format!("topic must be 32 bytes, got {}", topic.len())));
    }
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&topic[12..]);
    Ok(Address(bytes))
}
