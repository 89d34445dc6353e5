//! Constructor-argument parsing and ABI encoding.
//!
//! Arguments arrive as plain strings (CLI input) and are matched
//! positionally against the constructor parameter types declared in the
//! contract artifact. Arity or type mismatches are rejected here, before
//! any network traffic happens.

use std::fmt;

use ethereum_types::U256;

use crate::Address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Address,
    Uint(usize),
    Bool,
    String,
    Bytes,
    FixedBytes(usize),
    Array(Box<ParamType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Address(Address),
    Uint(U256),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    FixedBytes(Vec<u8>),
    Array(Vec<Value>),
}

#[derive(Debug, thiserror::Error)]
pub enum CalldataError {
    #[error("constructor expects {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },
    #[error("argument {index} ({value:?}) does not fit parameter type `{param}`: {reason}")]
    TypeMismatch {
        index: usize,
        value: String,
        param: String,
        reason: String,
    },
    #[error("unsupported parameter type `{0}`")]
    UnsupportedType(String),
}

impl ParamType {
    /// Parses a Solidity type name as it appears in artifact ABIs.
    pub fn parse(name: &str) -> Result<Self, CalldataError> {
        if let Some(inner) = name.strip_suffix("[]") {
            let inner = Self::parse(inner)?;
            if matches!(inner, ParamType::Array(_)) {
                return Err(CalldataError::UnsupportedType(name.to_owned()));
            }
            return Ok(ParamType::Array(Box::new(inner)));
        }
        match name {
            "address" => Ok(ParamType::Address),
            "bool" => Ok(ParamType::Bool),
            "string" => Ok(ParamType::String),
            "bytes" => Ok(ParamType::Bytes),
            "uint" => Ok(ParamType::Uint(256)),
            _ => {
                if let Some(bits) = name.strip_prefix("uint") {
                    let bits: usize = bits
                        .parse()
                        .map_err(|_| CalldataError::UnsupportedType(name.to_owned()))?;
                    if bits == 0 || bits > 256 || bits % 8 != 0 {
                        return Err(CalldataError::UnsupportedType(name.to_owned()));
                    }
                    return Ok(ParamType::Uint(bits));
                }
                if let Some(size) = name.strip_prefix("bytes") {
                    let size: usize = size
                        .parse()
                        .map_err(|_| CalldataError::UnsupportedType(name.to_owned()))?;
                    if size == 0 || size > 32 {
                        return Err(CalldataError::UnsupportedType(name.to_owned()));
                    }
                    return Ok(ParamType::FixedBytes(size));
                }
                Err(CalldataError::UnsupportedType(name.to_owned()))
            }
        }
    }

    fn is_dynamic(&self) -> bool {
        matches!(
            self,
            ParamType::String | ParamType::Bytes | ParamType::Array(_)
        )
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Address => write!(f, "address"),
            ParamType::Uint(bits) => write!(f, "uint{bits}"),
            ParamType::Bool => write!(f, "bool"),
            ParamType::String => write!(f, "string"),
            ParamType::Bytes => write!(f, "bytes"),
            ParamType::FixedBytes(size) => write!(f, "bytes{size}"),
            ParamType::Array(inner) => write!(f, "{inner}[]"),
        }
    }
}

impl Value {
    fn is_dynamic(&self) -> bool {
        matches!(
            self,
            Value::String(_) | Value::Bytes(_) | Value::Array(_)
        )
    }
}

/// Parses textual arguments positionally against `params`.
///
/// The arity check runs first so a wrong-length argument list is reported
/// as such rather than as a type error on some position.
pub fn parse_values(params: &[ParamType], args: &[String]) -> Result<Vec<Value>, CalldataError> {
    if params.len() != args.len() {
        return Err(CalldataError::ArityMismatch {
            expected: params.len(),
            got: args.len(),
        });
    }
    params
        .iter()
        .zip(args)
        .enumerate()
        .map(|(index, (param, arg))| parse_value(param, arg, index))
        .collect()
}

fn parse_value(param: &ParamType, arg: &str, index: usize) -> Result<Value, CalldataError> {
    let mismatch = |reason: &str| CalldataError::TypeMismatch {
        index,
        value: arg.to_owned(),
        param: param.to_string(),
        reason: reason.to_owned(),
    };
    let arg = arg.trim();
    match param {
        ParamType::Address => {
            let bytes = decode_hex(arg).map_err(|reason| mismatch(&reason))?;
            if bytes.len() != 20 {
                return Err(mismatch("expected 20 bytes"));
            }
            Ok(Value::Address(Address::from_slice(&bytes)))
        }
        ParamType::Uint(bits) => {
            let value = parse_uint(arg).map_err(|reason| mismatch(&reason))?;
            if *bits < 256 && value.bits() > *bits {
                return Err(mismatch("value does not fit the declared width"));
            }
            Ok(Value::Uint(value))
        }
        ParamType::Bool => match arg {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(mismatch("expected `true` or `false`")),
        },
        ParamType::String => Ok(Value::String(arg.to_owned())),
        ParamType::Bytes => {
            let bytes = decode_hex(arg).map_err(|reason| mismatch(&reason))?;
            Ok(Value::Bytes(bytes))
        }
        ParamType::FixedBytes(size) => {
            let bytes = decode_hex(arg).map_err(|reason| mismatch(&reason))?;
            if bytes.len() != *size {
                return Err(mismatch("length does not match the declared size"));
            }
            Ok(Value::FixedBytes(bytes))
        }
        ParamType::Array(inner) => {
            let body = arg
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
                .ok_or_else(|| mismatch("expected a bracketed list"))?;
            let body = body.trim();
            if body.is_empty() {
                return Ok(Value::Array(Vec::new()));
            }
            let elements = body
                .split(',')
                .map(|element| parse_value(inner, element, index))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(elements))
        }
    }
}

fn parse_uint(arg: &str) -> Result<U256, String> {
    if let Some(hex_digits) = arg.strip_prefix("0x") {
        let bytes = decode_hex_digits(hex_digits)?;
        if bytes.len() > 32 {
            return Err("value wider than 256 bits".to_owned());
        }
        Ok(U256::from_big_endian(&bytes))
    } else {
        U256::from_dec_str(arg).map_err(|err| err.to_string())
    }
}

fn decode_hex(arg: &str) -> Result<Vec<u8>, String> {
    let digits = arg.strip_prefix("0x").unwrap_or(arg);
    decode_hex_digits(digits)
}

fn decode_hex_digits(digits: &str) -> Result<Vec<u8>, String> {
    let padded;
    let digits = if digits.len() % 2 == 1 {
        padded = format!("0{digits}");
        &padded
    } else {
        digits
    };
    hex::decode(digits).map_err(|err| err.to_string())
}

/// ABI-encodes `values` as the constructor-argument blob appended to the
/// contract creation bytecode. Values must already have been produced by
/// [`parse_values`] for the same parameter list; the type check here only
/// guards against programmatic misuse.
pub fn encode_constructor_args(
    params: &[ParamType],
    values: &[Value],
) -> Result<Vec<u8>, CalldataError> {
    if params.len() != values.len() {
        return Err(CalldataError::ArityMismatch {
            expected: params.len(),
            got: values.len(),
        });
    }
    for (index, (param, value)) in params.iter().zip(values).enumerate() {
        if !type_matches(param, value) {
            return Err(CalldataError::TypeMismatch {
                index,
                value: format!("{value:?}"),
                param: param.to_string(),
                reason: "value kind does not match parameter type".to_owned(),
            });
        }
    }
    Ok(encode_tuple(values))
}

fn type_matches(param: &ParamType, value: &Value) -> bool {
    match (param, value) {
        (ParamType::Address, Value::Address(_)) => true,
        (ParamType::Uint(_), Value::Uint(_)) => true,
        (ParamType::Bool, Value::Bool(_)) => true,
        (ParamType::String, Value::String(_)) => true,
        (ParamType::Bytes, Value::Bytes(_)) => true,
        (ParamType::FixedBytes(size), Value::FixedBytes(bytes)) => bytes.len() == *size,
        (ParamType::Array(inner), Value::Array(elements)) => {
            elements.iter().all(|element| type_matches(inner, element))
        }
        _ => false,
    }
}

fn encode_tuple(values: &[Value]) -> Vec<u8> {
    let head_size = values.len() * 32;
    let mut heads: Vec<[u8; 32]> = Vec::with_capacity(values.len());
    let mut tails: Vec<Vec<u8>> = Vec::with_capacity(values.len());
    let mut tail_len = 0usize;

    for value in values {
        if value.is_dynamic() {
            let tail = encode_dynamic(value);
            heads.push(U256::from(head_size + tail_len).to_big_endian());
            tail_len += tail.len();
            tails.push(tail);
        } else {
            heads.push(encode_static(value));
            tails.push(Vec::new());
        }
    }

    let mut out = Vec::with_capacity(head_size + tail_len);
    for head in heads {
        out.extend_from_slice(&head);
    }
    for tail in tails {
        out.extend_from_slice(&tail);
    }
    out
}

fn encode_static(value: &Value) -> [u8; 32] {
    let mut word = [0u8; 32];
    match value {
        Value::Address(address) => word[12..].copy_from_slice(address.as_bytes()),
        Value::Uint(uint) => word = uint.to_big_endian(),
        Value::Bool(flag) => word[31] = u8::from(*flag),
        Value::FixedBytes(bytes) => word[..bytes.len()].copy_from_slice(bytes),
        // Dynamic values never reach here; encode_tuple dispatches on kind.
        Value::String(_) | Value::Bytes(_) | Value::Array(_) => {}
    }
    word
}

fn encode_dynamic(value: &Value) -> Vec<u8> {
    match value {
        Value::String(text) => encode_byte_payload(text.as_bytes()),
        Value::Bytes(bytes) => encode_byte_payload(bytes),
        Value::Array(elements) => {
            let mut out = Vec::new();
            out.extend_from_slice(&U256::from(elements.len()).to_big_endian());
            out.extend_from_slice(&encode_tuple(elements));
            out
        }
        Value::Address(_) | Value::Uint(_) | Value::Bool(_) | Value::FixedBytes(_) => {
            encode_static(value).to_vec()
        }
    }
}

fn encode_byte_payload(payload: &[u8]) -> Vec<u8> {
    let padded_len = payload.len().div_ceil(32) * 32;
    let mut out = Vec::with_capacity(32 + padded_len);
    out.extend_from_slice(&U256::from(payload.len()).to_big_endian());
    out.extend_from_slice(payload);
    out.resize(32 + padded_len, 0);
    out
}
