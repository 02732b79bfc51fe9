//! Binary RPC wire codec.
//!
//! Frames are msgpack arrays of length 3 or 4 whose first element is a small
//! integer message type: `[0, msgid, method, params]` for requests,
//! `[1, msgid, error_or_nil, result]` for responses, `[2, method, params]`
//! for notifications. The codec is pure over byte buffers; connection code
//! feeds partial reads into a [`FrameBuffer`] and pops complete messages.

use thiserror::Error;

/// A decoded msgpack value.
///
/// Maps are kept as pair vectors so key insertion order survives a
/// round-trip. Integers decode into `Int` when the wire encoding was signed
/// and `UInt` when it was unsigned; accessors accept either where the sign
/// allows it.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            Value::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::UInt(n) if *n <= i64::MAX as u64 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(b) => Some(b),
            // Clients may send keystroke payloads as strings.
            Value::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Look up a map entry by string key. Integer keys compare unequal to
    /// strings, so a map using them simply misses; decoding them is still
    /// accepted per the protocol contract.
    pub fn map_get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::UInt(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// Codec failure modes. `Truncated` means "wait for more bytes" and is the
/// only recoverable variant; everything else is fatal for the connection
/// that produced the bytes.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("truncated frame")]
    Truncated,
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(&'static str),
    #[error("invalid message type {0}")]
    InvalidMessageType(u64),
    #[error("invalid array length {0} for rpc frame")]
    InvalidArrayLength(usize),
    #[error("type mismatch: expected {0}")]
    TypeMismatch(&'static str),
}

/// Encode a value tree into `out`.
pub fn encode(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Nil => out.push(0xc0),
        Value::Bool(false) => out.push(0xc2),
        Value::Bool(true) => out.push(0xc3),
        Value::UInt(n) => encode_uint(*n, out),
        Value::Int(n) => encode_int(*n, out),
        Value::Float(f) => {
            out.push(0xcb);
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Value::Str(s) => {
            let len = s.len();
            if len < 32 {
                out.push(0xa0 | len as u8);
            } else if len <= 0xff {
                out.push(0xd9);
                out.push(len as u8);
            } else if len <= 0xffff {
                out.push(0xda);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.push(0xdb);
                out.extend_from_slice(&(len as u32).to_be_bytes());
            }
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bin(b) => {
            let len = b.len();
            if len <= 0xff {
                out.push(0xc4);
                out.push(len as u8);
            } else if len <= 0xffff {
                out.push(0xc5);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.push(0xc6);
                out.extend_from_slice(&(len as u32).to_be_bytes());
            }
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            let len = items.len();
            if len < 16 {
                out.push(0x90 | len as u8);
            } else if len <= 0xffff {
                out.push(0xdc);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.push(0xdd);
                out.extend_from_slice(&(len as u32).to_be_bytes());
            }
            for item in items {
                encode(item, out);
            }
        }
        Value::Map(pairs) => {
            let len = pairs.len();
            if len < 16 {
                out.push(0x80 | len as u8);
            } else if len <= 0xffff {
                out.push(0xde);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.push(0xdf);
                out.extend_from_slice(&(len as u32).to_be_bytes());
            }
            for (k, v) in pairs {
                encode(k, out);
                encode(v, out);
            }
        }
    }
}

fn encode_uint(n: u64, out: &mut Vec<u8>) {
    if n < 0x80 {
        out.push(n as u8);
    } else if n <= 0xff {
        out.push(0xcc);
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xcd);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xce);
        out.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        out.push(0xcf);
        out.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_int(n: i64, out: &mut Vec<u8>) {
    if n >= 0 {
        encode_uint(n as u64, out);
    } else if n >= -32 {
        out.push(n as u8);
    } else if n >= i8::MIN as i64 {
        out.push(0xd0);
        out.push(n as u8);
    } else if n >= i16::MIN as i64 {
        out.push(0xd1);
        out.extend_from_slice(&(n as i16).to_be_bytes());
    } else if n >= i32::MIN as i64 {
        out.push(0xd2);
        out.extend_from_slice(&(n as i32).to_be_bytes());
    } else {
        out.push(0xd3);
        out.extend_from_slice(&n.to_be_bytes());
    }
}

/// Decode one value from the front of `buf`, returning it and the number of
/// bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Value, usize), DecodeError> {
    let mut cursor = Cursor { buf, pos: 0 };
    let value = cursor.read_value()?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_str(&mut self, len: usize) -> Result<Value, DecodeError> {
        let bytes = self.take(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(Value::Str(s.to_string())),
            Err(_) => Err(DecodeError::InvalidMessageFormat("non-utf8 string")),
        }
    }

    fn read_array(&mut self, len: usize) -> Result<Value, DecodeError> {
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.read_value()?);
        }
        Ok(Value::Array(items))
    }

    fn read_map(&mut self, len: usize) -> Result<Value, DecodeError> {
        let mut pairs = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let k = self.read_value()?;
            let v = self.read_value()?;
            pairs.push((k, v));
        }
        Ok(Value::Map(pairs))
    }

    fn read_value(&mut self) -> Result<Value, DecodeError> {
        let tag = self.byte()?;
        match tag {
            0x00..=0x7f => Ok(Value::UInt(tag as u64)),
            0xe0..=0xff => Ok(Value::Int(tag as i8 as i64)),
            0x80..=0x8f => self.read_map((tag & 0x0f) as usize),
            0x90..=0x9f => self.read_array((tag & 0x0f) as usize),
            0xa0..=0xbf => {
                let len = (tag & 0x1f) as usize;
                self.read_str(len)
            }
            0xc0 => Ok(Value::Nil),
            0xc2 => Ok(Value::Bool(false)),
            0xc3 => Ok(Value::Bool(true)),
            0xc4 => {
                let len = self.byte()? as usize;
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xc5 => {
                let len = self.u16()? as usize;
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xc6 => {
                let len = self.u32()? as usize;
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xca => {
                let bits = self.u32()?;
                Ok(Value::Float(f32::from_bits(bits) as f64))
            }
            0xcb => {
                let bits = self.u64()?;
                Ok(Value::Float(f64::from_bits(bits)))
            }
            0xcc => Ok(Value::UInt(self.byte()? as u64)),
            0xcd => Ok(Value::UInt(self.u16()? as u64)),
            0xce => Ok(Value::UInt(self.u32()? as u64)),
            0xcf => Ok(Value::UInt(self.u64()?)),
            0xd0 => Ok(Value::Int(self.byte()? as i8 as i64)),
            0xd1 => Ok(Value::Int(self.u16()? as i16 as i64)),
            0xd2 => Ok(Value::Int(self.u32()? as i32 as i64)),
            0xd3 => Ok(Value::Int(self.u64()? as i64)),
            0xd9 => {
                let len = self.byte()? as usize;
                self.read_str(len)
            }
            0xda => {
                let len = self.u16()? as usize;
                self.read_str(len)
            }
            0xdb => {
                let len = self.u32()? as usize;
                self.read_str(len)
            }
            0xdc => {
                let len = self.u16()? as usize;
                self.read_array(len)
            }
            0xdd => {
                let len = self.u32()? as usize;
                self.read_array(len)
            }
            0xde => {
                let len = self.u16()? as usize;
                self.read_map(len)
            }
            0xdf => {
                let len = self.u32()? as usize;
                self.read_map(len)
            }
            // Reserved byte and ext family; the protocol never produces them.
            _ => Err(DecodeError::InvalidMessageFormat("unsupported type tag")),
        }
    }
}

/// An RPC frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request {
        msgid: u64,
        method: String,
        params: Value,
    },
    Response {
        msgid: u64,
        /// Nil on success, else a string or structured error value.
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Message {
    pub fn into_value(self) -> Value {
        match self {
            Message::Request {
                msgid,
                method,
                params,
            } => Value::Array(vec![
                Value::UInt(0),
                Value::UInt(msgid),
                Value::Str(method),
                params,
            ]),
            Message::Response {
                msgid,
                error,
                result,
            } => Value::Array(vec![Value::UInt(1), Value::UInt(msgid), error, result]),
            Message::Notification { method, params } => {
                Value::Array(vec![Value::UInt(2), Value::Str(method), params])
            }
        }
    }

    pub fn from_value(value: Value) -> Result<Message, DecodeError> {
        let items = match value {
            Value::Array(items) => items,
            _ => return Err(DecodeError::InvalidMessageFormat("frame is not an array")),
        };
        let kind = items
            .first()
            .and_then(|v| v.as_u64())
            .ok_or(DecodeError::InvalidMessageFormat("missing message type"))?;
        match kind {
            0 => {
                if items.len() != 4 {
                    return Err(DecodeError::InvalidArrayLength(items.len()));
                }
                let mut it = items.into_iter().skip(1);
                let msgid = it
                    .next()
                    .and_then(|v| v.as_u64())
                    .ok_or(DecodeError::TypeMismatch("unsigned msgid"))?;
                let method = match it.next() {
                    Some(Value::Str(s)) => s,
                    _ => return Err(DecodeError::TypeMismatch("string method")),
                };
                let params = it.next().unwrap_or(Value::Nil);
                Ok(Message::Request {
                    msgid,
                    method,
                    params,
                })
            }
            1 => {
                if items.len() != 4 {
                    return Err(DecodeError::InvalidArrayLength(items.len()));
                }
                let mut it = items.into_iter().skip(1);
                let msgid = it
                    .next()
                    .and_then(|v| v.as_u64())
                    .ok_or(DecodeError::TypeMismatch("unsigned msgid"))?;
                let error = it.next().unwrap_or(Value::Nil);
                let result = it.next().unwrap_or(Value::Nil);
                Ok(Message::Response {
                    msgid,
                    error,
                    result,
                })
            }
            2 => {
                if items.len() != 3 {
                    return Err(DecodeError::InvalidArrayLength(items.len()));
                }
                let mut it = items.into_iter().skip(1);
                let method = match it.next() {
                    Some(Value::Str(s)) => s,
                    _ => return Err(DecodeError::TypeMismatch("string method")),
                };
                let params = it.next().unwrap_or(Value::Nil);
                Ok(Message::Notification { method, params })
            }
            other => Err(DecodeError::InvalidMessageType(other)),
        }
    }

    /// Encode this message onto the end of `out`.
    pub fn encode_into(self, out: &mut Vec<u8>) {
        encode(&self.into_value(), out);
    }
}

/// Accumulates partial socket reads and pops complete messages.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, or `None` if the tail is a partial
    /// frame. Any error other than truncation is fatal for the stream.
    pub fn next_message(&mut self) -> Result<Option<Message>, DecodeError> {
        match decode(&self.buf[self.pos..]) {
            Ok((value, consumed)) => {
                self.pos += consumed;
                // Reclaim consumed prefix once it dominates the buffer.
                if self.pos > 4096 && self.pos * 2 >= self.buf.len() {
                    self.buf.drain(..self.pos);
                    self.pos = 0;
                }
                Message::from_value(value).map(Some)
            }
            Err(DecodeError::Truncated) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// True when every received byte has been consumed as a whole frame.
    pub fn is_drained(&self) -> bool {
        self.pos == self.buf.len()
    }
}
