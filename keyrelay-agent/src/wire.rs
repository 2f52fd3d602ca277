//! SSH agent wire primitives (RFC 4251 §5).
//!
//! All integers are big-endian.  `string` and `mpint` are a `uint32` length
//! followed by that many bytes, with no terminator.  The outer message length
//! header is transport framing and is not handled here.
//!
//! Encoding is total.  Decoding fails only with [`WireError::TruncatedInput`]
//! when the buffer ends early, or [`WireError::MalformedLength`] when a
//! declared length is larger than [`MAX_FIELD_LEN`].

use std::fmt;

use bytes::BufMut;

use crate::error::WireError;

/// Largest length any single field may declare.  Matches the OpenSSH agent
/// message cap, so no legitimate field can exceed it.
pub const MAX_FIELD_LEN: usize = 256 * 1024;

pub const RSA_ALGORITHM: &str = "ssh-rsa";
pub const DSA_ALGORITHM: &str = "ssh-dss";

// ---------------------------------------------------------------------------
// uint32 / string
// ---------------------------------------------------------------------------

pub fn encode_uint32(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

pub fn decode_uint32(buf: &[u8], offset: usize) -> Result<(u32, usize), WireError> {
    let rest = buf.get(offset..).unwrap_or_default();
    let Some(head) = rest.first_chunk::<4>() else {
        return Err(WireError::TruncatedInput {
            needed: 4,
            remaining: rest.len(),
        });
    };
    Ok((u32::from_be_bytes(*head), offset + 4))
}

pub fn put_string(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn encode_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    put_string(&mut out, bytes);
    out
}

/// Decode a `string` starting at `offset`, returning the borrowed contents
/// and the offset just past it.
pub fn decode_string(buf: &[u8], offset: usize) -> Result<(&[u8], usize), WireError> {
    let (declared, start) = decode_uint32(buf, offset)?;
    let declared = declared as usize;
    if declared > MAX_FIELD_LEN {
        return Err(WireError::MalformedLength {
            declared,
            limit: MAX_FIELD_LEN,
        });
    }
    let remaining = buf.len() - start;
    if declared > remaining {
        return Err(WireError::TruncatedInput {
            needed: declared,
            remaining,
        });
    }
    let end = start + declared;
    Ok((&buf[start..end], end))
}

// ---------------------------------------------------------------------------
// mpint
// ---------------------------------------------------------------------------

/// Arbitrary-precision signed integer in SSH two's-complement form.
///
/// Holds the exact bytes carried on the wire so decoded values re-encode
/// byte-for-byte.  Values built with [`Mpint::from_unsigned_be`] or
/// [`Mpint::from_i64`] are canonical: zero is empty, and a non-negative value
/// whose top bit would be set gains a leading `0x00`.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Mpint(Vec<u8>);

impl Mpint {
    /// Build a non-negative mpint from an unsigned big-endian magnitude.
    pub fn from_unsigned_be(magnitude: &[u8]) -> Self {
        let first_nonzero = magnitude.iter().position(|&b| b != 0);
        let Some(start) = first_nonzero else {
            return Self(Vec::new());
        };
        let digits = &magnitude[start..];
        let mut out = Vec::with_capacity(digits.len() + 1);
        if digits[0] & 0x80 != 0 {
            out.push(0);
        }
        out.extend_from_slice(digits);
        Self(out)
    }

    pub fn from_i64(n: i64) -> Self {
        let bytes = n.to_be_bytes();
        let mut start = 0;
        // Drop sign-extension bytes that the following byte already implies.
        while start + 1 < bytes.len() {
            let next_high = bytes[start + 1] & 0x80;
            match (bytes[start], next_high) {
                (0x00, 0) | (0xff, 0x80) => start += 1,
                _ => break,
            }
        }
        let digits = &bytes[start..];
        if digits == [0] {
            return Self(Vec::new());
        }
        Self(digits.to_vec())
    }

    /// Wrap bytes exactly as they appeared on the wire.
    pub fn from_wire(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_wire(&self) -> &[u8] {
        &self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.first().is_some_and(|b| b & 0x80 != 0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// The big-endian magnitude without leading zeros, or `None` if the
    /// value is negative.
    pub fn to_unsigned_be(&self) -> Option<&[u8]> {
        if self.is_negative() {
            return None;
        }
        let start = self.0.iter().position(|&b| b != 0).unwrap_or(self.0.len());
        Some(&self.0[start..])
    }

    /// The value as an `i64`, or `None` if it does not fit.
    pub fn to_i64(&self) -> Option<i64> {
        let negative = self.is_negative();
        let fill = if negative { 0xff } else { 0x00 };
        let start = self.0.iter().position(|&b| b != fill).unwrap_or(self.0.len());
        let digits = &self.0[start..];
        if digits.len() > 8 {
            return None;
        }
        // Eight digits fit only if the top one already carries the sign.
        if digits.len() == 8 && (digits[0] & 0x80 != 0) != negative {
            return None;
        }
        let mut acc: i64 = if negative { -1 } else { 0 };
        for &b in digits {
            acc = (acc << 8) | i64::from(b);
        }
        Some(acc)
    }
}

impl fmt::Debug for Mpint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mpint(0x")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

pub fn put_mpint(buf: &mut impl BufMut, value: &Mpint) {
    put_string(buf, value.as_wire());
}

pub fn encode_mpint(value: &Mpint) -> Vec<u8> {
    encode_string(value.as_wire())
}

pub fn decode_mpint(buf: &[u8], offset: usize) -> Result<(Mpint, usize), WireError> {
    let (bytes, next) = decode_string(buf, offset)?;
    Ok((Mpint::from_wire(bytes.to_vec()), next))
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Sequential decoder over one message or blob.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        let Some(&b) = self.buf.get(self.offset) else {
            return Err(WireError::TruncatedInput {
                needed: 1,
                remaining: 0,
            });
        };
        self.offset += 1;
        Ok(b)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let (n, next) = decode_uint32(self.buf, self.offset)?;
        self.offset = next;
        Ok(n)
    }

    pub fn read_string(&mut self) -> Result<&'a [u8], WireError> {
        let (bytes, next) = decode_string(self.buf, self.offset)?;
        self.offset = next;
        Ok(bytes)
    }

    pub fn read_utf8(&mut self) -> Result<&'a str, WireError> {
        let bytes = self.read_string()?;
        std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_mpint(&mut self) -> Result<Mpint, WireError> {
        let (value, next) = decode_mpint(self.buf, self.offset)?;
        self.offset = next;
        Ok(value)
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

// ---------------------------------------------------------------------------
// Key blobs and signatures
// ---------------------------------------------------------------------------

/// Public key blob: algorithm name followed by its numeric fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlob {
    pub algorithm: String,
    pub fields: Vec<Mpint>,
}

/// Number of mpint fields following the algorithm name, for algorithms
/// whose blob is made only of mpints.
fn field_count(algorithm: &str) -> Option<usize> {
    match algorithm {
        // e, n
        RSA_ALGORITHM => Some(2),
        // p, q, g, y
        DSA_ALGORITHM => Some(4),
        _ => None,
    }
}

impl KeyBlob {
    pub fn rsa(exponent: Mpint, modulus: Mpint) -> Self {
        Self {
            algorithm: RSA_ALGORITHM.to_string(),
            fields: vec![exponent, modulus],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_key_blob(&self.algorithm, &self.fields)
    }

    pub fn decode(blob: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(blob);
        let algorithm = reader.read_utf8()?.to_string();
        let count = field_count(&algorithm)
            .ok_or_else(|| WireError::UnsupportedAlgorithm(algorithm.clone()))?;
        let fields = (0..count)
            .map(|_| reader.read_mpint())
            .collect::<Result<Vec<_>, _>>()?;
        reader.finish()?;
        Ok(Self { algorithm, fields })
    }

    pub fn is_rsa(&self) -> bool {
        self.algorithm == RSA_ALGORITHM
    }
}

pub fn encode_key_blob(algorithm: &str, fields: &[Mpint]) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, algorithm.as_bytes());
    for field in fields {
        put_mpint(&mut out, field);
    }
    out
}

/// The algorithm name a key blob starts with.  The fields after it are not
/// examined.
pub fn key_algorithm(blob: &[u8]) -> Result<&str, WireError> {
    Reader::new(blob).read_utf8()
}

/// Signature: algorithm name followed by the signature value as an mpint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub algorithm: String,
    pub value: Mpint,
}

impl Signature {
    pub fn decode(blob: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(blob);
        let algorithm = reader.read_utf8()?.to_string();
        let value = reader.read_mpint()?;
        reader.finish()?;
        Ok(Self { algorithm, value })
    }
}

pub fn encode_signature(algorithm: &str, value: &Mpint) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, algorithm.as_bytes());
    put_mpint(&mut out, value);
    out
}

/// RFC 8332 form: the raw signature carried as a `string`, keeping any
/// leading zero bytes of the modulus-sized value.
pub fn encode_signature_blob(algorithm: &str, raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, algorithm.as_bytes());
    put_string(&mut out, raw);
    out
}
