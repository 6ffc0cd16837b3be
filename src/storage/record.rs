//! Record codec
//!
//! Tuples of typed values serialize into a self-describing byte sequence:
//! a varint header length, one serial-type varint per column, then the
//! concatenated payloads. The serial type encodes both the domain and, for
//! text and blobs, the payload length, so a single header scan gives O(1)
//! access to any column and most comparisons run directly on the encoded
//! bytes.
//!
//! Serial types:
//!
//! | code        | meaning                         | payload bytes |
//! |-------------|---------------------------------|---------------|
//! | 0           | NULL                            | 0             |
//! | 1..=6       | signed BE int of 1/2/3/4/6/8    | 1,2,3,4,6,8   |
//! | 7           | IEEE-754 double, BE             | 8             |
//! | 8, 9        | literal integers 0 and 1        | 0             |
//! | n*2+12      | blob of n bytes                 | n             |
//! | n*2+13      | text of n bytes                 | n             |

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::storage::btree::encoding::{get_varint, varint_len, write_varint};
use crate::types::Value;

// ============================================================================
// Serial types
// ============================================================================

/// Serial type for a value, choosing the narrowest integer width.
pub fn serial_type(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Integer(0) => 8,
        Value::Integer(1) => 9,
        Value::Integer(i) => {
            let i = *i;
            // Width by the magnitude of the sign-extended representation
            if (-0x80..0x80).contains(&i) {
                1
            } else if (-0x8000..0x8000).contains(&i) {
                2
            } else if (-0x80_0000..0x80_0000).contains(&i) {
                3
            } else if (-0x8000_0000..0x8000_0000).contains(&i) {
                4
            } else if (-0x8000_0000_0000..0x8000_0000_0000).contains(&i) {
                5
            } else {
                6
            }
        }
        Value::Real(_) => 7,
        Value::Blob(b) => b.len() as u64 * 2 + 12,
        Value::Text(s) => s.len() as u64 * 2 + 13,
    }
}

/// Payload length in bytes for a serial type.
pub fn serial_type_len(serial: u64) -> usize {
    match serial {
        0 | 8 | 9 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4 => 4,
        5 => 6,
        6 | 7 => 8,
        n => ((n - 12) / 2) as usize,
    }
}

fn put_int_be(out: &mut Vec<u8>, value: i64, width: usize) {
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[8 - width..]);
}

fn get_int_be(data: &[u8], width: usize) -> i64 {
    // Sign-extend from the top byte
    let mut v: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in &data[..width] {
        v = (v << 8) | b as i64;
    }
    v
}

// ============================================================================
// Encode / decode
// ============================================================================

/// Serialize a tuple.
pub fn encode_record(values: &[Value]) -> Vec<u8> {
    let serials: Vec<u64> = values.iter().map(serial_type).collect();
    let types_len: usize = serials.iter().map(|&s| varint_len(s)).sum();

    // The header length varint counts itself; one extra byte of varint can
    // in turn lengthen the count, so settle it iteratively.
    let mut header_len = types_len + 1;
    if varint_len(header_len as u64) + types_len != header_len {
        header_len = types_len + varint_len((types_len + 9) as u64);
    }

    let payload_len: usize = serials.iter().map(|&s| serial_type_len(s)).sum();
    let mut out = Vec::with_capacity(header_len + payload_len);

    write_varint(header_len as u64, &mut out);
    for &s in &serials {
        write_varint(s, &mut out);
    }
    for value in values {
        match value {
            Value::Null => {}
            Value::Integer(i) => {
                let s = serial_type(value);
                if s != 8 && s != 9 {
                    put_int_be(&mut out, *i, serial_type_len(s));
                }
            }
            Value::Real(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
            Value::Text(s) => out.extend_from_slice(s.as_bytes()),
            Value::Blob(b) => out.extend_from_slice(b),
        }
    }
    out
}

/// Decode one column payload.
fn decode_column(serial: u64, payload: &[u8]) -> Result<Value> {
    let len = serial_type_len(serial);
    if payload.len() < len {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok(match serial {
        0 => Value::Null,
        8 => Value::Integer(0),
        9 => Value::Integer(1),
        1..=6 => Value::Integer(get_int_be(payload, len)),
        7 => {
            let mut bits = [0u8; 8];
            bits.copy_from_slice(&payload[..8]);
            Value::Real(f64::from_bits(u64::from_be_bytes(bits)))
        }
        n if n >= 13 && n % 2 == 1 => {
            let s = std::str::from_utf8(&payload[..len])
                .map_err(|_| Error::new(ErrorCode::Mismatch))?;
            Value::Text(s.to_string())
        }
        n if n >= 12 => Value::Blob(payload[..len].to_vec()),
        _ => return Err(Error::new(ErrorCode::Corrupt)),
    })
}

/// Deserialize a whole tuple.
pub fn decode_record(data: &[u8]) -> Result<Vec<Value>> {
    let view = RecordView::parse(data)?;
    (0..view.column_count()).map(|i| view.column(i)).collect()
}

// ============================================================================
// Record view
// ============================================================================

/// Parsed header over an encoded record; columns decode individually in
/// O(1) after construction.
pub struct RecordView<'a> {
    data: &'a [u8],
    /// (serial type, payload offset) per column
    columns: Vec<(u64, usize)>,
}

impl<'a> RecordView<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let (header_len, mut pos) = get_varint(data, 0)?;
        let header_len = header_len as usize;
        if header_len > data.len() || header_len < pos {
            return Err(Error::new(ErrorCode::Corrupt));
        }

        let mut columns = Vec::new();
        let mut payload_pos = header_len;
        while pos < header_len {
            let (serial, n) = get_varint(data, pos)?;
            pos += n;
            columns.push((serial, payload_pos));
            payload_pos += serial_type_len(serial);
        }
        if payload_pos > data.len() {
            return Err(Error::new(ErrorCode::Corrupt));
        }

        Ok(Self { data, columns })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn serial(&self, idx: usize) -> Option<u64> {
        self.columns.get(idx).map(|&(s, _)| s)
    }

    /// Decode the column at `idx`.
    pub fn column(&self, idx: usize) -> Result<Value> {
        let &(serial, offset) = self
            .columns
            .get(idx)
            .ok_or_else(|| Error::new(ErrorCode::Misuse))?;
        decode_column(serial, &self.data[offset..])
    }

    /// Raw payload bytes of the column at `idx`.
    pub fn payload(&self, idx: usize) -> Option<&'a [u8]> {
        let &(serial, offset) = self.columns.get(idx)?;
        self.data.get(offset..offset + serial_type_len(serial))
    }
}

// ============================================================================
// Collation and comparison
// ============================================================================

/// Collation sequence for the text domain.
#[derive(Clone, Default)]
pub enum CollSeq {
    /// Bytewise comparison
    #[default]
    Binary,
    /// ASCII case-insensitive
    NoCase,
    /// Ignore trailing spaces
    RTrim,
    /// Named custom comparison
    Custom {
        name: String,
        cmp: Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>,
    },
}

impl CollSeq {
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            CollSeq::Binary => a.cmp(b),
            CollSeq::NoCase => {
                let mut i = 0;
                loop {
                    match (a.get(i), b.get(i)) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some(&ca), Some(&cb)) => {
                            let la = ca.to_ascii_lowercase();
                            let lb = cb.to_ascii_lowercase();
                            if la != lb {
                                return la.cmp(&lb);
                            }
                        }
                    }
                    i += 1;
                }
            }
            CollSeq::RTrim => {
                let trim = |s: &'_ [u8]| {
                    let mut end = s.len();
                    while end > 0 && s[end - 1] == b' ' {
                        end -= 1;
                    }
                    end
                };
                a[..trim(a)].cmp(&b[..trim(b)])
            }
            CollSeq::Custom { cmp, .. } => cmp(a, b),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CollSeq::Binary => "BINARY",
            CollSeq::NoCase => "NOCASE",
            CollSeq::RTrim => "RTRIM",
            CollSeq::Custom { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for CollSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollSeq({})", self.name())
    }
}

/// Per-column sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Comparison recipe for an index: one collation and direction per key
/// column.
#[derive(Debug, Clone, Default)]
pub struct KeyInfo {
    pub collations: Vec<CollSeq>,
    pub sort_orders: Vec<SortOrder>,
}

impl KeyInfo {
    /// Binary ascending comparison over `n` key columns.
    pub fn new(n: usize) -> Self {
        Self {
            collations: vec![CollSeq::Binary; n],
            sort_orders: vec![SortOrder::Asc; n],
        }
    }

    pub fn with_collations(collations: Vec<CollSeq>) -> Self {
        let n = collations.len();
        Self {
            collations,
            sort_orders: vec![SortOrder::Asc; n],
        }
    }

    fn collation(&self, idx: usize) -> &CollSeq {
        static BINARY: CollSeq = CollSeq::Binary;
        self.collations.get(idx).unwrap_or(&BINARY)
    }

    fn order(&self, idx: usize) -> SortOrder {
        self.sort_orders.get(idx).copied().unwrap_or(SortOrder::Asc)
    }

    /// Compare two encoded records column by column. Differing column
    /// counts break ties by count. Domain order: NULL < numeric < text <
    /// blob.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        let va = RecordView::parse(a)?;
        let vb = RecordView::parse(b)?;
        let n = va.column_count().min(vb.column_count());

        for i in 0..n {
            let sa = va.serial(i).unwrap();
            let sb = vb.serial(i).unwrap();
            let ord = compare_column(&va, &vb, i, sa, sb, self.collation(i))?;
            if ord != Ordering::Equal {
                return Ok(match self.order(i) {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                });
            }
        }
        Ok(va.column_count().cmp(&vb.column_count()))
    }
}

fn domain_rank(serial: u64) -> u8 {
    match serial {
        0 => 0,
        1..=9 => 1,
        n if n % 2 == 1 => 2, // text
        _ => 3,               // blob
    }
}

fn numeric_value(view: &RecordView<'_>, idx: usize, serial: u64) -> Result<Value> {
    match view.column(idx)? {
        v @ (Value::Integer(_) | Value::Real(_)) => Ok(v),
        _ => Err(Error::with_message(
            ErrorCode::Corrupt,
            format!("serial {} is not numeric", serial),
        )),
    }
}

fn compare_column(
    va: &RecordView<'_>,
    vb: &RecordView<'_>,
    idx: usize,
    sa: u64,
    sb: u64,
    coll: &CollSeq,
) -> Result<Ordering> {
    let ra = domain_rank(sa);
    let rb = domain_rank(sb);
    if ra != rb {
        return Ok(ra.cmp(&rb));
    }

    Ok(match ra {
        0 => Ordering::Equal,
        1 => {
            let a = numeric_value(va, idx, sa)?;
            let b = numeric_value(vb, idx, sb)?;
            match (a, b) {
                (Value::Integer(x), Value::Integer(y)) => x.cmp(&y),
                (Value::Real(x), Value::Real(y)) => total_cmp_f64(x, y),
                (Value::Integer(x), Value::Real(y)) => total_cmp_f64(x as f64, y),
                (Value::Real(x), Value::Integer(y)) => total_cmp_f64(x, y as f64),
                _ => unreachable!(),
            }
        }
        2 => {
            let pa = va.payload(idx).unwrap_or(&[]);
            let pb = vb.payload(idx).unwrap_or(&[]);
            coll.compare(pa, pb)
        }
        _ => {
            let pa = va.payload(idx).unwrap_or(&[]);
            let pb = vb.payload(idx).unwrap_or(&[]);
            pa.cmp(pb)
        }
    })
}

fn total_cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

// ============================================================================
// Tests
// ============================================================================
