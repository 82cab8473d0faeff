//! Tuple storage formats and field access.
//!
//! Two encodings exist per tuple descriptor. The *fixed* format has no
//! per-tuple header and no null bitmap: every column is fixed width, the
//! total length comes from the index's [`FixedFormatSpec`], and field offsets
//! are precomputed on the descriptor. The *variable* format carries an 8-byte
//! header, an optional null bitmap, and aligned field storage, and is the
//! fallback whenever a null or a variable-width column is present.
//!
//! Large values are replaced inline by a fixed-size TOAST pointer record
//! marked with a sentinel length word.

use bytes::Bytes;

use crate::error::{EngineError, Result};
use crate::types::{align_up, max_align, ColumnKind, Datum};

/// Format-flag bit marking a fixed-format tuple.
pub const TUPLE_FLAG_FIXED_FORMAT: u8 = 0x1;

/// Size of the variable-format tuple header ([`TupleHeader`]).
pub const TUPLE_HEADER_LEN: usize = 8;

/// Maximum encodable variable-format tuple length (15-bit length field).
pub const TUPLE_MAX_LEN: usize = (1 << 15) - 1;

const TOAST_SENTINEL: u32 = u32::MAX;

/// Serialized size of an inline TOAST pointer, sentinel word included.
pub const TOAST_POINTER_LEN: usize = 16;

/// A tuple: a byte buffer plus one byte of format flags.
#[derive(Clone, Debug, Default)]
pub struct Tuple {
    /// Format flags; bit 0 marks the fixed format.
    pub flags: u8,
    /// Tuple body. Excludes the flags byte.
    pub data: Bytes,
}

impl Tuple {
    /// Builds a tuple from parts.
    pub fn new(flags: u8, data: Bytes) -> Self {
        Self { flags, data }
    }

    /// True when the tuple uses the fixed format.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        self.flags & TUPLE_FLAG_FIXED_FORMAT != 0
    }
}

/// Header of a variable-format tuple: `{hasnulls:1, len:15, natts:16, version:32}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TupleHeader {
    /// Whether a null bitmap follows the header.
    pub hasnulls: bool,
    /// Total tuple length in bytes, header included.
    pub len: u16,
    /// Number of attributes physically stored.
    pub natts: u16,
    /// Tuple format version recorded by schema changes.
    pub version: u32,
}

impl TupleHeader {
    /// Decodes a header from the first 8 bytes of a tuple body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TUPLE_HEADER_LEN {
            return Err(EngineError::Corruption(
                "tuple shorter than its header".into(),
            ));
        }
        let packed = u16::from_le_bytes(data[0..2].try_into().expect("slice is 2 bytes"));
        let natts = u16::from_le_bytes(data[2..4].try_into().expect("slice is 2 bytes"));
        let version = u32::from_le_bytes(data[4..8].try_into().expect("slice is 4 bytes"));
        let len = packed & 0x7FFF;
        if (len as usize) > data.len() {
            return Err(EngineError::Corruption(
                "tuple header length exceeds buffer".into(),
            ));
        }
        Ok(Self {
            hasnulls: packed & 0x8000 != 0,
            len,
            natts,
            version,
        })
    }

    /// Encodes the header into `dst`.
    pub fn write_to(&self, dst: &mut [u8]) {
        let mut packed = self.len & 0x7FFF;
        if self.hasnulls {
            packed |= 0x8000;
        }
        dst[0..2].copy_from_slice(&packed.to_le_bytes());
        dst[2..4].copy_from_slice(&self.natts.to_le_bytes());
        dst[4..8].copy_from_slice(&self.version.to_le_bytes());
    }

    fn bitmap_len(&self) -> usize {
        if self.hasnulls {
            (self.natts as usize + 7) / 8
        } else {
            0
        }
    }

    fn fields_start(&self) -> usize {
        max_align(TUPLE_HEADER_LEN + self.bitmap_len())
    }
}

/// Inline record standing in for an externally stored large value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ToastPointer {
    /// Size of the value before compression.
    pub raw_size: u32,
    /// Size of the value as stored in the TOAST tree.
    pub stored_size: u32,
    /// Number of chunks the value was cut into.
    pub chunk_count: u32,
}

impl ToastPointer {
    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TOAST_POINTER_LEN {
            return Err(EngineError::Corruption("toast pointer truncated".into()));
        }
        Ok(Self {
            raw_size: u32::from_le_bytes(bytes[4..8].try_into().expect("slice is 4 bytes")),
            stored_size: u32::from_le_bytes(bytes[8..12].try_into().expect("slice is 4 bytes")),
            chunk_count: u32::from_le_bytes(bytes[12..16].try_into().expect("slice is 4 bytes")),
        })
    }

    fn write_to(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&TOAST_SENTINEL.to_le_bytes());
        dst[4..8].copy_from_slice(&self.raw_size.to_le_bytes());
        dst[8..12].copy_from_slice(&self.stored_size.to_le_bytes());
        dst[12..16].copy_from_slice(&self.chunk_count.to_le_bytes());
    }
}

/// Returns true when the bytes at a variable-width field position hold an
/// inline TOAST pointer rather than an ordinary length-prefixed value.
#[inline]
pub fn is_toast_pointer(bytes: &[u8]) -> bool {
    bytes.len() >= 4
        && u32::from_le_bytes(bytes[0..4].try_into().expect("slice is 4 bytes")) == TOAST_SENTINEL
}

/// One column of a tuple descriptor.
#[derive(Clone, Copy, Debug)]
pub struct ColumnDesc {
    /// Datatype of the column.
    pub kind: ColumnKind,
    /// Precomputed offset from the start of field storage, when every
    /// preceding column is fixed width.
    pub cache_offset: Option<u32>,
}

/// Ordered column layout shared by every tuple of one shape.
#[derive(Clone, Debug)]
pub struct TupleDescriptor {
    columns: Vec<ColumnDesc>,
}

impl TupleDescriptor {
    /// Builds a descriptor, precomputing offsets for the fixed prefix.
    pub fn new(kinds: &[ColumnKind]) -> Self {
        let mut columns = Vec::with_capacity(kinds.len());
        let mut off: Option<usize> = Some(0);
        for &kind in kinds {
            let cache_offset = off.map(|o| align_up(o, kind.align()) as u32);
            columns.push(ColumnDesc { kind, cache_offset });
            off = match (off, kind.fixed_len()) {
                (Some(o), Some(len)) => Some(align_up(o, kind.align()) + len),
                _ => None,
            };
        }
        Self { columns }
    }

    /// Number of columns.
    pub fn natts(&self) -> usize {
        self.columns.len()
    }

    /// Column metadata, indexed from zero.
    pub fn column(&self, idx: usize) -> &ColumnDesc {
        &self.columns[idx]
    }

    /// All columns in order.
    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    /// Byte length of the fixed-format encoding covering the leading
    /// `natts` columns, or `None` if one of them is variable width.
    pub fn fixed_len(&self, natts: usize) -> Option<usize> {
        let mut end = 0usize;
        for col in &self.columns[..natts] {
            let len = col.kind.fixed_len()?;
            end = align_up(end, col.kind.align()) + len;
        }
        Some(max_align(end))
    }
}

/// Per-index description of the fixed tuple encoding: how many leading
/// columns it covers and the resulting tuple length.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FixedFormatSpec {
    /// Number of attributes stored by fixed-format tuples.
    pub natts: u16,
    /// Total length of a fixed-format tuple, MAXALIGNed.
    pub len: u16,
}

/// Value of one tuple field.
#[derive(Clone, Copy, Debug)]
pub enum FieldValue<'a> {
    /// SQL null.
    Null,
    /// Fixed-width value.
    Datum(Datum),
    /// Variable-width value stored inline.
    Bytes(&'a [u8]),
    /// Externally stored value.
    Toast(ToastPointer),
}

/// Field initializer accepted by [`form_tuple`].
#[derive(Clone, Copy, Debug)]
pub enum FieldInit<'a> {
    /// Fixed-width value.
    Datum(Datum),
    /// Variable-width value to store inline.
    Bytes(&'a [u8]),
    /// Pre-built TOAST pointer.
    Toast(ToastPointer),
}

/// Total stored size of a tuple under the given fixed-format spec.
#[inline]
pub fn tuple_size(tuple: &Tuple, spec: &FixedFormatSpec) -> usize {
    tuple_size_raw(&tuple.data, tuple.flags, spec)
}

/// [`tuple_size`] over raw tuple bytes.
#[inline]
pub fn tuple_size_raw(data: &[u8], flags: u8, spec: &FixedFormatSpec) -> usize {
    if flags & TUPLE_FLAG_FIXED_FORMAT != 0 {
        spec.len as usize
    } else {
        u16::from_le_bytes(data[0..2].try_into().expect("slice is 2 bytes")) as usize & 0x7FFF
    }
}

/// Format version of a tuple; fixed-format tuples are always version zero.
pub fn tuple_version(tuple: &Tuple) -> u32 {
    if tuple.is_fixed() {
        0
    } else {
        TupleHeader::parse(&tuple.data).map(|h| h.version).unwrap_or(0)
    }
}

/// True when the tuple carries at least one null field.
pub fn tuple_has_nulls(tuple: &Tuple) -> bool {
    if tuple.is_fixed() {
        false
    } else {
        TupleHeader::parse(&tuple.data)
            .map(|h| h.hasnulls)
            .unwrap_or(false)
    }
}

#[inline]
fn bitmap_is_null(bitmap: &[u8], idx: usize) -> bool {
    bitmap[idx / 8] & (1 << (idx % 8)) != 0
}

fn read_at<'a>(kind: ColumnKind, bytes: &'a [u8]) -> Result<FieldValue<'a>> {
    match kind.fixed_len() {
        Some(len) => {
            if bytes.len() < len {
                return Err(EngineError::Corruption("tuple field truncated".into()));
            }
            Ok(FieldValue::Datum(kind.read_datum(bytes)))
        }
        None => {
            if is_toast_pointer(bytes) {
                return Ok(FieldValue::Toast(ToastPointer::parse(bytes)?));
            }
            if bytes.len() < 4 {
                return Err(EngineError::Corruption("tuple field truncated".into()));
            }
            let len =
                u32::from_le_bytes(bytes[0..4].try_into().expect("slice is 4 bytes")) as usize;
            if bytes.len() < 4 + len {
                return Err(EngineError::Corruption(
                    "variable field extends past tuple".into(),
                ));
            }
            Ok(FieldValue::Bytes(&bytes[4..4 + len]))
        }
    }
}

/// Width a field occupies in storage, starting at `bytes`.
fn stored_width(kind: ColumnKind, bytes: &[u8]) -> Result<usize> {
    match kind.fixed_len() {
        Some(len) => Ok(len),
        None => {
            if is_toast_pointer(bytes) {
                return Ok(TOAST_POINTER_LEN);
            }
            if bytes.len() < 4 {
                return Err(EngineError::Corruption("tuple field truncated".into()));
            }
            let len =
                u32::from_le_bytes(bytes[0..4].try_into().expect("slice is 4 bytes")) as usize;
            Ok(4 + len)
        }
    }
}

/// Sequential field reader over one tuple.
///
/// Walks field storage once, honoring per-column alignment and the null
/// bitmap; used by key extraction and by slow-path reads when cached offsets
/// are unavailable.
pub struct TupleReader<'a> {
    desc: &'a TupleDescriptor,
    fields: &'a [u8],
    bitmap: Option<&'a [u8]>,
    natts: usize,
    attnum: usize,
    off: usize,
}

impl<'a> TupleReader<'a> {
    /// Positions a reader at the first field of `tuple`.
    pub fn new(
        tuple: &'a Tuple,
        desc: &'a TupleDescriptor,
        spec: &FixedFormatSpec,
    ) -> Result<Self> {
        Self::from_raw(&tuple.data, tuple.flags, desc, spec)
    }

    /// Positions a reader over raw tuple bytes lifted off a page.
    pub fn from_raw(
        data: &'a [u8],
        flags: u8,
        desc: &'a TupleDescriptor,
        spec: &FixedFormatSpec,
    ) -> Result<Self> {
        if flags & TUPLE_FLAG_FIXED_FORMAT != 0 {
            Ok(Self {
                desc,
                fields: data,
                bitmap: None,
                natts: spec.natts as usize,
                attnum: 0,
                off: 0,
            })
        } else {
            let header = TupleHeader::parse(data)?;
            let bitmap = if header.hasnulls {
                Some(&data[TUPLE_HEADER_LEN..TUPLE_HEADER_LEN + header.bitmap_len()])
            } else {
                None
            };
            Ok(Self {
                desc,
                fields: &data[header.fields_start()..],
                bitmap,
                natts: header.natts as usize,
                attnum: 0,
                off: 0,
            })
        }
    }

    /// Reads the next field, or `Null` past the stored attribute count.
    pub fn next_field(&mut self) -> Result<FieldValue<'a>> {
        let attnum = self.attnum;
        self.attnum += 1;
        if attnum >= self.natts {
            return Ok(FieldValue::Null);
        }
        if let Some(bitmap) = self.bitmap {
            if bitmap_is_null(bitmap, attnum) {
                return Ok(FieldValue::Null);
            }
        }
        let kind = self.desc.column(attnum).kind;
        self.off = align_up(self.off, kind.align());
        if self.off > self.fields.len() {
            return Err(EngineError::Corruption(
                "tuple field offset beyond storage".into(),
            ));
        }
        let bytes = &self.fields[self.off..];
        let value = read_at(kind, bytes)?;
        self.off += stored_width(kind, bytes)?;
        Ok(value)
    }
}

/// Reads one field of `tuple` by 1-based attribute number.
///
/// This is the hot accessor: fixed-format tuples and no-null variable tuples
/// resolve through the descriptor's precomputed offsets; only tuples with
/// nulls or preceding variable-width fields take the walking path.
pub fn read_field<'a>(
    tuple: &'a Tuple,
    attnum: u16,
    desc: &'a TupleDescriptor,
    spec: &FixedFormatSpec,
) -> Result<FieldValue<'a>> {
    read_field_raw(&tuple.data, tuple.flags, attnum, desc, spec)
}

/// [`read_field`] over raw tuple bytes lifted off a page.
pub fn read_field_raw<'a>(
    data: &'a [u8],
    flags: u8,
    attnum: u16,
    desc: &'a TupleDescriptor,
    spec: &FixedFormatSpec,
) -> Result<FieldValue<'a>> {
    debug_assert!(attnum > 0);
    let idx = attnum as usize - 1;
    if flags & TUPLE_FLAG_FIXED_FORMAT != 0 {
        if idx >= spec.natts as usize {
            return Ok(FieldValue::Null);
        }
        let col = desc.column(idx);
        match col.cache_offset {
            Some(off) if (off as usize) < data.len() => {
                read_at(col.kind, &data[off as usize..])
            }
            Some(_) => Err(EngineError::Corruption(
                "tuple field offset beyond storage".into(),
            )),
            None => walk_to(data, flags, idx, desc, spec),
        }
    } else {
        let header = TupleHeader::parse(data)?;
        if idx >= header.natts as usize {
            return Ok(FieldValue::Null);
        }
        if !header.hasnulls {
            let col = desc.column(idx);
            if let Some(off) = col.cache_offset {
                let start = header.fields_start() + off as usize;
                if start >= data.len() {
                    return Err(EngineError::Corruption(
                        "tuple field offset beyond storage".into(),
                    ));
                }
                return read_at(col.kind, &data[start..]);
            }
        }
        walk_to(data, flags, idx, desc, spec)
    }
}

fn walk_to<'a>(
    data: &'a [u8],
    flags: u8,
    idx: usize,
    desc: &'a TupleDescriptor,
    spec: &FixedFormatSpec,
) -> Result<FieldValue<'a>> {
    let mut reader = TupleReader::from_raw(data, flags, desc, spec)?;
    let mut value = FieldValue::Null;
    for _ in 0..=idx {
        value = reader.next_field()?;
    }
    Ok(value)
}

/// Reads a fixed-width field as a `(datum, isnull)` pair for comparators.
pub fn read_datum(
    tuple: &Tuple,
    attnum: u16,
    desc: &TupleDescriptor,
    spec: &FixedFormatSpec,
) -> Result<(Datum, bool)> {
    match read_field(tuple, attnum, desc, spec)? {
        FieldValue::Null => Ok((Datum::default(), true)),
        FieldValue::Datum(d) => Ok((d, false)),
        FieldValue::Bytes(_) | FieldValue::Toast(_) => Err(EngineError::InvalidArgument(
            "variable-width field has no datum form".into(),
        )),
    }
}

/// [`read_datum`] over raw tuple bytes lifted off a page.
pub fn read_datum_raw(
    data: &[u8],
    flags: u8,
    attnum: u16,
    desc: &TupleDescriptor,
    spec: &FixedFormatSpec,
) -> Result<(Datum, bool)> {
    match read_field_raw(data, flags, attnum, desc, spec)? {
        FieldValue::Null => Ok((Datum::default(), true)),
        FieldValue::Datum(d) => Ok((d, false)),
        FieldValue::Bytes(_) | FieldValue::Toast(_) => Err(EngineError::InvalidArgument(
            "variable-width field has no datum form".into(),
        )),
    }
}

/// Builds a tuple from field initializers.
///
/// The fixed format is chosen when the spec covers every column, no field is
/// null, and every column is fixed width; otherwise the variable format with
/// `version` is produced.
pub fn form_tuple(
    desc: &TupleDescriptor,
    spec: &FixedFormatSpec,
    version: u32,
    values: &[Option<FieldInit<'_>>],
) -> Result<Tuple> {
    if values.len() != desc.natts() {
        return Err(EngineError::InvalidArgument(
            "field initializer count does not match descriptor".into(),
        ));
    }
    let hasnulls = values.iter().any(|v| v.is_none());
    let all_fixed = desc
        .columns()
        .iter()
        .all(|c| c.kind.fixed_len().is_some());
    let fixed = !hasnulls && all_fixed && spec.natts as usize == values.len();

    if fixed {
        let mut buf = vec![0u8; spec.len as usize];
        let mut off = 0usize;
        for (col, value) in desc.columns().iter().zip(values) {
            off = align_up(off, col.kind.align());
            match value.expect("fixed tuples have no nulls") {
                FieldInit::Datum(d) => col.kind.write_datum(d, &mut buf[off..]),
                FieldInit::Bytes(_) | FieldInit::Toast(_) => {
                    return Err(EngineError::InvalidArgument(
                        "variable initializer for fixed-width column".into(),
                    ))
                }
            }
            off += col.kind.fixed_len().expect("all columns fixed");
        }
        return Ok(Tuple::new(TUPLE_FLAG_FIXED_FORMAT, Bytes::from(buf)));
    }

    // Variable format: size the buffer first, then fill.
    let natts = values.len() as u16;
    let bitmap_len = if hasnulls {
        (values.len() + 7) / 8
    } else {
        0
    };
    let fields_start = max_align(TUPLE_HEADER_LEN + bitmap_len);
    let mut end = fields_start;
    for (col, value) in desc.columns().iter().zip(values) {
        let Some(value) = value else { continue };
        end = align_up(end - fields_start, col.kind.align()) + fields_start;
        end += match value {
            FieldInit::Datum(_) => col.kind.fixed_len().ok_or_else(|| {
                EngineError::InvalidArgument("datum initializer for variable column".into())
            })?,
            FieldInit::Bytes(b) => 4 + b.len(),
            FieldInit::Toast(_) => TOAST_POINTER_LEN,
        };
    }
    if end > TUPLE_MAX_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "tuple of {end} bytes exceeds the variable-format limit"
        )));
    }

    let mut buf = vec![0u8; end];
    TupleHeader {
        hasnulls,
        len: end as u16,
        natts,
        version,
    }
    .write_to(&mut buf);
    let mut off = fields_start;
    for (idx, (col, value)) in desc.columns().iter().zip(values).enumerate() {
        let Some(value) = value else {
            buf[TUPLE_HEADER_LEN + idx / 8] |= 1 << (idx % 8);
            continue;
        };
        off = align_up(off - fields_start, col.kind.align()) + fields_start;
        match value {
            FieldInit::Datum(d) => {
                col.kind.write_datum(*d, &mut buf[off..]);
                off += col.kind.fixed_len().expect("checked above");
            }
            FieldInit::Bytes(b) => {
                buf[off..off + 4].copy_from_slice(&(b.len() as u32).to_le_bytes());
                buf[off + 4..off + 4 + b.len()].copy_from_slice(b);
                off += 4 + b.len();
            }
            FieldInit::Toast(t) => {
                t.write_to(&mut buf[off..]);
                off += TOAST_POINTER_LEN;
            }
        }
    }
    Ok(Tuple::new(0, Bytes::from(buf)))
}
