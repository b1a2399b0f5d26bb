//! Tuple descriptors and the on-heap row format.
//!
//! A formed row is a header followed by attribute data:
//!
//! ```text
//! offset 0  natts     u16   number of attributes stored in the row
//! offset 2  infomask  u16   HEAP_HASNULL | HEAP_HASVARWIDTH
//! offset 4  hoff      u8    offset of the first data byte (8-aligned)
//! offset 5  bitmap    [u8]  present only with HEAP_HASNULL; bit set = not null
//! hoff      data            attributes, each aligned to its attalign
//! ```
//!
//! Pass-by-value attributes are stored in their native width and read back sign-extended
//! into a `Datum`. Variable-length attributes carry a 4-byte total-length header.

use crate::types::Datum;

pub const HEAP_HASNULL: u16 = 0x0001;
pub const HEAP_HASVARWIDTH: u16 = 0x0002;
pub const HEAP_NATTS_MASK: u16 = 0x07FF;

pub(crate) const HEADER_NATTS_OFFSET: usize = 0;
pub(crate) const HEADER_INFOMASK_OFFSET: usize = 2;
pub(crate) const HEADER_HOFF_OFFSET: usize = 4;
pub(crate) const HEADER_BITMAP_OFFSET: usize = 5;

pub const MAXIMUM_ALIGNOF: usize = 8;
pub const VARLENA_HEADER_SIZE: usize = 4;

/// Alignment requirement of an attribute's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttAlign {
    Char,
    Short,
    Int,
    Double,
}

impl AttAlign {
    pub fn bytes(self) -> usize {
        match self {
            AttAlign::Char => 1,
            AttAlign::Short => 2,
            AttAlign::Int => 4,
            AttAlign::Double => 8,
        }
    }
}

pub(crate) fn align_offset(off: usize, align: AttAlign) -> usize {
    let a = align.bytes();
    (off + a - 1) & !(a - 1)
}

/// Physical description of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attribute {
    /// Width in bytes, or `-1` for variable-length data.
    pub len: i16,
    pub by_val: bool,
    pub align: AttAlign,
}

impl Attribute {
    pub const fn new(len: i16, by_val: bool, align: AttAlign) -> Self {
        Self { len, by_val, align }
    }

    pub const fn bool() -> Self {
        Self::new(1, true, AttAlign::Char)
    }

    pub const fn int2() -> Self {
        Self::new(2, true, AttAlign::Short)
    }

    pub const fn int4() -> Self {
        Self::new(4, true, AttAlign::Int)
    }

    pub const fn int8() -> Self {
        Self::new(8, true, AttAlign::Double)
    }

    pub const fn float8() -> Self {
        Self::new(8, true, AttAlign::Double)
    }

    pub const fn text() -> Self {
        Self::new(-1, false, AttAlign::Int)
    }

    pub const fn fixed_by_ref(len: i16) -> Self {
        Self::new(len, false, AttAlign::Char)
    }

    pub fn is_varlena(&self) -> bool {
        self.len == -1
    }

    /// True for pass-by-value attributes of width 1, 2, 4 or 8.
    pub fn is_fixed_by_val(&self) -> bool {
        self.by_val && matches!(self.len, 1 | 2 | 4 | 8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleDesc {
    attrs: Vec<Attribute>,
}

impl TupleDesc {
    pub fn new(attrs: Vec<Attribute>) -> Self {
        assert!(
            attrs.len() <= HEAP_NATTS_MASK as usize,
            "a tuple descriptor holds at most {} attributes",
            HEAP_NATTS_MASK
        );
        Self { attrs }
    }

    pub fn natts(&self) -> usize {
        self.attrs.len()
    }

    /// Attribute at zero-based position `i`.
    pub fn attr(&self, i: usize) -> &Attribute {
        &self.attrs[i]
    }

    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }
}

/// A logical column value used to form rows.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    Null,
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

/// A formed row in the on-heap format, backed by 8-aligned storage.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapTuple {
    words: Box<[u64]>,
    len: usize,
}

impl HeapTuple {
    /// Forms a row from `values`.
    ///
    /// `values` may be shorter than the descriptor (the row then records fewer
    /// attributes, as rows written before a column was added do).
    ///
    /// # Panics
    /// If there are more values than attributes, or a value does not fit its attribute.
    pub fn form(desc: &TupleDesc, values: &[TupleValue]) -> Self {
        assert!(
            values.len() <= desc.natts(),
            "row has {} values but the descriptor only {} attributes",
            values.len(),
            desc.natts()
        );
        let natts = values.len();
        let has_nulls = values.iter().any(|v| matches!(v, TupleValue::Null));
        let has_varwidth = desc.attrs()[..natts].iter().any(Attribute::is_varlena);
        let bitmap_len = if has_nulls { natts.div_ceil(8) } else { 0 };
        let hoff = align_offset(HEADER_BITMAP_OFFSET + bitmap_len, AttAlign::Double);
        assert!(hoff <= u8::MAX as usize, "row header does not fit in hoff");

        let mut infomask = 0u16;
        if has_nulls {
            infomask |= HEAP_HASNULL;
        }
        if has_varwidth {
            infomask |= HEAP_HASVARWIDTH;
        }

        let mut buf = vec![0u8; hoff];
        buf[HEADER_NATTS_OFFSET..HEADER_NATTS_OFFSET + 2]
            .copy_from_slice(&(natts as u16).to_ne_bytes());
        buf[HEADER_INFOMASK_OFFSET..HEADER_INFOMASK_OFFSET + 2]
            .copy_from_slice(&infomask.to_ne_bytes());
        buf[HEADER_HOFF_OFFSET] = hoff as u8;

        for (i, value) in values.iter().enumerate() {
            if matches!(value, TupleValue::Null) {
                continue;
            }
            if has_nulls {
                buf[HEADER_BITMAP_OFFSET + i / 8] |= 1 << (i % 8);
            }
            let attr = desc.attr(i);
            let off = align_offset(buf.len() - hoff, attr.align);
            buf.resize(hoff + off, 0);
            write_attribute(&mut buf, attr, value, i);
        }

        let len = buf.len();
        let mut words = vec![0u64; len.div_ceil(8)].into_boxed_slice();
        // SAFETY: `words` holds at least `len` bytes and does not overlap `buf`.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), words.as_mut_ptr() as *mut u8, len);
        }
        Self { words, len }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: the first `len` bytes of `words` are initialized row bytes.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn natts(&self) -> usize {
        let b = self.bytes();
        (u16::from_ne_bytes([b[HEADER_NATTS_OFFSET], b[HEADER_NATTS_OFFSET + 1]]) & HEAP_NATTS_MASK)
            as usize
    }

    pub fn infomask(&self) -> u16 {
        let b = self.bytes();
        u16::from_ne_bytes([b[HEADER_INFOMASK_OFFSET], b[HEADER_INFOMASK_OFFSET + 1]])
    }

    pub fn has_nulls(&self) -> bool {
        self.infomask() & HEAP_HASNULL != 0
    }

    pub fn hoff(&self) -> usize {
        self.bytes()[HEADER_HOFF_OFFSET] as usize
    }

    /// Whether zero-based attribute `i` is null in this row.
    pub fn att_isnull(&self, i: usize) -> bool {
        if i >= self.natts() {
            return true;
        }
        self.has_nulls() && self.bytes()[HEADER_BITMAP_OFFSET + i / 8] & (1 << (i % 8)) == 0
    }
}

fn write_attribute(buf: &mut Vec<u8>, attr: &Attribute, value: &TupleValue, i: usize) {
    match (attr.by_val, value) {
        (true, TupleValue::Int(v)) => match attr.len {
            1 => buf.extend_from_slice(&(*v as i8).to_ne_bytes()),
            2 => buf.extend_from_slice(&(*v as i16).to_ne_bytes()),
            4 => buf.extend_from_slice(&(*v as i32).to_ne_bytes()),
            8 => buf.extend_from_slice(&v.to_ne_bytes()),
            len => panic!("attribute {} has unsupported by-value width {}", i + 1, len),
        },
        (true, TupleValue::Float(v)) => match attr.len {
            4 => buf.extend_from_slice(&(*v as f32).to_bits().to_ne_bytes()),
            8 => buf.extend_from_slice(&v.to_bits().to_ne_bytes()),
            len => panic!("attribute {} cannot hold a float in {} bytes", i + 1, len),
        },
        (false, TupleValue::Bytes(bytes)) if attr.is_varlena() => {
            let total = (VARLENA_HEADER_SIZE + bytes.len()) as u32;
            buf.extend_from_slice(&total.to_ne_bytes());
            buf.extend_from_slice(bytes);
        }
        (false, TupleValue::Bytes(bytes)) => {
            assert_eq!(
                bytes.len(),
                attr.len as usize,
                "attribute {} expects {} bytes",
                i + 1,
                attr.len
            );
            buf.extend_from_slice(bytes);
        }
        (_, value) => panic!("value {:?} does not fit attribute {} ({:?})", value, i + 1, attr),
    }
}

/// Reads the attribute stored at `ptr` into a Datum.
///
/// # Safety
/// `ptr` must point at a stored value of `attr` inside a live row.
pub(crate) unsafe fn fetch_att(ptr: *const u8, attr: &Attribute) -> Datum {
    if !attr.by_val {
        return ptr as Datum;
    }
    match attr.len {
        1 => (ptr as *const i8).read() as i64 as Datum,
        2 => (ptr as *const i16).read_unaligned() as i64 as Datum,
        4 => (ptr as *const i32).read_unaligned() as i64 as Datum,
        _ => (ptr as *const u64).read_unaligned() as Datum,
    }
}

/// Number of bytes the attribute stored at `ptr` occupies.
///
/// # Safety
/// `ptr` must point at a stored value of `attr` inside a live row.
pub(crate) unsafe fn att_addlength(ptr: *const u8, attr: &Attribute) -> usize {
    if attr.is_varlena() {
        (ptr as *const u32).read_unaligned() as usize
    } else {
        attr.len as usize
    }
}

/// A row already broken into per-attribute Datums.
#[derive(Debug, Clone, PartialEq)]
pub struct MemTuple {
    values: Vec<Datum>,
    isnull: Vec<bool>,
    _storage: Vec<Box<[u8]>>,
}

impl MemTuple {
    pub fn new(desc: &TupleDesc, values: &[TupleValue]) -> Self {
        assert!(values.len() <= desc.natts());
        let mut storage = Vec::new();
        let mut datums = Vec::with_capacity(values.len());
        let mut isnull = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            let attr = desc.attr(i);
            let datum = match value {
                TupleValue::Null => 0,
                TupleValue::Int(v) => match attr.len {
                    1 => *v as i8 as i64 as Datum,
                    2 => *v as i16 as i64 as Datum,
                    4 => *v as i32 as i64 as Datum,
                    _ => *v as Datum,
                },
                TupleValue::Float(v) => v.to_bits() as Datum,
                TupleValue::Bytes(bytes) => {
                    let mut owned = Vec::with_capacity(bytes.len() + VARLENA_HEADER_SIZE);
                    if attr.is_varlena() {
                        owned.extend_from_slice(
                            &((VARLENA_HEADER_SIZE + bytes.len()) as u32).to_ne_bytes(),
                        );
                    }
                    owned.extend_from_slice(bytes);
                    let owned = owned.into_boxed_slice();
                    let ptr = owned.as_ptr() as Datum;
                    storage.push(owned);
                    ptr
                }
            };
            datums.push(datum);
            isnull.push(matches!(value, TupleValue::Null));
        }
        Self {
            values: datums,
            isnull,
            _storage: storage,
        }
    }

    pub fn natts(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    pub fn isnull(&self) -> &[bool] {
        &self.isnull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints() -> TupleDesc {
        TupleDesc::new(vec![Attribute::int4(), Attribute::int8(), Attribute::int2()])
    }

    #[test]
    fn test_form_header() {
        let row = HeapTuple::form(
            &ints(),
            &[TupleValue::Int(1), TupleValue::Int(2), TupleValue::Int(3)],
        );
        assert_eq!(row.natts(), 3);
        assert!(!row.has_nulls());
        assert_eq!(row.hoff(), 8);
        assert_eq!(row.as_ptr() as usize % MAXIMUM_ALIGNOF, 0);
        // int4 at 0, int8 aligned to 8, int2 at 16
        assert_eq!(row.len(), 8 + 18);
    }

    #[test]
    fn test_form_with_nulls() {
        let row = HeapTuple::form(&ints(), &[TupleValue::Int(1), TupleValue::Null]);
        assert_eq!(row.natts(), 2);
        assert!(row.has_nulls());
        assert!(!row.att_isnull(0));
        assert!(row.att_isnull(1));
        assert!(row.att_isnull(2));
    }

    #[test]
    fn test_fetch_sign_extends() {
        let desc = TupleDesc::new(vec![Attribute::bool(), Attribute::int2(), Attribute::int4()]);
        let row = HeapTuple::form(
            &desc,
            &[TupleValue::Int(1), TupleValue::Int(-2), TupleValue::Int(-3)],
        );
        let data = unsafe { row.as_ptr().add(row.hoff()) };
        unsafe {
            assert_eq!(fetch_att(data, desc.attr(0)), 1);
            assert_eq!(fetch_att(data.add(2), desc.attr(1)) as i64, -2);
            assert_eq!(fetch_att(data.add(4), desc.attr(2)) as i64, -3);
        }
    }

    #[test]
    fn test_varlena_flag_and_length() {
        let desc = TupleDesc::new(vec![Attribute::int4(), Attribute::text()]);
        let row = HeapTuple::form(
            &desc,
            &[TupleValue::Int(5), TupleValue::Bytes(b"hello".to_vec())],
        );
        assert_ne!(row.infomask() & HEAP_HASVARWIDTH, 0);
        let att = unsafe { row.as_ptr().add(row.hoff() + 4) };
        assert_eq!(unsafe { att_addlength(att, desc.attr(1)) }, 9);
    }

    #[test]
    #[should_panic(expected = "does not fit attribute")]
    fn test_form_rejects_wrong_value_kind() {
        let desc = TupleDesc::new(vec![Attribute::int4()]);
        HeapTuple::form(&desc, &[TupleValue::Bytes(vec![1, 2, 3, 4])]);
    }

    #[test]
    fn test_mem_tuple() {
        let desc = TupleDesc::new(vec![Attribute::int4(), Attribute::text()]);
        let tuple = MemTuple::new(
            &desc,
            &[TupleValue::Int(-4), TupleValue::Null],
        );
        assert_eq!(tuple.values()[0] as i64, -4);
        assert_eq!(tuple.isnull(), &[false, true]);
    }
}
