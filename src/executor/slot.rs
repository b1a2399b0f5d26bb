use std::sync::Arc;

use crate::executor::tuple::{
    align_offset, att_addlength, fetch_att, HeapTuple, MemTuple, TupleDesc,
};
use crate::types::Datum;

pub const TTS_EMPTY: u32 = 0x0001;
/// `values`/`isnull` hold the authoritative attribute values.
pub const TTS_VIRTUAL: u32 = 0x0002;

/// Executor container holding one row plus its partially deformed attribute arrays.
///
/// The first fields are read and written by generated code through the offsets in
/// [`crate::executor::FieldLayouts`], so the struct is `repr(C)` and always lives in a
/// `Box` to keep its address stable.
#[repr(C)]
pub struct TupleTableSlot {
    pub(crate) flags: u32,
    pub(crate) nvalid: i32,
    pub(crate) values: *mut Datum,
    pub(crate) isnull: *mut bool,
    pub(crate) heap_tuple: *const u8,
    pub(crate) mem_tuple: *const MemTuple,
    /// Byte offset into the row data reached by the last deformation.
    pub(crate) off: u64,
    desc: Arc<TupleDesc>,
    held_heap: Option<Arc<HeapTuple>>,
    held_mem: Option<Arc<MemTuple>>,
}

impl TupleTableSlot {
    pub fn new(desc: Arc<TupleDesc>) -> Box<Self> {
        let natts = desc.natts();
        let values = Box::into_raw(vec![0 as Datum; natts].into_boxed_slice()) as *mut Datum;
        let isnull = Box::into_raw(vec![true; natts].into_boxed_slice()) as *mut bool;
        Box::new(Self {
            flags: TTS_EMPTY,
            nvalid: 0,
            values,
            isnull,
            heap_tuple: std::ptr::null(),
            mem_tuple: std::ptr::null(),
            off: 0,
            desc,
            held_heap: None,
            held_mem: None,
        })
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn shared_desc(&self) -> Arc<TupleDesc> {
        Arc::clone(&self.desc)
    }

    pub fn natts(&self) -> usize {
        self.desc.natts()
    }

    pub fn store_heap_tuple(&mut self, tuple: Arc<HeapTuple>) {
        self.clear();
        self.heap_tuple = tuple.as_ptr();
        self.held_heap = Some(tuple);
        self.flags &= !TTS_EMPTY;
    }

    pub fn store_mem_tuple(&mut self, tuple: Arc<MemTuple>) {
        self.clear();
        self.mem_tuple = Arc::as_ptr(&tuple);
        self.held_mem = Some(tuple);
        self.flags &= !TTS_EMPTY;
    }

    /// Stores already-deformed attribute values; missing trailing attributes are null.
    pub fn store_virtual(&mut self, values: &[Datum], isnull: &[bool]) {
        assert_eq!(values.len(), isnull.len());
        assert!(values.len() <= self.natts());
        self.clear();
        let natts = self.natts();
        let (dst_values, dst_isnull) = self.arrays_mut();
        dst_values[..values.len()].copy_from_slice(values);
        dst_isnull[..isnull.len()].copy_from_slice(isnull);
        dst_isnull[values.len()..natts].fill(true);
        self.nvalid = natts as i32;
        self.flags = TTS_VIRTUAL;
    }

    pub fn clear(&mut self) {
        self.flags = TTS_EMPTY;
        self.nvalid = 0;
        self.off = 0;
        self.heap_tuple = std::ptr::null();
        self.mem_tuple = std::ptr::null();
        self.held_heap = None;
        self.held_mem = None;
    }

    pub fn nvalid(&self) -> usize {
        self.nvalid.max(0) as usize
    }

    pub fn offset(&self) -> u64 {
        self.off
    }

    pub fn is_virtual(&self) -> bool {
        self.flags & TTS_VIRTUAL != 0
    }

    pub fn is_empty(&self) -> bool {
        self.flags & TTS_EMPTY != 0
    }

    pub fn values(&self) -> &[Datum] {
        // SAFETY: `values` was allocated with `natts` elements in `new`.
        unsafe { std::slice::from_raw_parts(self.values, self.natts()) }
    }

    pub fn isnull(&self) -> &[bool] {
        // SAFETY: `isnull` was allocated with `natts` elements in `new`.
        unsafe { std::slice::from_raw_parts(self.isnull, self.natts()) }
    }

    fn arrays_mut(&mut self) -> (&mut [Datum], &mut [bool]) {
        let natts = self.natts();
        // SAFETY: both arrays hold `natts` elements and never alias each other.
        unsafe {
            (
                std::slice::from_raw_parts_mut(self.values, natts),
                std::slice::from_raw_parts_mut(self.isnull, natts),
            )
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut TupleTableSlot {
        self as *mut TupleTableSlot
    }

    pub fn addr(&self) -> usize {
        self as *const TupleTableSlot as usize
    }

    /// Makes at least `attnum` attributes valid through the regular implementation.
    pub fn getsomeattrs(&mut self, attnum: i32) {
        // SAFETY: `self` is a live, exclusively borrowed slot.
        unsafe { slot_getsomeattrs(self.as_mut_ptr(), attnum) }
    }

    pub fn getattr(&mut self, attnum: i32) -> (Datum, bool) {
        let mut isnull = false;
        // SAFETY: `self` is a live, exclusively borrowed slot.
        let value = unsafe { slot_getattr(self.as_mut_ptr(), attnum, &mut isnull) };
        (value, isnull)
    }
}

impl Drop for TupleTableSlot {
    fn drop(&mut self) {
        let natts = self.natts();
        // SAFETY: both arrays were produced by `Box::into_raw` with `natts` elements.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.values, natts)));
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.isnull, natts)));
        }
    }
}

impl std::fmt::Debug for TupleTableSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleTableSlot")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("flags", &self.flags)
            .field("nvalid", &self.nvalid)
            .field("off", &self.off)
            .field("natts", &self.natts())
            .finish()
    }
}

/// Deforms heap-row attributes `nvalid..natts` into the slot arrays, resuming at the
/// saved byte offset.
///
/// # Safety
/// The slot must hold a live heap row matching its descriptor.
unsafe fn slot_deform_tuple(slot: &mut TupleTableSlot, natts: usize) {
    let row = slot.held_heap.clone();
    let Some(row) = row else { return };
    let desc = Arc::clone(&slot.desc);
    let mut attnum = slot.nvalid();
    let mut off = if attnum == 0 { 0 } else { slot.off as usize };
    let data = row.as_ptr().add(row.hoff());
    let (values, isnull) = slot.arrays_mut();

    while attnum < natts {
        if row.att_isnull(attnum) {
            values[attnum] = 0;
            isnull[attnum] = true;
            attnum += 1;
            continue;
        }
        let attr = desc.attr(attnum);
        off = align_offset(off, attr.align);
        let ptr = data.add(off);
        values[attnum] = fetch_att(ptr, attr);
        isnull[attnum] = false;
        off += att_addlength(ptr, attr);
        attnum += 1;
    }
    slot.nvalid = attnum as i32;
    slot.off = off as u64;
}

/// Regular implementation of partial deformation: makes attributes `1..=attnum` valid.
///
/// Attributes beyond what the stored row contains read as null. Requests beyond the
/// descriptor are clamped to it.
///
/// # Safety
/// `slot` must point at a live `TupleTableSlot`.
pub unsafe extern "C" fn slot_getsomeattrs(slot: *mut TupleTableSlot, attnum: i32) {
    let slot = &mut *slot;
    let attnum = (attnum.max(0) as usize).min(slot.natts());
    if slot.nvalid() >= attnum {
        return;
    }

    if let Some(row) = slot.held_heap.clone() {
        let stored = row.natts().min(attnum);
        if slot.nvalid() < stored {
            slot_deform_tuple(slot, stored);
        }
        let from = slot.nvalid();
        let (values, isnull) = slot.arrays_mut();
        values[from..attnum].fill(0);
        isnull[from..attnum].fill(true);
        slot.nvalid = attnum as i32;
        slot.flags |= TTS_VIRTUAL;
        return;
    }

    let from = slot.nvalid();
    let mem = slot.held_mem.clone();
    let (values, isnull) = slot.arrays_mut();
    match mem {
        Some(mem) => {
            for i in from..attnum {
                if i < mem.natts() {
                    values[i] = mem.values()[i];
                    isnull[i] = mem.isnull()[i];
                } else {
                    values[i] = 0;
                    isnull[i] = true;
                }
            }
        }
        None => {
            values[from..attnum].fill(0);
            isnull[from..attnum].fill(true);
        }
    }
    slot.nvalid = attnum as i32;
}

/// Regular single-attribute fetch. A null slot or an attribute outside the descriptor
/// reads as null.
///
/// # Safety
/// `slot` must be null or point at a live `TupleTableSlot`; `isnull` must be writable.
pub unsafe extern "C" fn slot_getattr(
    slot: *mut TupleTableSlot,
    attnum: i32,
    isnull: *mut bool,
) -> Datum {
    if slot.is_null() || attnum <= 0 || attnum as usize > (*slot).natts() {
        *isnull = true;
        return 0;
    }
    let slot = &mut *slot;
    if slot.nvalid < attnum {
        slot_getsomeattrs(slot, attnum);
    }
    let i = (attnum - 1) as usize;
    *isnull = slot.isnull()[i];
    slot.values()[i]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tuple::{Attribute, TupleValue};

    fn desc() -> Arc<TupleDesc> {
        Arc::new(TupleDesc::new(vec![
            Attribute::int4(),
            Attribute::int8(),
            Attribute::int2(),
            Attribute::int4(),
        ]))
    }

    fn row(values: &[TupleValue]) -> Arc<HeapTuple> {
        Arc::new(HeapTuple::form(&desc(), values))
    }

    #[test]
    fn test_new_slot_is_empty() {
        let slot = TupleTableSlot::new(desc());
        assert!(slot.is_empty());
        assert_eq!(slot.nvalid(), 0);
        assert_eq!(slot.values().len(), 4);
    }

    #[test]
    fn test_getsomeattrs_partial_then_rest() {
        let mut slot = TupleTableSlot::new(desc());
        slot.store_heap_tuple(row(&[
            TupleValue::Int(10),
            TupleValue::Int(-20),
            TupleValue::Int(30),
            TupleValue::Int(40),
        ]));
        slot.getsomeattrs(2);
        assert_eq!(slot.nvalid(), 2);
        assert_eq!(slot.offset(), 16);
        assert_eq!(slot.values()[1] as i64, -20);
        assert!(slot.is_virtual());

        slot.getsomeattrs(4);
        assert_eq!(slot.nvalid(), 4);
        assert_eq!(&slot.values()[2..], &[30, 40]);
        assert_eq!(slot.isnull(), &[false; 4]);
    }

    #[test]
    fn test_getsomeattrs_with_nulls() {
        let mut slot = TupleTableSlot::new(desc());
        slot.store_heap_tuple(row(&[
            TupleValue::Null,
            TupleValue::Int(2),
            TupleValue::Null,
            TupleValue::Int(4),
        ]));
        slot.getsomeattrs(4);
        assert_eq!(slot.isnull(), &[true, false, true, false]);
        assert_eq!(slot.values()[1], 2);
        assert_eq!(slot.values()[3], 4);
    }

    #[test]
    fn test_short_row_fills_tail_with_nulls() {
        let mut slot = TupleTableSlot::new(desc());
        slot.store_heap_tuple(row(&[TupleValue::Int(1), TupleValue::Int(2)]));
        slot.getsomeattrs(4);
        assert_eq!(slot.nvalid(), 4);
        assert_eq!(slot.isnull(), &[false, false, true, true]);
        assert_eq!(&slot.values()[2..], &[0, 0]);
    }

    #[test]
    fn test_mem_tuple_and_empty_slot() {
        let d = desc();
        let mut slot = TupleTableSlot::new(Arc::clone(&d));
        slot.getsomeattrs(2);
        assert_eq!(slot.isnull()[..2], [true, true]);

        let mem = Arc::new(MemTuple::new(&d, &[TupleValue::Int(7), TupleValue::Int(8)]));
        slot.store_mem_tuple(mem);
        slot.getsomeattrs(3);
        assert_eq!(&slot.values()[..2], &[7, 8]);
        assert!(slot.isnull()[2]);
    }

    #[test]
    fn test_getattr() {
        let mut slot = TupleTableSlot::new(desc());
        slot.store_heap_tuple(row(&[
            TupleValue::Int(1),
            TupleValue::Int(2),
            TupleValue::Int(3),
            TupleValue::Null,
        ]));
        assert_eq!(slot.getattr(3), (3, false));
        assert_eq!(slot.nvalid(), 3);
        assert_eq!(slot.getattr(4), (0, true));
        assert_eq!(slot.getattr(9), (0, true));

        let mut isnull = false;
        let value = unsafe { slot_getattr(std::ptr::null_mut(), 1, &mut isnull) };
        assert_eq!(value, 0);
        assert!(isnull);
    }

    #[test]
    fn test_store_virtual() {
        let mut slot = TupleTableSlot::new(desc());
        slot.store_virtual(&[5, 6], &[false, true]);
        assert!(slot.is_virtual());
        assert_eq!(slot.nvalid(), 4);
        assert_eq!(slot.isnull(), &[false, true, true, true]);
    }
}
