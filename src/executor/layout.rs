//! Field descriptor tables for the executor structures generated code touches.
//!
//! Generated code never sees Rust types, only byte offsets and machine types. The
//! tables carry a version so a generator built against one layout refuses to run
//! against another.

use std::mem::offset_of;

use crate::executor::exec::{ExprContext, ProjectionInfo, SlotSource};
use crate::executor::slot::TupleTableSlot;
use crate::executor::tuple::{HEADER_HOFF_OFFSET, HEADER_INFOMASK_OFFSET, HEADER_NATTS_OFFSET};

pub const LAYOUT_VERSION: u32 = 1;

/// Machine type of a structure member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    U8,
    U16,
    I32,
    U32,
    U64,
    Ptr,
}

/// Byte offset and machine type of one structure member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDesc {
    pub offset: i32,
    pub ty: FieldType,
}

impl FieldDesc {
    const fn new(offset: usize, ty: FieldType) -> Self {
        Self {
            offset: offset as i32,
            ty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFields {
    pub flags: FieldDesc,
    pub nvalid: FieldDesc,
    pub values: FieldDesc,
    pub isnull: FieldDesc,
    pub heap_tuple: FieldDesc,
    pub mem_tuple: FieldDesc,
    pub off: FieldDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleHeaderFields {
    pub natts: FieldDesc,
    pub infomask: FieldDesc,
    pub hoff: FieldDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprContextFields {
    pub scan_tuple: FieldDesc,
    pub inner_tuple: FieldDesc,
    pub outer_tuple: FieldDesc,
}

impl ExprContextFields {
    pub fn for_source(&self, source: SlotSource) -> FieldDesc {
        match source {
            SlotSource::Scan => self.scan_tuple,
            SlotSource::Inner => self.inner_tuple,
            SlotSource::Outer => self.outer_tuple,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionFields {
    pub expr_context: FieldDesc,
}

/// All field tables generated code relies on, tagged with a layout version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayouts {
    pub version: u32,
    pub slot: SlotFields,
    pub tuple_header: TupleHeaderFields,
    pub expr_context: ExprContextFields,
    pub projection: ProjectionFields,
}

impl FieldLayouts {
    /// The layout of the structures compiled into this binary.
    pub fn current() -> Self {
        Self {
            version: LAYOUT_VERSION,
            slot: SlotFields {
                flags: FieldDesc::new(offset_of!(TupleTableSlot, flags), FieldType::U32),
                nvalid: FieldDesc::new(offset_of!(TupleTableSlot, nvalid), FieldType::I32),
                values: FieldDesc::new(offset_of!(TupleTableSlot, values), FieldType::Ptr),
                isnull: FieldDesc::new(offset_of!(TupleTableSlot, isnull), FieldType::Ptr),
                heap_tuple: FieldDesc::new(
                    offset_of!(TupleTableSlot, heap_tuple),
                    FieldType::Ptr,
                ),
                mem_tuple: FieldDesc::new(offset_of!(TupleTableSlot, mem_tuple), FieldType::Ptr),
                off: FieldDesc::new(offset_of!(TupleTableSlot, off), FieldType::U64),
            },
            tuple_header: TupleHeaderFields {
                natts: FieldDesc::new(HEADER_NATTS_OFFSET, FieldType::U16),
                infomask: FieldDesc::new(HEADER_INFOMASK_OFFSET, FieldType::U16),
                hoff: FieldDesc::new(HEADER_HOFF_OFFSET, FieldType::U8),
            },
            expr_context: ExprContextFields {
                scan_tuple: FieldDesc::new(offset_of!(ExprContext, scan_tuple), FieldType::Ptr),
                inner_tuple: FieldDesc::new(offset_of!(ExprContext, inner_tuple), FieldType::Ptr),
                outer_tuple: FieldDesc::new(offset_of!(ExprContext, outer_tuple), FieldType::Ptr),
            },
            projection: ProjectionFields {
                expr_context: FieldDesc::new(
                    offset_of!(ProjectionInfo, expr_context),
                    FieldType::Ptr,
                ),
            },
        }
    }
}

impl Default for FieldLayouts {
    fn default() -> Self {
        Self::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_prefix_offsets() {
        let layouts = FieldLayouts::current();
        assert_eq!(layouts.version, LAYOUT_VERSION);
        assert_eq!(layouts.slot.flags.offset, 0);
        assert_eq!(layouts.slot.nvalid.offset, 4);
        assert_eq!(layouts.slot.values.offset, 8);
        assert_eq!(layouts.projection.expr_context.offset, 0);
    }

    #[test]
    fn test_expr_context_sources() {
        let fields = FieldLayouts::current().expr_context;
        assert_eq!(fields.for_source(SlotSource::Scan).offset, 0);
        assert_eq!(fields.for_source(SlotSource::Inner).offset, 8);
        assert_eq!(fields.for_source(SlotSource::Outer).offset, 16);
    }
}
