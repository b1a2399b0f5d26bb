use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::executor::{ExprContext, ExprState, ProjectionInfo, TupleTableSlot};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("deform-jit requires a 64-bit target: a Datum must be as wide as both a pointer and an i64");

/// Executor word holding either a pass-by-value attribute or a pointer to one.
pub type Datum = usize;

/// Deforms a slot's current row so that at least `attnum` attributes are valid.
pub type SlotGetSomeAttrsFn = unsafe extern "C" fn(*mut TupleTableSlot, i32);

/// Projects plain column references of a target list into `values`/`isnull`.
pub type ExecVariableListFn = unsafe extern "C" fn(*mut ProjectionInfo, *mut Datum, *mut bool);

/// Evaluates one scalar expression, writing its null flag through the last argument.
pub type ExecEvalExprFn = unsafe extern "C" fn(*mut ExprState, *mut ExprContext, *mut bool) -> Datum;

/// Fetches a single attribute (1-based) from a slot.
pub type SlotGetAttrFn = unsafe extern "C" fn(*mut TupleTableSlot, i32, *mut bool) -> Datum;

/// Binary comparison primitive returning a boolean Datum.
pub type PrimitiveFn = unsafe extern "C" fn(Datum, Datum) -> Datum;

/// Three-way comparison helper returning -1, 0 or 1.
pub type CmpHelperFn = unsafe extern "C" fn(Datum, Datum) -> i32;

pub(crate) type ReportFallbackFn = extern "C" fn(u32, i32);
pub(crate) type FillBytesFn = unsafe extern "C" fn(*mut u8, i32, u64);

/// Machine-level parameter and return types used to describe native signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiType {
    Ptr,
    I8,
    I32,
    I64,
}

/// A native function-pointer type that generated code can implement or call.
///
/// Implementors describe their ABI so the backend can build a matching Cranelift
/// signature, and convert to and from raw code addresses.
pub trait CodegenFn: Copy + 'static {
    const PARAMS: &'static [AbiType];
    const RETURNS: Option<AbiType>;

    fn addr(self) -> usize;

    /// # Safety
    /// `addr` must be the entry point of a function with exactly this signature.
    unsafe fn from_addr(addr: usize) -> Self;
}

macro_rules! impl_codegen_fn {
    ($ty:ty, [$($param:ident),*], $ret:expr) => {
        impl CodegenFn for $ty {
            const PARAMS: &'static [AbiType] = &[$(AbiType::$param),*];
            const RETURNS: Option<AbiType> = $ret;

            fn addr(self) -> usize {
                self as usize
            }

            unsafe fn from_addr(addr: usize) -> Self {
                std::mem::transmute::<usize, $ty>(addr)
            }
        }
    };
}

impl_codegen_fn!(SlotGetSomeAttrsFn, [Ptr, I32], None);
impl_codegen_fn!(ExecVariableListFn, [Ptr, Ptr, Ptr], None);
impl_codegen_fn!(ExecEvalExprFn, [Ptr, Ptr, Ptr], Some(AbiType::I64));
impl_codegen_fn!(SlotGetAttrFn, [Ptr, I32, Ptr], Some(AbiType::I64));
impl_codegen_fn!(PrimitiveFn, [I64, I64], Some(AbiType::I64));
impl_codegen_fn!(CmpHelperFn, [I64, I64], Some(AbiType::I32));
impl_codegen_fn!(ReportFallbackFn, [I32, I32], None);
impl_codegen_fn!(FillBytesFn, [Ptr, I32, I64], None);

/// The function-pointer variable an operator calls through.
///
/// It starts out pointing at the regular implementation and is rewritten at most
/// once per session, by a single atomic store, when the specialized version has
/// been compiled.
pub struct CallSite<F: CodegenFn> {
    chosen: AtomicUsize,
    _marker: PhantomData<F>,
}

impl<F: CodegenFn> CallSite<F> {
    pub fn new(regular: F) -> Arc<Self> {
        Arc::new(Self {
            chosen: AtomicUsize::new(regular.addr()),
            _marker: PhantomData,
        })
    }

    /// Returns the function the call site currently dispatches to.
    pub fn get(&self) -> F {
        // SAFETY: only addresses of functions with signature `F` are ever stored.
        unsafe { F::from_addr(self.chosen.load(Ordering::Acquire)) }
    }

    pub fn addr(&self) -> usize {
        self.chosen.load(Ordering::Acquire)
    }

    pub fn points_to(&self, f: F) -> bool {
        self.addr() == f.addr()
    }

    pub(crate) fn set(&self, f: F) {
        self.chosen.store(f.addr(), Ordering::Release);
    }
}

impl<F: CodegenFn> std::fmt::Debug for CallSite<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallSite({:#x})", self.addr())
    }
}

pub fn int4_datum(v: i32) -> Datum {
    v as i64 as Datum
}

pub fn int8_datum(v: i64) -> Datum {
    v as Datum
}

pub fn float8_datum(v: f64) -> Datum {
    v.to_bits() as Datum
}

pub fn bool_datum(v: bool) -> Datum {
    v as Datum
}

pub fn datum_get_int4(d: Datum) -> i32 {
    d as u32 as i32
}

pub fn datum_get_int8(d: Datum) -> i64 {
    d as i64
}

pub fn datum_get_float8(d: Datum) -> f64 {
    f64::from_bits(d as u64)
}

pub fn datum_get_bool(d: Datum) -> bool {
    d != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn regular(_: *mut TupleTableSlot, _: i32) {}
    unsafe extern "C" fn other(_: *mut TupleTableSlot, _: i32) {}

    #[test]
    fn test_call_site_starts_at_regular() {
        let site = CallSite::new(regular as SlotGetSomeAttrsFn);
        assert!(site.points_to(regular));
        assert!(!site.points_to(other));
    }

    #[test]
    fn test_call_site_set() {
        let site = CallSite::new(regular as SlotGetSomeAttrsFn);
        site.set(other);
        assert!(site.points_to(other));
        assert_eq!(site.get() as usize, other as usize);
    }

    #[test]
    fn test_datum_conversions() {
        assert_eq!(datum_get_int4(int4_datum(-7)), -7);
        assert_eq!(int4_datum(-1), usize::MAX);
        assert_eq!(datum_get_int8(int8_datum(i64::MIN)), i64::MIN);
        assert_eq!(datum_get_float8(float8_datum(2.5)), 2.5);
        assert!(datum_get_bool(bool_datum(true)));
        assert!(!datum_get_bool(bool_datum(false)));
    }

    #[test]
    fn test_signature_descriptions() {
        assert_eq!(
            <SlotGetSomeAttrsFn as CodegenFn>::PARAMS,
            &[AbiType::Ptr, AbiType::I32]
        );
        assert_eq!(<ExecEvalExprFn as CodegenFn>::RETURNS, Some(AbiType::I64));
        assert_eq!(<ExecVariableListFn as CodegenFn>::RETURNS, None);
    }
}
