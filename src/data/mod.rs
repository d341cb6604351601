//! Data-field layer: typed puts/gets on top of the record codec, plus the
//! struct-descriptor transform engine.

pub mod fields;
pub mod read;
pub mod write;

pub use fields::{
    FieldAccess, FieldXfer, FieldXferFn, SsmField, STRUCT_MARKER_BEGIN, STRUCT_MARKER_END,
    STRUCT_NO_LEAD_MARKER, STRUCT_NO_MARKERS, STRUCT_NO_TAIL_MARKER, STRUCT_DONT_IGNORE,
    STRUCT_FULL_STRUCT,
};
