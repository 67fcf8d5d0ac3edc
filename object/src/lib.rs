//! Tagged cell model of the runtime.
//!
//! Every value is a heap cell: a tag, a per-tag payload, a colour mark, and
//! the intrusive list links the collector splices. [`Value`] is the pointer
//! handle the rest of the system trades in. The per-tag trace and finalize
//! behaviour lives here, next to the payload definitions, so a new tag has a
//! single file to extend.

mod cell;
mod special;
mod value;

pub use cell::{Cell, CellData, Tag};
pub use special::Specials;
pub use value::Value;
