//! Utility
pub(crate) mod intrusive_list;
mod prio_bitmap;
pub use self::prio_bitmap::*;
