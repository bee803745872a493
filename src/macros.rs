//! # Internal Macros
//!
//! Accessor generation for zerocopy header structs. The index file format is
//! big-endian throughout, so fields use `zerocopy::big_endian` wrapper types
//! and these macros generate the `get`/`set` pairs against native integers.
//!
//! ```ignore
//! use zerocopy::big_endian::U32;
//!
//! #[repr(C)]
//! struct TreePrelude {
//!     byte_length: U32,
//! }
//!
//! impl TreePrelude {
//!     zerocopy_accessors! {
//!         byte_length: u32,
//!     }
//! }
//! // generates byte_length() -> u32 and set_byte_length(u32)
//! ```

/// Generates getter and setter methods for zerocopy big-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::big_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::big_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::big_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
