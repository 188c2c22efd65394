//! This module contains private sealed traits that should not be used or implemented outside of
//! unimem. These traits are public because they are used as bounds in certain functions.
//! These traits may change in any way at any time with no warning, and this will not be considered
//! a breaking change.

pub trait Sealed {}
