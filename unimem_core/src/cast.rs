/// Element-wise conversion between a host element type and a device element type.
///
/// When the host keeps data in one representation (say `f64`) and the device consumes another
/// (say `f32`), a mirrored object stages every transfer through a buffer of the device type and
/// calls `cast` once per element. Conversion must be a pure function of the element: the same
/// input always produces the same output, independently of its neighbours.
///
/// Every type converts to itself. All pairs of distinct primitive numeric types are provided
/// with `as` semantics, so narrowing conversions truncate or round exactly like an `as` cast.
///
/// # Examples:
///
/// ```
/// use unimem::memory::Cast;
///
/// let narrowed: f32 = 0.1f64.cast();
/// assert_eq!(0.1f32, narrowed);
/// let widened: f64 = 3u8.cast();
/// assert_eq!(3.0, widened);
/// let same: [u8; 2] = [1u8, 2].cast();
/// assert_eq!([1, 2], same);
/// ```
pub trait Cast<T> {
    /// Convert this element into the target element type.
    fn cast(self) -> T;
}

impl<T> Cast<T> for T {
    #[inline]
    fn cast(self) -> T {
        self
    }
}

macro_rules! impl_cast_from {
    ($from:ty => $($to:ty)*) => {
        $(
            impl Cast<$to> for $from {
                #[inline]
                fn cast(self) -> $to {
                    self as $to
                }
            }
        )*
    }
}

// Every pair of distinct numeric types; the identity is covered by the blanket impl.
impl_cast_from!(usize => u8 u16 u32 u64 isize i8 i16 i32 i64 f32 f64);
impl_cast_from!(u8 => usize u16 u32 u64 isize i8 i16 i32 i64 f32 f64);
impl_cast_from!(u16 => usize u8 u32 u64 isize i8 i16 i32 i64 f32 f64);
impl_cast_from!(u32 => usize u8 u16 u64 isize i8 i16 i32 i64 f32 f64);
impl_cast_from!(u64 => usize u8 u16 u32 isize i8 i16 i32 i64 f32 f64);
impl_cast_from!(isize => usize u8 u16 u32 u64 i8 i16 i32 i64 f32 f64);
impl_cast_from!(i8 => usize u8 u16 u32 u64 isize i16 i32 i64 f32 f64);
impl_cast_from!(i16 => usize u8 u16 u32 u64 isize i8 i32 i64 f32 f64);
impl_cast_from!(i32 => usize u8 u16 u32 u64 isize i8 i16 i64 f32 f64);
impl_cast_from!(i64 => usize u8 u16 u32 u64 isize i8 i16 i32 f32 f64);
impl_cast_from!(f32 => usize u8 u16 u32 u64 isize i8 i16 i32 i64 f64);
impl_cast_from!(f64 => usize u8 u16 u32 u64 isize i8 i16 i32 i64 f32);
