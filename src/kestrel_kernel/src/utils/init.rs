#![allow(clippy::declare_interior_mutable_const)]

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
///
/// Kernel control blocks are placed in `static`s created by [`build!`], so
/// every type stored in them must be able to produce its initial value in a
/// constant context.
///
/// [`build!`]: crate::build
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl Init for &'_ str {
    const INIT: Self = "";
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

macro_rules! impl_init {
    (
        $(
            $ty:ty => $value:expr,
        )*
    ) => {
        $(
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    u8 => 0,
    u32 => 0,
    usize => 0,
}
