// Marks a branch that the allocator invariants rule out
macro_rules! assume_unreachable {
    () => {
        $crate::macros::unreachable()
    };
}

// Panics in debug builds; in release builds the branch is assumed to be dead code
#[cold]
pub(crate) fn unreachable() -> ! {
    if cfg!(debug_assertions) {
        unreachable!()
    } else {
        unsafe { core::hint::unreachable_unchecked() }
    }
}
