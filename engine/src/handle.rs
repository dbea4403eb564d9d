//! Opaque `u64` handles exchanged over the command/event rings: the
//! service thread boxes a heap value, leaks its
//! pointer as a `u64`, and hands it to the audio thread through
//! [`crate::protocol::Command`]; the audio thread reconstructs the `Box`,
//! takes ownership, and — for values it must hand back, like a retired
//! [`crate::runtime::PedalboardRuntime`] — leaks the old value's pointer
//! back the same way via [`crate::protocol::Event`] so the service thread
//! can reconstruct it and drop it off the audio thread. Exactly one
//! directional transfer per handle; never locked.

/// Boxes `value` and returns its address as an opaque handle.
pub fn leak_handle<T>(value: T) -> u64 {
    Box::into_raw(Box::new(value)) as usize as u64
}

/// Reclaims a value previously leaked by [`leak_handle::<T>`].
///
/// # Safety
/// `handle` must have come from `leak_handle::<T>` for this same `T`, and
/// must not have already been consumed by a previous call to this
/// function — each handle crosses exactly once.
pub unsafe fn take_handle<T>(handle: u64) -> T {
    *Box::from_raw(handle as usize as *mut T)
}
