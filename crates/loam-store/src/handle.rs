/// Shared retain/release lifecycle implemented by every store entity.
///
/// Retain counts are mutated only by tasks on the entity's own serial
/// queue, so both calls return immediately; the effect is ordered after all
/// previously submitted operations on the same entity. When a release
/// brings the count to zero, the entity's resources (cached handles, chunk
/// mappings, file descriptors, payload buffers) are freed by a background
/// task, observable through
/// [`wait_for_completion`](loam_dispatch::wait_for_completion), not
/// synchronously.
pub trait Managed {
    /// Increment the retain count.
    fn retain(&self);

    /// Decrement the retain count, scheduling teardown at zero.
    fn release(&self);

    /// Read the current retain count, blocking until previously enqueued
    /// retain/release operations have been applied. Intended for tests and
    /// inspection.
    fn retain_count(&self) -> u32;
}
