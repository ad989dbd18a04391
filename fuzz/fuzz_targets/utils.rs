pub const MAX_INPUT_SIZE: usize = 256 * 1024;

/// Caps fuzzer input to avoid OOM and quadratic behavior on pathological
/// inputs.
#[inline]
pub fn truncate(data: &[u8]) -> &[u8] {
    &data[..data.len().min(MAX_INPUT_SIZE)]
}
