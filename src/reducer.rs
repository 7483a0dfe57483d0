//! Reducers decide what happens to the mapped value when an insert finds the
//! key already present: keep the existing value, replace it, or sum the two.
//!
//! The policy is a type parameter of the table so the choice costs nothing at
//! runtime. In particular [`DiscardReducer`] advertises itself through
//! [`Reducer::KEEPS_EXISTING`], letting the in-bucket match scan omit the
//! value-combine step entirely instead of calling a no-op.

/// Combines an existing mapped value with an incoming one on key collision.
pub trait Reducer<V> {
    /// `true` when the reducer never modifies the existing value, so callers
    /// may skip [`Reducer::reduce`] for matched keys.
    const KEEPS_EXISTING: bool = false;

    /// Fold `incoming` into `existing` in place.
    fn reduce(existing: &mut V, incoming: V);
}

/// Keeps the existing value; a colliding insert leaves the entry untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardReducer;

impl<V> Reducer<V> for DiscardReducer {
    const KEEPS_EXISTING: bool = true;

    #[inline(always)]
    fn reduce(_existing: &mut V, _incoming: V) {}
}

/// Replaces the existing value with the incoming one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceReducer;

impl<V> Reducer<V> for ReplaceReducer {
    #[inline(always)]
    fn reduce(existing: &mut V, incoming: V) {
        *existing = incoming;
    }
}

/// Sums the incoming value into the existing one. This is the counting
/// reducer: inserting every k-mer occurrence with value 1 yields per-key
/// multiplicities.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlusReducer;

impl<V> Reducer<V> for PlusReducer
where
    V: core::ops::Add<Output = V> + Copy,
{
    #[inline(always)]
    fn reduce(existing: &mut V, incoming: V) {
        *existing = *existing + incoming;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_keeps_existing() {
        assert!(<DiscardReducer as Reducer<u32>>::KEEPS_EXISTING);
        let mut v = 7u32;
        <DiscardReducer as Reducer<u32>>::reduce(&mut v, 9);
        assert_eq!(v, 7);
    }

    #[test]
    fn replace_takes_incoming() {
        let mut v = 7u32;
        <ReplaceReducer as Reducer<u32>>::reduce(&mut v, 9);
        assert_eq!(v, 9);
    }

    #[test]
    fn plus_sums() {
        assert!(!<PlusReducer as Reducer<u32>>::KEEPS_EXISTING);
        let mut v = 7u32;
        <PlusReducer as Reducer<u32>>::reduce(&mut v, 9);
        assert_eq!(v, 16);
    }
}
