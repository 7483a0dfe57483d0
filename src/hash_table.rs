//! An open-addressing hash table using Robin Hood hashing with per-bucket
//! offset metadata.
//!
//! Every logical bucket owns one metadata octet. The high bit flags the
//! bucket as empty; the low seven bits record the *offset*: the distance, in
//! slots, from the bucket's index to the first payload slot holding an entry
//! that hashed to this bucket. Entries for bucket `i` occupy the half-open
//! payload range `[i + off(i), i + 1 + off(i + 1))`, so two adjacent metadata
//! reads delimit a bucket's entries exactly, with no scanning for a range
//! start and no per-entry probe-distance bookkeeping.
//!
//! ## Design
//!
//! The offset scheme buys three things over classic Robin Hood probing:
//!
//! - **Range lookups are two loads.** `find` reads `off(i)` and `off(i + 1)`
//!   and scans only the slots in between; a miss in an empty bucket is a
//!   single metadata load.
//! - **Probes can leapfrog.** An offset at any position bounds the run of
//!   occupied payload slots ahead of it, so the search for the next free slot
//!   and for the end of a shift region jump by the stored offset instead of
//!   stepping slot by slot.
//! - **Shifts are block moves.** Insert and erase displace the contiguous run
//!   of entries after the affected slot by exactly one position, which is a
//!   single overlapping memory copy plus an increment (or decrement) sweep
//!   over the metadata run.
//!
//! Offsets saturate at 127. An insert that would push any offset past that
//! returns a sentinel instead of mutating, and the caller doubles the table
//! and retries; this bounds worst-case probe cost regardless of load factor.
//! Shrinking runs the inverse check up front and is silently refused when the
//! merged buckets would need an offset past 127.
//!
//! The bucket count `B` is always a power of two so bucket selection is a
//! mask. Both arrays are `B + 128` long: the 128-slot tail pad (the maximum
//! representable offset, plus the slot it delimits) absorbs every shift past
//! the last bucket, so no operation wraps around.
//!
//! Metadata and payload are parallel regions of one allocation rather than an
//! array of structs: a metadata prefetch pulls 64 buckets per cache line,
//! while payload prefetches touch only the records a probe will visit.
//!
//! Bulk operations pipeline their memory traffic. Hashes for the whole input
//! are computed once into an aligned scratch buffer and simultaneously fed to
//! a [`HyperLogLog`] sketch; the sketch (merged with the sketch retained from
//! prior batches) sizes the table *before* insertion starts, which in the
//! common case removes all mid-batch rehashing. The insert loop then runs a
//! two-deep look-ahead: at item `i` it prefetches the scratch and input at
//! `i + 2L`, the metadata word for item `i + 2L`, and the payload range for
//! item `i + L`, hiding DRAM latency behind the work of the current probe.
//! Load-factor checks run once per chunk of remaining headroom, not per item.
//! Queries and erases use the same discipline with a `2L` ring of hashes.
//!
//! ## Safety invariants
//!
//! The unsafe code relies on the following, re-established after every
//! mutating operation:
//!
//! 1. **Initialization tracking.** Payload slot `s` holds an initialized
//!    `(K, V)` if and only if `info[s] != EMPTY` (an empty-flagged octet with
//!    a non-zero offset means the *slot* is occupied by an entry shifted from
//!    an earlier bucket, even though the *bucket* owns no entries).
//! 2. **Range coverage.** The ranges `[i + off(i), i + 1 + off(i + 1))` of
//!    non-empty buckets partition the occupied slots; every key in bucket
//!    `i`'s range satisfies `hash(key) & mask == i`.
//! 3. **Bounded offsets.** `off(i) <= 127` and `off(i + 1) <= off(i) + 1`
//!    everywhere, which confines all probing and shifting to the allocated
//!    `B + 128` slots; past the last occupied slot `E` (exclusive), pad
//!    metadata holds `EMPTY | (E - i)` so cross-boundary probes terminate.
//! 4. **Trivial relocation.** `K: Copy` and `V: Copy`, so the overlapping
//!    block moves used by shift-insert and back-shift erase need no drop or
//!    ownership bookkeeping.

use std::alloc::alloc;
use std::alloc::dealloc;
use std::alloc::handle_alloc_error;
use std::alloc::Layout;
#[cfg(target_arch = "x86")]
use std::arch::x86::_mm_prefetch;
#[cfg(target_arch = "x86")]
use std::arch::x86::_MM_HINT_T0;
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::_mm_prefetch;
#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::_MM_HINT_T0;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use crate::hll::HyperLogLog;
use crate::reducer::DiscardReducer;
use crate::reducer::Reducer;

/// Metadata octet for an empty bucket with offset zero; doubles as the empty
/// flag (high bit) and the only value that marks a payload slot free.
const EMPTY: u8 = 0x80;

/// Low seven bits of a metadata octet.
const OFFSET_MASK: u8 = 0x7f;

/// Largest representable offset. A shift that would exceed it aborts the
/// insert with the failed sentinel.
const MAX_OFFSET: usize = OFFSET_MASK as usize;

/// Tail pad length past the last bucket; equals `MAX_OFFSET + 1` so the
/// furthest reachable slot is always allocated.
const PAD: usize = 128;

/// Bucket count of a default-constructed table.
const DEFAULT_BUCKETS: usize = 128;

/// Smallest bucket count a table will shrink to.
const MIN_BUCKETS: usize = 8;

/// Default look-ahead distance for the prefetch pipelines.
const DEFAULT_LOOKAHEAD: usize = 16;

const DEFAULT_MIN_LOAD_FACTOR: f64 = 0.35;
const DEFAULT_MAX_LOAD_FACTOR: f64 = 0.80;

const CACHELINE_BYTES: usize = 64;

#[inline(always)]
fn is_empty_info(info: u8) -> bool {
    info >= EMPTY
}

#[inline(always)]
fn is_normal(info: u8) -> bool {
    info < EMPTY
}

#[inline(always)]
fn offset(info: u8) -> usize {
    (info & OFFSET_MASK) as usize
}

#[inline(always)]
fn set_normal(info: &mut u8) {
    *info &= OFFSET_MASK;
}

#[inline(always)]
fn set_empty(info: &mut u8) {
    *info |= EMPTY;
}

#[inline(always)]
fn pairs_per_cacheline<K, V>() -> usize {
    (CACHELINE_BYTES / std::mem::size_of::<(K, V)>().max(1)).max(1)
}

/// Prefetches the cache line holding `ptr` into L1.
///
/// # Safety
///
/// The caller must ensure that `ptr` points into an allocation that is valid
/// for reads. While `_mm_prefetch` might not fault on invalid addresses, the
/// behavior is undefined if the address is not valid for reads.
#[inline(always)]
unsafe fn prefetch<T>(ptr: *const T) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    // SAFETY: The caller guarantees `ptr` is valid for reads.
    unsafe {
        _mm_prefetch(ptr as *const i8, _MM_HINT_T0);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let _ = ptr;
}

/// The table failed to allocate (or grow) its aligned backing storage.
///
/// Growth paths surface this instead of panicking; the table is left in the
/// state it had before the failed operation began allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("failed to allocate aligned memory")
    }
}

impl std::error::Error for AllocError {}

/// Probe result packed into one word: the high bit records whether the key
/// was found, the low 63 bits give the payload index (the match position, or
/// the slot an insert would use). The all-low-bits-set value is the
/// insert-failed sentinel produced by offset overflow.
#[derive(Clone, Copy, PartialEq, Eq)]
struct PackedSlot(u64);

impl PackedSlot {
    const PRESENT: u64 = 1 << 63;
    const FAILED: PackedSlot = PackedSlot(!Self::PRESENT);

    #[inline(always)]
    fn found(pos: usize) -> Self {
        PackedSlot(pos as u64 | Self::PRESENT)
    }

    #[inline(always)]
    fn missing(pos: usize) -> Self {
        PackedSlot(pos as u64)
    }

    #[inline(always)]
    fn present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    #[inline(always)]
    fn pos(self) -> usize {
        (self.0 & !Self::PRESENT) as usize
    }

    #[inline(always)]
    fn failed(self) -> bool {
        self == Self::FAILED
    }
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    payload_offset: usize,
}

impl DataLayout {
    fn new<K, V>(slots: usize) -> Result<Self, AllocError> {
        let info = Layout::from_size_align(slots, 16).map_err(|_| AllocError)?;
        let payload = Layout::array::<MaybeUninit<(K, V)>>(slots)
            .and_then(|l| l.align_to(16))
            .map_err(|_| AllocError)?;
        let (layout, payload_offset) = info.extend(payload).map_err(|_| AllocError)?;
        Ok(DataLayout {
            layout,
            payload_offset,
        })
    }
}

/// One allocation holding the two parallel arrays: `slots` metadata octets
/// followed by `slots` payload slots, both regions 16-byte aligned.
struct Arrays<K, V> {
    layout: DataLayout,
    alloc: NonNull<u8>,
    slots: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Arrays<K, V> {
    /// Allocates arrays for `buckets` logical buckets plus the tail pad, with
    /// all metadata initialized to [`EMPTY`].
    fn alloc(buckets: usize) -> Result<Self, AllocError> {
        let slots = buckets + PAD;
        let layout = DataLayout::new::<K, V>(slots)?;
        // SAFETY: `layout.layout` has non-zero size (`slots >= PAD`). A null
        // return is translated into an error; on success the metadata region
        // is filled with EMPTY so invariant 1 holds for the fresh table.
        let alloc = unsafe {
            let raw = alloc(layout.layout);
            let ptr = NonNull::new(raw).ok_or(AllocError)?;
            std::ptr::write_bytes(raw, EMPTY, slots);
            ptr
        };
        Ok(Arrays {
            layout,
            alloc,
            slots,
            _marker: PhantomData,
        })
    }

    #[inline(always)]
    fn info(&self) -> &[u8] {
        // SAFETY: the metadata region starts at offset 0 and spans `slots`
        // bytes of our live allocation.
        unsafe { std::slice::from_raw_parts(self.alloc.as_ptr(), self.slots) }
    }

    #[inline(always)]
    fn info_mut(&mut self) -> &mut [u8] {
        // SAFETY: as `info`, with unique access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.alloc.as_ptr(), self.slots) }
    }

    #[inline(always)]
    fn payload(&self) -> &[MaybeUninit<(K, V)>] {
        // SAFETY: the payload region starts at `payload_offset` and spans
        // `slots` elements of our live allocation. Exposing it as
        // `MaybeUninit` makes no claim about initialization.
        unsafe {
            std::slice::from_raw_parts(
                self.alloc.as_ptr().add(self.layout.payload_offset).cast(),
                self.slots,
            )
        }
    }

    /// Splits the allocation into its two disjoint regions for operations
    /// that mutate metadata and payload together.
    #[inline(always)]
    fn parts_mut(&mut self) -> (&mut [u8], &mut [MaybeUninit<(K, V)>]) {
        // SAFETY: the two regions never overlap (`payload_offset >= slots`),
        // so handing out simultaneous unique slices is sound.
        unsafe {
            (
                std::slice::from_raw_parts_mut(self.alloc.as_ptr(), self.slots),
                std::slice::from_raw_parts_mut(
                    self.alloc.as_ptr().add(self.layout.payload_offset).cast(),
                    self.slots,
                ),
            )
        }
    }
}

impl<K, V> Drop for Arrays<K, V> {
    fn drop(&mut self) {
        // SAFETY: `alloc` came from the global allocator with exactly this
        // layout. Payload entries are `Copy` and need no drop.
        unsafe {
            dealloc(self.alloc.as_ptr(), self.layout.layout);
        }
    }
}

/// Aligned scratch buffer for precomputed hashes during a bulk insert.
struct HashScratch {
    ptr: NonNull<u64>,
    len: usize,
    layout: Layout,
}

impl HashScratch {
    fn alloc(len: usize) -> Result<Self, AllocError> {
        debug_assert!(len > 0);
        let layout = Layout::array::<u64>(len)
            .and_then(|l| l.align_to(16))
            .map_err(|_| AllocError)?;
        // SAFETY: `layout` has non-zero size; zeroed storage makes every word
        // a valid `u64` before the fill pass overwrites it.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast()).ok_or(AllocError)?;
        Ok(HashScratch { ptr, len, layout })
    }

    #[inline(always)]
    fn as_slice(&self) -> &[u64] {
        // SAFETY: `len` words were allocated and zero-initialized.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline(always)]
    fn as_mut_slice(&mut self) -> &mut [u64] {
        // SAFETY: as `as_slice`, with unique access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HashScratch {
    fn drop(&mut self) {
        // SAFETY: allocated with exactly this layout. Being a stack value,
        // the scratch is released on every exit path of the bulk insert,
        // including the error paths.
        unsafe {
            dealloc(self.ptr.as_ptr().cast(), self.layout);
        }
    }
}

/// Occupancy and resize statistics for a table.
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct TableStats {
    /// Number of live entries.
    pub entries: usize,
    /// Current bucket count.
    pub buckets: usize,
    /// Entries divided by the max-load capacity.
    pub load_factor: f64,
    /// Largest metadata offset currently in use.
    pub max_offset: usize,
    /// Number of capacity doublings performed so far.
    pub upsizes: usize,
    /// Number of capacity reductions performed so far.
    pub downsizes: usize,
}

#[cfg(feature = "stats")]
impl TableStats {
    /// Pretty-prints the statistics to stdout.
    pub fn print(&self) {
        println!("=== table statistics ===");
        println!(
            "entries: {} in {} buckets ({:.2}% of max load)",
            self.entries,
            self.buckets,
            self.load_factor * 100.0
        );
        println!("max offset: {}", self.max_offset);
        println!("resizes: {} up, {} down", self.upsizes, self.downsizes);
    }
}

/// The offset-indexed Robin Hood hash table.
///
/// `HashTable<K, V, R>` stores `(K, V)` pairs and combines the values of
/// colliding keys through the reducer policy `R`. This is a low-level
/// structure: every operation takes the key's 64-bit hash, and mutating
/// operations take the hash function itself, which they need to rehash
/// existing entries when they resize. Prefer
/// [`HashMap`](crate::hash_map::HashMap) unless you are managing hashes
/// yourself.
///
/// Keys and values must be `Copy`: inserts and erases relocate entries with
/// block memory moves.
pub struct HashTable<K, V, R = DiscardReducer> {
    arrays: Arrays<K, V>,
    buckets: usize,
    mask: usize,
    size: usize,
    min_load: usize,
    max_load: usize,
    min_load_factor: f64,
    max_load_factor: f64,
    insert_lookahead: usize,
    query_lookahead: usize,
    sketch: HyperLogLog,
    upsizes: usize,
    downsizes: usize,
    _reduce: PhantomData<R>,
}

impl<K, V, R> Debug for HashTable<K, V, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTable")
            .field("size", &self.size)
            .field("buckets", &self.buckets)
            .field("max_load", &self.max_load)
            .finish()
    }
}

impl<K, V, R> Clone for HashTable<K, V, R> {
    fn clone(&self) -> Self {
        let arrays = match Arrays::alloc(self.buckets) {
            Ok(arrays) => arrays,
            Err(_) => handle_alloc_error(self.arrays.layout.layout),
        };
        // SAFETY: source and destination share the same layout; an untyped
        // copy of the whole allocation reproduces the metadata and every
        // occupied payload slot (entries are `Copy`), while uninitialized
        // payload bytes stay uninitialized-but-unread on the clone.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.arrays.alloc.as_ptr(),
                arrays.alloc.as_ptr(),
                self.arrays.layout.layout.size(),
            );
        }
        Self {
            arrays,
            buckets: self.buckets,
            mask: self.mask,
            size: self.size,
            min_load: self.min_load,
            max_load: self.max_load,
            min_load_factor: self.min_load_factor,
            max_load_factor: self.max_load_factor,
            insert_lookahead: self.insert_lookahead,
            query_lookahead: self.query_lookahead,
            sketch: self.sketch.clone(),
            upsizes: self.upsizes,
            downsizes: self.downsizes,
            _reduce: PhantomData,
        }
    }
}

impl<K, V, R> Default for HashTable<K, V, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, R> HashTable<K, V, R> {
    /// Creates a table with the default bucket count (128).
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }

    /// Creates a table with at least `buckets` buckets, rounded up to a
    /// power of two (minimum 8).
    pub fn with_buckets(buckets: usize) -> Self {
        let buckets = buckets.max(MIN_BUCKETS).next_power_of_two();
        let arrays = match Arrays::alloc(buckets) {
            Ok(arrays) => arrays,
            Err(_) => match DataLayout::new::<K, V>(buckets + PAD) {
                Ok(layout) => handle_alloc_error(layout.layout),
                Err(_) => panic!("allocation size overflow"),
            },
        };
        Self {
            arrays,
            buckets,
            mask: buckets - 1,
            size: 0,
            min_load: (buckets as f64 * DEFAULT_MIN_LOAD_FACTOR) as usize,
            max_load: (buckets as f64 * DEFAULT_MAX_LOAD_FACTOR) as usize,
            min_load_factor: DEFAULT_MIN_LOAD_FACTOR,
            max_load_factor: DEFAULT_MAX_LOAD_FACTOR,
            insert_lookahead: DEFAULT_LOOKAHEAD,
            query_lookahead: DEFAULT_LOOKAHEAD,
            sketch: HyperLogLog::new(),
            upsizes: 0,
            downsizes: 0,
            _reduce: PhantomData,
        }
    }

    /// Creates a table sized so that `entries` entries fit without resizing
    /// at the default maximum load factor.
    pub fn with_capacity(entries: usize) -> Self {
        Self::with_buckets((entries as f64 / DEFAULT_MAX_LOAD_FACTOR) as usize)
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` if the table contains no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the current bucket count.
    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// Returns how many entries fit before the next capacity doubling.
    pub fn capacity(&self) -> usize {
        self.max_load
    }

    /// Removes all entries, keeping the current capacity.
    ///
    /// The retained cardinality sketch is reset as well, so presizing for
    /// later batches starts from a clean slate.
    pub fn clear(&mut self) {
        self.size = 0;
        self.arrays.info_mut().fill(EMPTY);
        self.sketch.clear();
    }

    /// Bias-corrected estimate of the number of distinct keys offered to the
    /// batch insert path since construction or the last [`clear`].
    ///
    /// [`clear`]: HashTable::clear
    pub fn cardinality_estimate(&self) -> f64 {
        self.sketch.estimate()
    }

    /// Sets the load factor below which erases shrink the table.
    ///
    /// Must be less than the maximum load factor; violating that is a caller
    /// error and leaves resize behavior unspecified.
    pub fn set_min_load_factor(&mut self, factor: f64) {
        debug_assert!(factor < self.max_load_factor);
        self.min_load_factor = factor;
        self.min_load = (self.buckets as f64 * factor) as usize;
    }

    /// Sets the load factor at which inserts double the table.
    pub fn set_max_load_factor(&mut self, factor: f64) {
        debug_assert!(factor > self.min_load_factor);
        self.max_load_factor = factor;
        self.max_load = (self.buckets as f64 * factor) as usize;
    }

    /// Sets the look-ahead distance of the bulk insert pipeline.
    pub fn set_insert_lookahead(&mut self, lookahead: usize) {
        self.insert_lookahead = lookahead.max(1);
    }

    /// Sets the look-ahead distance of the query and erase pipelines,
    /// rounded up to a power of two (the hash ring is mask-indexed).
    pub fn set_query_lookahead(&mut self, lookahead: usize) {
        self.query_lookahead = lookahead.max(1).next_power_of_two();
    }

    /// Occupancy and resize statistics.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> TableStats {
        let max_offset = self
            .arrays
            .info()
            .iter()
            .map(|&info| offset(info))
            .max()
            .unwrap_or(0);
        TableStats {
            entries: self.size,
            buckets: self.buckets,
            load_factor: if self.max_load == 0 {
                0.0
            } else {
                self.size as f64 / self.max_load as f64
            },
            max_offset,
            upsizes: self.upsizes,
            downsizes: self.downsizes,
        }
    }

    /// Returns an iterator over the live entries in payload order.
    ///
    /// The order is neither insertion order nor key order, and is not stable
    /// across mutations.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            info: self.arrays.info(),
            payload: self.arrays.payload(),
            index: 0,
        }
    }
}

impl<K, V, R> HashTable<K, V, R>
where
    K: Copy + Eq,
    V: Copy,
    R: Reducer<V>,
{
    /// Ensures capacity for at least `entries` entries at the current
    /// maximum load factor, rehashing with `hash_fn` if the bucket count
    /// changes.
    pub fn reserve(
        &mut self,
        entries: usize,
        hash_fn: impl Fn(&K) -> u64,
    ) -> Result<(), AllocError> {
        let target = (entries as f64 / self.max_load_factor) as usize;
        self.rehash(target, &hash_fn)
    }

    /// Inserts `(key, value)`, combining values with the reducer when the
    /// key is already present. Returns whether the key was newly inserted.
    ///
    /// `hash` must equal `hash_fn(&key)`.
    pub fn insert(
        &mut self,
        hash: u64,
        key: K,
        value: V,
        hash_fn: impl Fn(&K) -> u64,
    ) -> Result<bool, AllocError> {
        if self.size >= self.max_load {
            self.rehash(self.buckets << 1, &hash_fn)?;
        }
        let before = self.size;
        self.insert_hashed(hash, (key, value), &hash_fn)?;
        Ok(self.size != before)
    }

    /// Bulk insert with cardinality presizing and prefetch pipelining.
    ///
    /// One pass hashes every key into an aligned scratch buffer while
    /// feeding a local [`HyperLogLog`]; the local sketch is merged into the
    /// sketch retained from earlier batches and the combined estimate
    /// reserves capacity before any entry moves. The insert loop then runs
    /// with a two-deep prefetch look-ahead and per-chunk load checks.
    pub fn insert_batch(
        &mut self,
        items: &[(K, V)],
        hash_fn: impl Fn(&K) -> u64,
    ) -> Result<(), AllocError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut scratch = HashScratch::alloc(items.len())?;
        let mut local = HyperLogLog::new();
        {
            let hashes = scratch.as_mut_slice();
            for (i, (key, _)) in items.iter().enumerate() {
                let hash = hash_fn(key);
                local.update(hash);
                hashes[i] = hash;
            }
        }
        self.sketch.merge(&local);
        let estimate = self.sketch.estimate() as usize;
        self.reserve(estimate, &hash_fn)?;
        self.insert_batch_hashed(items, scratch.as_slice(), &hash_fn)
    }

    /// Returns the entry for `key`, or `None` if absent.
    pub fn find(&self, hash: u64, key: &K) -> Option<&(K, V)> {
        let slot = self.find_pos_with_hint(key, (hash as usize) & self.mask);
        if slot.present() {
            // SAFETY: a present probe result points at an initialized slot
            // (invariant 1).
            Some(unsafe { self.arrays.payload()[slot.pos()].assume_init_ref() })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the value stored for `key`.
    pub fn find_value_mut(&mut self, hash: u64, key: &K) -> Option<&mut V> {
        let slot = self.find_pos_with_hint(key, (hash as usize) & self.mask);
        if slot.present() {
            let (_, payload) = self.arrays.parts_mut();
            // SAFETY: a present probe result points at an initialized slot.
            let (_, value) = unsafe { payload[slot.pos()].assume_init_mut() };
            Some(value)
        } else {
            None
        }
    }

    /// Returns whether `key` is present.
    pub fn contains(&self, hash: u64, key: &K) -> bool {
        self.find_pos_with_hint(key, (hash as usize) & self.mask)
            .present()
    }

    /// Returns 1 if `key` is present and 0 otherwise. The table is a map,
    /// not a multimap, so this never exceeds 1.
    pub fn count(&self, hash: u64, key: &K) -> u8 {
        self.contains(hash, key) as u8
    }

    /// Presence of each key in `keys`, as 0/1, in input order.
    pub fn count_batch(&self, keys: &[K], hash_fn: impl Fn(&K) -> u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(keys.len());
        self.probe_batch(keys, &hash_fn, |_, slot| out.push(slot.present() as u8));
        out
    }

    /// Appends the entry of every present key in `keys` to `out`, returning
    /// how many were found.
    pub fn find_batch_into(
        &self,
        keys: &[K],
        hash_fn: impl Fn(&K) -> u64,
        out: &mut Vec<(K, V)>,
    ) -> usize {
        let payload = self.arrays.payload();
        let mut found = 0;
        self.probe_batch(keys, &hash_fn, |_, slot| {
            if slot.present() {
                // SAFETY: a present probe result points at an initialized
                // slot.
                out.push(unsafe { *payload[slot.pos()].assume_init_ref() });
                found += 1;
            }
        });
        found
    }

    /// Applies the reducer to the existing value for `key`, without
    /// inserting on a miss. Returns whether the key was present.
    pub fn update(&mut self, hash: u64, key: &K, value: V) -> bool {
        let slot = self.find_pos_with_hint(key, (hash as usize) & self.mask);
        if !slot.present() {
            return false;
        }
        if !R::KEEPS_EXISTING {
            let (_, payload) = self.arrays.parts_mut();
            // SAFETY: a present probe result points at an initialized slot.
            let (_, existing) = unsafe { payload[slot.pos()].assume_init_mut() };
            R::reduce(existing, value);
        }
        true
    }

    /// Batch [`update`](HashTable::update) with the query prefetch pipeline.
    /// Returns the number of keys that were present.
    pub fn update_batch(&mut self, items: &[(K, V)], hash_fn: impl Fn(&K) -> u64) -> usize {
        let lookahead = self.query_lookahead;
        let ring = 2 * lookahead;
        let ring_mask = ring - 1;
        let mut hashes = vec![0u64; ring];
        let total = items.len();
        for (i, (key, _)) in items.iter().take(ring).enumerate() {
            let hash = hash_fn(key);
            hashes[i] = hash;
            self.prefetch_slot((hash as usize) & self.mask);
        }

        let mut updated = 0;
        for i in 0..total {
            let bid = (hashes[i & ring_mask] as usize) & self.mask;
            if i + ring < total {
                let hash = hash_fn(&items[i + ring].0);
                hashes[i & ring_mask] = hash;
                self.prefetch_info((hash as usize) & self.mask);
            }
            if i + lookahead < total {
                self.prefetch_bucket((hashes[(i + lookahead) & ring_mask] as usize) & self.mask);
            }
            let slot = self.find_pos_with_hint(&items[i].0, bid);
            if slot.present() {
                if !R::KEEPS_EXISTING {
                    let (_, payload) = self.arrays.parts_mut();
                    // SAFETY: a present probe result points at an
                    // initialized slot.
                    let (_, existing) = unsafe { payload[slot.pos()].assume_init_mut() };
                    R::reduce(existing, items[i].1);
                }
                updated += 1;
            }
        }
        updated
    }

    /// Removes `key`, returning its value if it was present. Shrinks the
    /// table when occupancy drops below the minimum load factor; a shrink
    /// that cannot proceed (offset overflow or allocation failure) is
    /// silently skipped.
    pub fn erase(&mut self, hash: u64, key: &K, hash_fn: impl Fn(&K) -> u64) -> Option<V> {
        let removed = self.erase_and_compact(key, (hash as usize) & self.mask);
        if self.size < self.min_load {
            let _ = self.rehash(self.buckets >> 1, &hash_fn);
        }
        removed
    }

    /// Batch erase with the query prefetch pipeline. Returns the number of
    /// entries removed; duplicate keys count once.
    pub fn erase_batch(&mut self, keys: &[K], hash_fn: impl Fn(&K) -> u64) -> usize {
        if keys.is_empty() {
            return 0;
        }
        let before = self.size;
        let lookahead = self.query_lookahead;
        let ring = 2 * lookahead;
        let ring_mask = ring - 1;
        let mut hashes = vec![0u64; ring];
        let total = keys.len();
        for (i, key) in keys.iter().take(ring).enumerate() {
            let hash = hash_fn(key);
            hashes[i] = hash;
            self.prefetch_slot((hash as usize) & self.mask);
        }

        for i in 0..total {
            let bid = (hashes[i & ring_mask] as usize) & self.mask;
            if i + ring < total {
                let hash = hash_fn(&keys[i + ring]);
                hashes[i & ring_mask] = hash;
                self.prefetch_info((hash as usize) & self.mask);
            }
            if i + lookahead < total {
                self.prefetch_bucket((hashes[(i + lookahead) & ring_mask] as usize) & self.mask);
            }
            self.erase_and_compact(&keys[i], bid);
        }

        let erased = before - self.size;
        if self.size < self.min_load {
            let size = self.size;
            let _ = self.reserve(size, &hash_fn);
        }
        erased
    }

    /// Copies the live entries out in payload order.
    pub fn to_vec(&self) -> Vec<(K, V)> {
        self.iter().copied().collect()
    }

    /// Copies the live keys out in payload order.
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|&(key, _)| key).collect()
    }

    /// Locates `key` in bucket `bid`.
    ///
    /// A found result carries the matching payload index. A missing result
    /// carries the index an insert into this bucket would use:
    /// `bid + off(bid)` when the bucket is empty, one past the bucket's
    /// range otherwise.
    fn find_pos_with_hint(&self, key: &K, bid: usize) -> PackedSlot {
        debug_assert!(bid < self.buckets);
        let info = self.arrays.info();
        let cur = info[bid];
        let start = bid + offset(cur);
        if is_empty_info(cur) {
            return PackedSlot::missing(start);
        }
        let end = bid + 1 + offset(info[bid + 1]);
        let payload = self.arrays.payload();
        for pos in start..end {
            // SAFETY: slots inside a non-empty bucket's range are
            // initialized (invariants 1 and 2).
            let (stored, _) = unsafe { payload[pos].assume_init_ref() };
            if stored == key {
                return PackedSlot::found(pos);
            }
        }
        PackedSlot::missing(end)
    }

    /// First payload slot at or after `pos` that is free. Occupied runs are
    /// leapfrogged: the offset at any position lower-bounds the run of
    /// occupied slots starting there.
    fn find_next_empty(&self, pos: usize) -> usize {
        let info = self.arrays.info();
        let mut end = pos;
        while end < info.len() && info[end] != EMPTY {
            end += offset(info[end]).max(1);
        }
        end
    }

    /// First position at or after `pos` whose offset is zero, marking the
    /// end of a shift region.
    fn find_next_zero_offset(&self, pos: usize) -> usize {
        let info = self.arrays.info();
        let mut end = pos;
        while end < info.len() {
            let dist = offset(info[end]);
            if dist == 0 {
                return end;
            }
            end += dist;
        }
        end
    }

    /// Inserts `(key, value)` into bucket `bid`, shifting later entries
    /// right as needed. Returns the failed sentinel without mutating
    /// anything if the shift would push any offset past 127.
    fn insert_with_hint(&mut self, bid: usize, key: K, value: V) -> PackedSlot {
        debug_assert!(bid < self.buckets);

        let cur = self.arrays.info()[bid];
        if cur == EMPTY {
            let (info, payload) = self.arrays.parts_mut();
            info[bid] = 0;
            payload[bid].write((key, value));
            return PackedSlot::missing(bid);
        }

        let start = bid + offset(cur);
        let next = bid + 1 + offset(self.arrays.info()[bid + 1]);

        if is_normal(cur) {
            let (_, payload) = self.arrays.parts_mut();
            for pos in start..next {
                // SAFETY: slots inside a non-empty bucket's range are
                // initialized.
                let (stored, existing) = unsafe { payload[pos].assume_init_mut() };
                if *stored == key {
                    if !R::KEEPS_EXISTING {
                        R::reduce(existing, value);
                    }
                    return PackedSlot::found(pos);
                }
            }
        }

        // Shift-insert at `next`: everything in [next, end) moves one slot
        // right, where `end` is the first free slot. Offsets along the way
        // each grow by one, so any already at the cap aborts the insert.
        let end = self.find_next_empty(bid + 1);
        debug_assert!(end >= next, "free slot inside an occupied run");
        let (info, payload) = self.arrays.parts_mut();
        if info[bid + 1..end].iter().any(|&i| offset(i) == MAX_OFFSET) {
            return PackedSlot::FAILED;
        }

        set_normal(&mut info[bid]);
        for slot in &mut info[bid + 1..=end] {
            *slot += 1;
        }

        // SAFETY: [next, end) holds initialized entries and slot `end` is
        // free, so the overlapping move stays inside the allocation; every
        // slot it vacates is `next`, which is written immediately below,
        // restoring invariant 1.
        unsafe {
            let base = payload.as_mut_ptr();
            std::ptr::copy(base.add(next), base.add(next + 1), end - next);
        }
        payload[next].write((key, value));

        PackedSlot::missing(next)
    }

    /// Removes `key` from bucket `bid` with backward-shift compaction.
    fn erase_and_compact(&mut self, key: &K, bid: usize) -> Option<V> {
        let found = self.find_pos_with_hint(key, bid);
        if !found.present() {
            return None;
        }

        let pos = found.pos();
        let end = self.find_next_zero_offset(bid + 1);
        self.size -= 1;

        let (info, payload) = self.arrays.parts_mut();
        // SAFETY: a present probe result points at an initialized slot.
        let (_, value) = unsafe { payload[pos].assume_init_read() };

        // SAFETY: [pos + 1, end) holds the entries of the disturbed region;
        // shifting them one slot left overwrites the erased entry and frees
        // slot end - 1, whose metadata is decremented below.
        unsafe {
            let base = payload.as_mut_ptr();
            std::ptr::copy(base.add(pos + 1), base.add(pos), end - pos - 1);
        }

        // The erased entry was the bucket's only one exactly when both
        // delimiting offsets agree before the decrement sweep.
        if offset(info[bid]) == offset(info[bid + 1]) {
            set_empty(&mut info[bid]);
        }
        for slot in &mut info[bid + 1..end] {
            *slot -= 1;
        }

        Some(value)
    }

    /// Single insert against a precomputed hash, retrying through capacity
    /// doublings whenever the shift region reports offset overflow.
    fn insert_hashed(
        &mut self,
        hash: u64,
        entry: (K, V),
        hash_fn: &impl Fn(&K) -> u64,
    ) -> Result<(), AllocError> {
        let mut slot = self.insert_with_hint((hash as usize) & self.mask, entry.0, entry.1);
        while slot.failed() {
            self.rehash(self.buckets << 1, hash_fn)?;
            slot = self.insert_with_hint((hash as usize) & self.mask, entry.0, entry.1);
        }
        if !slot.present() {
            self.size += 1;
        }
        Ok(())
    }

    /// The pipelined bulk insert loop over precomputed hashes.
    fn insert_batch_hashed(
        &mut self,
        items: &[(K, V)],
        hashes: &[u64],
        hash_fn: &impl Fn(&K) -> u64,
    ) -> Result<(), AllocError> {
        let total = items.len();
        let lookahead = self.insert_lookahead;

        let warm = total.min(2 * lookahead);
        for i in 0..warm {
            // SAFETY: `i < total`, in bounds of both slices.
            unsafe {
                prefetch(hashes.as_ptr().add(i));
                prefetch(items.as_ptr().add(i));
            }
        }
        for &hash in hashes.iter().take(warm) {
            self.prefetch_slot((hash as usize) & self.mask);
        }

        let main = total.saturating_sub(2 * lookahead);
        let tail = total.saturating_sub(lookahead);
        let mut i = 0;

        // Main span: the rehash check runs once per chunk of remaining load
        // headroom, keeping the hot loop free of per-item occupancy checks.
        while i < main {
            if self.size >= self.max_load {
                self.rehash(self.buckets << 1, hash_fn)?;
            }
            let chunk_end = i + (self.max_load - self.size).min(main - i);
            while i < chunk_end {
                // SAFETY: `i < main` implies `i + 2 * lookahead < total`.
                unsafe {
                    prefetch(hashes.as_ptr().add(i + 2 * lookahead));
                    prefetch(items.as_ptr().add(i + 2 * lookahead));
                }
                self.prefetch_bucket((hashes[i + lookahead] as usize) & self.mask);
                self.insert_hashed(hashes[i], items[i], hash_fn)?;
                self.prefetch_info((hashes[i + 2 * lookahead] as usize) & self.mask);
                i += 1;
            }
        }

        // Second-to-last window: bucket prefetches still have lead time.
        while i < tail {
            self.prefetch_bucket((hashes[i + lookahead] as usize) & self.mask);
            self.insert_hashed(hashes[i], items[i], hash_fn)?;
            i += 1;
        }

        // Last window: nothing left to prefetch.
        while i < total {
            self.insert_hashed(hashes[i], items[i], hash_fn)?;
            i += 1;
        }

        Ok(())
    }

    /// The shared query pipeline: probes every key in order, keeping a ring
    /// of `2 * lookahead` precomputed hashes so that metadata for key
    /// `i + 2L` and the payload range for key `i + L` are in flight while
    /// key `i` is probed. `eval` receives each key's index and probe result.
    fn probe_batch(
        &self,
        keys: &[K],
        hash_fn: &impl Fn(&K) -> u64,
        mut eval: impl FnMut(usize, PackedSlot),
    ) {
        let lookahead = self.query_lookahead;
        let ring = 2 * lookahead;
        let ring_mask = ring - 1;
        let mut hashes = vec![0u64; ring];
        let total = keys.len();

        for (i, key) in keys.iter().take(ring).enumerate() {
            let hash = hash_fn(key);
            hashes[i] = hash;
            self.prefetch_slot((hash as usize) & self.mask);
        }

        let main = total.saturating_sub(ring);
        let tail = total.saturating_sub(lookahead);
        let mut i = 0;

        while i < main {
            let bid = (hashes[i & ring_mask] as usize) & self.mask;
            let hash = hash_fn(&keys[i + ring]);
            hashes[i & ring_mask] = hash;
            self.prefetch_info((hash as usize) & self.mask);
            self.prefetch_bucket((hashes[(i + lookahead) & ring_mask] as usize) & self.mask);
            eval(i, self.find_pos_with_hint(&keys[i], bid));
            i += 1;
        }
        while i < tail {
            let bid = (hashes[i & ring_mask] as usize) & self.mask;
            self.prefetch_bucket((hashes[(i + lookahead) & ring_mask] as usize) & self.mask);
            eval(i, self.find_pos_with_hint(&keys[i], bid));
            i += 1;
        }
        while i < total {
            let bid = (hashes[i & ring_mask] as usize) & self.mask;
            eval(i, self.find_pos_with_hint(&keys[i], bid));
            i += 1;
        }
    }

    #[inline(always)]
    fn prefetch_slot(&self, bid: usize) {
        // SAFETY: `bid` is masked to the bucket range; both arrays extend
        // past it.
        unsafe {
            prefetch(self.arrays.info().as_ptr().add(bid));
            prefetch(self.arrays.payload().as_ptr().add(bid));
        }
    }

    #[inline(always)]
    fn prefetch_info(&self, bid: usize) {
        // SAFETY: `bid` is masked to the bucket range.
        unsafe {
            prefetch(self.arrays.info().as_ptr().add(bid));
        }
    }

    /// Prefetches the payload range of bucket `bid`, one request per
    /// cacheline worth of entries.
    #[inline]
    fn prefetch_bucket(&self, bid: usize) {
        let info = self.arrays.info();
        if is_normal(info[bid]) {
            let start = bid + offset(info[bid]);
            let end = bid + 1 + offset(info[bid + 1]);
            let payload = self.arrays.payload();
            let stride = pairs_per_cacheline::<K, V>();
            let mut pos = start;
            while pos < end {
                // SAFETY: `pos < end <= slots` by invariant 3.
                unsafe {
                    prefetch(payload.as_ptr().add(pos));
                }
                pos += stride;
            }
        }
    }

    /// Resizes to `target_buckets` (rounded up to a power of two), keeping
    /// the current capacity when the request is a no-op, would not fit the
    /// live entries, or is a shrink that would overflow an offset.
    fn rehash(
        &mut self,
        target_buckets: usize,
        hash_fn: &impl Fn(&K) -> u64,
    ) -> Result<(), AllocError> {
        let mut target = target_buckets.max(MIN_BUCKETS).next_power_of_two();
        if target == self.buckets
            || self.size >= (self.max_load_factor * target as f64) as usize
        {
            return Ok(());
        }

        if self.size > 0 && target < self.buckets {
            // A shrink that would need an offset past the cap is enlarged
            // until it fits; reaching the current size means refusal.
            while self.copy_downsize_max_offset(target) > MAX_OFFSET {
                target <<= 1;
            }
            if target == self.buckets {
                return Ok(());
            }
        }

        let mut tmp = Arrays::alloc(target)?;
        if self.size > 0 {
            if target > self.buckets {
                self.copy_upsize(&mut tmp, target, hash_fn)?;
                self.upsizes += 1;
            } else {
                self.copy_downsize(&mut tmp, target);
                self.downsizes += 1;
            }
        }

        self.buckets = target;
        self.mask = target - 1;
        self.min_load = (target as f64 * self.min_load_factor) as usize;
        self.max_load = (target as f64 * self.max_load_factor) as usize;
        self.arrays = tmp;
        Ok(())
    }

    /// Largest offset a shrink to `target_buckets` would produce, computed
    /// from metadata alone (no entry is touched). Exits early once past the
    /// cap.
    fn copy_downsize_max_offset(&self, target_buckets: usize) -> usize {
        debug_assert!(target_buckets.is_power_of_two());
        if target_buckets >= self.buckets {
            return 0;
        }
        let info = self.arrays.info();
        let blocks = self.buckets / target_buckets;
        let mut new_end = 0usize;
        let mut max_offset = 0usize;

        for bid in 0..target_buckets {
            let new_start = new_end.max(bid);
            new_end = new_start;
            for block in 0..blocks {
                let id = bid + block * target_buckets;
                if is_normal(info[id]) {
                    new_end += 1 + offset(info[id + 1]) - offset(info[id]);
                }
            }
            max_offset = max_offset.max(new_start - bid);
            if max_offset > MAX_OFFSET {
                return max_offset;
            }
        }
        max_offset.max(new_end.saturating_sub(target_buckets))
    }

    /// Shrink copy: each target bucket receives the concatenation of
    /// `buckets / target_buckets` source buckets, packed left to right
    /// behind a single write cursor. Only run after
    /// [`copy_downsize_max_offset`](HashTable::copy_downsize_max_offset)
    /// cleared the target.
    fn copy_downsize(&self, tmp: &mut Arrays<K, V>, target_buckets: usize) {
        debug_assert!(target_buckets.is_power_of_two());
        let info = self.arrays.info();
        let payload = self.arrays.payload();
        let (new_info, new_payload) = tmp.parts_mut();
        let blocks = self.buckets / target_buckets;
        let mut new_end = 0usize;

        for bid in 0..target_buckets {
            let new_start = new_end.max(bid);
            new_end = new_start;
            for block in 0..blocks {
                let id = bid + block * target_buckets;
                if is_normal(info[id]) {
                    let pos = id + offset(info[id]);
                    let end = id + 1 + offset(info[id + 1]);
                    // SAFETY: the source range is initialized (invariant 2)
                    // and the destination run stays inside the new
                    // allocation because the pre-pass bounded every offset
                    // by the pad length.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            payload.as_ptr().add(pos),
                            new_payload.as_mut_ptr().add(new_end),
                            end - pos,
                        );
                    }
                    new_end += end - pos;
                }
            }
            let off = (new_start - bid) as u8;
            new_info[bid] = if new_end == new_start { EMPTY | off } else { off };
        }

        for pad in target_buckets..new_end {
            new_info[pad] = EMPTY | (new_end - pad) as u8;
        }
    }

    /// Growth copy: target bucket ids ascend within each output block and
    /// across block boundaries, so one pass per block behind a single global
    /// write cursor places every entry at its shifted position, and the
    /// cursor itself carries spill across block boundaries. Hashes are
    /// computed once up front; each block pass replays the same traversal
    /// order.
    fn copy_upsize(
        &self,
        tmp: &mut Arrays<K, V>,
        target_buckets: usize,
        hash_fn: &impl Fn(&K) -> u64,
    ) -> Result<(), AllocError> {
        debug_assert!(target_buckets.is_power_of_two());
        let new_mask = target_buckets - 1;
        let info = self.arrays.info();
        let payload = self.arrays.payload();
        let blocks = target_buckets / self.buckets;

        let mut hashes = Vec::new();
        hashes
            .try_reserve_exact(self.size)
            .map_err(|_| AllocError)?;
        for bid in 0..self.buckets {
            if is_normal(info[bid]) {
                let pos = bid + offset(info[bid]);
                let end = bid + 1 + offset(info[bid + 1]);
                for slot in pos..end {
                    // SAFETY: slots inside a non-empty bucket's range are
                    // initialized.
                    let (key, _) = unsafe { payload[slot].assume_init_ref() };
                    hashes.push(hash_fn(key));
                }
            }
        }

        let (new_info, new_payload) = tmp.parts_mut();
        let mut cursor = 0usize;
        for block in 0..blocks {
            let base = block * self.buckets;
            let mut hash_index = 0usize;
            for bid in 0..self.buckets {
                let id = base + bid;
                if is_normal(info[bid]) {
                    let pos = bid + offset(info[bid]);
                    let end = bid + 1 + offset(info[bid + 1]);
                    let bucket_start = cursor.max(id);
                    let mut len = 0usize;
                    for slot in pos..end {
                        if (hashes[hash_index] as usize) & new_mask == id {
                            let at = cursor.max(id);
                            // SAFETY: splitting a bucket never lengthens its
                            // run, so `at - id <= MAX_OFFSET` keeps `at`
                            // inside the padded allocation; the source slot
                            // is initialized.
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    payload.as_ptr().add(slot),
                                    new_payload.as_mut_ptr().add(at),
                                    1,
                                );
                            }
                            cursor = at + 1;
                            len += 1;
                        }
                        hash_index += 1;
                    }
                    debug_assert!(bucket_start - id <= MAX_OFFSET);
                    let off = (bucket_start - id) as u8;
                    new_info[id] = if len == 0 { EMPTY | off } else { off };
                } else {
                    let off = cursor.max(id) - id;
                    debug_assert!(off <= MAX_OFFSET);
                    new_info[id] = EMPTY | off as u8;
                }
            }
        }

        for pad in target_buckets..cursor {
            new_info[pad] = EMPTY | (cursor - pad) as u8;
        }
        Ok(())
    }
}

/// Iterator over a table's live entries in payload order.
///
/// Created by [`HashTable::iter`].
pub struct Iter<'a, K, V> {
    info: &'a [u8],
    payload: &'a [MaybeUninit<(K, V)>],
    index: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = &'a (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.info.len() {
            let index = self.index;
            self.index += 1;
            if self.info[index] != EMPTY {
                // SAFETY: a slot whose metadata is not exactly EMPTY holds
                // an initialized entry (invariant 1).
                return Some(unsafe { self.payload[index].assume_init_ref() });
            }
        }
        None
    }
}
