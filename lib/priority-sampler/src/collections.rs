//! Hash-based collections used throughout the sampler.

/// [`BuildHasher`][std::hash::BuildHasher] used by every map in this crate.
///
/// Currently, [`foldhash`][foldhash] is used as the underlying implementation.
///
/// [foldhash]: http://github.com/orlp/foldhash
pub type FastBuildHasher = foldhash::quality::RandomState;

/// A hash map based on `hashbrown` ([`HashMap`][hashbrown::HashMap]) using [`FastBuildHasher`].
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, FastBuildHasher>;

/// A concurrent hash map based on `papaya` ([`HashMap`][papaya::HashMap]) using [`FastBuildHasher`].
///
/// Reads and inserts never take a lock, which keeps the trace ingestion path free of contention with the background
/// decay and sync loops.
pub type FastConcurrentHashMap<K, V> = papaya::HashMap<K, V, FastBuildHasher>;
