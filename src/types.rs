use rustc_hash::{FxHashMap, FxHashSet};

pub type HashMap<K, V> = FxHashMap<K, V>;

pub type HashSet<K> = FxHashSet<K>;

pub type UnitId = u64;
