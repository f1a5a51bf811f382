//! Key, range, and route containers.
//!
//! Routing operates on a hashed projection of the key space: every data key
//! maps to a `RoutingKey` point on a u64 ring, and shard boundaries are ranges
//! over that ring. Data access ("seekables") uses full keys; message dispatch
//! ("unseekables") uses only the routing projection. A `Route` is an
//! unseekables view with a designated home key that anchors coordination and
//! recovery for one transaction.

use std::fmt;

use anyhow::{bail, ensure};
use bytes::Bytes;

/// A point on the routing ring, derived from key bytes by hashing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutingKey(pub u64);

impl RoutingKey {
    pub fn of(data: &[u8]) -> RoutingKey {
        let digest = blake3::hash(data);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest.as_bytes()[..8]);
        RoutingKey(u64::from_be_bytes(raw))
    }
}

impl fmt::Debug for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rk:{:016x}", self.0)
    }
}

/// A full data key: opaque bytes plus the cached routing point.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Key {
    routing: RoutingKey,
    data: Bytes,
}

impl Key {
    pub fn new(data: impl Into<Bytes>) -> Key {
        let data = data.into();
        Key {
            routing: RoutingKey::of(&data),
            data,
        }
    }

    pub fn routing(&self) -> RoutingKey {
        self.routing
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.routing, &self.data).cmp(&(other.routing, &other.data))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}@{:?}", String::from_utf8_lossy(&self.data), self.routing)
    }
}

/// A half-open interval `[start, end)` of the routing ring.
///
/// `end == u64::MAX` additionally covers the maximum point, so a single range
/// `[0, u64::MAX)` spans the whole ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    pub start: u64,
    pub end: u64,
}

impl KeyRange {
    pub const FULL: KeyRange = KeyRange {
        start: 0,
        end: u64::MAX,
    };

    pub fn new(start: u64, end: u64) -> KeyRange {
        KeyRange { start, end }
    }

    /// A degenerate range covering exactly one routing point.
    pub fn point(rk: RoutingKey) -> KeyRange {
        KeyRange {
            start: rk.0,
            end: rk.0.saturating_add(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, rk: RoutingKey) -> bool {
        rk.0 >= self.start && (rk.0 < self.end || self.end == u64::MAX)
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(KeyRange { start, end })
    }
}

/// A sorted, non-overlapping sequence of routing ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Ranges(Vec<KeyRange>);

impl Ranges {
    /// Normalize: sort, drop empties, merge overlapping and adjacent ranges.
    pub fn new(mut ranges: Vec<KeyRange>) -> Ranges {
        ranges.retain(|r| !r.is_empty());
        ranges.sort();
        let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match out.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => out.push(r),
            }
        }
        Ranges(out)
    }

    pub fn single(range: KeyRange) -> Ranges {
        Ranges::new(vec![range])
    }

    pub fn full() -> Ranges {
        Ranges(vec![KeyRange::FULL])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyRange> {
        self.0.iter()
    }

    pub fn contains(&self, rk: RoutingKey) -> bool {
        let idx = self.0.partition_point(|r| r.end <= rk.0 && r.end != u64::MAX);
        self.0.get(idx).is_some_and(|r| r.contains(rk))
    }

    pub fn intersects(&self, range: &KeyRange) -> bool {
        self.0.iter().any(|r| r.intersects(range))
    }

    /// Merge scan: true iff every range of `other` is covered by some range
    /// of `self`.
    pub fn contains_all(&self, other: &Ranges) -> bool {
        let mut idx = 0usize;
        for needle in &other.0 {
            while idx < self.0.len() && self.0[idx].end <= needle.start {
                idx += 1;
            }
            match self.0.get(idx) {
                Some(cover) if cover.contains_range(needle) => {}
                _ => return false,
            }
        }
        true
    }

    /// The subset of `self` intersecting `by`.
    pub fn slice(&self, by: &Ranges) -> Ranges {
        let mut out = Vec::new();
        for a in &self.0 {
            for b in &by.0 {
                if let Some(i) = a.intersection(b) {
                    out.push(i);
                }
            }
        }
        Ranges::new(out)
    }

    /// Sorted union; returns a clone of an operand when the other adds nothing.
    pub fn union(&self, other: &Ranges) -> Ranges {
        if other.is_empty() || self.contains_all(other) {
            return self.clone();
        }
        if self.is_empty() || other.contains_all(self) {
            return other.clone();
        }
        let mut merged = self.0.clone();
        merged.extend(other.0.iter().copied());
        Ranges::new(merged)
    }
}

/// Sorted, deduplicated routing points.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RoutingKeys(Vec<RoutingKey>);

impl RoutingKeys {
    pub fn new(mut keys: Vec<RoutingKey>) -> RoutingKeys {
        keys.sort();
        keys.dedup();
        RoutingKeys(keys)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoutingKey> {
        self.0.iter()
    }

    pub fn contains(&self, rk: RoutingKey) -> bool {
        self.0.binary_search(&rk).is_ok()
    }

    pub fn slice(&self, by: &Ranges) -> RoutingKeys {
        RoutingKeys(self.0.iter().copied().filter(|rk| by.contains(*rk)).collect())
    }

    pub fn union(&self, other: &RoutingKeys) -> RoutingKeys {
        let mut merged = self.0.clone();
        merged.extend(other.0.iter().copied());
        RoutingKeys::new(merged)
    }

    /// `self` with `rk` inserted if absent.
    pub fn with(&self, rk: RoutingKey) -> RoutingKeys {
        if self.contains(rk) {
            return self.clone();
        }
        let mut keys = self.0.clone();
        keys.push(rk);
        RoutingKeys::new(keys)
    }
}

/// Sorted, deduplicated data keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Keys(Vec<Key>);

impl Keys {
    pub fn new(mut keys: Vec<Key>) -> Keys {
        keys.sort();
        keys.dedup();
        Keys(keys)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.0.binary_search(key).is_ok()
    }

    pub fn slice(&self, by: &Ranges) -> Keys {
        Keys(self
            .0
            .iter()
            .filter(|k| by.contains(k.routing()))
            .cloned()
            .collect())
    }

    pub fn union(&self, other: &Keys) -> Keys {
        let mut merged = self.0.clone();
        merged.extend(other.0.iter().cloned());
        Keys::new(merged)
    }

    pub fn to_routing(&self) -> RoutingKeys {
        RoutingKeys::new(self.0.iter().map(|k| k.routing()).collect())
    }
}

/// The concrete data a transaction reads or writes: full keys or ranges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seekables {
    Keys(Keys),
    Ranges(Ranges),
}

impl Seekables {
    pub fn is_empty(&self) -> bool {
        match self {
            Seekables::Keys(k) => k.is_empty(),
            Seekables::Ranges(r) => r.is_empty(),
        }
    }

    pub fn slice(&self, by: &Ranges) -> Seekables {
        match self {
            Seekables::Keys(k) => Seekables::Keys(k.slice(by)),
            Seekables::Ranges(r) => Seekables::Ranges(r.slice(by)),
        }
    }

    pub fn union(&self, other: &Seekables) -> anyhow::Result<Seekables> {
        match (self, other) {
            (Seekables::Keys(a), Seekables::Keys(b)) => Ok(Seekables::Keys(a.union(b))),
            (Seekables::Ranges(a), Seekables::Ranges(b)) => Ok(Seekables::Ranges(a.union(b))),
            _ => bail!("cannot union key seekables with range seekables"),
        }
    }

    pub fn to_unseekables(&self) -> Unseekables {
        match self {
            Seekables::Keys(k) => Unseekables::Keys(k.to_routing()),
            Seekables::Ranges(r) => Unseekables::Ranges(r.clone()),
        }
    }

    pub fn intersects(&self, range: &KeyRange) -> bool {
        match self {
            Seekables::Keys(k) => k.iter().any(|key| range.contains(key.routing())),
            Seekables::Ranges(r) => r.intersects(range),
        }
    }
}

/// The routing-only projection used for message dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unseekables {
    Keys(RoutingKeys),
    Ranges(Ranges),
}

impl Unseekables {
    pub fn is_empty(&self) -> bool {
        match self {
            Unseekables::Keys(k) => k.is_empty(),
            Unseekables::Ranges(r) => r.is_empty(),
        }
    }

    pub fn slice(&self, by: &Ranges) -> Unseekables {
        match self {
            Unseekables::Keys(k) => Unseekables::Keys(k.slice(by)),
            Unseekables::Ranges(r) => Unseekables::Ranges(r.slice(by)),
        }
    }

    pub fn union(&self, other: &Unseekables) -> anyhow::Result<Unseekables> {
        match (self, other) {
            (Unseekables::Keys(a), Unseekables::Keys(b)) => Ok(Unseekables::Keys(a.union(b))),
            (Unseekables::Ranges(a), Unseekables::Ranges(b)) => Ok(Unseekables::Ranges(a.union(b))),
            _ => bail!("cannot union routing keys with routing ranges"),
        }
    }

    pub fn intersects(&self, range: &KeyRange) -> bool {
        match self {
            Unseekables::Keys(k) => k.iter().any(|rk| range.contains(*rk)),
            Unseekables::Ranges(r) => r.intersects(range),
        }
    }

    pub fn contains(&self, rk: RoutingKey) -> bool {
        match self {
            Unseekables::Keys(k) => k.contains(rk),
            Unseekables::Ranges(r) => r.contains(rk),
        }
    }

    /// `self` with the routing point inserted if absent. For the range domain
    /// the point becomes a degenerate single-point range.
    pub fn with(&self, rk: RoutingKey) -> Unseekables {
        match self {
            Unseekables::Keys(k) => Unseekables::Keys(k.with(rk)),
            Unseekables::Ranges(r) => {
                if r.contains(rk) {
                    Unseekables::Ranges(r.clone())
                } else {
                    Unseekables::Ranges(r.union(&Ranges::single(KeyRange::point(rk))))
                }
            }
        }
    }
}

/// The shape of a route: full routes cover everything the transaction
/// touches; partial routes carry the ranges they cover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteForm {
    FullKeys(RoutingKeys),
    FullRanges(Ranges),
    PartialKeys { covering: Ranges, keys: RoutingKeys },
    PartialRanges { covering: Ranges, ranges: Ranges },
}

/// An unseekables view with a designated home key. The home key anchors the
/// transaction's coordinator-of-record and recovery leader election.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    home: RoutingKey,
    form: RouteForm,
}

impl Route {
    pub fn full_keys(home: RoutingKey, keys: RoutingKeys) -> Route {
        Route {
            home,
            form: RouteForm::FullKeys(keys),
        }
    }

    pub fn full_ranges(home: RoutingKey, ranges: Ranges) -> Route {
        Route {
            home,
            form: RouteForm::FullRanges(ranges),
        }
    }

    pub fn home_key(&self) -> RoutingKey {
        self.home
    }

    pub fn is_full(&self) -> bool {
        matches!(self.form, RouteForm::FullKeys(_) | RouteForm::FullRanges(_))
    }

    /// The content projection, without the home key.
    pub fn unseekables(&self) -> Unseekables {
        match &self.form {
            RouteForm::FullKeys(k) | RouteForm::PartialKeys { keys: k, .. } => {
                Unseekables::Keys(k.clone())
            }
            RouteForm::FullRanges(r) | RouteForm::PartialRanges { ranges: r, .. } => {
                Unseekables::Ranges(r.clone())
            }
        }
    }

    /// The content plus the home key: every shard we know of for this
    /// transaction, not just those a sliced message contacts.
    pub fn to_maximal_unseekables(&self) -> Unseekables {
        self.unseekables().with(self.home)
    }

    pub fn covers(&self, ranges: &Ranges) -> bool {
        match &self.form {
            RouteForm::FullKeys(_) | RouteForm::FullRanges(_) => true,
            RouteForm::PartialKeys { covering, .. } | RouteForm::PartialRanges { covering, .. } => {
                covering.contains_all(ranges)
            }
        }
    }

    /// The sub-route covering `ranges`. The result is always partial, with
    /// `covering` trimmed to the slice.
    pub fn slice(&self, ranges: &Ranges) -> Route {
        let form = match &self.form {
            RouteForm::FullKeys(k) => RouteForm::PartialKeys {
                covering: ranges.clone(),
                keys: k.slice(ranges),
            },
            RouteForm::FullRanges(r) => RouteForm::PartialRanges {
                covering: ranges.clone(),
                ranges: r.slice(ranges),
            },
            RouteForm::PartialKeys { covering, keys } => RouteForm::PartialKeys {
                covering: covering.slice(ranges),
                keys: keys.slice(ranges),
            },
            RouteForm::PartialRanges {
                covering,
                ranges: content,
            } => RouteForm::PartialRanges {
                covering: covering.slice(ranges),
                ranges: content.slice(ranges),
            },
        };
        Route {
            home: self.home,
            form,
        }
    }

    /// Slice, failing loudly when `ranges` is not covered. Use this on paths
    /// where an uncovered slice is a programming bug rather than data.
    pub fn slice_strict(&self, ranges: &Ranges) -> anyhow::Result<Route> {
        ensure!(
            self.covers(ranges),
            "sliceStrict of route not covering requested ranges"
        );
        Ok(self.slice(ranges))
    }

    /// Union two routes for the same transaction. A full operand absorbs the
    /// other; two partial routes require equal home keys.
    pub fn union(&self, other: &Route) -> anyhow::Result<Route> {
        ensure!(
            self.home == other.home,
            "route union with mismatched home keys"
        );
        if self.is_full() {
            return Ok(self.clone());
        }
        if other.is_full() {
            return Ok(other.clone());
        }
        let form = match (&self.form, &other.form) {
            (
                RouteForm::PartialKeys { covering: ca, keys: ka },
                RouteForm::PartialKeys { covering: cb, keys: kb },
            ) => RouteForm::PartialKeys {
                covering: ca.union(cb),
                keys: ka.union(kb),
            },
            (
                RouteForm::PartialRanges { covering: ca, ranges: ra },
                RouteForm::PartialRanges { covering: cb, ranges: rb },
            ) => RouteForm::PartialRanges {
                covering: ca.union(cb),
                ranges: ra.union(rb),
            },
            _ => bail!("route union across key/range domains"),
        };
        Ok(Route {
            home: self.home,
            form,
        })
    }

    /// Combine two optional route observations, preferring the first operand
    /// and unioning when both are known.
    pub fn merge(prefer: Option<&Route>, defer: Option<&Route>) -> anyhow::Result<Option<Route>> {
        match (prefer, defer) {
            (None, None) => Ok(None),
            (Some(r), None) | (None, Some(r)) => Ok(Some(r.clone())),
            (Some(a), Some(b)) => Ok(Some(a.union(b)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rk(v: u64) -> RoutingKey {
        RoutingKey(v)
    }

    #[test]
    fn ranges_normalize_and_merge() {
        let r = Ranges::new(vec![
            KeyRange::new(50, 60),
            KeyRange::new(10, 20),
            KeyRange::new(18, 30),
            KeyRange::new(30, 35),
        ]);
        assert_eq!(
            r.iter().copied().collect::<Vec<_>>(),
            vec![KeyRange::new(10, 35), KeyRange::new(50, 60)]
        );
        assert!(r.contains(rk(10)));
        assert!(r.contains(rk(34)));
        assert!(!r.contains(rk(35)));
        assert!(!r.contains(rk(40)));
        assert!(r.contains(rk(59)));
    }

    #[test]
    fn full_range_covers_maximum_point() {
        let full = Ranges::full();
        assert!(full.contains(rk(0)));
        assert!(full.contains(rk(u64::MAX)));
    }

    #[test]
    fn contains_all_merge_scan() {
        let cover = Ranges::new(vec![KeyRange::new(0, 100), KeyRange::new(200, 300)]);
        assert!(cover.contains_all(&Ranges::new(vec![
            KeyRange::new(10, 20),
            KeyRange::new(250, 260),
        ])));
        assert!(!cover.contains_all(&Ranges::single(KeyRange::new(90, 110))));
        assert!(!cover.contains_all(&Ranges::single(KeyRange::new(150, 160))));
    }

    #[test]
    fn union_returns_identity_when_superset() {
        let a = Ranges::new(vec![KeyRange::new(0, 100)]);
        let b = Ranges::new(vec![KeyRange::new(10, 20)]);
        assert_eq!(a.union(&b), a);
        assert_eq!(b.union(&a), a);
        let c = Ranges::new(vec![KeyRange::new(150, 200)]);
        let merged = a.union(&c);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn keys_sort_and_dedup() {
        let keys = Keys::new(vec![Key::new("b"), Key::new("a"), Key::new("b")]);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&Key::new("a")));
        let routing = keys.to_routing();
        assert_eq!(routing.len(), 2);
    }

    #[test]
    fn keys_slice_by_routing_range() {
        let a = Key::new("alpha");
        let b = Key::new("beta");
        let keys = Keys::new(vec![a.clone(), b.clone()]);
        let only_a = keys.slice(&Ranges::single(KeyRange::point(a.routing())));
        assert_eq!(only_a.len(), 1);
        assert!(only_a.contains(&a));
        assert!(!only_a.contains(&b));
    }

    #[test]
    fn route_slice_and_covers() {
        let keys = RoutingKeys::new(vec![rk(5), rk(15), rk(25)]);
        let route = Route::full_keys(rk(5), keys);
        assert!(route.covers(&Ranges::full()));

        let slice = route.slice(&Ranges::single(KeyRange::new(10, 20)));
        assert!(!slice.is_full());
        assert!(slice.covers(&Ranges::single(KeyRange::new(12, 18))));
        assert!(!slice.covers(&Ranges::single(KeyRange::new(0, 8))));
        match slice.unseekables() {
            Unseekables::Keys(k) => {
                assert_eq!(k.iter().copied().collect::<Vec<_>>(), vec![rk(15)]);
            }
            other => panic!("unexpected projection {other:?}"),
        }
    }

    #[test]
    fn slice_strict_rejects_uncovered() {
        let route = Route::full_keys(rk(1), RoutingKeys::new(vec![rk(1), rk(9)]));
        let partial = route.slice(&Ranges::single(KeyRange::new(0, 5)));
        assert!(partial.slice_strict(&Ranges::single(KeyRange::new(6, 8))).is_err());
        assert!(partial.slice_strict(&Ranges::single(KeyRange::new(1, 4))).is_ok());
    }

    #[test]
    fn partial_union_requires_equal_home() {
        let route = Route::full_keys(rk(1), RoutingKeys::new(vec![rk(1), rk(40), rk(80)]));
        let a = route.slice(&Ranges::single(KeyRange::new(0, 50)));
        let b = route.slice(&Ranges::single(KeyRange::new(50, 100)));
        let merged = a.union(&b).unwrap();
        assert!(merged.covers(&Ranges::single(KeyRange::new(0, 100))));

        let foreign = Route::full_keys(rk(2), RoutingKeys::new(vec![rk(2)]))
            .slice(&Ranges::single(KeyRange::new(0, 50)));
        assert!(a.union(&foreign).is_err());
    }

    #[test]
    fn full_route_absorbs_partial_in_union() {
        let full = Route::full_keys(rk(1), RoutingKeys::new(vec![rk(1), rk(9)]));
        let partial = full.slice(&Ranges::single(KeyRange::new(0, 5)));
        let merged = partial.union(&full).unwrap();
        assert!(merged.is_full());
    }

    #[test]
    fn maximal_unseekables_includes_home() {
        let route = Route::full_keys(rk(7), RoutingKeys::new(vec![rk(40)]));
        let sliced = route.slice(&Ranges::single(KeyRange::new(30, 50)));
        assert!(!sliced.unseekables().contains(rk(7)));
        assert!(sliced.to_maximal_unseekables().contains(rk(7)));

        let ranged = Route::full_ranges(rk(7), Ranges::single(KeyRange::new(30, 50)));
        assert!(ranged.to_maximal_unseekables().contains(rk(7)));
    }

    #[test]
    fn route_merge_prefers_known() {
        let route = Route::full_keys(rk(3), RoutingKeys::new(vec![rk(3)]));
        assert!(Route::merge(None, None).unwrap().is_none());
        assert_eq!(
            Route::merge(Some(&route), None).unwrap().unwrap(),
            route.clone()
        );
        let a = route.slice(&Ranges::single(KeyRange::new(0, 10)));
        let merged = Route::merge(Some(&a), Some(&route)).unwrap().unwrap();
        assert!(merged.is_full());
    }
}
