use std::cmp::Ordering;
use std::ops::Bound;

/// A range of values with customizable bounds: inclusive (`[a..b]`),
/// exclusive (`(a..b)`) or mixed (`(a..b]`, `[a..b)`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Interval<T> {
    start: Bound<T>,
    end: Bound<T>,
}

impl<T> Interval<T> {
    pub fn new(start: Bound<T>, end: Bound<T>) -> Self {
        Self { start, end }
    }

    /// Creates a closed range `[a..b]`.
    ///
    /// Includes values `x` such that `a <= x <= b`.
    pub fn closed(start: T, end: T) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Included(end),
        }
    }

    /// Creates an open-closed range `(a..b]`.
    ///
    /// Includes values `x` such that `a < x <= b`.
    pub fn open_closed(start: T, end: T) -> Self {
        Self {
            start: Bound::Excluded(start),
            end: Bound::Included(end),
        }
    }

    /// Creates a closed-open range `[a..b)`.
    ///
    /// Includes values `x` such that `a <= x < b`.
    pub fn closed_open(start: T, end: T) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Excluded(end),
        }
    }

    pub fn start(&self) -> &Bound<T> {
        &self.start
    }

    pub fn end(&self) -> &Bound<T> {
        &self.end
    }

    /// Swaps the two ends. Used to express an interval in scan order for a
    /// descending index.
    pub fn reversed(self) -> Self {
        Self {
            start: self.end,
            end: self.start,
        }
    }
}

impl<T: Clone> Interval<T> {
    /// Creates the single point interval `[a..a]`.
    pub fn point(value: T) -> Self {
        Self::closed(value.clone(), value)
    }
}

impl<T: Ord + Clone> Interval<T> {
    /// Returns `true` if the interval contains exactly one value.
    pub fn is_point(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s == e,
            _ => false,
        }
    }

    /// Returns `true` if no value can satisfy both ends.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }

    pub fn contains_value(&self, value: &T) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => value >= s,
            Bound::Excluded(s) => value > s,
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => value <= e,
            Bound::Excluded(e) => value < e,
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// Returns `true` if every value of `other` also belongs to `self`.
    pub fn contains_interval(&self, other: &Interval<T>) -> bool {
        if other.is_empty() {
            return true;
        }
        cmp_start(&self.start, &other.start) != Ordering::Greater
            && cmp_end(&self.end, &other.end) != Ordering::Less
    }

    /// Returns the intersection of the two intervals, or `None` if it is empty.
    pub fn intersect(&self, other: &Interval<T>) -> Option<Interval<T>> {
        let start = if cmp_start(&self.start, &other.start) == Ordering::Less {
            other.start.clone()
        } else {
            self.start.clone()
        };
        let end = if cmp_end(&self.end, &other.end) == Ordering::Greater {
            other.end.clone()
        } else {
            self.end.clone()
        };
        let interval = Interval { start, end };
        if interval.is_empty() {
            None
        } else {
            Some(interval)
        }
    }

    /// Returns `true` if the union of the two intervals is a single interval.
    fn touches(&self, other: &Interval<T>) -> bool {
        // `self` is assumed to start first.
        match (&self.end, &other.start) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
            (Bound::Included(e), Bound::Included(s)) => s <= e,
            (Bound::Included(e), Bound::Excluded(s)) | (Bound::Excluded(e), Bound::Included(s)) => s <= e,
            (Bound::Excluded(e), Bound::Excluded(s)) => s < e,
        }
    }
}

/// Orders two start bounds, `Unbounded` first.
fn cmp_start<T: Ord>(a: &Bound<T>, b: &Bound<T>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => x.cmp(y),
        (Bound::Included(x), Bound::Excluded(y)) => x.cmp(y).then(Ordering::Less),
        (Bound::Excluded(x), Bound::Included(y)) => x.cmp(y).then(Ordering::Greater),
    }
}

/// Orders two end bounds, `Unbounded` last.
fn cmp_end<T: Ord>(a: &Bound<T>, b: &Bound<T>) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        (Bound::Included(x), Bound::Included(y)) | (Bound::Excluded(x), Bound::Excluded(y)) => x.cmp(y),
        (Bound::Included(x), Bound::Excluded(y)) => x.cmp(y).then(Ordering::Greater),
        (Bound::Excluded(x), Bound::Included(y)) => x.cmp(y).then(Ordering::Less),
    }
}

/// Sorts the intervals by start and merges the ones that overlap or touch.
/// Empty intervals are dropped.
pub fn union_all<T: Ord + Clone>(mut intervals: Vec<Interval<T>>) -> Vec<Interval<T>> {
    intervals.retain(|i| !i.is_empty());
    intervals.sort_by(|a, b| cmp_start(&a.start, &b.start));

    let mut merged: Vec<Interval<T>> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if last.touches(&interval) => {
                if cmp_end(&interval.end, &last.end) == Ordering::Greater {
                    last.end = interval.end;
                }
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Intersects two sorted, disjoint interval lists.
pub fn intersect_all<T: Ord + Clone>(left: &[Interval<T>], right: &[Interval<T>]) -> Vec<Interval<T>> {
    let mut result = Vec::new();
    for l in left {
        for r in right {
            if let Some(i) = l.intersect(r) {
                result.push(i);
            }
        }
    }
    union_all(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(start: i32, end: i32) -> Interval<i32> {
        Interval::new(Bound::Excluded(start), Bound::Excluded(end))
    }

    #[test]
    fn test_constructors() {
        assert_eq!(Interval::closed(1, 5), Interval::new(Bound::Included(1), Bound::Included(5)));
        assert_eq!(Interval::open_closed(1, 5), Interval::new(Bound::Excluded(1), Bound::Included(5)));
        assert_eq!(Interval::closed_open(1, 5), Interval::new(Bound::Included(1), Bound::Excluded(5)));
        assert_eq!(Interval::point(3), Interval::closed(3, 3));
    }

    #[test]
    fn test_point_and_empty() {
        assert!(Interval::point(3).is_point());
        assert!(!Interval::closed(3, 4).is_point());
        assert!(Interval::closed_open(3, 3).is_empty());
        assert!(Interval::closed(4, 3).is_empty());
        assert!(!Interval::closed(3, 3).is_empty());
        assert!(!Interval::<i32>::new(Bound::Unbounded, Bound::Unbounded).is_empty());
    }

    #[test]
    fn test_intersect() {
        let a = Interval::closed(1, 10);
        let b = open(5, 20);
        assert_eq!(a.intersect(&b), Some(Interval::open_closed(5, 10)));
        let below = Interval::new(Bound::Unbounded, Bound::Excluded(3));
        let above = Interval::new(Bound::Included(3), Bound::Unbounded);
        assert_eq!(below.intersect(&above), None);
        let at_most = Interval::new(Bound::Unbounded, Bound::Included(3));
        assert_eq!(at_most.intersect(&above), Some(Interval::point(3)));
    }

    #[test]
    fn test_contains() {
        let a = Interval::closed_open(1, 10);
        assert!(a.contains_value(&1));
        assert!(!a.contains_value(&10));
        assert!(a.contains_interval(&open(2, 10)));
        assert!(!a.contains_interval(&Interval::closed(2, 10)));
        assert!(Interval::new(Bound::Unbounded, Bound::Unbounded).contains_interval(&a));
    }

    #[test]
    fn test_union_all() {
        let merged = union_all(vec![
            Interval::closed(5, 6),
            Interval::closed_open(1, 3),
            Interval::closed(3, 4),
            open(8, 9),
            open(9, 10),
            Interval::closed_open(2, 2),
        ]);
        assert_eq!(
            merged,
            vec![Interval::closed(1, 4), Interval::closed(5, 6), open(8, 9), open(9, 10)]
        );
    }

    #[test]
    fn test_intersect_all() {
        let left = vec![Interval::closed(1, 5), Interval::closed(10, 15)];
        let right = vec![open(4, 12)];
        assert_eq!(
            intersect_all(&left, &right),
            vec![Interval::open_closed(4, 5), Interval::closed_open(10, 12)]
        );
    }

    #[test]
    fn test_reversed() {
        let reversed = Interval::closed_open(1, 5).reversed();
        assert_eq!(reversed.start(), &Bound::Excluded(5));
        assert_eq!(reversed.end(), &Bound::Included(1));
    }
}
