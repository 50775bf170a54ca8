//! Iterator helpers.

use std::iter::Zip;

/// A variant of [`Iterator::zip`] that panics if the iterators have different lengths.
///
/// [`Iterator::zip`] stops as soon as either iterator is exhausted, silently dropping the rest of
/// the longer one. This function checks both lengths up front instead, and should be used wherever
/// the two sequences are expected to pair up one-to-one.
#[track_caller]
pub fn zip_exact<A, B>(a: A, b: B) -> Zip<A::IntoIter, B::IntoIter>
where
    A: IntoIterator,
    B: IntoIterator,
    A::IntoIter: ExactSizeIterator,
    B::IntoIter: ExactSizeIterator,
{
    let a = a.into_iter();
    let b = b.into_iter();
    assert_eq!(
        a.len(),
        b.len(),
        "`zip_exact` called on iterators with different lengths"
    );

    a.zip(b)
}

/// Returns the `(index, distance)` pair with the smallest distance.
///
/// Ties are resolved in favor of the smallest index, regardless of iteration order. NaN distances
/// are never selected.
pub fn nearest(candidates: impl IntoIterator<Item = (usize, f32)>) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, dist) in candidates {
        if dist.is_nan() {
            continue;
        }
        best = match best {
            Some((best_index, best_dist))
                if best_dist < dist || (best_dist == dist && best_index < index) =>
            {
                Some((best_index, best_dist))
            }
            _ => Some((index, dist)),
        };
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_prefers_lowest_index_on_ties() {
        assert_eq!(nearest([(5, 1.0), (3, 1.0), (9, 2.0)]), Some((3, 1.0)));
        assert_eq!(nearest([(3, 1.0), (5, 1.0)]), Some((3, 1.0)));
        assert_eq!(nearest([(7, 0.5), (3, 1.0)]), Some((7, 0.5)));
    }

    #[test]
    fn nearest_skips_nan() {
        assert_eq!(nearest([(0, f32::NAN), (1, 4.0)]), Some((1, 4.0)));
        assert_eq!(nearest([(0, f32::NAN)]), None);
        assert_eq!(nearest([]), None);
    }

    #[test]
    #[should_panic]
    fn zip_exact_length_mismatch() {
        zip_exact([1, 2], [1]).for_each(drop);
    }
}
