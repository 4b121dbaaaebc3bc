//! Index selections over the canonical TCZYX axes.

use std::ops::{Range, RangeFrom, RangeFull, RangeInclusive, RangeTo};

use crate::metadata::Axis;

/// Selection along one axis.
///
/// An integer index keeps its axis with size 1, so every read is 5-D.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AxisSelection {
    #[default]
    All,
    Index(usize),
    Range(Range<usize>),
}

impl AxisSelection {
    /// Resolve against an axis of `size` elements.
    fn resolve(&self, axis: Axis, size: usize) -> Result<Range<usize>, String> {
        match *self {
            AxisSelection::All => Ok(0..size),
            AxisSelection::Index(i) if i < size => Ok(i..i + 1),
            AxisSelection::Index(i) => Err(format!(
                "index {} out of range for {} of size {}",
                i,
                axis.letter(),
                size
            )),
            AxisSelection::Range(ref r) if r.start <= r.end && r.end <= size => Ok(r.clone()),
            AxisSelection::Range(ref r) => Err(format!(
                "range {}..{} out of range for {} of size {}",
                r.start,
                r.end,
                axis.letter(),
                size
            )),
        }
    }
}

impl From<usize> for AxisSelection {
    fn from(index: usize) -> Self {
        AxisSelection::Index(index)
    }
}

impl From<Range<usize>> for AxisSelection {
    fn from(range: Range<usize>) -> Self {
        AxisSelection::Range(range)
    }
}

impl From<RangeInclusive<usize>> for AxisSelection {
    fn from(range: RangeInclusive<usize>) -> Self {
        AxisSelection::Range(*range.start()..range.end() + 1)
    }
}

impl From<RangeTo<usize>> for AxisSelection {
    fn from(range: RangeTo<usize>) -> Self {
        AxisSelection::Range(0..range.end)
    }
}

impl From<RangeFrom<usize>> for AxisSelection {
    fn from(range: RangeFrom<usize>) -> Self {
        AxisSelection::Range(range.start..usize::MAX)
    }
}

impl From<RangeFull> for AxisSelection {
    fn from(_: RangeFull) -> Self {
        AxisSelection::All
    }
}

/// A selection over all five axes.
///
/// ```
/// use bioimage_streamer::array::Selection;
///
/// // [0:1, 0:2, 2, :, :]
/// let sel = Selection::all().t(0..1).c(0..2).z(2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    axes: [AxisSelection; 5],
}

impl Selection {
    /// Everything along every axis.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, axis: Axis, selection: impl Into<AxisSelection>) -> Self {
        self.axes[axis.index()] = selection.into();
        self
    }

    pub fn t(self, s: impl Into<AxisSelection>) -> Self {
        self.with(Axis::T, s)
    }

    pub fn c(self, s: impl Into<AxisSelection>) -> Self {
        self.with(Axis::C, s)
    }

    pub fn z(self, s: impl Into<AxisSelection>) -> Self {
        self.with(Axis::Z, s)
    }

    pub fn y(self, s: impl Into<AxisSelection>) -> Self {
        self.with(Axis::Y, s)
    }

    pub fn x(self, s: impl Into<AxisSelection>) -> Self {
        self.with(Axis::X, s)
    }

    pub fn get(&self, axis: Axis) -> &AxisSelection {
        &self.axes[axis.index()]
    }

    /// Resolve to concrete half-open ranges against `shape`.
    ///
    /// Open-ended ranges are clamped to the axis size.
    pub fn resolve(&self, shape: [usize; 5]) -> Result<[Range<usize>; 5], String> {
        let mut resolved: [Range<usize>; 5] = Default::default();
        for axis in Axis::ALL {
            let i = axis.index();
            let selection = match &self.axes[i] {
                AxisSelection::Range(r) if r.end == usize::MAX => {
                    AxisSelection::Range(r.start..shape[i].max(r.start))
                }
                other => other.clone(),
            };
            resolved[i] = selection.resolve(axis, shape[i])?;
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_mixed() {
        let sel = Selection::all().t(0..1).c(0..2).z(2).x(10..);
        let ranges = sel.resolve([2, 3, 5, 512, 512]).unwrap();
        assert_eq!(ranges, [0..1, 0..2, 2..3, 0..512, 10..512]);
    }

    #[test]
    fn test_out_of_range() {
        assert!(Selection::all().z(5).resolve([1, 1, 5, 4, 4]).is_err());
        assert!(Selection::all().y(0..5).resolve([1, 1, 1, 4, 4]).is_err());
        assert!(Selection::all().x(9..).resolve([1, 1, 1, 4, 4]).is_err());
        #[allow(clippy::reversed_empty_ranges)]
        let reversed = Selection::all().y(3..1);
        assert!(reversed.resolve([1, 1, 1, 4, 4]).is_err());
    }

    #[test]
    fn test_empty_ranges_are_valid() {
        let ranges = Selection::all().y(2..2).resolve([1, 1, 1, 4, 4]).unwrap();
        assert!(ranges[3].is_empty());
    }
}
