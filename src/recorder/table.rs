//! In-memory attenuation table.

use crate::error::StorageError;
use crate::protocol::FrameRecord;

/// Two equal-length columns indexed by frame number.
///
/// Growth goes straight to the needed length; `Vec` keeps it amortised.
/// New slots read as zero. The table never shrinks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttenuationTable {
    adjustment: Vec<i64>,
    attenuation: Vec<i64>,
}

impl AttenuationTable {
    pub const FILL: i64 = 0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns(adjustment: Vec<i64>, attenuation: Vec<i64>) -> Option<Self> {
        (adjustment.len() == attenuation.len()).then_some(Self {
            adjustment,
            attenuation,
        })
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.adjustment.len(), self.attenuation.len());
        self.adjustment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(adjustment, attenuation)` for a frame
    pub fn get(&self, frame: usize) -> Option<(i64, i64)> {
        Some((*self.adjustment.get(frame)?, *self.attenuation.get(frame)?))
    }

    pub fn adjustment(&self) -> &[i64] {
        &self.adjustment
    }

    pub fn attenuation(&self) -> &[i64] {
        &self.attenuation
    }

    /// Grow both columns to at least `len`. Returns `true` if they grew.
    pub fn ensure_len(&mut self, len: usize) -> bool {
        if len <= self.len() {
            return false;
        }
        self.adjustment.resize(len, Self::FILL);
        self.attenuation.resize(len, Self::FILL);
        true
    }

    /// Store a record, growing first if needed. Returns the new length when
    /// the table grew.
    pub fn write(&mut self, record: &FrameRecord) -> Result<Option<usize>, StorageError> {
        let index = row_index(record.frame_number)?;
        let grew = self.ensure_len(index + 1).then(|| self.len());
        self.adjustment[index] = record.adjustment;
        self.attenuation[index] = record.attenuation;
        Ok(grew)
    }
}

/// Row index for a frame number, leaving room for `index + 1`.
pub fn row_index(frame_number: u64) -> Result<usize, StorageError> {
    usize::try_from(frame_number)
        .ok()
        .filter(|index| index.checked_add(1).is_some())
        .ok_or(StorageError::FrameOutOfRange(frame_number))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64, adjustment: i64, attenuation: i64) -> FrameRecord {
        FrameRecord {
            frame_number: n,
            adjustment,
            attenuation,
        }
    }

    #[test]
    fn gaps_are_zero_filled() {
        let mut table = AttenuationTable::new();
        assert_eq!(table.write(&frame(5, 1, 4)).unwrap(), Some(6));
        assert_eq!(table.len(), 6);
        for i in 0..5 {
            assert_eq!(table.get(i), Some((0, 0)));
        }
        assert_eq!(table.get(5), Some((1, 4)));
    }

    #[test]
    fn last_write_wins() {
        let mut table = AttenuationTable::new();
        table.write(&frame(2, 1, 1)).unwrap();
        assert_eq!(table.write(&frame(2, -1, 7)).unwrap(), None);
        assert_eq!(table.get(2), Some((-1, 7)));
    }

    #[test]
    fn out_of_order_frames_never_shrink() {
        let mut table = AttenuationTable::new();
        table.write(&frame(10, 1, 2)).unwrap();
        table.write(&frame(3, 5, 6)).unwrap();
        assert_eq!(table.len(), 11);
        assert_eq!(table.get(3), Some((5, 6)));
        assert_eq!(table.get(10), Some((1, 2)));
    }

    #[test]
    fn length_tracks_highest_frame() {
        let mut table = AttenuationTable::new();
        let mut highest = 0;
        for n in [0u64, 7, 3, 19, 19, 1, 42, 8] {
            table.write(&frame(n, n as i64, -(n as i64))).unwrap();
            highest = highest.max(n);
            assert!(table.len() as u64 >= n + 1);
            assert_eq!(table.len() as u64, highest + 1);
            assert_eq!(table.adjustment().len(), table.attenuation().len());
        }
        assert_eq!(table.get(20), Some((0, 0)));
    }

    #[test]
    fn unaddressable_frame_is_rejected() {
        let mut table = AttenuationTable::new();
        table.write(&frame(1, 1, 1)).unwrap();
        assert!(matches!(
            table.write(&frame(u64::MAX, 0, 1)),
            Err(StorageError::FrameOutOfRange(u64::MAX))
        ));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn mismatched_columns_rejected() {
        assert!(AttenuationTable::with_columns(vec![1], vec![]).is_none());
        assert!(AttenuationTable::with_columns(vec![1], vec![2]).is_some());
    }
}
