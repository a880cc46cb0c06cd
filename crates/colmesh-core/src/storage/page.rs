//! Bit-packed pages of dictionary ids.

use bytes::Bytes;

use crate::error::Error;

/// Default number of rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// A run of dictionary ids for a contiguous sub-range of rows.
///
/// Ids are packed little-endian with the minimum bit width able to hold the
/// largest id of the page. Pages own their encoded bytes.
///
/// Fixed pages never move. Adjustable pages may be renamed or repositioned,
/// which is only legal while the owning shard is still private to its builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPage {
    column: String,
    first_row_id: u64,
    len: u32,
    bits: u8,
    data: Bytes,
    adjustable: bool,
}

impl ColumnPage {
    /// Encode a page from ids.
    pub fn encode(column: impl Into<String>, first_row_id: u64, ids: &[u32], adjustable: bool) -> Self {
        let max = ids.iter().copied().max().unwrap_or(0);
        let bits = bit_width(max);
        Self {
            column: column.into(),
            first_row_id,
            len: ids.len() as u32,
            bits,
            data: Bytes::from(pack(ids, bits)),
            adjustable,
        }
    }

    /// Reassemble a page from its stored parts.
    pub fn from_parts(
        column: impl Into<String>,
        first_row_id: u64,
        len: u32,
        bits: u8,
        data: Bytes,
        adjustable: bool,
    ) -> Result<Self, Error> {
        let column = column.into();
        let needed = (len as usize * bits as usize).div_ceil(8);
        if bits == 0 || bits > 32 || data.len() < needed {
            return Err(Error::InvalidShard(format!(
                "page of '{}' at row {}: {} bytes cannot hold {} ids of {} bits",
                column,
                first_row_id,
                data.len(),
                len,
                bits
            )));
        }
        Ok(Self {
            column,
            first_row_id,
            len,
            bits,
            data,
            adjustable,
        })
    }

    /// Id stored at a page-local offset.
    pub fn decode_id(&self, offset: usize) -> Option<u32> {
        if offset >= self.len as usize {
            return None;
        }
        Some(unpack(&self.data, self.bits, offset))
    }

    /// Every id of the page, in row order.
    pub fn decode_ids(&self) -> Vec<u32> {
        (0..self.len as usize)
            .map(|i| unpack(&self.data, self.bits, i))
            .collect()
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn first_row_id(&self) -> u64 {
        self.first_row_id
    }

    /// One past the last row id of the page.
    pub fn end_row_id(&self) -> u64 {
        self.first_row_id.saturating_add(self.len as u64)
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Encoded bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_adjustable(&self) -> bool {
        self.adjustable
    }

    pub fn contains(&self, row_id: u64) -> bool {
        row_id >= self.first_row_id && row_id < self.end_row_id()
    }

    /// Move the page to a new first row id.
    pub fn set_first_row_id(&mut self, first_row_id: u64) -> Result<(), Error> {
        self.ensure_adjustable()?;
        self.first_row_id = first_row_id;
        Ok(())
    }

    /// Rename the column the page belongs to.
    pub fn set_column_name(&mut self, column: impl Into<String>) -> Result<(), Error> {
        self.ensure_adjustable()?;
        self.column = column.into();
        Ok(())
    }

    pub(crate) fn ensure_adjustable(&self) -> Result<(), Error> {
        if self.adjustable {
            Ok(())
        } else {
            Err(Error::PageNotAdjustable {
                column: self.column.clone(),
                first_row_id: self.first_row_id,
            })
        }
    }

    /// Approximate heap footprint.
    pub fn approximate_size_in_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.column.len() + self.data.len()
    }
}

fn bit_width(max: u32) -> u8 {
    (32 - max.leading_zeros()).max(1) as u8
}

fn pack(ids: &[u32], bits: u8) -> Vec<u8> {
    let bits = bits as usize;
    let mut out = vec![0u8; (ids.len() * bits).div_ceil(8)];
    let mut pos = 0usize;
    for &id in ids {
        let mut rest = id as u64;
        let mut remaining = bits;
        while remaining > 0 {
            let shift = pos % 8;
            let take = (8 - shift).min(remaining);
            let mask = (1u64 << take) - 1;
            out[pos / 8] |= ((rest & mask) as u8) << shift;
            rest >>= take;
            pos += take;
            remaining -= take;
        }
    }
    out
}

fn unpack(data: &[u8], bits: u8, index: usize) -> u32 {
    let bits = bits as usize;
    let mut pos = index * bits;
    let mut remaining = bits;
    let mut written = 0usize;
    let mut out = 0u64;
    while remaining > 0 {
        let shift = pos % 8;
        let take = (8 - shift).min(remaining);
        let mask = ((1u16 << take) - 1) as u8;
        let part = (data[pos / 8] >> shift) & mask;
        out |= (part as u64) << written;
        written += take;
        pos += take;
        remaining -= take;
    }
    out as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_width() {
        assert_eq!(bit_width(0), 1);
        assert_eq!(bit_width(1), 1);
        assert_eq!(bit_width(2), 2);
        assert_eq!(bit_width(255), 8);
        assert_eq!(bit_width(256), 9);
        assert_eq!(bit_width(u32::MAX), 32);
    }

    #[test]
    fn test_odd_widths_decode() {
        let ids: Vec<u32> = (0..100).map(|i| (i * 37) % 101).collect();
        let page = ColumnPage::encode("c", 10, &ids, false);
        assert_eq!(page.bits(), 7);
        assert_eq!(page.decode_ids(), ids);
        assert_eq!(page.decode_id(99), Some(ids[99]));
        assert_eq!(page.decode_id(100), None);
        assert_eq!(page.end_row_id(), 110);
    }

    #[test]
    fn test_wide_ids_decode() {
        let ids = vec![u32::MAX, 0, 1 << 31, 12345];
        let page = ColumnPage::encode("c", 0, &ids, false);
        assert_eq!(page.decode_ids(), ids);
    }

    #[test]
    fn test_fixed_page_cannot_move() {
        let mut page = ColumnPage::encode("c", 0, &[1, 2], false);
        assert!(matches!(
            page.set_first_row_id(5),
            Err(Error::PageNotAdjustable { first_row_id: 0, .. })
        ));
        assert!(page.set_column_name("d").is_err());
        assert_eq!(page.first_row_id(), 0);

        let mut page = ColumnPage::encode("c", 0, &[1, 2], true);
        page.set_first_row_id(5).unwrap();
        page.set_column_name("d").unwrap();
        assert_eq!(page.first_row_id(), 5);
        assert_eq!(page.column(), "d");
        assert!(page.contains(6));
        assert!(!page.contains(7));
    }

    #[test]
    fn test_from_parts_checks_length() {
        let page = ColumnPage::encode("c", 0, &[3, 3, 3], false);
        let rebuilt =
            ColumnPage::from_parts("c", 0, 3, page.bits(), page.data().clone(), false).unwrap();
        assert_eq!(rebuilt, page);
        assert!(ColumnPage::from_parts("c", 0, 30, page.bits(), page.data().clone(), false).is_err());
    }
}
