use crate::common::{PageId, Result, SkiffError, PAGE_SIZE};

/// Record layout: 32 bytes of NUL-padded index name + 4 bytes of root id.
const RECORD_NAME_LEN: usize = 32;
const RECORD_SIZE: usize = RECORD_NAME_LEN + 4;
const COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;

/// Largest number of index records one header page can hold.
pub const MAX_HEADER_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// Shared view of the header page: the `index name -> root page id` record
/// table stored on page 0. Every root change of a named index is persisted
/// here so the index can be reopened after a restart.
pub struct HeaderPage<'a> {
    data: &'a [u8],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn num_records(&self) -> usize {
        let bytes: [u8; 4] = self.data[COUNT_OFFSET..COUNT_OFFSET + 4].try_into().unwrap();
        u32::from_le_bytes(bytes) as usize
    }

    /// Looks up the root page id recorded under `name`.
    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        let idx = self.find_record(name)?;
        let offset = RECORDS_OFFSET + idx * RECORD_SIZE + RECORD_NAME_LEN;
        let bytes: [u8; 4] = self.data[offset..offset + 4].try_into().unwrap();
        Some(PageId::new(u32::from_le_bytes(bytes)))
    }

    fn find_record(&self, name: &str) -> Option<usize> {
        let needle = name.as_bytes();
        (0..self.num_records()).find(|&i| {
            let offset = RECORDS_OFFSET + i * RECORD_SIZE;
            let stored = &self.data[offset..offset + RECORD_NAME_LEN];
            let end = stored.iter().position(|&b| b == 0).unwrap_or(RECORD_NAME_LEN);
            &stored[..end] == needle
        })
    }
}

/// Mutable view of the header page.
pub struct HeaderPageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
    }

    /// Inserts or updates the record for `name`.
    pub fn set_record(&mut self, name: &str, root_id: PageId) -> Result<()> {
        if name.len() > RECORD_NAME_LEN {
            return Err(SkiffError::IndexNameTooLong(name.to_string()));
        }

        let view = HeaderPage::new(self.data);
        let num_records = view.num_records();
        let idx = match view.find_record(name) {
            Some(idx) => idx,
            None => {
                if num_records >= MAX_HEADER_RECORDS {
                    return Err(SkiffError::HeaderPageFull);
                }
                let idx = num_records;
                self.set_num_records(num_records + 1);
                let offset = RECORDS_OFFSET + idx * RECORD_SIZE;
                self.data[offset..offset + RECORD_NAME_LEN].fill(0);
                self.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
                idx
            }
        };

        let offset = RECORDS_OFFSET + idx * RECORD_SIZE + RECORD_NAME_LEN;
        self.data[offset..offset + 4].copy_from_slice(&root_id.as_u32().to_le_bytes());
        Ok(())
    }

    /// Drops the record for `name`, reporting whether it existed.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let view = HeaderPage::new(self.data);
        let num_records = view.num_records();
        let Some(idx) = view.find_record(name) else {
            return false;
        };

        // Shift the tail records down over the removed slot.
        let start = RECORDS_OFFSET + (idx + 1) * RECORD_SIZE;
        let end = RECORDS_OFFSET + num_records * RECORD_SIZE;
        let dst = RECORDS_OFFSET + idx * RECORD_SIZE;
        self.data.copy_within(start..end, dst);
        self.set_num_records(num_records - 1);
        true
    }

    fn set_num_records(&mut self, count: usize) {
        self.data[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&(count as u32).to_le_bytes());
    }
}
