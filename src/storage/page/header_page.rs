use bincode::{Decode, Encode};

use crate::common::config::{PageId, DB_PAGE_SIZE};
use crate::storage::page::page::PageData;

/// Number of bytes reserved at the front of the header page before the
/// encoded record table.
const RECORDS_OFFSET: usize = 4;

/// The header page lives at the reserved page id 0 and stores one record
/// per named index: `index name -> root page id`. It is persisted through
/// normal buffer pool flushing like any other page.
#[derive(Debug, Default, Encode, Decode)]
pub struct HeaderPage {
    records: Vec<(String, PageId)>,
}

impl HeaderPage {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Decodes the header page from raw page content. A zeroed page decodes
    /// to an empty record table.
    pub fn load(data: &PageData) -> Self {
        let config = bincode::config::standard();
        match bincode::decode_from_slice(&data[RECORDS_OFFSET..], config) {
            Ok((page, _)) => page,
            Err(_) => Self::new(),
        }
    }

    /// Encodes the record table back into raw page content.
    ///
    /// # Panics
    ///
    /// Panics if the record table no longer fits in a page; callers bound
    /// the number of named indexes well below that.
    pub fn store(&self, data: &mut PageData) {
        let config = bincode::config::standard();
        data.reset_memory();
        bincode::encode_into_slice(self, &mut data[RECORDS_OFFSET..DB_PAGE_SIZE], config)
            .expect("header page record table exceeds page size");
    }

    /// Returns the root page id recorded for `name`.
    pub fn get_record(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, root)| root)
    }

    /// Inserts a record; returns false if `name` is already present.
    pub fn insert_record(&mut self, name: &str, root_id: PageId) -> bool {
        if self.get_record(name).is_some() {
            return false;
        }
        self.records.push((name.to_string(), root_id));
        true
    }

    /// Updates an existing record; returns false if `name` is absent.
    pub fn update_record(&mut self, name: &str, root_id: PageId) -> bool {
        match self.records.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => {
                entry.1 = root_id;
                true
            }
            None => false,
        }
    }

    /// Deletes a record; returns false if `name` is absent.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|(n, _)| n != name);
        self.records.len() != before
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }
}
