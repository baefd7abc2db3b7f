use bincode::{Decode, Encode};

use crate::common::config::PageId;

/// Record id: the physical address of a tuple, `(page_id, slot_num)`.
///
/// This is the value type stored in index leaves and the key of the lock
/// manager's row-lock map. It travels to and from disk inside the bincode
/// body of a leaf page, never as a standalone on-disk record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct RID {
    page_id: PageId,
    slot_num: u32,
}

impl RID {
    pub const fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }

    /// Page of the table heap holding the tuple.
    pub const fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Slot index within that page's slot directory.
    pub const fn slot_num(&self) -> u32 {
        self.slot_num
    }
}
