use std::time::Duration;

/** Cycle detection is performed every CYCLE_DETECTION_INTERVAL milliseconds. */
pub static CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(100);

pub const INVALID_PAGE_ID: PageId = u64::MAX; // invalid page id
pub const INVALID_TXN_ID: TxnId = u64::MAX; // invalid transaction id
pub const HEADER_PAGE_ID: PageId = 0; // reserved for index root records
pub const DB_PAGE_SIZE: usize = 4096; // size of a data page in bytes
pub const BUFFER_POOL_SIZE: usize = 10; // size of buffer pool
pub const BUCKET_SIZE: usize = 50; // size of extendible hash bucket
pub const LRUK_REPLACER_K: usize = 10; // lookback window for lru-k replacer

pub type FrameId = usize; // frame id type
pub type PageId = u64; // page id type
pub type TxnId = u64; // transaction id type
pub type SlotOffset = u64; // slot offset type
pub type TableOid = u64; // table object id type
