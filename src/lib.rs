//! Storage and concurrency core of a disk-backed relational engine:
//! a fixed-size buffer pool under LRU-K eviction, an extendible hash
//! table serving as its resident-page directory, a latch-crabbing B+Tree
//! index, and a hierarchical two-phase lock manager with deadlock
//! detection.

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod container;
pub mod storage;
