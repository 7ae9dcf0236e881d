// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Thin interface over a wide-column store offering conditional insert,
//! range query on sort key, batch transactional writes, and a
//! monotonically-incrementing sort-key allocator per partition (§4.1).
//!
//! The trait is intentionally narrow: everything above this layer treats
//! the store as an opaque, linearizable-per-partition key/value engine.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::errors::StoreError;

/// A single conditional write inside a [`StoreAdapter::batch`] call.
#[derive(Clone, Debug)]
pub struct BatchPut {
    pub partition: String,
    pub sort: u64,
    pub item: Vec<u8>,
    /// Only succeed if nothing is currently stored at `(partition, sort)`.
    pub if_absent: bool,
}

#[async_trait]
pub trait StoreAdapter: Send + Sync + 'static {
    /// Insert `item` at `(partition, sort)`. If `if_absent` is set, fails
    /// with [`StoreError::Conflict`] when an item is already present there.
    async fn put(
        &self,
        partition: &str,
        sort: u64,
        item: Vec<u8>,
        if_absent: bool,
    ) -> Result<(), StoreError>;

    /// Fetch the item at `(partition, sort)`, or [`StoreError::NotFound`].
    async fn get(&self, partition: &str, sort: u64) -> Result<Vec<u8>, StoreError>;

    /// Fetch all items with `sort >= from_sort` (and `sort <= to_sort` if
    /// given), ordered ascending by sort key.
    async fn range(
        &self,
        partition: &str,
        from_sort: u64,
        to_sort: Option<u64>,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;

    /// Apply every put in `ops` atomically: either all preconditions hold
    /// and all items are written, or none are written.
    async fn batch(&self, partition: &str, ops: Vec<BatchPut>) -> Result<(), StoreError>;

    /// Atomically allocate and return the next integer in the
    /// monotonically-increasing sequence for `partition`, starting at 1.
    async fn next_seq(&self, partition: &str) -> Result<u64, StoreError>;

    /// Reserve a contiguous range of `count` sequence numbers, returning the
    /// first one allocated. Implementations must perform this as a single
    /// atomic fetch-and-add against the partition's counter so that no
    /// other allocation can land inside the reserved range.
    async fn next_seq_range(&self, partition: &str, count: u64) -> Result<u64, StoreError>;

    async fn delete(&self, partition: &str, sort: u64) -> Result<(), StoreError>;
}
