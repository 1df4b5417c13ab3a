//! Rules deciding when an open outgoing batch is complete.

use sync_core::{Channel, OutgoingBatch};

/// Batch completion strategy, chosen per channel by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAlgorithm {
    /// `default`: the batch reached the channel's max size and the reader is at a transaction boundary.
    SizeThreshold,
    /// `transactional`: every source transaction gets its own batch.
    TransactionalBoundary,
    /// `nontransactional`: split on size alone, even inside a transaction.
    NonTransactional,
}

impl BatchAlgorithm {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" | "" => Some(BatchAlgorithm::SizeThreshold),
            "transactional" => Some(BatchAlgorithm::TransactionalBoundary),
            "nontransactional" => Some(BatchAlgorithm::NonTransactional),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BatchAlgorithm::SizeThreshold => "default",
            BatchAlgorithm::TransactionalBoundary => "transactional",
            BatchAlgorithm::NonTransactional => "nontransactional",
        }
    }

    /// Algorithm configured for a channel. Unknown names fall back to `default`.
    pub fn for_channel(channel: &Channel) -> Self {
        Self::from_name(&channel.batch_algorithm).unwrap_or_else(|| {
            tracing::warn!(
                "Could not find batch algorithm '{}' for channel {}. Using the default algorithm",
                channel.batch_algorithm,
                channel.channel_id
            );
            BatchAlgorithm::SizeThreshold
        })
    }

    pub fn is_batch_complete(
        &self,
        batch: &OutgoingBatch,
        max_batch_size: usize,
        at_transaction_boundary: bool,
    ) -> bool {
        let full = batch.data_event_count >= max_batch_size as i64;
        match self {
            BatchAlgorithm::SizeThreshold => full && at_transaction_boundary,
            BatchAlgorithm::TransactionalBoundary => at_transaction_boundary,
            BatchAlgorithm::NonTransactional => full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::OutgoingBatchStatus;

    fn batch_with(events: i64) -> OutgoingBatch {
        let mut batch = OutgoingBatch::new("store-001", "default", OutgoingBatchStatus::Routing);
        batch.data_event_count = events;
        batch
    }

    #[test]
    fn test_size_threshold_waits_for_boundary() {
        let algo = BatchAlgorithm::SizeThreshold;
        assert!(!algo.is_batch_complete(&batch_with(5), 5, false));
        assert!(algo.is_batch_complete(&batch_with(5), 5, true));
        assert!(!algo.is_batch_complete(&batch_with(4), 5, true));
    }

    #[test]
    fn test_transactional_ignores_size() {
        let algo = BatchAlgorithm::TransactionalBoundary;
        assert!(algo.is_batch_complete(&batch_with(1), 1000, true));
        assert!(!algo.is_batch_complete(&batch_with(5000), 1000, false));
    }

    #[test]
    fn test_nontransactional_splits_mid_transaction() {
        let algo = BatchAlgorithm::NonTransactional;
        assert!(algo.is_batch_complete(&batch_with(10), 10, false));
        assert!(!algo.is_batch_complete(&batch_with(9), 10, true));
    }

    #[test]
    fn test_unknown_name_falls_back() {
        let channel = Channel::new("default", 1).with_batch_algorithm("bogus");
        assert_eq!(BatchAlgorithm::for_channel(&channel), BatchAlgorithm::SizeThreshold);
        let channel = Channel::new("default", 1).with_batch_algorithm("transactional");
        assert_eq!(
            BatchAlgorithm::for_channel(&channel),
            BatchAlgorithm::TransactionalBoundary
        );
        assert_eq!(BatchAlgorithm::NonTransactional.name(), "nontransactional");
    }
}
