//! Block tracker — maintains a sliding window of recent block headers
//! for parent-hash chain verification and reorg detection.

use std::collections::VecDeque;

use crate::items::BlockItem;

/// A detected parent-hash mismatch. The tracker is left untouched; the
/// scheduler locates the common ancestor and rewinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Block number whose parent hash failed verification.
    pub detected_at: u64,
    /// Parent hash the tracked head implied.
    pub expected_parent: String,
    /// Parent hash the incoming block actually carried.
    pub got_parent: String,
}

/// Tracks the last N block headers to enable reorg detection.
///
/// When a new block arrives, the tracker checks whether its `parent_hash`
/// matches the hash of the previous block. A mismatch means a reorg occurred.
pub struct BlockTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<BlockItem>,
    /// Maximum number of blocks to retain.
    window_size: usize,
}

impl BlockTracker {
    /// Create a new tracker with the given window size.
    /// A window of 128 covers deep reorgs for all major EVM chains.
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Add a new block to the tracker.
    ///
    /// Returns `Err` without mutating the window if the block does not
    /// extend the current head.
    pub fn push(&mut self, block: BlockItem) -> Result<(), ReorgEvent> {
        if let Some(head) = self.window.back() {
            if !block.extends(head) {
                return Err(ReorgEvent {
                    detected_at: block.number,
                    expected_parent: head.hash.clone(),
                    got_parent: block.parent_hash.clone(),
                });
            }
        }
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
        Ok(())
    }

    /// Returns the current chain head (most recently added block).
    pub fn head(&self) -> Option<&BlockItem> {
        self.window.back()
    }

    /// Tracked blocks, newest first. The scheduler walks this against
    /// refetched canonical headers to locate the common ancestor.
    pub fn newest_first(&self) -> impl Iterator<Item = &BlockItem> {
        self.window.iter().rev()
    }

    /// Number of blocks in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Rewind the tracker to a given block number (discard everything after it).
    pub fn rewind_to(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number > block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> BlockItem {
        BlockItem {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: (number * 12) as i64,
        }
    }

    #[test]
    fn push_normal_chain() {
        let mut tracker = BlockTracker::new(10);
        tracker.push(block(100, "0xa", "0x0")).unwrap();
        tracker.push(block(101, "0xb", "0xa")).unwrap();
        tracker.push(block(102, "0xc", "0xb")).unwrap();
        assert_eq!(tracker.head().unwrap().number, 102);
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn push_detects_reorg_without_mutating() {
        let mut tracker = BlockTracker::new(10);
        tracker.push(block(100, "0xa", "0x0")).unwrap();
        tracker.push(block(101, "0xb", "0xa")).unwrap();

        let event = tracker.push(block(102, "0xc2", "0xb'")).unwrap_err();
        assert_eq!(event.detected_at, 102);
        assert_eq!(event.expected_parent, "0xb");
        assert_eq!(event.got_parent, "0xb'");
        // Window untouched.
        assert_eq!(tracker.head().unwrap().number, 101);
    }

    #[test]
    fn rewind_to() {
        let mut tracker = BlockTracker::new(10);
        for i in 100..=110 {
            let prev = if i == 100 { "0x0".to_string() } else { format!("0x{}", i - 1) };
            tracker.push(block(i, &format!("0x{i}"), &prev)).unwrap();
        }
        assert_eq!(tracker.head().unwrap().number, 110);
        tracker.rewind_to(105);
        assert_eq!(tracker.head().unwrap().number, 105);
        // Can resume from the rewound head.
        tracker.push(block(106, "0x106'", "0x105")).unwrap();
    }

    #[test]
    fn window_size_enforced() {
        let mut tracker = BlockTracker::new(5);
        for i in 0..10 {
            let prev = if i == 0 { "0x0".to_string() } else { format!("0x{}", i - 1) };
            tracker.push(block(i, &format!("0x{i}"), &prev)).unwrap();
        }
        assert_eq!(tracker.len(), 5); // oldest blocks evicted
    }
}
