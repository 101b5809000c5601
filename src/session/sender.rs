//! Session-wide outbound message queue.
//!
//! All channels of a session share one sender; it is the sole serialization
//! point interleaving their outbound traffic. Two bounded lanes implement
//! the priority scheme: the high lane carries latency-sensitive control
//! traffic (heartbeat responses), the blockable lane everything else. The
//! outbound pump always drains the high lane first.
//!
//! Backpressure policy: with `allow_blocking = false` a full lane fails the
//! enqueue immediately with a protocol error (the caller treats this as
//! session-fatal rather than stalling the dispatch path); with
//! `allow_blocking = true` the calling task is suspended until capacity is
//! available, which is the desired behavior for bulk transfer traffic on
//! dedicated tasks.

use crate::error::{Result, UplinkError};
use crate::protocol::{write_message_block, MessageBlock};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

/// Queue capacity for the high-priority control lane
pub const HIGH_PRIORITY_QUEUE_SIZE: usize = 32;

/// Queue capacity for the blockable bulk lane
pub const BLOCKABLE_QUEUE_SIZE: usize = 64;

/// Priority of an outbound message block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBlockPriority {
    /// Latency-sensitive control traffic; must never wait behind bulk data.
    High,
    /// Regular channel traffic, including file transfers; may be stalled by
    /// backpressure.
    BlockableChannelOperation,
}

/// The send primitive shared by all channel endpoints of a session.
#[async_trait]
pub trait SessionMessageSender: Send + Sync {
    /// Enqueues a message block for sending on the given channel. Fails
    /// with a protocol error if the target lane is full and blocking is
    /// not allowed.
    async fn enqueue(
        &self,
        channel_id: u64,
        block: MessageBlock,
        priority: MessageBlockPriority,
        allow_blocking: bool,
    ) -> Result<()>;
}

/// A queued outbound message, addressed to a channel.
type OutboundItem = (u64, MessageBlock);

/// The default [`SessionMessageSender`]: two bounded lanes feeding an
/// [`OutboundQueue`].
pub struct QueuingMessageSender {
    high_tx: mpsc::Sender<OutboundItem>,
    blockable_tx: mpsc::Sender<OutboundItem>,
}

impl QueuingMessageSender {
    pub fn new() -> (Arc<Self>, OutboundQueue) {
        Self::with_capacities(HIGH_PRIORITY_QUEUE_SIZE, BLOCKABLE_QUEUE_SIZE)
    }

    pub fn with_capacities(high: usize, blockable: usize) -> (Arc<Self>, OutboundQueue) {
        let (high_tx, high_rx) = mpsc::channel(high);
        let (blockable_tx, blockable_rx) = mpsc::channel(blockable);
        (
            Arc::new(Self {
                high_tx,
                blockable_tx,
            }),
            OutboundQueue {
                high_rx,
                blockable_rx,
                high_closed: false,
                blockable_closed: false,
            },
        )
    }

    fn lane(&self, priority: MessageBlockPriority) -> &mpsc::Sender<OutboundItem> {
        match priority {
            MessageBlockPriority::High => &self.high_tx,
            MessageBlockPriority::BlockableChannelOperation => &self.blockable_tx,
        }
    }
}

#[async_trait]
impl SessionMessageSender for QueuingMessageSender {
    async fn enqueue(
        &self,
        channel_id: u64,
        block: MessageBlock,
        priority: MessageBlockPriority,
        allow_blocking: bool,
    ) -> Result<()> {
        let lane = self.lane(priority);
        if allow_blocking {
            lane.send((channel_id, block)).await.map_err(|_| {
                UplinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "session outbound queue has shut down",
                ))
            })
        } else {
            match lane.try_send((channel_id, block)) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(UplinkError::protocol(format!(
                    "outgoing {priority:?} queue is full and blocking is not allowed"
                ))),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(UplinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "session outbound queue has shut down",
                ))),
            }
        }
    }
}

/// The consuming end of a [`QueuingMessageSender`]. Either drive it with
/// [`OutboundQueue::pump`] against a session stream, or drain it manually
/// with [`OutboundQueue::next`].
pub struct OutboundQueue {
    high_rx: mpsc::Receiver<OutboundItem>,
    blockable_rx: mpsc::Receiver<OutboundItem>,
    high_closed: bool,
    blockable_closed: bool,
}

impl OutboundQueue {
    /// Returns the next outbound message, preferring the high lane whenever
    /// both have messages ready. Returns `None` once both lanes are closed
    /// and drained.
    pub async fn next(&mut self) -> Option<OutboundItem> {
        loop {
            if self.high_closed && self.blockable_closed {
                return None;
            }
            tokio::select! {
                biased;
                item = self.high_rx.recv(), if !self.high_closed => {
                    match item {
                        Some(item) => return Some(item),
                        None => self.high_closed = true,
                    }
                }
                item = self.blockable_rx.recv(), if !self.blockable_closed => {
                    match item {
                        Some(item) => return Some(item),
                        None => self.blockable_closed = true,
                    }
                }
            }
        }
    }

    /// Writes queued messages to the session stream until all senders are
    /// dropped or a write fails.
    pub async fn pump<W: AsyncWrite + Unpin>(mut self, mut writer: W) -> Result<()> {
        while let Some((channel_id, block)) = self.next().await {
            write_message_block(&mut writer, channel_id, &block).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_high_priority_drained_first() {
        let (sender, mut queue) = QueuingMessageSender::with_capacities(4, 4);

        sender
            .enqueue(
                1,
                MessageBlock::empty(MessageType::FileTransferSectionEnd),
                MessageBlockPriority::BlockableChannelOperation,
                false,
            )
            .await
            .unwrap();
        sender
            .enqueue(
                1,
                MessageBlock::empty(MessageType::HeartbeatResponse),
                MessageBlockPriority::High,
                false,
            )
            .await
            .unwrap();

        let (_, first) = queue.next().await.unwrap();
        assert_eq!(first.message_type(), MessageType::HeartbeatResponse);
        let (_, second) = queue.next().await.unwrap();
        assert_eq!(second.message_type(), MessageType::FileTransferSectionEnd);
    }

    #[tokio::test]
    async fn test_non_blocking_enqueue_fails_when_full() {
        let (sender, _queue) = QueuingMessageSender::with_capacities(1, 1);

        sender
            .enqueue(
                1,
                MessageBlock::empty(MessageType::Heartbeat),
                MessageBlockPriority::High,
                false,
            )
            .await
            .unwrap();
        let err = sender
            .enqueue(
                1,
                MessageBlock::empty(MessageType::Heartbeat),
                MessageBlockPriority::High,
                false,
            )
            .await
            .unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_blocking_enqueue_waits_for_capacity() {
        let (sender, mut queue) = QueuingMessageSender::with_capacities(1, 1);

        sender
            .enqueue(
                1,
                MessageBlock::empty(MessageType::ChannelClose),
                MessageBlockPriority::BlockableChannelOperation,
                true,
            )
            .await
            .unwrap();

        // The second blocking enqueue must suspend until the queue drains.
        let sender2 = sender.clone();
        let enqueue_task = tokio::spawn(async move {
            sender2
                .enqueue(
                    2,
                    MessageBlock::empty(MessageType::ChannelClose),
                    MessageBlockPriority::BlockableChannelOperation,
                    true,
                )
                .await
        });

        let (channel_id, _) = queue.next().await.unwrap();
        assert_eq!(channel_id, 1);
        enqueue_task.await.unwrap().unwrap();
        let (channel_id, _) = queue.next().await.unwrap();
        assert_eq!(channel_id, 2);
    }

    #[tokio::test]
    async fn test_pump_writes_frames() {
        let (sender, queue) = QueuingMessageSender::new();
        let (writer, mut reader) = tokio::io::duplex(1024);

        let pump = tokio::spawn(queue.pump(writer));
        sender
            .enqueue(
                9,
                MessageBlock::new(MessageType::FileContent, &b"abc"[..]).unwrap(),
                MessageBlockPriority::BlockableChannelOperation,
                true,
            )
            .await
            .unwrap();

        let (channel_id, block) = crate::protocol::read_message_block(&mut reader).await.unwrap();
        assert_eq!(channel_id, 9);
        assert_eq!(block.data().as_ref(), b"abc");

        drop(sender);
        pump.await.unwrap().unwrap();
    }
}
