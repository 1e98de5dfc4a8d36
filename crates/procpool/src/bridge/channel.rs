//! Duplex message channel between the master and one worker.
//!
//! A channel is a framed reader plus a framed writer of [`Message`]s over any
//! byte stream pair:
//! - **stdio**: worker side, talking to its parent over stdin/stdout
//! - **child pipes**: master side, over a spawned child's stdin/stdout
//! - **in-process pair**: two connected ends backed by `tokio::io::duplex`

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::Message;
use crate::error::IpcError;

/// Buffer size for in-process channel pairs.
const PAIR_BUFFER_SIZE: usize = 64 * 1024;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub type ChannelReader = FramedRead<BoxedRead, JsonCodec<Message>>;
pub type ChannelWriter = FramedWrite<BoxedWrite, JsonCodec<Message>>;

/// One frame read off a channel: framing errors are the outer `io::Error`,
/// undecodable payloads the inner `IpcError`.
pub type Inbound = io::Result<Result<Message, IpcError>>;

pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    pub fn new<R, W>(read: R, write: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FramedRead::new(Box::new(read) as BoxedRead, JsonCodec::new()),
            writer: FramedWrite::new(Box::new(write) as BoxedWrite, JsonCodec::new()),
        }
    }

    /// Worker-side channel to the parent over stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Master-side channel over a spawned child's stdin/stdout.
    ///
    /// The child must have been spawned with both piped.
    pub fn from_child(child: &mut Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdout not captured"))?;
        Ok(Self::new(stdout, stdin))
    }

    /// Two connected in-process ends. Whatever one end sends the other receives.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(PAIR_BUFFER_SIZE);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Self::new(a_read, a_write), Self::new(b_read, b_write))
    }

    pub async fn send(&mut self, msg: Message) -> io::Result<()> {
        self.writer.send(msg).await
    }

    /// Next frame, or `None` once the peer has closed its end.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.reader.next().await
    }

    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (mut master, mut worker) = Channel::pair();

        master.send(Message::ping()).await.unwrap();
        master.send(Message::note(json!(1))).await.unwrap();
        master.send(Message::note(json!(2))).await.unwrap();

        assert_eq!(worker.recv().await.unwrap().unwrap().unwrap(), Message::Ping);
        assert_eq!(
            worker.recv().await.unwrap().unwrap().unwrap(),
            Message::note(json!(1))
        );
        assert_eq!(
            worker.recv().await.unwrap().unwrap().unwrap(),
            Message::note(json!(2))
        );
    }

    #[tokio::test]
    async fn recv_returns_none_after_peer_drops() {
        let (master, mut worker) = Channel::pair();
        drop(master);
        assert!(worker.recv().await.is_none());
    }

    #[tokio::test]
    async fn split_halves_talk_both_ways() {
        let (master, mut worker) = Channel::pair();
        let (mut reader, mut writer) = master.into_split();

        writer.send(Message::ping()).await.unwrap();
        assert_eq!(worker.recv().await.unwrap().unwrap().unwrap(), Message::Ping);

        worker.send(Message::pong()).await.unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap().unwrap(), Message::Pong);
    }
}
