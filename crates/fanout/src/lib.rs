//! Append-only byte cache with live fan-out.
//!
//! A [`Cache`] has a single writer and any number of readers. Readers always
//! observe the full byte sequence from offset 0, in write order, regardless
//! of whether they attach before, during, or after the writes. The writer is
//! never blocked by readers.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    chunks: Vec<Bytes>,
    length: usize,
    closed: bool,
}

/// Broadcast byte cache. One writer, N readers, advisory TTL.
pub struct Cache {
    inner: RwLock<Inner>,
    notify: Notify,
    expires: Instant,
}

impl Cache {
    /// Create a cache that [`Cache::expired`] reports stale after `ttl`.
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            notify: Notify::new(),
            expires: Instant::now() + ttl,
        })
    }

    /// Append a copy of `p` and fan it out to all attached readers.
    ///
    /// The caller keeps ownership of `p` and may reuse it. Fails with
    /// [`io::ErrorKind::BrokenPipe`] once the cache is closed.
    pub fn write(&self, p: &[u8]) -> io::Result<usize> {
        self.push(Bytes::copy_from_slice(p))?;
        Ok(p.len())
    }

    /// Append an owned chunk without copying.
    pub fn push(&self, chunk: Bytes) -> io::Result<()> {
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "cache closed"));
            }
            inner.length += chunk.len();
            inner.chunks.push(chunk);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Mark end-of-stream. Idempotent; readers finish after draining.
    pub fn close(&self) {
        {
            let mut inner = self.inner.write();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    /// Total bytes written so far.
    pub fn len(&self) -> usize {
        self.inner.read().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the TTL has elapsed. Advisory; the owner decides eviction.
    pub fn expired(&self) -> bool {
        Instant::now() > self.expires
    }

    /// Wait for the chunk at `index`, or `None` once closed with no more data.
    ///
    /// The notified future is registered before the state re-check, so a
    /// write landing between the check and the await cannot be missed.
    async fn next_chunk(&self, index: usize) -> Option<Bytes> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.read();
                if index < inner.chunks.len() {
                    return Some(inner.chunks[index].clone());
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stream every chunk from offset 0 in write order until close.
    pub fn stream(self: &Arc<Self>) -> impl Stream<Item = Bytes> + Send + 'static {
        let cache = self.clone();
        futures::stream::unfold((cache, 0usize), |(cache, index)| async move {
            let chunk = cache.next_chunk(index).await?;
            Some((chunk, (cache, index + 1)))
        })
    }

    /// Copy the full cache contents into `w`, blocking until close.
    ///
    /// Returns the number of bytes copied, or the sink's error.
    pub async fn copy_to<W>(&self, w: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut index = 0usize;
        let mut copied = 0u64;
        while let Some(chunk) = self.next_chunk(index).await {
            w.write_all(&chunk).await?;
            copied += chunk.len() as u64;
            index += 1;
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(cache: &Arc<Cache>) -> Vec<u8> {
        let mut out = Vec::new();
        cache.copy_to(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn reader_before_writes_sees_everything() {
        let cache = Cache::new(Duration::from_secs(60));

        let reader = tokio::spawn({
            let cache = cache.clone();
            async move { collect(&cache).await }
        });

        // let the reader park first
        tokio::task::yield_now().await;

        cache.write(b"A").unwrap();
        cache.write(b"B").unwrap();
        cache.close();

        assert_eq!(reader.await.unwrap(), b"AB");
    }

    #[tokio::test]
    async fn late_reader_drains_then_follows_live() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.write(b"A").unwrap();
        cache.write(b"B").unwrap();

        let r1 = tokio::spawn({
            let cache = cache.clone();
            async move { collect(&cache).await }
        });
        tokio::task::yield_now().await;

        cache.write(b"C").unwrap();

        let r2 = tokio::spawn({
            let cache = cache.clone();
            async move { collect(&cache).await }
        });
        tokio::task::yield_now().await;

        cache.write(b"D").unwrap();
        cache.close();

        assert_eq!(r1.await.unwrap(), b"ABCD");
        assert_eq!(r2.await.unwrap(), b"ABCD");
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.write(b"A").unwrap();
        cache.close();
        cache.close(); // idempotent

        let err = cache.write(b"B").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn stream_ends_at_close() {
        let cache = Cache::new(Duration::from_secs(60));
        cache.write(b"he").unwrap();
        cache.write(b"llo").unwrap();
        cache.close();

        let chunks: Vec<Bytes> = cache.stream().collect().await;
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, b"hello");
    }

    #[tokio::test]
    async fn expiry_is_advisory() {
        let cache = Cache::new(Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.expired());
        // expired caches still serve
        cache.write(b"A").unwrap();
        cache.close();
        assert_eq!(collect(&cache).await, b"A");
    }
}
