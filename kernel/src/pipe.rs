//! Asynchronous pipes
//!
//! Unidirectional bounded FIFO between one read end and one write end.
//! Reads on an empty pipe and writes that overflow the capacity suspend
//! the caller; the opposite end wakes it. Both ends are reference
//! counted: dropping the last writer handle signals EOF to the reader,
//! dropping the last reader handle signals EPIPE to the writer. Byte
//! order is preserved exactly across any interleaving of short writes.
//!
//! Invariants: at most one pending reader and at most one pending
//! writer per pipe (enforced by the typed slots below); a pending
//! reader exists only while the buffer is empty and the write side is
//! open; a pending writer exists only while its residual does not fit
//! and the read side is open.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_channel::oneshot;
use parking_lot::Mutex;

/// Default capacity of a pipe created by the kernel.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Pipe-layer error. The only condition a writer can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    #[error("EPIPE: broken pipe")]
    Broken,
}

struct PendingReader {
    max: usize,
    tx: oneshot::Sender<Vec<u8>>,
}

struct PendingWriter {
    residual: Vec<u8>,
    written: usize,
    tx: oneshot::Sender<Result<usize, PipeError>>,
}

struct PipeState {
    chunks: VecDeque<Vec<u8>>,
    buffered: usize,
    capacity: usize,
    readers: usize,
    writers: usize,
    write_closed: bool,
    read_closed: bool,
    pending_reader: Option<PendingReader>,
    pending_writer: Option<PendingWriter>,
}

impl PipeState {
    /// Pop up to `max` bytes off the front of the queue.
    fn drain(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            let want = max - out.len();
            if chunk.len() > want {
                let rest = chunk.split_off(want);
                self.chunks.push_front(rest);
            }
            out.extend_from_slice(&chunk);
        }
        self.buffered -= out.len();
        out
    }

    /// Enqueue as much of `data` as the capacity allows; returns the
    /// number of bytes accepted.
    fn enqueue(&mut self, data: &[u8]) -> usize {
        let free = self.capacity.saturating_sub(self.buffered);
        let n = data.len().min(free);
        if n > 0 {
            self.chunks.push_back(data[..n].to_vec());
            self.buffered += n;
        }
        n
    }

    /// Hand freshly-buffered data to a pending reader, if one is parked.
    fn wake_reader(&mut self) {
        if self.buffered == 0 {
            return;
        }
        if let Some(reader) = self.pending_reader.take() {
            if reader.tx.is_canceled() {
                // The read future was dropped; keep the data buffered.
                return;
            }
            let data = self.drain(reader.max);
            let _ = reader.tx.send(data);
        }
    }

    /// Move residual bytes of a pending writer into freed buffer space,
    /// resolving the writer once its residual is fully accepted.
    fn refill_from_writer(&mut self) {
        let Some(mut writer) = self.pending_writer.take() else {
            return;
        };
        let n = self.enqueue(&writer.residual);
        writer.residual.drain(..n);
        writer.written += n;
        if writer.residual.is_empty() {
            let _ = writer.tx.send(Ok(writer.written));
        } else {
            self.pending_writer = Some(writer);
        }
    }
}

type Shared = Arc<Mutex<PipeState>>;

/// Create a pipe with the given capacity. Returns the read and write
/// ends; clones of an end share its identity (closing happens when the
/// last clone is dropped).
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let shared: Shared = Arc::new(Mutex::new(PipeState {
        chunks: VecDeque::new(),
        buffered: 0,
        capacity: capacity.max(1),
        readers: 1,
        writers: 1,
        write_closed: false,
        read_closed: false,
        pending_reader: None,
        pending_writer: None,
    }));
    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

// ─── Read end ──────────────────────────────────────────────────

/// The read end of a pipe.
pub struct PipeReader {
    shared: Shared,
}

impl PipeReader {
    /// Read up to `max` bytes. Suspends while the pipe is empty and the
    /// write side is open. An empty result means EOF.
    pub async fn read(&self, max: usize) -> Vec<u8> {
        let rx = {
            let mut st = self.shared.lock();
            if st.buffered > 0 {
                let data = st.drain(max);
                st.refill_from_writer();
                return data;
            }
            if st.write_closed || st.read_closed {
                return Vec::new();
            }
            if let Some(stale) = &st.pending_reader {
                // A previously dropped read future may have left its slot
                // behind; anything else violates the single-reader contract.
                assert!(stale.tx.is_canceled(), "pipe already has a pending reader");
                st.pending_reader = None;
            }
            let (tx, rx) = oneshot::channel();
            st.pending_reader = Some(PendingReader { max, tx });
            rx
        };
        rx.await.unwrap_or_default()
    }

    /// Bytes currently buffered (test hook).
    pub fn buffered(&self) -> usize {
        self.shared.lock().buffered
    }
}

impl Clone for PipeReader {
    fn clone(&self) -> Self {
        self.shared.lock().readers += 1;
        PipeReader {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.readers -= 1;
        if st.readers == 0 {
            st.read_closed = true;
            st.chunks.clear();
            st.buffered = 0;
            if let Some(writer) = st.pending_writer.take() {
                let _ = writer.tx.send(Err(PipeError::Broken));
            }
            if let Some(reader) = st.pending_reader.take() {
                let _ = reader.tx.send(Vec::new());
            }
        }
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("buffered", &self.shared.lock().buffered)
            .finish()
    }
}

// ─── Write end ─────────────────────────────────────────────────

/// The write end of a pipe.
pub struct PipeWriter {
    shared: Shared,
}

impl PipeWriter {
    /// Synchronous short write: accepts what fits (possibly zero bytes)
    /// and never suspends. Returns the broken-pipe error once the read
    /// side is gone.
    pub fn try_write(&self, data: &[u8]) -> Result<usize, PipeError> {
        let mut st = self.shared.lock();
        if st.read_closed {
            return Err(PipeError::Broken);
        }
        let n = st.enqueue(data);
        st.wake_reader();
        Ok(n)
    }

    /// Write all of `data`, suspending while the pipe is full. Resolves
    /// with the total byte count accepted, or EPIPE if the read side
    /// closes first.
    pub async fn write_all(&self, data: &[u8]) -> Result<usize, PipeError> {
        let rx = {
            let mut st = self.shared.lock();
            if st.read_closed {
                return Err(PipeError::Broken);
            }
            let n = st.enqueue(data);
            st.wake_reader();
            if n == data.len() {
                return Ok(n);
            }
            if let Some(stale) = &st.pending_writer {
                // A dropped write_all future may have left its slot
                // behind; anything else violates the single-writer
                // contract.
                assert!(stale.tx.is_canceled(), "pipe already has a pending writer");
                st.pending_writer = None;
            }
            let (tx, rx) = oneshot::channel();
            st.pending_writer = Some(PendingWriter {
                residual: data[n..].to_vec(),
                written: n,
                tx,
            });
            rx
        };
        rx.await.unwrap_or(Err(PipeError::Broken))
    }

    /// Whether the read side is still open (test hook).
    pub fn is_open(&self) -> bool {
        !self.shared.lock().read_closed
    }
}

impl Clone for PipeWriter {
    fn clone(&self) -> Self {
        self.shared.lock().writers += 1;
        PipeWriter {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.writers -= 1;
        if st.writers == 0 {
            st.write_closed = true;
            if let Some(reader) = st.pending_reader.take() {
                let _ = reader.tx.send(Vec::new());
            }
        }
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("open", &!self.shared.lock().read_closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_preserves_order() {
        let (r, w) = pipe(1024);
        w.try_write(b"hello ").unwrap();
        w.try_write(b"world").unwrap();
        assert_eq!(r.read(64).await, b"hello world");
    }

    #[tokio::test]
    async fn test_read_suspends_until_write() {
        let (r, w) = pipe(1024);
        let reader = tokio::spawn(async move { r.read(16).await });
        tokio::task::yield_now().await;
        w.try_write(b"late").unwrap();
        assert_eq!(reader.await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_eof_after_writer_dropped() {
        let (r, w) = pipe(1024);
        w.try_write(b"tail").unwrap();
        drop(w);
        assert_eq!(r.read(64).await, b"tail");
        assert_eq!(r.read(64).await, b"");
        assert_eq!(r.read(64).await, b"");
    }

    #[tokio::test]
    async fn test_pending_reader_woken_by_close() {
        let (r, w) = pipe(1024);
        let reader = tokio::spawn(async move { r.read(16).await });
        tokio::task::yield_now().await;
        drop(w);
        assert_eq!(reader.await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_capacity_boundary() {
        let (r, w) = pipe(8);
        // Exactly `capacity` succeeds synchronously.
        assert_eq!(w.try_write(&[1u8; 8]).unwrap(), 8);
        assert_eq!(r.read(64).await, vec![1u8; 8]);
        // `capacity + 1` is short by one for the sync write.
        assert_eq!(w.try_write(&[2u8; 9]).unwrap(), 8);
    }

    #[tokio::test]
    async fn test_write_all_backpressure() {
        let (r, w) = pipe(4);
        let writer = tokio::spawn(async move { w.write_all(b"123456789").await });
        tokio::task::yield_now().await;

        let mut out = Vec::new();
        while out.len() < 9 {
            out.extend(r.read(3).await);
        }
        assert_eq!(out, b"123456789");
        assert_eq!(writer.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn test_epipe_on_sync_write_after_reader_gone() {
        let (r, w) = pipe(16);
        drop(r);
        assert_eq!(w.try_write(b"x"), Err(PipeError::Broken));
        assert_eq!(w.write_all(b"x").await, Err(PipeError::Broken));
    }

    #[tokio::test]
    async fn test_pending_writer_resolved_with_epipe() {
        let (r, w) = pipe(2);
        let writer = tokio::spawn(async move { w.write_all(b"abcdef").await });
        tokio::task::yield_now().await;
        drop(r);
        assert_eq!(writer.await.unwrap(), Err(PipeError::Broken));
    }

    #[tokio::test]
    async fn test_accepted_bytes_survive_reader_close() {
        // Bytes accepted before the consumer closed stay accepted; only
        // subsequent writes observe EPIPE.
        let (r, w) = pipe(16);
        assert_eq!(w.try_write(b"kept").unwrap(), 4);
        drop(r);
        assert_eq!(w.try_write(b"more"), Err(PipeError::Broken));
    }

    #[tokio::test]
    async fn test_clone_shares_end_and_close_needs_all_clones() {
        let (r, w) = pipe(16);
        let w2 = w.clone();
        drop(w);
        let reader = tokio::spawn(async move { r.read(8).await });
        tokio::task::yield_now().await;
        // Still one writer alive: no EOF yet.
        w2.try_write(b"hi").unwrap();
        assert_eq!(reader.await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_every_byte_delivered_exactly_once() {
        let (r, w) = pipe(7);
        let writer = tokio::spawn(async move {
            for i in 0..50u8 {
                w.write_all(&[i; 5]).await.unwrap();
            }
        });
        let mut out = Vec::new();
        while out.len() < 250 {
            let chunk = r.read(11).await;
            assert!(!chunk.is_empty());
            out.extend(chunk);
        }
        writer.await.unwrap();
        for i in 0..50u8 {
            assert_eq!(&out[i as usize * 5..(i as usize + 1) * 5], &[i; 5]);
        }
    }
}
