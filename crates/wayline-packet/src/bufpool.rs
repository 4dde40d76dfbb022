use bytes::BytesMut;
use std::sync::Mutex;

/// A small sharded free-list of reusable buffers.
///
/// Spec §5 asks for pools that are "lock-free or sharded as the pool
/// implementation dictates" so a burst of concurrent sessions doesn't
/// serialize on one global pool. Sharding by the caller-supplied key
/// (typically a cheap hash of the session's task id or socket fd) spreads
/// contention across `shard_count` independent free-lists, each no more
/// than a few buffers deep in steady state.
pub struct BufferPool {
    shards: Vec<Mutex<Vec<BytesMut>>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Vec::new())).collect(),
            capacity,
        }
    }

    fn shard_for(&self, key: u64) -> &Mutex<Vec<BytesMut>> {
        let idx = (key as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Acquires a zeroed buffer of at least `self.capacity` bytes, reusing
    /// one from the shard selected by `key` when available.
    pub fn acquire(&self, key: u64) -> PooledBuf<'_> {
        let mut buf = {
            let mut shard = self.shard_for(key).lock().unwrap();
            shard.pop().unwrap_or_default()
        };
        buf.clear();
        buf.resize(self.capacity, 0);
        PooledBuf {
            pool: self,
            key,
            buf: Some(buf),
        }
    }
}

/// A checked-out buffer that returns itself to its shard on drop.
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    key: u64,
    buf: Option<BytesMut>,
}

impl std::ops::Deref for PooledBuf<'_> {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut shard = self.pool.shard_for(self.key).lock().unwrap();
            // Cap how many idle buffers a shard hoards; anything beyond
            // this is simply dropped rather than retained forever.
            if shard.len() < 16 {
                shard.push(buf);
            }
        }
    }
}
