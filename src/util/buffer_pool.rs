use bytes::BytesMut;
use std::fmt::{Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Size classes of pooled buffers, smallest first.
pub const DEFAULT_SIZE_CLASSES: [usize; 4] = [1024, 16 * 1024, 64 * 1024, 256 * 1024];

struct SizeClass {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

/// A pool of reusable byte buffers, organized in size classes. A lease is served from the smallest
///  class that fits the requested size; requests beyond the largest class get an unpooled buffer.
///
/// Leases return their buffer on drop, so there is no explicit 'release' call to forget.
pub struct BufferPool {
    classes: Vec<SizeClass>,
    max_buffers_per_class: usize,
}

impl BufferPool {
    pub fn new(size_classes: &[usize], max_buffers_per_class: usize) -> Arc<BufferPool> {
        let mut sizes = size_classes.to_vec();
        sizes.sort_unstable();
        sizes.dedup();

        Arc::new(BufferPool {
            classes: sizes.into_iter()
                .map(|buf_size| SizeClass {
                    buf_size,
                    buffers: Mutex::new(Vec::with_capacity(max_buffers_per_class)),
                })
                .collect(),
            max_buffers_per_class,
        })
    }

    pub fn with_defaults(max_buffers_per_class: usize) -> Arc<BufferPool> {
        Self::new(&DEFAULT_SIZE_CLASSES, max_buffers_per_class)
    }

    /// Returns an empty buffer with at least `size` bytes of capacity.
    pub fn lease(self: &Arc<Self>, size: usize) -> BufferLease {
        let Some(class_idx) = self.classes.iter().position(|c| c.buf_size >= size) else {
            debug!("requested buffer size {} exceeds the largest size class: allocating unpooled buffer", size);
            return BufferLease {
                buf: BytesMut::with_capacity(size),
                origin: None,
            };
        };

        let class = &self.classes[class_idx];
        let pooled = class.buffers.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buf = match pooled {
            Some(buf) => {
                trace!("returning buffer of size {} from pool", class.buf_size);
                buf
            }
            None => {
                debug!("no buffer of size {} in pool: creating new buffer", class.buf_size);
                BytesMut::with_capacity(class.buf_size)
            }
        };

        BufferLease {
            buf,
            origin: Some((self.clone(), class_idx)),
        }
    }

    fn return_to_pool(&self, class_idx: usize, mut buffer: BytesMut) {
        let class = &self.classes[class_idx];
        if buffer.capacity() < class.buf_size {
            // the lease was split or frozen, so the allocation can not be reused as a whole
            debug!("returned buffer lost part of its capacity: discarding it");
            return;
        }

        buffer.clear();

        let mut buffers = class.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_buffers_per_class {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.classes.iter()
            .map(|c| c.buffers.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }
}

/// A buffer leased from a [BufferPool]. Dereferences to the underlying [BytesMut], and goes back
///  to its pool when dropped.
pub struct BufferLease {
    buf: BytesMut,
    origin: Option<(Arc<BufferPool>, usize)>,
}

impl BufferLease {
    /// A lease that is not backed by any pool
    pub fn unpooled(buf: BytesMut) -> BufferLease {
        BufferLease {
            buf,
            origin: None,
        }
    }
}

impl Debug for BufferLease {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("len", &self.len())
            .field("pooled", &self.origin.is_some())
            .finish()
    }
}

impl Deref for BufferLease {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some((pool, class_idx)) = self.origin.take() {
            pool.return_to_pool(class_idx, std::mem::take(&mut self.buf));
        }
    }
}
