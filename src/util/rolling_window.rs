
/// Keeps the most recent `capacity` values in insertion order, evicting the oldest value once the
///  window is full.
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    capacity: usize,
    buf: BufferImpl<T>,
}
impl<T> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "a rolling window must hold at least one value");
        RollingWindow {
            capacity,
            buf: BufferImpl::Growing(Vec::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        match &self.buf {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    pub fn add(&mut self, value: T) -> Option<T> {
        match &mut self.buf {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == self.capacity {
                    let buf = std::mem::take(buf);
                    self.buf = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = std::mem::replace(&mut buf[*next], value);
                *next = (*next + 1) % self.capacity;
                Some(evicted)
            }
        }
    }

    /// iterates oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let (older, newer) = match &self.buf {
            BufferImpl::Growing(buf) => (&buf[..], &buf[..0]),
            BufferImpl::Ring { buf, next } => (&buf[*next..], &buf[..*next]),
        };
        older.iter().chain(newer.iter())
    }

    pub fn last(&self) -> Option<&T> {
        match &self.buf {
            BufferImpl::Growing(buf) => buf.last(),
            BufferImpl::Ring { buf, next } => {
                let idx = if *next == 0 { self.capacity - 1 } else { *next - 1 };
                buf.get(idx)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum BufferImpl<T> {
    Growing(Vec<T>),
    Ring {
        buf: Vec<T>,
        next: usize,
    },
}
