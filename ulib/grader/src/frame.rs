//! Physical frames.
//!
//! Every frame carries the number of page table entries that point at it.
//! A frame goes back to the pool when that number drops to zero.

use abyss::{KernelError, PAGE_SIZE, Pa};

struct Frame {
    refcnt: usize,
    data: Box<[u8; PAGE_SIZE]>,
}

/// The pool of physical frames available to user environments.
pub(crate) struct FrameTable {
    slots: Vec<Option<Frame>>,
    free: Vec<usize>,
    limit: usize,
    in_use: usize,
}

impl FrameTable {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            limit,
            in_use: 0,
        }
    }

    // Frame 0 is never handed out, so a zero entry can never look mapped.
    fn pa_of(idx: usize) -> Option<Pa> {
        Pa::new((idx + 1) * PAGE_SIZE)
    }

    fn index(pa: Pa) -> Option<usize> {
        (pa.into_usize() / PAGE_SIZE).checked_sub(1)
    }

    fn frame(&self, pa: Pa) -> Option<&Frame> {
        self.slots.get(Self::index(pa)?)?.as_ref()
    }

    fn frame_mut(&mut self, pa: Pa) -> Option<&mut Frame> {
        self.slots.get_mut(Self::index(pa)?)?.as_mut()
    }

    /// Take a zeroed frame from the pool. Its reference count is zero until
    /// it is mapped.
    pub(crate) fn alloc(&mut self) -> Result<Pa, KernelError> {
        if self.in_use >= self.limit {
            return Err(KernelError::NoMemory);
        }
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let pa = Self::pa_of(idx).ok_or(KernelError::NoMemory)?;
        self.slots[idx] = Some(Frame {
            refcnt: 0,
            data: Box::new([0; PAGE_SIZE]),
        });
        self.in_use += 1;
        Ok(pa)
    }

    pub(crate) fn incref(&mut self, pa: Pa) {
        if let Some(frame) = self.frame_mut(pa) {
            frame.refcnt += 1;
        }
    }

    /// Drop one reference to `pa`, freeing the frame on the last one.
    pub(crate) fn decref(&mut self, pa: Pa) {
        let Some(idx) = Self::index(pa) else {
            return;
        };
        let Some(Some(frame)) = self.slots.get_mut(idx) else {
            return;
        };
        frame.refcnt = frame.refcnt.saturating_sub(1);
        if frame.refcnt == 0 {
            self.slots[idx] = None;
            self.free.push(idx);
            self.in_use -= 1;
        }
    }

    pub(crate) fn refcount(&self, pa: Pa) -> usize {
        self.frame(pa).map_or(0, |f| f.refcnt)
    }

    pub(crate) fn bytes(&self, pa: Pa) -> Option<&[u8; PAGE_SIZE]> {
        self.frame(pa).map(|f| &*f.data)
    }

    pub(crate) fn bytes_mut(&mut self, pa: Pa) -> Option<&mut [u8; PAGE_SIZE]> {
        self.frame_mut(pa).map(|f| &mut *f.data)
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }
}
