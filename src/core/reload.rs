//! Deferred reload requests
//!
//! Any thread may request a kernel or shader reload. The render thread drains
//! the requests once per frame, after compute and graphics are idle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// What to reload at the next safe point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReloadRequest: u32 {
        const KERNELS = 1 << 0;
        const SHADERS = 1 << 1;
    }
}

/// Shared request flags. Clones refer to the same flags.
#[derive(Debug, Clone, Default)]
pub struct ReloadFlags {
    pending: Arc<AtomicU32>,
}

impl ReloadFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, request: ReloadRequest) {
        self.pending.fetch_or(request.bits(), Ordering::AcqRel);
    }

    pub fn request_kernels(&self) {
        self.request(ReloadRequest::KERNELS);
    }

    pub fn request_shaders(&self) {
        self.request(ReloadRequest::SHADERS);
    }

    /// Pending requests, without consuming them.
    #[must_use]
    pub fn pending(&self) -> ReloadRequest {
        ReloadRequest::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }

    /// Consume every pending request.
    pub fn take(&self) -> ReloadRequest {
        ReloadRequest::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_consumes_once() {
        let flags = ReloadFlags::new();
        flags.request_kernels();
        flags.request_kernels();
        flags.request_shaders();

        assert_eq!(flags.pending(), ReloadRequest::all());
        assert_eq!(flags.take(), ReloadRequest::KERNELS | ReloadRequest::SHADERS);
        assert!(flags.take().is_empty());
    }

    #[test]
    fn test_requests_from_other_threads() {
        let flags = ReloadFlags::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let flags = flags.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        flags.request_kernels();
                    } else {
                        flags.request_shaders();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(flags.take(), ReloadRequest::all());
    }
}
