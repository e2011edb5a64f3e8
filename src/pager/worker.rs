//! # Flush Worker
//!
//! One background thread owned by the page manager. Evicted pages are
//! handed over through a bounded channel; the worker writes the dirty
//! ones and drops its references, at which point the buffers are freed.
//! The worker never takes the environment mutex and performs all of its
//! I/O outside any lock, so a cache purge never stalls the foreground.
//!
//! If the queue is full the caller flushes inline instead of blocking,
//! keeping the foreground latency bounded.
//!
//! Shutdown drains the queue: `Shutdown` is the last message, the worker
//! flushes everything still queued, then exits and is joined.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{trace, warn};

use crate::config::WORKER_QUEUE_DEPTH;
use crate::device::Device;
use crate::page::{flush_page, Page};

enum Message {
    Flush(Vec<Arc<Page>>),
    Shutdown,
}

pub struct Worker {
    sender: SyncSender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(device: Arc<dyn Device>, with_crc: bool) -> Self {
        let (sender, receiver) = sync_channel(WORKER_QUEUE_DEPTH);
        let handle = std::thread::Builder::new()
            .name("stratadb-flush".into())
            .spawn(move || run(receiver, device, with_crc))
            .expect("failed to spawn flush worker");

        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Hands a batch of evicted pages to the worker. Returns the batch
    /// back if the queue is full so the caller can flush inline.
    pub fn submit(&self, pages: Vec<Arc<Page>>) -> Result<(), Vec<Arc<Page>>> {
        match self.sender.try_send(Message::Flush(pages)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(Message::Flush(pages)))
            | Err(TrySendError::Disconnected(Message::Flush(pages))) => Err(pages),
            Err(_) => Err(Vec::new()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(receiver: Receiver<Message>, device: Arc<dyn Device>, with_crc: bool) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Flush(pages) => {
                for page in pages {
                    if !page.is_dirty() {
                        continue;
                    }
                    trace!(address = page.address(), "worker flushing evicted page");
                    if let Err(err) = flush_page(device.as_ref(), &page, with_crc) {
                        // the page stays dirty and pinned by this Arc until
                        // the process exits; the environment turns read-only
                        // through the foreground path on its next flush
                        warn!(address = page.address(), ?err, "background flush failed");
                    }
                }
            }
            Message::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::page::PageType;

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn worker_flushes_submitted_pages() {
        let device: Arc<dyn Device> = Arc::new(MemoryDevice::new(PAGE_SIZE));
        let addr = device.alloc_pages(1).unwrap();

        let page = Arc::new(Page::new_allocated(addr, PageType::Blob, PAGE_SIZE, false));
        page.data_mut()[64] = 0x5A;
        page.set_dirty();

        let worker = Worker::spawn(Arc::clone(&device), false);
        worker.submit(vec![Arc::clone(&page)]).unwrap();
        drop(worker); // joins after draining

        assert!(!page.is_dirty());
        let mut buf = vec![0u8; PAGE_SIZE];
        device.read(addr, &mut buf).unwrap();
        assert_eq!(buf[64], 0x5A);
    }

    #[test]
    fn full_queue_returns_batch_to_caller() {
        let device: Arc<dyn Device> = Arc::new(MemoryDevice::new(PAGE_SIZE));
        let worker = Worker::spawn(Arc::clone(&device), false);

        // the worker drains fast, so only probe the API contract: a
        // returned batch must be the one we submitted
        let page = Arc::new(Page::new_allocated(0, PageType::Blob, PAGE_SIZE, false));
        let mut queued = 0;
        for _ in 0..1000 {
            match worker.submit(vec![Arc::clone(&page)]) {
                Ok(()) => queued += 1,
                Err(back) => {
                    assert_eq!(back.len(), 1);
                    break;
                }
            }
        }
        assert!(queued > 0);
    }
}
