//! A single background thread which writes images to the [DiskStore] in submission order.
//!
//! The queue is bounded.  Submitting never blocks: when the queue is full the write is dropped, which only costs a
//! future disk hit.
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::*;

enum Job {
    Write {
        key: String,
        image: Arc<DecodedImage>,
    },
    /// Acknowledged once every job ahead of it is done.
    Barrier(mpsc::Sender<()>),
}

pub struct WriteBackQueue {
    sender: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl WriteBackQueue {
    pub fn start(disk: Arc<DiskStore>, capacity: usize) -> std::io::Result<WriteBackQueue> {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let worker = thread::Builder::new()
            .name("image-cache-writer".to_string())
            .spawn(move || run(disk, receiver))?;

        Ok(WriteBackQueue {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue a write.  Returns false if it was dropped because the queue is full.
    pub fn submit(&self, key: &str, image: Arc<DecodedImage>) -> bool {
        let sender = match &self.sender {
            Some(s) => s,
            None => return false,
        };

        let job = Job::Write {
            key: key.to_string(),
            image,
        };
        match sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(key, "write-back queue is full, dropping disk write");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(key, "write-back worker is gone, dropping disk write");
                false
            }
        }
    }

    /// Block until every write submitted before this call has finished.
    pub fn flush(&self) {
        let sender = match &self.sender {
            Some(s) => s,
            None => return,
        };

        let (ack, done) = mpsc::channel();
        if sender.send(Job::Barrier(ack)).is_err() {
            return;
        }
        // An error here means the worker died, and there is nothing left to wait for.
        let _ = done.recv();
    }
}

fn run(disk: Arc<DiskStore>, receiver: Receiver<Job>) {
    for job in receiver {
        match job {
            Job::Write { key, image } => {
                if let Err(e) = disk.write_sync(&key, &image) {
                    warn!(key = %key, error = %e, "unable to write image to disk cache");
                }
            }
            Job::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("write-back worker stopped");
}

impl Drop for WriteBackQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what's queued and exit.
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            if let Err(e) = handle.join() {
                warn!("write-back worker panicked: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(fill: u8) -> Arc<DecodedImage> {
        Arc::new(DecodedImage::new(2, 1, vec![fill; 8]).unwrap())
    }

    #[test]
    fn test_flush_waits_for_writes() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskStore::new(dir.path()).unwrap());
        let queue = WriteBackQueue::start(disk.clone(), 16).unwrap();

        for i in 0..10u8 {
            assert!(queue.submit(&i.to_string(), image(i)));
        }
        queue.flush();

        for i in 0..10u8 {
            assert_eq!(disk.read(&i.to_string()).unwrap().pixels(), &[i; 8][..]);
        }
    }

    #[test]
    fn test_same_key_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskStore::new(dir.path()).unwrap());
        let queue = WriteBackQueue::start(disk.clone(), 16).unwrap();

        queue.submit("k", image(1));
        queue.submit("k", image(2));
        queue.submit("k", image(3));
        queue.flush();

        assert_eq!(disk.read("k").unwrap().pixels(), &[3; 8][..]);
    }

    #[test]
    fn test_drop_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskStore::new(dir.path()).unwrap());
        {
            let queue = WriteBackQueue::start(disk.clone(), 16).unwrap();
            queue.submit("a", image(7));
        }
        assert!(disk.read("a").is_some());
    }
}
