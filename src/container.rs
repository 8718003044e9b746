//! Public container handle and the request dispatcher behind it.
//!
//! Each container runs one worker thread consuming a FIFO mailbox, so all
//! operations against one AVS/index pair are strictly serialized. Callers
//! block on a reply channel with a 30-second deadline; compaction replies
//! have no deadline.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};

use crate::codec::Visitor;
use crate::compaction::{self, Ownership};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::object::{Metadata, Object};
use crate::stats::StorageStats;
use crate::worker::Worker;

enum Request {
    Put {
        obj: Object,
        reply: Sender<Result<Metadata>>,
    },
    Get {
        addr_id: u64,
        key: Vec<u8>,
        start: i64,
        end: i64,
        reply: Sender<Result<(Metadata, Vec<u8>)>>,
    },
    Delete {
        obj: Object,
        reply: Sender<Result<Metadata>>,
    },
    Head {
        addr_id: u64,
        key: Vec<u8>,
        reply: Sender<Result<Metadata>>,
    },
    Fetch {
        addr_id: u64,
        key_prefix: Vec<u8>,
        visitor: Box<dyn Visitor>,
        reply: Sender<Result<Vec<Metadata>>>,
    },
    Store {
        meta: Metadata,
        body: Vec<u8>,
        reply: Sender<Result<Metadata>>,
    },
    Stats {
        reply: Sender<Result<StorageStats>>,
    },
    Compact {
        ownership: Box<dyn Ownership>,
        reply: Sender<Result<()>>,
    },
    Stop {
        reply: Sender<Result<()>>,
    },
}

/// Handle to one container worker. Cloning is deliberately not offered:
/// the routing layer owns exactly one handle per container.
pub struct Container {
    tx: Sender<Request>,
    thread: Option<JoinHandle<()>>,
    timeout: Duration,
    id: String,
}

impl Container {
    /// Spawns the worker thread and waits for it to reach Ready. An init
    /// failure refuses the start and surfaces the cause.
    pub fn start(config: Config) -> Result<Self> {
        let id = config.id.clone();
        let timeout = config.request_timeout;
        let (tx, rx) = unbounded::<Request>();
        let (init_tx, init_rx) = bounded::<Result<()>>(1);

        let thread = std::thread::Builder::new()
            .name(format!("avstore-{id}"))
            .spawn(move || {
                let mut worker = match Worker::init(config) {
                    Ok(worker) => {
                        let _ = init_tx.send(Ok(()));
                        worker
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                let mut stopped = false;
                for request in rx {
                    if dispatch(&mut worker, request) == Flow::Stop {
                        stopped = true;
                        break;
                    }
                }
                // The handle was dropped without an explicit stop; shut
                // down the same way.
                if !stopped {
                    worker.terminate();
                }
            })
            .map_err(|e| Error::Io(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                tx,
                thread: Some(thread),
                timeout,
                id,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Stopped)
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn call<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| Error::Stopped)?;
        match reply_rx.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Stopped),
        }
    }

    pub fn put(&self, obj: Object) -> Result<Metadata> {
        self.call(|reply| Request::Put { obj, reply })
    }

    /// Reads a byte range of the object's body; `start == 0` with a
    /// negative `end` reads the whole body.
    pub fn get(&self, addr_id: u64, key: &[u8], start: i64, end: i64) -> Result<(Metadata, Vec<u8>)> {
        let key = key.to_vec();
        self.call(|reply| Request::Get {
            addr_id,
            key,
            start,
            end,
            reply,
        })
    }

    pub fn delete(&self, obj: Object) -> Result<Metadata> {
        self.call(|reply| Request::Delete { obj, reply })
    }

    pub fn head(&self, addr_id: u64, key: &[u8]) -> Result<Metadata> {
        let key = key.to_vec();
        self.call(|reply| Request::Head {
            addr_id,
            key,
            reply,
        })
    }

    pub fn fetch(
        &self,
        addr_id: u64,
        key_prefix: &[u8],
        visitor: impl Visitor + 'static,
    ) -> Result<Vec<Metadata>> {
        let key_prefix = key_prefix.to_vec();
        self.call(|reply| Request::Fetch {
            addr_id,
            key_prefix,
            visitor: Box::new(visitor),
            reply,
        })
    }

    pub fn store(&self, meta: Metadata, body: Vec<u8>) -> Result<Metadata> {
        self.call(|reply| Request::Store { meta, body, reply })
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.call(|reply| Request::Stats { reply })
    }

    /// Runs an online compaction. Unlike every other operation this call
    /// has no reply deadline: it blocks until the compaction commits or
    /// rolls back.
    pub fn compact(&self, ownership: impl Ownership + 'static) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Request::Compact {
                ownership: Box::new(ownership),
                reply: reply_tx,
            })
            .map_err(|_| Error::Stopped)?;
        reply_rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Stops the worker, persisting stats and the index snapshot.
    pub fn stop(mut self) -> Result<()> {
        let reply = self.call(|reply| Request::Stop { reply });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        reply
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            // Closing the mailbox lets the worker drain and terminate.
            let (reply_tx, _reply_rx) = bounded(1);
            let _ = self.tx.send(Request::Stop { reply: reply_tx });
            let _ = thread.join();
        }
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

fn dispatch(worker: &mut Worker, request: Request) -> Flow {
    match request {
        Request::Put { obj, reply } => {
            let _ = reply.send(worker.put(&obj));
        }
        Request::Get {
            addr_id,
            key,
            start,
            end,
            reply,
        } => {
            let _ = reply.send(worker.get(addr_id, &key, start, end));
        }
        Request::Delete { obj, reply } => {
            let _ = reply.send(worker.delete(&obj));
        }
        Request::Head {
            addr_id,
            key,
            reply,
        } => {
            let _ = reply.send(worker.head(addr_id, &key));
        }
        Request::Fetch {
            addr_id,
            key_prefix,
            mut visitor,
            reply,
        } => {
            let _ = reply.send(worker.fetch(addr_id, &key_prefix, visitor.as_mut()));
        }
        Request::Store { meta, body, reply } => {
            let _ = reply.send(worker.store(&meta, &body));
        }
        Request::Stats { reply } => {
            let _ = reply.send(Ok(worker.stats()));
        }
        Request::Compact { ownership, reply } => {
            let _ = reply.send(compaction::compact(worker, ownership.as_ref()));
        }
        Request::Stop { reply } => {
            worker.terminate();
            let _ = reply.send(Ok(()));
            return Flow::Stop;
        }
    }
    Flow::Continue
}
