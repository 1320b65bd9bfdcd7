//! The I/O ring: a dedicated kernel-facing thread that serves page reads
//! and writes for the chunk files. Callers submit a request over a
//! channel and suspend on a completion token; inside the worker runtime
//! the wait yields the worker thread instead of blocking it.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use tokio::sync::oneshot;

use crate::db::DbError;

enum Request {
    Read {
        file: usize,
        offset: u64,
        len: usize,
        reply: oneshot::Sender<std::io::Result<Vec<u8>>>,
    },
    Write {
        file: usize,
        offset: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<std::io::Result<()>>,
    },
    Sync {
        reply: oneshot::Sender<std::io::Result<()>>,
    },
    Shutdown,
}

pub(crate) struct IoRing {
    tx: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for IoRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRing").finish()
    }
}

impl IoRing {
    pub(crate) fn new(files: Vec<File>, sq_thread_cpu: Option<u32>) -> Self {
        let (tx, rx) = unbounded::<Request>();
        if let Some(cpu) = sq_thread_cpu {
            tracing::info!(cpu, "i/o ring polling thread requested on dedicated cpu");
        }
        let thread = std::thread::Builder::new()
            .name("monad-io".into())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    match request {
                        Request::Read {
                            file,
                            offset,
                            len,
                            reply,
                        } => {
                            let mut buf = vec![0u8; len];
                            let result = files[file].read_exact_at(&mut buf, offset).map(|()| buf);
                            let _ = reply.send(result);
                        }
                        Request::Write {
                            file,
                            offset,
                            data,
                            reply,
                        } => {
                            let _ = reply.send(write_retrying(&files[file], &data, offset));
                        }
                        Request::Sync { reply } => {
                            let mut result = Ok(());
                            for file in &files {
                                if let Err(err) = file.sync_data() {
                                    result = Err(err);
                                    break;
                                }
                            }
                            let _ = reply.send(result);
                        }
                        Request::Shutdown => break,
                    }
                }
            })
            .expect("spawning the i/o ring thread");
        Self {
            tx,
            thread: Some(thread),
        }
    }

    pub(crate) fn read(&self, file: usize, offset: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Read {
                file,
                offset,
                len,
                reply,
            })
            .map_err(|_| DbError::RingClosed)?;
        ring_wait(rx)?.map_err(DbError::Io)
    }

    pub(crate) fn write(&self, file: usize, offset: u64, data: Vec<u8>) -> Result<(), DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Write {
                file,
                offset,
                data,
                reply,
            })
            .map_err(|_| DbError::RingClosed)?;
        ring_wait(rx)?.map_err(DbError::Io)
    }

    pub(crate) fn sync(&self) -> Result<(), DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Sync { reply })
            .map_err(|_| DbError::RingClosed)?;
        ring_wait(rx)?.map_err(DbError::Io)
    }
}

impl Drop for IoRing {
    fn drop(&mut self) {
        let _ = self.tx.send(Request::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Transient write errors are retried; anything else is an unrecoverable
/// device error.
fn write_retrying(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    loop {
        match file.write_all_at(data, offset) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Wait for a completion. On a multi-thread runtime the wait releases the
/// worker so other tasks keep running; elsewhere it blocks the caller.
fn ring_wait<T>(rx: oneshot::Receiver<T>) -> Result<T, DbError> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| rx.blocking_recv()).map_err(|_| DbError::RingClosed)
        }
        _ => rx.blocking_recv().map_err(|_| DbError::RingClosed),
    }
}
