//! Pipes: a fixed-size ring buffer with FIFO queues of blocked readers
//! and writers.

use std::collections::VecDeque;

use crate::hardware::Machine;
use crate::ipc::UtilityId;
use crate::kernel::{Kernel, PendingOp, Pid, WaitChannel};
use crate::memory::vm;
use crate::scheduler::task::TaskState;
use crate::syscalls::ERROR;

/// Ring capacity in bytes.
pub const PIPE_LEN: usize = 1024;

pub struct Pipe {
    buf: Vec<u8>,
    read_p: usize,
    write_p: usize,
    bytes: usize,
    pub read_queue: VecDeque<Pid>,
    pub write_queue: VecDeque<Pid>,
}

impl Pipe {
    pub fn new() -> Self {
        Pipe {
            buf: vec![0u8; PIPE_LEN],
            read_p: 0,
            write_p: 0,
            bytes: 0,
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn space(&self) -> usize {
        PIPE_LEN - self.bytes
    }

    /// Drain up to `out.len()` buffered bytes, wrapping around the ring.
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.bytes.min(out.len());
        let first = n.min(PIPE_LEN - self.read_p);
        out[..first].copy_from_slice(&self.buf[self.read_p..self.read_p + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.read_p = (self.read_p + n) % PIPE_LEN;
        self.bytes -= n;
        n
    }

    /// Buffer up to `space()` bytes of `data`, wrapping around the ring.
    /// A single push never exceeds the free window.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = self.space().min(data.len());
        let first = n.min(PIPE_LEN - self.write_p);
        self.buf[self.write_p..self.write_p + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.write_p = (self.write_p + n) % PIPE_LEN;
        self.bytes += n;
        n
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Pipe::new()
    }
}

impl<M: Machine> Kernel<M> {
    pub(crate) fn pipe_wake_up_readers(&mut self, id: UtilityId) {
        while let Some(pid) = self.pipe_mut(id).read_queue.pop_front() {
            self.task_wake_up(pid);
        }
    }

    pub(crate) fn pipe_wake_up_writers(&mut self, id: UtilityId) {
        while let Some(pid) = self.pipe_mut(id).write_queue.pop_front() {
            self.task_wake_up(pid);
        }
    }

    /// Read from a pipe: block while it is empty, then hand over whatever
    /// is buffered, up to `len` bytes, and let writers retry.
    pub(crate) fn pipe_do_read(&mut self, id: UtilityId, buf: u64, len: usize) {
        let cur = self.current;
        if self.pipe_mut(id).bytes() == 0 {
            let t = self.task_mut(cur);
            t.state = TaskState::Pending;
            t.pending = Some(PendingOp::PipeRead { id, buf, len });
            t.blocked_on = Some(WaitChannel::PipeRead(id));
            self.pipe_mut(id).read_queue.push_back(cur);
            self.schedule();
            return;
        }

        let mut data = vec![0u8; len];
        let n = self.pipe_mut(id).pop(&mut data);
        let write_ok = {
            let table = self.tasks[&cur].page_table.as_ref().expect("reader has a table");
            vm::write_bytes(&mut self.machine, table, buf, &data[..n]).is_ok()
        };
        if !write_ok {
            log::error!("pipe read: user buffer fault");
            self.set_ret(ERROR);
            return;
        }
        if self.pipe_mut(id).space() > 0 {
            self.pipe_wake_up_writers(id);
        }
        self.set_ret(n as i64);
    }

    /// Write to a pipe. Deposits as much as fits, wakes readers, and
    /// blocks until every requested byte is buffered; `written` carries
    /// the progress across suspensions.
    pub(crate) fn pipe_do_write(&mut self, id: UtilityId, buf: u64, len: usize, mut written: usize) {
        let cur = self.current;
        while written < len {
            let space = self.pipe_mut(id).space();
            if space == 0 {
                let t = self.task_mut(cur);
                t.state = TaskState::Pending;
                t.pending = Some(PendingOp::PipeWrite { id, buf, len, written });
                t.blocked_on = Some(WaitChannel::PipeWrite(id));
                self.pipe_mut(id).write_queue.push_back(cur);
                self.schedule();
                return;
            }

            let chunk = space.min(len - written);
            let mut data = vec![0u8; chunk];
            let read_ok = {
                let table = self.tasks[&cur].page_table.as_ref().expect("writer has a table");
                vm::read_bytes(&self.machine, table, buf + written as u64, &mut data).is_ok()
            };
            if !read_ok {
                log::error!("pipe write: user buffer fault");
                self.set_ret(ERROR);
                return;
            }
            let pushed = self.pipe_mut(id).push(&data);
            written += pushed;
            if self.pipe_mut(id).bytes() > 0 {
                self.pipe_wake_up_readers(id);
            }
        }
        self.set_ret(len as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_then_drain() {
        let mut p = Pipe::new();
        let data = vec![7u8; PIPE_LEN];
        assert_eq!(p.push(&data), PIPE_LEN);
        assert_eq!(p.space(), 0);
        assert_eq!(p.push(&[1]), 0);

        let mut out = vec![0u8; PIPE_LEN];
        assert_eq!(p.pop(&mut out), PIPE_LEN);
        assert_eq!(out, data);
        assert_eq!(p.bytes(), 0);
    }

    #[test]
    fn wrap_around_preserves_order() {
        let mut p = Pipe::new();
        let a = vec![b'a'; PIPE_LEN];
        assert_eq!(p.push(&a), PIPE_LEN);
        let mut out = vec![0u8; 512];
        assert_eq!(p.pop(&mut out), 512);

        // 512 free bytes, straddling the ring boundary once filled.
        let b = vec![b'b'; 512];
        assert_eq!(p.push(&b), 512);
        assert_eq!(p.bytes(), PIPE_LEN);

        let mut rest = vec![0u8; PIPE_LEN];
        assert_eq!(p.pop(&mut rest), PIPE_LEN);
        assert!(rest[..512].iter().all(|&c| c == b'a'));
        assert!(rest[512..].iter().all(|&c| c == b'b'));
        assert_eq!(p.bytes(), 0);
    }

    #[test]
    fn push_never_exceeds_free_window() {
        let mut p = Pipe::new();
        p.push(&vec![1u8; 1000]);
        let mut out = [0u8; 100];
        p.pop(&mut out);
        // 124 free: a 500-byte push must stop there.
        assert_eq!(p.push(&vec![2u8; 500]), 124);
        assert_eq!(p.bytes(), PIPE_LEN);
    }

    #[test]
    fn partial_reads_advance() {
        let mut p = Pipe::new();
        p.push(b"hello world");
        let mut out = [0u8; 5];
        assert_eq!(p.pop(&mut out), 5);
        assert_eq!(&out, b"hello");
        let mut rest = [0u8; 16];
        assert_eq!(p.pop(&mut rest), 6);
        assert_eq!(&rest[..6], b" world");
    }
}
