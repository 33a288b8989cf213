//! Synchronization and IPC utilities.
//!
//! Pipes, locks and condition variables are all reference-counted
//! "utility" objects owned by processes through integer handle slots.
//! Fork copies the handle table and bumps every refcount; `reclaim` puts a
//! reference and a utility dies when its last reference does.

pub mod cvar;
pub mod lock;
pub mod pipe;

pub use cvar::Cvar;
pub use lock::Lock;
pub use pipe::Pipe;

use crate::hardware::Machine;
use crate::kernel::{Kernel, Pid};
use crate::{KernelError, Result};

/// Arena key of a utility object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UtilityId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilityType {
    Pipe,
    Lock,
    Cvar,
}

pub enum UtilityKind {
    Pipe(Pipe),
    Lock(Lock),
    Cvar(Cvar),
}

/// A refcounted kernel object reachable through per-process handles.
pub struct Utility {
    /// The creator's handle slot, kept for diagnostics.
    pub id: u32,
    pub refcount: u32,
    pub kind: UtilityKind,
}

impl Utility {
    pub fn utype(&self) -> UtilityType {
        match self.kind {
            UtilityKind::Pipe(_) => UtilityType::Pipe,
            UtilityKind::Lock(_) => UtilityType::Lock,
            UtilityKind::Cvar(_) => UtilityType::Cvar,
        }
    }

    /// Everyone blocked on any of this utility's queues.
    pub fn wait_queues(&self) -> Vec<Pid> {
        match &self.kind {
            UtilityKind::Pipe(p) => p
                .read_queue
                .iter()
                .chain(p.write_queue.iter())
                .copied()
                .collect(),
            UtilityKind::Lock(l) => l.wait_queue.iter().copied().collect(),
            UtilityKind::Cvar(c) => c.wait_queue.iter().copied().collect(),
        }
    }

    /// Drop a task from any queue it occupies here.
    pub fn remove_waiter(&mut self, pid: Pid) {
        match &mut self.kind {
            UtilityKind::Pipe(p) => {
                p.read_queue.retain(|&q| q != pid);
                p.write_queue.retain(|&q| q != pid);
            }
            UtilityKind::Lock(l) => l.wait_queue.retain(|&q| q != pid),
            UtilityKind::Cvar(c) => c.wait_queue.retain(|&q| q != pid),
        }
    }
}

impl<M: Machine> Kernel<M> {
    /// Create a utility with one reference, recording the creator's slot.
    pub(crate) fn utility_alloc(&mut self, slot: usize, kind: UtilityKind) -> UtilityId {
        let id = UtilityId(self.next_utility);
        self.next_utility += 1;
        self.utilities.insert(
            id,
            Utility {
                id: slot as u32,
                refcount: 1,
                kind,
            },
        );
        id
    }

    /// Take another reference.
    pub(crate) fn utility_get(&mut self, id: UtilityId) {
        if let Some(u) = self.utilities.get_mut(&id) {
            u.refcount += 1;
        }
    }

    /// Drop a reference; the last one frees the object. Freeing a held
    /// lock is refused and the reference restored.
    pub(crate) fn utility_put(&mut self, id: UtilityId) -> Result<()> {
        let u = self.utilities.get_mut(&id).ok_or(KernelError::NoSuchHandle)?;
        u.refcount -= 1;
        if u.refcount > 0 {
            return Ok(());
        }
        if let UtilityKind::Lock(l) = &u.kind {
            if l.is_locked() {
                log::error!("refusing to free a held lock");
                u.refcount += 1;
                return Err(KernelError::NotHeld);
            }
        }
        // Anyone still queued here resumes, finds the object gone, and
        // fails with ERROR instead of sleeping forever.
        let stranded = u.wait_queues();
        self.utilities.remove(&id);
        for pid in stranded {
            self.task_wake_up(pid);
        }
        Ok(())
    }

    /// Resolve a handle slot of the current process, checking the type.
    pub(crate) fn current_utility(&self, slot: usize, utype: UtilityType) -> Result<UtilityId> {
        let id = self
            .task(self.current)
            .get_utility(slot)
            .ok_or(KernelError::NoSuchHandle)?;
        let u = self.utilities.get(&id).ok_or(KernelError::NoSuchHandle)?;
        if u.utype() != utype {
            log::error!("handle {} is not a {:?}", slot, utype);
            return Err(KernelError::WrongHandleType);
        }
        Ok(id)
    }

    pub(crate) fn pipe_mut(&mut self, id: UtilityId) -> &mut Pipe {
        match &mut self.utilities.get_mut(&id).expect("live utility").kind {
            UtilityKind::Pipe(p) => p,
            _ => unreachable!("handle checked as pipe"),
        }
    }

    pub(crate) fn lock_mut(&mut self, id: UtilityId) -> &mut Lock {
        match &mut self.utilities.get_mut(&id).expect("live utility").kind {
            UtilityKind::Lock(l) => l,
            _ => unreachable!("handle checked as lock"),
        }
    }

    pub(crate) fn cvar_mut(&mut self, id: UtilityId) -> &mut Cvar {
        match &mut self.utilities.get_mut(&id).expect("live utility").kind {
            UtilityKind::Cvar(c) => c,
            _ => unreachable!("handle checked as cvar"),
        }
    }
}
