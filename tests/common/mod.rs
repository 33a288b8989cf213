//! Shared harness: boot a kernel on a `SimMachine` with a generated init
//! image and drive it by delivering traps.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use ferrite_os::hardware::{SimMachine, Trap, PAGE_SIZE, VMEM_1_BASE};
use ferrite_os::kernel::{Kernel, KernelConfig, Pid};
use ferrite_os::loader::build_image;

static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

/// Byte used to fill the init image's text pages.
pub const TEXT_FILL: u8 = 0x90;
/// Entry point baked into the init image.
pub const INIT_ENTRY: u64 = VMEM_1_BASE + 0x10;

pub struct TestBed {
    pub kernel: Kernel<SimMachine>,
    pub dir: PathBuf,
}

/// A fresh work directory per test invocation.
pub fn scratch_dir() -> PathBuf {
    let n = NEXT_DIR.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "ferrite_test_{}_{}",
        std::process::id(),
        n
    ));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// The pattern written into the init image's initialized data.
pub fn data_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Write the standard init image: 2 text pages, 2 data pages, 1 bss page.
pub fn write_init_image(dir: &PathBuf) -> PathBuf {
    let path = dir.join("init");
    let text = vec![TEXT_FILL; 2 * PAGE_SIZE];
    let data = data_pattern(2 * PAGE_SIZE);
    build_image(
        &path,
        INIT_ENTRY,
        VMEM_1_BASE,
        &text,
        VMEM_1_BASE + 2 * PAGE_SIZE as u64,
        &data,
        1,
    )
    .expect("write init image");
    path
}

/// Boot with the default machine size (512 frames, 4 terminals).
pub fn boot(cow: bool) -> TestBed {
    boot_with(cow, 512)
}

pub fn boot_with(cow: bool, pages: u32) -> TestBed {
    let dir = scratch_dir();
    let init = write_init_image(&dir);
    let machine = SimMachine::new(pages, 4);
    let config = KernelConfig {
        time_slice: 1,
        cow,
        swap_dir: dir.join("_SWAP"),
    };
    let init_str = init.to_string_lossy().into_owned();
    let kernel = Kernel::boot(machine, config, &[init_str.as_str()]).expect("boot");
    TestBed { kernel, dir }
}

impl TestBed {
    /// Issue a system call as the current process. The scheduler may have
    /// switched by the time this returns.
    pub fn syscall(&mut self, code: u64, args: &[u64]) {
        self.kernel.set_syscall_args(args);
        self.kernel.on_trap(Trap::Kernel { code });
    }

    /// The live return register of the current process.
    pub fn ret(&self) -> i64 {
        self.kernel.user_context().regs[0] as i64
    }

    /// Tick the clock until `pid` is current.
    pub fn run_until_current(&mut self, pid: Pid) {
        for _ in 0..10_000 {
            if self.kernel.current_pid() == pid {
                return;
            }
            assert!(!self.kernel.is_halted(), "machine halted waiting for {:?}", pid);
            self.kernel.on_trap(Trap::Clock);
        }
        panic!("{:?} was never scheduled", pid);
    }

    /// Base address of a process's data segment plus `offset`; scratch
    /// space tests use for user buffers and out-pointers.
    pub fn data_addr(&self, pid: Pid, offset: u64) -> u64 {
        let (_, _, data_start, _, _, _) = self.kernel.task_layout(pid).expect("live task");
        VMEM_1_BASE + (data_start * PAGE_SIZE) as u64 + offset
    }

    pub fn brk_of(&self, pid: Pid) -> u64 {
        self.kernel.task_layout(pid).expect("live task").3
    }

    pub fn peek_u64(&self, pid: Pid, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.kernel.peek_user(pid, addr, &mut buf).expect("peek");
        u64::from_le_bytes(buf)
    }

    pub fn peek_byte(&self, pid: Pid, addr: u64) -> u8 {
        let mut b = [0u8; 1];
        self.kernel.peek_user(pid, addr, &mut b).expect("peek");
        b[0]
    }

    pub fn assert_invariants(&self) {
        if let Err(e) = self.kernel.check_invariants() {
            panic!("kernel invariant violated: {}", e);
        }
    }
}
