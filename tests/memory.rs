//! Virtual-memory scenarios: copy-on-write promotion, stack growth and
//! the guard page, heap growth, swap, frame conservation.

mod common;

use common::{boot, boot_with};
use ferrite_os::hardware::{MemoryFaultKind, Trap, PAGE_SIZE, VMEM_1_BASE};
use ferrite_os::kernel::Pid;
use ferrite_os::syscalls::*;

fn missing_fault(addr: u64) -> Trap {
    Trap::Memory {
        kind: MemoryFaultKind::Missing,
        addr,
        write: false,
    }
}

fn write_fault(addr: u64) -> Trap {
    Trap::Memory {
        kind: MemoryFaultKind::Permission,
        addr,
        write: true,
    }
}

// S5: COW fork shares every frame; the first write costs exactly one.
#[test]
fn cow_write_fault_promotes_one_page() {
    let mut bed = boot(true);

    let brk = bed.brk_of(Pid::INIT);
    let target = brk - 1;
    bed.kernel.poke_user(Pid::INIT, target, &[b'B']).unwrap();

    let free_before_fork = bed.kernel.free_frames();
    bed.syscall(SYS_FORK, &[]);
    let child = bed.kernel.current_pid();
    assert_ne!(child, Pid::INIT);

    // Fork itself allocated nothing for region 1 — only the child's
    // two-page kernel stack was cloned when it was first dispatched.
    assert_eq!(free_before_fork - bed.kernel.free_frames(), 2);
    bed.assert_invariants();

    // Child writes through the read-only shared page: exactly one new
    // frame appears, holding the parent's private copy.
    let free_before_write = bed.kernel.free_frames();
    bed.kernel.on_trap(write_fault(target));
    assert_eq!(bed.kernel.current_pid(), child);
    assert_eq!(free_before_write - bed.kernel.free_frames(), 1);

    bed.kernel.poke_user(child, target, &[b'C']).unwrap();
    assert_eq!(bed.peek_byte(Pid::INIT, target), b'B');
    assert_eq!(bed.peek_byte(child, target), b'C');
    bed.assert_invariants();
}

#[test]
fn cow_frames_survive_until_the_last_peer_exits() {
    let mut bed = boot(true);

    let free_start = bed.kernel.free_frames();
    bed.syscall(SYS_FORK, &[]);
    let child = bed.kernel.current_pid();

    bed.syscall(SYS_EXIT, &[0]);
    bed.run_until_current(Pid::INIT);
    assert!(!bed.kernel.task_exists(child));

    // The child's kernel stack came back; every shared region-1 frame
    // stayed with the surviving parent.
    assert_eq!(bed.kernel.free_frames(), free_start);
    bed.assert_invariants();

    let status_ptr = bed.data_addr(Pid::INIT, 64);
    bed.syscall(SYS_WAIT, &[status_ptr]);
    assert_eq!(bed.ret(), child.0 as i64);
}

// S6: stack growth one page at a time, and death past the guard.
#[test]
fn stack_grows_on_faults_below_it() {
    let mut bed = boot(false);

    let (.., stack_start, stack_pgn) = bed.kernel.task_layout(Pid::INIT).unwrap();
    assert_eq!(stack_pgn, 1);

    // Touch one page below the stack: it grows by one page.
    let below = VMEM_1_BASE + ((stack_start - 1) * PAGE_SIZE) as u64 + 8;
    bed.kernel.on_trap(missing_fault(below));
    let (.., new_start, new_pgn) = bed.kernel.task_layout(Pid::INIT).unwrap();
    assert_eq!(new_start, stack_start - 1);
    assert_eq!(new_pgn, 2);

    // And once more, two pages below the original.
    let below2 = VMEM_1_BASE + ((stack_start - 2) * PAGE_SIZE) as u64;
    bed.kernel.on_trap(missing_fault(below2));
    let (.., final_start, final_pgn) = bed.kernel.task_layout(Pid::INIT).unwrap();
    assert_eq!(final_start, stack_start - 2);
    assert_eq!(final_pgn, 3);
    bed.assert_invariants();
}

#[test]
fn faulting_past_the_guard_kills_the_process() {
    let mut bed = boot(false);

    bed.syscall(SYS_FORK, &[]);
    let child = bed.kernel.current_pid();

    // An address in the unmapped gap right above the heap is nowhere near
    // stack_start - 1, so the child dies.
    let brk = bed.brk_of(child);
    bed.kernel.on_trap(missing_fault(brk + 8));
    assert!(!bed.kernel.task_exists(child));

    bed.run_until_current(Pid::INIT);
    let status_ptr = bed.data_addr(Pid::INIT, 64);
    bed.syscall(SYS_WAIT, &[status_ptr]);
    assert_eq!(bed.ret(), child.0 as i64);
    assert_eq!(bed.peek_u64(Pid::INIT, status_ptr), ERROR as u64);
    bed.assert_invariants();
}

#[test]
fn writing_text_kills_the_process() {
    let mut bed = boot(false);

    bed.syscall(SYS_FORK, &[]);
    let child = bed.kernel.current_pid();

    bed.kernel.on_trap(write_fault(VMEM_1_BASE + 4));
    assert!(!bed.kernel.task_exists(child));
    bed.assert_invariants();
}

#[test]
fn brk_grows_and_shrinks_the_heap() {
    let mut bed = boot(false);

    let brk = bed.brk_of(Pid::INIT);
    let free = bed.kernel.free_frames();

    bed.syscall(SYS_BRK, &[brk + 3 * PAGE_SIZE as u64]);
    assert_eq!(bed.ret(), 0);
    assert_eq!(bed.brk_of(Pid::INIT), brk + 3 * PAGE_SIZE as u64);
    assert_eq!(free - bed.kernel.free_frames(), 3);

    // New heap pages are writable.
    bed.kernel.poke_user(Pid::INIT, brk + 100, &[9]).unwrap();
    assert_eq!(bed.peek_byte(Pid::INIT, brk + 100), 9);

    bed.syscall(SYS_BRK, &[brk]);
    assert_eq!(bed.ret(), 0);
    assert_eq!(bed.kernel.free_frames(), free);
    bed.assert_invariants();
}

#[test]
fn brk_refuses_to_touch_the_stack() {
    let mut bed = boot(false);

    let (.., stack_start, _) = bed.kernel.task_layout(Pid::INIT).unwrap();
    let into_stack = VMEM_1_BASE + (stack_start * PAGE_SIZE) as u64;
    bed.syscall(SYS_BRK, &[into_stack]);
    assert_eq!(bed.ret(), ERROR);
    bed.assert_invariants();
}

#[test]
fn kernel_brk_maps_and_unmaps_region_zero() {
    let mut bed = boot(false);

    let brk = bed.kernel.kernel_brk();
    let free = bed.kernel.free_frames();

    bed.kernel.set_kernel_brk(brk + 2 * PAGE_SIZE as u64).unwrap();
    assert_eq!(bed.kernel.kernel_brk(), brk + 2 * PAGE_SIZE as u64);
    assert_eq!(free - bed.kernel.free_frames(), 2);

    bed.kernel.set_kernel_brk(brk).unwrap();
    assert_eq!(bed.kernel.free_frames(), free);
    bed.assert_invariants();
}

// Frame conservation under churn, COW disabled: exact accounting.
#[test]
fn frames_are_conserved_through_fork_and_exit() {
    let mut bed = boot(false);
    bed.assert_invariants();

    let free_start = bed.kernel.free_frames();
    let mut children = Vec::new();
    for _ in 0..3 {
        bed.syscall(SYS_FORK, &[]);
        let child = bed.kernel.current_pid();
        children.push(child);
        bed.assert_invariants();
        bed.syscall(SYS_DELAY, &[2]);
    }

    for _ in 0..4 {
        bed.kernel.on_trap(Trap::Clock);
        bed.assert_invariants();
    }

    for &c in &children {
        bed.run_until_current(c);
        bed.syscall(SYS_EXIT, &[0]);
        bed.assert_invariants();
    }
    bed.run_until_current(Pid::INIT);
    let status_ptr = bed.data_addr(Pid::INIT, 64);
    for _ in 0..3 {
        bed.syscall(SYS_WAIT, &[status_ptr]);
        assert!(bed.ret() > 1);
    }
    assert_eq!(bed.kernel.free_frames(), free_start);
    bed.assert_invariants();
}

// Swap a victim out under memory pressure, then fault it back in.
#[test]
fn swap_out_and_back_in_preserves_memory() {
    let mut bed = boot_with(false, 300);

    bed.syscall(SYS_FORK, &[]);
    let victim = bed.kernel.current_pid();
    assert_ne!(victim, Pid::INIT);

    // The victim grows a large heap, stamps it, and goes to sleep.
    let victim_brk = bed.brk_of(victim);
    bed.syscall(SYS_BRK, &[victim_brk + 160 * PAGE_SIZE as u64]);
    assert_eq!(bed.ret(), 0);
    let stamp_addr = victim_brk + 50 * PAGE_SIZE as u64 + 11;
    bed.kernel.poke_user(victim, stamp_addr, b"stamp").unwrap();
    bed.syscall(SYS_DELAY, &[50]);

    // Init's own allocation overruns the free list; the sleeping victim
    // is paged out to make room.
    bed.run_until_current(Pid::INIT);
    assert!(bed.kernel.free_frames() < 120);
    let init_brk = bed.brk_of(Pid::INIT);
    bed.syscall(SYS_BRK, &[init_brk + 120 * PAGE_SIZE as u64]);
    assert_eq!(bed.ret(), 0);

    let swap_file = bed.dir.join("_SWAP").join(victim.0.to_string());
    assert!(swap_file.exists(), "victim has a swap file");
    bed.assert_invariants();

    // Give the memory back, wake the victim, and let its first touch of
    // a swapped page bring the whole process back.
    bed.syscall(SYS_BRK, &[init_brk]);
    assert_eq!(bed.ret(), 0);

    bed.run_until_current(victim);
    assert_eq!(bed.ret(), 0, "delay completed");
    bed.kernel.on_trap(missing_fault(stamp_addr));
    assert!(bed.kernel.task_exists(victim), "victim survived swap-in");
    assert!(!swap_file.exists(), "swap file unlinked after swap-in");

    let mut stamp = [0u8; 5];
    bed.kernel.peek_user(victim, stamp_addr, &mut stamp).unwrap();
    assert_eq!(&stamp, b"stamp");
    bed.assert_invariants();
}
