//! Terminal I/O: single ownership per direction, chunked transmits,
//! interrupt-driven reads.

mod common;

use common::boot;
use ferrite_os::hardware::{Trap, TERMINAL_MAX_LINE};
use ferrite_os::kernel::Pid;
use ferrite_os::scheduler::task::TaskState;
use ferrite_os::syscalls::*;

#[test]
fn tty_write_transmits_and_completes() {
    let mut bed = boot(false);

    let buf = bed.data_addr(Pid::INIT, 256);
    bed.kernel.poke_user(Pid::INIT, buf, &vec![b'x'; 100]).unwrap();
    bed.syscall(SYS_TTY_WRITE, &[0, buf, 100]);

    // The transmit is in flight and the writer is parked.
    assert_eq!(bed.kernel.task_state(Pid::INIT), Some(TaskState::Pending));
    assert_eq!(bed.kernel.machine().tty_output(0), &vec![b'x'; 100][..]);

    bed.kernel.machine_mut().complete_transmit(0);
    bed.kernel.on_trap(Trap::TtyTransmit { tty: 0 });
    bed.run_until_current(Pid::INIT);
    assert_eq!(bed.ret(), 100);
    bed.assert_invariants();
}

#[test]
fn long_tty_writes_are_chunked() {
    let mut bed = boot(false);
    let total = TERMINAL_MAX_LINE + 476;

    let buf = bed.data_addr(Pid::INIT, 0);
    let payload: Vec<u8> = (0..total).map(|i| (i % 17) as u8 + b'a').collect();
    bed.kernel.poke_user(Pid::INIT, buf, &payload).unwrap();
    bed.syscall(SYS_TTY_WRITE, &[0, buf, total as u64]);

    // First chunk only.
    assert_eq!(bed.kernel.machine().tty_output(0).len(), TERMINAL_MAX_LINE);

    bed.kernel.machine_mut().complete_transmit(0);
    bed.kernel.on_trap(Trap::TtyTransmit { tty: 0 });
    bed.run_until_current(Pid::INIT);
    // Still pending: the second chunk went out when the writer resumed.
    assert_eq!(bed.kernel.task_state(Pid::INIT), Some(TaskState::Pending));
    assert_eq!(bed.kernel.machine().tty_output(0).len(), total);

    bed.kernel.machine_mut().complete_transmit(0);
    bed.kernel.on_trap(Trap::TtyTransmit { tty: 0 });
    bed.run_until_current(Pid::INIT);
    assert_eq!(bed.ret(), total as i64);
    assert_eq!(bed.kernel.machine().tty_output(0), &payload[..]);
    bed.assert_invariants();
}

#[test]
fn tty_read_delivers_typed_input() {
    let mut bed = boot(false);

    let buf = bed.data_addr(Pid::INIT, 256);
    bed.syscall(SYS_TTY_READ, &[1, buf, 64]);
    assert_eq!(bed.kernel.task_state(Pid::INIT), Some(TaskState::Pending));

    bed.kernel.machine_mut().push_tty_input(1, b"hello\n");
    bed.kernel.on_trap(Trap::TtyReceive { tty: 1 });

    bed.run_until_current(Pid::INIT);
    assert_eq!(bed.ret(), 6);
    let mut got = [0u8; 6];
    bed.kernel.peek_user(Pid::INIT, buf, &mut got).unwrap();
    assert_eq!(&got, b"hello\n");
    bed.assert_invariants();
}

#[test]
fn second_reader_queues_behind_the_first() {
    let mut bed = boot(false);

    bed.syscall(SYS_FORK, &[]);
    let child = bed.kernel.current_pid();

    // Child claims the terminal first.
    let cbuf = bed.data_addr(child, 256);
    bed.syscall(SYS_TTY_READ, &[0, cbuf, 16]);
    assert_eq!(bed.kernel.task_state(child), Some(TaskState::Pending));

    // Parent queues behind it.
    bed.run_until_current(Pid::INIT);
    let pbuf = bed.data_addr(Pid::INIT, 256);
    bed.syscall(SYS_TTY_READ, &[0, pbuf, 16]);
    assert_eq!(bed.kernel.task_state(Pid::INIT), Some(TaskState::Pending));
    bed.assert_invariants();

    // First line goes to the child.
    bed.kernel.machine_mut().push_tty_input(0, b"one\n");
    bed.kernel.on_trap(Trap::TtyReceive { tty: 0 });
    bed.run_until_current(child);
    assert_eq!(bed.ret(), 4);
    let mut got = [0u8; 4];
    bed.kernel.peek_user(child, cbuf, &mut got).unwrap();
    assert_eq!(&got, b"one\n");

    // The parent has taken over as reader; the second line is its.
    bed.kernel.machine_mut().push_tty_input(0, b"two\n");
    bed.kernel.on_trap(Trap::TtyReceive { tty: 0 });
    bed.run_until_current(Pid::INIT);
    assert_eq!(bed.ret(), 4);
    bed.kernel.peek_user(Pid::INIT, pbuf, &mut got).unwrap();
    assert_eq!(&got, b"two\n");
    bed.assert_invariants();
}

#[test]
fn writers_serialize_per_terminal() {
    let mut bed = boot(false);

    bed.syscall(SYS_FORK, &[]);
    let child = bed.kernel.current_pid();

    let cbuf = bed.data_addr(child, 256);
    bed.kernel.poke_user(child, cbuf, b"AAAA").unwrap();
    bed.syscall(SYS_TTY_WRITE, &[0, cbuf, 4]);
    assert_eq!(bed.kernel.task_state(child), Some(TaskState::Pending));

    bed.run_until_current(Pid::INIT);
    let pbuf = bed.data_addr(Pid::INIT, 256);
    bed.kernel.poke_user(Pid::INIT, pbuf, b"BBBB").unwrap();
    bed.syscall(SYS_TTY_WRITE, &[0, pbuf, 4]);
    bed.assert_invariants();

    // Child's transmit completes; the parent then gets the terminal.
    bed.kernel.machine_mut().complete_transmit(0);
    bed.kernel.on_trap(Trap::TtyTransmit { tty: 0 });
    bed.run_until_current(child);
    assert_eq!(bed.ret(), 4);

    bed.run_until_current(Pid::INIT);
    bed.kernel.machine_mut().complete_transmit(0);
    bed.kernel.on_trap(Trap::TtyTransmit { tty: 0 });
    bed.run_until_current(Pid::INIT);
    assert_eq!(bed.ret(), 4);
    assert_eq!(bed.kernel.machine().tty_output(0), b"AAAABBBB");
    bed.assert_invariants();
}

#[test]
fn bad_tty_arguments_fail() {
    let mut bed = boot(false);
    let buf = bed.data_addr(Pid::INIT, 256);

    bed.syscall(SYS_TTY_WRITE, &[99, buf, 4]);
    assert_eq!(bed.ret(), ERROR);
    bed.syscall(SYS_TTY_WRITE, &[0, buf, 0]);
    assert_eq!(bed.ret(), ERROR);
    bed.syscall(SYS_TTY_READ, &[0, buf, 0]);
    assert_eq!(bed.ret(), ERROR);

    // Oversized reads are clamped to one line.
    bed.syscall(SYS_TTY_READ, &[0, buf, 4096]);
    bed.kernel
        .machine_mut()
        .push_tty_input(0, &vec![b'z'; 2048]);
    bed.kernel.on_trap(Trap::TtyReceive { tty: 0 });
    bed.run_until_current(Pid::INIT);
    assert_eq!(bed.ret(), TERMINAL_MAX_LINE as i64);
}
