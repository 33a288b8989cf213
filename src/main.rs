//! Demo driver: boot the kernel on a simulated machine with a generated
//! `init` image and let the clock run for a while.

use std::path::PathBuf;

use ferrite_os::hardware::{Machine, SimMachine, Trap, VMEM_1_BASE, PAGE_SIZE};
use ferrite_os::kernel::{Kernel, KernelConfig, Pid};
use ferrite_os::loader::build_image;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let workdir = std::env::temp_dir().join("ferrite_demo");
    std::fs::create_dir_all(&workdir).expect("create demo directory");

    // With no argv, generate a placeholder init image to boot from.
    let init_path: PathBuf = if let Some(first) = args.first() {
        PathBuf::from(first)
    } else {
        let path = workdir.join("init");
        build_image(
            &path,
            VMEM_1_BASE,
            VMEM_1_BASE,
            &[0x90; 64],
            VMEM_1_BASE + 4 * PAGE_SIZE as u64,
            b"ferrite demo data",
            1,
        )
        .expect("write init image");
        path
    };

    let machine = SimMachine::new(512, 4);
    let config = KernelConfig {
        swap_dir: workdir.join("_SWAP"),
        ..KernelConfig::default()
    };
    let init = init_path.to_string_lossy().into_owned();
    let mut kernel =
        Kernel::boot(machine, config, &[init.as_str()]).expect("kernel boot");

    println!(
        "booted: init pid {:?}, {} free frames",
        kernel.current_pid(),
        kernel.free_frames()
    );

    for _ in 0..20 {
        if kernel.is_halted() {
            break;
        }
        kernel.on_trap(Trap::Clock);
        if kernel.current_pid() == Pid::IDLE {
            kernel.machine_mut().pause();
        }
    }

    println!(
        "after 20 ticks: jiffies={} current={:?}",
        kernel.jiffies(),
        kernel.current_pid()
    );
    if let Err(e) = kernel.check_invariants() {
        println!("invariant violation: {}", e);
    } else {
        println!("all kernel invariants hold");
    }
}
