//! CPU utilization sampling.
use plainos_kernel::{CpuRate, KernelCfg};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{boot_with, STACK_SIZE};

#[test]
fn idle_and_busy_windows() {
    let sys = boot_with(KernelCfg {
        cpu_rate_interval_ticks: 10,
        ..KernelCfg::DEFAULT
    });

    sys.interrupt(|k| assert_eq!(k.cpu_rate().unwrap(), CpuRate::default()))
        .unwrap();

    sys.ticks(10).unwrap();
    let rate = sys.interrupt(|k| k.cpu_rate().unwrap()).unwrap();
    assert_eq!(rate, CpuRate { base: 10, useful: 0 });

    let stop = Arc::new(AtomicBool::new(false));
    sys.interrupt(|k| {
        let stop = stop.clone();
        k.create_task("spinner", 10, STACK_SIZE, move || {
            while !stop.load(Ordering::Relaxed) {
                k.systicks().unwrap();
            }
            0
        })
        .unwrap();
    })
    .unwrap();
    for _ in 0..10 {
        sys.tick().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    sys.settle().unwrap();

    let rate = sys.interrupt(|k| k.cpu_rate().unwrap()).unwrap();
    assert_eq!(rate, CpuRate { base: 10, useful: 10 });
    assert_eq!(rate.permille(), 1000);
}
