mod cpu;
mod exec;
mod fault;
mod isa;
mod output;

use std::fs::File;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use env_logger::Env;
use log::{debug, info, trace, warn};
use memmap2::Mmap;

use crate::cpu::Cpu;
use crate::output::OutputPort;

/// Target clock rate for the paced run loop.
const CLOCK_SPEED_HZ: u32 = 1_000_000;
/// Skip pacing entirely and tick as fast as the host allows.
const FULL_SPEED: bool = false;
/// Cycle at which the driver asserts the hardware interrupt line once.
const INTERRUPT_AT_CYCLE: u64 = 10_000;

/// A small built-in image used when no binary is given on the command line:
/// prints "HI" on the output channel and halts.
const DEMO_PROGRAM: [[u32; 4]; 9] = [
    [0x19, 6, 0x3000, 0], // MOV  BP, 0x3000
    [0x19, 5, 0, 0],      // MOV  SP, 0
    [0x19, 0, 0x48, 0],   // MOV  RA, 'H'
    [0x20, 0, 0, 0],      // OUT  RA, channel 0
    [0x19, 0, 0x49, 0],   // MOV  RA, 'I'
    [0x20, 0, 0, 0],      // OUT  RA, channel 0
    [0x19, 0, 0x0a, 0],   // MOV  RA, '\n'
    [0x20, 0, 0, 0],      // OUT  RA, channel 0
    [0x23, 0, 0, 0],      // HALT
];

fn demo_image() -> Vec<u8> {
    let mut image = Vec::with_capacity(DEMO_PROGRAM.len() * 16);
    for record in &DEMO_PROGRAM {
        for word in record {
            image.extend_from_slice(&word.to_le_bytes());
        }
    }
    image
}

fn main() -> Result<()> {
    // Initialize logger from environment variables
    // Example: RUST_LOG=debug ./cpuemu program.bin
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("starting cpuemu");

    trace!("spawning output drain");
    let port = OutputPort::spawn(|bytes| {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(&bytes);
        let _ = stdout.flush();
    });

    let mut cpu = Cpu::with_output(port.buffer());

    match std::env::args().nth(1) {
        Some(path) => {
            info!("loading binary image from {path}");
            let file = File::open(&path).with_context(|| format!("opening image {path}"))?;
            let map = unsafe { Mmap::map(&file) }.with_context(|| format!("mapping image {path}"))?;
            cpu.load_image(&map);
        }
        None => {
            info!("no image given, running the built-in demo program");
            cpu.load_image(&demo_image());
        }
    }

    // Pacing scheme: run DIVIDER2 ticks per batch, then hold until the batch
    // period (DIVIDER1 cycles worth of clock) has elapsed. Below 10 kHz the
    // dividers collapse and every tick is paced individually.
    let (divider1, divider2) = if CLOCK_SPEED_HZ < 10_000 { (1u32, 1u32) } else { (100, 110) };
    let batch_period =
        Duration::from_nanos((1e9 / (CLOCK_SPEED_HZ as f64 / divider1 as f64)) as u64);
    debug!("batch of {divider2} ticks every {batch_period:?} (full speed: {FULL_SPEED})");

    info!("starting execution loop");
    let start = Instant::now();
    if FULL_SPEED {
        while !cpu.is_halted() {
            if cpu.cycle_count() == INTERRUPT_AT_CYCLE {
                debug!("asserting hardware interrupt at cycle {INTERRUPT_AT_CYCLE}");
                cpu.assert_interrupt();
            }
            cpu.tick();
        }
    } else {
        while !cpu.is_halted() {
            let batch_start = Instant::now();
            for _ in 0..divider2 {
                cpu.tick();
                if cpu.cycle_count() == INTERRUPT_AT_CYCLE {
                    debug!("asserting hardware interrupt at cycle {INTERRUPT_AT_CYCLE}");
                    cpu.assert_interrupt();
                }
            }
            while batch_start.elapsed() < batch_period {
                std::hint::spin_loop();
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    info!("execution time: {elapsed:.3}s");
    info!(
        "{} cycles, {:.3} MHz effective",
        cpu.cycle_count(),
        cpu.cycle_count() as f64 / elapsed / 1e6
    );
    if let Some(fault) = cpu.last_fault() {
        warn!("machine halted by fault: {fault}");
    }

    // Joins the drain thread so the last produced bytes reach the sink.
    drop(port);
    Ok(())
}
