use armory::arch::{Architecture, Register};
use armory::emulator::MemoryRegion;
use armory::Emulator;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn make_emulator() -> Emulator {
    // NOP; NOP; ADDS R0, R0, #1; SUBS R0, R0, #1; BX LR, looped by the
    // bench harness rather than by branch instructions in the image.
    let code = [0x00, 0xbf, 0x00, 0xbf, 0x01, 0x30, 0x01, 0x38, 0x70, 0x47];
    let mut flash = MemoryRegion::flash(0x0800_0000, 0x1000);
    flash.load(0x0800_0000, &code).unwrap();
    let ram = MemoryRegion::ram(0x2000_0000, 0x1000);
    let mut emulator = Emulator::new(Architecture::ARMv7M, flash, ram);
    emulator.cpu.registers.set_pc_raw(0x0800_0000);
    emulator.cpu.registers.write(Register::SP, 0x2000_1000);
    emulator.cpu.registers.write(Register::LR, 0x0800_0008);
    emulator
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Emulator");

    group.bench_function("single_step", |b| {
        b.iter_batched(make_emulator, |mut emulator| black_box(emulator.step()), criterion::BatchSize::SmallInput);
    });

    group.bench_function("run_to_end_address", |b| {
        b.iter_batched(make_emulator, |mut emulator| black_box(emulator.emulate(0x0800_0008)), criterion::BatchSize::SmallInput);
    });

    group.bench_function("fork", |b| {
        let emulator = make_emulator();
        b.iter(|| black_box(emulator.fork()));
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
