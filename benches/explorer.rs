use armory::arch::Architecture;
use armory::emulator::MemoryRegion;
use armory::explorer::{Context, FaultSimulator, ModelMultiplicity};
use armory::fault::{skip_instruction_model, FaultModel};
use armory::Emulator;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn make_emulator() -> Emulator {
    // NOP; NOP; NOP; NOP; BX LR -- four faultable sites, one halting point.
    let code = [0x00, 0xbf, 0x00, 0xbf, 0x00, 0xbf, 0x00, 0xbf, 0x70, 0x47];
    let mut flash = MemoryRegion::flash(0x0800_0000, 0x1000);
    flash.load(0x0800_0000, &code).unwrap();
    let ram = MemoryRegion::ram(0x2000_0000, 0x1000);
    let mut emulator = Emulator::new(Architecture::ARMv7M, flash, ram);
    emulator.cpu.registers.set_pc_raw(0x0800_0000);
    emulator.cpu.registers.write(armory::arch::Register::SP, 0x2000_1000);
    emulator.cpu.registers.write(armory::arch::Register::LR, 0xFFFF_FFFE);
    emulator
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("FaultSimulator");
    group.sample_size(10);

    group.bench_function("single_skip_model_single_thread", |b| {
        b.iter_batched(
            make_emulator,
            |emulator| {
                let ctx = Context::new(vec![0xFFFF_FFFE], 20);
                let mut simulator = FaultSimulator::new(ctx).unwrap();
                simulator.set_number_of_threads(1);
                let models = vec![ModelMultiplicity { model: FaultModel::Instruction(skip_instruction_model()), multiplicity: 1 }];
                black_box(simulator.simulate_faults(&emulator, models, 1))
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.bench_function("single_skip_model_eight_threads", |b| {
        b.iter_batched(
            make_emulator,
            |emulator| {
                let ctx = Context::new(vec![0xFFFF_FFFE], 20);
                let mut simulator = FaultSimulator::new(ctx).unwrap();
                simulator.set_number_of_threads(8);
                let models = vec![ModelMultiplicity { model: FaultModel::Instruction(skip_instruction_model()), multiplicity: 1 }];
                black_box(simulator.simulate_faults(&emulator, models, 1))
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
