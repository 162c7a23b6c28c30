//! Property tests over the public compile-and-run surface.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use proptest::prelude::*;

use qasm::compiler::compile;
use qasm::cpu::{Cpu, CpuConfig, CpuState};
use qasm::limits::CpuLimits;

/// Compiles and runs a program, feeding `input` lines and collecting output.
fn run(source: &str, input: &str, limits: CpuLimits) -> (Cpu, Vec<String>) {
    let mut pending: VecDeque<String> = input.lines().map(str::to_string).collect();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let mut cpu = Cpu::new(CpuConfig {
        limits,
        input: Some(Box::new(move || pending.pop_front())),
        output: Some(Box::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
            true
        })),
    })
    .expect("limits rejected");
    cpu.load_program(Some(Arc::new(compile(source).expect("compilation failed"))));
    cpu.run().expect("run failed");
    assert_eq!(cpu.state(), CpuState::Finished);
    let lines = collected.lock().unwrap().clone();
    (cpu, lines)
}

proptest! {
    /// Pushing v1..vn and popping n times yields vn..v1.
    #[test]
    fn stack_pops_reverse_pushes(values in prop::collection::vec(any::<u32>(), 1..40)) {
        let mut source = String::new();
        for v in &values {
            source.push_str(&format!("set A {v}\npush SA A\n"));
        }
        for _ in &values {
            source.push_str("pop B SA\nwrite B\nwriteln\n");
        }
        let (_, lines) = run(&source, "", CpuLimits::default());
        let popped: Vec<u32> = lines.iter().map(|l| l.parse().unwrap()).collect();
        let mut expected = values.clone();
        expected.reverse();
        prop_assert_eq!(popped, expected);
    }

    /// Enqueuing v1..vn and dequeuing n times yields v1..vn.
    #[test]
    fn queue_dequeues_preserve_order(values in prop::collection::vec(any::<u32>(), 1..40)) {
        let mut source = String::new();
        for v in &values {
            source.push_str(&format!("set A {v}\nenqueue QA A\n"));
        }
        for _ in &values {
            source.push_str("dequeue B QA\nwrite B\nwriteln\n");
        }
        let (_, lines) = run(&source, "", CpuLimits::default());
        let dequeued: Vec<u32> = lines.iter().map(|l| l.parse().unwrap()).collect();
        prop_assert_eq!(dequeued, values);
    }

    /// N lefts then N rights return the head to the same cell and position.
    #[test]
    fn tape_head_round_trips(n in 0usize..40, value in any::<u32>()) {
        let mut source = format!("set A {value}\nstore TA A\n");
        for _ in 0..n {
            source.push_str("left TA\n");
        }
        for _ in 0..n {
            source.push_str("right TA\n");
        }
        source.push_str("load B TA\nstat TA\n");
        let (cpu, _) = run(&source, "", CpuLimits::default());
        prop_assert_eq!(cpu.explicit_registers()[1], value);
        // The stat position lands back at zero.
        prop_assert_eq!(cpu.implicit_registers()[(b'p' - b'a') as usize], 0);
    }

    /// A stored memory cell reads back unchanged.
    #[test]
    fn memory_reads_back_stores(address in 0u32..64, value in any::<u32>()) {
        let mut limits = CpuLimits::default();
        limits.memory_capacity[0] = 64;
        let source = format!("set A {value}\nstore MA@{address} A\nload B MA@{address}\n");
        let (cpu, _) = run(&source, "", limits);
        prop_assert_eq!(cpu.explicit_registers()[1], value);
        prop_assert_eq!(cpu.memory(0)[address as usize], value);
    }

    /// Echoing input through the buffer swap reproduces it exactly.
    #[test]
    fn echo_preserves_lines(lines in prop::collection::vec("[a-z0-9 ]{0,20}", 0..10)) {
        let source = "label Start\n\
             readln\n\
             inv z\n\
             condjmp End\n\
             rwswap\n\
             writeln\n\
             jump Start\n\
             label End";
        let input = lines.join("\n");
        let (_, output) = run(source, &input, CpuLimits::default());
        let expected: Vec<String> = input.lines().map(str::to_string).collect();
        prop_assert_eq!(output, expected);
    }
}
