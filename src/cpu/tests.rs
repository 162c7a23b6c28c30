use super::*;
use crate::compiler::compile;
use std::collections::VecDeque;
use std::sync::Mutex;

fn compiled(source: &str) -> Arc<Program> {
    Arc::new(compile(source).expect("compilation failed"))
}

fn cpu_with_limits(limits: CpuLimits) -> Cpu {
    Cpu::new(CpuConfig {
        limits,
        ..CpuConfig::default()
    })
    .expect("limits rejected")
}

fn run_cpu(source: &str) -> Cpu {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled(source)));
    cpu.run().expect("run failed");
    assert_eq!(cpu.state(), CpuState::Finished);
    cpu
}

fn run_expect_fault(source: &str) -> RuntimeError {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled(source)));
    let err = cpu.run().expect_err("expected fault");
    assert_eq!(cpu.state(), CpuState::Terminated);
    err
}

/// Collected output lines, shared with the output delegate.
type OutputLines = Arc<Mutex<Vec<String>>>;

fn io_config(input: &str) -> (CpuConfig, OutputLines) {
    let mut lines: VecDeque<String> = input.lines().map(str::to_string).collect();
    let output: OutputLines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&output);
    let config = CpuConfig {
        limits: CpuLimits::default(),
        input: Some(Box::new(move || lines.pop_front())),
        output: Some(Box::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
            true
        })),
    };
    (config, output)
}

fn run_with_io(source: &str, input: &str) -> (Cpu, Vec<String>) {
    let (config, output) = io_config(input);
    let mut cpu = Cpu::new(config).unwrap();
    cpu.load_program(Some(compiled(source)));
    cpu.run().expect("run failed");
    assert_eq!(cpu.state(), CpuState::Finished);
    let lines = output.lock().unwrap().clone();
    (cpu, lines)
}

fn reg(cpu: &Cpu, letter: char) -> u32 {
    cpu.explicit_registers()[(letter as u8 - b'A') as usize]
}

fn ireg(cpu: &Cpu, letter: char) -> i32 {
    reg(cpu, letter) as i32
}

fn freg(cpu: &Cpu, letter: char) -> f32 {
    f32::from_bits(reg(cpu, letter))
}

// ==================== Arithmetic ====================

#[test]
fn arithmetic_basics() {
    let cpu = run_cpu(
        "# unsigned integer instructions\n\
         set A 42\n\
         set B 13\n\
         add C A B\n\
         sub D A B\n\
         mul E A B\n\
         div F A B\n\
         \n\
         # floating point instructions\n\
         fset G 42.0\n\
         fset H 13.0\n\
         fadd I G H\n\
         fsub J G H\n\
         fmul K G H\n\
         fdiv L G H\n\
         \n\
         # signed integer instructions\n\
         iset M 42\n\
         iset N -13\n\
         iadd O M N\n\
         isub P M N\n\
         imul Q M N\n\
         idiv R M N",
    );
    assert_eq!(reg(&cpu, 'A'), 42);
    assert_eq!(reg(&cpu, 'B'), 13);
    assert_eq!(reg(&cpu, 'C'), 55);
    assert_eq!(reg(&cpu, 'D'), 29);
    assert_eq!(reg(&cpu, 'E'), 546);
    assert_eq!(reg(&cpu, 'F'), 3);
    assert_eq!(freg(&cpu, 'G'), 42.0);
    assert_eq!(freg(&cpu, 'H'), 13.0);
    assert_eq!(freg(&cpu, 'I'), 55.0);
    assert_eq!(freg(&cpu, 'J'), 29.0);
    assert_eq!(freg(&cpu, 'K'), 546.0);
    assert!((freg(&cpu, 'L') - 42.0 / 13.0).abs() < 1e-4);
    assert_eq!(ireg(&cpu, 'M'), 42);
    assert_eq!(ireg(&cpu, 'N'), -13);
    assert_eq!(ireg(&cpu, 'O'), 29);
    assert_eq!(ireg(&cpu, 'P'), 55);
    assert_eq!(ireg(&cpu, 'Q'), -546);
    assert_eq!(ireg(&cpu, 'R'), -3);
}

#[test]
fn wrapping_and_increments() {
    let cpu = run_cpu(
        "set A 4294967295\n\
         inc A\n\
         iset B -2147483648\n\
         idec B\n\
         set C 0\n\
         dec C",
    );
    assert_eq!(reg(&cpu, 'A'), 0);
    assert_eq!(ireg(&cpu, 'B'), i32::MAX);
    assert_eq!(reg(&cpu, 'C'), u32::MAX);
}

#[test]
fn division_by_zero_faults() {
    for source in ["div C A B", "mod C A B", "idiv C A B", "imod C A B"] {
        let err = run_expect_fault(&format!("set A 1\nset B 0\n{source}"));
        assert!(matches!(err.kind(), RuntimeError::DivisionByZero));
    }
}

#[test]
fn float_functions_and_conversions() {
    let cpu = run_cpu(
        "fset A 2.0\n\
         fsqrt B A\n\
         fset C -3.5\n\
         fabs D C\n\
         ffloor E C\n\
         fceil F C\n\
         iset G -7\n\
         s2f H G\n\
         f2s I H\n\
         set J 7\n\
         u2f K J\n\
         f2u L K\n\
         fset M 0.0\n\
         fsin N M\n\
         fcos O M",
    );
    assert!((freg(&cpu, 'B') - std::f32::consts::SQRT_2).abs() < 1e-6);
    assert_eq!(freg(&cpu, 'D'), 3.5);
    assert_eq!(freg(&cpu, 'E'), -4.0);
    assert_eq!(freg(&cpu, 'F'), -3.0);
    assert_eq!(freg(&cpu, 'H'), -7.0);
    assert_eq!(ireg(&cpu, 'I'), -7);
    assert_eq!(freg(&cpu, 'K'), 7.0);
    assert_eq!(reg(&cpu, 'L'), 7);
    assert_eq!(freg(&cpu, 'N'), 0.0);
    assert_eq!(freg(&cpu, 'O'), 1.0);
}

#[test]
fn float_classification() {
    let cpu = run_cpu(
        "fset A 1.0\n\
         fset B 0.0\n\
         fdiv C A B\n\
         fisinf D C\n\
         fdiv E B B\n\
         fisnan F E\n\
         fisfin G A\n\
         fisnorm H A\n\
         fisnorm I B",
    );
    assert_eq!(reg(&cpu, 'D'), 1);
    assert_eq!(reg(&cpu, 'F'), 1);
    assert_eq!(reg(&cpu, 'G'), 1);
    assert_eq!(reg(&cpu, 'H'), 1);
    assert_eq!(reg(&cpu, 'I'), 0);
}

// ==================== Logic ====================

#[test]
fn logic_suite() {
    let cpu = run_cpu(
        "set A 10\n\
         set B 0\n\
         and C A B # 0\n\
         and D A A # 1\n\
         or  E A B # 1\n\
         or  F B B # 0\n\
         xor G A B # 1\n\
         xor H A A # 0\n\
         not I B   # 1\n\
         set J 42\n\
         inv J     # 0\n\
         set K 0\n\
         inv K     # 1\n\
         set A 1\n\
         set L 42  # 101010\n\
         shl L L A # 1010100 = 84\n\
         set M 42\n\
         shr M M A # 10101 = 21\n\
         set N 43  # 101011\n\
         rol N N A # 1010110 = 86\n\
         set O 43\n\
         ror O O A # 10000000000000000000000000010101 = 2147483669\n\
         set  P 42  # 101010\n\
         set  Q 13  # 001101\n\
         band R P Q # 001000 = 8\n\
         bor  S P Q # 101111 = 47\n\
         bxor T P Q # 100111 = 39\n\
         bnot U P   # something big\n\
         copy V P\n\
         binv     V # keep the spaces before the register name to test it",
    );
    let expected: &[(char, u32)] = &[
        ('A', 1),
        ('B', 0),
        ('C', 0),
        ('D', 1),
        ('E', 1),
        ('F', 0),
        ('G', 1),
        ('H', 0),
        ('I', 1),
        ('J', 0),
        ('K', 1),
        ('L', 84),
        ('M', 21),
        ('N', 86),
        ('O', 2147483669),
        ('P', 42),
        ('Q', 13),
        ('R', 8),
        ('S', 47),
        ('T', 39),
        ('U', !42u32),
        ('V', !42u32),
    ];
    for &(letter, value) in expected {
        assert_eq!(reg(&cpu, letter), value, "register {letter}");
    }
}

#[test]
fn shifts_and_rotates_with_large_counts() {
    let cpu = run_cpu(
        "set A 32\n\
         set B 1\n\
         shl C B A\n\
         shr D B A\n\
         rol E B A\n\
         set F 33\n\
         rol G B F\n\
         ror H B F",
    );
    assert_eq!(reg(&cpu, 'C'), 0);
    assert_eq!(reg(&cpu, 'D'), 0);
    assert_eq!(reg(&cpu, 'E'), 1); // rotation count is mod 32
    assert_eq!(reg(&cpu, 'G'), 2);
    assert_eq!(reg(&cpu, 'H'), 0x8000_0000);
}

// ==================== Comparisons ====================

#[test]
fn comparison_suite() {
    let cpu = run_cpu(
        "set A 42\n\
         set B 13\n\
         eq  C A B # 0\n\
         neq D A B # 1\n\
         lt  E A B # 0\n\
         gt  F A B # 1\n\
         lte G A B # 0\n\
         gte H A B # 1\n\
         iset A 42\n\
         iset B -13\n\
         ieq  I A B # 0\n\
         ineq J A B # 1\n\
         ilt  K A B # 0\n\
         igt  L A B # 1\n\
         ilte M A B # 0\n\
         igte N A B # 1\n\
         fset A 42.5\n\
         fset B 13.5\n\
         feq  O A B # 0\n\
         fneq P A B # 1\n\
         flt  Q A B # 0\n\
         fgt  R A B # 1\n\
         flte S A B # 0\n\
         fgte T A B # 1\n\
         test U A   # 1",
    );
    for (letter, value) in [
        ('C', 0),
        ('D', 1),
        ('E', 0),
        ('F', 1),
        ('G', 0),
        ('H', 1),
        ('I', 0),
        ('J', 1),
        ('K', 0),
        ('L', 1),
        ('M', 0),
        ('N', 1),
        ('O', 0),
        ('P', 1),
        ('Q', 0),
        ('R', 1),
        ('S', 0),
        ('T', 1),
        ('U', 1),
    ] {
        assert_eq!(reg(&cpu, letter), value, "register {letter}");
    }
}

#[test]
fn signed_unsigned_comparison_disagree() {
    // 0xFFFFFFFF is u32::MAX unsigned but -1 signed.
    let cpu = run_cpu(
        "set A 4294967295\n\
         set B 1\n\
         gt C A B\n\
         igt D A B",
    );
    assert_eq!(reg(&cpu, 'C'), 1);
    assert_eq!(reg(&cpu, 'D'), 0);
}

// ==================== Control flow ====================

#[test]
fn basic_jump() {
    let cpu = run_cpu(
        "set A 1\n\
         jump TheUniverse\n\
         set B 2\n\
         label TheUniverse\n\
         set C 3",
    );
    assert_eq!(reg(&cpu, 'A'), 1);
    assert_eq!(reg(&cpu, 'B'), 0);
    assert_eq!(reg(&cpu, 'C'), 3);
}

#[test]
fn many_labels_and_jumps() {
    let cpu = run_cpu(
        "set A 1\n\
         jump First\n\
         \n\
         label Third\n\
         set F 6\n\
         jump Fourth\n\
         set G 7\n\
         \n\
         label Unused\n\
         set G 8\n\
         \n\
         label First\n\
         set B 2\n\
         push SA B # just to test various alignments of parameters\n\
         jump Second\n\
         \n\
         label FallThrough\n\
         set C 3 # should not be set\n\
         \n\
         label Fourth\n\
         jump WhyNot\n\
         set G 9\n\
         \n\
         label WhyNot\n\
         jump Done\n\
         \n\
         label Second\n\
         copy D B # 2\n\
         copy E F # 0\n\
         jump Third\n\
         set G 6\n\
         \n\
         label Done\n\
         set H 10",
    );
    for (letter, value) in [
        ('A', 1),
        ('B', 2),
        ('C', 0),
        ('D', 2),
        ('E', 0),
        ('F', 6),
        ('G', 0),
        ('H', 10),
        ('I', 0),
        ('J', 0),
    ] {
        assert_eq!(reg(&cpu, letter), value, "register {letter}");
    }
}

#[test]
fn loop_with_condjmp() {
    let cpu = run_cpu(
        "set B 10\n\
         label Start\n\
         inc A\n\
         lt z A B\n\
         condjmp Start\n\
         set C 3",
    );
    assert_eq!(reg(&cpu, 'A'), 10);
    assert_eq!(reg(&cpu, 'B'), 10);
    assert_eq!(reg(&cpu, 'C'), 3);
}

#[test]
fn conditionals_are_noops_when_z_is_zero() {
    let cpu = run_cpu(
        "set A 7\n\
         set z 0\n\
         condrst A\n\
         condset B 9\n\
         condiset C -9\n\
         condfset D 1.5\n\
         condcpy E A\n\
         set z 1\n\
         condset F 9",
    );
    assert_eq!(reg(&cpu, 'A'), 7);
    assert_eq!(reg(&cpu, 'B'), 0);
    assert_eq!(reg(&cpu, 'C'), 0);
    assert_eq!(reg(&cpu, 'D'), 0);
    assert_eq!(reg(&cpu, 'E'), 0);
    assert_eq!(reg(&cpu, 'F'), 9);
}

#[test]
fn basic_function() {
    let cpu = run_cpu(
        "set A 1\n\
         call Fnc\n\
         set A 2\n\
         \n\
         function Fnc\n\
         copy B A\n\
         return\n\
         \n\
         set A 5",
    );
    assert_eq!(reg(&cpu, 'A'), 2);
    assert_eq!(reg(&cpu, 'B'), 1);
}

#[test]
fn functions_inside_functions() {
    let cpu = run_cpu(
        "call First\n\
         \n\
         function Third\n\
         inc C\n\
         call Fourth\n\
         call Fourth\n\
         return\n\
         \n\
         function Second\n\
         inc B\n\
         call Third\n\
         call Third\n\
         return\n\
         \n\
         function Fourth\n\
         inc D\n\
         return\n\
         \n\
         function First\n\
         inc A\n\
         call Second\n\
         call Second\n\
         return",
    );
    assert_eq!(reg(&cpu, 'A'), 1);
    assert_eq!(reg(&cpu, 'B'), 2);
    assert_eq!(reg(&cpu, 'C'), 4);
    assert_eq!(reg(&cpu, 'D'), 8);
}

#[test]
fn mutual_recursion() {
    let cpu = run_cpu(
        "set D 10\n\
         call First\n\
         \n\
         function First\n\
         inc A\n\
         add B B B # B *= 2\n\
         call Second\n\
         return\n\
         \n\
         function Second\n\
         inc A\n\
         inc B\n\
         lt z A D\n\
         condcall First\n\
         return",
    );
    assert_eq!(reg(&cpu, 'A'), 10);
    assert_eq!(reg(&cpu, 'B'), 31);
}

#[test]
fn condreturn_skips_rest_of_body() {
    let cpu = run_cpu(
        "set A 5\n\
         call Fnc\n\
         \n\
         function Fnc\n\
         eq z A A\n\
         condreturn\n\
         set B 1\n\
         return",
    );
    assert_eq!(reg(&cpu, 'B'), 0);
}

#[test]
fn call_stack_depth_is_restored() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled(
        "set A 1\ncall Fnc\nset A 2\nfunction Fnc\nreturn",
    )));
    // Step to just after the call and observe the pushed frame.
    cpu.step().unwrap(); // set
    cpu.step().unwrap(); // call
    assert_eq!(cpu.callstack().len(), 1);
    cpu.step().unwrap(); // return
    assert_eq!(cpu.callstack().len(), 0);
    cpu.run().unwrap();
    assert_eq!(cpu.state(), CpuState::Finished);
    assert_eq!(reg(&cpu, 'A'), 2);
}

#[test]
fn leaving_function_without_return_faults() {
    let err = run_expect_fault("call NoReturn\nfunction NoReturn");
    assert!(matches!(err.kind(), RuntimeError::FellOffFunction));
    assert!(err.to_string().contains("NoReturn"));
}

#[test]
fn return_at_top_level_faults() {
    let err = run_expect_fault("return");
    assert!(matches!(err.kind(), RuntimeError::CallStackUnderflow));
}

#[test]
fn unbounded_recursion_overflows_call_stack() {
    let err = run_expect_fault("call Bottomless\nfunction Bottomless\ncall Bottomless");
    assert!(matches!(
        err.kind(),
        RuntimeError::CallStackOverflow { depth: 1000 }
    ));
}

#[test]
fn labels_resolve_within_their_scope_at_runtime() {
    let cpu = run_cpu(
        "call First\n\
         set B 2\n\
         \n\
         function First\n\
         jump Start\n\
         label Start\n\
         set A 1\n\
         return\n\
         \n\
         function Second\n\
         jump Start\n\
         label Start\n\
         set A 2\n\
         return",
    );
    assert_eq!(reg(&cpu, 'A'), 1);
    assert_eq!(reg(&cpu, 'B'), 2);
}

#[test]
fn explicit_terminate_faults() {
    let err = run_expect_fault("set A 1\nterminate");
    assert!(matches!(err.kind(), RuntimeError::ExplicitTerminate));
    assert!(err.to_string().contains("explicit terminate"));
}

// ==================== Structures ====================

#[test]
fn structures_suite() {
    let cpu = run_cpu(
        "set A 1\n\
         push SA A\n\
         set A 2\n\
         push SA A\n\
         set A 3\n\
         push SA A\n\
         set A 4\n\
         push SA A\n\
         pop S SA\n\
         \n\
         set A 10\n\
         enqueue QA A\n\
         set A 11\n\
         enqueue QA A\n\
         set A 12\n\
         enqueue QA A\n\
         set A 13\n\
         enqueue QA A\n\
         dequeue Q QA\n\
         \n\
         left TA\n\
         set A 21\n\
         store TA A\n\
         right TA\n\
         set A 22\n\
         store TA A\n\
         right TA\n\
         set A 23\n\
         store TA A\n\
         right TA\n\
         set A 24\n\
         store TA A\n\
         load T TA\n\
         \n\
         set A 30\n\
         store MA@13 A\n\
         set A 31\n\
         store MA@42 A\n\
         load M MA@13",
    );
    assert_eq!(cpu.stack(0), vec![1, 2, 3]);
    assert_eq!(reg(&cpu, 'S'), 4);
    assert_eq!(cpu.queue(0), vec![11, 12, 13]);
    assert_eq!(reg(&cpu, 'Q'), 10);
    assert_eq!(cpu.tape(0), vec![21, 22, 23, 24]);
    assert_eq!(reg(&cpu, 'T'), 24);
    assert_eq!(cpu.memory(0).len(), 1_000_000);
    assert_eq!(cpu.memory(0)[13], 30);
    assert_eq!(cpu.memory(0)[42], 31);
    assert_eq!(reg(&cpu, 'M'), 30);
}

#[test]
fn stack_and_queue_edge_faults() {
    assert!(matches!(
        run_expect_fault("pop A SA").kind(),
        RuntimeError::StructureUnderflow { name } if name == "SA"
    ));
    assert!(matches!(
        run_expect_fault("load A QB").kind(),
        RuntimeError::StructureUnderflow { name } if name == "QB"
    ));
    assert!(matches!(
        run_expect_fault("store SA A").kind(),
        RuntimeError::StructureUnderflow { .. }
    ));
}

#[test]
fn capacity_overflow_faults() {
    let mut limits = CpuLimits::default();
    limits.stack_capacity = 2;
    let mut cpu = cpu_with_limits(limits);
    cpu.load_program(Some(compiled(
        "set A 1\npush SA A\npush SA A\npush SA A",
    )));
    let err = cpu.run().expect_err("expected overflow");
    assert!(matches!(
        err.kind(),
        RuntimeError::StructureOverflow { name } if name == "SA"
    ));
}

#[test]
fn disabled_instance_access_faults() {
    // Default limits enable instances A..D of each family.
    let err = run_expect_fault("set A 1\npush SE A");
    assert!(matches!(
        err.kind(),
        RuntimeError::DisabledStructure { name } if name == "SE"
    ));
    let err = run_expect_fault("left TZ");
    assert!(matches!(
        err.kind(),
        RuntimeError::DisabledStructure { name } if name == "TZ"
    ));
}

#[test]
fn memory_bounds_and_read_only() {
    let mut limits = CpuLimits::default();
    limits.memory_capacity[0] = 8;
    limits.memory_capacity[1] = 8;
    limits.memory_read_only[1] = true;
    let mut cpu = cpu_with_limits(limits.clone());
    cpu.load_program(Some(compiled("load A MA@8")));
    assert!(matches!(
        cpu.run().unwrap_err().kind(),
        RuntimeError::MemoryOutOfBounds { address: 8, size: 8, .. }
    ));

    let mut cpu = cpu_with_limits(limits);
    cpu.load_program(Some(compiled("set A 1\nstore MB@0 A")));
    assert!(matches!(
        cpu.run().unwrap_err().kind(),
        RuntimeError::ReadOnlyMemory { name } if name == "MB"
    ));
}

#[test]
fn swap_exchanges_instances_wholesale() {
    let cpu = run_cpu(
        "set A 1\n\
         push SA A\n\
         set A 2\n\
         push SA A\n\
         set A 9\n\
         push SB A\n\
         swap SA SB",
    );
    assert_eq!(cpu.stack(0), vec![9]);
    assert_eq!(cpu.stack(1), vec![1, 2]);
}

#[test]
fn indirect_swap_reads_indices_from_i_and_j() {
    let cpu = run_cpu(
        "set A 7\n\
         push SA A\n\
         set i 0\n\
         set j 1\n\
         indswap SA SA",
    );
    assert_eq!(cpu.stack(0), Vec::<u32>::new());
    assert_eq!(cpu.stack(1), vec![7]);
}

#[test]
fn indirect_swap_index_out_of_range_faults() {
    let err = run_expect_fault("set i 26\nset j 0\nindswap QA QA");
    assert!(matches!(
        err.kind(),
        RuntimeError::StructureIndexOutOfRange { value: 26 }
    ));
}

#[test]
fn stat_populates_implicit_registers() {
    let cpu = run_cpu(
        "set A 5\n\
         push SA A\n\
         push SA A\n\
         stat SA",
    );
    let implicit = cpu.implicit_registers();
    assert_eq!(implicit[(b'a' - b'a') as usize], 1); // any
    assert_eq!(implicit[(b'c' - b'a') as usize], 1_000_000); // capacity
    assert_eq!(implicit[(b'e' - b'a') as usize], 1); // enabled
    assert_eq!(implicit[(b'f' - b'a') as usize], 0); // full
    assert_eq!(implicit[(b's' - b'a') as usize], 2); // size
}

#[test]
fn tape_stat_tracks_head_and_extent() {
    let cpu = run_cpu(
        "left TA\n\
         left TA\n\
         right TA\n\
         stat TA",
    );
    let implicit = cpu.implicit_registers();
    assert_eq!(implicit[(b'p' - b'a') as usize] as i32, -1);
    assert_eq!(implicit[(b'l' - b'a') as usize] as i32, -2);
    assert_eq!(implicit[(b'r' - b'a') as usize] as i32, 0);
    assert_eq!(implicit[(b's' - b'a') as usize], 3);
}

#[test]
fn stat_on_disabled_instance_reports_disabled() {
    let cpu = run_cpu("stat SZ");
    let implicit = cpu.implicit_registers();
    assert_eq!(implicit[(b'e' - b'a') as usize], 0);
    assert_eq!(implicit[(b's' - b'a') as usize], 0);
}

#[test]
fn indstat_reads_index_from_i() {
    let cpu = run_cpu(
        "set A 3\n\
         push SB A\n\
         set i 1\n\
         indstat SA",
    );
    assert_eq!(cpu.implicit_registers()[(b's' - b'a') as usize], 1);
}

#[test]
fn indirect_memory_addressing() {
    let cpu = run_cpu(
        "set i 9\n\
         set A 42\n\
         indstore MA A\n\
         indload B MA",
    );
    assert_eq!(reg(&cpu, 'B'), 42);
    assert_eq!(cpu.memory(0)[9], 42);
}

#[test]
fn doubly_indirect_memory_addressing() {
    let cpu = run_cpu(
        "set i 5\n\
         set j 1\n\
         set A 77\n\
         indindstore A\n\
         indindload B",
    );
    assert_eq!(reg(&cpu, 'B'), 77);
    assert_eq!(cpu.memory(1)[5], 77);
}

#[test]
fn indcpy_moves_between_register_cells() {
    let cpu = run_cpu(
        "set A 7\n\
         set d 2\n\
         set s 0\n\
         indcpy",
    );
    assert_eq!(reg(&cpu, 'C'), 7);
}

#[test]
fn indcpy_register_index_out_of_range_faults() {
    let err = run_expect_fault("set d 52\nset s 0\nindcpy");
    assert!(matches!(
        err.kind(),
        RuntimeError::RegisterIndexOutOfRange { value: 52 }
    ));
}

// ==================== Input / output ====================

#[test]
fn sum_two_numbers() {
    let (_, lines) = run_with_io(
        "readln\n\
         read A\n\
         readln\n\
         read B\n\
         add C A B\n\
         write C\n\
         writeln",
        "42\n13\n",
    );
    assert_eq!(lines, vec!["55"]);
}

#[test]
fn copy_input_to_output() {
    let input = "set A 1\n# a comment\n\nadd B A A\n";
    let (_, lines) = run_with_io(
        "label Start\n\
         readln\n\
         inv z\n\
         condjmp End\n\
         rwswap\n\
         writeln\n\
         jump Start\n\
         label End",
        input,
    );
    let expected: Vec<String> = input.lines().map(str::to_string).collect();
    assert_eq!(lines, expected);
}

#[test]
fn count_characters_per_line() {
    let (_, lines) = run_with_io(
        "label Start\n\
         readln\n\
         inv z\n\
         condjmp End\n\
         label Char\n\
         rstat\n\
         not z c\n\
         condjmp Line\n\
         cread D\n\
         inc C\n\
         jump Char\n\
         label Line\n\
         write C\n\
         writeln\n\
         set C 0\n\
         jump Start\n\
         label End",
        "\nhello world\nqasm\n",
    );
    assert_eq!(lines, vec!["0", "11", "4"]);
}

#[test]
fn reading_beyond_line_end_faults() {
    let (config, _) = io_config("ab\n");
    let mut cpu = Cpu::new(config).unwrap();
    cpu.load_program(Some(compiled(
        "readln\nlabel Start\ncread A\njump Start",
    )));
    let err = cpu.run().expect_err("expected fault");
    assert!(matches!(err.kind(), RuntimeError::EndOfLine));
}

#[test]
fn malformed_token_faults() {
    let (config, _) = io_config("fortytwo\n");
    let mut cpu = Cpu::new(config).unwrap();
    cpu.load_program(Some(compiled("readln\nread A")));
    let err = cpu.run().expect_err("expected fault");
    assert!(matches!(
        err.kind(),
        RuntimeError::MalformedToken { expected: "u32", .. }
    ));
}

#[test]
fn typed_reads_consume_tokens() {
    let (cpu, _) = run_with_io(
        "readln\n\
         read A\n\
         iread B\n\
         fread C\n\
         cread D\n\
         cread E",
        "42 -7 2.5 ok\n",
    );
    assert_eq!(reg(&cpu, 'A'), 42);
    assert_eq!(ireg(&cpu, 'B'), -7);
    assert_eq!(freg(&cpu, 'C'), 2.5);
    assert_eq!(reg(&cpu, 'D'), ' ' as u32);
    assert_eq!(reg(&cpu, 'E'), 'o' as u32);
}

#[test]
fn rstat_classifies_next_token() {
    let (cpu, _) = run_with_io(
        "readln\n\
         rstat\n\
         copy A u\n\
         copy B i\n\
         copy C f\n\
         read D\n\
         rstat\n\
         copy E u\n\
         copy F i\n\
         copy G f",
        "42 -7\n",
    );
    // "42" parses as u32, i32, and f32; "-7" only as i32 and f32.
    assert_eq!(reg(&cpu, 'A'), 1);
    assert_eq!(reg(&cpu, 'B'), 1);
    assert_eq!(reg(&cpu, 'C'), 1);
    assert_eq!(reg(&cpu, 'E'), 0);
    assert_eq!(reg(&cpu, 'F'), 1);
    assert_eq!(reg(&cpu, 'G'), 1);
}

#[test]
fn readln_reports_eof_in_z() {
    let (cpu, _) = run_with_io(
        "readln\n\
         copy A z\n\
         readln\n\
         copy B z",
        "only line\n",
    );
    assert_eq!(reg(&cpu, 'A'), 1);
    assert_eq!(reg(&cpu, 'B'), 0);
}

#[test]
fn write_buffer_stat_reset_and_clear() {
    let (cpu, lines) = run_with_io(
        "set A 123\n\
         write A\n\
         wstat\n\
         copy B c\n\
         wreset\n\
         set A 9\n\
         write A\n\
         writeln\n\
         wstat\n\
         copy C a\n\
         set A 5\n\
         write A\n\
         wclear\n\
         set A 6\n\
         write A\n\
         writeln",
        "",
    );
    assert_eq!(reg(&cpu, 'B'), 3); // "123"
    assert_eq!(lines, vec!["9", "6"]);
    assert_eq!(reg(&cpu, 'C'), 0); // buffer empty after flush
}

#[test]
fn typed_writes_format_values() {
    let (_, lines) = run_with_io(
        "set A 42\n\
         write A\n\
         iset B -13\n\
         iwrite B\n\
         set C 33\n\
         cwrite C\n\
         writeln",
        "",
    );
    assert_eq!(lines, vec!["42-13!"]);
}

#[test]
fn failing_output_delegate_faults() {
    let mut cpu = Cpu::new(CpuConfig {
        limits: CpuLimits::default(),
        input: None,
        output: Some(Box::new(|_| false)),
    })
    .unwrap();
    cpu.load_program(Some(compiled("set A 1\nwrite A\nwriteln")));
    let err = cpu.run().expect_err("expected fault");
    assert!(matches!(err.kind(), RuntimeError::OutputFailed));
}

#[test]
fn missing_input_delegate_reads_as_eof() {
    let cpu = run_cpu("readln\ncopy A z");
    assert_eq!(reg(&cpu, 'A'), 0);
}

#[test]
fn invalid_character_value_faults() {
    let err = run_expect_fault("set A 55296\ncwrite A"); // 0xD800, a surrogate
    assert!(matches!(
        err.kind(),
        RuntimeError::InvalidCharacterValue { value: 0xD800 }
    ));
}

// ==================== Sorting pipeline ====================

#[test]
fn bubble_sort_hundred_random_numbers() {
    let generator = "set I 0       # count of generated numbers\n\
         set T 100     # count of numbers to generate\n\
         label Loop\n\
         rand J        # generate random number and store it in register J\n\
         write J       # write the number from register J to output buffer\n\
         writeln       # flush the output buffer to standard output\n\
         inc I         # increment the counter of generated numbers\n\
         lt z I T      # compare I < T and store it in z\n\
         condjmp Loop  # go generate another number if we are below the limit";
    let (_, numbers) = run_with_io(generator, "");
    assert_eq!(numbers.len(), 100);

    let sorter = "# read input\n\
         set C 0\n\
         label InputBegin\n\
         readln\n\
         inv z\n\
         condjmp SortBegin\n\
         label Input\n\
         rstat\n\
         copy z u\n\
         inv z\n\
         condjmp InvalidInput\n\
         read V\n\
         store TA V\n\
         right TA\n\
         inc C\n\
         jump InputBegin\n\
         label InvalidInput\n\
         terminate\n\
         \n\
         # one pass of bubble sort over all elements\n\
         label SortBegin\n\
         set M 0\n\
         center TA\n\
         right TA\n\
         label Sorting\n\
         stat TA\n\
         gte z p C\n\
         condjmp Ending\n\
         left TA\n\
         load L TA\n\
         right TA\n\
         load R TA\n\
         lte z L R\n\
         condjmp NextPair\n\
         store TA L\n\
         left TA\n\
         store TA R\n\
         right TA\n\
         set M 1\n\
         label NextPair\n\
         right TA\n\
         jump Sorting\n\
         \n\
         label Ending\n\
         copy z M\n\
         condjmp SortBegin\n\
         \n\
         # write output\n\
         center TA\n\
         set Z 0\n\
         label Output\n\
         gte z Z C\n\
         condjmp Done\n\
         load V TA\n\
         write V\n\
         writeln\n\
         right TA\n\
         inc Z\n\
         jump Output\n\
         label Done";
    let input = numbers.join("\n");
    let (_, sorted) = run_with_io(sorter, &input);
    assert_eq!(sorted.len(), 100);
    let values: Vec<u32> = sorted.iter().map(|l| l.parse().unwrap()).collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]));
    let mut expected: Vec<u32> = numbers.iter().map(|l| l.parse().unwrap()).collect();
    expected.sort_unstable();
    assert_eq!(values, expected);
}

// ==================== Randomness, timer, debug ====================

#[test]
fn unseeded_generator_is_deterministic() {
    let first = run_cpu("rand A\nrand B\nirand C\nfrand D");
    let second = run_cpu("rand A\nrand B\nirand C\nfrand D");
    for letter in ['A', 'B', 'C', 'D'] {
        assert_eq!(reg(&first, letter), reg(&second, letter));
    }
    assert_ne!(reg(&first, 'A'), reg(&first, 'B'));
    let f = freg(&first, 'D');
    assert!((0.0..1.0).contains(&f));
}

#[test]
fn rdseed_reproduces_sequences() {
    let source = "set A 1\nset B 2\nset C 3\nset D 4\nrdseed A B C D\nrand E\nrand F";
    let first = run_cpu(source);
    let second = run_cpu(source);
    assert_eq!(reg(&first, 'E'), reg(&second, 'E'));
    assert_eq!(reg(&first, 'F'), reg(&second, 'F'));
    // A different seed draws a different sequence.
    let other = run_cpu("set A 9\nset B 2\nset C 3\nset D 4\nrdseed A B C D\nrand E\nrand F");
    assert!(reg(&other, 'E') != reg(&first, 'E') || reg(&other, 'F') != reg(&first, 'F'));
}

#[test]
fn timer_runs_without_fault() {
    let cpu = run_cpu("timer A B");
    // Elapsed time since initialization fits comfortably in the low word.
    assert_eq!(reg(&cpu, 'B'), 0);
}

#[test]
fn profiling_counts_steps_per_opcode() {
    let cpu = run_cpu("profiling true\nset A 1\nset B 2\ninc A\nprofiling false");
    let profile = cpu.profile();
    assert!(profile.contains(&("set", 2)));
    assert!(profile.contains(&("inc", 1)));
}

#[test]
fn nop_and_tracing_toggle() {
    let cpu = run_cpu("tracing true\nnop\ntracing false\nset A 1");
    assert_eq!(reg(&cpu, 'A'), 1);
}

// ==================== Stepping and interrupts ====================

#[test]
fn stepping_counts_steps() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled("label Start\ninc A\njump Start")));
    assert_eq!(cpu.state(), CpuState::Initialized);
    cpu.step().unwrap();
    assert_eq!(cpu.state(), CpuState::Running);
    while cpu.explicit_registers()[0] < 100 {
        cpu.step().unwrap();
    }
    assert_eq!(cpu.state(), CpuState::Running);
    assert_eq!(cpu.step_index(), 199);
    assert_eq!(cpu.explicit_registers()[0], 100);
}

#[test]
fn periodic_interrupt_yields_every_period() {
    let mut limits = CpuLimits::default();
    limits.interrupt_period = 10;
    let mut cpu = cpu_with_limits(limits);
    cpu.load_program(Some(compiled("label Start\ninc A\njump Start")));
    let mut interrupts = 0;
    while cpu.explicit_registers()[0] < 12 {
        cpu.run().unwrap();
        assert_eq!(cpu.state(), CpuState::Interrupted);
        interrupts += 1;
    }
    assert_eq!(cpu.step_index(), 30);
    assert_eq!(cpu.explicit_registers()[0], 14);
    assert_eq!(interrupts, 3);
}

#[test]
fn one_step_after_interrupt_increments_step_index_once() {
    let mut limits = CpuLimits::default();
    limits.interrupt_period = 10;
    let mut cpu = cpu_with_limits(limits);
    cpu.load_program(Some(compiled("label Start\ninc A\njump Start")));
    cpu.run().unwrap();
    assert_eq!(cpu.state(), CpuState::Interrupted);
    let at_interrupt = cpu.step_index();
    cpu.step().unwrap();
    assert_eq!(cpu.step_index(), at_interrupt + 1);
}

#[test]
fn breakpoint_interrupts_and_resumes() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled("set A 1\nbreakpoint\nset B 2")));
    cpu.run().unwrap();
    assert_eq!(cpu.state(), CpuState::Interrupted);
    assert_eq!(reg(&cpu, 'A'), 1);
    assert_eq!(reg(&cpu, 'B'), 0);
    cpu.run().unwrap();
    assert_eq!(cpu.state(), CpuState::Finished);
    assert_eq!(reg(&cpu, 'B'), 2);
}

#[test]
fn cross_thread_interrupt_stops_run() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled("label Start\ninc A\njump Start")));
    let signal = cpu.signal();
    std::thread::scope(|scope| {
        scope.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            signal.interrupt();
        });
        cpu.run().unwrap();
    });
    assert_eq!(cpu.state(), CpuState::Interrupted);
    assert!(cpu.step_index() > 0);
    // Resumable: one more step executes normally.
    cpu.step().unwrap();
}

#[test]
fn cross_thread_terminate_stops_run_permanently() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled("label Start\ninc A\njump Start")));
    let signal = cpu.signal();
    std::thread::scope(|scope| {
        scope.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            signal.terminate();
        });
        cpu.run().unwrap();
    });
    assert_eq!(cpu.state(), CpuState::Terminated);
    assert!(matches!(
        cpu.step().unwrap_err(),
        RuntimeError::InvalidState { .. }
    ));
}

#[test]
fn interrupt_does_nothing_unless_running() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled("set A 1")));
    cpu.interrupt();
    assert_eq!(cpu.state(), CpuState::Initialized);
    cpu.run().unwrap();
    assert_eq!(cpu.state(), CpuState::Finished);
    cpu.interrupt();
    assert_eq!(cpu.state(), CpuState::Finished);
}

// ==================== State machine and host surface ====================

#[test]
fn state_machine_life_cycle() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    assert_eq!(cpu.state(), CpuState::None);
    let program = compiled("set A 42");
    cpu.load_program(Some(Arc::clone(&program)));
    assert_eq!(cpu.state(), CpuState::Initialized);
    cpu.run().unwrap();
    assert_eq!(cpu.state(), CpuState::Finished);
    assert!(matches!(
        cpu.run().unwrap_err(),
        RuntimeError::InvalidState { actual: "Finished" }
    ));
    cpu.reinitialize().unwrap();
    assert_eq!(cpu.state(), CpuState::Initialized);
    assert_eq!(cpu.step_index(), 0);
    assert_eq!(reg(&cpu, 'A'), 0);
    cpu.load_program(None);
    assert_eq!(cpu.state(), CpuState::None);
    assert!(matches!(cpu.run().unwrap_err(), RuntimeError::NoProgram));
    assert!(matches!(
        cpu.reinitialize().unwrap_err(),
        RuntimeError::NoProgram
    ));
}

#[test]
fn registers_and_memory_preload() {
    let mut limits = CpuLimits::default();
    limits.memory_capacity[0] = 4;
    let mut cpu = cpu_with_limits(limits);
    cpu.load_program(Some(compiled("load A MA@2\nadd B A W")));
    let mut registers = [0u32; EXPLICIT_COUNT];
    registers[(b'W' - b'A') as usize] = 640;
    cpu.set_explicit_registers(&registers).unwrap();
    cpu.set_memory(0, &[10, 20, 30, 40]).unwrap();
    cpu.run().unwrap();
    assert_eq!(reg(&cpu, 'A'), 30);
    assert_eq!(reg(&cpu, 'B'), 670);
}

#[test]
fn preload_rejected_outside_initialized_state() {
    let mut limits = CpuLimits::default();
    limits.memory_capacity[0] = 4;
    let mut cpu = cpu_with_limits(limits);
    cpu.load_program(Some(compiled("set A 1")));
    cpu.run().unwrap();
    assert!(matches!(
        cpu.set_explicit_registers(&[0; EXPLICIT_COUNT]).unwrap_err(),
        RuntimeError::InvalidState { .. }
    ));
    assert!(matches!(
        cpu.set_memory(0, &[0; 4]).unwrap_err(),
        RuntimeError::InvalidState { .. }
    ));
}

#[test]
fn memory_preload_must_match_size() {
    let mut limits = CpuLimits::default();
    limits.memory_capacity[0] = 4;
    let mut cpu = cpu_with_limits(limits);
    cpu.load_program(Some(compiled("nop")));
    assert!(matches!(
        cpu.set_memory(0, &[1, 2, 3]).unwrap_err(),
        RuntimeError::SizeMismatch {
            expected: 4,
            actual: 3
        }
    ));
}

#[test]
fn reinitialize_applies_limits_to_structures() {
    let mut limits = CpuLimits::default();
    limits.stacks_count = 1;
    limits.tapes_count = 0;
    let mut cpu = cpu_with_limits(limits);
    cpu.load_program(Some(compiled("set A 1\npush SA A")));
    cpu.run().unwrap();
    assert_eq!(cpu.stack(0), vec![1]);
    assert!(cpu.tape(0).is_empty());
    cpu.reinitialize().unwrap();
    assert!(cpu.stack(0).is_empty());
}

#[test]
fn fault_context_names_function_line_and_step() {
    let err = run_expect_fault(
        "set A 1\n\
         call Broken\n\
         \n\
         function Broken\n\
         set B 0\n\
         div C A B\n\
         return",
    );
    let text = err.to_string();
    assert!(text.contains("Broken"), "{text}");
    assert!(text.contains("line 6"), "{text}");
    assert!(text.contains("division by zero"), "{text}");
    match err {
        RuntimeError::Fault {
            function,
            line,
            step,
            ..
        } => {
            assert_eq!(function, "Broken");
            assert_eq!(line, 6);
            assert_eq!(step, 4);
        }
        other => panic!("expected fault context, got {other:?}"),
    }
}

#[test]
fn fault_reporter_accessors_track_current_instruction() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled(
        "set A 1\ncall Broken\nfunction Broken\nterminate",
    )));
    let _ = cpu.run();
    assert_eq!(cpu.state(), CpuState::Terminated);
    assert_eq!(cpu.function_index(), 1);
    // 0-based line of the faulting `terminate`.
    assert_eq!(cpu.source_line(), 3);
    assert_eq!(cpu.step_index(), 3);
}

#[test]
fn empty_program_finishes() {
    let cpu = run_cpu("");
    assert_eq!(cpu.step_index(), 1);
}

#[test]
fn run_twice_after_finish_requires_reinitialize() {
    let mut cpu = cpu_with_limits(CpuLimits::default());
    cpu.load_program(Some(compiled("inc A")));
    cpu.run().unwrap();
    assert_eq!(reg(&cpu, 'A'), 1);
    cpu.reinitialize().unwrap();
    cpu.run().unwrap();
    assert_eq!(reg(&cpu, 'A'), 1);
}
