use chrono::{Duration, Utc};
use i8080_cpm::assembler;
use i8080_cpm::cpu::{Intel8080, CARRY_FLAG, ZERO_FLAG};
use i8080_cpm::disk::{Drive, MemoryDrive};
use i8080_cpm::memory::Memory;
use i8080_cpm::session::{lock_session, RunOutcome, Session, SessionManager};

fn run_to_halt(cpu: &mut Intel8080, memory: &mut Memory) -> u64 {
    let mut cycles = 0u64;
    for _ in 0..10_000 {
        if cpu.is_halted() {
            break;
        }
        cycles += cpu.step(memory) as u64;
    }
    cycles
}

fn new_session() -> Session {
    let drives: Vec<Box<dyn Drive>> = vec![Box::new(MemoryDrive::new()), Box::new(MemoryDrive::new())];
    let mut session = Session::new("it", drives);
    session.take_output();
    session
}

#[test]
fn test_simple_calculation() {
    let mut cpu = Intel8080::new();
    let mut memory = Memory::new();

    // Calculate 10 + 20 + 30 and store result
    let program = [
        0x3E, 0x0A,       // MVI A,0AH   ; A = 10
        0xC6, 0x14,       // ADI 14H     ; A = 30
        0xC6, 0x1E,       // ADI 1EH     ; A = 60
        0x32, 0x50, 0x00, // STA 0050H
        0x76,             // HLT
    ];
    memory.load(0x0000, &program).unwrap();

    run_to_halt(&mut cpu, &mut memory);

    assert_eq!(cpu.a, 60);
    assert_eq!(memory.read(0x50), 60);
    assert!(cpu.is_halted());
    assert!(!cpu.get_flag(CARRY_FLAG));
}

#[test]
fn test_memory_copy_single_byte() {
    let mut cpu = Intel8080::new();
    let mut memory = Memory::new();
    memory.write(0x60, 0x42);

    let program = [
        0x21, 0x60, 0x00, // LXI H,0060H
        0x7E,             // MOV A,M
        0x21, 0x70, 0x00, // LXI H,0070H
        0x77,             // MOV M,A
        0x76,             // HLT
    ];
    memory.load(0x0000, &program).unwrap();

    run_to_halt(&mut cpu, &mut memory);

    assert_eq!(memory.read(0x70), 0x42);
    assert_eq!(cpu.hl(), 0x0070);
}

#[test]
fn test_counting_loop() {
    let mut cpu = Intel8080::new();
    let mut memory = Memory::new();

    let program = [
        0x3E, 0x00,       // MVI A,0
        0x06, 0x05,       // MVI B,5
        0xC6, 0x02,       // LOOP: ADI 2
        0x05,             // DCR B
        0xC2, 0x04, 0x00, // JNZ LOOP
        0x76,             // HLT
    ];
    memory.load(0x0000, &program).unwrap();

    let cycles = run_to_halt(&mut cpu, &mut memory);

    assert_eq!(cpu.a, 10);
    assert_eq!(cpu.b, 0);
    assert!(cpu.get_flag(ZERO_FLAG));
    // 7 + 7 + 5 * (7 + 5 + 10) + 7
    assert_eq!(cycles, 131);
}

#[test]
fn test_subroutine_call() {
    let mut cpu = Intel8080::new();
    let mut memory = Memory::new();

    memory.load(0x0000, &[
        0x31, 0x00, 0x01, // LXI SP,0100H
        0xCD, 0x10, 0x00, // CALL 0010H
        0x76,             // HLT
    ]).unwrap();
    memory.load(0x0010, &[
        0x3E, 0x42,       // MVI A,42H
        0xC9,             // RET
    ]).unwrap();

    run_to_halt(&mut cpu, &mut memory);

    assert_eq!(cpu.a, 0x42);
    assert_eq!(cpu.sp, 0x0100);
    assert_eq!(cpu.pc, 0x0007);
}

#[test]
fn test_assemble_load_and_run() {
    let assembly = assembler::assemble("MVI A,5\nMVI B,3\nADD B\nHLT");
    assert!(assembly.is_ok());
    assert_eq!(assembly.origin, 0x0100);

    let mut session = new_session();
    session.load(assembly.origin, &assembly.bytes).unwrap();
    let report = session.run(Some(0x0100), 1_000);

    assert_eq!(report.outcome, RunOutcome::Halted);
    assert!(report.halted);
    assert_eq!(report.cycles, 7 + 7 + 4 + 7);
    assert_eq!(session.cpu().a, 8);
}

#[test]
fn test_hello_world_through_bdos() {
    let mut session = new_session();
    let assembly = session
        .assemble(
            "        ORG 100H\n\
             START:  LXI D,MSG     ; print string\n\
                     MVI C,9\n\
                     CALL 5\n\
                     RET\n\
             MSG:    DB 'Hello, world!',13,10,'$'\n",
            0x0100,
        )
        .unwrap();
    assert!(assembly.is_ok(), "{:?}", assembly.diagnostics);

    let report = session.run(Some(0x0100), 10_000);

    assert_eq!(report.outcome, RunOutcome::Halted);
    assert_eq!(session.take_output(), "Hello, world!\r\n");
}

#[test]
fn test_ccp_assembles_and_runs_program() {
    let mut session = new_session();
    let source = "LXI D,MSG\nMVI C,9\nCALL 5\nRET\nMSG: DB 'HI$'\n";
    session
        .bdos_mut()
        .current_mut()
        .save_file("HELLO.ASM", source.as_bytes().to_vec())
        .unwrap();

    session.execute_command("ASM HELLO", 10_000);
    assert_eq!(session.take_output(), "HELLO.COM: 12 BYTES\r\nA>");

    session.execute_command("DIR", 10_000);
    assert_eq!(session.take_output(), "A: HELLO    ASM\r\nA: HELLO    COM\r\nA>");

    let report = session.execute_command("HELLO", 10_000).unwrap();
    assert_eq!(report.outcome, RunOutcome::Halted);
    assert_eq!(session.take_output(), "HI\r\nA>");
}

#[test]
fn test_program_writes_file() {
    let mut session = new_session();
    let source = "\
        MVI C,22        ; make file
        LXI D,FCB
        CALL 5
        LXI D,DATA      ; set dma
        MVI C,26
        CALL 5
        MVI C,21        ; write sequential
        LXI D,FCB
        CALL 5
        MVI C,16        ; close
        LXI D,FCB
        CALL 5
        RET
FCB:    DB 0,'OUT     TXT'
        DS 24
DATA:   DB 'WRITTEN BY PROGRAM',1AH
        DS 109
";
    let assembly = session.assemble(source, 0x0100).unwrap();
    assert!(assembly.is_ok(), "{:?}", assembly.diagnostics);

    let report = session.run(Some(0x0100), 100_000);
    assert_eq!(report.outcome, RunOutcome::Halted);
    assert_eq!(session.bdos().current().get_file("OUT.TXT").map(|data| data.len()), Some(128));

    session.execute_command("TYPE OUT.TXT", 10_000);
    assert_eq!(session.take_output(), "WRITTEN BY PROGRAM\r\nA>");
}

#[test]
fn test_program_waits_for_line_input() {
    let mut session = new_session();
    let source = "\
        LXI D,BUF
        MVI C,10
        CALL 5
        LDA BUF+1
        HLT
BUF:    DB 20
        DS 21
";
    session.assemble(source, 0x0100).unwrap();

    let report = session.run(Some(0x0100), 10_000);
    assert_eq!(report.outcome, RunOutcome::AwaitingInput);
    assert!(!report.halted);

    session.push_line("abc");
    let report = session.run(None, 10_000);

    assert_eq!(report.outcome, RunOutcome::Halted);
    assert_eq!(session.cpu().a, 3);
    assert_eq!(session.take_output(), "abc\r\n");
}

#[test]
fn test_session_manager_expiry() {
    let manager = SessionManager::new(2, None, Duration::seconds(30));
    let first = manager.create().unwrap();
    let second = manager.create().unwrap();
    assert_eq!(manager.len(), 2);

    {
        let session = manager.get(&first).unwrap();
        let mut session = lock_session(&session);
        assert_eq!(session.take_output(), "A>");
    }

    assert_eq!(manager.sweep_expired(Utc::now()), 0);
    assert_eq!(manager.sweep_expired(Utc::now() + Duration::seconds(31)), 2);
    assert!(manager.get(&first).is_err());
    assert!(manager.get(&second).is_err());
}
