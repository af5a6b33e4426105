use std::io;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::assembler::{Assembler, AssemblerError, AssemblerErrorKind, Flow, PLACEHOLDER};
use crate::machine::{Machine, MachineConfig};
use crate::tokenizer::Tokenizer;
use crate::{MachineError, Opcode, Word};

const MEMORY: usize = 512;

fn assemble_with(memory: usize, source: &str) -> Result<Machine<'static>, AssemblerError> {
    let machine = Machine::with_io(MachineConfig::new(memory), io::empty(), io::sink()).unwrap();
    let mut asm = Assembler::new(machine);
    asm.assemble(&mut Tokenizer::new(source.as_bytes()))?;
    Ok(asm.into_machine())
}

fn assemble(source: &str) -> Result<Machine<'static>, AssemblerError> {
    assemble_with(MEMORY, source)
}

fn words(source: &str) -> Vec<Word> {
    let machine = assemble(source).unwrap();
    machine.memory()[..machine.program_len()].to_vec()
}

/// Assembles and runs `source`, returning what it wrote.
fn run(source: &str, input: &[u8]) -> String {
    let mut output = Vec::new();
    {
        let machine = Machine::with_io(MachineConfig::new(MEMORY), input, &mut output).unwrap();
        let mut asm = Assembler::new(machine);
        asm.assemble(&mut Tokenizer::new(source.as_bytes())).unwrap();
        asm.into_machine().run().unwrap();
    }
    String::from_utf8(output).unwrap()
}

fn error_at(source: &str) -> (Option<u32>, AssemblerErrorKind) {
    let err = assemble(source).unwrap_err();
    (err.line_number(), err.error_kind().clone())
}

const PUSH: Word = Opcode::Push as Word;
const JMP: Word = Opcode::Jmp as Word;

#[test]
fn numbers_push_themselves() {
    assert_eq!(words("42"), [PUSH, 42, PUSH, 4, JMP]);
}

#[test]
fn runs_arithmetic() {
    assert_eq!(run("1 2 add outnum", b""), "3");
    assert_eq!(run("5 3 SUB OutNum", b""), "2");
}

#[test]
fn empty_source_is_just_a_halt() {
    assert_eq!(words(""), [PUSH, 2, JMP]);
    assert_eq!(words("; nothing here\n"), [PUSH, 2, JMP]);
}

#[test]
fn character_literals() {
    assert_eq!(
        words("'A' ''' '\\t' '\\r' '\\n' '\\0'")[..12],
        [PUSH, 65, PUSH, 39, PUSH, 9, PUSH, 13, PUSH, 10, PUSH, 0]
    );
    assert_eq!(run("'o' out 'k' out", b""), "ok");
}

#[test]
fn multi_byte_characters_are_not_literals() {
    assert_eq!(
        error_at("'\u{e9}'"),
        (Some(1), AssemblerErrorKind::UnresolvedLabel("'\u{e9}'".into()))
    );
    assert_eq!(run("'\u{e9}' halt '\u{e9}': 5 outnum popip", b""), "5");
}

#[test]
fn rejects_unknown_escape() {
    assert_eq!(
        error_at("1\n'\\q'"),
        (Some(2), AssemblerErrorKind::UnknownEscape("'\\q'".into()))
    );
}

#[test]
fn rejects_number_that_does_not_fit() {
    assert_eq!(
        error_at("99999999999"),
        (
            Some(1),
            AssemblerErrorKind::InvalidNumber("99999999999".into())
        )
    );
}

#[test]
fn forward_reference_is_patched() {
    assert_eq!(run("&end jmp 1 outnum end: 2 outnum", b""), "2");
    let program = words("&end jmp end:");
    assert_eq!(program[..3], [PUSH, 3, JMP]);
}

#[test]
fn backward_reference_loops() {
    let source = "
        3
        loop: dup outnum
        1 sub
        dup &loop swap jnz
        drop
    ";
    assert_eq!(run(source, b""), "321");
}

#[test]
fn labels_ignore_case() {
    assert_eq!(run("&Done JMP 7 outnum done: 8 outnum", b""), "8");
}

#[test]
fn unresolved_call_names_the_label_and_line() {
    assert_eq!(
        error_at("1 outnum\nnowhere\n"),
        (Some(2), AssemblerErrorKind::UnresolvedLabel("NOWHERE".into()))
    );
    assert_eq!(
        error_at("\n\n&missing"),
        (Some(3), AssemblerErrorKind::UnresolvedLabel("MISSING".into()))
    );
}

#[test]
fn calls_return_through_popip() {
    let source = "
        greet greet halt
        greet: 'h' out 'i' out popip
    ";
    assert_eq!(run(source, b""), "hihi");
}

#[test]
fn nested_calls() {
    let source = "
        outer '!' out halt
        outer: inner inner popip
        inner: '.' out popip
    ";
    assert_eq!(run(source, b""), "..!");
}

#[test]
fn call_layout() {
    assert_eq!(
        words("f f:")[..5],
        [Opcode::PushIp as Word, 5, PUSH, 5, JMP]
    );
}

#[test]
fn halt_can_appear_mid_source() {
    assert_eq!(run("1 outnum HALT 2 outnum", b""), "1");
    assert_eq!(run("1 outnum halt 2 outnum", b""), "1");
}

#[test]
fn comments_run_to_end_of_line() {
    let source = "; 99 outnum\n1 outnum ; 5 outnum\n2 outnum ;x 3 outnum\n";
    assert_eq!(run(source, b""), "12");
}

#[test]
fn echoes_input() {
    assert_eq!(run("in out in out in outnum", b"ab"), "ab4294967295");
}

#[test]
fn here_is_the_push_address() {
    assert_eq!(words("&here")[..2], [PUSH, 0]);
    assert_eq!(words("nop nop &HERE")[..4], [0, 0, PUSH, 2]);
}

#[test]
fn here_cannot_be_defined_or_called() {
    assert_eq!(error_at("here:"), (Some(1), AssemblerErrorKind::ReservedLabel));
    assert_eq!(error_at("1\nHeRe"), (Some(2), AssemblerErrorKind::ReservedLabel));
}

#[test]
fn first_definition_of_a_label_wins() {
    assert_eq!(run("&a jmp a: 1 outnum halt a: 2 outnum", b""), "1");
    assert_eq!(run("a: 3 outnum halt\nA: 4 outnum &a jmp", b""), "3");
}

#[test]
fn rejects_empty_label() {
    assert_eq!(error_at(":"), (Some(1), AssemblerErrorKind::EmptyLabel));
    assert_eq!(error_at("nop &"), (Some(1), AssemblerErrorKind::EmptyLabel));
}

#[test]
fn long_names_resolve() {
    let name = "x".repeat(80);
    assert_eq!(run(&format!("&{name} jmp {name}: 7 outnum"), b""), "7");

    let function = "f".repeat(300);
    let source = format!("{function} halt {function}: 8 outnum popip");
    assert_eq!(run(&source, b""), "8");
}

#[test]
fn reports_program_too_large() {
    let err = assemble_with(4, "1 2").unwrap_err();
    assert_eq!(
        err,
        AssemblerError::WithLine {
            line: 1,
            kind: AssemblerErrorKind::Machine(MachineError::ProgramTooLarge { capacity: 4 }),
        }
    );
}

#[test]
fn error_display_includes_line() {
    let err = assemble("nop\n\nmissing").unwrap_err();
    assert_eq!(err.to_string(), "line 3: code label not found: MISSING");
}

#[test]
fn records_labels_and_forwards() {
    let machine = Machine::with_io(MachineConfig::new(64), io::empty(), io::sink()).unwrap();
    let mut asm = Assembler::new(machine);
    let mut tokenizer = Tokenizer::new("".as_bytes());

    assert_eq!(asm.compile_token(Some("start:"), &mut tokenizer), Ok(Flow::Continue));
    assert_eq!(asm.compile_token(Some("later"), &mut tokenizer), Ok(Flow::Continue));
    assert_eq!(asm.labels().len(), 1);
    assert_eq!(asm.labels()[0].name(), "START");
    assert_eq!(asm.labels()[0].address().index(), 0);

    assert_eq!(asm.forwards().len(), 1);
    let fixup = &asm.forwards()[0];
    assert_eq!(fixup.name(), "LATER");
    assert_eq!(fixup.at().index(), 3);
    assert_eq!(asm.machine().memory()[3], PLACEHOLDER);

    assert_eq!(asm.compile_token(Some("later:"), &mut tokenizer), Ok(Flow::Continue));
    assert_eq!(asm.compile_token(None, &mut tokenizer), Ok(Flow::Finished));
    assert!(asm.forwards().is_empty());
    assert_eq!(asm.machine().memory()[3], 5);
}

#[test]
fn empty_token_ends_assembly() {
    let machine = Machine::with_io(MachineConfig::new(64), io::empty(), io::sink()).unwrap();
    let mut asm = Assembler::new(machine);
    let mut tokenizer = Tokenizer::new("".as_bytes());

    assert_eq!(asm.compile_token(Some("g"), &mut tokenizer), Ok(Flow::Continue));
    assert_eq!(asm.compile_token(Some("g:"), &mut tokenizer), Ok(Flow::Continue));
    assert_eq!(asm.compile_token(Some(""), &mut tokenizer), Ok(Flow::Finished));
    assert!(asm.forwards().is_empty());
    assert_eq!(asm.machine().memory()[5..8], [PUSH, 7, JMP]);
}

#[test]
fn assemble_source_uses_fresh_machine() {
    let machine = crate::assemble_source("7 drop", MachineConfig::new(32)).unwrap();
    assert_eq!(machine.program_len(), 6);
    assert_eq!(machine.position(), 6);
}

proptest! {
    #[test]
    fn decimal_literals_round_trip(value in 0..=Word::MAX) {
        let mut machine = assemble(&value.to_string()).unwrap();
        machine.run().unwrap();
        prop_assert_eq!(machine.stack(), [value]);
    }

    #[test]
    fn printable_characters_push_their_code(c in proptest::char::range('!', '~')) {
        let token = format!("'{c}'");
        prop_assume!(c != '\\');
        let program = words(&token);
        prop_assert_eq!(program[..2].to_vec(), vec![PUSH, c as Word]);
    }
}

#[test]
fn fibonacci_demo() {
    assert_eq!(
        run(include_str!("../demos/fib.s"), b""),
        "0\n1\n1\n2\n3\n5\n8\n13\n21\n34\n"
    );
}

#[test]
fn echo_demo() {
    let source = include_str!("../demos/echo.s");
    assert_eq!(run(source, b"hello, world\n"), "hello, world\n");
    assert_eq!(run(source, b""), "");
}
