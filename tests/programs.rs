use std::sync::{Arc, Mutex};

use cinder::{
    EnvironmentState, Error, ExecutionState, ExternalTable, FaultKind, Machine, Program,
    compile_modules, compile_source, decode_program, runtime::HeapError,
};

// ============================================================
// Test Helpers
// ============================================================

fn compile(source: &str) -> Program {
    match compile_source("test", source) {
        Ok(program) => program,
        Err(e) => panic!("{}", e.render(source)),
    }
}

fn boot(source: &str) -> Machine {
    let mut machine = Machine::new(256);
    machine.boot(compile(source)).unwrap();
    machine
}

/// Drives the machine one simulated frame at a time until it halts.
fn run_to_end(machine: &mut Machine) -> Result<(), Error> {
    let mut env = EnvironmentState {
        time: 0.0,
        delta_time: 0.25,
    };
    for _ in 0..1000 {
        if machine.run(env)? {
            return Ok(());
        }
        env.time += env.delta_time;
    }
    panic!("program did not halt");
}

fn run(source: &str) -> Vec<i32> {
    let mut machine = boot(source);
    if let Err(e) = run_to_end(&mut machine) {
        panic!("{}", e);
    }
    machine.stack().iter().map(|&w| w as i32).collect()
}

fn run_error(source: &str) -> FaultKind {
    let mut machine = boot(source);
    match run_to_end(&mut machine) {
        Ok(()) => panic!("expected a runtime error, stack: {:?}", machine.stack()),
        Err(Error::Runtime(e)) => e.kind,
        Err(other) => panic!("unexpected error: {}", other),
    }
}

// ============================================================
// Expressions and control flow
// ============================================================

#[test]
fn test_arithmetic_program() {
    assert_eq!(
        run("var a = 1 - 20\nvar b = 2 + (-a * 2)\nvar c = a + b"),
        vec![-19, 40, 21]
    );
}

#[test]
fn test_if_without_else() {
    assert_eq!(
        run("var a = 5\nif a > 0 then a = a + 1\na = a + 2"),
        vec![8]
    );
    assert_eq!(
        run("var a = 0\nif a > 0 then a = a + 1\na = a + 2"),
        vec![2]
    );
}

#[test]
fn test_inline_else() {
    assert_eq!(
        run("var a = 5\nif a > 100 then a = a + 1 else a = a * a\na = a + 1"),
        vec![26]
    );
}

#[test]
fn test_else_if_chain() {
    let source = "var a = 5
var r = 0
if a > 100 then r = 1
else if a > 3 then r = 2
else r = 3";
    assert_eq!(run(source), vec![5, 2]);
}

fn nested_if(a: bool, b: bool, body: &str) -> Vec<i32> {
    run(&format!("var a = {}\nvar b = {}\nvar x = 0\n{}", a, b, body))
}

#[test]
fn test_outer_else_skips_nested_inline_if() {
    let body = "if a then\n    if b then x = 1\nelse x = 2";
    assert_eq!(nested_if(false, false, body), vec![0, 0, 2]);
    assert_eq!(nested_if(true, false, body), vec![1, 0, 0]);
    assert_eq!(nested_if(true, true, body), vec![1, 1, 1]);
}

#[test]
fn test_outer_else_skips_nested_block_if() {
    let body = "if a then\n    if b then\n        x = 1\nelse\n    x = 2";
    assert_eq!(nested_if(false, true, body), vec![0, 1, 2]);
    assert_eq!(nested_if(true, false, body), vec![1, 0, 0]);
    assert_eq!(nested_if(true, true, body), vec![1, 1, 1]);
}

#[test]
fn test_nested_else_at_its_own_depth() {
    let body = "if a then\n    if b then x = 1\n    else x = 3\nelse x = 2";
    assert_eq!(nested_if(true, false, body), vec![1, 0, 3]);
    assert_eq!(nested_if(false, false, body), vec![0, 0, 2]);
}

#[test]
fn test_while_squares() {
    assert_eq!(run("var x = 2\nwhile x < 10000 x = x * x"), vec![65536]);
}

#[test]
fn test_break_and_continue() {
    let source = "var i = 0
var odd = 0
loop
    i++
    if i > 9 then break
    if i % 2 == 0 then continue
    var doubled = i * 2
    odd += doubled";
    // 2 + 6 + 10 + 14 + 18
    assert_eq!(run(source), vec![10, 50]);
}

#[test]
fn test_float_conversion() {
    let stack = run("var f = 1.5 * 3.0\nvar i = Int(f)\nvar back = Float(i) + 0.25");
    assert_eq!(f32::from_bits(stack[0] as u32), 4.5);
    assert_eq!(stack[1], 4);
    assert_eq!(f32::from_bits(stack[2] as u32), 4.25);
}

#[test]
fn test_boolean_logic() {
    assert_eq!(
        run("var a = 3\nvar t = a > 1 and not (a == 4)\nvar f = a < 1 or false"),
        vec![3, 1, 0]
    );
}

// ============================================================
// Functions
// ============================================================

#[test]
fn test_function_call() {
    let source = "function Add(Int a, Int b) returns Int
    return a + b
var result = Add(3, 5)";
    assert_eq!(run(source), vec![8]);
}

#[test]
fn test_caller_locals_survive_call() {
    let source = "var before = 11
function Add(Int a, Int b) returns Int
    var sum = a + b
    return sum
var result = Add(3, 5)
var after = before + 1";
    assert_eq!(run(source), vec![11, 8, 12]);
}

#[test]
fn test_recursion() {
    let source = "function Fact(Int n) returns Int
    if n <= 1 then return 1
    return n * Fact(n - 1)
var f = Fact(10)";
    assert_eq!(run(source), vec![3628800]);
}

#[test]
fn test_missing_return_yields_zero() {
    let source = "function Maybe(Int n) returns Int
    if n > 0 then return n
var a = Maybe(4)
var b = Maybe(-4)";
    assert_eq!(run(source), vec![4, 0]);
}

#[test]
fn test_runaway_recursion_is_caught() {
    let source = "function Down(Int n) returns Int
    return Down(n + 1)
var x = Down(0)";
    assert_eq!(run_error(source), FaultKind::CallDepthExceeded(1000));
}

// ============================================================
// Structures, spans, lists and pointers
// ============================================================

#[test]
fn test_structure_methods() {
    let source = "structure Vec2
    field Int x
    field Int y
    function Sum() returns Int
        return self.x + self.y
    function Scale(Int k)
        self.x = self.x * k
        self.y *= k
var v = Vec2 { x = 2, y = 3 }
v.Scale(4)
var s = v.Sum()";
    assert_eq!(run(source), vec![8, 12, 20]);
}

#[test]
fn test_generic_structure() {
    let source = "structure Pair<A, B>
    field A first
    field B second
    function First() returns A
        return self.first
var p = Pair<Int, Float> { first = 7, second = 2.5 }
var f = p.First()
var g = Int(p.second * 2.0)";
    let stack = run(source);
    assert_eq!(stack[0], 7);
    assert_eq!(f32::from_bits(stack[1] as u32), 2.5);
    assert_eq!(&stack[2..], &[7, 5]);
}

#[test]
fn test_spans() {
    let source = "var s = { 1, 2, 3 }
s[1] = 20
var d = Int<3>
d.2 = 9
var sum = s.0 + s[1] + s.2 + d.2 + s.length";
    assert_eq!(run(source), vec![1, 20, 3, 0, 0, 9, 36]);
}

#[test]
fn test_span_index_checked_at_run_time() {
    let source = "var s = { 1, 2, 3 }
var i = 3
var x = s[i]";
    assert_eq!(
        run_error(source),
        FaultKind::IndexOutOfBounds {
            index: 3,
            length: 3
        }
    );
}

#[test]
fn test_list_push_index_and_free() {
    let source = "var xs = Int[]
var i = 0
while i < 6
    xs.push(i * i)
    i++
var total = 0
i = 0
while i < xs.length
    total += xs[i]
    i++
var n = xs.length
free xs";
    assert_eq!(run(source), vec![0, 6, 55, 6]);
}

#[test]
fn test_list_index_out_of_bounds() {
    assert_eq!(
        run_error("var xs = Int[]\nxs.push(1)\nvar x = xs[1]"),
        FaultKind::IndexOutOfBounds {
            index: 1,
            length: 1
        }
    );
}

#[test]
fn test_pointer_fields() {
    let source = "structure Node
    field Int value
    field Node* next
var tail = new Node { value = 2 }
var head = Node { value = 1, next = tail }
var total = head.value + head.next.value
free head.next";
    let stack = run(source);
    assert_ne!(stack[0], 0);
    assert_eq!(&stack[1..], &[1, 0, 3]);
}

#[test]
fn test_freeing_an_alias_twice_is_fatal() {
    let source = "structure Cell
    field Int value
var p = new Cell { value = 5 }
var q = p
free p
free q
var a = new Cell { value = 1 }
var b = new Cell { value = 2 }";
    assert!(matches!(
        run_error(source),
        FaultKind::Heap(HeapError::DoubleFree { length: 1, .. })
    ));
}

#[test]
fn test_division_by_zero_is_fatal() {
    assert_eq!(
        run_error("var a = 0\nvar b = 10 / a"),
        FaultKind::DivisionByZero
    );
}

// ============================================================
// Host interaction
// ============================================================

#[test]
fn test_yield_suspends_until_resume_time() {
    let mut machine = boot("var ticks = 0\nwhile ticks < 3\n    ticks++\n    yield 0.5");
    let at = |time: f64| EnvironmentState {
        time,
        delta_time: 0.25,
    };

    assert!(!machine.run(at(0.0)).unwrap());
    assert_eq!(machine.stack(), &[1]);
    assert!(!machine.run(at(0.25)).unwrap());
    assert_eq!(machine.stack(), &[1]);
    assert!(!machine.run(at(0.5)).unwrap());
    assert_eq!(machine.stack(), &[2]);
    assert!(!machine.run(at(1.0)).unwrap());
    assert_eq!(machine.state(), ExecutionState::Yield);
    assert!(machine.run(at(1.5)).unwrap());
    assert_eq!(machine.stack(), &[3]);
}

#[test]
fn test_externals_by_name() {
    let source = "external function Add3(Int a, Int b, Int c) returns Int
external function Log(String message)
var r = Add3(1, 2, 3)
Log(\"hello\")
Log(\"world\")";
    let program = compile(source);
    assert_eq!(program.externals, vec!["Add3", "Log"]);

    let logged = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&logged);
    let mut table = ExternalTable::new();
    table
        .register("Add3", |machine: &mut Machine| {
            let c = machine.pop_int()?;
            let b = machine.pop_int()?;
            let a = machine.pop_int()?;
            machine.push_int(a + b + c);
            Ok(())
        })
        .register("Log", move |machine: &mut Machine| {
            let address = machine.pop_word()?;
            let text = machine.read_string(address)?;
            sink.lock().unwrap().push(text);
            Ok(())
        });

    let mut machine = Machine::new(64);
    machine.boot(program).unwrap();
    machine.bind_externals(&table).unwrap();
    run_to_end(&mut machine).unwrap();
    assert_eq!(machine.stack(), &[6]);
    assert_eq!(*logged.lock().unwrap(), vec!["hello", "world"]);
}

#[test]
fn test_missing_external_binding() {
    let program = compile("external function Beep()\nBeep()");
    let mut machine = Machine::new(16);
    machine.boot(program).unwrap();
    let error = machine.bind_externals(&ExternalTable::new()).unwrap_err();
    assert_eq!(
        error.kind,
        FaultKind::MissingExternals(vec!["Beep".to_string()])
    );
}

#[test]
fn test_program_shared_between_machines() {
    let program = Arc::new(compile("var x = 2\nwhile x < 10000 x = x * x"));
    let mut first = Machine::new(16);
    let mut second = Machine::new(16);
    first.boot(Arc::clone(&program)).unwrap();
    second.boot(program).unwrap();
    run_to_end(&mut first).unwrap();
    run_to_end(&mut second).unwrap();
    assert_eq!(first.stack(), second.stack());
}

#[test]
fn test_modules_share_declarations() {
    let program = compile_modules(&[
        ("math", "function Twice(Int n) returns Int\n    return n * 2\nvar base = 4"),
        ("main", "var result = Twice(base)"),
    ])
    .unwrap();
    let mut machine = Machine::new(16);
    machine.boot(program).unwrap();
    run_to_end(&mut machine).unwrap();
    assert_eq!(machine.stack(), &[4, 8]);
}

#[test]
fn test_encoded_program_runs() {
    let program = compile("var a = 1 - 20\nvar b = 2 + (-a * 2)\nvar c = a + b");
    let decoded = decode_program(&program.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, program);
    let mut machine = Machine::new(16);
    machine.boot(decoded).unwrap();
    run_to_end(&mut machine).unwrap();
    assert_eq!(machine.stack(), &[-19i32 as u32, 40, 21]);
}

#[test]
fn test_garbage_bytes_rejected() {
    assert!(matches!(decode_program(&[0xFF, 0xFF, 0xFF]), Err(Error::Encoding(_))));
}

#[test]
fn test_compile_errors_render_caret() {
    let source = "var a = 1\nvar a = 2";
    let error = compile_source("test", source).unwrap_err();
    let rendered = error.render(source);
    assert!(rendered.starts_with("compile error: 2:"));
    assert!(rendered.contains("2 | var a = 2"));
    assert!(rendered.ends_with('^'));
}
