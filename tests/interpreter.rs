// End-to-end tests driving the compiler and VM together, covering the
// literal scenarios and boundary cases a complete Sox implementation is
// expected to handle.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use sox::error::InterpretResult;
use sox::vm::Vm;

fn expect_ok(source: &str) {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        InterpretResult::Ok => {}
        other => panic!("expected Ok for {:?}, got {:?}", source, other),
    }
}

/// A `Write` sink that stays readable after being handed to `Vm::with_output`
/// (which takes ownership of a boxed `Write`), by sharing the backing buffer
/// through an `Rc<RefCell<..>>` instead.
#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `source` and return exactly what it printed, for asserting against
/// the literal expected outputs in spec.md §8's concrete scenarios.
fn run_and_capture(source: &str) -> String {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(Box::new(buffer.clone()));
    match vm.interpret(source) {
        InterpretResult::Ok => {}
        other => panic!("expected Ok for {:?}, got {:?}", source, other),
    }
    String::from_utf8(buffer.0.borrow().clone()).expect("program output is not valid utf8")
}

fn expect_runtime_error(source: &str) {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        InterpretResult::RuntimeError(_) => {}
        other => panic!("expected RuntimeError for {:?}, got {:?}", source, other),
    }
}

fn expect_compile_error(source: &str) {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        InterpretResult::CompileError(_) => {}
        other => panic!("expected CompileError for {:?}, got {:?}", source, other),
    }
}

#[test]
fn counter_closure_increments_across_calls() {
    expect_ok(
        r#"
        fun makeCounter() {
            var i = 0;
            fun count() {
                i = i + 1;
                return i;
            }
            return count;
        }

        var counter = makeCounter();
        if (counter() != 1) { print "wrong: first call"; }
        if (counter() != 2) { print "wrong: second call"; }
        if (counter() != 3) { print "wrong: third call"; }
        "#,
    );
}

#[test]
fn two_closures_over_the_same_local_share_state() {
    expect_ok(
        r#"
        fun pair() {
            var count = 0;
            fun increment() { count = count + 1; }
            fun read() { return count; }
            increment();
            increment();
            if (read() != 2) { print "closures diverged"; }
        }
        pair();
        "#,
    );
}

#[test]
fn inheritance_and_super_dispatch() {
    expect_ok(
        r#"
        class Animal {
            speak() { return "..."; }
            describe() { return "an animal that says " + this.speak(); }
        }
        class Dog < Animal {
            speak() { return "woof"; }
            describe() { return super.describe() + "!"; }
        }
        var d = Dog();
        if (d.describe() != "an animal that says woof!") { print "super dispatch broken"; }
        "#,
    );
}

#[test]
fn initializer_implicitly_returns_this() {
    expect_ok(
        r#"
        class Point {
            init(x, y) {
                this.x = x;
                this.y = y;
            }
            sum() { return this.x + this.y; }
        }
        var p = Point(3, 4);
        if (p.sum() != 7) { print "wrong sum"; }
        "#,
    );
}

#[test]
fn equal_strings_from_different_literals_are_equal() {
    expect_ok(
        r#"
        var a = "hello" + "";
        var b = "hel" + "lo";
        if (a != b) { print "interned strings not equal"; }
        "#,
    );
}

#[test]
fn adding_number_and_string_is_a_runtime_error() {
    expect_runtime_error(r#"print 1 + "x";"#);
}

#[test]
fn negating_a_string_is_a_runtime_error() {
    expect_runtime_error(r#"print -"x";"#);
}

#[test]
fn calling_a_non_callable_value_is_a_runtime_error() {
    expect_runtime_error(r#"var x = 1; x();"#);
}

#[test]
fn reading_an_undefined_global_is_a_runtime_error() {
    expect_runtime_error("print nope;");
}

#[test]
fn fun_and_fn_keywords_are_interchangeable() {
    expect_ok("fun a() { return 1; } if (a() != 1) { print \"fail\"; }");
    expect_ok("fn b() { return 2; } if (b() != 2) { print \"fail\"; }");
}

#[test]
fn reading_a_local_in_its_own_initializer_is_a_compile_error() {
    expect_compile_error("{ var a = a; }");
}

#[test]
fn returning_from_top_level_is_a_compile_error() {
    expect_compile_error("return 1;");
}

#[test]
fn self_inheriting_class_is_a_compile_error() {
    expect_compile_error("class Oops < Oops {}");
}

#[test]
fn for_loop_desugars_and_terminates() {
    expect_ok(
        r#"
        var total = 0;
        for (var i = 0; i < 5; i = i + 1) {
            total = total + i;
        }
        if (total != 10) { print "for loop miscounted"; }
        "#,
    );
}

#[test]
fn while_loop_with_break_style_guard() {
    expect_ok(
        r#"
        var i = 0;
        while (i < 3) {
            i = i + 1;
        }
        if (i != 3) { print "while loop miscounted"; }
        "#,
    );
}

#[test]
fn field_assignment_and_lookup_roundtrip() {
    expect_ok(
        r#"
        class Box {}
        var b = Box();
        b.value = 42;
        if (b.value != 42) { print "field roundtrip failed"; }
        "#,
    );
}

#[test]
fn deeply_nested_closures_close_over_distinct_scopes() {
    expect_ok(
        r#"
        fun outer() {
            var results = "";
            var makers = "";
            fun make(label) {
                var captured = label;
                fun get() { return captured; }
                return get;
            }
            var a = make("a");
            var b = make("b");
            if (a() != "a") { print "capture a broken"; }
            if (b() != "b") { print "capture b broken"; }
        }
        outer();
        "#,
    );
}

#[test]
fn recursive_function_runs_to_completion() {
    expect_ok(
        r#"
        fun fact(n) {
            if (n <= 1) { return 1; }
            return n * fact(n - 1);
        }
        if (fact(5) != 120) { print "factorial wrong"; }
        "#,
    );
}

#[test]
fn many_literal_constants_force_the_long_constant_form() {
    // 300 distinct number literals overflow the one-byte constant pool
    // index, forcing OP_CONSTANT_LONG for the later ones. Each literal is
    // printed directly rather than stored in a global, since global names
    // are themselves name constants subject to the same 256-entry byte
    // operand as any other single-byte reference.
    let mut src = String::new();
    for i in 0..300 {
        src.push_str(&format!("print {};\n", i));
    }
    expect_ok(&src);
}

#[test]
fn deeply_recursive_calls_eventually_overflow_cleanly() {
    expect_runtime_error(
        r#"
        fun recurse(n) {
            return recurse(n + 1);
        }
        recurse(0);
        "#,
    );
}

// spec.md §8's six literal-output scenarios, asserted against captured
// stdout rather than the "if (x != y) print fail" indirection used above.

#[test]
fn scenario_counter_closure_literal_output() {
    let out = run_and_capture(
        r#"
        fun makeCounter() { var n = 0; fun c() { n = n + 1; print n; } return c; }
        var c = makeCounter(); c(); c(); c();
        "#,
    );
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn scenario_upvalue_sharing_across_two_closures_literal_output() {
    let out = run_and_capture(
        r#"
        var a; var b;
        { var x = 10;
          fun r() { print x; }
          fun w(v) { x = v; }
          a = r; b = w;
        }
        a(); b(42); a();
        "#,
    );
    assert_eq!(out, "10\n42\n");
}

#[test]
fn scenario_inheritance_and_super_literal_output() {
    let out = run_and_capture(
        r#"
        class A { greet() { print "A"; } }
        class B < A { greet() { super.greet(); print "B"; } }
        B().greet();
        "#,
    );
    assert_eq!(out, "A\nB\n");
}

#[test]
fn scenario_initializer_returns_this_literal_output() {
    let out = run_and_capture(
        r#"
        class P { init(x) { this.x = x; } }
        print P(7).x;
        "#,
    );
    assert_eq!(out, "7\n");
}

#[test]
fn scenario_string_interning_equality_literal_output() {
    let out = run_and_capture(r#"print "ab" + "c" == "abc";"#);
    assert_eq!(out, "true\n");
}

#[test]
fn scenario_runtime_error_on_bad_operand_literal_message() {
    let mut vm = Vm::new();
    match vm.interpret(r#"print "x" - 1;"#) {
        InterpretResult::RuntimeError(e) => {
            assert!(e.message.contains("Operands must be"), "message was: {}", e.message);
            assert!(e.render().contains("line 1"), "render was: {}", e.render());
        }
        other => panic!("expected RuntimeError, got {:?}", other),
    }
}

#[test]
fn stress_gc_mode_collects_on_every_allocation_without_corrupting_state() {
    let mut vm = Vm::new();
    vm.set_stress_gc(true);
    match vm.interpret(
        r#"
        class Node { init(v) { this.v = v; } }
        fun build(n) {
            var list = nil;
            var i = 0;
            while (i < n) {
                var node = Node(i);
                list = node;
                i = i + 1;
            }
            return list;
        }
        var last = build(50);
        if (last.v != 49) { print "corrupted"; }
        "#,
    ) {
        InterpretResult::Ok => {}
        other => panic!("expected Ok under stress GC, got {:?}", other),
    }
}

#[test]
fn top_level_main_is_invoked_implicitly() {
    let out = run_and_capture(
        r#"
        fun main() {
            print "started";
        }
        "#,
    );
    assert_eq!(out, "started\n");
}

#[test]
fn main_runs_after_other_top_level_declarations() {
    let out = run_and_capture(
        r#"
        var greeting = "hi";
        fun main() { print greeting; }
        "#,
    );
    assert_eq!(out, "hi\n");
}
