//! Integration tests for closures and the upvalue machinery.

mod common;

use common::assert_prints;

#[test]
fn closures_capture_by_reference() {
    assert_prints!(
        "fun makeCounter() {
           var i = 0;
           fun count() { i = i + 1; print i; }
           return count;
         }
         var c = makeCounter(); c(); c(); c();",
        "1\n2\n3\n",
    );
}

#[test]
fn sibling_closures_share_one_variable() {
    assert_prints!(
        "var a; var b;
         { var x = \"shared\";
           fun setA(v) { x = v; } fun getB() { print x; }
           a = setA; b = getB; }
         a(\"hi\"); b();",
        "hi\n",
    );
}

#[test]
fn counters_are_independent() {
    assert_prints!(
        "fun makeCounter() {
           var i = 0;
           fun count() { i = i + 1; return i; }
           return count;
         }
         var a = makeCounter(); var b = makeCounter();
         a(); a();
         print a(); print b();",
        "3\n1\n",
    );
}

#[test]
fn upvalues_close_when_their_scope_ends() {
    assert_prints!(
        "var f;
         { var x = \"closed over\"; fun g() { print x; } f = g; }
         f();",
        "closed over\n",
    );
}

#[test]
fn capture_reaches_through_intermediate_functions() {
    assert_prints!(
        "fun outer() {
           var x = \"surfaced\";
           fun middle() {
             fun inner() { print x; }
             return inner;
           }
           return middle;
         }
         outer()()();",
        "surfaced\n",
    );
}

#[test]
fn assignment_through_a_closed_upvalue_sticks() {
    assert_prints!(
        "fun make() {
           var v = 0;
           fun set(n) { v = n; }
           fun get() { print v; }
           set(42);
           return get;
         }
         make()();",
        "42\n",
    );
}

#[test]
fn each_call_gets_fresh_locals_to_capture() {
    assert_prints!(
        "fun tag(name) {
           fun show() { print name; }
           return show;
         }
         var a = tag(\"first\"); var b = tag(\"second\");
         a(); b(); a();",
        "first\nsecond\nfirst\n",
    );
}

#[test]
fn closures_see_later_writes_to_open_upvalues() {
    assert_prints!(
        "{
           var x = \"before\";
           fun show() { print x; }
           show();
           x = \"after\";
           show();
         }",
        "before\nafter\n",
    );
}
