//! Integration tests for expression evaluation.

mod common;

use common::assert_prints;

#[test]
fn arithmetic_follows_precedence() {
    assert_prints!("print 1 + 2 * 3;", "7\n");
    assert_prints!("print (1 + 2) * 3;", "9\n");
    assert_prints!("print 20 - 4 / 2;", "18\n");
    assert_prints!("print -2 * 3;", "-6\n");
    assert_prints!("print -(1 + 2);", "-3\n");
}

#[test]
fn numbers_print_their_shortest_form() {
    assert_prints!("print 100;", "100\n");
    assert_prints!("print 0.5;", "0.5\n");
    assert_prints!("print 10 / 4;", "2.5\n");
    assert_prints!("print 2.5 + 2.5;", "5\n");
}

#[test]
fn division_by_zero_follows_ieee() {
    assert_prints!("print 1 / 0;", "inf\n");
    assert_prints!("print -1 / 0;", "-inf\n");
    assert_prints!("print 0 / 0 == 0 / 0;", "false\n");
}

#[test]
fn literals_print_their_lexical_form() {
    assert_prints!("print nil;", "nil\n");
    assert_prints!("print true;", "true\n");
    assert_prints!("print false;", "false\n");
    assert_prints!("print \"a string\";", "a string\n");
}

#[test]
fn unary_not_follows_falsiness() {
    assert_prints!("print !true;", "false\n");
    assert_prints!("print !nil;", "true\n");
    assert_prints!("print !0;", "false\n");
    assert_prints!("print !\"\";", "false\n");
    assert_prints!("print !!nil;", "false\n");
}

#[test]
fn comparisons_work_on_numbers() {
    assert_prints!("print 1 < 2;", "true\n");
    assert_prints!("print 2 <= 1;", "false\n");
    assert_prints!("print 3 > 2;", "true\n");
    assert_prints!("print 2 >= 2;", "true\n");
}

#[test]
fn equality_distinguishes_types() {
    assert_prints!("print 1 == 1;", "true\n");
    assert_prints!("print 1 == 2;", "false\n");
    assert_prints!("print 1 != 2;", "true\n");
    assert_prints!("print 1 == \"1\";", "false\n");
    assert_prints!("print nil == nil;", "true\n");
    assert_prints!("print true == 1;", "false\n");
    assert_prints!("print \"a\" == \"a\";", "true\n");
    assert_prints!("print \"a\" == \"b\";", "false\n");
}

#[test]
fn strings_concatenate_and_intern() {
    assert_prints!("print \"foo\" + \"bar\";", "foobar\n");
    assert_prints!("print \"\" + \"x\";", "x\n");
    // Interning makes equal contents the same object, so concatenation
    // results compare equal to literals by reference.
    assert_prints!("print \"foo\" + \"bar\" == \"foobar\";", "true\n");
}

#[test]
fn logical_operators_short_circuit() {
    assert_prints!("print nil or \"x\"; print false and \"y\";", "x\nfalse\n");
    assert_prints!("print 1 or 2;", "1\n");
    assert_prints!("print nil and 1;", "nil\n");
    assert_prints!("print false or false or \"last\";", "last\n");
    // The right-hand side must not run when short-circuited.
    assert_prints!(
        "var ran = false; fun f() { ran = true; return true; } \
         var got = false and f(); print ran;",
        "false\n",
    );
}
