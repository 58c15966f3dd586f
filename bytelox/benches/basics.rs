//! Benchmarks over the standard Lox workload scripts.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytelox::VM;

pub fn fib(c: &mut Criterion) {
    let src = r#"
fun fib(n) { if (n < 2) return n; return fib(n - 2) + fib(n - 1); }
fib(20);
"#;
    c.bench_function("fib_20", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn equality(c: &mut Criterion) {
    let src = r#"
var i = 0;
while (i < 10000) {
  i = i + 1;

  1 == 1; 1 == 2; 1 == nil; 1 == "str"; 1 == true;
  nil == nil; nil == 1; nil == "str"; nil == true;
  true == true; true == 1; true == false; true == "str"; true == nil;
  "str" == "str"; "str" == "stru"; "str" == 1; "str" == nil; "str" == true;
}
"#;
    c.bench_function("equality", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn closures(c: &mut Criterion) {
    let src = r#"
fun makeAdder(n) {
  fun add(x) { return x + n; }
  return add;
}
var add5 = makeAdder(5);
var total = 0;
for (var i = 0; i < 10000; i = i + 1) {
  total = add5(total) - 4;
}
"#;
    c.bench_function("closures", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn instantiation(c: &mut Criterion) {
    let src = r#"
class Foo {
  init() {}
}
var i = 0;
while (i < 1000) {
  Foo(); Foo(); Foo(); Foo(); Foo(); Foo(); Foo(); Foo();
  Foo(); Foo(); Foo(); Foo(); Foo(); Foo(); Foo(); Foo();
  i = i + 1;
}
"#;
    c.bench_function("instantiation", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

pub fn binary_trees(c: &mut Criterion) {
    let src = r#"
class Tree {
  init(item, depth) {
    this.item = item;
    this.depth = depth;
    if (depth > 0) {
      var item2 = item + item;
      depth = depth - 1;
      this.left = Tree(item2 - 1, depth);
      this.right = Tree(item2, depth);
    } else {
      this.left = nil;
      this.right = nil;
    }
  }

  check() {
    if (this.left == nil) {
      return this.item;
    }
    return this.item + this.left.check() - this.right.check();
  }
}

var minDepth = 4;
var maxDepth = 6;
var stretchDepth = maxDepth + 1;

Tree(0, stretchDepth).check();

var longLivedTree = Tree(0, maxDepth);

var iterations = 1;
var d = 0;
while (d < maxDepth) {
  iterations = iterations * 2;
  d = d + 1;
}

var depth = minDepth;
while (depth < stretchDepth) {
  var check = 0;
  var i = 1;
  while (i <= iterations) {
    check = check + Tree(i, depth).check() + Tree(-i, depth).check();
    i = i + 1;
  }
  iterations = iterations / 4;
  depth = depth + 2;
}

longLivedTree.check();
"#;
    c.bench_function("binary_trees", |b| {
        let mut vm = VM::default();
        b.iter(|| vm.interpret(black_box(src)));
    });
}

criterion_group!(basics, fib, equality, closures, instantiation, binary_trees);
criterion_main!(basics);
