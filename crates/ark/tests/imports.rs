//! End-to-end import resolution over real files.

use std::fs;
use std::path::Path;

use ark::{Options, State, Value, Vm, compile_source};

fn eval_file(path: &Path) -> Value {
    let code = fs::read_to_string(path).expect("read entry");
    let bytecode = compile_source(&code, &path.to_string_lossy(), &Options::default())
        .expect("compile failed");
    let state = State::from_bytecode(bytecode);
    let mut vm = Vm::new(&state).with_exceptions();
    vm.run_value().expect("run failed")
}

#[test]
fn imported_definitions_are_usable() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("util.ark"), "(let util:twice (fun (x) (* x 2)))").expect("write");
    fs::write(dir.path().join("main.ark"), "(import util)\n(util:twice 21)").expect("write");

    assert_eq!(eval_file(&dir.path().join("main.ark")), Value::Number(42.0));
}

#[test]
fn nested_packages_resolve_by_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("std")).expect("mkdir");
    fs::write(dir.path().join("std/seq.ark"), "(let seq:first (fun (l) (head l)))")
        .expect("write");
    fs::write(
        dir.path().join("main.ark"),
        "(import std.seq)\n(seq:first [7 8])",
    )
    .expect("write");

    assert_eq!(eval_file(&dir.path().join("main.ark")), Value::Number(7.0));
}

#[test]
fn cyclic_imports_compile_and_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("a.ark"), "(import b)\n(let a:one 1)\n(+ a:one b:two)")
        .expect("write");
    fs::write(dir.path().join("b.ark"), "(import a)\n(let b:two 2)").expect("write");

    assert_eq!(eval_file(&dir.path().join("a.ark")), Value::Number(3.0));
}

#[test]
fn diamond_imports_inline_the_shared_module_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("base.ark"), "(mut base:count 1)").expect("write");
    fs::write(dir.path().join("left.ark"), "(import base)\n(let left:x base:count)")
        .expect("write");
    fs::write(dir.path().join("right.ark"), "(import base)\n(let right:x base:count)")
        .expect("write");
    fs::write(
        dir.path().join("main.ark"),
        "(import left)\n(import right)\n(+ left:x right:x)",
    )
    .expect("write");

    assert_eq!(eval_file(&dir.path().join("main.ark")), Value::Number(2.0));
}

#[test]
fn selective_and_glob_imports_parse_and_inline() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("m.ark"), "(let m:a 1)\n(let m:b 2)").expect("write");
    fs::write(dir.path().join("one.ark"), "(import m :a)\n(+ m:a m:b)").expect("write");
    fs::write(dir.path().join("two.ark"), "(import m:*)\n(+ m:a m:b)").expect("write");

    // qualification is left to name resolution; both inline the module
    assert_eq!(eval_file(&dir.path().join("one.ark")), Value::Number(3.0));
    assert_eq!(eval_file(&dir.path().join("two.ark")), Value::Number(3.0));
}
