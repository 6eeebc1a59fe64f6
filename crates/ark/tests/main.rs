use ark::{ErrorKind, Options, Value, eval};

fn eval_ok(code: &str) -> Value {
    eval(code, "test.ark", &Options::default()).expect("evaluation failed")
}

fn eval_err(code: &str) -> ark::Error {
    eval(code, "test.ark", &Options::default()).expect_err("expected an error")
}

#[test]
fn arithmetic_on_bindings() {
    assert_eq!(eval_ok("(let x 40) (+ x 2)"), Value::Number(42.0));
}

#[test]
fn lexical_closure_keeps_its_environment() {
    let value = eval_ok("(let mk (fun (n) (fun () n))) (let g (mk 7)) (g)");
    assert_eq!(value, Value::Number(7.0));
}

#[test]
fn set_on_a_constant_is_a_mutability_error() {
    let err = eval_err("(let a 1) (set a 2)");
    assert_eq!(err.kind(), ErrorKind::Mutability);
    assert!(err.message().contains("can not set the constant `a'"));
    // the diagnostic points at the line of the `set`
    assert_eq!(err.loc().expect("location").line, 0);
}

#[test]
fn macro_with_spread_sums_its_arguments() {
    let value = eval_ok(
        "($ sum (x ...rest) ($if (= (len rest) 1) (+ x (@ rest 0)) (+ x (sum ...rest))))\n(sum 1 2 3)",
    );
    assert_eq!(value, Value::Number(6.0));
}

#[test]
fn assertion_failure_carries_its_message() {
    let err = eval_err("(assert (= 1 2) \"nope\")");
    assert_eq!(err.kind(), ErrorKind::Assertion);
    assert_eq!(err.message(), "nope");
    assert!(err.to_string().contains("AssertionFailed: nope"));
}

#[test]
fn tail_recursion_runs_a_million_frames_deep() {
    let value = eval_ok("(let f (fun (n) (if (= n 0) 0 (f (- n 1))))) (f 1000000)");
    assert_eq!(value, Value::Number(0.0));
}

#[test]
fn while_loop_accumulates() {
    let value = eval_ok(
        "(mut i 0) (mut acc 0) (while (< i 5) { (set acc (+ acc i)) (set i (+ i 1)) }) acc",
    );
    assert_eq!(value, Value::Number(10.0));
}

#[test]
fn string_concatenation_with_plus() {
    assert_eq!(
        eval_ok("(+ \"foo\" \"bar\")"),
        Value::String("foobar".to_owned())
    );
}

#[test]
fn operator_chains_fold_left() {
    assert_eq!(eval_ok("(+ 1 2 3 4)"), Value::Number(10.0));
    assert_eq!(eval_ok("(- 10 1 2)"), Value::Number(7.0));
}

#[test]
fn if_yields_the_taken_branch() {
    assert_eq!(eval_ok("(if (< 1 2) \"yes\" \"no\")"), Value::String("yes".to_owned()));
    assert_eq!(eval_ok("(if (> 1 2) \"yes\" \"no\")"), Value::String("no".to_owned()));
}

#[test]
fn begin_yields_its_last_value() {
    assert_eq!(eval_ok("{ (let a 1) (let b 2) (+ a b) }"), Value::Number(3.0));
}

#[test]
fn list_primitives_work_together() {
    assert_eq!(eval_ok("(len [1 2 3])"), Value::Number(3.0));
    assert_eq!(eval_ok("(head [4 5])"), Value::Number(4.0));
    assert_eq!(
        eval_ok("(tail [4 5 6])"),
        Value::List(vec![Value::Number(5.0), Value::Number(6.0)])
    );
    assert_eq!(eval_ok("(empty? [])"), Value::True);
    assert_eq!(eval_ok("(@ [1 2 3] 1)"), Value::Number(2.0));
    assert_eq!(eval_ok("(@ [1 2 3] -1)"), Value::Number(3.0));
}

#[test]
fn append_and_concat_return_new_lists() {
    assert_eq!(
        eval_ok("(let l [1]) (append l 2 3)"),
        Value::List(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
    );
    assert_eq!(
        eval_ok("(concat [1] [2] [3])"),
        Value::List(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
    );
    // the source list is untouched
    assert_eq!(
        eval_ok("(let l [1]) (append l 2) l"),
        Value::List(vec![Value::Number(1.0)])
    );
}

#[test]
fn in_place_append_mutates_the_binding() {
    assert_eq!(
        eval_ok("(mut l [1 2]) (append! l 3) l"),
        Value::List(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)])
    );
}

#[test]
fn pop_supports_negative_indices() {
    assert_eq!(
        eval_ok("(pop [1 2 3] -1)"),
        Value::List(vec![Value::Number(1.0), Value::Number(2.0)])
    );
    assert_eq!(
        eval_ok("(mut l [1 2 3]) (pop! l 0) l"),
        Value::List(vec![Value::Number(2.0), Value::Number(3.0)])
    );
}

#[test]
fn del_unbinds_and_allows_redefinition() {
    assert_eq!(eval_ok("(mut a 1) (del a) (let a 2) a"), Value::Number(2.0));
}

#[test]
fn quote_defers_evaluation_until_called() {
    assert_eq!(eval_ok("(let q '(+ 1 2)) (q)"), Value::Number(3.0));
}

#[test]
fn shadowing_in_inner_function_scopes() {
    let value = eval_ok("(let x 1) (let f (fun (x) (+ x 10))) (f 5)");
    assert_eq!(value, Value::Number(15.0));
}

#[test]
fn conversions_round_between_strings_and_numbers() {
    assert_eq!(eval_ok("(toNumber \"42\")"), Value::Number(42.0));
    assert_eq!(eval_ok("(toNumber \"bogus\")"), Value::Nil);
    assert_eq!(eval_ok("(toString 1)"), Value::String("1.0".to_owned()));
}

#[test]
fn type_names_match_the_variant_table() {
    assert_eq!(eval_ok("(type 1)"), Value::String("Number".to_owned()));
    assert_eq!(eval_ok("(type \"s\")"), Value::String("String".to_owned()));
    assert_eq!(eval_ok("(type [1])"), Value::String("List".to_owned()));
    assert_eq!(eval_ok("(type nil)"), Value::String("Nil".to_owned()));
}

#[test]
fn logic_operators_follow_truthiness() {
    assert_eq!(eval_ok("(and true 1)"), Value::True);
    assert_eq!(eval_ok("(and true 0)"), Value::False);
    assert_eq!(eval_ok("(or false \"\")"), Value::False);
    assert_eq!(eval_ok("(or false \"x\")"), Value::True);
    assert_eq!(eval_ok("(not nil)"), Value::True);
    assert_eq!(eval_ok("(nil? nil)"), Value::True);
}

#[test]
fn str_format_substitutes_in_order() {
    assert_eq!(
        eval_ok("(str:format \"{} and {}\" 1 \"two\")"),
        Value::String("1.0 and two".to_owned())
    );
}

#[test]
fn closure_fields_read_the_captured_environment() {
    let value = eval_ok("(let make (fun (start) (fun () start))) (let c (make 3)) c.start");
    assert_eq!(value, Value::Number(3.0));
}

#[test]
fn closure_methods_run_in_their_parent_scope() {
    let value = eval_ok(
        "(let create (fun (x) { (let get (fun () x)) (fun (&get) nil) }))\n(let obj (create 5))\n(obj.get)",
    );
    assert_eq!(value, Value::Number(5.0));
}

#[test]
fn has_field_checks_the_closure_environment() {
    let value = eval_ok("(let make (fun (start) (fun () start))) (let c (make 3)) (hasField c \"start\")");
    assert_eq!(value, Value::True);
    let value = eval_ok("(let make (fun (start) (fun () start))) (let c (make 3)) (hasField c \"other\")");
    assert_eq!(value, Value::False);
}

#[test]
fn macro_driven_code_generation_end_to_end() {
    let value = eval_ok(
        "($ defzero (name) (let name 0))\n(defzero base)\n($if (= 1 1) (let marker 1) (let marker 2))\n(+ base marker)",
    );
    assert_eq!(value, Value::Number(1.0));
}
