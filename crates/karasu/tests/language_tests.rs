//! End-to-end language tests: source in, printed output out.

use karasu::{CollectStringPrint, Vm, VmFlags};
use pretty_assertions::assert_eq;

/// Runs a program and returns everything it printed.
fn run(source: &str) -> String {
    run_with_flags(source, VmFlags::default())
}

fn run_with_flags(source: &str, flags: VmFlags) -> String {
    let collector = CollectStringPrint::new();
    let mut vm = Vm::with_output(flags, Box::new(collector.clone()));
    if let Err(err) = vm.interpret(source, "<test>") {
        panic!("program failed:\n{}", vm.format_traceback(&err));
    }
    collector.output()
}

/// Runs a program expected to die, returning its rendered traceback.
fn run_expecting_error(source: &str) -> String {
    let collector = CollectStringPrint::new();
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(collector.clone()));
    match vm.interpret(source, "<test>") {
        Ok(_) => panic!("program unexpectedly succeeded; output: {}", collector.output()),
        Err(err) => vm.format_traceback(&err),
    }
}

// ======================================================================
// The canonical end-to-end scenarios
// ======================================================================

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(run("print(1 + 2 * 3)\n"), "7\n");
}

#[test]
fn test_default_arguments() {
    assert_eq!(run("def f(x=5): return x*x\nprint(f(), f(3))\n"), "25 9\n");
}

#[test]
fn test_class_with_repr() {
    let source = concat!(
        "class A:\n",
        " def __init__(s,n): s.n=n\n",
        " def __repr__(s): return f\"A({s.n})\"\n",
        "print(A(7))\n",
    );
    assert_eq!(run(source), "A(7)\n");
}

#[test]
fn test_list_sort() {
    assert_eq!(run("l=[3,1,2]\nl.sort()\nprint(l)\n"), "[1, 2, 3]\n");
}

#[test]
fn test_exception_catch_prints_message() {
    let source = concat!(
        "try:\n",
        " raise ValueError(\"x\")\n",
        "except ValueError as e:\n",
        " print(e)\n",
    );
    assert_eq!(run(source), "x\n");
}

#[test]
fn test_dict_insertion_order() {
    let source = "d={}\nfor i in range(4): d[i]=i*i\nprint(list(d.items()))\n";
    assert_eq!(run(source), "[(0, 0), (1, 1), (2, 4), (3, 9)]\n");
}

// ======================================================================
// Expressions and statements
// ======================================================================

#[test]
fn test_numeric_tower() {
    assert_eq!(run("print(7 // 2, 7 % 2, 2 ** 10, 7 / 2)\n"), "3 1 1024 3.5\n");
    assert_eq!(run("print(1 < 2, 2 <= 1, 1 == 1.0, 1 != 2)\n"), "True False True True\n");
    assert_eq!(run("print(-5 // 2, -5 % 3)\n"), "-3 1\n");
    assert_eq!(run("print(0xff, 0b101, 0o17, 1_000)\n"), "255 5 15 1000\n");
    assert_eq!(run("print(6 & 3, 6 | 3, 6 ^ 3, 1 << 4, 32 >> 2, ~0)\n"), "2 7 5 16 8 -1\n");
}

#[test]
fn test_integer_boundaries() {
    assert_eq!(
        run("print(2 ** 31, -(2 ** 31), 2 ** 62)\n"),
        "2147483648 -2147483648 4611686018427387904\n"
    );
    assert_eq!(run("print(9223372036854775807)\n"), "9223372036854775807\n");
}

#[test]
fn test_string_operations() {
    assert_eq!(run("print(\"ab\" + \"cd\", \"ab\" * 3)\n"), "abcd ababab\n");
    assert_eq!(run("print(\"Hello\".upper(), \"Hello\".lower())\n"), "HELLO hello\n");
    assert_eq!(run("print(\"a,b,c\".split(\",\"))\n"), "['a', 'b', 'c']\n");
    assert_eq!(run("print(\"-\".join([\"x\", \"y\"]))\n"), "x-y\n");
    assert_eq!(run("print(\"  pad  \".strip())\n"), "pad\n");
    assert_eq!(run("print(\"hello\".replace(\"l\", \"L\"))\n"), "heLLo\n");
    assert_eq!(run("print(\"hello\".find(\"ll\"), \"hello\".count(\"l\"))\n"), "2 2\n");
    assert_eq!(run("print(\"abc\".startswith(\"ab\"), \"abc\".endswith(\"z\"))\n"), "True False\n");
}

#[test]
fn test_unicode_strings() {
    assert_eq!(run("print(len(\"h\\u00e9llo\"))\n"), "5\n");
    assert_eq!(run("let s = \"a\\U0001F600b\"\nprint(len(s), s[1] == \"\\U0001F600\")\n"), "3 True\n");
}

#[test]
fn test_char_literals_are_codepoints() {
    assert_eq!(run("print('a', 'a' + 1)\n"), "97 98\n");
    assert_eq!(run("print(chr(98), ord(\"c\"))\n"), "b 99\n");
}

#[test]
fn test_fstrings() {
    assert_eq!(run("let x = 3\nprint(f\"x={x} next={x + 1}\")\n"), "x=3 next=4\n");
    assert_eq!(run("print(f\"{{literal}}\")\n"), "{literal}\n");
}

#[test]
fn test_subscripts_and_slices() {
    assert_eq!(run("let l = [10, 20, 30]\nprint(l[0], l[-1])\n"), "10 30\n");
    assert_eq!(run("print(\"hello\"[1:4], \"hello\"[::-1])\n"), "ell olleh\n");
    assert_eq!(run("print([1, 2, 3, 4][::2], (1, 2, 3)[1:])\n"), "[1, 3] (2, 3)\n");
    assert_eq!(run("let l = [1, 2, 3, 4]\nl[1:3] = [9]\nprint(l)\n"), "[1, 9, 4]\n");
}

#[test]
fn test_multiple_assignment_and_swap() {
    assert_eq!(run("a, b = 1, 2\na, b = b, a\nprint(a, b)\n"), "2 1\n");
    assert_eq!(run("let pair = (3, 4)\nx, y = pair\nprint(x + y)\n"), "7\n");
}

#[test]
fn test_augmented_assignment() {
    assert_eq!(run("let x = 10\nx += 5\nx //= 2\nprint(x)\n"), "7\n");
    let source = concat!(
        "class Box:\n",
        " def __init__(s): s.v = 1\n",
        "let b = Box()\n",
        "b.v += 9\n",
        "let l = [1]\n",
        "l[0] *= 7\n",
        "print(b.v, l[0])\n",
    );
    assert_eq!(run(source), "10 7\n");
}

#[test]
fn test_ternary_and_boolean_operators() {
    assert_eq!(run("print(1 if True else 2, 1 if False else 2)\n"), "1 2\n");
    assert_eq!(run("print(0 or \"fallback\", 1 and 2, not 0)\n"), "fallback 2 True\n");
}

#[test]
fn test_comparison_membership_identity() {
    assert_eq!(run("print(2 in [1, 2], 5 not in [1, 2])\n"), "True True\n");
    assert_eq!(run("print(\"ell\" in \"hello\", \"z\" in \"hello\")\n"), "True False\n");
    assert_eq!(run("print(1 in {1: \"a\"}, 2 in {1, 3})\n"), "True False\n");
    assert_eq!(run("let l = [1]\nprint(l is l, l is [1], None is None)\n"), "True False True\n");
    assert_eq!(run("print(3 in range(5), 7 in range(5))\n"), "True False\n");
}

#[test]
fn test_while_else_and_break() {
    let source = concat!(
        "let i = 0\n",
        "while i < 3:\n",
        "    i += 1\n",
        "else:\n",
        "    print(\"done\", i)\n",
    );
    assert_eq!(run(source), "done 3\n");
    let source = concat!(
        "let i = 0\n",
        "while True:\n",
        "    i += 1\n",
        "    if i == 2:\n",
        "        break\n",
        "else:\n",
        "    print(\"never\")\n",
        "print(i)\n",
    );
    assert_eq!(run(source), "2\n");
}

#[test]
fn test_for_continue() {
    let source = concat!(
        "let out = []\n",
        "for i in range(6):\n",
        "    if i % 2 == 0:\n",
        "        continue\n",
        "    out.append(i)\n",
        "print(out)\n",
    );
    assert_eq!(run(source), "[1, 3, 5]\n");
}

#[test]
fn test_for_multiple_targets() {
    let source = concat!(
        "let total = 0\n",
        "for k, v in {1: 10, 2: 20}.items():\n",
        "    total += k + v\n",
        "print(total)\n",
    );
    assert_eq!(run(source), "33\n");
}

#[test]
fn test_del_statement() {
    let source = concat!(
        "let d = {\"a\": 1, \"b\": 2}\n",
        "del d[\"a\"]\n",
        "print(d)\n",
        "class P:\n",
        " def __init__(s): s.x = 1\n",
        "let p = P()\n",
        "del p.x\n",
        "print(hasattr(p, \"x\"))\n",
    );
    assert_eq!(run(source), "{'b': 2}\nFalse\n");
}

#[test]
fn test_assert_statement() {
    assert_eq!(run("assert 1 == 1\nprint(\"ok\")\n"), "ok\n");
    let traceback = run_expecting_error("assert 1 == 2, \"numbers drifted\"\n");
    assert!(traceback.contains("AssertionError: numbers drifted"), "{traceback}");
}

// ======================================================================
// Functions, closures, generators
// ======================================================================

#[test]
fn test_keyword_arguments_full_matrix() {
    let source = concat!(
        "def f(a, b=2, *rest, c=3, **kw):\n",
        "    return [a, b, list(rest), c, kw.get(\"z\", 0)]\n",
        "print(f(1))\n",
        "print(f(1, 9, 8, 7, c=5, z=6))\n",
        "print(f(b=20, a=10))\n",
    );
    assert_eq!(
        run(source),
        "[1, 2, [], 3, 0]\n[1, 9, [8, 7], 5, 6]\n[10, 20, [], 3, 0]\n"
    );
}

#[test]
fn test_star_expansion_at_call_site() {
    let source = concat!(
        "def add3(a, b, c): return a + b + c\n",
        "let args = [1, 2, 3]\n",
        "print(add3(*args))\n",
        "let kw = {\"b\": 20, \"c\": 30}\n",
        "print(add3(10, **kw))\n",
    );
    assert_eq!(run(source), "6\n60\n");
}

#[test]
fn test_arity_errors() {
    let traceback = run_expecting_error("def f(a): return a\nf()\n");
    assert!(traceback.contains("ArgumentError"), "{traceback}");
    assert!(traceback.contains("missing required argument 'a'"), "{traceback}");
    let traceback = run_expecting_error("def f(a): return a\nf(1, 2)\n");
    assert!(traceback.contains("positional argument"), "{traceback}");
    let traceback = run_expecting_error("def f(a): return a\nf(1, a=2)\n");
    assert!(traceback.contains("multiple values"), "{traceback}");
    let traceback = run_expecting_error("def f(a): return a\nf(1, q=2)\n");
    assert!(traceback.contains("unexpected keyword"), "{traceback}");
}

#[test]
fn test_closures_share_upvalues() {
    let source = concat!(
        "def make():\n",
        "    let n = 0\n",
        "    def bump():\n",
        "        n += 1\n",
        "        return n\n",
        "    def read():\n",
        "        return n\n",
        "    return (bump, read)\n",
        "bump, read = make()\n",
        "bump()\n",
        "bump()\n",
        "print(read())\n",
    );
    assert_eq!(run(source), "2\n");
}

#[test]
fn test_closures_capture_loop_variable_by_slot() {
    let source = concat!(
        "let fns = []\n",
        "def capture(i):\n",
        "    return lambda: i\n",
        "for i in range(3):\n",
        "    fns.append(capture(i))\n",
        "print([f() for f in fns])\n",
    );
    assert_eq!(run(source), "[0, 1, 2]\n");
}

#[test]
fn test_lambda_with_defaults() {
    assert_eq!(run("let f = lambda x, y=10: x + y\nprint(f(1), f(1, 2))\n"), "11 3\n");
}

#[test]
fn test_recursion_and_depth_limit() {
    assert_eq!(
        run("def fib(n):\n    return n if n < 2 else fib(n-1) + fib(n-2)\nprint(fib(15))\n"),
        "610\n"
    );
    let source = concat!(
        "def r(n): return r(n + 1)\n",
        "try:\n",
        "    r(0)\n",
        "except SystemError:\n",
        "    print(\"deep\")\n",
    );
    assert_eq!(run(source), "deep\n");
}

#[test]
fn test_generators_yield_and_resume() {
    let source = concat!(
        "def gen(n):\n",
        "    let i = 0\n",
        "    while i < n:\n",
        "        yield i\n",
        "        i += 1\n",
        "for v in gen(3):\n",
        "    print(v)\n",
    );
    assert_eq!(run(source), "0\n1\n2\n");
}

#[test]
fn test_generator_send_value() {
    let source = concat!(
        "def echo():\n",
        "    let got = yield \"ready\"\n",
        "    yield got\n",
        "let g = echo()\n",
        "print(g())\n",
        "print(g(\"sent\"))\n",
    );
    assert_eq!(run(source), "ready\nsent\n");
}

#[test]
fn test_generator_exhaustion_returns_itself() {
    let source = concat!(
        "def one():\n",
        "    yield 1\n",
        "let g = one()\n",
        "g()\n",
        "print(g() is g, g() is g)\n",
    );
    assert_eq!(run(source), "True True\n");
}

#[test]
fn test_comprehensions() {
    assert_eq!(run("print([x * x for x in range(5)])\n"), "[0, 1, 4, 9, 16]\n");
    assert_eq!(run("print([x for x in range(10) if x % 3 == 0])\n"), "[0, 3, 6, 9]\n");
    assert_eq!(run("print({x: x * 2 for x in range(3)})\n"), "{0: 0, 1: 2, 2: 4}\n");
    assert_eq!(run("print(sorted({c for c in \"aabbc\"}))\n"), "['a', 'b', 'c']\n");
    assert_eq!(run("print(sum(x * x for x in range(4)))\n"), "14\n");
    assert_eq!(run("let n = 10\nprint([x + n for x in range(3)])\n"), "[10, 11, 12]\n");
}

#[test]
fn test_decorators() {
    let source = concat!(
        "def shout(f):\n",
        "    def wrapper():\n",
        "        return f().upper()\n",
        "    return wrapper\n",
        "@shout\n",
        "def word():\n",
        "    return \"hi\"\n",
        "print(word())\n",
    );
    assert_eq!(run(source), "HI\n");
}

// ======================================================================
// Classes
// ======================================================================

#[test]
fn test_inheritance_and_super() {
    let source = concat!(
        "class A:\n",
        "    def greet(s):\n",
        "        return \"A\"\n",
        "class B(A):\n",
        "    def greet(s):\n",
        "        return \"B+\" + super.greet()\n",
        "print(B().greet(), A().greet())\n",
        "print(isinstance(B(), A), isinstance(A(), B))\n",
    );
    assert_eq!(run(source), "B+A A\nTrue False\n");
}

#[test]
fn test_method_table_copy_on_inherit() {
    let source = concat!(
        "class A:\n",
        "    def m(s):\n",
        "        return 1\n",
        "class B(A):\n",
        "    pass\n",
        "print(B().m())\n",
    );
    assert_eq!(run(source), "1\n");
}

#[test]
fn test_class_attributes_and_instance_shadowing() {
    let source = concat!(
        "class C:\n",
        "    kind = \"base\"\n",
        "let c = C()\n",
        "print(c.kind)\n",
        "c.kind = \"mine\"\n",
        "print(c.kind, C().kind)\n",
    );
    assert_eq!(run(source), "base\nmine base\n");
}

#[test]
fn test_operator_dunders_with_reflection() {
    let source = concat!(
        "class Vec:\n",
        "    def __init__(s, x): s.x = x\n",
        "    def __add__(s, o): return Vec(s.x + o.x)\n",
        "    def __eq__(s, o): return s.x == o.x\n",
        "    def __repr__(s): return f\"Vec({s.x})\"\n",
        "class Scaled:\n",
        "    def __rmul__(s, o): return \"reflected\"\n",
        "print(Vec(1) + Vec(2))\n",
        "print(Vec(3) == Vec(3), Vec(3) == Vec(4))\n",
        "print(5 * Scaled())\n",
    );
    assert_eq!(run(source), "Vec(3)\nTrue False\nreflected\n");
}

#[test]
fn test_callable_instances() {
    let source = concat!(
        "class Adder:\n",
        "    def __init__(s, n): s.n = n\n",
        "    def __call__(s, x): return s.n + x\n",
        "let plus5 = Adder(5)\n",
        "print(plus5(3))\n",
    );
    assert_eq!(run(source), "8\n");
}

#[test]
fn test_len_and_contains_dunders() {
    let source = concat!(
        "class Bag:\n",
        "    def __init__(s): s.items = [1, 2]\n",
        "    def __len__(s): return len(s.items)\n",
        "    def __contains__(s, x): return x in s.items\n",
        "let b = Bag()\n",
        "print(len(b), 2 in b, 5 in b)\n",
        "if b:\n",
        "    print(\"truthy\")\n",
    );
    assert_eq!(run(source), "2 True False\ntruthy\n");
}

#[test]
fn test_getattr_fallback_dunder() {
    let source = concat!(
        "class Lazy:\n",
        "    def __getattr__(s, name): return \"missing:\" + name\n",
        "let l = Lazy()\n",
        "l.real = 1\n",
        "print(l.real, l.ghost)\n",
    );
    assert_eq!(run(source), "1 missing:ghost\n");
}

#[test]
fn test_custom_iterator_protocol() {
    let source = concat!(
        "class Count:\n",
        "    def __init__(s, n):\n",
        "        s.n = n\n",
        "        s.i = 0\n",
        "    def __iter__(s): return s\n",
        "    def __call__(s):\n",
        "        if s.i >= s.n:\n",
        "            return s\n",
        "        s.i += 1\n",
        "        return s.i\n",
        "print([x for x in Count(3)])\n",
    );
    assert_eq!(run(source), "[1, 2, 3]\n");
}

#[test]
fn test_descriptor_get() {
    let source = concat!(
        "class Answer:\n",
        "    def __get__(s, obj): return 42\n",
        "class Holder:\n",
        "    value = Answer()\n",
        "print(Holder().value)\n",
    );
    assert_eq!(run(source), "42\n");
}

#[test]
fn test_custom_hash_and_eq_in_dict() {
    let source = concat!(
        "class Key:\n",
        "    def __init__(s, k): s.k = s_norm(k)\n",
        "    def __hash__(s): return hash(s.k)\n",
        "def s_norm(k): return k.lower()\n",
        "let d = {}\n",
        "let key = Key(\"A\")\n",
        "d[key] = 1\n",
        "print(d[key])\n",
    );
    assert_eq!(run(source), "1\n");
}

// ======================================================================
// Exceptions
// ======================================================================

#[test]
fn test_exception_hierarchy_matching() {
    let source = concat!(
        "try:\n",
        "    raise IOError(\"io\")\n",
        "except OSError as e:\n",
        "    print(\"as os error:\", e)\n",
    );
    assert_eq!(run(source), "as os error: io\n");
}

#[test]
fn test_except_tuple_filter() {
    let source = concat!(
        "for kind in (ValueError, KeyError):\n",
        "    try:\n",
        "        raise kind(\"boom\")\n",
        "    except (ValueError, KeyError):\n",
        "        print(\"caught\")\n",
    );
    assert_eq!(run(source), "caught\ncaught\n");
}

#[test]
fn test_unmatched_exception_propagates() {
    let source = concat!(
        "def go():\n",
        "    try:\n",
        "        raise KeyError(\"k\")\n",
        "    except ValueError:\n",
        "        print(\"wrong\")\n",
        "go()\n",
    );
    let traceback = run_expecting_error(source);
    assert!(traceback.contains("KeyError"), "{traceback}");
    assert!(traceback.contains("Traceback (most recent call last):"), "{traceback}");
    assert!(traceback.contains("in go"), "{traceback}");
}

#[test]
fn test_else_and_finally_ordering() {
    let source = concat!(
        "let log = []\n",
        "try:\n",
        "    log.append(\"body\")\n",
        "except ValueError:\n",
        "    log.append(\"handler\")\n",
        "else:\n",
        "    log.append(\"else\")\n",
        "finally:\n",
        "    log.append(\"finally\")\n",
        "print(log)\n",
    );
    assert_eq!(run(source), "['body', 'else', 'finally']\n");
}

#[test]
fn test_finally_runs_on_exception_path() {
    let source = concat!(
        "let log = []\n",
        "try:\n",
        "    try:\n",
        "        raise ValueError(\"x\")\n",
        "    finally:\n",
        "        log.append(\"cleanup\")\n",
        "except ValueError:\n",
        "    log.append(\"caught\")\n",
        "print(log)\n",
    );
    assert_eq!(run(source), "['cleanup', 'caught']\n");
}

#[test]
fn test_bare_raise_rethrows() {
    let source = concat!(
        "try:\n",
        "    try:\n",
        "        raise ValueError(\"v\")\n",
        "    except ValueError:\n",
        "        raise\n",
        "except ValueError as e:\n",
        "    print(\"re\", e)\n",
    );
    assert_eq!(run(source), "re v\n");
}

#[test]
fn test_raise_from_sets_cause() {
    let source = concat!(
        "try:\n",
        "    try:\n",
        "        raise ValueError(\"a\")\n",
        "    except ValueError as e:\n",
        "        raise TypeError(\"b\") from e\n",
        "except TypeError as t:\n",
        "    print(t.__cause__.__class__.__name__)\n",
    );
    assert_eq!(run(source), "ValueError\n");
}

#[test]
fn test_user_exception_subclass() {
    let source = concat!(
        "class ParseFailure(ValueError):\n",
        "    pass\n",
        "try:\n",
        "    raise ParseFailure(\"bad token\")\n",
        "except ValueError as e:\n",
        "    print(type(e).__name__, e)\n",
    );
    assert_eq!(run(source), "ParseFailure bad token\n");
}

#[test]
fn test_runtime_errors_have_kinds() {
    assert!(run_expecting_error("undefined_name\n").contains("NameError"));
    assert!(run_expecting_error("1 + \"a\"\n").contains("TypeError"));
    assert!(run_expecting_error("1 / 0\n").contains("ZeroDivisionError"));
    assert!(run_expecting_error("[1][5]\n").contains("IndexError"));
    assert!(run_expecting_error("{}[\"missing\"]\n").contains("KeyError"));
    assert!(run_expecting_error("[].bogus()\n").contains("AttributeError"));
    assert!(run_expecting_error("{[]: 1}\n").contains("unhashable"));
}

#[test]
fn test_with_statement_normal_and_suppressing() {
    let source = concat!(
        "class Ctx:\n",
        "    def __enter__(s): return \"in\"\n",
        "    def __exit__(s, t, v, tb): return False\n",
        "with Ctx() as x:\n",
        "    print(x)\n",
        "print(\"after\")\n",
    );
    assert_eq!(run(source), "in\nafter\n");
    let source = concat!(
        "class Quiet:\n",
        "    def __enter__(s): return s\n",
        "    def __exit__(s, t, v, tb): return True\n",
        "with Quiet():\n",
        "    raise ValueError(\"boom\")\n",
        "print(\"suppressed\")\n",
    );
    assert_eq!(run(source), "suppressed\n");
}

#[test]
fn test_with_statement_exit_sees_exception_type() {
    let source = concat!(
        "class Probe:\n",
        "    def __enter__(s): return s\n",
        "    def __exit__(s, t, v, tb):\n",
        "        print(t.__name__, v)\n",
        "        return True\n",
        "with Probe():\n",
        "    raise KeyError(\"k\")\n",
    );
    assert_eq!(run(source), "KeyError k\n");
}

// ======================================================================
// Builtins
// ======================================================================

#[test]
fn test_builtin_functions() {
    assert_eq!(run("print(len([1,2]), len(\"abc\"), len({1:2}))\n"), "2 3 1\n");
    assert_eq!(run("print(abs(-3), abs(2.5), min(3,1,2), max([5,9,2]))\n"), "3 2.5 1 9\n");
    assert_eq!(run("print(sum([1,2,3]), sum([1,2], 10))\n"), "6 13\n");
    assert_eq!(run("print(any([0, 1]), all([1, 0]))\n"), "True False\n");
    assert_eq!(run("print(sorted([3,1,2]), sorted([1,2,3], reverse=True))\n"), "[1, 2, 3] [3, 2, 1]\n");
    assert_eq!(run("print(sorted([\"bb\", \"a\"], key=len))\n"), "['a', 'bb']\n");
    assert_eq!(run("print(hex(255), oct(8), bin(5))\n"), "0xff 0o10 0b101\n");
    assert_eq!(run("print(int(\"2a\", 16), int(3.9), float(\"1.5\"), bool([]))\n"), "42 3 1.5 False\n");
    assert_eq!(run("print(type(1).__name__, type(\"s\").__name__)\n"), "int str\n");
}

#[test]
fn test_repr_round_trips_shapes() {
    assert_eq!(run("print(repr(\"a'b\"), repr([1, (2,), None, True]))\n"), "'a\\'b' [1, (2,), None, True]\n");
    assert_eq!(run("print(repr(1.0), repr(-0.5))\n"), "1.0 -0.5\n");
    assert_eq!(run("print((1,), (1, 2), ())\n"), "(1,) (1, 2) ()\n");
    assert_eq!(run("print(set())\nprint({1: \"a\"})\n"), "set()\n{1: 'a'}\n");
    assert_eq!(run("print(repr(b\"ab\\x00\"))\n"), "b'ab\\x00'\n");
}

#[test]
fn test_self_referential_list_repr() {
    assert_eq!(run("let l = [1]\nl.append(l)\nprint(l)\n"), "[1, [...]]\n");
}

#[test]
fn test_hash_stability_and_cross_type() {
    assert_eq!(run("print(hash(5) == hash(5), hash(5) == hash(5.0), hash(True) == hash(1))\n"), "True True True\n");
    assert_eq!(run("print(hash(\"k\") == hash(\"k\"))\n"), "True\n");
}

#[test]
fn test_getattr_setattr_hasattr_dir() {
    let source = concat!(
        "class T:\n",
        "    pass\n",
        "let t = T()\n",
        "setattr(t, \"x\", 5)\n",
        "print(getattr(t, \"x\"), getattr(t, \"y\", \"none\"), hasattr(t, \"x\"))\n",
        "print(\"x\" in dir(t))\n",
    );
    assert_eq!(run(source), "5 none True\nTrue\n");
}

#[test]
fn test_print_sep_and_end_kwargs() {
    assert_eq!(run("print(1, 2, 3, sep=\"-\", end=\"!\\n\")\n"), "1-2-3!\n");
    assert_eq!(run("print(\"a\", end=\"\")\nprint(\"b\")\n"), "ab\n");
}

#[test]
fn test_dict_and_set_methods() {
    assert_eq!(run("let d = {\"a\": 1}\nprint(d.get(\"a\"), d.get(\"z\", 9))\n"), "1 9\n");
    assert_eq!(run("let d = {}\nd.setdefault(\"k\", []).append(1)\nprint(d)\n"), "{'k': [1]}\n");
    assert_eq!(run("let d = {\"a\": 1}\nd.update({\"b\": 2})\nprint(sorted(d.keys()))\n"), "['a', 'b']\n");
    assert_eq!(run("let s = {1, 2}\ns.add(3)\ns.discard(1)\nprint(sorted(s))\n"), "[2, 3]\n");
    assert_eq!(run("print(sorted({1, 2}.union([3])), sorted({1, 2, 3}.intersection([2, 3])))\n"), "[1, 2, 3] [2, 3]\n");
}

#[test]
fn test_list_methods() {
    assert_eq!(run("let l = [1]\nl.extend([2, 3])\nl.insert(0, 0)\nprint(l)\n"), "[0, 1, 2, 3]\n");
    assert_eq!(run("let l = [1, 2, 3]\nprint(l.pop(), l.pop(0), l)\n"), "3 1 [2]\n");
    assert_eq!(run("let l = [1, 2, 1]\nl.remove(1)\nprint(l, l.index(2), l.count(1))\n"), "[2, 1] 0 1\n");
    assert_eq!(run("let l = [1, 2]\nlet m = l.copy()\nm.append(3)\nprint(l, m)\n"), "[1, 2] [1, 2, 3]\n");
    assert_eq!(run("let l = [1, 2, 3]\nl.reverse()\nprint(l)\n"), "[3, 2, 1]\n");
}

#[test]
fn test_dict_ordering_survives_deletes() {
    let source = concat!(
        "let d = {}\n",
        "for i in range(6):\n",
        "    d[i] = i\n",
        "del d[2]\n",
        "del d[0]\n",
        "d[9] = 9\n",
        "print(list(d.keys()))\n",
    );
    assert_eq!(run(source), "[1, 3, 4, 5, 9]\n");
}

#[test]
fn test_equality_of_containers() {
    assert_eq!(run("print([1, [2]] == [1, [2]], (1, 2) == (1, 2))\n"), "True True\n");
    assert_eq!(run("print({1: \"a\"} == {1: \"a\"}, {1, 2} == {2, 1})\n"), "True True\n");
    assert_eq!(run("print([1] == [2], (1,) == (1, 2))\n"), "False False\n");
}

#[test]
fn test_bytes_values() {
    assert_eq!(run("let b = b\"hi\"\nprint(len(b), b[0], b.decode())\n"), "2 104 hi\n");
    assert_eq!(run("print(bytes([104, 105]).decode(), \"hi\".encode() == b\"hi\")\n"), "hi True\n");
}

#[test]
fn test_stress_gc_preserves_semantics() {
    let source = concat!(
        "let parts = []\n",
        "for i in range(40):\n",
        "    parts.append(f\"chunk{i}\")\n",
        "let text = \"\".join(parts)\n",
        "class Node:\n",
        "    def __init__(s, v, next): s.v = v; s.next = next\n",
        "let head = None\n",
        "for i in range(20):\n",
        "    head = Node(i, head)\n",
        "let total = 0\n",
        "while head is not None:\n",
        "    total += head.v\n",
        "    head = head.next\n",
        "print(len(text), total)\n",
    );
    let flags = VmFlags {
        stress_gc: true,
        ..VmFlags::default()
    };
    assert_eq!(run_with_flags(source, flags), "270 190\n");
}

#[test]
fn test_module_import_from_file() {
    let dir = std::env::temp_dir().join(format!("karasu-import-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create module dir");
    std::fs::write(
        dir.join("helper.kar"),
        "export shout\nlet greeting = \"hello\"\ndef shout():\n    return greeting.upper()\n",
    )
    .expect("write module");

    let collector = CollectStringPrint::new();
    let mut vm = Vm::with_output(VmFlags::default(), Box::new(collector.clone()));
    vm.add_module_path(dir.clone());
    let source = concat!(
        "import helper\n",
        "from helper import shout as yell\n",
        "print(helper.greeting, yell())\n",
        "import helper as again\n",
        "print(again is helper)\n",
    );
    if let Err(err) = vm.interpret(source, "<test>") {
        panic!("program failed:\n{}", vm.format_traceback(&err));
    }
    assert_eq!(collector.output(), "hello HELLO\nTrue\n");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_missing_import_raises() {
    let traceback = run_expecting_error("import does_not_exist\n");
    assert!(traceback.contains("ImportError"), "{traceback}");
}
