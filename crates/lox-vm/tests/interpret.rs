//! Scénarios de bout en bout : source → compilation → exécution, sortie
//! capturée par un hôte de test.

use indoc::indoc;
use pretty_assertions::assert_eq;

use lox_vm::{CaptureHost, DebuggerState, InterpretError, InterpretResult, Vm};

/// Exécute `source` comme module `__main__`, rend (sortie, résultat).
fn run(source: &str) -> (String, InterpretResult) {
    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));
    let module = vm.create_module("__main__", None);
    let result = vm.interpret_source(module, source);
    let text = out.borrow().clone();
    (text, result)
}

fn run_ok(source: &str) -> String {
    let (out, result) = run(source);
    assert_eq!(result, Ok(()), "échec inattendu ; sortie : {out}");
    out
}

/* ───────────────────────── scénarios du langage ───────────────────────── */

#[test]
fn arithmetic() {
    assert_eq!(run_ok("print 1 + 2;"), "3\n");
    assert_eq!(run_ok("print 10 / 4;"), "2.5\n");
    assert_eq!(run_ok("print -(3 - 5);"), "2\n");
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
}

#[test]
fn numbers_print_with_six_significant_digits() {
    // rendu %g : pas de queue flottante, bascule en exposant
    assert_eq!(run_ok("print 0.1 + 0.2;"), "0.3\n");
    assert_eq!(run_ok("print 1 / 3;"), "0.333333\n");
    assert_eq!(run_ok("print 100000000;"), "1e+08\n");
    assert_eq!(run_ok("print 123456789;"), "1.23457e+08\n");
    assert_eq!(run_ok("print 0.0001;"), "0.0001\n");
    assert_eq!(run_ok("print 0.00001;"), "1e-05\n");
    assert_eq!(run_ok("print 0 - 42.5;"), "-42.5\n");
}

#[test]
fn comparisons_and_logic() {
    assert_eq!(run_ok("print 1 < 2;"), "true\n");
    assert_eq!(run_ok("print 2 <= 1;"), "false\n");
    assert_eq!(run_ok("print 1 == 1;"), "true\n");
    assert_eq!(run_ok("print 1 != 2;"), "true\n");
    assert_eq!(run_ok("print !nil;"), "true\n");
    assert_eq!(run_ok("print true and false;"), "false\n");
    assert_eq!(run_ok("print false or 7;"), "7\n");
    // court-circuit : la droite ne s'évalue pas
    assert_eq!(
        run_ok("fun boom() { print \"boom\"; return true; } print false and boom();"),
        "false\n"
    );
}

#[test]
fn for_loop_sums() {
    let src = "var a = 0; for (var i = 0; i < 5; i = i + 1) a = a + i; print a;";
    assert_eq!(run_ok(src), "10\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let src = indoc! {r#"
        var total = 0;
        var i = 0;
        var odd = false;
        while (true) {
            i = i + 1;
            odd = !odd;
            if (i > 10) break;
            if (!odd) continue;
            total = total + i;
        }
        print total;
    "#};
    // 1 + 3 + 5 + 7 + 9
    assert_eq!(run_ok(src), "25\n");
}

#[test]
fn closures_share_their_captured_cell() {
    let src = indoc! {r#"
        fun make() {
            var n = 0;
            fun inc() { n = n + 1; return n; }
            return inc;
        }
        var f = make();
        print f();
        print f();
        print f();
    "#};
    assert_eq!(run_ok(src), "1\n2\n3\n");
}

#[test]
fn two_closures_one_cell() {
    let src = indoc! {r#"
        fun pair() {
            var n = 0;
            fun bump() { n = n + 10; }
            fun read() { return n; }
            bump();
            print read();
            bump();
            print read();
            return read;
        }
        var r = pair();
        print r();
    "#};
    // la cellule reste partagée après fermeture de la portée
    assert_eq!(run_ok(src), "10\n20\n20\n");
}

#[test]
fn classes_inheritance_and_super() {
    let src = indoc! {r#"
        class A { greet() { print "A"; } }
        class B < A { greet() { super.greet(); print "B"; } }
        B().greet();
    "#};
    assert_eq!(run_ok(src), "A\nB\n");
}

#[test]
fn inherited_methods_are_copied() {
    let src = indoc! {r#"
        class A {
            hello() { return "salut"; }
            twice() { return this.hello() + this.hello(); }
        }
        class B < A {
            hello() { return "re"; }
        }
        print A().twice();
        print B().twice();
    "#};
    assert_eq!(run_ok(src), "salutsalut\nrere\n");
}

#[test]
fn initializer_and_fields() {
    let src = indoc! {r#"
        class Point {
            init(x, y) { this.x = x; this.y = y; }
            norm1() { return this.x + this.y; }
        }
        var p = Point(3, 4);
        print p.norm1();
        p.x = 10;
        print p.norm1();
    "#};
    assert_eq!(run_ok(src), "7\n14\n");
}

#[test]
fn bound_methods_keep_their_receiver() {
    let src = indoc! {r#"
        class Greeter {
            init(name) { this.name = name; }
            greet() { return "hello " + this.name; }
        }
        var m = Greeter("lox").greet;
        print m();
    "#};
    assert_eq!(run_ok(src), "hello lox\n");
}

#[test]
fn dicts_fields_and_subscript() {
    let src = "var d = {a: 1, b: 2}; d.a = 10; print d.a + d[\"b\"];";
    assert_eq!(run_ok(src), "12\n");
}

#[test]
fn dict_builtins() {
    let src = indoc! {r#"
        var d = {a: 1};
        d["b"] = 2;
        print d.length;
        print d.keys().length;
        print d["absent"];
        print d;
    "#};
    assert_eq!(run_ok(src), "2\n2\nnil\n{a: 1, b: 2}\n");
}

#[test]
fn arrays_subscript_push_pop() {
    let src = indoc! {r#"
        var a = [1, 2, 3];
        a.push(4);
        print a.length;
        print a[0] + a[3];
        a[0] = 10;
        print a[0];
        print a.pop();
        print a.length;
        print a;
    "#};
    assert_eq!(run_ok(src), "4\n5\n10\n4\n3\n[10,2,3]\n");
}

#[test]
fn string_builtins_and_concat() {
    let src = indoc! {r#"
        var s = "abc";
        print s.length;
        print s[1];
        print s + "def";
        print "a" + "b" == "ab";
    "#};
    // la dernière ligne ne tient que parce que les chaînes sont internées :
    // l'égalité compare les handles
    assert_eq!(run_ok(src), "3\nb\nabcdef\ntrue\n");
}

#[test]
fn string_escapes() {
    assert_eq!(run_ok(r#"print "a\tb";"#), "a\tb\n");
    assert_eq!(run_ok(r#"print "l1\nl2";"#), "l1\nl2\n");
    assert_eq!(run_ok(r#"print "quote:\"";"#), "quote:\"\n");
}

#[test]
fn compound_assignment() {
    let src = indoc! {r#"
        var x = 8;
        x += 2; print x;
        x -= 4; print x;
        x *= 3; print x;
        x /= 6; print x;
    "#};
    assert_eq!(run_ok(src), "10\n6\n18\n3\n");

    let on_field = indoc! {r#"
        var d = {n: 5};
        d.n += 7;
        print d.n;
    "#};
    assert_eq!(run_ok(on_field), "12\n");
}

#[test]
fn native_functions() {
    assert_eq!(run_ok("print str(1 + 2) + \"!\";"), "3!\n");
    assert_eq!(run_ok("print num(\"41\") + 1;"), "42\n");
    // sémantique strtod : le préfixe numérique suffit
    assert_eq!(run_ok("print num(\"12px\");"), "12\n");
    assert_eq!(run_ok("print num(\"3.5xyz\");"), "3.5\n");
    assert_eq!(run_ok("print num(\"px\");"), "0\n");
    // des secondes écoulées depuis le démarrage, pas une date
    assert_eq!(run_ok("print clock() >= 0 and clock() < 3600;"), "true\n");
}

#[test]
fn calling_a_subscripted_value() {
    let src = indoc! {r#"
        fun double(x) { return x * 2; }
        var fns = [double];
        print fns[0](21);
    "#};
    assert_eq!(run_ok(src), "42\n");
}

/* ───────────────────────── erreurs runtime ───────────────────────── */

#[test]
fn type_errors_are_runtime_errors() {
    assert_eq!(run("print 1 + \"a\";").1, Err(InterpretError::Runtime));
    assert_eq!(run("print -\"a\";").1, Err(InterpretError::Runtime));
    assert_eq!(run("print nil < 1;").1, Err(InterpretError::Runtime));
    assert_eq!(run("var x = 1; x();").1, Err(InterpretError::Runtime));
}

#[test]
fn arity_is_checked() {
    assert_eq!(run("fun f(a) { return a; } f();").1, Err(InterpretError::Runtime));
    assert_eq!(run("fun f() { return 1; } f(2);").1, Err(InterpretError::Runtime));
    assert_eq!(run("clock(1);").1, Err(InterpretError::Runtime));
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    assert_eq!(run("fun f() { f(); } f();").1, Err(InterpretError::Runtime));
}

#[test]
fn undefined_property_on_instance() {
    assert_eq!(run("class A {} A().missing;").1, Err(InterpretError::Runtime));
}

#[test]
fn number_has_no_indexer() {
    assert_eq!(run("var n = 1; n[0];").1, Err(InterpretError::Runtime));
}

/* ───────────────────────── modules ───────────────────────── */

#[test]
fn import_shares_storage_with_exporter() {
    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));

    vm.register_module_source("lib.lox", "var x = 41;\nexport { x };\n");
    let main = vm.create_module("__main__", None);
    let result =
        vm.interpret_source(main, "import { x as k } from \"lib.lox\";\nprint k + 1;\n");
    assert_eq!(result, Ok(()));
    assert_eq!(out.borrow().as_str(), "42\n");
}

#[test]
fn imported_alias_aliases_the_live_cell() {
    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));

    vm.register_module_source(
        "lib.lox",
        indoc! {r#"
            var x = 1;
            fun getx() { return x; }
            export { x, getx };
        "#},
    );
    let main = vm.create_module("__main__", None);
    let result = vm.interpret_source(
        main,
        indoc! {r#"
            import { x as k, getx as g } from "lib.lox";
            k = 5;
            print g();
            print k;
        "#},
    );
    assert_eq!(result, Ok(()));
    // l'écriture via l'alias est visible depuis le module exportateur
    assert_eq!(out.borrow().as_str(), "5\n5\n");
}

#[test]
fn double_import_shares_the_module() {
    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));

    vm.register_module_source(
        "counter.lox",
        indoc! {r#"
            var n = 0;
            n = n + 1;
            export { n };
        "#},
    );
    let main = vm.create_module("__main__", None);
    let result = vm.interpret_source(
        main,
        indoc! {r#"
            import { n as a } from "counter.lox";
            import { n as b } from "counter.lox";
            print a + b;
        "#},
    );
    // le top-level ne tourne qu'une fois : 1 + 1, pas 1 + 2
    assert_eq!(result, Ok(()));
    assert_eq!(out.borrow().as_str(), "2\n");
}

#[test]
fn circular_import_reads_a_broken_reference() {
    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));

    vm.register_module_source(
        "a.lox",
        indoc! {r#"
            var x = 1;
            import { y } from "b.lox";
            print y;
            export { x };
        "#},
    );
    vm.register_module_source(
        "b.lox",
        indoc! {r#"
            import { x } from "a.lox";
            var y = "" + x;
            export { y };
        "#},
    );
    let main = vm.create_module("__main__", None);
    let result = vm.interpret_source(main, "import { x as k } from \"a.lox\";\nprint k;\n");
    assert_eq!(result, Ok(()));
    // b lit x avant que le top-level de a n'ait exporté : lecture cassée,
    // diagnostique au lieu d'un crash
    assert_eq!(out.borrow().as_str(), "<broken reference 'x'>\n1\n");
}

#[test]
fn missing_export_is_a_runtime_error() {
    let mut vm = Vm::new();
    vm.register_module_source("lib.lox", "var x = 1; export { x };");
    let main = vm.create_module("__main__", None);
    let result = vm.interpret_source(main, "import { absent } from \"lib.lox\";");
    assert_eq!(result, Err(InterpretError::Runtime));
}

#[test]
fn missing_module_is_a_runtime_error() {
    let (_, result) = run("import { x } from \"nulle-part.lox\";");
    assert_eq!(result, Err(InterpretError::Runtime));
}

#[test]
fn import_from_file_on_disk() {
    let dir = std::env::temp_dir().join(format!("lox-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("mkdir");
    let lib = dir.join("disklib.lox");
    std::fs::write(&lib, "var x = 41; export { x };\n").expect("write");

    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));
    let main = vm.create_module("__main__", None);
    let src = format!("import {{ x as k }} from \"{}\";\nprint k + 1;\n", lib.display());
    let result = vm.interpret_source(main, &src);
    assert_eq!(result, Ok(()));
    assert_eq!(out.borrow().as_str(), "42\n");

    let _ = std::fs::remove_dir_all(&dir);
}

/* ───────────────────────── GC sous pression ───────────────────────── */

#[test]
fn garbage_heavy_loop_survives_collections() {
    let src = indoc! {r#"
        var total = 0;
        for (var i = 0; i < 2000; i = i + 1) {
            var t = "x" + str(i);
            total = total + t.length;
        }
        print total;
    "#};
    // 10×2 + 90×3 + 900×4 + 1000×5 : le budget infant déborde plusieurs
    // fois en route, les vivants doivent tous survivre
    assert_eq!(run_ok(src), "8890\n");
}

#[test]
fn promoted_container_keeps_young_children_alive() {
    let src = indoc! {r#"
        var keep = [];
        for (var i = 0; i < 1500; i = i + 1) {
            keep.push("k" + str(i));
        }
        print keep.length;
        print keep[0];
        print keep[1499];
    "#};
    // le tableau passe older tôt ; ses éléments naissent infants après —
    // sans write barrier, c'est le re-noircissement de la génération older
    // qui les garde en vie
    assert_eq!(run_ok(src), "1500\nk0\nk1499\n");
}

#[test]
fn interning_survives_collection_cycles() {
    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));
    let main = vm.create_module("__main__", None);
    let src = indoc! {r#"
        var probe = "temoin";
        for (var i = 0; i < 2000; i = i + 1) {
            var junk = "j" + str(i);
        }
        print probe == "tem" + "oin";
    "#};
    let result = vm.interpret_source(main, src);
    assert_eq!(result, Ok(()));
    // l'internement garantit l'égalité par handle même après des cycles GC
    assert_eq!(out.borrow().as_str(), "true\n");
}

/* ───────────────────────── débogueur ───────────────────────── */

#[test]
fn armed_breakpoint_with_false_condition_never_halts() {
    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));

    let main = vm.create_module("__main__", None);
    vm.debugger_mut().set_breakpoint_at(3, main);
    if let Some(bp) = vm.debugger_mut().breakpoint_by_index(1) {
        // `total` est un local de niveau fonction : visible des métadonnées
        // du frame, donc de l'eval de la condition
        bp.condition = Some("total > 100".to_string());
    }
    vm.set_debugger_state(DebuggerState::Armed);

    let src = "var total = 0;\nfor (var i = 0; i < 5; i = i + 1) {\n  total = total + i;\n}\nprint total;\n";
    let result = vm.interpret_source(main, src);
    assert_eq!(result, Ok(()));
    assert_eq!(out.borrow().as_str(), "10\n");

    // la condition a été compilée paresseusement et évaluée sur l'état vif
    let bp = &vm.debugger().breakpoints[0];
    assert!(bp.eval_condition.is_some());
    assert_eq!(bp.hits, 0);
}

#[test]
fn disabled_breakpoint_does_not_count_hits() {
    let mut vm = Vm::new();
    let main = vm.create_module("__main__", None);
    vm.debugger_mut().set_breakpoint_at(2, main);
    if let Some(bp) = vm.debugger_mut().breakpoint_by_index(1) {
        bp.enabled = false;
    }
    vm.set_debugger_state(DebuggerState::Armed);
    let result = vm.interpret_source(main, "var a = 1;\nvar b = 2;\nprint a + b;\n");
    assert_eq!(result, Ok(()));
    assert_eq!(vm.debugger().breakpoints[0].hits, 0);
}

#[test]
fn debugger_commands_without_a_halt() {
    let mut vm = Vm::new();
    vm.parse_commands("watch a + b\n# commentaire\nwatch a + b\nwatch c");
    assert_eq!(vm.debugger().watchpoints.len(), 2);
    assert_eq!(vm.debugger().watchpoints[0].expr, "a + b");
}

/* ───────────────────────── divers ───────────────────────── */

#[test]
fn determinism_same_source_same_output() {
    let src = indoc! {r#"
        var d = {b: 2, a: 1, c: 3};
        print d;
        var acc = "";
        for (var i = 0; i < 3; i = i + 1) acc = acc + str(i);
        print acc;
    "#};
    let first = run_ok(src);
    let second = run_ok(src);
    assert_eq!(first, second);
    assert_eq!(first, "{a: 1, b: 2, c: 3}\n012\n");
}

#[test]
fn repl_style_reuse_of_one_module() {
    let mut vm = Vm::new();
    let host = CaptureHost::new();
    let out = host.handle();
    vm.set_host(Box::new(host));
    let module = vm.create_module("__main__", None);
    assert_eq!(vm.interpret_source(module, "print 1 + 1;"), Ok(()));
    assert_eq!(vm.interpret_source(module, "print \"encore\";"), Ok(()));
    assert_eq!(out.borrow().as_str(), "2\nencore\n");
}

#[test]
fn compile_errors_do_not_reach_the_vm() {
    let (out, result) = run("print 1 +;");
    assert_eq!(result, Err(InterpretError::Compile));
    assert_eq!(out, "");
}
