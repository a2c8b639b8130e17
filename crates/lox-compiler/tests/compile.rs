//! Couverture grammaire : chaque construction du langage doit compiler (ou
//! échouer proprement) sans entrer dans la VM.

use indoc::indoc;

use lox_compiler::{compile, CompileError};
use lox_core::heap::Heap;
use lox_core::module::Module;
use lox_core::object::ObjRef;
use lox_core::table::Table;

fn try_compile(source: &str) -> Result<ObjRef, CompileError> {
    let mut heap = Heap::new();
    let globals = Table::new();
    let mut module = Module::new(None, None);
    compile(source, &mut heap, &globals, &mut module, 0)
}

fn assert_compiles(source: &str) {
    if let Err(e) = try_compile(source) {
        panic!("devrait compiler :\n{source}\n--- diagnostics ---\n{e}");
    }
}

fn first_error(source: &str) -> String {
    match try_compile(source) {
        Ok(_) => panic!("devrait échouer :\n{source}"),
        Err(e) => e.diagnostics[0].message.clone(),
    }
}

#[test]
fn statements_and_declarations() {
    assert_compiles("var a; var b = 1, c = 2; a = b + c;");
    assert_compiles("{ var x = 1; { var x = 2; print x; } print x; }");
    assert_compiles("if (1 < 2) print \"oui\"; else print \"non\";");
    assert_compiles("while (false) { print 1; }");
    assert_compiles("for (;;) { break; }");
    assert_compiles("for (var i = 0; i < 3; i = i + 1) continue;");
    assert_compiles("fun f(a, b, c) { return a + b * c; }");
}

#[test]
fn classes() {
    assert_compiles(indoc! {r#"
        class A {
            init() { this.x = 0; }
            bump() { this.x = this.x + 1; return this; }
        }
        class B < A {
            bump() { super.bump(); return this; }
        }
        var b = B();
        b.bump().bump();
    "#});
}

#[test]
fn collections_and_subscript() {
    assert_compiles("var a = [1, \"deux\", [3]]; print a[0];");
    assert_compiles("var d = {x: 1, y: {z: 2}}; print d[\"x\"]; d[\"y\"] = 3;");
    assert_compiles("var a = []; a.push(1); a[0] = a.pop();");
}

#[test]
fn modules_grammar() {
    assert_compiles("import { a } from \"m.lox\";");
    assert_compiles("import { a as b, c } from \"m.lox\"; print b + c;");
    assert_compiles("var x = 1; export { x };");
    assert_compiles("var x = 1; var y = 2; export { x, y };");
    assert_compiles("export fun f() { return 1; }");
    assert_compiles("export class C { m() { return 2; } }");
    assert_compiles("var z = 3; export z;");
}

#[test]
fn comments_and_escapes() {
    assert_compiles("// ligne\nprint 1; /* bloc /* imbriqué */ encore */ print 2;");
    assert_compiles(r#"print "tab\tnl\ncr\rnul\0b\bf\fq\"fin";"#);
}

#[test]
fn error_messages_match_the_house_style() {
    assert_eq!(first_error("print 1 +;"), "Expect expression.");
    assert_eq!(first_error("var = 1;"), "Expect variable name.");
    assert_eq!(first_error("{ print 1;"), "Expect '}' after block.");
    assert_eq!(first_error("return 1;"), "Can't return from top-level code.");
    assert_eq!(
        first_error("class A { init() { return 1; } }"),
        "Can't return a value from an initializer."
    );
    assert_eq!(
        first_error("fun f() { var x = 1; export { x }; }"),
        "Can't export outside of top-level code."
    );
    assert_eq!(
        first_error("{ var a = 1; var a = 2; }"),
        "Already a variable with this name in this scope."
    );
}

#[test]
fn scanner_errors_surface_with_lines() {
    let err = match try_compile("var a = 1;\nprint \"jamais fermée;") {
        Err(e) => e,
        Ok(_) => panic!("devrait échouer"),
    };
    assert_eq!(err.diagnostics[0].line, 2);
    assert!(err.diagnostics[0].message.contains("Unterminated string."));
}

#[test]
fn too_many_constants_is_reported() {
    // 257 littéraux numériques distincts dans un seul chunk
    let mut src = String::new();
    for i in 0..260 {
        src.push_str(&format!("var v{i} = {i}.5;\n"));
    }
    let err = match try_compile(&src) {
        Err(e) => e,
        Ok(_) => panic!("devrait échouer"),
    };
    assert!(err
        .diagnostics
        .iter()
        .any(|d| d.message.contains("Too many constants in one chunk.")));
}
