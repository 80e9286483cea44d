use crate::tests::{expect_runtime_error, run_source, run_source_stressed};

#[test]
fn test_method_call() {
    let source = r#"
        class A { greet() { print "hi"; } }
        A().greet();
    "#;
    assert_eq!(run_source(source), vec!["hi"]);
}

#[test]
fn test_fields_read_and_write() {
    let source = r#"
        class Box {}
        var b = Box();
        b.contents = "treasure";
        print b.contents;
        b.contents = "dust";
        print b.contents;
    "#;
    assert_eq!(run_source(source), vec!["treasure", "dust"]);
}

#[test]
fn test_initializer_binds_this() {
    let source = r#"
        class Point {
            init(x, y) {
                this.x = x;
                this.y = y;
            }
            sum() { return this.x + this.y; }
        }
        print Point(3, 4).sum();
    "#;
    assert_eq!(run_source(source), vec!["7"]);
}

#[test]
fn test_initializer_returns_the_instance() {
    assert_eq!(
        run_source("class A { init() {} } print A();"),
        vec!["A instance"]
    );
    assert_eq!(
        run_source("class A { init() { return; } } print A();"),
        vec!["A instance"]
    );
}

#[test]
fn test_inherited_method() {
    let source = r#"
        class A { m() { print "from a"; } }
        class B < A {}
        B().m();
    "#;
    assert_eq!(run_source(source), vec!["from a"]);
}

#[test]
fn test_override_and_super_call() {
    let source = r#"
        class A { m() { print "a"; } }
        class B < A {
            m() {
                super.m();
                print "b";
            }
        }
        B().m();
    "#;
    assert_eq!(run_source(source), vec!["a", "b"]);
}

#[test]
fn test_super_in_initializer_chain() {
    let source = r#"
        class A { init(n) { this.n = n; } }
        class B < A {
            init(n) { super.init(n); }
            show() { print this.n; }
        }
        B(7).show();
    "#;
    assert_eq!(run_source(source), vec!["7"]);
}

#[test]
fn test_get_super_without_call_binds_method() {
    let source = r#"
        class A { m() { print "bound"; } }
        class B < A {
            grab() {
                var method = super.m;
                method();
            }
        }
        B().grab();
    "#;
    assert_eq!(run_source(source), vec!["bound"]);
}

#[test]
fn test_super_resolves_statically_not_dynamically() {
    let source = r#"
        class A { m() { print "a"; } }
        class B < A { m() { super.m(); } }
        class C < B {}
        C().m();
    "#;
    // `super` in B::m always means A, even when called on a C instance.
    assert_eq!(run_source(source), vec!["a"]);
}

#[test]
fn test_bound_method_remembers_receiver() {
    let source = r#"
        class Speaker {
            init(word) { this.word = word; }
            say() { print this.word; }
        }
        var hello = Speaker("hello").say;
        var bye = Speaker("bye").say;
        hello();
        bye();
    "#;
    assert_eq!(run_source(source), vec!["hello", "bye"]);
}

#[test]
fn test_field_shadows_method_on_invoke() {
    let source = r#"
        class A {
            m() { print "method"; }
        }
        var a = A();
        fun replacement() { print "field"; }
        a.m = replacement;
        a.m();
    "#;
    assert_eq!(run_source(source), vec!["field"]);
}

#[test]
fn test_methods_compare_by_bound_identity() {
    let source = r#"
        class A { m() {} }
        var a = A();
        var first = a.m;
        var second = a.m;
        print first == second;
    "#;
    // Each property access creates a fresh bound method object.
    assert_eq!(run_source(source), vec!["false"]);
}

#[test]
fn test_class_call_without_init_rejects_arguments() {
    let error = expect_runtime_error("class A {} A(1, 2);");
    assert!(error.message.contains("Expected 0 arguments but got 2."));
}

#[test]
fn test_initializer_arity_is_checked() {
    let error = expect_runtime_error("class A { init(n) {} } A();");
    assert!(error.message.contains("Expected 1 arguments but got 0."));
}

#[test]
fn test_property_access_on_non_instance() {
    let error = expect_runtime_error("var b = true; print b.x;");
    assert!(error.message.contains("Only instances have properties."));

    let error = expect_runtime_error("var b = true; b.x = 1;");
    assert!(error.message.contains("Only instances have fields."));

    let error = expect_runtime_error("\"text\".length();");
    assert!(error.message.contains("Only instances have methods."));
}

#[test]
fn test_undefined_property() {
    let error = expect_runtime_error("class A {} print A().missing;");
    assert!(error.message.contains("Undefined property 'missing'."));

    let error = expect_runtime_error("class A {} A().missing();");
    assert!(error.message.contains("Undefined property 'missing'."));
}

#[test]
fn test_superclass_must_be_a_class() {
    let error = expect_runtime_error("var NotAClass = 1; class B < NotAClass {}");
    assert!(error.message.contains("Superclass must be a class."));
}

#[test]
fn test_instance_cycles_survive_stress_collection() {
    // Two instances referencing each other form a cycle only a tracing
    // collector can reclaim; until then they must stay fully intact.
    let source = r#"
        class Node { init(name) { this.name = name; } }
        var a = Node("a");
        var b = Node("b");
        a.next = b;
        b.next = a;
        print a.next.name;
        print b.next.name;
        print a.next.next.name;
    "#;
    assert_eq!(run_source_stressed(source), vec!["b", "a", "a"]);
}
