use crate::parser::ast::*;
use crate::parser::parse;

fn parse_ok(source: &str) -> Template {
    parse(source).unwrap()
}

fn first_expr(source: &str) -> Expr {
    match parse_ok(source).remove(0) {
        Node::Output(_, expr) => expr,
        other => panic!("expected an output node, got {:?}", other),
    }
}

#[test]
fn parse_empty_template() {
    assert!(parse_ok("").is_empty());
}

#[test]
fn parse_data_only() {
    let ast = parse_ok("hello");
    assert_eq!(ast, vec![Node::Data(crate::SourcePos::new(1, 1), "hello".to_string())]);
}

#[test]
fn parse_literals() {
    assert_eq!(first_expr("{{ 1 }}").val, ExprVal::Int(1));
    assert_eq!(first_expr("{{ 3.14 }}").val, ExprVal::Float(3.14));
    assert_eq!(first_expr("{{ -1 }}").val, ExprVal::Int(-1));
    assert_eq!(first_expr("{{ \"hi\" }}").val, ExprVal::Str("hi".to_string()));
    assert_eq!(first_expr("{{ true }}").val, ExprVal::Bool(true));
    assert_eq!(first_expr("{{ none }}").val, ExprVal::Null);
}

#[test]
fn parse_collections() {
    match first_expr("{{ [1, 2, 3] }}").val {
        ExprVal::List(items) => assert_eq!(items.len(), 3),
        other => panic!("expected a list, got {:?}", other),
    }
    match first_expr("{{ (1, 2) }}").val {
        ExprVal::Tuple(items) => assert_eq!(items.len(), 2),
        other => panic!("expected a tuple, got {:?}", other),
    }
    match first_expr("{{ {\"a\": 1} }}").val {
        ExprVal::Dict(entries) => assert_eq!(entries.len(), 1),
        other => panic!("expected a dict, got {:?}", other),
    }
}

#[test]
fn parse_math_precedence() {
    // 1 + 2 * 3 parses as 1 + (2 * 3)
    match first_expr("{{ 1 + 2 * 3 }}").val {
        ExprVal::Math(MathExpr { operator: MathOperator::Add, rhs, .. }) => {
            assert!(matches!(
                rhs.val,
                ExprVal::Math(MathExpr { operator: MathOperator::Mul, .. })
            ));
        }
        other => panic!("expected an add at the top, got {:?}", other),
    }
}

#[test]
fn parse_power_is_right_associative() {
    // 2 ** 3 ** 2 parses as 2 ** (3 ** 2)
    match first_expr("{{ 2 ** 3 ** 2 }}").val {
        ExprVal::Math(MathExpr { operator: MathOperator::Pow, rhs, .. }) => {
            assert!(matches!(
                rhs.val,
                ExprVal::Math(MathExpr { operator: MathOperator::Pow, .. })
            ));
        }
        other => panic!("expected a pow at the top, got {:?}", other),
    }
}

#[test]
fn parse_comparison_chain() {
    match first_expr("{{ 1 < x <= 3 }}").val {
        ExprVal::Compare(compare) => {
            assert_eq!(compare.comparisons.len(), 2);
            assert_eq!(compare.comparisons[0].0, CompareOperator::Lt);
            assert_eq!(compare.comparisons[1].0, CompareOperator::Lte);
        }
        other => panic!("expected a comparison, got {:?}", other),
    }
}

#[test]
fn parse_not_in() {
    match first_expr("{{ a not in b }}").val {
        ExprVal::Compare(compare) => {
            assert_eq!(compare.comparisons[0].0, CompareOperator::NotIn);
        }
        other => panic!("expected a comparison, got {:?}", other),
    }
}

#[test]
fn parse_logic_and_not() {
    match first_expr("{{ not a and b or c }}").val {
        ExprVal::Logic(LogicExpr { operator: LogicOperator::Or, lhs, .. }) => {
            assert!(matches!(
                lhs.val,
                ExprVal::Logic(LogicExpr { operator: LogicOperator::And, .. })
            ));
        }
        other => panic!("expected `or` at the top, got {:?}", other),
    }
}

#[test]
fn parse_filters_both_pipes() {
    let expr = first_expr("{{ \" x \" |> trim | upper }}");
    assert_eq!(expr.filters.len(), 2);
    assert_eq!(expr.filters[0].name, "trim");
    assert_eq!(expr.filters[1].name, "upper");
}

#[test]
fn parse_filter_args() {
    let expr = first_expr("{{ name | truncate(20, end=\"...\") }}");
    let filter = &expr.filters[0];
    assert_eq!(filter.name, "truncate");
    assert_eq!(filter.args.len(), 1);
    assert!(filter.kwargs.contains_key("end"));
}

#[test]
fn parse_getattr_and_getitem() {
    match first_expr("{{ page.meta[\"title\"] }}").val {
        ExprVal::Getitem { value, .. } => {
            assert!(matches!(value.val, ExprVal::Getattr { .. }));
        }
        other => panic!("expected a subscript, got {:?}", other),
    }
    match first_expr("{{ items.0 }}").val {
        ExprVal::Getattr { attr, .. } => assert_eq!(attr, "0"),
        other => panic!("expected an attr access, got {:?}", other),
    }
}

#[test]
fn parse_optional_chain_and_null_coalesce() {
    match first_expr("{{ user?.name ?? \"anonymous\" }}").val {
        ExprVal::NullCoalesce { left, .. } => {
            assert!(matches!(left.val, ExprVal::OptionalChain { .. }));
        }
        other => panic!("expected `??` at the top, got {:?}", other),
    }
}

#[test]
fn parse_slice() {
    match first_expr("{{ items[1:3] }}").val {
        ExprVal::Slice { lower, upper, step, .. } => {
            assert!(lower.is_some());
            assert!(upper.is_some());
            assert!(step.is_none());
        }
        other => panic!("expected a slice, got {:?}", other),
    }
    assert!(matches!(first_expr("{{ items[::2] }}").val, ExprVal::Slice { .. }));
}

#[test]
fn parse_ternary() {
    match first_expr("{{ a if cond else b }}").val {
        ExprVal::Conditional { if_false, .. } => assert!(if_false.is_some()),
        other => panic!("expected a conditional, got {:?}", other),
    }
}

#[test]
fn parse_test_expression() {
    match first_expr("{{ x is odd }}").val {
        ExprVal::Test(test) => {
            assert_eq!(test.name, "odd");
            assert!(!test.negated);
        }
        other => panic!("expected a test, got {:?}", other),
    }
    match first_expr("{{ x is not divisibleby(3) }}").val {
        ExprVal::Test(test) => {
            assert_eq!(test.name, "divisibleby");
            assert!(test.negated);
            assert_eq!(test.args.len(), 1);
        }
        other => panic!("expected a test, got {:?}", other),
    }
}

#[test]
fn parse_await_expression() {
    match first_expr("{{ await fetch_data() }}").val {
        ExprVal::Await(inner) => {
            assert!(matches!(inner.val, ExprVal::FunctionCall(_)));
        }
        other => panic!("expected an await, got {:?}", other),
    }
}

#[test]
fn parse_namespaced_call() {
    match first_expr("{{ m.button(\"ok\") }}").val {
        ExprVal::FunctionCall(call) => {
            assert_eq!(call.namespace.as_deref(), Some("m"));
            assert_eq!(call.name, "button");
            assert_eq!(call.args.len(), 1);
        }
        other => panic!("expected a call, got {:?}", other),
    }
}

#[test]
fn parse_super_becomes_node() {
    let ast = parse_ok("{% block a %}{{ super() }}{% end %}");
    let Node::Block(_, block, _) = &ast[0] else { panic!("expected a block") };
    assert_eq!(block.body, vec![Node::Super]);
}

#[test]
fn parse_if_elif_else() {
    let ast = parse_ok("{% if a %}1{% elif b %}2{% else %}3{% endif %}");
    let Node::If(if_node, _) = &ast[0] else { panic!("expected an if") };
    assert_eq!(if_node.conditions.len(), 2);
    assert!(if_node.otherwise.is_some());
}

#[test]
fn parse_for_full_form() {
    let ast = parse_ok("{% for k, v in items if v > 1 recursive %}x{% else %}none{% end %}");
    let Node::Forloop(_, forloop, _) = &ast[0] else { panic!("expected a for") };
    assert_eq!(forloop.key.as_deref(), Some("k"));
    assert_eq!(forloop.value, "v");
    assert!(forloop.condition.is_some());
    assert!(forloop.recursive);
    assert!(forloop.empty_body.is_some());
    assert!(!forloop.is_async);
}

#[test]
fn parse_async_for() {
    let ast = parse_ok("{% async for x in stream() %}{{ x }}{% end %}");
    let Node::Forloop(_, forloop, _) = &ast[0] else { panic!("expected a for") };
    assert!(forloop.is_async);
}

#[test]
fn parse_while() {
    let ast = parse_ok("{% while x < 3 %}x{% endwhile %}");
    assert!(matches!(ast[0], Node::While(..)));
}

#[test]
fn parse_match_with_guard_and_wildcard() {
    let ast = parse_ok(
        "{% match status %}{% case \"ok\" if verbose %}fine{% case \"err\" %}bad{% case _ %}?{% end %}",
    );
    let Node::Match(_, match_block, _) = &ast[0] else { panic!("expected a match") };
    assert_eq!(match_block.cases.len(), 3);
    assert!(match_block.cases[0].guard.is_some());
    assert!(matches!(match_block.cases[2].pattern, CasePattern::Wildcard));
}

#[test]
fn parse_set_let_export() {
    let ast = parse_ok("{% set a = 1 %}{% let b = 2 %}{% export c = 3 %}");
    let scopes: Vec<SetScope> = ast
        .iter()
        .map(|n| match n {
            Node::Set(_, set) => set.scope,
            other => panic!("expected a set, got {:?}", other),
        })
        .collect();
    assert_eq!(scopes, vec![SetScope::Leak, SetScope::Local, SetScope::Export]);
}

#[test]
fn parse_block_flags() {
    let ast = parse_ok("{% block nav scoped required %}{% endblock nav %}");
    let Node::Block(_, block, _) = &ast[0] else { panic!("expected a block") };
    assert!(block.scoped);
    assert!(block.required);
}

#[test]
fn parse_include_variants() {
    let ast = parse_ok("{% include \"a.html\" ignore missing without context %}");
    let Node::Include(_, include) = &ast[0] else { panic!("expected an include") };
    assert!(include.ignore_missing);
    assert!(!include.with_context);
}

#[test]
fn parse_imports() {
    let ast = parse_ok("{% import \"m.html\" as m %}{% from \"m.html\" import a, b as c %}");
    let Node::Import(_, import) = &ast[0] else { panic!("expected an import") };
    assert_eq!(import.target, "m");
    let Node::FromImport(_, from) = &ast[1] else { panic!("expected a from-import") };
    assert_eq!(
        from.names,
        vec![("a".to_string(), None), ("b".to_string(), Some("c".to_string()))]
    );
}

#[test]
fn parse_def_signature() {
    let ast =
        parse_ok("{% def card(title, level: int, width=3, *rest, **options) %}x{% enddef %}");
    let Node::MacroDefinition(_, def, _) = &ast[0] else { panic!("expected a def") };
    assert_eq!(def.name, "card");
    assert_eq!(def.params.len(), 3);
    assert_eq!(def.params[1].annotation.as_deref(), Some("int"));
    assert!(def.params[2].default.is_some());
    assert_eq!(def.vararg.as_deref(), Some("rest"));
    assert_eq!(def.kwarg.as_deref(), Some("options"));
}

#[test]
fn parse_call_capture_cache_filter_slot_embed_spaceless() {
    let ast = parse_ok(concat!(
        "{% call item(3) %}body{% end %}",
        "{% capture x %}y{% end %}",
        "{% cache \"k\" ttl=30 %}z{% end %}",
        "{% filter upper | trim %}w{% end %}",
        "{% slot title %}default{% end %}",
        "{% embed \"card.html\" %}{% block a %}b{% end %}{% end %}",
        "{% spaceless %}<b> </b>{% end %}",
    ));
    assert!(matches!(ast[0], Node::CallBlock(..)));
    assert!(matches!(ast[1], Node::Capture(..)));
    let Node::Cache(_, cache, _) = &ast[2] else { panic!("expected a cache") };
    assert!(cache.ttl.is_some());
    let Node::FilterSection(_, section, _) = &ast[3] else { panic!("expected a filter section") };
    assert_eq!(section.filters.len(), 2);
    assert!(matches!(ast[4], Node::Slot(..)));
    assert!(matches!(ast[5], Node::Embed(..)));
    assert!(matches!(ast[6], Node::Spaceless(..)));
}

#[test]
fn parse_raw_keeps_content() {
    let ast = parse_ok("{% raw %}{{ untouched }}{% endraw %}");
    let Node::Raw(_, _, content, _) = &ast[0] else { panic!("expected a raw") };
    assert_eq!(content, "{{ untouched }}");
}

#[test]
fn parse_universal_end_everywhere() {
    for source in [
        "{% if a %}x{% end %}",
        "{% for i in xs %}x{% end %}",
        "{% while a %}x{% end %}",
        "{% block b %}x{% end %}",
        "{% def m() %}x{% end %}",
        "{% with a=1 %}x{% end %}",
    ] {
        assert!(parse(source).is_ok(), "source: {}", source);
    }
}

#[test]
fn parse_is_deterministic() {
    let source = "{% for i in items %}{{ i | upper }}{% if i is odd %}!{% end %}{% end %}";
    assert_eq!(parse_ok(source), parse_ok(source));
}

#[test]
fn parse_whitespace_control_trims_data() {
    let ast = parse_ok("a   {%- if x -%}   b   {%- endif %}");
    assert_eq!(ast[0], Node::Data(crate::SourcePos::new(1, 1), "a".to_string()));
    let Node::If(if_node, _) = &ast[1] else { panic!("expected an if") };
    let Node::Data(_, text) = &if_node.conditions[0].2[0] else { panic!("expected data") };
    assert_eq!(text, "b");
}

#[test]
fn parse_for_else_whitespace_control() {
    let ast = parse_ok("{% for i in xs %} a {%- else -%} b {% end %}");
    let Node::Forloop(_, forloop, _) = &ast[0] else { panic!("expected a for") };
    let Node::Data(_, body_text) = &forloop.body[0] else { panic!("expected data") };
    assert_eq!(body_text, " a");
    let Node::Data(_, else_text) = &forloop.empty_body.as_ref().unwrap()[0] else {
        panic!("expected data")
    };
    assert_eq!(else_text, "b ");
}
