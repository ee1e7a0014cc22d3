use pretty_assertions::assert_eq;
use serde_json::json;

use super::render_template;
use crate::Context;

fn render(content: &str) -> String {
    render_template(content, &Context::new()).unwrap()
}

fn render_with(content: &str, pairs: Vec<(&str, serde_json::Value)>) -> String {
    let mut context = Context::new();
    for (key, value) in pairs {
        context.insert(key, &value);
    }
    render_template(content, &context).unwrap()
}

#[test]
fn render_variables() {
    let inputs = vec![
        ("{{ name }}", "john"),
        ("{{ name }} doe", "john doe"),
        ("{{ 1 + 1 }}", "2"),
        ("{{ 2 + 2.0 }}", "4.0"),
        ("{{ 7 // 2 }}", "3"),
        ("{{ 7 % 2 }}", "1"),
        ("{{ 2 ** 8 }}", "256"),
        ("{{ 6 / 4 }}", "1.5"),
        ("{{ \"a\" ~ 1 ~ true }}", "a1true"),
        ("{{ 1 == 1.0 }}", "true"),
        ("{{ 1 < 2 <= 2 }}", "true"),
        ("{{ not false }}", "true"),
        ("{{ 1 if false else 2 }}", "2"),
        ("{{ none ?? \"fallback\" }}", "fallback"),
        ("{{ name ?? \"nobody\" }}", "john"),
    ];
    for (input, expected) in inputs {
        assert_eq!(render_with(input, vec![("name", json!("john"))]), expected, "{}", input);
    }
}

#[test]
fn render_escaped_by_default() {
    assert_eq!(
        render_with("Hello, {{ name }}!", vec![("name", json!("<script>"))]),
        "Hello, &lt;script&gt;!"
    );
}

#[test]
fn render_safe_filter_skips_escaping() {
    assert_eq!(
        render_with("{{ markup | safe }}", vec![("markup", json!("<b>hi</b>"))]),
        "<b>hi</b>"
    );
}

#[test]
fn render_numbers_skip_escaping() {
    assert_eq!(render_with("{{ n }}", vec![("n", json!(42))]), "42");
    assert_eq!(render_with("{{ b }}", vec![("b", json!(true))]), "true");
}

#[test]
fn render_escape_filter_marks_safe() {
    // escaping twice produces the same output as once
    assert_eq!(
        render_with("{{ v | escape }}", vec![("v", json!("<b>"))]),
        "&lt;b&gt;"
    );
}

#[test]
fn render_dotted_paths_subscript_first() {
    // `items` resolves to the context key, never a method
    assert_eq!(
        render_with("{{ data.items.0 }}", vec![("data", json!({"items": ["first"]}))]),
        "first"
    );
    assert_eq!(
        render_with("{{ data[\"a key\"] }}", vec![("data", json!({"a key": "v"}))]),
        "v"
    );
    assert_eq!(render_with("{{ items[-1] }}", vec![("items", json!([1, 2, 3]))]), "3");
}

#[test]
fn render_optional_chain() {
    assert_eq!(
        render_with("{{ user?.name ?? \"anonymous\" }}", vec![("user", json!(null))]),
        "anonymous"
    );
    assert_eq!(
        render_with("{{ user?.name ?? \"anonymous\" }}", vec![("user", json!({"name": "ada"}))]),
        "ada"
    );
}

#[test]
fn render_pipeline() {
    assert_eq!(render("{{ \" hello \" |> trim |> upper }}"), "HELLO");
    assert_eq!(render("{{ \"x\" | center(5) }}"), "  x  ");
    assert_eq!(
        render_with("{{ words | join(\", \") }}", vec![("words", json!(["a", "b"]))]),
        "a, b"
    );
}

#[test]
fn render_default_filter_on_undefined_and_null() {
    assert_eq!(render("{{ missing | default(\"d\") }}"), "d");
    assert_eq!(render_with("{{ v | default(\"d\") }}", vec![("v", json!(null))]), "d");
    assert_eq!(render_with("{{ v | default(\"d\") }}", vec![("v", json!(""))]), "");
}

#[test]
fn render_tests() {
    assert_eq!(render_with("{{ x is odd }}", vec![("x", json!(3))]), "true");
    assert_eq!(render_with("{{ x is not even }}", vec![("x", json!(3))]), "true");
    assert_eq!(render("{{ missing is defined }}"), "false");
    assert_eq!(render("{{ missing is undefined }}"), "true");
    assert_eq!(render_with("{{ x is divisibleby 3 }}", vec![("x", json!(9))]), "true");
}

#[test]
fn render_if_branches() {
    let template = "{% if x > 2 %}big{% elif x > 0 %}small{% else %}neg{% endif %}";
    assert_eq!(render_with(template, vec![("x", json!(5))]), "big");
    assert_eq!(render_with(template, vec![("x", json!(1))]), "small");
    assert_eq!(render_with(template, vec![("x", json!(-1))]), "neg");
}

#[test]
fn render_undefined_is_falsy_in_conditions() {
    assert_eq!(render("{% if missing %}yes{% else %}no{% end %}"), "no");
}

#[test]
fn render_for_loop_basics() {
    assert_eq!(
        render_with("{% for i in items %}{{ i }},{% end %}", vec![("items", json!([1, 2, 3]))]),
        "1,2,3,"
    );
    assert_eq!(
        render_with(
            "{% for k, v in data %}{{ k }}={{ v }};{% end %}",
            vec![("data", json!({"a": 1, "b": 2}))],
        ),
        "a=1;b=2;"
    );
}

#[test]
fn render_loop_object() {
    assert_eq!(
        render_with(
            "{% for i in items %}{{ loop.index }}/{{ loop.length }}{% if not loop.last %} {% end %}{% end %}",
            vec![("items", json!(["a", "b", "c"]))],
        ),
        "1/3 2/3 3/3"
    );
    assert_eq!(
        render_with(
            "{% for i in items %}{{ loop.revindex0 }}{% end %}",
            vec![("items", json!([10, 20, 30]))],
        ),
        "210"
    );
    assert_eq!(
        render_with(
            "{% for i in items %}{{ loop.previtem ?? \"-\" }}{{ loop.nextitem ?? \"-\" }},{% end %}",
            vec![("items", json!([1, 2]))],
        ),
        "-2,1-,"
    );
}

#[test]
fn render_loop_cycle() {
    assert_eq!(
        render_with(
            "{% for i in items %}{{ loop.cycle(\"odd\", \"even\") }} {% end %}",
            vec![("items", json!([1, 2, 3]))],
        ),
        "odd even odd "
    );
}

#[test]
fn render_for_with_inline_condition() {
    assert_eq!(
        render_with(
            "{% for i in items if i % 2 == 0 %}{{ i }}{% end %}",
            vec![("items", json!([1, 2, 3, 4]))],
        ),
        "24"
    );
}

#[test]
fn render_for_else() {
    assert_eq!(
        render_with("{% for i in items %}{{ i }}{% else %}empty{% end %}", vec![("items", json!([]))]),
        "empty"
    );
}

#[test]
fn render_break_and_continue() {
    assert_eq!(
        render_with(
            "{% for i in items %}{% if i == 3 %}{% break %}{% end %}{{ i }}{% end %}",
            vec![("items", json!([1, 2, 3, 4]))],
        ),
        "12"
    );
    assert_eq!(
        render_with(
            "{% for i in items %}{% if i == 2 %}{% continue %}{% end %}{{ i }}{% end %}",
            vec![("items", json!([1, 2, 3]))],
        ),
        "13"
    );
}

#[test]
fn render_recursive_loop() {
    let context = json!([
        {"name": "a", "children": [{"name": "a1", "children": []}]},
        {"name": "b", "children": []}
    ]);
    assert_eq!(
        render_with(
            "{% for node in tree recursive %}{{ node.name }}({{ loop.depth }}){{ loop(node.children) }}{% end %}",
            vec![("tree", context)],
        ),
        "a(1)a1(2)b(1)"
    );
}

#[test]
fn render_while_loop() {
    assert_eq!(
        render(
            "{% set n = 0 %}{% while n < 3 %}{{ n }}{% set n = n + 1 %}{% end %}"
        ),
        "012"
    );
}

#[test]
fn render_while_with_break() {
    assert_eq!(
        render("{% set n = 0 %}{% while true %}{{ n }}{% set n = n + 1 %}{% if n == 2 %}{% break %}{% end %}{% end %}"),
        "01"
    );
}

#[test]
fn render_match() {
    let template = r#"{% match s %}{% case "a" %}A{% case "b" if strict %}B{% case _ %}?{% end %}"#;
    assert_eq!(
        render_with(template, vec![("s", json!("a")), ("strict", json!(true))]),
        "A"
    );
    assert_eq!(
        render_with(template, vec![("s", json!("b")), ("strict", json!(false))]),
        "?"
    );
    assert_eq!(
        render_with(template, vec![("s", json!("z")), ("strict", json!(true))]),
        "?"
    );
}

#[test]
fn render_set_survives_loops_let_does_not() {
    assert_eq!(
        render_with(
            "{% for i in items %}{% set last = i %}{% end %}{{ last }}",
            vec![("items", json!([1, 2, 3]))],
        ),
        "3"
    );
    let err = render_template(
        "{% for i in items %}{% let x = i %}{% end %}{{ x }}",
        &Context::from_serialize(json!({"items": [1]})).unwrap(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("`x`"), "got: {}", err);
}

#[test]
fn render_with_block_scopes() {
    assert_eq!(render("{% with a=1, b=2 %}{{ a + b }}{% end %}"), "3");
    let err = render_template("{% with a=1 %}{% end %}{{ a }}", &Context::new()).unwrap_err();
    assert!(err.to_string().contains("`a`"));
}

#[test]
fn render_capture() {
    assert_eq!(
        render("{% capture greeting %}hi there{% end %}{{ greeting | upper }}"),
        "HI THERE"
    );
}

#[test]
fn render_do_discards() {
    assert_eq!(render("{% do 1 + 1 %}done"), "done");
}

#[test]
fn render_raw() {
    assert_eq!(render("{% raw %}{{ not rendered }}{% endraw %}"), "{{ not rendered }}");
}

#[test]
fn render_spaceless() {
    assert_eq!(
        render("{% spaceless %}<ul>\n  <li>a</li>\n</ul>{% end %}"),
        "<ul><li>a</li></ul>"
    );
}

#[test]
fn render_filter_section() {
    assert_eq!(render("{% filter upper %}shout{% end %}"), "SHOUT");
    assert_eq!(render("{% filter trim | upper %}  pad  {% end %}"), "PAD");
}

#[test]
fn render_range_and_slice() {
    assert_eq!(render("{% for i in 1..4 %}{{ i }}{% end %}"), "123");
    assert_eq!(
        render_with("{{ items[1:3] | join(\"-\") }}", vec![("items", json!([0, 1, 2, 3]))]),
        "1-2"
    );
    assert_eq!(
        render_with(
            "{{ items | slice(end=-1) | join(\"-\") }}",
            vec![("items", json!([0, 1, 2, 3]))],
        ),
        "0-1-2"
    );
    assert_eq!(render_with("{{ s[1:4] }}", vec![("s", json!("hello"))]), "ell");
}

#[test]
fn render_in_operator() {
    assert_eq!(render_with("{{ 2 in items }}", vec![("items", json!([1, 2]))]), "true");
    assert_eq!(render("{{ \"ell\" in \"hello\" }}"), "true");
    assert_eq!(render_with("{{ \"k\" in obj }}", vec![("obj", json!({"k": 1}))]), "true");
}

#[test]
fn render_range_function() {
    assert_eq!(render("{% for i in range(end=3) %}{{ i }}{% end %}"), "012");
}

#[test]
fn render_context_dump() {
    let out = render_with("{{ __kida_context }}", vec![("a", json!(1))]);
    assert!(out.contains("&quot;a&quot;"), "got: {}", out);
}

#[test]
fn render_does_not_mutate_context() {
    let mut context = Context::new();
    context.insert("x", &1);
    let before = context.clone();
    render_template("{% set x = 99 %}{% set y = 1 %}{{ x }}{{ y }}", &context).unwrap();
    assert_eq!(context, before);
}

#[test]
fn render_coalescing_is_invisible() {
    // the same template with coalescing on and off renders identically
    let source = "a{{ 1 }}b{{ \"c\" | upper }}d{{ name }}e";
    let mut context = Context::new();
    context.insert("name", "x");

    let default_env = crate::Environment::default();
    let mut config = crate::EnvConfig::default();
    config.coalesce_output = false;
    let plain_env = crate::Environment::with_config(crate::MapLoader::new(), config);

    assert_eq!(
        default_env.render_str(source, &context).unwrap(),
        plain_env.render_str(source, &context).unwrap(),
    );
}

#[test]
fn render_optimizer_is_invisible() {
    // constant folding and dead-code elimination don't change output
    let source =
        "{{ 1 + 2 * 3 }}|{% if false %}dead{% else %}alive{% end %}|{{ \"a\" ~ \"b\" | upper }}";
    assert_eq!(render(source), "7|alive|aB");
}
