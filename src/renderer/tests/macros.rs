use pretty_assertions::assert_eq;

use super::{env_with_templates, render_template};
use crate::Context;

fn render(content: &str) -> String {
    render_template(content, &Context::new()).unwrap()
}

#[test]
fn define_and_call_macro() {
    assert_eq!(
        render("{% def hello(name) %}Hello {{ name }}!{% end %}{{ hello(\"ada\") }}"),
        "Hello ada!"
    );
}

#[test]
fn macro_output_is_not_reescaped() {
    assert_eq!(
        render("{% def tag(t) %}<{{ t }}>{% end %}{{ tag(\"b\") }}"),
        "<b>"
    );
}

#[test]
fn macro_defaults_and_kwargs() {
    let template = concat!(
        "{% def pill(label, color=\"gray\") %}{{ label }}:{{ color }}{% end %}",
        "{{ pill(\"a\") }} {{ pill(\"b\", color=\"red\") }} {{ pill(label=\"c\") }}",
    );
    assert_eq!(render(template), "a:gray b:red c:gray");
}

#[test]
fn macro_varargs_and_kwarg_catchall() {
    let template = concat!(
        "{% def spread(first, *rest, **opts) %}",
        "{{ first }}/{{ rest | join(\",\") }}/{{ opts.mode ?? \"-\" }}",
        "{% end %}",
        "{{ spread(1, 2, 3, mode=\"x\") }}",
    );
    assert_eq!(render(template), "1/2,3/x");
}

#[test]
fn macro_missing_required_errors() {
    let err = render_template(
        "{% def m(a) %}{{ a }}{% end %}{{ m() }}",
        &Context::new(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("missing the required parameter `a`"), "got: {}", err);
}

#[test]
fn macro_unknown_kwarg_errors() {
    let err = render_template(
        "{% def m(a) %}{{ a }}{% end %}{{ m(1, wat=2) }}",
        &Context::new(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("unexpected keyword argument `wat`"), "got: {}", err);
}

#[test]
fn macros_do_not_see_caller_locals() {
    let err = render_template(
        "{% set secret = 1 %}{% def peek() %}{{ secret }}{% end %}{{ peek() }}",
        &Context::new(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("`secret`"), "got: {}", err);
}

#[test]
fn macros_see_the_user_context() {
    let mut context = Context::new();
    context.insert("site_name", "kida");
    assert_eq!(
        render_template("{% def head() %}{{ site_name }}{% end %}{{ head() }}", &context)
            .unwrap(),
        "kida"
    );
}

#[test]
fn import_namespaced_macros() {
    let env = env_with_templates(vec![
        ("macros.html", "{% def button(label) %}<button>{{ label }}</button>{% end %}"),
        ("page.html", "{% import \"macros.html\" as ui %}{{ ui.button(\"Go\") }}"),
    ]);
    assert_eq!(env.render("page.html", &Context::new()).unwrap(), "<button>Go</button>");
}

#[test]
fn from_import_with_alias() {
    let env = env_with_templates(vec![
        ("macros.html", "{% def button(label) %}[{{ label }}]{% end %}"),
        ("page.html", "{% from \"macros.html\" import button as btn %}{{ btn(\"x\") }}"),
    ]);
    assert_eq!(env.render("page.html", &Context::new()).unwrap(), "[x]");
}

#[test]
fn import_exposes_exports() {
    let env = env_with_templates(vec![
        ("lib.html", "{% export version = \"1.2\" %}"),
        ("page.html", "{% import \"lib.html\" as lib %}v{{ lib.version }}"),
    ]);
    assert_eq!(env.render("page.html", &Context::new()).unwrap(), "v1.2");
}

#[test]
fn from_import_exports_by_name() {
    let env = env_with_templates(vec![
        ("lib.html", "{% export version = \"2.0\" %}"),
        ("page.html", "{% from \"lib.html\" import version %}{{ version }}"),
    ]);
    assert_eq!(env.render("page.html", &Context::new()).unwrap(), "2.0");
}

#[test]
fn from_import_unknown_name_errors() {
    let env = env_with_templates(vec![
        ("lib.html", ""),
        ("page.html", "{% from \"lib.html\" import nope %}"),
    ]);
    let err = env.render("page.html", &Context::new()).unwrap_err();
    assert!(err.to_string().contains("no macro or export named `nope`"), "got: {}", err);
}

#[test]
fn call_block_passes_caller() {
    let template = concat!(
        "{% def list_item(n) %}<li data-n=\"{{ n }}\">{{ caller() }}</li>{% end %}",
        "{% call list_item(3) %}three{% end %}",
    );
    assert_eq!(render(template), "<li data-n=\"3\">three</li>");
}

#[test]
fn caller_outside_call_errors() {
    let err = render_template(
        "{% def m() %}{{ caller() }}{% end %}{{ m() }}",
        &Context::new(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("caller"), "got: {}", err);
}

#[test]
fn macros_call_sibling_macros() {
    let env = env_with_templates(vec![
        (
            "macros.html",
            "{% def inner(x) %}<{{ x }}>{% end %}{% def outer(x) %}o{{ inner(x) }}o{% end %}",
        ),
        ("page.html", "{% import \"macros.html\" as m %}{{ m.outer(\"i\") }}"),
    ]);
    assert_eq!(env.render("page.html", &Context::new()).unwrap(), "o<i>o");
}

#[test]
fn parent_template_macros_are_callable() {
    let env = env_with_templates(vec![
        (
            "base.html",
            "{% def chrome(t) %}[{{ t }}]{% end %}{% block body %}{% end %}",
        ),
        (
            "child.html",
            "{% extends \"base.html\" %}{% block body %}{{ chrome(\"x\") }}{% end %}",
        ),
    ]);
    assert_eq!(env.render("child.html", &Context::new()).unwrap(), "[x]");
}

#[test]
fn macro_defaults_evaluated_at_call_time() {
    let mut context = Context::new();
    context.insert("fallback", "ctx");
    assert_eq!(
        render_template(
            "{% def m(v=fallback) %}{{ v }}{% end %}{{ m() }}",
            &context,
        )
        .unwrap(),
        "ctx"
    );
}
