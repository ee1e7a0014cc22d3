use pretty_assertions::assert_eq;

use super::env_with_templates;
use crate::{Context, ErrorKind};

#[test]
fn simple_extends_with_block_override() {
    let env = env_with_templates(vec![
        ("base.html", "<body>{% block body %}{% end %}</body>"),
        (
            "child.html",
            "{% extends \"base.html\" %}{% block body %}{% for i in items %}<li>{{ i }}</li>{% end %}{% end %}",
        ),
    ]);
    let mut context = Context::new();
    context.insert("items", &vec!["a", "b"]);

    assert_eq!(
        env.render("child.html", &context).unwrap(),
        "<body><li>a</li><li>b</li></body>"
    );
}

#[test]
fn block_default_renders_without_override() {
    let env = env_with_templates(vec![
        ("base.html", "{% block title %}Untitled{% end %}"),
        ("child.html", "{% extends \"base.html\" %}"),
    ]);
    assert_eq!(env.render("child.html", &Context::new()).unwrap(), "Untitled");
}

#[test]
fn three_level_chain_with_super() {
    let env = env_with_templates(vec![
        ("grandparent.html", "{% block hey %}hello{% end %}"),
        (
            "parent.html",
            "{% extends \"grandparent.html\" %}{% block hey %}hi and grandma says {{ super() }}{% end %}",
        ),
        (
            "child.html",
            "{% extends \"parent.html\" %}{% block hey %}dad says {{ super() }}{% end %}",
        ),
    ]);
    assert_eq!(
        env.render("child.html", &Context::new()).unwrap(),
        "dad says hi and grandma says hello"
    );
}

#[test]
fn super_without_parent_block_errors() {
    let env = env_with_templates(vec![("solo.html", "{% block a %}{{ super() }}{% end %}")]);
    let err = env.render("solo.html", &Context::new()).unwrap_err();
    assert!(err.to_string().contains("no parent block"), "got: {}", err);
}

#[test]
fn required_block_must_be_overridden() {
    let env = env_with_templates(vec![
        ("base.html", "{% block title required %}{% end %}"),
        ("good.html", "{% extends \"base.html\" %}{% block title %}Home{% end %}"),
        ("bad.html", "{% extends \"base.html\" %}"),
    ]);
    assert_eq!(env.render("good.html", &Context::new()).unwrap(), "Home");
    let err = env.render("bad.html", &Context::new()).unwrap_err();
    assert!(err.to_string().contains("required"), "got: {}", err);
}

#[test]
fn include_sees_context_and_locals() {
    let env = env_with_templates(vec![
        ("partial.html", "{{ greeting }} {{ name }}"),
        ("main.html", "{% set greeting = \"hello\" %}{% include \"partial.html\" %}"),
    ]);
    let mut context = Context::new();
    context.insert("name", "world");
    assert_eq!(env.render("main.html", &context).unwrap(), "hello world");
}

#[test]
fn include_without_context() {
    let env = env_with_templates(vec![
        ("partial.html", "{% if name is defined %}{{ name }}{% else %}isolated{% end %}"),
        ("main.html", "{% include \"partial.html\" without context %}"),
    ]);
    let mut context = Context::new();
    context.insert("name", "world");
    assert_eq!(env.render("main.html", &context).unwrap(), "isolated");
}

#[test]
fn include_ignore_missing() {
    let env = env_with_templates(vec![(
        "main.html",
        "a{% include \"nope.html\" ignore missing %}b",
    )]);
    assert_eq!(env.render("main.html", &Context::new()).unwrap(), "ab");

    let env = env_with_templates(vec![("main.html", "{% include \"nope.html\" %}")]);
    let err = env.render("main.html", &Context::new()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::TemplateNotFound(_)));
}

#[test]
fn include_set_does_not_leak_back() {
    let env = env_with_templates(vec![
        ("partial.html", "{% set inner = 1 %}"),
        ("main.html", "{% include \"partial.html\" %}{{ inner is defined }}"),
    ]);
    assert_eq!(env.render("main.html", &Context::new()).unwrap(), "false");
}

#[test]
fn circular_include_hits_depth_guard() {
    let env = env_with_templates(vec![("a.html", "x{% include \"a.html\" %}")]);
    let err = env.render("a.html", &Context::new()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("include depth"), "got: {}", msg);
    assert!(msg.contains("circular includes"), "got: {}", msg);
}

#[test]
fn circular_extends_hits_depth_guard() {
    let env = env_with_templates(vec![
        ("a.html", "{% extends \"b.html\" %}"),
        ("b.html", "{% extends \"a.html\" %}"),
    ]);
    let err = env.render("a.html", &Context::new()).unwrap_err();
    assert!(err.to_string().contains("include depth"), "got: {}", err);
}

#[test]
fn dynamic_extends_name() {
    let env = env_with_templates(vec![
        ("base.html", "B:{% block c %}{% end %}"),
        ("child.html", "{% extends parent %}{% block c %}x{% end %}"),
    ]);
    let mut context = Context::new();
    context.insert("parent", "base.html");
    assert_eq!(env.render("child.html", &context).unwrap(), "B:x");
}

#[test]
fn embed_with_slot_overrides() {
    let env = env_with_templates(vec![
        (
            "card.html",
            "<div>{% slot header %}no header{% end %}|{% slot body %}no body{% end %}</div>",
        ),
        (
            "page.html",
            "{% embed \"card.html\" %}{% block header %}Hi{% end %}{% end %}",
        ),
    ]);
    assert_eq!(
        env.render("page.html", &Context::new()).unwrap(),
        "<div>Hi|no body</div>"
    );
}

#[test]
fn embed_sees_outer_context() {
    let env = env_with_templates(vec![
        ("card.html", "[{% slot s %}{% end %}]"),
        ("page.html", "{% embed \"card.html\" %}{% block s %}{{ title }}{% end %}{% end %}"),
    ]);
    let mut context = Context::new();
    context.insert("title", "T");
    assert_eq!(env.render("page.html", &context).unwrap(), "[T]");
}

#[test]
fn nested_blocks_resolve() {
    let env = env_with_templates(vec![
        (
            "base.html",
            "{% block outer %}o({% block inner %}i{% end %}){% end %}",
        ),
        (
            "child.html",
            "{% extends \"base.html\" %}{% block inner %}I{% end %}",
        ),
    ]);
    assert_eq!(env.render("child.html", &Context::new()).unwrap(), "o(I)");
}

#[test]
fn blocks_see_loop_variables() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% for i in items %}{% block item %}{{ i }}{% end %}{% end %}",
    )]);
    let mut context = Context::new();
    context.insert("items", &vec![1, 2]);
    assert_eq!(env.render("page.html", &context).unwrap(), "12");
}
