use futures::future::FutureExt;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::env_with_templates;
use crate::builtins::functions::AsyncFunction;
use crate::{Context, Environment};

fn context_with(pairs: Vec<(&str, serde_json::Value)>) -> Context {
    let mut context = Context::new();
    for (key, value) in pairs {
        context.insert(key, &value);
    }
    context
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

/// An async source returning a fixed value, for tests.
struct FixedAsync(serde_json::Value);

impl AsyncFunction for FixedAsync {
    fn call<'a>(
        &'a self,
        _: &'a std::collections::HashMap<String, serde_json::Value>,
    ) -> futures::future::BoxFuture<'a, crate::Result<serde_json::Value>> {
        async move { Ok(self.0.clone()) }.boxed()
    }
}

#[test]
fn stream_concat_equals_render() {
    let env = env_with_templates(vec![(
        "page.html",
        "<h1>{{ title }}</h1>{% for i in items %}<p>{{ i }}</p>{% end %}<footer/>",
    )]);
    let context = context_with(vec![("title", json!("T")), ("items", json!([1, 2, 3]))]);

    let full = env.render("page.html", &context).unwrap();
    let streamed: String =
        env.render_stream("page.html", &context).unwrap().into_string().unwrap();
    assert_eq!(streamed, full);
}

#[test]
fn stream_chunks_at_statement_boundaries() {
    let env = env_with_templates(vec![(
        "page.html",
        "one{% if x %}two{% end %}{{ y }}",
    )]);
    let context = context_with(vec![("x", json!(true)), ("y", json!("three"))]);

    let chunks: Vec<String> = env
        .render_stream("page.html", &context)
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(chunks, vec!["one", "two", "three"]);
}

#[test]
fn stream_carries_bindings_between_chunks() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% set v = \"shared\" %}a{{ v }}",
    )]);
    // coalescing merges the data and the output into one emit, so they
    // arrive as a single chunk carrying the binding made just before
    let chunks: Vec<String> = env
        .render_stream("page.html", &Context::new())
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(chunks, vec!["ashared"]);
}

#[test]
fn stream_is_lazy_per_statement() {
    let env = env_with_templates(vec![(
        "page.html",
        "ok{{ boom() }}never",
    )]);
    let ctx = Context::new();
    let mut stream = env.render_stream("page.html", &ctx).unwrap();
    // the first chunk renders fine; the failure only surfaces when the
    // failing statement is reached
    assert_eq!(stream.next().unwrap().unwrap(), "ok");
    assert!(stream.next().unwrap().is_err());
    assert!(stream.next().is_none());
}

#[test]
fn stream_resolves_inheritance() {
    let env = env_with_templates(vec![
        ("base.html", "A{% block b %}{% end %}C"),
        ("child.html", "{% extends \"base.html\" %}{% block b %}B{% end %}"),
    ]);
    let chunks: Vec<String> = env
        .render_stream("child.html", &Context::new())
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(chunks.concat(), "ABC");
}

#[test]
fn async_stream_on_sync_template_is_a_trivial_adapter() {
    let env = env_with_templates(vec![("page.html", "a{{ x }}b")]);
    let context = context_with(vec![("x", json!(1))]);

    let out = runtime()
        .block_on(env.render_stream_async("page.html", &context).unwrap().into_string())
        .unwrap();
    assert_eq!(out, env.render("page.html", &context).unwrap());
}

#[test]
fn async_render_awaits_functions() {
    let env = env_with_templates(vec![("page.html", "v={{ await version() }}")]);
    env.add_async_function("version", FixedAsync(json!("1.0")));

    let out = runtime().block_on(env.render_async("page.html", &Context::new())).unwrap();
    assert_eq!(out, "v=1.0");
}

#[test]
fn async_for_iterates_awaited_values() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% async for x in await feed() %}[{{ x }}]{% end %}",
    )]);
    env.add_async_function("feed", FixedAsync(json!([1, 2, 3])));

    let out = runtime().block_on(env.render_async("page.html", &Context::new())).unwrap();
    assert_eq!(out, "[1][2][3]");
}

#[test]
fn async_stream_yields_per_async_for_iteration() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% async for x in items %}[{{ x }}]{% end %}",
    )]);
    let context = context_with(vec![("items", json!([1, 2, 3]))]);

    let chunks: Vec<String> = runtime().block_on(async {
        env.render_stream_async("page.html", &context)
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await
    });
    assert_eq!(chunks, vec!["[1]", "[2]", "[3]"]);
}

#[test]
fn async_for_allows_index_but_not_length() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% async for x in items %}{{ loop.index }}{% end %}",
    )]);
    let context = context_with(vec![("items", json!([5, 6]))]);
    let out = runtime().block_on(env.render_async("page.html", &context)).unwrap();
    assert_eq!(out, "12");
}

#[test]
fn await_in_set_and_if() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% set v = await version() %}{% if v == \"1.0\" %}current{% end %}",
    )]);
    env.add_async_function("version", FixedAsync(json!("1.0")));

    let out = runtime().block_on(env.render_async("page.html", &Context::new())).unwrap();
    assert_eq!(out, "current");
}

#[test]
fn async_stream_of_async_template_via_environment() {
    let env = Environment::default();
    env.add_async_function("greet", FixedAsync(json!("hello")));
    let template = env.from_string("{{ await greet() }} world").unwrap();
    assert!(template.is_async);

    let context = Context::new();
    let out = runtime().block_on(async {
        crate::renderer::Renderer::new(template, &env, context.as_value(), true)
            .render_stream_async()
            .into_string()
            .await
    });
    assert_eq!(out.unwrap(), "hello world");
}

#[test]
fn dropping_the_stream_cancels_rendering() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% async for x in items %}[{{ x }}]{% end %}",
    )]);
    let context = context_with(vec![("items", json!([1, 2, 3, 4, 5]))]);

    runtime().block_on(async {
        let mut stream = env.render_stream_async("page.html", &context).unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "[1]");
        // dropping here must not hang or panic
        drop(stream);
    });
}
