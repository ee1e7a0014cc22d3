use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use super::env_with_templates;
use crate::builtins::functions::Function;
use crate::{Context, Environment, MapLoader};

/// A function that counts how many times templates invoke it.
struct Counting(Arc<AtomicUsize>);

impl Function for Counting {
    fn call(&self, _: &HashMap<String, Value>) -> crate::Result<Value> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!(format!("result-{}", n)))
    }
}

#[test]
fn fragment_cache_renders_body_once() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% cache \"k\" %}{{ expensive() }}{% end %}",
    )]);
    let calls = Arc::new(AtomicUsize::new(0));
    env.add_function("expensive", Counting(calls.clone()));

    let first = env.render("page.html", &Context::new()).unwrap();
    let second = env.render("page.html", &Context::new()).unwrap();

    assert_eq!(first, "result-1");
    assert_eq!(second, "result-1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn fragment_cache_keys_include_the_evaluated_key() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% cache user %}{{ expensive() }}{% end %}",
    )]);
    let calls = Arc::new(AtomicUsize::new(0));
    env.add_function("expensive", Counting(calls.clone()));

    let mut ada = Context::new();
    ada.insert("user", "ada");
    let mut bob = Context::new();
    bob.insert("user", "bob");

    env.render("page.html", &ada).unwrap();
    env.render("page.html", &bob).unwrap();
    env.render("page.html", &ada).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn fragment_cache_ttl_expires() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% cache \"k\" ttl=0.000001 %}{{ expensive() }}{% end %}",
    )]);
    let calls = Arc::new(AtomicUsize::new(0));
    env.add_function("expensive", Counting(calls.clone()));

    env.render("page.html", &Context::new()).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    env.render("page.html", &Context::new()).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn disabled_fragment_cache_always_renders() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% cache \"k\" %}{{ expensive() }}{% end %}",
    )])
    .without_fragment_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    env.add_function("expensive", Counting(calls.clone()));

    env.render("page.html", &Context::new()).unwrap();
    env.render("page.html", &Context::new()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn fragment_cache_stats_count_hits_and_misses() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% cache \"k\" %}body{% end %}",
    )]);
    env.render("page.html", &Context::new()).unwrap();
    env.render("page.html", &Context::new()).unwrap();

    let info = env.cache_info();
    let fragments = info.fragments.unwrap();
    assert_eq!(fragments.hits, 1);
    assert_eq!(fragments.misses, 1);
    assert_eq!(fragments.size, 1);
}

#[test]
fn clear_cache_drops_fragments() {
    let env = env_with_templates(vec![(
        "page.html",
        "{% cache \"k\" %}{{ expensive() }}{% end %}",
    )]);
    let calls = Arc::new(AtomicUsize::new(0));
    env.add_function("expensive", Counting(calls.clone()));

    env.render("page.html", &Context::new()).unwrap();
    env.clear_cache();
    env.render("page.html", &Context::new()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn bytecode_cache_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let loader = MapLoader::from_templates(vec![("page.html", "x{{ 1 + 2 }}y")]);
    let env = Environment::new(loader).with_bytecode_cache(dir.path()).unwrap();

    assert_eq!(env.render("page.html", &Context::new()).unwrap(), "x3y");
    let wrote = env.cache_info().bytecode.unwrap();
    assert_eq!(wrote.size, 1);

    // a fresh environment over the same directory deserializes instead of
    // compiling
    let loader = MapLoader::from_templates(vec![("page.html", "x{{ 1 + 2 }}y")]);
    let env2 = Environment::new(loader).with_bytecode_cache(dir.path()).unwrap();
    assert_eq!(env2.render("page.html", &Context::new()).unwrap(), "x3y");
    let read = env2.cache_info().bytecode.unwrap();
    assert_eq!(read.hits, 1);
}

#[test]
fn bytecode_cache_misses_on_changed_source() {
    let dir = tempfile::tempdir().unwrap();
    let loader = MapLoader::from_templates(vec![("page.html", "v1")]);
    let env = Environment::new(loader).with_bytecode_cache(dir.path()).unwrap();
    env.render("page.html", &Context::new()).unwrap();

    let loader = MapLoader::from_templates(vec![("page.html", "v2")]);
    let env2 = Environment::new(loader).with_bytecode_cache(dir.path()).unwrap();
    assert_eq!(env2.render("page.html", &Context::new()).unwrap(), "v2");
}

#[test]
fn template_lru_reports_stats() {
    let env = env_with_templates(vec![("a.html", "a"), ("b.html", "b")]);
    env.render("a.html", &Context::new()).unwrap();
    env.render("a.html", &Context::new()).unwrap();
    env.render("b.html", &Context::new()).unwrap();

    let info = env.cache_info().templates;
    assert_eq!(info.size, 2);
    assert!(info.hits >= 1);
}

#[test]
fn cache_block_inside_block_uses_block_name_in_key() {
    // two templates with the same cache key in different blocks must not
    // collide
    let env = env_with_templates(vec![
        ("one.html", "{% block alpha %}{% cache \"k\" %}{{ expensive() }}{% end %}{% end %}"),
        ("two.html", "{% block beta %}{% cache \"k\" %}{{ expensive() }}{% end %}{% end %}"),
    ]);
    let calls = Arc::new(AtomicUsize::new(0));
    env.add_function("expensive", Counting(calls.clone()));

    env.render("one.html", &Context::new()).unwrap();
    env.render("two.html", &Context::new()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
