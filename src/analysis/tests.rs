use pretty_assertions::assert_eq;

use super::*;
use crate::{Context, Environment, MapLoader};

fn env_with(templates: Vec<(&str, &str)>) -> Environment {
    Environment::new(MapLoader::from_templates(templates))
}

fn metadata_for(source: &str) -> TemplateMetadata {
    let env = env_with(vec![("t.html", "")]);
    let template = env.from_string(source).unwrap();
    analyze_template(&template, &AnalysisConfig::default())
}

#[test]
fn dependencies_are_dotted_paths() {
    let metadata = metadata_for(
        "{% block hero %}{{ page.title }} by {{ page.author.name }} on {{ site.name }}{% end %}",
    );
    let block = &metadata.blocks["hero"];
    let deps: Vec<&str> = block.depends_on.iter().map(String::as_str).collect();
    assert_eq!(deps, vec!["page.author.name", "page.title", "site.name"]);
}

#[test]
fn both_branches_are_visited() {
    let metadata = metadata_for(
        "{% block b %}{% if flag %}{{ a }}{% else %}{{ b }}{% end %}{% end %}",
    );
    let deps = &metadata.blocks["b"].depends_on;
    assert!(deps.contains("flag"));
    assert!(deps.contains("a"));
    assert!(deps.contains("b"));
}

#[test]
fn loop_variables_are_not_dependencies() {
    let metadata =
        metadata_for("{% block b %}{% for p in site.pages %}{{ p.title }}{% end %}{% end %}");
    let deps = &metadata.blocks["b"].depends_on;
    assert!(deps.contains("site.pages"));
    assert!(!deps.iter().any(|d| d.starts_with("p.")));
}

#[test]
fn set_bound_names_are_not_dependencies() {
    let metadata = metadata_for("{% block b %}{% set x = site.name %}{{ x }}{% end %}");
    let deps = &metadata.blocks["b"].depends_on;
    assert_eq!(deps.iter().collect::<Vec<_>>(), vec!["site.name"]);
}

#[test]
fn purity_classification() {
    let pure = metadata_for("{% block b %}{{ page.title | upper }}{% end %}");
    assert_eq!(pure.blocks["b"].is_pure, Purity::Pure);

    let impure = metadata_for("{% block b %}{{ now() }}{% end %}");
    assert_eq!(impure.blocks["b"].is_pure, Purity::Impure);

    let impure_filter = metadata_for("{% block b %}{{ x | json_encode }}{% end %}");
    assert_eq!(impure_filter.blocks["b"].is_pure, Purity::Impure);

    let unknown = metadata_for("{% block b %}{{ somefn() }}{% end %}");
    assert_eq!(unknown.blocks["b"].is_pure, Purity::Unknown);
}

#[test]
fn cache_scope_classification() {
    let site = metadata_for("{% block b %}{{ site.name }}{{ config.base_url }}{% end %}");
    assert_eq!(site.blocks["b"].cache_scope, CacheScope::Site);

    let page = metadata_for("{% block b %}{{ site.name }}{{ page.title }}{% end %}");
    assert_eq!(page.blocks["b"].cache_scope, CacheScope::Page);

    let none = metadata_for("{% block b %}{{ now() }}{% end %}");
    assert_eq!(none.blocks["b"].cache_scope, CacheScope::None);

    let unknown = metadata_for("{% block b %}{{ mystery_var }}{% end %}");
    assert_eq!(unknown.blocks["b"].cache_scope, CacheScope::Unknown);

    // no dependencies at all is safe everywhere
    let constant = metadata_for("{% block b %}static{% end %}");
    assert_eq!(constant.blocks["b"].cache_scope, CacheScope::Site);
}

#[test]
fn landmark_detection() {
    let metadata = metadata_for(
        "{% block b %}<nav class=\"top\">x</nav><main>y</main><p>no</p>{% end %}",
    );
    let block = &metadata.blocks["b"];
    let landmarks: Vec<&str> = block.emits_landmarks.iter().map(String::as_str).collect();
    assert_eq!(landmarks, vec!["main", "nav"]);
    assert!(block.emits_html);
    assert_eq!(block.inferred_role, "navigation");
}

#[test]
fn navigation_is_not_detected_in_plain_words() {
    let metadata = metadata_for("{% block b %}<navigate></navigate>{% end %}");
    assert!(metadata.blocks["b"].emits_landmarks.is_empty());
}

#[test]
fn role_inference_from_name() {
    let metadata = metadata_for("{% block footer_links %}text only{% end %}");
    assert_eq!(metadata.blocks["footer_links"].inferred_role, "footer");
    assert!(!metadata.blocks["footer_links"].emits_html);
}

#[test]
fn extends_and_top_level_dependencies() {
    let metadata =
        metadata_for("{% extends \"base.html\" %}{{ page.summary }}{% block b %}{{ x }}{% end %}");
    assert_eq!(metadata.extends.as_deref(), Some("base.html"));
    assert!(metadata.top_level_depends_on.contains("page.summary"));
    // block internals stay out of the top level set
    assert!(!metadata.top_level_depends_on.contains("x"));
}

#[test]
fn call_validation_finds_problems() {
    let metadata = metadata_for(concat!(
        "{% def card(title, body=\"\") %}x{% end %}",
        "{{ card() }}",
        "{{ card(\"t\", wat=1) }}",
        "{{ card(\"t\", title=\"again\") }}",
    ));

    let validations = &metadata.call_validations;
    assert_eq!(validations.len(), 3);

    assert_eq!(validations[0].missing_required, vec!["title"]);
    assert_eq!(validations[1].unknown_params, vec!["wat"]);
    assert_eq!(validations[2].duplicate_params, vec!["title"]);
}

#[test]
fn catchalls_suppress_unknown_params() {
    let metadata = metadata_for(concat!(
        "{% def free(**options) %}x{% end %}",
        "{{ free(anything=1, goes=2) }}",
    ));
    assert!(metadata.call_validations.is_empty());
}

#[test]
fn validate_context_reports_missing_names() {
    let env = env_with(vec![(
        "page.html",
        "{{ title }}{% block b %}{{ site.name }}{{ count }}{% end %}",
    )]);
    env.add_global("site", serde_json::json!({"name": "kida"}));

    let mut context = Context::new();
    context.insert("title", "T");

    let missing = env.validate_context("page.html", &context).unwrap();
    assert_eq!(missing, vec!["count"]);
}

#[test]
fn metadata_requires_preserve_ast() {
    let mut config = crate::EnvConfig::default();
    config.preserve_ast = false;
    let env = Environment::with_config(
        MapLoader::from_templates(vec![("a.html", "x")]),
        config,
    );
    assert!(env.template_metadata("a.html").is_err());
}

#[test]
fn environment_exposes_metadata() {
    let env = env_with(vec![("a.html", "{% block hero %}{{ page.title }}{% end %}")]);
    let metadata = env.template_metadata("a.html").unwrap();
    assert!(metadata.blocks.contains_key("hero"));
}
