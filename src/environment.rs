//! The main point of interaction in this library: holds configuration,
//! loaders, registries and the cache tiers, and turns template names into
//! rendered strings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{to_value, Map, Value};
use tracing::debug;

use crate::analysis::AnalysisConfig;
use crate::builtins::filters::{array, common, number, object, string, Filter};
use crate::builtins::functions::{self, AsyncFunction, Function};
use crate::builtins::testers::{self, Test};
use crate::cache::{hash_source, BytecodeCache, CacheInfo, FragmentCache, LruCache};
use crate::compiler::{self, CompiledTemplate, CompileOptions};
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::lexer::{CompiledSyntax, SyntaxConfig};
use crate::loader::{Loader, MapLoader};
use crate::optimizer::OptimizeOptions;
use crate::renderer::{AsyncRenderStream, Renderer, RenderStream};
use crate::utils::escape_html;

/// The escape function type definition
pub type EscapeFn = fn(&str) -> String;

/// Configuration of an environment; frozen once the environment exists.
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// HTML-escape `{{ }}` output
    pub autoescape: bool,
    /// Maximum compiled templates held in memory
    pub cache_size: usize,
    /// When false, cached templates are trusted without a freshness check
    pub auto_reload: bool,
    /// Maximum fragment-cache entries
    pub fragment_cache_size: usize,
    /// Default TTL for `{% cache %}` blocks; `None` = process lifetime
    pub fragment_ttl: Option<Duration>,
    /// Keep the optimized AST available for analysis
    pub preserve_ast: bool,
    /// Merge adjacent static/simple outputs into single emits
    pub coalesce_output: bool,
    /// Filter names to treat as pure beyond the builtin registry
    pub pure_filters: Vec<String>,
    /// Run call-site validation when analysis runs
    pub validate_calls: bool,
    /// Guard against runaway include/extends recursion
    pub max_include_depth: usize,
    /// The delimiter pairs templates use
    pub syntax: SyntaxConfig,
    /// How analysis classifies cache scopes
    pub analysis: AnalysisConfig,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            autoescape: true,
            cache_size: 400,
            auto_reload: true,
            fragment_cache_size: 1000,
            fragment_ttl: None,
            preserve_ast: true,
            coalesce_output: true,
            pure_filters: Vec::new(),
            validate_calls: false,
            max_include_depth: 50,
            syntax: SyntaxConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

/// A point-in-time view of the registries; renders hold one for their
/// whole duration so concurrent registrations never show mid-render.
#[derive(Clone)]
pub struct RegistrySnapshot {
    filters: Arc<HashMap<String, Arc<dyn Filter>>>,
    tests: Arc<HashMap<String, Arc<dyn Test>>>,
    functions: Arc<HashMap<String, Arc<dyn Function>>>,
    async_functions: Arc<HashMap<String, Arc<dyn AsyncFunction>>>,
    globals: Arc<Map<String, Value>>,
}

impl RegistrySnapshot {
    pub fn filter(&self, name: &str) -> Result<Arc<dyn Filter>> {
        self.filters.get(name).cloned().ok_or_else(|| Error::filter_not_found(name))
    }

    pub fn test(&self, name: &str) -> Result<Arc<dyn Test>> {
        self.tests.get(name).cloned().ok_or_else(|| Error::test_not_found(name))
    }

    pub fn function(&self, name: &str) -> Result<Arc<dyn Function>> {
        self.functions.get(name).cloned().ok_or_else(|| Error::function_not_found(name))
    }

    pub fn async_function(&self, name: &str) -> Option<Arc<dyn AsyncFunction>> {
        self.async_functions.get(name).cloned()
    }

    pub fn has_async_function(&self, name: &str) -> bool {
        self.async_functions.contains_key(name)
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub fn global_names(&self) -> Vec<String> {
        self.globals.keys().cloned().collect()
    }
}

/// Cached compiled template plus the loader version it was built from.
struct CachedTemplate {
    template: Arc<CompiledTemplate>,
    version: Option<String>,
}

/// The environment orchestrates compilation, caching and rendering.
///
/// All public operations are safe to call concurrently: configuration is
/// immutable, registries swap whole maps, and the template cache sits
/// behind a mutex that is never held while rendering.
pub struct Environment {
    config: EnvConfig,
    syntax: Arc<CompiledSyntax>,
    loader: Box<dyn Loader>,
    filters: RwLock<Arc<HashMap<String, Arc<dyn Filter>>>>,
    tests: RwLock<Arc<HashMap<String, Arc<dyn Test>>>>,
    functions: RwLock<Arc<HashMap<String, Arc<dyn Function>>>>,
    async_functions: RwLock<Arc<HashMap<String, Arc<dyn AsyncFunction>>>>,
    globals: RwLock<Arc<Map<String, Value>>>,
    template_cache: Mutex<LruCache<String, CachedTemplate>>,
    bytecode_cache: Option<BytecodeCache>,
    fragment_cache: Option<FragmentCache>,
    escape_fn: EscapeFn,
}

impl Environment {
    /// An environment with default configuration over the given loader.
    pub fn new(loader: impl Loader + 'static) -> Self {
        Self::with_config(loader, EnvConfig::default())
    }

    /// An environment with explicit configuration.
    pub fn with_config(loader: impl Loader + 'static, config: EnvConfig) -> Self {
        let syntax = if config.syntax == SyntaxConfig::default() {
            crate::lexer::default_syntax()
        } else {
            Arc::new(CompiledSyntax::new(config.syntax.clone()))
        };

        let mut env = Environment {
            template_cache: Mutex::new(LruCache::new(config.cache_size)),
            fragment_cache: Some(FragmentCache::new(
                config.fragment_cache_size,
                config.fragment_ttl,
            )),
            config,
            syntax,
            loader: Box::new(loader),
            filters: RwLock::new(Arc::new(HashMap::new())),
            tests: RwLock::new(Arc::new(HashMap::new())),
            functions: RwLock::new(Arc::new(HashMap::new())),
            async_functions: RwLock::new(Arc::new(HashMap::new())),
            globals: RwLock::new(Arc::new(Map::new())),
            bytecode_cache: None,
            escape_fn: escape_html,
        };

        env.register_builtin_filters();
        env.register_builtin_testers();
        env.register_builtin_functions();
        env
    }

    /// Attaches an on-disk bytecode cache rooted at `directory`.
    pub fn with_bytecode_cache(mut self, directory: impl Into<std::path::PathBuf>) -> Result<Self> {
        self.bytecode_cache = Some(BytecodeCache::new(directory)?);
        Ok(self)
    }

    /// Disables the `{% cache %}` fragment store entirely.
    pub fn without_fragment_cache(mut self) -> Self {
        self.fragment_cache = None;
        self
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub(crate) fn fragment_cache(&self) -> Option<&FragmentCache> {
        self.fragment_cache.as_ref()
    }

    pub(crate) fn escape_fn(&self) -> EscapeFn {
        self.escape_fn
    }

    /// Set a user-defined function applied to rendered output in place of
    /// HTML escaping.
    pub fn set_escape_fn(&mut self, function: EscapeFn) {
        self.escape_fn = function;
    }

    /// Reset the escape function to the default HTML one.
    pub fn reset_escape_fn(&mut self) {
        self.escape_fn = escape_html;
    }

    // ---- registries ----

    /// Register a filter. An existing filter with that name is replaced.
    /// Registration copies the map so in-flight renders keep their view.
    pub fn add_filter<F: Filter + 'static>(&self, name: &str, filter: F) {
        let mut guard = self.filters.write().expect("filter registry lock");
        let mut map = (**guard).clone();
        map.insert(name.to_string(), Arc::new(filter));
        *guard = Arc::new(map);
    }

    /// Register a test usable as `x is name`.
    pub fn add_test<T: Test + 'static>(&self, name: &str, test: T) {
        let mut guard = self.tests.write().expect("test registry lock");
        let mut map = (**guard).clone();
        map.insert(name.to_string(), Arc::new(test));
        *guard = Arc::new(map);
    }

    /// Register a global function callable from any template.
    pub fn add_function<F: Function + 'static>(&self, name: &str, function: F) {
        let mut guard = self.functions.write().expect("function registry lock");
        let mut map = (**guard).clone();
        map.insert(name.to_string(), Arc::new(function));
        *guard = Arc::new(map);
    }

    /// Register an async function, awaitable from async renders.
    pub fn add_async_function<F: AsyncFunction + 'static>(&self, name: &str, function: F) {
        let mut guard = self.async_functions.write().expect("async function registry lock");
        let mut map = (**guard).clone();
        map.insert(name.to_string(), Arc::new(function));
        *guard = Arc::new(map);
    }

    /// Register a global value visible to every render.
    pub fn add_global(&self, name: &str, value: impl serde::Serialize) {
        let mut guard = self.globals.write().expect("globals lock");
        let mut map = (**guard).clone();
        map.insert(name.to_string(), to_value(value).expect("global must serialize"));
        *guard = Arc::new(map);
    }

    pub(crate) fn registry_snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            filters: self.filters.read().expect("filter registry lock").clone(),
            tests: self.tests.read().expect("test registry lock").clone(),
            functions: self.functions.read().expect("function registry lock").clone(),
            async_functions: self
                .async_functions
                .read()
                .expect("async function registry lock")
                .clone(),
            globals: self.globals.read().expect("globals lock").clone(),
        }
    }

    fn register_builtin_filters(&mut self) {
        self.add_filter("upper", string::upper);
        self.add_filter("lower", string::lower);
        self.add_filter("trim", string::trim);
        self.add_filter("strip", string::trim);
        self.add_filter("lstrip", string::trim_start);
        self.add_filter("rstrip", string::trim_end);
        self.add_filter("title", string::title);
        self.add_filter("capitalize", string::capitalize);
        self.add_filter("swapcase", string::swapcase);
        self.add_filter("truncate", string::truncate);
        self.add_filter("wordcount", string::wordcount);
        self.add_filter("wordwrap", string::wordwrap);
        self.add_filter("indent", string::indent);
        self.add_filter("center", string::center);
        self.add_filter("ljust", string::ljust);
        self.add_filter("rjust", string::rjust);
        self.add_filter("replace", string::replace);
        self.add_filter("striptags", string::striptags);
        self.add_filter("split", string::split);
        self.add_filter("addslashes", string::addslashes);
        #[cfg(feature = "urlencode")]
        {
            self.add_filter("urlencode", string::urlencode);
            self.add_filter("urlencode_strict", string::urlencode_strict);
        }

        self.add_filter("length", common::length);
        self.add_filter("count", common::length);
        self.add_filter("reverse", common::reverse);
        self.add_filter("default", common::default);
        self.add_filter("d", common::default);
        self.add_filter("escape", common::escape_html);
        self.add_filter("e", common::escape_html);
        self.add_filter("forceescape", common::forceescape);
        self.add_filter("safe", common::safe);
        self.add_filter("int", common::int);
        self.add_filter("float", common::float);
        self.add_filter("string", common::string);
        self.add_filter("str", common::string);
        self.add_filter("bool", common::bool_filter);
        self.add_filter("json_encode", common::json_encode);
        #[cfg(feature = "chrono")]
        self.add_filter("date", common::date);

        self.add_filter("first", array::first);
        self.add_filter("last", array::last);
        self.add_filter("join", array::join);
        self.add_filter("slice", array::slice);
        self.add_filter("sort", array::sort);
        self.add_filter("unique", array::unique);
        self.add_filter("concat", array::concat);
        self.add_filter("map", array::map);

        self.add_filter("pluralize", number::pluralize);
        self.add_filter("round", number::round);
        self.add_filter("abs", number::abs);
        #[cfg(feature = "humansize")]
        self.add_filter("filesizeformat", number::filesizeformat);

        self.add_filter("get", object::get);
        self.add_filter("keys", object::keys);
        self.add_filter("values", object::values);
        self.add_filter("items", object::items);
    }

    fn register_builtin_testers(&mut self) {
        self.add_test("defined", testers::defined);
        self.add_test("undefined", testers::undefined);
        self.add_test("none", testers::none);
        self.add_test("odd", testers::odd);
        self.add_test("even", testers::even);
        self.add_test("string", testers::string);
        self.add_test("number", testers::number);
        self.add_test("divisibleby", testers::divisible_by);
        self.add_test("iterable", testers::iterable);
        self.add_test("mapping", testers::mapping);
        self.add_test("starting_with", testers::starting_with);
        self.add_test("ending_with", testers::ending_with);
        self.add_test("containing", testers::containing);
        self.add_test("matching", testers::matching);
    }

    fn register_builtin_functions(&mut self) {
        self.add_function("range", functions::range);
        self.add_function("throw", functions::throw);
        self.add_function("cycle", functions::cycle);
        #[cfg(feature = "chrono")]
        self.add_function("now", functions::now);
        #[cfg(feature = "rand")]
        self.add_function("get_random", functions::get_random);
    }

    // ---- compilation and caching ----

    fn compile_options(&self) -> CompileOptions<'_> {
        CompileOptions {
            syntax: &self.syntax,
            optimize: OptimizeOptions {
                static_context: None,
                extra_pure_filters: self.config.pure_filters.iter().cloned().collect(),
                coalesce: self.config.coalesce_output,
            },
            preserve_ast: self.config.preserve_ast,
        }
    }

    fn compile_named(&self, name: &str) -> Result<(Arc<CompiledTemplate>, Option<String>)> {
        let loaded = self.loader.get_source(name)?;
        let source_hash = hash_source(&loaded.source);

        if let Some(ref bytecode_cache) = self.bytecode_cache {
            if let Some(entry) = bytecode_cache.get(source_hash) {
                match compiler::from_image(&entry.payload, self.config.preserve_ast) {
                    Ok(template) => {
                        debug!(name, "loaded template from bytecode cache");
                        return Ok((template, loaded.version));
                    }
                    Err(error) => {
                        debug!(name, %error, "stale bytecode entry, recompiling");
                    }
                }
            }
        }

        let template = compiler::compile(
            Some(name),
            loaded.filename.as_deref(),
            &loaded.source,
            &self.compile_options(),
        )?;

        if self.config.validate_calls {
            for problem in crate::analysis::validate_call_sites(&template) {
                tracing::warn!(
                    template = name,
                    def = %problem.def_name,
                    line = problem.lineno,
                    unknown = ?problem.unknown_params,
                    missing = ?problem.missing_required,
                    duplicate = ?problem.duplicate_params,
                    "macro call doesn't match its definition"
                );
            }
        }

        if let Some(ref bytecode_cache) = self.bytecode_cache {
            let payload = compiler::to_image(&template)?;
            if let Err(error) = bytecode_cache.put(source_hash, template.is_async, &payload) {
                debug!(name, %error, "couldn't persist bytecode entry");
            }
        }

        Ok((template, loaded.version))
    }

    /// Fetches a compiled template, compiling at most once per version
    /// even under concurrent callers. Compile errors are never cached, so
    /// fixing the source takes effect on the next call.
    pub fn get_template(&self, name: &str) -> Result<Arc<CompiledTemplate>> {
        // the single cache mutex doubles as the single-flight compile
        // lock: concurrent callers for the same name serialize here and
        // every one after the first observes the cached artifact
        let mut cache = self.template_cache.lock().expect("template cache lock");

        if let Some(cached) = cache.get(&name.to_string()) {
            if !self.config.auto_reload {
                return Ok(cached.template.clone());
            }
            let current_version =
                self.loader.get_source(name).ok().and_then(|loaded| loaded.version);
            if cached.version == current_version {
                return Ok(cached.template.clone());
            }
            debug!(name, "template changed on disk, recompiling");
        }

        let (template, version) = self.compile_named(name)?;
        cache.set(name.to_string(), CachedTemplate { template: template.clone(), version });
        Ok(template)
    }

    /// Compiles a one-off template without caching it by name.
    pub fn from_string(&self, source: &str) -> Result<Arc<CompiledTemplate>> {
        compiler::compile(None, None, source, &self.compile_options())
    }

    /// Compiles a one-off template with a static context for partial
    /// evaluation: names it defines fold to constants.
    pub fn from_string_with_static_context(
        &self,
        source: &str,
        static_context: &Context,
    ) -> Result<Arc<CompiledTemplate>> {
        let static_map = match static_context.as_value() {
            Value::Object(map) => map,
            _ => unreachable!("context data is always an object"),
        };
        let options = CompileOptions {
            syntax: &self.syntax,
            optimize: OptimizeOptions {
                static_context: Some(static_map),
                extra_pure_filters: self.config.pure_filters.iter().cloned().collect(),
                coalesce: self.config.coalesce_output,
            },
            preserve_ast: self.config.preserve_ast,
        };
        compiler::compile(None, None, source, &options)
    }

    /// Drops the in-memory compiled templates.
    pub fn clear_cache(&self) {
        self.template_cache.lock().expect("template cache lock").clear();
        if let Some(ref fragment_cache) = self.fragment_cache {
            fragment_cache.clear();
        }
    }

    /// Hit/miss/size statistics per cache tier.
    pub fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            templates: self.template_cache.lock().expect("template cache lock").info(),
            bytecode: self.bytecode_cache.as_ref().map(|c| c.info()),
            fragments: self.fragment_cache.as_ref().map(|c| c.info()),
        }
    }

    // ---- rendering ----

    /// Renders a template by name with the given context.
    pub fn render(&self, template_name: &str, context: &Context) -> Result<String> {
        let template = self.get_template(template_name)?;
        Renderer::new(template, self, context.as_value(), self.config.autoescape).render()
    }

    /// Renders a template by name from any `Serialize` value; it must
    /// serialize to an object.
    pub fn render_serialized(
        &self,
        template_name: &str,
        data: impl serde::Serialize,
    ) -> Result<String> {
        let context = Context::from_serialize(data)?;
        self.render(template_name, &context)
    }

    /// Renders a one-off template given as a string.
    pub fn render_str(&self, source: &str, context: &Context) -> Result<String> {
        let template = self.from_string(source)?;
        Renderer::new(template, self, context.as_value(), self.config.autoescape).render()
    }

    /// Renders an already-compiled template, e.g. one from
    /// [`Environment::from_string`].
    pub fn render_template(
        &self,
        template: &Arc<CompiledTemplate>,
        context: &Context,
    ) -> Result<String> {
        Renderer::new(template.clone(), self, context.as_value(), self.config.autoescape)
            .render()
    }

    /// Async render of an already-compiled template.
    pub async fn render_template_async(
        &self,
        template: &Arc<CompiledTemplate>,
        context: &Context,
    ) -> Result<String> {
        Renderer::new(template.clone(), self, context.as_value(), self.config.autoescape)
            .render_async()
            .await
    }

    /// Sync chunk stream of a template render; chunks split at top-level
    /// statement boundaries.
    pub fn render_stream<'e>(
        &'e self,
        template_name: &str,
        context: &'e Context,
    ) -> Result<RenderStream<'e>> {
        let template = self.get_template(template_name)?;
        Renderer::new(template, self, context.as_value(), self.config.autoescape).render_stream()
    }

    /// Async chunk stream; required for async-tainted templates and
    /// available for every other template as well.
    pub fn render_stream_async<'e>(
        &'e self,
        template_name: &str,
        context: &'e Context,
    ) -> Result<AsyncRenderStream<'e>> {
        let template = self.get_template(template_name)?;
        Ok(Renderer::new(template, self, context.as_value(), self.config.autoescape)
            .render_stream_async())
    }

    /// Async full render.
    pub async fn render_async(&self, template_name: &str, context: &Context) -> Result<String> {
        let template = self.get_template(template_name)?;
        Renderer::new(template, self, context.as_value(), self.config.autoescape)
            .render_async()
            .await
    }

    // ---- analysis ----

    /// Analysis metadata of a template (needs `preserve_ast`).
    pub fn template_metadata(
        &self,
        template_name: &str,
    ) -> Result<crate::analysis::TemplateMetadata> {
        let template = self.get_template(template_name)?;
        template.metadata(&self.config.analysis).map(Clone::clone)
    }

    /// The sorted top-level names a template needs that neither `context`
    /// nor the globals provide.
    pub fn validate_context(&self, template_name: &str, context: &Context) -> Result<Vec<String>> {
        let template = self.get_template(template_name)?;
        let metadata = template.metadata(&self.config.analysis)?;
        let snapshot = self.registry_snapshot();
        Ok(crate::analysis::missing_context_names(
            metadata,
            context,
            &snapshot.global_names(),
        ))
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::new(MapLoader::new())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("templates", &self.template_cache.lock().expect("template cache lock").len())
            .finish()
    }
}
