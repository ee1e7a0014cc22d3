mod basic;
mod cache;
mod inheritance;
mod macros;
mod streaming;

use crate::loader::MapLoader;
use crate::{Context, Environment};

/// Renders a one-off template with the default environment.
pub(crate) fn render_template(content: &str, context: &Context) -> crate::Result<String> {
    let env = Environment::default();
    env.render_str(content, context)
}

pub(crate) fn env_with_templates(templates: Vec<(&str, &str)>) -> Environment {
    Environment::new(MapLoader::from_templates(templates))
}
