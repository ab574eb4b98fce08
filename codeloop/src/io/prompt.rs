//! Generation prompt rendering.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::io::generator::GenerationRequest;

const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("generate", GENERATE_TEMPLATE)
            .expect("generate template should be valid");
        Self { env }
    }

    /// Render the prompt for one generation request.
    ///
    /// The retry section appears only when the request carries a diagnostic.
    pub fn render(&self, request: &GenerationRequest) -> Result<String> {
        let template = self.env.get_template("generate")?;
        let rendered = template.render(context! {
            command => request.command.trim(),
            diagnostic => request.diagnostic.as_ref(),
            attempt => request.attempt + 1,
            max_attempts => request.max_attempts,
        })?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}
