//! Variable substitution for command templates.
//!
//! Commands in configuration may reference runtime variables such as the
//! instance number or the node hostname using `{variable}` placeholders.
//! Rendering is pure: an unresolved or malformed placeholder is an error
//! value the caller decides how to handle, never a panic.

use std::collections::HashMap;
use thiserror::Error;

/// Errors produced while rendering a command template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    /// The template referenced a variable not present in the context.
    #[error("unresolved variable {variable} in template: {template}")]
    UnresolvedVariable { variable: String, template: String },

    /// The template contained an unbalanced or empty placeholder.
    #[error("malformed template: {template}")]
    Malformed { template: String },
}

/// A set of named variables available to a command template.
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    vars: HashMap<String, String>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style variable insertion.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.to_string(), value.into());
    }

    /// Substitute every `{variable}` in `template` with its context value.
    ///
    /// `{{` and `}}` escape literal braces.
    pub fn render(&self, template: &str) -> Result<String, RenderError> {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        out.push('{');
                        continue;
                    }
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(RenderError::Malformed {
                                    template: template.to_string(),
                                })
                            }
                        }
                    }
                    if name.is_empty() {
                        return Err(RenderError::Malformed {
                            template: template.to_string(),
                        });
                    }
                    match self.vars.get(&name) {
                        Some(value) => out.push_str(value),
                        None => {
                            return Err(RenderError::UnresolvedVariable {
                                variable: name,
                                template: template.to_string(),
                            })
                        }
                    }
                }
                '}' => {
                    if chars.peek() == Some(&'}') {
                        chars.next();
                        out.push('}');
                    } else {
                        return Err(RenderError::Malformed {
                            template: template.to_string(),
                        });
                    }
                }
                c => out.push(c),
            }
        }

        Ok(out)
    }
}
