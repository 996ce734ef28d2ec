// Prompt templates with {{argument}} placeholders

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tether_core::protocol::{
    ContentBlock, GetPromptResult, Prompt, PromptArgument, PromptMessage, Role,
};

/// One prompt as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    /// Message text; `{{name}}` is replaced by the argument's value.
    pub template: String,
}

impl PromptTemplate {
    pub fn prompt(&self) -> Prompt {
        Prompt {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            arguments: self.arguments.clone(),
        }
    }

    pub fn render(&self, arguments: &HashMap<String, String>) -> Result<GetPromptResult> {
        let missing: Vec<&str> = self
            .arguments
            .iter()
            .filter(|a| a.required && !arguments.contains_key(&a.name))
            .map(|a| a.name.as_str())
            .collect();
        if !missing.is_empty() {
            bail!(
                "Prompt '{}' is missing required arguments: {}",
                self.name,
                missing.join(", ")
            );
        }

        let mut text = self.template.clone();
        for argument in &self.arguments {
            let placeholder = format!("{{{{{}}}}}", argument.name);
            let value = arguments.get(&argument.name).map(String::as_str).unwrap_or("");
            text = text.replace(&placeholder, value);
        }

        Ok(GetPromptResult {
            description: self.description.clone(),
            messages: vec![PromptMessage {
                role: Role::User,
                content: ContentBlock::text(text),
            }],
        })
    }
}

/// Named prompt templates, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    templates: BTreeMap<String, PromptTemplate>,
}

impl PromptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: PromptTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.templates.values().map(PromptTemplate::prompt).collect()
    }

    pub fn get(&self, name: &str, arguments: &HashMap<String, String>) -> Result<GetPromptResult> {
        match self.templates.get(name) {
            Some(template) => template.render(arguments),
            None => bail!("Unknown prompt: {}", name),
        }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl FromIterator<PromptTemplate> for PromptLibrary {
    fn from_iter<I: IntoIterator<Item = PromptTemplate>>(iter: I) -> Self {
        let mut library = Self::new();
        for template in iter {
            library.register(template);
        }
        library
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review() -> PromptTemplate {
        PromptTemplate {
            name: "code_review".to_string(),
            title: None,
            description: Some("Review a file".to_string()),
            arguments: vec![
                PromptArgument {
                    name: "path".to_string(),
                    description: None,
                    required: true,
                },
                PromptArgument {
                    name: "focus".to_string(),
                    description: None,
                    required: false,
                },
            ],
            template: "Review {{path}}. Focus: {{focus}}".to_string(),
        }
    }

    #[test]
    fn test_render_substitutes_arguments() {
        let args = HashMap::from([
            ("path".to_string(), "src/lib.rs".to_string()),
            ("focus".to_string(), "errors".to_string()),
        ]);

        let result = review().render(&args).unwrap();

        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].role, Role::User);
        assert_eq!(
            result.messages[0].content,
            ContentBlock::text("Review src/lib.rs. Focus: errors")
        );
    }

    #[test]
    fn test_optional_argument_defaults_to_empty() {
        let args = HashMap::from([("path".to_string(), "a.rs".to_string())]);
        let result = review().render(&args).unwrap();

        assert_eq!(result.messages[0].content, ContentBlock::text("Review a.rs. Focus: "));
    }

    #[test]
    fn test_missing_required_argument() {
        let err = review().render(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn test_library_lookup() {
        let library: PromptLibrary = vec![review()].into_iter().collect();

        assert_eq!(library.prompts()[0].name, "code_review");
        assert!(library.get("nope", &HashMap::new()).is_err());
    }
}
