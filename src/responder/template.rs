//! Response templates with `{placeholder}` substitution.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::ResponderConfig;
use crate::error::ResponderError;
use crate::models::ConversationCategory;

pub const WELCOME_NEW_LEAD: &str = "welcome_new_lead";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTemplate {
    pub template_id: String,
    pub name: String,
    pub content: String,
    pub category: ConversationCategory,
}

impl ResponseTemplate {
    /// Substitute every placeholder from `context`. A placeholder with no
    /// value is an error.
    pub fn render(&self, context: &BTreeMap<String, String>) -> Result<String, ResponderError> {
        let mut out = String::with_capacity(self.content.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(&self.content) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = context.get(name.as_str()).ok_or_else(|| {
                ResponderError::UnresolvedPlaceholder {
                    template_id: self.template_id.clone(),
                    placeholder: name.as_str().to_string(),
                }
            })?;
            out.push_str(&self.content[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&self.content[last..]);
        Ok(out)
    }
}

/// Templates by id.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, ResponseTemplate>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        let mut registry = Self {
            templates: HashMap::new(),
        };
        registry.insert(ResponseTemplate {
            template_id: WELCOME_NEW_LEAD.to_string(),
            name: "Welcome New Lead".to_string(),
            content: "Hello, thank you for reaching out to {business_name}! \
                      We will contact you during our business hours: {hours}."
                .to_string(),
            category: ConversationCategory::NewLead,
        });
        registry
    }
}

impl TemplateRegistry {
    pub fn insert(&mut self, template: ResponseTemplate) {
        self.templates.insert(template.template_id.clone(), template);
    }

    pub fn get(&self, template_id: &str) -> Option<&ResponseTemplate> {
        self.templates.get(template_id)
    }

    pub fn render(
        &self,
        template_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<String, ResponderError> {
        self.get(template_id)
            .ok_or_else(|| ResponderError::TemplateNotFound(template_id.to_string()))?
            .render(context)
    }
}

/// The fixed mapping every template is rendered against.
pub fn business_context(config: &ResponderConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("business_name".to_string(), config.business.name.clone()),
        ("contact_phone".to_string(), config.business.phone.clone()),
        ("contact_email".to_string(), config.business.email.clone()),
        ("hours".to_string(), config.formatted_hours()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_default_welcome() {
        let registry = TemplateRegistry::default();
        let context = business_context(&ResponderConfig::default());
        let text = registry.render(WELCOME_NEW_LEAD, &context).unwrap();
        assert_eq!(
            text,
            "Hello, thank you for reaching out to Small Biz Advisor! \
             We will contact you during our business hours: 09:00 - 17:00."
        );
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let template = ResponseTemplate {
            template_id: "t".into(),
            name: "t".into(),
            content: "Hi {customer_name}, from {business_name}".into(),
            category: ConversationCategory::Support,
        };
        let context = business_context(&ResponderConfig::default());
        match template.render(&context) {
            Err(ResponderError::UnresolvedPlaceholder { placeholder, .. }) => {
                assert_eq!(placeholder, "customer_name")
            }
            other => panic!("expected unresolved placeholder, got {other:?}"),
        }
    }

    #[test]
    fn unknown_template_is_an_error() {
        let registry = TemplateRegistry::default();
        assert!(matches!(
            registry.render("missing", &BTreeMap::new()),
            Err(ResponderError::TemplateNotFound(_))
        ));
    }
}
