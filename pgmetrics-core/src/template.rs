//! User-supplied SQL templates for table creation and column addition.
//!
//! Templates are treated as opaque strings with `{placeholder}`
//! substitution; this crate never parses or validates the SQL they
//! render, matching the original plugin's design of delegating DDL
//! shape entirely to operator-supplied templates.

use std::collections::HashMap;

use serde::Deserialize;

/// An ordered set of fallback templates for one DDL operation. Empty
/// means that operation is disabled for the table kind it belongs to.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct TemplateSet(pub Vec<String>);

impl TemplateSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render every template in the set against `ctx`, in order. The
    /// caller tries each rendered statement in turn until one executes
    /// without a permanent error.
    pub fn render_all(&self, ctx: &RenderContext) -> Vec<String> {
        self.0.iter().map(|tpl| ctx.render(tpl)).collect()
    }
}

/// Double-quote an identifier, doubling any embedded quote.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A schema-qualified, quoted identifier: `"schema"."name"`.
pub fn qualify(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    vars: HashMap<String, String>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    pub fn render(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (key, value) in &self.vars {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_placeholders() {
        let ctx = RenderContext::new()
            .set("table", "cpu")
            .set("columns", "time TIMESTAMPTZ, usage DOUBLE PRECISION");
        let rendered = ctx.render("CREATE TABLE {table} ({columns})");
        assert_eq!(
            rendered,
            "CREATE TABLE cpu (time TIMESTAMPTZ, usage DOUBLE PRECISION)"
        );
    }

    #[test]
    fn empty_template_set_means_disabled() {
        let set = TemplateSet::default();
        assert!(set.is_empty());
        assert!(set.render_all(&RenderContext::new()).is_empty());
    }

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("cpu"), "\"cpu\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn qualify_joins_schema_and_name() {
        assert_eq!(qualify("public", "cpu"), "\"public\".\"cpu\"");
    }
}
