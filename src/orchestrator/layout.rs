//! Two-pass layout generation.
//!
//! Pass A asks the structure model for a complete layout document; when the
//! reply is not a JSON object with a `sections` array the hand-written
//! default for the requested layout type stands in.  Pass B asks the
//! enhancement model for a partial document which is deep-merged on top.
//! Whatever survives is then run through [`apply_context_overrides`], which
//! is deterministic and never fails.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{parse_with_fallback, Parsed};
use crate::context::VendorContext;
use crate::models::{ChatMessage, ChatModel, CompletionOptions};
use crate::{LayoutContext, LayoutRequest, LayoutType};

/// Reported in `generated_by` when pass A fell back to the built-in layout.
pub const DEFAULT_TEMPLATE: &str = "default-template";

/// Catalog names handed to the models; the layout only needs a flavour.
const MAX_PROMPT_ITEMS: usize = 20;

const STRUCTURE_OPTIONS: CompletionOptions = CompletionOptions {
    temperature: 0.4,
    max_tokens: 1500,
    json_response: true,
};

const ENHANCE_OPTIONS: CompletionOptions = CompletionOptions {
    temperature: 0.6,
    max_tokens: 1000,
    json_response: true,
};

const STRUCTURE_SYSTEM_PROMPT: &str = "You design storefront layouts for a restaurant ordering app. \
Reply with one JSON object and nothing else. It must contain a `sections` array \
(each section has `type`, `id`, `title` and optional `props`), a `styling` object, \
an `interactions` object and an `animations` object.";

const ENHANCE_SYSTEM_PROMPT: &str = "You refine storefront layouts for a restaurant ordering app. \
You receive a layout as JSON together with the guest's context. Reply with one JSON object \
holding only the fields you want to change (for example styling colours, section titles or \
animation timing). Reply with {} if nothing should change.";

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutOutcome {
    pub layout: Value,
    pub generated_by: Vec<String>,
    pub structure_fallback: bool,
    pub enhance_applied: bool,
}

/// Shape pass A must have to be accepted.
#[derive(Debug, Deserialize)]
struct LayoutDocument {
    sections: Vec<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl LayoutDocument {
    fn into_value(self) -> Value {
        let mut map = self.rest;
        map.insert("sections".into(), Value::Array(self.sections));
        Value::Object(map)
    }
}

#[derive(Clone)]
pub struct LayoutOrchestrator {
    structure: Option<Arc<dyn ChatModel>>,
    enhance: Option<Arc<dyn ChatModel>>,
    timeout: Duration,
}

impl LayoutOrchestrator {
    pub fn new(
        structure: Option<Arc<dyn ChatModel>>,
        enhance: Option<Arc<dyn ChatModel>>,
        timeout: Duration,
    ) -> Self {
        Self {
            structure,
            enhance,
            timeout,
        }
    }

    pub async fn generate(&self, ctx: &VendorContext, req: &LayoutRequest) -> LayoutOutcome {
        let context_json = prompt_context(ctx, req);
        let mut generated_by = Vec::with_capacity(2);

        // Pass A: structure
        let messages = [
            ChatMessage::system(STRUCTURE_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Design a `{}` layout.\n\nContext:\n{}",
                req.layout_type.as_str(),
                context_json
            )),
        ];
        let call = super::invoke(
            self.structure.as_ref(),
            "layout_structure",
            &messages,
            &STRUCTURE_OPTIONS,
            self.timeout,
            "",
        )
        .await;
        let default = || default_layout(req.layout_type);
        let (mut layout, structure_fallback) = if call.succeeded {
            match parse_with_fallback::<Option<LayoutDocument>>(&call.text, None) {
                Parsed::Model(Some(doc)) => {
                    generated_by.push(call.model_used);
                    (doc.into_value(), false)
                }
                _ => {
                    tracing::warn!(model = %call.model_used, "structure pass returned no usable layout, using default");
                    (default(), true)
                }
            }
        } else {
            (default(), true)
        };
        if structure_fallback {
            generated_by.push(DEFAULT_TEMPLATE.to_string());
        }

        // Pass B: enhancement
        let messages = [
            ChatMessage::system(ENHANCE_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Layout:\n{}\n\nContext:\n{}",
                layout, context_json
            )),
        ];
        let call = super::invoke(
            self.enhance.as_ref(),
            "layout_enhance",
            &messages,
            &ENHANCE_OPTIONS,
            self.timeout,
            "",
        )
        .await;
        let mut enhance_applied = false;
        if call.succeeded {
            match parse_with_fallback::<Option<Map<String, Value>>>(&call.text, None) {
                Parsed::Model(Some(patch)) => {
                    let mut merged = layout.clone();
                    deep_merge(&mut merged, Value::Object(patch));
                    if has_sections(&merged) {
                        layout = merged;
                        generated_by.push(call.model_used);
                        enhance_applied = true;
                    } else {
                        tracing::debug!(model = %call.model_used, "enhancement patch dropped sections, keeping structure");
                    }
                }
                _ => {
                    tracing::debug!(model = %call.model_used, "enhancement pass returned no JSON object, keeping structure");
                }
            }
        }

        apply_context_overrides(&mut layout, &req.context_data, req.layout_type);
        LayoutOutcome {
            layout,
            generated_by,
            structure_fallback,
            enhance_applied,
        }
    }
}

fn prompt_context(ctx: &VendorContext, req: &LayoutRequest) -> String {
    let c = &req.context_data;
    let doc = json!({
        "restaurant": ctx.vendor.name,
        "timeOfDay": c.time_of_day,
        "dayOfWeek": c.day_of_week,
        "weather": c.weather,
        "location": c.location,
        "userPreferences": c.user_preferences,
        "menuItems": menu_names(ctx, c),
    });
    serde_json::to_string_pretty(&doc).unwrap_or_else(|_| doc.to_string())
}

/// Item names for the prompt.  Request-supplied items take precedence over
/// the stored catalog.
pub fn menu_names(ctx: &VendorContext, c: &LayoutContext) -> Vec<String> {
    match c.menu_items.as_deref() {
        Some(items) if !items.is_empty() => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                Value::Object(map) => map.get("name").and_then(Value::as_str),
                _ => None,
            })
            .filter(|name| !name.is_empty())
            .take(MAX_PROMPT_ITEMS)
            .map(String::from)
            .collect(),
        _ => ctx
            .items()
            .iter()
            .take(MAX_PROMPT_ITEMS)
            .map(|item| item.name.clone())
            .collect(),
    }
}

/// The built-in layout used when pass A yields nothing usable.
pub fn default_layout(layout_type: LayoutType) -> Value {
    let hero = json!({
        "type": "hero",
        "id": "hero-main",
        "title": "Welcome",
        "props": {"showLogo": true, "ctaText": "View menu"}
    });
    let featured = json!({
        "type": "featured-items",
        "id": "featured",
        "title": "Chef's picks",
        "props": {"maxItems": 4}
    });
    let menu = json!({
        "type": "menu-grid",
        "id": "menu",
        "title": "Our menu",
        "props": {"columns": 2, "groupByCategory": true}
    });
    let promo = json!({
        "type": "promo-banner",
        "id": "promo",
        "title": "Today's specials",
        "props": {"dismissible": true}
    });
    let sections = match layout_type {
        LayoutType::Hero => vec![hero, featured],
        LayoutType::Menu => vec![menu],
        LayoutType::Promo => vec![promo, featured],
        LayoutType::Full => vec![hero, promo, featured, menu],
    };
    json!({
        "sections": sections,
        "styling": {
            "theme": "light",
            "primaryColor": "#b5523b",
            "secondaryColor": "#f4e9dc",
            "fontFamily": "Inter, sans-serif",
            "spacing": "comfortable"
        },
        "interactions": {
            "hoverEffects": true,
            "quickAdd": true,
            "stickyCart": true
        },
        "animations": {
            "entrance": "fade-in",
            "durationMs": 300,
            "stagger": true
        }
    })
}

/// Returned by the handler when the pipeline itself failed.
pub fn emergency_layout() -> Value {
    json!({
        "sections": [
            {"type": "menu-grid", "id": "menu", "title": "Our menu", "props": {"columns": 1}}
        ],
        "styling": {"theme": "light"},
        "interactions": {},
        "animations": {"entrance": "none"}
    })
}

fn has_sections(layout: &Value) -> bool {
    layout.get("sections").is_some_and(Value::is_array)
}

/// Objects merge key by key; anything else in `patch` replaces the target.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Deterministic post-processing from the request context.
pub fn apply_context_overrides(layout: &mut Value, c: &LayoutContext, layout_type: LayoutType) {
    if !layout.is_object() {
        *layout = default_layout(layout_type);
    }
    let Some(doc) = layout.as_object_mut() else {
        return;
    };

    if let Some(theme) = c.time_of_day.as_deref().and_then(theme_for) {
        let styling = doc
            .entry("styling")
            .or_insert_with(|| Value::Object(Map::new()));
        if !styling.is_object() {
            *styling = Value::Object(Map::new());
        }
        if let Some(styling) = styling.as_object_mut() {
            styling.insert("theme".into(), Value::String(theme.into()));
        }
    }

    if let Some(weather) = &c.weather {
        let suggestions = weather_suggestions(weather.condition.as_deref(), weather.temperature);
        if !suggestions.is_empty() {
            doc.insert("contentSuggestions".into(), json!(suggestions));
        }
    }

    if let Some(location) = &c.location {
        let language = location
            .language
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or("en");
        doc.insert(
            "locale".into(),
            json!({
                "country": location.country,
                "language": language,
                "rtl": is_rtl(language),
            }),
        );
    }

    doc.insert(
        "layoutType".into(),
        Value::String(layout_type.as_str().into()),
    );
}

fn theme_for(time_of_day: &str) -> Option<&'static str> {
    match time_of_day.to_ascii_lowercase().as_str() {
        "morning" | "afternoon" => Some("light"),
        "evening" | "night" => Some("dark"),
        _ => None,
    }
}

fn weather_suggestions(condition: Option<&str>, temperature: Option<f64>) -> Vec<&'static str> {
    let condition = condition.unwrap_or_default().to_ascii_lowercase();
    if ["rain", "storm", "snow"].iter().any(|w| condition.contains(w)) {
        return vec!["comfort-food", "hot-beverages"];
    }
    match temperature {
        Some(t) if t >= 25.0 && (condition.contains("sun") || condition.contains("clear")) => {
            vec!["cold-drinks", "salads", "ice-cream"]
        }
        Some(t) if t <= 10.0 => vec!["soups", "hot-beverages"],
        _ => Vec::new(),
    }
}

fn is_rtl(language: &str) -> bool {
    let primary = language.split(['-', '_']).next().unwrap_or_default();
    matches!(
        primary.to_ascii_lowercase().as_str(),
        "ar" | "he" | "fa" | "ur"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelError;
    use crate::store::{CatalogItem, Vendor};
    use crate::util::Outcome;
    use crate::{Location, Weather};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        reply: Result<&'static str, ()>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, reply: Result<&'static str, ()>) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatModel for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        async fn complete(&self, _: &[ChatMessage], _: &CompletionOptions) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .map(String::from)
                .map_err(|_| ModelError::EmptyResponse(self.name.into()))
        }
    }

    fn ctx() -> VendorContext {
        VendorContext {
            vendor: Vendor {
                id: "v1".into(),
                name: "Casa Verde".into(),
            },
            catalog: Outcome::Ok(vec![CatalogItem {
                id: "m1".into(),
                name: "Paella".into(),
                price: Some(18.0),
                category: Some("Mains".into()),
                description: None,
            }]),
        }
    }

    fn request(layout_type: LayoutType, time_of_day: &str) -> LayoutRequest {
        LayoutRequest {
            vendor_id: "v1".into(),
            layout_type,
            context_data: LayoutContext {
                time_of_day: Some(time_of_day.into()),
                day_of_week: Some("friday".into()),
                ..Default::default()
            },
        }
    }

    fn orchestrator(a: Arc<Scripted>, b: Arc<Scripted>) -> LayoutOrchestrator {
        LayoutOrchestrator::new(Some(a), Some(b), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn non_json_structure_uses_default_for_type() {
        let a = Scripted::new("structurer", Ok("Here is a lovely layout for you!"));
        let b = Scripted::new("enhancer", Err(()));
        let out = orchestrator(a, b)
            .generate(&ctx(), &request(LayoutType::Menu, "evening"))
            .await;

        assert!(out.structure_fallback);
        assert!(!out.enhance_applied);
        assert_eq!(out.generated_by, vec![DEFAULT_TEMPLATE.to_string()]);

        let mut expected = default_layout(LayoutType::Menu);
        apply_context_overrides(&mut expected, &request(LayoutType::Menu, "evening").context_data, LayoutType::Menu);
        assert_eq!(out.layout, expected);
        assert_eq!(out.layout["styling"]["theme"], "dark");
        assert_eq!(out.layout["layoutType"], "menu");
    }

    #[tokio::test]
    async fn enhancement_failure_keeps_structure_unchanged() {
        let structure = r##"{"sections":[{"type":"hero","id":"h","title":"Hola"}],"styling":{"primaryColor":"#123456"}}"##;
        let a = Scripted::new("structurer", Ok(structure));
        let b = Scripted::new("enhancer", Err(()));
        let req = request(LayoutType::Hero, "morning");
        let out = orchestrator(a.clone(), b.clone()).generate(&ctx(), &req).await;

        assert!(!out.structure_fallback);
        assert!(!out.enhance_applied);
        assert_eq!(out.generated_by, vec!["structurer".to_string()]);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);

        let mut expected: Value = serde_json::from_str(structure).unwrap();
        apply_context_overrides(&mut expected, &req.context_data, LayoutType::Hero);
        assert_eq!(out.layout, expected);
        assert_eq!(out.layout["styling"]["primaryColor"], "#123456");
        assert_eq!(out.layout["styling"]["theme"], "light");
    }

    #[tokio::test]
    async fn enhancement_that_drops_sections_is_ignored() {
        let structure = r#"{"sections":[{"type":"menu","id":"m"}]}"#;
        for patch in [r#"{"sections":null}"#, r#"{"sections":"x","styling":{"theme":"neon"}}"#] {
            let a = Scripted::new("structurer", Ok(structure));
            let b = Scripted::new("enhancer", Ok(patch));
            let req = request(LayoutType::Menu, "noon");
            let out = orchestrator(a, b).generate(&ctx(), &req).await;

            assert!(!out.enhance_applied);
            assert_eq!(out.generated_by, vec!["structurer".to_string()]);
            let mut expected: Value = serde_json::from_str(structure).unwrap();
            apply_context_overrides(&mut expected, &req.context_data, LayoutType::Menu);
            assert_eq!(out.layout, expected);
            assert_eq!(out.layout["sections"].as_array().map(Vec::len), Some(1));
        }
    }

    #[tokio::test]
    async fn enhancement_object_is_merged() {
        let a = Scripted::new("structurer", Ok(r##"{"sections":[],"styling":{"theme":"light","primaryColor":"#000"}}"##));
        let b = Scripted::new("enhancer", Ok("```json\n{\"styling\":{\"primaryColor\":\"#fff\"},\"animations\":{\"entrance\":\"slide\"}}\n```"));
        let out = orchestrator(a, b)
            .generate(&ctx(), &request(LayoutType::Full, "noon"))
            .await;
        assert!(out.enhance_applied);
        assert_eq!(out.generated_by, vec!["structurer".to_string(), "enhancer".to_string()]);
        assert_eq!(out.layout["styling"]["primaryColor"], "#fff");
        // unknown time of day leaves the model's theme alone
        assert_eq!(out.layout["styling"]["theme"], "light");
        assert_eq!(out.layout["animations"]["entrance"], "slide");
    }

    #[tokio::test]
    async fn structure_without_sections_is_rejected() {
        let a = Scripted::new("structurer", Ok(r#"{"styling":{}}"#));
        let b = Scripted::new("enhancer", Ok("[1,2]"));
        let out = orchestrator(a, b)
            .generate(&ctx(), &request(LayoutType::Promo, "night"))
            .await;
        assert!(out.structure_fallback);
        assert!(!out.enhance_applied);
        assert_eq!(out.layout["sections"][0]["type"], "promo-banner");
    }

    #[tokio::test]
    async fn unconfigured_models_still_produce_a_layout() {
        let out = LayoutOrchestrator::new(None, None, Duration::from_secs(1))
            .generate(&ctx(), &request(LayoutType::Full, "afternoon"))
            .await;
        assert!(out.structure_fallback);
        assert_eq!(out.layout["sections"].as_array().map(Vec::len), Some(4));
    }

    #[test]
    fn deep_merge_recurses_into_objects_and_replaces_the_rest() {
        let mut base = json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"});
        deep_merge(&mut base, json!({"a": {"c": [3], "e": true}, "d": {"nested": 1}}));
        assert_eq!(base, json!({"a": {"b": 1, "c": [3], "e": true}, "d": {"nested": 1}}));
    }

    #[test]
    fn weather_and_locale_overrides() {
        let mut layout = default_layout(LayoutType::Hero);
        let c = LayoutContext {
            weather: Some(Weather {
                condition: Some("Light rain".into()),
                temperature: Some(30.0),
            }),
            location: Some(Location {
                city: Some("Dubai".into()),
                country: Some("AE".into()),
                language: Some("ar-AE".into()),
            }),
            ..Default::default()
        };
        apply_context_overrides(&mut layout, &c, LayoutType::Hero);
        assert_eq!(layout["contentSuggestions"], json!(["comfort-food", "hot-beverages"]));
        assert_eq!(layout["locale"], json!({"country": "AE", "language": "ar-AE", "rtl": true}));

        assert_eq!(
            weather_suggestions(Some("sunny"), Some(27.0)),
            vec!["cold-drinks", "salads", "ice-cream"]
        );
        assert_eq!(weather_suggestions(Some("cloudy"), Some(4.0)), vec!["soups", "hot-beverages"]);
        assert!(weather_suggestions(Some("cloudy"), Some(18.0)).is_empty());
    }

    #[test]
    fn supplied_menu_items_override_catalog() {
        let mut c = LayoutContext::default();
        assert_eq!(menu_names(&ctx(), &c), vec!["Paella".to_string()]);
        c.menu_items = Some(vec![json!({"name": "Tapas"}), json!("Sangria"), json!(42)]);
        assert_eq!(menu_names(&ctx(), &c), vec!["Tapas".to_string(), "Sangria".to_string()]);
    }
}
