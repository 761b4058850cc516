//! The response schema, as a JSON Schema value and as instruction text.
//!
//! The instruction text is the layer the assembler always sends upstream;
//! the JSON Schema is exported for clients and tooling.

use serde_json::{Value, json};

use crate::envelope::FieldKind;

/// JSON Schema describing [`ResponseEnvelope`](crate::ResponseEnvelope).
pub fn json_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "ResponseEnvelope",
        "type": "object",
        "required": ["type", "safety", "content", "metadata"],
        "properties": {
            "type": { "const": "response" },
            "safety": {
                "type": "object",
                "required": ["is_safe", "danger_level", "detected_concerns", "requires_intervention"],
                "properties": {
                    "is_safe": { "type": "boolean" },
                    "danger_level": { "enum": [null, "warning", "critical", "emergency"] },
                    "detected_concerns": { "type": "array", "items": { "type": "string" } },
                    "requires_intervention": { "type": "boolean" },
                    "safety_message": { "type": ["string", "null"] }
                }
            },
            "content": {
                "type": "object",
                "required": ["text_blocks"],
                "properties": {
                    "text_blocks": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "required": ["type", "content"],
                            "properties": {
                                "type": { "type": "string" },
                                "content": { "type": "string" },
                                "style": { "type": "string" }
                            }
                        }
                    },
                    "form": {
                        "type": "object",
                        "required": ["fields"],
                        "properties": {
                            "id": { "type": "string" },
                            "title": { "type": "string" },
                            "submit_label": { "type": "string" },
                            "fields": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["name", "type"],
                                    "properties": {
                                        "name": { "type": "string" },
                                        "label": { "type": "string" },
                                        "type": { "enum": FieldKind::ALL },
                                        "required": { "type": "boolean" },
                                        "placeholder": { "type": "string" },
                                        "options": {
                                            "type": "array",
                                            "minItems": 1,
                                            "items": {
                                                "anyOf": [
                                                    { "type": "string" },
                                                    {
                                                        "type": "object",
                                                        "required": ["value", "label"],
                                                        "properties": {
                                                            "value": { "type": "string" },
                                                            "label": { "type": "string" }
                                                        }
                                                    }
                                                ]
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    },
                    "media": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["type", "url"],
                            "properties": {
                                "type": { "type": "string" },
                                "url": { "type": "string" },
                                "alt": { "type": "string" },
                                "caption": { "type": "string" }
                            }
                        }
                    },
                    "suggestions": { "type": "array", "items": { "type": "string" } }
                }
            },
            "progress": {
                "type": "object",
                "properties": {
                    "percentage": { "type": "number", "minimum": 0, "maximum": 100 },
                    "current_topic": { "type": ["string", "null"] },
                    "topics_covered": { "type": "integer", "minimum": 0 },
                    "topics_remaining": { "type": "integer", "minimum": 0 }
                }
            },
            "metadata": {
                "type": "object",
                "required": ["model"],
                "properties": {
                    "model": { "type": "string" },
                    "tokens_used": { "type": "integer", "minimum": 0 },
                    "language": { "type": "string" }
                }
            }
        }
    })
}

/// The schema instruction layer sent upstream on every turn.
pub fn schema_instruction() -> String {
    format!(
        r#"RESPONSE FORMAT
Reply with exactly one JSON object and nothing else: no prose before or after it, no code fences.
The object must have this shape:
{{
  "type": "response",
  "safety": {{
    "is_safe": true,
    "danger_level": null,            // or "warning", "critical", "emergency"
    "detected_concerns": [],         // short tags, e.g. "self_harm"
    "requires_intervention": false,
    "safety_message": null           // supportive text when not safe
  }},
  "content": {{
    "text_blocks": [                 // at least one block
      {{ "type": "paragraph", "content": "..." }}
    ],
    "form": {{                        // optional
      "title": "...",
      "fields": [{{ "name": "...", "label": "...", "type": "radio", "options": ["..."] }}]
    }},
    "media": [],                     // optional: {{ "type": "image", "url": "...", "alt": "..." }}
    "suggestions": []                // optional short follow-up replies
  }},
  "progress": {{                      // optional
    "percentage": 0,
    "current_topic": null,
    "topics_covered": 0,
    "topics_remaining": 0
  }},
  "metadata": {{ "model": "...", "language": "en" }}
}}
Form field types: {kinds}. Fields of type radio, checkbox and select need a non-empty "options" list; other field types must not have "options"."#,
        kinds = FieldKind::ALL.join(", ")
    )
}
