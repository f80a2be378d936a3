// OpenAPI schema contract test

use utoipa::OpenApi;

#[test]
fn openapi_schema_is_valid_json() {
    let schema = serde_json::to_string_pretty(&metis_backend::ApiDoc::openapi())
        .expect("OpenAPI schema should serialize to JSON");
    assert!(!schema.is_empty(), "Schema should not be empty");
}

#[test]
fn openapi_schema_contains_required_fields() {
    let schema = serde_json::to_string_pretty(&metis_backend::ApiDoc::openapi())
        .expect("OpenAPI schema should serialize to JSON");
    assert!(schema.contains("openapi"), "Schema should contain 'openapi' version field");
    assert!(schema.contains("/api/health"), "Schema should document /api/health endpoint");
    assert!(schema.contains("Metis"), "Schema should contain project name");
}

#[test]
fn openapi_schema_documents_key_endpoints() {
    let schema = serde_json::to_string_pretty(&metis_backend::ApiDoc::openapi())
        .expect("OpenAPI schema should serialize to JSON");
    assert!(schema.contains("/api/metis/chat"), "Schema should document /api/metis/chat");
    assert!(schema.contains("/api/metis/models"), "Schema should document /api/metis/models");
    assert!(schema.contains("/api/metis/sessions"), "Schema should document /api/metis/sessions");
    assert!(
        schema.contains("/api/metis/sessions/clear"),
        "Schema should document /api/metis/sessions/clear"
    );
}

#[test]
fn openapi_schema_includes_chat_event() {
    let doc = metis_backend::ApiDoc::openapi();
    let value = serde_json::to_value(&doc).expect("Schema should convert to Value");
    assert!(value.get("info").is_some(), "Schema should have 'info' section");
    assert!(
        value["components"]["schemas"].get("ChatEvent").is_some(),
        "Schema should describe ChatEvent"
    );
}
