//! Fusión incremental de diagramas en JSON y utilidades asociadas.
//!
//! `apply_changes` es una función pura: nunca muta el documento recibido y
//! nunca falla. Un conjunto de cambios vacío o malformado produce una copia
//! del documento original.
//!
//! Formato del conjunto de cambios:
//!
//! ```json
//! { "changes": {
//!     "classes":       { "add": [ {...} ], "remove": ["Nombre"] },
//!     "actors":        { "add": [ {...} ], "remove": ["Nombre"] },
//!     "useCases":      { "add": [ {...} ], "remove": ["Nombre"] },
//!     "relationships": { "add": [ {...} ], "remove": [ {"from": "A", "to": "B", "type": "t"} ] }
//! } }
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

/// Categorías de entidades identificadas por su campo `name`.
const ENTITY_CATEGORIES: [&str; 3] = ["classes", "actors", "useCases"];
const RELATIONSHIPS: &str = "relationships";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramType {
    Class,
    Sequence,
    Database,
    UseCase,
    Activity,
}

impl DiagramType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Class => "UML Class Diagram",
            Self::Sequence => "UML Sequence Diagram",
            Self::Database => "Database Diagram",
            Self::UseCase => "Use Case Diagram",
            Self::Activity => "Activity Diagram",
        }
    }

    /// Forma corta usada en nombres de fichero.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Sequence => "sequence",
            Self::Database => "database",
            Self::UseCase => "use_case",
            Self::Activity => "activity",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [
            Self::Class,
            Self::Sequence,
            Self::Database,
            Self::UseCase,
            Self::Activity,
        ]
        .into_iter()
        .find(|t| t.label() == label)
    }
}

// ---------------------------------------------------------------------
// FUSIÓN
// ---------------------------------------------------------------------

/// Aplica un conjunto de cambios a un diagrama y devuelve un documento nuevo.
pub fn apply_changes(current: &Value, changes: &Value) -> Value {
    let mut modified = current.clone();

    let Some(change_data) = changes.get("changes").and_then(Value::as_object) else {
        return modified;
    };
    let Some(doc) = modified.as_object_mut() else {
        return modified;
    };

    for category in ENTITY_CATEGORIES {
        if let Some(entity_changes) = change_data.get(category).and_then(Value::as_object) {
            merge_entities(doc, category, entity_changes);
        }
    }

    if let Some(rel_changes) = change_data.get(RELATIONSHIPS).and_then(Value::as_object) {
        merge_relationships(doc, rel_changes);
    }

    modified
}

fn merge_entities(doc: &mut Map<String, Value>, category: &str, entity_changes: &Map<String, Value>) {
    if let Some(remove) = entity_changes.get("remove").and_then(Value::as_array) {
        if let Some(existing) = doc.get_mut(category).and_then(Value::as_array_mut) {
            existing.retain(|entity| match entity.get("name") {
                Some(name) => !remove.contains(name),
                None => true,
            });
        }
    }

    if let Some(add) = entity_changes.get("add").and_then(Value::as_array) {
        let Some(existing) = array_entry(doc, category) else {
            return;
        };
        for candidate in add {
            let name = candidate.get("name");
            // El primero en llegar gana: un alta nunca sobrescribe.
            if existing.iter().any(|entity| entity.get("name") == name) {
                continue;
            }
            existing.push(candidate.clone());
        }
    }
}

fn merge_relationships(doc: &mut Map<String, Value>, rel_changes: &Map<String, Value>) {
    if let Some(remove) = rel_changes.get("remove").and_then(Value::as_array) {
        if let Some(existing) = doc.get_mut(RELATIONSHIPS).and_then(Value::as_array_mut) {
            existing.retain(|rel| !remove.iter().any(|criterion| relationship_matches(rel, criterion)));
        }
    }

    if let Some(add) = rel_changes.get("add").and_then(Value::as_array) {
        let Some(existing) = array_entry(doc, RELATIONSHIPS) else {
            return;
        };
        for candidate in add {
            if existing.iter().any(|rel| relationship_matches(rel, candidate)) {
                continue;
            }
            existing.push(candidate.clone());
        }
    }
}

/// Devuelve el array de `key`, creándolo si falta. Si la clave existe pero no
/// es un array se deja intacta.
fn array_entry<'a>(doc: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Vec<Value>> {
    doc.entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
}

/// Extremos de una relación bajo cualquiera de las dos convenciones:
/// `fromClass`/`toClass` (diagramas de clases) o `from`/`to` (casos de uso).
fn criterion_endpoints(rel: &Value) -> Option<(&Value, &Value)> {
    let from = rel.get("from").or_else(|| rel.get("fromClass"))?;
    let to = rel.get("to").or_else(|| rel.get("toClass"))?;
    Some((from, to))
}

/// Una relación almacenada coincide con un criterio si el tipo es idéntico y
/// los extremos del criterio coinciden con los de la relación en cualquiera
/// de las dos convenciones de nombres.
pub fn relationship_matches(stored: &Value, criterion: &Value) -> bool {
    if stored.get("type") != criterion.get("type") {
        return false;
    }
    let Some((from, to)) = criterion_endpoints(criterion) else {
        return false;
    };

    let class_style = stored.get("fromClass") == Some(from) && stored.get("toClass") == Some(to);
    let plain_style = stored.get("from") == Some(from) && stored.get("to") == Some(to);
    class_style || plain_style
}

// ---------------------------------------------------------------------
// UTILIDADES PARA EL AGENTE DE DIAGRAMAS
// ---------------------------------------------------------------------

/// Clasifica la petición del usuario por palabras clave.
pub fn determine_diagram_type(prompt: &str) -> DiagramType {
    let lower = prompt.to_lowercase();
    if lower.contains("class") {
        DiagramType::Class
    } else if lower.contains("sequence") {
        DiagramType::Sequence
    } else if lower.contains("database") || lower.contains("er") || lower.contains("entity") {
        DiagramType::Database
    } else if lower.contains("use case") || lower.contains("usecase") {
        DiagramType::UseCase
    } else if lower.contains("activity") {
        DiagramType::Activity
    } else {
        DiagramType::Class
    }
}

/// Extrae el primer objeto JSON válido de una respuesta del LLM: la respuesta
/// entera, un bloque ```json o el primer objeto con llaves equilibradas.
pub fn extract_json(content: &str) -> Option<String> {
    if serde_json::from_str::<Value>(content).is_ok() {
        return Some(content.to_string());
    }

    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("regex de bloque JSON válida")
    });
    for caps in fence.captures_iter(content) {
        let candidate = &caps[1];
        if serde_json::from_str::<Value>(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }

    let start = content.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in content[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let candidate = &content[start..start + offset + 1];
                    return serde_json::from_str::<Value>(candidate)
                        .ok()
                        .map(|_| candidate.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Comprueba las claves de primer nivel que exige cada tipo de diagrama.
pub fn validate_diagram(diagram: &Value, diagram_type: DiagramType) -> bool {
    let Some(obj) = diagram.as_object() else {
        return false;
    };
    let required: &[&str] = match diagram_type {
        DiagramType::Class => &["diagramName", "classes"],
        DiagramType::Sequence => &["diagramName", "participants", "messages"],
        DiagramType::Database => &["diagramName", "tables"],
        DiagramType::UseCase => &["diagramName", "actors", "useCases"],
        DiagramType::Activity => &["diagramName"],
    };
    required.iter().all(|key| obj.contains_key(*key))
}

/// Contenido inicial de un diagrama recién creado.
pub fn blank_diagram(diagram_type: DiagramType, name: &str) -> Value {
    match diagram_type {
        DiagramType::UseCase => json!({
            "diagramType": diagram_type.label(),
            "diagramName": name,
            "actors": [],
            "useCases": [],
            "relationships": []
        }),
        _ => json!({
            "diagramType": diagram_type.label(),
            "diagramName": name,
            "classes": [],
            "relationships": []
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_never_overwrites_existing_entity() {
        let current = json!({"classes": [{"name": "User"}]});
        let changes = json!({"changes": {"classes": {"add": [
            {"name": "User", "attributes": [{"name": "email", "type": "String"}]}
        ]}}});

        let merged = apply_changes(&current, &changes);

        assert_eq!(merged["classes"], json!([{"name": "User"}]));
    }

    #[test]
    fn removal_matches_across_naming_conventions() {
        let current = json!({"relationships": [
            {"fromClass": "A", "toClass": "B", "type": "association"},
            {"fromClass": "A", "toClass": "B", "type": "composition"}
        ]});
        let changes = json!({"changes": {"relationships": {"remove": [
            {"from": "A", "to": "B", "type": "association"}
        ]}}});

        let merged = apply_changes(&current, &changes);

        assert_eq!(
            merged["relationships"],
            json!([{"fromClass": "A", "toClass": "B", "type": "composition"}])
        );
    }

    #[test]
    fn removal_also_matches_plain_and_class_style_criteria() {
        let current = json!({"relationships": [
            {"from": "Admin", "to": "Login", "type": "association"},
            {"fromClass": "X", "toClass": "Y", "type": "dependency"}
        ]});
        let changes = json!({"changes": {"relationships": {"remove": [
            {"from": "Admin", "to": "Login", "type": "association"},
            {"fromClass": "X", "toClass": "Y", "type": "dependency"}
        ]}}});

        let merged = apply_changes(&current, &changes);

        assert_eq!(merged["relationships"], json!([]));
    }

    #[test]
    fn removal_without_endpoints_removes_nothing() {
        let current = json!({"relationships": [
            {"fromClass": "A", "toClass": "B", "type": "association"}
        ]});
        let changes = json!({"changes": {"relationships": {"remove": [{"type": "association"}]}}});

        assert_eq!(apply_changes(&current, &changes), current);
    }

    #[test]
    fn relationship_add_skips_duplicates_only() {
        let current = json!({"relationships": [
            {"fromClass": "A", "toClass": "B", "type": "association"}
        ]});
        let changes = json!({"changes": {"relationships": {"add": [
            {"fromClass": "A", "toClass": "B", "type": "association", "label": "dup"},
            {"fromClass": "C", "toClass": "D", "type": "association"},
            {"fromClass": "A", "toClass": "B", "type": "inheritance"}
        ]}}});

        let merged = apply_changes(&current, &changes);
        let rels = merged["relationships"].as_array().unwrap();

        assert_eq!(rels.len(), 3);
        assert!(rels[0].get("label").is_none());
        assert_eq!(rels[1]["fromClass"], "C");
        assert_eq!(rels[2]["type"], "inheritance");
    }

    #[test]
    fn removals_apply_before_additions_and_order_is_kept() {
        let current = json!({
            "diagramType": "Use Case Diagram",
            "actors": [{"name": "User"}, {"name": "Guest"}, {"name": "Admin"}],
            "useCases": [{"name": "Login"}]
        });
        let changes = json!({"changes": {
            "actors": {"remove": ["Guest"], "add": [{"name": "Auditor"}, {"name": "Guest", "v": 2}]},
            "useCases": {"add": [{"name": "Logout"}, {"name": "Logout", "dup": true}]}
        }});

        let merged = apply_changes(&current, &changes);

        let actors: Vec<_> = merged["actors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert_eq!(actors, vec!["User", "Admin", "Auditor", "Guest"]);
        assert_eq!(merged["actors"][3]["v"], 2);
        assert_eq!(merged["useCases"], json!([{"name": "Login"}, {"name": "Logout"}]));
        assert_eq!(merged["diagramType"], "Use Case Diagram");
    }

    #[test]
    fn remove_on_missing_category_is_noop_and_add_creates_it() {
        let current = json!({"diagramName": "empty"});
        let removal = json!({"changes": {"classes": {"remove": ["User"]}}});
        assert_eq!(apply_changes(&current, &removal), current);

        let addition = json!({"changes": {"classes": {"add": [{"name": "User"}]}}});
        let merged = apply_changes(&current, &addition);
        assert_eq!(merged["classes"], json!([{"name": "User"}]));
        assert!(current.get("classes").is_none());
    }

    #[test]
    fn malformed_change_sets_leave_document_unchanged() {
        let current = json!({"classes": [{"name": "User"}]});
        for changes in [
            json!({}),
            json!({"changes": "nope"}),
            json!({"changes": {"widgets": {"add": [{"name": "W"}]}}}),
            json!({"changes": {"classes": {"add": "User", "remove": 3}}}),
            json!(null),
        ] {
            assert_eq!(apply_changes(&current, &changes), current);
        }
        assert_eq!(apply_changes(&json!([1, 2]), &json!({"changes": {}})), json!([1, 2]));
    }

    #[test]
    fn diagram_type_keywords() {
        assert_eq!(determine_diagram_type("UML Class Diagram"), DiagramType::Class);
        assert_eq!(determine_diagram_type("a sequence flow"), DiagramType::Sequence);
        assert_eq!(determine_diagram_type("Use Case"), DiagramType::UseCase);
        assert_eq!(determine_diagram_type("ER model"), DiagramType::Database);
        assert_eq!(determine_diagram_type("usecase map"), DiagramType::UseCase);
        assert_eq!(determine_diagram_type("flowchart"), DiagramType::Class);
        // Cualquier "er" gana a los casos de uso.
        assert_eq!(determine_diagram_type("use case for user login"), DiagramType::Database);
        assert_eq!(
            DiagramType::from_label("Use Case Diagram"),
            Some(DiagramType::UseCase)
        );
    }

    #[test]
    fn extract_json_from_llm_replies() {
        assert_eq!(extract_json(r#"{"a":1}"#).unwrap(), r#"{"a":1}"#);
        let fenced = "Here you go:\n```json\n{\"changes\": {}}\n```\nbye";
        assert_eq!(extract_json(fenced).unwrap(), "{\"changes\": {}}");
        let inline = "prefix {\"x\": {\"y\": 2}} suffix";
        assert_eq!(extract_json(inline).unwrap(), "{\"x\": {\"y\": 2}}");
        assert!(extract_json("no json at all").is_none());
    }

    #[test]
    fn validation_and_blank_documents() {
        let blank = blank_diagram(DiagramType::UseCase, "Flows");
        assert!(validate_diagram(&blank, DiagramType::UseCase));
        assert!(!validate_diagram(&blank, DiagramType::Database));
        assert!(validate_diagram(
            &blank_diagram(DiagramType::Class, "Model"),
            DiagramType::Class
        ));
        assert!(!validate_diagram(&json!("text"), DiagramType::Class));
    }
}
