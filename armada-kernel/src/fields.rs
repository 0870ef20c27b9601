/**
 * FIELDS - Attributs typés et persistables des modèles Armada
 *
 * RÔLE :
 * Ce module définit les briques de base de la couche modèle : chaque attribut
 * d'un modèle est un Field typé qui contrôle le cast, la visibilité JSON et
 * le rendu vers le store clé/valeur.
 *
 * FONCTIONNEMENT :
 * - StrField / IntField = scalaires avec cast strict (échec -> TypeMismatch)
 * - DateTimeField = horodatage parsé/formaté contre un format fixe
 * - DictField = mapping de sous-clés, chaque sous-clé persistée séparément
 * - FieldOps trait = interface commune (set/render/absorb) pour les modèles
 *
 * UTILITÉ DANS ARMADA :
 * ✅ Aucun accès attribut ne contourne le cast : tout passe par le Field
 * ✅ Un champ scalaire rend exactement une entrée store, un mapping N entrées
 * ✅ Le flag hidden exclut les credentials des vues JSON publiques
 */

use serde_json::Value;
use std::collections::BTreeMap;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Format de persistance des horodatages (UTC naïf, microsecondes).
pub const STORE_DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]"
);

/// Horodatage courant dans le format du store.
pub fn now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: String,
    },
}

impl FieldError {
    fn mismatch(field: &str, expected: &'static str, got: &Value) -> Self {
        FieldError::TypeMismatch {
            field: field.to_string(),
            expected,
            got: summarize(got),
        }
    }
}

fn summarize(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "bool".into(),
        Value::Number(_) => "number".into(),
        Value::String(s) => format!("string '{s}'"),
        Value::Array(_) => "array".into(),
        Value::Object(_) => "object".into(),
    }
}

/// Une entrée prête à être persistée dans le store.
/// `key` est relatif au modèle, le préfixe record est appliqué par le modèle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedField {
    pub name: String,
    pub key: String,
    pub value: Option<String>,
    pub is_directory: bool,
}

/// Interface commune à tous les fields, utilisée par les modèles et les
/// store handlers pour lire/écrire sans connaître le type concret.
pub trait FieldOps: Send {
    fn name(&self) -> &str;
    fn is_hidden(&self) -> bool;
    fn is_set(&self) -> bool;

    /// Vrai pour les mappings, qui persistent sous un répertoire de
    /// sous-clés. Permet aux handlers de les réhydrater même vides.
    fn is_directory(&self) -> bool {
        false
    }

    /// Affecte la valeur depuis du JSON, avec cast strict.
    fn set_json(&mut self, value: &Value) -> Result<(), FieldError>;

    /// Valeur typée pour les vues JSON (Null si non affectée).
    fn json_value(&self) -> Value;

    /// Entrées à persister. Un scalaire en rend exactement une,
    /// un mapping en rend une par sous-clé.
    fn render(&self) -> Vec<RenderedField>;

    /// Réhydrate depuis une valeur brute du store. `leaf` est la sous-clé
    /// pour un mapping, None pour un scalaire.
    fn absorb(&mut self, leaf: Option<&str>, raw: &str) -> Result<(), FieldError>;

    fn clear(&mut self);
}

fn scalar_render(name: &str, value: Option<String>) -> Vec<RenderedField> {
    vec![RenderedField {
        name: name.to_string(),
        key: name.to_string(),
        value,
        is_directory: false,
    }]
}

// ---------------------------------------------------------------------------
// StrField

#[derive(Debug, Clone)]
pub struct StrField {
    name: String,
    hidden: bool,
    value: Option<String>,
}

impl StrField {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), hidden: false, value: None }
    }

    pub fn hidden(name: &str) -> Self {
        Self { name: name.to_string(), hidden: true, value: None }
    }

    pub fn get(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set<S: Into<String>>(&mut self, value: S) {
        self.value = Some(value.into());
    }
}

impl FieldOps for StrField {
    fn name(&self) -> &str { &self.name }
    fn is_hidden(&self) -> bool { self.hidden }
    fn is_set(&self) -> bool { self.value.is_some() }

    fn set_json(&mut self, value: &Value) -> Result<(), FieldError> {
        match value {
            Value::Null => self.value = None,
            Value::String(s) => self.value = Some(s.clone()),
            Value::Number(n) => self.value = Some(n.to_string()),
            Value::Bool(b) => self.value = Some(b.to_string()),
            other => return Err(FieldError::mismatch(&self.name, "string", other)),
        }
        Ok(())
    }

    fn json_value(&self) -> Value {
        match &self.value {
            Some(s) => Value::String(s.clone()),
            None => Value::Null,
        }
    }

    fn render(&self) -> Vec<RenderedField> {
        scalar_render(&self.name, self.value.clone())
    }

    fn absorb(&mut self, _leaf: Option<&str>, raw: &str) -> Result<(), FieldError> {
        self.value = Some(raw.to_string());
        Ok(())
    }

    fn clear(&mut self) { self.value = None; }
}

// ---------------------------------------------------------------------------
// IntField

#[derive(Debug, Clone)]
pub struct IntField {
    name: String,
    hidden: bool,
    value: Option<i64>,
}

impl IntField {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), hidden: false, value: None }
    }

    pub fn get(&self) -> Option<i64> {
        self.value
    }

    pub fn set(&mut self, value: i64) {
        self.value = Some(value);
    }
}

/// Cast entier strict : entier, flottant tronqué ou chaîne numérique.
fn cast_int(field: &str, value: &Value) -> Result<i64, FieldError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                Ok(f.trunc() as i64)
            } else {
                Err(FieldError::mismatch(field, "int", value))
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| FieldError::mismatch(field, "int", value)),
        other => Err(FieldError::mismatch(field, "int", other)),
    }
}

impl FieldOps for IntField {
    fn name(&self) -> &str { &self.name }
    fn is_hidden(&self) -> bool { self.hidden }
    fn is_set(&self) -> bool { self.value.is_some() }

    fn set_json(&mut self, value: &Value) -> Result<(), FieldError> {
        if value.is_null() {
            self.value = None;
            return Ok(());
        }
        self.value = Some(cast_int(&self.name, value)?);
        Ok(())
    }

    fn json_value(&self) -> Value {
        match self.value {
            Some(i) => Value::from(i),
            None => Value::Null,
        }
    }

    fn render(&self) -> Vec<RenderedField> {
        scalar_render(&self.name, self.value.map(|i| i.to_string()))
    }

    fn absorb(&mut self, _leaf: Option<&str>, raw: &str) -> Result<(), FieldError> {
        self.value = Some(cast_int(&self.name, &Value::String(raw.to_string()))?);
        Ok(())
    }

    fn clear(&mut self) { self.value = None; }
}

// ---------------------------------------------------------------------------
// DateTimeField

#[derive(Debug, Clone)]
pub struct DateTimeField {
    name: String,
    hidden: bool,
    value: Option<PrimitiveDateTime>,
}

impl DateTimeField {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), hidden: false, value: None }
    }

    pub fn get(&self) -> Option<PrimitiveDateTime> {
        self.value
    }

    pub fn set(&mut self, value: PrimitiveDateTime) {
        self.value = Some(value);
    }

    pub fn set_now(&mut self) {
        self.value = Some(now_utc());
    }

    pub fn formatted(&self) -> Option<String> {
        // Le format est fixe, le formatage ne peut pas échouer dessus.
        self.value.and_then(|v| v.format(STORE_DATE_FORMAT).ok())
    }

    fn parse(&self, raw: &str) -> Result<PrimitiveDateTime, FieldError> {
        PrimitiveDateTime::parse(raw, STORE_DATE_FORMAT).map_err(|_| {
            FieldError::mismatch(&self.name, "datetime", &Value::String(raw.to_string()))
        })
    }
}

impl FieldOps for DateTimeField {
    fn name(&self) -> &str { &self.name }
    fn is_hidden(&self) -> bool { self.hidden }
    fn is_set(&self) -> bool { self.value.is_some() }

    fn set_json(&mut self, value: &Value) -> Result<(), FieldError> {
        match value {
            Value::Null => self.value = None,
            Value::String(s) => self.value = Some(self.parse(s)?),
            other => return Err(FieldError::mismatch(&self.name, "datetime", other)),
        }
        Ok(())
    }

    fn json_value(&self) -> Value {
        match self.formatted() {
            Some(s) => Value::String(s),
            None => Value::Null,
        }
    }

    fn render(&self) -> Vec<RenderedField> {
        scalar_render(&self.name, self.formatted())
    }

    fn absorb(&mut self, _leaf: Option<&str>, raw: &str) -> Result<(), FieldError> {
        self.value = Some(self.parse(raw)?);
        Ok(())
    }

    fn clear(&mut self) { self.value = None; }
}

// ---------------------------------------------------------------------------
// DictField

/// Cast appliqué aux sous-clés d'un DictField.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caster {
    Int,
    Str,
}

#[derive(Debug, Clone)]
pub struct DictField {
    name: String,
    hidden: bool,
    casters: BTreeMap<String, Caster>,
    default_caster: Option<Caster>,
    value: BTreeMap<String, Value>,
}

impl DictField {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            hidden: false,
            casters: BTreeMap::new(),
            default_caster: None,
            value: BTreeMap::new(),
        }
    }

    pub fn hidden(name: &str) -> Self {
        let mut field = Self::new(name);
        field.hidden = true;
        field
    }

    /// Déclare un cast pour une sous-clé précise.
    pub fn with_caster(mut self, key: &str, caster: Caster) -> Self {
        self.casters.insert(key.to_string(), caster);
        self
    }

    /// Cast par défaut appliqué aux sous-clés sans cast dédié.
    pub fn with_default_caster(mut self, caster: Caster) -> Self {
        self.default_caster = Some(caster);
        self
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.value
    }

    pub fn keys(&self) -> Vec<String> {
        self.value.keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.value.contains_key(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) -> Result<(), FieldError> {
        let cast = self.cast_entry(key, &value)?;
        self.value.insert(key.to_string(), cast);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.value.remove(key)
    }

    fn caster_for(&self, key: &str) -> Option<Caster> {
        self.casters.get(key).copied().or(self.default_caster)
    }

    fn cast_entry(&self, key: &str, value: &Value) -> Result<Value, FieldError> {
        match self.caster_for(key) {
            Some(Caster::Int) => Ok(Value::from(cast_int(&self.name, value)?)),
            Some(Caster::Str) => match value {
                Value::String(s) => Ok(Value::String(s.clone())),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(FieldError::mismatch(&self.name, "string", other)),
            },
            None => Ok(value.clone()),
        }
    }
}

/// Représentation store d'une valeur de sous-clé.
fn store_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FieldOps for DictField {
    fn name(&self) -> &str { &self.name }
    fn is_hidden(&self) -> bool { self.hidden }
    fn is_set(&self) -> bool { !self.value.is_empty() }
    fn is_directory(&self) -> bool { true }

    fn set_json(&mut self, value: &Value) -> Result<(), FieldError> {
        let Value::Object(map) = value else {
            return Err(FieldError::mismatch(&self.name, "mapping", value));
        };
        let mut cast = BTreeMap::new();
        for (key, entry) in map {
            cast.insert(key.clone(), self.cast_entry(key, entry)?);
        }
        self.value = cast;
        Ok(())
    }

    fn json_value(&self) -> Value {
        Value::Object(self.value.clone().into_iter().collect())
    }

    fn render(&self) -> Vec<RenderedField> {
        self.value
            .iter()
            .map(|(key, entry)| RenderedField {
                name: self.name.clone(),
                key: format!("{}/{}", self.name, key),
                value: Some(store_repr(entry)),
                is_directory: true,
            })
            .collect()
    }

    fn absorb(&mut self, leaf: Option<&str>, raw: &str) -> Result<(), FieldError> {
        let Some(leaf) = leaf else {
            return Err(FieldError::mismatch(
                &self.name,
                "mapping",
                &Value::String(raw.to_string()),
            ));
        };
        let cast = self.cast_entry(leaf, &Value::String(raw.to_string()))?;
        self.value.insert(leaf.to_string(), cast);
        Ok(())
    }

    fn clear(&mut self) { self.value.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn str_field_casts_scalars() {
        let mut field = StrField::new("os");
        field.set_json(&json!("fedora")).unwrap();
        assert_eq!(field.get(), Some("fedora"));

        field.set_json(&json!(10)).unwrap();
        assert_eq!(field.get(), Some("10"));

        assert!(field.set_json(&json!(["not", "a", "scalar"])).is_err());
    }

    #[test]
    fn int_field_casts_or_fails() {
        let mut field = IntField::new("cpus");
        field.set_json(&json!("10")).unwrap();
        assert_eq!(field.get(), Some(10));

        field.set_json(&json!(4)).unwrap();
        assert_eq!(field.get(), Some(4));

        let err = field.set_json(&json!("error")).unwrap_err();
        assert!(matches!(err, FieldError::TypeMismatch { .. }));
        // La valeur précédente reste en place après un cast raté.
        assert_eq!(field.get(), Some(4));
    }

    #[test]
    fn datetime_field_parses_store_format() {
        let mut field = DateTimeField::new("last_check");
        field.set_json(&json!("2015-12-17T15:48:18.710454")).unwrap();
        assert_eq!(field.get(), Some(datetime!(2015-12-17 15:48:18.710454)));
        assert_eq!(
            field.formatted().as_deref(),
            Some("2015-12-17T15:48:18.710454")
        );

        assert!(field.set_json(&json!("17/12/2015")).is_err());
    }

    #[test]
    fn scalar_field_renders_one_entry() {
        let mut field = StrField::new("status");
        field.set("active");
        let rendered = field.render();
        assert_eq!(
            rendered,
            vec![RenderedField {
                name: "status".into(),
                key: "status".into(),
                value: Some("active".into()),
                is_directory: false,
            }]
        );
    }

    #[test]
    fn dict_field_rejects_non_mapping() {
        let mut field = DictField::new("hostset");
        let err = field.set_json(&json!("error")).unwrap_err();
        assert!(matches!(err, FieldError::TypeMismatch { .. }));
    }

    #[test]
    fn dict_field_casts_and_renders_per_subkey() {
        let mut field = DictField::new("counters")
            .with_caster("a", Caster::Int)
            .with_caster("b", Caster::Str);

        field.set_json(&json!({"a": "1", "b": 2})).unwrap();
        assert_eq!(field.json_value(), json!({"a": 1, "b": "2"}));

        let rendered = field.render();
        assert_eq!(rendered.len(), 2);
        assert!(rendered.iter().all(|r| r.is_directory));
        assert_eq!(rendered[0].key, "counters/a");
        assert_eq!(rendered[0].value.as_deref(), Some("1"));
        assert_eq!(rendered[1].key, "counters/b");
        assert_eq!(rendered[1].value.as_deref(), Some("2"));
    }

    #[test]
    fn dict_field_absorbs_store_entries() {
        let mut field = DictField::new("counters").with_caster("a", Caster::Int);
        field.absorb(Some("a"), "1").unwrap();
        field.absorb(Some("b"), "2").unwrap();
        // Le cast déclaré s'applique au retour du store aussi.
        assert_eq!(field.json_value(), json!({"a": 1, "b": "2"}));
    }
}
