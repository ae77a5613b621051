//! `ExtentTypeLibrary`: an immutable, uniquely-keyed set of extent types, plus
//! a parser for the XML-shaped type descriptors extent producers register
//! with it (spec §3: "Type registry ... parses extent-type descriptors
//! (XML-shaped schemas)").
//!
//! The descriptor grammar this crate accepts is deliberately narrow — one
//! `<ExtentType>` element per type, one `<field>` element per column, a
//! fixed attribute set — so a small hand-written scanner suffices; pulling
//! in a general-purpose XML crate for a single closed grammar would be
//! over-engineering for what the format actually needs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{ExtentType, Field, FieldType, PackHints};

/// A set of [`ExtentType`]s, unique by `(namespace, name, version)`.
/// Written exactly once near the head of a file (spec §3).
#[derive(Debug, Default)]
pub struct ExtentTypeLibrary {
    by_key: HashMap<(String, String, u32, u32), Arc<ExtentType>>,
    by_name: HashMap<String, Arc<ExtentType>>,
}

impl ExtentTypeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Re-registering the identical `(namespace, name,
    /// version)` key is a no-op; registering a different type under a name
    /// already bound to another key is rejected, since the index-extent and
    /// reader both resolve extents by name alone.
    pub fn register(&mut self, ty: Arc<ExtentType>) -> Result<()> {
        let key = ty.key();
        if let Some(existing) = self.by_name.get(&ty.name) {
            if existing.key() != key {
                return Err(Error::TypeMismatch {
                    expected: format!("{:?}", existing.key()),
                    found: format!("{:?}", key),
                });
            }
            return Ok(());
        }
        self.by_name.insert(ty.name.clone(), Arc::clone(&ty));
        self.by_key.insert(key, ty);
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<ExtentType>> {
        self.by_name.get(name).cloned()
    }

    /// Resolve by the exact `(namespace, name, major, minor)` key encoded in
    /// a packed extent's on-disk type name (spec §4.1).
    pub fn lookup(&self, namespace: &str, name: &str, major: u32, minor: u32) -> Option<Arc<ExtentType>> {
        self.by_key
            .get(&(namespace.to_string(), name.to_string(), major, minor))
            .cloned()
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<ExtentType>> {
        self.by_key.values()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Concatenate every registered type's descriptor, suitable for passing
    /// straight to [`crate::file::sink::Sink::create`] or
    /// [`crate::file::sink::WriterTurn::rotate`] as `library_xml`.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        for ty in self.by_key.values() {
            out.push_str(&ty.to_xml());
        }
        out
    }

    /// Parse a descriptor document containing one or more `<ExtentType>`
    /// elements and register every type it declares.
    pub fn parse_and_register(&mut self, descriptor: &str) -> Result<()> {
        for ty in parse_descriptors(descriptor)? {
            self.register(ty)?;
        }
        Ok(())
    }
}

/// Parse a document of the form:
///
/// ```xml
/// <ExtentType name="Foo" namespace="example.com" version="1.0">
///   <field type="int32" name="a" />
///   <field type="variable32" name="b" nullable="true" pack_unique="yes" />
///   <field type="int64" name="c" pack_relative="a" />
/// </ExtentType>
/// ```
pub fn parse_descriptors(doc: &str) -> Result<Vec<Arc<ExtentType>>> {
    let mut out = Vec::new();
    let mut rest = doc;
    while let Some(start) = rest.find("<ExtentType") {
        let after_open = &rest[start..];
        let open_end = after_open
            .find('>')
            .ok_or_else(|| Error::RequestError("unterminated <ExtentType> tag".into()))?;
        let open_tag = &after_open[..=open_end];
        let attrs = parse_attrs(open_tag);

        let namespace = attrs.get("namespace").cloned().unwrap_or_default();
        let name = attrs
            .get("name")
            .cloned()
            .ok_or_else(|| Error::RequestError("<ExtentType> missing name attribute".into()))?;
        let version = parse_version(attrs.get("version").map(String::as_str).unwrap_or("1.0"))?;

        let body_start = start + open_end + 1;
        let close_rel = rest[body_start..]
            .find("</ExtentType>")
            .ok_or_else(|| Error::RequestError("missing </ExtentType>".into()))?;
        let body = &rest[body_start..body_start + close_rel];

        let fields = parse_fields(body)?;
        out.push(ExtentType::new(namespace, name, version, fields)?);

        rest = &rest[body_start + close_rel + "</ExtentType>".len()..];
    }
    Ok(out)
}

fn parse_fields(body: &str) -> Result<Vec<Field>> {
    let mut fields = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("<field") {
        let after = &rest[start..];
        let end = after
            .find('>')
            .ok_or_else(|| Error::RequestError("unterminated <field> tag".into()))?;
        let tag = &after[..=end];
        let attrs = parse_attrs(tag);

        let type_str = attrs
            .get("type")
            .ok_or_else(|| Error::RequestError("<field> missing type attribute".into()))?;
        let field_type = FieldType::parse(type_str)
            .ok_or_else(|| Error::UnsupportedTransform(format!("unknown field type '{type_str}'")))?;
        let name = attrs
            .get("name")
            .cloned()
            .ok_or_else(|| Error::RequestError("<field> missing name attribute".into()))?;
        let nullable = attrs
            .get("nullable")
            .map(|v| v == "true" || v == "yes")
            .unwrap_or(false);
        let pack = PackHints {
            relative_to: attrs.get("pack_relative").cloned(),
            unique: attrs
                .get("pack_unique")
                .map(|v| v == "yes" || v == "true")
                .unwrap_or(false),
            scale: attrs
                .get("pack_scale")
                .map(|v| v.parse::<f64>())
                .transpose()
                .map_err(|_| Error::RequestError("pack_scale is not a valid number".into()))?,
        };

        fields.push(Field {
            name,
            field_type,
            nullable,
            pack,
            offset: 0,
            null_bit: None,
        });

        rest = &rest[start + end + 1..];
    }
    Ok(fields)
}

fn parse_version(s: &str) -> Result<(u32, u32)> {
    let mut parts = s.splitn(2, '.');
    let major = parts
        .next()
        .unwrap_or("1")
        .parse()
        .map_err(|_| Error::RequestError(format!("invalid version '{s}'")))?;
    let minor = parts
        .next()
        .unwrap_or("0")
        .parse()
        .map_err(|_| Error::RequestError(format!("invalid version '{s}'")))?;
    Ok((major, minor))
}

/// Extract `key="value"` attribute pairs from a single opening tag string
/// (including the surrounding `<` `/>` / `>`).
fn parse_attrs(tag: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut chars = tag.char_indices().peekable();
    // Skip the tag name itself.
    while let Some(&(_, c)) = chars.peek() {
        if c.is_whitespace() {
            break;
        }
        chars.next();
    }
    let rest = &tag[chars.peek().map(|&(i, _)| i).unwrap_or(tag.len())..];

    let mut cursor = rest;
    loop {
        let cursor_trim = cursor.trim_start();
        let Some(eq) = cursor_trim.find('=') else { break };
        let key = cursor_trim[..eq].trim();
        if key.is_empty() || key == "/" {
            break;
        }
        let after_eq = &cursor_trim[eq + 1..];
        let after_eq = after_eq.trim_start();
        let Some(quote) = after_eq.chars().next() else { break };
        if quote != '"' && quote != '\'' {
            break;
        }
        let Some(end_quote) = after_eq[1..].find(quote) else { break };
        let value = &after_eq[1..1 + end_quote];
        attrs.insert(key.to_string(), value.to_string());
        cursor = &after_eq[1 + end_quote + 1..];
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_type_with_mixed_fields() {
        let doc = r#"
            <ExtentType name="Packet" namespace="example.com" version="2.1">
              <field type="int32" name="seq" />
              <field type="variable32" name="payload" pack_unique="yes" />
              <field type="int64" name="ts" nullable="true" pack_relative="ts" />
            </ExtentType>
        "#;
        let types = parse_descriptors(doc).unwrap();
        assert_eq!(types.len(), 1);
        let t = &types[0];
        assert_eq!(t.name, "Packet");
        assert_eq!(t.namespace, "example.com");
        assert_eq!((t.major_version, t.minor_version), (2, 1));
        assert_eq!(t.fields().len(), 3);
        assert!(t.field("payload").unwrap().pack.unique);
        assert_eq!(t.field("ts").unwrap().pack.relative_to.as_deref(), Some("ts"));
        assert!(t.field("ts").unwrap().nullable);
    }

    #[test]
    fn library_rejects_name_collision_across_different_keys() {
        let mut lib = ExtentTypeLibrary::new();
        let a = ExtentType::new("ns", "T", (1, 0), vec![]).unwrap();
        let b = ExtentType::new("ns", "T", (2, 0), vec![]).unwrap();
        lib.register(a).unwrap();
        assert!(lib.register(b).is_err());
    }

    #[test]
    fn library_register_is_idempotent_for_identical_key() {
        let mut lib = ExtentTypeLibrary::new();
        let a = ExtentType::new("ns", "T", (1, 0), vec![]).unwrap();
        let a2 = ExtentType::new("ns", "T", (1, 0), vec![]).unwrap();
        lib.register(a).unwrap();
        lib.register(a2).unwrap();
        assert_eq!(lib.len(), 1);
    }
}
