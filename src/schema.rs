//! Compiled form of the GPX 1.1 XML Schema.
//!
//! The XSD is embedded at build time and compiled once into a small content
//! model. Only the constructs the GPX schema uses are supported: global
//! elements, named complex types with sequence content and attributes, named
//! simple types restricting a built-in, and lax `xsd:any` wildcards.

use std::cmp::Ordering;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use roxmltree::Node;

use crate::error::SchemaError;
use crate::timestamp::parse_timestamp;

pub const GPX_NAMESPACE: &str = "http://www.topografix.com/GPX/1/1";
pub const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

const GPX_XSD: &str = include_str!("../schema/gpx-1_1.xsd");

static GPX_SCHEMA: Lazy<Result<Schema, SchemaError>> = Lazy::new(|| {
    log::debug!("compiling embedded GPX 1.1 schema");
    Schema::compile(GPX_XSD)
});

/// The packaged GPX 1.1 schema, compiled on first use.
pub fn gpx_schema() -> Result<&'static Schema, SchemaError> {
    match &*GPX_SCHEMA {
        Ok(schema) => Ok(schema),
        Err(e) => Err(e.clone()),
    }
}

#[derive(Debug)]
pub struct Schema {
    pub target_namespace: String,
    elements: HashMap<String, TypeRef>,
    complex_types: HashMap<String, ComplexType>,
    simple_types: HashMap<String, SimpleType>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Builtin(Builtin),
    Named(String),
}

/// A resolved type reference.
#[derive(Debug, Clone, Copy)]
pub enum TypeDef<'s> {
    Complex(&'s ComplexType),
    Simple(SimpleRef<'s>),
}

#[derive(Debug, Clone, Copy)]
pub enum SimpleRef<'s> {
    Builtin(Builtin),
    Restricted(&'s SimpleType),
}

#[derive(Debug, Default)]
pub struct ComplexType {
    pub particles: Vec<Particle>,
    pub attributes: Vec<AttributeDecl>,
}

#[derive(Debug)]
pub struct Particle {
    pub term: Term,
    pub min_occurs: u32,
    /// `None` is `unbounded`.
    pub max_occurs: Option<u32>,
}

#[derive(Debug)]
pub enum Term {
    Element { name: String, type_ref: TypeRef },
    Any(Wildcard),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wildcard {
    AnyNamespace,
    OtherNamespace,
}

#[derive(Debug)]
pub struct AttributeDecl {
    pub name: String,
    pub type_ref: TypeRef,
    pub required: bool,
    pub fixed: Option<String>,
}

#[derive(Debug)]
pub struct SimpleType {
    pub base: Builtin,
    pub facets: Facets,
}

#[derive(Debug, Default)]
pub struct Facets {
    // Bounds keep their decimal text so comparisons are exact.
    pub min_inclusive: Option<String>,
    pub max_inclusive: Option<String>,
    pub min_exclusive: Option<String>,
    pub max_exclusive: Option<String>,
    pub enumeration: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    String,
    Token,
    Decimal,
    Integer,
    NonNegativeInteger,
    DateTime,
    GYear,
    AnyUri,
}

impl Schema {
    /// Compile an XSD document into a content model.
    pub fn compile(xsd: &str) -> Result<Self, SchemaError> {
        let doc = roxmltree::Document::parse(xsd)
            .map_err(|e| SchemaError::new(format!("cannot parse schema: {e}")))?;
        let root = doc.root_element();
        if !root.has_tag_name((XSD_NAMESPACE, "schema")) {
            return Err(SchemaError::new("schema root is not <xsd:schema>"));
        }

        let mut schema = Schema {
            target_namespace: root.attribute("targetNamespace").unwrap_or_default().to_string(),
            elements: HashMap::new(),
            complex_types: HashMap::new(),
            simple_types: HashMap::new(),
        };

        for child in xsd_children(root) {
            match child.tag_name().name() {
                "annotation" => {}
                "element" => {
                    let name = required_attr(child, "name")?;
                    let type_ref = type_attr(child)?;
                    schema.elements.insert(name.to_string(), type_ref);
                }
                "complexType" => {
                    let name = required_attr(child, "name")?;
                    schema
                        .complex_types
                        .insert(name.to_string(), compile_complex_type(child)?);
                }
                "simpleType" => {
                    let name = required_attr(child, "name")?;
                    schema
                        .simple_types
                        .insert(name.to_string(), compile_simple_type(child)?);
                }
                other => return Err(unsupported(other)),
            }
        }

        schema.check_references()?;
        log::debug!(
            "schema {} compiled: {} elements, {} complex types, {} simple types",
            schema.target_namespace,
            schema.elements.len(),
            schema.complex_types.len(),
            schema.simple_types.len()
        );
        Ok(schema)
    }

    /// Type of a global element declaration.
    pub fn element(&self, name: &str) -> Option<&TypeRef> {
        self.elements.get(name)
    }

    pub fn resolve(&self, type_ref: &TypeRef) -> Result<TypeDef<'_>, SchemaError> {
        match type_ref {
            TypeRef::Builtin(b) => Ok(TypeDef::Simple(SimpleRef::Builtin(*b))),
            TypeRef::Named(name) => {
                if let Some(ct) = self.complex_types.get(name) {
                    Ok(TypeDef::Complex(ct))
                } else if let Some(st) = self.simple_types.get(name) {
                    Ok(TypeDef::Simple(SimpleRef::Restricted(st)))
                } else {
                    Err(SchemaError::new(format!("unresolved type '{name}'")))
                }
            }
        }
    }

    pub fn resolve_simple(&self, type_ref: &TypeRef) -> Result<SimpleRef<'_>, SchemaError> {
        match self.resolve(type_ref)? {
            TypeDef::Simple(simple) => Ok(simple),
            TypeDef::Complex(_) => Err(SchemaError::new(
                "attribute declared with a complex type",
            )),
        }
    }

    // Every named reference must resolve, so instance validation can only
    // fail on the instance.
    fn check_references(&self) -> Result<(), SchemaError> {
        for type_ref in self.elements.values() {
            self.resolve(type_ref)?;
        }
        for ct in self.complex_types.values() {
            for particle in &ct.particles {
                if let Term::Element { type_ref, .. } = &particle.term {
                    self.resolve(type_ref)?;
                }
            }
            for attr in &ct.attributes {
                self.resolve_simple(&attr.type_ref)?;
            }
        }
        Ok(())
    }
}

impl SimpleRef<'_> {
    /// Check a text value against the simple type, returning a description of
    /// the violation if it does not conform.
    pub fn check(&self, raw: &str) -> Result<(), String> {
        match self {
            SimpleRef::Builtin(b) => b.check(raw).map(|_| ()),
            SimpleRef::Restricted(st) => st.check(raw),
        }
    }
}

impl SimpleType {
    fn check(&self, raw: &str) -> Result<(), String> {
        let numeric = self.base.check(raw)?;
        let value = raw.trim();
        let f = &self.facets;

        if !f.enumeration.is_empty() && !f.enumeration.iter().any(|e| e == value) {
            return Err(format!(
                "'{value}' is not one of [{}]",
                f.enumeration.join(", ")
            ));
        }

        if numeric.is_some() {
            let cmp = |bound: &Option<String>| {
                bound.as_deref().map(|b| compare_decimal(value, b))
            };
            if cmp(&f.min_inclusive) == Some(Ordering::Less) {
                return Err(format!("{value} is below the minimum"));
            }
            if cmp(&f.max_inclusive) == Some(Ordering::Greater) {
                return Err(format!("{value} is above the maximum"));
            }
            if cmp(&f.min_exclusive).is_some_and(|o| o != Ordering::Greater) {
                return Err(format!("{value} must be greater than the minimum"));
            }
            if cmp(&f.max_exclusive).is_some_and(|o| o != Ordering::Less) {
                return Err(format!("{value} must be less than the maximum"));
            }
        }
        Ok(())
    }
}

impl Builtin {
    fn from_local_name(name: &str) -> Option<Self> {
        Some(match name {
            "string" => Builtin::String,
            "token" => Builtin::Token,
            "decimal" => Builtin::Decimal,
            "integer" => Builtin::Integer,
            "nonNegativeInteger" => Builtin::NonNegativeInteger,
            "dateTime" => Builtin::DateTime,
            "gYear" => Builtin::GYear,
            "anyURI" => Builtin::AnyUri,
            _ => return None,
        })
    }

    /// Lexical check. Numeric types yield their value for facet checks.
    pub fn check(&self, raw: &str) -> Result<Option<f64>, String> {
        let value = raw.trim();
        match self {
            Builtin::String | Builtin::Token | Builtin::AnyUri => Ok(None),
            Builtin::Decimal => parse_decimal(value)
                .map(Some)
                .ok_or_else(|| format!("'{value}' is not a valid decimal")),
            Builtin::Integer => parse_integer(value)
                .map(Some)
                .ok_or_else(|| format!("'{value}' is not a valid integer")),
            Builtin::NonNegativeInteger => parse_integer(value)
                .filter(|n| *n >= 0.0)
                .map(Some)
                .ok_or_else(|| format!("'{value}' is not a non-negative integer")),
            Builtin::DateTime => is_datetime_form(value)
                .then(|| parse_timestamp(value).ok())
                .flatten()
                .map(|_| None)
                .ok_or_else(|| format!("'{value}' is not a valid dateTime")),
            Builtin::GYear => {
                if is_gyear(value) {
                    Ok(None)
                } else {
                    Err(format!("'{value}' is not a valid gYear"))
                }
            }
        }
    }
}

fn parse_decimal(s: &str) -> Option<f64> {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let all_digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !all_digits(int_part) || !all_digits(frac_part) {
        return None;
    }
    s.parse().ok()
}

fn parse_integer(s: &str) -> Option<f64> {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Compare two lexically valid decimals without going through `f64`.
fn compare_decimal(a: &str, b: &str) -> Ordering {
    let (a_neg, a_int, a_frac) = split_decimal(a);
    let (b_neg, b_int, b_frac) = split_decimal(b);
    let magnitude = a_int
        .len()
        .cmp(&b_int.len())
        .then_with(|| a_int.cmp(b_int))
        .then_with(|| a_frac.cmp(b_frac));
    match (a_neg, b_neg) {
        (false, false) => magnitude,
        (true, true) => magnitude.reverse(),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
    }
}

/// Sign, integer digits without leading zeros, fraction digits without
/// trailing zeros. Zero is never negative.
fn split_decimal(s: &str) -> (bool, &str, &str) {
    let s = s.trim();
    let neg = s.starts_with('-');
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let zero = int_part.is_empty() && frac_part.is_empty();
    (neg && !zero, int_part, frac_part)
}

/// `YYYY-MM-DDThh:mm:ss(.s+)?` with an optional `Z` or `±hh:mm` zone. Range
/// checks are left to chrono.
fn is_datetime_form(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() < 19 {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);
    let date_time = digits(0..4)
        && bytes[4] == b'-'
        && digits(5..7)
        && bytes[7] == b'-'
        && digits(8..10)
        && bytes[10] == b'T'
        && digits(11..13)
        && bytes[13] == b':'
        && digits(14..16)
        && bytes[16] == b':'
        && digits(17..19);
    if !date_time {
        return false;
    }

    let mut rest = &s[19..];
    if let Some(frac) = rest.strip_prefix('.') {
        let len = frac.bytes().take_while(u8::is_ascii_digit).count();
        if len == 0 {
            return false;
        }
        rest = &frac[len..];
    }
    match rest.as_bytes() {
        [] | [b'Z'] => true,
        [sign, h1, h2, b':', m1, m2] => {
            matches!(sign, b'+' | b'-') && [h1, h2, m1, m2].iter().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

fn is_gyear(s: &str) -> bool {
    let s = s.strip_prefix('-').unwrap_or(s);
    let year_len = s.bytes().take_while(u8::is_ascii_digit).count();
    if year_len < 4 {
        return false;
    }
    match &s[year_len..] {
        "" | "Z" => true,
        zone => {
            let bytes = zone.as_bytes();
            bytes.len() == 6
                && matches!(bytes[0], b'+' | b'-')
                && bytes[3] == b':'
                && [1, 2, 4, 5].iter().all(|&i| bytes[i].is_ascii_digit())
        }
    }
}

fn compile_complex_type(node: Node) -> Result<ComplexType, SchemaError> {
    let mut ct = ComplexType::default();
    for child in xsd_children(node) {
        match child.tag_name().name() {
            "annotation" => {}
            "sequence" => {
                for item in xsd_children(child) {
                    if let Some(particle) = compile_particle(item)? {
                        ct.particles.push(particle);
                    }
                }
            }
            "attribute" => ct.attributes.push(AttributeDecl {
                name: required_attr(child, "name")?.to_string(),
                type_ref: type_attr(child)?,
                required: child.attribute("use") == Some("required"),
                fixed: child.attribute("fixed").map(str::to_string),
            }),
            other => return Err(unsupported(other)),
        }
    }
    Ok(ct)
}

fn compile_particle(node: Node) -> Result<Option<Particle>, SchemaError> {
    let term = match node.tag_name().name() {
        "annotation" => return Ok(None),
        "element" => Term::Element {
            name: required_attr(node, "name")?.to_string(),
            type_ref: type_attr(node)?,
        },
        "any" => {
            let wildcard = match node.attribute("namespace").unwrap_or("##any") {
                "##any" => Wildcard::AnyNamespace,
                "##other" => Wildcard::OtherNamespace,
                other => return Err(unsupported(&format!("any namespace=\"{other}\""))),
            };
            if node.attribute("processContents").unwrap_or("strict") == "strict" {
                return Err(unsupported("any processContents=\"strict\""));
            }
            Term::Any(wildcard)
        }
        other => return Err(unsupported(other)),
    };

    let min_occurs = match node.attribute("minOccurs") {
        Some(v) => parse_occurs(v)?,
        None => 1,
    };
    let max_occurs = match node.attribute("maxOccurs") {
        Some("unbounded") => None,
        Some(v) => Some(parse_occurs(v)?),
        None => Some(1),
    };

    Ok(Some(Particle {
        term,
        min_occurs,
        max_occurs,
    }))
}

fn compile_simple_type(node: Node) -> Result<SimpleType, SchemaError> {
    let restriction = xsd_children(node)
        .find(|c| c.tag_name().name() == "restriction")
        .ok_or_else(|| unsupported("simpleType without restriction"))?;

    let base = match resolve_qname(restriction, required_attr(restriction, "base")?)? {
        TypeRef::Builtin(b) => b,
        TypeRef::Named(name) => return Err(unsupported(&format!("restriction of '{name}'"))),
    };

    let mut facets = Facets::default();
    for facet in xsd_children(restriction) {
        let name = facet.tag_name().name();
        if name == "annotation" {
            continue;
        }
        let value = required_attr(facet, "value")?;
        let number = || match parse_decimal(value.trim()) {
            Some(_) => Ok(value.trim().to_string()),
            None => Err(SchemaError::new(format!("bad {name} facet '{value}'"))),
        };
        match name {
            "minInclusive" => facets.min_inclusive = Some(number()?),
            "maxInclusive" => facets.max_inclusive = Some(number()?),
            "minExclusive" => facets.min_exclusive = Some(number()?),
            "maxExclusive" => facets.max_exclusive = Some(number()?),
            "enumeration" => facets.enumeration.push(value.to_string()),
            other => return Err(unsupported(other)),
        }
    }

    Ok(SimpleType { base, facets })
}

fn xsd_children<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(|c| c.is_element() && c.tag_name().namespace() == Some(XSD_NAMESPACE))
}

fn required_attr<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, SchemaError> {
    node.attribute(name).ok_or_else(|| {
        SchemaError::new(format!(
            "<xsd:{}> is missing attribute '{name}'",
            node.tag_name().name()
        ))
    })
}

fn type_attr(node: Node) -> Result<TypeRef, SchemaError> {
    resolve_qname(node, required_attr(node, "type")?)
}

fn resolve_qname(node: Node, qname: &str) -> Result<TypeRef, SchemaError> {
    let (prefix, local) = match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    };
    if node.lookup_namespace_uri(prefix) == Some(XSD_NAMESPACE) {
        Builtin::from_local_name(local)
            .map(TypeRef::Builtin)
            .ok_or_else(|| unsupported(&format!("built-in type xsd:{local}")))
    } else {
        Ok(TypeRef::Named(local.to_string()))
    }
}

fn parse_occurs(v: &str) -> Result<u32, SchemaError> {
    v.trim()
        .parse()
        .map_err(|_| SchemaError::new(format!("bad occurrence bound '{v}'")))
}

fn unsupported(what: &str) -> SchemaError {
    SchemaError::new(format!("unsupported schema construct: {what}"))
}
