//! Validation of a GPX document against the packaged GPX 1.1 schema.

use roxmltree::{Document, Node, ParsingOptions};

use crate::error::{GpxError, SchemaError};
use crate::schema::{
    ComplexType, Particle, Schema, SimpleRef, Term, TypeDef, Wildcard, XSI_NAMESPACE,
    gpx_schema,
};

const GPX_VERSION: &str = "1.1";

/// Validate raw GPX bytes against the GPX 1.1 schema.
pub fn validate(bytes: &[u8]) -> Result<(), SchemaError> {
    let xml = decode(bytes).map_err(|e| SchemaError::new(e.to_string()))?;
    let doc = parse_tree(xml).map_err(|e| {
        let pos = e.pos();
        SchemaError::at(e.to_string(), pos.row, pos.col)
    })?;
    validate_document(&doc)
}

/// Validate an already parsed document tree.
pub fn validate_document(doc: &Document) -> Result<(), SchemaError> {
    let schema = gpx_schema()?;
    Validator { schema, doc }.validate_root(doc.root_element())?;
    log::debug!("document validated against the GPX 1.1 schema");
    Ok(())
}

/// Check the root is a `<gpx>` element declaring version 1.1.
///
/// Runs before schema validation so that documents of another GPX version
/// are reported as such rather than as a schema mismatch.
pub fn check_header(doc: &Document) -> Result<(), GpxError> {
    let root = doc.root_element();
    let tag = root.tag_name().name();
    if tag != "gpx" {
        return Err(GpxError::NotGpx(tag.to_string()));
    }
    match root.attribute("version") {
        Some(GPX_VERSION) => Ok(()),
        other => Err(GpxError::UnsupportedVersion(
            other.unwrap_or_default().to_string(),
        )),
    }
}

/// Build the document tree. A `<!DOCTYPE>` is allowed; its entities are
/// expanded in the tree.
pub(crate) fn parse_tree(xml: &str) -> Result<Document<'_>, roxmltree::Error> {
    let opts = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    Document::parse_with_options(xml, opts)
}

/// Borrow the input as UTF-8, dropping a byte order mark if present.
pub(crate) fn decode(bytes: &[u8]) -> Result<&str, GpxError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    Ok(std::str::from_utf8(bytes)?)
}

struct Validator<'s, 'd, 'input> {
    schema: &'s Schema,
    doc: &'d Document<'input>,
}

impl Validator<'_, '_, '_> {
    fn validate_root(&self, root: Node) -> Result<(), SchemaError> {
        let name = root.tag_name().name();
        let type_ref = self
            .in_target_namespace(root)
            .then(|| self.schema.element(name))
            .flatten()
            .ok_or_else(|| self.error(root, format!("no global declaration for <{name}>")))?;
        self.validate_element(root, self.schema.resolve(type_ref)?)
    }

    fn validate_element(&self, node: Node, def: TypeDef) -> Result<(), SchemaError> {
        match def {
            TypeDef::Complex(ct) => self.validate_complex(node, ct),
            TypeDef::Simple(simple) => self.validate_simple(node, simple),
        }
    }

    fn validate_complex(&self, node: Node, ct: &ComplexType) -> Result<(), SchemaError> {
        self.validate_attributes(node, ct)?;

        if let Some(text) = node
            .children()
            .find(|c| c.is_text() && !c.text().unwrap_or_default().trim().is_empty())
        {
            return Err(self.error(
                text,
                format!("<{}> cannot contain character data", node.tag_name().name()),
            ));
        }

        let children: Vec<Node> = node.children().filter(Node::is_element).collect();
        let mut idx = 0;
        for particle in &ct.particles {
            let mut count = 0;
            while idx < children.len()
                && particle.max_occurs.is_none_or(|max| count < max)
                && self.matches(particle, children[idx])
            {
                self.validate_particle(particle, children[idx])?;
                idx += 1;
                count += 1;
            }
            if count < particle.min_occurs {
                let expected = match &particle.term {
                    Term::Element { name, .. } => format!("<{name}>"),
                    Term::Any(_) => "an extension element".to_string(),
                };
                let at = children.get(idx).copied().unwrap_or(node);
                return Err(self.error(
                    at,
                    format!("<{}> expects {expected}", node.tag_name().name()),
                ));
            }
        }

        if let Some(extra) = children.get(idx) {
            return Err(self.error(
                *extra,
                format!(
                    "unexpected element <{}> in <{}>",
                    extra.tag_name().name(),
                    node.tag_name().name()
                ),
            ));
        }
        Ok(())
    }

    fn validate_particle(&self, particle: &Particle, child: Node) -> Result<(), SchemaError> {
        match &particle.term {
            Term::Element { type_ref, .. } => {
                self.validate_element(child, self.schema.resolve(type_ref)?)
            }
            // Lax wildcard content from foreign schemas is not checked.
            Term::Any(_) => Ok(()),
        }
    }

    fn matches(&self, particle: &Particle, child: Node) -> bool {
        match &particle.term {
            Term::Element { name, .. } => {
                self.in_target_namespace(child) && child.tag_name().name() == name
            }
            Term::Any(Wildcard::AnyNamespace) => true,
            Term::Any(Wildcard::OtherNamespace) => child
                .tag_name()
                .namespace()
                .is_some_and(|ns| ns != self.schema.target_namespace),
        }
    }

    fn validate_simple(&self, node: Node, simple: SimpleRef) -> Result<(), SchemaError> {
        let name = node.tag_name().name();
        if let Some(child) = node.children().find(Node::is_element) {
            return Err(self.error(
                child,
                format!("<{name}> cannot contain element <{}>", child.tag_name().name()),
            ));
        }
        if let Some(attr) = node
            .attributes()
            .find(|a| a.namespace() != Some(XSI_NAMESPACE))
        {
            return Err(self.error(
                node,
                format!("<{name}> does not allow attribute '{}'", attr.name()),
            ));
        }

        let text: String = node
            .children()
            .filter(Node::is_text)
            .filter_map(|c| c.text())
            .collect();
        simple
            .check(&text)
            .map_err(|reason| self.error(node, format!("<{name}>: {reason}")))
    }

    fn validate_attributes(&self, node: Node, ct: &ComplexType) -> Result<(), SchemaError> {
        let name = node.tag_name().name();
        for decl in &ct.attributes {
            let Some(value) = node.attribute(decl.name.as_str()) else {
                if decl.required {
                    return Err(self.error(
                        node,
                        format!("<{name}> is missing required attribute '{}'", decl.name),
                    ));
                }
                continue;
            };
            if let Some(fixed) = &decl.fixed {
                if value != fixed {
                    return Err(self.error(
                        node,
                        format!("attribute '{}' must be '{fixed}', got '{value}'", decl.name),
                    ));
                }
            }
            self.schema
                .resolve_simple(&decl.type_ref)?
                .check(value)
                .map_err(|reason| {
                    self.error(node, format!("attribute '{}' on <{name}>: {reason}", decl.name))
                })?;
        }

        for attr in node.attributes() {
            let declared = attr.namespace().is_none()
                && ct.attributes.iter().any(|d| d.name == attr.name());
            if !declared && attr.namespace() != Some(XSI_NAMESPACE) {
                return Err(self.error(
                    node,
                    format!("<{name}> does not allow attribute '{}'", attr.name()),
                ));
            }
        }
        Ok(())
    }

    fn in_target_namespace(&self, node: Node) -> bool {
        node.tag_name().namespace() == Some(self.schema.target_namespace.as_str())
    }

    fn error(&self, node: Node, message: String) -> SchemaError {
        let pos = self.doc.text_pos_at(node.range().start);
        SchemaError::at(message, pos.row, pos.col)
    }
}
