//! RDF terms and query variables flowing through bindings.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// `xsd:string`.
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
/// `xsd:boolean`.
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
/// `xsd:integer`.
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
/// `xsd:decimal`.
pub const XSD_DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
/// `xsd:double`.
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";

const INTEGER_TYPES: &[&str] = &[
    XSD_INTEGER,
    "http://www.w3.org/2001/XMLSchema#int",
    "http://www.w3.org/2001/XMLSchema#long",
    "http://www.w3.org/2001/XMLSchema#short",
    "http://www.w3.org/2001/XMLSchema#nonNegativeInteger",
    "http://www.w3.org/2001/XMLSchema#positiveInteger",
];

const FLOATING_TYPES: &[&str] = &[
    XSD_DECIMAL,
    XSD_DOUBLE,
    "http://www.w3.org/2001/XMLSchema#float",
];

/// Query variable name, stored without the leading `?`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Var(pub String);

impl Var {
    /// Creates a variable from its bare name.
    pub fn new(name: impl Into<String>) -> Self {
        Var(name.into())
    }

    /// Returns the bare variable name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

impl From<&str> for Var {
    fn from(value: &str) -> Self {
        Var(value.trim_start_matches('?').to_owned())
    }
}

/// Literal value with optional datatype and language tag.
///
/// A literal without datatype or language is a simple `xsd:string` literal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Literal {
    /// Lexical form.
    pub lexical: String,
    /// Datatype IRI, if not a simple literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    /// Language tag for language-tagged strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

/// A bound value: IRI, blank node, or literal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Term {
    /// IRI reference.
    Iri(String),
    /// Blank node label.
    Blank(String),
    /// Literal value.
    Literal(Literal),
}

/// Numeric view of a literal used by arithmetic and comparisons.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Numeric {
    /// Integer-typed literal.
    Integer(i64),
    /// Decimal, float, or double literal.
    Double(f64),
}

impl Numeric {
    /// Widens to a double.
    pub fn as_f64(self) -> f64 {
        match self {
            Numeric::Integer(v) => v as f64,
            Numeric::Double(v) => v,
        }
    }

    /// Converts back into a literal term.
    pub fn into_term(self) -> Term {
        match self {
            Numeric::Integer(v) => Term::int(v),
            Numeric::Double(v) => Term::double(v),
        }
    }

    /// Numeric comparison; `None` only when a NaN is involved.
    pub fn partial_cmp(self, other: Numeric) -> Option<Ordering> {
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

impl Term {
    /// IRI term.
    pub fn iri(value: impl Into<String>) -> Self {
        Term::Iri(value.into())
    }

    /// Blank node term.
    pub fn blank(label: impl Into<String>) -> Self {
        Term::Blank(label.into())
    }

    /// Simple string literal.
    pub fn string(value: impl Into<String>) -> Self {
        Term::Literal(Literal {
            lexical: value.into(),
            datatype: None,
            lang: None,
        })
    }

    /// Language-tagged string literal.
    pub fn lang_string(value: impl Into<String>, lang: impl Into<String>) -> Self {
        Term::Literal(Literal {
            lexical: value.into(),
            datatype: None,
            lang: Some(lang.into()),
        })
    }

    /// Literal with an explicit datatype IRI.
    pub fn typed(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        let datatype = datatype.into();
        Term::Literal(Literal {
            lexical: lexical.into(),
            datatype: (datatype != XSD_STRING).then_some(datatype),
            lang: None,
        })
    }

    /// `xsd:integer` literal.
    pub fn int(value: i64) -> Self {
        Term::typed(value.to_string(), XSD_INTEGER)
    }

    /// `xsd:double` literal.
    pub fn double(value: f64) -> Self {
        Term::typed(value.to_string(), XSD_DOUBLE)
    }

    /// `xsd:boolean` literal.
    pub fn boolean(value: bool) -> Self {
        Term::typed(if value { "true" } else { "false" }, XSD_BOOLEAN)
    }

    /// Returns true for IRIs.
    pub fn is_iri(&self) -> bool {
        matches!(self, Term::Iri(_))
    }

    /// Returns true for blank nodes.
    pub fn is_blank(&self) -> bool {
        matches!(self, Term::Blank(_))
    }

    /// Returns true for literals.
    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Literal(_))
    }

    /// Returns the literal payload, if any.
    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Term::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    /// Lexical form of a literal or the text of an IRI/blank label.
    pub fn lexical(&self) -> &str {
        match self {
            Term::Iri(iri) => iri,
            Term::Blank(label) => label,
            Term::Literal(lit) => &lit.lexical,
        }
    }

    /// Numeric value of an integer/decimal/double literal.
    pub fn as_numeric(&self) -> Option<Numeric> {
        let lit = self.as_literal()?;
        let datatype = lit.datatype.as_deref()?;
        if INTEGER_TYPES.contains(&datatype) {
            return lit.lexical.trim().parse::<i64>().ok().map(Numeric::Integer);
        }
        if FLOATING_TYPES.contains(&datatype) {
            return lit.lexical.trim().parse::<f64>().ok().map(Numeric::Double);
        }
        None
    }

    /// Boolean value of an `xsd:boolean` literal.
    pub fn as_bool(&self) -> Option<bool> {
        let lit = self.as_literal()?;
        if lit.datatype.as_deref() != Some(XSD_BOOLEAN) {
            return None;
        }
        match lit.lexical.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    /// Returns true for simple and `xsd:string` literals.
    pub fn is_simple_string(&self) -> bool {
        matches!(self, Term::Literal(lit) if lit.datatype.is_none() && lit.lang.is_none())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{iri}>"),
            Term::Blank(label) => write!(f, "_:{label}"),
            Term::Literal(lit) => {
                if self.as_numeric().is_some() || self.as_bool().is_some() {
                    return write!(f, "{}", lit.lexical);
                }
                write!(f, "\"{}\"", lit.lexical.escape_default())?;
                if let Some(lang) = &lit.lang {
                    write!(f, "@{lang}")
                } else if let Some(dt) = &lit.datatype {
                    write!(f, "^^<{dt}>")
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn kind_rank(term: &Term) -> u8 {
    match term {
        Term::Blank(_) => 0,
        Term::Iri(_) => 1,
        Term::Literal(_) => 2,
    }
}

/// Total order used by ORDER BY: unbound, blank nodes, IRIs, then literals;
/// numeric literals compare by value.
pub fn order_terms(a: Option<&Term>, b: Option<&Term>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let rank = kind_rank(a).cmp(&kind_rank(b));
            if rank != Ordering::Equal {
                return rank;
            }
            if let (Some(x), Some(y)) = (a.as_numeric(), b.as_numeric()) {
                if let Some(ord) = x.partial_cmp(y) {
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
            a.cmp(b)
        }
    }
}
