use std::error::Error;
use std::fmt;

use regex::bytes::Regex;

use crate::call::{Attr, Call};
use crate::parse::HeaderPatterns;

/// A user-supplied pattern failed to compile. The previous filter state is
/// left untouched when this is returned.
#[derive(Debug)]
pub struct InvalidPattern {
    source: regex::Error,
}

impl fmt::Display for InvalidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pattern: {}", self.source)
    }
}

impl Error for InvalidPattern {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

impl From<regex::Error> for InvalidPattern {
    fn from(source: regex::Error) -> Self {
        InvalidPattern { source }
    }
}

/// The closed set of filterable fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterField {
    From,
    To,
    Source,
    Destination,
    Method,
    Payload,
    CallListLine,
}

impl FilterField {
    pub fn from_str(s: &str) -> Option<FilterField> {
        match s {
            "from" => Some(FilterField::From),
            "to" => Some(FilterField::To),
            "src" => Some(FilterField::Source),
            "dst" => Some(FilterField::Destination),
            "method" => Some(FilterField::Method),
            "payload" => Some(FilterField::Payload),
            "line" => Some(FilterField::CallListLine),
            _ => None,
        }
    }

    fn attr(&self) -> Option<Attr> {
        match self {
            FilterField::From => Some(Attr::From),
            FilterField::To => Some(Attr::To),
            FilterField::Source => Some(Attr::Src),
            FilterField::Destination => Some(Attr::Dst),
            FilterField::Method => Some(Attr::Method),
            FilterField::Payload | FilterField::CallListLine => None,
        }
    }
}

/// Uncompiled filter parameters as supplied by a consumer.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub expr: String,
    pub ignore_case: bool,
    pub invert: bool,
}

/// One compiled per-field filter.
#[derive(Debug)]
pub struct Filter {
    field: FilterField,
    expr: String,
    re: Regex,
    invert: bool,
}

impl Filter {
    pub fn compile(field: FilterField, spec: FilterSpec) -> Result<Filter, InvalidPattern> {
        let pattern = if spec.ignore_case {
            format!("(?i){}", spec.expr)
        } else {
            spec.expr.clone()
        };
        Ok(Filter {
            field,
            expr: spec.expr,
            re: Regex::new(&pattern)?,
            invert: spec.invert,
        })
    }

    pub fn field(&self) -> FilterField {
        self.field
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// A call matches a payload filter when at least one of its messages
    /// does; every other field matches against the call's own attribute.
    fn matches(&self, call: &Call, patterns: &HeaderPatterns) -> bool {
        let hit = match self.field {
            FilterField::Payload => call.msgs().iter().any(|m| self.re.is_match(m.payload())),
            FilterField::CallListLine => self.re.is_match(call.line(patterns).as_bytes()),
            _ => match self.field.attr() {
                Some(attr) => self.re.is_match(call.attribute(attr, patterns).as_bytes()),
                None => false,
            },
        };
        hit != self.invert
    }
}

/// At most one filter per field; a call passes iff it matches all of them.
#[derive(Debug, Default)]
pub struct FilterSet {
    filters: Vec<Filter>,
}

impl FilterSet {
    /// Replace (or clear, with `None`) the filter for one field.
    pub fn set(&mut self, field: FilterField, filter: Option<Filter>) {
        self.filters.retain(|f| f.field != field);
        if let Some(f) = filter {
            self.filters.push(f);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn matches(&self, call: &Call, patterns: &HeaderPatterns) -> bool {
        self.filters.iter().all(|f| f.matches(call, patterns))
    }
}
