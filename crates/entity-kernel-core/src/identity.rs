use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ReconcileError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Asset,
    AdUser,
    AdGroup,
    AdComputer,
    WebPage,
    Job,
    Attribute,
    Organization,
    Person,
}

impl EntityKind {
    pub const ALL: [Self; 9] = [
        Self::Asset,
        Self::AdUser,
        Self::AdGroup,
        Self::AdComputer,
        Self::WebPage,
        Self::Job,
        Self::Attribute,
        Self::Organization,
        Self::Person,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::AdUser => "ad_user",
            Self::AdGroup => "ad_group",
            Self::AdComputer => "ad_computer",
            Self::WebPage => "web_page",
            Self::Job => "job",
            Self::Attribute => "attribute",
            Self::Organization => "organization",
            Self::Person => "person",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "asset" => Some(Self::Asset),
            "ad_user" => Some(Self::AdUser),
            "ad_group" => Some(Self::AdGroup),
            "ad_computer" => Some(Self::AdComputer),
            "web_page" => Some(Self::WebPage),
            "job" => Some(Self::Job),
            "attribute" => Some(Self::Attribute),
            "organization" => Some(Self::Organization),
            "person" => Some(Self::Person),
            _ => None,
        }
    }

    /// Namespace label used as the first key segment.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Asset => "asset",
            Self::AdUser => "aduser",
            Self::AdGroup => "adgroup",
            Self::AdComputer => "adcomputer",
            Self::WebPage => "webpage",
            Self::Job => "job",
            Self::Attribute => "attribute",
            Self::Organization => "organization",
            Self::Person => "person",
        }
    }

    #[must_use]
    pub fn scope_style(self) -> ScopeStyle {
        match self {
            Self::AdUser | Self::AdGroup | Self::AdComputer | Self::WebPage => ScopeStyle::Domain,
            Self::Asset | Self::Job | Self::Attribute | Self::Organization | Self::Person => {
                ScopeStyle::Tenant
            }
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the scope half of a namespace is compared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ScopeStyle {
    /// DNS-like scopes (AD domains, web hosts); folded to lowercase.
    Domain,
    /// Opaque tenant identifiers; compared exactly.
    Tenant,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Namespace {
    pub kind: EntityKind,
    pub scope: String,
}

impl Namespace {
    /// Build a namespace, normalizing the scope for its kind.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when the scope is blank or contains
    /// the key separator.
    pub fn new(kind: EntityKind, scope: &str) -> Result<Self, ReconcileError> {
        let trimmed = scope.trim();
        if trimmed.is_empty() {
            return Err(ReconcileError::Validation(format!(
                "scope MUST be provided for {} records",
                kind.label()
            )));
        }
        if trimmed.contains(crate::key::KEY_SEPARATOR) {
            return Err(ReconcileError::Validation(format!(
                "scope MUST NOT contain `{}`: {trimmed}",
                crate::key::KEY_SEPARATOR
            )));
        }

        let scope = match kind.scope_style() {
            ScopeStyle::Domain => trimmed.to_ascii_lowercase(),
            ScopeStyle::Tenant => trimmed.to_string(),
        };
        Ok(Self { kind, scope })
    }

    /// `<label>:<scope>`, the part of every key that is never truncated.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("{}{}{}", self.kind.label(), crate::key::KEY_SEPARATOR, self.scope)
    }

    /// Namespace equality with the kind's scope folding applied.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind.scope_style() {
            ScopeStyle::Domain => self.scope.eq_ignore_ascii_case(&other.scope),
            ScopeStyle::Tenant => self.scope == other.scope,
        }
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.prefix())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierStrength {
    Weak,
    Strong,
}

impl IdentifierStrength {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weak => "weak",
            Self::Strong => "strong",
        }
    }
}

/// The identifiers an observer managed to see, ranked strong over weak.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Identity {
    #[serde(default)]
    pub strong: Option<String>,
    #[serde(default)]
    pub weak: Option<String>,
}

impl Identity {
    /// Trims both identifiers and drops blank ones.
    #[must_use]
    pub fn new(strong: Option<&str>, weak: Option<&str>) -> Self {
        Self { strong: non_blank(strong), weak: non_blank(weak) }
    }

    #[must_use]
    pub fn strong(&self) -> Option<&str> {
        self.strong.as_deref().filter(|value| !value.trim().is_empty())
    }

    #[must_use]
    pub fn weak(&self) -> Option<&str> {
        self.weak.as_deref().filter(|value| !value.trim().is_empty())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strong().is_none() && self.weak().is_none()
    }

    #[must_use]
    pub fn only_strong(&self) -> bool {
        self.strong().is_some() && self.weak().is_none()
    }

    #[must_use]
    pub fn only_weak(&self) -> bool {
        self.weak().is_some() && self.strong().is_none()
    }

    /// The highest-ranked identifier present.
    #[must_use]
    pub fn strongest(&self) -> Option<(IdentifierStrength, &str)> {
        self.strong()
            .map(|value| (IdentifierStrength::Strong, value))
            .or_else(|| self.weak().map(|value| (IdentifierStrength::Weak, value)))
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(str::to_string)
}
