use std::fmt;

use crate::moat::MoatType;

/// Identifies a protected unit.
///
/// Used as the key of every cache, registry and config lookup, so equality
/// and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceId {
    /// A whole method.
    Method(String),
    /// One value of one argument of a method.
    Arg(ArgResourceId),
    /// A named set of methods sharing their moats.
    Group(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgResourceId {
    pub method: String,
    pub arg_name: String,
    pub value: ArgValue,
}

/// The value half of an argument resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArgValue {
    Value(String),
    /// Stands for every value without a configuration of its own.
    Wildcard,
}

/// Key of a per-argument creation cap: one per (method, argument, moat kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgConfigKey {
    pub method: String,
    pub arg_name: String,
    pub moat_type: MoatType,
}

impl ResourceId {
    pub fn method(name: impl Into<String>) -> Self {
        Self::Method(name.into())
    }

    pub fn arg(
        method: impl Into<String>,
        arg_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Arg(ArgResourceId {
            method: method.into(),
            arg_name: arg_name.into(),
            value: ArgValue::Value(value.into()),
        })
    }

    pub fn arg_wildcard(method: impl Into<String>, arg_name: impl Into<String>) -> Self {
        Self::Arg(ArgResourceId {
            method: method.into(),
            arg_name: arg_name.into(),
            value: ArgValue::Wildcard,
        })
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::Group(name.into())
    }

    pub fn as_arg(&self) -> Option<&ArgResourceId> {
        match self {
            Self::Arg(arg) => Some(arg),
            _ => None,
        }
    }

    /// The wildcard id of the same argument, if this is a concrete argument value.
    pub fn wildcard(&self) -> Option<ResourceId> {
        match self {
            Self::Arg(arg) if arg.value != ArgValue::Wildcard => Some(Self::Arg(ArgResourceId {
                value: ArgValue::Wildcard,
                ..arg.clone()
            })),
            _ => None,
        }
    }
}

impl ArgResourceId {
    pub fn config_key(&self, moat_type: MoatType) -> ArgConfigKey {
        ArgConfigKey::new(&self.method, &self.arg_name, moat_type)
    }

    pub fn same_argument(&self, method: &str, arg_name: &str) -> bool {
        self.method == method && self.arg_name == arg_name
    }
}

impl ArgConfigKey {
    pub fn new(method: impl Into<String>, arg_name: impl Into<String>, moat_type: MoatType) -> Self {
        Self {
            method: method.into(),
            arg_name: arg_name.into(),
            moat_type,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method(name) => f.write_str(name),
            Self::Arg(arg) => arg.fmt(f),
            Self::Group(name) => write!(f, "group:{name}"),
        }
    }
}

impl fmt::Display for ArgResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            ArgValue::Value(value) => write!(f, "{}#{}={}", self.method, self.arg_name, value),
            ArgValue::Wildcard => write!(f, "{}#{}=*", self.method, self.arg_name),
        }
    }
}

impl fmt::Display for ArgConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}/{}", self.method, self.arg_name, self.moat_type)
    }
}
