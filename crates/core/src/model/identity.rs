use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{MethodDef, TypeRef};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Member has no declaring type name")]
    MissingDeclaringType,
    #[error("Member of {0} has no name")]
    MissingMemberName(String),
}

/// Stable cross-revision name of a function.
///
/// Built from the declaring type's full name, the member name and the ordered parameter type
/// names, e.g. `TestMod.ModDialog.Prepare(TestApplication.DialogConfig)`. Members from different
/// module loads with equal keys are the same function for swap purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new<'a>(
        declaring_type: &str,
        member: &str,
        params: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, IdentityError> {
        if declaring_type.trim().is_empty() {
            return Err(IdentityError::MissingDeclaringType);
        }
        if member.trim().is_empty() {
            return Err(IdentityError::MissingMemberName(declaring_type.to_string()));
        }
        let params: Vec<&str> = params.into_iter().collect();
        let mut key = String::with_capacity(128);
        key.push_str(declaring_type);
        key.push('.');
        key.push_str(member);
        key.push('(');
        key.push_str(&params.join(", "));
        key.push(')');
        Ok(Self(key))
    }

    /// Key for a descriptive method definition declared on `declaring_type`.
    pub fn for_def(declaring_type: &str, method: &MethodDef) -> Result<Self, IdentityError> {
        let params: Vec<String> = method.params.iter().map(|p| p.ty.display_name()).collect();
        Self::new(declaring_type, &method.name, params.iter().map(String::as_str))
    }

    /// Key for a reference to a method, as found in an instruction operand.
    pub fn for_ref(declaring_type: &TypeRef, name: &str, params: &[TypeRef]) -> Result<Self, IdentityError> {
        let params: Vec<String> = params.iter().map(TypeRef::display_name).collect();
        Self::new(&declaring_type.display_name(), name, params.iter().map(String::as_str))
    }

    /// Parse a formatted key (e.g. typed on a command line).
    ///
    /// A missing parameter list means no parameters. Whitespace inside the list is normalized, so
    /// `Foo.Bar(System.Int32,System.String)` equals the key built by [`IdentityKey::for_def`].
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let raw = raw.trim();
        let (path, list) = match raw.find('(') {
            Some(open) => {
                let list = &raw[open + 1..];
                (&raw[..open], list.strip_suffix(')').unwrap_or(list))
            }
            None => (raw, ""),
        };
        let (declaring_type, member) =
            path.trim_end().rsplit_once('.').ok_or(IdentityError::MissingDeclaringType)?;
        let params = split_params(list);
        Self::new(declaring_type, member, params.iter().map(String::as_str))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split a parameter list on top-level commas, dropping whitespace.
fn split_params(list: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in list.chars() {
        match c {
            '<' | '[' => {
                depth += 1;
                current.push(c);
            }
            '>' | ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => params.push(std::mem::take(&mut current)),
            c if c.is_whitespace() => {}
            c => current.push(c),
        }
    }
    if !current.is_empty() || !params.is_empty() {
        params.push(current);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MethodDef, TypeRef, VOID_TYPE};

    #[test]
    fn key_includes_ordered_parameter_types() {
        let method = MethodDef::new("Bar", TypeRef::named(VOID_TYPE))
            .with_param("a", TypeRef::named("System.Int32"))
            .with_param("b", TypeRef::named("System.String"));
        let key = IdentityKey::for_def("Foo", &method).unwrap();
        assert_eq!(key.as_str(), "Foo.Bar(System.Int32, System.String)");
    }

    #[test]
    fn different_signatures_produce_different_keys() {
        let two = IdentityKey::new("Foo", "Bar", ["System.Int32", "System.String"]).unwrap();
        let one = IdentityKey::new("Foo", "Bar", ["System.Int32"]).unwrap();
        assert_ne!(two, one);
    }

    #[test]
    fn empty_names_are_rejected() {
        assert_eq!(IdentityKey::new("", "Bar", []), Err(IdentityError::MissingDeclaringType));
        assert_eq!(
            IdentityKey::new("Foo", " ", []),
            Err(IdentityError::MissingMemberName("Foo".into()))
        );
    }

    #[test]
    fn parse_appends_empty_parameter_list() {
        let key = IdentityKey::parse("TestMod.ModDialog.Show").unwrap();
        assert_eq!(key.as_str(), "TestMod.ModDialog.Show()");
        assert!(IdentityKey::parse("Show").is_err());
    }

    #[test]
    fn parse_normalizes_parameter_spacing() {
        let method = MethodDef::new("Bar", TypeRef::named(VOID_TYPE))
            .with_param("a", TypeRef::named("System.Int32"))
            .with_param("b", TypeRef::named("System.String"));
        let expected = IdentityKey::for_def("Foo", &method).unwrap();
        assert_eq!(IdentityKey::parse("Foo.Bar(System.Int32,System.String)").unwrap(), expected);
        assert_eq!(IdentityKey::parse(" Foo.Bar( System.Int32 ,  System.String ) ").unwrap(), expected);

        let generic = IdentityKey::parse("Foo.Baz(List`1<System.Int32, System.String>, System.Int32)");
        assert_eq!(generic.unwrap().as_str(), "Foo.Baz(List`1<System.Int32,System.String>, System.Int32)");
        assert_eq!(IdentityKey::parse("Foo.Bar()").unwrap().as_str(), "Foo.Bar()");
    }
}
