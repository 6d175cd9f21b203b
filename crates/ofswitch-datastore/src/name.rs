//! Object naming: `namespace:name` scoping, serialization escaping,
//! and the ref-field grammar (`name`, `+name`, `~name`).

use serde::{Deserialize, Serialize};

use crate::error::{DatastoreError, DatastoreResult};

/// Longest accepted object name, namespace included.
pub const MAX_NAME_LEN: usize = 96;

/// Splits a full name into its namespace and local parts. A name
/// without a colon lives in the default (empty) namespace.
pub fn split_fullname(fullname: &str) -> (&str, &str) {
    match fullname.split_once(':') {
        Some((ns, name)) => (ns, name),
        None => ("", fullname),
    }
}

/// Validates a name for create: length bounds and no embedded colon in
/// the local part.
pub fn validate_name(fullname: &str) -> DatastoreResult<()> {
    if fullname.is_empty() {
        return Err(DatastoreError::new(
            crate::error::ErrorKind::TooShort,
            "name is empty.",
        ));
    }
    if fullname.len() > MAX_NAME_LEN {
        return Err(DatastoreError::new(
            crate::error::ErrorKind::TooLong,
            format!("name is longer than {MAX_NAME_LEN}."),
        ));
    }
    let (_, local) = split_fullname(fullname);
    if local.is_empty() {
        return Err(DatastoreError::new(
            crate::error::ErrorKind::TooShort,
            "name part is empty.",
        ));
    }
    if local.contains(':') {
        return Err(DatastoreError::invalid_args(format!(
            "name = :{fullname}: has an extra namespace separator."
        )));
    }
    Ok(())
}

/// Escapes a name for command serialization: names containing
/// whitespace or quotes are wrapped in double quotes with inner quotes
/// doubled.
pub fn escape_name(name: &str) -> String {
    if name.chars().any(|c| c.is_whitespace() || c == '"') {
        let mut out = String::with_capacity(name.len() + 2);
        out.push('"');
        for c in name.chars() {
            if c == '"' {
                out.push('"');
            }
            out.push(c);
        }
        out.push('"');
        out
    } else {
        name.to_string()
    }
}

/// One ref-field edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefOp {
    /// Replace the current value.
    Set(String),
    /// Add to the list.
    Add(String),
    /// Remove from the list.
    Remove(String),
}

impl RefOp {
    /// Parses the `name` / `+name` / `~name` forms.
    pub fn parse(token: &str) -> DatastoreResult<RefOp> {
        let (op, rest) = match token.as_bytes().first() {
            Some(b'+') => (RefOp::Add as fn(String) -> RefOp, &token[1..]),
            Some(b'~') => (RefOp::Remove as fn(String) -> RefOp, &token[1..]),
            Some(_) => (RefOp::Set as fn(String) -> RefOp, token),
            None => {
                return Err(DatastoreError::invalid_args("empty ref value."));
            }
        };
        if rest.is_empty() {
            return Err(DatastoreError::invalid_args(format!(
                "ref value {token} has no name."
            )));
        }
        Ok(op(rest.to_string()))
    }

    /// The referenced name, whatever the operation.
    pub fn name(&self) -> &str {
        match self {
            RefOp::Set(n) | RefOp::Add(n) | RefOp::Remove(n) => n,
        }
    }

    /// Applies this edit to a list-valued ref field.
    pub fn apply_to_list(&self, list: &mut Vec<String>) {
        match self {
            RefOp::Set(n) => {
                list.clear();
                list.push(n.clone());
            }
            RefOp::Add(n) => {
                if !list.iter().any(|x| x == n) {
                    list.push(n.clone());
                }
            }
            RefOp::Remove(n) => list.retain(|x| x != n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split() {
        assert_eq!(split_fullname("ns1:br0"), ("ns1", "br0"));
        assert_eq!(split_fullname("br0"), ("", "br0"));
    }

    #[test]
    fn test_validate_bounds() {
        assert!(validate_name("").is_err());
        assert!(validate_name("ns:").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_name("ns:p1").is_ok());
        assert!(validate_name("p1").is_ok());
        assert!(validate_name("a:b:c").is_err());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_name("plain"), "plain");
        assert_eq!(escape_name("has space"), "\"has space\"");
        assert_eq!(escape_name("say\"hi\""), "\"say\"\"hi\"\"\"");
    }

    #[test]
    fn test_refop_parse() {
        assert_eq!(RefOp::parse("q1").unwrap(), RefOp::Set("q1".into()));
        assert_eq!(RefOp::parse("+q1").unwrap(), RefOp::Add("q1".into()));
        assert_eq!(RefOp::parse("~q1").unwrap(), RefOp::Remove("q1".into()));
        assert!(RefOp::parse("+").is_err());
        assert!(RefOp::parse("").is_err());
    }

    #[test]
    fn test_refop_list_semantics() {
        let mut list = vec!["a".to_string(), "b".to_string()];
        RefOp::Add("b".into()).apply_to_list(&mut list);
        assert_eq!(list.len(), 2);
        RefOp::Add("c".into()).apply_to_list(&mut list);
        assert_eq!(list, vec!["a", "b", "c"]);
        RefOp::Remove("a".into()).apply_to_list(&mut list);
        assert_eq!(list, vec!["b", "c"]);
        RefOp::Set("z".into()).apply_to_list(&mut list);
        assert_eq!(list, vec!["z"]);
    }
}
