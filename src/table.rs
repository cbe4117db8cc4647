//! Schema-qualified table references.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::Result;
use crate::error::Error;

/// Schema used when a table name carries no qualifier.
pub const DEFAULT_SCHEMA: &str = "main";

/// A table identified by schema and name.
///
/// Equality, hashing and ordering ignore ASCII case, so `Orders`, `orders` and
/// `[main].[ORDERS]` all name the same table. Ordering sorts by schema first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualifiedTable {
   schema: String,
   name: String,
}

impl QualifiedTable {
   pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
      Self {
         schema: schema.into(),
         name: name.into(),
      }
   }

   /// A table in the default schema.
   pub fn unqualified(name: impl Into<String>) -> Self {
      Self::new(DEFAULT_SCHEMA, name)
   }

   /// Parses `name`, `schema.name` or the bracketed `[schema].[name]` form.
   pub fn parse(input: &str) -> Result<Self> {
      let parts = split_parts(input.trim())?;
      match parts.as_slice() {
         [name] => Ok(Self::unqualified(name.clone())),
         [schema, name] => Ok(Self::new(schema.clone(), name.clone())),
         _ => Err(Error::InvalidIdentifier(format!(
            "'{input}' has more than two name parts"
         ))),
      }
   }

   pub fn schema(&self) -> &str {
      &self.schema
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   /// Canonical `[schema].[name]` form, also stored in the ledger.
   pub fn full_name(&self) -> String {
      format!("[{}].[{}]", self.schema, self.name)
   }

   /// Stable object id used as the ledger row key.
   ///
   /// Derived from the lower-cased full name and kept within the positive
   /// range of SQLite's 64-bit rowid.
   pub fn object_id(&self) -> i64 {
      (xxh3_64(self.full_name().to_ascii_lowercase().as_bytes()) >> 1) as i64
   }

   fn key(&self) -> (String, String) {
      (
         self.schema.to_ascii_lowercase(),
         self.name.to_ascii_lowercase(),
      )
   }
}

fn split_parts(input: &str) -> Result<Vec<String>> {
   let invalid = |reason: &str| Error::InvalidIdentifier(format!("'{input}' {reason}"));

   let mut parts = Vec::new();
   let mut rest = input;
   loop {
      let (part, remainder) = if let Some(bracketed) = rest.strip_prefix('[') {
         let end = bracketed
            .find(']')
            .ok_or_else(|| invalid("has an unclosed bracket"))?;
         (&bracketed[..end], &bracketed[end + 1..])
      } else {
         match rest.find('.') {
            Some(dot) => (&rest[..dot], &rest[dot..]),
            None => (rest, ""),
         }
      };

      if part.trim().is_empty() {
         return Err(invalid("has an empty name part"));
      }
      if part.contains(['[', ']']) {
         return Err(invalid("has a misplaced bracket"));
      }
      parts.push(part.to_string());

      if remainder.is_empty() {
         return Ok(parts);
      }
      rest = remainder
         .strip_prefix('.')
         .ok_or_else(|| invalid("has text after a closing bracket"))?;
   }
}

impl PartialEq for QualifiedTable {
   fn eq(&self, other: &Self) -> bool {
      self.schema.eq_ignore_ascii_case(&other.schema) && self.name.eq_ignore_ascii_case(&other.name)
   }
}

impl Eq for QualifiedTable {}

impl Hash for QualifiedTable {
   fn hash<H: Hasher>(&self, state: &mut H) {
      self.key().hash(state);
   }
}

impl PartialOrd for QualifiedTable {
   fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
      Some(self.cmp(other))
   }
}

impl Ord for QualifiedTable {
   fn cmp(&self, other: &Self) -> Ordering {
      self.key().cmp(&other.key())
   }
}

impl fmt::Display for QualifiedTable {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "[{}].[{}]", self.schema, self.name)
   }
}

impl FromStr for QualifiedTable {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      Self::parse(s)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::collections::{BTreeSet, HashSet};

   #[test]
   fn test_parse_forms() {
      let plain = QualifiedTable::parse("Orders").unwrap();
      assert_eq!(plain.schema(), "main");
      assert_eq!(plain.name(), "Orders");

      let dotted = QualifiedTable::parse("aux.Orders").unwrap();
      assert_eq!(dotted.schema(), "aux");

      let bracketed = QualifiedTable::parse("[main].[Order Lines]").unwrap();
      assert_eq!(bracketed.name(), "Order Lines");
      assert_eq!(bracketed.full_name(), "[main].[Order Lines]");
   }

   #[test]
   fn test_parse_rejects_malformed_names() {
      for input in ["", "  ", "a.b.c", "[main", "main.", "[a]x", "a]b"] {
         assert!(
            QualifiedTable::parse(input).is_err(),
            "'{input}' should be rejected"
         );
      }
   }

   #[test]
   fn test_equality_ignores_case() {
      let a = QualifiedTable::new("main", "Orders");
      let b = QualifiedTable::new("MAIN", "orders");
      assert_eq!(a, b);
      assert_eq!(a.object_id(), b.object_id());

      let set: HashSet<_> = [a, b].into_iter().collect();
      assert_eq!(set.len(), 1);
   }

   #[test]
   fn test_ordering_is_schema_then_name() {
      let set: BTreeSet<_> = [
         QualifiedTable::new("main", "orders"),
         QualifiedTable::new("aux", "zeta"),
         QualifiedTable::new("main", "Customers"),
         QualifiedTable::new("MAIN", "ORDERS"),
      ]
      .into_iter()
      .collect();

      let names: Vec<String> = set.iter().map(|t| t.to_string()).collect();
      assert_eq!(
         names,
         vec!["[aux].[zeta]", "[main].[Customers]", "[main].[orders]"]
      );
   }

   #[test]
   fn test_object_id_is_positive_and_distinct() {
      let orders = QualifiedTable::unqualified("Orders").object_id();
      let customers = QualifiedTable::unqualified("Customers").object_id();
      assert!(orders >= 0);
      assert!(customers >= 0);
      assert_ne!(orders, customers);
   }
}
