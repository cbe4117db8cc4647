use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// A single kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
   Insert,
   Update,
   Delete,
}

impl ChangeKind {
   pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

   pub fn bit(self) -> u8 {
      match self {
         ChangeKind::Insert => 1,
         ChangeKind::Update => 2,
         ChangeKind::Delete => 4,
      }
   }
}

impl fmt::Display for ChangeKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         ChangeKind::Insert => write!(f, "Insert"),
         ChangeKind::Update => write!(f, "Update"),
         ChangeKind::Delete => write!(f, "Delete"),
      }
   }
}

/// Bitmask of change kinds, used both as the monitored mask of a session and
/// as the set of kinds reported for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeKinds(u8);

impl ChangeKinds {
   pub const NONE: ChangeKinds = ChangeKinds(0);
   pub const INSERT: ChangeKinds = ChangeKinds(1);
   pub const UPDATE: ChangeKinds = ChangeKinds(2);
   pub const DELETE: ChangeKinds = ChangeKinds(4);
   pub const ALL: ChangeKinds = ChangeKinds(7);

   /// Builds a mask from raw bits, discarding bits that name no kind.
   pub fn from_bits_truncate(bits: u8) -> Self {
      Self(bits & Self::ALL.0)
   }

   pub fn bits(self) -> u8 {
      self.0
   }

   pub fn is_empty(self) -> bool {
      self.0 == 0
   }

   pub fn contains(self, kind: ChangeKind) -> bool {
      self.0 & kind.bit() != 0
   }

   pub fn insert(&mut self, kind: ChangeKind) {
      self.0 |= kind.bit();
   }

   /// Set kinds in Insert, Update, Delete order.
   pub fn iter(self) -> impl Iterator<Item = ChangeKind> {
      ChangeKind::ALL.into_iter().filter(move |k| self.contains(*k))
   }
}

impl From<ChangeKind> for ChangeKinds {
   fn from(kind: ChangeKind) -> Self {
      Self(kind.bit())
   }
}

impl FromIterator<ChangeKind> for ChangeKinds {
   fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
      let mut kinds = Self::NONE;
      for kind in iter {
         kinds.insert(kind);
      }
      kinds
   }
}

impl BitOr for ChangeKinds {
   type Output = Self;

   fn bitor(self, rhs: Self) -> Self {
      Self(self.0 | rhs.0)
   }
}

impl BitOr<ChangeKind> for ChangeKinds {
   type Output = Self;

   fn bitor(self, rhs: ChangeKind) -> Self {
      Self(self.0 | rhs.bit())
   }
}

impl BitOrAssign for ChangeKinds {
   fn bitor_assign(&mut self, rhs: Self) {
      self.0 |= rhs.0;
   }
}

impl fmt::Display for ChangeKinds {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      if self.is_empty() {
         return write!(f, "None");
      }
      for (i, kind) in self.iter().enumerate() {
         if i > 0 {
            write!(f, "|")?;
         }
         write!(f, "{kind}")?;
      }
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_mask_operations() {
      let mask = ChangeKinds::INSERT | ChangeKinds::UPDATE;
      assert!(mask.contains(ChangeKind::Insert));
      assert!(mask.contains(ChangeKind::Update));
      assert!(!mask.contains(ChangeKind::Delete));
      assert_eq!(mask.bits(), 3);
      assert_eq!(ChangeKinds::ALL.iter().count(), 3);
   }

   #[test]
   fn test_display() {
      assert_eq!((ChangeKinds::INSERT | ChangeKinds::UPDATE).to_string(), "Insert|Update");
      assert_eq!(ChangeKinds::DELETE.to_string(), "Delete");
      assert_eq!(ChangeKinds::NONE.to_string(), "None");
   }

   #[test]
   fn test_unknown_bits_are_dropped() {
      assert_eq!(ChangeKinds::from_bits_truncate(0xff), ChangeKinds::ALL);
      assert!(ChangeKinds::from_bits_truncate(0x08).is_empty());
   }

   #[test]
   fn test_serde_as_bits() {
      let json = serde_json::to_string(&(ChangeKinds::INSERT | ChangeKinds::DELETE)).unwrap();
      assert_eq!(json, "5");
      let kinds: ChangeKinds = serde_json::from_str("2").unwrap();
      assert_eq!(kinds, ChangeKinds::UPDATE);
   }
}
