//! The change ledger: one row per watched table, stamped by triggers.
//!
//! Every watched table gets a trigger group of three `AFTER ... FOR EACH ROW`
//! triggers (`<group>_ins`, `<group>_upd`, `<group>_del`). Each makes sure the
//! table's ledger row exists and stamps the matching date column with the
//! current UTC time, kept strictly increasing per column. Rows are keyed by
//! [`QualifiedTable::object_id`].

use std::collections::HashMap;

use sqlx::sqlite::SqliteConnection;
use time::OffsetDateTime;

use crate::Result;
use crate::change::{ChangeKind, ChangeKinds};
use crate::config::WatchOptions;
use crate::table::QualifiedTable;

/// Column positions in the ledger table. The push strategy uses the date
/// column positions to tell which stamp moved.
pub const INSERT_DATE_COLUMN: usize = 2;
pub const UPDATE_DATE_COLUMN: usize = 3;
pub const DELETE_DATE_COLUMN: usize = 4;

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// New value for a date column: the current time, or one millisecond past the
/// previous stamp when the clock has not moved beyond it. Every write changes
/// the stamp, so no write is hidden behind an equal or earlier value.
fn next_stamp(column: &str) -> String {
   format!(
      "CASE WHEN {column} >= {NOW} THEN strftime('%Y-%m-%dT%H:%M:%fZ', {column}, '+0.001 seconds') ELSE {NOW} END"
   )
}

/// Quotes an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
   format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
   format!("'{}'", value.replace('\'', "''"))
}

fn qualified(schema: &str, name: &str) -> String {
   format!("{}.{}", quote_ident(schema), quote_ident(name))
}

pub fn date_column(kind: ChangeKind) -> &'static str {
   match kind {
      ChangeKind::Insert => "LastInsertDate",
      ChangeKind::Update => "LastUpdateDate",
      ChangeKind::Delete => "LastDeleteDate",
   }
}

pub fn create_ledger_sql(options: &WatchOptions) -> String {
   format!(
      "CREATE TABLE IF NOT EXISTS {} (
   ObjectId INTEGER PRIMARY KEY,
   ObjectName TEXT NOT NULL,
   LastInsertDate TEXT NULL,
   LastUpdateDate TEXT NULL,
   LastDeleteDate TEXT NULL
)",
      qualified(&options.schema, &options.ledger_table_name())
   )
}

pub fn drop_ledger_sql(options: &WatchOptions) -> String {
   format!(
      "DROP TABLE IF EXISTS {}",
      qualified(&options.schema, &options.ledger_table_name())
   )
}

/// One trigger of a table's trigger group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMember {
   pub name: String,
   pub kind: ChangeKind,
}

/// Trigger names of `table`'s group, in insert, update, delete order.
pub fn trigger_members(options: &WatchOptions, table: &QualifiedTable) -> Vec<TriggerMember> {
   let group = options.trigger_group_name(table);
   ChangeKind::ALL
      .into_iter()
      .map(|kind| {
         let suffix = match kind {
            ChangeKind::Insert => "ins",
            ChangeKind::Update => "upd",
            ChangeKind::Delete => "del",
         };
         TriggerMember {
            name: format!("{group}_{suffix}"),
            kind,
         }
      })
      .collect()
}

/// DDL for one trigger. The trigger body names tables unqualified, as SQLite
/// requires; they resolve to the trigger's own schema.
pub fn create_trigger_sql(
   options: &WatchOptions,
   table: &QualifiedTable,
   member: &TriggerMember,
) -> String {
   let event = match member.kind {
      ChangeKind::Insert => "INSERT",
      ChangeKind::Update => "UPDATE",
      ChangeKind::Delete => "DELETE",
   };
   let ledger = quote_ident(&options.ledger_table_name());
   let object_id = table.object_id();

   format!(
      "CREATE TRIGGER IF NOT EXISTS {trigger}
AFTER {event} ON {target} FOR EACH ROW
BEGIN
   INSERT OR IGNORE INTO {ledger} (ObjectId, ObjectName) VALUES ({object_id}, {object_name});
   UPDATE {ledger} SET {column} = {stamp} WHERE ObjectId = {object_id};
END",
      trigger = qualified(&options.schema, &member.name),
      target = quote_ident(table.name()),
      object_name = quote_literal(&table.full_name()),
      column = date_column(member.kind),
      stamp = next_stamp(date_column(member.kind)),
   )
}

pub fn drop_trigger_sql(options: &WatchOptions, member: &TriggerMember) -> String {
   format!(
      "DROP TRIGGER IF EXISTS {}",
      qualified(&options.schema, &member.name)
   )
}

/// Which of `members` already exist, by lower-cased name.
pub async fn existing_trigger_members(
   conn: &mut SqliteConnection,
   options: &WatchOptions,
   members: &[TriggerMember],
) -> Result<Vec<String>> {
   if members.is_empty() {
      return Ok(Vec::new());
   }

   let placeholders = vec!["lower(?)"; members.len()].join(", ");
   let sql = format!(
      "SELECT lower(name) FROM {}.sqlite_master WHERE type = 'trigger' AND lower(name) IN ({placeholders})",
      quote_ident(&options.schema)
   );

   let mut query = sqlx::query_as::<_, (String,)>(&sql);
   for member in members {
      query = query.bind(member.name.as_str());
   }

   let rows = query.fetch_all(&mut *conn).await?;
   Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Last-change stamps of one ledger row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStamps {
   pub inserted: Option<OffsetDateTime>,
   pub updated: Option<OffsetDateTime>,
   pub deleted: Option<OffsetDateTime>,
}

impl LedgerStamps {
   pub fn get(&self, kind: ChangeKind) -> Option<OffsetDateTime> {
      match kind {
         ChangeKind::Insert => self.inserted,
         ChangeKind::Update => self.updated,
         ChangeKind::Delete => self.deleted,
      }
   }

   /// Kinds in `mask` whose stamp is set and moved past `previous`.
   ///
   /// Without a previous reading every set stamp counts as new, so rows
   /// written before the session started are reported on its first poll.
   pub fn changed_since(&self, previous: Option<&LedgerStamps>, mask: ChangeKinds) -> ChangeKinds {
      mask
         .iter()
         .filter(|&kind| match (self.get(kind), previous.and_then(|p| p.get(kind))) {
            (Some(current), Some(before)) => current > before,
            (Some(_), None) => true,
            (None, _) => false,
         })
         .collect()
   }
}

/// Reads the ledger rows for `object_ids`, keyed by object id. Tables without
/// a row (never changed) are absent from the result.
pub async fn read_ledger(
   conn: &mut SqliteConnection,
   options: &WatchOptions,
   object_ids: &[i64],
) -> Result<HashMap<i64, LedgerStamps>> {
   if object_ids.is_empty() {
      return Ok(HashMap::new());
   }

   let placeholders = vec!["?"; object_ids.len()].join(", ");
   let sql = format!(
      "SELECT ObjectId, LastInsertDate, LastUpdateDate, LastDeleteDate FROM {} WHERE ObjectId IN ({placeholders})",
      qualified(&options.schema, &options.ledger_table_name())
   );

   let mut query = sqlx::query_as::<
      _,
      (
         i64,
         Option<OffsetDateTime>,
         Option<OffsetDateTime>,
         Option<OffsetDateTime>,
      ),
   >(&sql);
   for id in object_ids {
      query = query.bind(*id);
   }

   let rows = query.fetch_all(&mut *conn).await?;
   Ok(rows
      .into_iter()
      .map(|(id, inserted, updated, deleted)| {
         (
            id,
            LedgerStamps {
               inserted,
               updated,
               deleted,
            },
         )
      })
      .collect())
}
