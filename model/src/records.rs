use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use pt::flow::RelationMessage;
use value::Value;

/// Column name to typed value mapping, ordered by insertion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordItems {
    entries: Vec<(String, Value)>,
}

impl RecordItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        if let Some(entry) = self.entries.iter_mut().find(|(name, _)| *name == column) {
            entry.1 = value;
        } else {
            self.entries.push((column, value));
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        for (name, v) in &self.entries {
            object.insert(name.clone(), v.to_serde_json_value());
        }
        serde_json::Value::Object(object)
    }
}

impl FromIterator<(String, Value)> for RecordItems {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut items = Self::new();
        for (name, v) in iter {
            items.insert(name, v);
        }
        items
    }
}

/// Raw-table record type discriminant: 0 insert, 1 update, 2 delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum RecordType {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertRecord {
    pub checkpoint_id: i64,
    pub commit_time: DateTime<Utc>,
    pub source_table: String,
    pub destination_table: String,
    pub items: RecordItems,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
    pub checkpoint_id: i64,
    pub commit_time: DateTime<Utc>,
    pub source_table: String,
    pub destination_table: String,
    pub old_items: RecordItems,
    pub new_items: RecordItems,
    /// Toasted columns the source did not re-send; the sink must preserve
    /// the previously normalized values for these.
    pub unchanged_toast_columns: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRecord {
    pub checkpoint_id: i64,
    pub commit_time: DateTime<Utc>,
    pub source_table: String,
    pub destination_table: String,
    pub items: RecordItems,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationRecord {
    pub checkpoint_id: i64,
    pub commit_time: DateTime<Utc>,
    pub relation: RelationMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Insert(InsertRecord),
    Update(UpdateRecord),
    Delete(DeleteRecord),
    Relation(RelationRecord),
}

impl Record {
    pub fn checkpoint_id(&self) -> i64 {
        match self {
            Record::Insert(r) => r.checkpoint_id,
            Record::Update(r) => r.checkpoint_id,
            Record::Delete(r) => r.checkpoint_id,
            Record::Relation(r) => r.checkpoint_id,
        }
    }

    pub fn commit_time(&self) -> DateTime<Utc> {
        match self {
            Record::Insert(r) => r.commit_time,
            Record::Update(r) => r.commit_time,
            Record::Delete(r) => r.commit_time,
            Record::Relation(r) => r.commit_time,
        }
    }

    pub fn destination_table(&self) -> Option<&str> {
        match self {
            Record::Insert(r) => Some(&r.destination_table),
            Record::Update(r) => Some(&r.destination_table),
            Record::Delete(r) => Some(&r.destination_table),
            Record::Relation(_) => None,
        }
    }

    pub fn record_type(&self) -> Option<RecordType> {
        match self {
            Record::Insert(_) => Some(RecordType::Insert),
            Record::Update(_) => Some(RecordType::Update),
            Record::Delete(_) => Some(RecordType::Delete),
            Record::Relation(_) => None,
        }
    }

    /// Post-image of the row: the payload the raw table stores in
    /// `_peerdb_data`.
    pub fn items(&self) -> Option<&RecordItems> {
        match self {
            Record::Insert(r) => Some(&r.items),
            Record::Update(r) => Some(&r.new_items),
            Record::Delete(r) => Some(&r.items),
            Record::Relation(_) => None,
        }
    }

    /// Pre-image for updates and deletes, stored in `_peerdb_match_data`.
    pub fn match_items(&self) -> Option<&RecordItems> {
        match self {
            Record::Update(r) => Some(&r.old_items),
            Record::Delete(r) => Some(&r.items),
            _ => None,
        }
    }

    pub fn unchanged_toast_columns(&self) -> Option<&BTreeSet<String>> {
        match self {
            Record::Update(r) => Some(&r.unchanged_toast_columns),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_items_preserve_insertion_order() {
        let mut items = RecordItems::new();
        items.insert("id", Value::integer(1));
        items.insert("v", Value::text("a"));
        items.insert("id", Value::integer(2));
        let names: Vec<&str> = items.column_names().collect();
        assert_eq!(names, vec!["id", "v"]);
        assert_eq!(items.get("id"), Some(&Value::integer(2)));
    }

    #[test]
    fn items_serialize_to_json_object() {
        let items: RecordItems = [
            ("id".to_string(), Value::integer(1)),
            ("v".to_string(), Value::text("a")),
        ]
        .into_iter()
        .collect();
        assert_eq!(items.to_json(), serde_json::json!({"id": 1, "v": "a"}));
    }

    #[test]
    fn update_record_exposes_pre_and_post_images() {
        let old: RecordItems = [("id".to_string(), Value::integer(1))].into_iter().collect();
        let new: RecordItems = [("id".to_string(), Value::integer(1))].into_iter().collect();
        let rec = Record::Update(UpdateRecord {
            checkpoint_id: 7,
            commit_time: Utc::now(),
            source_table: "public.t".into(),
            destination_table: "dw.t".into(),
            old_items: old.clone(),
            new_items: new.clone(),
            unchanged_toast_columns: BTreeSet::new(),
        });
        assert_eq!(rec.items(), Some(&new));
        assert_eq!(rec.match_items(), Some(&old));
        assert_eq!(rec.record_type(), Some(RecordType::Update));
    }
}
