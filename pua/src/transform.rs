use std::sync::{Arc, Mutex};

use mlua::{Lua, Value as LuaValue};
use model::records::Record;
use tokio_util::sync::CancellationToken;

use crate::pool::LuaPool;
use crate::userdata::LuaRecord;

/// One transformed record, ready for per-destination staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedEvent {
    pub destination: String,
    pub payload: String,
}

/// The default transform: non-relation records serialize to JSON,
/// relation records are dropped from the output stream.
pub fn default_payload(record: &Record) -> Option<String> {
    let json = match record {
        Record::Relation(_) => return None,
        Record::Insert(r) => serde_json::json!({
            "kind": "insert",
            "source": r.source_table,
            "destination": r.destination_table,
            "checkpoint_id": r.checkpoint_id,
            "commit_time": r.commit_time.to_rfc3339(),
            "data": r.items.to_json(),
        }),
        Record::Update(r) => serde_json::json!({
            "kind": "update",
            "source": r.source_table,
            "destination": r.destination_table,
            "checkpoint_id": r.checkpoint_id,
            "commit_time": r.commit_time.to_rfc3339(),
            "data": r.new_items.to_json(),
            "old": r.old_items.to_json(),
            "unchanged_toast_columns": r.unchanged_toast_columns,
        }),
        Record::Delete(r) => serde_json::json!({
            "kind": "delete",
            "source": r.source_table,
            "destination": r.destination_table,
            "checkpoint_id": r.checkpoint_id,
            "commit_time": r.commit_time.to_rfc3339(),
            "data": r.items.to_json(),
        }),
    };
    Some(json.to_string())
}

fn script_payload(lua: &Lua, record: &Record) -> anyhow::Result<Option<String>> {
    let on_record: Result<mlua::Function, _> = lua.globals().get("onRecord");
    let Ok(on_record) = on_record else {
        return Ok(default_payload(record));
    };

    let result: LuaValue = on_record
        .call(LuaRecord(record.clone()))
        .map_err(|e| anyhow::anyhow!("onRecord failed: {e}"))?;

    let out = match result {
        LuaValue::Nil => None,
        LuaValue::String(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        LuaValue::UserData(ud) if ud.is::<LuaRecord>() => {
            let rec = ud.borrow::<LuaRecord>().map_err(anyhow::Error::from)?;
            default_payload(&rec.0)
        }
        other => {
            let json = serde_json::to_string(&other)
                .map_err(|e| anyhow::anyhow!("unserializable transform result: {e}"))?;
            Some(json)
        }
    };
    Ok(out)
}

type TransformResult = anyhow::Result<Option<TransformedEvent>>;

/// Routes records through the pooled interpreters and hands back the
/// transformed payloads in submission order.
pub struct RecordTransformer {
    pool: LuaPool<TransformResult>,
    collected: Arc<Mutex<Vec<TransformedEvent>>>,
    first_error: Arc<Mutex<Option<anyhow::Error>>>,
}

impl RecordTransformer {
    /// `script` is the script source fetched from the catalog, or None for
    /// the default transform.
    pub fn new(script: Option<String>, token: CancellationToken) -> anyhow::Result<Self> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let first_error = Arc::new(Mutex::new(None));

        let merge_collected = collected.clone();
        let merge_error = first_error.clone();
        let script = script.map(Arc::new);
        let state_token = token.clone();
        let pool = LuaPool::new(
            move || crate::new_lua_state(script.as_deref().map(String::as_str), state_token.clone()),
            move |result: TransformResult| match result {
                Ok(Some(event)) => merge_collected.lock().unwrap().push(event),
                Ok(None) => {}
                Err(err) => {
                    let mut slot = merge_error.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            },
        )?;

        Ok(Self {
            pool,
            collected,
            first_error,
        })
    }

    pub fn submit(&mut self, record: Record) {
        self.pool.run(move |lua| {
            let destination = record.destination_table().map(str::to_string);
            let payload = script_payload(lua, &record)?;
            Ok(match (destination, payload) {
                (Some(destination), Some(payload)) => Some(TransformedEvent {
                    destination,
                    payload,
                }),
                _ => None,
            })
        });
    }

    /// Waits for every submission to drain and returns the events in
    /// submission order, or the first script error.
    pub async fn finish(self, token: &CancellationToken) -> anyhow::Result<Vec<TransformedEvent>> {
        self.pool.wait(token).await?;
        if let Some(err) = self.first_error.lock().unwrap().take() {
            return Err(err);
        }
        let mut collected = self.collected.lock().unwrap();
        Ok(std::mem::take(&mut *collected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::records::{InsertRecord, RecordItems, RelationRecord};
    use pt::flow::RelationMessage;
    use value::Value;

    fn insert(id: i64) -> Record {
        let items: RecordItems = [
            ("id".to_string(), Value::big_int(id)),
            ("v".to_string(), Value::text("a")),
        ]
        .into_iter()
        .collect();
        Record::Insert(InsertRecord {
            checkpoint_id: id,
            commit_time: Utc::now(),
            source_table: "public.t".to_string(),
            destination_table: "dw.t".to_string(),
            items,
        })
    }

    fn relation() -> Record {
        Record::Relation(RelationRecord {
            checkpoint_id: 1,
            commit_time: Utc::now(),
            relation: RelationMessage {
                relation_id: 1,
                relation_name: "public.t".to_string(),
                columns: Vec::new(),
            },
        })
    }

    #[tokio::test]
    async fn default_transform_serializes_and_drops_relations() {
        let token = CancellationToken::new();
        let mut transformer = RecordTransformer::new(None, token.clone()).unwrap();
        transformer.submit(insert(1));
        transformer.submit(relation());
        transformer.submit(insert(2));
        let events = transformer.finish(&token).await.unwrap();

        assert_eq!(events.len(), 2);
        let payload: serde_json::Value = serde_json::from_str(&events[0].payload).unwrap();
        assert_eq!(payload["kind"], "insert");
        assert_eq!(payload["data"]["id"], 1);
        assert_eq!(events[1].destination, "dw.t");
    }

    #[tokio::test]
    async fn identity_script_matches_default_transform() {
        let token = CancellationToken::new();
        let record = insert(7);

        let mut scripted = RecordTransformer::new(
            Some("function onRecord(r) return r end".to_string()),
            token.clone(),
        )
        .unwrap();
        scripted.submit(record.clone());
        let scripted_events = scripted.finish(&token).await.unwrap();

        assert_eq!(
            scripted_events[0].payload,
            default_payload(&record).unwrap()
        );
    }

    #[tokio::test]
    async fn scripts_can_reshape_records() {
        let token = CancellationToken::new();
        let mut transformer = RecordTransformer::new(
            Some("function onRecord(r) return json.encode({id = r.row.id}) end".to_string()),
            token.clone(),
        )
        .unwrap();
        transformer.submit(insert(42));
        let events = transformer.finish(&token).await.unwrap();
        assert_eq!(events[0].payload, "{\"id\":42}");
    }

    #[tokio::test]
    async fn script_errors_surface_from_finish() {
        let token = CancellationToken::new();
        let mut transformer = RecordTransformer::new(
            Some("function onRecord(r) error('boom') end".to_string()),
            token.clone(),
        )
        .unwrap();
        transformer.submit(insert(1));
        let err = transformer.finish(&token).await.unwrap_err();
        assert!(err.to_string().contains("onRecord failed"), "got: {err:#}");
    }

    #[tokio::test]
    async fn outputs_preserve_submission_order() {
        let token = CancellationToken::new();
        let mut transformer = RecordTransformer::new(None, token.clone()).unwrap();
        for i in 0..50 {
            transformer.submit(insert(i));
        }
        let events = transformer.finish(&token).await.unwrap();
        let ids: Vec<i64> = events
            .iter()
            .map(|e| {
                let v: serde_json::Value = serde_json::from_str(&e.payload).unwrap();
                v["data"]["id"].as_i64().unwrap()
            })
            .collect();
        assert_eq!(ids, (0..50).collect::<Vec<i64>>());
    }
}
